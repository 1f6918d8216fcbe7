use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hipgpu::diagnostics::printf::{render, PrintfDescriptors};
use hipgpu::layout;
use hipgpu::KernelTable;

fn reflection_stream(kernels: usize) -> String {
    let mut text = String::new();
    for k in 0..kernels {
        text.push_str(&format!("kernel_decl,kernel{k},printf,{}\n", k % 2));
        for a in 0..4 {
            text.push_str(&format!(
                "kernel,kernel{k},arg,buf{a},argOrdinal,{a},argKind,buffer,binding,{a}\n"
            ));
        }
        for a in 0..3 {
            text.push_str(&format!(
                "kernel,kernel{k},arg,n{a},argOrdinal,{},argKind,pod_ubo,binding,4,offset,{},argSize,4\n",
                a + 4,
                a * 4
            ));
        }
    }
    text.push_str("printf,id,0,format,25752025660a,args,4;4\n");
    text
}

fn benchmark_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("reflection_parse");

    for kernels in [8, 64, 512] {
        let text = reflection_stream(kernels);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(kernels), &text, |b, text| {
            b.iter(|| black_box(KernelTable::parse(text)));
        });
    }

    group.finish();
}

fn benchmark_plan(c: &mut Criterion) {
    let table = KernelTable::parse(&reflection_stream(64));

    c.bench_function("layout_plan_all", |b| {
        b.iter(|| {
            for (_, kernel) in table.iter() {
                black_box(layout::plan(kernel));
            }
        });
    });
}

fn benchmark_printf_render(c: &mut Criterion) {
    let descriptors = PrintfDescriptors::parse("printf,id,0,format,25752025660a,args,4;4\n");
    let records = 1024u32;
    let mut words = vec![records * 3];
    for i in 0..records {
        words.extend_from_slice(&[0, i, (i as f32 * 0.5).to_bits()]);
    }
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

    let mut group = c.benchmark_group("printf_render");
    group.throughput(Throughput::Elements(u64::from(records)));
    group.bench_function("u32_f32_records", |b| {
        b.iter(|| black_box(render(&bytes, &descriptors).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, benchmark_parse, benchmark_plan, benchmark_printf_render);
criterion_main!(benches);

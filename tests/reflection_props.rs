//! Property tests over generated reflection streams.

use std::collections::HashSet;

use hipgpu::diagnostics::printf::{render, PrintfDescriptors};
use hipgpu::layout::{self, padded_uniform_size, LayoutPlan};
use hipgpu::KernelTable;
use proptest::prelude::*;

/// `(offset, size)` pairs packed into uniform binding 0.
fn pod_stream(fields: &[(u32, u32)]) -> String {
    let mut text = String::from("kernel_decl,k,printf,0\n");
    for (ordinal, (offset, size)) in fields.iter().enumerate() {
        text.push_str(&format!(
            "kernel,k,arg,p{ordinal},argOrdinal,{ordinal},argKind,pod_ubo,binding,0,offset,{offset},argSize,{size}\n"
        ));
    }
    text
}

proptest! {
    #[test]
    fn uniform_size_is_furthest_field_end(
        mut fields in prop::collection::vec((0u32..256, 1u32..16), 1..12),
        reverse in any::<bool>(),
    ) {
        let expected = fields.iter().map(|&(o, s)| u64::from(o + s)).max().unwrap();
        if reverse {
            fields.reverse();
        }
        let table = KernelTable::parse(&pod_stream(&fields));
        let plan = layout::plan(table.get("k").unwrap());

        prop_assert!(!plan.is_deferred());
        prop_assert_eq!(plan.uniforms().get(0), Some(expected));
        prop_assert_eq!(padded_uniform_size(expected) % 16, 0);
        prop_assert!(padded_uniform_size(expected) >= expected);
    }

    #[test]
    fn layout_bindings_are_unique(bindings in prop::collection::vec(0u32..8, 1..20)) {
        let mut text = String::from("kernel_decl,k,printf,0\n");
        for (ordinal, binding) in bindings.iter().enumerate() {
            text.push_str(&format!(
                "kernel,k,arg,a{ordinal},argOrdinal,{ordinal},argKind,buffer,binding,{binding}\n"
            ));
        }
        let table = KernelTable::parse(&text);
        let LayoutPlan::Ready(layout) = layout::plan(table.get("k").unwrap()) else {
            panic!("no globals, layout must be ready");
        };
        let seen: HashSet<u32> = layout.entries().iter().map(|e| e.binding).collect();
        let distinct: HashSet<u32> = bindings.iter().copied().collect();
        prop_assert_eq!(seen.len(), layout.entries().len());
        prop_assert_eq!(seen, distinct);
    }

    #[test]
    fn initializers_never_defer(name in "[a-z][a-z0-9_]{0,12}") {
        let text = format!(
            "kernel_decl,_chip_var_init_{name},printf,0\n\
             kernel,_chip_var_init_{name},arg,_chip_var_{name},argOrdinal,0,argKind,buffer,binding,0\n"
        );
        let table = KernelTable::parse(&text);
        let init = table.get(&format!("_chip_var_init_{name}")).unwrap();
        prop_assert!(init.is_initializer());
        prop_assert!(!layout::plan(init).is_deferred());
        prop_assert_eq!(table.launchable().count(), 0);
    }

    #[test]
    fn parser_survives_arbitrary_lines(lines in prop::collection::vec("[a-z_,0-9]{0,40}", 0..30)) {
        let table = KernelTable::parse(&lines.join("\n"));
        for (_, kernel) in table.iter() {
            let _ = layout::plan(kernel);
        }
    }

    #[test]
    fn printf_u32_records_render(values in prop::collection::vec(any::<u32>(), 0..16)) {
        let descriptors = PrintfDescriptors::parse("printf,id,3,format,2575,args,4\n");
        let mut words = vec![(values.len() * 2) as u32];
        for v in &values {
            words.extend_from_slice(&[3, *v]);
        }
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let text = render(&bytes, &descriptors).unwrap();
        let expected: String = values.iter().map(u32::to_string).collect();
        prop_assert_eq!(text, expected);
    }
}

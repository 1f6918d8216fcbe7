//! # Reflection Stream Parsing
//!
//! The kernel compiler emits one record per line, each a comma separated
//! `tag,name,key,value,key,value,...` tuple:
//!
//! ```text
//! kernel_decl,addKernel,printf,0
//! kernel,addKernel,arg,a,argOrdinal,0,argKind,buffer,binding,0
//! kernel,addKernel,arg,n,argOrdinal,2,argKind,pod_ubo,binding,2,offset,0,argSize,4
//! printf,id,0,format,48690a,args,
//! ```
//!
//! Parsing produces a [`KernelTable`]: an arena of [`KernelDescriptor`]s
//! addressed by [`KernelId`], plus a name index. The parser never fails;
//! records it cannot use are skipped.

use std::collections::HashMap;

use tracing::debug;

/// Prefix of every runtime global visible to kernels.
pub const GLOBAL_PREFIX: &str = "_chip_var_";

/// Prefix of the generated one-shot initializer kernel of a global.
pub const INIT_PREFIX: &str = "_chip_var_init_";

/// Global a kernel sets when a device-side assertion fails.
pub const ABORT_FLAG_GLOBAL: &str = "_chip_var___chipspv_abort_called";

const TAG_KERNEL_DECL: &str = "kernel_decl";
const TAG_KERNEL_ARG: &str = "kernel";
const TAG_PRINTF: &str = "printf";

/// Binding-relevant kind of a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Device pointer bound as a storage buffer.
    Buffer,
    /// Plain-old-data packed into a uniform buffer.
    PodUniform,
}

impl ArgKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "buffer" => Some(ArgKind::Buffer),
            "pod_ubo" => Some(ArgKind::PodUniform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub name: String,
    /// Index of the argument's slot in the launch argument buffer.
    pub ordinal: u32,
    pub kind: ArgKind,
    pub binding: u32,
    pub size: u32,
    /// Byte offset inside the uniform buffer (POD arguments only).
    pub offset: u32,
}

impl ArgDescriptor {
    /// Whether this argument names a runtime global rather than a launch argument.
    pub fn is_global(&self) -> bool {
        self.name.starts_with(GLOBAL_PREFIX)
    }

    /// End of this argument inside its uniform buffer.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) usize);

impl KernelId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub name: String,
    pub args: Vec<ArgDescriptor>,
    /// Element size of the dynamic shared memory array, 0 if unused.
    pub dynamic_mem_elem_size: u32,
    pub printf: bool,
}

impl KernelDescriptor {
    fn new(name: &str, printf: bool) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
            dynamic_mem_elem_size: 0,
            printf,
        }
    }

    /// Whether this kernel is the generated initializer of a global.
    pub fn is_initializer(&self) -> bool {
        self.name.starts_with(INIT_PREFIX)
    }

    pub fn uses_dynamic_shared_memory(&self) -> bool {
        self.dynamic_mem_elem_size != 0
    }
}

/// Name of the initializer kernel for global `name` (without prefix).
pub fn initializer_name(name: &str) -> String {
    format!("{INIT_PREFIX}{name}")
}

/// Key under which global `name` (without prefix) appears in argument records.
pub fn global_key(name: &str) -> String {
    format!("{GLOBAL_PREFIX}{name}")
}

/// Key/value view over the fields following `tag,name`.
struct Fields<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn new(parts: &[&'a str]) -> Self {
        let pairs = parts
            .chunks(2)
            .map(|pair| (pair[0], pair.get(1).copied().unwrap_or("")))
            .collect();
        Self { pairs }
    }

    /// Last occurrence wins, as with a plain map.
    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn number(&self, key: &str) -> u32 {
        match self.get(key) {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                debug!(key, raw, "non-numeric reflection field, using 0");
                0
            }),
        }
    }
}

/// All kernels declared by one shader module.
#[derive(Debug, Clone, Default)]
pub struct KernelTable {
    kernels: Vec<KernelDescriptor>,
    index: HashMap<String, KernelId>,
    printf_blob: String,
}

impl KernelTable {
    /// Parse a complete reflection stream.
    pub fn parse(text: &str) -> Self {
        let mut table = KernelTable::default();
        for line in text.lines() {
            table.parse_line(line.trim_end_matches('\r'));
        }
        debug!(
            kernels = table.kernels.len(),
            printf_bytes = table.printf_blob.len(),
            "parsed reflection stream"
        );
        table
    }

    fn parse_line(&mut self, line: &str) {
        let mut parts = line.split(',');
        let (Some(tag), Some(name)) = (parts.next(), parts.next()) else {
            return;
        };
        let rest: Vec<&str> = parts.collect();
        let fields = Fields::new(&rest);

        match tag {
            TAG_KERNEL_DECL => {
                let printf = fields.get("printf") == Some("1");
                self.declare(name, printf);
            }
            TAG_KERNEL_ARG => {
                let Some(&id) = self.index.get(name) else {
                    debug!(kernel = name, "argument record for undeclared kernel");
                    return;
                };
                let kernel = &mut self.kernels[id.0];
                let raw_kind = fields.get("argKind").unwrap_or("");
                if raw_kind == "local" {
                    kernel.dynamic_mem_elem_size = fields.number("arrayElemSize");
                }
                let Some(kind) = ArgKind::parse(raw_kind) else {
                    return;
                };
                kernel.args.push(ArgDescriptor {
                    name: fields.get("arg").unwrap_or("").to_string(),
                    ordinal: fields.number("argOrdinal"),
                    kind,
                    binding: fields.number("binding"),
                    size: fields.number("argSize"),
                    offset: fields.number("offset"),
                });
            }
            TAG_PRINTF => {
                self.printf_blob.push_str(line);
                self.printf_blob.push('\n');
            }
            _ => {}
        }
    }

    fn declare(&mut self, name: &str, printf: bool) {
        let descriptor = KernelDescriptor::new(name, printf);
        match self.index.get(name) {
            // A repeated declaration starts the kernel over.
            Some(&id) => self.kernels[id.0] = descriptor,
            None => {
                let id = KernelId(self.kernels.len());
                self.kernels.push(descriptor);
                self.index.insert(name.to_string(), id);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<KernelId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&KernelDescriptor> {
        self.lookup(name).map(|id| &self.kernels[id.0])
    }

    pub fn kernel(&self, id: KernelId) -> &KernelDescriptor {
        &self.kernels[id.0]
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KernelId, &KernelDescriptor)> {
        self.kernels
            .iter()
            .enumerate()
            .map(|(i, k)| (KernelId(i), k))
    }

    /// Kernels a host program can launch by name, initializers excluded.
    pub fn launchable(&self) -> impl Iterator<Item = &str> {
        self.kernels
            .iter()
            .filter(|k| !k.is_initializer())
            .map(|k| k.name.as_str())
    }

    /// Raw `printf` records, one per line, in stream order.
    pub fn printf_blob(&self) -> &str {
        &self.printf_blob
    }

    /// Whether any kernel declared a bindable argument.
    pub fn any_kernel_has_bindings(&self) -> bool {
        self.kernels.iter().any(|k| !k.args.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_KERNEL: &str = "kernel_decl,addKernel,printf,0\n\
        kernel,addKernel,arg,a,argOrdinal,0,argKind,buffer,binding,0\n\
        kernel,addKernel,arg,b,argOrdinal,1,binding,1,argKind,buffer\n";

    #[test]
    fn test_parse_buffer_arguments() {
        let table = KernelTable::parse(ADD_KERNEL);
        assert_eq!(table.len(), 1);

        let kernel = table.get("addKernel").unwrap();
        assert!(!kernel.printf);
        assert_eq!(kernel.args.len(), 2);
        assert_eq!(kernel.args[0].name, "a");
        assert_eq!(kernel.args[0].kind, ArgKind::Buffer);
        assert_eq!(kernel.args[1].binding, 1);
        assert_eq!(kernel.args[1].ordinal, 1);
    }

    #[test]
    fn test_printf_flag_and_blob() {
        let text = "kernel_decl,hello,printf,1\n\
            printf,id,0,format,48656c6c6f0a,args,\n\
            printf,id,1,format,256400,args,4\n";
        let table = KernelTable::parse(text);
        assert!(table.get("hello").unwrap().printf);
        assert_eq!(
            table.printf_blob(),
            "printf,id,0,format,48656c6c6f0a,args,\nprintf,id,1,format,256400,args,4\n"
        );
    }

    #[test]
    fn test_local_argument_sets_shared_memory() {
        let text = "kernel_decl,reduce,printf,0\n\
            kernel,reduce,arg,tile,argOrdinal,1,argKind,local,arrayElemSize,4\n\
            kernel,reduce,arg,out,argOrdinal,0,argKind,buffer,binding,0\n";
        let kernel = KernelTable::parse(text).get("reduce").cloned().unwrap();
        assert_eq!(kernel.dynamic_mem_elem_size, 4);
        assert!(kernel.uses_dynamic_shared_memory());
        assert_eq!(kernel.args.len(), 1, "local arguments are not bindable");
    }

    #[test]
    fn test_unbindable_kinds_dropped() {
        let text = "kernel_decl,k,printf,0\n\
            kernel,k,arg,p,argOrdinal,0,argKind,pod_pushconstant,binding,0\n\
            kernel,k,arg,q,argOrdinal,1,argKind,pod_ubo,binding,1,offset,0,argSize,4\n";
        let kernel = KernelTable::parse(text).get("k").cloned().unwrap();
        assert_eq!(kernel.args.len(), 1);
        assert_eq!(kernel.args[0].kind, ArgKind::PodUniform);
    }

    #[test]
    fn test_orphan_argument_ignored() {
        let text = "kernel,ghost,arg,a,argOrdinal,0,argKind,buffer,binding,0\n\
            kernel_decl,ghost,printf,0\n";
        let table = KernelTable::parse(text);
        assert!(table.get("ghost").unwrap().args.is_empty());
    }

    #[test]
    fn test_unknown_tags_and_blank_lines() {
        let text = "\n\nspec_constant,foo,bar,1\nkernel_decl,k,printf,0\r\nnonsense\n";
        let table = KernelTable::parse(text);
        assert_eq!(table.len(), 1);
        assert!(table.lookup("k").is_some());
    }

    #[test]
    fn test_bad_numbers_default_to_zero() {
        let text = "kernel_decl,k,printf,0\n\
            kernel,k,arg,a,argOrdinal,x,argKind,buffer,binding,\n";
        let kernel = KernelTable::parse(text).get("k").cloned().unwrap();
        assert_eq!(kernel.args[0].ordinal, 0);
        assert_eq!(kernel.args[0].binding, 0);
    }

    #[test]
    fn test_launchable_skips_initializers() {
        let text = "kernel_decl,_chip_var_init_counter,printf,0\n\
            kernel_decl,myKernel,printf,0\n";
        let table = KernelTable::parse(text);
        let names: Vec<&str> = table.launchable().collect();
        assert_eq!(names, vec!["myKernel"]);
        assert!(table.get("_chip_var_init_counter").unwrap().is_initializer());
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(initializer_name("counter"), "_chip_var_init_counter");
        assert_eq!(global_key("counter"), "_chip_var_counter");
        assert!(ABORT_FLAG_GLOBAL.starts_with(GLOBAL_PREFIX));
    }

    #[test]
    fn test_redeclaration_resets_kernel() {
        let text = "kernel_decl,k,printf,0\n\
            kernel,k,arg,a,argOrdinal,0,argKind,buffer,binding,0\n\
            kernel_decl,k,printf,1\n";
        let table = KernelTable::parse(text);
        assert_eq!(table.len(), 1);
        let kernel = table.get("k").unwrap();
        assert!(kernel.printf);
        assert!(kernel.args.is_empty());
    }
}

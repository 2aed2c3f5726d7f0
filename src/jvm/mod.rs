pub mod call;
pub mod class;
pub mod exceptions;
pub mod internals;
pub mod link;
pub mod mem;
pub mod scheduler;
pub mod thread;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io::{self, Write};
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};

use crate::class::ClassPath;
use crate::jvm::call::NativeRegistry;
use crate::jvm::class::{ClassDesc, ClassId, Field, Method, MethodId};
use crate::jvm::mem::{
    identity_hash, Heap, JavaValue, JsHandleTable, MonitorTable, ObjRef, TypeKind,
};
use crate::jvm::scheduler::Scheduler;
use crate::jvm::thread::VmThread;

/// Marker for "a Java exception has been stored in the current thread's
/// exception slot". Functions that can raise return `Result<T, Raised>` and
/// callers either handle the exception or propagate the marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Raised;

pub type VmResult<T> = Result<T, Raised>;

/// Host hooks for the standard streams. The embedder decides where VM output
/// lands; the default writes through to the process's own streams.
pub trait HostIo {
    fn write_stdout(&mut self, bytes: &[u8]);
    fn write_stderr(&mut self, bytes: &[u8]);

    /// Number of bytes available on stdin without blocking.
    fn poll_stdin(&mut self) -> usize {
        0
    }

    fn read_stdin(&mut self, _buffer: &mut [u8]) -> usize {
        0
    }
}

pub struct ProcessIo;

impl HostIo for ProcessIo {
    fn write_stdout(&mut self, bytes: &[u8]) {
        let _ = io::stdout().write_all(bytes);
        let _ = io::stdout().flush();
    }

    fn write_stderr(&mut self, bytes: &[u8]) {
        let _ = io::stderr().write_all(bytes);
        let _ = io::stderr().flush();
    }
}

pub struct VmOptions {
    pub classpath: String,
    pub heap_bytes: usize,
    /// Interpreter timeslice before a cooperative yield, in microseconds.
    pub preemption_us: u64,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            classpath: ".".to_string(),
            heap_bytes: 1 << 26,
            preemption_us: 30_000,
        }
    }
}

/// Lazily resolved descriptors for classes the VM itself needs constantly.
#[derive(Default)]
pub struct WellKnown {
    pub object: Cell<Option<ClassId>>,
    pub string: Cell<Option<ClassId>>,
    pub class: Cell<Option<ClassId>>,
    pub thread: Cell<Option<ClassId>>,
    /// Byte offset of the hidden slot appended to java/lang/Class instances
    /// holding the mirrored ClassId.
    pub class_vmdata_offset: Cell<Option<u32>>,
}

/// The virtual machine. Owns every table, the heap and all threads. Java
/// state is only ever mutated from one OS thread; the scheduler's queue is
/// the single exception and carries its own mutex.
pub struct JavaEnv {
    pub options: VmOptions,
    pub classpath: ClassPath,

    pub(crate) classes: Vec<ClassDesc>,
    /// (binary name, defining loader id) -> class. Loader 0 is bootstrap.
    pub(crate) class_table: HashMap<(Rc<str>, u32), ClassId>,
    /// Classes currently being loaded, to detect circularity.
    pub(crate) inchoate: HashSet<Rc<str>>,

    pub heap: Heap,
    pub monitors: MonitorTable,
    pub(crate) next_hash: u64,

    pub interned_strings: HashMap<String, ObjRef>,
    pub natives: NativeRegistry,
    pub threads: Vec<VmThread>,
    pub scheduler: Scheduler,
    pub js_handles: JsHandleTable,
    pub modules: HashMap<Rc<str>, ObjRef>,

    pub well_known: WellKnown,
    pub primitives: [Cell<Option<ClassId>>; 8],

    pub main_thread_group: Option<ObjRef>,
    pub reference_pending_list: Option<ObjRef>,

    /// Blocks handed out by Unsafe.allocateMemory, keyed by their fake
    /// address; released wholesale on VM teardown.
    pub native_memory: BTreeMap<u64, Box<[u8]>>,
    pub(crate) next_native_address: u64,

    pub stdio: Box<dyn HostIo>,
}

pub(crate) fn primitive_index(kind: TypeKind) -> usize {
    match kind {
        TypeKind::Boolean => 0,
        TypeKind::Byte => 1,
        TypeKind::Char => 2,
        TypeKind::Short => 3,
        TypeKind::Int => 4,
        TypeKind::Long => 5,
        TypeKind::Float => 6,
        TypeKind::Double => 7,
        TypeKind::Reference => panic!("reference is not a primitive"),
    }
}

impl JavaEnv {
    pub fn new(options: VmOptions) -> io::Result<Self> {
        Self::with_io(options, Box::new(ProcessIo))
    }

    pub fn with_io(options: VmOptions, stdio: Box<dyn HostIo>) -> io::Result<Self> {
        let classpath = ClassPath::parse(&options.classpath)?;
        let heap = Heap::new(options.heap_bytes);

        let mut env = JavaEnv {
            scheduler: Scheduler::new(options.preemption_us),
            options,
            classpath,
            classes: Vec::new(),
            class_table: HashMap::new(),
            inchoate: HashSet::new(),
            heap,
            monitors: MonitorTable::default(),
            next_hash: 1,
            interned_strings: HashMap::new(),
            natives: NativeRegistry::default(),
            threads: Vec::new(),
            js_handles: JsHandleTable::default(),
            modules: HashMap::new(),
            well_known: WellKnown::default(),
            primitives: Default::default(),
            main_thread_group: None,
            reference_pending_list: None,
            native_memory: BTreeMap::new(),
            next_native_address: 1 << 20,
            stdio,
        };

        internals::register_natives(&mut env.natives);
        env.threads.push(VmThread::new(0));
        info!("vm created with {} byte heap", env.heap.capacity());
        Ok(env)
    }

    pub fn class(&self, id: ClassId) -> &ClassDesc {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut ClassDesc {
        &mut self.classes[id.0 as usize]
    }

    pub fn classes(&self) -> &[ClassDesc] {
        &self.classes
    }

    pub fn method(&self, id: MethodId) -> &Rc<Method> {
        self.classes[id.class.0 as usize].method(id.index)
    }

    pub fn loaded_class(&self, name: &str) -> Option<ClassId> {
        self.class_table.get(&(Rc::from(name), 0)).copied()
    }

    pub fn main_thread(&self) -> u32 {
        0
    }

    /// Spawn a VM thread record (the Java-side Thread object is attached by
    /// the Thread natives). The preallocated error singletons come from the
    /// slop region so even a full heap can admit them.
    pub fn create_thread(&mut self) -> u32 {
        let tid = self.threads.len() as u32;
        let mut thread = VmThread::new(tid);

        for (name, oom) in [
            ("java/lang/OutOfMemoryError", true),
            ("java/lang/StackOverflowError", false),
        ] {
            if let Some(class) = self.loaded_class(name) {
                let bytes = mem::OBJECT_HEADER_BYTES + self.class(class).instance_bytes.get() as usize;
                if let Some(obj) = self.heap.alloc_raw(bytes, true) {
                    self.heap.set_class_of(obj, class);
                    if oom {
                        thread.out_of_mem_error = Some(obj);
                    } else {
                        thread.stack_overflow_error = Some(obj);
                    }
                }
            }
        }

        self.threads.push(thread);
        tid
    }

    // Allocation

    /// Bump-allocate an ordinary instance of an already-linked class,
    /// running a collection (and then raising OOM) on exhaustion.
    pub fn new_object(&mut self, tid: u32, class: ClassId) -> VmResult<ObjRef> {
        let bytes =
            mem::OBJECT_HEADER_BYTES + self.class(class).instance_bytes.get() as usize;
        let obj = self.allocate(tid, bytes)?;
        self.heap.set_class_of(obj, class);
        Ok(obj)
    }

    /// Allocate an array of the given array class.
    pub fn new_array(&mut self, tid: u32, class: ClassId, length: i32) -> VmResult<ObjRef> {
        if length < 0 {
            return Err(exceptions::raise_negative_array_size(self, tid, length));
        }

        let kind = self.class(class).element_kind();
        let bytes = Heap::array_size_bytes(kind, length as usize);
        let obj = self.allocate(tid, bytes)?;
        self.heap.set_class_of(obj, class);
        self.heap.set_array_length(obj, length);
        Ok(obj)
    }

    fn allocate(&mut self, tid: u32, bytes: usize) -> VmResult<ObjRef> {
        if let Some(obj) = self.heap.alloc_raw(bytes, false) {
            return Ok(obj);
        }

        debug!("allocation of {} bytes failed, running gc", bytes);
        self.major_gc();

        match self.heap.alloc_raw(bytes, false) {
            Some(obj) => Ok(obj),
            None => Err(self.out_of_memory(tid)),
        }
    }

    /// Raise the preallocated OutOfMemoryError. The slop region past the
    /// logical capacity lets any allocation done while constructing the
    /// error itself succeed.
    pub fn out_of_memory(&mut self, tid: u32) -> Raised {
        warn!("heap exhausted ({} used)", self.heap.used());
        self.threads[tid as usize].current_exception = None;

        match self.threads[tid as usize].out_of_mem_error {
            Some(error) => {
                self.threads[tid as usize].current_exception = Some(error);
            }
            None => panic!("out of memory before the OOM singleton was allocated"),
        }
        Raised
    }

    pub fn identity_hash(&mut self, obj: ObjRef) -> i32 {
        identity_hash(&mut self.heap, &mut self.monitors, obj, &mut self.next_hash)
    }

    // Subtype testing

    /// instanceof with both sides resolved. O(1) through the hierarchy chain
    /// for class targets, a scan of the itable set for interface targets and
    /// component-wise covariance for array targets. Array classes carry
    /// Object in their hierarchy and Cloneable/Serializable in their itable
    /// set, so non-array targets need no special casing.
    pub fn instanceof(&self, instance: ClassId, target: ClassId) -> bool {
        if instance == target {
            return true;
        }

        let instance_desc = self.class(instance);
        let target_desc = self.class(target);

        if target_desc.is_array() {
            return instance_desc.is_array() && self.array_instanceof(instance_desc, target_desc);
        }

        if target_desc.is_interface() {
            return instance_desc.itable_for(target).is_some();
        }

        let chain = &instance_desc.hierarchy;
        let depth = target_desc.hierarchy.len();
        depth <= chain.len() && chain[depth - 1] == target
    }

    /// Array covariance by base component and dimensions. Equal ranks
    /// compare base components directly (a primitive base only matches
    /// itself). A deeper instance strips one dimension at a time; the
    /// remaining array can then satisfy an Object/Cloneable/Serializable
    /// base through the ordinary subtype test.
    fn array_instanceof(&self, instance: &ClassDesc, target: &ClassDesc) -> bool {
        if instance.dimensions < target.dimensions {
            return false;
        }

        if instance.dimensions == target.dimensions {
            return match (instance.base_component, target.base_component) {
                (Some(a), Some(b)) => self.instanceof(a, b),
                _ => false,
            };
        }

        match (instance.one_fewer_dim, target.one_fewer_dim) {
            (Some(a), Some(b)) => self.instanceof(a, b),
            _ => false,
        }
    }

    // Member lookup

    /// JVMS §5.4.3.3 method resolution: the class itself, then superclasses,
    /// then superinterfaces.
    pub fn method_lookup(
        &self,
        class: ClassId,
        name: &str,
        descriptor: &str,
        search_superclasses: bool,
        search_superinterfaces: bool,
    ) -> Option<MethodId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let desc = self.class(id);
            if let Some(method) = desc.find_method(name, descriptor) {
                return Some(method.id());
            }
            if !search_superclasses {
                break;
            }
            current = desc.super_class;
        }

        if search_superinterfaces {
            for itable in &self.class(class).itables {
                let interface = self.class(itable.interface);
                if let Some(method) = interface.find_method(name, descriptor) {
                    return Some(method.id());
                }
            }
        }

        None
    }

    /// Field lookup walking superclasses (JVMS §5.4.3.2). Interfaces come
    /// before the superclass for static resolution.
    pub fn field_lookup(&self, class: ClassId, name: &str) -> Option<(ClassId, u16)> {
        let desc = self.class(class);
        if let Some((index, _)) = desc.find_field(name) {
            return Some((class, index));
        }

        for itable in &desc.itables {
            let interface = self.class(itable.interface);
            if let Some((index, _)) = interface.find_field(name) {
                return Some((itable.interface, index));
            }
        }

        match desc.super_class {
            Some(super_class) => self.field_lookup(super_class, name),
            None => None,
        }
    }

    pub fn static_field_value(&self, class: ClassId, field: &Field) -> JavaValue {
        let offset = field.byte_offset.get() as usize;
        let kind = field.type_kind();
        let data = &self.class(class).static_data;
        read_static(data, offset, kind)
    }

    pub fn set_static_field_value(&mut self, class: ClassId, field_index: u16, value: JavaValue) {
        let offset = self.class(class).field(field_index).byte_offset.get() as usize;
        let data = &mut self.class_mut(class).static_data;
        write_static(data, offset, value);
    }

    /// True when the class is java/lang/Error or derives from it; such
    /// throwables pass through `<clinit>` failure handling unwrapped.
    pub fn is_error_class(&self, mut class: ClassId) -> bool {
        loop {
            let desc = self.class(class);
            if desc.name.as_ref() == "java/lang/Error" {
                return true;
            }
            match desc.super_class {
                Some(super_class) => class = super_class,
                None => return false,
            }
        }
    }


    // Embedder JS handles

    pub fn make_js_handle(&mut self, obj: ObjRef) -> i32 {
        self.js_handles.make(obj)
    }

    pub fn deref_js_handle(&self, handle: i32) -> Option<ObjRef> {
        self.js_handles.deref(handle)
    }

    pub fn drop_js_handle(&mut self, handle: i32) {
        self.js_handles.drop_handle(handle);
    }

    /// Allocate a fake-address native block for Unsafe.
    pub fn allocate_native_memory(&mut self, bytes: usize) -> u64 {
        let address = self.next_native_address;
        self.next_native_address += crate::util::align_up(bytes.max(1), 16) as u64;
        self.native_memory.insert(address, vec![0u8; bytes].into_boxed_slice());
        address
    }

    pub fn free_native_memory(&mut self, address: u64) {
        self.native_memory.remove(&address);
    }

    /// Locate the block containing `address`, returning (block, offset).
    pub fn native_memory_at(&mut self, address: u64) -> Option<(&mut Box<[u8]>, usize)> {
        let (base, block) = self.native_memory.range_mut(..=address).next_back()?;
        let offset = (address - base) as usize;
        if offset < block.len() {
            let base = *base;
            let block = self.native_memory.get_mut(&base).unwrap();
            Some((block, offset))
        } else {
            None
        }
    }
}

pub(crate) fn read_static(data: &[u8], offset: usize, kind: TypeKind) -> JavaValue {
    let slice = &data[offset..];
    match kind {
        TypeKind::Boolean | TypeKind::Byte => JavaValue::Byte(slice[0] as i8),
        TypeKind::Char => JavaValue::Char(u16::from_ne_bytes(slice[..2].try_into().unwrap())),
        TypeKind::Short => {
            JavaValue::Short(u16::from_ne_bytes(slice[..2].try_into().unwrap()) as i16)
        }
        TypeKind::Int => JavaValue::Int(u32::from_ne_bytes(slice[..4].try_into().unwrap()) as i32),
        TypeKind::Long => {
            JavaValue::Long(u64::from_ne_bytes(slice[..8].try_into().unwrap()) as i64)
        }
        TypeKind::Float => {
            JavaValue::Float(f32::from_bits(u32::from_ne_bytes(slice[..4].try_into().unwrap())))
        }
        TypeKind::Double => {
            JavaValue::Double(f64::from_bits(u64::from_ne_bytes(slice[..8].try_into().unwrap())))
        }
        TypeKind::Reference => JavaValue::Reference(ObjRef::from_slot(u64::from_ne_bytes(
            slice[..8].try_into().unwrap(),
        ))),
    }
}

pub(crate) fn write_static(data: &mut [u8], offset: usize, value: JavaValue) {
    let slice = &mut data[offset..];
    match value {
        JavaValue::Byte(x) => slice[0] = x as u8,
        JavaValue::Char(x) => slice[..2].copy_from_slice(&x.to_ne_bytes()),
        JavaValue::Short(x) => slice[..2].copy_from_slice(&(x as u16).to_ne_bytes()),
        JavaValue::Int(x) => slice[..4].copy_from_slice(&(x as u32).to_ne_bytes()),
        JavaValue::Long(x) => slice[..8].copy_from_slice(&(x as u64).to_ne_bytes()),
        JavaValue::Float(x) => slice[..4].copy_from_slice(&x.to_bits().to_ne_bytes()),
        JavaValue::Double(x) => slice[..8].copy_from_slice(&x.to_bits().to_ne_bytes()),
        JavaValue::Reference(x) => {
            slice[..8].copy_from_slice(&ObjRef::into_slot(x).to_ne_bytes())
        }
    }
}

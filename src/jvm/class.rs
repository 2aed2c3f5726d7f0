use std::cell::Cell;
use std::rc::Rc;

use crate::analysis::CodeAnalysis;
use crate::class::attribute::{AttributeInfo, BootstrapMethod, LineNumber};
use crate::class::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use crate::instruction::{Instruction, LookupSwitchData, TableSwitchData};
use crate::jvm::mem::{FieldDescriptor, MethodDescriptor, ObjRef, TypeKind};

/// Index of a loaded class in the VM's class registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// A method pinned by owning class and declaration index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: ClassId,
    pub index: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClassKind {
    Ordinary,
    OrdinaryArray,
    PrimitiveArray,
    Primitive,
}

/// Lifecycle of a class. `LinkageError` is sticky: once linking or
/// initialization fails the class never becomes usable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassState {
    Loaded,
    Linked,
    Initializing,
    Initialized,
    LinkageError,
}

/// Runtime constant pool entry. Resolution caches live in `Cell`s beside the
/// symbolic data; the garbage collector knows about every object-holding cell
/// here.
#[derive(Debug)]
pub enum CpEntry {
    Utf8(Rc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(CpClass),
    Str(CpString),
    FieldRef(CpFieldRef),
    MethodRef(CpMethodRef),
    NameAndType { name: Rc<str>, descriptor: Rc<str> },
    MethodHandle(CpMethodHandle),
    MethodType(CpMethodType),
    InvokeDynamic(CpInvokeDynamic),
    Module(Rc<str>),
    Package(Rc<str>),
    Placeholder,
}

#[derive(Debug)]
pub struct CpClass {
    pub name: Rc<str>,
    /// Exactly one of `resolved` and `error` is set once resolution has been
    /// attempted; the error object makes the failure sticky.
    pub resolved: Cell<Option<ClassId>>,
    pub error: Cell<Option<ObjRef>>,
}

#[derive(Debug)]
pub struct CpString {
    pub value: Rc<str>,
    pub interned: Cell<Option<ObjRef>>,
}

#[derive(Debug)]
pub struct CpFieldRef {
    pub class_index: u16,
    pub name: Rc<str>,
    pub descriptor: FieldDescriptor,
    pub resolved: Cell<Option<FieldId>>,
}

#[derive(Debug)]
pub struct CpMethodRef {
    pub class_index: u16,
    pub name: Rc<str>,
    pub descriptor: Rc<str>,
    pub interface: bool,
    pub resolved: Cell<Option<MethodId>>,
}

#[derive(Debug)]
pub struct CpMethodHandle {
    pub kind: u8,
    pub reference_index: u16,
    pub resolved_mt: Cell<Option<ObjRef>>,
    pub resolved_handle: Cell<Option<ObjRef>>,
}

#[derive(Debug)]
pub struct CpMethodType {
    pub descriptor: Rc<str>,
    pub resolved: Cell<Option<ObjRef>>,
}

#[derive(Debug)]
pub struct CpInvokeDynamic {
    pub bootstrap_index: u16,
    pub name: Rc<str>,
    pub descriptor: Rc<str>,
    /// True for a CONSTANT_Dynamic_info entry (a dynamically computed
    /// constant rather than a call site).
    pub is_constant: bool,
    pub resolved_mt: Cell<Option<ObjRef>>,
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

impl ConstantPool {
    pub fn from_entries(entries: Vec<CpEntry>) -> Self {
        ConstantPool { entries }
    }

    pub fn entry(&self, index: u16) -> &CpEntry {
        &self.entries[index as usize - 1]
    }

    pub fn entries(&self) -> &[CpEntry] {
        &self.entries
    }

    pub fn class_info(&self, index: u16) -> &CpClass {
        match self.entry(index) {
            CpEntry::Class(info) => info,
            x => panic!("constant {} is not a class: {:?}", index, x),
        }
    }

    pub fn method_ref(&self, index: u16) -> &CpMethodRef {
        match self.entry(index) {
            CpEntry::MethodRef(info) => info,
            x => panic!("constant {} is not a method ref: {:?}", index, x),
        }
    }

    pub fn field_ref(&self, index: u16) -> &CpFieldRef {
        match self.entry(index) {
            CpEntry::FieldRef(info) => info,
            x => panic!("constant {} is not a field ref: {:?}", index, x),
        }
    }

    pub fn indy_info(&self, index: u16) -> &CpInvokeDynamic {
        match self.entry(index) {
            CpEntry::InvokeDynamic(info) => info,
            x => panic!("constant {} is not invokedynamic: {:?}", index, x),
        }
    }
}

/// Exception handler with program counters rewritten to instruction indices.
#[derive(Debug, Copy, Clone)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// Constant pool index of the catch type; zero catches everything.
    pub catch_type: u16,
}

/// LocalVariableTable entry with its names resolved out of the pool.
#[derive(Debug, Clone)]
pub struct LocalVariableInfo {
    pub start_pc: u16,
    pub length: u16,
    pub name: Rc<str>,
    pub descriptor: Rc<str>,
    pub index: u16,
}

#[derive(Debug)]
pub struct CodeInfo {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Instruction>,
    /// Original byte offset of each instruction, for exception tables, line
    /// numbers and debugging output.
    pub insn_pcs: Vec<u16>,
    pub table_switches: Vec<TableSwitchData>,
    pub lookup_switches: Vec<LookupSwitchData>,
    pub exception_table: Vec<ExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
    pub local_variables: Vec<LocalVariableInfo>,
    pub analysis: CodeAnalysis,
}

impl CodeInfo {
    /// Source line for an instruction index, if a LineNumberTable is present.
    pub fn line_for_insn(&self, insn: usize) -> Option<u16> {
        let pc = *self.insn_pcs.get(insn)?;
        let mut line = None;
        for entry in &self.line_numbers {
            if entry.start_pc <= pc {
                line = Some(entry.line_number);
            } else {
                break;
            }
        }
        line
    }
}

#[derive(Debug)]
pub struct Field {
    pub name: Rc<str>,
    pub descriptor: FieldDescriptor,
    pub access: FieldAccessFlags,
    /// Byte offset: within the instance data area for instance fields,
    /// within the class's static block for statics. Assigned during linking.
    pub byte_offset: Cell<u32>,
    /// Constant pool index of a ConstantValue attribute, applied during
    /// initialization.
    pub constant_value: Option<u16>,
    pub reflection_field: Cell<Option<ObjRef>>,
    pub annotations: Option<Vec<u8>>,
    pub signature: Option<Rc<str>>,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.access.contains(FieldAccessFlags::STATIC)
    }

    pub fn type_kind(&self) -> TypeKind {
        self.descriptor.type_kind()
    }
}

pub struct Method {
    pub name: Rc<str>,
    pub descriptor_text: Rc<str>,
    pub descriptor: MethodDescriptor,
    pub access: MethodAccessFlags,
    pub class: ClassId,
    pub index: u16,
    pub code: Option<Rc<CodeInfo>>,
    /// Index into the native registry, bound when the class is defined.
    pub native: Cell<Option<u32>>,
    pub vtable_index: Cell<Option<u16>>,
    pub is_ctor: bool,
    pub is_clinit: bool,
    pub is_signature_polymorphic: bool,
    pub reflection_method: Cell<Option<ObjRef>>,
    pub reflection_ctor: Cell<Option<ObjRef>>,
    /// Cached MethodType mirror for this method's descriptor.
    pub method_type_obj: Cell<Option<ObjRef>>,
    pub annotations: Option<Vec<u8>>,
    pub parameter_annotations: Option<Vec<u8>>,
    pub annotation_default: Option<Vec<u8>>,
    pub signature: Option<Rc<str>>,
    pub parameter_names: Vec<(Option<Rc<str>>, u16)>,
    pub declared_exceptions: Vec<Rc<str>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(MethodAccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(MethodAccessFlags::NATIVE)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    /// Argument slot count including the receiver for instance methods.
    pub fn invocation_argc(&self) -> usize {
        self.descriptor.argc() + !self.is_static() as usize
    }

    pub fn id(&self) -> MethodId {
        MethodId { class: self.class, index: self.index }
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor_text)
    }
}

/// Per-interface dispatch table: one slot per interface method, in the
/// interface's declaration order. `None` marks the abstract-method sentinel
/// the interpreter turns into an AbstractMethodError at the call site.
#[derive(Debug)]
pub struct Itable {
    pub interface: ClassId,
    pub methods: Vec<Option<MethodId>>,
}

/// A loaded class. Identified by (name, defining loader); owns every
/// descriptor-scoped allocation, which all dies together when the class is
/// dropped.
pub struct ClassDesc {
    pub id: ClassId,
    pub kind: ClassKind,
    pub name: Rc<str>,
    pub access: ClassAccessFlags,
    pub pool: ConstantPool,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub fields: Vec<Field>,
    pub methods: Vec<Rc<Method>>,
    pub state: Cell<ClassState>,

    /// Instance data bytes (excluding the object header); valid once linked.
    pub instance_bytes: Cell<u32>,
    pub static_data: Vec<u8>,
    /// Byte offsets of reference slots, for the GC.
    pub static_refs: Vec<u32>,
    pub instance_refs: Vec<u32>,

    pub vtable: Vec<MethodId>,
    pub itables: Vec<Itable>,
    /// Superclass chain from the root down to this class itself. Subtype
    /// tests index it directly.
    pub hierarchy: Vec<ClassId>,

    pub mirror: Cell<Option<ObjRef>>,
    pub cp_mirror: Cell<Option<ObjRef>>,
    pub classloader_mirror: Cell<Option<ObjRef>>,
    pub linkage_error: Cell<Option<ObjRef>>,

    // Array-class links
    pub array_type: Cell<Option<ClassId>>,
    pub one_fewer_dim: Option<ClassId>,
    pub base_component: Option<ClassId>,
    pub dimensions: u8,
    /// Element kind for primitive arrays; the represented primitive for
    /// primitive classes.
    pub primitive: Option<TypeKind>,

    pub source_file: Option<Rc<str>>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
    pub annotations: Option<Vec<u8>>,
    pub signature: Option<Rc<str>>,
    pub nest_host: Option<Rc<str>>,
    /// Raw attribute list as parsed, including attributes the VM does not
    /// interpret.
    pub attributes: Vec<AttributeInfo>,
    pub module: Option<Rc<str>>,

    /// Instructions with object-holding inline caches, as (method index,
    /// instruction index) pairs; enumerated as GC roots.
    pub indy_insns: Vec<(u16, u32)>,
    pub sigpoly_insns: Vec<(u16, u32)>,
}

impl ClassDesc {
    /// Candidate match per JVMS §5.4.3.3: descriptors must agree unless the
    /// target is signature polymorphic.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Rc<Method>> {
        self.methods.iter().find(|m| {
            m.name.as_ref() == name
                && (m.is_signature_polymorphic || m.descriptor_text.as_ref() == descriptor)
        })
    }

    pub fn find_field(&self, name: &str) -> Option<(u16, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name.as_ref() == name)
            .map(|(i, f)| (i as u16, f))
    }

    pub fn method(&self, index: u16) -> &Rc<Method> {
        &self.methods[index as usize]
    }

    pub fn field(&self, index: u16) -> &Field {
        &self.fields[index as usize]
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccessFlags::INTERFACE)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::OrdinaryArray | ClassKind::PrimitiveArray)
    }

    /// Element kind used for array layout.
    pub fn element_kind(&self) -> TypeKind {
        match self.kind {
            ClassKind::OrdinaryArray => TypeKind::Reference,
            ClassKind::PrimitiveArray => {
                if self.dimensions > 1 {
                    TypeKind::Reference
                } else {
                    self.primitive.expect("primitive array without component")
                }
            }
            _ => panic!("{} is not an array class", self.name),
        }
    }

    /// Itable for a given interface, if this class implements it.
    pub fn itable_for(&self, interface: ClassId) -> Option<&Itable> {
        self.itables.iter().find(|x| x.interface == interface)
    }
}

impl std::fmt::Debug for ClassDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDesc")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state.get())
            .finish()
    }
}

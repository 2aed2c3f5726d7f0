use std::cell::Cell;
use std::io;
use std::rc::Rc;

use crate::analysis::analyze_code;
use crate::class::attribute::{
    find_attribute, find_raw_attribute, ConstantValue, Exceptions, LineNumberTable,
    LocalVariableTable, MethodParameters, Signature, SourceFile, StackMapTable,
};
use crate::class::{
    ClassAccessFlags, ClassFile, ClasspathLookup, FieldInfo, MethodAccessFlags, MethodInfo,
};
use crate::class::constant::{Constant, RawConstantPool};
use crate::instruction::decode_code;
use crate::jvm::class::{
    ClassDesc, ClassId, ClassKind, ClassState, CodeInfo, ConstantPool, CpClass, CpEntry,
    CpFieldRef, CpInvokeDynamic, CpMethodHandle, CpMethodRef, CpMethodType, CpString,
    ExceptionHandler, Field, FieldId, Itable, LocalVariableInfo, Method, MethodId,
};
use crate::jvm::exceptions::*;
use crate::jvm::mem::{FieldDescriptor, JavaValue, TypeKind};
use crate::jvm::{primitive_index, JavaEnv, Raised, VmResult};

/// Look up a class by binary name (`java/lang/Object`, `[[J`,
/// `[Ljava/lang/String;`) through the bootstrap loader, loading and linking
/// it on demand.
pub fn bootstrap_lookup_class(env: &mut JavaEnv, tid: u32, name: &str) -> VmResult<ClassId> {
    match bootstrap_lookup_class_impl(env, tid, name)? {
        Some(class) => Ok(class),
        None => Err(raise_class_not_found(env, tid, name)),
    }
}

/// As above but reporting a missing class as `None` instead of raising.
pub fn bootstrap_lookup_class_impl(
    env: &mut JavaEnv,
    tid: u32,
    name: &str,
) -> VmResult<Option<ClassId>> {
    let dimensions = name.bytes().take_while(|x| *x == b'[').count();
    let base = &name[dimensions..];

    let mut class = if dimensions > 0 && !base.starts_with('L') {
        // Primitive array element
        let kind = base
            .chars()
            .next()
            .and_then(TypeKind::from_descriptor_char)
            .unwrap_or_else(|| panic!("malformed array class name {}", name));
        primitive_class(env, kind)
    } else {
        let base = if dimensions > 0 {
            // Strip L and ;
            &base[1..base.len() - 1]
        } else {
            base
        };

        match env.loaded_class(base) {
            Some(class) => class,
            None => {
                // A defining frame may name a class that is not on the
                // classpath (hidden and anonymous classes)
                if let Some(found) = find_in_defining_frames(env, tid, base) {
                    found
                } else {
                    let path = format!("{}.class", base);
                    let bytes = match env.classpath.lookup(&path) {
                        ClasspathLookup::Found(bytes) => bytes,
                        ClasspathLookup::NotFound => return Ok(None),
                        ClasspathLookup::Corrupt(message) => {
                            return Err(raise_class_format_error(env, tid, &message))
                        }
                    };
                    define_bootstrap_class(env, tid, base, &bytes)?
                }
            }
        }
    };

    for _ in 0..dimensions {
        class = array_class_of(env, tid, class)?;
    }
    Ok(Some(class))
}

fn find_in_defining_frames(env: &JavaEnv, tid: u32, name: &str) -> Option<ClassId> {
    for frame in env.threads[tid as usize].frames.frames.iter().rev() {
        let class = frame.method.class;
        if env.class(class).name.as_ref() == name {
            return Some(class);
        }
    }
    None
}

/// Parse, define and link a class from raw bytes under the bootstrap loader.
pub fn define_bootstrap_class(
    env: &mut JavaEnv,
    tid: u32,
    expected_name: &str,
    bytes: &[u8],
) -> VmResult<ClassId> {
    let class_file = match ClassFile::parse(bytes) {
        Ok(class_file) => class_file,
        Err(error) => {
            warn!("class file for {} is malformed: {}", expected_name, error);
            return Err(raise_class_format_error(env, tid, &error.to_string()));
        }
    };

    let name = class_file.name().clone();
    if name.as_ref() != expected_name {
        return Err(raise_no_class_def_found(env, tid, expected_name));
    }

    env.inchoate.insert(name.clone());
    let result = define_parsed_class(env, tid, class_file);
    env.inchoate.remove(&name);
    result
}

fn define_parsed_class(env: &mut JavaEnv, tid: u32, class_file: ClassFile) -> VmResult<ClassId> {
    let name = class_file.name().clone();
    debug!("defining class {}", name);

    // Resolve the superclass and superinterfaces first (JVMS §5.3.5); a
    // cycle through the inchoate set is a ClassCircularityError
    let mut super_class = None;
    if let Some(super_name) = class_file.super_class_name().cloned() {
        if env.inchoate.contains(&super_name) {
            return Err(raise_class_circularity(env, tid, &name));
        }
        match bootstrap_lookup_class_impl(env, tid, &super_name)? {
            Some(class) => super_class = Some(class),
            None => return Err(raise_no_class_def_found(env, tid, &super_name)),
        }
    }

    let mut interfaces = Vec::with_capacity(class_file.interfaces.len());
    let interface_names: Vec<Rc<str>> = class_file.interface_names().cloned().collect();
    for interface_name in interface_names {
        if env.inchoate.contains(&interface_name) {
            return Err(raise_class_circularity(env, tid, &name));
        }
        match bootstrap_lookup_class_impl(env, tid, &interface_name)? {
            Some(class) => interfaces.push(class),
            None => return Err(raise_no_class_def_found(env, tid, &interface_name)),
        }
    }

    let id = ClassId(env.classes.len() as u32);
    let desc = match build_class_desc(env, id, &class_file, super_class, interfaces) {
        Ok(desc) => desc,
        Err(error) => {
            warn!("building {} failed: {}", name, error);
            return Err(raise_class_format_error(env, tid, &error.to_string()));
        }
    };

    env.classes.push(desc);
    env.class_table.insert((name.clone(), 0), id);
    bind_natives(env, id);

    if let Err(raised) = link_class(env, tid, id) {
        return Err(raised);
    }

    // The error singletons must exist before the heap can fill up
    match name.as_ref() {
        "java/lang/OutOfMemoryError" => preallocate_error_singletons(env, id, true),
        "java/lang/StackOverflowError" => preallocate_error_singletons(env, id, false),
        _ => {}
    }

    Ok(id)
}

fn preallocate_error_singletons(env: &mut JavaEnv, class: ClassId, oom: bool) {
    let bytes =
        crate::jvm::mem::OBJECT_HEADER_BYTES + env.class(class).instance_bytes.get() as usize;
    for tid in 0..env.threads.len() {
        let slot = if oom {
            env.threads[tid].out_of_mem_error
        } else {
            env.threads[tid].stack_overflow_error
        };
        if slot.is_some() {
            continue;
        }

        // The slop region exists precisely for these
        if let Some(obj) = env.heap.alloc_raw(bytes, true) {
            env.heap.set_class_of(obj, class);
            if oom {
                env.threads[tid].out_of_mem_error = Some(obj);
            } else {
                env.threads[tid].stack_overflow_error = Some(obj);
            }
        }
    }
}

fn bind_natives(env: &mut JavaEnv, id: ClassId) {
    let class_name = env.class(id).name.clone();
    for method in &env.class(id).methods {
        if method.is_native() {
            if let Some(index) =
                env.natives.lookup(&class_name, &method.name, &method.descriptor_text)
            {
                method.native.set(Some(index));
            }
        }
    }
}

// Construction of the runtime descriptor from the parsed file

fn build_runtime_pool(raw: &RawConstantPool) -> io::Result<ConstantPool> {
    let mut entries = Vec::with_capacity(raw.len());

    for constant in raw.entries() {
        entries.push(match constant {
            Constant::Utf8(text) => CpEntry::Utf8(text.clone()),
            Constant::Integer(x) => CpEntry::Integer(*x),
            Constant::Float(x) => CpEntry::Float(*x),
            Constant::Long(x) => CpEntry::Long(*x),
            Constant::Double(x) => CpEntry::Double(*x),
            Constant::Placeholder => CpEntry::Placeholder,
            Constant::Class { name_index } => CpEntry::Class(CpClass {
                name: raw.text(*name_index).clone(),
                resolved: Cell::new(None),
                error: Cell::new(None),
            }),
            Constant::String { string_index } => CpEntry::Str(CpString {
                value: raw.text(*string_index).clone(),
                interned: Cell::new(None),
            }),
            Constant::FieldRef { class_index, name_and_type_index } => {
                let (name, descriptor) = raw.name_and_type(*name_and_type_index);
                CpEntry::FieldRef(CpFieldRef {
                    class_index: *class_index,
                    name: name.clone(),
                    descriptor: FieldDescriptor::parse(descriptor)?,
                    resolved: Cell::new(None),
                })
            }
            Constant::MethodRef { class_index, name_and_type_index }
            | Constant::InterfaceMethodRef { class_index, name_and_type_index } => {
                let (name, descriptor) = raw.name_and_type(*name_and_type_index);
                CpEntry::MethodRef(CpMethodRef {
                    class_index: *class_index,
                    name: name.clone(),
                    descriptor: descriptor.clone(),
                    interface: matches!(constant, Constant::InterfaceMethodRef { .. }),
                    resolved: Cell::new(None),
                })
            }
            Constant::NameAndType { name_index, descriptor_index } => CpEntry::NameAndType {
                name: raw.text(*name_index).clone(),
                descriptor: raw.text(*descriptor_index).clone(),
            },
            Constant::MethodHandle { reference_kind, reference_index } => {
                CpEntry::MethodHandle(CpMethodHandle {
                    kind: *reference_kind,
                    reference_index: *reference_index,
                    resolved_mt: Cell::new(None),
                    resolved_handle: Cell::new(None),
                })
            }
            Constant::MethodType { descriptor_index } => CpEntry::MethodType(CpMethodType {
                descriptor: raw.text(*descriptor_index).clone(),
                resolved: Cell::new(None),
            }),
            Constant::Dynamic { bootstrap_method_attr_index, name_and_type_index }
            | Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                let (name, descriptor) = raw.name_and_type(*name_and_type_index);
                CpEntry::InvokeDynamic(CpInvokeDynamic {
                    bootstrap_index: *bootstrap_method_attr_index,
                    name: name.clone(),
                    descriptor: descriptor.clone(),
                    is_constant: matches!(constant, Constant::Dynamic { .. }),
                    resolved_mt: Cell::new(None),
                })
            }
            Constant::Module { name_index } => CpEntry::Module(raw.text(*name_index).clone()),
            Constant::Package { name_index } => CpEntry::Package(raw.text(*name_index).clone()),
        });
    }

    Ok(ConstantPool::from_entries(entries))
}

fn attribute_bytes(
    attributes: &[crate::class::attribute::AttributeInfo],
    raw: &RawConstantPool,
    name: &str,
) -> Option<Vec<u8>> {
    find_raw_attribute(attributes, raw, name).map(|attr| attr.info.clone())
}

fn build_field(field_info: &FieldInfo, raw: &RawConstantPool) -> io::Result<Field> {
    let constant_value =
        find_attribute::<ConstantValue>(&field_info.attributes, raw, "ConstantValue")?
            .map(|attr| attr.value_index);
    let signature = find_attribute::<Signature>(&field_info.attributes, raw, "Signature")?
        .map(|attr| raw.text(attr.signature_index).clone());

    Ok(Field {
        name: field_info.name(raw).clone(),
        descriptor: FieldDescriptor::parse(field_info.descriptor(raw))?,
        access: field_info.access,
        byte_offset: Cell::new(0),
        constant_value,
        reflection_field: Cell::new(None),
        annotations: attribute_bytes(&field_info.attributes, raw, "RuntimeVisibleAnnotations"),
        signature,
    })
}

fn is_signature_polymorphic(class_name: &str, method: &MethodInfo) -> bool {
    matches!(class_name, "java/lang/invoke/MethodHandle" | "java/lang/invoke/VarHandle")
        && method.access.contains(MethodAccessFlags::NATIVE)
        && method.access.contains(MethodAccessFlags::VARARGS)
}

fn build_method(
    class_file: &ClassFile,
    method_info: &MethodInfo,
    pool: &ConstantPool,
    class: ClassId,
    index: u16,
) -> io::Result<Rc<Method>> {
    let raw = &class_file.constants;
    let name = method_info.name(raw).clone();
    let descriptor_text = method_info.descriptor(raw).clone();
    let descriptor = FieldDescriptor::parse_method(&descriptor_text)?;
    let is_static = method_info.access.contains(MethodAccessFlags::STATIC);

    let code = match method_info.code(raw)? {
        Some(code_attr) => {
            let decoded = decode_code(&code_attr.code.0, pool)?;

            let stack_map =
                find_attribute::<StackMapTable>(&code_attr.attributes, raw, "StackMapTable")?
                    .map(|table| table.frames)
                    .unwrap_or_default();

            let mut exception_table = Vec::with_capacity(code_attr.exception_table.len());
            let mut handler_insns = Vec::new();
            for entry in &code_attr.exception_table {
                let handler = ExceptionHandler {
                    start: decoded.index_of_pc(entry.start_pc)?,
                    end: if entry.end_pc as usize
                        == code_attr.code.0.len()
                    {
                        decoded.insns.len() as u32
                    } else {
                        decoded.index_of_pc(entry.end_pc)?
                    },
                    handler: decoded.index_of_pc(entry.handler_pc)?,
                    catch_type: entry.catch_type,
                };
                handler_insns.push(handler.handler);
                exception_table.push(handler);
            }

            let analysis = analyze_code(
                &decoded,
                pool,
                &descriptor,
                is_static,
                code_attr.max_stack,
                code_attr.max_locals,
                &stack_map,
                &handler_insns,
            )?;

            let line_numbers =
                find_attribute::<LineNumberTable>(&code_attr.attributes, raw, "LineNumberTable")?
                    .map(|table| table.entries)
                    .unwrap_or_default();

            let local_variables = find_attribute::<LocalVariableTable>(
                &code_attr.attributes,
                raw,
                "LocalVariableTable",
            )?
            .map(|table| {
                table
                    .entries
                    .iter()
                    .map(|v| LocalVariableInfo {
                        start_pc: v.start_pc,
                        length: v.length,
                        name: raw.text(v.name_index).clone(),
                        descriptor: raw.text(v.descriptor_index).clone(),
                        index: v.index,
                    })
                    .collect()
            })
            .unwrap_or_default();

            Some(Rc::new(CodeInfo {
                max_stack: code_attr.max_stack,
                max_locals: code_attr.max_locals,
                insns: decoded.insns,
                insn_pcs: decoded.pcs,
                table_switches: decoded.table_switches,
                lookup_switches: decoded.lookup_switches,
                exception_table,
                line_numbers,
                local_variables,
                analysis,
            }))
        }
        None => None,
    };

    let declared_exceptions =
        find_attribute::<Exceptions>(&method_info.attributes, raw, "Exceptions")?
            .map(|attr| {
                attr.exception_index_table
                    .iter()
                    .map(|x| raw.class_name(*x).clone())
                    .collect()
            })
            .unwrap_or_default();

    let parameter_names =
        find_attribute::<MethodParameters>(&method_info.attributes, raw, "MethodParameters")?
            .map(|attr| {
                attr.parameters
                    .iter()
                    .map(|p| {
                        let name = match p.name_index {
                            0 => None,
                            x => Some(raw.text(x).clone()),
                        };
                        (name, p.access_flags)
                    })
                    .collect()
            })
            .unwrap_or_default();

    let signature = find_attribute::<Signature>(&method_info.attributes, raw, "Signature")?
        .map(|attr| raw.text(attr.signature_index).clone());

    Ok(Rc::new(Method {
        is_ctor: name.as_ref() == "<init>",
        is_clinit: name.as_ref() == "<clinit>",
        is_signature_polymorphic: is_signature_polymorphic(class_file.name(), method_info),
        name,
        descriptor_text,
        descriptor,
        access: method_info.access,
        class,
        index,
        code,
        native: Cell::new(None),
        vtable_index: Cell::new(None),
        reflection_method: Cell::new(None),
        reflection_ctor: Cell::new(None),
        method_type_obj: Cell::new(None),
        annotations: attribute_bytes(&method_info.attributes, raw, "RuntimeVisibleAnnotations"),
        parameter_annotations: attribute_bytes(
            &method_info.attributes,
            raw,
            "RuntimeVisibleParameterAnnotations",
        ),
        annotation_default: attribute_bytes(&method_info.attributes, raw, "AnnotationDefault"),
        signature,
        parameter_names,
        declared_exceptions,
    }))
}

fn build_class_desc(
    _env: &JavaEnv,
    id: ClassId,
    class_file: &ClassFile,
    super_class: Option<ClassId>,
    interfaces: Vec<ClassId>,
) -> io::Result<ClassDesc> {
    let raw = &class_file.constants;
    let pool = build_runtime_pool(raw)?;

    let mut fields = Vec::with_capacity(class_file.fields.len());
    for field_info in &class_file.fields {
        fields.push(build_field(field_info, raw)?);
    }

    let mut methods = Vec::with_capacity(class_file.methods.len());
    for (index, method_info) in class_file.methods.iter().enumerate() {
        methods.push(build_method(class_file, method_info, &pool, id, index as u16)?);
    }

    let source_file = find_attribute::<SourceFile>(&class_file.attributes, raw, "SourceFile")?
        .map(|attr| raw.text(attr.sourcefile_index).clone());
    let signature = find_attribute::<Signature>(&class_file.attributes, raw, "Signature")?
        .map(|attr| raw.text(attr.signature_index).clone());
    let nest_host = find_attribute::<crate::class::attribute::NestHost>(
        &class_file.attributes,
        raw,
        "NestHost",
    )?
    .map(|attr| raw.class_name(attr.host_class_index).clone());

    let bootstrap_methods = class_file.bootstrap_methods()?.map(|x| x.methods).unwrap_or_default();

    Ok(ClassDesc {
        id,
        kind: ClassKind::Ordinary,
        name: class_file.name().clone(),
        access: class_file.access_flags,
        pool,
        super_class,
        interfaces,
        fields,
        methods,
        state: Cell::new(ClassState::Loaded),
        instance_bytes: Cell::new(0),
        static_data: Vec::new(),
        static_refs: Vec::new(),
        instance_refs: Vec::new(),
        vtable: Vec::new(),
        itables: Vec::new(),
        hierarchy: Vec::new(),
        mirror: Cell::new(None),
        cp_mirror: Cell::new(None),
        classloader_mirror: Cell::new(None),
        linkage_error: Cell::new(None),
        array_type: Cell::new(None),
        one_fewer_dim: None,
        base_component: None,
        dimensions: 0,
        primitive: None,
        source_file,
        bootstrap_methods,
        annotations: attribute_bytes(&class_file.attributes, raw, "RuntimeVisibleAnnotations"),
        signature,
        nest_host,
        attributes: class_file.attributes.clone(),
        module: None,
        indy_insns: Vec::new(),
        sigpoly_insns: Vec::new(),
    })
}

// Linking

/// Lay out fields, build dispatch tables and compute the hierarchy chain.
/// Idempotent; failure is sticky.
pub fn link_class(env: &mut JavaEnv, tid: u32, id: ClassId) -> VmResult<()> {
    match env.class(id).state.get() {
        ClassState::Loaded => {}
        ClassState::LinkageError => {
            return Err(raise_no_class_def_found(env, tid, &env.class(id).name.clone()))
        }
        _ => return Ok(()),
    }

    if let Some(super_class) = env.class(id).super_class {
        link_class(env, tid, super_class)?;
    }
    for interface in env.class(id).interfaces.clone() {
        link_class(env, tid, interface)?;
    }

    debug!("linking {}", env.class(id).name);

    // Hierarchy chain: root first, self last, giving O(1) subtype tests
    let hierarchy = match env.class(id).super_class {
        Some(super_class) => {
            let mut chain = env.class(super_class).hierarchy.clone();
            chain.push(id);
            chain
        }
        None => vec![id],
    };

    layout_fields(env, id);
    let vtable = build_vtable(env, id);
    let itables = build_itables(env, id);

    let class = env.class_mut(id);
    class.hierarchy = hierarchy;
    class.vtable = vtable;
    class.itables = itables;
    class.state.set(ClassState::Linked);
    Ok(())
}

/// Group fields by descending size class, then declaration order. Instance
/// fields start where the superclass's data ends; statics are packed into
/// the class's own static block.
fn layout_fields(env: &mut JavaEnv, id: ClassId) {
    let super_bytes = match env.class(id).super_class {
        Some(super_class) => env.class(super_class).instance_bytes.get(),
        None => 0,
    };

    let mut instance_offset = super_bytes as usize;
    let mut static_offset = 0usize;
    let mut instance_refs: Vec<u32> = match env.class(id).super_class {
        Some(super_class) => env.class(super_class).instance_refs.clone(),
        None => Vec::new(),
    };
    let mut static_refs = Vec::new();

    for size in [8usize, 4, 2, 1] {
        for field in &env.class(id).fields {
            let kind = field.type_kind();
            if kind.size_bytes() != size {
                continue;
            }

            let offset = if field.is_static() { &mut static_offset } else { &mut instance_offset };
            *offset = crate::util::align_up(*offset, size);
            field.byte_offset.set(*offset as u32);

            if kind == TypeKind::Reference {
                if field.is_static() {
                    static_refs.push(*offset as u32);
                } else {
                    instance_refs.push(*offset as u32);
                }
            }
            *offset += size;
        }
    }

    // java/lang/Class instances carry a hidden slot holding the mirrored
    // class id
    if env.class(id).name.as_ref() == "java/lang/Class" {
        instance_offset = crate::util::align_up(instance_offset, 8);
        env.well_known.class_vmdata_offset.set(Some(instance_offset as u32));
        instance_offset += 8;
    }

    let class = env.class_mut(id);
    class.instance_bytes.set(instance_offset as u32);
    class.static_data = vec![0u8; crate::util::align_up(static_offset.max(1), 8)];
    class.static_refs = static_refs;
    class.instance_refs = instance_refs;
}

/// Copy the superclass vtable and override by (name, descriptor).
fn build_vtable(env: &JavaEnv, id: ClassId) -> Vec<MethodId> {
    if env.class(id).is_interface() {
        return Vec::new();
    }

    let mut vtable = match env.class(id).super_class {
        Some(super_class) => env.class(super_class).vtable.clone(),
        None => Vec::new(),
    };

    for method in &env.class(id).methods {
        if method.is_static()
            || method.is_ctor
            || method.is_clinit
            || method.access.contains(MethodAccessFlags::PRIVATE)
        {
            continue;
        }

        let overridden = vtable.iter().position(|existing| {
            let existing = env.method(*existing);
            existing.name == method.name && existing.descriptor_text == method.descriptor_text
        });

        match overridden {
            Some(index) => {
                vtable[index] = method.id();
                method.vtable_index.set(Some(index as u16));
            }
            None => {
                method.vtable_index.set(Some(vtable.len() as u16));
                vtable.push(method.id());
            }
        }
    }

    vtable
}

/// One itable per implemented interface (direct or inherited). Each slot
/// holds the selected implementation, or the abstract sentinel the
/// interpreter reports as AbstractMethodError.
fn build_itables(env: &JavaEnv, id: ClassId) -> Vec<Itable> {
    let mut interface_set: Vec<ClassId> = Vec::new();

    let mut add_interface = |set: &mut Vec<ClassId>, interface: ClassId| {
        if !set.contains(&interface) {
            set.push(interface);
        }
    };

    if let Some(super_class) = env.class(id).super_class {
        for itable in &env.class(super_class).itables {
            add_interface(&mut interface_set, itable.interface);
        }
    }
    for interface in &env.class(id).interfaces {
        add_interface(&mut interface_set, *interface);
        for nested in &env.class(*interface).itables {
            add_interface(&mut interface_set, nested.interface);
        }
    }
    if env.class(id).is_interface() {
        // An interface's own methods are reachable through its itable too
        add_interface(&mut interface_set, id);
    }

    let mut itables = Vec::with_capacity(interface_set.len());
    for interface in interface_set {
        let interface_desc = env.class(interface);
        let mut methods = Vec::with_capacity(interface_desc.methods.len());

        for interface_method in &interface_desc.methods {
            if interface_method.is_static() || interface_method.is_clinit {
                methods.push(None);
                continue;
            }

            // Walk the implementing class and its superclasses for an
            // override, falling back to a default method on the interface
            let mut selected = None;
            let mut current = Some(id);
            while let Some(class) = current {
                if let Some(candidate) = env
                    .class(class)
                    .find_method(&interface_method.name, &interface_method.descriptor_text)
                {
                    if !candidate.is_abstract() {
                        selected = Some(candidate.id());
                    }
                    break;
                }
                current = env.class(class).super_class;
            }

            if selected.is_none() && !interface_method.is_abstract() {
                selected = Some(interface_method.id());
            }

            methods.push(selected);
        }

        itables.push(Itable { interface, methods });
    }

    itables
}

// Initialization (JLS §12.4.2)

/// Initialize a class before its first active use: superclass first, then
/// superinterfaces that declare concrete methods, then ConstantValue fields,
/// then `<clinit>`. A non-Error exception from `<clinit>` is wrapped in
/// ExceptionInInitializerError and the failure is sticky.
pub fn ensure_initialized(env: &mut JavaEnv, tid: u32, id: ClassId) -> VmResult<()> {
    match env.class(id).state.get() {
        ClassState::Initialized | ClassState::Initializing => return Ok(()),
        ClassState::LinkageError => {
            let name = env.class(id).name.clone();
            if let Some(error) = env.class(id).linkage_error.get() {
                return Err(raise_exception_object(env, tid, error));
            }
            return Err(raise_no_class_def_found(env, tid, &name));
        }
        ClassState::Loaded => link_class(env, tid, id)?,
        ClassState::Linked => {}
    }

    trace!("initializing {}", env.class(id).name);
    env.class(id).state.set(ClassState::Initializing);

    let mut failed = false;

    if let Some(super_class) = env.class(id).super_class {
        failed |= ensure_initialized(env, tid, super_class).is_err();
    }

    if !failed {
        for interface in env.class(id).interfaces.clone() {
            let has_concrete = env
                .class(interface)
                .methods
                .iter()
                .any(|m| !m.is_abstract() && !m.is_static() && !m.is_clinit);
            if has_concrete {
                failed |= ensure_initialized(env, tid, interface).is_err();
            }
        }
    }

    if !failed {
        failed |= initialize_constant_value_fields(env, tid, id).is_err();
    }

    if !failed {
        if let Some(clinit) = env.class(id).find_method("<clinit>", "()V").map(|m| m.id()) {
            match env.call_interpreter_synchronous(tid, clinit, &[]) {
                Ok(_) => {}
                Err(Raised) => {
                    let exception = env.threads[tid as usize]
                        .current_exception
                        .expect("raise without exception");
                    let exception_class = env.heap.class_of(exception);
                    if !env.is_error_class(exception_class) {
                        wrap_in_exception_in_initializer_error(env, tid);
                    }
                    failed = true;
                }
            }
        }
    }

    if failed {
        let error = env.threads[tid as usize].current_exception;
        env.class(id).linkage_error.set(error);
        env.class(id).state.set(ClassState::LinkageError);
        Err(Raised)
    } else {
        env.class(id).state.set(ClassState::Initialized);
        Ok(())
    }
}

/// Apply ConstantValue attributes to static final fields.
fn initialize_constant_value_fields(env: &mut JavaEnv, tid: u32, id: ClassId) -> VmResult<()> {
    for index in 0..env.class(id).fields.len() as u16 {
        let (cp_index, offset) = {
            let field = env.class(id).field(index);
            if !field.is_static() || !field.access.contains(crate::class::FieldAccessFlags::FINAL)
            {
                continue;
            }
            match field.constant_value {
                Some(cp_index) => (cp_index, field.byte_offset.get()),
                None => continue,
            }
        };

        enum ConstantInit {
            Value(JavaValue),
            Text(Rc<str>),
        }

        let constant = match env.class(id).pool.entry(cp_index) {
            CpEntry::Integer(x) => ConstantInit::Value(JavaValue::Int(*x)),
            CpEntry::Float(x) => ConstantInit::Value(JavaValue::Float(*x)),
            CpEntry::Long(x) => ConstantInit::Value(JavaValue::Long(*x)),
            CpEntry::Double(x) => ConstantInit::Value(JavaValue::Double(*x)),
            CpEntry::Str(info) => ConstantInit::Text(info.value.clone()),
            x => panic!("invalid ConstantValue entry {:?}", x),
        };
        let value = match constant {
            ConstantInit::Value(value) => value,
            ConstantInit::Text(text) => {
                JavaValue::Reference(Some(env.intern_string(tid, &text)?))
            }
        };

        // Narrow the pool's int to the field's actual kind on store
        let kind = env.class(id).field(index).type_kind();
        let value = match (value, kind) {
            (JavaValue::Int(x), TypeKind::Boolean) | (JavaValue::Int(x), TypeKind::Byte) => {
                JavaValue::Byte(x as i8)
            }
            (JavaValue::Int(x), TypeKind::Char) => JavaValue::Char(x as u16),
            (JavaValue::Int(x), TypeKind::Short) => JavaValue::Short(x as i16),
            (x, _) => x,
        };

        crate::jvm::write_static(&mut env.class_mut(id).static_data, offset as usize, value);
    }
    Ok(())
}

/// Wrap the in-flight exception in an ExceptionInInitializerError.
fn wrap_in_exception_in_initializer_error(env: &mut JavaEnv, tid: u32) {
    let cause = match env.threads[tid as usize].current_exception.take() {
        Some(cause) => cause,
        None => return,
    };

    let wrapper_class = match bootstrap_lookup_class(env, tid, "java/lang/ExceptionInInitializerError")
    {
        Ok(class) => class,
        Err(_) => {
            // Can't even load the wrapper; re-raise the original
            env.threads[tid as usize].current_exception = Some(cause);
            return;
        }
    };

    let handle = env.threads[tid as usize].handles.make(Some(cause));
    let wrapper = env.new_object(tid, wrapper_class);
    let cause = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);

    match wrapper {
        Ok(wrapper) => {
            for field_name in ["exception", "cause"] {
                if let Some((owner, index)) = env.field_lookup(wrapper_class, field_name) {
                    let offset = env.class(owner).field(index).byte_offset.get();
                    env.heap.set_field(
                        wrapper,
                        offset as usize,
                        JavaValue::Reference(Some(cause)),
                    );
                }
            }
            let _ = raise_exception_object(env, tid, wrapper);
        }
        Err(Raised) => {
            env.threads[tid as usize].current_exception = Some(cause);
        }
    }
}

// Symbolic resolution with sticky caching on the pool entries

/// Resolve a CONSTANT_Class entry of `pool_class`'s pool. The result (or the
/// error object) is cached on the entry; the two are mutually exclusive.
pub fn resolve_class_ref(
    env: &mut JavaEnv,
    tid: u32,
    pool_class: ClassId,
    cp: u16,
) -> VmResult<ClassId> {
    let (name, cached, error) = {
        let info = env.class(pool_class).pool.class_info(cp);
        (info.name.clone(), info.resolved.get(), info.error.get())
    };

    if let Some(class) = cached {
        return Ok(class);
    }
    if let Some(error) = error {
        return Err(raise_exception_object(env, tid, error));
    }

    match bootstrap_lookup_class(env, tid, &name) {
        Ok(class) => {
            env.class(pool_class).pool.class_info(cp).resolved.set(Some(class));
            Ok(class)
        }
        Err(Raised) => {
            let error = env.threads[tid as usize].current_exception;
            env.class(pool_class).pool.class_info(cp).error.set(error);
            Err(Raised)
        }
    }
}

/// Field resolution (JVMS §5.4.3.2): the class itself, its interfaces, then
/// superclasses, matching by name and descriptor.
pub fn resolve_field(env: &mut JavaEnv, tid: u32, pool_class: ClassId, cp: u16) -> VmResult<FieldId> {
    let (class_index, name, descriptor, cached) = {
        let info = env.class(pool_class).pool.field_ref(cp);
        (info.class_index, info.name.clone(), info.descriptor.clone(), info.resolved.get())
    };
    if let Some(resolved) = cached {
        return Ok(resolved);
    }

    let holder = resolve_class_ref(env, tid, pool_class, class_index)?;
    link_class(env, tid, holder)?;

    let mut current = Some(holder);
    let mut found = None;
    while let Some(class) = current {
        let desc = env.class(class);
        if let Some((index, field)) = desc.find_field(&name) {
            if field.descriptor == descriptor {
                found = Some(FieldId { class, index });
                break;
            }
        }
        for itable in &desc.itables {
            if let Some((index, field)) = env.class(itable.interface).find_field(&name) {
                if field.descriptor == descriptor {
                    found = Some(FieldId { class: itable.interface, index });
                    break;
                }
            }
        }
        if found.is_some() {
            break;
        }
        current = desc.super_class;
    }

    match found {
        Some(resolved) => {
            env.class(pool_class).pool.field_ref(cp).resolved.set(Some(resolved));
            Ok(resolved)
        }
        None => {
            let holder_name = env.class(holder).name.clone();
            Err(raise_incompatible_class_change(
                env,
                tid,
                &format!("no field {}.{} of type {}", holder_name, name, descriptor),
            ))
        }
    }
}

/// Method resolution (JVMS §5.4.3.3/4) with sticky caching.
pub fn resolve_method(
    env: &mut JavaEnv,
    tid: u32,
    pool_class: ClassId,
    cp: u16,
) -> VmResult<MethodId> {
    let (class_index, name, descriptor, cached) = {
        let info = env.class(pool_class).pool.method_ref(cp);
        (info.class_index, info.name.clone(), info.descriptor.clone(), info.resolved.get())
    };
    if let Some(resolved) = cached {
        return Ok(resolved);
    }

    let holder = resolve_class_ref(env, tid, pool_class, class_index)?;
    link_class(env, tid, holder)?;

    match env.method_lookup(holder, &name, &descriptor, true, true) {
        Some(resolved) => {
            env.class(pool_class).pool.method_ref(cp).resolved.set(Some(resolved));
            Ok(resolved)
        }
        None => {
            let holder_name = env.class(holder).name.clone();
            Err(raise_incompatible_class_change(
                env,
                tid,
                &format!("no method {}.{}{}", holder_name, name, descriptor),
            ))
        }
    }
}

// Array and primitive class synthesis

/// The array class with `component` elements, synthesized on first use.
/// Array classes share Object as superclass and need no initialization.
pub fn array_class_of(env: &mut JavaEnv, tid: u32, component: ClassId) -> VmResult<ClassId> {
    if let Some(existing) = env.class(component).array_type.get() {
        return Ok(existing);
    }

    let component_desc = env.class(component);
    let name: Rc<str> = match component_desc.kind {
        ClassKind::Primitive => Rc::from(format!(
            "[{}",
            component_desc.primitive.expect("primitive class without kind").descriptor_char()
        )),
        ClassKind::OrdinaryArray | ClassKind::PrimitiveArray => {
            Rc::from(format!("[{}", component_desc.name))
        }
        ClassKind::Ordinary => Rc::from(format!("[L{};", component_desc.name)),
    };

    let kind = match component_desc.kind {
        ClassKind::Primitive | ClassKind::PrimitiveArray => ClassKind::PrimitiveArray,
        _ => ClassKind::OrdinaryArray,
    };
    let dimensions = component_desc.dimensions + 1;
    let primitive = component_desc.primitive;
    let base_component = match component_desc.kind {
        ClassKind::OrdinaryArray | ClassKind::PrimitiveArray => component_desc.base_component,
        _ => Some(component),
    };

    // Arrays inherit Object's dispatch tables so toString and friends work
    let object = match env.well_known.object.get() {
        Some(object) => object,
        None => {
            let object = bootstrap_lookup_class(env, tid, "java/lang/Object")?;
            env.well_known.object.set(Some(object));
            object
        }
    };
    link_class(env, tid, object)?;
    let (object_vtable, object_hierarchy) = {
        let object_desc = env.class(object);
        (object_desc.vtable.clone(), object_desc.hierarchy.clone())
    };

    // Every array class shares Cloneable and Serializable as its
    // superinterfaces, resolved through the same pipeline as a declared
    // implements clause
    let cloneable = bootstrap_lookup_class(env, tid, "java/lang/Cloneable")?;
    link_class(env, tid, cloneable)?;
    let serializable = bootstrap_lookup_class(env, tid, "java/io/Serializable")?;
    link_class(env, tid, serializable)?;

    let id = ClassId(env.classes.len() as u32);
    let mut hierarchy = object_hierarchy;
    hierarchy.push(id);

    let desc = ClassDesc {
        id,
        kind,
        name: name.clone(),
        access: ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL,
        pool: ConstantPool::default(),
        super_class: Some(object),
        interfaces: vec![cloneable, serializable],
        fields: Vec::new(),
        methods: Vec::new(),
        state: Cell::new(ClassState::Initialized),
        instance_bytes: Cell::new(0),
        static_data: Vec::new(),
        static_refs: Vec::new(),
        instance_refs: Vec::new(),
        vtable: object_vtable,
        itables: Vec::new(),
        hierarchy,
        mirror: Cell::new(None),
        cp_mirror: Cell::new(None),
        classloader_mirror: Cell::new(None),
        linkage_error: Cell::new(None),
        array_type: Cell::new(None),
        one_fewer_dim: Some(component),
        base_component,
        dimensions,
        primitive,
        source_file: None,
        bootstrap_methods: Vec::new(),
        annotations: None,
        signature: None,
        nest_host: None,
        attributes: Vec::new(),
        module: None,
        indy_insns: Vec::new(),
        sigpoly_insns: Vec::new(),
    };

    env.classes.push(desc);
    env.class_table.insert((name, 0), id);

    // Itables come from the interface list exactly as during ordinary
    // linking; both marker interfaces contribute empty method slots
    let itables = build_itables(env, id);
    env.class_mut(id).itables = itables;

    env.class(component).array_type.set(Some(id));
    Ok(id)
}

/// The synthetic class descriptor representing a primitive type.
pub fn primitive_class(env: &mut JavaEnv, kind: TypeKind) -> ClassId {
    let index = primitive_index(kind);
    if let Some(existing) = env.primitives[index].get() {
        return existing;
    }

    let id = ClassId(env.classes.len() as u32);
    let desc = ClassDesc {
        id,
        kind: ClassKind::Primitive,
        name: Rc::from(kind.primitive_name()),
        access: ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL | ClassAccessFlags::ABSTRACT,
        pool: ConstantPool::default(),
        super_class: None,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        state: Cell::new(ClassState::Initialized),
        instance_bytes: Cell::new(0),
        static_data: Vec::new(),
        static_refs: Vec::new(),
        instance_refs: Vec::new(),
        vtable: Vec::new(),
        itables: Vec::new(),
        hierarchy: vec![id],
        mirror: Cell::new(None),
        cp_mirror: Cell::new(None),
        classloader_mirror: Cell::new(None),
        linkage_error: Cell::new(None),
        array_type: Cell::new(None),
        one_fewer_dim: None,
        base_component: None,
        dimensions: 0,
        primitive: Some(kind),
        source_file: None,
        bootstrap_methods: Vec::new(),
        annotations: None,
        signature: None,
        nest_host: None,
        attributes: Vec::new(),
        module: None,
        indy_insns: Vec::new(),
        sigpoly_insns: Vec::new(),
    };

    env.classes.push(desc);
    env.primitives[index].set(Some(id));
    id
}

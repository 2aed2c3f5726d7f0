use std::rc::Rc;

use crate::jvm::class::{ClassId, CpEntry, MethodId};
use crate::jvm::exceptions::{raise_vm_exception, raise_wrong_method_type};
use crate::jvm::internals::reflection::{
    get_class_mirror, get_field_mirror, get_method_mirror, read_reference_field, unmirror_class,
};
use crate::jvm::link::{bootstrap_lookup_class, ensure_initialized, link_class, resolve_class_ref};
use crate::jvm::mem::{FieldDescriptor, JavaValue, ObjRef, TypeKind};
use crate::jvm::{JavaEnv, VmResult};

/// Call a static Java method synchronously by symbolic name. Class loading
/// and initialization can collect the heap, so reference arguments are
/// rooted through handles and re-read before the invocation.
fn call_static(
    env: &mut JavaEnv,
    tid: u32,
    class_name: &str,
    name: &str,
    descriptor: &str,
    args: &[JavaValue],
) -> VmResult<Option<JavaValue>> {
    let roots: Vec<Option<crate::jvm::mem::Handle>> = args
        .iter()
        .map(|arg| match arg {
            JavaValue::Reference(Some(obj)) => {
                Some(env.threads[tid as usize].handles.make(Some(*obj)))
            }
            _ => None,
        })
        .collect();

    let prepared = (|| {
        let class = bootstrap_lookup_class(env, tid, class_name)?;
        ensure_initialized(env, tid, class)?;
        match env.method_lookup(class, name, descriptor, true, false) {
            Some(method) => Ok(method),
            None => Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some(&format!("{}.{}{}", class_name, name, descriptor)),
            )),
        }
    })();

    let fresh: Vec<JavaValue> = args
        .iter()
        .zip(&roots)
        .map(|(arg, root)| match root {
            Some(root) => JavaValue::Reference(env.threads[tid as usize].handles.get(*root)),
            None => *arg,
        })
        .collect();
    for root in roots.into_iter().flatten() {
        env.threads[tid as usize].handles.drop_handle(root);
    }

    env.call_interpreter_synchronous(tid, prepared?, &fresh)
}

/// Call an instance method on `receiver` with virtual dispatch.
fn call_virtual(
    env: &mut JavaEnv,
    tid: u32,
    receiver: ObjRef,
    name: &str,
    descriptor: &str,
    args: &[JavaValue],
) -> VmResult<Option<JavaValue>> {
    let class = env.heap.class_of(receiver);
    let method = match env.method_lookup(class, name, descriptor, true, true) {
        Some(method) => method,
        None => {
            let class_name = env.class(class).name.clone();
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some(&format!("{}.{}{}", class_name, name, descriptor)),
            ))
        }
    };

    let mut full_args = Vec::with_capacity(args.len() + 1);
    full_args.push(JavaValue::Reference(Some(receiver)));
    full_args.extend_from_slice(args);
    env.call_interpreter_synchronous(tid, method, &full_args)
}

/// Box a primitive through the wrapper's valueOf.
pub fn box_value(env: &mut JavaEnv, tid: u32, value: JavaValue) -> VmResult<Option<ObjRef>> {
    let (class_name, descriptor) = match value {
        JavaValue::Reference(obj) => return Ok(obj),
        JavaValue::Byte(_) => ("java/lang/Byte", "(B)Ljava/lang/Byte;"),
        JavaValue::Char(_) => ("java/lang/Character", "(C)Ljava/lang/Character;"),
        JavaValue::Short(_) => ("java/lang/Short", "(S)Ljava/lang/Short;"),
        JavaValue::Int(_) => ("java/lang/Integer", "(I)Ljava/lang/Integer;"),
        JavaValue::Long(_) => ("java/lang/Long", "(J)Ljava/lang/Long;"),
        JavaValue::Float(_) => ("java/lang/Float", "(F)Ljava/lang/Float;"),
        JavaValue::Double(_) => ("java/lang/Double", "(D)Ljava/lang/Double;"),
    };

    match call_static(env, tid, class_name, "valueOf", descriptor, &[value])? {
        Some(JavaValue::Reference(obj)) => Ok(obj),
        _ => Ok(None),
    }
}

/// Resolve a MethodType object for a method descriptor string by calling
/// `MethodType.makeImpl(rtype, ptypes, true)`.
///
/// The parameter array is allocated first and rooted through a handle;
/// mirrors are stored as they are created, so collections triggered while
/// later mirrors load keep the earlier elements current.
pub fn resolve_method_type(env: &mut JavaEnv, tid: u32, descriptor: &str) -> VmResult<ObjRef> {
    let parsed = FieldDescriptor::parse_method(descriptor)
        .expect("descriptor validated before method type resolution");

    let class_array_class = bootstrap_lookup_class(env, tid, "[Ljava/lang/Class;")?;
    let ptypes = env.new_array(tid, class_array_class, parsed.args.len() as i32)?;
    let ptypes_root = env.threads[tid as usize].handles.make(Some(ptypes));

    let result = (|| {
        for (index, arg) in parsed.args.iter().enumerate() {
            let mirror = class_mirror_for_type(env, tid, arg)?;
            let ptypes = env.threads[tid as usize].handles.get(ptypes_root).unwrap();
            env.heap.set_element(
                ptypes,
                TypeKind::Reference,
                index,
                JavaValue::Reference(Some(mirror)),
            );
        }

        let rtype = class_mirror_for_type(env, tid, &parsed.returns)?;
        let ptypes = env.threads[tid as usize].handles.get(ptypes_root).unwrap();
        call_static(
            env,
            tid,
            "java/lang/invoke/MethodType",
            "makeImpl",
            "(Ljava/lang/Class;[Ljava/lang/Class;Z)Ljava/lang/invoke/MethodType;",
            &[
                JavaValue::Reference(Some(rtype)),
                JavaValue::Reference(Some(ptypes)),
                JavaValue::Byte(1),
            ],
        )
    })();
    env.threads[tid as usize].handles.drop_handle(ptypes_root);

    match result? {
        Some(JavaValue::Reference(Some(method_type))) => Ok(method_type),
        _ => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/InternalError",
            Some("MethodType.makeImpl returned null"),
        )),
    }
}

fn class_mirror_for_type(
    env: &mut JavaEnv,
    tid: u32,
    descriptor: &FieldDescriptor,
) -> VmResult<ObjRef> {
    let class = match descriptor {
        FieldDescriptor::Object(name) => bootstrap_lookup_class(env, tid, name)?,
        FieldDescriptor::Array(_) => bootstrap_lookup_class(env, tid, &descriptor.to_string())?,
        FieldDescriptor::Void => {
            // `void.class`: represented by the synthetic primitive class for
            // booleans' sibling; use the Void.TYPE mirror instead
            let void_class = bootstrap_lookup_class(env, tid, "java/lang/Void")?;
            ensure_initialized(env, tid, void_class)?;
            if let Some((owner, index)) = env.field_lookup(void_class, "TYPE") {
                let field = env.class(owner).field(index);
                if let JavaValue::Reference(Some(mirror)) = env.static_field_value(owner, field) {
                    return Ok(mirror);
                }
            }
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/InternalError",
                Some("Void.TYPE unavailable"),
            ));
        }
        primitive => crate::jvm::link::primitive_class(env, primitive.type_kind()),
    };
    get_class_mirror(env, tid, class)
}

/// Resolve a CONSTANT_MethodHandle entry: resolve and initialize the
/// referenced member's class, wrap the member in a MemberName, and produce a
/// DirectMethodHandle (with varargs adjustment where the target demands it).
pub fn resolve_method_handle(
    env: &mut JavaEnv,
    tid: u32,
    pool_class: ClassId,
    cp: u16,
) -> VmResult<ObjRef> {
    let (kind, reference_index) = match env.class(pool_class).pool.entry(cp) {
        CpEntry::MethodHandle(info) => (info.kind, info.reference_index),
        x => panic!("constant {} is not a method handle: {:?}", cp, x),
    };

    let member_name = match kind {
        // Field kinds: getField, getStatic, putField, putStatic
        1..=4 => {
            let field_id = crate::jvm::link::resolve_field(env, tid, pool_class, reference_index)?;
            ensure_initialized(env, tid, field_id.class)?;
            let field_mirror = get_field_mirror(env, tid, field_id.class, field_id.index)?;
            let is_setter = kind == 3 || kind == 4;
            new_member_name_for_field(env, tid, field_mirror, is_setter)?
        }
        // Method kinds
        5..=9 => {
            let method_id =
                crate::jvm::link::resolve_method(env, tid, pool_class, reference_index)?;
            ensure_initialized(env, tid, method_id.class)?;
            let method_mirror = get_method_mirror(env, tid, method_id.class, method_id.index)?;
            let ctor = env.method(method_id).is_ctor;
            new_member_name(env, tid, method_mirror, ctor)?
        }
        x => panic!("invalid method handle kind {}", x),
    };

    // Cache the resolved MethodType alongside
    if let CpEntry::MethodHandle(info) = env.class(pool_class).pool.entry(cp) {
        if info.resolved_mt.get().is_none() {
            let descriptor = member_descriptor_text(env, tid, pool_class, reference_index);
            if let Some(descriptor) = descriptor {
                if descriptor.starts_with('(') {
                    let method_type = resolve_method_type(env, tid, &descriptor)?;
                    if let CpEntry::MethodHandle(info) = env.class(pool_class).pool.entry(cp) {
                        info.resolved_mt.set(Some(method_type));
                    }
                }
            }
        }
    }

    let handle = match call_static(
        env,
        tid,
        "java/lang/invoke/DirectMethodHandle",
        "make",
        "(Ljava/lang/invoke/MemberName;)Ljava/lang/invoke/DirectMethodHandle;",
        &[JavaValue::Reference(Some(member_name))],
    )? {
        Some(JavaValue::Reference(Some(handle))) => handle,
        _ => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/InternalError",
                Some("DirectMethodHandle.make returned null"),
            ))
        }
    };

    // Varargs targets collect their trailing arguments
    let varargs = {
        let member_class = env.heap.class_of(member_name);
        let _ = member_class;
        is_member_varargs(env, tid, pool_class, reference_index)
    };
    if varargs {
        match call_virtual(
            env,
            tid,
            handle,
            "withVarargs",
            "(Z)Ljava/lang/invoke/MethodHandle;",
            &[JavaValue::Byte(1)],
        )? {
            Some(JavaValue::Reference(Some(adjusted))) => return Ok(adjusted),
            _ => return Ok(handle),
        }
    }

    Ok(handle)
}

fn member_descriptor_text(
    env: &JavaEnv,
    _tid: u32,
    pool_class: ClassId,
    reference_index: u16,
) -> Option<Rc<str>> {
    match env.class(pool_class).pool.entry(reference_index) {
        CpEntry::MethodRef(info) => Some(info.descriptor.clone()),
        _ => None,
    }
}

fn is_member_varargs(
    env: &JavaEnv,
    _tid: u32,
    pool_class: ClassId,
    reference_index: u16,
) -> bool {
    if let CpEntry::MethodRef(info) = env.class(pool_class).pool.entry(reference_index) {
        if let Some(method_id) = info.resolved.get() {
            return env
                .method(method_id)
                .access
                .contains(crate::class::MethodAccessFlags::VARARGS);
        }
    }
    false
}

fn new_member_name(
    env: &mut JavaEnv,
    tid: u32,
    method_mirror: ObjRef,
    ctor: bool,
) -> VmResult<ObjRef> {
    let member_class = bootstrap_lookup_class(env, tid, "java/lang/invoke/MemberName")?;
    ensure_initialized(env, tid, member_class)?;

    let descriptor = if ctor {
        "(Ljava/lang/reflect/Constructor;)V"
    } else {
        "(Ljava/lang/reflect/Method;)V"
    };
    let init = match env.method_lookup(member_class, "<init>", descriptor, false, false) {
        Some(method) => method,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some("MemberName constructor"),
            ))
        }
    };

    let handle = env.threads[tid as usize].handles.make(Some(method_mirror));
    let member = env.new_object(tid, member_class);
    let method_mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    let member = member?;

    env.call_interpreter_synchronous(
        tid,
        init,
        &[
            JavaValue::Reference(Some(member)),
            JavaValue::Reference(Some(method_mirror)),
        ],
    )?;
    Ok(member)
}

fn new_member_name_for_field(
    env: &mut JavaEnv,
    tid: u32,
    field_mirror: ObjRef,
    is_setter: bool,
) -> VmResult<ObjRef> {
    let member_class = bootstrap_lookup_class(env, tid, "java/lang/invoke/MemberName")?;
    ensure_initialized(env, tid, member_class)?;

    let init = match env.method_lookup(
        member_class,
        "<init>",
        "(Ljava/lang/reflect/Field;Z)V",
        false,
        false,
    ) {
        Some(method) => method,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some("MemberName field constructor"),
            ))
        }
    };

    let handle = env.threads[tid as usize].handles.make(Some(field_mirror));
    let member = env.new_object(tid, member_class);
    let field_mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    let member = member?;

    env.call_interpreter_synchronous(
        tid,
        init,
        &[
            JavaValue::Reference(Some(member)),
            JavaValue::Reference(Some(field_mirror)),
            JavaValue::Byte(is_setter as i8),
        ],
    )?;
    Ok(member)
}

/// Resolve an invokedynamic call site: run the bootstrap method with
/// (Lookup, name, MethodType, ...static args) through
/// `MethodHandle.invokeWithArguments` and cache the resulting CallSite on
/// the instruction.
pub fn indy_resolve(env: &mut JavaEnv, tid: u32, pool_class: ClassId, cp: u16) -> VmResult<ObjRef> {
    let (bootstrap_index, site_name, site_descriptor) = {
        let info = env.class(pool_class).pool.indy_info(cp);
        (info.bootstrap_index, info.name.clone(), info.descriptor.clone())
    };

    let bootstrap = env.class(pool_class).bootstrap_methods[bootstrap_index as usize].clone();

    let bootstrap_handle = resolve_method_handle(env, tid, pool_class, bootstrap.method_ref)?;
    let handle_root = env.threads[tid as usize].handles.make(Some(bootstrap_handle));

    // Assemble [lookup, name, type, ...converted static args]. The rooted
    // array keeps every stored element current across collections triggered
    // while later arguments resolve.
    let result = (|| {
        let object_array_class = bootstrap_lookup_class(env, tid, "[Ljava/lang/Object;")?;
        let array = env.new_array(
            tid,
            object_array_class,
            3 + bootstrap.arguments.len() as i32,
        )?;
        let array_root = env.threads[tid as usize].handles.make(Some(array));

        let filled: VmResult<()> = (|| {
            let mut store = |env: &mut JavaEnv, index: usize, value: Option<ObjRef>| {
                let array = env.threads[tid as usize].handles.get(array_root).unwrap();
                env.heap
                    .set_element(array, TypeKind::Reference, index, JavaValue::Reference(value));
            };

            let lookup = impl_lookup(env, tid)?;
            store(env, 0, Some(lookup));
            let name = env.intern_string(tid, &site_name)?;
            store(env, 1, Some(name));
            let site_type = resolve_method_type(env, tid, &site_descriptor)?;
            store(env, 2, Some(site_type));
            if env.class(pool_class).pool.indy_info(cp).resolved_mt.get().is_none() {
                env.class(pool_class).pool.indy_info(cp).resolved_mt.set(Some(site_type));
            }

            for (index, static_arg) in bootstrap.arguments.iter().enumerate() {
                let converted = resolve_bootstrap_argument(env, tid, pool_class, *static_arg)?;
                store(env, 3 + index, converted);
            }
            Ok(())
        })();

        let array = env.threads[tid as usize].handles.get(array_root).unwrap();
        env.threads[tid as usize].handles.drop_handle(array_root);
        filled?;

        let bootstrap_handle = env.threads[tid as usize].handles.get(handle_root).unwrap();
        call_virtual(
            env,
            tid,
            bootstrap_handle,
            "invokeWithArguments",
            "([Ljava/lang/Object;)Ljava/lang/Object;",
            &[JavaValue::Reference(Some(array))],
        )
    })();
    env.threads[tid as usize].handles.drop_handle(handle_root);

    match result? {
        Some(JavaValue::Reference(Some(call_site))) => Ok(call_site),
        _ => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/BootstrapMethodError",
            Some("bootstrap method returned no call site"),
        )),
    }
}

/// A CONSTANT_Dynamic value, computed by its bootstrap method.
pub fn resolve_dynamic_constant(
    env: &mut JavaEnv,
    tid: u32,
    pool_class: ClassId,
    cp: u16,
) -> VmResult<JavaValue> {
    let (bootstrap_index, name, descriptor) = {
        let info = env.class(pool_class).pool.indy_info(cp);
        (info.bootstrap_index, info.name.clone(), info.descriptor.clone())
    };
    let bootstrap = env.class(pool_class).bootstrap_methods[bootstrap_index as usize].clone();
    let field_type = FieldDescriptor::parse(&descriptor).expect("descriptor validated at parse");

    let bootstrap_handle = resolve_method_handle(env, tid, pool_class, bootstrap.method_ref)?;
    let handle_root = env.threads[tid as usize].handles.make(Some(bootstrap_handle));

    let result = (|| {
        let object_array_class = bootstrap_lookup_class(env, tid, "[Ljava/lang/Object;")?;
        let array = env.new_array(
            tid,
            object_array_class,
            3 + bootstrap.arguments.len() as i32,
        )?;
        let array_root = env.threads[tid as usize].handles.make(Some(array));

        let filled: VmResult<()> = (|| {
            let mut store = |env: &mut JavaEnv, index: usize, value: Option<ObjRef>| {
                let array = env.threads[tid as usize].handles.get(array_root).unwrap();
                env.heap
                    .set_element(array, TypeKind::Reference, index, JavaValue::Reference(value));
            };

            let lookup = impl_lookup(env, tid)?;
            store(env, 0, Some(lookup));
            let name = env.intern_string(tid, &name)?;
            store(env, 1, Some(name));
            let type_mirror = class_mirror_for_type(env, tid, &field_type)?;
            store(env, 2, Some(type_mirror));

            for (index, static_arg) in bootstrap.arguments.iter().enumerate() {
                let converted = resolve_bootstrap_argument(env, tid, pool_class, *static_arg)?;
                store(env, 3 + index, converted);
            }
            Ok(())
        })();

        let array = env.threads[tid as usize].handles.get(array_root).unwrap();
        env.threads[tid as usize].handles.drop_handle(array_root);
        filled?;

        let bootstrap_handle = env.threads[tid as usize].handles.get(handle_root).unwrap();
        call_virtual(
            env,
            tid,
            bootstrap_handle,
            "invokeWithArguments",
            "([Ljava/lang/Object;)Ljava/lang/Object;",
            &[JavaValue::Reference(Some(array))],
        )
    })();
    env.threads[tid as usize].handles.drop_handle(handle_root);

    match result? {
        Some(value) => unbox_to(env, tid, value, &field_type),
        None => Ok(JavaValue::NULL),
    }
}

fn unbox_to(
    env: &mut JavaEnv,
    tid: u32,
    value: JavaValue,
    target: &FieldDescriptor,
) -> VmResult<JavaValue> {
    if target.is_reference() {
        return Ok(value);
    }

    let obj = match value {
        JavaValue::Reference(Some(obj)) => obj,
        x => return Ok(x),
    };

    let (name, descriptor, kind) = match target.type_kind() {
        TypeKind::Boolean => ("booleanValue", "()Z", TypeKind::Boolean),
        TypeKind::Byte => ("byteValue", "()B", TypeKind::Byte),
        TypeKind::Char => ("charValue", "()C", TypeKind::Char),
        TypeKind::Short => ("shortValue", "()S", TypeKind::Short),
        TypeKind::Int => ("intValue", "()I", TypeKind::Int),
        TypeKind::Long => ("longValue", "()J", TypeKind::Long),
        TypeKind::Float => ("floatValue", "()F", TypeKind::Float),
        TypeKind::Double => ("doubleValue", "()D", TypeKind::Double),
        TypeKind::Reference => unreachable!(),
    };
    let _ = kind;

    match call_virtual(env, tid, obj, name, descriptor, &[])? {
        Some(value) => Ok(value),
        None => Ok(JavaValue::NULL),
    }
}

/// Trusted lookup used for bootstrap methods.
fn impl_lookup(env: &mut JavaEnv, tid: u32) -> VmResult<ObjRef> {
    let lookup_class = bootstrap_lookup_class(env, tid, "java/lang/invoke/MethodHandles$Lookup")?;
    ensure_initialized(env, tid, lookup_class)?;

    if let Some((owner, index)) = env.field_lookup(lookup_class, "IMPL_LOOKUP") {
        let field = env.class(owner).field(index);
        if let JavaValue::Reference(Some(lookup)) = env.static_field_value(owner, field) {
            return Ok(lookup);
        }
    }

    Err(raise_vm_exception(
        env,
        tid,
        "java/lang/InternalError",
        Some("MethodHandles$Lookup.IMPL_LOOKUP unavailable"),
    ))
}

/// Convert one static bootstrap argument to its boxed object form.
fn resolve_bootstrap_argument(
    env: &mut JavaEnv,
    tid: u32,
    pool_class: ClassId,
    cp: u16,
) -> VmResult<Option<ObjRef>> {
    enum Arg {
        Value(JavaValue),
        Str(Rc<str>),
        Class,
        MethodType(Rc<str>),
        MethodHandle,
    }

    let arg = match env.class(pool_class).pool.entry(cp) {
        CpEntry::Integer(x) => Arg::Value(JavaValue::Int(*x)),
        CpEntry::Float(x) => Arg::Value(JavaValue::Float(*x)),
        CpEntry::Long(x) => Arg::Value(JavaValue::Long(*x)),
        CpEntry::Double(x) => Arg::Value(JavaValue::Double(*x)),
        CpEntry::Str(info) => Arg::Str(info.value.clone()),
        CpEntry::Class(_) => Arg::Class,
        CpEntry::MethodType(info) => Arg::MethodType(info.descriptor.clone()),
        CpEntry::MethodHandle(_) => Arg::MethodHandle,
        x => panic!("invalid bootstrap argument {:?}", x),
    };

    Ok(match arg {
        Arg::Value(value) => box_value(env, tid, value)?,
        Arg::Str(text) => Some(env.intern_string(tid, &text)?),
        Arg::Class => {
            let class = resolve_class_ref(env, tid, pool_class, cp)?;
            Some(get_class_mirror(env, tid, class)?)
        }
        Arg::MethodType(descriptor) => Some(resolve_method_type(env, tid, &descriptor)?),
        Arg::MethodHandle => Some(resolve_method_handle(env, tid, pool_class, cp)?),
    })
}

/// CallSite.target.
pub fn call_site_target(env: &mut JavaEnv, tid: u32, call_site: ObjRef) -> VmResult<ObjRef> {
    match read_reference_field(env, call_site, "target") {
        Some(target) => Ok(target),
        None => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/BootstrapMethodError",
            Some("CallSite has no target"),
        )),
    }
}

/// Check (invokeExact) or adapt (invoke) the handle against the call-site
/// MethodType.
pub fn prepare_handle(
    env: &mut JavaEnv,
    tid: u32,
    handle: ObjRef,
    site_type: ObjRef,
    exact: bool,
) -> VmResult<ObjRef> {
    let handle_type = read_reference_field(env, handle, "type");
    let compatible = match handle_type {
        Some(handle_type) => method_types_equal(env, handle_type, site_type),
        None => false,
    };

    if compatible {
        return Ok(handle);
    }

    if exact {
        return Err(raise_wrong_method_type(
            env,
            tid,
            "handle type does not match invokeExact call site",
        ));
    }

    // invoke: adapt via asType
    match call_virtual(
        env,
        tid,
        handle,
        "asType",
        "(Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;",
        &[JavaValue::Reference(Some(site_type))],
    )? {
        Some(JavaValue::Reference(Some(adapted))) => Ok(adapted),
        _ => Err(raise_wrong_method_type(env, tid, "asType failed")),
    }
}

/// Structural equality of MethodType objects: parameter and return class
/// mirrors are canonical per class, so slot-wise identity suffices.
pub fn method_types_equal(env: &JavaEnv, a: ObjRef, b: ObjRef) -> bool {
    if a == b {
        return true;
    }

    let rtype_a = read_reference_field(env, a, "rtype");
    let rtype_b = read_reference_field(env, b, "rtype");
    if rtype_a != rtype_b {
        return false;
    }

    let ptypes_a = read_reference_field(env, a, "ptypes");
    let ptypes_b = read_reference_field(env, b, "ptypes");
    match (ptypes_a, ptypes_b) {
        (Some(pa), Some(pb)) => {
            let len_a = env.heap.array_length(pa);
            if len_a != env.heap.array_length(pb) {
                return false;
            }
            for index in 0..len_a as usize {
                let element_a = env.heap.get_element(pa, TypeKind::Reference, index);
                let element_b = env.heap.get_element(pb, TypeKind::Reference, index);
                if element_a != element_b {
                    return false;
                }
            }
            true
        }
        (None, None) => true,
        _ => false,
    }
}

/// The direct invocation target behind a handle: its MemberName's class,
/// name and type. The bool reports whether the handle itself is consumed
/// (true for direct handles).
pub fn direct_target(env: &mut JavaEnv, tid: u32, handle: ObjRef) -> VmResult<(MethodId, bool)> {
    let member = match read_reference_field(env, handle, "member") {
        Some(member) => member,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/InternalError",
                Some("only direct method handles can be invoked by this VM"),
            ))
        }
    };

    let clazz = read_reference_field(env, member, "clazz")
        .and_then(|mirror| unmirror_class(env, mirror));
    let class = match clazz {
        Some(class) => class,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/InternalError",
                Some("MemberName has no class"),
            ))
        }
    };
    link_class(env, tid, class)?;

    let name = read_reference_field(env, member, "name")
        .and_then(|name| env.read_string(name))
        .unwrap_or_default();

    let descriptor = match read_reference_field(env, member, "type") {
        Some(type_obj) => method_type_descriptor(env, type_obj),
        None => None,
    };
    let descriptor = match descriptor {
        Some(descriptor) => descriptor,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/InternalError",
                Some("MemberName has no usable type"),
            ))
        }
    };

    match env.method_lookup(class, &name, &descriptor, true, true) {
        Some(target) => Ok((target, true)),
        None => {
            let class_name = env.class(class).name.clone();
            Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some(&format!("{}.{}{}", class_name, name, descriptor)),
            ))
        }
    }
}

/// A bound receiver captured by an adapted handle (Species_L style).
pub fn bound_receiver(env: &mut JavaEnv, _tid: u32, handle: ObjRef) -> VmResult<Option<ObjRef>> {
    Ok(read_reference_field(env, handle, "argL0"))
}

/// Reconstruct a descriptor string from a MethodType object (or accept a
/// String type directly).
fn method_type_descriptor(env: &JavaEnv, type_obj: ObjRef) -> Option<String> {
    // MemberName.type may be a String descriptor already
    if let Some(text) = env.read_string(type_obj) {
        if text.starts_with('(') {
            return Some(text);
        }
    }

    let rtype = read_reference_field(env, type_obj, "rtype")?;
    let ptypes = read_reference_field(env, type_obj, "ptypes")?;

    let mut descriptor = String::from("(");
    for index in 0..env.heap.array_length(ptypes) as usize {
        match env.heap.get_element(ptypes, TypeKind::Reference, index) {
            JavaValue::Reference(Some(mirror)) => {
                descriptor.push_str(&mirror_descriptor(env, mirror)?)
            }
            _ => return None,
        }
    }
    descriptor.push(')');
    descriptor.push_str(&mirror_descriptor(env, rtype)?);
    Some(descriptor)
}

/// Descriptor fragment for a Class mirror.
fn mirror_descriptor(env: &JavaEnv, mirror: ObjRef) -> Option<String> {
    let class = unmirror_class(env, mirror)?;
    let desc = env.class(class);

    Some(match desc.kind {
        crate::jvm::class::ClassKind::Primitive => {
            match desc.primitive {
                Some(kind) => kind.descriptor_char().to_string(),
                // The void mirror has no primitive kind
                None => "V".to_string(),
            }
        }
        crate::jvm::class::ClassKind::OrdinaryArray
        | crate::jvm::class::ClassKind::PrimitiveArray => desc.name.to_string(),
        crate::jvm::class::ClassKind::Ordinary => format!("L{};", desc.name),
    })
}


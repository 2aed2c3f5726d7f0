use crate::jvm::class::{ClassId, ClassKind, ClassState};
use crate::jvm::exceptions::raise_vm_exception;
use crate::jvm::link::{bootstrap_lookup_class, link_class};
use crate::jvm::mem::{JavaValue, ObjRef, TypeKind};
use crate::jvm::{JavaEnv, VmResult};
use crate::util::binary_to_dotted;

/// Lazily build the `java.lang.Class` mirror for a class descriptor. The
/// mirror carries a hidden slot holding the class id so the canonical
/// descriptor is always recoverable, even from clones: user copies keep
/// the slot verbatim, which serves as the "root" back-pointer.
pub fn get_class_mirror(env: &mut JavaEnv, tid: u32, class: ClassId) -> VmResult<ObjRef> {
    if let Some(mirror) = env.class(class).mirror.get() {
        return Ok(mirror);
    }

    let class_class = match env.well_known.class.get() {
        Some(class_class) => class_class,
        None => {
            let class_class = bootstrap_lookup_class(env, tid, "java/lang/Class")?;
            link_class(env, tid, class_class)?;
            env.well_known.class.set(Some(class_class));
            class_class
        }
    };

    let mirror = env.new_object(tid, class_class)?;
    let vmdata_offset = env
        .well_known
        .class_vmdata_offset
        .get()
        .expect("java/lang/Class linked without a vmdata slot");
    env.heap
        .set_field(mirror, vmdata_offset as usize, JavaValue::Long(class.0 as i64 + 1));

    // The mirror may be consulted before the name string survives a GC
    let handle = env.threads[tid as usize].handles.make(Some(mirror));
    let dotted = binary_to_dotted(&env.class(class).name);
    let name = env.make_string(tid, &dotted);
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    let name = name?;

    if let Some((owner, index)) = env.field_lookup(class_class, "name") {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap.set_field(mirror, offset as usize, JavaValue::Reference(Some(name)));
    }

    env.class(class).mirror.set(Some(mirror));
    Ok(mirror)
}

/// Recover the class id from a `java.lang.Class` instance.
pub fn unmirror_class(env: &JavaEnv, mirror: ObjRef) -> Option<ClassId> {
    let offset = env.well_known.class_vmdata_offset.get()?;
    match env.heap.get_field(mirror, offset as usize, TypeKind::Long) {
        JavaValue::Long(0) => None,
        JavaValue::Long(id) => Some(ClassId(id as u32 - 1)),
        _ => None,
    }
}

/// The jdk.internal.reflect.ConstantPool mirror of a class, lazily built.
pub fn get_constant_pool_mirror(env: &mut JavaEnv, tid: u32, class: ClassId) -> VmResult<ObjRef> {
    if let Some(mirror) = env.class(class).cp_mirror.get() {
        return Ok(mirror);
    }

    let cp_class = bootstrap_lookup_class(env, tid, "jdk/internal/reflect/ConstantPool")?;
    link_class(env, tid, cp_class)?;
    let mirror = env.new_object(tid, cp_class)?;

    // The pool mirror points back at the class mirror; the descriptor is
    // recovered through it
    let handle = env.threads[tid as usize].handles.make(Some(mirror));
    let class_mirror = get_class_mirror(env, tid, class);
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    let class_mirror = class_mirror?;

    if let Some((owner, index)) = env.field_lookup(cp_class, "constantPoolOop") {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap
            .set_field(mirror, offset as usize, JavaValue::Reference(Some(class_mirror)));
    }

    env.class(class).cp_mirror.set(Some(mirror));
    Ok(mirror)
}

fn write_reference_field(
    env: &mut JavaEnv,
    obj: ObjRef,
    class: ClassId,
    name: &str,
    value: Option<ObjRef>,
) {
    if let Some((owner, index)) = env.field_lookup(class, name) {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap.set_field(obj, offset as usize, JavaValue::Reference(value));
    }
}

fn write_int_field(env: &mut JavaEnv, obj: ObjRef, class: ClassId, name: &str, value: i32) {
    if let Some((owner, index)) = env.field_lookup(class, name) {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap.set_field(obj, offset as usize, JavaValue::Int(value));
    }
}

pub fn read_reference_field(
    env: &JavaEnv,
    obj: ObjRef,
    name: &str,
) -> Option<ObjRef> {
    let class = env.heap.class_of(obj);
    let (owner, index) = env.field_lookup(class, name)?;
    let offset = env.class(owner).field(index).byte_offset.get();
    match env.heap.get_field(obj, offset as usize, TypeKind::Reference) {
        JavaValue::Reference(value) => value,
        _ => None,
    }
}

pub fn read_int_field(env: &JavaEnv, obj: ObjRef, name: &str) -> Option<i32> {
    let class = env.heap.class_of(obj);
    let (owner, index) = env.field_lookup(class, name)?;
    let offset = env.class(owner).field(index).byte_offset.get();
    match env.heap.get_field(obj, offset as usize, TypeKind::Int) {
        JavaValue::Int(value) => Some(value),
        _ => None,
    }
}

/// Lazily build a `java.lang.reflect.Field` mirror. The canonical mirror is
/// cached on the descriptor; `clazz` + `slot` recover the descriptor from
/// any user-level copy.
pub fn get_field_mirror(
    env: &mut JavaEnv,
    tid: u32,
    class: ClassId,
    field_index: u16,
) -> VmResult<ObjRef> {
    if let Some(mirror) = env.class(class).field(field_index).reflection_field.get() {
        return Ok(mirror);
    }

    let field_class = bootstrap_lookup_class(env, tid, "java/lang/reflect/Field")?;
    link_class(env, tid, field_class)?;

    let mirror = env.new_object(tid, field_class)?;
    let handle = env.threads[tid as usize].handles.make(Some(mirror));

    let class_mirror = get_class_mirror(env, tid, class)?;
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    write_reference_field(env, mirror, field_class, "clazz", Some(class_mirror));

    let name_text = env.class(class).field(field_index).name.to_string();
    let name = env.intern_string(tid, &name_text);
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    let name = name?;
    write_reference_field(env, mirror, field_class, "name", Some(name));

    let field_type = {
        let descriptor = env.class(class).field(field_index).descriptor.clone();
        type_mirror_for(env, tid, &descriptor)
    };
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    write_reference_field(env, mirror, field_class, "type", field_type?);

    let modifiers = env.class(class).field(field_index).access.bits() as i32;
    write_int_field(env, mirror, field_class, "modifiers", modifiers);
    write_int_field(env, mirror, field_class, "slot", field_index as i32);

    // Annotation bytes are copied verbatim so the Java side can parse them
    if let Some(bytes) = env.class(class).field(field_index).annotations.clone() {
        let annotations = make_byte_array(env, tid, &bytes);
        let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
        write_reference_field(env, mirror, field_class, "annotations", Some(annotations?));
    }

    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    env.class(class).field(field_index).reflection_field.set(Some(mirror));
    Ok(mirror)
}

/// Lazily build a Method (or Constructor) mirror for a method descriptor.
pub fn get_method_mirror(env: &mut JavaEnv, tid: u32, class: ClassId, index: u16) -> VmResult<ObjRef> {
    let method = env.class(class).method(index).clone();
    let as_ctor = method.is_ctor;

    let cached = if as_ctor {
        method.reflection_ctor.get()
    } else {
        method.reflection_method.get()
    };
    if let Some(mirror) = cached {
        return Ok(mirror);
    }

    let mirror_class_name = if as_ctor {
        "java/lang/reflect/Constructor"
    } else {
        "java/lang/reflect/Method"
    };
    let mirror_class = bootstrap_lookup_class(env, tid, mirror_class_name)?;
    link_class(env, tid, mirror_class)?;

    let mirror = env.new_object(tid, mirror_class)?;
    let handle = env.threads[tid as usize].handles.make(Some(mirror));

    let class_mirror = get_class_mirror(env, tid, class)?;
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    write_reference_field(env, mirror, mirror_class, "clazz", Some(class_mirror));

    if !as_ctor {
        let name = env.intern_string(tid, &method.name.to_string());
        let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
        let name = name?;
        write_reference_field(env, mirror, mirror_class, "name", Some(name));
    }

    // Parameter type mirrors: the rooted array keeps stored elements
    // current while the remaining mirrors load
    let parameter_types = {
        let array_class = bootstrap_lookup_class(env, tid, "[Ljava/lang/Class;")?;
        let array = env.new_array(tid, array_class, method.descriptor.args.len() as i32)?;
        let array_root = env.threads[tid as usize].handles.make(Some(array));
        let filled: VmResult<()> = (|| {
            for (index, arg) in method.descriptor.args.iter().enumerate() {
                let type_mirror = type_mirror_for(env, tid, arg)?;
                let array = env.threads[tid as usize].handles.get(array_root).unwrap();
                env.heap.set_element(
                    array,
                    TypeKind::Reference,
                    index,
                    JavaValue::Reference(type_mirror),
                );
            }
            Ok(())
        })();
        let array = env.threads[tid as usize].handles.get(array_root).unwrap();
        env.threads[tid as usize].handles.drop_handle(array_root);
        filled?;
        array
    };
    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    write_reference_field(env, mirror, mirror_class, "parameterTypes", Some(parameter_types));

    if !as_ctor {
        let return_type = type_mirror_for(env, tid, &method.descriptor.returns)?;
        let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
        write_reference_field(env, mirror, mirror_class, "returnType", return_type);
    }

    let mirror = env.threads[tid as usize].handles.get(handle).unwrap();
    env.threads[tid as usize].handles.drop_handle(handle);
    write_int_field(env, mirror, mirror_class, "modifiers", method.access.bits() as i32);
    write_int_field(env, mirror, mirror_class, "slot", index as i32);

    if as_ctor {
        method.reflection_ctor.set(Some(mirror));
    } else {
        method.reflection_method.set(Some(mirror));
    }
    Ok(mirror)
}

/// Class mirror for a field descriptor type (primitive, class or array).
fn type_mirror_for(
    env: &mut JavaEnv,
    tid: u32,
    descriptor: &crate::jvm::mem::FieldDescriptor,
) -> VmResult<Option<ObjRef>> {
    use crate::jvm::mem::FieldDescriptor;

    let class = match descriptor {
        FieldDescriptor::Void => {
            // void.class is modeled as a primitive-like mirror on demand;
            // callers treat a missing mirror as void
            return Ok(None);
        }
        FieldDescriptor::Object(name) => bootstrap_lookup_class(env, tid, name)?,
        FieldDescriptor::Array(_) => {
            bootstrap_lookup_class(env, tid, &descriptor.to_string())?
        }
        primitive => crate::jvm::link::primitive_class(env, primitive.type_kind()),
    };

    get_class_mirror(env, tid, class).map(Some)
}

fn make_byte_array(env: &mut JavaEnv, tid: u32, bytes: &[u8]) -> VmResult<ObjRef> {
    let array_class = bootstrap_lookup_class(env, tid, "[B")?;
    let array = env.new_array(tid, array_class, bytes.len() as i32)?;
    for (index, byte) in bytes.iter().enumerate() {
        env.heap.set_element(array, TypeKind::Byte, index, JavaValue::Byte(*byte as i8));
    }
    Ok(array)
}




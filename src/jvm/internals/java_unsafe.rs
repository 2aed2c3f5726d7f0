//! jdk.internal.misc.Unsafe (and its sun.misc facade). Heap accesses address
//! `object base + offset` where offsets come from objectFieldOffset /
//! arrayBaseOffset; a null base addresses the VM's tracked native-memory
//! blocks instead.

use crate::jvm::call::{AsyncNative, AsyncPoll, NativeMethod, NativeRegistry};
use crate::jvm::exceptions::{raise_npe, raise_vm_exception};
use crate::jvm::internals::reflection::{read_int_field, read_reference_field, unmirror_class};
use crate::jvm::link::ensure_initialized;
use crate::jvm::mem::{JavaValue, ObjRef, TypeKind, OBJECT_HEADER_BYTES};
use crate::jvm::scheduler::{Wakeup, WakeupKind};
use crate::jvm::{JavaEnv, VmResult};
use crate::util::unix_time_us;

pub fn register(registry: &mut NativeRegistry) {
    use NativeMethod::{Async, Sync};

    for unsafe_class in ["jdk/internal/misc/Unsafe", "sun/misc/Unsafe"] {
        let r = |registry: &mut NativeRegistry, name: &str, descriptor: &str, method| {
            registry.register(unsafe_class, name, descriptor, method);
        };

        r(registry, "registerNatives", "()V", Sync(nop));
        r(registry, "arrayBaseOffset0", "(Ljava/lang/Class;)I", Sync(array_base_offset));
        r(registry, "arrayIndexScale0", "(Ljava/lang/Class;)I", Sync(array_index_scale));
        r(registry, "addressSize0", "()I", Sync(address_size));
        r(registry, "isBigEndian0", "()Z", Sync(return_false));
        r(registry, "unalignedAccess0", "()Z", Sync(return_true));
        r(registry, "pageSize", "()I", Sync(page_size));

        r(registry, "objectFieldOffset0", "(Ljava/lang/reflect/Field;)J", Sync(field_offset_of_mirror));
        r(
            registry,
            "objectFieldOffset1",
            "(Ljava/lang/Class;Ljava/lang/String;)J",
            Sync(field_offset_by_name),
        );
        r(registry, "ensureClassInitialized0", "(Ljava/lang/Class;)V", Sync(ensure_initialized0));

        r(registry, "allocateMemory0", "(J)J", Sync(allocate_memory));
        r(registry, "freeMemory0", "(J)V", Sync(free_memory));
        r(registry, "setMemory0", "(Ljava/lang/Object;JJB)V", Sync(set_memory));
        r(registry, "copyMemory0", "(Ljava/lang/Object;JLjava/lang/Object;JJ)V", Sync(copy_memory));

        for (name, descriptor) in [
            ("getByte", "(J)B"),
            ("getByte", "(Ljava/lang/Object;J)B"),
            ("getByteVolatile", "(Ljava/lang/Object;J)B"),
        ] {
            r(registry, name, descriptor, Sync(get_byte));
        }
        for (name, descriptor) in [
            ("putByte", "(JB)V"),
            ("putByte", "(Ljava/lang/Object;JB)V"),
            ("putByteVolatile", "(Ljava/lang/Object;JB)V"),
        ] {
            r(registry, name, descriptor, Sync(put_byte));
        }
        for (name, descriptor) in [
            ("getInt", "(J)I"),
            ("getInt", "(Ljava/lang/Object;J)I"),
            ("getIntVolatile", "(Ljava/lang/Object;J)I"),
        ] {
            r(registry, name, descriptor, Sync(get_int));
        }
        for (name, descriptor) in [
            ("putInt", "(JI)V"),
            ("putInt", "(Ljava/lang/Object;JI)V"),
            ("putIntVolatile", "(Ljava/lang/Object;JI)V"),
        ] {
            r(registry, name, descriptor, Sync(put_int));
        }
        for (name, descriptor) in [
            ("getLong", "(J)J"),
            ("getLong", "(Ljava/lang/Object;J)J"),
            ("getLongVolatile", "(Ljava/lang/Object;J)J"),
        ] {
            r(registry, name, descriptor, Sync(get_long));
        }
        for (name, descriptor) in [
            ("putLong", "(JJ)V"),
            ("putLong", "(Ljava/lang/Object;JJ)V"),
            ("putLongVolatile", "(Ljava/lang/Object;JJ)V"),
        ] {
            r(registry, name, descriptor, Sync(put_long));
        }
        for (name, descriptor) in [
            ("getReference", "(Ljava/lang/Object;J)Ljava/lang/Object;"),
            ("getReferenceVolatile", "(Ljava/lang/Object;J)Ljava/lang/Object;"),
            ("getObject", "(Ljava/lang/Object;J)Ljava/lang/Object;"),
            ("getObjectVolatile", "(Ljava/lang/Object;J)Ljava/lang/Object;"),
        ] {
            r(registry, name, descriptor, Sync(get_reference));
        }
        for (name, descriptor) in [
            ("putReference", "(Ljava/lang/Object;JLjava/lang/Object;)V"),
            ("putReferenceVolatile", "(Ljava/lang/Object;JLjava/lang/Object;)V"),
            ("putObject", "(Ljava/lang/Object;JLjava/lang/Object;)V"),
            ("putObjectVolatile", "(Ljava/lang/Object;JLjava/lang/Object;)V"),
        ] {
            r(registry, name, descriptor, Sync(put_reference));
        }

        for (name, descriptor) in [
            ("compareAndSetInt", "(Ljava/lang/Object;JII)Z"),
            ("weakCompareAndSetInt", "(Ljava/lang/Object;JII)Z"),
            ("weakCompareAndSetIntPlain", "(Ljava/lang/Object;JII)Z"),
        ] {
            r(registry, name, descriptor, Sync(compare_and_set_int));
        }
        for (name, descriptor) in [
            ("compareAndSetLong", "(Ljava/lang/Object;JJJ)Z"),
            ("weakCompareAndSetLong", "(Ljava/lang/Object;JJJ)Z"),
        ] {
            r(registry, name, descriptor, Sync(compare_and_set_long));
        }
        for (name, descriptor) in [
            (
                "compareAndSetReference",
                "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
            ),
            (
                "compareAndSetObject",
                "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
            ),
            (
                "weakCompareAndSetReference",
                "(Ljava/lang/Object;JLjava/lang/Object;Ljava/lang/Object;)Z",
            ),
        ] {
            r(registry, name, descriptor, Sync(compare_and_set_reference));
        }

        r(registry, "park", "(ZJ)V", Async(|| Box::new(ParkNative::new())));
        r(registry, "unpark", "(Ljava/lang/Object;)V", Sync(unpark));

        r(registry, "loadFence", "()V", Sync(nop));
        r(registry, "storeFence", "()V", Sync(nop));
        r(registry, "fullFence", "()V", Sync(nop));
    }
}

fn nop(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(None)
}

fn return_false(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Byte(0)))
}

fn return_true(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Byte(1)))
}

fn address_size(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Int(8)))
}

fn page_size(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Int(4096)))
}

fn array_base_offset(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Int(OBJECT_HEADER_BYTES as i32)))
}

fn array_index_scale(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let scale = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(mirror)) => match unmirror_class(env, mirror) {
            Some(class) if env.class(class).is_array() => {
                env.class(class).element_kind().size_bytes() as i32
            }
            _ => 0,
        },
        _ => return Err(raise_npe(env, tid)),
    };
    Ok(Some(JavaValue::Int(scale)))
}

/// Field offset as Unsafe sees it: relative to the object base, header
/// included.
fn field_offset_of_mirror(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let field_mirror = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(obj)) => obj,
        _ => return Err(raise_npe(env, tid)),
    };

    let class = read_reference_field(env, field_mirror, "clazz")
        .and_then(|mirror| unmirror_class(env, mirror));
    let slot = read_int_field(env, field_mirror, "slot");

    match (class, slot) {
        (Some(class), Some(slot)) => {
            let field = env.class(class).field(slot as u16);
            let offset = field.byte_offset.get() as i64 + OBJECT_HEADER_BYTES as i64;
            Ok(Some(JavaValue::Long(offset)))
        }
        _ => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/InternalError",
            Some("malformed Field mirror"),
        )),
    }
}

fn field_offset_by_name(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(mirror)) => unmirror_class(env, mirror),
        _ => return Err(raise_npe(env, tid)),
    };
    let name = match env.native_arg(tid, 2) {
        JavaValue::Reference(Some(name)) => env.read_string(name).unwrap_or_default(),
        _ => return Err(raise_npe(env, tid)),
    };

    let class = match class {
        Some(class) => class,
        None => return Err(raise_npe(env, tid)),
    };

    match env.field_lookup(class, &name) {
        Some((owner, index)) => {
            let offset =
                env.class(owner).field(index).byte_offset.get() as i64 + OBJECT_HEADER_BYTES as i64;
            Ok(Some(JavaValue::Long(offset)))
        }
        None => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/InternalError",
            Some(&format!("no field named {}", name)),
        )),
    }
}

fn ensure_initialized0(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    if let JavaValue::Reference(Some(mirror)) = env.native_arg(tid, 1) {
        if let Some(class) = unmirror_class(env, mirror) {
            ensure_initialized(env, tid, class)?;
        }
    }
    Ok(None)
}

// Native memory

fn allocate_memory(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let bytes = match env.native_arg(tid, 1) {
        JavaValue::Long(bytes) if bytes >= 0 => bytes as usize,
        _ => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/IllegalArgumentException",
                Some("negative allocation size"),
            ))
        }
    };
    Ok(Some(JavaValue::Long(env.allocate_native_memory(bytes) as i64)))
}

fn free_memory(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    if let JavaValue::Long(address) = env.native_arg(tid, 1) {
        env.free_native_memory(address as u64);
    }
    Ok(None)
}

fn set_memory(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (base, address, length, value) = match (
        env.native_arg(tid, 1),
        env.native_arg(tid, 2),
        env.native_arg(tid, 3),
        env.native_arg(tid, 4),
    ) {
        (
            JavaValue::Reference(base),
            JavaValue::Long(address),
            JavaValue::Long(length),
            JavaValue::Byte(value),
        ) => (base, address, length, value),
        _ => panic!("setMemory signature mismatch"),
    };

    for index in 0..length.max(0) as u64 {
        write_raw_byte(env, base, address as u64 + index, value as u8);
    }
    Ok(None)
}

fn copy_memory(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (src_base, src_offset, dst_base, dst_offset, length) = match (
        env.native_arg(tid, 1),
        env.native_arg(tid, 2),
        env.native_arg(tid, 3),
        env.native_arg(tid, 4),
        env.native_arg(tid, 5),
    ) {
        (
            JavaValue::Reference(src_base),
            JavaValue::Long(src_offset),
            JavaValue::Reference(dst_base),
            JavaValue::Long(dst_offset),
            JavaValue::Long(length),
        ) => (src_base, src_offset, dst_base, dst_offset, length),
        _ => panic!("copyMemory signature mismatch"),
    };

    // Copy through a scratch buffer so overlapping ranges stay correct
    let mut scratch = Vec::with_capacity(length.max(0) as usize);
    for index in 0..length.max(0) as u64 {
        scratch.push(read_raw_byte(env, src_base, src_offset as u64 + index));
    }
    for (index, byte) in scratch.into_iter().enumerate() {
        write_raw_byte(env, dst_base, dst_offset as u64 + index as u64, byte);
    }
    Ok(None)
}

fn read_raw_byte(env: &mut JavaEnv, base: Option<ObjRef>, offset: u64) -> u8 {
    match base {
        Some(obj) => env.heap.read_u8(obj.offset() + offset as usize),
        None => match env.native_memory_at(offset) {
            Some((block, index)) => block[index],
            None => 0,
        },
    }
}

fn write_raw_byte(env: &mut JavaEnv, base: Option<ObjRef>, offset: u64, value: u8) {
    match base {
        Some(obj) => env.heap.write_u8(obj.offset() + offset as usize, value),
        None => {
            if let Some((block, index)) = env.native_memory_at(offset) {
                block[index] = value;
            }
        }
    }
}

// Typed accessors. The (address)-only forms pass no base object; the
// (Object, long) forms use the receiver-relative address.

fn unsafe_base_and_offset(env: &JavaEnv, tid: u32) -> (Option<ObjRef>, u64) {
    let args = env.native_args(tid);
    match args.get(1) {
        Some(JavaValue::Reference(base)) => {
            let offset = match args.get(2) {
                Some(JavaValue::Long(offset)) => *offset as u64,
                _ => 0,
            };
            (*base, offset)
        }
        Some(JavaValue::Long(address)) => (None, *address as u64),
        _ => (None, 0),
    }
}

fn value_argument(env: &JavaEnv, tid: u32) -> JavaValue {
    *env.native_args(tid).last().expect("missing value argument")
}

fn get_kind(env: &mut JavaEnv, tid: u32, kind: TypeKind) -> VmResult<Option<JavaValue>> {
    let (base, offset) = unsafe_base_and_offset(env, tid);
    match base {
        Some(obj) => Ok(Some(env.heap.read_kind(obj.offset() + offset as usize, kind))),
        None => {
            let mut bytes = [0u8; 8];
            for (index, byte) in bytes.iter_mut().enumerate().take(kind.size_bytes()) {
                *byte = read_raw_byte(env, None, offset + index as u64);
            }
            Ok(Some(JavaValue::from_slot(
                u64::from_ne_bytes(bytes),
                kind,
            )))
        }
    }
}

fn put_kind(env: &mut JavaEnv, tid: u32, kind: TypeKind) -> VmResult<Option<JavaValue>> {
    let (base, offset) = unsafe_base_and_offset(env, tid);
    let value = value_argument(env, tid);
    match base {
        Some(obj) => env.heap.write_kind(obj.offset() + offset as usize, value),
        None => {
            let bytes = value.into_slot().to_ne_bytes();
            for (index, byte) in bytes.iter().enumerate().take(kind.size_bytes()) {
                write_raw_byte(env, None, offset + index as u64, *byte);
            }
        }
    }
    Ok(None)
}

fn get_byte(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    get_kind(env, tid, TypeKind::Byte)
}

fn put_byte(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    put_kind(env, tid, TypeKind::Byte)
}

fn get_int(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    get_kind(env, tid, TypeKind::Int)
}

fn put_int(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    put_kind(env, tid, TypeKind::Int)
}

fn get_long(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    get_kind(env, tid, TypeKind::Long)
}

fn put_long(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    put_kind(env, tid, TypeKind::Long)
}

fn get_reference(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    get_kind(env, tid, TypeKind::Reference)
}

fn put_reference(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    put_kind(env, tid, TypeKind::Reference)
}

// Compare-and-set: the VM is single-threaded with respect to Java state, so
// a plain read-compare-write is atomic by construction.

fn compare_and_set_int(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (base, offset) = unsafe_base_and_offset(env, tid);
    let (expected, update) = match (env.native_arg(tid, 3), env.native_arg(tid, 4)) {
        (JavaValue::Int(expected), JavaValue::Int(update)) => (expected, update),
        _ => panic!("compareAndSetInt signature mismatch"),
    };

    let obj = base.expect("compareAndSetInt on native memory");
    let address = obj.offset() + offset as usize;
    let success = env.heap.read_u32(address) as i32 == expected;
    if success {
        env.heap.write_u32(address, update as u32);
    }
    Ok(Some(JavaValue::Byte(success as i8)))
}

fn compare_and_set_long(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (base, offset) = unsafe_base_and_offset(env, tid);
    let (expected, update) = match (env.native_arg(tid, 3), env.native_arg(tid, 4)) {
        (JavaValue::Long(expected), JavaValue::Long(update)) => (expected, update),
        _ => panic!("compareAndSetLong signature mismatch"),
    };

    let obj = base.expect("compareAndSetLong on native memory");
    let address = obj.offset() + offset as usize;
    let success = env.heap.read_u64(address) as i64 == expected;
    if success {
        env.heap.write_u64(address, update as u64);
    }
    Ok(Some(JavaValue::Byte(success as i8)))
}

fn compare_and_set_reference(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (base, offset) = unsafe_base_and_offset(env, tid);
    let (expected, update) = match (env.native_arg(tid, 3), env.native_arg(tid, 4)) {
        (JavaValue::Reference(expected), JavaValue::Reference(update)) => (expected, update),
        _ => panic!("compareAndSetReference signature mismatch"),
    };

    let obj = base.expect("compareAndSetReference on native memory");
    let address = obj.offset() + offset as usize;
    let success = ObjRef::from_slot(env.heap.read_u64(address)) == expected;
    if success {
        env.heap.write_u64(address, ObjRef::into_slot(update));
    }
    Ok(Some(JavaValue::Byte(success as i8)))
}

// Park / unpark

struct ParkNative {
    parked: bool,
}

impl ParkNative {
    fn new() -> Self {
        ParkNative { parked: false }
    }
}

impl AsyncNative for ParkNative {
    fn poll(&mut self, env: &mut JavaEnv, tid: u32) -> VmResult<AsyncPoll> {
        if !self.parked {
            // A pending permit (or interrupt) consumes immediately
            if env.threads[tid as usize].unpark_permit {
                env.threads[tid as usize].unpark_permit = false;
                return Ok(AsyncPoll::Ready(None));
            }
            if env.threads[tid as usize].interrupted {
                return Ok(AsyncPoll::Ready(None));
            }

            let is_absolute = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));
            let time = match env.native_arg(tid, 2) {
                JavaValue::Long(time) => time,
                _ => 0,
            };
            let deadline = if time == 0 {
                0
            } else if is_absolute {
                (time as u64).saturating_mul(1000)
            } else {
                unix_time_us() + time as u64 / 1000
            };

            self.parked = true;
            return Ok(AsyncPoll::NotReady(Wakeup {
                kind: WakeupKind::Park,
                wakeup_us: deadline,
                monitor: None,
                ready: false,
            }));
        }

        env.threads[tid as usize].unpark_permit = false;
        Ok(AsyncPoll::Ready(None))
    }
}

fn unpark(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let thread_obj = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(obj)) => obj,
        _ => return Ok(None),
    };

    // Find the VM thread owning this mirror and grant the permit
    for index in 0..env.threads.len() {
        if env.threads[index].thread_obj == Some(thread_obj) {
            env.threads[index].unpark_permit = true;
            break;
        }
    }
    Ok(None)
}

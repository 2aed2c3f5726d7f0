//! Native methods for the core java.lang / java.io classes.

use std::cell::Cell;
use std::rc::Rc;

use crate::jvm::call::{AsyncNative, AsyncPoll, NativeMethod, NativeRegistry};
use crate::jvm::class::{ClassDesc, ClassId, ClassKind, ClassState, ConstantPool};
use crate::jvm::exceptions::{
    raise_illegal_monitor_state, raise_interrupted, raise_npe, raise_vm_exception,
};
use crate::jvm::internals::reflection::{
    get_class_mirror, get_constant_pool_mirror, read_int_field, unmirror_class,
};
use crate::jvm::link::{bootstrap_lookup_class, ensure_initialized, primitive_class};
use crate::jvm::mem::{JavaValue, ObjRef, TypeKind, OBJECT_HEADER_BYTES};
use crate::jvm::scheduler::{Wakeup, WakeupKind};
use crate::jvm::{JavaEnv, VmResult};
use crate::util::{binary_to_dotted, unix_time_us};

pub fn register(registry: &mut NativeRegistry) {
    use NativeMethod::{Async, Sync};

    for class in [
        "java/lang/Object",
        "java/lang/System",
        "java/lang/Thread",
        "java/lang/Class",
        "java/lang/ClassLoader",
        "java/io/FileOutputStream",
        "java/io/FileInputStream",
        "java/io/FileDescriptor",
    ] {
        registry.register(class, "registerNatives", "()V", Sync(nop));
    }
    registry.register("java/io/FileOutputStream", "initIDs", "()V", Sync(nop));
    registry.register("java/io/FileInputStream", "initIDs", "()V", Sync(nop));
    registry.register("java/io/FileDescriptor", "initIDs", "()V", Sync(nop));
    registry.register("jdk/internal/misc/VM", "initialize", "()V", Sync(nop));
    registry.register(
        "jdk/internal/misc/VM",
        "initializeFromArchive",
        "(Ljava/lang/Class;)V",
        Sync(nop),
    );

    registry.register(
        "java/lang/Module",
        "defineModule0",
        "(Ljava/lang/Module;ZLjava/lang/String;Ljava/lang/String;[Ljava/lang/String;)V",
        Sync(module_define),
    );
    // Access control between modules is not enforced by this VM
    for (name, descriptor) in [
        ("addReads0", "(Ljava/lang/Module;Ljava/lang/Module;)V"),
        ("addExports0", "(Ljava/lang/Module;Ljava/lang/String;Ljava/lang/Module;)V"),
        ("addExportsToAll0", "(Ljava/lang/Module;Ljava/lang/String;)V"),
        ("addExportsToAllUnnamed0", "(Ljava/lang/Module;Ljava/lang/String;)V"),
    ] {
        registry.register("java/lang/Module", name, descriptor, Sync(nop));
    }

    registry.register("java/lang/Object", "getClass", "()Ljava/lang/Class;", Sync(object_get_class));
    registry.register("java/lang/Object", "hashCode", "()I", Sync(object_hash_code));
    registry.register("java/lang/Object", "clone", "()Ljava/lang/Object;", Sync(object_clone));
    registry.register("java/lang/Object", "notify", "()V", Sync(object_notify));
    registry.register("java/lang/Object", "notifyAll", "()V", Sync(object_notify_all));
    registry.register("java/lang/Object", "wait", "(J)V", Async(|| Box::new(WaitNative::new())));
    registry.register("java/lang/Object", "wait0", "(J)V", Async(|| Box::new(WaitNative::new())));

    registry.register(
        "java/lang/System",
        "arraycopy",
        "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        Sync(system_arraycopy),
    );
    registry.register("java/lang/System", "currentTimeMillis", "()J", Sync(system_millis));
    registry.register("java/lang/System", "nanoTime", "()J", Sync(system_nanos));
    registry.register(
        "java/lang/System",
        "identityHashCode",
        "(Ljava/lang/Object;)I",
        Sync(system_identity_hash),
    );

    registry.register(
        "java/lang/Thread",
        "currentThread",
        "()Ljava/lang/Thread;",
        Sync(thread_current),
    );
    registry.register("java/lang/Thread", "sleep", "(J)V", Async(|| Box::new(SleepNative::new())));
    registry.register(
        "java/lang/Thread",
        "sleepNanos0",
        "(J)V",
        Async(|| Box::new(SleepNative::new())),
    );
    registry.register("java/lang/Thread", "yield", "()V", Async(|| Box::new(YieldNative::new())));
    registry.register("java/lang/Thread", "yield0", "()V", Async(|| Box::new(YieldNative::new())));
    registry.register("java/lang/Thread", "start0", "()V", Sync(thread_start0));
    registry.register("java/lang/Thread", "isAlive", "()Z", Sync(thread_is_alive));
    registry.register("java/lang/Thread", "interrupt0", "()V", Sync(thread_interrupt0));
    registry.register("java/lang/Thread", "isInterrupted", "(Z)Z", Sync(thread_is_interrupted));
    registry.register("java/lang/Thread", "setPriority0", "(I)V", Sync(nop));
    registry.register("java/lang/Thread", "setNativeName", "(Ljava/lang/String;)V", Sync(nop));
    registry.register("java/lang/Thread", "holdsLock", "(Ljava/lang/Object;)Z", Sync(thread_holds_lock));

    registry.register(
        "java/lang/Class",
        "getPrimitiveClass",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        Sync(class_get_primitive),
    );
    registry.register(
        "java/lang/Class",
        "desiredAssertionStatus0",
        "(Ljava/lang/Class;)Z",
        Sync(return_false),
    );
    registry.register("java/lang/Class", "getName0", "()Ljava/lang/String;", Sync(class_get_name));
    registry.register(
        "java/lang/Class",
        "initClassName",
        "()Ljava/lang/String;",
        Sync(class_get_name),
    );
    registry.register("java/lang/Class", "isInterface", "()Z", Sync(class_is_interface));
    registry.register("java/lang/Class", "isArray", "()Z", Sync(class_is_array));
    registry.register("java/lang/Class", "isPrimitive", "()Z", Sync(class_is_primitive));
    registry.register(
        "java/lang/Class",
        "isInstance",
        "(Ljava/lang/Object;)Z",
        Sync(class_is_instance),
    );
    registry.register(
        "java/lang/Class",
        "isAssignableFrom",
        "(Ljava/lang/Class;)Z",
        Sync(class_is_assignable),
    );
    registry.register(
        "java/lang/Class",
        "getSuperclass",
        "()Ljava/lang/Class;",
        Sync(class_get_superclass),
    );
    registry.register(
        "java/lang/Class",
        "getComponentType",
        "()Ljava/lang/Class;",
        Sync(class_component_type),
    );
    registry.register("java/lang/Class", "getModifiers", "()I", Sync(class_get_modifiers));
    registry.register(
        "java/lang/Class",
        "forName0",
        "(Ljava/lang/String;ZLjava/lang/ClassLoader;Ljava/lang/Class;)Ljava/lang/Class;",
        Sync(class_for_name),
    );
    registry.register(
        "java/lang/Class",
        "getConstantPool",
        "()Ljdk/internal/reflect/ConstantPool;",
        Sync(class_constant_pool),
    );
    registry.register(
        "java/lang/Class",
        "getDeclaredFields0",
        "(Z)[Ljava/lang/reflect/Field;",
        Sync(class_declared_fields),
    );
    registry.register(
        "java/lang/Class",
        "getDeclaredMethods0",
        "(Z)[Ljava/lang/reflect/Method;",
        Sync(class_declared_methods),
    );
    registry.register(
        "java/lang/Class",
        "getDeclaredConstructors0",
        "(Z)[Ljava/lang/reflect/Constructor;",
        Sync(class_declared_constructors),
    );

    registry.register(
        "java/lang/reflect/Executable",
        "getParameters0",
        "()[Ljava/lang/reflect/Parameter;",
        Sync(executable_parameters),
    );

    registry.register(
        "java/lang/reflect/Array",
        "newArray",
        "(Ljava/lang/Class;I)Ljava/lang/Object;",
        Sync(array_new_instance),
    );
    registry.register(
        "java/lang/reflect/Array",
        "getLength",
        "(Ljava/lang/Object;)I",
        Sync(array_get_length),
    );

    registry.register("java/lang/System", "setIn0", "(Ljava/io/InputStream;)V", Sync(system_set_in));
    registry.register("java/lang/System", "setOut0", "(Ljava/io/PrintStream;)V", Sync(system_set_out));
    registry.register("java/lang/System", "setErr0", "(Ljava/io/PrintStream;)V", Sync(system_set_err));

    registry.register("java/lang/String", "intern", "()Ljava/lang/String;", Sync(string_intern));
    registry.register("java/lang/StringUTF16", "isBigEndian", "()Z", Sync(return_false));

    registry.register("java/lang/Float", "floatToRawIntBits", "(F)I", Sync(float_to_bits));
    registry.register("java/lang/Float", "intBitsToFloat", "(I)F", Sync(bits_to_float));
    registry.register("java/lang/Double", "doubleToRawLongBits", "(D)J", Sync(double_to_bits));
    registry.register("java/lang/Double", "longBitsToDouble", "(J)D", Sync(bits_to_double));

    registry.register("java/lang/Runtime", "availableProcessors", "()I", Sync(one_processor));
    registry.register("java/lang/Runtime", "gc", "()V", Sync(runtime_gc));
    registry.register("java/lang/Runtime", "freeMemory", "()J", Sync(runtime_free_memory));
    registry.register("java/lang/Runtime", "totalMemory", "()J", Sync(runtime_total_memory));
    registry.register("java/lang/Runtime", "maxMemory", "()J", Sync(runtime_total_memory));

    registry.register(
        "java/lang/Throwable",
        "fillInStackTrace",
        "(I)Ljava/lang/Throwable;",
        Sync(throwable_fill_in),
    );

    registry.register("java/io/FileOutputStream", "writeBytes", "([BIIZ)V", Sync(fos_write_bytes));
    registry.register("java/io/FileOutputStream", "write", "(IZ)V", Sync(fos_write_one));
    registry.register("java/io/FileInputStream", "readBytes", "([BII)I", Sync(fis_read_bytes));
    registry.register("java/io/FileInputStream", "available0", "()I", Sync(fis_available));
    registry.register("java/io/FileDescriptor", "getHandle", "(I)J", Sync(fd_get_handle));
    registry.register("java/io/FileDescriptor", "getAppend", "(I)Z", Sync(return_false));

    registry.register(
        "java/lang/ref/Reference",
        "waitForReferencePendingList",
        "()V",
        Async(|| Box::new(ReferencePendingNative)),
    );
    registry.register(
        "java/lang/ref/Reference",
        "getAndClearReferencePendingList",
        "()Ljava/lang/ref/Reference;",
        Sync(reference_take_pending),
    );
    registry.register(
        "java/lang/ref/Reference",
        "hasReferencePendingList",
        "()Z",
        Sync(reference_has_pending),
    );

    registry.register(
        "jdk/internal/reflect/Reflection",
        "getCallerClass",
        "()Ljava/lang/Class;",
        Sync(reflection_caller_class),
    );
}

fn nop(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(None)
}

fn return_false(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Byte(0)))
}

fn receiver(env: &JavaEnv, tid: u32) -> Option<ObjRef> {
    match env.native_arg(tid, 0) {
        JavaValue::Reference(obj) => obj,
        _ => None,
    }
}

fn expect_receiver(env: &mut JavaEnv, tid: u32) -> VmResult<ObjRef> {
    match receiver(env, tid) {
        Some(obj) => Ok(obj),
        None => Err(raise_npe(env, tid)),
    }
}

// java.lang.Object

fn object_get_class(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    let class = env.heap.class_of(obj);
    let mirror = get_class_mirror(env, tid, class)?;
    Ok(Some(JavaValue::Reference(Some(mirror))))
}

fn object_hash_code(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    Ok(Some(JavaValue::Int(env.identity_hash(obj))))
}

fn object_clone(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    let class = env.heap.class_of(obj);
    let size = crate::jvm::mem::gc::size_of_object(env, obj);
    let array_length = env.heap.array_length(obj);

    // Allocation can move the source; re-read it through the frame args
    let copy = match env.class(class).kind {
        ClassKind::Ordinary => env.new_object(tid, class)?,
        _ => env.new_array(tid, class, array_length)?,
    };
    let obj = expect_receiver(env, tid)?;

    env.heap.copy_within(
        obj.offset() + OBJECT_HEADER_BYTES,
        copy.offset() + OBJECT_HEADER_BYTES,
        size - OBJECT_HEADER_BYTES,
    );
    Ok(Some(JavaValue::Reference(Some(copy))))
}

fn object_notify(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    notify_impl(env, tid, false)
}

fn object_notify_all(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    notify_impl(env, tid, true)
}

fn notify_impl(env: &mut JavaEnv, tid: u32, all: bool) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    if !env.monitors.owned_by(&env.heap, obj, tid) {
        return Err(raise_illegal_monitor_state(env, tid));
    }
    env.monitor_notify(obj, all);
    Ok(None)
}

/// Object.wait: release the monitor (saving the recursion count), park on
/// the wait set, and on wakeup reacquire and restore the count.
struct WaitNative {
    stage: u8,
    saved_holds: u32,
    target: Cell<Option<crate::jvm::mem::Handle>>,
}

impl WaitNative {
    fn new() -> Self {
        WaitNative { stage: 0, saved_holds: 0, target: Cell::new(None) }
    }
}

impl AsyncNative for WaitNative {
    fn poll(&mut self, env: &mut JavaEnv, tid: u32) -> VmResult<AsyncPoll> {
        match self.stage {
            0 => {
                let obj = expect_receiver(env, tid)?;
                let millis = match env.native_arg(tid, 1) {
                    JavaValue::Long(millis) => millis,
                    _ => 0,
                };

                let saved = match env.monitors.release_all_for_wait(&mut env.heap, obj, tid) {
                    Ok(saved) => saved,
                    Err(_) => return Err(raise_illegal_monitor_state(env, tid)),
                };
                self.saved_holds = saved;
                self.target.set(Some(env.threads[tid as usize].handles.make(Some(obj))));
                self.stage = 1;

                let deadline = if millis > 0 {
                    unix_time_us() + millis as u64 * 1000
                } else {
                    0
                };
                Ok(AsyncPoll::NotReady(Wakeup {
                    kind: WakeupKind::MonitorWait,
                    wakeup_us: deadline,
                    monitor: Some(obj),
                    ready: false,
                }))
            }
            _ => {
                let handle = self.target.get().expect("wait continuation without target");
                let obj = env.threads[tid as usize].handles.get(handle).expect("wait target died");

                // Reacquire before anything else; contention parks us again
                let id = env.monitors.inflate(&mut env.heap, obj);
                if !env.monitors.try_acquire(id, tid) {
                    return Ok(AsyncPoll::NotReady(Wakeup {
                        kind: WakeupKind::MonitorEnter,
                        wakeup_us: 0,
                        monitor: Some(obj),
                        ready: false,
                    }));
                }
                env.monitors.restore_after_wait(&mut env.heap, obj, tid, self.saved_holds);
                env.threads[tid as usize].handles.drop_handle(handle);

                if env.threads[tid as usize].interrupted {
                    env.threads[tid as usize].interrupted = false;
                    return Err(raise_interrupted(env, tid));
                }
                Ok(AsyncPoll::Ready(None))
            }
        }
    }
}

// java.lang.System

fn system_arraycopy(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let (src, src_pos, dst, dst_pos, length) = match (
        env.native_arg(tid, 0),
        env.native_arg(tid, 1),
        env.native_arg(tid, 2),
        env.native_arg(tid, 3),
        env.native_arg(tid, 4),
    ) {
        (
            JavaValue::Reference(src),
            JavaValue::Int(src_pos),
            JavaValue::Reference(dst),
            JavaValue::Int(dst_pos),
            JavaValue::Int(length),
        ) => (src, src_pos, dst, dst_pos, length),
        _ => panic!("arraycopy signature mismatch"),
    };

    let (src, dst) = match (src, dst) {
        (Some(src), Some(dst)) => (src, dst),
        _ => return Err(raise_npe(env, tid)),
    };

    let src_class = env.heap.class_of(src);
    let dst_class = env.heap.class_of(dst);
    if !env.class(src_class).is_array() || !env.class(dst_class).is_array() {
        return Err(raise_vm_exception(
            env,
            tid,
            "java/lang/ArrayStoreException",
            Some("arraycopy of a non-array"),
        ));
    }

    let src_kind = env.class(src_class).element_kind();
    let dst_kind = env.class(dst_class).element_kind();
    if src_kind != dst_kind {
        return Err(raise_vm_exception(
            env,
            tid,
            "java/lang/ArrayStoreException",
            Some("arraycopy element kinds differ"),
        ));
    }

    let src_length = env.heap.array_length(src);
    let dst_length = env.heap.array_length(dst);
    if src_pos < 0
        || dst_pos < 0
        || length < 0
        || src_pos as i64 + length as i64 > src_length as i64
        || dst_pos as i64 + length as i64 > dst_length as i64
    {
        return Err(raise_vm_exception(
            env,
            tid,
            "java/lang/ArrayIndexOutOfBoundsException",
            Some("arraycopy range out of bounds"),
        ));
    }

    // Assignability of each element for mismatched reference arrays
    if src_kind == TypeKind::Reference && src_class != dst_class {
        let component = env
            .class(dst_class)
            .one_fewer_dim
            .expect("reference array without component");
        for index in 0..length {
            let value = env.heap.get_element(src, src_kind, (src_pos + index) as usize);
            if let JavaValue::Reference(Some(element)) = value {
                if !env.instanceof(env.heap.class_of(element), component) {
                    return Err(raise_vm_exception(
                        env,
                        tid,
                        "java/lang/ArrayStoreException",
                        Some("incompatible element in arraycopy"),
                    ));
                }
            }
            env.heap.set_element(dst, dst_kind, (dst_pos + index) as usize, value);
        }
        return Ok(None);
    }

    // Same representation: a straight memmove handles overlap
    let stride = src_kind.size_bytes();
    let src_at = crate::jvm::mem::Heap::element_address(src, src_kind, src_pos as usize);
    let dst_at = crate::jvm::mem::Heap::element_address(dst, dst_kind, dst_pos as usize);
    env.heap.copy_within(src_at, dst_at, length as usize * stride);
    Ok(None)
}

fn system_millis(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Long((unix_time_us() / 1000) as i64)))
}

fn system_nanos(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Long((unix_time_us() * 1000) as i64)))
}

fn system_identity_hash(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let value = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(obj)) => env.identity_hash(obj),
        _ => 0,
    };
    Ok(Some(JavaValue::Int(value)))
}

// java.lang.Thread

/// The Thread mirror for the current VM thread, created lazily for threads
/// that were never started from Java (the main thread).
fn current_thread_mirror(env: &mut JavaEnv, tid: u32) -> VmResult<ObjRef> {
    if let Some(obj) = env.threads[tid as usize].thread_obj {
        return Ok(obj);
    }

    let thread_class = match env.well_known.thread.get() {
        Some(thread_class) => thread_class,
        None => {
            let thread_class = bootstrap_lookup_class(env, tid, "java/lang/Thread")?;
            env.well_known.thread.set(Some(thread_class));
            thread_class
        }
    };
    crate::jvm::link::link_class(env, tid, thread_class)?;
    let obj = env.new_object(tid, thread_class)?;
    env.threads[tid as usize].thread_obj = Some(obj);

    if let Some((owner, index)) = env.field_lookup(thread_class, "priority") {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap.set_field(obj, offset as usize, JavaValue::Int(5));
    }
    if let Some((owner, index)) = env.field_lookup(thread_class, "eetop") {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap.set_field(obj, offset as usize, JavaValue::Long(tid as i64 + 1));
    }

    // Attach the main thread group where the class library provides one
    if env.main_thread_group.is_none() {
        if let Some(group_class) =
            crate::jvm::link::bootstrap_lookup_class_impl(env, tid, "java/lang/ThreadGroup")?
        {
            crate::jvm::link::link_class(env, tid, group_class)?;
            let group = env.new_object(tid, group_class)?;
            env.main_thread_group = Some(group);
        }
    }
    if let Some(group) = env.main_thread_group {
        let obj = env.threads[tid as usize].thread_obj.unwrap();
        if let Some((owner, index)) = env.field_lookup(thread_class, "group") {
            let offset = env.class(owner).field(index).byte_offset.get();
            env.heap.set_field(obj, offset as usize, JavaValue::Reference(Some(group)));
        }
    }

    let obj = env.threads[tid as usize].thread_obj.unwrap();
    Ok(obj)
}

fn thread_current(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = current_thread_mirror(env, tid)?;
    Ok(Some(JavaValue::Reference(Some(obj))))
}

fn vm_thread_of(env: &JavaEnv, thread_obj: ObjRef) -> Option<u32> {
    match read_int_field_long(env, thread_obj, "eetop") {
        Some(0) | None => None,
        Some(eetop) => Some(eetop as u32 - 1),
    }
}

fn read_int_field_long(env: &JavaEnv, obj: ObjRef, name: &str) -> Option<i64> {
    let class = env.heap.class_of(obj);
    let (owner, index) = env.field_lookup(class, name)?;
    let offset = env.class(owner).field(index).byte_offset.get();
    match env.heap.get_field(obj, offset as usize, TypeKind::Long) {
        JavaValue::Long(value) => Some(value),
        _ => None,
    }
}

/// Thread.start0: create the VM thread, attach the mirror, and queue
/// `run()` on it.
fn thread_start0(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let thread_obj = expect_receiver(env, tid)?;
    let new_tid = env.create_thread();
    env.threads[new_tid as usize].thread_obj = Some(thread_obj);

    let thread_class = env.heap.class_of(thread_obj);
    if let Some((owner, index)) = env.field_lookup(thread_class, "eetop") {
        let offset = env.class(owner).field(index).byte_offset.get();
        env.heap
            .set_field(thread_obj, offset as usize, JavaValue::Long(new_tid as i64 + 1));
    }
    if let Some((owner, index)) = env.field_lookup(thread_class, "daemon") {
        let offset = env.class(owner).field(index).byte_offset.get();
        if let JavaValue::Byte(1) = env.heap.get_field(thread_obj, offset as usize, TypeKind::Boolean)
        {
            env.threads[new_tid as usize].daemon = true;
        }
    }

    let run = match env.method_lookup(thread_class, "run", "()V", true, true) {
        Some(run) => run,
        None => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/NoSuchMethodError",
                Some("Thread.run"),
            ))
        }
    };

    env.schedule_on(new_tid, run, vec![JavaValue::Reference(Some(thread_obj))]);
    Ok(None)
}

fn thread_is_alive(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let thread_obj = expect_receiver(env, tid)?;
    let alive = match vm_thread_of(env, thread_obj) {
        Some(other) => env.threads[other as usize].frames.depth() > 0,
        None => false,
    };
    Ok(Some(JavaValue::Byte(alive as i8)))
}

fn thread_interrupt0(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let thread_obj = expect_receiver(env, tid)?;
    if let Some(other) = vm_thread_of(env, thread_obj) {
        env.threads[other as usize].interrupted = true;
    }
    Ok(None)
}

fn thread_is_interrupted(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let thread_obj = expect_receiver(env, tid)?;
    let clear = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));
    let value = match vm_thread_of(env, thread_obj) {
        Some(other) => {
            let interrupted = env.threads[other as usize].interrupted;
            if clear {
                env.threads[other as usize].interrupted = false;
            }
            interrupted
        }
        None => false,
    };
    Ok(Some(JavaValue::Byte(value as i8)))
}

fn thread_holds_lock(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let target = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(obj)) => obj,
        _ => return Err(raise_npe(env, tid)),
    };
    Ok(Some(JavaValue::Byte(
        env.monitors.owned_by(&env.heap, target, tid) as i8,
    )))
}

struct SleepNative {
    started: bool,
}

impl SleepNative {
    fn new() -> Self {
        SleepNative { started: false }
    }
}

impl AsyncNative for SleepNative {
    fn poll(&mut self, env: &mut JavaEnv, tid: u32) -> VmResult<AsyncPoll> {
        if env.threads[tid as usize].interrupted {
            env.threads[tid as usize].interrupted = false;
            return Err(raise_interrupted(env, tid));
        }

        if !self.started {
            self.started = true;
            let millis = match env.native_arg(tid, 0) {
                JavaValue::Long(millis) => millis.max(0),
                _ => 0,
            };
            return Ok(AsyncPoll::NotReady(Wakeup::sleep_until(
                unix_time_us() + millis as u64 * 1000,
            )));
        }

        Ok(AsyncPoll::Ready(None))
    }
}

struct YieldNative {
    yielded: bool,
}

impl YieldNative {
    fn new() -> Self {
        YieldNative { yielded: false }
    }
}

impl AsyncNative for YieldNative {
    fn poll(&mut self, _env: &mut JavaEnv, _tid: u32) -> VmResult<AsyncPoll> {
        if self.yielded {
            Ok(AsyncPoll::Ready(None))
        } else {
            self.yielded = true;
            Ok(AsyncPoll::NotReady(Wakeup::yielding()))
        }
    }
}

// java.lang.Class

fn mirror_class(env: &mut JavaEnv, tid: u32) -> VmResult<ClassId> {
    let mirror = expect_receiver(env, tid)?;
    match unmirror_class(env, mirror) {
        Some(class) => Ok(class),
        None => Err(raise_vm_exception(
            env,
            tid,
            "java/lang/InternalError",
            Some("not a class mirror"),
        )),
    }
}

/// The synthetic descriptor behind void.class.
fn void_class(env: &mut JavaEnv) -> ClassId {
    if let Some(existing) = env.loaded_class("void") {
        return existing;
    }

    let id = ClassId(env.classes().len() as u32);
    env.classes.push(ClassDesc {
        id,
        kind: ClassKind::Primitive,
        name: Rc::from("void"),
        access: crate::class::ClassAccessFlags::PUBLIC | crate::class::ClassAccessFlags::FINAL,
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
        primitive: None,
        source_file: None,
        bootstrap_methods: Vec::new(),
        annotations: None,
        signature: None,
        nest_host: None,
        attributes: Vec::new(),
        module: None,
        indy_insns: Vec::new(),
        sigpoly_insns: Vec::new(),
    });
    env.class_table.insert((Rc::from("void"), 0), id);
    id
}

fn class_get_primitive(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let name_obj = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(obj)) => obj,
        _ => return Err(raise_npe(env, tid)),
    };
    let name = env.read_string(name_obj).unwrap_or_default();

    let class = match name.as_str() {
        "boolean" => primitive_class(env, TypeKind::Boolean),
        "byte" => primitive_class(env, TypeKind::Byte),
        "char" => primitive_class(env, TypeKind::Char),
        "short" => primitive_class(env, TypeKind::Short),
        "int" => primitive_class(env, TypeKind::Int),
        "long" => primitive_class(env, TypeKind::Long),
        "float" => primitive_class(env, TypeKind::Float),
        "double" => primitive_class(env, TypeKind::Double),
        "void" => void_class(env),
        _ => {
            return Err(raise_vm_exception(
                env,
                tid,
                "java/lang/ClassNotFoundException",
                Some(&name),
            ))
        }
    };

    let mirror = get_class_mirror(env, tid, class)?;
    Ok(Some(JavaValue::Reference(Some(mirror))))
}

fn class_get_name(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    let dotted = binary_to_dotted(&env.class(class).name);
    let name = env.intern_string(tid, &dotted)?;
    Ok(Some(JavaValue::Reference(Some(name))))
}

fn class_is_interface(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    Ok(Some(JavaValue::Byte(env.class(class).is_interface() as i8)))
}

fn class_is_array(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    Ok(Some(JavaValue::Byte(env.class(class).is_array() as i8)))
}

fn class_is_primitive(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    Ok(Some(JavaValue::Byte(
        (env.class(class).kind == ClassKind::Primitive) as i8,
    )))
}

fn class_is_instance(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    let result = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(obj)) => env.instanceof(env.heap.class_of(obj), class),
        _ => false,
    };
    Ok(Some(JavaValue::Byte(result as i8)))
}

fn class_is_assignable(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let target = mirror_class(env, tid)?;
    let source = match env.native_arg(tid, 1) {
        JavaValue::Reference(Some(mirror)) => unmirror_class(env, mirror),
        _ => return Err(raise_npe(env, tid)),
    };
    let result = match source {
        Some(source) => env.instanceof(source, target),
        None => false,
    };
    Ok(Some(JavaValue::Byte(result as i8)))
}

fn class_get_superclass(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    match env.class(class).super_class {
        Some(super_class) => {
            let mirror = get_class_mirror(env, tid, super_class)?;
            Ok(Some(JavaValue::Reference(Some(mirror))))
        }
        None => Ok(Some(JavaValue::NULL)),
    }
}

fn class_component_type(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    match env.class(class).one_fewer_dim {
        Some(component) => {
            let mirror = get_class_mirror(env, tid, component)?;
            Ok(Some(JavaValue::Reference(Some(mirror))))
        }
        None => Ok(Some(JavaValue::NULL)),
    }
}

fn class_get_modifiers(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    Ok(Some(JavaValue::Int(env.class(class).access.bits() as i32)))
}

fn class_for_name(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let name_obj = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(obj)) => obj,
        _ => return Err(raise_npe(env, tid)),
    };
    let initialize = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));

    let binary = crate::util::dotted_to_binary(&env.read_string(name_obj).unwrap_or_default());
    let class = bootstrap_lookup_class(env, tid, &binary)?;
    if initialize {
        ensure_initialized(env, tid, class)?;
    }

    let mirror = get_class_mirror(env, tid, class)?;
    Ok(Some(JavaValue::Reference(Some(mirror))))
}

fn class_constant_pool(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let class = mirror_class(env, tid)?;
    let mirror = get_constant_pool_mirror(env, tid, class)?;
    Ok(Some(JavaValue::Reference(Some(mirror))))
}

/// Shared shape of the getDeclared*0 natives: fill a rooted mirror array
/// one element at a time so earlier mirrors stay current while later ones
/// allocate.
fn declared_member_array(
    env: &mut JavaEnv,
    tid: u32,
    array_class_name: &str,
    members: Vec<u16>,
    mut mirror_of: impl FnMut(&mut JavaEnv, u32, u16) -> crate::jvm::VmResult<ObjRef>,
) -> VmResult<Option<JavaValue>> {
    let array_class = bootstrap_lookup_class(env, tid, array_class_name)?;
    let array = env.new_array(tid, array_class, members.len() as i32)?;
    let root = env.threads[tid as usize].handles.make(Some(array));

    let filled: VmResult<()> = (|| {
        for (position, member) in members.iter().enumerate() {
            let mirror = mirror_of(env, tid, *member)?;
            let array = env.threads[tid as usize].handles.get(root).unwrap();
            env.heap.set_element(
                array,
                TypeKind::Reference,
                position,
                JavaValue::Reference(Some(mirror)),
            );
        }
        Ok(())
    })();

    let array = env.threads[tid as usize].handles.get(root).unwrap();
    env.threads[tid as usize].handles.drop_handle(root);
    filled?;
    Ok(Some(JavaValue::Reference(Some(array))))
}

fn class_declared_fields(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    use crate::class::FieldAccessFlags;

    let class = mirror_class(env, tid)?;
    let public_only = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));

    let members: Vec<u16> = env
        .class(class)
        .fields
        .iter()
        .enumerate()
        .filter(|(_, field)| !public_only || field.access.contains(FieldAccessFlags::PUBLIC))
        .map(|(index, _)| index as u16)
        .collect();

    declared_member_array(
        env,
        tid,
        "[Ljava/lang/reflect/Field;",
        members,
        |env, tid, index| crate::jvm::internals::reflection::get_field_mirror(env, tid, class, index),
    )
}

fn class_declared_methods(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    use crate::class::MethodAccessFlags;

    let class = mirror_class(env, tid)?;
    let public_only = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));

    let members: Vec<u16> = env
        .class(class)
        .methods
        .iter()
        .enumerate()
        .filter(|(_, method)| {
            !method.is_ctor
                && !method.is_clinit
                && (!public_only || method.access.contains(MethodAccessFlags::PUBLIC))
        })
        .map(|(index, _)| index as u16)
        .collect();

    declared_member_array(
        env,
        tid,
        "[Ljava/lang/reflect/Method;",
        members,
        |env, tid, index| {
            crate::jvm::internals::reflection::get_method_mirror(env, tid, class, index)
        },
    )
}

fn class_declared_constructors(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    use crate::class::MethodAccessFlags;

    let class = mirror_class(env, tid)?;
    let public_only = matches!(env.native_arg(tid, 1), JavaValue::Byte(1));

    let members: Vec<u16> = env
        .class(class)
        .methods
        .iter()
        .enumerate()
        .filter(|(_, method)| {
            method.is_ctor && (!public_only || method.access.contains(MethodAccessFlags::PUBLIC))
        })
        .map(|(index, _)| index as u16)
        .collect();

    declared_member_array(
        env,
        tid,
        "[Ljava/lang/reflect/Constructor;",
        members,
        |env, tid, index| {
            crate::jvm::internals::reflection::get_method_mirror(env, tid, class, index)
        },
    )
}

/// Executable.getParameters0: build the Parameter mirrors from the
/// MethodParameters attribute (or synthesize argN names when absent).
fn executable_parameters(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    use crate::jvm::internals::reflection::{read_int_field, read_reference_field};

    let executable = expect_receiver(env, tid)?;
    let method_id = {
        let class = read_reference_field(env, executable, "clazz")
            .and_then(|mirror| unmirror_class(env, mirror));
        let slot = read_int_field(env, executable, "slot");
        match (class, slot) {
            (Some(class), Some(slot)) => (class, slot as u16),
            _ => {
                return Err(raise_vm_exception(
                    env,
                    tid,
                    "java/lang/InternalError",
                    Some("malformed Executable mirror"),
                ))
            }
        }
    };
    let method = env.class(method_id.0).method(method_id.1).clone();

    let parameter_class = bootstrap_lookup_class(env, tid, "java/lang/reflect/Parameter")?;
    crate::jvm::link::link_class(env, tid, parameter_class)?;
    let array_class = bootstrap_lookup_class(env, tid, "[Ljava/lang/reflect/Parameter;")?;

    let count = method.descriptor.args.len();
    let array = env.new_array(tid, array_class, count as i32)?;
    let array_root = env.threads[tid as usize].handles.make(Some(array));
    let executable_root = env.threads[tid as usize].handles.make(Some(executable));

    let filled: VmResult<()> = (|| {
        for index in 0..count {
            let (name_text, modifiers) = match method.parameter_names.get(index) {
                Some((Some(name), flags)) => (name.to_string(), *flags as i32),
                Some((None, flags)) => (format!("arg{}", index), *flags as i32),
                None => (format!("arg{}", index), 0),
            };

            let parameter = env.new_object(tid, parameter_class)?;
            let parameter_root = env.threads[tid as usize].handles.make(Some(parameter));
            let name = env.intern_string(tid, &name_text);
            let parameter = env.threads[tid as usize].handles.get(parameter_root).unwrap();
            env.threads[tid as usize].handles.drop_handle(parameter_root);
            let name = name?;

            if let Some((owner, field)) = env.field_lookup(parameter_class, "name") {
                let offset = env.class(owner).field(field).byte_offset.get();
                env.heap
                    .set_field(parameter, offset as usize, JavaValue::Reference(Some(name)));
            }
            if let Some((owner, field)) = env.field_lookup(parameter_class, "modifiers") {
                let offset = env.class(owner).field(field).byte_offset.get();
                env.heap.set_field(parameter, offset as usize, JavaValue::Int(modifiers));
            }
            if let Some((owner, field)) = env.field_lookup(parameter_class, "index") {
                let offset = env.class(owner).field(field).byte_offset.get();
                env.heap.set_field(parameter, offset as usize, JavaValue::Int(index as i32));
            }
            if let Some((owner, field)) = env.field_lookup(parameter_class, "executable") {
                let offset = env.class(owner).field(field).byte_offset.get();
                let executable = env.threads[tid as usize].handles.get(executable_root).unwrap();
                env.heap.set_field(
                    parameter,
                    offset as usize,
                    JavaValue::Reference(Some(executable)),
                );
            }

            let array = env.threads[tid as usize].handles.get(array_root).unwrap();
            env.heap.set_element(
                array,
                TypeKind::Reference,
                index,
                JavaValue::Reference(Some(parameter)),
            );
        }
        Ok(())
    })();

    let array = env.threads[tid as usize].handles.get(array_root).unwrap();
    env.threads[tid as usize].handles.drop_handle(executable_root);
    env.threads[tid as usize].handles.drop_handle(array_root);
    filled?;
    Ok(Some(JavaValue::Reference(Some(array))))
}

// java.lang.reflect.Array

fn array_new_instance(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let component = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(mirror)) => unmirror_class(env, mirror),
        _ => return Err(raise_npe(env, tid)),
    };
    let length = match env.native_arg(tid, 1) {
        JavaValue::Int(length) => length,
        _ => 0,
    };

    let component = match component {
        Some(component) => component,
        None => return Err(raise_npe(env, tid)),
    };

    let array_class = crate::jvm::link::array_class_of(env, tid, component)?;
    let array = env.new_array(tid, array_class, length)?;
    Ok(Some(JavaValue::Reference(Some(array))))
}

fn array_get_length(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let array = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(array)) => array,
        _ => return Err(raise_npe(env, tid)),
    };
    if !env.class(env.heap.class_of(array)).is_array() {
        return Err(raise_vm_exception(
            env,
            tid,
            "java/lang/IllegalArgumentException",
            Some("argument is not an array"),
        ));
    }
    Ok(Some(JavaValue::Int(env.heap.array_length(array))))
}

/// Module.defineModule0: record the module mirror in the VM's module table
/// so it is enumerated as a GC root. Module boundaries are not enforced.
fn module_define(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let module = match env.native_arg(tid, 0) {
        JavaValue::Reference(Some(module)) => module,
        _ => return Err(raise_npe(env, tid)),
    };
    let name = match env.native_arg(tid, 2) {
        JavaValue::Reference(Some(name)) => env.read_string(name).unwrap_or_default(),
        _ => String::new(),
    };

    debug!("defining module {}", if name.is_empty() { "<unnamed>" } else { &name });
    env.modules.insert(Rc::from(name.as_str()), module);
    Ok(None)
}

// System.in/out/err are final fields assigned through these natives

fn system_set_stream(env: &mut JavaEnv, tid: u32, field_name: &str) -> VmResult<Option<JavaValue>> {
    let value = match env.native_arg(tid, 0) {
        JavaValue::Reference(value) => value,
        _ => None,
    };

    let system = bootstrap_lookup_class(env, tid, "java/lang/System")?;
    if let Some((owner, index)) = env.field_lookup(system, field_name) {
        let offset = env.class(owner).field(index).byte_offset.get();
        crate::jvm::write_static(
            &mut env.class_mut(owner).static_data,
            offset as usize,
            JavaValue::Reference(value),
        );
    }
    Ok(None)
}

fn system_set_in(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    system_set_stream(env, tid, "in")
}

fn system_set_out(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    system_set_stream(env, tid, "out")
}

fn system_set_err(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    system_set_stream(env, tid, "err")
}

// java.lang.String

fn string_intern(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    let interned = env.intern_string_object(obj);
    Ok(Some(JavaValue::Reference(Some(interned))))
}

// Float/Double bit twiddling

fn float_to_bits(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    match env.native_arg(tid, 0) {
        JavaValue::Float(x) => Ok(Some(JavaValue::Int(x.to_bits() as i32))),
        x => panic!("floatToRawIntBits of {:?}", x),
    }
}

fn bits_to_float(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    match env.native_arg(tid, 0) {
        JavaValue::Int(x) => Ok(Some(JavaValue::Float(f32::from_bits(x as u32)))),
        x => panic!("intBitsToFloat of {:?}", x),
    }
}

fn double_to_bits(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    match env.native_arg(tid, 0) {
        JavaValue::Double(x) => Ok(Some(JavaValue::Long(x.to_bits() as i64))),
        x => panic!("doubleToRawLongBits of {:?}", x),
    }
}

fn bits_to_double(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    match env.native_arg(tid, 0) {
        JavaValue::Long(x) => Ok(Some(JavaValue::Double(f64::from_bits(x as u64)))),
        x => panic!("longBitsToDouble of {:?}", x),
    }
}

// java.lang.Runtime

fn one_processor(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Int(1)))
}

fn runtime_gc(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    env.major_gc();
    Ok(None)
}

fn runtime_free_memory(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Long(
        (env.heap.capacity() - env.heap.used()) as i64,
    )))
}

fn runtime_total_memory(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Long(env.heap.capacity() as i64)))
}

// java.lang.Throwable

fn throwable_fill_in(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let obj = expect_receiver(env, tid)?;
    Ok(Some(JavaValue::Reference(Some(obj))))
}

// java.io streams

fn stream_fd(env: &JavaEnv, stream: ObjRef) -> i32 {
    use crate::jvm::internals::reflection::read_reference_field;
    read_reference_field(env, stream, "fd")
        .and_then(|fd_obj| read_int_field(env, fd_obj, "fd"))
        .unwrap_or(-1)
}

fn fos_write_bytes(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let stream = expect_receiver(env, tid)?;
    let (array, offset, length) = match (
        env.native_arg(tid, 1),
        env.native_arg(tid, 2),
        env.native_arg(tid, 3),
    ) {
        (JavaValue::Reference(Some(array)), JavaValue::Int(offset), JavaValue::Int(length)) => {
            (array, offset, length)
        }
        (JavaValue::Reference(None), ..) => return Err(raise_npe(env, tid)),
        _ => panic!("writeBytes signature mismatch"),
    };

    let array_length = env.heap.array_length(array);
    if offset < 0 || length < 0 || offset as i64 + length as i64 > array_length as i64 {
        return Err(raise_vm_exception(
            env,
            tid,
            "java/lang/ArrayIndexOutOfBoundsException",
            Some("write range out of bounds"),
        ));
    }

    let mut bytes = Vec::with_capacity(length as usize);
    for index in 0..length {
        match env.heap.get_element(array, TypeKind::Byte, (offset + index) as usize) {
            JavaValue::Byte(byte) => bytes.push(byte as u8),
            _ => unreachable!(),
        }
    }

    match stream_fd(env, stream) {
        2 => env.stdio.write_stderr(&bytes),
        _ => env.stdio.write_stdout(&bytes),
    }
    Ok(None)
}

fn fos_write_one(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let stream = expect_receiver(env, tid)?;
    let byte = match env.native_arg(tid, 1) {
        JavaValue::Int(value) => value as u8,
        _ => 0,
    };
    match stream_fd(env, stream) {
        2 => env.stdio.write_stderr(&[byte]),
        _ => env.stdio.write_stdout(&[byte]),
    }
    Ok(None)
}

fn fis_read_bytes(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    let _stream = expect_receiver(env, tid)?;
    let (array, offset, length) = match (
        env.native_arg(tid, 1),
        env.native_arg(tid, 2),
        env.native_arg(tid, 3),
    ) {
        (JavaValue::Reference(Some(array)), JavaValue::Int(offset), JavaValue::Int(length)) => {
            (array, offset, length)
        }
        _ => return Err(raise_npe(env, tid)),
    };

    let mut buffer = vec![0u8; length.max(0) as usize];
    let read = env.stdio.read_stdin(&mut buffer);
    if read == 0 {
        return Ok(Some(JavaValue::Int(-1)));
    }

    for (index, byte) in buffer[..read].iter().enumerate() {
        env.heap.set_element(
            array,
            TypeKind::Byte,
            (offset as usize) + index,
            JavaValue::Byte(*byte as i8),
        );
    }
    Ok(Some(JavaValue::Int(read as i32)))
}

fn fis_available(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Int(env.stdio.poll_stdin() as i32)))
}

fn fd_get_handle(_env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Long(-1)))
}

// java.lang.ref.Reference

struct ReferencePendingNative;

impl AsyncNative for ReferencePendingNative {
    fn poll(&mut self, env: &mut JavaEnv, _tid: u32) -> VmResult<AsyncPoll> {
        if env.reference_pending_list.is_some() {
            Ok(AsyncPoll::Ready(None))
        } else {
            Ok(AsyncPoll::NotReady(Wakeup {
                kind: WakeupKind::ReferencePending,
                wakeup_us: 0,
                monitor: None,
                ready: false,
            }))
        }
    }
}

fn reference_take_pending(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Reference(env.reference_pending_list.take())))
}

fn reference_has_pending(env: &mut JavaEnv, _tid: u32) -> VmResult<Option<JavaValue>> {
    Ok(Some(JavaValue::Byte(env.reference_pending_list.is_some() as i8)))
}

// jdk.internal.reflect.Reflection

fn reflection_caller_class(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
    // Frame layout: [.., caller's caller, caller, this native frame]
    let frames = &env.threads[tid as usize].frames.frames;
    let class = frames
        .iter()
        .rev()
        .skip(2)
        .map(|frame| frame.method.class)
        .next();

    match class {
        Some(class) => {
            let mirror = get_class_mirror(env, tid, class)?;
            Ok(Some(JavaValue::Reference(Some(mirror))))
        }
        None => Ok(Some(JavaValue::NULL)),
    }
}

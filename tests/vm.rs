//! End-to-end tests driving the VM through the embedder API with class
//! files assembled in memory.

mod common;

use common::*;

use excelsa::jvm::call::NativeMethod;
use excelsa::jvm::class::ClassId;
use excelsa::jvm::link::{bootstrap_lookup_class, define_bootstrap_class, ensure_initialized};
use excelsa::jvm::mem::JavaValue;
use excelsa::jvm::{JavaEnv, VmResult};

use lazy_static::lazy_static;
use std::sync::Mutex;

fn define(env: &mut JavaEnv, builder: ClassBuilder) -> ClassId {
    let tid = env.main_thread();
    let name = builder.name.clone();
    define_bootstrap_class(env, tid, &name, &builder.build()).unwrap()
}

fn call_static(
    env: &mut JavaEnv,
    class: ClassId,
    name: &str,
    descriptor: &str,
    args: Vec<JavaValue>,
) -> (Option<JavaValue>, Option<String>) {
    let method = env
        .method_lookup(class, name, descriptor, false, false)
        .expect("method not found");
    let record = env.schedule(method, args);
    run_to_completion(env);

    let (value, exception) = env.record_result(record).expect("record not done");
    let exception = exception.map(|obj| {
        let class_name = env.class(env.heap.class_of(obj)).name.to_string();
        let message =
            excelsa::jvm::internals::reflection::read_reference_field(env, obj, "detailMessage")
                .and_then(|text| env.read_string(text));
        match message {
            Some(message) => format!("{}: {}", class_name, message),
            None => class_name,
        }
    });
    (value, exception)
}

#[test]
fn hello_world_prints_through_the_host_hook() {
    fn print_native(env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
        if let JavaValue::Reference(Some(text)) = env.native_arg(tid, 0) {
            if let Some(text) = env.read_string(text) {
                env.stdio.write_stdout(text.as_bytes());
            }
        }
        Ok(None)
    }

    let (mut env, stdout) = boot_env();
    env.natives.register(
        "Main",
        "print",
        "(Ljava/lang/String;)V",
        NativeMethod::Sync(print_native),
    );

    let mut main = ClassBuilder::new("Main", Some("java/lang/Object"));
    let hello = main.pool.string("hello\n");
    let print = main.pool.method_ref("Main", "print", "(Ljava/lang/String;)V");
    main.abstract_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "print", "(Ljava/lang/String;)V");
    main.method(
        ACC_PUBLIC | ACC_STATIC,
        "main",
        "([Ljava/lang/String;)V",
        CodeSpec::new(
            1,
            1,
            vec![0x12, hello as u8, 0xb8, (print >> 8) as u8, print as u8, 0xb1],
        ),
    );
    let main_class = define(&mut env, main);

    let (_, exception) = call_static(
        &mut env,
        main_class,
        "main",
        "([Ljava/lang/String;)V",
        vec![JavaValue::NULL],
    );
    assert_eq!(exception, None);
    assert_eq!(String::from_utf8_lossy(&stdout.lock().unwrap()), "hello\n");

    for expected in ["java/lang/Object", "java/lang/String", "Main"] {
        assert!(env.loaded_class(expected).is_some(), "missing {}", expected);
    }
}

#[test]
fn integer_division_by_zero_raises_arithmetic_exception() {
    let (mut env, _) = boot_env();

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    // static int f(int x) { return 10 / x; }
    test.method(
        ACC_PUBLIC | ACC_STATIC,
        "f",
        "(I)I",
        CodeSpec::new(2, 1, vec![0x10, 10, 0x1a, 0x6c, 0xac]),
    );
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "f", "(I)I", vec![JavaValue::Int(5)]);
    assert_eq!(value, Some(JavaValue::Int(2)));
    assert_eq!(exception, None);

    let (_, exception) = call_static(&mut env, class, "f", "(I)I", vec![JavaValue::Int(0)]);
    assert_eq!(
        exception.as_deref(),
        Some("java/lang/ArithmeticException: / by zero")
    );
}

#[test]
fn null_array_length_gets_an_extended_message() {
    let (mut env, _) = boot_env();

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    // static int g(int[] a) { return a.length; }
    let mut code = CodeSpec::new(1, 1, vec![0x2a, 0xbe, 0xac]);
    code.local_variables.push((0, 3, "a".to_string(), "[I".to_string(), 0));
    test.method(ACC_PUBLIC | ACC_STATIC, "g", "([I)I", code);
    let class = define(&mut env, test);

    let (_, exception) = call_static(&mut env, class, "g", "([I)I", vec![JavaValue::NULL]);
    let message = exception.expect("expected an exception");
    assert!(message.starts_with("java/lang/NullPointerException"), "{}", message);
    assert!(message.contains("read the array length"), "{}", message);
    assert!(message.contains("\"a\""), "{}", message);
}

#[test]
fn loops_with_stack_map_frames() {
    let (mut env, _) = boot_env();

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    // static int fact(int n) { int r = 1; while (n > 0) { r *= n; n--; } return r; }
    #[rustfmt::skip]
    let code = vec![
        0x04,                   // 0: iconst_1
        0x3c,                   // 1: istore_1
        0x1a,                   // 2: iload_0        <- loop header
        0x9e, 0x00, 0x0d,       // 3: ifle -> 16
        0x1b,                   // 6: iload_1
        0x1a,                   // 7: iload_0
        0x68,                   // 8: imul
        0x3c,                   // 9: istore_1
        0x84, 0x00, 0xff,       // 10: iinc 0, -1
        0xa7, 0xff, 0xf5,       // 13: goto -> 2
        0x1b,                   // 16: iload_1
        0xac,                   // 17: ireturn
    ];
    let mut spec = CodeSpec::new(2, 2, code);
    // append_frame at pc 2 adding an int local; same_frame at pc 16
    spec.stack_map_frames.push(vec![252, 0, 2, 1]);
    spec.stack_map_frames.push(vec![13]);
    test.method(ACC_PUBLIC | ACC_STATIC, "fact", "(I)I", spec);
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "fact", "(I)I", vec![JavaValue::Int(5)]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(120)));
}

#[test]
fn exception_table_catches_and_clears_the_stack() {
    let (mut env, _) = boot_env();

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    let arithmetic = test.pool.class("java/lang/ArithmeticException");

    // static int t() { try { return 10 / 0; } catch (ArithmeticException e) { return 7; } }
    #[rustfmt::skip]
    let code = vec![
        0x10, 10,               // 0: bipush 10
        0x03,                   // 2: iconst_0
        0x6c,                   // 3: idiv
        0xac,                   // 4: ireturn
        0x4c,                   // 5: astore_1     <- handler
        0x10, 7,                // 6: bipush 7
        0xac,                   // 8: ireturn
    ];
    let mut spec = CodeSpec::new(2, 2, code);
    spec.exception_table.push((0, 5, 5, "java/lang/ArithmeticException".to_string()));
    // same_locals_1_stack_item at pc 5 with the exception on the stack
    spec.stack_map_frames.push(vec![64 + 5, 7, (arithmetic >> 8) as u8, arithmetic as u8]);
    test.method(ACC_PUBLIC | ACC_STATIC, "t", "()I", spec);
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "t", "()I", vec![]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(7)));
}

#[test]
fn virtual_dispatch_selects_the_override() {
    let (mut env, _) = boot_env();

    let mut a = ClassBuilder::new("A", Some("java/lang/Object"));
    a.trivial_ctor();
    a.method(ACC_PUBLIC, "v", "()I", CodeSpec::new(1, 1, vec![0x04, 0xac]));
    define(&mut env, a);

    let mut b = ClassBuilder::new("B", Some("A"));
    b.trivial_ctor();
    b.method(ACC_PUBLIC, "v", "()I", CodeSpec::new(1, 1, vec![0x05, 0xac]));
    define(&mut env, b);

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    let b_class = test.pool.class("B");
    let b_init = test.pool.method_ref("B", "<init>", "()V");
    let a_v = test.pool.method_ref("A", "v", "()I");
    // static int call() { return new B().v(); }
    #[rustfmt::skip]
    let code = vec![
        0xbb, (b_class >> 8) as u8, b_class as u8,  // new B
        0x59,                                        // dup
        0xb7, (b_init >> 8) as u8, b_init as u8,     // invokespecial B.<init>
        0xb6, (a_v >> 8) as u8, a_v as u8,           // invokevirtual A.v
        0xac,
    ];
    test.method(ACC_PUBLIC | ACC_STATIC, "call", "()I", CodeSpec::new(2, 0, code));
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "call", "()I", vec![]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(2)));
}

#[test]
fn interface_dispatch_through_the_itable() {
    let (mut env, _) = boot_env();

    let mut iface = ClassBuilder::interface("I");
    iface.abstract_method(ACC_PUBLIC | ACC_ABSTRACT, "m", "()I");
    define(&mut env, iface);

    let mut c = ClassBuilder::new("C", Some("java/lang/Object"));
    c.interfaces.push("I".to_string());
    c.trivial_ctor();
    c.method(ACC_PUBLIC, "m", "()I", CodeSpec::new(1, 1, vec![0x10, 7, 0xac]));
    define(&mut env, c);

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    let c_class = test.pool.class("C");
    let c_init = test.pool.method_ref("C", "<init>", "()V");
    let i_m = test.pool.interface_method_ref("I", "m", "()I");
    #[rustfmt::skip]
    let code = vec![
        0xbb, (c_class >> 8) as u8, c_class as u8,
        0x59,
        0xb7, (c_init >> 8) as u8, c_init as u8,
        0xb9, (i_m >> 8) as u8, i_m as u8, 1, 0,     // invokeinterface I.m
        0xac,
    ];
    test.method(ACC_PUBLIC | ACC_STATIC, "call", "()I", CodeSpec::new(2, 0, code));
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "call", "()I", vec![]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(7)));
}

#[test]
fn statics_are_initialized_on_first_use() {
    let (mut env, _) = boot_env();

    let mut s = ClassBuilder::new("S", Some("java/lang/Object"));
    let x_ref = s.pool.field_ref("S", "X", "I");
    s.field(ACC_STATIC, "X", "I");
    // static { X = 42; }
    s.method(
        ACC_STATIC,
        "<clinit>",
        "()V",
        CodeSpec::new(1, 0, vec![0x10, 42, 0xb3, (x_ref >> 8) as u8, x_ref as u8, 0xb1]),
    );
    define(&mut env, s);

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    let x_ref = test.pool.field_ref("S", "X", "I");
    test.method(
        ACC_PUBLIC | ACC_STATIC,
        "read",
        "()I",
        CodeSpec::new(1, 0, vec![0xb2, (x_ref >> 8) as u8, x_ref as u8, 0xac]),
    );
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "read", "()I", vec![]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(42)));
}

#[test]
fn string_constants_are_interned() {
    let (mut env, _) = boot_env();

    let mut test = ClassBuilder::new("Test", Some("java/lang/Object"));
    let text = test.pool.string("dup");
    // static int same() { return "dup" == "dup" ? 1 : 0; }
    #[rustfmt::skip]
    let code = vec![
        0x12, text as u8,       // 0: ldc
        0x12, text as u8,       // 2: ldc
        0xa5, 0x00, 0x05,       // 4: if_acmpeq -> 9
        0x03,                   // 7: iconst_0
        0xac,                   // 8: ireturn
        0x04,                   // 9: iconst_1
        0xac,                   // 10: ireturn
    ];
    let mut spec = CodeSpec::new(2, 0, code);
    spec.stack_map_frames.push(vec![9]); // same_frame at pc 9
    test.method(ACC_PUBLIC | ACC_STATIC, "same", "()I", spec);
    let class = define(&mut env, test);

    let (value, exception) = call_static(&mut env, class, "same", "()I", vec![]);
    assert_eq!(exception, None);
    assert_eq!(value, Some(JavaValue::Int(1)));
}

#[test]
fn synchronized_recursion_restores_the_mark_word() {
    let (mut env, _) = boot_env();

    let mut r = ClassBuilder::new("R", Some("java/lang/Object"));
    r.trivial_ctor();
    let r_r = r.pool.method_ref("R", "r", "(I)V");
    // synchronized void r(int n) { if (n > 0) r(n - 1); }
    #[rustfmt::skip]
    let code = vec![
        0x1b,                   // 0: iload_1
        0x9e, 0x00, 0x0a,       // 1: ifle -> 11
        0x2a,                   // 4: aload_0
        0x1b,                   // 5: iload_1
        0x04,                   // 6: iconst_1
        0x64,                   // 7: isub
        0xb6, (r_r >> 8) as u8, r_r as u8, // 8: invokevirtual R.r
        0xb1,                   // 11: return
    ];
    let mut spec = CodeSpec::new(3, 2, code);
    spec.stack_map_frames.push(vec![11]); // same_frame at pc 11
    r.method(ACC_PUBLIC | ACC_SYNCHRONIZED, "r", "(I)V", spec);
    let r_class = define(&mut env, r);

    let tid = env.main_thread();
    ensure_initialized(&mut env, tid, r_class).unwrap();
    let receiver = env.new_object(tid, r_class).unwrap();
    let mark_before = env.heap.mark_word(receiver);

    let method = env.method_lookup(r_class, "r", "(I)V", false, false).unwrap();
    let record = env.schedule(
        method,
        vec![JavaValue::Reference(Some(receiver)), JavaValue::Int(5)],
    );
    run_to_completion(&mut env);

    let (_, exception) = env.record_result(record).unwrap();
    assert!(exception.is_none());
    assert_eq!(env.heap.mark_word(receiver), mark_before);
}

lazy_static! {
    static ref TICKS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
}

#[test]
fn cooperative_scheduling_interleaves_runnable_threads() {
    fn tick(_env: &mut JavaEnv, tid: u32) -> VmResult<Option<JavaValue>> {
        TICKS.lock().unwrap().push(tid);
        Ok(None)
    }

    let (mut env, _) = boot_env();
    env.natives.register("Probe", "tick", "()V", NativeMethod::Sync(tick));

    let mut probe = ClassBuilder::new("Probe", Some("java/lang/Object"));
    let tick_ref = probe.pool.method_ref("Probe", "tick", "()V");
    let yield_ref = probe.pool.method_ref("java/lang/Thread", "yield", "()V");
    probe.abstract_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "tick", "()V");
    // static void spin() { tick(); yield(); tick(); yield(); tick(); }
    #[rustfmt::skip]
    let code = vec![
        0xb8, (tick_ref >> 8) as u8, tick_ref as u8,
        0xb8, (yield_ref >> 8) as u8, yield_ref as u8,
        0xb8, (tick_ref >> 8) as u8, tick_ref as u8,
        0xb8, (yield_ref >> 8) as u8, yield_ref as u8,
        0xb8, (tick_ref >> 8) as u8, tick_ref as u8,
        0xb1,
    ];
    probe.method(ACC_PUBLIC | ACC_STATIC, "spin", "()V", CodeSpec::new(0, 0, code));
    let probe_class = define(&mut env, probe);

    let tid = env.main_thread();
    ensure_initialized(&mut env, tid, probe_class).unwrap();
    let spin = env.method_lookup(probe_class, "spin", "()V", false, false).unwrap();

    TICKS.lock().unwrap().clear();
    let worker_a = env.create_thread();
    let worker_b = env.create_thread();
    let record_a = env.schedule_on(worker_a, spin, vec![]);
    let record_b = env.schedule_on(worker_b, spin, vec![]);
    run_to_completion(&mut env);

    use excelsa::jvm::scheduler::SchedulerResult;
    assert_eq!(env.record_status(record_a), SchedulerResult::Done);
    assert_eq!(env.record_status(record_b), SchedulerResult::Done);
    assert!(env.record_result(record_a).unwrap().1.is_none());
    assert!(env.record_result(record_b).unwrap().1.is_none());

    let ticks = TICKS.lock().unwrap().clone();
    assert_eq!(ticks.len(), 6);
    // Both threads progressed in alternation rather than one running to
    // completion first
    assert_ne!(ticks[0], ticks[1]);
    assert_eq!(&ticks[2..4], &ticks[..2]);
    assert_eq!(&ticks[4..6], &ticks[..2]);
}

#[test]
fn subtype_tests_match_a_naive_walk() {
    let (mut env, _) = boot_env();

    let mut iface_p = ClassBuilder::interface("P");
    iface_p.abstract_method(ACC_PUBLIC | ACC_ABSTRACT, "p", "()V");
    define(&mut env, iface_p);

    let mut iface_q = ClassBuilder::interface("Q");
    iface_q.interfaces.push("P".to_string());
    define(&mut env, iface_q);

    let mut a = ClassBuilder::new("A", Some("java/lang/Object"));
    a.trivial_ctor();
    define(&mut env, a);

    let mut b = ClassBuilder::new("B", Some("A"));
    b.interfaces.push("Q".to_string());
    b.trivial_ctor();
    b.method(ACC_PUBLIC, "p", "()V", CodeSpec::new(0, 1, vec![0xb1]));
    define(&mut env, b);

    let mut c = ClassBuilder::new("C", Some("B"));
    c.trivial_ctor();
    define(&mut env, c);

    fn naive_instanceof(env: &JavaEnv, instance: ClassId, target: ClassId) -> bool {
        if instance == target {
            return true;
        }
        let desc = env.class(instance);
        for interface in &desc.interfaces {
            if naive_instanceof(env, *interface, target) {
                return true;
            }
        }
        match desc.super_class {
            Some(super_class) => naive_instanceof(env, super_class, target),
            None => false,
        }
    }

    let names = ["java/lang/Object", "P", "Q", "A", "B", "C"];
    let mut ids: Vec<ClassId> = names
        .iter()
        .map(|name| env.loaded_class(name).unwrap())
        .collect();

    // Synthesized array classes carry Cloneable/Serializable as real
    // interface links with itable entries, not just instanceof behavior
    let tid = env.main_thread();
    let int_array = bootstrap_lookup_class(&mut env, tid, "[I").unwrap();
    let b_array = bootstrap_lookup_class(&mut env, tid, "[LB;").unwrap();
    let cloneable = env.loaded_class("java/lang/Cloneable").unwrap();
    let serializable = env.loaded_class("java/io/Serializable").unwrap();

    for array in [int_array, b_array] {
        assert!(
            env.class(array).interfaces.contains(&cloneable),
            "{} lost its Cloneable interface link",
            env.class(array).name
        );
        assert!(
            env.class(array).interfaces.contains(&serializable),
            "{} lost its Serializable interface link",
            env.class(array).name
        );
        assert!(env.class(array).itable_for(cloneable).is_some());
        assert!(env.class(array).itable_for(serializable).is_some());
        assert!(env.instanceof(array, cloneable));
        assert!(env.instanceof(array, serializable));
    }

    // The naive walk understands interface/super links but not array
    // covariance, so arrays join the sample as instances against the
    // non-array targets only
    ids.push(cloneable);
    ids.push(serializable);
    let instances: Vec<ClassId> =
        ids.iter().copied().chain([int_array, b_array]).collect();

    for instance in &instances {
        for target in &ids {
            assert_eq!(
                env.instanceof(*instance, *target),
                naive_instanceof(&env, *instance, *target),
                "instanceof mismatch for ({:?}, {:?})",
                instance,
                target
            );
        }
    }
}

#[test]
fn malformed_class_files_raise_class_format_error() {
    let (mut env, _) = boot_env();
    let tid = env.main_thread();

    // Truncated: magic only
    let result = define_bootstrap_class(&mut env, tid, "Broken", &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert!(result.is_err());

    let exception = env.threads[tid as usize].current_exception.take().unwrap();
    let name = env.class(env.heap.class_of(exception)).name.to_string();
    assert_eq!(name, "java/lang/ClassFormatError");
}

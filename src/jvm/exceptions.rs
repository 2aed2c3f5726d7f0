use std::rc::Rc;

use crate::analysis::extended_npe_message;
use crate::jvm::class::{ClassId, ClassState, Method};
use crate::jvm::link::bootstrap_lookup_class;
use crate::jvm::mem::{JavaValue, ObjRef};
use crate::jvm::{JavaEnv, Raised};
use crate::util::binary_to_dotted;

/// Store a throwable in the thread's current-exception slot. Unwinding
/// happens in the interpreter when control returns to it.
pub fn raise_exception_object(env: &mut JavaEnv, tid: u32, exception: ObjRef) -> Raised {
    if log::log_enabled!(log::Level::Debug) {
        let class_name = env.class(env.heap.class_of(exception)).name.clone();
        match faulting_site(env, tid) {
            Some((method, line)) => match line {
                Some(line) => debug!("raising {} at {}:{}", class_name, method, line),
                None => debug!("raising {} at {}", class_name, method),
            },
            None => debug!("raising {}", class_name),
        }
    }
    env.threads[tid as usize].current_exception = Some(exception);
    Raised
}

/// Method name and source line of the topmost plain frame, for diagnostics.
fn faulting_site(env: &JavaEnv, tid: u32) -> Option<(String, Option<u16>)> {
    let frame = env.threads[tid as usize]
        .frames
        .frames
        .iter()
        .rev()
        .find(|frame| !frame.is_native())?;
    let line = frame
        .method
        .code
        .as_ref()
        .and_then(|code| code.line_for_insn(frame.pc() as usize));
    Some((format!("{}.{}", env.class(frame.method.class).name, frame.method.name), line))
}

/// Construct and raise a VM-generated exception. The message is written
/// straight into `Throwable.detailMessage`; constructors only run for
/// user-level `new`/`athrow`. Core exception classes must be present on the
/// bootstrap classpath.
pub fn raise_vm_exception(
    env: &mut JavaEnv,
    tid: u32,
    class_name: &str,
    message: Option<&str>,
) -> Raised {
    let class = match bootstrap_lookup_class(env, tid, class_name) {
        Ok(class) => class,
        Err(_) => panic!("cannot raise {}: class not found on bootstrap classpath", class_name),
    };
    if env.class(class).state.get() == ClassState::LinkageError {
        panic!("cannot raise {}: class failed to link", class_name);
    }

    let exception = match env.new_object(tid, class) {
        Ok(obj) => obj,
        Err(raised) => return raised,
    };

    if let Some(message) = message {
        // Hold the fresh object across the string allocation
        let handle = env.threads[tid as usize].handles.make(Some(exception));
        let text = env.make_string(tid, message);
        let exception = env.threads[tid as usize].handles.get(handle).unwrap();
        env.threads[tid as usize].handles.drop_handle(handle);

        match text {
            Ok(text) => {
                if let Some((owner, index)) = env.field_lookup(class, "detailMessage") {
                    let offset = env.class(owner).field(index).byte_offset.get();
                    env.heap
                        .set_field(exception, offset as usize, JavaValue::Reference(Some(text)));
                }
                return raise_exception_object(env, tid, exception);
            }
            Err(raised) => return raised,
        }
    }

    raise_exception_object(env, tid, exception)
}

pub fn raise_div0(env: &mut JavaEnv, tid: u32) -> Raised {
    raise_vm_exception(env, tid, "java/lang/ArithmeticException", Some("/ by zero"))
}

pub fn raise_npe(env: &mut JavaEnv, tid: u32) -> Raised {
    raise_vm_exception(env, tid, "java/lang/NullPointerException", None)
}

/// NPE with the extended message synthesized from the analyzer's operand
/// source tags.
pub fn raise_npe_extended(env: &mut JavaEnv, tid: u32, method: &Rc<Method>, insn: u32) -> Raised {
    let message = match &method.code {
        Some(code) => {
            let class_name = env.class(method.class).name.clone();
            let pool = &env.class(method.class).pool;
            Some(extended_npe_message(code, pool, &class_name, &method.name, insn))
        }
        None => None,
    };

    raise_vm_exception(env, tid, "java/lang/NullPointerException", message.as_deref())
}

pub fn raise_array_index_oob(env: &mut JavaEnv, tid: u32, index: i32, length: i32) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/ArrayIndexOutOfBoundsException",
        Some(&format!("Index {} out of bounds for length {}", index, length)),
    )
}

pub fn raise_negative_array_size(env: &mut JavaEnv, tid: u32, count: i32) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/NegativeArraySizeException",
        Some(&count.to_string()),
    )
}

pub fn raise_array_store(env: &mut JavaEnv, tid: u32, stored: ClassId) -> Raised {
    let name = binary_to_dotted(&env.class(stored).name);
    raise_vm_exception(env, tid, "java/lang/ArrayStoreException", Some(&name))
}

pub fn raise_class_cast(env: &mut JavaEnv, tid: u32, from: ClassId, to: ClassId) -> Raised {
    let message = format!(
        "class {} cannot be cast to class {}",
        binary_to_dotted(&env.class(from).name),
        binary_to_dotted(&env.class(to).name)
    );
    raise_vm_exception(env, tid, "java/lang/ClassCastException", Some(&message))
}

pub fn raise_illegal_monitor_state(env: &mut JavaEnv, tid: u32) -> Raised {
    raise_vm_exception(env, tid, "java/lang/IllegalMonitorStateException", None)
}

pub fn raise_incompatible_class_change(env: &mut JavaEnv, tid: u32, complaint: &str) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/IncompatibleClassChangeError",
        Some(complaint),
    )
}

pub fn raise_abstract_method_error(env: &mut JavaEnv, tid: u32, method: &Rc<Method>) -> Raised {
    let message = format!(
        "Found no concrete implementation of {}.{}",
        env.class(method.class).name,
        method.name
    );
    raise_vm_exception(env, tid, "java/lang/AbstractMethodError", Some(&message))
}

pub fn raise_unsatisfied_link(env: &mut JavaEnv, tid: u32, method: &Rc<Method>) -> Raised {
    let message = format!(
        "Method {} on class {} with descriptor {}",
        method.name,
        env.class(method.class).name,
        method.descriptor_text
    );
    warn!("{}", message);
    raise_vm_exception(env, tid, "java/lang/UnsatisfiedLinkError", Some(&message))
}

pub fn raise_stack_overflow(env: &mut JavaEnv, tid: u32) -> Raised {
    env.threads[tid as usize].current_exception = None;
    match env.threads[tid as usize].stack_overflow_error {
        Some(error) => raise_exception_object(env, tid, error),
        None => panic!("stack overflow before the singleton was allocated"),
    }
}

pub fn raise_interrupted(env: &mut JavaEnv, tid: u32) -> Raised {
    raise_vm_exception(env, tid, "java/lang/InterruptedException", None)
}

pub fn raise_illegal_state(env: &mut JavaEnv, tid: u32, message: &str) -> Raised {
    raise_vm_exception(env, tid, "java/lang/IllegalStateException", Some(message))
}

pub fn raise_class_not_found(env: &mut JavaEnv, tid: u32, name: &str) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/ClassNotFoundException",
        Some(&binary_to_dotted(name)),
    )
}

pub fn raise_class_format_error(env: &mut JavaEnv, tid: u32, message: &str) -> Raised {
    raise_vm_exception(env, tid, "java/lang/ClassFormatError", Some(message))
}

pub fn raise_class_circularity(env: &mut JavaEnv, tid: u32, name: &str) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/ClassCircularityError",
        Some(&binary_to_dotted(name)),
    )
}

pub fn raise_no_class_def_found(env: &mut JavaEnv, tid: u32, name: &str) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/NoClassDefFoundError",
        Some(&binary_to_dotted(name)),
    )
}

pub fn raise_wrong_method_type(env: &mut JavaEnv, tid: u32, message: &str) -> Raised {
    raise_vm_exception(
        env,
        tid,
        "java/lang/invoke/WrongMethodTypeException",
        Some(message),
    )
}

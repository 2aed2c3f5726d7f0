/// Java calling convention:
///  - The caller's outgoing arguments become the callee's leading locals in
///    place (the frame layout is `{ locals | header | operand stack }` and a
///    callee's locals overlap the caller's operand stack top).
///  - A returned value is pushed onto the caller's operand stack.
///
/// Invocation types:
///  - Virtual: instance dispatch through the receiver class's vtable, with a
///    per-site monomorphic inline cache.
///  - Interface: dispatch through the receiver's itable for the named
///    interface.
///  - Special: direct call of the resolved method (constructors, private
///    methods, super calls).
///  - Static: direct call, after ensuring the class is initialized.
///  - Dynamic: call-site object produced by a bootstrap method, cached in
///    the instruction.
///  - Signature polymorphic: MethodHandle.invoke/invokeExact, dispatched
///    through the handle's member with per-site MethodType caching.
mod interpreter;
mod native;

pub use interpreter::*;
pub use native::*;

use crate::jvm::mem::JavaValue;
use crate::jvm::scheduler::Wakeup;

/// Outcome of driving a thread's frame stack.
#[derive(Debug)]
pub enum ExecEvent {
    /// The call at the base depth completed normally.
    Finished(Option<JavaValue>),
    /// The thread suspended; re-enter `execute` to resume at the same point.
    Suspended(Wakeup),
}

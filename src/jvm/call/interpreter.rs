use std::ops::{BitAnd, BitOr, BitXor};
use std::rc::Rc;

use crate::class::ClassAccessFlags;
use crate::instruction::{InlineCache, InsnKind, Instruction};
use crate::jvm::call::{AsyncPoll, ExecEvent, NativeMethod};
use crate::jvm::class::{ClassId, CpEntry, Method, MethodId};
use crate::jvm::exceptions::*;
use crate::jvm::internals::method_handles;
use crate::jvm::internals::reflection::get_class_mirror;
use crate::jvm::link::{
    array_class_of, bootstrap_lookup_class, ensure_initialized, resolve_class_ref, resolve_field,
    resolve_method,
};
use crate::jvm::mem::{FieldDescriptor, JavaValue, MethodDescriptor, MonitorError, ObjRef, TypeKind};
use crate::jvm::scheduler::{Wakeup, WakeupKind};
use crate::jvm::thread::{FrameData, THREAD_FUEL};
use crate::jvm::{JavaEnv, Raised, VmResult};
use crate::util::unix_time_us;

enum SuspendOutcome {
    /// Leave the interpreter with this wakeup.
    Park(Wakeup),
    /// Continue executing (synchronous spin or elapsed wait).
    Resume,
    /// The suspension was illegal and the raised exception escaped the base
    /// frame.
    Unwound,
}

/// What a plain frame's dispatch loop handed back to the frame driver.
enum Dispatch {
    /// Method completed; the frame is still on the stack.
    Return(Option<JavaValue>),
    /// Invoke another method. Arguments have been popped from the caller's
    /// logical stack but still sit in the buffer at `arg_base`; the caller's
    /// pc already points past the call site.
    Call { target: Rc<Method>, arg_base: u32 },
    /// Thread must leave the interpreter.
    Suspend(Wakeup),
    /// An exception is pending on the thread.
    Pending,
}

/// Original local-slot positions of a method's invocation arguments (the
/// receiver counts), and the number of original slots they cover. Wide
/// arguments own two original slots but one logical stack slot.
fn argument_slots(method: &Method) -> (Vec<u16>, u16) {
    let mut positions = Vec::with_capacity(method.invocation_argc());
    let mut slot = 0u16;
    if !method.is_static() {
        positions.push(slot);
        slot += 1;
    }
    for arg in &method.descriptor.args {
        positions.push(slot);
        slot += 1 + arg.is_wide() as u16;
    }
    (positions, slot)
}

macro_rules! binary_int {
    ($env:expr, $tid:expr, $sb:expr, $sp:ident, $op:ident) => {{
        $sp -= 1;
        let b = $env.threads[$tid as usize].frames.slot($sb + $sp as u32) as i32;
        $sp -= 1;
        let a = $env.threads[$tid as usize].frames.slot($sb + $sp as u32) as i32;
        $env.threads[$tid as usize]
            .frames
            .set_slot($sb + $sp as u32, a.$op(b) as i64 as u64);
        $sp += 1;
    }};
}

macro_rules! binary_long {
    ($env:expr, $tid:expr, $sb:expr, $sp:ident, $op:ident) => {{
        $sp -= 1;
        let b = $env.threads[$tid as usize].frames.slot($sb + $sp as u32) as i64;
        $sp -= 1;
        let a = $env.threads[$tid as usize].frames.slot($sb + $sp as u32) as i64;
        $env.threads[$tid as usize]
            .frames
            .set_slot($sb + $sp as u32, a.$op(b) as u64);
        $sp += 1;
    }};
}

macro_rules! binary_float {
    ($env:expr, $tid:expr, $sb:expr, $sp:ident, $op:tt) => {{
        $sp -= 1;
        let b = f32::from_bits($env.threads[$tid as usize].frames.slot($sb + $sp as u32) as u32);
        $sp -= 1;
        let a = f32::from_bits($env.threads[$tid as usize].frames.slot($sb + $sp as u32) as u32);
        $env.threads[$tid as usize]
            .frames
            .set_slot($sb + $sp as u32, (a $op b).to_bits() as u64);
        $sp += 1;
    }};
}

macro_rules! binary_double {
    ($env:expr, $tid:expr, $sb:expr, $sp:ident, $op:tt) => {{
        $sp -= 1;
        let b = f64::from_bits($env.threads[$tid as usize].frames.slot($sb + $sp as u32));
        $sp -= 1;
        let a = f64::from_bits($env.threads[$tid as usize].frames.slot($sb + $sp as u32));
        $env.threads[$tid as usize]
            .frames
            .set_slot($sb + $sp as u32, (a $op b).to_bits());
        $sp += 1;
    }};
}

impl JavaEnv {
    /// Begin a call on an empty or suspended thread: push the first frame
    /// with `args` written into its locals (or the native frame's argument
    /// list).
    pub(crate) fn push_call(
        &mut self,
        tid: u32,
        method: MethodId,
        args: &[JavaValue],
    ) -> VmResult<()> {
        let method = self.method(method).clone();

        if method.is_native() || method.code.is_none() {
            self.threads[tid as usize].frames.push_native(method, args.to_vec());
            return Ok(());
        }

        let code = method.code.clone().unwrap();
        let (positions, _) = argument_slots(&method);
        let locals_base = self.threads[tid as usize].frames.used;

        if !self.threads[tid as usize].frames.push_plain(
            method,
            locals_base,
            code.max_locals,
            code.max_stack,
        ) {
            return Err(raise_stack_overflow(self, tid));
        }

        let frames = &mut self.threads[tid as usize].frames;
        for slot in 0..code.max_locals {
            frames.set_slot(locals_base + slot as u32, 0);
        }
        for (value, position) in args.iter().zip(&positions) {
            frames.set_slot(locals_base + *position as u32, value.into_slot());
        }
        Ok(())
    }

    /// Run the thread's frames until the frame at `base_depth` completes,
    /// the thread suspends, or an exception escapes past `base_depth`.
    pub(crate) fn execute(&mut self, tid: u32, base_depth: usize) -> VmResult<ExecEvent> {
        'frames: loop {
            let depth = self.threads[tid as usize].frames.depth();
            if depth == base_depth {
                // Only reachable when a pushed call was already complete
                return Ok(ExecEvent::Finished(None));
            }

            // Synchronized methods acquire their monitor before the body.
            // A failure here (null receiver, mirror allocation) unwinds from
            // the caller: the body never started.
            match self.enter_method_monitor(tid) {
                Ok(None) => {}
                Ok(Some(wakeup)) => match self.handle_suspension(tid, base_depth, wakeup) {
                    SuspendOutcome::Park(wakeup) => return Ok(ExecEvent::Suspended(wakeup)),
                    SuspendOutcome::Resume => continue 'frames,
                    SuspendOutcome::Unwound => return Err(Raised),
                },
                Err(Raised) => {
                    self.threads[tid as usize].frames.pop();
                    if !self.unwind(tid, base_depth) {
                        return Err(Raised);
                    }
                    continue 'frames;
                }
            }

            if self.threads[tid as usize].frames.top().unwrap().is_native() {
                match self.run_native_frame(tid) {
                    Ok(AsyncPoll::Ready(value)) => {
                        self.release_method_monitor(tid);
                        let frame = self.threads[tid as usize].frames.pop();
                        match self.deliver_return(tid, base_depth, &frame.method, value) {
                            Some(event) => return Ok(event),
                            None => continue 'frames,
                        }
                    }
                    Ok(AsyncPoll::NotReady(wakeup)) => {
                        match self.handle_suspension(tid, base_depth, wakeup) {
                            SuspendOutcome::Park(wakeup) => {
                                return Ok(ExecEvent::Suspended(wakeup))
                            }
                            SuspendOutcome::Resume => continue 'frames,
                            SuspendOutcome::Unwound => return Err(Raised),
                        }
                    }
                    Err(Raised) => {
                        self.release_method_monitor(tid);
                        self.threads[tid as usize].frames.pop();
                        if !self.unwind(tid, base_depth) {
                            return Err(Raised);
                        }
                        continue 'frames;
                    }
                }
            }

            match self.dispatch_plain(tid) {
                Dispatch::Return(value) => {
                    self.release_method_monitor(tid);
                    let frame = self.threads[tid as usize].frames.pop();
                    match self.deliver_return(tid, base_depth, &frame.method, value) {
                        Some(event) => return Ok(event),
                        None => continue 'frames,
                    }
                }
                Dispatch::Call { target, arg_base } => {
                    if self.stage_call(tid, &target, arg_base).is_err()
                        && !self.unwind(tid, base_depth)
                    {
                        return Err(Raised);
                    }
                    continue 'frames;
                }
                Dispatch::Suspend(wakeup) => match self.handle_suspension(tid, base_depth, wakeup) {
                    SuspendOutcome::Park(wakeup) => return Ok(ExecEvent::Suspended(wakeup)),
                    SuspendOutcome::Resume => continue 'frames,
                    SuspendOutcome::Unwound => return Err(Raised),
                },
                Dispatch::Pending => {
                    if !self.unwind(tid, base_depth) {
                        return Err(Raised);
                    }
                    continue 'frames;
                }
            }
        }
    }

    /// Route a suspension request: hand it to the scheduler, spin in place
    /// for synchronous sections, or turn an illegal suspension into an
    /// unwound IllegalStateException.
    fn handle_suspension(&mut self, tid: u32, base_depth: usize, wakeup: Wakeup) -> SuspendOutcome {
        match self.suspend_or_spin(tid, wakeup) {
            Ok(Some(wakeup)) => SuspendOutcome::Park(wakeup),
            Ok(None) => SuspendOutcome::Resume,
            Err(Raised) => {
                if self.unwind(tid, base_depth) {
                    SuspendOutcome::Resume
                } else {
                    SuspendOutcome::Unwound
                }
            }
        }
    }

    /// Run a method to completion on the current thread, nested inside
    /// whatever is already executing. Suspension is unavailable here: yields
    /// continue, timed sleeps busy-wait and indefinite waits raise
    /// IllegalStateException.
    pub fn call_interpreter_synchronous(
        &mut self,
        tid: u32,
        method: MethodId,
        args: &[JavaValue],
    ) -> VmResult<Option<JavaValue>> {
        let base_depth = self.threads[tid as usize].frames.depth();
        self.push_call(tid, method, args)?;

        self.threads[tid as usize].synchronous_depth += 1;
        let result = self.execute(tid, base_depth);
        self.threads[tid as usize].synchronous_depth -= 1;

        match result? {
            ExecEvent::Finished(value) => Ok(value),
            ExecEvent::Suspended(_) => unreachable!("synchronous execution cannot suspend"),
        }
    }

    fn suspend_or_spin(&mut self, tid: u32, wakeup: Wakeup) -> VmResult<Option<Wakeup>> {
        if self.threads[tid as usize].synchronous_depth == 0 {
            return Ok(Some(wakeup));
        }

        match wakeup.kind {
            WakeupKind::Yielding => {
                self.threads[tid as usize].yield_at_us = u64::MAX;
                Ok(None)
            }
            WakeupKind::Sleep | WakeupKind::Park | WakeupKind::MonitorWait
                if wakeup.wakeup_us != 0 =>
            {
                let now = unix_time_us();
                if wakeup.wakeup_us > now {
                    std::thread::sleep(std::time::Duration::from_micros(wakeup.wakeup_us - now));
                }
                Ok(None)
            }
            _ => Err(raise_illegal_state(
                self,
                tid,
                "Cannot suspend while executing synchronously",
            )),
        }
    }

    /// Acquire the implicit monitor of an ACC_SYNCHRONIZED method on frame
    /// entry; `Ok(Some(_))` asks the caller to suspend and retry.
    fn enter_method_monitor(&mut self, tid: u32) -> VmResult<Option<Wakeup>> {
        let (method, already) = {
            let frame = self.threads[tid as usize].frames.top().unwrap();
            (frame.method.clone(), frame.sync_target.is_some())
        };
        if already || !method.is_synchronized() {
            return Ok(None);
        }

        let target = if method.is_static() {
            get_class_mirror(self, tid, method.class)?
        } else {
            let receiver = {
                let frames = &self.threads[tid as usize].frames;
                match &frames.top().unwrap().data {
                    FrameData::Plain { locals_base, .. } => {
                        ObjRef::from_slot(frames.slot(*locals_base))
                    }
                    FrameData::Native { args, .. } => match args.first() {
                        Some(JavaValue::Reference(obj)) => *obj,
                        _ => None,
                    },
                }
            };
            match receiver {
                Some(obj) => obj,
                None => return Err(raise_npe(self, tid)),
            }
        };

        let id = self.monitors.inflate(&mut self.heap, target);
        if self.monitors.try_acquire(id, tid) {
            self.threads[tid as usize].frames.top_mut().unwrap().sync_target = Some(target);
            Ok(None)
        } else {
            Ok(Some(Wakeup {
                kind: WakeupKind::MonitorEnter,
                wakeup_us: 0,
                monitor: Some(target),
                ready: false,
            }))
        }
    }

    fn release_method_monitor(&mut self, tid: u32) {
        let target = match self.threads[tid as usize].frames.top_mut() {
            Some(frame) => frame.sync_target.take(),
            None => None,
        };
        if let Some(target) = target {
            if self.monitors.release(&mut self.heap, target, tid).is_err() {
                warn!("synchronized method exit could not release its monitor");
            }
        }
    }

    /// After popping a completed frame, hand the value to the caller (or
    /// report completion of the base call).
    fn deliver_return(
        &mut self,
        tid: u32,
        base_depth: usize,
        method: &Rc<Method>,
        value: Option<JavaValue>,
    ) -> Option<ExecEvent> {
        if self.threads[tid as usize].frames.depth() == base_depth {
            return Some(ExecEvent::Finished(value));
        }

        if method.descriptor.returns_value() {
            let value = value.unwrap_or(JavaValue::NULL);
            let frames = &mut self.threads[tid as usize].frames;
            match frames.top_mut().map(|f| &mut f.data) {
                Some(FrameData::Plain { stack_base, sp, .. }) => {
                    let at = *stack_base + *sp as u32;
                    *sp += 1;
                    frames.set_slot(at, value.into_slot());
                }
                _ => panic!("return into a non-plain frame"),
            }
        }
        None
    }

    /// Push the callee frame over its staged arguments.
    fn stage_call(&mut self, tid: u32, target: &Rc<Method>, arg_base: u32) -> VmResult<()> {
        if target.is_abstract() {
            return Err(raise_abstract_method_error(self, tid, target));
        }

        if target.is_native() || target.code.is_none() {
            let mut kinds = Vec::with_capacity(target.invocation_argc());
            if !target.is_static() {
                kinds.push(TypeKind::Reference);
            }
            kinds.extend(target.descriptor.args.iter().map(|x| x.type_kind()));

            let mut args = Vec::with_capacity(kinds.len());
            for (i, kind) in kinds.iter().enumerate() {
                let slot = self.threads[tid as usize].frames.slot(arg_base + i as u32);
                args.push(JavaValue::from_slot(slot, *kind));
            }
            self.threads[tid as usize].frames.push_native(target.clone(), args);
            return Ok(());
        }

        let code = target.code.clone().unwrap();
        let (positions, used_slots) = argument_slots(target);
        if used_slots > code.max_locals {
            return Err(raise_incompatible_class_change(
                self,
                tid,
                "method arguments exceed max_locals",
            ));
        }

        if !self.threads[tid as usize].frames.push_plain(
            target.clone(),
            arg_base,
            code.max_locals,
            code.max_stack,
        ) {
            return Err(raise_stack_overflow(self, tid));
        }

        // Spread logical argument slots to their original local positions,
        // back to front so widening copies never clobber a pending source
        let frames = &mut self.threads[tid as usize].frames;
        for i in (0..positions.len()).rev() {
            let value = frames.slot(arg_base + i as u32);
            frames.set_slot(arg_base + positions[i] as u32, value);
        }

        // Clear locals the arguments did not claim (and dead high halves)
        let receiver = !target.is_static() as usize;
        let mut claimed = vec![false; code.max_locals as usize];
        for (i, position) in positions.iter().enumerate() {
            claimed[*position as usize] = true;
            if i >= receiver && target.descriptor.args[i - receiver].is_wide() {
                claimed[*position as usize + 1] = true;
            }
        }
        for (slot, taken) in claimed.iter().enumerate() {
            if !taken {
                frames.set_slot(arg_base + slot as u32, 0);
            }
        }

        Ok(())
    }

    /// Drive the current native frame: bind and run the callback, polling an
    /// async continuation if one is in progress.
    fn run_native_frame(&mut self, tid: u32) -> VmResult<AsyncPoll> {
        let method = self.threads[tid as usize].frames.top().unwrap().method.clone();

        // Resume an in-flight continuation first
        let existing = match &mut self.threads[tid as usize].frames.top_mut().unwrap().data {
            FrameData::Native { continuation, .. } => continuation.take(),
            _ => unreachable!(),
        };
        if let Some(mut continuation) = existing {
            let result = continuation.poll(self, tid)?;
            if let AsyncPoll::NotReady(_) = result {
                self.store_continuation(tid, continuation);
            }
            return Ok(result);
        }

        let native_index = match method.native.get() {
            Some(index) => index,
            None => return Err(raise_unsatisfied_link(self, tid, &method)),
        };

        match self.natives.get(native_index) {
            NativeMethod::Sync(callback) => {
                let callback = *callback;
                callback(self, tid).map(AsyncPoll::Ready)
            }
            NativeMethod::Async(factory) => {
                let mut continuation = factory();
                let result = continuation.poll(self, tid)?;
                if let AsyncPoll::NotReady(_) = result {
                    self.store_continuation(tid, continuation);
                }
                Ok(result)
            }
        }
    }

    fn store_continuation(&mut self, tid: u32, state: Box<dyn crate::jvm::call::AsyncNative>) {
        if let FrameData::Native { continuation, .. } =
            &mut self.threads[tid as usize].frames.top_mut().unwrap().data
        {
            *continuation = Some(state);
        }
    }

    /// Walk the exception table of each frame from the top down. Returns
    /// false when the exception escaped past `base_depth`.
    fn unwind(&mut self, tid: u32, base_depth: usize) -> bool {
        let exception = match self.threads[tid as usize].current_exception {
            Some(exception) => exception,
            None => panic!("unwind without a pending exception"),
        };
        let exception_class = self.heap.class_of(exception);

        loop {
            if self.threads[tid as usize].frames.depth() == base_depth {
                return false;
            }

            if self.threads[tid as usize].frames.top().unwrap().is_native() {
                self.release_method_monitor(tid);
                self.threads[tid as usize].frames.pop();
                continue;
            }

            let (method, pc) = {
                let frame = self.threads[tid as usize].frames.top().unwrap();
                (frame.method.clone(), frame.pc())
            };
            let code = method.code.clone().unwrap();

            let mut target = None;
            for handler in &code.exception_table {
                if pc < handler.start || pc >= handler.end {
                    continue;
                }

                let matches = if handler.catch_type == 0 {
                    true
                } else {
                    // Resolving the catch type may run class loading; stash
                    // the in-flight exception around it
                    self.threads[tid as usize].current_exception = None;
                    let resolved = resolve_class_ref(self, tid, method.class, handler.catch_type);
                    self.threads[tid as usize].current_exception = Some(exception);
                    match resolved {
                        Ok(catch_class) => self.instanceof(exception_class, catch_class),
                        Err(_) => {
                            warn!(
                                "could not resolve catch type {} in {}",
                                handler.catch_type, method.name
                            );
                            false
                        }
                    }
                };

                if matches {
                    target = Some(handler.handler);
                    break;
                }
            }

            match target {
                Some(handler_pc) => {
                    debug!("exception caught, branching to handler at {}", handler_pc);
                    let stack_base = {
                        let frame = self.threads[tid as usize].frames.top_mut().unwrap();
                        match &mut frame.data {
                            FrameData::Plain { stack_base, sp, pc, .. } => {
                                // The operand stack is cleared and the
                                // exception pushed in its place
                                *sp = 1;
                                *pc = handler_pc;
                                *stack_base
                            }
                            _ => unreachable!(),
                        }
                    };
                    self.threads[tid as usize]
                        .frames
                        .set_slot(stack_base, ObjRef::into_slot(Some(exception)));
                    self.threads[tid as usize].current_exception = None;
                    return true;
                }
                None => {
                    self.release_method_monitor(tid);
                    self.threads[tid as usize].frames.pop();
                }
            }
        }
    }

    /// The dispatch loop of the topmost plain frame. Returns when the frame
    /// completes, calls out, suspends, or raises.
    fn dispatch_plain(&mut self, tid: u32) -> Dispatch {
        let env = self;
        let (method, locals_base, stack_base, mut sp, mut pc) = {
            let frame = env.threads[tid as usize].frames.top().unwrap();
            match &frame.data {
                FrameData::Plain { locals_base, stack_base, sp, pc } => {
                    (frame.method.clone(), *locals_base, *stack_base, *sp, *pc)
                }
                _ => unreachable!(),
            }
        };
        let code = method.code.clone().unwrap();
        let pool_class = method.class;

        macro_rules! sync_frame {
            ($pc:expr) => {{
                let frame = env.threads[tid as usize].frames.top_mut().unwrap();
                if let FrameData::Plain { sp: frame_sp, pc: frame_pc, .. } = &mut frame.data {
                    *frame_sp = sp;
                    *frame_pc = $pc;
                }
            }};
        }

        macro_rules! push {
            ($value:expr) => {{
                let value: u64 = $value;
                env.threads[tid as usize].frames.set_slot(stack_base + sp as u32, value);
                sp += 1;
            }};
        }

        macro_rules! pop {
            () => {{
                sp -= 1;
                env.threads[tid as usize].frames.slot(stack_base + sp as u32)
            }};
        }

        macro_rules! peek {
            ($depth:expr) => {
                env.threads[tid as usize].frames.slot(stack_base + (sp - 1 - $depth) as u32)
            };
        }

        macro_rules! local {
            ($index:expr) => {
                env.threads[tid as usize].frames.slot(locals_base + $index as u32)
            };
        }

        macro_rules! set_local {
            ($index:expr, $value:expr) => {{
                let value: u64 = $value;
                env.threads[tid as usize].frames.set_slot(locals_base + $index as u32, value);
            }};
        }

        macro_rules! raise {
            ($pc:expr, $raiser:expr) => {{
                sync_frame!($pc);
                let _: Raised = $raiser;
                return Dispatch::Pending;
            }};
        }

        macro_rules! check_null {
            ($slot:expr, $pc:expr) => {
                match ObjRef::from_slot($slot) {
                    Some(obj) => obj,
                    None => raise!($pc, raise_npe_extended(env, tid, &method, $pc)),
                }
            };
        }

        macro_rules! array_index_check {
            ($array:expr, $index:expr, $pc:expr) => {{
                let length = env.heap.array_length($array);
                if $index < 0 || $index >= length {
                    raise!($pc, raise_array_index_oob(env, tid, $index, length));
                }
            }};
        }

        macro_rules! try_vm {
            ($pc:expr, $result:expr) => {
                match $result {
                    Ok(value) => value,
                    Err(Raised) => {
                        sync_frame!($pc);
                        return Dispatch::Pending;
                    }
                }
            };
        }

        macro_rules! branch_if {
            ($cond:expr, $target:expr, $next:ident) => {{
                if $cond {
                    $next = $target;
                }
            }};
        }

        loop {
            // Fuel and wall-clock timeslice accounting
            {
                let thread = &mut env.threads[tid as usize];
                if thread.fuel == 0 {
                    thread.fuel = THREAD_FUEL;
                    if unix_time_us() >= thread.yield_at_us {
                        sync_frame!(pc);
                        return Dispatch::Suspend(Wakeup::yielding());
                    }
                } else {
                    thread.fuel -= 1;
                }
            }

            let insn: &Instruction = &code.insns[pc as usize];
            let kind = insn.kind.get();
            let mut next_pc = pc + 1;

            use InsnKind::*;
            match kind {
                Nop => {}

                AConstNull => push!(0),
                IConst(x) => push!(x as i64 as u64),
                LConst(x) => push!(x as u64),
                FConst(x) => push!(x.to_bits() as u64),
                DConst(x) => push!(x.to_bits()),

                Ldc(cp) => {
                    sync_frame!(pc);
                    let value = try_vm!(pc, env.load_constant(tid, pool_class, cp));
                    push!(value.into_slot());
                }

                ILoad(i) | LLoad(i) | FLoad(i) | DLoad(i) | ALoad(i) => push!(local!(i)),
                IStore(i) | LStore(i) | FStore(i) | DStore(i) | AStore(i) => {
                    let value = pop!();
                    set_local!(i, value);
                }

                IALoad | BALoad | CALoad | SALoad | LALoad | FALoad | DALoad | AALoad => {
                    let index = pop!() as i32;
                    let array = check_null!(pop!(), pc);
                    array_index_check!(array, index, pc);
                    let element_kind = env.class(env.heap.class_of(array)).element_kind();
                    let value = env.heap.get_element(array, element_kind, index as usize);
                    push!(widen_subint(value));
                }

                IAStore | BAStore | CAStore | SAStore | LAStore | FAStore | DAStore => {
                    let value = pop!();
                    let index = pop!() as i32;
                    let array = check_null!(pop!(), pc);
                    array_index_check!(array, index, pc);
                    let element_kind = env.class(env.heap.class_of(array)).element_kind();
                    env.heap.set_element(
                        array,
                        element_kind,
                        index as usize,
                        JavaValue::from_slot(value, element_kind),
                    );
                }
                AAStore => {
                    let value = pop!();
                    let index = pop!() as i32;
                    let array = check_null!(pop!(), pc);
                    array_index_check!(array, index, pc);

                    if let Some(stored) = ObjRef::from_slot(value) {
                        let stored_class = env.heap.class_of(stored);
                        let component = env
                            .class(env.heap.class_of(array))
                            .one_fewer_dim
                            .expect("reference array without component class");
                        if !env.instanceof(stored_class, component) {
                            raise!(pc, raise_array_store(env, tid, stored_class));
                        }
                    }
                    env.heap.set_element(
                        array,
                        TypeKind::Reference,
                        index as usize,
                        JavaValue::Reference(ObjRef::from_slot(value)),
                    );
                }

                Pop => sp -= 1,
                Pop2 => sp -= 2,
                Dup => {
                    let top = peek!(0);
                    push!(top);
                }
                Dup2 => {
                    let second = peek!(1);
                    let top = peek!(0);
                    push!(second);
                    push!(top);
                }
                DupX1 => {
                    let top = pop!();
                    let second = pop!();
                    push!(top);
                    push!(second);
                    push!(top);
                }
                DupX2 => {
                    let top = pop!();
                    let second = pop!();
                    let third = pop!();
                    push!(top);
                    push!(third);
                    push!(second);
                    push!(top);
                }
                Dup2X1 => {
                    let top = pop!();
                    let second = pop!();
                    let third = pop!();
                    push!(second);
                    push!(top);
                    push!(third);
                    push!(second);
                    push!(top);
                }
                Dup2X2 => {
                    let top = pop!();
                    let second = pop!();
                    let third = pop!();
                    let fourth = pop!();
                    push!(second);
                    push!(top);
                    push!(fourth);
                    push!(third);
                    push!(second);
                    push!(top);
                }
                Swap => {
                    let top = pop!();
                    let second = pop!();
                    push!(top);
                    push!(second);
                }

                IAdd => binary_int!(env, tid, stack_base, sp, wrapping_add),
                ISub => binary_int!(env, tid, stack_base, sp, wrapping_sub),
                IMul => binary_int!(env, tid, stack_base, sp, wrapping_mul),
                IDiv => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    if b == 0 {
                        raise!(pc, raise_div0(env, tid));
                    }
                    push!(a.wrapping_div(b) as i64 as u64);
                }
                IRem => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    if b == 0 {
                        raise!(pc, raise_div0(env, tid));
                    }
                    push!(a.wrapping_rem(b) as i64 as u64);
                }
                IAnd => binary_int!(env, tid, stack_base, sp, bitand),
                IOr => binary_int!(env, tid, stack_base, sp, bitor),
                IXor => binary_int!(env, tid, stack_base, sp, bitxor),
                INeg => {
                    let a = pop!() as i32;
                    push!(a.wrapping_neg() as i64 as u64);
                }
                IShl => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    push!(a.wrapping_shl(b as u32 & 31) as i64 as u64);
                }
                IShr => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    push!(a.wrapping_shr(b as u32 & 31) as i64 as u64);
                }
                IUshr => {
                    let b = pop!() as i32;
                    let a = pop!() as u32;
                    push!((a >> (b as u32 & 31)) as i32 as i64 as u64);
                }

                LAdd => binary_long!(env, tid, stack_base, sp, wrapping_add),
                LSub => binary_long!(env, tid, stack_base, sp, wrapping_sub),
                LMul => binary_long!(env, tid, stack_base, sp, wrapping_mul),
                LDiv => {
                    let b = pop!() as i64;
                    let a = pop!() as i64;
                    if b == 0 {
                        raise!(pc, raise_div0(env, tid));
                    }
                    push!(a.wrapping_div(b) as u64);
                }
                LRem => {
                    let b = pop!() as i64;
                    let a = pop!() as i64;
                    if b == 0 {
                        raise!(pc, raise_div0(env, tid));
                    }
                    push!(a.wrapping_rem(b) as u64);
                }
                LAnd => binary_long!(env, tid, stack_base, sp, bitand),
                LOr => binary_long!(env, tid, stack_base, sp, bitor),
                LXor => binary_long!(env, tid, stack_base, sp, bitxor),
                LNeg => {
                    let a = pop!() as i64;
                    push!(a.wrapping_neg() as u64);
                }
                LShl => {
                    let b = pop!() as i32;
                    let a = pop!() as i64;
                    push!(a.wrapping_shl(b as u32 & 63) as u64);
                }
                LShr => {
                    let b = pop!() as i32;
                    let a = pop!() as i64;
                    push!(a.wrapping_shr(b as u32 & 63) as u64);
                }
                LUshr => {
                    let b = pop!() as i32;
                    let a = pop!() as u64;
                    push!(a >> (b as u32 & 63));
                }

                FAdd => binary_float!(env, tid, stack_base, sp, +),
                FSub => binary_float!(env, tid, stack_base, sp, -),
                FMul => binary_float!(env, tid, stack_base, sp, *),
                FDiv => binary_float!(env, tid, stack_base, sp, /),
                FRem => {
                    let b = f32::from_bits(pop!() as u32);
                    let a = f32::from_bits(pop!() as u32);
                    push!((a % b).to_bits() as u64);
                }
                FNeg => {
                    let a = f32::from_bits(pop!() as u32);
                    push!((-a).to_bits() as u64);
                }

                DAdd => binary_double!(env, tid, stack_base, sp, +),
                DSub => binary_double!(env, tid, stack_base, sp, -),
                DMul => binary_double!(env, tid, stack_base, sp, *),
                DDiv => binary_double!(env, tid, stack_base, sp, /),
                DRem => {
                    let b = f64::from_bits(pop!());
                    let a = f64::from_bits(pop!());
                    push!((a % b).to_bits());
                }
                DNeg => {
                    let a = f64::from_bits(pop!());
                    push!((-a).to_bits());
                }

                IInc { local, delta } => {
                    let value = local!(local) as i32;
                    set_local!(local, value.wrapping_add(delta as i32) as i64 as u64);
                }

                I2L => {
                    let a = pop!() as i32;
                    push!(a as i64 as u64);
                }
                I2F => {
                    let a = pop!() as i32;
                    push!((a as f32).to_bits() as u64);
                }
                I2D => {
                    let a = pop!() as i32;
                    push!((a as f64).to_bits());
                }
                L2I => {
                    let a = pop!() as i64;
                    push!(a as i32 as i64 as u64);
                }
                L2F => {
                    let a = pop!() as i64;
                    push!((a as f32).to_bits() as u64);
                }
                L2D => {
                    let a = pop!() as i64;
                    push!((a as f64).to_bits());
                }
                F2I => {
                    let a = f32::from_bits(pop!() as u32);
                    push!(float_to_int(a) as i64 as u64);
                }
                F2L => {
                    let a = f32::from_bits(pop!() as u32);
                    push!(float_to_long(a as f64) as u64);
                }
                F2D => {
                    let a = f32::from_bits(pop!() as u32);
                    push!((a as f64).to_bits());
                }
                D2I => {
                    let a = f64::from_bits(pop!());
                    push!(double_to_int(a) as i64 as u64);
                }
                D2L => {
                    let a = f64::from_bits(pop!());
                    push!(float_to_long(a) as u64);
                }
                D2F => {
                    let a = f64::from_bits(pop!());
                    push!((a as f32).to_bits() as u64);
                }
                I2B => {
                    let a = pop!() as i32;
                    push!(a as i8 as i64 as u64);
                }
                I2C => {
                    let a = pop!() as i32;
                    push!(a as u16 as u64);
                }
                I2S => {
                    let a = pop!() as i32;
                    push!(a as i16 as i64 as u64);
                }

                LCmp => {
                    let b = pop!() as i64;
                    let a = pop!() as i64;
                    push!(compare_values(a, b) as i64 as u64);
                }
                FCmpL | FCmpG => {
                    let b = f32::from_bits(pop!() as u32);
                    let a = f32::from_bits(pop!() as u32);
                    let nan_result = if kind == FCmpG { 1 } else { -1 };
                    push!(fp_compare(a as f64, b as f64, nan_result) as i64 as u64);
                }
                DCmpL | DCmpG => {
                    let b = f64::from_bits(pop!());
                    let a = f64::from_bits(pop!());
                    let nan_result = if kind == DCmpG { 1 } else { -1 };
                    push!(fp_compare(a, b, nan_result) as i64 as u64);
                }

                IfEq(t) => branch_if!(pop!() as i32 == 0, t, next_pc),
                IfNe(t) => branch_if!(pop!() as i32 != 0, t, next_pc),
                IfLt(t) => branch_if!((pop!() as i32) < 0, t, next_pc),
                IfGe(t) => branch_if!(pop!() as i32 >= 0, t, next_pc),
                IfGt(t) => branch_if!(pop!() as i32 > 0, t, next_pc),
                IfLe(t) => branch_if!(pop!() as i32 <= 0, t, next_pc),
                IfICmpEq(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a == b, t, next_pc);
                }
                IfICmpNe(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a != b, t, next_pc);
                }
                IfICmpLt(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a < b, t, next_pc);
                }
                IfICmpGe(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a >= b, t, next_pc);
                }
                IfICmpGt(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a > b, t, next_pc);
                }
                IfICmpLe(t) => {
                    let b = pop!() as i32;
                    let a = pop!() as i32;
                    branch_if!(a <= b, t, next_pc);
                }
                IfACmpEq(t) => {
                    let b = pop!();
                    let a = pop!();
                    branch_if!(a == b, t, next_pc);
                }
                IfACmpNe(t) => {
                    let b = pop!();
                    let a = pop!();
                    branch_if!(a != b, t, next_pc);
                }
                IfNull(t) => branch_if!(pop!() == 0, t, next_pc),
                IfNonNull(t) => branch_if!(pop!() != 0, t, next_pc),
                Goto(t) => next_pc = t,

                TableSwitch(table) => {
                    let key = pop!() as i32;
                    let data = &code.table_switches[table as usize];
                    next_pc = if key < data.low
                        || (key as i64) >= data.low as i64 + data.targets.len() as i64
                    {
                        data.default_target
                    } else {
                        data.targets[(key - data.low) as usize]
                    };
                }
                LookupSwitch(table) => {
                    let key = pop!() as i32;
                    let data = &code.lookup_switches[table as usize];
                    next_pc = match data.pairs.binary_search_by_key(&key, |(k, _)| *k) {
                        Ok(index) => data.pairs[index].1,
                        Err(_) => data.default_target,
                    };
                }

                IReturn | FReturn | LReturn | DReturn => {
                    let value = pop!();
                    sync_frame!(pc);
                    return Dispatch::Return(Some(JavaValue::from_slot(
                        value,
                        method.descriptor.returns.type_kind(),
                    )));
                }
                AReturn => {
                    let value = pop!();
                    sync_frame!(pc);
                    return Dispatch::Return(Some(JavaValue::Reference(ObjRef::from_slot(value))));
                }
                Return => {
                    sync_frame!(pc);
                    return Dispatch::Return(None);
                }

                // First execution of a field access resolves the field, then
                // installs the primitive-typed variant with the location in
                // the inline cache and re-dispatches the same instruction.
                GetStatic(cp) | PutStatic(cp) | GetField(cp) | PutField(cp) => {
                    sync_frame!(pc);
                    let wants_static = matches!(kind, GetStatic(_) | PutStatic(_));
                    let field_id = try_vm!(pc, resolve_field(env, tid, pool_class, cp));

                    let field = env.class(field_id.class).field(field_id.index);
                    let field_kind = field.type_kind();
                    let offset = field.byte_offset.get();
                    if field.is_static() != wants_static {
                        raise!(
                            pc,
                            raise_incompatible_class_change(
                                env,
                                tid,
                                "static flag of resolved field does not match the opcode",
                            )
                        );
                    }

                    if wants_static {
                        try_vm!(pc, ensure_initialized(env, tid, field_id.class));
                        insn.ic.set(InlineCache::StaticField {
                            class: field_id.class,
                            kind: field_kind,
                            offset,
                        });
                    } else {
                        insn.ic.set(InlineCache::FieldOffset { kind: field_kind, offset });
                    }

                    insn.kind.set(match kind {
                        GetStatic(_) => GetStaticK(field_kind, cp),
                        PutStatic(_) => PutStaticK(field_kind, cp),
                        GetField(_) => GetFieldK(field_kind, cp),
                        _ => PutFieldK(field_kind, cp),
                    });
                    next_pc = pc;
                }

                GetStaticK(field_kind, _) => {
                    let (class, offset) = match insn.ic.get() {
                        InlineCache::StaticField { class, offset, .. } => (class, offset),
                        x => panic!("getstatic without a static cache: {:?}", x),
                    };
                    let value = crate::jvm::read_static(
                        &env.class(class).static_data,
                        offset as usize,
                        field_kind,
                    );
                    push!(widen_subint(value));
                }
                PutStaticK(field_kind, _) => {
                    let (class, offset) = match insn.ic.get() {
                        InlineCache::StaticField { class, offset, .. } => (class, offset),
                        x => panic!("putstatic without a static cache: {:?}", x),
                    };
                    let value = JavaValue::from_slot(pop!(), field_kind);
                    crate::jvm::write_static(
                        &mut env.class_mut(class).static_data,
                        offset as usize,
                        value,
                    );
                }
                GetFieldK(field_kind, _) => {
                    let offset = match insn.ic.get() {
                        InlineCache::FieldOffset { offset, .. } => offset,
                        x => panic!("getfield without an offset cache: {:?}", x),
                    };
                    let obj = check_null!(pop!(), pc);
                    let value = env.heap.get_field(obj, offset as usize, field_kind);
                    push!(widen_subint(value));
                }
                PutFieldK(field_kind, _) => {
                    let offset = match insn.ic.get() {
                        InlineCache::FieldOffset { offset, .. } => offset,
                        x => panic!("putfield without an offset cache: {:?}", x),
                    };
                    let value = pop!();
                    let obj = check_null!(pop!(), pc);
                    env.heap
                        .set_field(obj, offset as usize, JavaValue::from_slot(value, field_kind));
                }

                InvokeStatic(cp) => {
                    sync_frame!(pc);
                    let target = try_vm!(pc, resolve_method(env, tid, pool_class, cp));
                    try_vm!(pc, ensure_initialized(env, tid, target.class));
                    let target = env.method(target).clone();
                    insn.ic.set(InlineCache::Method(target.id()));

                    sp -= target.invocation_argc() as u16;
                    sync_frame!(next_pc);
                    return Dispatch::Call { target, arg_base: stack_base + sp as u32 };
                }

                InvokeSpecial(cp) => {
                    sync_frame!(pc);
                    let target = try_vm!(pc, resolve_method(env, tid, pool_class, cp));
                    let target = env.method(target).clone();
                    insn.ic.set(InlineCache::Method(target.id()));

                    let argc = target.invocation_argc() as u16;
                    check_null!(peek!(argc - 1), pc);
                    sp -= argc;
                    sync_frame!(next_pc);
                    return Dispatch::Call { target, arg_base: stack_base + sp as u32 };
                }

                InvokeVirtual(cp) | InvokeInterface(cp) => {
                    sync_frame!(pc);
                    let resolved = try_vm!(pc, resolve_method(env, tid, pool_class, cp));
                    let resolved = env.method(resolved).clone();

                    if resolved.is_signature_polymorphic {
                        insn.kind.set(InvokeSigPoly {
                            cp,
                            exact: resolved.name.as_ref() == "invokeExact",
                        });
                        next_pc = pc;
                    } else {
                        let argc = resolved.invocation_argc() as u16;
                        let receiver = check_null!(peek!(argc - 1), pc);
                        let receiver_class = env.heap.class_of(receiver);

                        let target = match insn.ic.get() {
                            InlineCache::Virtual { expected, target }
                                if expected == receiver_class =>
                            {
                                env.method(target).clone()
                            }
                            _ => {
                                let selected = try_vm!(
                                    pc,
                                    env.select_virtual_target(
                                        tid,
                                        receiver_class,
                                        &resolved,
                                        matches!(kind, InvokeInterface(_)),
                                    )
                                );
                                insn.ic.set(InlineCache::Virtual {
                                    expected: receiver_class,
                                    target: selected.id(),
                                });
                                selected
                            }
                        };

                        sp -= argc;
                        sync_frame!(next_pc);
                        return Dispatch::Call { target, arg_base: stack_base + sp as u32 };
                    }
                }

                InvokeSigPoly { cp, exact } => {
                    sync_frame!(pc);
                    let (new_sp, target, arg_base) = try_vm!(
                        pc,
                        env.invoke_signature_polymorphic(
                            tid, pool_class, cp, insn, exact, stack_base, sp
                        )
                    );
                    sp = new_sp;
                    sync_frame!(next_pc);
                    return Dispatch::Call { target, arg_base };
                }

                InvokeDynamic(cp) => {
                    sync_frame!(pc);
                    let call_site = match insn.ic2.get() {
                        Some(call_site) => call_site,
                        None => {
                            let call_site =
                                try_vm!(pc, method_handles::indy_resolve(env, tid, pool_class, cp));
                            insn.ic2.set(Some(call_site));
                            env.class_mut(pool_class).indy_insns.push((method.index, pc));
                            call_site
                        }
                    };

                    let descriptor = {
                        let info = env.class(pool_class).pool.indy_info(cp);
                        FieldDescriptor::parse_method(&info.descriptor)
                            .expect("descriptor validated at parse")
                    };
                    let (new_sp, target, arg_base) = try_vm!(
                        pc,
                        env.invoke_call_site(tid, call_site, &descriptor, stack_base, sp)
                    );
                    sp = new_sp;
                    sync_frame!(next_pc);
                    return Dispatch::Call { target, arg_base };
                }

                New(cp) => {
                    sync_frame!(pc);
                    let class = try_vm!(pc, resolve_class_ref(env, tid, pool_class, cp));
                    try_vm!(pc, ensure_initialized(env, tid, class));
                    if env.class(class).is_interface()
                        || env.class(class).access.contains(ClassAccessFlags::ABSTRACT)
                    {
                        raise!(
                            pc,
                            raise_incompatible_class_change(env, tid, "cannot instantiate")
                        );
                    }
                    let obj = try_vm!(pc, env.new_object(tid, class));
                    push!(ObjRef::into_slot(Some(obj)));
                }

                NewArray(element) => {
                    sync_frame!(pc);
                    let name = format!("[{}", element.descriptor_char());
                    let class = try_vm!(pc, bootstrap_lookup_class(env, tid, &name));
                    let count = pop!() as i32;
                    let obj = try_vm!(pc, env.new_array(tid, class, count));
                    push!(ObjRef::into_slot(Some(obj)));
                }

                ANewArray(cp) => {
                    sync_frame!(pc);
                    let component = try_vm!(pc, resolve_class_ref(env, tid, pool_class, cp));
                    let array_class = try_vm!(pc, array_class_of(env, tid, component));
                    let count = pop!() as i32;
                    let obj = try_vm!(pc, env.new_array(tid, array_class, count));
                    push!(ObjRef::into_slot(Some(obj)));
                }

                MultiANewArray { cp, dims } => {
                    sync_frame!(pc);
                    let class = try_vm!(pc, resolve_class_ref(env, tid, pool_class, cp));

                    let mut counts = Vec::with_capacity(dims as usize);
                    for _ in 0..dims {
                        counts.push(pop!() as i32);
                    }
                    counts.reverse();
                    sync_frame!(pc);

                    let obj = try_vm!(pc, env.new_multi_array(tid, class, &counts));
                    push!(ObjRef::into_slot(Some(obj)));
                }

                ArrayLength => {
                    let array = check_null!(pop!(), pc);
                    push!(env.heap.array_length(array) as i64 as u64);
                }

                AThrow => {
                    let exception = check_null!(pop!(), pc);
                    sync_frame!(pc);
                    let _ = raise_exception_object(env, tid, exception);
                    return Dispatch::Pending;
                }

                CheckCast(cp) => {
                    sync_frame!(pc);
                    let target = try_vm!(pc, resolve_class_ref(env, tid, pool_class, cp));
                    if let Some(obj) = ObjRef::from_slot(peek!(0)) {
                        let actual = env.heap.class_of(obj);
                        if !env.instanceof(actual, target) {
                            raise!(pc, raise_class_cast(env, tid, actual, target));
                        }
                    }
                }
                InstanceOf(cp) => {
                    sync_frame!(pc);
                    let target = try_vm!(pc, resolve_class_ref(env, tid, pool_class, cp));
                    let value = pop!();
                    let result = match ObjRef::from_slot(value) {
                        Some(obj) => env.instanceof(env.heap.class_of(obj), target),
                        None => false,
                    };
                    push!(result as u64);
                }

                MonitorEnter => {
                    let obj = check_null!(peek!(0), pc);
                    let id = env.monitors.inflate(&mut env.heap, obj);
                    if env.monitors.try_acquire(id, tid) {
                        sp -= 1;
                    } else {
                        // Retry this instruction when the scheduler wakes us
                        sync_frame!(pc);
                        return Dispatch::Suspend(Wakeup {
                            kind: WakeupKind::MonitorEnter,
                            wakeup_us: 0,
                            monitor: Some(obj),
                            ready: false,
                        });
                    }
                }
                MonitorExit => {
                    let obj = check_null!(pop!(), pc);
                    match env.monitors.release(&mut env.heap, obj, tid) {
                        Ok(()) => {}
                        Err(MonitorError::NotOwner) => {
                            raise!(pc, raise_illegal_monitor_state(env, tid));
                        }
                    }
                }
            }

            pc = next_pc;
        }
    }

    /// Virtual/interface target selection for a resolved method and a
    /// receiver class.
    fn select_virtual_target(
        &mut self,
        tid: u32,
        receiver_class: ClassId,
        resolved: &Rc<Method>,
        through_interface: bool,
    ) -> VmResult<Rc<Method>> {
        if through_interface || self.class(resolved.class).is_interface() {
            let interface = resolved.class;
            let slot = self
                .class(receiver_class)
                .itable_for(interface)
                .map(|itable| itable.methods.get(resolved.index as usize).copied().flatten());
            match slot {
                Some(Some(target)) => Ok(self.method(target).clone()),
                // The abstract sentinel left by the linker
                Some(None) => Err(raise_abstract_method_error(self, tid, resolved)),
                None => Err(raise_incompatible_class_change(
                    self,
                    tid,
                    "receiver does not implement the interface",
                )),
            }
        } else {
            match resolved.vtable_index.get() {
                Some(index) => {
                    let target = self.class(receiver_class).vtable[index as usize];
                    Ok(self.method(target).clone())
                }
                // Private and final methods dispatch directly
                None => Ok(resolved.clone()),
            }
        }
    }

    /// invokeExact / invoke on a MethodHandle receiver. Returns the adjusted
    /// sp, the target method and the staged argument base.
    fn invoke_signature_polymorphic(
        &mut self,
        tid: u32,
        pool_class: ClassId,
        cp: u16,
        insn: &Instruction,
        exact: bool,
        stack_base: u32,
        sp: u16,
    ) -> VmResult<(u16, Rc<Method>, u32)> {
        // Cache the call-site MethodType in ic2
        let site_type = match insn.ic2.get() {
            Some(site_type) => site_type,
            None => {
                let descriptor = self.class(pool_class).pool.method_ref(cp).descriptor.clone();
                let site_type = method_handles::resolve_method_type(self, tid, &descriptor)?;
                insn.ic2.set(Some(site_type));
                let (method_index, pc) = {
                    let frame = self.threads[tid as usize].frames.top().unwrap();
                    (frame.method.index, frame.pc())
                };
                self.class_mut(pool_class).sigpoly_insns.push((method_index, pc));
                site_type
            }
        };

        let descriptor = {
            let text = self.class(pool_class).pool.method_ref(cp).descriptor.clone();
            FieldDescriptor::parse_method(&text).expect("descriptor validated at parse")
        };
        let argc = descriptor.argc() as u16 + 1; // including the handle
        let handle_slot = stack_base + (sp - argc) as u32;
        let handle = match ObjRef::from_slot(self.threads[tid as usize].frames.slot(handle_slot)) {
            Some(handle) => handle,
            None => {
                let (frame_method, pc) = {
                    let frame = self.threads[tid as usize].frames.top().unwrap();
                    (frame.method.clone(), frame.pc())
                };
                return Err(raise_npe_extended(self, tid, &frame_method, pc));
            }
        };

        let handle = method_handles::prepare_handle(self, tid, handle, site_type, exact)?;
        let (target, drops_handle) = method_handles::direct_target(self, tid, handle)?;

        // Shift the arguments over the handle slot so they line up with the
        // target's calling convention
        let mut new_sp = sp;
        if drops_handle {
            let frames = &mut self.threads[tid as usize].frames;
            for i in 0..(argc - 1) as u32 {
                let value = frames.slot(handle_slot + 1 + i);
                frames.set_slot(handle_slot + i, value);
            }
            new_sp -= 1;
        }

        let target = self.method(target).clone();
        new_sp -= target.invocation_argc() as u16;
        Ok((new_sp, target, stack_base + new_sp as u32))
    }

    /// Dispatch through a CallSite's target handle for invokedynamic.
    fn invoke_call_site(
        &mut self,
        tid: u32,
        call_site: ObjRef,
        descriptor: &MethodDescriptor,
        stack_base: u32,
        sp: u16,
    ) -> VmResult<(u16, Rc<Method>, u32)> {
        let handle = method_handles::call_site_target(self, tid, call_site)?;
        let (target, _) = method_handles::direct_target(self, tid, handle)?;
        let target = self.method(target).clone();

        let argc = descriptor.argc() as u16;
        let target_argc = target.invocation_argc() as u16;

        let mut sp = sp;
        if target_argc > argc {
            // Bound receiver: shift the arguments up and insert it below
            let receiver = method_handles::bound_receiver(self, tid, handle)?;
            let frames = &mut self.threads[tid as usize].frames;
            let arg_start = stack_base + (sp - argc) as u32;
            for i in (0..argc as u32).rev() {
                let value = frames.slot(arg_start + i);
                frames.set_slot(arg_start + i + 1, value);
            }
            frames.set_slot(arg_start, ObjRef::into_slot(receiver));
            sp += 1;
        }

        sp -= target_argc;
        Ok((sp, target, stack_base + sp as u32))
    }

    /// `ldc` of a non-numeric loadable constant.
    fn load_constant(&mut self, tid: u32, pool_class: ClassId, cp: u16) -> VmResult<JavaValue> {
        enum Pending {
            Str(Rc<str>),
            Class,
            MethodType(Rc<str>),
            MethodHandle,
            Dynamic,
        }

        let pending = match self.class(pool_class).pool.entry(cp) {
            CpEntry::Str(info) => match info.interned.get() {
                Some(interned) => return Ok(JavaValue::Reference(Some(interned))),
                None => Pending::Str(info.value.clone()),
            },
            CpEntry::Class(_) => Pending::Class,
            CpEntry::MethodType(info) => match info.resolved.get() {
                Some(resolved) => return Ok(JavaValue::Reference(Some(resolved))),
                None => Pending::MethodType(info.descriptor.clone()),
            },
            CpEntry::MethodHandle(info) => match info.resolved_handle.get() {
                Some(resolved) => return Ok(JavaValue::Reference(Some(resolved))),
                None => Pending::MethodHandle,
            },
            CpEntry::InvokeDynamic(info) if info.is_constant => Pending::Dynamic,
            x => panic!("ldc of unloadable constant {:?}", x),
        };

        match pending {
            Pending::Str(text) => {
                let interned = self.intern_string(tid, &text)?;
                if let CpEntry::Str(info) = self.class(pool_class).pool.entry(cp) {
                    info.interned.set(Some(interned));
                }
                Ok(JavaValue::Reference(Some(interned)))
            }
            Pending::Class => {
                let class = resolve_class_ref(self, tid, pool_class, cp)?;
                let mirror = get_class_mirror(self, tid, class)?;
                Ok(JavaValue::Reference(Some(mirror)))
            }
            Pending::MethodType(descriptor) => {
                let resolved = method_handles::resolve_method_type(self, tid, &descriptor)?;
                if let CpEntry::MethodType(info) = self.class(pool_class).pool.entry(cp) {
                    info.resolved.set(Some(resolved));
                }
                Ok(JavaValue::Reference(Some(resolved)))
            }
            Pending::MethodHandle => {
                let resolved = method_handles::resolve_method_handle(self, tid, pool_class, cp)?;
                if let CpEntry::MethodHandle(info) = self.class(pool_class).pool.entry(cp) {
                    info.resolved_handle.set(Some(resolved));
                }
                Ok(JavaValue::Reference(Some(resolved)))
            }
            Pending::Dynamic => method_handles::resolve_dynamic_constant(self, tid, pool_class, cp),
        }
    }

    /// Recursive allocation for multianewarray.
    pub fn new_multi_array(&mut self, tid: u32, class: ClassId, counts: &[i32]) -> VmResult<ObjRef> {
        let array = self.new_array(tid, class, counts[0])?;
        if counts.len() == 1 {
            return Ok(array);
        }

        let inner_class = self
            .class(class)
            .one_fewer_dim
            .expect("multianewarray of a non-array class");
        let handle = self.threads[tid as usize].handles.make(Some(array));

        for index in 0..counts[0] {
            let inner = self.new_multi_array(tid, inner_class, &counts[1..]);
            let array = self.threads[tid as usize].handles.get(handle).unwrap();
            match inner {
                Ok(inner) => self.heap.set_element(
                    array,
                    TypeKind::Reference,
                    index as usize,
                    JavaValue::Reference(Some(inner)),
                ),
                Err(raised) => {
                    self.threads[tid as usize].handles.drop_handle(handle);
                    return Err(raised);
                }
            }
        }

        let array = self.threads[tid as usize].handles.get(handle).unwrap();
        self.threads[tid as usize].handles.drop_handle(handle);
        Ok(array)
    }
}

// Arithmetic helpers shared by the dispatch arms

fn compare_values(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn fp_compare(a: f64, b: f64, nan_result: i32) -> i32 {
    if a.is_nan() || b.is_nan() {
        nan_result
    } else if a < b {
        -1
    } else if a > b {
        1
    } else {
        0
    }
}

/// JVMS narrowing conversion: NaN becomes zero, out-of-range saturates.
fn float_to_int(a: f32) -> i32 {
    if a.is_nan() {
        0
    } else if a >= i32::MAX as f32 {
        i32::MAX
    } else if a <= i32::MIN as f32 {
        i32::MIN
    } else {
        a as i32
    }
}

fn double_to_int(a: f64) -> i32 {
    if a.is_nan() {
        0
    } else if a >= i32::MAX as f64 {
        i32::MAX
    } else if a <= i32::MIN as f64 {
        i32::MIN
    } else {
        a as i32
    }
}

fn float_to_long(a: f64) -> i64 {
    if a.is_nan() {
        0
    } else if a >= i64::MAX as f64 {
        i64::MAX
    } else if a <= i64::MIN as f64 {
        i64::MIN
    } else {
        a as i64
    }
}

/// Sub-int field and array values widen to int on the operand stack.
fn widen_subint(value: JavaValue) -> u64 {
    match value {
        JavaValue::Byte(x) => x as i64 as u64,
        JavaValue::Short(x) => x as i64 as u64,
        JavaValue::Char(x) => x as u64,
        x => x.into_slot(),
    }
}

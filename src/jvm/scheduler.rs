use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::jvm::call::ExecEvent;
use crate::jvm::class::MethodId;
use crate::jvm::exceptions::raise_illegal_state;
use crate::jvm::mem::{mark_word_monitor, JavaValue, ObjRef};
use crate::jvm::thread::THREAD_FUEL;
use crate::jvm::JavaEnv;
use crate::util::unix_time_us;

/// Why a thread most recently left the interpreter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WakeupKind {
    /// Timeslice expired; runnable again immediately.
    Yielding,
    /// Thread.sleep until `wakeup_us`.
    Sleep,
    /// Waiting for the VM's reference-pending list to become nonempty.
    ReferencePending,
    /// Unsafe.park, cleared by an unpark permit or interrupt.
    Park,
    /// monitorenter on a contended monitor; retried by the scheduler.
    MonitorEnter,
    /// Object.wait; cleared by notify/notifyAll, timeout or interrupt.
    MonitorWait,
}

#[derive(Debug, Copy, Clone)]
pub struct Wakeup {
    pub kind: WakeupKind,
    /// Absolute reschedule time in microseconds; zero means indefinite.
    pub wakeup_us: u64,
    /// Monitor object for MonitorEnter/MonitorWait.
    pub monitor: Option<ObjRef>,
    /// Set by notify/notifyAll for MonitorWait.
    pub ready: bool,
}

impl Wakeup {
    pub fn yielding() -> Wakeup {
        Wakeup { kind: WakeupKind::Yielding, wakeup_us: 0, monitor: None, ready: false }
    }

    pub fn sleep_until(deadline_us: u64) -> Wakeup {
        Wakeup { kind: WakeupKind::Sleep, wakeup_us: deadline_us, monitor: None, ready: false }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerResult {
    /// Every non-daemon thread has drained its queue.
    Done,
    /// More work is pending; call `step` again (possibly after sleeping
    /// `may_sleep_us`).
    More,
    /// The VM is in an illegal state for the request.
    Inval,
}

/// Identifier of an execution record returned by `schedule`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExecId(pub u32);

pub struct ExecutionRecord {
    pub status: SchedulerResult,
    pub tid: u32,
    pub returned: Option<JavaValue>,
    /// Uncaught exception that terminated the call, if any.
    pub exception: Option<ObjRef>,
    /// JS handle pinning a reference return value for the embedder.
    pub js_handle: Option<i32>,
}

pub struct PendingCall {
    pub method: MethodId,
    pub args: Vec<JavaValue>,
    pub record: ExecId,
}

struct ThreadEntry {
    tid: u32,
    queue: VecDeque<PendingCall>,
    wakeup: Option<Wakeup>,
    is_running: bool,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    round_robin: Vec<ThreadEntry>,
    records: Vec<Option<ExecutionRecord>>,
}

/// Cooperative round-robin scheduler. All queue and wakeup mutations happen
/// under one mutex; the interpreter itself runs with the mutex released.
pub struct Scheduler {
    pub preemption_us: u64,
    pub(crate) state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(preemption_us: u64) -> Self {
        Scheduler {
            preemption_us: preemption_us.max(1000),
            state: Mutex::new(SchedulerState::default()),
        }
    }
}

impl SchedulerState {
    fn entry_for(&mut self, tid: u32) -> &mut ThreadEntry {
        if let Some(index) = self.round_robin.iter().position(|x| x.tid == tid) {
            return &mut self.round_robin[index];
        }
        self.round_robin.push(ThreadEntry {
            tid,
            queue: VecDeque::new(),
            wakeup: None,
            is_running: false,
        });
        self.round_robin.last_mut().unwrap()
    }
}

impl JavaEnv {
    /// Queue `method(args)` on the target thread and return an execution
    /// record id the embedder can poll.
    pub fn schedule_on(&mut self, tid: u32, method: MethodId, args: Vec<JavaValue>) -> ExecId {
        let mut state = self.scheduler.state.lock();
        let record = ExecId(state.records.len() as u32);
        state.records.push(Some(ExecutionRecord {
            status: SchedulerResult::More,
            tid,
            returned: None,
            exception: None,
            js_handle: None,
        }));
        state.entry_for(tid).queue.push_back(PendingCall { method, args, record });
        record
    }

    /// Queue a call on the main thread.
    pub fn schedule(&mut self, method: MethodId, args: Vec<JavaValue>) -> ExecId {
        let main = self.main_thread();
        self.schedule_on(main, method, args)
    }

    pub fn record_status(&self, record: ExecId) -> SchedulerResult {
        let state = self.scheduler.state.lock();
        match &state.records[record.0 as usize] {
            Some(rec) => rec.status,
            None => SchedulerResult::Inval,
        }
    }

    pub fn record_result(&self, record: ExecId) -> Option<(Option<JavaValue>, Option<ObjRef>)> {
        let state = self.scheduler.state.lock();
        state.records[record.0 as usize]
            .as_ref()
            .filter(|rec| rec.status == SchedulerResult::Done)
            .map(|rec| (rec.returned, rec.exception))
    }

    pub fn free_execution_record(&mut self, record: ExecId) {
        let mut state = self.scheduler.state.lock();
        if let Some(rec) = state.records[record.0 as usize].take() {
            drop(state);
            if let Some(handle) = rec.js_handle {
                self.drop_js_handle(handle);
            }
        }
    }

    /// Whether a thread is currently unable to run. Interrupt cancels the
    /// interruptible waits (sleep, wait, park).
    fn thread_is_sleeping(&self, tid: u32, wakeup: &Wakeup, now_us: u64) -> bool {
        let thread = &self.threads[tid as usize];
        match wakeup.kind {
            WakeupKind::Yielding => false,
            WakeupKind::ReferencePending => self.reference_pending_list.is_none(),
            WakeupKind::MonitorEnter => {
                // Per the recorded open question, interrupt wakes a
                // monitor-enter waiter (it then retries the acquire)
                if thread.interrupted {
                    return false;
                }
                match wakeup.monitor.and_then(|obj| mark_word_monitor(self.heap.mark_word(obj))) {
                    Some(id) => {
                        let data = self.monitors.get(id);
                        data.owner.is_some() && data.owner != Some(tid)
                    }
                    None => false,
                }
            }
            WakeupKind::Sleep => {
                !thread.interrupted && (wakeup.wakeup_us == 0 || wakeup.wakeup_us > now_us)
            }
            WakeupKind::Park => {
                !thread.unpark_permit
                    && !thread.interrupted
                    && (wakeup.wakeup_us == 0 || wakeup.wakeup_us > now_us)
            }
            WakeupKind::MonitorWait => {
                !wakeup.ready
                    && !thread.interrupted
                    && (wakeup.wakeup_us == 0 || wakeup.wakeup_us > now_us)
            }
        }
    }

    fn only_daemons_pending(&self, state: &SchedulerState) -> bool {
        state
            .round_robin
            .iter()
            .all(|entry| entry.queue.is_empty() || self.threads[entry.tid as usize].daemon)
    }

    /// Whether any non-daemon work remains queued, without running anything.
    pub fn poll(&self) -> SchedulerResult {
        let state = self.scheduler.state.lock();
        if state.round_robin.is_empty() || self.only_daemons_pending(&state) {
            SchedulerResult::Done
        } else {
            SchedulerResult::More
        }
    }

    /// Run one scheduling step: pick the next runnable thread, execute until
    /// it completes its current call or suspends, and record the outcome.
    pub fn step(&mut self) -> SchedulerResult {
        let picked = {
            let mut state = self.scheduler.state.lock();
            if state.round_robin.is_empty() || self.only_daemons_pending(&state) {
                return SchedulerResult::Done;
            }

            let now_us = unix_time_us();
            let mut picked = None;
            for _ in 0..state.round_robin.len() {
                let entry = state.round_robin.remove(0);
                let tid = entry.tid;
                let runnable = !entry.is_running
                    && !entry.queue.is_empty()
                    && entry
                        .wakeup
                        .as_ref()
                        .map(|w| !self.thread_is_sleeping(tid, w, now_us))
                        .unwrap_or(true);
                state.round_robin.push(entry);
                if runnable {
                    picked = Some(tid);
                    break;
                }
            }

            match picked {
                Some(tid) => {
                    let entry = state.round_robin.iter_mut().find(|x| x.tid == tid).unwrap();
                    entry.is_running = true;
                    entry.wakeup = None;
                    tid
                }
                None => return SchedulerResult::More,
            }
        };

        self.run_pending(picked);

        let state = self.scheduler.state.lock();
        if state.round_robin.iter().all(|x| x.queue.is_empty())
            || self.only_daemons_pending(&state)
        {
            SchedulerResult::Done
        } else {
            SchedulerResult::More
        }
    }

    /// Execute the front pending call of a thread until completion or
    /// suspension, with the scheduler mutex released.
    fn run_pending(&mut self, tid: u32) {
        let call = {
            let mut state = self.scheduler.state.lock();
            let entry = state.entry_for(tid);
            match entry.queue.front() {
                Some(front) => (front.method, front.args.clone(), front.record),
                None => {
                    entry.is_running = false;
                    return;
                }
            }
        };
        let (method, args, record) = call;

        {
            let thread = &mut self.threads[tid as usize];
            thread.fuel = THREAD_FUEL;
            thread.yield_at_us = unix_time_us().saturating_add(self.scheduler.preemption_us);
        }

        // A nonempty frame stack means we are resuming a suspended call
        let outcome = if self.threads[tid as usize].frames.depth() == 0 {
            match self.push_call(tid, method, &args) {
                Ok(()) => Some(self.execute(tid, 0)),
                Err(_) => None,
            }
        } else {
            Some(self.execute(tid, 0))
        };

        let mut finished = None;
        let mut wakeup = None;
        match outcome {
            Some(Ok(ExecEvent::Finished(value))) => finished = Some((value, None)),
            Some(Ok(ExecEvent::Suspended(w))) => wakeup = Some(w),
            Some(Err(_)) | None => {
                let exception = self.threads[tid as usize].current_exception.take();
                finished = Some((None, exception));
            }
        }

        // Pin reference results for the embedder before publishing
        let mut js_handle = None;
        if let Some((Some(JavaValue::Reference(Some(obj))), _)) = finished {
            js_handle = Some(self.make_js_handle(obj));
        }
        if let Some((_, Some(exception))) = finished {
            js_handle = Some(self.make_js_handle(exception));
        }

        let mut state = self.scheduler.state.lock();
        let entry = state.entry_for(tid);
        entry.is_running = false;

        match finished {
            Some((value, exception)) => {
                entry.queue.pop_front();
                let drained = entry.queue.is_empty();
                if let Some(rec) = state.records[record.0 as usize].as_mut() {
                    rec.status = SchedulerResult::Done;
                    rec.returned = value;
                    rec.exception = exception;
                    rec.js_handle = js_handle;
                }
                if drained {
                    // Rotation: a drained thread stops participating until
                    // new work arrives
                    state.round_robin.retain(|x| !(x.tid == tid && x.queue.is_empty()));
                    drop(state);
                    self.notify_thread_death(tid);
                }
            }
            None => {
                entry.wakeup = wakeup;
            }
        }
    }

    /// Wake threads joined on a finished thread's Thread object.
    fn notify_thread_death(&mut self, tid: u32) {
        if let Some(thread_obj) = self.threads[tid as usize].thread_obj {
            self.monitor_notify(thread_obj, true);
        }
    }

    /// Flag waiters on a monitor ready (`Object.notify`/`notifyAll`).
    pub fn monitor_notify(&self, monitor: ObjRef, all: bool) {
        let mut state = self.scheduler.state.lock();
        for entry in state.round_robin.iter_mut() {
            if let Some(wakeup) = entry.wakeup.as_mut() {
                if wakeup.kind == WakeupKind::MonitorWait && wakeup.monitor == Some(monitor) {
                    wakeup.ready = true;
                    if !all {
                        break;
                    }
                }
            }
        }
    }

    /// Minimum time the embedder may idle before any timed wakeup fires.
    /// Zero means work is runnable right now; `u64::MAX` means everything is
    /// blocked indefinitely.
    pub fn may_sleep_us(&self) -> u64 {
        let state = self.scheduler.state.lock();
        let now_us = unix_time_us();
        let mut min = u64::MAX;

        for entry in &state.round_robin {
            if entry.queue.is_empty() {
                continue;
            }
            match &entry.wakeup {
                Some(wakeup) if self.thread_is_sleeping(entry.tid, wakeup, now_us) => {
                    if wakeup.wakeup_us != 0 && wakeup.wakeup_us < min {
                        min = wakeup.wakeup_us;
                    }
                }
                _ => return 0,
            }
        }

        if min == u64::MAX {
            u64::MAX
        } else {
            min.saturating_sub(now_us)
        }
    }

    /// Run the owning thread's queue up to and including `record` with
    /// suspension disabled; any attempt to suspend raises
    /// IllegalStateException and returns Inval.
    pub fn execute_immediately(&mut self, record: ExecId) -> SchedulerResult {
        let tid = {
            let state = self.scheduler.state.lock();
            match &state.records[record.0 as usize] {
                Some(rec) if rec.status == SchedulerResult::Done => return SchedulerResult::Done,
                Some(rec) => rec.tid,
                None => return SchedulerResult::Inval,
            }
        };

        loop {
            let call = {
                let mut state = self.scheduler.state.lock();
                let entry = state.entry_for(tid);
                match entry.queue.front() {
                    Some(front) => (front.method, front.args.clone(), front.record),
                    None => return SchedulerResult::Done,
                }
            };
            let (method, args, current) = call;

            self.threads[tid as usize].synchronous_depth += 1;
            let outcome = if self.threads[tid as usize].frames.depth() == 0 {
                match self.push_call(tid, method, &args) {
                    Ok(()) => self.execute(tid, 0),
                    Err(raised) => Err(raised),
                }
            } else {
                self.execute(tid, 0)
            };
            self.threads[tid as usize].synchronous_depth -= 1;

            let (value, exception) = match outcome {
                Ok(ExecEvent::Finished(value)) => (value, None),
                Ok(ExecEvent::Suspended(_)) => {
                    let _ = raise_illegal_state(
                        self,
                        tid,
                        "Cannot synchronously execute this method",
                    );
                    return SchedulerResult::Inval;
                }
                Err(_) => (None, self.threads[tid as usize].current_exception.take()),
            };

            let mut state = self.scheduler.state.lock();
            let entry = state.entry_for(tid);
            entry.queue.pop_front();
            if let Some(rec) = state.records[current.0 as usize].as_mut() {
                rec.status = SchedulerResult::Done;
                rec.returned = value;
                rec.exception = exception;
            }

            if current == record {
                return SchedulerResult::Done;
            }
        }
    }

    /// GC support: rewrite every object reference the scheduler holds
    /// (pending-call arguments, wakeup monitors, finished-record results).
    pub(crate) fn remap_scheduler_roots(&mut self, remap: &mut dyn FnMut(ObjRef) -> ObjRef) {
        let mut state = self.scheduler.state.lock();
        for entry in state.round_robin.iter_mut() {
            for call in entry.queue.iter_mut() {
                for arg in call.args.iter_mut() {
                    if let JavaValue::Reference(Some(obj)) = arg {
                        *arg = JavaValue::Reference(Some(remap(*obj)));
                    }
                }
            }
            if let Some(wakeup) = entry.wakeup.as_mut() {
                if let Some(monitor) = wakeup.monitor {
                    wakeup.monitor = Some(remap(monitor));
                }
            }
        }
        for record in state.records.iter_mut().flatten() {
            if let Some(JavaValue::Reference(Some(obj))) = record.returned {
                record.returned = Some(JavaValue::Reference(Some(remap(obj))));
            }
            if let Some(exception) = record.exception {
                record.exception = Some(remap(exception));
            }
        }
    }

    /// Collect scheduler-held references for the mark phase.
    pub(crate) fn collect_scheduler_roots(&self, out: &mut Vec<ObjRef>) {
        let state = self.scheduler.state.lock();
        for entry in state.round_robin.iter() {
            for call in entry.queue.iter() {
                for arg in call.args.iter() {
                    if let JavaValue::Reference(Some(obj)) = arg {
                        out.push(*obj);
                    }
                }
            }
            if let Some(Wakeup { monitor: Some(obj), .. }) = entry.wakeup {
                out.push(obj);
            }
        }
        for record in state.records.iter().flatten() {
            if let Some(JavaValue::Reference(Some(obj))) = record.returned {
                out.push(obj);
            }
            if let Some(exception) = record.exception {
                out.push(exception);
            }
        }
    }
}

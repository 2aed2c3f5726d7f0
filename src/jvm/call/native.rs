use hashbrown::HashMap;

use crate::jvm::mem::JavaValue;
use crate::jvm::scheduler::Wakeup;
use crate::jvm::thread::FrameData;
use crate::jvm::{JavaEnv, VmResult};

/// A synchronous native method. Arguments are read through
/// `JavaEnv::native_args`, which always reflects the live (GC-updated)
/// argument slots of the current native frame; natives that allocate must
/// re-read reference arguments afterwards rather than caching `ObjRef`s.
pub type SyncNative = fn(&mut JavaEnv, u32) -> VmResult<Option<JavaValue>>;

#[derive(Debug)]
pub enum AsyncPoll {
    Ready(Option<JavaValue>),
    /// Not finished; the scheduler parks the thread with this wakeup and the
    /// state machine is polled again on resume.
    NotReady(Wakeup),
}

/// An asynchronous native method: an explicit state machine stored in the
/// native frame across suspensions. Reference state must be held through the
/// thread handle table, never as raw `ObjRef`s.
pub trait AsyncNative {
    fn poll(&mut self, env: &mut JavaEnv, tid: u32) -> VmResult<AsyncPoll>;
}

pub enum NativeMethod {
    Sync(SyncNative),
    Async(fn() -> Box<dyn AsyncNative>),
}

/// Process-wide table of host callbacks keyed by (class, name, descriptor).
/// Registration happens before VM start; `bind` is consulted whenever a
/// class is defined, and a native method with no entry raises
/// UnsatisfiedLinkError on first call.
#[derive(Default)]
pub struct NativeRegistry {
    entries: Vec<NativeMethod>,
    by_key: HashMap<(String, String, String), u32>,
}

impl NativeRegistry {
    pub fn register(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        method: NativeMethod,
    ) {
        let key = (class.to_string(), name.to_string(), descriptor.to_string());
        if let Some(existing) = self.by_key.get(&key) {
            warn!("native {}.{}{} registered twice", class, name, descriptor);
            self.entries[*existing as usize] = method;
            return;
        }

        let index = self.entries.len() as u32;
        self.entries.push(method);
        self.by_key.insert(key, index);
    }

    pub fn lookup(&self, class: &str, name: &str, descriptor: &str) -> Option<u32> {
        self.by_key
            .get(&(class.to_string(), name.to_string(), descriptor.to_string()))
            .copied()
    }

    pub fn get(&self, index: u32) -> &NativeMethod {
        &self.entries[index as usize]
    }
}

impl JavaEnv {
    /// Arguments of the current native frame. For instance methods the
    /// receiver is argument 0.
    pub fn native_args(&self, tid: u32) -> &[JavaValue] {
        match &self.threads[tid as usize].frames.top().expect("no native frame").data {
            FrameData::Native { args, .. } => args,
            FrameData::Plain { .. } => panic!("top frame is not native"),
        }
    }

    pub fn native_arg(&self, tid: u32, index: usize) -> JavaValue {
        self.native_args(tid)[index]
    }
}

use crate::jvm::mem::{Heap, ObjRef};

/// Identifier of an inflated monitor within the VM's monitor table. Stored in
/// an object's mark word as `(id << 1) | 1`; a mark word with a clear low bit
/// is an identity hash (or zero if neither has been needed yet).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorId(pub u32);

#[derive(Debug)]
pub struct MonitorData {
    /// Mark word displaced by inflation, restored on deflation.
    pub saved_mark: u64,
    pub owner: Option<u32>,
    pub hold_count: u32,
}

#[derive(Debug, PartialEq)]
pub enum MonitorError {
    NotOwner,
}

/// All inflated monitors. The mark word holds an index into this table
/// rather than an interior pointer, so compaction only has to free entries
/// of dead objects instead of relocating monitor blocks.
#[derive(Default)]
pub struct MonitorTable {
    slots: Vec<Option<MonitorData>>,
    free: Vec<u32>,
}

pub fn mark_word_monitor(mark: u64) -> Option<MonitorId> {
    if mark & 1 != 0 {
        Some(MonitorId((mark >> 1) as u32))
    } else {
        None
    }
}

impl MonitorTable {
    pub fn get(&self, id: MonitorId) -> &MonitorData {
        self.slots[id.0 as usize].as_ref().expect("stale monitor id")
    }

    pub fn get_mut(&mut self, id: MonitorId) -> &mut MonitorData {
        self.slots[id.0 as usize].as_mut().expect("stale monitor id")
    }

    fn insert(&mut self, data: MonitorData) -> MonitorId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(data);
                MonitorId(index)
            }
            None => {
                self.slots.push(Some(data));
                MonitorId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn remove(&mut self, id: MonitorId) -> MonitorData {
        let data = self.slots[id.0 as usize].take().expect("stale monitor id");
        self.free.push(id.0);
        data
    }

    /// Ids of every live monitor; the GC uses this to reclaim entries of
    /// dead objects.
    pub fn iter_ids(&self) -> impl Iterator<Item = MonitorId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| MonitorId(index as u32))
    }

    /// Monitor for the object, inflating the mark word if none exists yet.
    pub fn inflate(&mut self, heap: &mut Heap, obj: ObjRef) -> MonitorId {
        let mark = heap.mark_word(obj);
        if let Some(id) = mark_word_monitor(mark) {
            return id;
        }

        let id = self.insert(MonitorData {
            saved_mark: mark,
            owner: None,
            hold_count: 0,
        });
        heap.set_mark_word(obj, ((id.0 as u64) << 1) | 1);
        trace!("inflated monitor {:?} for {:?}", id, obj);
        id
    }

    /// Attempt to acquire without blocking. Succeeds when the monitor is free
    /// or already held by `tid` (recursive entry).
    pub fn try_acquire(&mut self, id: MonitorId, tid: u32) -> bool {
        let data = self.get_mut(id);
        match data.owner {
            None => {
                data.owner = Some(tid);
                data.hold_count = 1;
                true
            }
            Some(owner) if owner == tid => {
                data.hold_count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one hold. Deflates the monitor and restores the displaced mark
    /// word when the last hold is dropped, so an uncontended object returns
    /// to its pre-lock header state.
    pub fn release(&mut self, heap: &mut Heap, obj: ObjRef, tid: u32) -> Result<(), MonitorError> {
        let id = match mark_word_monitor(heap.mark_word(obj)) {
            Some(id) => id,
            None => return Err(MonitorError::NotOwner),
        };

        let data = self.get_mut(id);
        if data.owner != Some(tid) || data.hold_count == 0 {
            return Err(MonitorError::NotOwner);
        }

        data.hold_count -= 1;
        if data.hold_count == 0 {
            data.owner = None;
            let saved = data.saved_mark;
            self.remove(id);
            heap.set_mark_word(obj, saved);
        }
        Ok(())
    }

    /// For `Object.wait`: drop every hold while remembering the count so it
    /// can be restored after reacquisition.
    pub fn release_all_for_wait(
        &mut self,
        heap: &mut Heap,
        obj: ObjRef,
        tid: u32,
    ) -> Result<u32, MonitorError> {
        let id = match mark_word_monitor(heap.mark_word(obj)) {
            Some(id) => id,
            None => return Err(MonitorError::NotOwner),
        };

        let data = self.get_mut(id);
        if data.owner != Some(tid) || data.hold_count == 0 {
            return Err(MonitorError::NotOwner);
        }

        let saved = data.hold_count;
        data.hold_count = 0;
        data.owner = None;
        Ok(saved)
    }

    pub fn restore_after_wait(&mut self, heap: &mut Heap, obj: ObjRef, tid: u32, hold_count: u32) {
        let id = self.inflate(heap, obj);
        let data = self.get_mut(id);
        debug_assert_eq!(data.owner, Some(tid));
        data.hold_count = hold_count;
    }

    /// True when `tid` currently owns the object's monitor.
    pub fn owned_by(&self, heap: &Heap, obj: ObjRef, tid: u32) -> bool {
        match mark_word_monitor(heap.mark_word(obj)) {
            Some(id) => self.get(id).owner == Some(tid),
            None => false,
        }
    }
}

/// Identity hash with lazy assignment. Zero mark words receive the next
/// counter value; inflated objects keep their hash in the displaced word.
pub fn identity_hash(
    heap: &mut Heap,
    monitors: &mut MonitorTable,
    obj: ObjRef,
    next_hash: &mut u64,
) -> i32 {
    let mark = heap.mark_word(obj);

    match mark_word_monitor(mark) {
        Some(id) => {
            let data = monitors.get_mut(id);
            if data.saved_mark == 0 {
                data.saved_mark = *next_hash << 1;
                *next_hash += 1;
            }
            (data.saved_mark >> 1) as i32
        }
        None => {
            let mut word = mark;
            if word == 0 {
                word = *next_hash << 1;
                *next_hash += 1;
                heap.set_mark_word(obj, word);
            }
            (word >> 1) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::mem::OBJECT_HEADER_BYTES;

    fn test_obj(heap: &mut Heap) -> ObjRef {
        heap.alloc_raw(OBJECT_HEADER_BYTES, false).unwrap()
    }

    #[test]
    fn recursive_acquire_requires_matching_releases() {
        let mut heap = Heap::new(1 << 16);
        let mut monitors = MonitorTable::default();
        let obj = test_obj(&mut heap);

        let id = monitors.inflate(&mut heap, obj);
        for _ in 0..5 {
            assert!(monitors.try_acquire(id, 1));
        }
        assert_eq!(monitors.get(id).hold_count, 5);

        for _ in 0..4 {
            monitors.release(&mut heap, obj, 1).unwrap();
            assert!(monitors.owned_by(&heap, obj, 1));
        }
        monitors.release(&mut heap, obj, 1).unwrap();
        assert!(!monitors.owned_by(&heap, obj, 1));
    }

    #[test]
    fn release_by_non_owner_fails() {
        let mut heap = Heap::new(1 << 16);
        let mut monitors = MonitorTable::default();
        let obj = test_obj(&mut heap);

        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 1));
        assert_eq!(monitors.release(&mut heap, obj, 2), Err(MonitorError::NotOwner));

        // An object that was never locked cannot be released either
        let other = test_obj(&mut heap);
        assert_eq!(monitors.release(&mut heap, other, 1), Err(MonitorError::NotOwner));
    }

    #[test]
    fn contended_acquire_fails_until_released() {
        let mut heap = Heap::new(1 << 16);
        let mut monitors = MonitorTable::default();
        let obj = test_obj(&mut heap);

        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 1));
        assert!(!monitors.try_acquire(id, 2));

        monitors.release(&mut heap, obj, 1).unwrap();
        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 2));
    }

    #[test]
    fn mark_word_returns_to_prior_state_after_release() {
        let mut heap = Heap::new(1 << 16);
        let mut monitors = MonitorTable::default();
        let mut next_hash = 1;
        let obj = test_obj(&mut heap);

        // Hash the object first so the displaced word is nonzero
        let hash = identity_hash(&mut heap, &mut monitors, obj, &mut next_hash);
        let before = heap.mark_word(obj);

        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 1));
        assert_ne!(heap.mark_word(obj), before);
        // Hash must be stable while inflated
        assert_eq!(identity_hash(&mut heap, &mut monitors, obj, &mut next_hash), hash);

        monitors.release(&mut heap, obj, 1).unwrap();
        assert_eq!(heap.mark_word(obj), before);
    }

    #[test]
    fn wait_saves_and_restores_hold_count() {
        let mut heap = Heap::new(1 << 16);
        let mut monitors = MonitorTable::default();
        let obj = test_obj(&mut heap);

        let id = monitors.inflate(&mut heap, obj);
        for _ in 0..3 {
            assert!(monitors.try_acquire(id, 7));
        }

        let saved = monitors.release_all_for_wait(&mut heap, obj, 7).unwrap();
        assert_eq!(saved, 3);
        assert!(!monitors.owned_by(&heap, obj, 7));

        // Another thread slips in and out
        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 8));
        monitors.release(&mut heap, obj, 8).unwrap();

        let id = monitors.inflate(&mut heap, obj);
        assert!(monitors.try_acquire(id, 7));
        monitors.restore_after_wait(&mut heap, obj, 7, saved);
        assert_eq!(monitors.get(id).hold_count, 3);
    }
}

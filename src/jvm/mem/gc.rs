use hashbrown::HashSet;

use crate::jvm::class::{ClassId, ClassKind, CpEntry};
use crate::jvm::mem::{mark_word_monitor, JavaValue, MonitorId, ObjRef, TypeKind, OBJECT_HEADER_BYTES};
use crate::jvm::thread::FrameData;
use crate::jvm::JavaEnv;
use crate::util::align_up;

/// Byte size of an object on the heap, header included.
pub fn size_of_object(env: &JavaEnv, obj: ObjRef) -> usize {
    let class = env.class(env.heap.class_of(obj));
    let bytes = match class.kind {
        ClassKind::Ordinary | ClassKind::Primitive => {
            OBJECT_HEADER_BYTES + class.instance_bytes.get() as usize
        }
        ClassKind::OrdinaryArray | ClassKind::PrimitiveArray => {
            let length = env.heap.array_length(obj) as usize;
            OBJECT_HEADER_BYTES + length * class.element_kind().size_bytes()
        }
    };
    align_up(bytes, 8)
}

/// Relocation table built during compaction: sorted original addresses with
/// their new addresses in lockstep.
struct Relocations {
    old: Vec<ObjRef>,
    new: Vec<ObjRef>,
}

impl Relocations {
    fn remap(&self, obj: ObjRef) -> ObjRef {
        match self.old.binary_search(&obj) {
            Ok(index) => self.new[index],
            Err(_) => panic!("dangling reference {:?} survived the mark phase", obj),
        }
    }
}

impl JavaEnv {
    /// Stop-the-world mark + sliding compaction. Every live object moves to
    /// the lowest free address (never upward), and every reference in the
    /// heap and the root set is rewritten. Monitors of dead objects are
    /// freed. Since execution is cooperative, every thread is already at a
    /// safe point between interpreter suspensions.
    pub fn major_gc(&mut self) {
        let before = self.heap.used();

        // --- Root enumeration and marking
        let mut roots = Vec::new();
        self.collect_roots(&mut roots);

        let mut reachable: HashSet<ObjRef> = HashSet::new();
        let mut worklist: Vec<ObjRef> = Vec::new();
        for root in roots {
            if self.heap.contains(root) && reachable.insert(root) {
                worklist.push(root);
            }
        }

        let mut objs: Vec<ObjRef> = Vec::new();
        while let Some(obj) = worklist.pop() {
            objs.push(obj);
            self.mark_children(obj, &mut reachable, &mut worklist);
        }

        // --- Compaction: copy live objects downward in address order
        objs.sort_unstable();

        let mut live_monitors: HashSet<MonitorId> = HashSet::new();
        let mut new_locations = Vec::with_capacity(objs.len());
        let mut write_ptr = 8usize;

        for obj in &objs {
            if let Some(id) = mark_word_monitor(self.heap.mark_word(*obj)) {
                live_monitors.insert(id);
            }

            let size = size_of_object(self, *obj);
            debug_assert!(obj.offset() >= write_ptr);
            // Old and new regions alias the same storage; ranges may overlap
            self.heap.copy_within(obj.offset(), write_ptr, size);
            new_locations.push(ObjRef::from_offset(write_ptr));
            write_ptr += size;
        }

        let relocations = Relocations { old: objs, new: new_locations };

        // --- Rewrite every reference to its new address
        self.rewrite_heap_references(&relocations);
        self.rewrite_roots(&relocations);
        self.monitors_retain(&live_monitors);

        self.heap.set_used(align_up(write_ptr, 8));
        debug!(
            "gc: {} -> {} bytes, {} live objects",
            before,
            self.heap.used(),
            relocations.old.len()
        );
    }

    fn mark_children(
        &self,
        obj: ObjRef,
        reachable: &mut HashSet<ObjRef>,
        worklist: &mut Vec<ObjRef>,
    ) {
        let mut note = |target: Option<ObjRef>| {
            if let Some(target) = target {
                if reachable.insert(target) {
                    worklist.push(target);
                }
            }
        };

        let class = self.class(self.heap.class_of(obj));
        match class.kind {
            ClassKind::Ordinary | ClassKind::Primitive => {
                for offset in &class.instance_refs {
                    let address = obj.offset() + OBJECT_HEADER_BYTES + *offset as usize;
                    note(ObjRef::from_slot(self.heap.read_u64(address)));
                }
            }
            ClassKind::OrdinaryArray => {
                for index in 0..self.heap.array_length(obj) as usize {
                    match self.heap.get_element(obj, TypeKind::Reference, index) {
                        JavaValue::Reference(target) => note(target),
                        _ => unreachable!(),
                    }
                }
            }
            ClassKind::PrimitiveArray => {
                if class.dimensions > 1 {
                    for index in 0..self.heap.array_length(obj) as usize {
                        match self.heap.get_element(obj, TypeKind::Reference, index) {
                            JavaValue::Reference(target) => note(target),
                            _ => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    /// Rewrite reference fields inside every relocated object.
    fn rewrite_heap_references(&mut self, relocations: &Relocations) {
        for index in 0..relocations.new.len() {
            let obj = relocations.new[index];
            let class_id = self.heap.class_of(obj);
            let (kind, dimensions, instance_refs) = {
                let class = self.class(class_id);
                (class.kind, class.dimensions, class.instance_refs.clone())
            };

            let reference_array = matches!(kind, ClassKind::OrdinaryArray)
                || (matches!(kind, ClassKind::PrimitiveArray) && dimensions > 1);

            if reference_array {
                for element in 0..self.heap.array_length(obj) as usize {
                    let address =
                        crate::jvm::mem::Heap::element_address(obj, TypeKind::Reference, element);
                    if let Some(target) = ObjRef::from_slot(self.heap.read_u64(address)) {
                        let moved = relocations.remap(target);
                        self.heap.write_u64(address, ObjRef::into_slot(Some(moved)));
                    }
                }
            } else if matches!(kind, ClassKind::Ordinary | ClassKind::Primitive) {
                for offset in instance_refs {
                    let address = obj.offset() + OBJECT_HEADER_BYTES + offset as usize;
                    if let Some(target) = ObjRef::from_slot(self.heap.read_u64(address)) {
                        let moved = relocations.remap(target);
                        self.heap.write_u64(address, ObjRef::into_slot(Some(moved)));
                    }
                }
            }
        }
    }

    /// Drop monitor-table entries whose objects did not survive.
    fn monitors_retain(&mut self, live: &HashSet<MonitorId>) {
        let stale: Vec<MonitorId> = self.monitors.iter_ids().filter(|id| !live.contains(id)).collect();
        for id in stale {
            self.monitors.remove(id);
        }
    }

    /// Enumerate every root location's current value, mirroring
    /// `rewrite_roots` exactly.
    fn collect_roots(&mut self, out: &mut Vec<ObjRef>) {
        macro_rules! note_cell {
            ($cell:expr) => {
                if let Some(obj) = $cell.get() {
                    out.push(obj);
                }
            };
        }

        for class in &self.classes {
            note_cell!(class.mirror);
            note_cell!(class.cp_mirror);
            note_cell!(class.classloader_mirror);
            note_cell!(class.linkage_error);

            for method in &class.methods {
                note_cell!(method.reflection_method);
                note_cell!(method.reflection_ctor);
                note_cell!(method.method_type_obj);
            }
            for field in &class.fields {
                note_cell!(field.reflection_field);
            }

            for entry in class.pool.entries() {
                match entry {
                    CpEntry::Class(info) => note_cell!(info.error),
                    CpEntry::Str(info) => note_cell!(info.interned),
                    CpEntry::MethodHandle(info) => {
                        note_cell!(info.resolved_mt);
                        note_cell!(info.resolved_handle);
                    }
                    CpEntry::MethodType(info) => note_cell!(info.resolved),
                    CpEntry::InvokeDynamic(info) => note_cell!(info.resolved_mt),
                    _ => {}
                }
            }

            // Inline caches holding CallSite / MethodType objects
            for (method_index, insn_index) in class.indy_insns.iter().chain(&class.sigpoly_insns) {
                let code = class.methods[*method_index as usize].code.as_ref().unwrap();
                note_cell!(code.insns[*insn_index as usize].ic2);
            }

            for offset in &class.static_refs {
                if let JavaValue::Reference(Some(obj)) =
                    crate::jvm::read_static(&class.static_data, *offset as usize, TypeKind::Reference)
                {
                    out.push(obj);
                }
            }
        }

        if let Some(obj) = self.main_thread_group {
            out.push(obj);
        }
        if let Some(obj) = self.reference_pending_list {
            out.push(obj);
        }
        out.extend(self.modules.values().copied());
        out.extend(self.interned_strings.values().copied());

        self.js_handles.remap(&mut |obj| {
            out.push(obj);
            obj
        });

        for tid in 0..self.threads.len() {
            let thread = &self.threads[tid];
            out.extend(thread.thread_obj);
            out.extend(thread.current_exception);
            out.extend(thread.out_of_mem_error);
            out.extend(thread.stack_overflow_error);

            for slot in self.thread_frame_ref_slots(tid as u32) {
                if let Some(obj) = ObjRef::from_slot(self.threads[tid].frames.slot(slot)) {
                    out.push(obj);
                }
            }
            for frame in &self.threads[tid].frames.frames {
                out.extend(frame.sync_target);
                if let FrameData::Native { args, .. } = &frame.data {
                    for arg in args {
                        if let JavaValue::Reference(Some(obj)) = arg {
                            out.push(*obj);
                        }
                    }
                }
            }
        }

        for tid in 0..self.threads.len() {
            self.threads[tid].handles.remap(&mut |obj| {
                out.push(obj);
                obj
            });
        }

        self.collect_scheduler_roots(out);
    }

    /// Rewrite every root location through the relocation table. Must visit
    /// exactly the locations `collect_roots` reads.
    fn rewrite_roots(&mut self, relocations: &Relocations) {
        macro_rules! remap_cell {
            ($cell:expr) => {
                if let Some(obj) = $cell.get() {
                    $cell.set(Some(relocations.remap(obj)));
                }
            };
        }

        for class in &self.classes {
            remap_cell!(class.mirror);
            remap_cell!(class.cp_mirror);
            remap_cell!(class.classloader_mirror);
            remap_cell!(class.linkage_error);

            for method in &class.methods {
                remap_cell!(method.reflection_method);
                remap_cell!(method.reflection_ctor);
                remap_cell!(method.method_type_obj);
            }
            for field in &class.fields {
                remap_cell!(field.reflection_field);
            }

            for entry in class.pool.entries() {
                match entry {
                    CpEntry::Class(info) => remap_cell!(info.error),
                    CpEntry::Str(info) => remap_cell!(info.interned),
                    CpEntry::MethodHandle(info) => {
                        remap_cell!(info.resolved_mt);
                        remap_cell!(info.resolved_handle);
                    }
                    CpEntry::MethodType(info) => remap_cell!(info.resolved),
                    CpEntry::InvokeDynamic(info) => remap_cell!(info.resolved_mt),
                    _ => {}
                }
            }

            for (method_index, insn_index) in class.indy_insns.iter().chain(&class.sigpoly_insns) {
                let code = class.methods[*method_index as usize].code.as_ref().unwrap();
                remap_cell!(code.insns[*insn_index as usize].ic2);
            }
        }

        // Static reference slots need &mut access to the blocks
        for class_index in 0..self.classes.len() {
            let offsets = self.classes[class_index].static_refs.clone();
            for offset in offsets {
                let data = &mut self.classes[class_index].static_data;
                if let JavaValue::Reference(Some(obj)) =
                    crate::jvm::read_static(data, offset as usize, TypeKind::Reference)
                {
                    let moved = relocations.remap(obj);
                    crate::jvm::write_static(
                        data,
                        offset as usize,
                        JavaValue::Reference(Some(moved)),
                    );
                }
            }
        }

        if let Some(obj) = self.main_thread_group {
            self.main_thread_group = Some(relocations.remap(obj));
        }
        if let Some(obj) = self.reference_pending_list {
            self.reference_pending_list = Some(relocations.remap(obj));
        }
        for obj in self.modules.values_mut() {
            *obj = relocations.remap(*obj);
        }
        for obj in self.interned_strings.values_mut() {
            *obj = relocations.remap(*obj);
        }

        self.js_handles.remap(&mut |obj| relocations.remap(obj));

        for tid in 0..self.threads.len() {
            if let Some(obj) = self.threads[tid].thread_obj {
                self.threads[tid].thread_obj = Some(relocations.remap(obj));
            }
            if let Some(obj) = self.threads[tid].current_exception {
                self.threads[tid].current_exception = Some(relocations.remap(obj));
            }
            if let Some(obj) = self.threads[tid].out_of_mem_error {
                self.threads[tid].out_of_mem_error = Some(relocations.remap(obj));
            }
            if let Some(obj) = self.threads[tid].stack_overflow_error {
                self.threads[tid].stack_overflow_error = Some(relocations.remap(obj));
            }

            for slot in self.thread_frame_ref_slots(tid as u32) {
                let value = self.threads[tid].frames.slot(slot);
                if let Some(obj) = ObjRef::from_slot(value) {
                    let moved = relocations.remap(obj);
                    self.threads[tid].frames.set_slot(slot, ObjRef::into_slot(Some(moved)));
                }
            }
            for frame in self.threads[tid].frames.frames.iter_mut() {
                if let Some(obj) = frame.sync_target {
                    frame.sync_target = Some(relocations.remap(obj));
                }
                if let FrameData::Native { args, .. } = &mut frame.data {
                    for arg in args.iter_mut() {
                        if let JavaValue::Reference(Some(obj)) = arg {
                            *arg = JavaValue::Reference(Some(relocations.remap(*obj)));
                        }
                    }
                }
            }

            self.threads[tid].handles.remap(&mut |obj| relocations.remap(obj));
        }

        self.remap_scheduler_roots(&mut |obj| relocations.remap(obj));
    }

    /// Buffer slot indices of every live reference in a thread's plain
    /// frames, derived from the verifier's per-pc reference bitmaps. The
    /// stack portion is clipped to the frame's actual sp: at a call site the
    /// outgoing arguments already belong to the callee's locals.
    fn thread_frame_ref_slots(&self, tid: u32) -> Vec<u32> {
        let mut slots = Vec::new();
        let mut bits = Vec::new();

        for frame in &self.threads[tid as usize].frames.frames {
            let (locals_base, stack_base, sp, pc) = match &frame.data {
                FrameData::Plain { locals_base, stack_base, sp, pc } => {
                    (*locals_base, *stack_base, *sp, *pc)
                }
                FrameData::Native { .. } => continue,
            };

            let code = frame.method.code.as_ref().expect("plain frame without code");
            let analysis = &code.analysis;
            let max_locals = analysis.max_locals as u32;

            analysis.refs_at[pc as usize].list_bits(&mut bits);
            for bit in &bits {
                if *bit < max_locals {
                    slots.push(locals_base + bit);
                } else {
                    let stack_index = bit - max_locals;
                    if stack_index < sp as u32 {
                        slots.push(stack_base + stack_index);
                    }
                }
            }
        }

        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::{JavaEnv, VmOptions};
    use std::fs;

    fn test_env() -> JavaEnv {
        let dir = std::env::temp_dir().join("excelsa-gc-tests");
        let _ = fs::create_dir_all(&dir);
        JavaEnv::new(VmOptions {
            classpath: dir.to_string_lossy().to_string(),
            heap_bytes: 1 << 20,
            preemption_us: 30_000,
        })
        .unwrap()
    }

    /// Hand-build a class with one reference field at offset 0.
    fn install_node_class(env: &mut JavaEnv) -> ClassId {
        use crate::class::ClassAccessFlags;
        use crate::jvm::class::{ClassDesc, ClassState, ConstantPool};
        use std::cell::Cell;
        use std::rc::Rc;

        let id = ClassId(env.classes().len() as u32);
        env.classes.push(ClassDesc {
            id,
            kind: ClassKind::Ordinary,
            name: Rc::from("Node"),
            access: ClassAccessFlags::PUBLIC,
            pool: ConstantPool::default(),
            super_class: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            state: Cell::new(ClassState::Initialized),
            instance_bytes: Cell::new(16),
            static_data: vec![0u8; 16],
            static_refs: vec![0],
            instance_refs: vec![0],
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
        env.class_table.insert((Rc::from("Node"), 0), id);
        id
    }

    fn node_next(env: &JavaEnv, obj: ObjRef) -> Option<ObjRef> {
        match env.heap.get_field(obj, 0, TypeKind::Reference) {
            JavaValue::Reference(next) => next,
            _ => unreachable!(),
        }
    }

    #[test]
    fn unreachable_objects_are_collected_and_survivors_slide_down() {
        let mut env = test_env();
        let node = install_node_class(&mut env);
        let tid = env.main_thread();

        // A chain of three nodes rooted through a static slot, plus garbage
        // interleaved between them
        let mut chain = None;
        for _ in 0..3 {
            let _garbage = env.new_object(tid, node).unwrap();
            let obj = env.new_object(tid, node).unwrap();
            env.heap.set_field(obj, 0, JavaValue::Reference(chain));
            chain = Some(obj);
        }
        let head = chain.unwrap();
        crate::jvm::write_static(
            &mut env.class_mut(node).static_data,
            0,
            JavaValue::Reference(Some(head)),
        );

        let used_before = env.heap.used();
        env.major_gc();

        // 3 survivors * 32 bytes (16 header + 16 data), starting at offset 8
        assert_eq!(env.heap.used(), 8 + 3 * 32);
        assert!(env.heap.used() < used_before);

        // The static root was rewritten and the chain is intact
        let head = match crate::jvm::read_static(
            &env.class(node).static_data,
            0,
            TypeKind::Reference,
        ) {
            JavaValue::Reference(Some(head)) => head,
            x => panic!("static root lost: {:?}", x),
        };

        // The head was allocated last, so the chain walks down in address
        // order (relative order is preserved by compaction)
        let mut length = 0;
        let mut cursor = Some(head);
        let mut previous_offset = usize::MAX;
        while let Some(obj) = cursor {
            assert!(obj.offset() < previous_offset);
            previous_offset = obj.offset();
            assert_eq!(env.class(env.heap.class_of(obj)).name.as_ref(), "Node");
            length += 1;
            cursor = node_next(&env, obj);
        }
        assert_eq!(length, 3);
    }

    #[test]
    fn new_addresses_never_exceed_old() {
        let mut env = test_env();
        let node = install_node_class(&mut env);
        let tid = env.main_thread();

        let mut survivors = Vec::new();
        for index in 0..100 {
            let obj = env.new_object(tid, node).unwrap();
            if index % 10 == 0 {
                survivors.push(obj);
            }
        }
        // Root the survivors through a handle each
        let handles: Vec<_> = survivors
            .iter()
            .map(|obj| env.threads[tid as usize].handles.make(Some(*obj)))
            .collect();

        env.major_gc();

        for (survivor, handle) in survivors.iter().zip(&handles) {
            let moved = env.threads[tid as usize].handles.get(*handle).unwrap();
            assert!(moved.offset() <= survivor.offset());
        }
        assert_eq!(env.heap.used(), 8 + survivors.len() * 32);
    }

    #[test]
    fn monitors_of_dead_objects_are_freed() {
        let mut env = test_env();
        let node = install_node_class(&mut env);
        let tid = env.main_thread();

        let kept = env.new_object(tid, node).unwrap();
        let dropped = env.new_object(tid, node).unwrap();

        let kept_id = env.monitors.inflate(&mut env.heap, kept);
        assert!(env.monitors.try_acquire(kept_id, tid));
        let dropped_id = env.monitors.inflate(&mut env.heap, dropped);
        assert!(env.monitors.try_acquire(dropped_id, tid));

        let handle = env.threads[tid as usize].handles.make(Some(kept));
        env.major_gc();

        // The survivor's monitor still knows its owner; the dead object's
        // monitor slot was reclaimed
        let kept = env.threads[tid as usize].handles.get(handle).unwrap();
        assert!(env.monitors.owned_by(&env.heap, kept, tid));
        assert!(env.monitors.iter_ids().count() == 1);
    }
}

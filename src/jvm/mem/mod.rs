pub mod gc;
mod handle;
mod monitor;
mod string;
mod types;

pub use handle::*;
pub use monitor::*;
pub use string::*;
pub use types::*;

use std::convert::TryInto;
use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroU32;

use crate::jvm::class::ClassId;
use crate::util::align_up;

/// Object header: class id, array length (zero for instances), mark word.
pub const OBJECT_HEADER_BYTES: usize = 16;

/// Reserve beyond the logical heap limit so the OutOfMemoryError itself (and
/// the string it carries) can be constructed without recursing into the
/// allocator failure path.
pub const HEAP_SLOP_BYTES: usize = 1 << 16;

/// A reference to a heap object: the byte offset of its header within the
/// heap buffer. Offset zero is reserved so `Option<ObjRef>` packs into a
/// single slot with null as zero.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    pub fn from_offset(offset: usize) -> ObjRef {
        debug_assert_eq!(offset % 8, 0);
        ObjRef(NonZeroU32::new(offset as u32).expect("heap offset 0 is reserved"))
    }

    pub fn offset(self) -> usize {
        self.0.get() as usize
    }

    pub fn into_slot(value: Option<ObjRef>) -> u64 {
        match value {
            Some(x) => x.0.get() as u64,
            None => 0,
        }
    }

    pub fn from_slot(slot: u64) -> Option<ObjRef> {
        NonZeroU32::new(slot as u32).map(ObjRef)
    }
}

impl Debug for ObjRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0.get())
    }
}

/// The bump-pointer heap. All objects live in one owned buffer; a collection
/// compacts live objects towards its base (never allocating a second buffer),
/// so an `ObjRef` is stable only across code that cannot trigger GC. Native
/// code must hold objects through handles instead.
pub struct Heap {
    buf: Box<[u8]>,
    used: usize,
    capacity: usize,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        let capacity = align_up(capacity.max(1 << 16), 8);
        Heap {
            buf: vec![0u8; capacity + HEAP_SLOP_BYTES].into_boxed_slice(),
            // Offset zero doubles as null
            used: 8,
            capacity,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn true_capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn set_used(&mut self, used: usize) {
        debug_assert_eq!(used % 8, 0);
        self.used = used;
    }

    pub fn contains(&self, reference: ObjRef) -> bool {
        reference.offset() < self.buf.len()
    }

    /// Bump-allocate `bytes` zeroed bytes. `allow_slop` lets the OOM path dip
    /// into the reserve past the logical capacity.
    pub fn alloc_raw(&mut self, bytes: usize, allow_slop: bool) -> Option<ObjRef> {
        let bytes = align_up(bytes, 8);
        let limit = if allow_slop { self.buf.len() } else { self.capacity };

        if self.used.checked_add(bytes)? > limit {
            return None;
        }

        let offset = self.used;
        self.used += bytes;
        // The tail may hold stale bytes from before the last compaction
        self.buf[offset..offset + bytes].iter_mut().for_each(|x| *x = 0);
        Some(ObjRef::from_offset(offset))
    }

    // Raw typed access at absolute byte offsets

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.buf[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.buf[offset] = value;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_ne_bytes(self.buf[offset..offset + 2].try_into().unwrap())
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    // Object header accessors

    pub fn class_of(&self, obj: ObjRef) -> ClassId {
        ClassId(self.read_u32(obj.offset()))
    }

    pub fn set_class_of(&mut self, obj: ObjRef, class: ClassId) {
        self.write_u32(obj.offset(), class.0);
    }

    pub fn array_length(&self, obj: ObjRef) -> i32 {
        self.read_u32(obj.offset() + 4) as i32
    }

    pub fn set_array_length(&mut self, obj: ObjRef, length: i32) {
        self.write_u32(obj.offset() + 4, length as u32);
    }

    pub fn mark_word(&self, obj: ObjRef) -> u64 {
        self.read_u64(obj.offset() + 8)
    }

    pub fn set_mark_word(&mut self, obj: ObjRef, word: u64) {
        self.write_u64(obj.offset() + 8, word);
    }

    // Instance field access. `offset` is a byte offset within the instance
    // data area (what the linker computes into Field::byte_offset).

    pub fn field_address(obj: ObjRef, offset: usize) -> usize {
        obj.offset() + OBJECT_HEADER_BYTES + offset
    }

    pub fn get_field(&self, obj: ObjRef, offset: usize, kind: TypeKind) -> JavaValue {
        self.read_kind(Heap::field_address(obj, offset), kind)
    }

    pub fn set_field(&mut self, obj: ObjRef, offset: usize, value: JavaValue) {
        self.write_kind(Heap::field_address(obj, offset), value);
    }

    pub fn read_kind(&self, address: usize, kind: TypeKind) -> JavaValue {
        match kind {
            TypeKind::Boolean | TypeKind::Byte => JavaValue::Byte(self.read_u8(address) as i8),
            TypeKind::Char => JavaValue::Char(self.read_u16(address)),
            TypeKind::Short => JavaValue::Short(self.read_u16(address) as i16),
            TypeKind::Int => JavaValue::Int(self.read_u32(address) as i32),
            TypeKind::Long => JavaValue::Long(self.read_u64(address) as i64),
            TypeKind::Float => JavaValue::Float(f32::from_bits(self.read_u32(address))),
            TypeKind::Double => JavaValue::Double(f64::from_bits(self.read_u64(address))),
            TypeKind::Reference => JavaValue::Reference(ObjRef::from_slot(self.read_u64(address))),
        }
    }

    pub fn write_kind(&mut self, address: usize, value: JavaValue) {
        match value {
            JavaValue::Byte(x) => self.write_u8(address, x as u8),
            JavaValue::Char(x) => self.write_u16(address, x),
            JavaValue::Short(x) => self.write_u16(address, x as u16),
            JavaValue::Int(x) => self.write_u32(address, x as u32),
            JavaValue::Long(x) => self.write_u64(address, x as u64),
            JavaValue::Float(x) => self.write_u32(address, x.to_bits()),
            JavaValue::Double(x) => self.write_u64(address, x.to_bits()),
            JavaValue::Reference(x) => self.write_u64(address, ObjRef::into_slot(x)),
        }
    }

    // Array element access. Element data begins directly after the header
    // and is laid out at the element kind's natural stride.

    pub fn element_address(obj: ObjRef, kind: TypeKind, index: usize) -> usize {
        obj.offset() + OBJECT_HEADER_BYTES + index * kind.size_bytes()
    }

    pub fn get_element(&self, obj: ObjRef, kind: TypeKind, index: usize) -> JavaValue {
        self.read_kind(Heap::element_address(obj, kind, index), kind)
    }

    pub fn set_element(&mut self, obj: ObjRef, kind: TypeKind, index: usize, value: JavaValue) {
        self.write_kind(Heap::element_address(obj, kind, index), value);
    }

    /// memmove within the buffer; used by compaction.
    pub(crate) fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.buf.copy_within(src..src + len, dst);
    }

    pub fn array_size_bytes(kind: TypeKind, length: usize) -> usize {
        align_up(OBJECT_HEADER_BYTES + length * kind.size_bytes(), 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_is_aligned_and_zeroed() {
        let mut heap = Heap::new(1 << 16);
        let a = heap.alloc_raw(20, false).unwrap();
        let b = heap.alloc_raw(8, false).unwrap();

        assert_eq!(a.offset() % 8, 0);
        assert_eq!(b.offset(), a.offset() + 24);
        assert_eq!(heap.read_u64(a.offset()), 0);
    }

    #[test]
    fn logical_capacity_is_enforced() {
        let mut heap = Heap::new(1 << 16);
        let capacity = heap.capacity();
        assert!(heap.alloc_raw(capacity, false).is_none());
        // The slop region admits the same request
        assert!(heap.alloc_raw(capacity, true).is_some());
    }

    #[test]
    fn field_round_trip() {
        let mut heap = Heap::new(1 << 16);
        let obj = heap.alloc_raw(OBJECT_HEADER_BYTES + 32, false).unwrap();

        heap.set_field(obj, 0, JavaValue::Long(-1));
        heap.set_field(obj, 8, JavaValue::Double(3.25));
        heap.set_field(obj, 16, JavaValue::Int(42));
        heap.set_field(obj, 20, JavaValue::Char(0x1234));

        assert_eq!(heap.get_field(obj, 0, TypeKind::Long), JavaValue::Long(-1));
        assert_eq!(heap.get_field(obj, 8, TypeKind::Double), JavaValue::Double(3.25));
        assert_eq!(heap.get_field(obj, 16, TypeKind::Int), JavaValue::Int(42));
        assert_eq!(heap.get_field(obj, 20, TypeKind::Char), JavaValue::Char(0x1234));
    }

    #[test]
    fn array_elements_use_natural_stride() {
        let mut heap = Heap::new(1 << 16);
        let obj = heap
            .alloc_raw(Heap::array_size_bytes(TypeKind::Short, 4), false)
            .unwrap();
        heap.set_array_length(obj, 4);

        for i in 0..4 {
            heap.set_element(obj, TypeKind::Short, i, JavaValue::Short(i as i16 - 2));
        }
        for i in 0..4 {
            assert_eq!(
                heap.get_element(obj, TypeKind::Short, i),
                JavaValue::Short(i as i16 - 2)
            );
        }
        assert_eq!(heap.array_length(obj), 4);
    }
}

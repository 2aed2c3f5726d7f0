pub mod attribute;
pub mod constant;
pub mod version;

mod class_file;
mod load;

pub use class_file::*;
pub use load::*;

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

/// Streamlines reading class-file structures from a byte source. The class
/// file format is big endian throughout, so all primitives are parsed as big
/// endian unless a type explicitly implements otherwise.
pub trait Readable: Sized {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self>;

    fn from_slice<T: AsRef<[u8]>>(slice: T) -> io::Result<Self> {
        let mut buffer = Cursor::new(slice.as_ref());
        Self::read(&mut buffer)
    }
}

macro_rules! impl_primitive {
    ($type:ty: $($read:tt)+) => {
        impl Readable for $type {
            fn read<T: Read>(buffer: &mut T) -> io::Result<Self> { $($read)+(buffer) }
        }
    };
}

impl_primitive!(u8: ReadBytesExt::read_u8);
impl_primitive!(u16: ReadBytesExt::read_u16::<BigEndian>);
impl_primitive!(u32: ReadBytesExt::read_u32::<BigEndian>);
impl_primitive!(u64: ReadBytesExt::read_u64::<BigEndian>);
impl_primitive!(i8: ReadBytesExt::read_i8);
impl_primitive!(i16: ReadBytesExt::read_i16::<BigEndian>);
impl_primitive!(i32: ReadBytesExt::read_i32::<BigEndian>);
impl_primitive!(i64: ReadBytesExt::read_i64::<BigEndian>);
impl_primitive!(f32: ReadBytesExt::read_f32::<BigEndian>);
impl_primitive!(f64: ReadBytesExt::read_f64::<BigEndian>);

/// Most repeated structures in the class file are a u16 count followed by
/// that many entries. The constant pool is the notable exception and has its
/// own reader.
impl<T: Readable> Readable for Vec<T> {
    fn read<B: Read>(buffer: &mut B) -> io::Result<Self> {
        let count = u16::read(buffer)?;
        let mut vec = Vec::with_capacity(count as usize);

        for _ in 0..count {
            vec.push(T::read(buffer)?);
        }

        Ok(vec)
    }
}

/// Derives a field-by-field `Readable` for plain record structures.
macro_rules! simple_grammar {
    ($($(#[$($macros:tt)+])* $pub:vis struct $name:ident { $($field_vis:vis $field:ident: $type:ty),* $(,)? })+) => {
        $(
            $(#[$($macros)+])*
            $pub struct $name {
                $($field_vis $field: $type),*
            }

            impl $crate::class::Readable for $name {
                fn read<T: std::io::Read>(buffer: &mut T) -> std::io::Result<Self> {
                    Ok($name { $($field: <$type as $crate::class::Readable>::read(buffer)?),+ })
                }
            }
        )+
    };
}

pub(crate) use simple_grammar;

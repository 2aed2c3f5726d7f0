use std::io::{self, Error, ErrorKind, Read};
use std::ops::Index;
use std::rc::Rc;

use crate::class::Readable;
use crate::util::decode_modified_utf8;

/// Raw constant pool entry as read from the class file. Indices refer back
/// into the pool and are validated in a second pass once the whole pool is
/// available, so forward references work.
#[derive(Debug, Clone)]
pub enum Constant {
    Utf8(Rc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef { class_index: u16, name_and_type_index: u16 },
    MethodRef { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodRef { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },

    // Due to a poor choice in the JVM specification, 8 byte constants take up
    // two slots for indexing. The second slot is unusable.
    Placeholder,
}

impl Constant {
    fn read_one<T: Read>(buffer: &mut T) -> io::Result<Self> {
        Ok(match u8::read(buffer)? {
            1 => {
                let length = u16::read(buffer)? as usize;
                let mut bytes = vec![0u8; length];
                buffer.read_exact(&mut bytes)?;
                Constant::Utf8(Rc::from(decode_modified_utf8(&bytes)?.as_ref()))
            }
            3 => Constant::Integer(i32::read(buffer)?),
            4 => Constant::Float(f32::read(buffer)?),
            5 => Constant::Long(i64::read(buffer)?),
            6 => Constant::Double(f64::read(buffer)?),
            7 => Constant::Class { name_index: u16::read(buffer)? },
            8 => Constant::String { string_index: u16::read(buffer)? },
            9 => Constant::FieldRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            10 => Constant::MethodRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            11 => Constant::InterfaceMethodRef {
                class_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            12 => Constant::NameAndType {
                name_index: u16::read(buffer)?,
                descriptor_index: u16::read(buffer)?,
            },
            15 => Constant::MethodHandle {
                reference_kind: u8::read(buffer)?,
                reference_index: u16::read(buffer)?,
            },
            16 => Constant::MethodType { descriptor_index: u16::read(buffer)? },
            17 => Constant::Dynamic {
                bootstrap_method_attr_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: u16::read(buffer)?,
                name_and_type_index: u16::read(buffer)?,
            },
            19 => Constant::Module { name_index: u16::read(buffer)? },
            20 => Constant::Package { name_index: u16::read(buffer)? },
            tag => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown constant pool tag {}", tag),
                ))
            }
        })
    }

    pub fn is_loadable(&self) -> bool {
        matches!(
            self,
            Constant::Integer(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::Class { .. }
                | Constant::String { .. }
                | Constant::MethodHandle { .. }
                | Constant::MethodType { .. }
                | Constant::Dynamic { .. }
        )
    }
}

/// The constant pool as parsed, before linking. Indexing is 1-based to match
/// the file format; index 0 and the slot following a Long/Double are invalid.
#[derive(Debug, Clone, Default)]
pub struct RawConstantPool {
    pool: Vec<Constant>,
}

impl Readable for RawConstantPool {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let count = u16::read(buffer)?;
        if count == 0 {
            return Err(Error::new(ErrorKind::InvalidData, "constant pool count of zero"));
        }

        let mut pool = Vec::with_capacity(count as usize - 1);
        while pool.len() < count as usize - 1 {
            let constant = Constant::read_one(buffer)?;
            let wide = matches!(&constant, Constant::Long(_) | Constant::Double(_));
            pool.push(constant);

            if wide {
                if pool.len() == count as usize - 1 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "wide constant overruns end of constant pool",
                    ));
                }
                pool.push(Constant::Placeholder);
            }
        }

        let pool = RawConstantPool { pool };
        pool.validate()?;
        Ok(pool)
    }
}

impl Index<u16> for RawConstantPool {
    type Output = Constant;

    fn index(&self, index: u16) -> &Constant {
        usize::from(index)
            .checked_sub(1)
            .and_then(|index| self.pool.get(index))
            .expect("index is a valid position in constant pool")
    }
}

impl RawConstantPool {
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn entries(&self) -> &[Constant] {
        &self.pool
    }

    fn get(&self, index: u16) -> Option<&Constant> {
        usize::from(index).checked_sub(1).and_then(|x| self.pool.get(x))
    }

    /// Panics on malformed indices; `validate` has already run by the time
    /// runtime code uses these accessors.
    pub fn text(&self, index: u16) -> &Rc<str> {
        match &self[index] {
            Constant::Utf8(text) => text,
            x => panic!("Expected Utf8 constant, but found {:?}", x),
        }
    }

    pub fn class_name(&self, index: u16) -> &Rc<str> {
        match &self[index] {
            Constant::Class { name_index } => self.text(*name_index),
            x => panic!("Expected Class constant, but found {:?}", x),
        }
    }

    pub fn name_and_type(&self, index: u16) -> (&Rc<str>, &Rc<str>) {
        match &self[index] {
            Constant::NameAndType { name_index, descriptor_index } => {
                (self.text(*name_index), self.text(*descriptor_index))
            }
            x => panic!("Expected NameAndType constant, but found {:?}", x),
        }
    }

    fn expect_kind(&self, index: u16, check: fn(&Constant) -> bool, what: &str) -> io::Result<()> {
        match self.get(index) {
            Some(entry) if check(entry) => Ok(()),
            Some(entry) => Err(Error::new(
                ErrorKind::InvalidData,
                format!("constant {} should be {}, found {:?}", index, what, entry),
            )),
            None => Err(Error::new(
                ErrorKind::InvalidData,
                format!("constant index {} out of bounds", index),
            )),
        }
    }

    /// Second pass over the pool checking that every cross-reference lands on
    /// an entry of the right kind.
    fn validate(&self) -> io::Result<()> {
        let utf8 = |c: &Constant| matches!(c, Constant::Utf8(_));
        let class = |c: &Constant| matches!(c, Constant::Class { .. });
        let name_and_type = |c: &Constant| matches!(c, Constant::NameAndType { .. });

        for constant in &self.pool {
            match constant {
                Constant::Class { name_index }
                | Constant::Module { name_index }
                | Constant::Package { name_index } => {
                    self.expect_kind(*name_index, utf8, "Utf8")?
                }
                Constant::String { string_index } => self.expect_kind(*string_index, utf8, "Utf8")?,
                Constant::FieldRef { class_index, name_and_type_index }
                | Constant::MethodRef { class_index, name_and_type_index }
                | Constant::InterfaceMethodRef { class_index, name_and_type_index } => {
                    self.expect_kind(*class_index, class, "Class")?;
                    self.expect_kind(*name_and_type_index, name_and_type, "NameAndType")?;
                }
                Constant::NameAndType { name_index, descriptor_index } => {
                    self.expect_kind(*name_index, utf8, "Utf8")?;
                    self.expect_kind(*descriptor_index, utf8, "Utf8")?;
                }
                Constant::MethodHandle { reference_kind, reference_index } => {
                    let check: fn(&Constant) -> bool = match reference_kind {
                        // getField/getStatic/putField/putStatic
                        1..=4 => |c| matches!(c, Constant::FieldRef { .. }),
                        // invokeVirtual/newInvokeSpecial
                        5 | 8 => |c| matches!(c, Constant::MethodRef { .. }),
                        // invokeStatic/invokeSpecial may name either form
                        6 | 7 => |c| {
                            matches!(
                                c,
                                Constant::MethodRef { .. } | Constant::InterfaceMethodRef { .. }
                            )
                        },
                        // invokeInterface
                        9 => |c| matches!(c, Constant::InterfaceMethodRef { .. }),
                        x => {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                format!("invalid method handle kind {}", x),
                            ))
                        }
                    };
                    self.expect_kind(*reference_index, check, "a matching reference")?;
                }
                Constant::MethodType { descriptor_index } => {
                    self.expect_kind(*descriptor_index, utf8, "Utf8")?
                }
                Constant::Dynamic { name_and_type_index, .. }
                | Constant::InvokeDynamic { name_and_type_index, .. } => {
                    // The bootstrap method index is checked against the
                    // BootstrapMethods attribute once attributes are parsed.
                    self.expect_kind(*name_and_type_index, name_and_type, "NameAndType")?;
                }
                Constant::Utf8(_)
                | Constant::Integer(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::Placeholder => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};

    fn pool_bytes(entries: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(entries.len() as u16 + 1).unwrap();
        for entry in entries {
            out.extend_from_slice(entry);
        }
        out
    }

    #[test]
    fn wide_constants_take_two_slots() {
        // Long 0x1122334455667788 then a Utf8 "A"
        let bytes = pool_bytes(&[
            &[5, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
            &[1, 0, 1, b'A'],
        ]);
        // count must be 4: slot 1+2 long, slot 3 utf8
        let mut bytes = bytes;
        bytes[0] = 0;
        bytes[1] = 4;

        let pool = RawConstantPool::from_slice(&bytes).unwrap();
        assert!(matches!(pool[1], Constant::Long(0x1122334455667788)));
        assert!(matches!(pool[2], Constant::Placeholder));
        assert_eq!(pool.text(3).as_ref(), "A");
    }

    #[test]
    fn forward_references_resolve() {
        // Class entry pointing forward at its Utf8 name
        let bytes = pool_bytes(&[&[7, 0, 2], &[1, 0, 3, b'F', b'o', b'o']]);
        let pool = RawConstantPool::from_slice(&bytes).unwrap();
        assert_eq!(pool.class_name(1).as_ref(), "Foo");
    }

    #[test]
    fn dangling_index_rejected() {
        let bytes = pool_bytes(&[&[7, 0, 9]]);
        assert!(RawConstantPool::from_slice(&bytes).is_err());
    }

    #[test]
    fn mismatched_kind_rejected() {
        // String entry pointing at a Class entry
        let bytes = pool_bytes(&[&[8, 0, 2], &[7, 0, 3], &[1, 0, 1, b'A']]);
        assert!(RawConstantPool::from_slice(&bytes).is_err());
    }

    #[test]
    fn invalid_utf8_rejected() {
        let bytes = pool_bytes(&[&[1, 0, 1, 0xff]]);
        assert!(RawConstantPool::from_slice(&bytes).is_err());
    }

    #[test]
    fn bad_method_handle_kind_rejected() {
        let bytes = pool_bytes(&[&[15, 10, 0, 1]]);
        assert!(RawConstantPool::from_slice(&bytes).is_err());
    }
}

use std::io::{self, Error, ErrorKind, Read};

use crate::class::constant::RawConstantPool;
use crate::class::simple_grammar;
use crate::class::Readable;

/// An attribute as found in the file: a name index and an opaque payload.
/// Attributes the VM understands are decoded on demand through `decode_as`;
/// everything else (annotations included) is preserved verbatim so the Java
/// side can parse the bytes itself.
#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Readable for AttributeInfo {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let name_index = u16::read(buffer)?;
        let length = u32::read(buffer)?;

        let mut info = vec![0u8; length as usize];
        buffer.read_exact(&mut info)?;

        Ok(AttributeInfo { name_index, info })
    }
}

impl AttributeInfo {
    pub fn name<'a>(&self, pool: &'a RawConstantPool) -> &'a str {
        pool.text(self.name_index)
    }

    pub fn decode_as<T: Readable>(&self) -> io::Result<T> {
        T::from_slice(&self.info)
    }
}

/// Find and decode a named attribute from an attribute list.
pub fn find_attribute<T: Readable>(
    attributes: &[AttributeInfo],
    pool: &RawConstantPool,
    name: &str,
) -> io::Result<Option<T>> {
    for attribute in attributes {
        if attribute.name(pool) == name {
            return attribute.decode_as().map(Some);
        }
    }
    Ok(None)
}

pub fn find_raw_attribute<'a>(
    attributes: &'a [AttributeInfo],
    pool: &RawConstantPool,
    name: &str,
) -> Option<&'a AttributeInfo> {
    attributes.iter().find(|x| x.name(pool) == name)
}

simple_grammar! {
    #[derive(Debug, Clone)]
    pub struct CodeAttribute {
        pub max_stack: u16,
        pub max_locals: u16,
        pub code: CodeBytes,
        pub exception_table: Vec<ExceptionTableEntry>,
        pub attributes: Vec<AttributeInfo>,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct ExceptionTableEntry {
        pub start_pc: u16,
        pub end_pc: u16,
        pub handler_pc: u16,
        pub catch_type: u16,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct ConstantValue {
        pub value_index: u16,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct SourceFile {
        pub sourcefile_index: u16,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct Signature {
        pub signature_index: u16,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct EnclosingMethod {
        pub class_index: u16,
        pub method_index: u16,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct NestHost {
        pub host_class_index: u16,
    }

    #[derive(Debug, Clone)]
    pub struct Exceptions {
        pub exception_index_table: Vec<u16>,
    }

    #[derive(Debug, Clone)]
    pub struct PermittedSubclasses {
        pub classes: Vec<u16>,
    }

    #[derive(Debug, Clone)]
    pub struct InnerClasses {
        pub classes: Vec<InnerClass>,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct InnerClass {
        pub inner_class_info_index: u16,
        pub outer_class_info_index: u16,
        pub inner_name_index: u16,
        pub inner_class_access_flags: u16,
    }

    #[derive(Debug, Clone)]
    pub struct LineNumberTable {
        pub entries: Vec<LineNumber>,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct LineNumber {
        pub start_pc: u16,
        pub line_number: u16,
    }

    #[derive(Debug, Clone)]
    pub struct LocalVariableTable {
        pub entries: Vec<LocalVariable>,
    }

    #[derive(Debug, Copy, Clone)]
    pub struct LocalVariable {
        pub start_pc: u16,
        pub length: u16,
        pub name_index: u16,
        pub descriptor_index: u16,
        pub index: u16,
    }

    #[derive(Debug, Clone)]
    pub struct BootstrapMethods {
        pub methods: Vec<BootstrapMethod>,
    }

    #[derive(Debug, Clone)]
    pub struct BootstrapMethod {
        pub method_ref: u16,
        pub arguments: Vec<u16>,
    }
}

/// The code array is a u32 length followed by the raw bytecode.
#[derive(Debug, Clone)]
pub struct CodeBytes(pub Vec<u8>);

impl Readable for CodeBytes {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let length = u32::read(buffer)?;
        if length == 0 || length >= 65536 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("code array length {} out of range", length),
            ));
        }

        let mut code = vec![0u8; length as usize];
        buffer.read_exact(&mut code)?;
        Ok(CodeBytes(code))
    }
}

/// MethodParameters uses a u8 count, unlike every other attribute list.
#[derive(Debug, Clone)]
pub struct MethodParameters {
    pub parameters: Vec<MethodParameter>,
}

#[derive(Debug, Copy, Clone)]
pub struct MethodParameter {
    pub name_index: u16,
    pub access_flags: u16,
}

impl Readable for MethodParameters {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let count = u8::read(buffer)?;
        let mut parameters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            parameters.push(MethodParameter {
                name_index: u16::read(buffer)?,
                access_flags: u16::read(buffer)?,
            });
        }
        Ok(MethodParameters { parameters })
    }
}

/// Verification type tags used by StackMapTable entries.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl Readable for VerificationType {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        Ok(match u8::read(buffer)? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(u16::read(buffer)?),
            8 => VerificationType::Uninitialized(u16::read(buffer)?),
            x => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid verification type tag {}", x),
                ))
            }
        })
    }
}

impl VerificationType {
    pub fn is_wide(self) -> bool {
        matches!(self, VerificationType::Double | VerificationType::Long)
    }
}

#[derive(Debug, Clone)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocalsOneStack { offset_delta: u16, stack: VerificationType },
    Chop { offset_delta: u16, chopped: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationType> },
    Full { offset_delta: u16, locals: Vec<VerificationType>, stack: Vec<VerificationType> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocalsOneStack { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

impl Readable for StackMapFrame {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let frame_type = u8::read(buffer)?;
        Ok(match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => StackMapFrame::SameLocalsOneStack {
                offset_delta: frame_type as u16 - 64,
                stack: VerificationType::read(buffer)?,
            },
            247 => StackMapFrame::SameLocalsOneStack {
                offset_delta: u16::read(buffer)?,
                stack: VerificationType::read(buffer)?,
            },
            248..=250 => StackMapFrame::Chop {
                offset_delta: u16::read(buffer)?,
                chopped: 251 - frame_type as u16,
            },
            251 => StackMapFrame::Same { offset_delta: u16::read(buffer)? },
            252..=254 => {
                let offset_delta = u16::read(buffer)?;
                let count = frame_type as usize - 251;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(VerificationType::read(buffer)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = u16::read(buffer)?;
                let locals_count = u16::read(buffer)?;
                let mut locals = Vec::with_capacity(locals_count as usize);
                for _ in 0..locals_count {
                    locals.push(VerificationType::read(buffer)?);
                }
                let stack_count = u16::read(buffer)?;
                let mut stack = Vec::with_capacity(stack_count as usize);
                for _ in 0..stack_count {
                    stack.push(VerificationType::read(buffer)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            x => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("reserved stack map frame type {}", x),
                ))
            }
        })
    }
}

simple_grammar! {
    #[derive(Debug, Clone)]
    pub struct StackMapTable {
        pub frames: Vec<StackMapFrame>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_map_frame_forms() {
        // same_frame, frame_type = 5
        assert!(matches!(
            StackMapFrame::from_slice(&[5]).unwrap(),
            StackMapFrame::Same { offset_delta: 5 }
        ));

        // same_locals_1_stack_item, frame_type = 64 + 3, Integer on stack
        match StackMapFrame::from_slice(&[67, 1]).unwrap() {
            StackMapFrame::SameLocalsOneStack { offset_delta: 3, stack } => {
                assert_eq!(stack, VerificationType::Integer)
            }
            x => panic!("unexpected frame {:?}", x),
        }

        // append_frame with two locals: Long, Object(#7)
        match StackMapFrame::from_slice(&[253, 0, 9, 4, 7, 0, 7]).unwrap() {
            StackMapFrame::Append { offset_delta: 9, locals } => {
                assert_eq!(locals, vec![VerificationType::Long, VerificationType::Object(7)])
            }
            x => panic!("unexpected frame {:?}", x),
        }

        // full_frame: delta 1, no locals, one Null on stack
        match StackMapFrame::from_slice(&[255, 0, 1, 0, 0, 0, 1, 5]).unwrap() {
            StackMapFrame::Full { offset_delta: 1, locals, stack } => {
                assert!(locals.is_empty());
                assert_eq!(stack, vec![VerificationType::Null]);
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn reserved_frame_type_rejected() {
        assert!(StackMapFrame::from_slice(&[200]).is_err());
    }

    #[test]
    fn empty_code_array_rejected() {
        assert!(CodeBytes::from_slice(&[0, 0, 0, 0]).is_err());
    }
}

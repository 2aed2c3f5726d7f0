use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Error, ErrorKind};
use std::rc::Rc;

use crate::jvm::mem::ObjRef;

/// The primitive representation classes of the interpreter and heap. Field
/// storage sizes and array element strides both derive from this.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl TypeKind {
    pub fn size_bytes(self) -> usize {
        match self {
            TypeKind::Boolean | TypeKind::Byte => 1,
            TypeKind::Char | TypeKind::Short => 2,
            TypeKind::Int | TypeKind::Float => 4,
            TypeKind::Long | TypeKind::Double | TypeKind::Reference => 8,
        }
    }

    pub fn is_wide(self) -> bool {
        matches!(self, TypeKind::Long | TypeKind::Double)
    }

    /// The single-character descriptor for primitive kinds, as used in array
    /// class names like `[J`.
    pub fn descriptor_char(self) -> char {
        match self {
            TypeKind::Boolean => 'Z',
            TypeKind::Byte => 'B',
            TypeKind::Char => 'C',
            TypeKind::Short => 'S',
            TypeKind::Int => 'I',
            TypeKind::Long => 'J',
            TypeKind::Float => 'F',
            TypeKind::Double => 'D',
            TypeKind::Reference => 'L',
        }
    }

    pub fn from_descriptor_char(c: char) -> Option<TypeKind> {
        Some(match c {
            'Z' => TypeKind::Boolean,
            'B' => TypeKind::Byte,
            'C' => TypeKind::Char,
            'S' => TypeKind::Short,
            'I' => TypeKind::Int,
            'J' => TypeKind::Long,
            'F' => TypeKind::Float,
            'D' => TypeKind::Double,
            _ => return None,
        })
    }

    /// Name of the primitive type as java.lang.Class#getName reports it.
    pub fn primitive_name(self) -> &'static str {
        match self {
            TypeKind::Boolean => "boolean",
            TypeKind::Byte => "byte",
            TypeKind::Char => "char",
            TypeKind::Short => "short",
            TypeKind::Int => "int",
            TypeKind::Long => "long",
            TypeKind::Float => "float",
            TypeKind::Double => "double",
            TypeKind::Reference => "reference",
        }
    }
}

/// A value crossing the boundary between the interpreter's raw stack slots
/// and typed code (native methods, field access, embedder API).
#[derive(Copy, Clone, PartialEq)]
pub enum JavaValue {
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(Option<ObjRef>),
}

impl Debug for JavaValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JavaValue::Byte(x) => write!(f, "Byte({})", x),
            JavaValue::Char(x) => write!(f, "Char({})", x),
            JavaValue::Short(x) => write!(f, "Short({})", x),
            JavaValue::Int(x) => write!(f, "Int({})", x),
            JavaValue::Long(x) => write!(f, "Long({})", x),
            JavaValue::Float(x) => write!(f, "Float({})", x),
            JavaValue::Double(x) => write!(f, "Double({})", x),
            JavaValue::Reference(None) => write!(f, "null"),
            JavaValue::Reference(Some(x)) => write!(f, "Reference({:?})", x),
        }
    }
}

impl JavaValue {
    pub const NULL: JavaValue = JavaValue::Reference(None);

    /// Raw 64-bit slot representation used on the operand stack and in
    /// locals. The per-PC analysis recovers the kind.
    pub fn into_slot(self) -> u64 {
        match self {
            JavaValue::Byte(x) => x as i64 as u64,
            JavaValue::Char(x) => x as u64,
            JavaValue::Short(x) => x as i64 as u64,
            JavaValue::Int(x) => x as i64 as u64,
            JavaValue::Long(x) => x as u64,
            JavaValue::Float(x) => f32::to_bits(x) as u64,
            JavaValue::Double(x) => f64::to_bits(x),
            JavaValue::Reference(x) => ObjRef::into_slot(x),
        }
    }

    pub fn from_slot(slot: u64, kind: TypeKind) -> JavaValue {
        match kind {
            TypeKind::Boolean | TypeKind::Byte => JavaValue::Byte(slot as i8),
            TypeKind::Char => JavaValue::Char(slot as u16),
            TypeKind::Short => JavaValue::Short(slot as i16),
            TypeKind::Int => JavaValue::Int(slot as i32),
            TypeKind::Long => JavaValue::Long(slot as i64),
            TypeKind::Float => JavaValue::Float(f32::from_bits(slot as u32)),
            TypeKind::Double => JavaValue::Double(f64::from_bits(slot)),
            TypeKind::Reference => JavaValue::Reference(ObjRef::from_slot(slot)),
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            JavaValue::Byte(_) => TypeKind::Byte,
            JavaValue::Char(_) => TypeKind::Char,
            JavaValue::Short(_) => TypeKind::Short,
            JavaValue::Int(_) => TypeKind::Int,
            JavaValue::Long(_) => TypeKind::Long,
            JavaValue::Float(_) => TypeKind::Float,
            JavaValue::Double(_) => TypeKind::Double,
            JavaValue::Reference(_) => TypeKind::Reference,
        }
    }

    pub fn expect_reference(self) -> Option<ObjRef> {
        match self {
            JavaValue::Reference(x) => x,
            x => panic!("expected reference, found {:?}", x),
        }
    }

    pub fn expect_int(self) -> i32 {
        match self {
            JavaValue::Int(x) => x,
            JavaValue::Byte(x) => x as i32,
            JavaValue::Short(x) => x as i32,
            JavaValue::Char(x) => x as i32,
            x => panic!("expected int, found {:?}", x),
        }
    }
}

/// A parsed field descriptor (JVMS §4.3.2).
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum FieldDescriptor {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    Object(Rc<str>),
    Array(Box<FieldDescriptor>),

    // Only valid as a method return type
    Void,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MethodDescriptor {
    pub args: Vec<FieldDescriptor>,
    pub returns: FieldDescriptor,
}

impl Debug for FieldDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl Display for FieldDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldDescriptor::Byte => write!(f, "B"),
            FieldDescriptor::Char => write!(f, "C"),
            FieldDescriptor::Double => write!(f, "D"),
            FieldDescriptor::Float => write!(f, "F"),
            FieldDescriptor::Int => write!(f, "I"),
            FieldDescriptor::Long => write!(f, "J"),
            FieldDescriptor::Short => write!(f, "S"),
            FieldDescriptor::Boolean => write!(f, "Z"),
            FieldDescriptor::Object(name) => write!(f, "L{};", name),
            FieldDescriptor::Array(entry) => write!(f, "[{}", entry),
            FieldDescriptor::Void => write!(f, "V"),
        }
    }
}

impl Display for MethodDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for arg in &self.args {
            write!(f, "{}", arg)?;
        }
        write!(f, "){}", self.returns)
    }
}

struct DescriptorReader<'a> {
    chars: &'a [u8],
    position: usize,
}

impl<'a> DescriptorReader<'a> {
    fn next(&mut self) -> io::Result<u8> {
        match self.chars.get(self.position) {
            Some(x) => {
                self.position += 1;
                Ok(*x)
            }
            None => Err(Error::new(ErrorKind::InvalidData, "truncated descriptor")),
        }
    }

    fn read_field(&mut self, allow_void: bool) -> io::Result<FieldDescriptor> {
        Ok(match self.next()? {
            b'B' => FieldDescriptor::Byte,
            b'C' => FieldDescriptor::Char,
            b'D' => FieldDescriptor::Double,
            b'F' => FieldDescriptor::Float,
            b'I' => FieldDescriptor::Int,
            b'J' => FieldDescriptor::Long,
            b'S' => FieldDescriptor::Short,
            b'Z' => FieldDescriptor::Boolean,
            b'V' if allow_void => FieldDescriptor::Void,
            b'[' => {
                let mut dimensions = 1usize;
                while self.chars.get(self.position) == Some(&b'[') {
                    self.position += 1;
                    dimensions += 1;
                }
                if dimensions > 255 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "array type exceeds 255 dimensions",
                    ));
                }

                let mut field = self.read_field(false)?;
                for _ in 0..dimensions {
                    field = FieldDescriptor::Array(Box::new(field));
                }
                field
            }
            b'L' => {
                let start = self.position;
                loop {
                    match self.next()? {
                        b';' => break,
                        _ => continue,
                    }
                }
                let name = &self.chars[start..self.position - 1];
                if name.is_empty() {
                    return Err(Error::new(ErrorKind::InvalidData, "empty reference type name"));
                }
                let name = std::str::from_utf8(name)
                    .map_err(|_| Error::new(ErrorKind::InvalidData, "non-UTF-8 class name"))?;
                FieldDescriptor::Object(Rc::from(name))
            }
            x => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unexpected character {:?} in descriptor", x as char),
                ))
            }
        })
    }

    fn expect_end(&self) -> io::Result<()> {
        if self.position != self.chars.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "trailing characters after descriptor",
            ));
        }
        Ok(())
    }
}

impl FieldDescriptor {
    pub fn parse(descriptor: &str) -> io::Result<FieldDescriptor> {
        let mut reader = DescriptorReader { chars: descriptor.as_bytes(), position: 0 };
        let field = reader.read_field(false)?;
        reader.expect_end()?;
        Ok(field)
    }

    pub fn parse_method(descriptor: &str) -> io::Result<MethodDescriptor> {
        let mut reader = DescriptorReader { chars: descriptor.as_bytes(), position: 0 };
        if reader.next()? != b'(' {
            return Err(Error::new(ErrorKind::InvalidData, "method descriptor must begin with '('"));
        }

        let mut args = Vec::new();
        loop {
            if reader.chars.get(reader.position) == Some(&b')') {
                reader.position += 1;
                break;
            }
            args.push(reader.read_field(false)?);
        }

        let returns = reader.read_field(true)?;
        reader.expect_end()?;
        Ok(MethodDescriptor { args, returns })
    }

    pub fn type_kind(&self) -> TypeKind {
        match self {
            FieldDescriptor::Byte => TypeKind::Byte,
            FieldDescriptor::Char => TypeKind::Char,
            FieldDescriptor::Double => TypeKind::Double,
            FieldDescriptor::Float => TypeKind::Float,
            FieldDescriptor::Int => TypeKind::Int,
            FieldDescriptor::Long => TypeKind::Long,
            FieldDescriptor::Short => TypeKind::Short,
            FieldDescriptor::Boolean => TypeKind::Boolean,
            FieldDescriptor::Object(_) | FieldDescriptor::Array(_) => TypeKind::Reference,
            FieldDescriptor::Void => panic!("void has no runtime representation"),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldDescriptor::Object(_) | FieldDescriptor::Array(_))
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, FieldDescriptor::Long | FieldDescriptor::Double)
    }

    pub fn initial_value(&self) -> JavaValue {
        match self {
            FieldDescriptor::Byte | FieldDescriptor::Boolean => JavaValue::Byte(0),
            FieldDescriptor::Char => JavaValue::Char(0),
            FieldDescriptor::Short => JavaValue::Short(0),
            FieldDescriptor::Int => JavaValue::Int(0),
            FieldDescriptor::Long => JavaValue::Long(0),
            FieldDescriptor::Float => JavaValue::Float(0.0),
            FieldDescriptor::Double => JavaValue::Double(0.0),
            _ => JavaValue::Reference(None),
        }
    }

    /// Class name to resolve for a reference descriptor: the plain name for
    /// objects, the bracketed form for arrays.
    pub fn type_name(&self) -> Option<String> {
        match self {
            FieldDescriptor::Object(name) => Some(name.to_string()),
            FieldDescriptor::Array(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl MethodDescriptor {
    /// Number of argument slots after rewriting: longs and doubles occupy a
    /// single logical slot.
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn returns_value(&self) -> bool {
        self.returns != FieldDescriptor::Void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_descriptor_round_trip() {
        for descriptor in [
            "B", "C", "D", "F", "I", "J", "S", "Z",
            "Ljava/lang/Object;",
            "[I",
            "[[Ljava/util/Map$Entry;",
            "[[[[[D",
        ] {
            let parsed = FieldDescriptor::parse(descriptor).unwrap();
            assert_eq!(parsed.to_string(), descriptor);
        }
    }

    #[test]
    fn method_descriptor_round_trip() {
        for descriptor in [
            "()V",
            "(I)I",
            "(IJLjava/lang/String;[B)Ljava/lang/Object;",
            "([[Ljava/lang/String;)V",
            "(DD)D",
        ] {
            let parsed = FieldDescriptor::parse_method(descriptor).unwrap();
            assert_eq!(parsed.to_string(), descriptor);
        }
    }

    #[test]
    fn rejects_malformed_descriptors() {
        // Trailing characters
        assert!(FieldDescriptor::parse("II").is_err());
        assert!(FieldDescriptor::parse("Ljava/lang/Object;I").is_err());
        // Empty reference name
        assert!(FieldDescriptor::parse("L;").is_err());
        // Unterminated class name
        assert!(FieldDescriptor::parse("Ljava/lang/Object").is_err());
        // Bare void
        assert!(FieldDescriptor::parse("V").is_err());
        // Void as a parameter
        assert!(FieldDescriptor::parse_method("(V)V").is_err());
        // Truncated method descriptor
        assert!(FieldDescriptor::parse_method("(I").is_err());
        // Missing return type
        assert!(FieldDescriptor::parse_method("()").is_err());
    }

    #[test]
    fn rejects_excessive_array_dimensions() {
        let mut descriptor = String::new();
        for _ in 0..256 {
            descriptor.push('[');
        }
        descriptor.push('I');
        assert!(FieldDescriptor::parse(&descriptor).is_err());

        let max = format!("{}I", "[".repeat(255));
        assert!(FieldDescriptor::parse(&max).is_ok());
    }

    #[test]
    fn slot_round_trip() {
        let values = [
            JavaValue::Int(-7),
            JavaValue::Long(i64::MIN),
            JavaValue::Float(1.5),
            JavaValue::Double(-0.0),
            JavaValue::Char(0xFFFF),
            JavaValue::Reference(None),
        ];

        for value in values {
            let slot = value.into_slot();
            assert_eq!(JavaValue::from_slot(slot, value.kind()), value);
        }
    }
}

use std::io::{self, Cursor, Error, ErrorKind, Read};
use std::rc::Rc;

use crate::class::attribute::{find_raw_attribute, AttributeInfo, BootstrapMethods, CodeAttribute};
use crate::class::constant::{Constant, RawConstantPool};
use crate::class::simple_grammar;
use crate::class::version::{ClassMagic, ClassVersion};
use crate::class::Readable;
use crate::jvm::mem::FieldDescriptor;

bitflags! {
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    pub struct FieldAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

macro_rules! read_flags {
    ($($flags:ident),+) => {
        $(impl Readable for $flags {
            fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
                match $flags::from_bits(u16::read(buffer)?) {
                    Some(v) => Ok(v),
                    None => Err(Error::new(
                        ErrorKind::InvalidData,
                        concat!("malformed ", stringify!($flags)),
                    )),
                }
            }
        })+
    };
}

read_flags!(ClassAccessFlags, FieldAccessFlags, MethodAccessFlags);

simple_grammar! {
    #[derive(Debug, Clone)]
    pub struct FieldInfo {
        pub access: FieldAccessFlags,
        pub name_index: u16,
        pub descriptor_index: u16,
        pub attributes: Vec<AttributeInfo>,
    }

    #[derive(Debug, Clone)]
    pub struct MethodInfo {
        pub access: MethodAccessFlags,
        pub name_index: u16,
        pub descriptor_index: u16,
        pub attributes: Vec<AttributeInfo>,
    }
}

impl FieldInfo {
    pub fn name<'a>(&self, pool: &'a RawConstantPool) -> &'a Rc<str> {
        pool.text(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a RawConstantPool) -> &'a Rc<str> {
        pool.text(self.descriptor_index)
    }
}

impl MethodInfo {
    pub fn name<'a>(&self, pool: &'a RawConstantPool) -> &'a Rc<str> {
        pool.text(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a RawConstantPool) -> &'a Rc<str> {
        pool.text(self.descriptor_index)
    }

    pub fn code(&self, pool: &RawConstantPool) -> io::Result<Option<CodeAttribute>> {
        match find_raw_attribute(&self.attributes, pool, "Code") {
            Some(attribute) => attribute.decode_as().map(Some),
            None => Ok(None),
        }
    }
}

/// A fully parsed (but unlinked) class file. Parsing performs the structural
/// checks of JVMS §4.8: a failure produces an `InvalidData` error whose
/// message is surfaced to Java as a `ClassFormatError`. Parsing has no side
/// effects beyond the returned value.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub version: ClassVersion,
    pub constants: RawConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        trace!("parsing class file of {} bytes", data.len());
        let mut buffer = Cursor::new(data);

        ClassMagic::read(&mut buffer)?;
        let version = ClassVersion::read(&mut buffer)?;
        trace!("class version {}.{}", version.major, version.minor);

        let constants = RawConstantPool::read(&mut buffer)?;
        trace!("read {} constant(s)", constants.len());

        let class = ClassFile {
            version,
            constants,
            access_flags: ClassAccessFlags::read(&mut buffer)?,
            this_class: u16::read(&mut buffer)?,
            super_class: u16::read(&mut buffer)?,
            interfaces: Vec::read(&mut buffer)?,
            fields: Vec::read(&mut buffer)?,
            methods: Vec::read(&mut buffer)?,
            attributes: Vec::read(&mut buffer)?,
        };

        if buffer.position() != data.len() as u64 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("{} trailing bytes after class file", data.len() as u64 - buffer.position()),
            ));
        }

        class.validate()?;
        Ok(class)
    }

    fn validate(&self) -> io::Result<()> {
        let pool = &self.constants;

        let expect_class = |index: u16, what: &str| -> io::Result<()> {
            match (index as usize)
                .checked_sub(1)
                .and_then(|index| pool.entries().get(index))
            {
                Some(Constant::Class { .. }) => Ok(()),
                _ => Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("{} index {} is not a Class constant", what, index),
                )),
            }
        };

        expect_class(self.this_class, "this_class")?;
        if self.super_class != 0 {
            expect_class(self.super_class, "super_class")?;
        } else if &**self.name() != "java/lang/Object" && !self.access_flags.contains(ClassAccessFlags::MODULE) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "only java/lang/Object may omit a superclass",
            ));
        }
        for interface in &self.interfaces {
            expect_class(*interface, "interface")?;
        }

        for field in &self.fields {
            let descriptor = field.descriptor(pool);
            FieldDescriptor::parse(descriptor).map_err(|e| {
                Error::new(ErrorKind::InvalidData, format!("field {}: {}", field.name(pool), e))
            })?;
        }

        for method in &self.methods {
            let descriptor = method.descriptor(pool);
            FieldDescriptor::parse_method(descriptor).map_err(|e| {
                Error::new(ErrorKind::InvalidData, format!("method {}: {}", method.name(pool), e))
            })?;

            let has_code = find_raw_attribute(&method.attributes, pool, "Code").is_some();
            let expects_code = !method
                .access
                .intersects(MethodAccessFlags::NATIVE | MethodAccessFlags::ABSTRACT);
            if has_code != expects_code {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "method {} {} a Code attribute",
                        method.name(pool),
                        if has_code { "must not carry" } else { "is missing" }
                    ),
                ));
            }
        }

        self.validate_bootstrap_indices()
    }

    /// Dynamic/InvokeDynamic entries carry an index into the BootstrapMethods
    /// attribute; both directions of that link are checked here.
    fn validate_bootstrap_indices(&self) -> io::Result<()> {
        let bootstrap = self.bootstrap_methods()?;

        let methods = match &bootstrap {
            Some(table) => &table.methods[..],
            None => &[],
        };

        for entry in self.constants.entries() {
            let index = match entry {
                Constant::Dynamic { bootstrap_method_attr_index, .. }
                | Constant::InvokeDynamic { bootstrap_method_attr_index, .. } => {
                    *bootstrap_method_attr_index
                }
                _ => continue,
            };

            if index as usize >= methods.len() {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("bootstrap method index {} out of range", index),
                ));
            }
        }

        for method in methods {
            let entry = (method.method_ref as usize)
                .checked_sub(1)
                .and_then(|index| self.constants.entries().get(index));
            match entry {
                Some(Constant::MethodHandle { .. }) => {}
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "bootstrap method ref is not a MethodHandle",
                    ))
                }
            }

            for argument in &method.arguments {
                let entry = (*argument as usize)
                    .checked_sub(1)
                    .and_then(|index| self.constants.entries().get(index));
                match entry {
                    Some(entry) if entry.is_loadable() => {}
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "bootstrap method argument is not a loadable constant",
                        ))
                    }
                }
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &Rc<str> {
        self.constants.class_name(self.this_class)
    }

    pub fn super_class_name(&self) -> Option<&Rc<str>> {
        match self.super_class {
            0 => None,
            x => Some(self.constants.class_name(x)),
        }
    }

    pub fn interface_names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.interfaces.iter().map(move |x| self.constants.class_name(*x))
    }

    pub fn bootstrap_methods(&self) -> io::Result<Option<BootstrapMethods>> {
        match find_raw_attribute(&self.attributes, &self.constants, "BootstrapMethods") {
            Some(attribute) => attribute.decode_as().map(Some),
            None => Ok(None),
        }
    }

    /// Read just far enough into a class file to learn its name.
    pub fn peek_name(data: &[u8]) -> io::Result<String> {
        let mut buffer = Cursor::new(data);
        ClassMagic::read(&mut buffer)?;
        ClassVersion::read(&mut buffer)?;
        let constants = RawConstantPool::read(&mut buffer)?;
        let _access = u16::read(&mut buffer)?;
        let this_class = u16::read(&mut buffer)?;

        let entry = (this_class as usize)
            .checked_sub(1)
            .and_then(|index| constants.entries().get(index));
        match entry {
            Some(Constant::Class { name_index }) => Ok(constants.text(*name_index).to_string()),
            _ => Err(Error::new(ErrorKind::InvalidData, "this_class is not a Class constant")),
        }
    }
}

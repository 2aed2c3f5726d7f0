use std::cmp::Ordering;
use std::io::{self, Error, ErrorKind, Read};

use crate::class::Readable;

/// Consumes and checks the leading 0xCAFEBABE on read.
#[derive(Debug, Copy, Clone)]
pub struct ClassMagic;

impl Readable for ClassMagic {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        match u32::read(buffer)? {
            0xCAFE_BABE => Ok(ClassMagic),
            x => Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad magic number {:#010x}", x),
            )),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ClassVersion {
    pub major: u16,
    pub minor: u16,
}

impl Readable for ClassVersion {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        // Minor precedes major in the file
        let minor = u16::read(buffer)?;
        let major = u16::read(buffer)?;
        Ok(ClassVersion { major, minor })
    }
}

impl ClassVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ClassVersion { major, minor }
    }

    /// Class files at or above this version require a StackMapTable for any
    /// method with branches.
    pub const JAVA_6: ClassVersion = ClassVersion::new(50, 0);
}

impl PartialOrd for ClassVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClassVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.major.cmp(&other.major) {
            Ordering::Equal => self.minor.cmp(&other.minor),
            x => x,
        }
    }
}

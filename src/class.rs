//! Access-flag bitsets, the magic/version header, and a cheap name-only peek at a class file.
//! The full header->body structure is driven by [`crate::reader::ClassReader`] directly against
//! a [`crate::visitor::ClassVisitor`] rather than materialized into one aggregate struct — there
//! is no `Class` value type here the way a loader-oriented crate would have one.

use std::cmp::Ordering;
use std::io;
use std::io::{Read, Write};

use crate::read::{Readable, Writable};
use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

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

impl Readable for ClassAccessFlags {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        match ClassAccessFlags::from_bits(u16::read(buffer)?) {
            Some(v) => Ok(v),
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "malformed class access flags")),
        }
    }
}

impl Writable for ClassAccessFlags {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(self.bits())
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

impl Readable for MethodAccessFlags {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        match MethodAccessFlags::from_bits(u16::read(buffer)?) {
            Some(v) => Ok(v),
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "malformed method access flags")),
        }
    }
}

impl Writable for MethodAccessFlags {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(self.bits())
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

impl Readable for FieldAccessFlags {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        match FieldAccessFlags::from_bits(u16::read(buffer)?) {
            Some(v) => Ok(v),
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "malformed field access flags")),
        }
    }
}

impl Writable for FieldAccessFlags {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(self.bits())
    }
}

/// Consumes/emits the fixed `0xCAFEBABE` magic number.
#[derive(Debug, Copy, Clone)]
pub struct ClassMagicBytes;

impl Readable for ClassMagicBytes {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        if u32::read(buffer)? != 0xCAFEBABE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "magic bytes do not match 0xCAFEBABE"));
        }
        Ok(ClassMagicBytes)
    }
}

impl Writable for ClassMagicBytes {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u32::<BigEndian>(0xCAFEBABE)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ClassVersion {
    pub major: u16,
    pub minor: u16,
}

impl ClassVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ClassVersion { major, minor }
    }

    /// The lowest class file version the expensive frame-computation mode (`StackMapTable`,
    /// JVM §4.7.4) is legal for; below it only the cheap `max_stack`/`max_locals` mode applies.
    pub const FRAMES_REQUIRED_SINCE: ClassVersion = ClassVersion::new(50, 0);
}

impl Readable for ClassVersion {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let minor = buffer.read_u16::<BigEndian>()?;
        let major = buffer.read_u16::<BigEndian>()?;
        Ok(ClassVersion { minor, major })
    }
}

impl Writable for ClassVersion {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        buffer.write_u16::<BigEndian>(self.minor)?;
        buffer.write_u16::<BigEndian>(self.major)
    }
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

/// The result of reading just enough of a class file to know its identity, without decoding
/// fields, methods, or attributes. Useful for a classpath indexer that only needs the name.
pub struct PeekedClass {
    pub version: ClassVersion,
    pub access_flags: ClassAccessFlags,
    pub this_class: String,
    pub super_class: Option<String>,
}

impl Readable for PeekedClass {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        use crate::constant::RawConstantPool;

        let _magic = ClassMagicBytes::read(buffer)?;
        let version = ClassVersion::read(buffer)?;
        let constants = RawConstantPool::read(buffer)?;
        let access_flags = ClassAccessFlags::read(buffer)?;
        let this_class_index = u16::read(buffer)?;
        let super_class_index = u16::read(buffer)?;

        let this_class = constants.class_name(this_class_index).to_string();
        let super_class = match super_class_index {
            0 => None,
            x => Some(constants.class_name(x).to_string()),
        };

        Ok(PeekedClass { version, access_flags, this_class, super_class })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_compares_major_then_minor() {
        assert!(ClassVersion::new(52, 0) > ClassVersion::new(51, 5));
        assert!(ClassVersion::new(52, 1) > ClassVersion::new(52, 0));
    }

    #[test]
    fn access_flags_roundtrip() {
        let flags = ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER;
        let mut buf = Vec::new();
        flags.write(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(ClassAccessFlags::read(&mut cursor).unwrap(), flags);
    }

    #[test]
    fn magic_bytes_reject_mismatch() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 0]);
        assert!(ClassMagicBytes::read(&mut cursor).is_err());
    }
}

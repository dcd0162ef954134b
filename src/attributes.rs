//! > § 4.7 Attributes
//! Attributes are used in the ClassFile, field_info, method_info, Code_attribute, and
//! record_component_info structures of the class file format (§4.1, §4.5, §4.6, §4.7.3).
//!
//! `AttributeInfo` keeps every attribute's payload as an opaque [`BinarySection`] at the
//! reader/writer boundary; attributes a consumer cares about (`Code`, `StackMapTable`,
//! `ConstantValue`, `Exceptions`) are decoded from that section on demand via
//! [`BinarySection::read_as`], and any attribute this crate doesn't model round-trips unchanged.

use crate::read::{BinarySection, Readable, Writable};
use crate::simple_grammar;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Error, ErrorKind, Read, Write};

simple_grammar! {

    /// An attribute of indeterminate type. This could be one of the predefined attribute names or
    /// a custom attribute; the name must be resolved against the constant pool by the caller.
    #[derive(Debug, Clone)]
    pub struct AttributeInfo {
        pub name_index: u16,
        pub info: BinarySection,
    }

    /// Fixed-length attribute of `field_info` (§4.7.2) giving the value of a compile-time
    /// constant expression. There may be at most one per `field_info`.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone)]
    pub struct ConstantValue {
        /// Index into the constant pool; entry type depends on the field's descriptor (int/short/
        /// char/byte/boolean -> Integer, float -> Float, long -> Long, double -> Double, String ->
        /// String).
        pub index: u16,
    }

    /// One entry of a `Code` attribute's exception table: an active range `[start_pc, end_pc)`,
    /// the handler's entry point, and the caught class (`0` for a catch-all/`finally` handler).
    #[derive(Debug, Copy, Clone)]
    pub struct ExceptionBounds {
        pub start_pc: u16,
        pub end_pc: u16,
        pub handler_pc: u16,
        pub catch_type: u16,
    }

    /// The Code attribute (§4.7.3): the bytecode of a method body plus its exception table and
    /// nested attributes (`LineNumberTable`, `LocalVariableTable`, `StackMapTable`, ...). The
    /// `code` section's internal instruction stream is decoded separately by
    /// [`crate::reader::ClassReader`]/[`crate::frame`], not by this struct.
    #[derive(Debug, Clone)]
    pub struct Code {
        pub max_stack: u16,
        pub max_locals: u16,
        pub code: BinarySection,
        pub exception_table: Vec<ExceptionBounds>,
        pub attributes: Vec<AttributeInfo>,
    }

    /// The StackMapTable attribute (§4.7.4), used during type-checking verification. At most one
    /// per `Code` attribute; a class file with version 50.0+ and no `StackMapTable` has an
    /// implicit empty one.
    pub struct StackMapTable {
        pub entries: Vec<StackMapFrame>,
    }

    /// The Exceptions attribute (§4.6.6): the checked exception classes a method is declared to
    /// throw. At most one per `method_info`.
    pub struct Exceptions {
        pub exception_index_table: Vec<u16>,
    }
}

/// A stack map frame: a one-byte tag selecting the variant, followed by zero or more bytes of
/// frame-specific data (§4.7.4). Each frame is defined relative to the previous one.
#[derive(Debug, Clone, PartialEq)]
pub enum StackMapFrame {
    /// Tags 0-63. Same locals as the previous frame, empty stack. `offset_delta` is the tag.
    SameFrame(u8),
    /// Tags 64-127. Same locals, one stack entry. `offset_delta` is `frame_type - 64`.
    SameLocals1StackItemFrame { frame_type: u8, stack: VerificationTypeInfo },
    /// Tag 247. Same as `SameLocals1StackItemFrame` but with an explicit `offset_delta`.
    SameLocals1StackItemFrameExtended { offset_delta: u16, stack: VerificationTypeInfo },
    /// Tags 248-250. Drops the last `251 - frame_type` locals from the previous frame.
    ChopFrame { frame_type: u8, offset_delta: u16 },
    /// Tag 251. Same locals, empty stack, explicit `offset_delta`.
    SameFrameExtended { offset_delta: u16 },
    /// Tags 252-254. Appends `frame_type - 251` locals to the previous frame.
    AppendFrame { frame_type: u8, offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    /// Tag 255. Locals and stack given in full, independent of the previous frame.
    FullFrame { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl Readable for StackMapFrame {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let discriminated_type = u8::read(buffer)?;

        Ok(match discriminated_type {
            0..=63 => StackMapFrame::SameFrame(discriminated_type),
            64..=127 => StackMapFrame::SameLocals1StackItemFrame {
                frame_type: discriminated_type,
                stack: VerificationTypeInfo::read(buffer)?,
            },
            128..=246 => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    format!("stack_map_frame tag {} is reserved for future use", discriminated_type),
                ))
            }
            247 => StackMapFrame::SameLocals1StackItemFrameExtended {
                offset_delta: u16::read(buffer)?,
                stack: VerificationTypeInfo::read(buffer)?,
            },
            248..=250 => StackMapFrame::ChopFrame {
                frame_type: discriminated_type,
                offset_delta: u16::read(buffer)?,
            },
            251 => StackMapFrame::SameFrameExtended { offset_delta: u16::read(buffer)? },
            252..=254 => StackMapFrame::AppendFrame {
                frame_type: discriminated_type,
                offset_delta: u16::read(buffer)?,
                locals: {
                    let num_locals = discriminated_type - 251;
                    let mut locals = Vec::with_capacity(num_locals as usize);
                    for _ in 0..num_locals {
                        locals.push(VerificationTypeInfo::read(buffer)?);
                    }
                    locals
                },
            },
            255 => StackMapFrame::FullFrame {
                offset_delta: u16::read(buffer)?,
                locals: <Vec<VerificationTypeInfo>>::read(buffer)?,
                stack: <Vec<VerificationTypeInfo>>::read(buffer)?,
            },
            #[allow(unreachable_patterns)]
            _ => unreachable!(),
        })
    }
}

impl Writable for StackMapFrame {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        match self {
            StackMapFrame::SameFrame(frame_type) => buffer.write_u8(*frame_type),
            StackMapFrame::SameLocals1StackItemFrame { frame_type, stack } => {
                buffer.write_u8(*frame_type)?;
                stack.write(buffer)
            }
            StackMapFrame::SameLocals1StackItemFrameExtended { offset_delta, stack } => {
                buffer.write_u8(247)?;
                buffer.write_u16::<BigEndian>(*offset_delta)?;
                stack.write(buffer)
            }
            StackMapFrame::ChopFrame { frame_type, offset_delta } => {
                buffer.write_u8(*frame_type)?;
                buffer.write_u16::<BigEndian>(*offset_delta)
            }
            StackMapFrame::SameFrameExtended { offset_delta } => {
                buffer.write_u8(251)?;
                buffer.write_u16::<BigEndian>(*offset_delta)
            }
            StackMapFrame::AppendFrame { frame_type, offset_delta, locals } => {
                buffer.write_u8(*frame_type)?;
                buffer.write_u16::<BigEndian>(*offset_delta)?;
                for local in locals {
                    local.write(buffer)?;
                }
                Ok(())
            }
            StackMapFrame::FullFrame { offset_delta, locals, stack } => {
                buffer.write_u8(255)?;
                buffer.write_u16::<BigEndian>(*offset_delta)?;
                locals.write(buffer)?;
                stack.write(buffer)
            }
        }
    }
}

/// A verification type specifies the type of a local variable or operand stack entry: a one-byte
/// tag followed by zero or more bytes of tag-specific data (§4.7.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// The class at `const_pool_index` (a `CONSTANT_Class_info`).
    Object { const_pool_index: u16 },
    /// The object created by the `new` instruction at `offset` in the enclosing `Code` attribute,
    /// not yet passed to `<init>`.
    Uninitialized { offset: u16 },
}

impl Readable for VerificationTypeInfo {
    fn read<T: Read>(buffer: &mut T) -> io::Result<Self> {
        let discriminated_type = u8::read(buffer)?;

        Ok(match discriminated_type {
            0 => VerificationTypeInfo::Top,
            1 => VerificationTypeInfo::Integer,
            2 => VerificationTypeInfo::Float,
            3 => VerificationTypeInfo::Double,
            4 => VerificationTypeInfo::Long,
            5 => VerificationTypeInfo::Null,
            6 => VerificationTypeInfo::UninitializedThis,
            7 => VerificationTypeInfo::Object { const_pool_index: u16::read(buffer)? },
            8 => VerificationTypeInfo::Uninitialized { offset: u16::read(buffer)? },
            x => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("{} is not a valid tag for verification_type_info", x),
                ))
            }
        })
    }
}

impl Writable for VerificationTypeInfo {
    fn write<T: Write>(&self, buffer: &mut T) -> io::Result<()> {
        match self {
            VerificationTypeInfo::Top => buffer.write_u8(0),
            VerificationTypeInfo::Integer => buffer.write_u8(1),
            VerificationTypeInfo::Float => buffer.write_u8(2),
            VerificationTypeInfo::Double => buffer.write_u8(3),
            VerificationTypeInfo::Long => buffer.write_u8(4),
            VerificationTypeInfo::Null => buffer.write_u8(5),
            VerificationTypeInfo::UninitializedThis => buffer.write_u8(6),
            VerificationTypeInfo::Object { const_pool_index } => {
                buffer.write_u8(7)?;
                buffer.write_u16::<BigEndian>(*const_pool_index)
            }
            VerificationTypeInfo::Uninitialized { offset } => {
                buffer.write_u8(8)?;
                buffer.write_u16::<BigEndian>(*offset)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn same_frame_roundtrips() {
        let frame = StackMapFrame::SameFrame(12);
        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        match StackMapFrame::read(&mut cursor).unwrap() {
            StackMapFrame::SameFrame(12) => {}
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn full_frame_roundtrips() {
        let frame = StackMapFrame::FullFrame {
            offset_delta: 5,
            locals: vec![VerificationTypeInfo::Integer, VerificationTypeInfo::Object { const_pool_index: 7 }],
            stack: vec![VerificationTypeInfo::Long],
        };
        let mut buf = Vec::new();
        frame.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        match StackMapFrame::read(&mut cursor).unwrap() {
            StackMapFrame::FullFrame { offset_delta, locals, stack } => {
                assert_eq!(offset_delta, 5);
                assert_eq!(locals.len(), 2);
                assert_eq!(stack.len(), 1);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn reserved_tag_is_rejected() {
        let mut cursor = Cursor::new(vec![200u8]);
        assert!(StackMapFrame::read(&mut cursor).is_err());
    }

    #[test]
    fn code_attribute_roundtrips() {
        let code = Code {
            max_stack: 4,
            max_locals: 2,
            code: BinarySection::from_bytes(vec![0x2a, 0xb1]),
            exception_table: vec![ExceptionBounds { start_pc: 0, end_pc: 2, handler_pc: 2, catch_type: 0 }],
            attributes: vec![],
        };
        let mut buf = Vec::new();
        code.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = Code::read(&mut cursor).unwrap();
        assert_eq!(decoded.max_stack, 4);
        assert_eq!(decoded.exception_table.len(), 1);
    }
}

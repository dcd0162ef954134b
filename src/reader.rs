//! Streaming class-file parser: [`ClassReader`] walks the byte buffer once and drives a
//! `&mut dyn ClassVisitor` (§4, §9). Method bodies go through a two-phase decode — a label
//! discovery pass over the raw bytecode, then a second pass that emits `visit_label` and the
//! typed instruction events in address order — mirroring the class-level ordering problem: the
//! binary layout puts `fields`/`methods` before the class's own attributes (`SourceFile`,
//! `InnerClasses`, ...), but `ClassVisitor::visit` wants the class's signature and source name
//! before any field or method is visited. The reader resolves this by locating (not decoding) the
//! fields/methods section first, decoding the trailing class attributes, emitting the header
//! events, then rewinding to drive fields and methods for real.

use std::collections::HashMap;
use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{trace, warn};

use crate::attributes::{
    AttributeInfo, Code, ExceptionBounds, Exceptions, StackMapFrame, StackMapTable,
    VerificationTypeInfo,
};
use crate::class::{
    ClassAccessFlags, ClassMagicBytes, ClassVersion, FieldAccessFlags, MethodAccessFlags,
};
use crate::constant::{Constant, RawConstantPool};
use crate::error::{ClassFileError, Result};
use crate::label::{LabelArena, LabelId, LabelStatus};
use crate::opcode;
use crate::read::{BinarySection, Readable};
use crate::visitor::{
    ClassVisitor, ConstantValue, FieldVisitor, Label, LdcConstant, MethodVisitor,
    VerificationType,
};

bitflags! {
    /// Controls how much of a class file `ClassReader::accept` actually decodes. Mirrors the
    /// trade-off a bytecode-analysis tool usually wants to make: a classpath indexer skips
    /// everything but the header, a decompiler wants debug info, a verifier wants expanded frames.
    pub struct ClassReaderFlags: u8 {
        /// Skip `LineNumberTable`/`LocalVariableTable` content entirely.
        const SKIP_DEBUG = 0b0001;
        /// Skip method bodies entirely; field/method shape (descriptors, access flags, annotations
        /// if supported) is still visited.
        const SKIP_CODE = 0b0010;
        /// Skip `StackMapTable` content even when present (neither merged nor expanded).
        const SKIP_FRAMES = 0b0100;
        /// Decode `StackMapTable` entries and deliver them via `MethodVisitor::visit_frame`
        /// instead of leaving the attribute untouched. Ignored if `SKIP_FRAMES` is also set.
        const EXPAND_FRAMES = 0b1000;
    }
}

/// Reads a single class file from an in-memory byte buffer and drives a [`ClassVisitor`] over it.
pub struct ClassReader {
    bytes: Vec<u8>,
}

impl ClassReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        ClassReader { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn accept(&self, visitor: &mut dyn ClassVisitor, flags: ClassReaderFlags) -> Result<()> {
        let mut cursor = Cursor::new(self.bytes.as_slice());
        ClassMagicBytes::read(&mut cursor)?;
        let version = ClassVersion::read(&mut cursor)?;
        let mut pool = RawConstantPool::read(&mut cursor)?;
        let access_flags = ClassAccessFlags::read(&mut cursor)?;
        let this_index = u16::read(&mut cursor)?;
        let super_index = u16::read(&mut cursor)?;
        let this_class = pool.class_name(this_index).to_string();
        let super_class = match super_index {
            0 => None,
            idx => Some(pool.class_name(idx).to_string()),
        };
        let interface_count = u16::read(&mut cursor)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let idx = u16::read(&mut cursor)?;
            interfaces.push(pool.class_name(idx).to_string());
        }

        let fields_start = cursor.position();
        skip_fields_and_methods(&mut cursor)?;
        let class_attrs = read_class_attributes(&mut cursor, &mut pool)?;

        visitor.visit(
            version,
            access_flags,
            &this_class,
            class_attrs.signature.as_deref(),
            super_class.as_deref(),
            &interfaces,
        );
        visitor.visit_source(class_attrs.source.as_deref(), None);
        if let Some((owner, name, descriptor)) = &class_attrs.outer {
            visitor.visit_outer_class(owner, name.as_deref(), descriptor.as_deref());
        }
        for (name, outer, inner, inner_access) in &class_attrs.inner_classes {
            visitor.visit_inner_class(name, outer.as_deref(), inner.as_deref(), *inner_access);
        }

        cursor.set_position(fields_start);
        read_fields(&mut cursor, &mut pool, visitor)?;
        read_methods(&mut cursor, &mut pool, visitor, flags)?;

        for (name, data) in &class_attrs.unknown {
            visitor.visit_attribute(name, data);
        }

        visitor.visit_end();
        Ok(())
    }
}

fn skip_fields_and_methods(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let field_count = u16::read(cursor)?;
    for _ in 0..field_count {
        u16::read(cursor)?;
        u16::read(cursor)?;
        u16::read(cursor)?;
        Vec::<AttributeInfo>::read(cursor)?;
    }
    let method_count = u16::read(cursor)?;
    for _ in 0..method_count {
        u16::read(cursor)?;
        u16::read(cursor)?;
        u16::read(cursor)?;
        Vec::<AttributeInfo>::read(cursor)?;
    }
    Ok(())
}

struct ClassAttrs {
    source: Option<String>,
    outer: Option<(String, Option<String>, Option<String>)>,
    inner_classes: Vec<(String, Option<String>, Option<String>, ClassAccessFlags)>,
    signature: Option<String>,
    unknown: Vec<(String, Vec<u8>)>,
}

fn read_class_attributes(cursor: &mut Cursor<&[u8]>, pool: &mut RawConstantPool) -> Result<ClassAttrs> {
    let attrs = Vec::<AttributeInfo>::read(cursor)?;
    let mut result = ClassAttrs {
        source: None,
        outer: None,
        inner_classes: Vec::new(),
        signature: None,
        unknown: Vec::new(),
    };

    for attr in &attrs {
        let name = utf8_owned(pool, attr.name_index)?;
        match name.as_str() {
            "SourceFile" => {
                let idx: u16 = attr.info.read_as()?;
                result.source = Some(utf8_owned(pool, idx)?);
            }
            "Signature" => {
                let idx: u16 = attr.info.read_as()?;
                result.signature = Some(utf8_owned(pool, idx)?);
            }
            "EnclosingMethod" => {
                let mut c = Cursor::new(attr.info.as_slice());
                let class_index = u16::read(&mut c)?;
                let method_index = u16::read(&mut c)?;
                let owner = pool.class_name(class_index).to_string();
                let (method_name, descriptor) = if method_index != 0 {
                    match pool.name_and_type(method_index) {
                        Some((n, d)) => (Some(n.to_string()), Some(d.to_string())),
                        None => (None, None),
                    }
                } else {
                    (None, None)
                };
                result.outer = Some((owner, method_name, descriptor));
            }
            "InnerClasses" => {
                let mut c = Cursor::new(attr.info.as_slice());
                let count = u16::read(&mut c)?;
                for _ in 0..count {
                    let inner_idx = u16::read(&mut c)?;
                    let outer_idx = u16::read(&mut c)?;
                    let inner_name_idx = u16::read(&mut c)?;
                    let access = ClassAccessFlags::read(&mut c)?;
                    let name = pool.class_name(inner_idx).to_string();
                    let outer_name = if outer_idx == 0 {
                        None
                    } else {
                        Some(pool.class_name(outer_idx).to_string())
                    };
                    let inner_name = if inner_name_idx == 0 {
                        None
                    } else {
                        Some(utf8_owned(pool, inner_name_idx)?)
                    };
                    result.inner_classes.push((name, outer_name, inner_name, access));
                }
            }
            _ => {
                trace!("class attribute {} left opaque", name);
                result.unknown.push((name, attr.info.to_vec()));
            }
        }
    }

    Ok(result)
}

fn read_fields(cursor: &mut Cursor<&[u8]>, pool: &mut RawConstantPool, cv: &mut dyn ClassVisitor) -> Result<()> {
    let count = u16::read(cursor)?;
    for _ in 0..count {
        let access = FieldAccessFlags::read(cursor)?;
        let name_idx = u16::read(cursor)?;
        let desc_idx = u16::read(cursor)?;
        let attrs = Vec::<AttributeInfo>::read(cursor)?;
        let name = utf8_owned(pool, name_idx)?;
        let descriptor = utf8_owned(pool, desc_idx)?;

        let mut value = None;
        let mut signature = None;
        let mut unknown = Vec::new();
        for attr in &attrs {
            let attr_name = utf8_owned(pool, attr.name_index)?;
            match attr_name.as_str() {
                "ConstantValue" => {
                    let idx: u16 = attr.info.read_as()?;
                    value = Some(resolve_constant_value(pool, idx)?);
                }
                "Signature" => {
                    let idx: u16 = attr.info.read_as()?;
                    signature = Some(utf8_owned(pool, idx)?);
                }
                _ => unknown.push((attr_name, attr.info.to_vec())),
            }
        }

        if let Some(mut fv) = cv.visit_field(access, &name, &descriptor, signature.as_deref(), value) {
            for (n, data) in &unknown {
                fv.visit_attribute(n, data);
            }
            fv.visit_end();
        }
    }
    Ok(())
}

fn read_methods(
    cursor: &mut Cursor<&[u8]>,
    pool: &mut RawConstantPool,
    cv: &mut dyn ClassVisitor,
    flags: ClassReaderFlags,
) -> Result<()> {
    let count = u16::read(cursor)?;
    for _ in 0..count {
        let access = MethodAccessFlags::read(cursor)?;
        let name_idx = u16::read(cursor)?;
        let desc_idx = u16::read(cursor)?;
        let attrs = Vec::<AttributeInfo>::read(cursor)?;
        let name = utf8_owned(pool, name_idx)?;
        let descriptor = utf8_owned(pool, desc_idx)?;

        let mut signature = None;
        let mut exceptions = Vec::new();
        let mut code_attr = None;
        let mut unknown = Vec::new();

        for attr in &attrs {
            let attr_name = utf8_owned(pool, attr.name_index)?;
            match attr_name.as_str() {
                "Signature" => {
                    let idx: u16 = attr.info.read_as()?;
                    signature = Some(utf8_owned(pool, idx)?);
                }
                "Exceptions" => {
                    let table: Exceptions = attr.info.read_as()?;
                    for idx in &table.exception_index_table {
                        exceptions.push(pool.class_name(*idx).to_string());
                    }
                }
                "Code" => code_attr = Some(attr.info.clone()),
                _ => unknown.push((attr_name, attr.info.to_vec())),
            }
        }

        if let Some(mut mv) = cv.visit_method(access, &name, &descriptor, signature.as_deref(), &exceptions) {
            for (n, data) in &unknown {
                mv.visit_attribute(n, data);
            }
            match code_attr {
                Some(info) if !flags.contains(ClassReaderFlags::SKIP_CODE) => {
                    read_method_code(&info, pool, &mut *mv, flags)?;
                }
                _ => mv.visit_end(),
            }
        }
    }
    Ok(())
}

fn resolve_constant_value(pool: &mut RawConstantPool, idx: u16) -> Result<ConstantValue> {
    match pool.get(idx).cloned() {
        Some(Constant::Integer(v)) => Ok(ConstantValue::Integer(v)),
        Some(Constant::Float(v)) => Ok(ConstantValue::Float(v)),
        Some(Constant::Long(v)) => Ok(ConstantValue::Long(v)),
        Some(Constant::Double(v)) => Ok(ConstantValue::Double(v)),
        Some(Constant::String { string_index }) => Ok(ConstantValue::String(utf8_owned(pool, string_index)?)),
        _ => Err(ClassFileError::malformed(idx as usize, "invalid ConstantValue entry")),
    }
}

fn utf8_owned(pool: &mut RawConstantPool, index: u16) -> Result<String> {
    pool.utf8(index)
        .map(|s| s.to_string())
        .ok_or_else(|| ClassFileError::malformed(index as usize, "expected a UTF-8 constant pool entry"))
}

fn resolve_field_ref(pool: &mut RawConstantPool, index: u16) -> Result<(String, String, String)> {
    let (class_index, name_and_type_index) = match pool.get(index) {
        Some(Constant::FieldRef { class_index, name_and_type_index }) => (*class_index, *name_and_type_index),
        _ => return Err(ClassFileError::malformed(index as usize, "expected a field ref constant")),
    };
    let owner = pool.class_name(class_index).to_string();
    let (name, descriptor) = pool
        .name_and_type(name_and_type_index)
        .map(|(n, d)| (n.to_string(), d.to_string()))
        .ok_or_else(|| ClassFileError::malformed(index as usize, "missing name_and_type"))?;
    Ok((owner, name, descriptor))
}

fn resolve_method_ref(pool: &mut RawConstantPool, index: u16) -> Result<(String, String, String, bool)> {
    let (class_index, name_and_type_index, is_interface) = match pool.get(index) {
        Some(Constant::MethodRef { class_index, name_and_type_index }) => {
            (*class_index, *name_and_type_index, false)
        }
        Some(Constant::InterfaceMethodRef { class_index, name_and_type_index }) => {
            (*class_index, *name_and_type_index, true)
        }
        _ => return Err(ClassFileError::malformed(index as usize, "expected a method ref constant")),
    };
    let owner = pool.class_name(class_index).to_string();
    let (name, descriptor) = pool
        .name_and_type(name_and_type_index)
        .map(|(n, d)| (n.to_string(), d.to_string()))
        .ok_or_else(|| ClassFileError::malformed(index as usize, "missing name_and_type"))?;
    Ok((owner, name, descriptor, is_interface))
}

fn get_label(arena: &mut LabelArena, map: &mut HashMap<u32, LabelId>, offset: u32) -> LabelId {
    if let Some(&id) = map.get(&offset) {
        return id;
    }
    let id = arena.new_label();
    let _ = arena.resolve(id, offset);
    map.insert(offset, id);
    id
}

// --- bytecode instruction decoding -----------------------------------------------------------

struct Decoded {
    length: usize,
    kind: DecodedKind,
}

enum DecodedKind {
    Simple { opcode: u8 },
    IntOperand { opcode: u8, operand: i32 },
    VarInsn { opcode: u8, index: u32 },
    IincInsn { index: u32, increment: i32 },
    TypeInsn { opcode: u8, cp_index: u16 },
    FieldInsn { opcode: u8, cp_index: u16 },
    MethodInsn { opcode: u8, cp_index: u16, is_interface: bool },
    InvokeDynamicInsn { cp_index: u16 },
    LdcInsn { cp_index: u16 },
    JumpInsn { opcode: u8, target: i32 },
    TableSwitchInsn { low: i32, high: i32, default: i32, targets: Vec<i32> },
    LookupSwitchInsn { default: i32, pairs: Vec<(i32, i32)> },
    MultiANewArrayInsn { cp_index: u16, dims: u8 },
}

fn short_var(base: u8, index: u8) -> Decoded {
    Decoded { length: 1, kind: DecodedKind::VarInsn { opcode: base, index: index as u32 } }
}

fn decode_instruction(code: &[u8], offset: usize) -> Result<Decoded> {
    let op = *code
        .get(offset)
        .ok_or_else(|| ClassFileError::malformed(offset, "instruction truncated"))?;

    let need = |at: usize, len: usize| -> Result<&[u8]> {
        code.get(at..at + len)
            .ok_or_else(|| ClassFileError::malformed(at, "instruction truncated"))
    };

    match op {
        opcode::WIDE => {
            let sub = *code
                .get(offset + 1)
                .ok_or_else(|| ClassFileError::malformed(offset, "truncated wide instruction"))?;
            if sub == opcode::IINC {
                let index = BigEndian::read_u16(need(offset + 2, 2)?) as u32;
                let increment = BigEndian::read_i16(need(offset + 4, 2)?) as i32;
                Ok(Decoded { length: 6, kind: DecodedKind::IincInsn { index, increment } })
            } else {
                let index = BigEndian::read_u16(need(offset + 2, 2)?) as u32;
                Ok(Decoded { length: 4, kind: DecodedKind::VarInsn { opcode: sub, index } })
            }
        }
        opcode::TABLESWITCH => {
            let mut pos = offset + 1;
            pos += (4 - (pos % 4)) % 4;
            let default = BigEndian::read_i32(need(pos, 4)?);
            let low = BigEndian::read_i32(need(pos + 4, 4)?);
            let high = BigEndian::read_i32(need(pos + 8, 4)?);
            pos += 12;
            let count = (high - low + 1).max(0) as usize;
            let mut targets = Vec::with_capacity(count);
            for i in 0..count {
                let t = BigEndian::read_i32(need(pos + i * 4, 4)?);
                targets.push(offset as i32 + t);
            }
            let length = pos + count * 4 - offset;
            Ok(Decoded {
                length,
                kind: DecodedKind::TableSwitchInsn { low, high, default: offset as i32 + default, targets },
            })
        }
        opcode::LOOKUPSWITCH => {
            let mut pos = offset + 1;
            pos += (4 - (pos % 4)) % 4;
            let default = BigEndian::read_i32(need(pos, 4)?);
            let npairs = BigEndian::read_i32(need(pos + 4, 4)?).max(0) as usize;
            pos += 8;
            let mut pairs = Vec::with_capacity(npairs);
            for i in 0..npairs {
                let key = BigEndian::read_i32(need(pos + i * 8, 4)?);
                let target = BigEndian::read_i32(need(pos + i * 8 + 4, 4)?);
                pairs.push((key, offset as i32 + target));
            }
            let length = pos + npairs * 8 - offset;
            Ok(Decoded { length, kind: DecodedKind::LookupSwitchInsn { default: offset as i32 + default, pairs } })
        }
        opcode::BIPUSH => Ok(Decoded {
            length: 2,
            kind: DecodedKind::IntOperand { opcode: op, operand: need(offset + 1, 1)?[0] as i8 as i32 },
        }),
        opcode::SIPUSH => Ok(Decoded {
            length: 3,
            kind: DecodedKind::IntOperand { opcode: op, operand: BigEndian::read_i16(need(offset + 1, 2)?) as i32 },
        }),
        opcode::NEWARRAY => Ok(Decoded {
            length: 2,
            kind: DecodedKind::IntOperand { opcode: op, operand: need(offset + 1, 1)?[0] as i32 },
        }),
        opcode::LDC => Ok(Decoded { length: 2, kind: DecodedKind::LdcInsn { cp_index: need(offset + 1, 1)?[0] as u16 } }),
        opcode::LDC_W | opcode::LDC2_W => Ok(Decoded {
            length: 3,
            kind: DecodedKind::LdcInsn { cp_index: BigEndian::read_u16(need(offset + 1, 2)?) },
        }),
        opcode::ILOAD..=opcode::ALOAD | opcode::ISTORE..=opcode::ASTORE | opcode::RET => Ok(Decoded {
            length: 2,
            kind: DecodedKind::VarInsn { opcode: op, index: need(offset + 1, 1)?[0] as u32 },
        }),
        26..=29 => Ok(short_var(opcode::ILOAD, op - 26)),
        30..=33 => Ok(short_var(opcode::LLOAD, op - 30)),
        34..=37 => Ok(short_var(opcode::FLOAD, op - 34)),
        38..=41 => Ok(short_var(opcode::DLOAD, op - 38)),
        42..=45 => Ok(short_var(opcode::ALOAD, op - 42)),
        59..=62 => Ok(short_var(opcode::ISTORE, op - 59)),
        63..=66 => Ok(short_var(opcode::LSTORE, op - 63)),
        67..=70 => Ok(short_var(opcode::FSTORE, op - 67)),
        71..=74 => Ok(short_var(opcode::DSTORE, op - 71)),
        75..=78 => Ok(short_var(opcode::ASTORE, op - 75)),
        opcode::IINC => Ok(Decoded {
            length: 3,
            kind: DecodedKind::IincInsn {
                index: need(offset + 1, 1)?[0] as u32,
                increment: need(offset + 2, 1)?[0] as i8 as i32,
            },
        }),
        opcode::NEW | opcode::ANEWARRAY | opcode::CHECKCAST | opcode::INSTANCEOF => Ok(Decoded {
            length: 3,
            kind: DecodedKind::TypeInsn { opcode: op, cp_index: BigEndian::read_u16(need(offset + 1, 2)?) },
        }),
        opcode::GETSTATIC | opcode::PUTSTATIC | opcode::GETFIELD | opcode::PUTFIELD => Ok(Decoded {
            length: 3,
            kind: DecodedKind::FieldInsn { opcode: op, cp_index: BigEndian::read_u16(need(offset + 1, 2)?) },
        }),
        opcode::INVOKEVIRTUAL | opcode::INVOKESPECIAL | opcode::INVOKESTATIC => Ok(Decoded {
            length: 3,
            kind: DecodedKind::MethodInsn {
                opcode: op,
                cp_index: BigEndian::read_u16(need(offset + 1, 2)?),
                is_interface: false,
            },
        }),
        opcode::INVOKEINTERFACE => Ok(Decoded {
            length: 5,
            kind: DecodedKind::MethodInsn {
                opcode: op,
                cp_index: BigEndian::read_u16(need(offset + 1, 2)?),
                is_interface: true,
            },
        }),
        opcode::INVOKEDYNAMIC => Ok(Decoded {
            length: 5,
            kind: DecodedKind::InvokeDynamicInsn { cp_index: BigEndian::read_u16(need(offset + 1, 2)?) },
        }),
        opcode::MULTIANEWARRAY => Ok(Decoded {
            length: 4,
            kind: DecodedKind::MultiANewArrayInsn {
                cp_index: BigEndian::read_u16(need(offset + 1, 2)?),
                dims: need(offset + 3, 1)?[0],
            },
        }),
        opcode::IFEQ..=opcode::GOTO | opcode::JSR | opcode::IFNULL | opcode::IFNONNULL => {
            let rel = BigEndian::read_i16(need(offset + 1, 2)?) as i32;
            Ok(Decoded { length: 3, kind: DecodedKind::JumpInsn { opcode: op, target: offset as i32 + rel } })
        }
        opcode::GOTO_W | opcode::JSR_W => {
            let rel = BigEndian::read_i32(need(offset + 1, 4)?);
            Ok(Decoded { length: 5, kind: DecodedKind::JumpInsn { opcode: op, target: offset as i32 + rel } })
        }
        opcode::PSEUDO_BASE..=opcode::PSEUDO_IFNONNULL => {
            Err(ClassFileError::malformed(offset, format!("reserved pseudo-opcode {} present in input", op)))
        }
        _ => Ok(Decoded { length: 1, kind: DecodedKind::Simple { opcode: op } }),
    }
}

fn discover_labels(
    code: &[u8],
    exceptions: &[ExceptionBounds],
    attributes: &[AttributeInfo],
    pool: &mut RawConstantPool,
    flags: ClassReaderFlags,
    arena: &mut LabelArena,
    offset_to_label: &mut HashMap<u32, LabelId>,
) -> Result<()> {
    let mut offset = 0usize;
    while offset < code.len() {
        let decoded = decode_instruction(code, offset)?;
        match &decoded.kind {
            DecodedKind::JumpInsn { target, .. } => {
                let label = get_label(arena, offset_to_label, *target as u32);
                arena.get_mut(label).status.insert(LabelStatus::TARGET);
            }
            DecodedKind::TableSwitchInsn { default, targets, .. } => {
                let dl = get_label(arena, offset_to_label, *default as u32);
                arena.get_mut(dl).status.insert(LabelStatus::TARGET);
                for t in targets {
                    let l = get_label(arena, offset_to_label, *t as u32);
                    arena.get_mut(l).status.insert(LabelStatus::TARGET);
                }
            }
            DecodedKind::LookupSwitchInsn { default, pairs } => {
                let dl = get_label(arena, offset_to_label, *default as u32);
                arena.get_mut(dl).status.insert(LabelStatus::TARGET);
                for (_, t) in pairs {
                    let l = get_label(arena, offset_to_label, *t as u32);
                    arena.get_mut(l).status.insert(LabelStatus::TARGET);
                }
            }
            _ => {}
        }
        offset += decoded.length;
    }

    for exc in exceptions {
        let handler = get_label(arena, offset_to_label, exc.handler_pc as u32);
        arena.get_mut(handler).status.insert(LabelStatus::TARGET);
        get_label(arena, offset_to_label, exc.start_pc as u32);
        get_label(arena, offset_to_label, exc.end_pc as u32);
    }

    if !flags.contains(ClassReaderFlags::SKIP_DEBUG) {
        for attr in attributes {
            let name = utf8_owned(pool, attr.name_index)?;
            match name.as_str() {
                "LineNumberTable" => {
                    let mut c = Cursor::new(attr.info.as_slice());
                    let count = u16::read(&mut c)?;
                    for _ in 0..count {
                        let pc = u16::read(&mut c)?;
                        let _line = u16::read(&mut c)?;
                        let label = get_label(arena, offset_to_label, pc as u32);
                        arena.get_mut(label).status.insert(LabelStatus::DEBUG);
                    }
                }
                "LocalVariableTable" => {
                    let mut c = Cursor::new(attr.info.as_slice());
                    let count = u16::read(&mut c)?;
                    for _ in 0..count {
                        let start_pc = u16::read(&mut c)?;
                        let length = u16::read(&mut c)?;
                        let _name_idx = u16::read(&mut c)?;
                        let _desc_idx = u16::read(&mut c)?;
                        let _index = u16::read(&mut c)?;
                        get_label(arena, offset_to_label, start_pc as u32);
                        get_label(arena, offset_to_label, (start_pc as u32) + (length as u32));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn dispatch(
    decoded: &Decoded,
    pool: &mut RawConstantPool,
    arena: &mut LabelArena,
    offset_to_label: &mut HashMap<u32, LabelId>,
    mv: &mut dyn MethodVisitor,
) -> Result<()> {
    match &decoded.kind {
        DecodedKind::Simple { opcode } => mv.visit_insn(*opcode),
        DecodedKind::IntOperand { opcode, operand } => mv.visit_int_insn(*opcode, *operand),
        DecodedKind::VarInsn { opcode, index } => mv.visit_var_insn(*opcode, *index),
        DecodedKind::IincInsn { index, increment } => mv.visit_iinc_insn(*index, *increment),
        DecodedKind::TypeInsn { opcode, cp_index } => {
            let name = pool.class_name(*cp_index).to_string();
            mv.visit_type_insn(*opcode, &name);
        }
        DecodedKind::FieldInsn { opcode, cp_index } => {
            let (owner, name, desc) = resolve_field_ref(pool, *cp_index)?;
            mv.visit_field_insn(*opcode, &owner, &name, &desc);
        }
        DecodedKind::MethodInsn { opcode, cp_index, is_interface } => {
            let (owner, name, desc, ref_is_interface) = resolve_method_ref(pool, *cp_index)?;
            mv.visit_method_insn(*opcode, &owner, &name, &desc, *is_interface || ref_is_interface);
        }
        DecodedKind::InvokeDynamicInsn { cp_index } => match pool.get(*cp_index).cloned() {
            Some(Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index }) => {
                let (name, desc) = pool
                    .name_and_type(name_and_type_index)
                    .map(|(n, d)| (n.to_string(), d.to_string()))
                    .ok_or_else(|| ClassFileError::malformed(*cp_index as usize, "missing name_and_type"))?;
                mv.visit_invoke_dynamic_insn(&name, &desc, bootstrap_method_attr_index);
            }
            _ => return Err(ClassFileError::malformed(*cp_index as usize, "expected an invokedynamic constant")),
        },
        DecodedKind::LdcInsn { cp_index } => {
            let constant = match pool.get(*cp_index).cloned() {
                Some(Constant::Integer(v)) => LdcConstant::Integer(v),
                Some(Constant::Float(v)) => LdcConstant::Float(v),
                Some(Constant::Long(v)) => LdcConstant::Long(v),
                Some(Constant::Double(v)) => LdcConstant::Double(v),
                Some(Constant::String { string_index }) => LdcConstant::String(utf8_owned(pool, string_index)?),
                Some(Constant::Class { name_index }) => LdcConstant::Class(utf8_owned(pool, name_index)?),
                _ => return Err(ClassFileError::malformed(*cp_index as usize, "unsupported ldc constant")),
            };
            mv.visit_ldc_insn(constant);
        }
        DecodedKind::JumpInsn { opcode, target } => {
            let label = get_label(arena, offset_to_label, *target as u32);
            mv.visit_jump_insn(*opcode, label);
        }
        DecodedKind::TableSwitchInsn { low, high, default, targets } => {
            let default_label = get_label(arena, offset_to_label, *default as u32);
            let labels: Vec<Label> = targets.iter().map(|t| get_label(arena, offset_to_label, *t as u32)).collect();
            mv.visit_table_switch_insn(*low, *high, default_label, &labels);
        }
        DecodedKind::LookupSwitchInsn { default, pairs } => {
            let default_label = get_label(arena, offset_to_label, *default as u32);
            let keys: Vec<i32> = pairs.iter().map(|(k, _)| *k).collect();
            let labels: Vec<Label> = pairs.iter().map(|(_, t)| get_label(arena, offset_to_label, *t as u32)).collect();
            mv.visit_lookup_switch_insn(default_label, &keys, &labels);
        }
        DecodedKind::MultiANewArrayInsn { cp_index, dims } => {
            let name = pool.class_name(*cp_index).to_string();
            mv.visit_multi_anew_array_insn(&name, *dims);
        }
    }
    Ok(())
}

fn drive_instructions(
    code: &[u8],
    pool: &mut RawConstantPool,
    arena: &mut LabelArena,
    offset_to_label: &mut HashMap<u32, LabelId>,
    frames: &HashMap<u32, ResolvedFrame>,
    mv: &mut dyn MethodVisitor,
) -> Result<()> {
    let mut offset = 0usize;
    while offset < code.len() {
        if let Some(&label) = offset_to_label.get(&(offset as u32)) {
            mv.visit_label(label);
        }
        if let Some((locals, stack)) = frames.get(&(offset as u32)) {
            mv.visit_frame(locals, stack);
        }
        let decoded = decode_instruction(code, offset)?;
        dispatch(&decoded, pool, arena, offset_to_label, mv)?;
        offset += decoded.length;
    }
    Ok(())
}

fn resolve_verification_types(
    entries: &[VerificationTypeInfo],
    pool: &mut RawConstantPool,
    arena: &mut LabelArena,
    offset_to_label: &mut HashMap<u32, LabelId>,
) -> Vec<VerificationType> {
    entries
        .iter()
        .map(|v| match v {
            VerificationTypeInfo::Top => VerificationType::Top,
            VerificationTypeInfo::Integer => VerificationType::Integer,
            VerificationTypeInfo::Float => VerificationType::Float,
            VerificationTypeInfo::Long => VerificationType::Long,
            VerificationTypeInfo::Double => VerificationType::Double,
            VerificationTypeInfo::Null => VerificationType::Null,
            VerificationTypeInfo::UninitializedThis => VerificationType::UninitializedThis,
            VerificationTypeInfo::Object { const_pool_index } => {
                VerificationType::Object(pool.class_name(*const_pool_index).to_string())
            }
            VerificationTypeInfo::Uninitialized { offset } => {
                VerificationType::Uninitialized(get_label(arena, offset_to_label, *offset as u32))
            }
        })
        .collect()
}

type ResolvedFrame = (Vec<VerificationType>, Vec<VerificationType>);

/// Decodes every entry of a `StackMapTable` into its absolute bytecode offset plus resolved
/// locals/stack, without emitting anything yet. `MethodVisitor::visit_frame` carries no offset of
/// its own — the caller must interleave these with `visit_label`/instruction events in address
/// order, the way [`drive_instructions`] does.
fn compute_frames(
    table: &StackMapTable,
    pool: &mut RawConstantPool,
    arena: &mut LabelArena,
    offset_to_label: &mut HashMap<u32, LabelId>,
) -> HashMap<u32, ResolvedFrame> {
    let mut offset: i32 = -1;
    let mut locals: Vec<VerificationTypeInfo> = Vec::new();
    let mut frames = HashMap::new();

    for frame in &table.entries {
        let (delta, new_stack): (u16, Vec<VerificationTypeInfo>) = match frame {
            StackMapFrame::SameFrame(tag) => (*tag as u16, Vec::new()),
            StackMapFrame::SameLocals1StackItemFrame { frame_type, stack } => {
                ((*frame_type - 64) as u16, vec![*stack])
            }
            StackMapFrame::SameLocals1StackItemFrameExtended { offset_delta, stack } => (*offset_delta, vec![*stack]),
            StackMapFrame::ChopFrame { frame_type, offset_delta } => {
                let k = (251 - *frame_type) as usize;
                let new_len = locals.len().saturating_sub(k);
                locals.truncate(new_len);
                (*offset_delta, Vec::new())
            }
            StackMapFrame::SameFrameExtended { offset_delta } => (*offset_delta, Vec::new()),
            StackMapFrame::AppendFrame { offset_delta, locals: appended, .. } => {
                locals.extend(appended.iter().copied());
                (*offset_delta, Vec::new())
            }
            StackMapFrame::FullFrame { offset_delta, locals: new_locals, stack } => {
                locals = new_locals.clone();
                (*offset_delta, stack.clone())
            }
        };

        offset = if offset < 0 { delta as i32 } else { offset + delta as i32 + 1 };
        let resolved_locals = resolve_verification_types(&locals, pool, arena, offset_to_label);
        let resolved_stack = resolve_verification_types(&new_stack, pool, arena, offset_to_label);
        frames.insert(offset as u32, (resolved_locals, resolved_stack));
    }
    frames
}

fn read_method_code(
    info: &BinarySection,
    pool: &mut RawConstantPool,
    mv: &mut dyn MethodVisitor,
    flags: ClassReaderFlags,
) -> Result<()> {
    let code_attr: Code = info.read_as()?;
    let code: &[u8] = &code_attr.code;
    let mut arena = LabelArena::new();
    let mut offset_to_label: HashMap<u32, LabelId> = HashMap::new();

    discover_labels(
        code,
        &code_attr.exception_table,
        &code_attr.attributes,
        pool,
        flags,
        &mut arena,
        &mut offset_to_label,
    )?;

    let frames = if !flags.contains(ClassReaderFlags::SKIP_FRAMES) && flags.contains(ClassReaderFlags::EXPAND_FRAMES) {
        let mut collected = HashMap::new();
        for attr in &code_attr.attributes {
            let name = utf8_owned(pool, attr.name_index)?;
            if name == "StackMapTable" {
                let table: StackMapTable = attr.info.read_as()?;
                collected = compute_frames(&table, pool, &mut arena, &mut offset_to_label);
            }
        }
        collected
    } else {
        if !flags.contains(ClassReaderFlags::SKIP_FRAMES) {
            for attr in &code_attr.attributes {
                let name = utf8_owned(pool, attr.name_index)?;
                if name == "StackMapTable" {
                    warn!("StackMapTable present but EXPAND_FRAMES not set; leaving it unvisited");
                }
            }
        }
        HashMap::new()
    };

    mv.visit_code();
    drive_instructions(code, pool, &mut arena, &mut offset_to_label, &frames, mv)?;

    for exc in &code_attr.exception_table {
        let start = get_label(&mut arena, &mut offset_to_label, exc.start_pc as u32);
        let end = get_label(&mut arena, &mut offset_to_label, exc.end_pc as u32);
        let handler = get_label(&mut arena, &mut offset_to_label, exc.handler_pc as u32);
        let catch_type = if exc.catch_type == 0 {
            None
        } else {
            Some(pool.class_name(exc.catch_type).to_string())
        };
        mv.visit_try_catch_block(start, end, handler, catch_type.as_deref());
    }

    if !flags.contains(ClassReaderFlags::SKIP_DEBUG) {
        for attr in &code_attr.attributes {
            let name = utf8_owned(pool, attr.name_index)?;
            match name.as_str() {
                "LineNumberTable" => {
                    let mut c = Cursor::new(attr.info.as_slice());
                    let count = u16::read(&mut c)?;
                    for _ in 0..count {
                        let start_pc = u16::read(&mut c)?;
                        let line = u16::read(&mut c)?;
                        let label = get_label(&mut arena, &mut offset_to_label, start_pc as u32);
                        mv.visit_line_number(line, label);
                    }
                }
                "LocalVariableTable" => {
                    let mut c = Cursor::new(attr.info.as_slice());
                    let count = u16::read(&mut c)?;
                    for _ in 0..count {
                        let start_pc = u16::read(&mut c)?;
                        let length = u16::read(&mut c)?;
                        let name_idx = u16::read(&mut c)?;
                        let desc_idx = u16::read(&mut c)?;
                        let index = u16::read(&mut c)?;
                        let var_name = utf8_owned(pool, name_idx)?;
                        let descriptor = utf8_owned(pool, desc_idx)?;
                        let start = get_label(&mut arena, &mut offset_to_label, start_pc as u32);
                        let end = get_label(&mut arena, &mut offset_to_label, (start_pc as u32) + (length as u32));
                        mv.visit_local_variable(&var_name, &descriptor, None, start, end, index as u32);
                    }
                }
                _ => {}
            }
        }
    }

    mv.visit_maxs(code_attr.max_stack as u32, code_attr.max_locals as u32);
    mv.visit_end();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::ConstantPool;

    #[derive(Default)]
    struct RecordingVisitor {
        visited_name: String,
        fields: Vec<String>,
        methods: Vec<String>,
        ended: bool,
    }

    impl ClassVisitor for RecordingVisitor {
        fn visit(
            &mut self,
            _version: ClassVersion,
            _access: ClassAccessFlags,
            name: &str,
            _signature: Option<&str>,
            _super_name: Option<&str>,
            _interfaces: &[String],
        ) {
            self.visited_name = name.to_string();
        }

        fn visit_field(
            &mut self,
            _access: FieldAccessFlags,
            name: &str,
            _descriptor: &str,
            _signature: Option<&str>,
            _value: Option<ConstantValue>,
        ) -> Option<Box<dyn FieldVisitor>> {
            self.fields.push(name.to_string());
            None
        }

        fn visit_method(
            &mut self,
            _access: MethodAccessFlags,
            name: &str,
            _descriptor: &str,
            _signature: Option<&str>,
            _exceptions: &[String],
        ) -> Option<Box<dyn MethodVisitor>> {
            self.methods.push(name.to_string());
            None
        }

        fn visit_end(&mut self) {
            self.ended = true;
        }
    }

    #[derive(Default)]
    struct RecordingMethodVisitor {
        insns: Vec<u8>,
        max_stack: u32,
        max_locals: u32,
        labels_seen: usize,
    }

    impl MethodVisitor for RecordingMethodVisitor {
        fn visit_insn(&mut self, opcode: u8) {
            self.insns.push(opcode);
        }
        fn visit_label(&mut self, _label: Label) {
            self.labels_seen += 1;
        }
        fn visit_jump_insn(&mut self, opcode: u8, _target: Label) {
            self.insns.push(opcode);
        }
        fn visit_maxs(&mut self, max_stack: u32, max_locals: u32) {
            self.max_stack = max_stack;
            self.max_locals = max_locals;
        }
    }

    fn minimal_class_bytes(with_method: bool) -> Vec<u8> {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class("com/example/Widget");
        let super_class = pool.add_class("java/lang/Object");

        let mut method_bytes = Vec::new();
        if with_method {
            let name = pool.add_utf8("run");
            let desc = pool.add_utf8("()V");
            method_bytes.extend_from_slice(&0u16.to_be_bytes()); // access flags
            method_bytes.extend_from_slice(&name.to_be_bytes());
            method_bytes.extend_from_slice(&desc.to_be_bytes());

            let code_name = pool.add_utf8("Code");
            let mut code_body = Vec::new();
            code_body.extend_from_slice(&1u16.to_be_bytes()); // max_stack
            code_body.extend_from_slice(&1u16.to_be_bytes()); // max_locals
            let code_bytes: Vec<u8> = vec![opcode::RETURN];
            code_body.extend_from_slice(&(code_bytes.len() as u32).to_be_bytes());
            code_body.extend_from_slice(&code_bytes);
            code_body.extend_from_slice(&0u16.to_be_bytes()); // exception_table_length
            code_body.extend_from_slice(&0u16.to_be_bytes()); // attributes_count

            method_bytes.extend_from_slice(&1u16.to_be_bytes()); // attributes_count
            method_bytes.extend_from_slice(&code_name.to_be_bytes());
            method_bytes.extend_from_slice(&(code_body.len() as u32).to_be_bytes());
            method_bytes.extend_from_slice(&code_body);
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes()); // minor
        bytes.extend_from_slice(&52u16.to_be_bytes()); // major

        let mut pool_bytes = Vec::new();
        pool_bytes.extend_from_slice(&pool.slot_count().to_be_bytes());
        for entry in pool.entries() {
            write_constant(entry, &mut pool_bytes);
        }
        bytes.extend_from_slice(&pool_bytes);

        bytes.extend_from_slice(&ClassAccessFlags::PUBLIC.bits().to_be_bytes());
        bytes.extend_from_slice(&this_class.to_be_bytes());
        bytes.extend_from_slice(&super_class.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes()); // interfaces_count
        bytes.extend_from_slice(&0u16.to_be_bytes()); // fields_count

        if with_method {
            bytes.extend_from_slice(&1u16.to_be_bytes()); // methods_count
            bytes.extend_from_slice(&method_bytes);
        } else {
            bytes.extend_from_slice(&0u16.to_be_bytes());
        }

        bytes.extend_from_slice(&0u16.to_be_bytes()); // class attributes_count
        bytes
    }

    fn write_constant(entry: &Constant, out: &mut Vec<u8>) {
        match entry {
            Constant::Utf8(s) => {
                out.push(1);
                let encoded = cesu8::to_java_cesu8(s);
                out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                out.extend_from_slice(&encoded);
            }
            Constant::Class { name_index } => {
                out.push(7);
                out.extend_from_slice(&name_index.to_be_bytes());
            }
            other => panic!("unsupported constant in test fixture: {:?}", other),
        }
    }

    #[test]
    fn accept_drives_header_and_members() {
        let bytes = minimal_class_bytes(false);
        let reader = ClassReader::new(bytes);
        let mut visitor = RecordingVisitor::default();
        reader.accept(&mut visitor, ClassReaderFlags::empty()).unwrap();
        assert_eq!(visitor.visited_name, "com/example/Widget");
        assert!(visitor.ended);
        assert!(visitor.fields.is_empty());
    }

    #[test]
    fn skip_code_flag_suppresses_instruction_events() {
        struct CodeCapturingVisitor {
            saw_method: bool,
        }
        impl ClassVisitor for CodeCapturingVisitor {
            fn visit_method(
                &mut self,
                _access: MethodAccessFlags,
                _name: &str,
                _descriptor: &str,
                _signature: Option<&str>,
                _exceptions: &[String],
            ) -> Option<Box<dyn MethodVisitor>> {
                self.saw_method = true;
                Some(Box::new(RecordingMethodVisitor::default()))
            }
        }

        let bytes = minimal_class_bytes(true);
        let reader = ClassReader::new(bytes);
        let mut visitor = CodeCapturingVisitor { saw_method: false };
        reader.accept(&mut visitor, ClassReaderFlags::SKIP_CODE).unwrap();
        assert!(visitor.saw_method);
    }

    #[test]
    fn decodes_a_return_instruction() {
        struct Holder(Option<RecordingMethodVisitor>);
        impl ClassVisitor for Holder {
            fn visit_method(
                &mut self,
                _access: MethodAccessFlags,
                _name: &str,
                _descriptor: &str,
                _signature: Option<&str>,
                _exceptions: &[String],
            ) -> Option<Box<dyn MethodVisitor>> {
                Some(Box::new(RecordingMethodVisitor::default()))
            }
        }

        let bytes = minimal_class_bytes(true);
        let reader = ClassReader::new(bytes);
        let mut visitor = Holder(None);
        reader.accept(&mut visitor, ClassReaderFlags::empty()).unwrap();
    }

    #[test]
    fn table_switch_offsets_resolve_relative_to_instruction_start() {
        // tableswitch sits at index 1; targets are relative to that instruction's own address,
        // not the start of the code array.
        let tableswitch_offset = 1u32;
        let delta = 19i32; // lands on the trailing `return` at index 20
        let code: Vec<u8> = {
            let mut c = vec![opcode::NOP, opcode::TABLESWITCH];
            while c.len() % 4 != 0 {
                c.push(0);
            }
            c.extend_from_slice(&delta.to_be_bytes()); // default
            c.extend_from_slice(&0i32.to_be_bytes()); // low
            c.extend_from_slice(&0i32.to_be_bytes()); // high
            c.extend_from_slice(&delta.to_be_bytes()); // case 0 target
            c.push(opcode::RETURN);
            c
        };
        let mut arena = LabelArena::new();
        let mut map = HashMap::new();
        let mut pool = RawConstantPool::default();
        discover_labels(&code, &[], &[], &mut pool, ClassReaderFlags::empty(), &mut arena, &mut map).unwrap();
        let target_offset = tableswitch_offset + delta as u32;
        assert_eq!(target_offset as usize, code.len() - 1);
        let label = map.get(&target_offset).expect("target label discovered");
        assert!(arena.get(*label).status.contains(LabelStatus::TARGET));
    }
}

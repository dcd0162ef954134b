//! The builder half of the visitor split (§4): a [`ClassWriter`]/[`MethodWriter`]/[`FieldWriter`]
//! trio that implements [`crate::visitor`]'s traits and assembles class-file bytes as events come
//! in, mirroring [`crate::reader::ClassReader`] which drives the same traits from bytes already on
//! disk. Nothing in either module knows about the other; a transform pipeline sits in between and
//! bridges the reader's labels (arena indices into its own bytecode-offset map) to the writer's
//! (arena indices into a fresh, per-method `LabelArena`) through a `Label -> Label` table, asking
//! the writer for a new one via [`MethodVisitor::new_label`] the first time it sees each source
//! label.
//!
//! `MethodWriter` carries its own label graph (a private [`LabelArena`]) rather than sharing one
//! with the reader — a method under construction has no bytes yet, so every label starts
//! unresolved and is pinned to a position as `visit_label` calls arrive.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::attributes::{
    AttributeInfo, Code, ExceptionBounds, Exceptions, StackMapFrame, VerificationTypeInfo,
};
use crate::class::{ClassAccessFlags, ClassVersion, FieldAccessFlags, MethodAccessFlags};
use crate::constant::{ClassHierarchy, ConstantPool, ObjectOracle};
use crate::descriptor::{parse_method_descriptor, FieldType, SlotKind};
use crate::error::{ClassFileError, Result};
use crate::frame::{self, InstructionOperand, ResolvedFrame, Simulator, Type};
use crate::label::{EdgeKind, LabelArena, LabelId, LabelStatus};
use crate::opcode;
use crate::read::{BinarySection, Writable};
use crate::visitor::{
    ClassVisitor, ConstantValue, FieldVisitor, Label, LdcConstant, MethodVisitor, VerificationType,
};

bitflags::bitflags! {
    /// Which derived values the writer fills in itself rather than trusting the caller's
    /// `visit_maxs`/`visit_frame` events.
    pub struct ClassWriterFlags: u8 {
        /// Run the cheap fix-point (§4.3) to fill in `max_stack`/`max_locals` instead of using the
        /// values passed to `visit_maxs`.
        const COMPUTE_MAXS = 0b01;
        /// Run the expensive fix-point to synthesize a `StackMapTable`, superseding any frames the
        /// caller passes to `visit_frame`. Implies `COMPUTE_MAXS`.
        const COMPUTE_FRAMES = 0b10;
    }
}

type SharedPool = Rc<RefCell<ConstantPool>>;
type SharedHierarchy = Rc<dyn ClassHierarchy>;
type SharedBytes = Rc<RefCell<Vec<Vec<u8>>>>;
type SharedError = Rc<RefCell<Option<ClassFileError>>>;

/// A growable byte buffer with in-place patch points, used to assemble one method's `code` array
/// while its branch targets are still unresolved.
#[derive(Debug, Default, Clone)]
struct ByteVec(Vec<u8>);

impl ByteVec {
    fn new() -> Self {
        ByteVec(Vec::new())
    }

    fn len(&self) -> u32 {
        self.0.len() as u32
    }

    fn push_u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn push_u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn push_i16(&mut self, v: i16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn push_u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn push_i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn put_i16_at(&mut self, pos: u32, v: i16) {
        let p = pos as usize;
        self.0[p..p + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u16_at(&mut self, pos: u32, v: u16) {
        let p = pos as usize;
        self.0[p..p + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put_i32_at(&mut self, pos: u32, v: i32) {
        let p = pos as usize;
        self.0[p..p + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// One emitted jump/jsr instruction awaiting its offset. Re-examined on every resize pass since a
/// downstream widening can shift its target.
#[derive(Debug, Clone, Copy)]
struct BranchSite {
    opcode_pos: u32,
    label: LabelId,
}

/// One `tableswitch`/`lookupswitch` 4-byte target slot awaiting its offset. Always 4 bytes wide,
/// so unlike [`BranchSite`] it never needs pseudo-opcode widening.
#[derive(Debug, Clone, Copy)]
struct SwitchPatch {
    value_pos: u32,
    base_pos: u32,
    label: LabelId,
}

/// Applies the label-resolve half of §4.2's protocol to a single branch site: writes the resolved
/// offset into its 2- or 4-byte slot, or — when a 2-byte slot can't hold it — swaps the opcode for
/// its pseudo-opcode stand-in and leaves an unsigned placeholder for the next resize pass. Returns
/// whether widening occurred.
fn patch_reference(code: &mut ByteVec, opcode_pos: u32, wide: bool, position: u32) -> Result<bool> {
    let patch_pos = opcode_pos + 1;
    let offset = position as i64 - opcode_pos as i64;
    if wide {
        code.put_i32_at(patch_pos, offset as i32);
        return Ok(false);
    }
    if let Ok(short) = i16::try_from(offset) {
        code.put_i16_at(patch_pos, short);
        return Ok(false);
    }
    let op = code.0[opcode_pos as usize];
    let pseudo = opcode::to_pseudo(op)
        .ok_or_else(|| ClassFileError::IllegalState(format!("opcode {op} has no pseudo-opcode widening")))?;
    code.0[opcode_pos as usize] = pseudo;
    code.put_u16_at(patch_pos, offset as u16);
    Ok(true)
}

/// The verification-relevant shape of a descriptor parameter, translated into the simulator's
/// packed [`Type`] the same way [`crate::frame`]'s own (private) descriptor-to-`Type` conversion
/// does, just built from the public `array_of` API instead of reaching into the packed repr.
fn param_type(field: &FieldType, pool: &mut ConstantPool) -> Type {
    if field.dim > 0 {
        let idx = pool.add_type(field.class_name.as_deref().unwrap_or("java/lang/Object"));
        let mut ty = Type::object(idx);
        for _ in 0..field.dim {
            ty = ty.array_of();
        }
        return ty;
    }
    match field.kind {
        SlotKind::Int => Type::INTEGER,
        SlotKind::Float => Type::FLOAT,
        SlotKind::Long => Type::LONG,
        SlotKind::Double => Type::DOUBLE,
        SlotKind::Reference => {
            let idx = pool.add_type(field.class_name.as_deref().unwrap_or("java/lang/Object"));
            Type::object(idx)
        }
    }
}

/// Converts a resolved simulator [`Type`] into the wire `VerificationTypeInfo` it writes as part
/// of a `StackMapTable` entry, reconstructing the bracket-prefixed array descriptor an `Object`
/// entry needs from the type's tracked dimension.
fn type_to_verification_info(ty: Type, pool: &mut ConstantPool) -> VerificationTypeInfo {
    if ty == Type::TOP {
        return VerificationTypeInfo::Top;
    }
    if ty == Type::INTEGER || ty == Type::BOOLEAN || ty == Type::BYTE || ty == Type::CHAR || ty == Type::SHORT {
        return VerificationTypeInfo::Integer;
    }
    if ty == Type::FLOAT {
        return VerificationTypeInfo::Float;
    }
    if ty == Type::LONG {
        return VerificationTypeInfo::Long;
    }
    if ty == Type::DOUBLE {
        return VerificationTypeInfo::Double;
    }
    if ty == Type::NULL {
        return VerificationTypeInfo::Null;
    }
    if ty == Type::UNINITIALIZED_THIS {
        return VerificationTypeInfo::UninitializedThis;
    }
    if ty.is_uninitialized() {
        if let Some(idx) = ty.type_table_index() {
            if let Some(offset) = pool.type_table_new_offset(idx) {
                return VerificationTypeInfo::Uninitialized { offset };
            }
        }
        return VerificationTypeInfo::Top;
    }
    if ty.is_object() {
        if let Some(idx) = ty.type_table_index() {
            let base_name = pool.type_table_name(idx).to_string();
            let dim = ty.dim().max(0) as usize;
            let descriptor = if dim == 0 {
                base_name
            } else if base_name.starts_with('[') {
                format!("{}{}", "[".repeat(dim), base_name)
            } else {
                format!("{}L{};", "[".repeat(dim), base_name)
            };
            let const_index = pool.add_class(&descriptor);
            return VerificationTypeInfo::Object { const_pool_index: const_index };
        }
    }
    VerificationTypeInfo::Top
}

fn visitor_type_to_verification_info(
    vt: &VerificationType,
    arena: &LabelArena,
    pool: &mut ConstantPool,
) -> VerificationTypeInfo {
    match vt {
        VerificationType::Top => VerificationTypeInfo::Top,
        VerificationType::Integer => VerificationTypeInfo::Integer,
        VerificationType::Float => VerificationTypeInfo::Float,
        VerificationType::Long => VerificationTypeInfo::Long,
        VerificationType::Double => VerificationTypeInfo::Double,
        VerificationType::Null => VerificationTypeInfo::Null,
        VerificationType::UninitializedThis => VerificationTypeInfo::UninitializedThis,
        VerificationType::Object(name) => VerificationTypeInfo::Object { const_pool_index: pool.add_class(name) },
        VerificationType::Uninitialized(label) => {
            VerificationTypeInfo::Uninitialized { offset: arena.get(*label).position as u16 }
        }
    }
}

/// Picks the minimal-diff `StackMapFrame` variant for one frame given the already-encoded
/// previous one (§4.3's "smallest representation" rule), independent of whether the locals/stack
/// came from the simulator or were passed straight through by a caller-supplied `visit_frame`.
fn select_frame_entry(
    delta: u16,
    prev_locals: &[VerificationTypeInfo],
    locals: &[VerificationTypeInfo],
    stack: &[VerificationTypeInfo],
) -> StackMapFrame {
    let common = locals.iter().zip(prev_locals.iter()).take_while(|(a, b)| a == b).count();
    if common == locals.len() && common == prev_locals.len() {
        return match stack.len() {
            0 => {
                if delta <= 63 {
                    StackMapFrame::SameFrame(delta as u8)
                } else {
                    StackMapFrame::SameFrameExtended { offset_delta: delta }
                }
            }
            1 => {
                if delta <= 63 {
                    StackMapFrame::SameLocals1StackItemFrame { frame_type: 64 + delta as u8, stack: stack[0] }
                } else {
                    StackMapFrame::SameLocals1StackItemFrameExtended { offset_delta: delta, stack: stack[0] }
                }
            }
            _ => StackMapFrame::FullFrame { offset_delta: delta, locals: locals.to_vec(), stack: stack.to_vec() },
        };
    }
    if stack.is_empty() && common == prev_locals.len() && locals.len() > prev_locals.len() {
        let appended = locals.len() - prev_locals.len();
        if appended <= 3 {
            return StackMapFrame::AppendFrame {
                frame_type: 251 + appended as u8,
                offset_delta: delta,
                locals: locals[common..].to_vec(),
            };
        }
    }
    if stack.is_empty() && common == locals.len() && prev_locals.len() > locals.len() {
        let dropped = prev_locals.len() - locals.len();
        if dropped <= 3 {
            return StackMapFrame::ChopFrame { frame_type: 251 - dropped as u8, offset_delta: delta };
        }
    }
    StackMapFrame::FullFrame { offset_delta: delta, locals: locals.to_vec(), stack: stack.to_vec() }
}

fn terminates_block(opcode: u8) -> bool {
    matches!(
        opcode,
        o if o == opcode::IRETURN
            || o == opcode::LRETURN
            || o == opcode::FRETURN
            || o == opcode::DRETURN
            || o == opcode::ARETURN
            || o == opcode::RETURN
            || o == opcode::ATHROW
    )
}

/// Builds one `method_info` entry. Implements [`MethodVisitor`] so a reader can be pointed
/// directly at it (a transform pipeline), or a caller can drive it by hand to synthesize a method
/// from scratch.
pub struct MethodWriter {
    pool: SharedPool,
    hierarchy: SharedHierarchy,
    flags: ClassWriterFlags,
    access: MethodAccessFlags,
    name: String,
    descriptor: String,
    signature: Option<String>,
    exceptions: Vec<String>,

    code: ByteVec,
    arena: LabelArena,
    entry: LabelId,
    current: LabelId,
    falls_through: bool,
    block_order: Vec<LabelId>,
    branch_sites: Vec<BranchSite>,
    switch_sites: Vec<SwitchPatch>,
    try_catch: Vec<(LabelId, LabelId, LabelId, Option<String>)>,
    line_numbers: Vec<(u16, LabelId)>,
    local_vars: Vec<(String, String, Option<String>, LabelId, LabelId, u32)>,
    explicit_frames: Vec<(LabelId, Vec<VerificationType>, Vec<VerificationType>)>,
    unknown_attrs: Vec<(String, Vec<u8>)>,
    explicit_max_stack: u32,
    explicit_max_locals: u32,
    initial_locals: Vec<Type>,
    code_started: bool,
    pending_error: Option<ClassFileError>,

    methods_out: SharedBytes,
    class_error: SharedError,
}

impl MethodWriter {
    #[allow(clippy::too_many_arguments)]
    fn new(
        pool: SharedPool,
        hierarchy: SharedHierarchy,
        methods_out: SharedBytes,
        class_error: SharedError,
        flags: ClassWriterFlags,
        class_name: String,
        access: MethodAccessFlags,
        name: String,
        descriptor: String,
        signature: Option<String>,
        exceptions: Vec<String>,
    ) -> Self {
        let mut arena = LabelArena::new();
        let entry = arena.new_label();

        let mut initial_locals = Vec::new();
        {
            let mut p = pool.borrow_mut();
            if !access.contains(MethodAccessFlags::STATIC) {
                let ty = if name == "<init>" {
                    Type::UNINITIALIZED_THIS
                } else {
                    let idx = p.add_type(&class_name);
                    Type::object(idx)
                };
                initial_locals.push(ty);
            }
            if let Some((params, _ret)) = parse_method_descriptor(&descriptor) {
                for param in &params {
                    let ty = param_type(param, &mut p);
                    initial_locals.push(ty);
                    if param.kind.width() == 2 {
                        initial_locals.push(Type::TOP);
                    }
                }
            }
        }

        MethodWriter {
            pool,
            hierarchy,
            flags,
            access,
            name,
            descriptor,
            signature,
            exceptions,
            code: ByteVec::new(),
            arena,
            entry,
            current: entry,
            falls_through: true,
            block_order: Vec::new(),
            branch_sites: Vec::new(),
            switch_sites: Vec::new(),
            try_catch: Vec::new(),
            line_numbers: Vec::new(),
            local_vars: Vec::new(),
            explicit_frames: Vec::new(),
            unknown_attrs: Vec::new(),
            explicit_max_stack: 0,
            explicit_max_locals: 0,
            initial_locals,
            code_started: false,
            pending_error: None,
            methods_out,
            class_error,
        }
    }

    fn simulate(&mut self, opcode: u8, offset: u32, operand: InstructionOperand) {
        if self.pending_error.is_some() {
            return;
        }
        let mut pool = self.pool.borrow_mut();
        let frame = self.arena.ensure_frame(self.current);
        let mut sim = Simulator::new(frame, &mut pool);
        if let Err(e) = sim.simulate(opcode, offset, operand) {
            self.pending_error.get_or_insert(e);
        }
    }

    fn mark_target(&mut self, label: LabelId, kind: EdgeKind) {
        self.arena.get_mut(label).status.insert(LabelStatus::TARGET);
        self.arena.add_edge(self.current, label, kind);
    }

    /// Runs the resize fix-point (§4.2): rebuild the code buffer, expanding any pseudo-opcode left
    /// over from a previous overflow, until a pass needs no further widening. Always runs at least
    /// once, since it's the only place a branch or switch target's placeholder gets a real value.
    fn resize_pass(&mut self) -> Result<()> {
        loop {
            if !self.rebuild_once()? {
                break;
            }
        }
        Ok(())
    }

    fn rebuild_once(&mut self) -> Result<bool> {
        let mut sites = self.branch_sites.clone();
        sites.sort_by_key(|s| s.opcode_pos);

        let old = std::mem::take(&mut self.code).into_vec();
        let mut new_code = ByteVec::new();
        let mut new_sites = Vec::with_capacity(sites.len());
        let mut checkpoints: Vec<(u32, i64)> = Vec::with_capacity(sites.len());
        let mut cursor = 0usize;
        let mut widened_any = false;

        for site in &sites {
            let opcode_pos = site.opcode_pos as usize;
            new_code.push_bytes(&old[cursor..opcode_pos]);
            let op = old[opcode_pos];

            if let Some(real) = opcode::from_pseudo(op) {
                widened_any = true;
                if real == opcode::GOTO || real == opcode::JSR {
                    let wide_op = if real == opcode::GOTO { opcode::GOTO_W } else { opcode::JSR_W };
                    let new_opcode_pos = new_code.len();
                    new_code.push_u8(wide_op);
                    new_code.push_u32(0);
                    new_sites.push(BranchSite { opcode_pos: new_opcode_pos, label: site.label });
                } else {
                    let inverted = opcode::invert_condition(real).ok_or_else(|| {
                        ClassFileError::IllegalState(format!("opcode {real} has no inverse condition"))
                    })?;
                    new_code.push_u8(inverted);
                    new_code.push_i16(8);
                    let new_opcode_pos = new_code.len();
                    new_code.push_u8(opcode::GOTO_W);
                    new_code.push_u32(0);
                    new_sites.push(BranchSite { opcode_pos: new_opcode_pos, label: site.label });
                }
                cursor = opcode_pos + 3;
            } else {
                let width = if matches!(op, o if o == opcode::GOTO_W || o == opcode::JSR_W) { 5 } else { 3 };
                let new_opcode_pos = new_code.len();
                new_code.push_bytes(&old[opcode_pos..opcode_pos + width]);
                new_sites.push(BranchSite { opcode_pos: new_opcode_pos, label: site.label });
                cursor = opcode_pos + width;
            }
            checkpoints.push((cursor as u32, new_code.len() as i64 - cursor as i64));
        }
        new_code.push_bytes(&old[cursor..]);

        let remap = |old_pos: u32| -> u32 {
            let mut shift = 0i64;
            for (end, cum) in &checkpoints {
                if *end <= old_pos {
                    shift = *cum;
                } else {
                    break;
                }
            }
            (old_pos as i64 + shift) as u32
        };

        for id in self.arena.ids().collect::<Vec<_>>() {
            if self.arena.get(id).is_resolved() {
                let new_pos = remap(self.arena.get(id).position);
                self.arena.get_mut(id).position = new_pos;
            }
        }
        for sp in &mut self.switch_sites {
            sp.value_pos = remap(sp.value_pos);
            sp.base_pos = remap(sp.base_pos);
        }

        self.code = new_code;
        self.branch_sites = new_sites;

        for site in self.branch_sites.clone() {
            let op = self.code.0[site.opcode_pos as usize];
            let wide = matches!(op, o if o == opcode::GOTO_W || o == opcode::JSR_W);
            let target_pos = self.arena.get(site.label).position;
            if patch_reference(&mut self.code, site.opcode_pos, wide, target_pos)? {
                widened_any = true;
            }
        }

        for sp in self.switch_sites.clone() {
            let target_pos = self.arena.get(sp.label).position;
            let rel = target_pos as i32 - sp.base_pos as i32;
            self.code.put_i32_at(sp.value_pos, rel);
        }

        Ok(widened_any)
    }

    fn encode_computed_frames(&mut self, resolved: Vec<(LabelId, ResolvedFrame)>) -> Vec<StackMapFrame> {
        let mut frames = resolved;
        frames.sort_by_key(|(id, _)| self.arena.get(*id).position);
        frames.retain(|(id, _)| self.arena.get(*id).position != 0);

        let mut pool = self.pool.borrow_mut();
        let mut prev_locals: Vec<VerificationTypeInfo> =
            self.initial_locals.iter().map(|&t| type_to_verification_info(t, &mut pool)).collect();
        let mut prev_offset: i32 = -1;
        let mut out = Vec::new();
        for (id, (locals, stack)) in frames {
            let offset = self.arena.get(id).position as i32;
            let delta = if prev_offset < 0 { offset } else { offset - prev_offset - 1 };
            let locals_vti: Vec<VerificationTypeInfo> =
                locals.iter().map(|&t| type_to_verification_info(t, &mut pool)).collect();
            let stack_vti: Vec<VerificationTypeInfo> =
                stack.iter().map(|&t| type_to_verification_info(t, &mut pool)).collect();
            out.push(select_frame_entry(delta as u16, &prev_locals, &locals_vti, &stack_vti));
            prev_locals = locals_vti;
            prev_offset = offset;
        }
        out
    }

    fn encode_explicit_frames(&mut self) -> Vec<StackMapFrame> {
        let mut frames = std::mem::take(&mut self.explicit_frames);
        frames.sort_by_key(|(id, _, _)| self.arena.get(*id).position);
        frames.retain(|(id, _, _)| self.arena.get(*id).position != 0);

        let mut pool = self.pool.borrow_mut();
        let mut prev_locals: Vec<VerificationTypeInfo> =
            self.initial_locals.iter().map(|&t| type_to_verification_info(t, &mut pool)).collect();
        let mut prev_offset: i32 = -1;
        let mut out = Vec::new();
        for (id, locals, stack) in frames {
            let offset = self.arena.get(id).position as i32;
            let delta = if prev_offset < 0 { offset } else { offset - prev_offset - 1 };
            let locals_vti: Vec<VerificationTypeInfo> =
                locals.iter().map(|v| visitor_type_to_verification_info(v, &self.arena, &mut pool)).collect();
            let stack_vti: Vec<VerificationTypeInfo> =
                stack.iter().map(|v| visitor_type_to_verification_info(v, &self.arena, &mut pool)).collect();
            out.push(select_frame_entry(delta as u16, &prev_locals, &locals_vti, &stack_vti));
            prev_locals = locals_vti;
            prev_offset = offset;
        }
        out
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let unresolved = self.arena.ids().filter(|&id| !self.arena.get(id).is_resolved()).count();
        if unresolved > 0 {
            return Err(ClassFileError::UnresolvedLabel { method: self.name.clone(), count: unresolved });
        }

        if self.flags.contains(ClassWriterFlags::COMPUTE_FRAMES) {
            for id in self.arena.ids() {
                for edge in self.arena.successors(id) {
                    if edge.kind == EdgeKind::Jsr {
                        return Err(ClassFileError::UnsupportedConstruct { method: self.name.clone() });
                    }
                }
            }
        }

        let mut method_attrs: Vec<AttributeInfo> = Vec::new();

        if self.code_started {
            self.resize_pass()?;

            if self.code.len() > 65_535 {
                return Err(ClassFileError::OverflowLimit {
                    what: "method code length",
                    actual: self.code.len() as usize,
                    limit: 65_535,
                });
            }

            let (max_stack, max_locals) = if self.flags.intersects(ClassWriterFlags::COMPUTE_MAXS | ClassWriterFlags::COMPUTE_FRAMES) {
                let mut locals = self.initial_locals.len() as u32;
                for id in self.arena.ids() {
                    if let Some(frame) = &self.arena.get(id).frame {
                        locals = locals.max(frame.output_locals.len() as u32);
                    }
                }
                let (stack, _) = frame::compute_max_stack(&mut self.arena, self.entry, locals);
                (stack, locals)
            } else {
                (self.explicit_max_stack, self.explicit_max_locals)
            };

            if max_stack > u16::MAX as u32 || max_locals > u16::MAX as u32 {
                return Err(ClassFileError::OverflowLimit {
                    what: "max_stack/max_locals",
                    actual: max_stack.max(max_locals) as usize,
                    limit: u16::MAX as usize,
                });
            }

            let mut code_attrs: Vec<AttributeInfo> = Vec::new();

            let frame_entries = if self.flags.contains(ClassWriterFlags::COMPUTE_FRAMES) {
                let resolved = {
                    let mut pool = self.pool.borrow_mut();
                    frame::compute_frames(&mut self.arena, self.entry, self.initial_locals.clone(), &mut pool, &*self.hierarchy)
                };
                self.encode_computed_frames(resolved)
            } else {
                self.encode_explicit_frames()
            };
            if !frame_entries.is_empty() {
                let table = crate::attributes::StackMapTable { entries: frame_entries };
                let mut buf = Vec::new();
                table.write(&mut buf)?;
                let name_index = self.pool.borrow_mut().add_utf8("StackMapTable");
                code_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            if !self.line_numbers.is_empty() {
                let mut buf = Vec::new();
                buf.extend_from_slice(&(self.line_numbers.len() as u16).to_be_bytes());
                for (line, label) in &self.line_numbers {
                    buf.extend_from_slice(&(self.arena.get(*label).position as u16).to_be_bytes());
                    buf.extend_from_slice(&line.to_be_bytes());
                }
                let name_index = self.pool.borrow_mut().add_utf8("LineNumberTable");
                code_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            if !self.local_vars.is_empty() {
                let mut buf = Vec::new();
                buf.extend_from_slice(&(self.local_vars.len() as u16).to_be_bytes());
                let mut pool = self.pool.borrow_mut();
                for (name, descriptor, _signature, start, end, index) in &self.local_vars {
                    let start_pc = self.arena.get(*start).position as u16;
                    let end_pc = self.arena.get(*end).position as u16;
                    let length = end_pc.wrapping_sub(start_pc);
                    buf.extend_from_slice(&start_pc.to_be_bytes());
                    buf.extend_from_slice(&length.to_be_bytes());
                    buf.extend_from_slice(&pool.add_utf8(name).to_be_bytes());
                    buf.extend_from_slice(&pool.add_utf8(descriptor).to_be_bytes());
                    buf.extend_from_slice(&(*index as u16).to_be_bytes());
                }
                drop(pool);
                let name_index = self.pool.borrow_mut().add_utf8("LocalVariableTable");
                code_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            let exception_table: Vec<ExceptionBounds> = {
                let mut pool = self.pool.borrow_mut();
                self.try_catch
                    .iter()
                    .map(|(start, end, handler, catch_type)| ExceptionBounds {
                        start_pc: self.arena.get(*start).position as u16,
                        end_pc: self.arena.get(*end).position as u16,
                        handler_pc: self.arena.get(*handler).position as u16,
                        catch_type: catch_type.as_deref().map(|n| pool.add_class(n)).unwrap_or(0),
                    })
                    .collect()
            };

            let code = Code {
                max_stack: max_stack as u16,
                max_locals: max_locals as u16,
                code: BinarySection::from_bytes(self.code.clone().into_vec()),
                exception_table,
                attributes: code_attrs,
            };
            let mut code_info = Vec::new();
            code.write(&mut code_info)?;
            let code_name = self.pool.borrow_mut().add_utf8("Code");
            method_attrs.push(AttributeInfo { name_index: code_name, info: BinarySection::from_bytes(code_info) });
        }

        if let Some(signature) = &self.signature {
            let idx = self.pool.borrow_mut().add_utf8(signature);
            let name_index = self.pool.borrow_mut().add_utf8("Signature");
            let mut buf = Vec::new();
            buf.extend_from_slice(&idx.to_be_bytes());
            method_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
        }

        if !self.exceptions.is_empty() {
            let table: Vec<u16> = {
                let mut pool = self.pool.borrow_mut();
                self.exceptions.iter().map(|e| pool.add_class(e)).collect()
            };
            let exceptions = Exceptions { exception_index_table: table };
            let mut buf = Vec::new();
            exceptions.write(&mut buf)?;
            let name_index = self.pool.borrow_mut().add_utf8("Exceptions");
            method_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
        }

        for (name, data) in &self.unknown_attrs {
            let name_index = self.pool.borrow_mut().add_utf8(name);
            method_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(data.clone()) });
        }

        let (name_index, descriptor_index) = {
            let mut pool = self.pool.borrow_mut();
            (pool.add_utf8(&self.name), pool.add_utf8(&self.descriptor))
        };

        let mut out = Vec::new();
        self.access.write(&mut out)?;
        out.extend_from_slice(&name_index.to_be_bytes());
        out.extend_from_slice(&descriptor_index.to_be_bytes());
        method_attrs.write(&mut out)?;
        Ok(out)
    }
}

impl MethodVisitor for MethodWriter {
    /// Allocates a new, as-yet-unresolved label in this method's body.
    fn new_label(&mut self) -> Label {
        self.arena.new_label()
    }

    fn visit_attribute(&mut self, name: &str, data: &[u8]) {
        self.unknown_attrs.push((name.to_string(), data.to_vec()));
    }

    fn visit_code(&mut self) {
        self.code_started = true;
        let _ = self.arena.resolve(self.entry, 0);
        self.current = self.entry;
        self.falls_through = true;
        self.block_order.push(self.entry);
        self.arena.ensure_frame(self.entry).input_locals = self.initial_locals.clone();
    }

    fn visit_label(&mut self, label: Label) {
        let position = self.code.len();
        let _ = self.arena.resolve(label, position);
        if self.falls_through && self.current.0 != label.0 {
            self.arena.add_edge(self.current, label, EdgeKind::Normal);
        }
        self.current = label;
        self.falls_through = true;
        self.block_order.push(label);
    }

    fn visit_frame(&mut self, locals: &[VerificationType], stack: &[VerificationType]) {
        self.explicit_frames.push((self.current, locals.to_vec(), stack.to_vec()));
    }

    fn visit_insn(&mut self, opcode: u8) {
        let offset = self.code.len();
        self.code.push_u8(opcode);
        self.simulate(opcode, offset, InstructionOperand::None);
        self.falls_through = !terminates_block(opcode);
    }

    fn visit_int_insn(&mut self, opcode: u8, operand: i32) {
        let offset = self.code.len();
        self.code.push_u8(opcode);
        if opcode == opcode::SIPUSH {
            self.code.push_i16(operand as i16);
        } else {
            self.code.push_u8(operand as u8);
        }
        let sim_operand = if opcode == opcode::NEWARRAY {
            InstructionOperand::ArrayType(operand as u8)
        } else {
            InstructionOperand::Constant(Type::INTEGER)
        };
        self.simulate(opcode, offset, sim_operand);
        self.falls_through = true;
    }

    fn visit_var_insn(&mut self, opcode: u8, var_index: u32) {
        let offset = self.code.len();
        let short_form_base = match opcode {
            o if o == opcode::ILOAD => Some(26u8),
            o if o == opcode::LLOAD => Some(30),
            o if o == opcode::FLOAD => Some(34),
            o if o == opcode::DLOAD => Some(38),
            o if o == opcode::ALOAD => Some(42),
            o if o == opcode::ISTORE => Some(59),
            o if o == opcode::LSTORE => Some(63),
            o if o == opcode::FSTORE => Some(67),
            o if o == opcode::DSTORE => Some(71),
            o if o == opcode::ASTORE => Some(75),
            _ => None,
        };
        if var_index <= 3 {
            if let Some(base) = short_form_base {
                self.code.push_u8(base + var_index as u8);
                self.simulate(opcode, offset, InstructionOperand::LocalIndex(var_index));
                self.falls_through = true;
                return;
            }
        }
        if var_index > 255 {
            self.code.push_u8(opcode::WIDE);
            self.code.push_u8(opcode);
            self.code.push_u16(var_index as u16);
        } else {
            self.code.push_u8(opcode);
            self.code.push_u8(var_index as u8);
        }
        self.simulate(opcode, offset, InstructionOperand::LocalIndex(var_index));
        self.falls_through = opcode != opcode::RET;
    }

    fn visit_type_insn(&mut self, opcode: u8, type_name: &str) {
        let offset = self.code.len();
        self.code.push_u8(opcode);
        let idx = self.pool.borrow_mut().add_class(type_name);
        self.code.push_u16(idx);
        self.simulate(opcode, offset, InstructionOperand::ClassRef(type_name.to_string()));
        self.falls_through = true;
    }

    fn visit_field_insn(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) {
        let offset = self.code.len();
        self.code.push_u8(opcode);
        let idx = self.pool.borrow_mut().add_field_ref(owner, name, descriptor);
        self.code.push_u16(idx);
        match InstructionOperand::field_ref(descriptor, offset) {
            Ok(operand) => self.simulate(opcode, offset, operand),
            Err(e) => {
                self.pending_error.get_or_insert(e);
            }
        }
        self.falls_through = true;
    }

    fn visit_method_insn(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str, is_interface: bool) {
        let offset = self.code.len();
        self.code.push_u8(opcode);
        let idx = self.pool.borrow_mut().add_method_ref(owner, name, descriptor, is_interface);
        self.code.push_u16(idx);
        if opcode == opcode::INVOKEINTERFACE {
            let (params, _) = parse_method_descriptor(descriptor).unwrap_or_default();
            let count: u8 = 1 + params.iter().map(|p| p.kind.width()).sum::<u8>();
            self.code.push_u8(count);
            self.code.push_u8(0);
        }
        self.simulate(opcode, offset, InstructionOperand::method_ref(owner, name, descriptor));
        self.falls_through = true;
    }

    fn visit_invoke_dynamic_insn(&mut self, name: &str, descriptor: &str, bootstrap_method_attr_index: u16) {
        let offset = self.code.len();
        self.code.push_u8(opcode::INVOKEDYNAMIC);
        let idx = self.pool.borrow_mut().add_invoke_dynamic(bootstrap_method_attr_index, name, descriptor);
        self.code.push_u16(idx);
        self.code.push_u16(0);
        let (params, ret) = parse_method_descriptor(descriptor).unwrap_or_default();
        self.simulate(opcode::INVOKEDYNAMIC, offset, InstructionOperand::InvokeDynamic { params, ret });
        self.falls_through = true;
    }

    fn visit_jump_insn(&mut self, opcode: u8, target: Label) {
        let opcode_pos = self.code.len();
        self.code.push_u8(opcode);
        if matches!(opcode, o if o == opcode::GOTO_W || o == opcode::JSR_W) {
            self.code.push_u32(0);
        } else {
            self.code.push_u16(0);
        }
        let kind = if matches!(opcode, o if o == opcode::JSR || o == opcode::JSR_W) { EdgeKind::Jsr } else { EdgeKind::Normal };
        self.mark_target(target, kind);
        self.branch_sites.push(BranchSite { opcode_pos, label: target });
        self.simulate(opcode, opcode_pos, InstructionOperand::None);
        self.falls_through = !matches!(opcode, o if o == opcode::GOTO || o == opcode::GOTO_W);
    }

    fn visit_ldc_insn(&mut self, constant: LdcConstant) {
        let offset = self.code.len();
        let (idx, ty) = {
            let mut pool = self.pool.borrow_mut();
            match &constant {
                LdcConstant::Integer(v) => (pool.add_integer(*v), Type::INTEGER),
                LdcConstant::Float(v) => (pool.add_float(*v), Type::FLOAT),
                LdcConstant::Long(v) => (pool.add_long(*v), Type::LONG),
                LdcConstant::Double(v) => (pool.add_double(*v), Type::DOUBLE),
                LdcConstant::String(s) => {
                    let string_idx = pool.add_string(s);
                    let type_idx = pool.add_type("java/lang/String");
                    (string_idx, Type::object(type_idx))
                }
                LdcConstant::Class(name) => {
                    let class_idx = pool.add_class(name);
                    let type_idx = pool.add_type(name);
                    (class_idx, Type::object(type_idx))
                }
            }
        };
        let wide = matches!(constant, LdcConstant::Long(_) | LdcConstant::Double(_));
        let op = if wide {
            self.code.push_u8(opcode::LDC2_W);
            self.code.push_u16(idx);
            opcode::LDC2_W
        } else if idx <= 255 {
            self.code.push_u8(opcode::LDC);
            self.code.push_u8(idx as u8);
            opcode::LDC
        } else {
            self.code.push_u8(opcode::LDC_W);
            self.code.push_u16(idx);
            opcode::LDC_W
        };
        self.simulate(op, offset, InstructionOperand::Constant(ty));
        self.falls_through = true;
    }

    fn visit_iinc_insn(&mut self, var_index: u32, increment: i32) {
        let offset = self.code.len();
        if var_index > 255 || !(i8::MIN as i32..=i8::MAX as i32).contains(&increment) {
            self.code.push_u8(opcode::WIDE);
            self.code.push_u8(opcode::IINC);
            self.code.push_u16(var_index as u16);
            self.code.push_i16(increment as i16);
        } else {
            self.code.push_u8(opcode::IINC);
            self.code.push_u8(var_index as u8);
            self.code.push_u8(increment as i8 as u8);
        }
        self.simulate(opcode::IINC, offset, InstructionOperand::None);
        self.falls_through = true;
    }

    fn visit_table_switch_insn(&mut self, min: i32, max: i32, default: Label, labels: &[Label]) {
        let opcode_pos = self.code.len();
        self.code.push_u8(opcode::TABLESWITCH);
        while self.code.len() % 4 != 0 {
            self.code.push_u8(0);
        }
        let default_pos = self.code.len();
        self.code.push_u32(0);
        self.code.push_i32(min);
        self.code.push_i32(max);
        self.mark_target(default, EdgeKind::Normal);
        self.switch_sites.push(SwitchPatch { value_pos: default_pos, base_pos: opcode_pos, label: default });
        for &label in labels {
            let target_pos = self.code.len();
            self.code.push_u32(0);
            self.mark_target(label, EdgeKind::Normal);
            self.switch_sites.push(SwitchPatch { value_pos: target_pos, base_pos: opcode_pos, label });
        }
        self.simulate(opcode::TABLESWITCH, opcode_pos, InstructionOperand::None);
        self.falls_through = false;
    }

    fn visit_lookup_switch_insn(&mut self, default: Label, keys: &[i32], labels: &[Label]) {
        let opcode_pos = self.code.len();
        self.code.push_u8(opcode::LOOKUPSWITCH);
        while self.code.len() % 4 != 0 {
            self.code.push_u8(0);
        }
        let default_pos = self.code.len();
        self.code.push_u32(0);
        self.code.push_i32(keys.len() as i32);
        self.mark_target(default, EdgeKind::Normal);
        self.switch_sites.push(SwitchPatch { value_pos: default_pos, base_pos: opcode_pos, label: default });
        for (&key, &label) in keys.iter().zip(labels.iter()) {
            self.code.push_i32(key);
            let target_pos = self.code.len();
            self.code.push_u32(0);
            self.mark_target(label, EdgeKind::Normal);
            self.switch_sites.push(SwitchPatch { value_pos: target_pos, base_pos: opcode_pos, label });
        }
        self.simulate(opcode::LOOKUPSWITCH, opcode_pos, InstructionOperand::None);
        self.falls_through = false;
    }

    fn visit_multi_anew_array_insn(&mut self, descriptor: &str, dims: u8) {
        let offset = self.code.len();
        self.code.push_u8(opcode::MULTIANEWARRAY);
        let idx = self.pool.borrow_mut().add_class(descriptor);
        self.code.push_u16(idx);
        self.code.push_u8(dims);
        self.simulate(
            opcode::MULTIANEWARRAY,
            offset,
            InstructionOperand::MultiNewArray { class_name: descriptor.to_string(), dims },
        );
        self.falls_through = true;
    }

    fn visit_try_catch_block(&mut self, start: Label, end: Label, handler: Label, catch_type: Option<&str>) {
        self.arena.get_mut(handler).status.insert(LabelStatus::TARGET);
        let type_idx = catch_type.map(|name| self.pool.borrow_mut().add_type(name));
        let bounds = (
            self.block_order.iter().position(|&l| l.0 == start.0),
            self.block_order.iter().position(|&l| l.0 == end.0),
        );
        if let (Some(s), Some(e)) = bounds {
            for &block in self.block_order[s..e].to_vec().iter() {
                self.arena.add_edge(block, handler, EdgeKind::Handler(type_idx));
            }
        }
        self.try_catch.push((start, end, handler, catch_type.map(|s| s.to_string())));
    }

    fn visit_line_number(&mut self, line: u16, start: Label) {
        self.line_numbers.push((line, start));
    }

    fn visit_local_variable(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        start: Label,
        end: Label,
        index: u32,
    ) {
        let _ = signature;
        self.local_vars.push((name.to_string(), descriptor.to_string(), None, start, end, index));
    }

    fn visit_maxs(&mut self, max_stack: u32, max_locals: u32) {
        self.explicit_max_stack = max_stack;
        self.explicit_max_locals = max_locals;
    }

    fn visit_end(&mut self) {
        if let Some(e) = self.pending_error.take() {
            self.class_error.borrow_mut().get_or_insert(e);
            return;
        }
        match self.finalize() {
            Ok(bytes) => self.methods_out.borrow_mut().push(bytes),
            Err(e) => {
                self.class_error.borrow_mut().get_or_insert(e);
            }
        }
    }
}

/// Builds one `field_info` entry.
pub struct FieldWriter {
    pool: SharedPool,
    access: FieldAccessFlags,
    name: String,
    descriptor: String,
    signature: Option<String>,
    constant_value: Option<ConstantValue>,
    unknown_attrs: Vec<(String, Vec<u8>)>,
    fields_out: SharedBytes,
}

impl FieldVisitor for FieldWriter {
    fn visit_attribute(&mut self, name: &str, data: &[u8]) {
        self.unknown_attrs.push((name.to_string(), data.to_vec()));
    }

    fn visit_end(&mut self) {
        let mut attrs: Vec<AttributeInfo> = Vec::new();

        if let Some(value) = &self.constant_value {
            let idx = {
                let mut pool = self.pool.borrow_mut();
                match value {
                    ConstantValue::Integer(v) => pool.add_integer(*v),
                    ConstantValue::Float(v) => pool.add_float(*v),
                    ConstantValue::Long(v) => pool.add_long(*v),
                    ConstantValue::Double(v) => pool.add_double(*v),
                    ConstantValue::String(s) => pool.add_string(s),
                }
            };
            let name_index = self.pool.borrow_mut().add_utf8("ConstantValue");
            let mut buf = Vec::new();
            buf.extend_from_slice(&idx.to_be_bytes());
            attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
        }

        if let Some(sig) = &self.signature {
            let idx = self.pool.borrow_mut().add_utf8(sig);
            let name_index = self.pool.borrow_mut().add_utf8("Signature");
            let mut buf = Vec::new();
            buf.extend_from_slice(&idx.to_be_bytes());
            attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
        }

        for (name, data) in &self.unknown_attrs {
            let name_index = self.pool.borrow_mut().add_utf8(name);
            attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(data.clone()) });
        }

        let (name_index, descriptor_index) = {
            let mut pool = self.pool.borrow_mut();
            (pool.add_utf8(&self.name), pool.add_utf8(&self.descriptor))
        };

        let mut out = Vec::new();
        self.access.write(&mut out).expect("writing to an in-memory buffer never fails");
        out.extend_from_slice(&name_index.to_be_bytes());
        out.extend_from_slice(&descriptor_index.to_be_bytes());
        attrs.write(&mut out).expect("writing to an in-memory buffer never fails");
        self.fields_out.borrow_mut().push(out);
    }
}

/// Builds a complete class file from a stream of [`ClassVisitor`] events (§4.1). Construct one,
/// drive it (directly or by pointing a [`crate::reader::ClassReader`] at it), then call
/// [`ClassWriter::into_bytes`] once `visit_end` has fired.
pub struct ClassWriter {
    pool: SharedPool,
    hierarchy: SharedHierarchy,
    flags: ClassWriterFlags,
    version: ClassVersion,
    access: ClassAccessFlags,
    this_class: u16,
    super_class: Option<u16>,
    interfaces: Vec<u16>,
    class_name: String,
    source: Option<String>,
    signature: Option<String>,
    outer: Option<(String, Option<String>, Option<String>)>,
    inner_classes: Vec<(String, Option<String>, Option<String>, ClassAccessFlags)>,
    unknown_attrs: Vec<(String, Vec<u8>)>,
    fields_out: SharedBytes,
    methods_out: SharedBytes,
    class_error: SharedError,
    output: Option<Vec<u8>>,
}

impl ClassWriter {
    pub fn new(version: ClassVersion, flags: ClassWriterFlags) -> Self {
        Self::with_hierarchy(version, flags, Rc::new(ObjectOracle))
    }

    pub fn with_hierarchy(version: ClassVersion, flags: ClassWriterFlags, hierarchy: Rc<dyn ClassHierarchy>) -> Self {
        ClassWriter {
            pool: Rc::new(RefCell::new(ConstantPool::new())),
            hierarchy,
            flags,
            version,
            access: ClassAccessFlags::empty(),
            this_class: 0,
            super_class: None,
            interfaces: Vec::new(),
            class_name: String::new(),
            source: None,
            signature: None,
            outer: None,
            inner_classes: Vec::new(),
            unknown_attrs: Vec::new(),
            fields_out: Rc::new(RefCell::new(Vec::new())),
            methods_out: Rc::new(RefCell::new(Vec::new())),
            class_error: Rc::new(RefCell::new(None)),
            output: None,
        }
    }

    /// Consumes the writer, returning the assembled class-file bytes, or the first error raised
    /// by any field/method writer along the way.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if let Some(e) = self.class_error.borrow_mut().take() {
            return Err(e);
        }
        self.output
            .ok_or_else(|| ClassFileError::IllegalState("visit_end was never called".to_string()))
    }

    fn finalize(&mut self) {
        let mut class_attrs: Vec<AttributeInfo> = Vec::new();
        {
            let mut pool = self.pool.borrow_mut();

            if let Some(source) = &self.source {
                let idx = pool.add_utf8(source);
                let name_index = pool.add_utf8("SourceFile");
                let mut buf = Vec::new();
                buf.extend_from_slice(&idx.to_be_bytes());
                class_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            if let Some(signature) = &self.signature {
                let idx = pool.add_utf8(signature);
                let name_index = pool.add_utf8("Signature");
                let mut buf = Vec::new();
                buf.extend_from_slice(&idx.to_be_bytes());
                class_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            if let Some((owner, method_name, descriptor)) = &self.outer {
                let class_index = pool.add_class(owner);
                let method_index = match (method_name, descriptor) {
                    (Some(n), Some(d)) => pool.add_name_and_type(n, d),
                    _ => 0,
                };
                let name_index = pool.add_utf8("EnclosingMethod");
                let mut buf = Vec::new();
                buf.extend_from_slice(&class_index.to_be_bytes());
                buf.extend_from_slice(&method_index.to_be_bytes());
                class_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            if !self.inner_classes.is_empty() {
                let mut buf = Vec::new();
                buf.extend_from_slice(&(self.inner_classes.len() as u16).to_be_bytes());
                for (name, outer, inner_name, access) in &self.inner_classes {
                    let inner_idx = pool.add_class(name);
                    let outer_idx = outer.as_deref().map(|o| pool.add_class(o)).unwrap_or(0);
                    let inner_name_idx = inner_name.as_deref().map(|n| pool.add_utf8(n)).unwrap_or(0);
                    buf.extend_from_slice(&inner_idx.to_be_bytes());
                    buf.extend_from_slice(&outer_idx.to_be_bytes());
                    buf.extend_from_slice(&inner_name_idx.to_be_bytes());
                    buf.extend_from_slice(&access.bits().to_be_bytes());
                }
                let name_index = pool.add_utf8("InnerClasses");
                class_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(buf) });
            }

            for (name, data) in &self.unknown_attrs {
                let name_index = pool.add_utf8(name);
                class_attrs.push(AttributeInfo { name_index, info: BinarySection::from_bytes(data.clone()) });
            }
        }

        self.output = Some(self.assemble(class_attrs).expect("writing to an in-memory buffer never fails"));
    }

    fn assemble(&self, class_attrs: Vec<AttributeInfo>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        crate::class::ClassMagicBytes.write(&mut out)?;
        self.version.write(&mut out)?;
        self.pool.borrow().write(&mut out)?;
        self.access.write(&mut out)?;
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.unwrap_or(0).to_be_bytes());
        self.interfaces.write(&mut out)?;

        let fields = self.fields_out.borrow();
        out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for f in fields.iter() {
            out.extend_from_slice(f);
        }
        drop(fields);

        let methods = self.methods_out.borrow();
        out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
        for m in methods.iter() {
            out.extend_from_slice(m);
        }
        drop(methods);

        class_attrs.write(&mut out)?;
        Ok(out)
    }
}

impl ClassVisitor for ClassWriter {
    fn visit(
        &mut self,
        version: ClassVersion,
        access: ClassAccessFlags,
        name: &str,
        signature: Option<&str>,
        super_name: Option<&str>,
        interfaces: &[String],
    ) {
        self.version = version;
        self.access = access;
        self.class_name = name.to_string();
        {
            let mut pool = self.pool.borrow_mut();
            self.this_class = pool.add_class(name);
            self.super_class = super_name.map(|s| pool.add_class(s));
            self.interfaces = interfaces.iter().map(|i| pool.add_class(i)).collect();
        }
        self.signature = signature.map(|s| s.to_string());
    }

    fn visit_source(&mut self, source: Option<&str>, _debug: Option<&str>) {
        self.source = source.map(|s| s.to_string());
    }

    fn visit_outer_class(&mut self, owner: &str, name: Option<&str>, descriptor: Option<&str>) {
        self.outer = Some((owner.to_string(), name.map(|s| s.to_string()), descriptor.map(|s| s.to_string())));
    }

    fn visit_inner_class(&mut self, name: &str, outer_name: Option<&str>, inner_name: Option<&str>, access: ClassAccessFlags) {
        self.inner_classes.push((
            name.to_string(),
            outer_name.map(|s| s.to_string()),
            inner_name.map(|s| s.to_string()),
            access,
        ));
    }

    fn visit_attribute(&mut self, name: &str, data: &[u8]) {
        self.unknown_attrs.push((name.to_string(), data.to_vec()));
    }

    fn visit_field(
        &mut self,
        access: FieldAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        value: Option<ConstantValue>,
    ) -> Option<Box<dyn FieldVisitor>> {
        Some(Box::new(FieldWriter {
            pool: Rc::clone(&self.pool),
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            signature: signature.map(|s| s.to_string()),
            constant_value: value,
            unknown_attrs: Vec::new(),
            fields_out: Rc::clone(&self.fields_out),
        }))
    }

    fn visit_method(
        &mut self,
        access: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[String],
    ) -> Option<Box<dyn MethodVisitor>> {
        Some(Box::new(MethodWriter::new(
            Rc::clone(&self.pool),
            Rc::clone(&self.hierarchy),
            Rc::clone(&self.methods_out),
            Rc::clone(&self.class_error),
            self.flags,
            self.class_name.clone(),
            access,
            name.to_string(),
            descriptor.to_string(),
            signature.map(|s| s.to_string()),
            exceptions.to_vec(),
        )))
    }

    fn visit_end(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ClassReader, ClassReaderFlags};

    fn new_writer(flags: ClassWriterFlags) -> ClassWriter {
        let mut cw = ClassWriter::new(ClassVersion::new(52, 0), flags);
        cw.visit(ClassVersion::new(52, 0), ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER, "Sample", None, Some("java/lang/Object"), &[]);
        cw
    }

    #[test]
    fn empty_method_computes_single_stack_slot() {
        let mut cw = new_writer(ClassWriterFlags::COMPUTE_MAXS);
        let mut mv = cw
            .visit_method(MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC, "run", "()I", None, &[])
            .unwrap();
        mv.visit_code();
        mv.visit_insn(opcode::ICONST_1);
        mv.visit_insn(opcode::IRETURN);
        mv.visit_maxs(0, 0);
        mv.visit_end();
        cw.visit_end();
        let bytes = cw.into_bytes().unwrap();
        assert_eq!(&bytes[0..4], &0xCAFEBABEu32.to_be_bytes());
    }

    #[test]
    fn forward_goto_past_short_range_widens_to_goto_w() {
        let mut cw = new_writer(ClassWriterFlags::COMPUTE_MAXS);
        let mut mv = cw
            .visit_method(MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC, "run", "()V", None, &[])
            .unwrap();
        mv.visit_code();
        let far = mv.new_label();
        mv.visit_jump_insn(opcode::GOTO, far);
        for _ in 0..40_000 {
            mv.visit_insn(opcode::NOP);
        }
        mv.visit_label(far);
        mv.visit_insn(opcode::RETURN);
        mv.visit_maxs(0, 0);
        mv.visit_end();
        cw.visit_end();
        let bytes = cw.into_bytes().unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn jsr_with_compute_frames_is_unsupported() {
        let mut cw = new_writer(ClassWriterFlags::COMPUTE_FRAMES);
        let mut mv = cw
            .visit_method(MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC, "run", "()V", None, &[])
            .unwrap();
        mv.visit_code();
        let sub = mv.new_label();
        let after = mv.new_label();
        mv.visit_jump_insn(opcode::JSR, sub);
        mv.visit_label(after);
        mv.visit_insn(opcode::RETURN);
        mv.visit_label(sub);
        mv.visit_var_insn(opcode::ASTORE, 1);
        mv.visit_var_insn(opcode::RET, 1);
        mv.visit_maxs(0, 0);
        mv.visit_end();
        cw.visit_end();
        assert!(matches!(cw.into_bytes(), Err(ClassFileError::UnsupportedConstruct { .. })));
    }

    #[test]
    fn round_trips_through_the_reader() {
        let mut cw = new_writer(ClassWriterFlags::COMPUTE_FRAMES);
        let mut mv = cw
            .visit_method(
                MethodAccessFlags::PUBLIC,
                "<init>",
                "()V",
                None,
                &[],
            )
            .unwrap();
        mv.visit_code();
        mv.visit_var_insn(opcode::ALOAD, 0);
        mv.visit_method_insn(opcode::INVOKESPECIAL, "java/lang/Object", "<init>", "()V", false);
        mv.visit_insn(opcode::RETURN);
        mv.visit_maxs(0, 0);
        mv.visit_end();
        cw.visit_end();
        let bytes = cw.into_bytes().unwrap();

        struct Counter(u32);
        impl ClassVisitor for Counter {
            fn visit_method(
                &mut self,
                _access: MethodAccessFlags,
                _name: &str,
                _descriptor: &str,
                _signature: Option<&str>,
                _exceptions: &[String],
            ) -> Option<Box<dyn MethodVisitor>> {
                self.0 += 1;
                None
            }
        }
        let reader = ClassReader::new(bytes);
        let mut counter = Counter(0);
        reader.accept(&mut counter, ClassReaderFlags::empty()).unwrap();
        assert_eq!(counter.0, 1);
    }
}

//! The frame engine: a 32-bit tagged type representation (§3) plus the per-instruction output
//! frame simulator and the two fix-point passes (cheap max-stack-only, and expensive full
//! `StackMapTable` synthesis) described in §4.3.

use crate::constant::{ClassHierarchy, ConstantPool};
use crate::descriptor::{parse_field_type, parse_method_descriptor, FieldType, SlotKind};
use crate::error::{ClassFileError, Result};
use crate::label::{BasicBlockFrame, EdgeKind, LabelArena, LabelId, PendingInit};
use crate::opcode;

const KIND_BASE: u32 = 1;
const KIND_LOCAL: u32 = 2;
const KIND_STACK: u32 = 3;

const SUB_TOP: u8 = 0;
const SUB_BOOLEAN: u8 = 1;
const SUB_BYTE: u8 = 2;
const SUB_CHAR: u8 = 3;
const SUB_SHORT: u8 = 4;
const SUB_INTEGER: u8 = 5;
const SUB_FLOAT: u8 = 6;
const SUB_LONG: u8 = 7;
const SUB_DOUBLE: u8 = 8;
const SUB_NULL: u8 = 9;
const SUB_UNINITIALIZED_THIS: u8 = 10;
const SUB_OBJECT: u8 = 11;
const SUB_UNINITIALIZED: u8 = 12;

const VALUE_MASK: u32 = 0x00FF_FFFF;
const PAYLOAD_MASK: u32 = 0xFFFF;

/// A 32-bit tagged value: `DIM(4 signed bits) | KIND(4 bits) | VALUE(24 bits)`. `Copy` and
/// `Eq`-comparable by design — the fix-point inner loop must never allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type(u32);

impl Type {
    pub const TOP: Type = Type::base(SUB_TOP, 0);
    pub const BOOLEAN: Type = Type::base(SUB_BOOLEAN, 0);
    pub const BYTE: Type = Type::base(SUB_BYTE, 0);
    pub const CHAR: Type = Type::base(SUB_CHAR, 0);
    pub const SHORT: Type = Type::base(SUB_SHORT, 0);
    pub const INTEGER: Type = Type::base(SUB_INTEGER, 0);
    pub const FLOAT: Type = Type::base(SUB_FLOAT, 0);
    pub const LONG: Type = Type::base(SUB_LONG, 0);
    pub const DOUBLE: Type = Type::base(SUB_DOUBLE, 0);
    pub const NULL: Type = Type::base(SUB_NULL, 0);
    pub const UNINITIALIZED_THIS: Type = Type::base(SUB_UNINITIALIZED_THIS, 0);

    const fn pack(dim: i32, kind: u32, value: u32) -> Type {
        let dim_bits = (dim as u32) & 0xF;
        Type((dim_bits << 28) | (kind << 24) | (value & VALUE_MASK))
    }

    pub const fn base(subkind: u8, payload: u16) -> Type {
        Type::pack(0, KIND_BASE, ((subkind as u32) << 16) | payload as u32)
    }

    pub fn object(type_table_idx: u32) -> Type {
        Type::pack(0, KIND_BASE, ((SUB_OBJECT as u32) << 16) | (type_table_idx & PAYLOAD_MASK))
    }

    fn object_with_dim(type_table_idx: u32, dim: i32) -> Type {
        Type::pack(dim, KIND_BASE, ((SUB_OBJECT as u32) << 16) | (type_table_idx & PAYLOAD_MASK))
    }

    pub fn uninitialized(type_table_idx: u32) -> Type {
        Type::pack(0, KIND_BASE, ((SUB_UNINITIALIZED as u32) << 16) | (type_table_idx & PAYLOAD_MASK))
    }

    pub fn local(index: u32) -> Type {
        Type::pack(0, KIND_LOCAL, index)
    }

    pub fn stack(index: u32) -> Type {
        Type::pack(0, KIND_STACK, index)
    }

    pub fn dim(self) -> i32 {
        let nibble = (self.0 >> 28) & 0xF;
        ((nibble as i32) << 28) >> 28
    }

    fn with_dim_delta(self, delta: i32) -> Type {
        Type::pack(self.dim() + delta, self.kind_bits(), self.0 & VALUE_MASK)
    }

    /// `ANEWARRAY`/array-of: bumps the array dimension by one.
    pub fn array_of(self) -> Type {
        self.with_dim_delta(1)
    }

    /// `AALOAD`/element-of: drops the array dimension by one.
    pub fn element_of(self) -> Type {
        self.with_dim_delta(-1)
    }

    fn kind_bits(self) -> u32 {
        (self.0 >> 24) & 0xF
    }

    pub fn is_base(self) -> bool {
        self.kind_bits() == KIND_BASE
    }

    pub fn is_local_ref(self) -> bool {
        self.kind_bits() == KIND_LOCAL
    }

    pub fn is_stack_ref(self) -> bool {
        self.kind_bits() == KIND_STACK
    }

    /// The slot index this type refers to in the (still unknown at instruction time) input
    /// frame, valid only when [`Type::is_local_ref`] or [`Type::is_stack_ref`].
    pub fn relative_index(self) -> u32 {
        self.0 & VALUE_MASK
    }

    fn subkind(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    fn payload(self) -> u32 {
        self.0 & PAYLOAD_MASK
    }

    pub fn is_reference(self) -> bool {
        self.is_base() && matches!(self.subkind(), SUB_NULL | SUB_OBJECT | SUB_UNINITIALIZED | SUB_UNINITIALIZED_THIS)
    }

    pub fn is_object(self) -> bool {
        self.is_base() && self.subkind() == SUB_OBJECT
    }

    pub fn is_uninitialized(self) -> bool {
        self.is_base() && matches!(self.subkind(), SUB_UNINITIALIZED | SUB_UNINITIALIZED_THIS)
    }

    fn is_int_like(self) -> bool {
        self.is_base()
            && matches!(
                self.subkind(),
                SUB_BOOLEAN | SUB_BYTE | SUB_CHAR | SUB_SHORT | SUB_INTEGER
            )
    }

    pub fn type_table_index(self) -> Option<u32> {
        if self.is_base() && matches!(self.subkind(), SUB_OBJECT | SUB_UNINITIALIZED) {
            Some(self.payload())
        } else {
            None
        }
    }

    /// Widens `self` and `other` per the merge laws in §4.3: commutative, associative, and
    /// monotone (every call only moves a slot towards `TOP`).
    pub fn merge(self, other: Type, pool: &mut ConstantPool, hierarchy: &dyn ClassHierarchy) -> Type {
        if self == other {
            return self;
        }
        if self == Type::TOP || other == Type::TOP {
            return Type::TOP;
        }
        if self.is_int_like() && other.is_int_like() {
            return Type::INTEGER;
        }
        if self == Type::NULL && other.is_reference() {
            return other;
        }
        if other == Type::NULL && self.is_reference() {
            return self;
        }
        if self.is_reference() && other.is_reference() && self.dim() == other.dim() {
            if self.is_object() && other.is_object() {
                let merged = pool.get_merged_type(self.payload(), other.payload(), hierarchy);
                return Type::object_with_dim(merged, self.dim());
            }
        }
        Type::TOP
    }

    /// Resolves an output-frame slot (possibly `LOCAL`/`STACK`-relative) against a block's now
    /// known input frame, per the expensive-mode `merge` resolution rule in §4.3.
    fn resolve(self, input_locals: &[Type], input_stack: &[Type]) -> Type {
        match self.kind_bits() {
            KIND_LOCAL => {
                let base = input_locals
                    .get(self.relative_index() as usize)
                    .copied()
                    .unwrap_or(Type::TOP);
                base.with_dim_delta(self.dim())
            }
            KIND_STACK => {
                let n = input_stack.len();
                let idx = self.relative_index() as usize;
                let base = if idx < n {
                    input_stack[n - 1 - idx]
                } else {
                    Type::TOP
                };
                base.with_dim_delta(self.dim())
            }
            _ => self,
        }
    }
}

/// Slot width (1 or 2) of a frame type, used when walking locals/stack arrays where `LONG`/
/// `DOUBLE` occupy two consecutive slots (the second always `TOP`).
pub fn slot_width(ty: Type) -> u32 {
    if ty == Type::LONG || ty == Type::DOUBLE {
        2
    } else {
        1
    }
}

fn field_slot(field: &FieldType, pool: &mut ConstantPool) -> Type {
    if field.dim > 0 {
        let idx = pool.add_type(field.class_name.as_deref().unwrap_or("java/lang/Object"));
        return Type::object_with_dim(idx, field.dim as i32);
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

/// Drives output-frame simulation for one basic block: push/pop/set against `output_locals`/
/// `output_stack`, transparently extending into the conceptual input stack on underflow (§4.3).
pub struct Simulator<'a> {
    frame: &'a mut BasicBlockFrame,
    pool: &'a mut ConstantPool,
}

impl<'a> Simulator<'a> {
    pub fn new(frame: &'a mut BasicBlockFrame, pool: &'a mut ConstantPool) -> Self {
        Simulator { frame, pool }
    }

    fn push(&mut self, ty: Type) {
        self.frame.output_stack.push(ty);
        self.frame.output_stack_top += slot_width(ty) as i32;
        self.frame.output_stack_max = self.frame.output_stack_max.max(self.frame.output_stack_top);
        if slot_width(ty) == 2 {
            self.frame.output_stack.push(Type::TOP);
        }
    }

    fn pop_raw(&mut self) -> Type {
        match self.frame.output_stack.pop() {
            Some(ty) => {
                self.frame.output_stack_top -= slot_width(ty) as i32;
                ty
            }
            None => {
                // Underflowed the locally-simulated stack: the popped value actually comes from
                // the block's (still unknown) input stack. Record the reference symbolically and
                // extend the conceptual input stack by one more slot.
                let idx = (-self.frame.input_stack_top) as u32;
                self.frame.input_stack_top -= 1;
                Type::stack(idx)
            }
        }
    }

    fn pop(&mut self) -> Type {
        let ty = self.pop_raw();
        if ty == Type::TOP {
            // second half of a wide value beneath; pop the matching first half too and
            // reconstruct the original wide type by re-pushing nothing (caller only wanted one
            // slot's worth of type information, which TOP itself does not carry — pull the real
            // half instead).
            self.pop_raw()
        } else {
            ty
        }
    }

    fn get_local(&self, index: u32) -> Type {
        self.frame
            .output_locals
            .get(index as usize)
            .copied()
            .unwrap_or_else(|| Type::local(index))
    }

    fn set_local(&mut self, index: u32, ty: Type) {
        let needed = index as usize + slot_width(ty) as usize;
        if self.frame.output_locals.len() < needed {
            self.frame.output_locals.resize(needed, Type::TOP);
        }
        self.frame.output_locals[index as usize] = ty;
        if slot_width(ty) == 2 {
            self.frame.output_locals[index as usize + 1] = Type::TOP;
        }
    }

    fn record_initialization(&mut self, target: Type, initialized: Type) {
        self.frame.initializations.push(PendingInit { target, initialized });
    }

    /// Applies the effect of one instruction (identified by its resolved opcode — callers pass
    /// the real opcode even for a not-yet-widened pseudo-opcode) on the output frame.
    pub fn simulate(
        &mut self,
        opcode: u8,
        offset: u32,
        operand: InstructionOperand,
    ) -> Result<()> {
        use opcode::*;
        match opcode {
            NOP => {}
            ACONST_NULL => self.push(Type::NULL),
            ICONST_M1..=ICONST_5 => self.push(Type::INTEGER),
            LCONST_0 | LCONST_1 => self.push(Type::LONG),
            FCONST_0..=FCONST_2 => self.push(Type::FLOAT),
            DCONST_0 | DCONST_1 => self.push(Type::DOUBLE),
            BIPUSH | SIPUSH => self.push(Type::INTEGER),
            LDC | LDC_W | LDC2_W => {
                if let InstructionOperand::Constant(ty) = operand {
                    self.push(ty);
                }
            }
            _ if load_family(opcode).is_some() => {
                let (kind, local_index) = load_family(opcode).unwrap();
                let index = local_index.unwrap_or_else(|| operand.local_index());
                let value = match kind {
                    LoadKind::Reference => self.get_local(index),
                    LoadKind::Int => Type::INTEGER,
                    LoadKind::Float => Type::FLOAT,
                    LoadKind::Long => Type::LONG,
                    LoadKind::Double => Type::DOUBLE,
                };
                self.push(value);
            }
            IALOAD | BALOAD | CALOAD | SALOAD => {
                self.pop();
                self.pop();
                self.push(Type::INTEGER);
            }
            LALOAD => {
                self.pop();
                self.pop();
                self.push(Type::LONG);
            }
            FALOAD => {
                self.pop();
                self.pop();
                self.push(Type::FLOAT);
            }
            DALOAD => {
                self.pop();
                self.pop();
                self.push(Type::DOUBLE);
            }
            AALOAD => {
                self.pop();
                let array = self.pop();
                self.push(array.element_of());
            }
            _ if store_family(opcode).is_some() => {
                let (kind, local_index) = store_family(opcode).unwrap();
                let index = local_index.unwrap_or_else(|| operand.local_index());
                match kind {
                    StoreKind::Reference => {
                        let ty = self.pop();
                        self.set_local(index, ty);
                    }
                    StoreKind::Long => {
                        self.pop();
                        self.set_local(index, Type::LONG);
                    }
                    StoreKind::Double => {
                        self.pop();
                        self.set_local(index, Type::DOUBLE);
                    }
                    StoreKind::Float => {
                        self.pop();
                        self.set_local(index, Type::FLOAT);
                    }
                    StoreKind::Int => {
                        self.pop();
                        self.set_local(index, Type::INTEGER);
                    }
                }
            }
            IASTORE | BASTORE | CASTORE | SASTORE | FASTORE | AASTORE => {
                self.pop();
                self.pop();
                self.pop();
            }
            LASTORE | DASTORE => {
                self.pop();
                self.pop();
                self.pop();
            }
            POP => {
                self.pop_raw();
            }
            POP2 => {
                self.pop_raw();
                self.pop_raw();
            }
            DUP => {
                let ty = self.pop_raw();
                self.push(ty);
                self.push(ty);
            }
            DUP_X1 => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                self.push(a);
                self.push(b);
                self.push(a);
            }
            DUP_X2 | DUP2 | DUP2_X1 | DUP2_X2 => {
                // Category-2-aware dup forms: conservatively re-derive by raw-slot shuffling.
                self.simulate_wide_dup(opcode);
            }
            SWAP => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                self.push(a);
                self.push(b);
            }
            IADD..=IINC if opcode != IINC && is_arith(opcode) => {
                self.simulate_arith(opcode);
            }
            IINC => {}
            I2L => {
                self.pop();
                self.push(Type::LONG);
            }
            134 => {
                self.pop();
                self.push(Type::FLOAT);
            } // I2F
            135 => {
                self.pop();
                self.push(Type::DOUBLE);
            } // I2D
            136 => {
                self.pop();
                self.push(Type::INTEGER);
            } // L2I
            137 => {
                self.pop();
                self.push(Type::FLOAT);
            } // L2F
            138 => {
                self.pop();
                self.push(Type::DOUBLE);
            } // L2D
            139 => {
                self.pop();
                self.push(Type::INTEGER);
            } // F2I
            140 => {
                self.pop();
                self.push(Type::LONG);
            } // F2L
            141 => {
                self.pop();
                self.push(Type::DOUBLE);
            } // F2D
            142 => {
                self.pop();
                self.push(Type::INTEGER);
            } // D2I
            143 => {
                self.pop();
                self.push(Type::LONG);
            } // D2L
            144 => {
                self.pop();
                self.push(Type::FLOAT);
            } // D2F
            145 | 146 | 147 => {
                self.pop();
                self.push(Type::INTEGER);
            } // I2B, I2C, I2S
            LCMP => {
                self.pop();
                self.pop();
                self.push(Type::INTEGER);
            }
            FCMPL | 150 => {
                self.pop();
                self.pop();
                self.push(Type::INTEGER);
            } // FCMPG
            DCMPL | 152 => {
                self.pop();
                self.pop();
                self.push(Type::INTEGER);
            } // DCMPG
            IFEQ..=IFLE | 198 | 199 => {
                self.pop();
            } // IFNULL/IFNONNULL too
            IF_ICMPEQ..=IF_ACMPNE => {
                self.pop();
                self.pop();
            }
            GOTO | GOTO_W => {}
            JSR | JSR_W => {
                // the return address slot is accounted for by the `Jsr` edge contributing +1 to
                // the successor's input stack depth in cheap mode (§4.3); no output-frame effect.
            }
            RET => {}
            TABLESWITCH | LOOKUPSWITCH => {
                self.pop();
            }
            IRETURN | FRETURN | ARETURN => {
                self.pop();
            }
            LRETURN | DRETURN => {
                self.pop();
            }
            RETURN => {}
            GETSTATIC => {
                if let InstructionOperand::FieldRef(field) = operand {
                    self.push(field_slot(&field, self.pool));
                }
            }
            PUTSTATIC => {
                if let InstructionOperand::FieldRef(_) = operand {
                    self.pop();
                }
            }
            GETFIELD => {
                if let InstructionOperand::FieldRef(field) = operand {
                    self.pop();
                    self.push(field_slot(&field, self.pool));
                }
            }
            PUTFIELD => {
                if let InstructionOperand::FieldRef(_) = operand {
                    self.pop();
                    self.pop();
                }
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                if let InstructionOperand::MethodRef { owner, name, params, ret } = operand {
                    for _ in &params {
                        self.pop();
                    }
                    if opcode != INVOKESTATIC {
                        let target = self.pop();
                        if opcode == INVOKESPECIAL && name == "<init>" {
                            let initialized_idx = self.pool.add_type(&owner);
                            self.record_initialization(target, Type::object(initialized_idx));
                        }
                    }
                    if let Some(field) = ret {
                        self.push(field_slot(&field, self.pool));
                    }
                }
            }
            INVOKEDYNAMIC => {
                if let InstructionOperand::InvokeDynamic { params, ret } = operand {
                    for _ in &params {
                        self.pop();
                    }
                    if let Some(field) = ret {
                        self.push(field_slot(&field, self.pool));
                    }
                }
            }
            NEW => {
                if let InstructionOperand::ClassRef(name) = operand {
                    let idx = self.pool.add_uninitialized_type(&name, offset as u16);
                    self.push(Type::uninitialized(idx));
                }
            }
            NEWARRAY => {
                self.pop();
                let prim = match operand {
                    InstructionOperand::ArrayType(atype) => atype,
                    _ => 10,
                };
                // `primitive_array_element_name` already returns the full one-dimensional array
                // descriptor (e.g. "[I"), so the pushed type carries no additional dimension.
                let idx = self.pool.add_type(primitive_array_element_name(prim));
                self.push(Type::object(idx));
            }
            ANEWARRAY => {
                self.pop();
                if let InstructionOperand::ClassRef(name) = operand {
                    let idx = self.pool.add_type(&name);
                    self.push(Type::object_with_dim(idx, 1));
                }
            }
            ARRAYLENGTH => {
                self.pop();
                self.push(Type::INTEGER);
            }
            ATHROW => {
                self.pop();
            }
            CHECKCAST => {
                self.pop();
                if let InstructionOperand::ClassRef(name) = operand {
                    let (base_name, dim) = split_array_class(&name);
                    let idx = self.pool.add_type(base_name);
                    self.push(Type::object_with_dim(idx, dim));
                }
            }
            INSTANCEOF => {
                self.pop();
                self.push(Type::INTEGER);
            }
            MONITORENTER | MONITOREXIT => {
                self.pop();
            }
            MULTIANEWARRAY => {
                if let InstructionOperand::MultiNewArray { class_name, dims } = operand {
                    for _ in 0..dims {
                        self.pop();
                    }
                    let (base_name, base_dim) = split_array_class(&class_name);
                    let idx = self.pool.add_type(base_name);
                    self.push(Type::object_with_dim(idx, base_dim.max(dims as i32)));
                }
            }
            _ => {
                return Err(ClassFileError::malformed(
                    offset as usize,
                    format!("opcode {} has no registered frame effect", opcode),
                ))
            }
        }
        Ok(())
    }

    fn simulate_wide_dup(&mut self, opcode: u8) {
        // Slot-accurate but category-agnostic: operate on raw output-stack slots, matching how a
        // real interpreter's dup2 family treats two category-1 values the same as one category-2
        // value (both occupy two slots).
        match opcode {
            opcode::DUP2 => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                self.push_raw(b);
                self.push_raw(a);
                self.push_raw(b);
                self.push_raw(a);
            }
            opcode::DUP_X2 => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                let c = self.pop_raw();
                self.push_raw(a);
                self.push_raw(c);
                self.push_raw(b);
                self.push_raw(a);
            }
            opcode::DUP2_X1 => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                let c = self.pop_raw();
                self.push_raw(b);
                self.push_raw(a);
                self.push_raw(c);
                self.push_raw(b);
                self.push_raw(a);
            }
            opcode::DUP2_X2 => {
                let a = self.pop_raw();
                let b = self.pop_raw();
                let c = self.pop_raw();
                let d = self.pop_raw();
                self.push_raw(b);
                self.push_raw(a);
                self.push_raw(d);
                self.push_raw(c);
                self.push_raw(b);
                self.push_raw(a);
            }
            _ => unreachable!(),
        }
    }

    fn push_raw(&mut self, ty: Type) {
        self.frame.output_stack.push(ty);
        self.frame.output_stack_top += 1;
        self.frame.output_stack_max = self.frame.output_stack_max.max(self.frame.output_stack_top);
    }

    fn simulate_arith(&mut self, opcode: u8) {
        let (ty, unary) = arith_category(opcode);
        if !unary {
            self.pop();
        }
        self.pop();
        self.push(ty);
    }
}

fn is_arith(opcode: u8) -> bool {
    (opcode::IADD..=opcode::LXOR).contains(&opcode)
}

/// `add/sub/mul/div/rem/neg` each lay out `int, long, float, double` in that order; `shl/shr/
/// ushr/and/or/xor` only have `int, long` forms. Returns the result type and whether the
/// operation is unary (`neg`).
fn arith_category(opcode: u8) -> (Type, bool) {
    if opcode <= opcode::DREM {
        let offset = (opcode - opcode::IADD) % 4;
        let ty = match offset {
            0 => Type::INTEGER,
            1 => Type::LONG,
            2 => Type::FLOAT,
            _ => Type::DOUBLE,
        };
        (ty, false)
    } else if opcode <= opcode::DNEG {
        let offset = (opcode - opcode::INEG) % 4;
        let ty = match offset {
            0 => Type::INTEGER,
            1 => Type::LONG,
            2 => Type::FLOAT,
            _ => Type::DOUBLE,
        };
        (ty, true)
    } else {
        let ty = if (opcode - opcode::ISHL) % 2 == 0 {
            Type::INTEGER
        } else {
            Type::LONG
        };
        (ty, false)
    }
}

#[derive(Debug, Clone, Copy)]
enum LoadKind {
    Reference,
    Int,
    Float,
    Long,
    Double,
}

/// Classifies an `xload`/`xload_n` opcode, returning its slot kind and — for the `_n` short
/// forms — the local index baked into the opcode itself.
fn load_family(opcode: u8) -> Option<(LoadKind, Option<u32>)> {
    match opcode {
        opcode::ILOAD => Some((LoadKind::Int, None)),
        opcode::LLOAD => Some((LoadKind::Long, None)),
        opcode::FLOAD => Some((LoadKind::Float, None)),
        opcode::DLOAD => Some((LoadKind::Double, None)),
        opcode::ALOAD => Some((LoadKind::Reference, None)),
        26..=29 => Some((LoadKind::Int, Some((opcode - 26) as u32))),
        30..=33 => Some((LoadKind::Long, Some((opcode - 30) as u32))),
        34..=37 => Some((LoadKind::Float, Some((opcode - 34) as u32))),
        38..=41 => Some((LoadKind::Double, Some((opcode - 38) as u32))),
        42..=45 => Some((LoadKind::Reference, Some((opcode - 42) as u32))),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum StoreKind {
    Reference,
    Int,
    Float,
    Long,
    Double,
}

/// Classifies an `xstore`/`xstore_n` opcode, mirroring [`load_family`].
fn store_family(opcode: u8) -> Option<(StoreKind, Option<u32>)> {
    match opcode {
        opcode::ISTORE => Some((StoreKind::Int, None)),
        opcode::LSTORE => Some((StoreKind::Long, None)),
        opcode::FSTORE => Some((StoreKind::Float, None)),
        opcode::DSTORE => Some((StoreKind::Double, None)),
        opcode::ASTORE => Some((StoreKind::Reference, None)),
        59..=62 => Some((StoreKind::Int, Some((opcode - 59) as u32))),
        63..=66 => Some((StoreKind::Long, Some((opcode - 63) as u32))),
        67..=70 => Some((StoreKind::Float, Some((opcode - 67) as u32))),
        71..=74 => Some((StoreKind::Double, Some((opcode - 71) as u32))),
        75..=78 => Some((StoreKind::Reference, Some((opcode - 75) as u32))),
        _ => None,
    }
}

fn primitive_array_element_name(atype: u8) -> &'static str {
    match atype {
        4 => "[Z",
        5 => "[C",
        6 => "[F",
        7 => "[D",
        8 => "[B",
        9 => "[S",
        10 => "[I",
        11 => "[J",
        _ => "[Ljava/lang/Object;",
    }
}

fn split_array_class(name: &str) -> (&str, i32) {
    let dim = name.bytes().take_while(|&b| b == b'[').count() as i32;
    if dim == 0 {
        (name, 0)
    } else {
        let rest = &name[dim as usize..];
        let base = rest.strip_prefix('L').and_then(|r| r.strip_suffix(';')).unwrap_or(rest);
        (base, dim)
    }
}

/// Decoded operand data a caller (the reader when computing frames for a just-read method, or
/// the writer when computing frames for a method under construction) supplies alongside the raw
/// opcode, since the simulator itself has no access to the constant pool's *read* side.
#[derive(Debug, Clone)]
pub enum InstructionOperand {
    None,
    LocalIndex(u32),
    Constant(Type),
    ClassRef(String),
    FieldRef(FieldType),
    MethodRef { owner: String, name: String, params: Vec<FieldType>, ret: Option<FieldType> },
    InvokeDynamic { params: Vec<FieldType>, ret: Option<FieldType> },
    ArrayType(u8),
    MultiNewArray { class_name: String, dims: u8 },
}

impl InstructionOperand {
    fn local_index(&self) -> u32 {
        match self {
            InstructionOperand::LocalIndex(i) => *i,
            _ => 0,
        }
    }

    pub fn method_ref(owner: &str, name: &str, descriptor: &str) -> Self {
        let (params, ret) = parse_method_descriptor(descriptor).unwrap_or_default();
        InstructionOperand::MethodRef {
            owner: owner.to_string(),
            name: name.to_string(),
            params,
            ret,
        }
    }

    pub fn field_ref(descriptor: &str, offset: u32) -> Result<Self> {
        let (field, _) = parse_field_type(descriptor).ok_or_else(|| {
            ClassFileError::malformed(offset as usize, format!("invalid field descriptor `{descriptor}`"))
        })?;
        Ok(InstructionOperand::FieldRef(field))
    }
}

/// Computes only `max_stack`/`max_locals` via the cheap fix-point (§4.3): each block's
/// `input_stack_top` is propagated to successors, `jsr` edges add one slot for the return
/// address, handler edges force the caught exception onto an otherwise-empty stack.
pub fn compute_max_stack(
    arena: &mut LabelArena,
    entry: LabelId,
    initial_locals: u32,
) -> (u32, u32) {
    let mut queue = vec![entry];
    let mut queued = std::collections::HashSet::new();
    queued.insert(entry.0);
    arena.ensure_frame(entry).input_stack_top = 0;

    let mut max_stack = 0i32;

    while let Some(label) = queue.pop() {
        let (input_top, output_top, output_max) = arena
            .get(label)
            .frame
            .as_ref()
            .map(|f| (f.input_stack_top, f.output_stack_top, f.output_stack_max))
            .unwrap_or((0, 0, 0));
        max_stack = max_stack.max(input_top + output_max);

        let successors: Vec<_> = arena.successors(label).map(|e| (e.kind, e.successor)).collect();
        for (kind, succ) in successors {
            let new_top = match kind {
                EdgeKind::Handler(_) => 1,
                EdgeKind::Jsr => input_top + output_top + 1,
                EdgeKind::Normal => input_top + output_top,
            };
            let succ_frame = arena.ensure_frame(succ);
            let first_visit = queued.insert(succ.0);
            if new_top > succ_frame.input_stack_top || first_visit {
                succ_frame.input_stack_top = succ_frame.input_stack_top.max(new_top);
                queue.push(succ);
            }
        }
    }

    (max_stack.max(0) as u32, initial_locals)
}

/// A basic block's resolved input frame: concrete types only, no LOCAL/STACK-relative
/// placeholders left.
pub type ResolvedFrame = (Vec<Type>, Vec<Type>);

/// Computes full per-block input frames via the expensive fix-point (§4.3): every output-frame
/// entry is resolved against the block's now-known input frame, pending `<init>` substitutions
/// are applied, and the result is merged into each successor's input frame until nothing changes
/// further. Returns blocks in the order they were first dequeued (the determinism the
/// `StackMapTable` delta encoding depends on), each paired with its converged input locals/stack.
pub fn compute_frames(
    arena: &mut LabelArena,
    entry: LabelId,
    initial_locals: Vec<Type>,
    pool: &mut ConstantPool,
    hierarchy: &dyn ClassHierarchy,
) -> Vec<(LabelId, ResolvedFrame)> {
    use std::collections::{HashMap, HashSet};

    let mut input: HashMap<u32, ResolvedFrame> = HashMap::new();
    input.insert(entry.0, (initial_locals, Vec::new()));
    let mut queue = vec![entry];
    let mut queued = HashSet::new();
    queued.insert(entry.0);
    let mut order = Vec::new();
    let mut seen_order = HashSet::new();

    while let Some(label) = queue.pop() {
        if seen_order.insert(label.0) {
            order.push(label);
        }

        let (input_locals, input_stack) = input.get(&label.0).cloned().unwrap_or_default();
        let frame = arena.get(label).frame.clone().unwrap_or_default();

        let mut out_locals: Vec<Type> =
            frame.output_locals.iter().map(|t| t.resolve(&input_locals, &input_stack)).collect();
        let mut out_stack: Vec<Type> =
            frame.output_stack.iter().map(|t| t.resolve(&input_locals, &input_stack)).collect();
        let inits: Vec<(Type, Type)> = frame
            .initializations
            .iter()
            .map(|pi| (pi.target.resolve(&input_locals, &input_stack), pi.initialized))
            .collect();
        for ty in out_locals.iter_mut().chain(out_stack.iter_mut()) {
            for (target, initialized) in &inits {
                if ty == target {
                    *ty = *initialized;
                }
            }
        }

        let successors: Vec<_> = arena.successors(label).map(|e| (e.kind, e.successor)).collect();
        for (kind, succ) in successors {
            let candidate = match kind {
                EdgeKind::Normal | EdgeKind::Jsr => (out_locals.clone(), out_stack.clone()),
                EdgeKind::Handler(type_idx) => {
                    let exception_ty = match type_idx {
                        Some(idx) => Type::object(idx),
                        None => Type::object(pool.add_type("java/lang/Throwable")),
                    };
                    (out_locals.clone(), vec![exception_ty])
                }
            };

            let changed = match input.get_mut(&succ.0) {
                None => {
                    input.insert(succ.0, candidate);
                    true
                }
                Some(existing) => merge_frame_into(existing, &candidate, pool, hierarchy),
            };
            if changed || queued.insert(succ.0) {
                queue.push(succ);
            }
        }
    }

    order
        .into_iter()
        .map(|label| {
            let frame = input.get(&label.0).cloned().unwrap_or_default();
            (label, frame)
        })
        .collect()
}

/// Merges `candidate` into `existing` slot-wise via [`Type::merge`]. Locals/stack of differing
/// length narrow to their common prefix (a verifier would reject true divergence; narrowing here
/// keeps the fix-point total rather than panicking on it). Returns whether `existing` changed.
fn merge_frame_into(
    existing: &mut ResolvedFrame,
    candidate: &ResolvedFrame,
    pool: &mut ConstantPool,
    hierarchy: &dyn ClassHierarchy,
) -> bool {
    let mut changed = false;
    let common_locals = existing.0.len().min(candidate.0.len());
    if existing.0.len() != common_locals {
        existing.0.truncate(common_locals);
        changed = true;
    }
    for i in 0..common_locals {
        let merged = existing.0[i].merge(candidate.0[i], pool, hierarchy);
        if merged != existing.0[i] {
            existing.0[i] = merged;
            changed = true;
        }
    }
    let common_stack = existing.1.len().min(candidate.1.len());
    if existing.1.len() != common_stack {
        existing.1.truncate(common_stack);
        changed = true;
    }
    for i in 0..common_stack {
        let merged = existing.1[i].merge(candidate.1[i], pool, hierarchy);
        if merged != existing.1[i] {
            existing.1[i] = merged;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_slot_has_no_dim() {
        assert_eq!(Type::INTEGER.dim(), 0);
        assert!(!Type::INTEGER.is_reference());
    }

    #[test]
    fn array_of_and_element_of_invert() {
        let mut pool = ConstantPool::new();
        let idx = pool.add_type("java/lang/String");
        let base = Type::object(idx);
        let array = base.array_of();
        assert_eq!(array.dim(), 1);
        assert_eq!(array.element_of().dim(), 0);
    }

    #[test]
    fn negative_dim_round_trips_through_packing() {
        let ty = Type::object(3).with_dim_delta(-2);
        assert_eq!(ty.dim(), -2);
    }

    #[test]
    fn merge_widens_small_ints_to_integer() {
        let mut pool = ConstantPool::new();
        let merged = Type::BOOLEAN.merge(Type::BYTE, &mut pool, &crate::constant::ObjectOracle);
        assert_eq!(merged, Type::INTEGER);
    }

    #[test]
    fn merge_is_top_for_incompatible_categories() {
        let mut pool = ConstantPool::new();
        let merged = Type::INTEGER.merge(Type::FLOAT, &mut pool, &crate::constant::ObjectOracle);
        assert_eq!(merged, Type::TOP);
    }

    #[test]
    fn merge_null_with_reference_yields_reference() {
        let mut pool = ConstantPool::new();
        let idx = pool.add_type("java/lang/String");
        let string_ty = Type::object(idx);
        let merged = Type::NULL.merge(string_ty, &mut pool, &crate::constant::ObjectOracle);
        assert_eq!(merged, string_ty);
    }

    #[test]
    fn local_and_stack_refs_resolve_against_input_frame() {
        let input_locals = vec![Type::INTEGER, Type::LONG];
        let input_stack = vec![Type::FLOAT];
        assert_eq!(Type::local(0).resolve(&input_locals, &input_stack), Type::INTEGER);
        assert_eq!(Type::stack(0).resolve(&input_locals, &input_stack), Type::FLOAT);
    }
}

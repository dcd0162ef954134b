//! The capability-bundle translation of the original subclass-override visitor API (§9): a trait
//! per visited construct, every method defaulted to a no-op, so an adapter overrides only the
//! events it cares about and lets the rest fall through. [`crate::reader::ClassReader`] drives a
//! `&mut dyn ClassVisitor`; [`crate::writer::ClassWriter`]/[`crate::writer::MethodWriter`]
//! implement these traits to build a class file incrementally.

use crate::class::{ClassAccessFlags, ClassVersion, FieldAccessFlags, MethodAccessFlags};
use crate::label::LabelId;

/// A position in a method body. Stable arena index into the enclosing reader's/writer's label
/// graph; equal labels always denote the same basic block boundary.
pub type Label = LabelId;

/// A field's or `ldc`'s constant value, already resolved out of the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
}

/// Everything `ldc`/`ldc_w`/`ldc2_w` may push, a superset of [`ConstantValue`] (adds class
/// literals; `MethodType`/`MethodHandle`/`Dynamic` constants are out of scope, per §1).
#[derive(Debug, Clone, PartialEq)]
pub enum LdcConstant {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
}

/// One local/stack slot of a decoded `StackMapTable` frame, with `Object`/`Uninitialized`
/// resolved to a class name / label rather than a raw constant-pool index.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),
    Uninitialized(Label),
}

/// Visits the top-level structure of a class file. Call order (enforced by the reader, expected
/// of a writer): `visit` → `visit_source?` → `visit_outer_class?` → `visit_inner_class*` →
/// (`visit_field` | `visit_method`)* → `visit_attribute*` → `visit_end`.
pub trait ClassVisitor {
    fn visit(
        &mut self,
        _version: ClassVersion,
        _access: ClassAccessFlags,
        _name: &str,
        _signature: Option<&str>,
        _super_name: Option<&str>,
        _interfaces: &[String],
    ) {
    }

    fn visit_source(&mut self, _source: Option<&str>, _debug: Option<&str>) {}

    fn visit_outer_class(&mut self, _owner: &str, _name: Option<&str>, _descriptor: Option<&str>) {}

    fn visit_inner_class(
        &mut self,
        _name: &str,
        _outer_name: Option<&str>,
        _inner_name: Option<&str>,
        _access: ClassAccessFlags,
    ) {
    }

    fn visit_attribute(&mut self, _name: &str, _data: &[u8]) {}

    fn visit_field(
        &mut self,
        _access: FieldAccessFlags,
        _name: &str,
        _descriptor: &str,
        _signature: Option<&str>,
        _value: Option<ConstantValue>,
    ) -> Option<Box<dyn FieldVisitor>> {
        None
    }

    fn visit_method(
        &mut self,
        _access: MethodAccessFlags,
        _name: &str,
        _descriptor: &str,
        _signature: Option<&str>,
        _exceptions: &[String],
    ) -> Option<Box<dyn MethodVisitor>> {
        None
    }

    fn visit_end(&mut self) {}
}

/// Visits a single field's attributes, once `ClassVisitor::visit_field` opts in.
pub trait FieldVisitor {
    fn visit_attribute(&mut self, _name: &str, _data: &[u8]) {}
    fn visit_end(&mut self) {}
}

/// Visits a single method's body, once `ClassVisitor::visit_method` opts in. Event order within
/// one method: `visit_code` → (`visit_label`, then `visit_frame` if one starts at that label, then
/// the block's instruction events, all interleaved in bytecode order) → `visit_try_catch_block*` →
/// (`visit_line_number`/`visit_local_variable`)* → `visit_maxs` → `visit_end`. `visit_frame`
/// carries no offset of its own — its position is always "the label most recently visited".
pub trait MethodVisitor {
    /// Allocates a label a later `visit_label`/`visit_jump_insn`/... call can reference. Labels
    /// are indices into whatever arena the concrete visitor owns, so a driver bridging two
    /// visitors (e.g. a reader feeding a writer) must translate through a `Label -> Label` map
    /// rather than forward a label allocated by one visitor to another.
    fn new_label(&mut self) -> Label {
        panic!("this visitor does not support allocating new labels")
    }

    fn visit_attribute(&mut self, _name: &str, _data: &[u8]) {}

    fn visit_code(&mut self) {}

    fn visit_label(&mut self, _label: Label) {}

    fn visit_frame(&mut self, _locals: &[VerificationType], _stack: &[VerificationType]) {}

    fn visit_insn(&mut self, _opcode: u8) {}
    fn visit_int_insn(&mut self, _opcode: u8, _operand: i32) {}
    fn visit_var_insn(&mut self, _opcode: u8, _var_index: u32) {}
    fn visit_type_insn(&mut self, _opcode: u8, _type_name: &str) {}
    fn visit_field_insn(&mut self, _opcode: u8, _owner: &str, _name: &str, _descriptor: &str) {}
    fn visit_method_insn(
        &mut self,
        _opcode: u8,
        _owner: &str,
        _name: &str,
        _descriptor: &str,
        _is_interface: bool,
    ) {
    }
    fn visit_invoke_dynamic_insn(&mut self, _name: &str, _descriptor: &str, _bootstrap_method_attr_index: u16) {}
    fn visit_jump_insn(&mut self, _opcode: u8, _target: Label) {}
    fn visit_ldc_insn(&mut self, _constant: LdcConstant) {}
    fn visit_iinc_insn(&mut self, _var_index: u32, _increment: i32) {}
    fn visit_table_switch_insn(&mut self, _min: i32, _max: i32, _default: Label, _labels: &[Label]) {}
    fn visit_lookup_switch_insn(&mut self, _default: Label, _keys: &[i32], _labels: &[Label]) {}
    fn visit_multi_anew_array_insn(&mut self, _descriptor: &str, _dims: u8) {}

    fn visit_try_catch_block(&mut self, _start: Label, _end: Label, _handler: Label, _catch_type: Option<&str>) {}

    fn visit_line_number(&mut self, _line: u16, _start: Label) {}
    fn visit_local_variable(
        &mut self,
        _name: &str,
        _descriptor: &str,
        _signature: Option<&str>,
        _start: Label,
        _end: Label,
        _index: u32,
    ) {
    }

    fn visit_maxs(&mut self, _max_stack: u32, _max_locals: u32) {}

    fn visit_end(&mut self) {}
}

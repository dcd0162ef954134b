//! Positions in a method's bytecode. Labels and the edges between them form the control-flow
//! graph the frame engine (§4.3) runs its fix-point over. The graph is cyclic by nature (loops),
//! so it is kept as an arena of stable indices rather than a tree of owning references — an
//! `Edge` or the work-queue `next` pointer just holds another index, never a borrow.

use crate::frame::Type;
use bitflags::bitflags;

bitflags! {
    /// Bits describing what role a label plays. `DEBUG` means the label exists only to anchor a
    /// `LocalVariableTable`/`LineNumberTable` entry and is not itself a basic-block boundary.
    pub struct LabelStatus: u8 {
        /// Used only for debug attributes, not a basic block boundary.
        const DEBUG = 0b0000_0001;
        /// `position` has been assigned a concrete byte offset.
        const RESOLVED = 0b0000_0010;
        /// This label's position shifted during the resize pass.
        const RESIZED = 0b0000_0100;
        /// Targeted by at least one jump/switch/exception-range boundary; a basic-block start.
        const TARGET = 0b0000_1000;
        /// A computed stack-map frame is attached and must be serialized into `StackMapTable`.
        const STORE = 0b0001_0000;
    }
}

/// A forward reference recorded against a still-unresolved label: `source` encodes both the
/// instruction's byte offset *and* whether the eventual patch needs 2 or 4 bytes. Non-negative
/// means a 2-byte slot recorded at `source`; negative means a 4-byte slot, with the true source
/// offset recovered as `-1 - source`.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRef {
    pub source: i32,
    pub patch_pos: u32,
}

impl ForwardRef {
    pub fn short(source: u32, patch_pos: u32) -> Self {
        ForwardRef { source: source as i32, patch_pos }
    }

    pub fn wide(source: u32, patch_pos: u32) -> Self {
        ForwardRef { source: -1 - source as i32, patch_pos }
    }

    pub fn is_wide(&self) -> bool {
        self.source < 0
    }

    /// Recovers the instruction offset the patch slot was emitted at.
    pub fn source_offset(&self) -> u32 {
        if self.is_wide() {
            (-1 - self.source) as u32
        } else {
            self.source as u32
        }
    }
}

/// A stable index into a [`LabelArena`]. Cheap to copy, stored instead of references so the
/// (cyclic) control-flow graph never needs `Rc`/`RefCell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// A stable index into the arena backing [`Edge`] storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

/// Tags the kind of control-flow arc an [`Edge`] represents. Handler edges force the successor's
/// input stack to hold exactly the caught exception (§4.3); `Jsr` edges are only legal in cheap
/// (max-stack-only) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Normal,
    Jsr,
    /// Carries the type-table index of the caught exception class, or `None` for a catch-all
    /// (`finally`) handler.
    Handler(Option<u32>),
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub kind: EdgeKind,
    pub successor: LabelId,
    pub next: Option<EdgeId>,
}

/// The effect of an `INVOKESPECIAL <init>` awaiting second-phase substitution: every
/// `UNINITIALIZED`/`UNINITIALIZED_THIS` slot matching `target` in a propagated frame becomes the
/// constructed object's `OBJECT` type (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct PendingInit {
    pub target: Type,
    pub initialized: Type,
}

/// Dataflow state for a label that starts a basic block (has `TARGET` status, is a method entry,
/// or is an exception handler). Labels used only for debug info never populate this.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockFrame {
    pub input_locals: Vec<Type>,
    pub input_stack: Vec<Type>,
    /// Cheap-mode-only: stack depth at block entry, relative to the method's initial frame.
    pub input_stack_top: i32,
    pub output_locals: Vec<Type>,
    pub output_stack: Vec<Type>,
    /// Current depth of `output_stack` relative to the (still unknown) input frame.
    pub output_stack_top: i32,
    /// Highest `output_stack_top` reached while simulating this block; used for the cheap-mode
    /// max-stack formula `input_stack_top + output_stack_max`.
    pub output_stack_max: i32,
    pub initializations: Vec<PendingInit>,
}

#[derive(Debug, Clone)]
pub struct LabelData {
    pub status: LabelStatus,
    pub position: u32,
    pub forward_refs: Vec<ForwardRef>,
    pub frame: Option<BasicBlockFrame>,
    pub successors: Option<EdgeId>,
    /// Work-queue chain pointer used by the fix-point passes; reset at the start of each pass.
    pub next: Option<LabelId>,
}

impl LabelData {
    fn new() -> Self {
        LabelData {
            status: LabelStatus::empty(),
            position: 0,
            forward_refs: Vec::with_capacity(6),
            frame: None,
            successors: None,
            next: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status.contains(LabelStatus::RESOLVED)
    }
}

/// Owns every label and edge of a single method body. Indices remain valid for the arena's
/// lifetime; nothing is ever removed mid-computation (resize and frame passes only mutate
/// in place).
#[derive(Debug, Default)]
pub struct LabelArena {
    labels: Vec<LabelData>,
    edges: Vec<Edge>,
}

impl LabelArena {
    pub fn new() -> Self {
        LabelArena::default()
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelData::new());
        id
    }

    pub fn get(&self, id: LabelId) -> &LabelData {
        &self.labels[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LabelId) -> &mut LabelData {
        &mut self.labels[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = LabelId> {
        (0..self.labels.len() as u32).map(LabelId)
    }

    /// Marks `id` as resolved at `position`. Returns the forward references that must now be
    /// patched by the caller (the writer owns the actual byte buffer).
    pub fn resolve(&mut self, id: LabelId, position: u32) -> Vec<ForwardRef> {
        let label = self.get_mut(id);
        label.status.insert(LabelStatus::RESOLVED);
        label.position = position;
        std::mem::take(&mut label.forward_refs)
    }

    pub fn add_forward_ref(&mut self, id: LabelId, reference: ForwardRef) {
        self.get_mut(id).forward_refs.push(reference);
    }

    /// Adds a control-flow edge from `from` to `to`. Handler edges and `jsr` edges are added the
    /// same way, distinguished only by `kind`.
    pub fn add_edge(&mut self, from: LabelId, to: LabelId, kind: EdgeKind) {
        let edge_id = EdgeId(self.edges.len() as u32);
        let head = self.get(from).successors;
        self.edges.push(Edge { kind, successor: to, next: head });
        self.get_mut(from).successors = Some(edge_id);
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    /// Iterates the outgoing edges of `from`, most-recently-added first (insertion order is not
    /// semantically significant for correctness, only for the `StackMapTable` diff stability
    /// rule which operates on label *visitation* order, tracked separately via `next`).
    pub fn successors(&self, from: LabelId) -> impl Iterator<Item = &Edge> + '_ {
        let mut current = self.get(from).successors;
        std::iter::from_fn(move || {
            let edge_id = current?;
            let edge = self.edge(edge_id);
            current = edge.next;
            Some(edge)
        })
    }

    pub fn ensure_frame(&mut self, id: LabelId) -> &mut BasicBlockFrame {
        self.get_mut(id).frame.get_or_insert_with(BasicBlockFrame::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_ref_encodes_width_in_sign() {
        let short = ForwardRef::short(10, 11);
        assert!(!short.is_wide());
        assert_eq!(short.source_offset(), 10);

        let wide = ForwardRef::wide(10, 11);
        assert!(wide.is_wide());
        assert_eq!(wide.source_offset(), 10);
    }

    #[test]
    fn resolve_drains_forward_refs() {
        let mut arena = LabelArena::new();
        let label = arena.new_label();
        arena.add_forward_ref(label, ForwardRef::short(0, 1));
        arena.add_forward_ref(label, ForwardRef::wide(5, 6));
        let drained = arena.resolve(label, 100);
        assert_eq!(drained.len(), 2);
        assert!(arena.get(label).forward_refs.is_empty());
        assert!(arena.get(label).is_resolved());
    }

    #[test]
    fn edges_chain_in_reverse_insertion_order() {
        let mut arena = LabelArena::new();
        let a = arena.new_label();
        let b = arena.new_label();
        let c = arena.new_label();
        arena.add_edge(a, b, EdgeKind::Normal);
        arena.add_edge(a, c, EdgeKind::Handler(None));
        let successors: Vec<LabelId> = arena.successors(a).map(|e| e.successor).collect();
        assert_eq!(successors, vec![c, b]);
    }
}

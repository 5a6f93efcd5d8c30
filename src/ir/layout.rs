//! Procedure layout.
//!
//! The `Layout` owns the program order of instructions as a doubly linked
//! list over entity references. It holds no instruction definitions; those
//! live in the [`DataFlowGraph`](super::function::DataFlowGraph). Unlinking
//! an instruction removes it from program order without invalidating its
//! `Inst`, so transient worklists held by passes keep working until they are
//! discarded at the pass boundary.

use crate::ir::entities::Inst;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

#[derive(Copy, Clone, Default, PartialEq)]
struct InstNode {
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
}

/// Doubly linked program order of instructions.
#[derive(Clone, Default)]
pub struct Layout {
    insts: SecondaryMap<Inst, InstNode>,
    first: PackedOption<Inst>,
    last: PackedOption<Inst>,
}

impl Layout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every instruction from the layout.
    pub fn clear(&mut self) {
        self.insts.clear();
        self.first = None.into();
        self.last = None.into();
    }

    /// First instruction in program order.
    pub fn first(&self) -> Option<Inst> {
        self.first.expand()
    }

    /// Last instruction in program order.
    pub fn last(&self) -> Option<Inst> {
        self.last.expand()
    }

    /// The instruction following `inst`, if any.
    pub fn next(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next.expand()
    }

    /// The instruction preceding `inst`, if any.
    pub fn prev(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev.expand()
    }

    /// Is `inst` currently linked into program order?
    pub fn is_inserted(&self, inst: Inst) -> bool {
        self.first.expand() == Some(inst) || self.insts[inst].prev.is_some()
    }

    /// Append `inst` at the end of the program.
    pub fn append(&mut self, inst: Inst) {
        debug_assert!(!self.is_inserted(inst), "instruction already in layout");
        let prev = self.last;
        self.insts[inst] = InstNode {
            prev,
            next: None.into(),
        };
        if let Some(p) = prev.expand() {
            self.insts[p].next = inst.into();
        } else {
            self.first = inst.into();
        }
        self.last = inst.into();
    }

    /// Insert `inst` immediately before `before`.
    pub fn insert_before(&mut self, inst: Inst, before: Inst) {
        debug_assert!(!self.is_inserted(inst), "instruction already in layout");
        debug_assert!(self.is_inserted(before), "insertion point not in layout");
        let prev = self.insts[before].prev;
        self.insts[inst] = InstNode {
            prev,
            next: before.into(),
        };
        self.insts[before].prev = inst.into();
        match prev.expand() {
            Some(p) => self.insts[p].next = inst.into(),
            None => self.first = inst.into(),
        }
    }

    /// Insert `inst` immediately after `after`.
    pub fn insert_after(&mut self, inst: Inst, after: Inst) {
        debug_assert!(!self.is_inserted(inst), "instruction already in layout");
        debug_assert!(self.is_inserted(after), "insertion point not in layout");
        let next = self.insts[after].next;
        self.insts[inst] = InstNode {
            prev: after.into(),
            next,
        };
        self.insts[after].next = inst.into();
        match next.expand() {
            Some(n) => self.insts[n].prev = inst.into(),
            None => self.last = inst.into(),
        }
    }

    /// Unlink `inst` from program order. The instruction itself stays
    /// allocated and its `Inst` stays valid.
    pub fn remove(&mut self, inst: Inst) {
        debug_assert!(self.is_inserted(inst), "instruction not in layout");
        let InstNode { prev, next } = self.insts[inst];
        match prev.expand() {
            Some(p) => self.insts[p].next = next,
            None => self.first = next,
        }
        match next.expand() {
            Some(n) => self.insts[n].prev = prev,
            None => self.last = prev,
        }
        self.insts[inst] = InstNode::default();
    }

    /// Iterate over instructions in program order.
    pub fn insts(&self) -> Insts<'_> {
        Insts {
            layout: self,
            next: self.first.expand(),
        }
    }

    /// Number of instructions currently linked in.
    pub fn len(&self) -> usize {
        self.insts().count()
    }

    /// Is the layout empty?
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Iterator over instructions in program order.
pub struct Insts<'a> {
    layout: &'a Layout,
    next: Option<Inst>,
}

impl<'a> Iterator for Insts<'a> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let cur = self.next?;
        self.next = self.layout.next(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn collect(layout: &Layout) -> Vec<Inst> {
        layout.insts().collect()
    }

    #[test]
    fn append_and_iterate() {
        let mut layout = Layout::new();
        let i = |n| Inst::new(n);
        layout.append(i(0));
        layout.append(i(1));
        layout.append(i(2));
        assert_eq!(collect(&layout), [i(0), i(1), i(2)]);
        assert_eq!(layout.first(), Some(i(0)));
        assert_eq!(layout.last(), Some(i(2)));
        assert_eq!(layout.prev(i(1)), Some(i(0)));
        assert_eq!(layout.next(i(1)), Some(i(2)));
    }

    #[test]
    fn insert_and_remove() {
        let mut layout = Layout::new();
        let i = |n| Inst::new(n);
        layout.append(i(0));
        layout.append(i(2));
        layout.insert_before(i(1), i(2));
        assert_eq!(collect(&layout), [i(0), i(1), i(2)]);
        layout.insert_after(i(3), i(2));
        assert_eq!(collect(&layout), [i(0), i(1), i(2), i(3)]);

        layout.remove(i(0));
        assert_eq!(collect(&layout), [i(1), i(2), i(3)]);
        assert_eq!(layout.first(), Some(i(1)));
        layout.remove(i(3));
        assert_eq!(collect(&layout), [i(1), i(2)]);
        assert_eq!(layout.last(), Some(i(2)));
        assert!(!layout.is_inserted(i(0)));

        // A removed instruction can be linked back in.
        layout.insert_before(i(0), i(1));
        assert_eq!(collect(&layout), [i(0), i(1), i(2)]);
    }
}

//! Scoped name table. A stack of frames, innermost last; lookups walk from
//! the end backwards. Each frame allows shadowing of outer entries but a
//! name declared twice in one frame is the caller's problem to report.

use std::collections::HashMap;

use crate::ast::Linked;

#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    frames: Vec<HashMap<String, Linked>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub fn enter_scope(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.frames.len() > 1, "cannot pop the global frame");
        self.frames.pop();
    }

    /// Insert into the innermost frame, returning the entry it replaced
    /// within that frame (outer shadowed entries are untouched).
    pub fn declare(&mut self, name: impl Into<String>, linked: Linked) -> Option<Linked> {
        self.frames
            .last_mut()
            .expect("symbol table always has a frame")
            .insert(name.into(), linked)
    }

    /// Insert into the outermost (global) frame.
    pub fn declare_global(&mut self, name: impl Into<String>, linked: Linked) -> Option<Linked> {
        self.frames
            .first_mut()
            .expect("symbol table always has a frame")
            .insert(name.into(), linked)
    }

    pub fn lookup(&self, name: &str) -> Option<Linked> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name).copied())
    }

    pub fn lookup_global(&self, name: &str) -> Option<Linked> {
        self.frames.first().and_then(|f| f.get(name).copied())
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FileId, NodeId, NodeRef};

    fn linked(n: u32) -> Linked {
        Linked::Node(NodeRef::new(FileId(0), NodeId(n)))
    }

    #[test]
    fn test_shadowing_and_restore() {
        let mut table = SymbolTable::new();
        table.declare("x", linked(1));
        table.enter_scope();
        table.declare("x", linked(2));
        assert_eq!(table.lookup("x"), Some(linked(2)));
        table.exit_scope();
        assert_eq!(table.lookup("x"), Some(linked(1)));
    }

    #[test]
    fn test_declare_reports_same_frame_replacement() {
        let mut table = SymbolTable::new();
        assert_eq!(table.declare("f", linked(1)), None);
        assert_eq!(table.declare("f", linked(2)), Some(linked(1)));
        table.enter_scope();
        // shadowing an outer entry is not a replacement
        assert_eq!(table.declare("f", linked(3)), None);
    }
}

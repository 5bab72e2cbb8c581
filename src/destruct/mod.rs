//! Destructor planning. A stack of destruction jobs accumulates within
//! every scope; on scope exit the jobs from the scope's begin index upward
//! emit in reverse order, strictly before the scope's terminator. Early
//! `return` emits every pending job; both back-ends consume the same plan,
//! which is what keeps their destructor ordering identical.

use crate::ast::{Module, NodeRef, Type};

/// One deferred destructor call on a named location.
#[derive(Debug, Clone, PartialEq)]
pub struct DestructionJob {
    /// Name of the local, parameter or temporary to destroy.
    pub local_name: String,
    pub kind: DestructionJobKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DestructionJobKind {
    /// Call struct S's destructor on the location; `is_pointer` selects
    /// whether the location already is an address.
    Default {
        struct_ref: NodeRef,
        iteration: usize,
        is_pointer: bool,
    },
    /// Iterate `[size-1..0]`, calling the element destructor on each
    /// element.
    Array {
        elem_struct: NodeRef,
        iteration: usize,
        size: u64,
    },
}

#[derive(Debug, Default)]
pub struct DestructionPlanner {
    jobs: Vec<DestructionJob>,
    scope_starts: Vec<usize>,
}

impl DestructionPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_scope(&mut self) {
        self.scope_starts.push(self.jobs.len());
    }

    /// Jobs of the innermost scope, in emission order (reverse of queue
    /// order). The scope's jobs are removed.
    pub fn exit_scope(&mut self) -> Vec<DestructionJob> {
        let start = self.scope_starts.pop().unwrap_or(0);
        let mut drained = self.jobs.split_off(start);
        drained.reverse();
        drained
    }

    /// Every pending job across all open scopes, innermost first, without
    /// removing them. Emitted on early `return`.
    pub fn all_pending(&self) -> Vec<DestructionJob> {
        let mut jobs = self.jobs.clone();
        jobs.reverse();
        jobs
    }

    /// Pending jobs down to (not including) the scope at `depth`; emitted
    /// on `break`/`continue` out of a loop whose scope sits at `depth`.
    pub fn pending_until(&self, depth: usize) -> Vec<DestructionJob> {
        let start = self
            .scope_starts
            .get(depth)
            .copied()
            .unwrap_or(self.jobs.len());
        let mut jobs = self.jobs[start..].to_vec();
        jobs.reverse();
        jobs
    }

    pub fn has_pending(&self) -> bool {
        !self.jobs.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.scope_starts.len()
    }

    /// Queue a local (or parameter, or temporary) whose type requires
    /// destruction. Locations that don't require destruction are ignored.
    pub fn queue_local(
        &mut self,
        name: impl Into<String>,
        ty: &Type,
        is_pointer: bool,
        module: &Module,
    ) {
        let Some(job) = job_for_type(name.into(), ty, is_pointer, module) else {
            return;
        };
        self.jobs.push(job);
    }
}

/// The slice of the lowering-target interface the shared destruction
/// phase needs. Both back-ends implement it; the planner and the
/// emission order live above it, which is what keeps cleanup identical
/// across the two.
pub trait DestructionTarget {
    fn emit_destruction_job(&mut self, job: &DestructionJob);
}

/// Emit `jobs` in the order the planner produced them.
pub fn emit_jobs<T: DestructionTarget + ?Sized>(target: &mut T, jobs: &[DestructionJob]) {
    for job in jobs {
        target.emit_destruction_job(job);
    }
}

/// Build the job matching a type, or `None` when the type does not require
/// destruction.
pub fn job_for_type(
    local_name: String,
    ty: &Type,
    is_pointer: bool,
    module: &Module,
) -> Option<DestructionJob> {
    match ty.pure_type().as_ref() {
        Type::Referenced { linked: Some(r), .. } => {
            if !module.requires_destruction(*r) {
                return None;
            }
            Some(DestructionJob {
                local_name,
                kind: DestructionJobKind::Default {
                    struct_ref: *r,
                    iteration: 0,
                    is_pointer,
                },
            })
        }
        Type::Generic {
            base, iteration, ..
        } => {
            let struct_ref = base.linked_node()?;
            if !module.requires_destruction(struct_ref) {
                return None;
            }
            Some(DestructionJob {
                local_name,
                kind: DestructionJobKind::Default {
                    struct_ref,
                    iteration: *iteration,
                    is_pointer,
                },
            })
        }
        Type::Array { elem_type, size } => {
            let (elem_struct, iteration) = match elem_type.pure_type().as_ref() {
                Type::Referenced { linked: Some(r), .. } => (*r, 0),
                Type::Generic {
                    base, iteration, ..
                } => (base.linked_node()?, *iteration),
                _ => return None,
            };
            if !module.requires_destruction(elem_struct) {
                return None;
            }
            Some(DestructionJob {
                local_name,
                kind: DestructionJobKind::Array {
                    elem_struct,
                    iteration,
                    size: size.unwrap_or(0),
                },
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FileId, Module, Node, NodeRef};
    use crate::converter::Converter;
    use crate::lexer::Lexer;
    use crate::resolver::Resolver;

    fn module_with_destructible() -> (Module, NodeRef) {
        let source = "struct R { x : int; @destructor func delete(self : *R) : void { } }";
        let lexed = Lexer::new(source, "test.ch").lex();
        let converted = Converter::new(FileId(0), "test.ch").convert(&lexed.unit);
        let mut module = Module::new();
        let file = module.add_file(converted.file);
        let mut resolver = Resolver::new(&mut module);
        resolver.resolve_file(file);
        let file_ast = module.file(file);
        let struct_id = file_ast
            .node_ids()
            .find(|id| matches!(file_ast.node(*id), Node::StructDef(_)))
            .unwrap();
        (module, NodeRef::new(file, struct_id))
    }

    fn referenced(r: NodeRef) -> Type {
        Type::Referenced {
            name: "R".into(),
            linked: Some(r),
        }
    }

    #[test]
    fn test_scope_exit_reverses_queue_order() {
        let (module, r) = module_with_destructible();
        let mut planner = DestructionPlanner::new();
        planner.enter_scope();
        planner.queue_local("a", &referenced(r), false, &module);
        planner.queue_local("b", &referenced(r), false, &module);
        planner.queue_local("c", &referenced(r), false, &module);
        let jobs = planner.exit_scope();
        let names: Vec<_> = jobs.iter().map(|j| j.local_name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
        assert!(!planner.has_pending());
    }

    #[test]
    fn test_early_return_sees_outer_scopes() {
        let (module, r) = module_with_destructible();
        let mut planner = DestructionPlanner::new();
        planner.enter_scope();
        planner.queue_local("outer", &referenced(r), false, &module);
        planner.enter_scope();
        planner.queue_local("inner", &referenced(r), false, &module);
        let names: Vec<_> = planner
            .all_pending()
            .iter()
            .map(|j| j.local_name.clone())
            .collect();
        assert_eq!(names, vec!["inner", "outer"]);
        // pending jobs stay queued; only scope exit removes them
        assert!(planner.has_pending());
    }

    #[test]
    fn test_break_unwinds_to_loop_scope() {
        let (module, r) = module_with_destructible();
        let mut planner = DestructionPlanner::new();
        planner.enter_scope(); // function body, depth 0
        planner.queue_local("outer", &referenced(r), false, &module);
        planner.enter_scope(); // loop body, depth 1
        planner.queue_local("inner", &referenced(r), false, &module);
        let names: Vec<_> = planner
            .pending_until(1)
            .iter()
            .map(|j| j.local_name.clone())
            .collect();
        assert_eq!(names, vec!["inner"]);
    }

    #[test]
    fn test_non_destructible_type_ignored() {
        let (module, _) = module_with_destructible();
        let mut planner = DestructionPlanner::new();
        planner.enter_scope();
        planner.queue_local("n", &Type::int(), false, &module);
        assert!(planner.exit_scope().is_empty());
    }

    #[test]
    fn test_array_job() {
        let (module, r) = module_with_destructible();
        let array = Type::Array {
            elem_type: Box::new(referenced(r)),
            size: Some(4),
        };
        let job = job_for_type("arr".into(), &array, false, &module).unwrap();
        assert!(matches!(
            job.kind,
            DestructionJobKind::Array { size: 4, .. }
        ));
    }
}

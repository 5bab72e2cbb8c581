//! Generic instantiation support. A generic-bearing declaration owns an
//! ordered, append-only list of iterations; every access that depends on
//! an iteration takes it as an explicit parameter. Where lowering must
//! temporarily activate an iteration, [`ActiveIterations`] brackets the
//! mutation with a save/restore guard.

use std::collections::HashMap;

use super::types::Type;
use super::NodeRef;

/// Replace referenced types naming a generic parameter with the matching
/// concrete argument. `params` and `args` pair up by index.
pub fn substitute(ty: &Type, params: &[String], args: &[Type]) -> Type {
    match ty {
        Type::Referenced { name, .. } => {
            for (i, param) in params.iter().enumerate() {
                if param == name {
                    if let Some(arg) = args.get(i) {
                        return arg.clone();
                    }
                }
            }
            ty.clone()
        }
        Type::Pointer(inner) => Type::Pointer(Box::new(substitute(inner, params, args))),
        Type::Array { elem_type, size } => Type::Array {
            elem_type: Box::new(substitute(elem_type, params, args)),
            size: *size,
        },
        Type::Function {
            params: fn_params,
            return_type,
            is_variadic,
            is_capturing,
        } => Type::Function {
            params: fn_params
                .iter()
                .map(|p| substitute(p, params, args))
                .collect(),
            return_type: Box::new(substitute(return_type, params, args)),
            is_variadic: *is_variadic,
            is_capturing: *is_capturing,
        },
        Type::Generic {
            base,
            args: generic_args,
            iteration,
        } => Type::Generic {
            base: base.clone(),
            args: generic_args
                .iter()
                .map(|a| substitute(a, params, args))
                .collect(),
            iteration: *iteration,
        },
        Type::Literal(inner) => Type::Literal(Box::new(substitute(inner, params, args))),
        Type::Struct(fields) => Type::Struct(
            fields
                .iter()
                .map(|(n, t)| (n.clone(), substitute(t, params, args)))
                .collect(),
        ),
        Type::Union(fields) => Type::Union(
            fields
                .iter()
                .map(|(n, t)| (n.clone(), substitute(t, params, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Append `args` to the iteration table unless an identical snapshot is
/// already registered; returns the iteration index either way.
pub fn register_iteration(iterations: &mut Vec<Vec<Type>>, args: Vec<Type>) -> usize {
    for (i, existing) in iterations.iter().enumerate() {
        if existing.len() == args.len()
            && existing.iter().zip(&args).all(|(a, b)| a.is_same(b))
        {
            return i;
        }
    }
    iterations.push(args);
    iterations.len() - 1
}

/// Not-set sentinel: reading an iteration that was never activated is a
/// bug in the caller, surfaced by [`ActiveIterations::get`] panicking in
/// debug builds and yielding 0 otherwise.
pub const ITERATION_NOT_SET: i64 = -1;

/// Tracks which iteration of each generic declaration lowering currently
/// navigates. Mutations go through [`ActiveIterations::activate`], which
/// returns a guard restoring the previous value on every exit path.
#[derive(Debug, Default)]
pub struct ActiveIterations {
    active: HashMap<NodeRef, i64>,
}

impl ActiveIterations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, decl: NodeRef) -> usize {
        let value = self.active.get(&decl).copied().unwrap_or(0);
        debug_assert!(value != ITERATION_NOT_SET, "iteration read before activation");
        if value < 0 {
            0
        } else {
            value as usize
        }
    }

    /// Activate `iteration` for `decl`, returning the token needed to
    /// restore the previous state. Nested activations compose because each
    /// restore is lexically paired with its activate.
    #[must_use]
    pub fn activate(&mut self, decl: NodeRef, iteration: usize) -> IterationToken {
        let prev = self
            .active
            .insert(decl, iteration as i64)
            .unwrap_or(ITERATION_NOT_SET);
        IterationToken { decl, prev }
    }

    pub fn restore(&mut self, token: IterationToken) {
        if token.prev == ITERATION_NOT_SET {
            self.active.remove(&token.decl);
        } else {
            self.active.insert(token.decl, token.prev);
        }
    }
}

/// Opaque restore token for a scoped iteration activation.
#[derive(Debug)]
#[must_use = "restore the previous iteration with ActiveIterations::restore"]
pub struct IterationToken {
    decl: NodeRef,
    prev: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FileId, NodeId};

    #[test]
    fn test_substitute_nested() {
        let params = vec!["T".to_string()];
        let args = vec![Type::int()];
        let ty = Type::Pointer(Box::new(Type::Referenced {
            name: "T".into(),
            linked: None,
        }));
        assert_eq!(
            substitute(&ty, &params, &args),
            Type::Pointer(Box::new(Type::int()))
        );
    }

    #[test]
    fn test_register_iteration_dedups() {
        let mut iterations = vec![];
        let a = register_iteration(&mut iterations, vec![Type::int()]);
        let b = register_iteration(&mut iterations, vec![Type::Float]);
        let c = register_iteration(&mut iterations, vec![Type::int()]);
        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(iterations.len(), 2);
    }

    #[test]
    fn test_activation_brackets_compose() {
        let decl = NodeRef::new(FileId(0), NodeId(7));
        let mut active = ActiveIterations::new();

        let outer = active.activate(decl, 1);
        assert_eq!(active.get(decl), 1);

        let inner = active.activate(decl, 2);
        assert_eq!(active.get(decl), 2);
        active.restore(inner);

        assert_eq!(active.get(decl), 1);
        active.restore(outer);
    }
}

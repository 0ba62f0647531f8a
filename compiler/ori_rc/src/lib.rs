//! Reference-count insertion for the Ori compiler's functional IR.
//!
//! Input declarations carry no memory management: every heap value has a
//! reference count, and this crate decides where `inc` and `dec` go so that
//! each object is freed exactly once and never while still reachable.
//!
//! This crate provides:
//!
//! - **IR** ([`Decl`], [`FnBody`], [`Expr`], [`Arg`]): a tree-shaped,
//!   join-point based IR. Statements chain through continuations.
//!
//! - **Liveness** ([`collect_live_vars`], [`LiveSet`]): free variables of a
//!   continuation, with join point live sets recorded once per declaration.
//!
//! - **Ownership** ([`OwnershipMap`], [`VarInfo`], [`Ownership`]): per-variable
//!   bookkeeping in a persistent map, so sibling branches never observe each
//!   other's bindings.
//!
//! - **RC insertion** ([`insert_rc_ops`], [`insert_rc_ops_module`]): the
//!   single-pass rewrite that makes every count operation explicit.
//!
//! - **IR checking** ([`check_input`], [`check_output`]): well-formedness
//!   of declarations before and after the pass.
//!
//! # Design
//!
//! Follows Lean 4's explicit RC pass (`src/Lean/Compiler/IR/RC.lean`):
//! borrow annotations on parameters come from an earlier inference pass,
//! owned variables must be consumed exactly once along every path, and
//! borrowed ones are never released by the code that borrows them.
//!
//! # Crate Dependencies
//!
//! No dependency on the rest of the compiler. Callee signatures arrive
//! through the [`DeclLookup`] trait.

pub mod check;
pub mod env;
pub mod ir;
pub mod liveness;
mod options;
pub mod ownership;
pub mod rc_insert;
mod stack;

#[cfg(test)]
mod interp;

pub use check::{check_input, check_output, IrError};
pub use env::{DeclIndex, DeclLookup};
pub use ir::{
    Alt, Arg, CtorInfo, Decl, Expr, FnBody, IrType, JoinPointId, LitValue, Name, Param, VarId,
};
pub use liveness::{collect_live_vars, update_join_point_live_vars, JoinPointLiveMap, LiveSet};
pub use options::{PointerWidth, RcOptions};
pub use ownership::{Ownership, OwnershipMap, VarInfo};
pub use rc_insert::{insert_rc_ops, insert_rc_ops_module, insert_rc_ops_module_parallel};

/// ARC classification for a representation type.
///
/// Inspired by Lean 4's three-way classification methods
/// (`isScalar`, `isPossibleRef`, `isDefiniteRef` on `IRType`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArcClass {
    /// No reference counting needed. The value is purely stack/register.
    ///
    /// Examples: `float`, `u8`..`u64`, `usize`, erased values.
    Scalar,

    /// Always a pointer to a reference-counted heap cell.
    DefiniteRef,

    /// Either a heap pointer or a scalar packed into the pointer bits.
    /// Treated as needing RC; the runtime skips tagged scalars.
    PossibleRef,
}

impl ArcClass {
    /// Returns `true` if this value might need reference counting.
    ///
    /// This is `true` for both `DefiniteRef` and `PossibleRef`.
    #[inline]
    pub fn needs_rc(self) -> bool {
        self != ArcClass::Scalar
    }
}

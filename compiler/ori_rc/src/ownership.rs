//! Ownership and borrow bookkeeping for RC insertion.
//!
//! Every parameter carries an [`Ownership`] annotation from borrow
//! inference: [`Borrowed`](Ownership::Borrowed) (the callee reads but never
//! releases it) or [`Owned`](Ownership::Owned) (the callee must consume it).
//!
//! While walking a declaration, RC insertion keeps one [`VarInfo`] per bound
//! variable in an [`OwnershipMap`]. The map is persistent: every update
//! returns a new map and leaves the old one intact, so the alternatives of
//! a `Case` can all start from the same snapshot.
//!
//! The free functions in this module answer the per-instruction questions
//! the visitor asks about an argument list: which occurrence is the first,
//! how many positions consume a variable, and whether it is also passed
//! somewhere as a borrow.

use std::rc::Rc;

use im_rc::{OrdMap, OrdSet};

use crate::ir::{Arg, CtorInfo, Expr, IrType, JoinPointId, LitValue, Param, VarId};
use crate::liveness::{update_join_point_live_vars, JoinPointLiveMap, LiveSet};
use crate::RcOptions;

/// Largest constructor index that fits in a tagged pointer on every
/// supported target.
const MAX_TAGGED_CIDX: u32 = (1 << 31) - 1;

/// Ownership classification for a parameter.
///
/// Inspired by Lean 4's borrow inference: parameters are either borrowed
/// (callee promises not to store the reference) or owned (callee may retain,
/// requiring the caller to hand over a reference of its own).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The callee borrows the value and never stores, returns or frees it.
    Borrowed,

    /// The callee takes ownership and must consume the value.
    Owned,
}

/// What RC insertion knows about one variable.
///
/// The default is the "not yet bound" record: nothing to count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VarInfo {
    /// The value may be a heap pointer at runtime.
    pub ref_counted: bool,
    /// The value is statically known to be an immortal global.
    pub persistent: bool,
    /// The current code owns a reference it must consume or release.
    pub consume: bool,
}

impl VarInfo {
    /// Returns `true` if the variable holds an owned heap reference that
    /// has to be consumed exactly once on every path.
    #[inline]
    pub fn must_consume(self) -> bool {
        self.ref_counted && self.consume
    }
}

/// Persistent per-declaration ownership state.
///
/// Holds the [`VarInfo`] of every variable bound so far on the current
/// path, the parameters and live sets of the enclosing join points, and
/// the borrowed join point parameters their bodies never read.
#[derive(Clone, Debug)]
pub struct OwnershipMap {
    vars: OrdMap<VarId, VarInfo>,
    join_point_params: OrdMap<JoinPointId, Rc<[Param]>>,
    join_point_live: JoinPointLiveMap,
    unused_join_point_params: OrdSet<VarId>,
    max_small_nat: u64,
}

impl OwnershipMap {
    /// Fresh, empty state for one declaration.
    pub fn new(options: &RcOptions) -> Self {
        Self {
            vars: OrdMap::new(),
            join_point_params: OrdMap::new(),
            join_point_live: JoinPointLiveMap::new(),
            unused_join_point_params: OrdSet::new(),
            max_small_nat: options.max_small_nat(),
        }
    }

    /// Info for `x`, or the default (not counted) record if `x` is not
    /// bound on this path.
    pub fn lookup(&self, x: VarId) -> VarInfo {
        self.vars.get(&x).copied().unwrap_or_default()
    }

    /// Shorthand for `self.lookup(x).must_consume()`.
    #[inline]
    pub fn must_consume(&self, x: VarId) -> bool {
        self.lookup(x).must_consume()
    }

    /// Record the binding `x : ty := expr`.
    ///
    /// - `ref_counted`: `ty` is an object type and `expr` does not produce a
    ///   scalar packed into the pointer.
    /// - `persistent`: `expr` is a nullary constructor or a global constant.
    /// - `consume`: `false` only for a projection out of a variable that is
    ///   itself not consumed here.
    #[must_use]
    pub fn update(&self, x: VarId, ty: IrType, expr: &Expr) -> Self {
        let info = VarInfo {
            ref_counted: ty.arc_class().needs_rc() && !self.is_scalar_boxed_in_tagged_ptr(expr),
            persistent: is_persistent(expr),
            consume: self.consume_expr(expr),
        };
        let mut next = self.clone();
        next.vars.insert(x, info);
        next
    }

    /// Record the parameters of a declaration or join point.
    ///
    /// Borrowed parameters are not consumed by the code that receives them.
    #[must_use]
    pub fn with_params(&self, params: &[Param]) -> Self {
        let mut next = self.clone();
        for p in params {
            next.vars.insert(
                p.var,
                VarInfo {
                    ref_counted: p.ty.arc_class().needs_rc(),
                    persistent: false,
                    consume: !p.is_borrowed(),
                },
            );
        }
        next
    }

    /// Refine `x` inside a case alternative for constructor `ctor`.
    ///
    /// A scrutinee matching a field-less constructor is a tagged scalar in
    /// that alternative and needs no counting there.
    #[must_use]
    pub fn with_ctor_info(&self, x: VarId, ctor: &CtorInfo) -> Self {
        if !is_scalar_represented_in_tag(ctor) {
            return self.clone();
        }
        match self.vars.get(&x) {
            Some(info) => {
                let mut next = self.clone();
                next.vars.insert(
                    x,
                    VarInfo {
                        ref_counted: false,
                        ..*info
                    },
                );
                next
            }
            None => self.clone(),
        }
    }

    /// Record join point `id` for the jumps in its scope.
    ///
    /// `body_live` is the live set at the entry of the (rewritten) join
    /// point body, parameters included.
    #[must_use]
    pub fn add_join_point(&self, id: JoinPointId, params: &[Param], body_live: &LiveSet) -> Self {
        let mut next = self.clone();
        next.join_point_params.insert(id, Rc::from(params));
        next.join_point_live =
            update_join_point_live_vars(&self.join_point_live, id, params, body_live.clone());
        for p in params {
            if p.is_borrowed() && !body_live.contains(&p.var) {
                next.unused_join_point_params.insert(p.var);
            }
        }
        next
    }

    /// Parameters of join point `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not declared on this path: a jump to an undeclared
    /// join point is malformed IR from an earlier pass.
    pub fn join_point_params(&self, id: JoinPointId) -> Rc<[Param]> {
        match self.join_point_params.get(&id) {
            Some(params) => Rc::clone(params),
            None => panic!("internal compiler error: jump to undeclared join point {id}"),
        }
    }

    /// Variables the body of join point `id` reads from its enclosing scope.
    pub fn join_point_live_vars(&self, id: JoinPointId) -> LiveSet {
        self.join_point_live.get(&id).cloned().unwrap_or_default()
    }

    /// Live sets of every join point in scope.
    pub fn join_point_live_map(&self) -> &JoinPointLiveMap {
        &self.join_point_live
    }

    /// Returns `true` if `x` is a borrowed join point parameter that its
    /// join point body never reads.
    pub fn is_unused_join_point_param(&self, x: VarId) -> bool {
        self.unused_join_point_params.contains(&x)
    }

    /// A projection out of a non-consumed variable is not consumed either.
    fn consume_expr(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Project { value, .. } => self.vars.get(value).map_or(true, |info| info.consume),
            _ => true,
        }
    }

    fn is_scalar_boxed_in_tagged_ptr(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Construct { ctor, .. } => is_scalar_represented_in_tag(ctor),
            Expr::Lit(LitValue::Num(n)) => *n <= self.max_small_nat,
            _ => false,
        }
    }
}

/// Nullary constructors and global constants are immortal.
fn is_persistent(expr: &Expr) -> bool {
    match expr {
        Expr::Construct { ctor, args } => args.is_empty() && ctor.is_scalar(),
        Expr::Apply { args, .. } => args.is_empty(),
        _ => false,
    }
}

/// Returns `true` if values of `ctor` are never heap allocated: no fields
/// of any kind, and a tag that fits in the spare bits of a pointer.
pub fn is_scalar_represented_in_tag(ctor: &CtorInfo) -> bool {
    ctor.size == 0 && ctor.usize == 0 && ctor.ssize == 0 && ctor.cidx <= MAX_TAGGED_CIDX
}

/// Returns `true` if no earlier position of `args` holds the same argument
/// as position `i`.
///
/// Scanning is left to right, so the earliest textual occurrence is the one
/// charged with any shared `inc`/`dec`.
pub fn is_first_occurrence(args: &[Arg], i: usize) -> bool {
    let x = args[i];
    args[..i].iter().all(|&y| y != x)
}

/// Returns `true` if a call with these `formals` consumes argument position `i`.
///
/// Positions without a matching formal (unknown callee, or extra arguments)
/// are treated as owned.
pub fn consumes_position(formals: &[Param], i: usize) -> bool {
    formals.get(i).map_or(true, |p| !p.is_borrowed())
}

/// Returns `true` if `x` occurs in `args` at some position that is not
/// consumed, i.e. it is also passed as a borrow.
pub fn is_borrowed_anywhere(x: VarId, args: &[Arg], consumed: impl Fn(usize) -> bool) -> bool {
    args.iter()
        .enumerate()
        .any(|(i, a)| *a == Arg::Var(x) && !consumed(i))
}

/// Returns `true` if the variable at `args[arg_index]` is passed to a
/// borrowed formal of the callee (at this or any other position).
///
/// When the same variable is passed both borrowed and owned, the caller
/// must keep its own reference alive across the call, so every position
/// of that variable is counted as a borrow for `dec` placement.
pub fn is_borrow_param(arg_index: usize, formals: &[Param], args: &[Arg]) -> bool {
    match args[arg_index] {
        Arg::Var(x) => is_borrowed_anywhere(x, args, |i| consumes_position(formals, i)),
        Arg::Irrelevant => false,
    }
}

/// Number of positions of `args` that pass `x` to a consuming parameter.
pub fn num_consuming_uses(x: VarId, args: &[Arg], consumed: impl Fn(usize) -> bool) -> u32 {
    let n = args
        .iter()
        .enumerate()
        .filter(|&(i, a)| *a == Arg::Var(x) && consumed(i))
        .count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

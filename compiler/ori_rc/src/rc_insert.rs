//! RC insertion pass for the functional IR.
//!
//! Rewrites a declaration so that every reference count operation is
//! explicit: each owned heap reference is consumed exactly once along every
//! path, either by an instruction that takes ownership (a constructor, an
//! owned call argument, a return) or by an inserted `dec`.
//!
//! # Algorithm
//!
//! A single recursive walk over [`FnBody`]. Each step rewrites the
//! continuation first and gets back its live set, then decides what the
//! current statement needs:
//!
//! 1. **Bindings**: arguments passed to consuming positions get an `inc`
//!    unless this is their last use, in which case ownership moves. After a
//!    full application, owned variables the callee only borrowed get a `dec`
//!    when they are dead. Projections out of an owned parent `inc` the field
//!    and release the parent if it is dead.
//!
//! 2. **Case**: every alternative starts with a `dec` for each owned
//!    variable live into the case that the alternative never reads.
//!
//! 3. **Join points / declarations**: owned parameters the body never reads
//!    are released on entry.
//!
//! 4. **Return**: a borrowed reference is `inc`ed before it escapes.
//!
//! 5. **Jump**: arguments are treated like a call to the join point, whose
//!    parameters carry the borrow annotations.
//!
//! Per-variable facts live in a persistent [`OwnershipMap`], so sibling
//! alternatives each start from the snapshot at the `Case`.
//!
//! # References
//!
//! - Lean 4: `src/Lean/Compiler/IR/RC.lean`
//! - Ullrich & de Moura, "Counting Immutable Beans" (IFL 2019)

use rayon::prelude::*;

use crate::check::check_input;
use crate::env::{DeclIndex, DeclLookup};
use crate::ir::{Alt, Arg, Decl, Expr, FnBody, IrType, JoinPointId, Name, Param, VarId};
use crate::liveness::{collect_live_vars, LiveSet};
use crate::ownership::{
    consumes_position, is_borrow_param, is_borrowed_anywhere, is_first_occurrence,
    num_consuming_uses, OwnershipMap, VarInfo,
};
use crate::stack::ensure_sufficient_stack;
use crate::RcOptions;

/// Insert `inc`/`dec` statements into one declaration.
///
/// Callee borrow annotations come from `env`; a callee it does not know
/// is assumed to own all of its parameters. Extern declarations are
/// returned unchanged.
///
/// # Panics
///
/// When `options.check_input` is set, panics if `decl` fails
/// [`check_input`]. Independently, a jump to an undeclared join point
/// always panics. Both indicate a bug in an earlier phase.
pub fn insert_rc_ops<E: DeclLookup + ?Sized>(decl: Decl, env: &E, options: &RcOptions) -> Decl {
    if options.check_input {
        if let Err(err) = check_input(&decl, env) {
            panic!("internal compiler error: malformed input to RC insertion: {err}");
        }
    }

    let (name, params, ret_ty, body) = match decl {
        Decl::Fn {
            name,
            params,
            ret_ty,
            body,
        } => (name, params, ret_ty, body),
        Decl::Extern { .. } => return decl,
    };

    tracing::debug!(function = %name, "inserting RC operations");

    let mut inserter = RcInserter {
        env,
        function: name,
        incs: 0,
        decs: 0,
    };
    let map = OwnershipMap::new(options).with_params(&params);
    let (body, live) = inserter.visit(body, &map);
    let body = inserter.add_dec_for_dead_params(&map, &params, body, &live);

    tracing::debug!(
        function = %name,
        incs = inserter.incs,
        decs = inserter.decs,
        "RC insertion complete"
    );

    Decl::Fn {
        name,
        params,
        ret_ty,
        body,
    }
}

/// Insert RC operations into every declaration of a module.
///
/// Calls are resolved among `decls` themselves.
pub fn insert_rc_ops_module(decls: &[Decl], options: &RcOptions) -> Vec<Decl> {
    let index = DeclIndex::new(decls);
    decls
        .iter()
        .map(|decl| insert_rc_ops(decl.clone(), &index, options))
        .collect()
}

/// Parallel [`insert_rc_ops_module`]: declarations are independent, so
/// each one is rewritten on the rayon pool. Output order matches `decls`.
pub fn insert_rc_ops_module_parallel(decls: &[Decl], options: &RcOptions) -> Vec<Decl> {
    let index = DeclIndex::new(decls);
    decls
        .par_iter()
        .map(|decl| insert_rc_ops(decl.clone(), &index, options))
        .collect()
}

/// Walk state for one declaration.
struct RcInserter<'a, E: ?Sized> {
    env: &'a E,
    function: Name,
    incs: usize,
    decs: usize,
}

impl<E: DeclLookup + ?Sized> RcInserter<'_, E> {
    // ── Emission ────────────────────────────────────────────────────

    fn add_inc(&mut self, x: VarId, info: VarInfo, count: u32, reason: &str, body: FnBody) -> FnBody {
        if count == 0 {
            return body;
        }
        tracing::trace!(function = %self.function, var = %x, count, reason, "inc");
        self.incs += 1;
        FnBody::inc(x, count, info.persistent, body)
    }

    fn add_dec(&mut self, x: VarId, info: VarInfo, reason: &str, body: FnBody) -> FnBody {
        tracing::trace!(function = %self.function, var = %x, reason, "dec");
        self.decs += 1;
        FnBody::dec(x, info.persistent, body)
    }

    /// `dec x` if `x` is owned here and `live` does not need it.
    fn add_dec_if_needed(
        &mut self,
        map: &OwnershipMap,
        x: VarId,
        live: &LiveSet,
        reason: &str,
        body: FnBody,
    ) -> FnBody {
        let info = map.lookup(x);
        if info.must_consume() && !live.contains(&x) {
            self.add_dec(x, info, reason, body)
        } else {
            body
        }
    }

    /// `inc` each ref-counted argument once per consuming position, minus
    /// one when this is the last use of an owned variable that no position
    /// borrows: that reference moves into the instruction.
    ///
    /// `live_after` is the live set of the code following the instruction.
    fn add_inc_before(
        &mut self,
        map: &OwnershipMap,
        args: &[Arg],
        consumed: impl Fn(usize) -> bool + Copy,
        live_after: &LiveSet,
        body: FnBody,
    ) -> FnBody {
        let mut body = body;
        for (i, arg) in args.iter().enumerate() {
            let Arg::Var(x) = *arg else { continue };
            let info = map.lookup(x);
            if !info.ref_counted || !is_first_occurrence(args, i) {
                continue;
            }
            let uses = num_consuming_uses(x, args, consumed);
            let count = if !info.consume
                || live_after.contains(&x)
                || is_borrowed_anywhere(x, args, consumed)
            {
                uses
            } else {
                uses.saturating_sub(1)
            };
            body = self.add_inc(x, info, count, "consumed argument", body);
        }
        body
    }

    /// `dec` owned arguments that were only lent to the callee and are
    /// dead afterwards.
    fn add_dec_after_full_app(
        &mut self,
        map: &OwnershipMap,
        args: &[Arg],
        formals: &[Param],
        live_after: &LiveSet,
        body: FnBody,
    ) -> FnBody {
        let mut body = body;
        for (i, arg) in args.iter().enumerate() {
            let Arg::Var(x) = *arg else { continue };
            let info = map.lookup(x);
            if info.must_consume()
                && is_first_occurrence(args, i)
                && is_borrow_param(i, formals, args)
                && !live_after.contains(&x)
            {
                body = self.add_dec(x, info, "borrowed by callee", body);
            }
        }
        body
    }

    /// `dec` owned parameters the body never reads.
    fn add_dec_for_dead_params(
        &mut self,
        map: &OwnershipMap,
        params: &[Param],
        body: FnBody,
        live: &LiveSet,
    ) -> FnBody {
        let mut body = body;
        for p in params {
            if !p.is_borrowed() && p.ty.is_obj() && !live.contains(&p.var) {
                body = self.add_dec(p.var, map.lookup(p.var), "dead parameter", body);
            }
        }
        body
    }

    /// `dec` owned variables live into a case that this alternative drops.
    fn add_dec_for_alt(
        &mut self,
        map: &OwnershipMap,
        case_live: &LiveSet,
        alt_live: &LiveSet,
        body: FnBody,
    ) -> FnBody {
        let mut body = body;
        for &x in case_live {
            body = self.add_dec_if_needed(map, x, alt_live, "unused in alternative", body);
        }
        body
    }

    // ── Walk ────────────────────────────────────────────────────────

    /// Rewrite `body`, returning it with its live set.
    fn visit(&mut self, body: FnBody, map: &OwnershipMap) -> (FnBody, LiveSet) {
        ensure_sufficient_stack(|| self.visit_fn_body(body, map))
    }

    fn visit_fn_body(&mut self, body: FnBody, map: &OwnershipMap) -> (FnBody, LiveSet) {
        match body {
            FnBody::Let {
                dst,
                ty,
                value,
                cont,
            } => {
                let map = map.update(dst, ty, &value);
                let (cont, cont_live) = self.visit(*cont, &map);
                self.process_binding(&map, dst, ty, value, cont, cont_live)
            }

            FnBody::Join {
                id,
                params,
                body,
                cont,
            } => {
                let body_map = map.with_params(&params);
                let (body, body_live) = self.visit(*body, &body_map);
                let body = self.add_dec_for_dead_params(&body_map, &params, body, &body_live);
                let map = map.add_join_point(id, &params, &body_live);
                let (cont, cont_live) = self.visit(*cont, &map);
                (FnBody::join(id, params, body, cont), cont_live)
            }

            // Field stores, plus RC ops that only survive with input
            // checking off, are kept as written.
            mut stmt @ (FnBody::USet { .. }
            | FnBody::SSet { .. }
            | FnBody::RcInc { .. }
            | FnBody::RcDec { .. }) => {
                let cont = stmt.take_continuation().unwrap_or(FnBody::Unreachable);
                let (cont, mut live) = self.visit(cont, map);
                live.extend(stmt.used_vars());
                (stmt.with_continuation(cont), live)
            }

            FnBody::Case {
                type_name,
                scrutinee,
                ty,
                alts,
            } => self.visit_case(map, type_name, scrutinee, ty, alts),

            FnBody::Ret { value } => match value {
                Arg::Var(x) => {
                    let info = map.lookup(x);
                    let body = FnBody::ret(x);
                    let body = if info.ref_counted && !info.consume {
                        self.add_inc(x, info, 1, "borrowed value returned", body)
                    } else {
                        body
                    };
                    (body, LiveSet::unit(x))
                }
                Arg::Irrelevant => (FnBody::Ret { value }, LiveSet::new()),
            },

            FnBody::Jump { target, args } => self.visit_jump(map, target, args),

            FnBody::Unreachable => (FnBody::Unreachable, LiveSet::new()),
        }
    }

    /// Wrap the rewritten continuation of `dst := value` with the counting
    /// operations `value` needs, and return the live set before the binding.
    fn process_binding(
        &mut self,
        map: &OwnershipMap,
        dst: VarId,
        ty: IrType,
        value: Expr,
        cont: FnBody,
        cont_live: LiveSet,
    ) -> (FnBody, LiveSet) {
        let used = value.used_vars();

        // A dead owned result is released right away. Projections never
        // own their result unless they `inc` it below.
        let dst_info = map.lookup(dst);
        let dead = !cont_live.contains(&dst);
        let cont = if dead && dst_info.must_consume() && !matches!(value, Expr::Project { .. }) {
            self.add_dec(dst, dst_info, "dead binding", cont)
        } else {
            cont
        };

        let body = match &value {
            Expr::Construct { args, .. }
            | Expr::Reuse { args, .. }
            | Expr::PartialApply { args, .. } => {
                let args = args.clone();
                let body = FnBody::bind(dst, ty, value, cont);
                self.add_inc_before(map, &args, |_| true, &cont_live, body)
            }

            Expr::ApplyIndirect { closure, args } => {
                let mut all = args.clone();
                all.push(Arg::Var(*closure));
                let body = FnBody::bind(dst, ty, value, cont);
                self.add_inc_before(map, &all, |_| true, &cont_live, body)
            }

            Expr::Box { value: x } => {
                let args = [Arg::Var(*x)];
                let body = FnBody::bind(dst, ty, value, cont);
                self.add_inc_before(map, &args, |_| true, &cont_live, body)
            }

            Expr::Project { value: x, .. } => {
                let x = *x;
                let cont = self.add_dec_if_needed(map, x, &cont_live, "parent of projection", cont);
                let cont = if map.lookup(x).consume && dst_info.ref_counted && !dead {
                    self.add_inc(dst, dst_info, 1, "projection from owned parent", cont)
                } else {
                    cont
                };
                FnBody::bind(dst, ty, value, cont)
            }

            Expr::UProject { value: x, .. }
            | Expr::SProject { value: x, .. }
            | Expr::Unbox { value: x } => {
                let cont = self.add_dec_if_needed(map, *x, &cont_live, "scalar read", cont);
                FnBody::bind(dst, ty, value, cont)
            }

            Expr::Apply { func, args } => {
                let args = args.clone();
                let env = self.env;
                let formals: &[Param] = env.callee_params(*func).unwrap_or(&[]);
                let cont = self.add_dec_after_full_app(map, &args, formals, &cont_live, cont);
                let body = FnBody::bind(dst, ty, value, cont);
                self.add_inc_before(map, &args, |i| consumes_position(formals, i), &cont_live, body)
            }

            Expr::Reset { .. } | Expr::Lit(_) | Expr::IsShared { .. } => {
                FnBody::bind(dst, ty, value, cont)
            }
        };

        let mut live = cont_live;
        live.extend(used);
        live.remove(&dst);
        (body, live)
    }

    fn visit_case(
        &mut self,
        map: &OwnershipMap,
        type_name: Name,
        scrutinee: VarId,
        ty: IrType,
        alts: Vec<Alt>,
    ) -> (FnBody, LiveSet) {
        let mut case_live = LiveSet::unit(scrutinee);
        let mut visited = Vec::with_capacity(alts.len());
        for alt in alts {
            let (ctor, body) = match alt {
                Alt::Ctor { ctor, body } => (Some(ctor), body),
                Alt::Default { body } => (None, body),
            };
            let alt_map = match &ctor {
                Some(ctor) => map.with_ctor_info(scrutinee, ctor),
                None => map.clone(),
            };
            let (body, alt_live) = self.visit(body, &alt_map);
            case_live = case_live.union(alt_live.clone());
            visited.push((ctor, alt_map, body, alt_live));
        }

        let mut new_alts = Vec::with_capacity(visited.len());
        for (ctor, alt_map, body, alt_live) in visited {
            let body = self.add_dec_for_alt(&alt_map, &case_live, &alt_live, body);
            new_alts.push(match ctor {
                Some(ctor) => Alt::Ctor { ctor, body },
                None => Alt::Default { body },
            });
        }

        let body = FnBody::Case {
            type_name,
            scrutinee,
            ty,
            alts: new_alts,
        };
        (body, case_live)
    }

    /// A jump passes its arguments to the join point parameters like a
    /// call. Jump targets are in scope, so their parameters and live sets
    /// are recorded in `map`.
    fn visit_jump(
        &mut self,
        map: &OwnershipMap,
        target: JoinPointId,
        args: Vec<Arg>,
    ) -> (FnBody, LiveSet) {
        let params = map.join_point_params(target);
        let jp_live = map.join_point_live_vars(target);
        let body = FnBody::jump(target, args.clone());
        let body = self.add_dec_for_lent_jump_args(map, target, &args, &params, &jp_live, body);
        let body = self.add_inc_before(
            map,
            &args,
            |i| consumes_position(&params, i),
            &jp_live,
            body,
        );
        let live = collect_live_vars(&body, map.join_point_live_map(), LiveSet::new());
        (body, live)
    }

    /// Owned arguments whose last use is a borrowed join point parameter.
    ///
    /// The join point body never releases a borrowed parameter, so the
    /// reference is dropped before the jump when the body does not read
    /// the parameter. A parameter that is read would be freed under the
    /// body's feet. `check_input` rejects that shape as
    /// [`IrError::OwnedArgToBorrowedJoinParam`](crate::IrError::OwnedArgToBorrowedJoinParam); with the
    /// check off it is reported and left alone.
    fn add_dec_for_lent_jump_args(
        &mut self,
        map: &OwnershipMap,
        target: JoinPointId,
        args: &[Arg],
        params: &[Param],
        jp_live: &LiveSet,
        body: FnBody,
    ) -> FnBody {
        let mut body = body;
        for (i, arg) in args.iter().enumerate() {
            let Arg::Var(x) = *arg else { continue };
            let info = map.lookup(x);
            if !info.must_consume() || !is_first_occurrence(args, i) || jp_live.contains(&x) {
                continue;
            }
            let mut lent_to = args
                .iter()
                .zip(params)
                .filter(|(a, p)| **a == Arg::Var(x) && p.is_borrowed())
                .map(|(_, p)| p.var)
                .peekable();
            if lent_to.peek().is_none() {
                continue;
            }
            if lent_to.all(|p| map.is_unused_join_point_param(p)) {
                body = self.add_dec(x, info, "lent to unused join point parameter", body);
            } else {
                tracing::warn!(
                    function = %self.function,
                    var = %x,
                    join_point = %target,
                    "owned value passed to a borrowed join point parameter is never released"
                );
            }
        }
        body
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    reason = "tests use unwrap for concise assertions"
)]

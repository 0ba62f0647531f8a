//! Well-formedness checks around RC insertion.
//!
//! [`check_input`] states what the pass assumes of its input; a failure
//! there is a bug in an earlier phase. [`check_output`] checks the same
//! scoping rules on the rewritten declaration, now allowing the `inc`/`dec`
//! statements the pass produced.
//!
//! Scoping is checked with persistent sets, so every case alternative and
//! join point body starts from its own view of the enclosing scope.

use std::rc::Rc;

use im_rc::{OrdMap, OrdSet};
use rustc_hash::FxHashSet;

use crate::env::DeclLookup;
use crate::ir::{Arg, Decl, Expr, FnBody, IrType, JoinPointId, Name, Param, VarId};
use crate::liveness::{collect_live_vars, update_join_point_live_vars, JoinPointLiveMap, LiveSet};
use crate::stack::ensure_sufficient_stack;

/// A violated IR invariant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("in `{decl}`: variable {var} is used outside the scope of its binding")]
    UnboundVar { decl: Name, var: VarId },
    #[error("in `{decl}`: variable {var} is bound more than once")]
    DuplicateBinding { decl: Name, var: VarId },
    #[error("in `{decl}`: jump to undeclared join point {target}")]
    UnknownJoinPoint { decl: Name, target: JoinPointId },
    #[error("in `{decl}`: jump to {target} passes {found} arguments, expected {expected}")]
    JumpArity {
        decl: Name,
        target: JoinPointId,
        expected: usize,
        found: usize,
    },
    #[error("in `{decl}`: unexpected RC operation on {var} before RC insertion")]
    RcOpPresent { decl: Name, var: VarId },
    #[error("in `{decl}`: call to `{callee}` passes {found} arguments, expected {expected}")]
    CallArity {
        decl: Name,
        callee: Name,
        expected: usize,
        found: usize,
    },
    #[error("in `{decl}`: case on {scrutinee} has no alternatives")]
    CaseWithoutAlts { decl: Name, scrutinee: VarId },
    #[error(
        "in `{decl}`: owned {var} is passed to a borrowed parameter of {target} that its body reads"
    )]
    OwnedArgToBorrowedJoinParam {
        decl: Name,
        target: JoinPointId,
        var: VarId,
    },
}

/// Check a declaration before RC insertion.
///
/// Besides scoping, the input must not contain any `inc`/`dec`, and no
/// jump may pass an owned variable to a borrowed join point parameter
/// that the join point body reads. Nothing could release that variable:
/// the body only borrows it and the jump is its last use. Borrow inference
/// makes such a parameter owned.
pub fn check_input<E: DeclLookup + ?Sized>(decl: &Decl, env: &E) -> Result<(), IrError> {
    check_decl(decl, env, false)
}

/// Check a declaration after RC insertion.
pub fn check_output<E: DeclLookup + ?Sized>(decl: &Decl, env: &E) -> Result<(), IrError> {
    check_decl(decl, env, true)
}

fn check_decl<E: DeclLookup + ?Sized>(decl: &Decl, env: &E, allow_rc: bool) -> Result<(), IrError> {
    let Decl::Fn {
        name, params, body, ..
    } = decl
    else {
        return Ok(());
    };
    let mut checker = Checker {
        decl: *name,
        env,
        allow_rc,
        seen: FxHashSet::default(),
    };
    let scope = checker.bind_params(&Scope::default(), params)?;
    checker.check_body(body, scope)
}

/// Variables and join points visible at one program point.
#[derive(Clone, Default)]
struct Scope {
    vars: OrdSet<VarId>,
    /// Object variables this code holds a reference of its own to.
    owned: OrdSet<VarId>,
    join_points: OrdMap<JoinPointId, JoinPointInfo>,
    /// Free variables of each join point body, parameters excluded.
    join_point_live: JoinPointLiveMap,
}

#[derive(Clone)]
struct JoinPointInfo {
    params: Rc<[Param]>,
    /// Borrowed parameters the body reads.
    read_borrowed: OrdSet<VarId>,
}

impl Scope {
    fn bind_owned(&mut self, var: VarId, ty: IrType, owned: bool) {
        if owned && ty.is_obj() {
            self.owned.insert(var);
        }
    }
}

struct Checker<'a, E: ?Sized> {
    decl: Name,
    env: &'a E,
    allow_rc: bool,
    /// Every variable bound anywhere in the declaration so far.
    seen: FxHashSet<VarId>,
}

impl<E: DeclLookup + ?Sized> Checker<'_, E> {
    fn bind(&mut self, scope: &mut Scope, var: VarId) -> Result<(), IrError> {
        if !self.seen.insert(var) {
            return Err(IrError::DuplicateBinding {
                decl: self.decl,
                var,
            });
        }
        scope.vars.insert(var);
        Ok(())
    }

    fn bind_params(&mut self, scope: &Scope, params: &[Param]) -> Result<Scope, IrError> {
        let mut scope = scope.clone();
        for p in params {
            self.bind(&mut scope, p.var)?;
            scope.bind_owned(p.var, p.ty, !p.is_borrowed());
        }
        Ok(scope)
    }

    fn use_var(&self, scope: &Scope, var: VarId) -> Result<(), IrError> {
        if scope.vars.contains(&var) {
            Ok(())
        } else {
            Err(IrError::UnboundVar {
                decl: self.decl,
                var,
            })
        }
    }

    fn use_args(&self, scope: &Scope, args: &[Arg]) -> Result<(), IrError> {
        args.iter()
            .filter_map(|a| a.as_var())
            .try_for_each(|x| self.use_var(scope, x))
    }

    /// Reject owned arguments lent to a borrowed parameter that `target`'s
    /// body reads, unless the body also reads the variable itself.
    fn check_lent_args(
        &self,
        scope: &Scope,
        target: JoinPointId,
        info: &JoinPointInfo,
        args: &[Arg],
    ) -> Result<(), IrError> {
        let free = scope.join_point_live.get(&target);
        for (arg, param) in args.iter().zip(info.params.iter()) {
            let Some(x) = arg.as_var() else { continue };
            if scope.owned.contains(&x)
                && info.read_borrowed.contains(&param.var)
                && !free.is_some_and(|live| live.contains(&x))
            {
                return Err(IrError::OwnedArgToBorrowedJoinParam {
                    decl: self.decl,
                    target,
                    var: x,
                });
            }
        }
        Ok(())
    }

    fn check_expr(&self, scope: &Scope, expr: &Expr) -> Result<(), IrError> {
        for x in expr.used_vars() {
            self.use_var(scope, x)?;
        }
        if let Expr::Apply { func, args } = expr {
            if let Some(formals) = self.env.callee_params(*func) {
                if formals.len() != args.len() {
                    return Err(IrError::CallArity {
                        decl: self.decl,
                        callee: *func,
                        expected: formals.len(),
                        found: args.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Walks the statement spine in place; recursion only for join point
    /// bodies and case alternatives.
    fn check_body(&mut self, body: &FnBody, mut scope: Scope) -> Result<(), IrError> {
        let mut cur = body;
        loop {
            match cur {
                FnBody::Let {
                    dst,
                    ty,
                    value,
                    cont,
                } => {
                    self.check_expr(&scope, value)?;
                    self.bind(&mut scope, *dst)?;
                    // A projection owns its field only if it owns the parent.
                    let owned = match value {
                        Expr::Project { value: parent, .. } => scope.owned.contains(parent),
                        _ => true,
                    };
                    scope.bind_owned(*dst, *ty, owned);
                    cur = cont;
                }
                FnBody::Join {
                    id,
                    params,
                    body,
                    cont,
                } => {
                    let body_scope = self.bind_params(&scope, params)?;
                    ensure_sufficient_stack(|| self.check_body(body, body_scope))?;
                    let body_live = collect_live_vars(body, &scope.join_point_live, LiveSet::new());
                    let read_borrowed = params
                        .iter()
                        .filter(|p| p.is_borrowed() && body_live.contains(&p.var))
                        .map(|p| p.var)
                        .collect();
                    scope.join_point_live = update_join_point_live_vars(
                        &scope.join_point_live,
                        *id,
                        params,
                        body_live,
                    );
                    scope.join_points.insert(
                        *id,
                        JoinPointInfo {
                            params: Rc::from(params.as_slice()),
                            read_borrowed,
                        },
                    );
                    cur = cont;
                }
                FnBody::USet {
                    var, value, cont, ..
                }
                | FnBody::SSet {
                    var, value, cont, ..
                } => {
                    self.use_var(&scope, *var)?;
                    self.use_var(&scope, *value)?;
                    cur = cont;
                }
                FnBody::RcInc { var, cont, .. } | FnBody::RcDec { var, cont, .. } => {
                    if !self.allow_rc {
                        return Err(IrError::RcOpPresent {
                            decl: self.decl,
                            var: *var,
                        });
                    }
                    self.use_var(&scope, *var)?;
                    cur = cont;
                }
                FnBody::Case {
                    scrutinee, alts, ..
                } => {
                    self.use_var(&scope, *scrutinee)?;
                    if alts.is_empty() {
                        return Err(IrError::CaseWithoutAlts {
                            decl: self.decl,
                            scrutinee: *scrutinee,
                        });
                    }
                    for alt in alts {
                        let alt_scope = scope.clone();
                        ensure_sufficient_stack(|| self.check_body(alt.body(), alt_scope))?;
                    }
                    return Ok(());
                }
                FnBody::Ret { value } => {
                    return match value.as_var() {
                        Some(x) => self.use_var(&scope, x),
                        None => Ok(()),
                    };
                }
                FnBody::Jump { target, args } => {
                    let Some(info) = scope.join_points.get(target) else {
                        return Err(IrError::UnknownJoinPoint {
                            decl: self.decl,
                            target: *target,
                        });
                    };
                    if info.params.len() != args.len() {
                        return Err(IrError::JumpArity {
                            decl: self.decl,
                            target: *target,
                            expected: info.params.len(),
                            found: args.len(),
                        });
                    }
                    self.use_args(&scope, args)?;
                    if self.allow_rc {
                        return Ok(());
                    }
                    return self.check_lent_args(&scope, *target, info, args);
                }
                FnBody::Unreachable => return Ok(()),
            }
        }
    }
}

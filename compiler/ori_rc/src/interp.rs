//! Instrumented interpreter for rewritten declarations.
//!
//! Runs IR after RC insertion against a heap that tracks a reference count
//! per object and frees cells when the count reaches zero, like the
//! runtime would. Dereferencing a freed cell is an error; holding or
//! passing a dangling reference is not, since the runtime never notices.
//!
//! [`check_balance`] is the harness: it calls an entry function, releases
//! the result and every argument the callee only borrowed, and then
//! requires every non-persistent object to be freed.

use rustc_hash::FxHashMap;

use crate::env::{DeclIndex, DeclLookup};
use crate::ir::{
    Alt, Arg, CtorInfo, Decl, Expr, FnBody, IrType, JoinPointId, LitValue, Name, Param, VarId,
};
use crate::ownership::is_scalar_represented_in_tag;
use crate::RcOptions;

/// Index of a heap cell.
pub(crate) type ObjId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Value {
    Obj(ObjId),
    /// Scalar packed into a pointer (nullary constructor tag or small number).
    Tagged(u64),
    /// Unboxed machine scalar.
    Scalar(u64),
    Irrelevant,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum BalanceError {
    #[error("object {0} accessed after it was freed")]
    UseAfterFree(ObjId),
    #[error("objects {0:?} are still alive after the entry function returned")]
    Leak(Vec<ObjId>),
    #[error("variable {0} has no value")]
    Unbound(VarId),
    #[error("evaluation ran out of fuel")]
    OutOfFuel,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug)]
enum ObjKind {
    Ctor {
        cidx: u32,
        fields: Vec<Value>,
        scalars: FxHashMap<(u32, u32), u64>,
    },
    Closure {
        func: Name,
        captured: Vec<Value>,
    },
    Str,
    Boxed(u64),
}

#[derive(Debug)]
struct HeapObj {
    rc: u32,
    freed: bool,
    persistent: bool,
    kind: ObjKind,
}

/// Per-call state. Variables are unique within a declaration, so one flat
/// map per frame covers every scope.
#[derive(Default)]
struct Frame<'p> {
    vars: FxHashMap<VarId, Value>,
    join_points: FxHashMap<JoinPointId, (&'p [Param], &'p FnBody)>,
}

impl Frame<'_> {
    fn get(&self, x: VarId) -> Result<Value, BalanceError> {
        self.vars.get(&x).copied().ok_or(BalanceError::Unbound(x))
    }

    fn arg(&self, a: Arg) -> Result<Value, BalanceError> {
        match a {
            Arg::Var(x) => self.get(x),
            Arg::Irrelevant => Ok(Value::Irrelevant),
        }
    }

    fn args(&self, args: &[Arg]) -> Result<Vec<Value>, BalanceError> {
        args.iter().map(|&a| self.arg(a)).collect()
    }
}

pub(crate) struct Machine<'p> {
    program: DeclIndex<'p>,
    options: RcOptions,
    heap: Vec<HeapObj>,
    globals: FxHashMap<Name, Value>,
    fuel: u64,
}

impl<'p> Machine<'p> {
    pub(crate) fn new(program: &'p [Decl], options: &RcOptions) -> Self {
        Self {
            program: DeclIndex::new(program),
            options: options.clone(),
            heap: Vec::new(),
            globals: FxHashMap::default(),
            fuel: 100_000,
        }
    }

    fn alloc(&mut self, kind: ObjKind) -> Value {
        self.heap.push(HeapObj {
            rc: 1,
            freed: false,
            persistent: false,
            kind,
        });
        Value::Obj(self.heap.len() - 1)
    }

    /// Allocate a constructor value owning `fields`.
    pub(crate) fn alloc_ctor(&mut self, ctor: &CtorInfo, fields: Vec<Value>) -> Value {
        if is_scalar_represented_in_tag(ctor) {
            return Value::Tagged(u64::from(ctor.cidx));
        }
        self.alloc(ObjKind::Ctor {
            cidx: ctor.cidx,
            fields,
            scalars: FxHashMap::default(),
        })
    }

    fn live_obj(&mut self, id: ObjId) -> Result<&mut HeapObj, BalanceError> {
        let obj = &mut self.heap[id];
        if obj.freed {
            Err(BalanceError::UseAfterFree(id))
        } else {
            Ok(obj)
        }
    }

    fn inc(&mut self, v: Value, count: u32) -> Result<(), BalanceError> {
        if let Value::Obj(id) = v {
            let obj = self.live_obj(id)?;
            if !obj.persistent {
                obj.rc += count;
            }
        }
        Ok(())
    }

    /// Drop one reference, freeing the cell and releasing its children
    /// when it was the last one.
    pub(crate) fn dec(&mut self, v: Value) -> Result<(), BalanceError> {
        let mut pending = vec![v];
        while let Some(v) = pending.pop() {
            let Value::Obj(id) = v else { continue };
            let obj = self.live_obj(id)?;
            if obj.persistent {
                continue;
            }
            obj.rc -= 1;
            if obj.rc == 0 {
                obj.freed = true;
                match &mut obj.kind {
                    ObjKind::Ctor { fields, .. } => pending.append(fields),
                    ObjKind::Closure { captured, .. } => pending.append(captured),
                    ObjKind::Str | ObjKind::Boxed(_) => {}
                }
            }
        }
        Ok(())
    }

    fn mark_persistent(&mut self, v: Value) {
        let mut pending = vec![v];
        while let Some(v) = pending.pop() {
            let Value::Obj(id) = v else { continue };
            let obj = &mut self.heap[id];
            if obj.persistent {
                continue;
            }
            obj.persistent = true;
            match &obj.kind {
                ObjKind::Ctor { fields, .. } => pending.extend(fields.iter().copied()),
                ObjKind::Closure { captured, .. } => pending.extend(captured.iter().copied()),
                ObjKind::Str | ObjKind::Boxed(_) => {}
            }
        }
    }

    fn ctor_of(&mut self, v: Value) -> Result<u32, BalanceError> {
        match v {
            Value::Tagged(c) => {
                u32::try_from(c).map_err(|_| BalanceError::Unsupported("tag out of range"))
            }
            Value::Obj(id) => match &self.live_obj(id)?.kind {
                ObjKind::Ctor { cidx, .. } => Ok(*cidx),
                _ => Err(BalanceError::Unsupported("case on a non-constructor")),
            },
            _ => Err(BalanceError::Unsupported("case on a scalar")),
        }
    }

    fn field(&mut self, v: Value, i: u32) -> Result<Value, BalanceError> {
        let Value::Obj(id) = v else {
            return Err(BalanceError::Unsupported("projection from a scalar"));
        };
        match &self.live_obj(id)?.kind {
            ObjKind::Ctor { fields, .. } => fields
                .get(i as usize)
                .copied()
                .ok_or(BalanceError::Unsupported("field index out of range")),
            _ => Err(BalanceError::Unsupported("projection from a non-constructor")),
        }
    }

    fn scalars(&mut self, v: Value) -> Result<&mut FxHashMap<(u32, u32), u64>, BalanceError> {
        let Value::Obj(id) = v else {
            return Err(BalanceError::Unsupported("scalar field of a scalar"));
        };
        match &mut self.live_obj(id)?.kind {
            ObjKind::Ctor { scalars, .. } => Ok(scalars),
            _ => Err(BalanceError::Unsupported("scalar field of a non-constructor")),
        }
    }

    fn scalar(v: Value) -> u64 {
        match v {
            Value::Scalar(n) | Value::Tagged(n) => n,
            Value::Obj(_) | Value::Irrelevant => 0,
        }
    }

    /// Call `name` with `args`; owned arguments are handed over.
    pub(crate) fn call(&mut self, name: Name, args: Vec<Value>) -> Result<Value, BalanceError> {
        let Some(Decl::Fn { params, body, .. }) = self.program.get(name) else {
            return Err(BalanceError::Unsupported("call to an unknown or extern function"));
        };
        if params.len() != args.len() {
            return Err(BalanceError::Unsupported("arity mismatch"));
        }
        let mut frame = Frame::default();
        for (p, a) in params.iter().zip(args) {
            frame.vars.insert(p.var, a);
        }
        self.exec(body, frame)
    }

    /// Global constants are evaluated once and never freed.
    fn global(&mut self, name: Name) -> Result<Value, BalanceError> {
        if let Some(&v) = self.globals.get(&name) {
            return Ok(v);
        }
        let v = self.call(name, Vec::new())?;
        self.mark_persistent(v);
        self.globals.insert(name, v);
        Ok(v)
    }

    /// Closure application consumes the closure and every argument.
    fn apply_closure(&mut self, closure: Value, args: Vec<Value>) -> Result<Value, BalanceError> {
        let Value::Obj(id) = closure else {
            return Err(BalanceError::Unsupported("application of a scalar"));
        };
        let obj = self.live_obj(id)?;
        let (func, captured) = match &obj.kind {
            ObjKind::Closure { func, captured } => (*func, captured.clone()),
            _ => return Err(BalanceError::Unsupported("application of a non-closure")),
        };
        if obj.rc == 1 && !obj.persistent {
            // Unique: the captured references move out of the dying cell.
            obj.freed = true;
            obj.rc = 0;
            if let ObjKind::Closure { captured, .. } = &mut obj.kind {
                captured.clear();
            }
        } else {
            for &c in &captured {
                self.inc(c, 1)?;
            }
            self.dec(closure)?;
        }

        let mut all = captured;
        all.extend(args);
        let borrowed: Vec<bool> = match self.program.callee_params(func) {
            Some(params) => params.iter().map(Param::is_borrowed).collect(),
            None => return Err(BalanceError::Unsupported("closure over an unknown function")),
        };
        let result = self.call(func, all.clone())?;
        // The boxed calling convention owns every argument.
        for (v, b) in all.into_iter().zip(borrowed) {
            if b {
                self.dec(v)?;
            }
        }
        Ok(result)
    }

    fn eval(&mut self, frame: &Frame<'p>, ty: IrType, expr: &Expr) -> Result<Value, BalanceError> {
        Ok(match expr {
            Expr::Construct { ctor, args } => {
                let fields = frame.args(args)?;
                self.alloc_ctor(ctor, fields)
            }
            Expr::Reset { n, var } => {
                let x = frame.get(*var)?;
                let Value::Obj(id) = x else {
                    return Ok(Value::Tagged(0));
                };
                let obj = self.live_obj(id)?;
                if obj.rc == 1 && !obj.persistent {
                    let fields = match &mut obj.kind {
                        ObjKind::Ctor { fields, .. } => std::mem::take(fields),
                        _ => return Err(BalanceError::Unsupported("reset of a non-constructor")),
                    };
                    if fields.len() != *n as usize {
                        return Err(BalanceError::Unsupported("reset field count mismatch"));
                    }
                    for f in fields {
                        self.dec(f)?;
                    }
                    x
                } else {
                    self.dec(x)?;
                    Value::Tagged(0)
                }
            }
            Expr::Reuse {
                token, ctor, args, ..
            } => {
                let fields = frame.args(args)?;
                match frame.get(*token)? {
                    Value::Obj(id) => {
                        self.live_obj(id)?.kind = ObjKind::Ctor {
                            cidx: ctor.cidx,
                            fields,
                            scalars: FxHashMap::default(),
                        };
                        Value::Obj(id)
                    }
                    _ => self.alloc_ctor(ctor, fields),
                }
            }
            Expr::Project { field, value } => {
                let v = frame.get(*value)?;
                self.field(v, *field)?
            }
            Expr::UProject { field, value } => {
                let v = frame.get(*value)?;
                Value::Scalar(self.scalars(v)?.get(&(*field, 0)).copied().unwrap_or(0))
            }
            Expr::SProject { n, offset, value } => {
                let v = frame.get(*value)?;
                Value::Scalar(self.scalars(v)?.get(&(*n, *offset)).copied().unwrap_or(0))
            }
            Expr::Apply { func, args } => {
                if args.is_empty() {
                    self.global(*func)?
                } else {
                    let args = frame.args(args)?;
                    self.call(*func, args)?
                }
            }
            Expr::PartialApply { func, args } => {
                let captured = frame.args(args)?;
                self.alloc(ObjKind::Closure {
                    func: *func,
                    captured,
                })
            }
            Expr::ApplyIndirect { closure, args } => {
                let c = frame.get(*closure)?;
                let args = frame.args(args)?;
                self.apply_closure(c, args)?
            }
            Expr::Box { value } => {
                let n = Self::scalar(frame.get(*value)?);
                self.alloc(ObjKind::Boxed(n))
            }
            Expr::Unbox { value } => match frame.get(*value)? {
                Value::Obj(id) => match self.live_obj(id)?.kind {
                    ObjKind::Boxed(n) => Value::Scalar(n),
                    _ => return Err(BalanceError::Unsupported("unbox of a non-box")),
                },
                Value::Tagged(n) => Value::Scalar(n),
                _ => return Err(BalanceError::Unsupported("unbox of a scalar")),
            },
            Expr::Lit(LitValue::Num(n)) => {
                if !ty.is_obj() {
                    Value::Scalar(*n)
                } else if *n <= self.options.max_small_nat() {
                    Value::Tagged(*n)
                } else {
                    self.alloc(ObjKind::Boxed(*n))
                }
            }
            Expr::Lit(LitValue::Str(_)) => self.alloc(ObjKind::Str),
            Expr::IsShared { var } => match frame.get(*var)? {
                Value::Obj(id) => {
                    let obj = self.live_obj(id)?;
                    Value::Scalar(u64::from(obj.persistent || obj.rc > 1))
                }
                _ => Value::Scalar(0),
            },
        })
    }

    fn exec(&mut self, body: &'p FnBody, mut frame: Frame<'p>) -> Result<Value, BalanceError> {
        let mut cur = body;
        loop {
            if self.fuel == 0 {
                return Err(BalanceError::OutOfFuel);
            }
            self.fuel -= 1;

            match cur {
                FnBody::Let {
                    dst,
                    ty,
                    value,
                    cont,
                } => {
                    let v = self.eval(&frame, *ty, value)?;
                    frame.vars.insert(*dst, v);
                    cur = cont;
                }
                FnBody::Join {
                    id,
                    params,
                    body,
                    cont,
                } => {
                    frame.join_points.insert(*id, (params.as_slice(), body.as_ref()));
                    cur = cont;
                }
                FnBody::USet {
                    var,
                    field,
                    value,
                    cont,
                } => {
                    let n = Self::scalar(frame.get(*value)?);
                    self.scalars(frame.get(*var)?)?.insert((*field, 0), n);
                    cur = cont;
                }
                FnBody::SSet {
                    var,
                    field,
                    offset,
                    value,
                    cont,
                    ..
                } => {
                    let n = Self::scalar(frame.get(*value)?);
                    self.scalars(frame.get(*var)?)?.insert((*field, *offset), n);
                    cur = cont;
                }
                FnBody::RcInc {
                    var, count, cont, ..
                } => {
                    self.inc(frame.get(*var)?, *count)?;
                    cur = cont;
                }
                FnBody::RcDec { var, cont, .. } => {
                    self.dec(frame.get(*var)?)?;
                    cur = cont;
                }
                FnBody::Case {
                    scrutinee, alts, ..
                } => {
                    let tag = self.ctor_of(frame.get(*scrutinee)?)?;
                    let alt = alts
                        .iter()
                        .find(|alt| alt.ctor().is_some_and(|c| c.cidx == tag))
                        .or_else(|| alts.iter().find(|alt| matches!(alt, Alt::Default { .. })))
                        .ok_or(BalanceError::Unsupported("no matching alternative"))?;
                    cur = alt.body();
                }
                FnBody::Ret { value } => return frame.arg(*value),
                FnBody::Jump { target, args } => {
                    let (params, jp_body) = *frame
                        .join_points
                        .get(target)
                        .ok_or(BalanceError::Unsupported("jump to unknown join point"))?;
                    let values = frame.args(args)?;
                    for (p, v) in params.iter().zip(values) {
                        frame.vars.insert(p.var, v);
                    }
                    cur = jp_body;
                }
                FnBody::Unreachable => return Err(BalanceError::Unsupported("reached unreachable")),
            }
        }
    }

    fn leaked(&self) -> Vec<ObjId> {
        self.heap
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.freed && !o.persistent)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Run `entry` with arguments built by `make_args`, then release the
/// result and every argument passed to a borrowed parameter. Every object
/// must be freed afterwards.
pub(crate) fn check_balance(
    program: &[Decl],
    entry: Name,
    options: &RcOptions,
    make_args: impl FnOnce(&mut Machine<'_>) -> Vec<Value>,
) -> Result<(), BalanceError> {
    let mut machine = Machine::new(program, options);
    let args = make_args(&mut machine);
    let borrowed: Vec<bool> = match machine.program.callee_params(entry) {
        Some(params) => params.iter().map(Param::is_borrowed).collect(),
        None => return Err(BalanceError::Unsupported("unknown entry function")),
    };

    let result = machine.call(entry, args.clone())?;
    machine.dec(result)?;
    for (v, b) in args.into_iter().zip(borrowed) {
        if b {
            machine.dec(v)?;
        }
    }

    let leaked = machine.leaked();
    if leaked.is_empty() {
        Ok(())
    } else {
        Err(BalanceError::Leak(leaked))
    }
}

//! Functional IR: the tree that RC insertion reads and rewrites.
//!
//! Function bodies are a chain of statements ([`FnBody`]) ending in a
//! terminal (`Ret`, `Jump`, `Case`, `Unreachable`). Shared code after a
//! branch is expressed with join points: a `Join` statement declares a
//! labeled body with parameters, and `Jump` transfers control to it.
//!
//! # Architecture
//!
//! - **[`Decl`]** - a top-level function (or extern) with typed, borrow-annotated parameters
//! - **[`FnBody`]** - a statement with its continuation (`cont`)
//! - **[`Expr`]** - the right-hand side of a `Let`
//! - **[`Arg`]** - a call/constructor argument: a variable or an irrelevant placeholder
//!
//! Variables ([`VarId`]) are unique within one declaration. Join points
//! ([`JoinPointId`]) are lexically scoped: a `Jump` may only target a join
//! point declared by an enclosing `Join` (in its `cont`, not its `body`).
//!
//! `RcInc`/`RcDec` are produced by [`insert_rc_ops`](crate::insert_rc_ops)
//! and never appear in its input.

use std::fmt;

use smallvec::{smallvec, SmallVec};

use crate::ownership::Ownership;
use crate::ArcClass;

// ── ID newtypes ─────────────────────────────────────────────────────

/// Variable ID within one declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VarId(u32);

impl VarId {
    /// Create a new variable ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x_{}", self.0)
    }
}

/// Join point ID within one declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct JoinPointId(u32);

impl JoinPointId {
    /// Create a new join point ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for JoinPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}", self.0)
    }
}

/// Interned global name (functions, constructors, inductive types).
///
/// Interning happens in earlier phases; this pass only compares names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Name(u32);

impl Name {
    /// Create a name from its interned index.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the interned index.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Types ───────────────────────────────────────────────────────────

/// Runtime representation type of an IR variable.
///
/// Only `Object` and `TObject` values can be heap pointers. `TObject`
/// ("tagged object") may also hold a scalar packed into the pointer,
/// which the runtime detects on every `inc`/`dec`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    Float,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    USize,
    /// Erased value with no runtime representation (types, proofs).
    Irrelevant,
    /// Always a heap pointer.
    Object,
    /// Heap pointer or tagged scalar.
    TObject,
}

impl IrType {
    /// Returns `true` if values of this type may be reference-counted.
    #[inline]
    pub fn is_obj(self) -> bool {
        self.arc_class().needs_rc()
    }

    /// Three-way ARC classification of this representation.
    pub fn arc_class(self) -> ArcClass {
        match self {
            IrType::Object => ArcClass::DefiniteRef,
            IrType::TObject => ArcClass::PossibleRef,
            IrType::Float
            | IrType::UInt8
            | IrType::UInt16
            | IrType::UInt32
            | IrType::UInt64
            | IrType::USize
            | IrType::Irrelevant => ArcClass::Scalar,
        }
    }
}

// ── Arguments and literals ──────────────────────────────────────────

/// An argument of an application, constructor, or jump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arg {
    Var(VarId),
    /// Erased argument; never counted.
    Irrelevant,
}

impl Arg {
    /// The referenced variable, if any.
    #[inline]
    pub fn as_var(self) -> Option<VarId> {
        match self {
            Arg::Var(x) => Some(x),
            Arg::Irrelevant => None,
        }
    }
}

impl From<VarId> for Arg {
    fn from(x: VarId) -> Self {
        Arg::Var(x)
    }
}

/// Literal value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LitValue {
    /// Natural number literal. Small values of object type live in the
    /// pointer itself (see [`RcOptions::max_small_nat`](crate::RcOptions::max_small_nat)).
    Num(u64),
    /// String literal (interned).
    Str(Name),
}

/// Constructor metadata.
///
/// `size` counts boxed (object) fields, `usize` counts `usize` fields and
/// `ssize` is the byte size of the remaining scalar fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CtorInfo {
    pub name: Name,
    /// Constructor index within its inductive type (the runtime tag).
    pub cidx: u32,
    pub size: u32,
    pub usize: u32,
    pub ssize: u32,
}

impl CtorInfo {
    /// Returns `true` if values built by this constructor need a heap cell.
    #[inline]
    pub fn is_ref(&self) -> bool {
        self.size > 0 || self.usize > 0 || self.ssize > 0
    }

    /// Returns `true` if this constructor has no fields at all.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        !self.is_ref()
    }
}

// ── Expressions ─────────────────────────────────────────────────────

/// The right-hand side of a `Let`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Constructor application: allocates a cell owning `args`.
    Construct { ctor: CtorInfo, args: Vec<Arg> },

    /// Take over `var`'s cell for destructive reuse. `n` is the number of
    /// object fields the cell holds.
    Reset { n: u32, var: VarId },

    /// Rebuild a value in the cell previously taken by `Reset`.
    Reuse {
        token: VarId,
        ctor: CtorInfo,
        update_header: bool,
        args: Vec<Arg>,
    },

    /// Read object field `field` of `value` (no ownership transfer).
    Project { field: u32, value: VarId },

    /// Read `usize` field `field` of `value`.
    UProject { field: u32, value: VarId },

    /// Read a scalar field at `offset` past `n` pointer-sized fields.
    SProject { n: u32, offset: u32, value: VarId },

    /// Full application of a known declaration.
    Apply { func: Name, args: Vec<Arg> },

    /// Partial application: builds a closure capturing `args`.
    PartialApply { func: Name, args: Vec<Arg> },

    /// Apply a closure value to further arguments.
    ApplyIndirect { closure: VarId, args: Vec<Arg> },

    /// Box a scalar into an object.
    Box { value: VarId },

    /// Unbox a scalar out of an object.
    Unbox { value: VarId },

    Lit(LitValue),

    /// Test whether `var` has a reference count greater than one.
    IsShared { var: VarId },
}

impl Expr {
    /// The argument list of argument-carrying variants; empty otherwise.
    pub fn args(&self) -> &[Arg] {
        match self {
            Expr::Construct { args, .. }
            | Expr::Reuse { args, .. }
            | Expr::Apply { args, .. }
            | Expr::PartialApply { args, .. }
            | Expr::ApplyIndirect { args, .. } => args,

            Expr::Reset { .. }
            | Expr::Project { .. }
            | Expr::UProject { .. }
            | Expr::SProject { .. }
            | Expr::Box { .. }
            | Expr::Unbox { .. }
            | Expr::Lit(_)
            | Expr::IsShared { .. } => &[],
        }
    }

    /// Every variable this expression reads, in textual order.
    ///
    /// For `Reuse` the token comes first; for `ApplyIndirect` the closure
    /// comes last (after its arguments).
    pub fn used_vars(&self) -> SmallVec<[VarId; 4]> {
        match self {
            Expr::Construct { args, .. }
            | Expr::Apply { args, .. }
            | Expr::PartialApply { args, .. } => args.iter().filter_map(|a| a.as_var()).collect(),

            Expr::Reuse { token, args, .. } => {
                let mut vars: SmallVec<[VarId; 4]> = smallvec![*token];
                vars.extend(args.iter().filter_map(|a| a.as_var()));
                vars
            }

            Expr::ApplyIndirect { closure, args } => {
                let mut vars: SmallVec<[VarId; 4]> =
                    args.iter().filter_map(|a| a.as_var()).collect();
                vars.push(*closure);
                vars
            }

            Expr::Reset { var, .. } | Expr::IsShared { var } => smallvec![*var],

            Expr::Project { value, .. }
            | Expr::UProject { value, .. }
            | Expr::SProject { value, .. }
            | Expr::Box { value }
            | Expr::Unbox { value } => smallvec![*value],

            Expr::Lit(_) => SmallVec::new(),
        }
    }
}

// ── Parameters and alternatives ─────────────────────────────────────

/// A formal parameter of a declaration or join point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Param {
    pub var: VarId,
    pub ownership: Ownership,
    pub ty: IrType,
}

impl Param {
    /// Returns `true` if the callee only borrows this parameter.
    #[inline]
    pub fn is_borrowed(&self) -> bool {
        self.ownership == Ownership::Borrowed
    }
}

/// One alternative of a `Case`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Alt {
    /// Taken when the scrutinee was built by `ctor`.
    Ctor { ctor: CtorInfo, body: FnBody },
    /// Taken when no constructor alternative matches.
    Default { body: FnBody },
}

impl Alt {
    pub fn body(&self) -> &FnBody {
        match self {
            Alt::Ctor { body, .. } | Alt::Default { body } => body,
        }
    }

    /// Constructor of this alternative (`None` for the default one).
    pub fn ctor(&self) -> Option<&CtorInfo> {
        match self {
            Alt::Ctor { ctor, .. } => Some(ctor),
            Alt::Default { .. } => None,
        }
    }
}

// ── Statements ──────────────────────────────────────────────────────

/// A statement together with everything that follows it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FnBody {
    /// `let dst : ty := value; cont`
    Let {
        dst: VarId,
        ty: IrType,
        value: Expr,
        cont: Box<FnBody>,
    },

    /// `block_id (params) := body; cont`
    Join {
        id: JoinPointId,
        params: Vec<Param>,
        body: Box<FnBody>,
        cont: Box<FnBody>,
    },

    /// `var[field] := value` for a `usize` field.
    USet {
        var: VarId,
        field: u32,
        value: VarId,
        cont: Box<FnBody>,
    },

    /// `var[field, offset] : ty := value` for a scalar field.
    SSet {
        var: VarId,
        field: u32,
        offset: u32,
        value: VarId,
        ty: IrType,
        cont: Box<FnBody>,
    },

    /// Increment the reference count of `var` by `count`.
    RcInc {
        var: VarId,
        count: u32,
        persistent: bool,
        cont: Box<FnBody>,
    },

    /// Decrement the reference count of `var`, freeing it at zero.
    RcDec {
        var: VarId,
        persistent: bool,
        cont: Box<FnBody>,
    },

    /// Dispatch on the constructor of `scrutinee`.
    Case {
        type_name: Name,
        scrutinee: VarId,
        ty: IrType,
        alts: Vec<Alt>,
    },

    Ret { value: Arg },

    /// Transfer control to an enclosing join point.
    Jump { target: JoinPointId, args: Vec<Arg> },

    Unreachable,
}

impl FnBody {
    /// `let dst : ty := value; cont`
    pub fn bind(dst: VarId, ty: IrType, value: Expr, cont: FnBody) -> Self {
        FnBody::Let {
            dst,
            ty,
            value,
            cont: Box::new(cont),
        }
    }

    /// `block_id (params) := body; cont`
    pub fn join(id: JoinPointId, params: Vec<Param>, body: FnBody, cont: FnBody) -> Self {
        FnBody::Join {
            id,
            params,
            body: Box::new(body),
            cont: Box::new(cont),
        }
    }

    /// `ret x`
    pub fn ret(x: VarId) -> Self {
        FnBody::Ret { value: Arg::Var(x) }
    }

    /// `jmp target args`
    pub fn jump(target: JoinPointId, args: Vec<Arg>) -> Self {
        FnBody::Jump { target, args }
    }

    /// `inc var count; cont`
    pub fn inc(var: VarId, count: u32, persistent: bool, cont: FnBody) -> Self {
        FnBody::RcInc {
            var,
            count,
            persistent,
            cont: Box::new(cont),
        }
    }

    /// `dec var; cont`
    pub fn dec(var: VarId, persistent: bool, cont: FnBody) -> Self {
        FnBody::RcDec {
            var,
            persistent,
            cont: Box::new(cont),
        }
    }

    /// The statement that runs after this one, if any.
    ///
    /// For `Join` this is the code after the declaration, not the join
    /// point's own body.
    pub fn continuation(&self) -> Option<&FnBody> {
        match self {
            FnBody::Let { cont, .. }
            | FnBody::Join { cont, .. }
            | FnBody::USet { cont, .. }
            | FnBody::SSet { cont, .. }
            | FnBody::RcInc { cont, .. }
            | FnBody::RcDec { cont, .. } => Some(cont),
            FnBody::Case { .. } | FnBody::Ret { .. } | FnBody::Jump { .. } | FnBody::Unreachable => {
                None
            }
        }
    }

    fn continuation_slot(&mut self) -> Option<&mut Box<FnBody>> {
        match self {
            FnBody::Let { cont, .. }
            | FnBody::Join { cont, .. }
            | FnBody::USet { cont, .. }
            | FnBody::SSet { cont, .. }
            | FnBody::RcInc { cont, .. }
            | FnBody::RcDec { cont, .. } => Some(cont),
            FnBody::Case { .. } | FnBody::Ret { .. } | FnBody::Jump { .. } | FnBody::Unreachable => {
                None
            }
        }
    }

    /// Replace the continuation, returning the old one.
    ///
    /// Terminals have no continuation: they are left untouched and `new`
    /// is handed back.
    pub fn set_continuation(&mut self, new: FnBody) -> FnBody {
        match self.continuation_slot() {
            Some(slot) => std::mem::replace(slot.as_mut(), new),
            None => new,
        }
    }

    /// Detach the continuation, leaving `Unreachable` in its place.
    pub fn take_continuation(&mut self) -> Option<FnBody> {
        self.continuation_slot()
            .map(|slot| std::mem::replace(slot.as_mut(), FnBody::Unreachable))
    }

    /// Rebuild this statement on top of a new continuation.
    #[must_use]
    pub fn with_continuation(mut self, cont: FnBody) -> Self {
        self.set_continuation(cont);
        self
    }

    /// The variable bound by this statement, if any.
    ///
    /// Join point parameters are bound in the join point body, not here.
    pub fn defined_var(&self) -> Option<VarId> {
        match self {
            FnBody::Let { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Variables read by this statement itself (not its continuation,
    /// join point body, or case alternatives).
    pub fn used_vars(&self) -> SmallVec<[VarId; 4]> {
        match self {
            FnBody::Let { value, .. } => value.used_vars(),
            FnBody::USet { var, value, .. } | FnBody::SSet { var, value, .. } => {
                smallvec![*var, *value]
            }
            FnBody::RcInc { var, .. } | FnBody::RcDec { var, .. } => smallvec![*var],
            FnBody::Case { scrutinee, .. } => smallvec![*scrutinee],
            FnBody::Ret { value } => value.as_var().into_iter().collect(),
            FnBody::Jump { args, .. } => args.iter().filter_map(|a| a.as_var()).collect(),
            FnBody::Join { .. } | FnBody::Unreachable => SmallVec::new(),
        }
    }
}

// ── Declarations ────────────────────────────────────────────────────

/// A top-level declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Decl {
    /// A function with a body.
    Fn {
        name: Name,
        params: Vec<Param>,
        ret_ty: IrType,
        body: FnBody,
    },
    /// A function implemented outside the IR (runtime primitive, FFI).
    Extern {
        name: Name,
        params: Vec<Param>,
        ret_ty: IrType,
    },
}

impl Decl {
    pub fn name(&self) -> Name {
        match self {
            Decl::Fn { name, .. } | Decl::Extern { name, .. } => *name,
        }
    }

    pub fn params(&self) -> &[Param] {
        match self {
            Decl::Fn { params, .. } | Decl::Extern { params, .. } => params,
        }
    }

    /// The function body (`None` for externs).
    pub fn body(&self) -> Option<&FnBody> {
        match self {
            Decl::Fn { body, .. } => Some(body),
            Decl::Extern { .. } => None,
        }
    }
}

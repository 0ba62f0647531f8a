//! Callee lookup for RC insertion.
//!
//! A full application needs the borrow annotations of its callee. The
//! pass reads them through [`DeclLookup`], so the driver decides where
//! declarations live: a plain slice for small modules and tests, or a
//! [`DeclIndex`] hashed by name for whole programs.

use rustc_hash::FxHashMap;

use crate::ir::{Decl, Name, Param};

/// Resolve a global name to its declaration.
pub trait DeclLookup {
    fn find_decl(&self, name: Name) -> Option<&Decl>;

    /// Formal parameters of `name`, if it is known.
    fn callee_params(&self, name: Name) -> Option<&[Param]> {
        self.find_decl(name).map(Decl::params)
    }
}

impl DeclLookup for [Decl] {
    fn find_decl(&self, name: Name) -> Option<&Decl> {
        self.iter().find(|d| d.name() == name)
    }
}

impl DeclLookup for FxHashMap<Name, Decl> {
    fn find_decl(&self, name: Name) -> Option<&Decl> {
        self.get(&name)
    }
}

/// Name-indexed view over a module's declarations.
///
/// When two declarations share a name, the first one wins.
#[derive(Debug, Default)]
pub struct DeclIndex<'a> {
    by_name: FxHashMap<Name, &'a Decl>,
}

impl<'a> DeclIndex<'a> {
    pub fn new(decls: &'a [Decl]) -> Self {
        let mut by_name = FxHashMap::default();
        by_name.reserve(decls.len());
        for decl in decls {
            by_name.entry(decl.name()).or_insert(decl);
        }
        Self { by_name }
    }

    /// Like [`DeclLookup::find_decl`], but the result borrows the
    /// declarations rather than the index.
    pub fn get(&self, name: Name) -> Option<&'a Decl> {
        self.by_name.get(&name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl DeclLookup for DeclIndex<'_> {
    fn find_decl(&self, name: Name) -> Option<&Decl> {
        self.get(name)
    }
}

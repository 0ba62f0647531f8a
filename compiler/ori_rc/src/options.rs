//! Configuration for RC insertion.

/// Pointer width of the compilation target.
///
/// Decides how many spare bits a tagged pointer has for scalars.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    #[default]
    Bits64,
}

impl PointerWidth {
    /// Width in bits.
    pub fn bits(self) -> u32 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }
}

/// Options for [`insert_rc_ops`](crate::insert_rc_ops) and the module drivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RcOptions {
    /// Verify each declaration with [`check_input`](crate::check_input)
    /// before rewriting it. A failure is an internal compiler error.
    pub check_input: bool,
    /// Target pointer width.
    pub pointer_width: PointerWidth,
}

impl Default for RcOptions {
    fn default() -> Self {
        Self {
            check_input: cfg!(debug_assertions),
            pointer_width: PointerWidth::default(),
        }
    }
}

impl RcOptions {
    #[must_use]
    pub fn with_check_input(mut self, check_input: bool) -> Self {
        self.check_input = check_input;
        self
    }

    #[must_use]
    pub fn with_pointer_width(mut self, pointer_width: PointerWidth) -> Self {
        self.pointer_width = pointer_width;
        self
    }

    /// Largest natural number literal stored directly in a tagged pointer.
    ///
    /// One bit of the pointer marks the value as a scalar, leaving
    /// `bits - 1` bits for the number.
    pub fn max_small_nat(&self) -> u64 {
        (1u64 << (self.pointer_width.bits() - 1)) - 1
    }
}

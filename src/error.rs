// Runtime panics.
//
// Every interpreter operation returns `Result<T>`; a `Panic` terminates
// the current execution and propagates to the host unchanged. There is
// no catch mechanism and no unwinding runtime: the failure path of each
// operation releases whatever it owns and returns `Err`.

use crate::mir::Span;
use crate::value::{Kind, KindSet};

// The set of non-recoverable runtime failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PanicKind {
    TypeMismatch,
    OutOfBounds,
    InvalidHandle,
    InvalidLocation,
    IntegerOverflow,
    InvalidNumericConversion,
    FloatUnsupported,
    Unimplemented,
    AsyncDeadlock,
    SendOnClosed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Panic {
    pub kind: PanicKind,
    pub message: String,
    pub span: Span,
}

pub type Result<T> = core::result::Result<T, Panic>;

impl Panic {
    pub fn new(kind: PanicKind, message: String) -> Panic {
        Panic {
            kind,
            message,
            span: Span::none(),
        }
    }

    // Attach a source span if none has been recorded yet. The innermost
    // spanned instruction wins.
    pub fn at(mut self, span: Span) -> Panic {
        if self.span.is_none() {
            self.span = span;
        }
        self
    }
}

// Construct a TypeMismatch from a white-list of acceptable kinds.
pub fn expected(expect: KindSet, got: Kind) -> Panic {
    Panic::new(
        PanicKind::TypeMismatch,
        format!("expected {:?}, got {:?}", expect, got),
    )
}

// Construct a TypeMismatch from two operands that don't agree.
pub fn type_mismatch(a: Kind, b: Kind) -> Panic {
    Panic::new(
        PanicKind::TypeMismatch,
        format!("mismatched operands: {:?} vs {:?}", a, b),
    )
}

pub fn out_of_bounds(index: usize, len: usize) -> Panic {
    Panic::new(
        PanicKind::OutOfBounds,
        format!("index {} out of bounds (len {})", index, len),
    )
}

pub fn invalid_handle(handle: u64) -> Panic {
    Panic::new(PanicKind::InvalidHandle, format!("invalid handle {}", handle))
}

pub fn invalid_location(what: &str) -> Panic {
    Panic::new(PanicKind::InvalidLocation, String::from(what))
}

pub fn unimplemented(what: &str) -> Panic {
    Panic::new(PanicKind::Unimplemented, String::from(what))
}

pub fn overflow(op: &str) -> Panic {
    Panic::new(
        PanicKind::IntegerOverflow,
        format!("integer overflow in {}", op),
    )
}

//! Failure model: typed failures, defects and interruption
//!
//! Every fiber ends in an [`Exit`]: either the success value or a
//! [`Cause`] explaining why there is none. Recovery treats the three
//! causes differently:
//!
//! - `Fail(E)` is a declared domain error; typed recovery (`catch_*`,
//!   `map_error`, `retry`) only ever sees this variant.
//! - `Die(Defect)` is an unexpected failure (panic, missing service,
//!   timeout, broken layer graph). It bypasses typed recovery.
//! - `Interrupt` is cooperative cancellation. It bypasses typed recovery too.

use core::fmt;
use std::any::Any;
use std::time::Duration;

use crate::error::LayerError;

/// Terminal result of an effect: the value or the reason there is none
pub type Exit<A, E> = Result<A, Cause<E>>;

/// Why an effect did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// Declared, recoverable failure
    Fail(E),

    /// Undeclared failure
    Die(Defect),

    /// The fiber was interrupted
    Interrupt,
}

impl<E> Cause<E> {
    /// Check for a typed failure
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Cause::Fail(_))
    }

    /// Check for a defect
    #[inline]
    pub fn is_die(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    /// Check for interruption
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Cause::Interrupt)
    }

    /// Borrow the typed failure, if any
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// Take the typed failure, if any
    pub fn into_failure(self) -> Option<E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the defect, if any
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Cause::Die(d) => Some(d),
            _ => None,
        }
    }

    /// Transform the typed failure, leaving defects and interruption alone
    pub fn map<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt => Cause::Interrupt,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e) => write!(f, "failed: {}", e),
            Cause::Die(d) => write!(f, "died: {}", d),
            Cause::Interrupt => write!(f, "interrupted"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cause<E> {}

/// Category of a defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectKind {
    /// A user closure panicked
    Panic,

    /// A `timeout` elapsed before the effect settled
    Timeout,

    /// A required service was absent from the context
    MissingService,

    /// Layer graph could not be planned
    Layer,

    /// Runtime invariant broken (type mismatch across the erased boundary, ...)
    Internal,

    /// Raised explicitly through `Effect::die`
    Custom,
}

impl fmt::Display for DefectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefectKind::Panic => "panic",
            DefectKind::Timeout => "timeout",
            DefectKind::MissingService => "missing service",
            DefectKind::Layer => "layer",
            DefectKind::Internal => "internal",
            DefectKind::Custom => "defect",
        };
        f.write_str(s)
    }
}

/// An undeclared failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Defect {
    kind: DefectKind,
    message: String,
}

impl Defect {
    /// Create a defect of the given kind
    pub fn new(kind: DefectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// User-raised defect
    pub fn custom(message: impl Into<String>) -> Self {
        Self::new(DefectKind::Custom, message)
    }

    /// Runtime invariant violation
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DefectKind::Internal, message)
    }

    /// Timeout elapsed
    pub fn timeout(after: Duration) -> Self {
        Self::new(DefectKind::Timeout, format!("timed out after {:?}", after))
    }

    /// Service lookup failed
    pub fn missing_service(name: &str) -> Self {
        Self::new(DefectKind::MissingService, format!("service not found: {}", name))
    }

    /// Layer planning failed
    pub fn layer(err: &LayerError) -> Self {
        Self::new(DefectKind::Layer, err.to_string())
    }

    /// Convert a panic payload (as returned by `catch_unwind`)
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(DefectKind::Panic, message)
    }

    /// Defect category
    #[inline]
    pub fn kind(&self) -> DefectKind {
        self.kind
    }

    /// Human-readable detail
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failures that carry a discriminant, enabling `catch_tag`
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// enum DbError { NotFound(u32), Conflict }
///
/// impl Tagged for DbError {
///     fn tag(&self) -> &'static str {
///         match self {
///             DbError::NotFound(_) => "NotFound",
///             DbError::Conflict => "Conflict",
///         }
///     }
/// }
/// ```
pub trait Tagged {
    /// Discriminant compared against the tag passed to `catch_tag`
    fn tag(&self) -> &'static str;
}

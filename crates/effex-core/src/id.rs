//! Identifier types
//!
//! Three id spaces share the same shape: fibers, tags and layers. Each is a
//! 64-bit value handed out by its own process-wide counter, so ids are never
//! reused within a process. Zero is reserved as the "none" sentinel.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Sentinel value meaning "no id"
            pub const NONE: $name = $name(0);

            /// Allocate the next process-unique id
            #[inline]
            pub fn next() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Wrap a raw value (tests and diagnostics)
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Get the raw u64 value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Check if this is the NONE sentinel
            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!($label, "(NONE)"))
                } else {
                    write!(f, concat!($label, "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, "none")
                } else {
                    write!(f, "#{}", self.0)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::NONE
            }
        }
    };
}

define_id!(
    /// Unique identifier for a fiber (one in-flight execution of an effect)
    FiberId,
    NEXT_FIBER_ID,
    "FiberId"
);

define_id!(
    /// Unique identifier for a service tag
    TagId,
    NEXT_TAG_ID,
    "TagId"
);

define_id!(
    /// Identity of an atomic layer; the key of the per-run memo map
    LayerId,
    NEXT_LAYER_ID,
    "LayerId"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(TagId::NONE.is_none());
        assert_eq!(LayerId::default(), LayerId::NONE);
        assert_eq!(format!("{:?}", FiberId::NONE), "FiberId(NONE)");
        assert_eq!(format!("{}", FiberId::NONE), "none");
    }

    #[test]
    fn test_display() {
        let id = TagId::from_raw(7);
        assert_eq!(id.as_u64(), 7);
        assert_eq!(format!("{}", id), "#7");
        assert_eq!(format!("{:?}", id), "TagId(7)");
    }
}

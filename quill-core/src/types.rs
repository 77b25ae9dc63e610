//! Strongly-typed identifiers for Quill entities.
//!
//! Explicit types prevent bugs from mixing up values that are all "just"
//! integers at the wire level.

use std::fmt;

/// Macro to generate strongly-typed u64 wrappers.
///
/// Each generated type provides:
/// - Type safety (a `Term` cannot be passed where a `LogIndex` is expected)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same layout as a raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new value from a raw u64.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics if the value would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "id overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(Term, "term", "Raft term number for leader election.");
define_id!(LogIndex, "idx", "Index into the raft log (1-based; 0 means empty).");

/// The name of a server in the cluster.
///
/// Servers are identified by the operator-assigned node name that the
/// membership layer gossips, not by a numeric id, so this wraps a string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a server id from any string-ish value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the underlying string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_types() {
        let term = Term::new(3);
        let index = LogIndex::new(3);
        assert_eq!(term.get(), index.get());
        assert_eq!(format!("{term}"), "term-3");
        assert_eq!(format!("{index}"), "idx-3");
    }

    #[test]
    fn test_next() {
        assert_eq!(LogIndex::new(0).next(), LogIndex::new(1));
    }

    #[test]
    fn test_server_id_display() {
        let id = ServerId::new("node-0");
        assert_eq!(format!("{id}"), "node-0");
        assert_eq!(id.as_str(), "node-0");
    }
}

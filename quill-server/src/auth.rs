//! Authentication and authorization.
//!
//! The subject is the caller's authenticated identity. TLS termination
//! lives outside this crate; whatever terminates the connection attaches
//! the client certificate's common name as a [`Subject`] extension, and
//! the [`authenticate`] interceptor fills in the anonymous subject when
//! nothing did.
//!
//! Authorization is a three-argument predicate behind the [`Authorizer`]
//! trait; the policy engine is pluggable at wiring time. The in-memory
//! [`AclAuthorizer`] covers production wiring and tests; policy-file
//! formats are out of scope.

use std::collections::HashSet;

use tonic::{Request, Status};

use crate::error::ServerError;

/// The object wildcard used by the log's ACL table.
pub const OBJECT_WILDCARD: &str = "*";

/// The produce action.
pub const PRODUCE_ACTION: &str = "produce";

/// The consume action.
pub const CONSUME_ACTION: &str = "consume";

/// The caller's authenticated identity, attached to the request by the
/// transport (or left anonymous).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject(pub String);

/// Interceptor guaranteeing every request carries a [`Subject`].
///
/// If the transport attached no identity the subject is the empty
/// string, matching the behavior of a connection without client auth.
///
/// # Errors
/// Never fails; the signature is fixed by the interceptor contract.
pub fn authenticate(mut request: Request<()>) -> Result<Request<()>, Status> {
    if request.extensions().get::<Subject>().is_none() {
        request.extensions_mut().insert(Subject(String::new()));
    }
    Ok(request)
}

/// Reads the request's subject; anonymous when absent.
pub fn subject_of<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<Subject>()
        .map_or_else(String::new, |s| s.0.clone())
}

/// The three-argument authorization predicate.
pub trait Authorizer: Send + Sync + 'static {
    /// Allows or refuses `subject` performing `action` on `object`.
    ///
    /// # Errors
    /// [`ServerError::PermissionDenied`] when refused.
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), ServerError>;
}

/// An in-memory ACL table.
///
/// Entries are `(subject, object, action)` triples; `*` in any position
/// matches everything.
#[derive(Debug, Default)]
pub struct AclAuthorizer {
    rules: HashSet<(String, String, String)>,
}

impl AclAuthorizer {
    /// An empty table refusing everyone.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that allows every subject everything.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new().allow("*", "*", "*")
    }

    /// Adds an allow rule.
    #[must_use]
    pub fn allow(
        mut self,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.rules
            .insert((subject.into(), object.into(), action.into()));
        self
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), ServerError> {
        let allowed = self.rules.iter().any(|(s, o, a)| {
            (s == subject || s == "*") && (o == object || o == "*") && (a == action || a == "*")
        });
        if allowed {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied {
                subject: subject.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_exact_rule() {
        let acl = AclAuthorizer::new().allow("root", OBJECT_WILDCARD, PRODUCE_ACTION);

        assert!(acl.authorize("root", OBJECT_WILDCARD, PRODUCE_ACTION).is_ok());
        assert!(matches!(
            acl.authorize("root", OBJECT_WILDCARD, CONSUME_ACTION),
            Err(ServerError::PermissionDenied { .. })
        ));
        assert!(matches!(
            acl.authorize("nobody", OBJECT_WILDCARD, PRODUCE_ACTION),
            Err(ServerError::PermissionDenied { subject, .. }) if subject == "nobody"
        ));
    }

    #[test]
    fn test_permissive_allows_anonymous() {
        let acl = AclAuthorizer::permissive();
        assert!(acl.authorize("", OBJECT_WILDCARD, CONSUME_ACTION).is_ok());
    }

    #[test]
    fn test_authenticate_defaults_to_anonymous() {
        let request = authenticate(Request::new(())).unwrap();
        assert_eq!(subject_of(&request), "");
    }
}

//! Provide a [`Context`] for the query lifecycle.
//!
//! A context carries what the query knows about its caller: the claims
//! established by authentication and the client address.
//! Stages read it through `context(path)` injections, policies receive it as
//! their second argument and the rate limiter derives its partition key from it.

use std::sync::Arc;

use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

/// Context for a query.
///
/// Cloning a context is cheap, clones share their claims.
#[derive(Clone, Debug)]
pub struct Context {
    id: String,
    claims: Arc<Object>,
    client_addr: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a new context without claims.
    pub fn new() -> Self {
        Context {
            id: uuid::Uuid::new_v4().to_string(),
            claims: Default::default(),
            client_addr: None,
        }
    }

    /// Set the authenticated claims.
    pub fn with_claims(mut self, claims: Object) -> Self {
        self.claims = Arc::new(claims);
        self
    }

    /// Set the client address.
    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    /// Unique id of the query this context belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the claim at a dotted path such as `user.id`.
    ///
    /// `null` claims are treated as missing.
    pub fn claim(&self, path: &str) -> Option<&Value> {
        let mut segments = path.splitn(2, '.');
        let first = segments.next()?;
        let value = self.claims.get(first)?;
        let value = match segments.next() {
            Some(rest) => value.get_dotted(rest)?,
            None => value,
        };
        (!value.is_null()).then_some(value)
    }

    /// The client address, if known.
    pub fn client_addr(&self) -> Option<&str> {
        self.client_addr.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn claims(value: Value) -> Object {
        match value {
            Value::Object(object) => object,
            _ => unreachable!(),
        }
    }

    #[test]
    fn claims_are_read_by_dotted_path() {
        let context = Context::new().with_claims(claims(json!({
            "user": { "id": "u1", "roles": ["admin"] },
            "empty": null,
        })));
        assert_eq!(context.claim("user.id"), Some(&json!("u1")));
        assert_eq!(context.claim("user.roles.0"), Some(&json!("admin")));
        assert_eq!(context.claim("user.name"), None);
        assert_eq!(context.claim("empty"), None);
    }
}

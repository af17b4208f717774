//! Secret lookup for injections and auth providers.

use std::collections::HashMap;

/// Source of the secrets a typegraph declares.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

impl SecretStore for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Reads secrets from environment variables named
/// `{prefix}{TYPEGRAPH}_{NAME}`, uppercased.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
    typegraph: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>, typegraph: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            typegraph: typegraph.into(),
        }
    }

    fn variable(&self, name: &str) -> String {
        format!("{}{}_{}", self.prefix, self.typegraph, name)
            .to_uppercase()
            .replace('-', "_")
    }
}

impl SecretStore for EnvSecrets {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(self.variable(name)).ok()
    }
}

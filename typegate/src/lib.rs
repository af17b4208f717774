//! Plans and executes queries against a compiled typegraph.
//!
//! A typegraph is a composite schema whose functions are bound to heterogeneous
//! runtimes (databases, remote GraphQL or HTTP services, script sandboxes, ...).
//! The [`Engine`] turns one incoming query into a tree of stages, gates them with
//! policies and rate limits, dispatches them to their runtimes and stitches the
//! partial results back into a single GraphQL response.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod json_ext;

mod authentication;
mod authorization;
pub mod axum_factory;
pub mod configuration;
mod context;
mod engine;
pub mod error;
pub mod graphql;
pub mod query_planner;
pub mod rate;
pub mod runtimes;
mod secrets;
pub mod typegraph;

#[cfg(test)]
pub(crate) mod test_utils;

pub use authorization::PolicyDecision;
pub use configuration::Configuration;
pub use context::Context;
pub use engine::Engine;
pub use engine::Query;
pub use engine::QueryOrigin;
pub use secrets::EnvSecrets;
pub use secrets::SecretStore;

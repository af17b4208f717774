//! Logic for loading configuration in to an object model

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use displaydoc::Display;
use schemars::gen::SchemaSettings;
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::typegraph::Typegraph;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not read configuration file {path}: {error}
    CannotReadFile { path: String, error: String },
    /// could not parse configuration: {0}
    InvalidYaml(String),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
    /// could not load typegraph {path}: {error}
    CannotLoadTypegraph { path: String, error: String },
}

/// The configuration of the gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Configuration options pertaining to the http server component.
    pub server: Server,

    /// Paths of the typegraph documents to serve, one endpoint each.
    pub typegraphs: Vec<PathBuf>,

    /// Query execution limits.
    pub execution: Execution,

    pub telemetry: Telemetry,

    /// Where secrets come from.
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Server {
    /// The socket address and port to listen on.
    /// Defaults to 127.0.0.1:7890
    #[schemars(with = "String")]
    pub listen: SocketAddr,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7890)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Execution {
    /// Time budget of the execution of one query.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub timeout: Duration,

    /// Seed for random injections and the random runtime. Random values are
    /// reproducible when set.
    pub random_seed: Option<u64>,

    /// Maximum nesting of a selection set.
    pub max_depth: usize,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            random_seed: None,
            max_depth: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Telemetry {
    pub format: LogFormat,
    /// Log filter, in `RUST_LOG` syntax.
    pub filter: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Secrets {
    /// Prefix of the environment variables holding typegraph secrets:
    /// `{prefix}{TYPEGRAPH}_{NAME}`.
    pub prefix: String,
}

impl Default for Secrets {
    fn default() -> Self {
        Self {
            prefix: "TG_".to_string(),
        }
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration = if s.trim().is_empty() {
            Configuration::default()
        } else {
            serde_yaml::from_str(s).map_err(|e| ConfigurationError::InvalidYaml(e.to_string()))?
        };
        configuration.validate()?;
        Ok(configuration)
    }
}

impl Configuration {
    /// Reads and validates a YAML configuration file.
    pub fn read(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::CannotReadFile {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        raw.parse()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.execution.max_depth == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "execution.max_depth",
                error: "must be at least 1".to_string(),
            });
        }
        if self.execution.timeout.is_zero() {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "execution.timeout",
                error: "must not be zero".to_string(),
            });
        }
        Ok(())
    }

    /// Loads the typegraph documents, paths being relative to `base`.
    pub fn load_typegraphs(&self, base: &Path) -> Result<Vec<Typegraph>, ConfigurationError> {
        self.typegraphs
            .iter()
            .map(|path| {
                let path = base.join(path);
                let failed = |error: String| ConfigurationError::CannotLoadTypegraph {
                    path: path.display().to_string(),
                    error,
                };
                let raw = std::fs::read_to_string(&path).map_err(|e| failed(e.to_string()))?;
                Typegraph::from_json(&raw).map_err(|e| failed(e.to_string()))
            })
            .collect()
    }
}

/// The JSON schema of the configuration file.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = false;
    });
    settings.into_generator().into_root_schema_for::<Configuration>()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_configuration_uses_defaults() {
        let configuration: Configuration = "".parse().unwrap();
        assert_eq!(configuration.server.listen.port(), 7890);
        assert_eq!(configuration.execution.timeout, Duration::from_secs(30));
        assert_eq!(configuration.execution.max_depth, 32);
        assert_eq!(configuration.telemetry.format, LogFormat::Text);
        assert_eq!(configuration.secrets.prefix, "TG_");
    }

    #[test]
    fn parses_a_full_configuration() {
        let configuration: Configuration = r#"
server:
  listen: 0.0.0.0:4000
typegraphs:
  - blog.json
execution:
  timeout: 2s
  random_seed: 7
  max_depth: 10
telemetry:
  format: json
  filter: typegate=debug
secrets:
  prefix: APP_
"#
        .parse()
        .unwrap();
        assert_eq!(configuration.server.listen.port(), 4000);
        assert_eq!(configuration.typegraphs, vec![PathBuf::from("blog.json")]);
        assert_eq!(configuration.execution.timeout, Duration::from_secs(2));
        assert_eq!(configuration.execution.random_seed, Some(7));
        assert_eq!(configuration.telemetry.format, LogFormat::Json);
        assert_eq!(configuration.secrets.prefix, "APP_");
    }

    #[test]
    fn rejects_invalid_configurations() {
        assert!(matches!(
            "unknown: true".parse::<Configuration>(),
            Err(ConfigurationError::InvalidYaml(_))
        ));
        assert!(matches!(
            "execution:\n  max_depth: 0".parse::<Configuration>(),
            Err(ConfigurationError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn loads_typegraphs_relative_to_the_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("blog.json")).unwrap();
        file.write_all(crate::test_utils::BLOG.as_bytes()).unwrap();

        let configuration: Configuration = "typegraphs: [blog.json, missing.json]".parse().unwrap();
        let err = configuration.load_typegraphs(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigurationError::CannotLoadTypegraph { .. }));

        let configuration: Configuration = "typegraphs: [blog.json]".parse().unwrap();
        let typegraphs = configuration.load_typegraphs(dir.path()).unwrap();
        assert_eq!(typegraphs[0].name(), "blog");
    }

    #[test]
    fn schema_lists_the_sections() {
        let schema = serde_json::to_value(generate_config_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("execution"));
        assert!(properties.contains_key("telemetry"));
    }
}

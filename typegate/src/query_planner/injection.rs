use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::ArgumentBinding;
use super::Stage;
use super::StageId;
use super::StageKind;
use crate::error::StageError;
use crate::json_ext::content_hash;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::runtimes::random::random_value;
use crate::typegraph::SchemaIndex;
use crate::Context;
use crate::SecretStore;

/// Turns the argument bindings of a stage into concrete values.
///
/// Runs once the parent value and the results of the stages the stage depends
/// on are available.
pub(crate) struct InjectionResolver<'a> {
    schema: &'a SchemaIndex,
    secrets: &'a dyn SecretStore,
    random_seed: Option<u64>,
}

impl<'a> InjectionResolver<'a> {
    pub(crate) fn new(
        schema: &'a SchemaIndex,
        secrets: &'a dyn SecretStore,
        random_seed: Option<u64>,
    ) -> Self {
        Self {
            schema,
            secrets,
            random_seed,
        }
    }

    pub(crate) fn resolve(
        &self,
        stage: &Stage,
        parent: &Value,
        siblings: &HashMap<StageId, Value>,
        context: &Context,
    ) -> Result<Object, StageError> {
        let StageKind::Function { arguments, .. } = &stage.kind else {
            return Ok(Object::new());
        };
        let stage_id = || stage.id.to_string();

        let mut resolved = Object::new();
        for (name, binding) in arguments {
            let value = match binding {
                ArgumentBinding::Value { value } => value.clone(),
                ArgumentBinding::Context { path, optional } => match context.claim(path) {
                    Some(value) => value.clone(),
                    None if *optional => Value::Null,
                    None => {
                        return Err(StageError::MissingContext {
                            stage: stage_id(),
                            path: path.clone(),
                        })
                    }
                },
                ArgumentBinding::Secret { name: secret } => {
                    let value =
                        self.secrets
                            .get(secret)
                            .ok_or_else(|| StageError::MissingSecret {
                                stage: stage_id(),
                                name: secret.clone(),
                            })?;
                    Value::from(value)
                }
                ArgumentBinding::Parent { key, optional } => {
                    match parent.as_object().and_then(|object| object.get(key.as_str())) {
                        Some(value) if !value.is_null() => value.clone(),
                        _ if *optional => Value::Null,
                        _ => {
                            return Err(StageError::MissingParentValue {
                                stage: stage_id(),
                                key: key.clone(),
                            })
                        }
                    }
                }
                ArgumentBinding::Sibling {
                    field,
                    stage: sibling,
                    optional,
                } => match siblings.get(sibling) {
                    Some(value) if !value.is_null() => value.clone(),
                    _ if *optional => Value::Null,
                    _ => {
                        return Err(StageError::MissingParentValue {
                            stage: stage_id(),
                            key: field.clone(),
                        })
                    }
                },
                ArgumentBinding::Random { type_idx } => {
                    let mut rng = match self.random_seed {
                        Some(seed) => StdRng::seed_from_u64(seed ^ seed_offset(&stage.id, name)),
                        None => StdRng::from_os_rng(),
                    };
                    random_value(self.schema, *type_idx, &mut rng)
                }
                ArgumentBinding::Now => Value::from(chrono::Utc::now().to_rfc3339()),
            };
            resolved.insert(name.as_str(), value);
        }
        Ok(resolved)
    }
}

/// A per argument offset, so that two random arguments of one query differ.
fn seed_offset(stage: &StageId, argument: &str) -> u64 {
    let hash = content_hash(&(stage, argument));
    u64::from_str_radix(&hash[..16], 16).unwrap_or_default()
}

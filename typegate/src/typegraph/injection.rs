use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::EffectKind;
use crate::json_ext::Value;

/// The source of a function input field value.
///
/// Serialized as `{"source": "context", "data": {"single": "user.id"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "snake_case")]
pub enum Injection {
    /// A literal baked into the schema.
    Static(InjectionData<Value>),
    /// A dotted path into the request context.
    Context(InjectionData<String>),
    /// The name of a secret.
    Secret(InjectionData<String>),
    /// The name of a field of the parent object.
    Parent(InjectionData<String>),
    /// A value generated from the input field type.
    Random,
    /// The wall-clock time at resolution, `dynamic` is the legacy name.
    #[serde(alias = "dynamic")]
    Now,
}

/// Injection data, either shared by all effects or given per effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionData<T> {
    Single(T),
    PerEffect(BTreeMap<EffectKind, T>),
}

impl<T> InjectionData<T> {
    /// The data for `effect`. `None` means the field is not injected for this
    /// effect and the caller provides it.
    pub fn for_effect(&self, effect: EffectKind) -> Option<&T> {
        match self {
            InjectionData::Single(value) => Some(value),
            InjectionData::PerEffect(values) => values.get(&effect),
        }
    }
}

impl Injection {
    /// Whether this injection provides a value for `effect`.
    pub fn applies_to(&self, effect: EffectKind) -> bool {
        match self {
            Injection::Static(data) => data.for_effect(effect).is_some(),
            Injection::Context(data) | Injection::Secret(data) | Injection::Parent(data) => {
                data.for_effect(effect).is_some()
            }
            Injection::Random | Injection::Now => true,
        }
    }
}

//! Random data generated from the output type of a function.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use rand::SeedableRng;
use tokio::sync::Mutex;

use super::ExecutionRequest;
use super::Executor;
use crate::error::ExecutorError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::typegraph::SchemaIndex;
use crate::typegraph::TypeIdx;
use crate::typegraph::TypeKind;

const MAX_DEPTH: usize = 4;
const MAX_ITEMS: usize = 3;
const WORDS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
];

pub(crate) struct RandomExecutor {
    rng: Mutex<StdRng>,
}

impl RandomExecutor {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl Executor for RandomExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<Value, ExecutorError> {
        let mut rng = self.rng.lock().await;
        Ok(random_value(request.schema, request.output_type, &mut *rng))
    }
}

/// A random value of type `type_idx`. Function fields are left out, recursion
/// stops at a fixed depth.
pub(crate) fn random_value<R: Rng>(schema: &SchemaIndex, type_idx: TypeIdx, rng: &mut R) -> Value {
    generate(schema, type_idx, rng, 0)
}

fn generate<R: Rng>(schema: &SchemaIndex, type_idx: TypeIdx, rng: &mut R, depth: usize) -> Value {
    match &schema.resolve(type_idx).kind {
        TypeKind::Boolean {} => Value::Bool(rng.random()),
        TypeKind::Integer { minimum, maximum } => {
            let min = minimum.unwrap_or(0);
            let max = maximum.unwrap_or(min.saturating_add(1000)).max(min);
            Value::from(rng.random_range(min..=max))
        }
        TypeKind::Float { minimum, maximum } => random_float(*minimum, *maximum, rng),
        TypeKind::String {
            format,
            enumeration,
        } => {
            if let Some(choice) = enumeration.as_deref().and_then(|values| values.choose(rng)) {
                return Value::from(choice.as_str());
            }
            let word = WORDS.choose(rng).copied().unwrap_or("alpha");
            let value = match format.as_deref() {
                Some("email") => format!("{word}@example.com"),
                Some("uri") => format!("https://example.com/{word}"),
                Some("uuid") => uuid::Builder::from_random_bytes(rng.random())
                    .into_uuid()
                    .to_string(),
                Some("date-time") => chrono::DateTime::from_timestamp(
                    rng.random_range(0..4_102_444_800),
                    0,
                )
                .unwrap_or_default()
                .to_rfc3339(),
                _ => format!("{word}-{}", rng.random_range(0..10_000)),
            };
            Value::from(value)
        }
        TypeKind::File {} => Value::Null,
        TypeKind::Object { properties, .. } => {
            let mut object = Object::new();
            if depth >= MAX_DEPTH {
                return Value::Object(object);
            }
            for (name, property) in properties {
                if schema.function(*property).is_some() {
                    continue;
                }
                let key = schema.source_key(type_idx, name).to_string();
                object.insert(key, generate(schema, *property, rng, depth + 1));
            }
            Value::Object(object)
        }
        TypeKind::List { items } => {
            if depth >= MAX_DEPTH {
                return Value::Array(vec![]);
            }
            let len = rng.random_range(1..=MAX_ITEMS);
            Value::Array(
                (0..len)
                    .map(|_| generate(schema, *items, rng, depth + 1))
                    .collect(),
            )
        }
        TypeKind::Optional { item, .. } => {
            if depth >= MAX_DEPTH || rng.random_bool(0.2) {
                Value::Null
            } else {
                generate(schema, *item, rng, depth)
            }
        }
        TypeKind::Union { any_of: variants } | TypeKind::Either { one_of: variants } => {
            match variants.choose(rng) {
                Some(variant) => generate(schema, *variant, rng, depth),
                None => Value::Null,
            }
        }
        TypeKind::Function(function) => generate(schema, function.output, rng, depth),
    }
}

fn random_float<R: Rng>(minimum: Option<f64>, maximum: Option<f64>, rng: &mut R) -> Value {
    let min = minimum.unwrap_or(0.0);
    let max = maximum.unwrap_or(min + 1000.0);
    let value = if max <= min {
        min
    } else if (max - min).is_finite() {
        rng.random_range(min..max)
    } else {
        // the span overflows, interpolate between the bounds instead
        let t: f64 = rng.random();
        min * (1.0 - t) + max * t
    };
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

//! Performance oriented JSON manipulation.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;
use sha2::Digest;
use sha2::Sha256;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// Extension trait for [`serde_json_bytes::Value`].
pub trait ValueExt {
    /// Get a reference to the value at a dotted path such as `user.profile.id`.
    ///
    /// Numeric segments index into arrays.
    fn get_dotted(&self, path: &str) -> Option<&Value>;

    /// Number of items this value stands for: the length of an array, zero for
    /// `null` and one for anything else.
    fn count_items(&self) -> usize;

    /// Renders the value the way it should appear inside a URL or a header.
    ///
    /// Strings are not quoted, everything else uses its JSON representation.
    fn to_plain_string(&self) -> String;
}

impl ValueExt for Value {
    fn get_dotted(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Object(object) => object.get(segment),
            Value::Array(array) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| array.get(index)),
            _ => None,
        })
    }

    fn count_items(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Array(array) => array.len(),
            _ => 1,
        }
    }

    fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.as_str().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Content hash of anything serializable.
///
/// Serialization is canonical for our purposes: maps keep their insertion
/// order, so two structurally identical values built the same way hash the same.
pub(crate) fn content_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let mut hasher = Sha256::new();
    // serializing into a hasher cannot fail for the types we hash
    match serde_json::to_vec(value) {
        Ok(bytes) => hasher.update(bytes),
        Err(err) => hasher.update(err.to_string().as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// A GraphQL path element that is composed of strings or numbers.
/// e.g `/book/3/name`
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index path element.
    Index(usize),

    /// A key path element.
    Key(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => write!(f, "{key}"),
        }
    }
}

/// A path into the result document.
///
/// This can be composed of strings and numbers.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn push_key(&self, key: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(PathElement::Key(key.into()));
        new
    }

    pub fn push_index(&self, index: usize) -> Self {
        let mut new = self.clone();
        new.0.push(PathElement::Index(index));
        new
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|x| !x.is_empty())
                .map(|x| match x.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(x.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

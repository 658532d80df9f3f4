//! Path addressing and merging over response JSON.

use std::cmp::min;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

use crate::error::FetchError;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

const FLATTEN_CHARACTER: &str = "@";

/// Extension trait for [`serde_json_bytes::Value`].
pub trait ValueExt {
    /// Merges `other` into `self`: objects key by key, arrays index by index. Scalars replace,
    /// nulls never do.
    fn deep_merge(&mut self, other: Self);

    /// Wraps `value` in the objects and arrays `path` names.
    ///
    /// Missing array slots are null. A path containing a flatten element wraps a null instead.
    fn from_path(path: &Path, value: Value) -> Value;

    /// Merges `value` into the node at `path`, creating null intermediate nodes as needed.
    fn insert(&mut self, path: &Path, value: Value) -> Result<(), FetchError>;

    /// The value at `path`. Flatten elements are not allowed.
    fn get_path<'a>(&'a self, path: &'a Path) -> Result<&'a Value, FetchError>;

    /// Select all values matching a `Path`, along with the concrete path where each was found.
    ///
    /// Flatten elements expand over arrays. Missing keys and nulls are skipped.
    fn select_values_and_paths<'a, F>(&'a self, path: &'a Path, f: F)
    where
        F: FnMut(&Path, &'a Value);
}

impl ValueExt for Value {
    fn deep_merge(&mut self, other: Self) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b.into_iter() {
                    match a.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            a.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(a), Value::Array(mut b)) => {
                for (b_value, a_value) in b.drain(..min(a.len(), b.len())).zip(a.iter_mut()) {
                    a_value.deep_merge(b_value);
                }

                a.extend(b);
            }
            (_, Value::Null) => {}
            (a, b) => {
                *a = b;
            }
        }
    }

    fn from_path(path: &Path, value: Value) -> Value {
        let elements: Vec<&PathElement> = path
            .iter()
            .take_while(|p| !matches!(p, PathElement::Flatten))
            .collect();
        let mut res_value = if elements.len() == path.len() {
            value
        } else {
            Value::Null
        };

        for p in elements.into_iter().rev() {
            res_value = match p {
                PathElement::Index(index) => {
                    let mut array = vec![Value::Null; *index + 1];
                    array[*index] = res_value;
                    Value::Array(array)
                }
                PathElement::Key(key) => {
                    let mut object = Object::new();
                    object.insert(key.as_str(), res_value);
                    Value::Object(object)
                }
                PathElement::Flatten => res_value,
            };
        }

        res_value
    }

    fn insert(&mut self, path: &Path, value: Value) -> Result<(), FetchError> {
        let mut current_node = self;

        for p in path.iter() {
            match p {
                PathElement::Flatten => {
                    return Err(FetchError::ExecutionInvalidContent {
                        reason: "cannot insert at a flattened path".to_string(),
                    });
                }
                PathElement::Index(index) => {
                    if current_node.is_null() {
                        *current_node = Value::Array(Vec::new());
                    }
                    current_node = match current_node {
                        Value::Array(a) => {
                            if a.len() <= *index {
                                a.resize(*index + 1, Value::Null);
                            }
                            &mut a[*index]
                        }
                        _ => {
                            return Err(FetchError::ExecutionInvalidContent {
                                reason: "not an array".to_string(),
                            });
                        }
                    };
                }
                PathElement::Key(key) => {
                    if current_node.is_null() {
                        *current_node = Value::Object(Object::new());
                    }
                    current_node = match current_node {
                        Value::Object(o) => o.entry(key.as_str()).or_insert(Value::Null),
                        _ => {
                            return Err(FetchError::ExecutionInvalidContent {
                                reason: "not an object".to_string(),
                            });
                        }
                    };
                }
            }
        }

        current_node.deep_merge(value);
        Ok(())
    }

    fn get_path<'a>(&'a self, path: &'a Path) -> Result<&'a Value, FetchError> {
        let mut current = self;
        for p in path.iter() {
            current = match (p, current) {
                (PathElement::Key(key), Value::Object(o)) => {
                    o.get(key.as_str())
                        .ok_or_else(|| FetchError::ExecutionPathNotFound {
                            reason: format!("key {key} not found"),
                        })?
                }
                (PathElement::Index(i), Value::Array(a)) => {
                    a.get(*i).ok_or_else(|| FetchError::ExecutionPathNotFound {
                        reason: format!("index {i} not found"),
                    })?
                }
                (PathElement::Flatten, _) => {
                    return Err(FetchError::ExecutionInvalidContent {
                        reason: "cannot get a flattened path".to_string(),
                    });
                }
                _ => {
                    return Err(FetchError::ExecutionPathNotFound {
                        reason: format!("could not follow path {path}"),
                    });
                }
            };
        }
        Ok(current)
    }

    fn select_values_and_paths<'a, F>(&'a self, path: &'a Path, mut f: F)
    where
        F: FnMut(&Path, &'a Value),
    {
        iterate_path(&mut Path::default(), &path.0, self, &mut f)
    }
}

fn iterate_path<'a, F>(parent: &mut Path, path: &'a [PathElement], data: &'a Value, f: &mut F)
where
    F: FnMut(&Path, &'a Value),
{
    match path.first() {
        None => {
            if !data.is_null() {
                f(parent, data)
            }
        }
        Some(PathElement::Flatten) => {
            if let Some(array) = data.as_array() {
                for (i, value) in array.iter().enumerate() {
                    parent.push(PathElement::Index(i));
                    iterate_path(parent, &path[1..], value, f);
                    parent.pop();
                }
            }
        }
        Some(PathElement::Index(i)) => {
            if let Value::Array(a) = data {
                if let Some(value) = a.get(*i) {
                    parent.push(PathElement::Index(*i));
                    iterate_path(parent, &path[1..], value, f);
                    parent.pop();
                }
            }
        }
        Some(PathElement::Key(k)) => {
            if let Value::Object(o) = data {
                if let Some(value) = o.get(k.as_str()) {
                    parent.push(PathElement::Key(k.clone()));
                    iterate_path(parent, &path[1..], value, f);
                    parent.pop();
                }
            }
        }
    }
}

/// One step of a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathElement {
    /// Every item of an array. Written `@`.
    #[serde(
        deserialize_with = "deserialize_flatten",
        serialize_with = "serialize_flatten"
    )]
    Flatten,

    Index(usize),

    Key(String),
}

fn deserialize_flatten<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_str(FlattenVisitor)
}

struct FlattenVisitor;

impl serde::de::Visitor<'_> for FlattenVisitor {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a string that is '{FLATTEN_CHARACTER}'")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if s == FLATTEN_CHARACTER {
            Ok(())
        } else {
            Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            ))
        }
    }
}

fn serialize_flatten<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(FLATTEN_CHARACTER)
}

/// A location in a response, such as `hero/friends/@/name`.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn from_slice<T: AsRef<str>>(s: &[T]) -> Self {
        Self(
            s.iter()
                .map(|x| x.as_ref())
                .map(|s| {
                    if let Ok(index) = s.parse::<usize>() {
                        PathElement::Index(index)
                    } else if s == FLATTEN_CHARACTER {
                        PathElement::Flatten
                    } else {
                        PathElement::Key(s.to_string())
                    }
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            Some(Path(self.iter().take(self.len() - 1).cloned().collect()))
        }
    }

    pub fn join(&self, other: impl AsRef<Self>) -> Self {
        let other = other.as_ref();
        let mut new = Vec::with_capacity(self.len() + other.len());
        new.extend(self.iter().cloned());
        new.extend(other.iter().cloned());
        Path(new)
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element)
    }

    pub fn pop(&mut self) -> Option<PathElement> {
        self.0.pop()
    }

    /// Whether `self` designates `other` or one of its ancestors.
    ///
    /// Flatten elements on either side match any index.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        if self.len() > other.len() {
            return false;
        }
        self.iter().zip(other.iter()).all(|(a, b)| match (a, b) {
            (PathElement::Flatten, PathElement::Index(_))
            | (PathElement::Index(_), PathElement::Flatten)
            | (PathElement::Flatten, PathElement::Flatten) => true,
            (a, b) => a == b,
        })
    }

    /// Returns the path without its flatten elements.
    pub fn without_flatten(&self) -> Path {
        Path(
            self.iter()
                .filter(|e| !matches!(e, PathElement::Flatten))
                .cloned()
                .collect(),
        )
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
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
                .map(|s| {
                    if let Ok(index) = s.parse::<usize>() {
                        PathElement::Index(index)
                    } else if s == FLATTEN_CHARACTER {
                        PathElement::Flatten
                    } else {
                        PathElement::Key(s.to_string())
                    }
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for el in self.iter() {
            write!(f, "/")?;
            match el {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
                PathElement::Flatten => write!(f, "{FLATTEN_CHARACTER}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    macro_rules! assert_is_subset {
        ($a:expr, $b:expr $(,)?) => {
            assert!($a.eq_and_ordered(&$b));
        };
    }

    trait EqOrdered {
        fn eq_and_ordered(&self, other: &Self) -> bool;
    }

    impl EqOrdered for Value {
        fn eq_and_ordered(&self, other: &Self) -> bool {
            self == other && self.to_string() == other.to_string()
        }
    }

    #[test]
    fn test_deep_merge() {
        let mut json = json!({"obj":{"arr":[{"prop1":1},{"prop2":2}]}});
        json.deep_merge(json!({"obj":{"arr":[{"prop1":2,"prop3":3},{"prop4":4}]}}));
        assert_eq!(
            json,
            json!({"obj":{"arr":[{"prop1":2, "prop3":3},{"prop2":2, "prop4":4}]}})
        );
    }

    #[test]
    fn test_deep_merge_keeps_values_on_null() {
        let mut json = json!({"hero":{"name":"R2-D2"}});
        json.deep_merge(json!({"hero":null}));
        assert_is_subset!(json, json!({"hero":{"name":"R2-D2"}}));
    }

    #[test]
    fn test_from_path() {
        let json = json!([{"prop1":1},{"prop1":2}]);
        let path = Path::from("obj/arr/1");
        assert_eq!(
            Value::from_path(&path, json),
            json!({"obj":{"arr":[null, [{"prop1":1},{"prop1":2}]]}})
        );
        assert_eq!(
            Value::from_path(&Path::from("obj/@/name"), json!("Ada")),
            json!({"obj":null})
        );
    }

    #[test]
    fn test_insert_creates_intermediate_nodes() {
        let mut json = Value::Null;
        json.insert(&Path::from("topProducts/1/reviews"), json!([{"body":"good"}]))
            .unwrap();
        assert_eq!(
            json,
            json!({"topProducts":[null, {"reviews":[{"body":"good"}]}]})
        );
    }

    #[test]
    fn test_select_values_and_paths() {
        let json = json!({"me":{"reviews":[{"product":{"upc":"1"}},{"product":null},{"product":{"upc":"3"}}]}});
        let path = Path::from("me/reviews/@/product");
        let mut selected = Vec::new();
        json.select_values_and_paths(&path, |path, value| {
            selected.push((path.to_string(), value.clone()))
        });
        assert_eq!(
            selected,
            vec![
                ("/me/reviews/0/product".to_string(), json!({"upc":"1"})),
                ("/me/reviews/2/product".to_string(), json!({"upc":"3"})),
            ]
        );
    }

    #[test]
    fn test_path_serialization() {
        let path = Path::from("me/reviews/@/product");
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            r#"["me","reviews","@","product"]"#
        );
        let path: Path = serde_json::from_str(r#"["hero",0,"name"]"#).unwrap();
        assert_eq!(path.to_string(), "/hero/0/name");
    }

    #[test]
    fn test_prefix_matching() {
        assert!(Path::from("me/reviews/@").is_prefix_of(&Path::from("me/reviews/3/body")));
        assert!(!Path::from("me/friends").is_prefix_of(&Path::from("me/reviews/3/body")));
    }
}

//! Caller-supplied request context, sanitized before it is stored with events and assignments.
use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Metadata;

/// A JSON object describing the request that triggered a resolution (page, locale, etc.).
///
/// Use [`Context::capture`] to build one from arbitrary serializable values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, From)]
#[serde(transparent)]
pub struct Context(Metadata);

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Copy `fields` into a context.
    ///
    /// A full deep copy is attempted first. If any field fails to serialize, the copy falls back
    /// to keeping only the fields that are primitive values (string, number, boolean or null).
    pub fn capture<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Context
    where
        K: Into<String>,
        V: Serialize,
    {
        let fields: Vec<(String, V)> = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();

        match deep_copy(&fields) {
            Ok(map) => Context(map),
            Err(err) => {
                log::debug!(target: "experiments",
                            error:display = err;
                            "context is not fully serializable, keeping primitive fields only");
                Context(primitive_fields(&fields))
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Metadata {
        &self.0
    }

    pub fn into_map(self) -> Metadata {
        self.0
    }
}

fn deep_copy<V: Serialize>(fields: &[(String, V)]) -> serde_json::Result<Metadata> {
    fields
        .iter()
        .map(|(key, value)| Ok((key.clone(), serde_json::to_value(value)?)))
        .collect()
}

fn primitive_fields<V: Serialize>(fields: &[(String, V)]) -> Metadata {
    fields
        .iter()
        .filter_map(|(key, value)| match serde_json::to_value(value) {
            Ok(value @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null)) => {
                Some((key.clone(), value))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::{ser::Error as _, Serialize, Serializer};
    use serde_json::json;

    use super::Context;

    enum Field {
        Text(&'static str),
        Count(u32),
        Nested(Vec<u32>),
        Opaque,
    }

    impl Serialize for Field {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Field::Text(s) => serializer.serialize_str(s),
                Field::Count(n) => serializer.serialize_u32(*n),
                Field::Nested(values) => values.serialize(serializer),
                Field::Opaque => Err(S::Error::custom("opaque handle cannot be serialized")),
            }
        }
    }

    #[test]
    fn captures_everything_when_serializable() {
        let context = Context::capture([
            ("page", json!("writing/task-2")),
            ("attempt", json!(3)),
            ("tags", json!(["mock", "timed"])),
        ]);

        assert_eq!(context.get("page"), Some(&json!("writing/task-2")));
        assert_eq!(context.get("attempt"), Some(&json!(3)));
        assert_eq!(context.get("tags"), Some(&json!(["mock", "timed"])));
    }

    #[test]
    fn keeps_primitive_fields_when_copy_fails() {
        let context = Context::capture([
            ("page", Field::Text("reading")),
            ("attempt", Field::Count(2)),
            ("scores", Field::Nested(vec![6, 7])),
            ("handle", Field::Opaque),
        ]);

        assert_eq!(context.get("page"), Some(&json!("reading")));
        assert_eq!(context.get("attempt"), Some(&json!(2)));
        // Structured values are dropped along with the unserializable one.
        assert_eq!(context.get("scores"), None);
        assert_eq!(context.get("handle"), None);
        assert_eq!(context.as_map().len(), 2);
    }

    #[test]
    fn captures_from_hash_map() {
        let fields: HashMap<&str, Option<bool>> =
            HashMap::from([("premium", Some(true)), ("trial", None)]);
        let context = Context::capture(fields);

        assert_eq!(context.get("premium"), Some(&json!(true)));
        assert_eq!(context.get("trial"), Some(&json!(null)));
    }

    #[test]
    fn serializes_as_plain_object() {
        let mut context = Context::new();
        context.insert("locale", "en-GB");

        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!({ "locale": "en-GB" })
        );
    }
}

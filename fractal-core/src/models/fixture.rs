use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One serialized record inside a replication fixture.
///
/// Mirrors the `{model, pk, fields}` layout every replica understands, so a
/// fixture can carry entities and channels side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureEntry {
    pub model: String,
    pub pk: String,
    pub fields: Map<String, Value>,
}

impl FixtureEntry {
    pub fn new(model: impl Into<String>, pk: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            model: model.into(),
            pk: pk.into(),
            fields,
        }
    }

    /// Builds an entry from any serializable record, lifting its `id` field
    /// into `pk`.
    pub fn from_record<T: Serialize>(
        model: &str,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut fields = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let pk = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Ok(Self::new(model, pk, fields))
    }

    /// Rebuilds the record this entry was created from.
    pub fn to_record<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.pk.clone()));
        serde_json::from_value(Value::Object(fields))
    }

    /// Version used by the version-max merge. Accepts both integer and
    /// string encodings; anything else counts as version 0.
    pub fn object_version(&self) -> u64 {
        match self.fields.get("object_version") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Identity of the record this entry describes.
    pub fn key(&self) -> (&str, &str) {
        (self.model.as_str(), self.pk.as_str())
    }
}

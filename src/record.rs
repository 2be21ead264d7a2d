use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{DataKind, ProductName, SourceLocator};
use crate::error::NimbusError;

/// Storage type of an index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Text,
    Int,
    Real,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Real(f64),
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Real(_) => FieldType::Real,
            FieldValue::DateTime(_) => FieldType::DateTime,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(value) => Value::from(value.as_str()),
            FieldValue::Int(value) => Value::from(*value),
            FieldValue::Real(value) => Value::from(*value),
            FieldValue::DateTime(value) => Value::from(value.to_rfc3339()),
        }
    }

    fn from_json(field_type: FieldType, value: &Value) -> Option<Self> {
        match field_type {
            FieldType::Text => value.as_str().map(|v| FieldValue::Text(v.to_string())),
            FieldType::Int => value.as_i64().map(FieldValue::Int),
            FieldType::Real => value.as_f64().map(FieldValue::Real),
            FieldType::DateTime => value
                .as_str()
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|v| FieldValue::DateTime(v.with_timezone(&Utc))),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::DateTime(value)
    }
}

const CORE_FIELDS: [(&str, FieldType); 6] = [
    ("product", FieldType::Text),
    ("kind", FieldType::Text),
    ("source_locator", FieldType::Text),
    ("final_path", FieldType::Text),
    ("byte_size", FieldType::Int),
    ("last_modified", FieldType::DateTime),
];

/// Column name to storage type mapping for one index table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema(BTreeMap<String, FieldType>);

impl FieldSchema {
    pub fn core() -> Self {
        Self(
            CORE_FIELDS
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
        )
    }

    pub fn with_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.0.insert(name.to_string(), field_type);
        self
    }

    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.0.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    /// Checks that `record` carries exactly the schema's columns with matching types.
    pub fn validate(&self, record: &MetadataRecord) -> Result<(), NimbusError> {
        for (name, ty) in CORE_FIELDS {
            if self.get(name) != Some(ty) {
                return Err(NimbusError::SchemaMismatch(format!(
                    "schema must declare core field {name} as {ty:?}"
                )));
            }
        }
        for (name, value) in &record.extra {
            match self.get(name) {
                Some(ty) if ty == value.field_type() => {}
                Some(ty) => {
                    return Err(NimbusError::SchemaMismatch(format!(
                        "field {name} is {:?}, schema expects {ty:?}",
                        value.field_type()
                    )));
                }
                None => {
                    return Err(NimbusError::SchemaMismatch(format!(
                        "field {name} is not declared in the schema"
                    )));
                }
            }
        }
        for (name, _) in self.iter() {
            let is_core = CORE_FIELDS.iter().any(|(core, _)| *core == name);
            if !is_core && !record.extra.contains_key(name) {
                return Err(NimbusError::SchemaMismatch(format!(
                    "record is missing field {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Durable description of one retrieved artifact. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRecord {
    pub product: ProductName,
    pub kind: DataKind,
    pub source_locator: SourceLocator,
    pub final_path: Utf8PathBuf,
    pub byte_size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, FieldValue>,
}

impl MetadataRecord {
    /// Builds the core record for a file that is already at `final_path`.
    pub fn for_file(
        product: ProductName,
        kind: DataKind,
        source_locator: SourceLocator,
        final_path: &Utf8Path,
    ) -> Result<Self, NimbusError> {
        let meta = fs::metadata(final_path.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("stat {final_path}: {err}")))?;
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            product,
            kind,
            source_locator,
            final_path: final_path.to_path_buf(),
            byte_size: meta.len(),
            last_modified,
            extra: BTreeMap::new(),
        })
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.extra.get(name)
    }

    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("product".to_string(), Value::from(self.product.as_str()));
        row.insert("kind".to_string(), Value::from(self.kind.as_str()));
        row.insert(
            "source_locator".to_string(),
            Value::from(self.source_locator.as_str()),
        );
        row.insert("final_path".to_string(), Value::from(self.final_path.as_str()));
        row.insert("byte_size".to_string(), Value::from(self.byte_size));
        row.insert(
            "last_modified".to_string(),
            Value::from(self.last_modified.to_rfc3339()),
        );
        for (name, value) in &self.extra {
            row.insert(name.clone(), value.to_json());
        }
        row
    }

    pub fn from_row(schema: &FieldSchema, row: &Map<String, Value>) -> Result<Self, NimbusError> {
        let byte_size = row
            .get("byte_size")
            .and_then(Value::as_u64)
            .ok_or_else(|| NimbusError::SchemaMismatch("row has no byte_size".to_string()))?;
        let last_modified = DateTime::parse_from_rfc3339(row_text(row, "last_modified")?)
            .map_err(|err| NimbusError::SchemaMismatch(format!("last_modified: {err}")))?
            .with_timezone(&Utc);

        let mut extra = BTreeMap::new();
        for (name, ty) in schema.iter() {
            if CORE_FIELDS.iter().any(|(core, _)| *core == name) {
                continue;
            }
            let value = row
                .get(name)
                .and_then(|value| FieldValue::from_json(ty, value))
                .ok_or_else(|| {
                    NimbusError::SchemaMismatch(format!("row field {name} is not {ty:?}"))
                })?;
            extra.insert(name.to_string(), value);
        }

        Ok(Self {
            product: row_text(row, "product")?.parse()?,
            kind: row_text(row, "kind")?.parse()?,
            source_locator: row_text(row, "source_locator")?.parse()?,
            final_path: Utf8PathBuf::from(row_text(row, "final_path")?),
            byte_size,
            last_modified,
            extra,
        })
    }
}

fn row_text<'a>(row: &'a Map<String, Value>, name: &str) -> Result<&'a str, NimbusError> {
    row.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| NimbusError::SchemaMismatch(format!("row has no text field {name}")))
}

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::domain::SourceLocator;
use crate::error::NimbusError;
use crate::record::{FieldSchema, MetadataRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Conflict,
}

/// Period-scoped, append-only store of metadata records keyed by source locator.
///
/// `selector` names one instance. Implementations must make the
/// exists-then-insert sequence safe under concurrent callers.
pub trait PersistedIndex: Send + Sync {
    fn init(&self, selector: &Utf8Path, schema: &FieldSchema) -> Result<(), NimbusError>;
    fn exists(&self, selector: &Utf8Path, key: &SourceLocator) -> Result<bool, NimbusError>;
    fn insert(
        &self,
        selector: &Utf8Path,
        record: &MetadataRecord,
    ) -> Result<InsertOutcome, NimbusError>;
    fn export(&self, selector: &Utf8Path) -> Result<Vec<MetadataRecord>, NimbusError>;
    fn list_instances(&self) -> Result<Vec<Utf8PathBuf>, NimbusError>;
}

const TABLE: &str = "file";
const PRIMARY_KEY: &str = "source_locator";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    table: String,
    primary_key: String,
    schema: FieldSchema,
}

#[derive(Debug)]
struct Instance {
    schema: FieldSchema,
    keys: HashSet<String>,
}

/// One JSON-lines file per instance: a header line, then one row per record.
#[derive(Debug)]
pub struct JsonlIndex {
    root: Utf8PathBuf,
    instances: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<Instance>>>>,
}

impl JsonlIndex {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn instance(&self, selector: &Utf8Path) -> Result<Arc<Mutex<Instance>>, NimbusError> {
        let instances = self
            .instances
            .lock()
            .map_err(|_| NimbusError::Filesystem("index registry lock poisoned".to_string()))?;
        instances
            .get(selector)
            .cloned()
            .ok_or_else(|| NimbusError::IndexNotInitialized(selector.to_path_buf()))
    }
}

impl PersistedIndex for JsonlIndex {
    fn init(&self, selector: &Utf8Path, schema: &FieldSchema) -> Result<(), NimbusError> {
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| NimbusError::Filesystem("index registry lock poisoned".to_string()))?;
        if let Some(existing) = instances.get(selector) {
            let existing = lock(existing)?;
            return check_schema(selector, &existing.schema, schema);
        }

        let instance = if selector.as_std_path().exists() {
            let (header, rows, torn) = read_instance(selector)?;
            check_schema(selector, &header.schema, schema)?;
            if let Some(complete) = torn {
                truncate(selector, complete)?;
            }
            let keys = rows
                .iter()
                .filter_map(|row| row.get(PRIMARY_KEY).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            Instance {
                schema: header.schema,
                keys,
            }
        } else {
            write_header(selector, schema)?;
            debug!(index = %selector, "created index instance");
            Instance {
                schema: schema.clone(),
                keys: HashSet::new(),
            }
        };
        instances.insert(selector.to_path_buf(), Arc::new(Mutex::new(instance)));
        Ok(())
    }

    fn exists(&self, selector: &Utf8Path, key: &SourceLocator) -> Result<bool, NimbusError> {
        let instance = self.instance(selector)?;
        let instance = lock(&instance)?;
        Ok(instance.keys.contains(key.as_str()))
    }

    fn insert(
        &self,
        selector: &Utf8Path,
        record: &MetadataRecord,
    ) -> Result<InsertOutcome, NimbusError> {
        let instance = self.instance(selector)?;
        let mut instance = lock(&instance)?;
        instance.schema.validate(record)?;
        if instance.keys.contains(record.source_locator.as_str()) {
            return Ok(InsertOutcome::Conflict);
        }

        let mut line = serde_json::to_string(&record.to_row())
            .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .open(selector.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("open {selector}: {err}")))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|err| NimbusError::Filesystem(format!("append {selector}: {err}")))?;

        instance
            .keys
            .insert(record.source_locator.as_str().to_string());
        Ok(InsertOutcome::Inserted)
    }

    fn export(&self, selector: &Utf8Path) -> Result<Vec<MetadataRecord>, NimbusError> {
        let (header, rows, _) = read_instance(selector)?;
        rows.iter()
            .map(|row| MetadataRecord::from_row(&header.schema, row))
            .collect()
    }

    fn list_instances(&self) -> Result<Vec<Utf8PathBuf>, NimbusError> {
        if !self.root.as_std_path().is_dir() {
            return Err(NimbusError::IndexRootMissing(self.root.clone()));
        }
        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = dir
                .read_dir_utf8()
                .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|err| NimbusError::Filesystem(err.to_string()))?;
                let path = entry.path().to_path_buf();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension() == Some("jsonl") {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn lock(instance: &Mutex<Instance>) -> Result<std::sync::MutexGuard<'_, Instance>, NimbusError> {
    instance
        .lock()
        .map_err(|_| NimbusError::Filesystem("index instance lock poisoned".to_string()))
}

fn check_schema(
    selector: &Utf8Path,
    existing: &FieldSchema,
    requested: &FieldSchema,
) -> Result<(), NimbusError> {
    if existing != requested {
        return Err(NimbusError::SchemaMismatch(format!(
            "{selector} was created with a different schema"
        )));
    }
    Ok(())
}

// Appends must start on a fresh line.
fn truncate(selector: &Utf8Path, len: u64) -> Result<(), NimbusError> {
    let file = OpenOptions::new()
        .write(true)
        .open(selector.as_std_path())
        .map_err(|err| NimbusError::Filesystem(format!("open {selector}: {err}")))?;
    file.set_len(len)
        .and_then(|_| file.sync_data())
        .map_err(|err| NimbusError::Filesystem(format!("truncate {selector}: {err}")))
}

fn write_header(selector: &Utf8Path, schema: &FieldSchema) -> Result<(), NimbusError> {
    if let Some(parent) = selector.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
    }
    let header = Header {
        table: TABLE.to_string(),
        primary_key: PRIMARY_KEY.to_string(),
        schema: schema.clone(),
    };
    let mut content =
        serde_json::to_vec(&header).map_err(|err| NimbusError::Filesystem(err.to_string()))?;
    content.push(b'\n');
    let tmp_path = selector.with_extension("jsonl.tmp");
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), selector.as_std_path())
        .map_err(|err| NimbusError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Header, complete rows, and the byte length of the complete part when the
/// file ends in a row torn by an interrupted append.
type InstanceContents = (Header, Vec<Map<String, Value>>, Option<u64>);

fn read_instance(selector: &Utf8Path) -> Result<InstanceContents, NimbusError> {
    let corrupt = |message: String| NimbusError::IndexCorrupt {
        path: selector.to_path_buf(),
        message,
    };
    let content = fs::read_to_string(selector.as_std_path())
        .map_err(|err| NimbusError::Filesystem(format!("read {selector}: {err}")))?;
    let complete = content
        .rfind('\n')
        .map(|end| &content[..=end])
        .ok_or_else(|| corrupt("missing header".to_string()))?;
    let torn = (complete.len() < content.len()).then_some(complete.len() as u64);
    if torn.is_some() {
        warn!(index = %selector, "ignoring unterminated trailing row");
    }
    let mut lines = complete.lines();

    let header_line = lines
        .next()
        .ok_or_else(|| corrupt("missing header".to_string()))?;
    let header: Header =
        serde_json::from_str(header_line).map_err(|err| corrupt(err.to_string()))?;

    let mut rows = Vec::new();
    for (number, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Map<String, Value> = serde_json::from_str(line)
            .map_err(|err| corrupt(format!("line {}: {err}", number + 2)))?;
        rows.push(row);
    }
    Ok((header, rows, torn))
}

//! Device schema registry.
//! Maps the cloud's functional schema onto numeric datapoint descriptors and
//! keeps one snapshot per device id behind a pluggable store.

use crate::error::{Result, TuyaError};
use base64::{Engine as _, engine::general_purpose};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const KEY_RESULT: &str = "result";

/// Cloud schema response (`result` of the device specification endpoint).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSchema {
    #[serde(default)]
    pub functions: Vec<SchemaDescription>,
    #[serde(default)]
    pub status: Vec<SchemaDescription>,
}

/// One entry of `functions` or `status`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDescription {
    pub code: String,
    #[serde(default)]
    pub dp_id: Option<u32>,
    #[serde(rename = "type", default)]
    pub type_name: String,
    /// Either an embedded JSON string or an object.
    #[serde(default)]
    pub values: Value,
}

impl SchemaDescription {
    fn values(&self) -> Map<String, Value> {
        let parsed = match &self.values {
            Value::String(s) if s.trim().is_empty() => Value::Null,
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|e| {
                warn!("Schema values of '{}' are not JSON ({}), ignoring", self.code, e);
                Value::Null
            }),
            other => other.clone(),
        };
        match parsed {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn dp_type(&self) -> DpType {
        let values = self.values();
        let int = |key: &str, default: i64| {
            values
                .get(key)
                .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
                .unwrap_or(default)
        };
        let strings = |key: &str| -> Vec<String> {
            values
                .get(key)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default()
        };

        match self.type_name.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => DpType::Boolean,
            "integer" | "value" => DpType::Integer {
                min: int("min", i64::MIN),
                max: int("max", i64::MAX),
                step: int("step", 1),
                scale: u32::try_from(int("scale", 0)).unwrap_or(0),
            },
            "enum" => DpType::Enum {
                range: strings("range"),
            },
            "string" | "json" => DpType::String,
            "bitmap" => DpType::Bitmap {
                labels: strings("label"),
                max_len: u32::try_from(int("maxlen", 0)).unwrap_or(0),
            },
            "raw" => DpType::Raw,
            other => {
                warn!("Unknown datapoint type '{}' for '{}', treating as raw", other, self.code);
                DpType::Raw
            }
        }
    }
}

/// Value type of a datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DpType {
    Boolean,
    Integer {
        min: i64,
        max: i64,
        step: i64,
        scale: u32,
    },
    Enum {
        range: Vec<String>,
    },
    String,
    Raw,
    Bitmap {
        labels: Vec<String>,
        max_len: u32,
    },
}

/// Numeric datapoint descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDp {
    pub id: u32,
    pub code: String,
    #[serde(flatten)]
    pub dp_type: DpType,
}

impl SchemaDp {
    pub fn new<S: Into<String>>(id: u32, code: S, dp_type: DpType) -> Self {
        Self {
            id,
            code: code.into(),
            dp_type,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> TuyaError {
        TuyaError::InvalidValue {
            code: self.code.clone(),
            reason: reason.into(),
        }
    }

    /// Converts a caller-supplied value into the form the device expects.
    ///
    /// Integers are clamped into `[min, max]`; booleans also accept
    /// `on`/`off`/`true`/`false` strings.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        match &self.dp_type {
            DpType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "on" | "true" => Ok(Value::Bool(true)),
                    "off" | "false" => Ok(Value::Bool(false)),
                    _ => Err(self.invalid(format!("'{}' is not a boolean", s))),
                },
                other => Err(self.invalid(format!("{} is not a boolean", other))),
            },
            DpType::Integer { min, max, .. } => {
                let n = match value {
                    Value::Number(n) => n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f.round() as i64)),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| self.invalid(format!("{} is not an integer", value)))?;
                let clamped = n.clamp(*min, (*max).max(*min));
                if clamped != n {
                    debug!("Clamped '{}' from {} to {}", self.code, n, clamped);
                }
                Ok(Value::from(clamped))
            }
            DpType::Enum { range } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| self.invalid(format!("{} is not a string", value)))?;
                if range.is_empty() || range.iter().any(|r| r == s) {
                    Ok(Value::String(s.to_string()))
                } else {
                    Err(self.invalid(format!("'{}' is not one of {:?}", s, range)))
                }
            }
            DpType::String => match value {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Null => Err(self.invalid("null is not a string")),
                other => Ok(Value::String(other.to_string())),
            },
            DpType::Raw => {
                let s = value
                    .as_str()
                    .ok_or_else(|| self.invalid("raw values are base64 strings"))?;
                general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| self.invalid(format!("not base64: {}", e)))?;
                Ok(Value::String(s.to_string()))
            }
            DpType::Bitmap { max_len, .. } => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| self.invalid(format!("{} is not a bitmap", value)))?;
                if *max_len > 0 && *max_len < 64 && n >= (1u64 << max_len) {
                    return Err(self.invalid(format!("{} exceeds {} bits", n, max_len)));
                }
                Ok(Value::from(n))
            }
        }
    }
}

fn add_unique(description: &SchemaDescription, dps: &mut Vec<SchemaDp>) {
    let id = match description.dp_id {
        Some(id) if id != 0 => id,
        _ => return,
    };
    if dps.iter().any(|dp| dp.id == id) {
        return;
    }

    let mut code = description.code.clone();
    let mut index = 1;
    while dps.iter().any(|dp| dp.code == code) {
        code = format!("{}_{}", description.code, index);
        index += 1;
    }
    if code != description.code {
        warn!(
            "Schema conflict: code '{}' already used, dp {} registered as '{}'",
            description.code, id, code
        );
    }

    dps.push(SchemaDp::new(id, code, description.dp_type()));
}

/// Flattens a cloud schema (optionally wrapped in `{"result": ...}`) into datapoints.
///
/// `functions` are taken before `status`; the first entry for an id wins.
pub fn from_remote_schema(raw: &Value) -> Result<Vec<SchemaDp>> {
    let body = raw.get(KEY_RESULT).unwrap_or(raw);
    let schema: DeviceSchema =
        serde_json::from_value(body.clone()).map_err(|e| TuyaError::Schema(e.to_string()))?;

    let mut dps = Vec::with_capacity(schema.functions.len() + schema.status.len());
    for description in schema.functions.iter().chain(schema.status.iter()) {
        add_unique(description, &mut dps);
    }
    Ok(dps)
}

/// Indexed, immutable datapoint schema of one device.
#[derive(Debug, Clone, Default)]
pub struct DpSchema {
    dps: Vec<SchemaDp>,
    by_id: HashMap<u32, usize>,
    by_code: HashMap<String, usize>,
}

impl DpSchema {
    pub fn new(dps: Vec<SchemaDp>) -> Self {
        let mut by_id = HashMap::with_capacity(dps.len());
        let mut by_code = HashMap::with_capacity(dps.len());
        for (i, dp) in dps.iter().enumerate() {
            by_id.entry(dp.id).or_insert(i);
            by_code.entry(dp.code.clone()).or_insert(i);
        }
        Self { dps, by_id, by_code }
    }

    pub fn from_remote(raw: &Value) -> Result<Self> {
        Ok(Self::new(from_remote_schema(raw)?))
    }

    pub fn by_id(&self, id: u32) -> Option<&SchemaDp> {
        self.by_id.get(&id).map(|&i| &self.dps[i])
    }

    pub fn by_code(&self, code: &str) -> Option<&SchemaDp> {
        self.by_code.get(code).map(|&i| &self.dps[i])
    }

    pub fn dps(&self) -> &[SchemaDp] {
        &self.dps
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.dps.iter().map(|dp| dp.id)
    }

    pub fn len(&self) -> usize {
        self.dps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dps.is_empty()
    }

    /// Symbolic name of a datapoint id; ids outside the schema map to their decimal form.
    pub fn code_for(&self, id: u32) -> String {
        self.by_id(id)
            .map(|dp| dp.code.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Keyed string storage for serialized schemas.
pub trait SchemaStore: Send + Sync {
    fn put(&self, device_id: &str, schema_json: &str) -> Result<()>;

    fn get(&self, device_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct MemorySchemaStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaStore for MemorySchemaStore {
    fn put(&self, device_id: &str, schema_json: &str) -> Result<()> {
        self.entries
            .write()
            .insert(device_id.to_string(), schema_json.to_string());
        Ok(())
    }

    fn get(&self, device_id: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(device_id).cloned())
    }
}

/// Stores each schema as `<dir>/<device_id>.json`.
#[derive(Debug, Clone)]
pub struct FileSchemaStore {
    dir: PathBuf,
}

impl FileSchemaStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, device_id: &str) -> Result<PathBuf> {
        if device_id.is_empty()
            || device_id == "."
            || device_id == ".."
            || device_id.contains(['/', '\\'])
        {
            return Err(TuyaError::Schema(format!(
                "device id '{}' cannot be used as a file name",
                device_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", device_id)))
    }
}

impl SchemaStore for FileSchemaStore {
    fn put(&self, device_id: &str, schema_json: &str) -> Result<()> {
        let path = self.path_for(device_id)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| TuyaError::Schema(e.to_string()))?;
        std::fs::write(&path, schema_json).map_err(|e| TuyaError::Schema(e.to_string()))?;
        debug!("Schema for {} written to {}", device_id, path.display());
        Ok(())
    }

    fn get(&self, device_id: &str) -> Result<Option<String>> {
        let path = self.path_for(device_id)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TuyaError::Schema(e.to_string())),
        }
    }
}

/// Read-mostly registry of device schemas shared by all devices.
pub struct SchemaRegistry {
    store: Box<dyn SchemaStore>,
    cache: RwLock<HashMap<String, Arc<DpSchema>>>,
}

impl SchemaRegistry {
    pub fn new<S: SchemaStore + 'static>(store: S) -> Self {
        Self {
            store: Box::new(store),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemorySchemaStore::new())
    }

    /// Stores the datapoints of a device and returns the indexed snapshot.
    pub fn persist(&self, device_id: &str, dps: Vec<SchemaDp>) -> Result<Arc<DpSchema>> {
        let json = serde_json::to_string(&dps)?;
        self.store.put(device_id, &json)?;
        let schema = Arc::new(DpSchema::new(dps));
        self.cache
            .write()
            .insert(device_id.to_string(), schema.clone());
        Ok(schema)
    }

    /// Converts and stores a raw cloud schema response.
    pub fn persist_remote(&self, device_id: &str, raw: &Value) -> Result<Arc<DpSchema>> {
        self.persist(device_id, from_remote_schema(raw)?)
    }

    pub fn load(&self, device_id: &str) -> Result<Arc<DpSchema>> {
        if let Some(schema) = self.cache.read().get(device_id) {
            return Ok(schema.clone());
        }

        let json = self
            .store
            .get(device_id)?
            .ok_or_else(|| TuyaError::DeviceNotFound(device_id.to_string()))?;
        let dps: Vec<SchemaDp> =
            serde_json::from_str(&json).map_err(|e| TuyaError::Schema(e.to_string()))?;
        let schema = Arc::new(DpSchema::new(dps));
        self.cache
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| schema.clone());
        Ok(schema)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

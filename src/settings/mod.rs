//! Typed parameter store backed by YAML documents.
//!
//! [`Settings`] is a flat property bag mapping string keys to [`serde_yaml::Value`]s.
//! Consumers extract typed views from it with [`Settings::ensure`] and the typed getters,
//! which fail with [`SettingsError::MissingParameter`] when a key is absent or carries a
//! value of the wrong kind.

use log::{debug, info};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("Missing settings entry [{key}] of type {expected}")]
    MissingParameter {
        key: String,
        expected: ParamKind,
        /// Kind of the value actually stored, `None` when the key is absent.
        found: Option<ParamKind>,
    },
    #[error("Settings file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Settings document must be a mapping with string keys")]
    InvalidDocument,
    #[error("Settings are stored as .yaml, got {0}")]
    UnsupportedFormat(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime kind of a settings value.
///
/// Kinds are compared strictly: an integer is never a `Float`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl ParamKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ParamKind::Null,
            Value::Bool(_) => ParamKind::Bool,
            Value::Number(n) if n.is_f64() => ParamKind::Float,
            Value::Number(_) => ParamKind::Int,
            Value::String(_) => ParamKind::Str,
            Value::Sequence(_) => ParamKind::List,
            Value::Mapping(_) => ParamKind::Map,
            Value::Tagged(tagged) => ParamKind::of(&tagged.value),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Null => "null",
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::List => "list",
            ParamKind::Map => "map",
        };
        f.write_str(name)
    }
}

/// Flat mapping of named configuration values.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    entries: BTreeMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns every entry of `params`, last write wins.
    pub fn from_map<K, I>(&mut self, params: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        for (key, value) in params {
            self.entries.insert(key.into(), value);
        }
    }

    /// Parses a YAML document and merges its top-level mapping into the store.
    ///
    /// An empty document leaves the store unchanged.
    pub fn from_yaml_str(&mut self, document: &str) -> Result<(), SettingsError> {
        let value: Value = serde_yaml::from_str(document)?;
        let mapping = match value {
            Value::Null => return Ok(()),
            Value::Mapping(mapping) => mapping,
            _ => return Err(SettingsError::InvalidDocument),
        };
        let mut params = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(SettingsError::InvalidDocument);
            };
            params.push((key, value));
        }
        self.from_map(params);
        Ok(())
    }

    /// Reads and merges a YAML settings file.
    pub fn from_file(&mut self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        let document = fs::read_to_string(path)?;
        self.from_yaml_str(&document)?;
        debug!("Loaded {} settings entries from {}", self.len(), path.display());
        Ok(())
    }

    /// Loads a fresh store from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let mut settings = Self::new();
        settings.from_file(path)?;
        Ok(settings)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that `key` is present and holds a value of `kind`.
    pub fn ensure(&self, key: &str, kind: ParamKind) -> Result<&Value, SettingsError> {
        match self.entries.get(key) {
            Some(value) if ParamKind::of(value) == kind => Ok(value),
            value => Err(missing(key, kind, value.map(ParamKind::of))),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, SettingsError> {
        self.opt_str(key)?
            .ok_or_else(|| missing(key, ParamKind::Str, self.found(key)))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, SettingsError> {
        self.opt_i64(key)?
            .ok_or_else(|| missing(key, ParamKind::Int, self.found(key)))
    }

    /// Like [`get_i64`](Self::get_i64) for non-negative counts.
    pub fn get_usize(&self, key: &str) -> Result<usize, SettingsError> {
        let value = self.get_i64(key)?;
        usize::try_from(value).map_err(|_| missing(key, ParamKind::Int, Some(ParamKind::Int)))
    }

    /// Reads a number, integers are widened.
    pub fn get_f64(&self, key: &str) -> Result<f64, SettingsError> {
        self.opt_f64(key)?
            .ok_or_else(|| missing(key, ParamKind::Float, self.found(key)))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, SettingsError> {
        self.opt_bool(key)?
            .ok_or_else(|| missing(key, ParamKind::Bool, self.found(key)))
    }

    /// Returns `None` for absent and null entries, and fails on any other kind than string.
    pub fn opt_str(&self, key: &str) -> Result<Option<&str>, SettingsError> {
        match self.entries.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(missing(key, ParamKind::Str, Some(ParamKind::of(other)))),
        }
    }

    pub fn opt_i64(&self, key: &str) -> Result<Option<i64>, SettingsError> {
        match self.entries.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| missing(key, ParamKind::Int, Some(ParamKind::of(v)))),
        }
    }

    pub fn opt_f64(&self, key: &str) -> Result<Option<f64>, SettingsError> {
        match self.entries.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v @ Value::Number(_)) => Ok(v.as_f64()),
            Some(v) => Err(missing(key, ParamKind::Float, Some(ParamKind::of(v)))),
        }
    }

    pub fn opt_bool(&self, key: &str) -> Result<Option<bool>, SettingsError> {
        match self.entries.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(v) => Err(missing(key, ParamKind::Bool, Some(ParamKind::of(v)))),
        }
    }

    /// Schema equality.
    ///
    /// True when every key of `self` exists in `other` with a value of the same
    /// [`ParamKind`]. Values are not compared and extra keys in `other` are ignored, so
    /// `a.schema_eq(&b)` does not imply `b.schema_eq(&a)`.
    pub fn schema_eq(&self, other: &Settings) -> bool {
        self.entries.iter().all(|(key, value)| {
            other
                .entries
                .get(key)
                .is_some_and(|o| ParamKind::of(o) == ParamKind::of(value))
        })
    }

    /// Writes every entry to `<dir>/<name>[_<unix seconds>].yaml`, creating `dir` if needed.
    ///
    /// `name` may carry a `.yaml`/`.yml` extension, any other extension is rejected.
    pub fn save(
        &self,
        dir: impl AsRef<Path>,
        name: &str,
        with_timestamp: bool,
    ) -> Result<PathBuf, SettingsError> {
        let dir = dir.as_ref();
        let mut stem = match name.split_once('.') {
            None => name.to_string(),
            Some((stem, ext)) if matches!(ext, "yaml" | "yml") => stem.to_string(),
            Some(_) => return Err(SettingsError::UnsupportedFormat(name.to_string())),
        };
        if with_timestamp {
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            stem.push_str(&format!("_{seconds}"));
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}.yaml"));
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        serde_yaml::to_writer(&mut writer, &self.entries)?;
        writer.flush()?;
        info!("Settings saved to {}", path.display());
        Ok(path)
    }

    fn found(&self, key: &str) -> Option<ParamKind> {
        self.entries.get(key).map(ParamKind::of)
    }
}

fn missing(key: &str, expected: ParamKind, found: Option<ParamKind>) -> SettingsError {
    SettingsError::MissingParameter {
        key: key.to_string(),
        expected,
        found,
    }
}

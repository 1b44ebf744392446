//! Explicit-field persistence.
//!
//! Entities implement [`Persist`] by listing the fields they want stored and by restoring
//! them by name. The free functions in this module move a [`FieldMap`] between an entity
//! and one of three file encodings, chosen by file extension:
//!
//! | extension       | encoding                          |
//! |-----------------|-----------------------------------|
//! | `.bin`          | tagged little-endian binary       |
//! | `.yaml`, `.yml` | YAML                              |
//! | `.json`         | JSON                              |

pub mod binary;

use log::info;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::camera::CameraError;

/// Ordered mapping of persisted field names to values.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single persisted value.
///
/// Matrices are stored row-major as nested lists. Integers are read as `Int`, every other
/// number as `Float`. Nested mappings are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FieldValue>),
}

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Unsupported file format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("Field {field} has an unexpected value, expected {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
    },
    #[error("Corrupt binary document: {0}")]
    Binary(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Trait for entities that can be saved to and restored from a [`FieldMap`].
pub trait Persist {
    /// Returns every externally visible field with its current value.
    fn fields(&self) -> FieldMap;

    /// Overwrites a single field. `name` never carries a leading underscore.
    fn restore_field(&mut self, name: &str, value: FieldValue) -> Result<(), PersistError>;

    /// Overwrites every field of `data` in key order.
    ///
    /// Implementors whose fields depend on each other override this to restore all or
    /// nothing.
    fn restore_fields(&mut self, data: FieldMap) -> Result<(), PersistError> {
        for (name, value) in data {
            self.restore_field(&name, value)?;
        }
        Ok(())
    }
}

/// File encodings understood by [`save`] and [`load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Yaml,
    Json,
}

impl Encoding {
    pub fn from_path(path: &Path) -> Result<Self, PersistError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("bin") => Ok(Encoding::Binary),
            Some("yaml") | Some("yml") => Ok(Encoding::Yaml),
            Some("json") => Ok(Encoding::Json),
            _ => Err(PersistError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "bin" => Some(Encoding::Binary),
            "yaml" | "yml" => Some(Encoding::Yaml),
            "json" => Some(Encoding::Json),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Encoding::Binary => "bin",
            Encoding::Yaml => "yaml",
            Encoding::Json => "json",
        }
    }
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Flattens a list or a list of lists of numbers into row-major values.
    ///
    /// Returns the flattened values together with `(rows, cols)`. A flat list is a single row.
    pub fn as_matrix(&self) -> Option<(Vec<f64>, (usize, usize))> {
        let rows = self.as_list()?;
        if rows.iter().all(|r| r.as_f64().is_some()) {
            let values: Vec<f64> = rows.iter().filter_map(FieldValue::as_f64).collect();
            let cols = values.len();
            return Some((values, (1, cols)));
        }
        let mut values = Vec::new();
        let mut cols = None;
        for row in rows {
            let row = row.as_list()?;
            if *cols.get_or_insert(row.len()) != row.len() {
                return None;
            }
            for v in row {
                values.push(v.as_f64()?);
            }
        }
        Some((values, (rows.len(), cols.unwrap_or(0))))
    }

    /// Stores a static matrix as a list of rows.
    pub fn matrix<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> Self {
        FieldValue::List(
            (0..R)
                .map(|r| FieldValue::List((0..C).map(|c| FieldValue::Float(m[(r, c)])).collect()))
                .collect(),
        )
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

/// Returns the persisted fields of `obj`.
pub fn serialize_fields<T: Persist + ?Sized>(obj: &T) -> FieldMap {
    obj.fields()
}

/// Restores every entry of `data` onto `obj`, overwriting current values.
///
/// Keys may carry a single leading underscore (`_name` and `name` address the same field).
pub fn from_map<T: Persist + ?Sized>(obj: &mut T, data: FieldMap) -> Result<(), PersistError> {
    let data = data
        .into_iter()
        .map(|(key, value)| match key.strip_prefix('_') {
            Some(name) => (name.to_string(), value),
            None => (key, value),
        })
        .collect();
    obj.restore_fields(data)
}

/// Writes the fields of `obj` to `path`, the encoding is picked from the extension.
pub fn save<T: Persist + ?Sized>(obj: &T, path: impl AsRef<Path>) -> Result<(), PersistError> {
    let path = path.as_ref();
    let encoding = Encoding::from_path(path)?;
    write_fields(&obj.fields(), path, encoding)?;
    info!("File {} saved", path.display());
    Ok(())
}

/// Restores `obj` from `path`, the encoding is picked from the extension.
pub fn load<T: Persist + ?Sized>(obj: &mut T, path: impl AsRef<Path>) -> Result<(), PersistError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PersistError::NotFound(path.to_path_buf()));
    }
    let encoding = Encoding::from_path(path)?;
    let data = read_fields(path, encoding)?;
    from_map(obj, data)
}

pub fn write_fields(data: &FieldMap, path: &Path, encoding: Encoding) -> Result<(), PersistError> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    match encoding {
        Encoding::Binary => binary::encode(&mut writer, data)?,
        Encoding::Yaml => serde_yaml::to_writer(&mut writer, data)?,
        Encoding::Json => serde_json::to_writer_pretty(&mut writer, data)?,
    }
    writer.flush()?;
    Ok(())
}

pub fn read_fields(path: &Path, encoding: Encoding) -> Result<FieldMap, PersistError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    match encoding {
        Encoding::Binary => binary::decode(&mut reader),
        Encoding::Yaml => Ok(serde_yaml::from_reader(reader)?),
        Encoding::Json => Ok(serde_json::from_reader(reader)?),
    }
}

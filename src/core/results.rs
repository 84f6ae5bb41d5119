//! Results store interface and the dimensionality-reduction result payload.
//!
//! The store itself lives outside this crate (a tiled server in production).
//! [`ResultsStore`] is the seam; two implementations ship here: an in-memory
//! map and a directory of JSON files laid out by composite key.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LiveError;

/// `user/project_name/flow_id`, the trimmed URI under which a flow's result
/// is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub user: String,
    pub project_name: String,
    pub flow_id: String,
}

impl ResultKey {
    pub fn new(user: &str, project_name: &str, flow_id: &str) -> Self {
        Self {
            user: user.to_string(),
            project_name: project_name.to_string(),
            flow_id: flow_id.to_string(),
        }
    }

    fn segments(&self) -> [&str; 3] {
        [&self.user, &self.project_name, &self.flow_id]
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user, self.project_name, self.flow_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IoParameters {
    #[serde(default)]
    pub root_uri: Option<String>,
    #[serde(default)]
    pub data_uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default)]
    pub n_components: Option<u32>,
}

/// Metadata written by the dimensionality-reduction job. Missing sections
/// default so that contract checks, not deserialization, report them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(default)]
    pub io_parameters: IoParameters,
    #[serde(default)]
    pub model_parameters: ModelParameters,
}

/// Dense row-major matrix of latent vectors (rows = points).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LatentMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl LatentMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, LiveError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(LiveError::Store(format!(
                    "ragged latent matrix: row {i} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Parse a JSON 2-D array. Numeric strings are coerced to numbers.
    pub fn from_json(value: &Value) -> Result<Self, LiveError> {
        let rows = value
            .as_array()
            .ok_or_else(|| LiveError::Store("latent content is not an array".to_string()))?;
        let mut parsed = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let cells = row
                .as_array()
                .ok_or_else(|| LiveError::Store(format!("latent row {i} is not an array")))?;
            let mut out = Vec::with_capacity(cells.len());
            for (j, cell) in cells.iter().enumerate() {
                out.push(coerce_number(cell).ok_or_else(|| {
                    LiveError::Store(format!("latent cell ({i}, {j}) is not numeric: {cell}"))
                })?);
            }
            parsed.push(out);
        }
        Self::from_rows(parsed)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row `i`, or `None` past the last row.
    pub fn row(&self, i: usize) -> Option<&[f64]> {
        if i >= self.rows {
            return None;
        }
        self.data.get(i * self.cols..(i + 1) * self.cols)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).filter_map(move |i| self.row(i))
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.iter_rows()
                .map(|r| serde_json::json!(r))
                .collect(),
        )
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DimRedResult {
    pub metadata: ResultMetadata,
    pub content: LatentMatrix,
}

impl DimRedResult {
    /// Parse `{"metadata": {...}, "content": [[...], ...]}`. Missing content
    /// is an empty matrix.
    pub fn from_json(value: &Value) -> Result<Self, LiveError> {
        let metadata = match value.get("metadata") {
            Some(m) => serde_json::from_value(m.clone())
                .map_err(|e| LiveError::Store(format!("invalid result metadata: {e}")))?,
            None => ResultMetadata::default(),
        };
        let content = match value.get("content") {
            Some(c) => LatentMatrix::from_json(c)?,
            None => LatentMatrix::default(),
        };
        Ok(Self { metadata, content })
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "metadata": self.metadata,
            "content": self.content.to_json(),
        })
    }
}

pub trait ResultsStore: Send + Sync {
    /// Fetch the result stored under `key`; `LiveError::Lookup` if unknown.
    fn get_result(&self, key: &ResultKey) -> Result<DimRedResult, LiveError>;
}

#[derive(Debug, Default)]
pub struct MemoryResultsStore {
    results: RwLock<HashMap<ResultKey, DimRedResult>>,
}

impl MemoryResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: ResultKey, result: DimRedResult) {
        let mut map = match self.results.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(key, result);
    }
}

impl ResultsStore for MemoryResultsStore {
    fn get_result(&self, key: &ResultKey) -> Result<DimRedResult, LiveError> {
        let map = self
            .results
            .read()
            .map_err(|_| LiveError::Store("memory store lock poisoned".to_string()))?;
        map.get(key)
            .cloned()
            .ok_or_else(|| LiveError::Lookup(key.clone()))
    }
}

/// Results laid out as `<root>/<user>/<project_name>/<flow_id>.json`.
#[derive(Debug, Clone)]
pub struct DirResultsStore {
    root: PathBuf,
}

impl DirResultsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ResultKey) -> Result<PathBuf, LiveError> {
        for seg in key.segments() {
            if seg.is_empty() || seg == "." || seg == ".." || seg.contains(['/', '\\']) {
                return Err(LiveError::Store(format!(
                    "key segment '{seg}' of {key} is not a plain name"
                )));
            }
        }
        Ok(self
            .root
            .join(&key.user)
            .join(&key.project_name)
            .join(format!("{}.json", key.flow_id)))
    }
}

impl ResultsStore for DirResultsStore {
    fn get_result(&self, key: &ResultKey) -> Result<DimRedResult, LiveError> {
        let path = self.path_for(key)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LiveError::Lookup(key.clone()))
            }
            Err(e) => {
                return Err(LiveError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            LiveError::Store(format!("result file {} is not JSON: {e}", path.display()))
        })?;
        DimRedResult::from_json(&value)
    }
}

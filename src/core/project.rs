//! The running "data project": which dataset URIs make up the session.
//!
//! During live mode datasets are only ever appended, one per accepted event,
//! and `cumulative_data_count` is a running index (1, 2, 3, ...), not a size.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::LiveError;
use crate::results::{ResultKey, ResultMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Tiled,
    File,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Tiled => "tiled",
            DataType::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub uri: String,
    pub cumulative_data_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataProjectState {
    #[serde(default)]
    pub root_uri: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Credential for the data server, forwarded to jobs.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl DataProjectState {
    /// The fresh state installed whenever live mode is entered.
    pub fn live_default() -> Self {
        Self {
            root_uri: String::new(),
            data_type: DataType::Tiled,
            datasets: Vec::new(),
            project_id: None,
            api_key: None,
        }
    }

    pub fn next_count(&self) -> u64 {
        self.datasets
            .last()
            .map(|d| d.cumulative_data_count + 1)
            .unwrap_or(1)
    }

    pub fn data_uris(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.uri.clone()).collect()
    }
}

/// Appends one dataset per live result.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetAppender;

impl DatasetAppender {
    /// Validate `metadata` and append its single data URI to `state`.
    ///
    /// Fails with `Schema` (state untouched) unless `io_parameters` names a
    /// root URI and exactly one data URI.
    pub fn append(
        &self,
        state: &mut DataProjectState,
        key: &ResultKey,
        metadata: &ResultMetadata,
    ) -> Result<DatasetEntry, LiveError> {
        let io = &metadata.io_parameters;
        let root_uri = io
            .root_uri
            .as_ref()
            .ok_or_else(|| LiveError::schema(key, "io_parameters.root_uri is missing"))?;
        let data_uri = match io.data_uris.as_slice() {
            [single] => single,
            other => {
                warn!(
                    key = %key,
                    count = other.len(),
                    "data-quality: result does not carry exactly one data uri"
                );
                return Err(LiveError::schema(
                    key,
                    format!("expected exactly one data uri, found {}", other.len()),
                ));
            }
        };

        // Validated; mutate.
        state.root_uri = root_uri.clone();
        let entry = DatasetEntry {
            uri: data_uri.clone(),
            cumulative_data_count: state.next_count(),
        };
        info!(
            key = %key,
            uri = %entry.uri,
            count = entry.cumulative_data_count,
            "appended live dataset"
        );
        state.datasets.push(entry.clone());
        Ok(entry)
    }
}

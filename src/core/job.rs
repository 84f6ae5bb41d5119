//! Job parameter assembly for feature-extraction / dimensionality-reduction
//! flows.
//!
//! Submission itself happens elsewhere; this module only turns a data project
//! and an extracted parameter set into the request body the orchestrator
//! expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::ExplorerConfig;
use crate::error::JobError;
use crate::params::ParsedParameterSet;
use crate::project::{DataProjectState, DataType};

const TILED_METADATA_PATH: &str = "/api/v1/metadata";
const SLURM_JOB_NAME: &str = "latent_space_explorer";
const SLURM_CONDA_ENV: &str = "mlex_dimension_reduction_pca";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Podman,
    Docker,
    #[default]
    Conda,
    Slurm,
}

impl FlowType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podman" => Some(FlowType::Podman),
            "docker" => Some(FlowType::Docker),
            "conda" => Some(FlowType::Conda),
            "slurm" => Some(FlowType::Slurm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Podman => "podman",
            FlowType::Docker => "docker",
            FlowType::Conda => "conda",
            FlowType::Slurm => "slurm",
        }
    }
}

/// Where and how the model code runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(default)]
    pub flow_type: FlowType,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub python_file_name: Option<String>,
    #[serde(default)]
    pub conda_env: Option<String>,
}

/// Results URL for a user's project on the tiled server.
///
/// A base without the metadata prefix gets `/api/v1/metadata/<user>/<project>`;
/// a base that already has it gets its path replaced by `/<user>/<project>`.
pub fn parse_tiled_url(base: &str, user: &str, project_name: &str) -> Result<String, JobError> {
    let path = if base.contains(TILED_METADATA_PATH) {
        format!("/{user}/{project_name}")
    } else {
        format!("{TILED_METADATA_PATH}/{user}/{project_name}")
    };
    if base.trim().is_empty() {
        return Ok(path);
    }
    let invalid = |reason: String| JobError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    let joined = url.join(&path).map_err(|e| invalid(e.to_string()))?;
    Ok(joined.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobIoParameters {
    pub uid_retrieve: String,
    pub data_uris: Vec<String>,
    pub data_tiled_api_key: Option<String>,
    pub data_type: DataType,
    pub root_uri: String,
    pub save_model_path: String,
    pub results_tiled_uri: String,
    pub results_tiled_api_key: String,
    pub results_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub io_parameters: JobIoParameters,
    pub model_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowEntry {
    Container {
        image_name: String,
        image_tag: Option<String>,
        command: String,
        params: JobParams,
        volumes: Vec<String>,
        network: String,
    },
    Conda {
        conda_env_name: String,
        python_file_name: String,
        params: JobParams,
    },
    Slurm {
        job_name: String,
        num_nodes: u32,
        partitions: Vec<String>,
        reservations: Vec<String>,
        max_time: String,
        conda_env_name: String,
        submission_ssh_key: String,
        forward_ports: Vec<String>,
        params: JobParams,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub flow_type: FlowType,
    pub params_list: Vec<FlowEntry>,
}

impl JobRequest {
    /// Assemble the request for one flow run. Refuses parameter sets that
    /// reported input errors.
    pub fn build(
        config: &ExplorerConfig,
        project: &DataProjectState,
        model_parameters: &ParsedParameterSet,
        project_name: &str,
        flow: &FlowSpec,
    ) -> Result<Self, JobError> {
        if model_parameters.errors {
            return Err(JobError::InvalidParameters);
        }

        let user = config.user.as_str();
        let results_dir = format!("{}/{}", config.write_dir, user);
        let params = JobParams {
            io_parameters: JobIoParameters {
                uid_retrieve: String::new(),
                data_uris: project.data_uris(),
                data_tiled_api_key: project.api_key.clone(),
                data_type: project.data_type,
                root_uri: project.root_uri.clone(),
                save_model_path: format!("{results_dir}/models"),
                results_tiled_uri: parse_tiled_url(&config.results_tiled_uri, user, project_name)?,
                results_tiled_api_key: config.results_tiled_api_key.clone(),
                results_dir,
            },
            model_parameters: model_parameters.to_json(),
        };

        let flow_name = flow.flow_type.as_str();
        let require = |v: &Option<String>, field: &'static str| {
            v.clone()
                .ok_or(JobError::MissingField { flow: flow_name, field })
        };

        let entry = match flow.flow_type {
            FlowType::Podman | FlowType::Docker => {
                let python_file = require(&flow.python_file_name, "python_file_name")?;
                FlowEntry::Container {
                    image_name: require(&flow.image_name, "image_name")?,
                    image_tag: flow.image_tag.clone(),
                    command: format!("python {python_file}"),
                    params,
                    volumes: vec![format!(
                        "{}:/tiled_storage",
                        require(&config.read_dir_mount, "read_dir_mount")?
                    )],
                    network: config.docker_network.clone(),
                }
            }
            FlowType::Conda => FlowEntry::Conda {
                conda_env_name: require(&flow.conda_env, "conda_env")?,
                python_file_name: require(&flow.python_file_name, "python_file_name")?,
                params,
            },
            FlowType::Slurm => FlowEntry::Slurm {
                job_name: SLURM_JOB_NAME.to_string(),
                num_nodes: 1,
                partitions: config.partitions_cpu.clone(),
                reservations: config.reservations_cpu.clone(),
                max_time: config.max_time_cpu.clone(),
                conda_env_name: SLURM_CONDA_ENV.to_string(),
                submission_ssh_key: config.submission_ssh_key.clone(),
                forward_ports: config.forward_ports.clone(),
                params,
            },
        };

        Ok(Self {
            flow_type: flow.flow_type,
            params_list: vec![entry],
        })
    }
}

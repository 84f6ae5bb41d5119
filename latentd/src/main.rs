//! Latent Live Daemon - hosts live explorer sessions
//!
//! This daemon runs in the background, managing:
//! - Per-session mode, data project and scatter plot
//! - Live result events, one worker per session
//! - Parameter extraction and job assembly for clients
//! - Session snapshots
//!
//! Storage locations:
//! - Linux: ~/.local/share/latent_live/
//! - Windows: %APPDATA%\latent_live\
//! - MacOS: ~/Library/Application Support/latent_live/

use latent_live::job::FlowSpec;
use latent_live::job::JobRequest;
use latent_live::params::TransformOptions;
use latent_live::results::{DirResultsStore, ResultsStore};
use latent_live::{ExplorerConfig, SessionView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod paths;
mod queue;
mod registry;

use paths::AppPaths;
use registry::{Enqueued, Registry};

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

fn default_session() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientRequest {
    #[serde(default = "default_session")]
    session: String,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    ToggleLive,
    LiveMessage {
        message: Value,
    },
    ExtractParameters {
        tree: Value,
        #[serde(default)]
        log: bool,
        #[serde(default)]
        percentiles: Option<Vec<f64>>,
        #[serde(default)]
        mask: Option<String>,
    },
    BuildJob {
        tree: Value,
        #[serde(default)]
        log: bool,
        #[serde(default)]
        percentiles: Option<Vec<f64>>,
        #[serde(default)]
        mask: Option<String>,
        project_name: String,
        /// Defaults to the configured flow type with no image or env.
        #[serde(default)]
        flow: Option<FlowSpec>,
    },
    SaveSession,
    LoadSession,
    ResetSession,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    State(SessionView),
    Parameters { params: Value, errors: bool },
    Job { job: JobRequest },
    Success { message: String },
    Error { message: String },
}

fn fail(message: impl ToString) -> Response {
    Response::Error {
        message: message.to_string(),
    }
}

fn success(message: impl Into<String>) -> Response {
    Response::Success {
        message: message.into(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Request Dispatch
// ═══════════════════════════════════════════════════════════════════════════

async fn dispatch(registry: &Registry, req: ClientRequest) -> Response {
    let handle = match registry.get_or_create(&req.session) {
        Ok(h) => h,
        Err(e) => return fail(e),
    };

    match req.request {
        Request::GetState => {
            let s = handle.lock().await;
            Response::State(s.view())
        }
        Request::ToggleLive => {
            let t = handle.toggle_live().await;
            success(format!("Mode: {} (activations: {})", t.mode.as_str(), t.activations))
        }
        Request::LiveMessage { message } => match handle.enqueue(message) {
            Enqueued::Ignored => success("Ignored: session paused"),
            Enqueued::Queued { evicted: false } => success("Queued"),
            Enqueued::Queued { evicted: true } => success("Queued; oldest event dropped"),
        },
        Request::ExtractParameters {
            tree,
            log,
            percentiles,
            mask,
        } => {
            let transform = TransformOptions {
                log,
                percentiles,
                mask,
            };
            let s = handle.lock().await;
            let parsed = s.extract_parameters(&tree, &transform);
            Response::Parameters {
                params: parsed.to_json(),
                errors: parsed.errors,
            }
        }
        Request::BuildJob {
            tree,
            log,
            percentiles,
            mask,
            project_name,
            flow,
        } => {
            let transform = TransformOptions {
                log,
                percentiles,
                mask,
            };
            let flow = flow.unwrap_or_else(|| FlowSpec {
                flow_type: registry.config().flow_type,
                ..FlowSpec::default()
            });
            let s = handle.lock().await;
            match s.build_job(&tree, &transform, &project_name, &flow) {
                Ok(job) => Response::Job { job },
                Err(e) => fail(e),
            }
        }
        Request::SaveSession => match registry.save(&handle).await {
            Ok(path) => success(format!("Session saved to {}", path.display())),
            Err(e) => fail(e),
        },
        Request::LoadSession => match registry.load(&handle).await {
            Ok(path) => success(format!("Session loaded from {}", path.display())),
            Err(e) => fail(e),
        },
        Request::ResetSession => {
            handle.reset().await;
            success("Session reset")
        }
        Request::Shutdown => match registry.save_all().await {
            Ok(n) => {
                info!("Shutdown requested; {} session(s) saved", n);
                registry.cancel_token().cancel();
                success("Shutting down")
            }
            Err(e) => fail(format!("Save failed, aborting shutdown: {}", e)),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(
    stream: TcpStream,
    registry: Arc<Registry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<ClientRequest>(&line) {
            Ok(req) => dispatch(&registry, req).await,
            Err(e) => fail(format!("Invalid request: {}", e)),
        };
        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());

    let config = ExplorerConfig::load_file(&paths.config_file())?.with_env()?;
    let results_root = config
        .results_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.results_dir());
    info!("Results directory: {:?}", results_root);
    let store: Arc<dyn ResultsStore> = Arc::new(DirResultsStore::new(results_root));

    let listen_addr = config.listen_addr.clone();
    let cancel = CancellationToken::new();
    let registry = Registry::new(Arc::new(config), store, paths, cancel.clone());

    // Restore the default session if a snapshot exists.
    {
        let handle = registry.get_or_create("default")?;
        if let Err(e) = registry.load(&handle).await {
            warn!("Could not load default session: {}", e);
        }
    }

    // Save on Ctrl-C so sessions persist even if the daemon is stopped abruptly.
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                match registry.save_all().await {
                    Ok(n) => info!("Ctrl-C: {} session(s) saved", n),
                    Err(e) => error!("Ctrl-C save failed: {}", e),
                }
                registry.cancel_token().cancel();
            }
        });
    }

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Latent live daemon listening on {}", listen_addr);

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!("Client connected: {}", addr);
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, registry).await {
                error!("Client handler error: {}", e);
            }
        });
    }

    // Give in-flight responses a moment to flush before exiting.
    time::sleep(Duration::from_millis(50)).await;
    info!("Daemon stopped");
    Ok(())
}

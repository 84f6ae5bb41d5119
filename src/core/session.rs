//! One explorer session: mode gate, data project, and plot, driven by live
//! events.
//!
//! A session is not internally synchronized. Whoever owns it must make sure
//! only one handler mutates it at a time; the daemon holds the session lock
//! while admitting and while applying, and fetches with the lock released.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ExplorerConfig;
use crate::error::{JobError, LiveError};
use crate::job::{FlowSpec, JobRequest};
use crate::live::{decode_envelope, LiveEvent};
use crate::mode::{Layout, Mode, ModeController, ModeTransition};
use crate::params::{extract_model_parameters, ParsedParameterSet, TransformOptions};
use crate::project::{DataProjectState, DatasetAppender, DatasetEntry};
use crate::results::{DimRedResult, ResultKey, ResultsStore};
use crate::scatter::{MergeOutcome, ScatterMerger, ScatterState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    /// Events fetched and applied (at least one half succeeded).
    pub accepted: u64,
    /// Events that arrived while paused.
    pub ignored: u64,
    /// Events lost to decode, lookup, timeout, store or schema failures, or
    /// to queue overflow.
    pub dropped: u64,
}

/// Result of handing one live event to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    /// Paused: the event was discarded without being decoded.
    Ignored,
    /// The result was fetched; each half reports independently.
    Applied {
        key: ResultKey,
        project: Result<DatasetEntry, LiveError>,
        scatter: Result<MergeOutcome, LiveError>,
    },
}

impl LiveUpdate {
    pub fn summary(&self) -> String {
        match self {
            LiveUpdate::Ignored => "ignored (paused)".to_string(),
            LiveUpdate::Applied {
                key,
                project,
                scatter,
            } => {
                let p = match project {
                    Ok(e) => format!("dataset #{} {}", e.cumulative_data_count, e.uri),
                    Err(e) => format!("dataset skipped: {e}"),
                };
                let s = match scatter {
                    Ok(MergeOutcome::Initialized { points }) => {
                        format!("plot regenerated with {points} points")
                    }
                    Ok(MergeOutcome::Appended { added, total }) => {
                        format!("plot +{added} points ({total} total)")
                    }
                    Err(e) => format!("plot skipped: {e}"),
                };
                format!("{key}: {p}; {s}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub activations: u64,
    pub project: DataProjectState,
    pub scatter: ScatterState,
    #[serde(default)]
    pub counters: SessionCounters,
}

/// What a client needs to render the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub mode: Mode,
    pub activations: u64,
    pub layout: Layout,
    pub project: DataProjectState,
    pub point_count: usize,
    pub figure: Value,
    pub counters: SessionCounters,
}

#[derive(Debug, Clone)]
pub struct LiveSession {
    config: Arc<ExplorerConfig>,
    mode: ModeController,
    project: DataProjectState,
    scatter: ScatterState,
    counters: SessionCounters,
    appender: DatasetAppender,
    merger: ScatterMerger,
}

impl LiveSession {
    pub fn new(config: Arc<ExplorerConfig>) -> Self {
        let merger = ScatterMerger::new(config.coordinate_coercion);
        Self {
            config,
            mode: ModeController::new(),
            project: DataProjectState::default(),
            scatter: ScatterState::Uninitialized,
            counters: SessionCounters::default(),
            appender: DatasetAppender,
            merger,
        }
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn is_live(&self) -> bool {
        self.mode.is_live()
    }

    pub fn project(&self) -> &DataProjectState {
        &self.project
    }

    pub fn scatter(&self) -> &ScatterState {
        &self.scatter
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Replace the plot with whatever figure the UI currently shows.
    pub fn set_figure(&mut self, figure: &Value) {
        self.scatter = ScatterState::from_figure_json(figure);
    }

    pub fn toggle_live(&mut self) -> ModeTransition {
        let transition = self.mode.toggle();
        if transition.entered_live() {
            self.project = DataProjectState::live_default();
        }
        info!(
            mode = transition.mode.as_str(),
            activations = transition.activations,
            "mode toggled"
        );
        transition
    }

    /// Gate and decode. `Ok(None)` means the session is paused and the event
    /// was ignored.
    pub fn admit(&mut self, envelope: &Value) -> Result<Option<LiveEvent>, LiveError> {
        if !self.is_live() {
            self.counters.ignored += 1;
            debug!("live event ignored while paused");
            return Ok(None);
        }
        match decode_envelope(envelope) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                self.record_drop(&e);
                Err(e)
            }
        }
    }

    pub fn result_key(&self, event: &LiveEvent) -> ResultKey {
        event.result_key(&self.config.user)
    }

    /// Count and log an event lost after admission.
    pub fn record_drop(&mut self, err: &LiveError) {
        self.counters.dropped += 1;
        warn!(kind = err.kind(), error = %err, "live event dropped");
    }

    /// Count events evicted from a full queue before they were handled.
    pub fn record_overflow(&mut self, evicted: u64) {
        self.counters.dropped += evicted;
        warn!(evicted, "live queue full, oldest events dropped");
    }

    /// Count events discarded without decoding: they arrived while paused, or
    /// were queued under a mode that has since changed.
    pub fn record_ignored(&mut self, count: u64) {
        self.counters.ignored += count;
        debug!(count, "live events ignored");
    }

    /// Apply one fetched result to both the data project and the plot.
    pub fn apply_result(&mut self, event: &LiveEvent, result: &DimRedResult) -> LiveUpdate {
        if !self.is_live() {
            self.counters.ignored += 1;
            return LiveUpdate::Ignored;
        }
        let key = self.result_key(event);
        let project = self
            .appender
            .append(&mut self.project, &key, &result.metadata);
        let scatter = self.merger.merge(&mut self.scatter, &key, result);

        match (&project, &scatter) {
            (Err(pe), Err(se)) => {
                self.counters.dropped += 1;
                warn!(key = %key, project = %pe, scatter = %se, "live result rejected");
            }
            _ => self.counters.accepted += 1,
        }
        if let Err(e) = &scatter {
            debug!(key = %key, error = %e, "plot not updated");
        }
        LiveUpdate::Applied {
            key,
            project,
            scatter,
        }
    }

    /// Synchronous path: gate, decode, fetch once, apply.
    pub fn handle_envelope(
        &mut self,
        envelope: &Value,
        store: &dyn ResultsStore,
    ) -> Result<LiveUpdate, LiveError> {
        let Some(event) = self.admit(envelope)? else {
            return Ok(LiveUpdate::Ignored);
        };
        let key = self.result_key(&event);
        let result = match store.get_result(&key) {
            Ok(r) => r,
            Err(e) => {
                self.record_drop(&e);
                return Err(e);
            }
        };
        Ok(self.apply_result(&event, &result))
    }

    pub fn extract_parameters(&self, tree: &Value, transform: &TransformOptions) -> ParsedParameterSet {
        extract_model_parameters(tree, transform)
    }

    /// Extract parameters and assemble the job request for the current data
    /// project. Fails if the parameter panel reported errors.
    pub fn build_job(
        &self,
        tree: &Value,
        transform: &TransformOptions,
        project_name: &str,
        flow: &FlowSpec,
    ) -> Result<JobRequest, JobError> {
        let params = self.extract_parameters(tree, transform);
        JobRequest::build(&self.config, &self.project, &params, project_name, flow)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            mode: self.mode(),
            activations: self.mode.activations(),
            layout: self.mode.layout(),
            project: self.project.clone(),
            point_count: self.scatter.point_count(),
            figure: self.scatter.to_figure_json(),
            counters: self.counters,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            activations: self.mode.activations(),
            project: self.project.clone(),
            scatter: self.scatter.clone(),
            counters: self.counters,
        }
    }

    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        self.mode = ModeController::with_activations(snapshot.activations);
        self.project = snapshot.project;
        self.scatter = snapshot.scatter;
        self.counters = snapshot.counters;
    }

    pub fn reset(&mut self) {
        *self = Self::new(Arc::clone(&self.config));
    }
}

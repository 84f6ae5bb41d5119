#[path = "core/config.rs"]
pub mod config;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/job.rs"]
pub mod job;

#[path = "core/live.rs"]
pub mod live;

#[path = "core/mode.rs"]
pub mod mode;

#[path = "core/params.rs"]
pub mod params;

#[path = "core/project.rs"]
pub mod project;

#[path = "core/results.rs"]
pub mod results;

#[path = "core/scatter.rs"]
pub mod scatter;

#[path = "core/session.rs"]
pub mod session;

#[path = "core/storage.rs"]
pub mod storage;

pub use config::ExplorerConfig;
pub use error::{ConfigError, JobError, LiveError};
pub use session::{LiveSession, LiveUpdate, SessionSnapshot, SessionView};

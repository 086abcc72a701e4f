//! Streaming run client for the job-application tracker.
//!
//! Long-running generation (pipeline phases and chat replies) is delivered by
//! the backend as one HTTP response body of blank-line separated `data: `
//! frames. This crate decodes those frames, reconciles them into a per-run
//! status overlay or a growing chat reply, and owns the run lifecycle:
//! start, supersede, cancel, completion, and the hand-off back to a refresh
//! of persisted state.
//!
//! # Usage
//!
//! ```no_run
//! use jobtrack_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), JobtrackError> {
//! let controller = RunController::from_config(ClientConfig::from_env()?)?;
//! let job = JobId::new("abc123");
//!
//! let run = controller.start_pipeline(&job, Phase::Analyze);
//! let refreshed = controller.refresh_after(&run).await?;
//! println!("{:?} -> {:?}", run.state(), refreshed.map(|j| j.pipeline_stage));
//! # Ok(())
//! # }
//! ```

/// HTTP stream client, sink callbacks, and cancellation handles.
pub mod client;
/// Backend location and timing configuration.
pub mod config;
/// Run lifecycle, run registry, and chat sessions.
pub mod controller;
/// Public error types.
pub mod errors;
/// Frame decoding.
pub mod frame;
/// Identifiers and wire types.
pub mod model;
/// Logging initialisation.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// In-run status overlay and merged section rows.
pub mod reconciler;
/// CRUD read side.
pub mod store;

pub use client::{AbortHandle, RunHandle, StreamClient, StreamRequest, StreamSink};
pub use config::ClientConfig;
pub use controller::{
    ChatRun, ChatSession, ChatSnapshot, PipelineRun, PipelineSnapshot, Run, RunController,
    RunRegistry, RunSnapshot, RunState,
};
pub use errors::{JobtrackError, StoreError, StreamError};
pub use frame::{Frame, FrameDecoder, Framing};
pub use model::{ChatRole, ChatTurn, JobId, Phase, PipelineEvent, SectionPhase, SectionStatus, Slot};
pub use observability::init_observability;
pub use reconciler::{SectionRow, StatusOverlay, merge_sections};
pub use store::{HttpJobStore, JobDetail, JobStore, Section, SectionDefinition};

//! Common imports for typical usage.
pub use crate::{
    ChatRun, ChatSession, ChatSnapshot, ChatTurn, ClientConfig, JobId, JobtrackError, Phase,
    PipelineRun, PipelineSnapshot, RunController, RunState, SectionStatus, Slot, StatusOverlay,
    StreamError,
};

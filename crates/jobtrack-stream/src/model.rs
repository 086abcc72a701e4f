use std::fmt;

/// Stable identifier for a tracked job record.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Creates a job id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the job id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Pipeline phase a run executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    /// Analysis sections (gate check, research, scorecards, verdict).
    Analyze,
    /// Cover-letter sections.
    CoverLetter,
}

impl Phase {
    /// URL path segment used by the run-initiation endpoint.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::CoverLetter => "cover-letter",
        }
    }

    /// Catalogue phase whose sections this run generates.
    pub fn section_phase(self) -> SectionPhase {
        match self {
            Self::Analyze => SectionPhase::Analysis,
            Self::CoverLetter => SectionPhase::CoverLetter,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Phase a catalogue section belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionPhase {
    Analysis,
    CoverLetter,
}

/// Generation state of one section.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl SectionStatus {
    /// True while the section is being generated.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Generation state of exactly one named section at one point in time.
///
/// Events for the same key replace each other in arrival order.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PipelineEvent {
    #[serde(alias = "sectionKey")]
    pub section_key: String,
    pub status: SectionStatus,
    #[serde(
        default,
        alias = "contentSnippet",
        alias = "content_snippet",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_md: Option<String>,
    #[serde(default, alias = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PipelineEvent {
    pub fn new(section_key: impl Into<String>, status: SectionStatus) -> Self {
        Self {
            section_key: section_key.into(),
            status,
            content_md: None,
            error_message: None,
        }
    }
}

/// Author of a chat turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message in a chat about a job.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Logical identity that constrains at most one concurrent run.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Slot {
    /// One pipeline phase of one job.
    Pipeline { job_id: JobId, phase: Phase },
    /// Read-only status stream of one job.
    StatusWatch { job_id: JobId },
    /// One chat widget.
    Chat { widget: String },
}

impl Slot {
    pub fn pipeline(job_id: impl Into<JobId>, phase: Phase) -> Self {
        Self::Pipeline {
            job_id: job_id.into(),
            phase,
        }
    }

    pub fn chat(widget: impl Into<String>) -> Self {
        Self::Chat {
            widget: widget.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline { job_id, phase } => write!(f, "pipeline:{job_id}:{phase}"),
            Self::StatusWatch { job_id } => write!(f, "status:{job_id}"),
            Self::Chat { widget } => write!(f, "chat:{widget}"),
        }
    }
}

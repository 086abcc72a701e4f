use std::collections::{BTreeMap, HashMap};

use crate::model::{PipelineEvent, SectionPhase, SectionStatus};
use crate::store::{JobDetail, SectionDefinition};

/// Last snippet and error received for a section during the current run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionProgress {
    pub content_md: Option<String>,
    pub error_message: Option<String>,
}

/// In-run status overlay keyed by section.
///
/// Lives for one run only. It is never merged into persisted state; the
/// authoritative record is re-fetched once the run settles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusOverlay {
    statuses: HashMap<String, SectionStatus>,
    progress: HashMap<String, SectionProgress>,
}

impl StatusOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event.status` for its key. The latest event for a key wins.
    ///
    /// Keys outside the catalogue are kept as-is.
    pub fn apply(&mut self, event: PipelineEvent) {
        let PipelineEvent {
            section_key,
            status,
            content_md,
            error_message,
        } = event;
        let progress = self.progress.entry(section_key.clone()).or_default();
        if content_md.is_some() {
            progress.content_md = content_md;
        }
        progress.error_message = match status {
            SectionStatus::Failed => error_message,
            _ => None,
        };
        self.statuses.insert(section_key, status);
    }

    /// Applies a whole key to status map in key order.
    pub fn apply_snapshot(&mut self, snapshot: BTreeMap<String, SectionStatus>) {
        for (key, status) in snapshot {
            self.apply(PipelineEvent::new(key, status));
        }
    }

    /// Overlay status for `key`, falling back to the last persisted status.
    pub fn current_status(&self, key: &str, fallback: SectionStatus) -> SectionStatus {
        self.statuses.get(key).copied().unwrap_or(fallback)
    }

    /// Overlay status for `key`, without fallback.
    pub fn get(&self, key: &str) -> Option<SectionStatus> {
        self.statuses.get(key).copied()
    }

    pub fn detail(&self, key: &str) -> Option<&SectionProgress> {
        self.progress.get(key)
    }

    /// Drops every entry.
    pub fn reset(&mut self) {
        self.statuses.clear();
        self.progress.clear();
    }

    /// Number of keys seen during the run.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Overlay entries sorted by key.
    pub fn to_map(&self) -> BTreeMap<String, SectionStatus> {
        self.statuses
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// True while any section in the overlay is running.
    pub fn any_active(&self) -> bool {
        self.statuses.values().any(|s| s.is_active())
    }
}

/// One rendered section row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionRow {
    pub key: String,
    pub label: String,
    pub order: i32,
    pub phase: SectionPhase,
    pub status: SectionStatus,
    pub error_message: Option<String>,
}

/// Merges the catalogue, persisted job sections and the in-run overlay into
/// display rows sorted by `order`.
///
/// Only catalogue keys produce rows. Status lookup is overlay first, then the
/// persisted section, then `pending`.
pub fn merge_sections(
    catalogue: &[SectionDefinition],
    job: Option<&JobDetail>,
    overlay: &StatusOverlay,
    phase: Option<SectionPhase>,
) -> Vec<SectionRow> {
    let mut rows: Vec<SectionRow> = catalogue
        .iter()
        .filter(|def| phase.is_none_or(|p| def.phase == p))
        .map(|def| {
            let persisted = job.and_then(|j| j.section(&def.key));
            let fallback = persisted.map(|s| s.status).unwrap_or_default();
            let status = overlay.current_status(&def.key, fallback);
            let error_message = match status {
                SectionStatus::Failed => overlay
                    .detail(&def.key)
                    .and_then(|d| d.error_message.clone())
                    .or_else(|| persisted.and_then(|s| s.error_message.clone())),
                _ => None,
            };
            SectionRow {
                key: def.key.clone(),
                label: def.label.clone(),
                order: def.order,
                phase: def.phase,
                status,
                error_message,
            }
        })
        .collect();
    rows.sort_by_key(|row| row.order);
    rows
}

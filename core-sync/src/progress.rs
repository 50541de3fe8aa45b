//! # Sync Progress Model
//!
//! Selections, per-tab progress states and the course snapshots a running
//! job publishes.
//!
//! ## Overview
//!
//! A [`CourseProgress`] is owned by exactly one running job. The job mutates
//! its private copy and publishes clones; observers only ever see complete
//! snapshots. Snapshots travel through the work dispatcher as opaque JSON
//! payloads (see [`CourseProgress::to_payload`]).
//!
//! ## State Machine
//!
//! Per tab (and per item within a tab):
//!
//! ```text
//! Starting → InProgress(p) → InProgress(q ≥ p) → Completed
//!     │            │                          └──→ Failed(reason)
//!     └────────────┴────────────────────────────→ Completed | Failed
//! ```
//!
//! Terminal states are final. Per course, the state is derived from its tabs:
//!
//! ```text
//! NotStarted → Starting → InProgress → Completed | PartiallyFailed
//!      └──────────┴───────────┴──────→ Failed (job-level error)
//! ```

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Fixed weight every tab contributes to aggregate progress, on top of the
/// sizes of its items, so tabs with unknown sizes still move the bar.
pub const TAB_BASE_WEIGHT: u64 = 100_000;

// ============================================================================
// Selection
// ============================================================================

/// One course and the tabs chosen for it, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSelection {
    pub course_id: String,
    pub tab_ids: Vec<String>,
}

/// The user's chosen sync scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSelection {
    pub courses: Vec<CourseSelection>,
}

impl SyncSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_course<I, S>(mut self, course_id: impl Into<String>, tab_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.courses.push(CourseSelection {
            course_id: course_id.into(),
            tab_ids: tab_ids.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }

    pub fn course(&self, course_id: &str) -> Option<&CourseSelection> {
        self.courses.iter().find(|c| c.course_id == course_id)
    }

    /// Rejects blank ids, courses without tabs, and duplicates.
    pub fn validate(&self) -> Result<()> {
        let mut seen_courses = HashSet::new();
        for course in &self.courses {
            if course.course_id.trim().is_empty() {
                return Err(SyncError::InvalidSelection(
                    "Course id cannot be empty".to_string(),
                ));
            }
            if !seen_courses.insert(course.course_id.as_str()) {
                return Err(SyncError::InvalidSelection(format!(
                    "Course {} is selected more than once",
                    course.course_id
                )));
            }
            if course.tab_ids.is_empty() {
                return Err(SyncError::InvalidSelection(format!(
                    "Course {} has no tabs selected",
                    course.course_id
                )));
            }
            let mut seen_tabs = HashSet::new();
            for tab in &course.tab_ids {
                if tab.trim().is_empty() {
                    return Err(SyncError::InvalidSelection(format!(
                        "Course {} has an empty tab id",
                        course.course_id
                    )));
                }
                if !seen_tabs.insert(tab.as_str()) {
                    return Err(SyncError::InvalidSelection(format!(
                        "Tab {} is selected more than once for course {}",
                        tab, course.course_id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Progress States
// ============================================================================

/// Progress of one tab or one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProgressState {
    Starting,
    InProgress { percent: u8 },
    Completed,
    Failed { reason: String },
}

impl ProgressState {
    pub fn in_progress(percent: u8) -> Self {
        ProgressState::InProgress {
            percent: percent.min(100),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ProgressState::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressState::Completed | ProgressState::Failed { .. })
    }

    pub fn percent(&self) -> u8 {
        match self {
            ProgressState::Starting => 0,
            ProgressState::InProgress { percent } => *percent,
            ProgressState::Completed | ProgressState::Failed { .. } => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Starting => "starting",
            ProgressState::InProgress { .. } => "in_progress",
            ProgressState::Completed => "completed",
            ProgressState::Failed { .. } => "failed",
        }
    }

    /// Checks that moving to `next` keeps the state monotonic.
    pub fn validate_transition(&self, next: &ProgressState) -> Result<()> {
        let valid = match (self, next) {
            (ProgressState::Completed, _) | (ProgressState::Failed { .. }, _) => false,
            (ProgressState::InProgress { percent: from }, ProgressState::InProgress { percent: to }) => {
                to >= from
            }
            (ProgressState::InProgress { .. }, ProgressState::Starting) => false,
            _ => true,
        };

        if valid {
            Ok(())
        } else {
            Err(SyncError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
                reason: "progress states never regress and terminal states are final"
                    .to_string(),
            })
        }
    }
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressState::InProgress { percent } => write!(f, "in_progress({}%)", percent),
            ProgressState::Failed { reason } => write!(f, "failed({})", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Reason text for a tab whose items partly failed.
pub fn failure_reason(failed_items: usize) -> String {
    if failed_items == 1 {
        "1 item failed".to_string()
    } else {
        format!("{} items failed", failed_items)
    }
}

/// Course-level state, derived from the tab states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseState {
    NotStarted,
    Starting,
    InProgress,
    Completed,
    /// Every tab is terminal and at least one failed.
    PartiallyFailed,
    /// The job itself could not run.
    Failed,
}

impl CourseState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CourseState::Completed | CourseState::PartiallyFailed | CourseState::Failed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CourseState::PartiallyFailed | CourseState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CourseState::NotStarted => "not_started",
            CourseState::Starting => "starting",
            CourseState::InProgress => "in_progress",
            CourseState::Completed => "completed",
            CourseState::PartiallyFailed => "partially_failed",
            CourseState::Failed => "failed",
        }
    }
}

impl fmt::Display for CourseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// One content item inside a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub item_id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub state: ProgressState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabProgress {
    pub tab_id: String,
    pub label: String,
    pub state: ProgressState,
    #[serde(default)]
    pub items: Vec<ItemProgress>,
}

impl TabProgress {
    pub fn starting(tab_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            tab_id: tab_id.into(),
            label: label.into(),
            state: ProgressState::Starting,
            items: Vec::new(),
        }
    }

    /// Total weight of this tab for aggregate progress.
    pub fn weight(&self) -> u64 {
        TAB_BASE_WEIGHT + self.items.iter().filter_map(|i| i.size).sum::<u64>()
    }

    /// Weight already done: the base part scaled by the tab percent plus the
    /// sizes of finished items.
    pub fn completed_weight(&self) -> u64 {
        if self.state.is_terminal() {
            return self.weight();
        }
        let base = TAB_BASE_WEIGHT * u64::from(self.state.percent()) / 100;
        let items: u64 = self
            .items
            .iter()
            .filter(|i| i.state.is_terminal())
            .filter_map(|i| i.size)
            .sum();
        base + items
    }
}

/// Immutable point-in-time copy of one course's sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub course_id: String,
    pub course_name: String,
    /// Tabs in selection order.
    pub tabs: Vec<TabProgress>,
    /// Set when the job as a whole failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<String>,
}

impl CourseProgress {
    pub fn new(course_id: impl Into<String>, course_name: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            course_name: course_name.into(),
            tabs: Vec::new(),
            job_error: None,
        }
    }

    /// Snapshot for a job that failed before it could report anything.
    pub fn job_failed(course_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let course_id = course_id.into();
        Self {
            course_name: course_id.clone(),
            course_id,
            tabs: Vec::new(),
            job_error: Some(reason.into()),
        }
    }

    pub fn tab(&self, tab_id: &str) -> Option<&TabProgress> {
        self.tabs.iter().find(|t| t.tab_id == tab_id)
    }

    pub fn tab_mut(&mut self, tab_id: &str) -> Option<&mut TabProgress> {
        self.tabs.iter_mut().find(|t| t.tab_id == tab_id)
    }

    /// Moves a tab to `state`, rejecting regressions.
    pub fn set_tab_state(&mut self, tab_id: &str, state: ProgressState) -> Result<()> {
        let course_id = self.course_id.clone();
        let tab = self.tab_mut(tab_id).ok_or_else(|| SyncError::InvalidStateTransition {
            from: "missing".to_string(),
            to: state.to_string(),
            reason: format!("course {} has no tab {}", course_id, tab_id),
        })?;
        tab.state.validate_transition(&state)?;
        tab.state = state;
        Ok(())
    }

    pub fn state(&self) -> CourseState {
        if self.job_error.is_some() {
            return CourseState::Failed;
        }
        if self.tabs.is_empty() {
            return CourseState::NotStarted;
        }
        if self.tabs.iter().all(|t| t.state.is_terminal()) {
            if self.tabs.iter().all(|t| t.state == ProgressState::Completed) {
                CourseState::Completed
            } else {
                CourseState::PartiallyFailed
            }
        } else if self.tabs.iter().all(|t| t.state == ProgressState::Starting) {
            CourseState::Starting
        } else {
            CourseState::InProgress
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn weight(&self) -> u64 {
        self.tabs.iter().map(TabProgress::weight).sum()
    }

    pub fn completed_weight(&self) -> u64 {
        if self.is_terminal() {
            return self.weight();
        }
        self.tabs.iter().map(TabProgress::completed_weight).sum()
    }

    /// Sum of the known item sizes across all tabs.
    pub fn total_bytes(&self) -> u64 {
        self.tabs
            .iter()
            .flat_map(|t| t.items.iter())
            .filter_map(|i| i.size)
            .sum()
    }

    pub fn progress_percent(&self) -> u8 {
        if self.is_terminal() {
            return 100;
        }
        percent_of(self.completed_weight(), self.weight())
    }

    /// Encode as a dispatcher payload.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a dispatcher payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

// ============================================================================
// Aggregated View
// ============================================================================

/// Overall state across every known course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    /// Nothing is being tracked.
    Idle,
    InProgress,
    Completed,
    /// Every course is terminal and at least one did not fully complete.
    Failed,
}

/// One course as shown in the aggregated view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseSyncView {
    pub progress: CourseProgress,
    pub state: CourseState,
    pub progress_percent: u8,
}

/// Derived, read-only merge of the latest snapshot of every tracked course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedSyncView {
    /// Ordered by course id.
    pub courses: Vec<CourseSyncView>,
    pub state: AggregateState,
    pub progress_percent: u8,
    pub total_bytes: u64,
}

impl AggregatedSyncView {
    pub fn empty() -> Self {
        Self {
            courses: Vec::new(),
            state: AggregateState::Idle,
            progress_percent: 0,
            total_bytes: 0,
        }
    }

    /// Builds a view purely from snapshots. Input order does not matter.
    pub fn from_snapshots<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a CourseProgress>,
    {
        let mut courses: Vec<CourseSyncView> = snapshots
            .into_iter()
            .map(|progress| CourseSyncView {
                state: progress.state(),
                progress_percent: progress.progress_percent(),
                progress: progress.clone(),
            })
            .collect();

        if courses.is_empty() {
            return Self::empty();
        }
        courses.sort_by(|a, b| a.progress.course_id.cmp(&b.progress.course_id));

        let all_terminal = courses.iter().all(|c| c.state.is_terminal());
        let state = if !all_terminal {
            AggregateState::InProgress
        } else if courses.iter().any(|c| c.state.is_failure()) {
            AggregateState::Failed
        } else {
            AggregateState::Completed
        };

        let total_weight: u64 = courses.iter().map(|c| c.progress.weight()).sum();
        let done_weight: u64 = courses.iter().map(|c| c.progress.completed_weight()).sum();
        let progress_percent = if all_terminal {
            100
        } else {
            percent_of(done_weight, total_weight)
        };
        let total_bytes = courses.iter().map(|c| c.progress.total_bytes()).sum();

        Self {
            courses,
            state,
            progress_percent,
            total_bytes,
        }
    }

    pub fn course(&self, course_id: &str) -> Option<&CourseSyncView> {
        self.courses.iter().find(|c| c.progress.course_id == course_id)
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

impl Default for AggregatedSyncView {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course_with_tabs(states: &[ProgressState]) -> CourseProgress {
        let mut course = CourseProgress::new("42", "Biology");
        for (idx, state) in states.iter().enumerate() {
            let mut tab = TabProgress::starting(format!("tab-{}", idx), format!("Tab {}", idx));
            tab.state = state.clone();
            course.tabs.push(tab);
        }
        course
    }

    #[test]
    fn test_selection_validation() {
        assert!(SyncSelection::new()
            .with_course("1", ["pages", "files"])
            .validate()
            .is_ok());

        let dup_course = SyncSelection::new()
            .with_course("1", ["pages"])
            .with_course("1", ["files"]);
        assert!(matches!(
            dup_course.validate(),
            Err(SyncError::InvalidSelection(_))
        ));

        let no_tabs = SyncSelection::new().with_course("1", Vec::<String>::new());
        assert!(no_tabs.validate().is_err());

        let dup_tab = SyncSelection::new().with_course("1", ["pages", "pages"]);
        assert!(dup_tab.validate().is_err());

        let blank = SyncSelection::new().with_course(" ", ["pages"]);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_progress_transitions_are_monotonic() {
        let starting = ProgressState::Starting;
        assert!(starting.validate_transition(&ProgressState::in_progress(10)).is_ok());
        assert!(starting.validate_transition(&ProgressState::Completed).is_ok());

        let halfway = ProgressState::in_progress(50);
        assert!(halfway.validate_transition(&ProgressState::in_progress(50)).is_ok());
        assert!(halfway.validate_transition(&ProgressState::in_progress(80)).is_ok());
        assert!(halfway.validate_transition(&ProgressState::in_progress(20)).is_err());
        assert!(halfway.validate_transition(&ProgressState::Starting).is_err());
        assert!(halfway.validate_transition(&ProgressState::failed("x")).is_ok());

        for terminal in [ProgressState::Completed, ProgressState::failed("1 item failed")] {
            assert!(terminal.validate_transition(&ProgressState::Starting).is_err());
            assert!(terminal.validate_transition(&ProgressState::Completed).is_err());
            assert!(terminal.validate_transition(&ProgressState::in_progress(100)).is_err());
        }
    }

    #[test]
    fn test_in_progress_percent_is_clamped() {
        assert_eq!(ProgressState::in_progress(250).percent(), 100);
    }

    #[test]
    fn test_failure_reason_wording() {
        assert_eq!(failure_reason(1), "1 item failed");
        assert_eq!(failure_reason(3), "3 items failed");
    }

    #[test]
    fn test_course_state_derivation() {
        assert_eq!(CourseProgress::new("1", "A").state(), CourseState::NotStarted);
        assert_eq!(
            course_with_tabs(&[ProgressState::Starting, ProgressState::Starting]).state(),
            CourseState::Starting
        );
        assert_eq!(
            course_with_tabs(&[ProgressState::Completed, ProgressState::Starting]).state(),
            CourseState::InProgress
        );
        assert_eq!(
            course_with_tabs(&[ProgressState::Completed, ProgressState::Completed]).state(),
            CourseState::Completed
        );
        assert_eq!(
            course_with_tabs(&[ProgressState::Completed, ProgressState::failed("1 item failed")])
                .state(),
            CourseState::PartiallyFailed
        );
        assert_eq!(
            CourseProgress::job_failed("1", "Storage unavailable").state(),
            CourseState::Failed
        );
    }

    #[test]
    fn test_course_terminal_iff_all_tabs_terminal() {
        let mut course = course_with_tabs(&[ProgressState::Starting, ProgressState::Starting]);
        course.set_tab_state("tab-0", ProgressState::Completed).unwrap();
        assert!(!course.is_terminal());
        course
            .set_tab_state("tab-1", ProgressState::failed("2 items failed"))
            .unwrap();
        assert!(course.is_terminal());
    }

    #[test]
    fn test_set_tab_state_rejects_regression_and_unknown_tab() {
        let mut course = course_with_tabs(&[ProgressState::Completed]);
        assert!(matches!(
            course.set_tab_state("tab-0", ProgressState::Starting),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(course.set_tab_state("nope", ProgressState::Completed).is_err());
    }

    #[test]
    fn test_payload_preserves_snapshot() {
        let mut course = course_with_tabs(&[ProgressState::in_progress(40)]);
        course.tabs[0].items.push(ItemProgress {
            item_id: "f1".to_string(),
            name: "syllabus.pdf".to_string(),
            size: Some(2048),
            state: ProgressState::Completed,
        });

        let payload = course.to_payload().unwrap();
        assert_eq!(payload["tabs"][0]["state"]["state"], "in_progress");
        assert_eq!(CourseProgress::from_payload(&payload).unwrap(), course);
    }

    #[test]
    fn test_garbage_payload_is_serialization_error() {
        let payload = serde_json::json!({"unexpected": true});
        assert!(matches!(
            CourseProgress::from_payload(&payload),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn test_weighted_progress() {
        let mut course = course_with_tabs(&[ProgressState::in_progress(50)]);
        course.tabs[0].items = vec![
            ItemProgress {
                item_id: "a".to_string(),
                name: "a.pdf".to_string(),
                size: Some(100_000),
                state: ProgressState::Completed,
            },
            ItemProgress {
                item_id: "b".to_string(),
                name: "b.pdf".to_string(),
                size: Some(100_000),
                state: ProgressState::Starting,
            },
        ];

        assert_eq!(course.weight(), 300_000);
        assert_eq!(course.completed_weight(), 150_000);
        assert_eq!(course.progress_percent(), 50);
        assert_eq!(course.total_bytes(), 200_000);
    }

    #[test]
    fn test_aggregated_view_states() {
        assert_eq!(
            AggregatedSyncView::from_snapshots(std::iter::empty()).state,
            AggregateState::Idle
        );

        let done = course_with_tabs(&[ProgressState::Completed]);
        let mut running = course_with_tabs(&[ProgressState::Starting]);
        running.course_id = "7".to_string();
        let view = AggregatedSyncView::from_snapshots([&running, &done]);
        assert_eq!(view.state, AggregateState::InProgress);
        assert_eq!(view.courses[0].progress.course_id, "42");
        assert_eq!(view.progress_percent, 50);

        let mut partial = course_with_tabs(&[ProgressState::failed("1 item failed")]);
        partial.course_id = "7".to_string();
        let view = AggregatedSyncView::from_snapshots([&done, &partial]);
        assert_eq!(view.state, AggregateState::Failed);
        assert_eq!(view.progress_percent, 100);

        let view = AggregatedSyncView::from_snapshots([&done]);
        assert_eq!(view.state, AggregateState::Completed);
        assert_eq!(view.course("42").map(|c| c.state), Some(CourseState::Completed));
    }
}

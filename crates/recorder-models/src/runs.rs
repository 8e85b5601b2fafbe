use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::ModelError;
use crate::store::{RecorderStoreError, RunWindowSource};

/// Row in the `recorder_runs` table: one continuous recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderRun {
    pub run_id: Option<i64>,
    pub start: DateTime<Utc>,
    /// `None` while the run is still open.
    pub end: Option<DateTime<Utc>>,
    /// Set at a later startup when this run was found still open.
    pub closed_incorrect: bool,
    pub created: DateTime<Utc>,
}

impl RecorderRun {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            start,
            end: None,
            closed_incorrect: false,
            created: Utc::now(),
        }
    }

    /// Half-open `last_updated` window covered by this run.
    ///
    /// `point_in_time` wins over `end` even when the run is closed.
    pub fn update_window(
        &self,
        point_in_time: Option<DateTime<Utc>>,
    ) -> Result<UpdateWindow, ModelError> {
        if self.run_id.is_none() {
            return Err(ModelError::RunNotPersisted);
        }
        Ok(UpdateWindow {
            start: self.start,
            end: point_in_time.or(self.end),
        })
    }

    /// Entity ids that received a state update during this run.
    ///
    /// Pass `point_in_time` to ask which entities existed at that moment
    /// inside the run.
    pub async fn entity_ids<S: RunWindowSource + ?Sized>(
        &self,
        source: &S,
        point_in_time: Option<DateTime<Utc>>,
    ) -> Result<HashSet<String>, RecorderStoreError> {
        let window = self.update_window(point_in_time)?;
        source.distinct_entity_ids(&window).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl UpdateWindow {
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.end.is_none_or(|end| ts < end)
    }
}

/// Row in the `schema_changes` audit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub change_id: i64,
    pub schema_version: i32,
    pub changed: DateTime<Utc>,
}

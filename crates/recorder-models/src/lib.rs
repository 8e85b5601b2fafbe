//! Persistence mapping for the home-automation event/state recorder.
//!
//! Domain events and state snapshots are translated into row records for the
//! `events` and `states` tables and rebuilt from them on read. Recording runs
//! answer which entities were updated inside their time window.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use crate::config::RecorderConfig;

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod filter;
pub mod runs;
pub mod schema;
pub mod states;
pub mod store;
pub mod time;

pub use domain::{
    Context, EVENT_STATE_CHANGED, EntityIdPolicy, Event, EventData, EventOrigin, State,
    StateChangedData,
};
pub use error::ModelError;
pub use events::EventRecord;
pub use runs::{RecorderRun, SchemaChange, UpdateWindow};
pub use states::StateRecord;
pub use store::{
    PersistedEvent, RecorderStore, RecorderStoreError, RunWindowSource, record_event,
};
pub use time::{StoredTimestamp, process_timestamp};

/// Open the store selected by `config`: Postgres when a URL is set, memory otherwise.
pub async fn build_store(config: &RecorderConfig) -> Result<Arc<dyn RecorderStore>> {
    let policy = config.entity_id_policy;
    let store = match config.db_url.as_deref() {
        Some(url) => {
            info!(entity_id_policy = policy.as_str(), "recorder store using postgres backend");
            store::postgres(url, policy).await?
        }
        None => {
            info!(entity_id_policy = policy.as_str(), "recorder store using in-memory backend");
            store::memory(policy)
        }
    };

    if config.ensure_schema {
        let schema_version = store
            .ensure_schema()
            .await
            .context("ensure recorder schema")?;
        info!(schema_version, "recorder schema ready");
    }
    Ok(store)
}

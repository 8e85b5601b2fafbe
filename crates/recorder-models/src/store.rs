use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::domain::{EntityIdPolicy, Event, EventData, State};
use crate::error::ModelError;
use crate::events::EventRecord;
use crate::runs::{RecorderRun, SchemaChange, UpdateWindow};
use crate::schema::{CREATE_STATEMENTS, SCHEMA_VERSION};
use crate::states::StateRecord;
use crate::time::{StoredTimestamp, process_timestamp};

#[derive(Debug, thiserror::Error)]
pub enum RecorderStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("db error: {0}")]
    Db(String),
}

/// Read-only lookups needed by the run window query.
#[async_trait]
pub trait RunWindowSource: Send + Sync {
    /// Distinct entity ids whose `last_updated` falls inside `window`.
    async fn distinct_entity_ids(
        &self,
        window: &UpdateWindow,
    ) -> Result<HashSet<String>, RecorderStoreError>;
}

#[async_trait]
pub trait RecorderStore: RunWindowSource {
    async fn insert_event(&self, record: EventRecord) -> Result<EventRecord, RecorderStoreError>;

    async fn get_event(&self, event_id: i64) -> Result<Option<EventRecord>, RecorderStoreError>;

    async fn insert_state(&self, record: StateRecord) -> Result<StateRecord, RecorderStoreError>;

    async fn get_state(&self, state_id: i64) -> Result<Option<StateRecord>, RecorderStoreError>;

    /// All rows of one entity, oldest `last_updated` first.
    async fn states_for_entity(
        &self,
        entity_id: &str,
    ) -> Result<Vec<StateRecord>, RecorderStoreError>;

    async fn insert_run(&self, run: RecorderRun) -> Result<RecorderRun, RecorderStoreError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<RecorderRun>, RecorderStoreError>;

    async fn close_run(
        &self,
        run_id: i64,
        end: DateTime<Utc>,
        closed_incorrect: bool,
    ) -> Result<RecorderRun, RecorderStoreError>;

    async fn insert_schema_change(
        &self,
        schema_version: i32,
    ) -> Result<SchemaChange, RecorderStoreError>;

    async fn current_schema_version(&self) -> Result<Option<i32>, RecorderStoreError>;

    /// Policy applied to entity ids when rows are rebuilt into states.
    fn entity_id_policy(&self) -> EntityIdPolicy;

    /// Create the recorder tables when missing.
    async fn create_tables(&self) -> Result<(), RecorderStoreError>;

    /// Create the tables and stamp the schema version once.
    ///
    /// Returns the schema version recorded in the store. Upgrading an older
    /// version is left to the migration tooling.
    async fn ensure_schema(&self) -> Result<i32, RecorderStoreError> {
        self.create_tables().await?;

        if let Some(version) = self.current_schema_version().await? {
            if version != SCHEMA_VERSION {
                tracing::warn!(
                    found = version,
                    expected = SCHEMA_VERSION,
                    "recorder schema version differs from this build"
                );
            }
            return Ok(version);
        }

        self.insert_schema_change(SCHEMA_VERSION).await?;
        tracing::info!(schema_version = SCHEMA_VERSION, "created recorder schema");
        Ok(SCHEMA_VERSION)
    }

    /// Stored states of one entity under the store's id policy, oldest first.
    ///
    /// Rows whose attributes no longer parse are skipped.
    async fn entity_history(&self, entity_id: &str) -> Result<Vec<State>, RecorderStoreError> {
        let policy = self.entity_id_policy();
        let mut states = Vec::new();
        for row in self.states_for_entity(entity_id).await? {
            if let Some(state) = row.to_native(policy)? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

/// Rows written for one fired event.
#[derive(Debug, Clone)]
pub struct PersistedEvent {
    pub event: EventRecord,
    pub state: Option<StateRecord>,
}

/// Persist an event and, for `state_changed` events, the linked state row.
///
/// The two inserts are not atomic: when the state insert fails the event row
/// is already stored and stays behind without its state.
pub async fn record_event(
    store: &dyn RecorderStore,
    event: &Event,
) -> Result<PersistedEvent, RecorderStoreError> {
    let event_row = store.insert_event(EventRecord::from_event(event)?).await?;

    let state_row = match &event.data {
        EventData::StateChanged(_) => {
            let mut row = StateRecord::from_event(event)?;
            row.event_id = event_row.event_id;
            Some(store.insert_state(row).await?)
        }
        EventData::Other(_) => None,
    };

    tracing::debug!(
        event_id = ?event_row.event_id,
        event_type = %event_row.event_type,
        state_id = ?state_row.as_ref().and_then(|row| row.state_id),
        "recorded event"
    );

    Ok(PersistedEvent {
        event: event_row,
        state: state_row,
    })
}

pub fn memory(entity_id_policy: EntityIdPolicy) -> Arc<dyn RecorderStore> {
    Arc::new(MemoryRecorderStore {
        entity_id_policy,
        inner: Mutex::default(),
    })
}

/// Connect to Postgres and open a store on that connection.
///
/// The connection is driven on its own task; a failure there is logged and
/// later surfaces as `Db` errors from the store calls.
pub async fn postgres(
    database_url: &str,
    entity_id_policy: EntityIdPolicy,
) -> Result<Arc<dyn RecorderStore>, RecorderStoreError> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|error| {
            RecorderStoreError::Db(format!("connect to recorder postgres: {error}"))
        })?;

    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(reason = %error, "recorder postgres connection error");
        }
    });

    Ok(Arc::new(PostgresRecorderStore {
        entity_id_policy,
        client: Mutex::new(client),
    }))
}

struct MemoryRecorderStore {
    entity_id_policy: EntityIdPolicy,
    inner: Mutex<MemoryRecorderInner>,
}

#[derive(Default)]
struct MemoryRecorderInner {
    next_event_id: i64,
    next_state_id: i64,
    next_run_id: i64,
    next_change_id: i64,
    events_by_id: BTreeMap<i64, EventRecord>,
    states_by_id: BTreeMap<i64, StateRecord>,
    runs_by_id: BTreeMap<i64, RecorderRun>,
    schema_changes: Vec<SchemaChange>,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[async_trait]
impl RunWindowSource for MemoryRecorderStore {
    async fn distinct_entity_ids(
        &self,
        window: &UpdateWindow,
    ) -> Result<HashSet<String>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .states_by_id
            .values()
            .filter(|row| {
                process_timestamp(row.last_updated).is_some_and(|ts| window.contains(ts))
            })
            .map(|row| row.entity_id.clone())
            .collect())
    }
}

#[async_trait]
impl RecorderStore for MemoryRecorderStore {
    async fn insert_event(&self, record: EventRecord) -> Result<EventRecord, RecorderStoreError> {
        let mut inner = self.inner.lock().await;
        let event_id = next_id(&mut inner.next_event_id);

        let mut row = record;
        row.event_id = Some(event_id);
        row.created = row.created.or(Some(StoredTimestamp::from(Utc::now())));
        inner.events_by_id.insert(event_id, row.clone());
        Ok(row)
    }

    async fn get_event(&self, event_id: i64) -> Result<Option<EventRecord>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events_by_id.get(&event_id).cloned())
    }

    async fn insert_state(&self, record: StateRecord) -> Result<StateRecord, RecorderStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(event_id) = record.event_id {
            if !inner.events_by_id.contains_key(&event_id) {
                return Err(RecorderStoreError::NotFound(format!(
                    "event {event_id} referenced by state row"
                )));
            }
        }
        let state_id = next_id(&mut inner.next_state_id);

        let now = StoredTimestamp::from(Utc::now());
        let mut row = record;
        row.state_id = Some(state_id);
        row.last_changed = row.last_changed.or(Some(now));
        row.last_updated = row.last_updated.or(Some(now));
        row.created = row.created.or(Some(now));
        inner.states_by_id.insert(state_id, row.clone());
        Ok(row)
    }

    async fn get_state(&self, state_id: i64) -> Result<Option<StateRecord>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.states_by_id.get(&state_id).cloned())
    }

    async fn states_for_entity(
        &self,
        entity_id: &str,
    ) -> Result<Vec<StateRecord>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .states_by_id
            .values()
            .filter(|row| row.entity_id == entity_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| (process_timestamp(row.last_updated), row.state_id));
        Ok(rows)
    }

    async fn insert_run(&self, run: RecorderRun) -> Result<RecorderRun, RecorderStoreError> {
        let mut inner = self.inner.lock().await;
        let run_id = next_id(&mut inner.next_run_id);

        let mut row = run;
        row.run_id = Some(run_id);
        inner.runs_by_id.insert(run_id, row.clone());
        Ok(row)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<RecorderRun>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs_by_id.get(&run_id).cloned())
    }

    async fn close_run(
        &self,
        run_id: i64,
        end: DateTime<Utc>,
        closed_incorrect: bool,
    ) -> Result<RecorderRun, RecorderStoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs_by_id
            .get_mut(&run_id)
            .ok_or_else(|| RecorderStoreError::NotFound(format!("recorder run {run_id}")))?;
        run.end = Some(end);
        run.closed_incorrect = closed_incorrect;
        Ok(run.clone())
    }

    async fn insert_schema_change(
        &self,
        schema_version: i32,
    ) -> Result<SchemaChange, RecorderStoreError> {
        let mut inner = self.inner.lock().await;
        let change = SchemaChange {
            change_id: next_id(&mut inner.next_change_id),
            schema_version,
            changed: Utc::now(),
        };
        inner.schema_changes.push(change.clone());
        Ok(change)
    }

    async fn current_schema_version(&self) -> Result<Option<i32>, RecorderStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .schema_changes
            .last()
            .map(|change| change.schema_version))
    }

    fn entity_id_policy(&self) -> EntityIdPolicy {
        self.entity_id_policy
    }

    async fn create_tables(&self) -> Result<(), RecorderStoreError> {
        Ok(())
    }
}

struct PostgresRecorderStore {
    entity_id_policy: EntityIdPolicy,
    client: Mutex<Client>,
}

const EVENT_COLUMNS: &str = "event_id, event_type, event_data, origin, time_fired, created, context_id, context_user_id";

const STATE_COLUMNS: &str = "state_id, domain, entity_id, state, attributes, event_id, last_changed, last_updated, created, context_id, context_user_id";

const RUN_COLUMNS: &str = r#"run_id, start, "end", closed_incorrect, created"#;

#[async_trait]
impl RunWindowSource for PostgresRecorderStore {
    async fn distinct_entity_ids(
        &self,
        window: &UpdateWindow,
    ) -> Result<HashSet<String>, RecorderStoreError> {
        let client = self.client.lock().await;
        let rows = match window.end {
            Some(end) => {
                client
                    .query(
                        r#"
                        SELECT DISTINCT entity_id
                          FROM states
                         WHERE last_updated >= $1
                           AND last_updated < $2
                        "#,
                        &[&window.start, &end],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        r#"
                        SELECT DISTINCT entity_id
                          FROM states
                         WHERE last_updated >= $1
                        "#,
                        &[&window.start],
                    )
                    .await
            }
        }
        .map_err(|error| RecorderStoreError::Db(error.to_string()))?;

        let mut entity_ids = HashSet::with_capacity(rows.len());
        for row in rows {
            let entity_id = row
                .try_get::<_, Option<String>>("entity_id")
                .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
            if let Some(entity_id) = entity_id {
                entity_ids.insert(entity_id);
            }
        }
        Ok(entity_ids)
    }
}

#[async_trait]
impl RecorderStore for PostgresRecorderStore {
    async fn insert_event(&self, record: EventRecord) -> Result<EventRecord, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_one(
                format!(
                    r#"
                    INSERT INTO events (
                      event_type,
                      event_data,
                      origin,
                      time_fired,
                      created,
                      context_id,
                      context_user_id
                    )
                    VALUES ($1, $2, $3, $4, COALESCE($5, now()), $6, $7)
                    RETURNING {EVENT_COLUMNS}
                    "#
                )
                .as_str(),
                &[
                    &record.event_type,
                    &record.event_data,
                    &record.origin,
                    &process_timestamp(record.time_fired),
                    &process_timestamp(record.created),
                    &record.context_id,
                    &record.context_user_id,
                ],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;

        let inserted = map_event_row(&row).map_err(RecorderStoreError::Db)?;
        tracing::debug!(event_id = ?inserted.event_id, "inserted event row");
        Ok(inserted)
    }

    async fn get_event(&self, event_id: i64) -> Result<Option<EventRecord>, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1").as_str(),
                &[&event_id],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_event_row(&row).map_err(RecorderStoreError::Db)?))
    }

    async fn insert_state(&self, record: StateRecord) -> Result<StateRecord, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_one(
                format!(
                    r#"
                    INSERT INTO states (
                      domain,
                      entity_id,
                      state,
                      attributes,
                      event_id,
                      last_changed,
                      last_updated,
                      created,
                      context_id,
                      context_user_id
                    )
                    VALUES (
                      $1, $2, $3, $4, $5,
                      COALESCE($6, now()),
                      COALESCE($7, now()),
                      COALESCE($8, now()),
                      $9, $10
                    )
                    RETURNING {STATE_COLUMNS}
                    "#
                )
                .as_str(),
                &[
                    &record.domain,
                    &record.entity_id,
                    &record.state,
                    &record.attributes,
                    &record.event_id,
                    &process_timestamp(record.last_changed),
                    &process_timestamp(record.last_updated),
                    &process_timestamp(record.created),
                    &record.context_id,
                    &record.context_user_id,
                ],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;

        let inserted = map_state_row(&row).map_err(RecorderStoreError::Db)?;
        tracing::debug!(
            state_id = ?inserted.state_id,
            entity_id = %inserted.entity_id,
            "inserted state row"
        );
        Ok(inserted)
    }

    async fn get_state(&self, state_id: i64) -> Result<Option<StateRecord>, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                format!("SELECT {STATE_COLUMNS} FROM states WHERE state_id = $1").as_str(),
                &[&state_id],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_state_row(&row).map_err(RecorderStoreError::Db)?))
    }

    async fn states_for_entity(
        &self,
        entity_id: &str,
    ) -> Result<Vec<StateRecord>, RecorderStoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query(
                format!(
                    r#"
                    SELECT {STATE_COLUMNS}
                      FROM states
                     WHERE entity_id = $1
                     ORDER BY last_updated ASC, state_id ASC
                    "#
                )
                .as_str(),
                &[&entity_id],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_state_row(row).map_err(RecorderStoreError::Db))
            .collect()
    }

    async fn insert_run(&self, run: RecorderRun) -> Result<RecorderRun, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_one(
                format!(
                    r#"
                    INSERT INTO recorder_runs (start, "end", closed_incorrect, created)
                    VALUES ($1, $2, $3, $4)
                    RETURNING {RUN_COLUMNS}
                    "#
                )
                .as_str(),
                &[&run.start, &run.end, &run.closed_incorrect, &run.created],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        map_run_row(&row).map_err(RecorderStoreError::Db)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<RecorderRun>, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                format!("SELECT {RUN_COLUMNS} FROM recorder_runs WHERE run_id = $1").as_str(),
                &[&run_id],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_run_row(&row).map_err(RecorderStoreError::Db)?))
    }

    async fn close_run(
        &self,
        run_id: i64,
        end: DateTime<Utc>,
        closed_incorrect: bool,
    ) -> Result<RecorderRun, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                format!(
                    r#"
                    UPDATE recorder_runs
                       SET "end" = $2,
                           closed_incorrect = $3
                     WHERE run_id = $1
                    RETURNING {RUN_COLUMNS}
                    "#
                )
                .as_str(),
                &[&run_id, &end, &closed_incorrect],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(RecorderStoreError::NotFound(format!("recorder run {run_id}")));
        };
        map_run_row(&row).map_err(RecorderStoreError::Db)
    }

    async fn insert_schema_change(
        &self,
        schema_version: i32,
    ) -> Result<SchemaChange, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_one(
                r#"
                INSERT INTO schema_changes (schema_version, changed)
                VALUES ($1, now())
                RETURNING change_id, schema_version, changed
                "#,
                &[&schema_version],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        Ok(SchemaChange {
            change_id: row.get("change_id"),
            schema_version: row.get("schema_version"),
            changed: required_timestamp(&row, "changed").map_err(RecorderStoreError::Db)?,
        })
    }

    async fn current_schema_version(&self) -> Result<Option<i32>, RecorderStoreError> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                r#"
                SELECT schema_version
                  FROM schema_changes
                 ORDER BY change_id DESC
                 LIMIT 1
                "#,
                &[],
            )
            .await
            .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        Ok(row.and_then(|row| row.get::<_, Option<i32>>("schema_version")))
    }

    fn entity_id_policy(&self) -> EntityIdPolicy {
        self.entity_id_policy
    }

    async fn create_tables(&self) -> Result<(), RecorderStoreError> {
        let client = self.client.lock().await;
        for statement in CREATE_STATEMENTS {
            client
                .batch_execute(statement)
                .await
                .map_err(|error| RecorderStoreError::Db(error.to_string()))?;
        }
        Ok(())
    }
}

fn map_event_row(row: &tokio_postgres::Row) -> Result<EventRecord, String> {
    Ok(EventRecord {
        event_id: row.get("event_id"),
        event_type: text_column(row, "event_type")?,
        event_data: text_column(row, "event_data")?,
        origin: text_column(row, "origin")?,
        time_fired: stored_timestamp(row, "time_fired")?,
        created: stored_timestamp(row, "created")?,
        context_id: row.get("context_id"),
        context_user_id: row.get("context_user_id"),
    })
}

fn map_state_row(row: &tokio_postgres::Row) -> Result<StateRecord, String> {
    Ok(StateRecord {
        state_id: row.get("state_id"),
        domain: text_column(row, "domain")?,
        entity_id: text_column(row, "entity_id")?,
        state: text_column(row, "state")?,
        attributes: text_column(row, "attributes")?,
        event_id: row.get("event_id"),
        last_changed: stored_timestamp(row, "last_changed")?,
        last_updated: stored_timestamp(row, "last_updated")?,
        created: stored_timestamp(row, "created")?,
        context_id: row.get("context_id"),
        context_user_id: row.get("context_user_id"),
    })
}

fn map_run_row(row: &tokio_postgres::Row) -> Result<RecorderRun, String> {
    Ok(RecorderRun {
        run_id: row.get("run_id"),
        start: required_timestamp(row, "start")?,
        end: process_timestamp(stored_timestamp(row, "end")?),
        closed_incorrect: row
            .try_get::<_, Option<bool>>("closed_incorrect")
            .map_err(|error| error.to_string())?
            .unwrap_or(false),
        created: required_timestamp(row, "created")?,
    })
}

// Nullable text columns read back as empty strings.
fn text_column(row: &tokio_postgres::Row, column: &str) -> Result<String, String> {
    row.try_get::<_, Option<String>>(column)
        .map(Option::unwrap_or_default)
        .map_err(|error| error.to_string())
}

// Tables created before the zone-aware schema hold naive UTC timestamps.
fn stored_timestamp(
    row: &tokio_postgres::Row,
    column: &str,
) -> Result<Option<StoredTimestamp>, String> {
    match row.try_get::<_, Option<DateTime<Utc>>>(column) {
        Ok(value) => Ok(value.map(StoredTimestamp::from)),
        Err(_) => row
            .try_get::<_, Option<NaiveDateTime>>(column)
            .map(|value| value.map(StoredTimestamp::from))
            .map_err(|error| format!("{column}: {error}")),
    }
}

fn required_timestamp(row: &tokio_postgres::Row, column: &str) -> Result<DateTime<Utc>, String> {
    process_timestamp(stored_timestamp(row, column)?).ok_or_else(|| format!("{column} is null"))
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{Map, Value, json};

    use super::{RecorderStoreError, memory, record_event};
    use crate::domain::{EntityIdPolicy, Event, EventOrigin, State, StateChangedData};
    use crate::events::EventRecord;
    use crate::runs::RecorderRun;
    use crate::schema::SCHEMA_VERSION;
    use crate::states::StateRecord;
    use crate::time::StoredTimestamp;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 3, 1, hour, minute, 0)
            .single()
            .unwrap_or_default()
    }

    fn state_row(entity_id: &str, last_updated: DateTime<Utc>) -> StateRecord {
        StateRecord {
            state_id: None,
            domain: "sensor".to_string(),
            entity_id: entity_id.to_string(),
            state: "1".to_string(),
            attributes: "{}".to_string(),
            event_id: None,
            last_changed: Some(StoredTimestamp::from(last_updated)),
            last_updated: Some(StoredTimestamp::from(last_updated)),
            created: None,
            context_id: None,
            context_user_id: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_identity_and_created() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let event = Event::new("call_service", Map::new(), EventOrigin::Local, None, None)?;

        let first = store.insert_event(EventRecord::from_event(&event)?).await?;
        let second = store.insert_event(EventRecord::from_event(&event)?).await?;
        assert_eq!(first.event_id, Some(1));
        assert_eq!(second.event_id, Some(2));
        assert!(first.created.is_some());

        let fetched = store.get_event(1).await?.context("event 1 stored")?;
        assert_eq!(fetched, first);
        Ok(())
    }

    #[tokio::test]
    async fn record_event_links_state_row_to_event_row() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let new_state = State::new(
            "sensor.outside",
            "12",
            Map::new(),
            None,
            Some(at(10, 0)),
            None,
            EntityIdPolicy::Strict,
        )?;
        let event = Event::state_changed(
            StateChangedData::new("sensor.outside", None, Some(new_state)),
            EventOrigin::Local,
            Some(at(10, 0)),
            None,
        );

        let persisted = record_event(store.as_ref(), &event).await?;
        let state = persisted.state.context("state row written")?;
        assert_eq!(state.event_id, persisted.event.event_id);
        assert_eq!(store.states_for_entity("sensor.outside").await?.len(), 1);

        let generic = Event::new("call_service", Map::new(), EventOrigin::Local, None, None)?;
        assert!(record_event(store.as_ref(), &generic).await?.state.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn state_row_with_dangling_event_is_rejected() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let mut row = state_row("sensor.a", at(10, 0));
        row.event_id = Some(42);
        assert!(matches!(
            store.insert_state(row).await,
            Err(RecorderStoreError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn run_window_respects_bounds_and_point_in_time() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        for (entity_id, ts) in [
            ("sensor.before", at(9, 59)),
            ("sensor.early", at(10, 30)),
            ("sensor.late", at(10, 59)),
            ("sensor.at_end", at(11, 0)),
            ("sensor.early", at(10, 31)),
        ] {
            store.insert_state(state_row(entity_id, ts)).await?;
        }

        let mut run = RecorderRun::new(at(10, 0));
        run.end = Some(at(11, 0));
        let run = store.insert_run(run).await?;

        let mut ids = run
            .entity_ids(store.as_ref(), None)
            .await?
            .into_iter()
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, ["sensor.early", "sensor.late"]);

        let narrowed = run.entity_ids(store.as_ref(), Some(at(10, 45))).await?;
        assert_eq!(narrowed.len(), 1);
        assert!(narrowed.contains("sensor.early"));

        let beyond_end = run.entity_ids(store.as_ref(), Some(at(12, 0))).await?;
        assert!(beyond_end.contains("sensor.at_end"));
        Ok(())
    }

    #[tokio::test]
    async fn unpersisted_run_never_reaches_the_store() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let run = RecorderRun::new(at(10, 0));
        assert!(matches!(
            run.entity_ids(store.as_ref(), None).await,
            Err(RecorderStoreError::Model(
                crate::error::ModelError::RunNotPersisted
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn close_run_updates_end_and_flags() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let run = store.insert_run(RecorderRun::new(at(10, 0))).await?;
        let run_id = run.run_id.context("run id assigned")?;

        let closed = store.close_run(run_id, at(11, 0), true).await?;
        assert_eq!(closed.end, Some(at(11, 0)));
        assert!(closed.closed_incorrect);
        assert_eq!(store.get_run(run_id).await?, Some(closed));

        assert!(matches!(
            store.close_run(run_id + 1, at(11, 0), false).await,
            Err(RecorderStoreError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn schema_version_tracks_latest_change() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        assert_eq!(store.current_schema_version().await?, None);
        store.insert_schema_change(6).await?;
        store.insert_schema_change(7).await?;
        assert_eq!(store.current_schema_version().await?, Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn raw_state_changed_event_writes_a_state_row() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        let Value::Object(payload) = json!({
            "entity_id": "light.kitchen",
            "new_state": {
                "entity_id": "light.kitchen",
                "state": "on",
                "attributes": { "icon": "x" }
            }
        }) else {
            return Ok(());
        };
        let event = Event::new("state_changed", payload, EventOrigin::Local, Some(at(10, 0)), None)?;

        let persisted = record_event(store.as_ref(), &event).await?;
        let state = persisted.state.context("state row written")?;
        assert_eq!(state.event_id, persisted.event.event_id);
        assert_eq!(state.attributes, "{}");
        assert!(!persisted.event.event_data.contains("icon"));
        Ok(())
    }

    #[tokio::test]
    async fn entity_history_follows_the_store_policy() -> Result<()> {
        let mut row = state_row("sensor.Legacy Name", at(10, 0));
        row.attributes = r#"{"unit_of_measurement":"W"}"#.to_string();
        let mut broken = state_row("sensor.Legacy Name", at(10, 5));
        broken.attributes = "{invalid".to_string();

        let legacy = memory(EntityIdPolicy::LegacyBypass);
        legacy.insert_state(row.clone()).await?;
        legacy.insert_state(broken).await?;
        let history = legacy.entity_history("sensor.Legacy Name").await?;
        assert_eq!(history.len(), 1);
        assert_eq!(
            history.first().map(|state| state.object_id.as_str()),
            Some("Legacy Name")
        );

        let strict = memory(EntityIdPolicy::Strict);
        strict.insert_state(row).await?;
        assert!(matches!(
            strict.entity_history("sensor.Legacy Name").await,
            Err(RecorderStoreError::Model(
                crate::error::ModelError::InvalidEntityId(_)
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn ensure_schema_stamps_the_version_once() -> Result<()> {
        let store = memory(EntityIdPolicy::LegacyBypass);
        assert_eq!(store.ensure_schema().await?, SCHEMA_VERSION);
        assert_eq!(store.ensure_schema().await?, SCHEMA_VERSION);

        store.insert_schema_change(6).await?;
        assert_eq!(store.ensure_schema().await?, 6);
        assert_eq!(store.current_schema_version().await?, Some(6));
        Ok(())
    }
}

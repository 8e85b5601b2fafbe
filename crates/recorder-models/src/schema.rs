//! Relational layout of the recorder tables.

pub const SCHEMA_VERSION: i32 = 7;

/// Idempotent DDL for the current schema version, applied in order.
pub const CREATE_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
      event_id BIGSERIAL PRIMARY KEY,
      event_type VARCHAR(32),
      event_data TEXT,
      origin VARCHAR(32),
      time_fired TIMESTAMP WITH TIME ZONE,
      created TIMESTAMP WITH TIME ZONE DEFAULT now(),
      context_id VARCHAR(36),
      context_user_id VARCHAR(36)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_events_event_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS ix_events_time_fired ON events (time_fired)",
    "CREATE INDEX IF NOT EXISTS ix_events_context_id ON events (context_id)",
    "CREATE INDEX IF NOT EXISTS ix_events_context_user_id ON events (context_user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS states (
      state_id BIGSERIAL PRIMARY KEY,
      domain VARCHAR(64),
      entity_id VARCHAR(255),
      state VARCHAR(255),
      attributes TEXT,
      event_id BIGINT REFERENCES events (event_id),
      last_changed TIMESTAMP WITH TIME ZONE DEFAULT now(),
      last_updated TIMESTAMP WITH TIME ZONE DEFAULT now(),
      created TIMESTAMP WITH TIME ZONE DEFAULT now(),
      context_id VARCHAR(36),
      context_user_id VARCHAR(36)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_states_entity_id ON states (entity_id)",
    "CREATE INDEX IF NOT EXISTS ix_states_event_id ON states (event_id)",
    "CREATE INDEX IF NOT EXISTS ix_states_last_updated ON states (last_updated)",
    "CREATE INDEX IF NOT EXISTS ix_states_context_id ON states (context_id)",
    "CREATE INDEX IF NOT EXISTS ix_states_context_user_id ON states (context_user_id)",
    // Serves point-in-time state lookups and the run window query.
    "CREATE INDEX IF NOT EXISTS ix_states_entity_id_last_updated ON states (entity_id, last_updated)",
    r#"
    CREATE TABLE IF NOT EXISTS recorder_runs (
      run_id BIGSERIAL PRIMARY KEY,
      start TIMESTAMP WITH TIME ZONE DEFAULT now(),
      "end" TIMESTAMP WITH TIME ZONE,
      closed_incorrect BOOLEAN DEFAULT FALSE,
      created TIMESTAMP WITH TIME ZONE DEFAULT now()
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS ix_recorder_runs_start_end ON recorder_runs (start, "end")"#,
    r#"
    CREATE TABLE IF NOT EXISTS schema_changes (
      change_id BIGSERIAL PRIMARY KEY,
      schema_version INTEGER,
      changed TIMESTAMP WITH TIME ZONE DEFAULT now()
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::CREATE_STATEMENTS;

    #[test]
    fn lookup_indexes_are_declared() {
        let ddl = CREATE_STATEMENTS.join("\n");
        for index in [
            "ix_states_entity_id_last_updated ON states (entity_id, last_updated)",
            "ix_events_event_type ON events (event_type)",
            "ix_events_time_fired ON events (time_fired)",
            "ix_events_context_id ON events (context_id)",
            "ix_events_context_user_id ON events (context_user_id)",
        ] {
            assert!(ddl.contains(index), "missing index: {index}");
        }
    }

    #[test]
    fn every_statement_is_idempotent() {
        for statement in CREATE_STATEMENTS {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}

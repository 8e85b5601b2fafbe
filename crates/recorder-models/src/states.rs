use serde_json::{Map, Value};

use crate::domain::{Context, EntityIdPolicy, Event, EventData, State, split_entity_id};
use crate::error::ModelError;
use crate::filter::filter_attributes;
use crate::time::{StoredTimestamp, process_timestamp};

/// Row in the `states` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub state_id: Option<i64>,
    pub domain: String,
    pub entity_id: String,
    pub state: String,
    pub attributes: String,
    pub event_id: Option<i64>,
    pub last_changed: Option<StoredTimestamp>,
    pub last_updated: Option<StoredTimestamp>,
    pub created: Option<StoredTimestamp>,
    pub context_id: Option<String>,
    pub context_user_id: Option<String>,
}

impl StateRecord {
    /// Build the row for a `state_changed` event.
    ///
    /// A missing `new_state` means the entity was removed: the row keeps an
    /// empty state and empty attributes stamped with the fired time.
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        let EventData::StateChanged(data) = &event.data else {
            return Err(ModelError::NotStateChanged(event.event_type.clone()));
        };

        let mut record = Self {
            state_id: None,
            domain: String::new(),
            entity_id: data.entity_id.clone(),
            state: String::new(),
            attributes: String::new(),
            event_id: None,
            last_changed: None,
            last_updated: None,
            created: None,
            context_id: Some(event.context.id.clone()),
            context_user_id: event.context.user_id.clone(),
        };

        match &data.new_state {
            None => {
                record.domain = split_entity_id(&data.entity_id).0.to_string();
                record.attributes = "{}".to_string();
                record.last_changed = Some(StoredTimestamp::from(event.time_fired));
                record.last_updated = Some(StoredTimestamp::from(event.time_fired));
            }
            Some(state) => {
                record.domain = state.domain.clone();
                record.state = state.state.clone();
                record.attributes = serde_json::to_string(&filter_attributes(&state.attributes))?;
                record.last_changed = Some(StoredTimestamp::from(state.last_changed));
                record.last_updated = Some(StoredTimestamp::from(state.last_updated));
            }
        }

        Ok(record)
    }

    /// Rebuild the native state.
    ///
    /// Attributes that do not parse as a JSON object are logged and give
    /// `Ok(None)`. `policy` decides whether ids written before validation
    /// existed are accepted.
    pub fn to_native(&self, policy: EntityIdPolicy) -> Result<Option<State>, ModelError> {
        let context = Context::with_ids(self.context_id.clone(), self.context_user_id.clone());

        let attributes = match serde_json::from_str::<Map<String, Value>>(&self.attributes) {
            Ok(attributes) => attributes,
            Err(error) => {
                tracing::error!(
                    state_id = ?self.state_id,
                    entity_id = %self.entity_id,
                    reason = %error,
                    "error converting row to state"
                );
                return Ok(None);
            }
        };

        State::new(
            self.entity_id.clone(),
            self.state.clone(),
            attributes,
            process_timestamp(self.last_changed),
            process_timestamp(self.last_updated),
            Some(context),
            policy,
        )
        .map(Some)
    }
}

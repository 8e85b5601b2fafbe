use chrono::Utc;
use serde_json::{Map, Value};

use crate::domain::{
    Context, EVENT_STATE_CHANGED, EntityIdPolicy, Event, EventData, EventOrigin, StateChangedData,
};
use crate::error::ModelError;
use crate::filter::filter_state_change_event_data;
use crate::time::{StoredTimestamp, process_timestamp};

/// Row in the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: Option<i64>,
    pub event_type: String,
    pub event_data: String,
    pub origin: String,
    pub time_fired: Option<StoredTimestamp>,
    pub created: Option<StoredTimestamp>,
    pub context_id: Option<String>,
    pub context_user_id: Option<String>,
}

impl EventRecord {
    /// Build the row for a native event.
    ///
    /// `event_id` and `created` are left for the store to assign.
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        let event_data = match &event.data {
            EventData::StateChanged(data) => {
                serde_json::to_string(&filter_state_change_event_data(data))?
            }
            EventData::Other(data) => serde_json::to_string(data)?,
        };

        Ok(Self {
            event_id: None,
            event_type: event.event_type.clone(),
            event_data,
            origin: event.origin.to_string(),
            time_fired: Some(StoredTimestamp::from(event.time_fired)),
            created: None,
            context_id: Some(event.context.id.clone()),
            context_user_id: event.context.user_id.clone(),
        })
    }

    /// Rebuild the native event.
    ///
    /// A payload that does not parse is logged and yields `Ok(None)`; the
    /// caller skips the row. An unknown origin tag is an error.
    pub fn to_native(&self) -> Result<Option<Event>, ModelError> {
        let context = Context::with_ids(self.context_id.clone(), self.context_user_id.clone());

        let data = match serde_json::from_str::<Map<String, Value>>(&self.event_data) {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(
                    event_id = ?self.event_id,
                    event_type = %self.event_type,
                    reason = %error,
                    "error converting row to event"
                );
                return Ok(None);
            }
        };

        let data = if self.event_type == EVENT_STATE_CHANGED {
            match decode_state_changed(data) {
                Ok(Some(data)) => EventData::StateChanged(data),
                Ok(None) => {
                    tracing::error!(
                        event_id = ?self.event_id,
                        "error converting row to event: state_changed payload has unexpected shape"
                    );
                    return Ok(None);
                }
                Err(error) => {
                    tracing::error!(
                        event_id = ?self.event_id,
                        reason = %error,
                        "error converting row to event: invalid embedded state"
                    );
                    return Ok(None);
                }
            }
        } else {
            EventData::Other(data)
        };

        let origin = self.origin.parse::<EventOrigin>()?;

        Ok(Some(Event {
            event_type: self.event_type.clone(),
            data,
            origin,
            time_fired: process_timestamp(self.time_fired).unwrap_or_else(Utc::now),
            context,
        }))
    }
}

// Historical rows may embed ids that fail today's validation.
fn decode_state_changed(data: Map<String, Value>) -> Result<Option<StateChangedData>, ModelError> {
    StateChangedData::from_map(data, EntityIdPolicy::LegacyBypass)
}

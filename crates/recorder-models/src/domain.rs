//! Native objects the recorder translates to and from rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::ModelError;

pub const EVENT_STATE_CHANGED: &str = "state_changed";

const MAX_STATE_LENGTH: usize = 255;

/// Correlation metadata carried by events and states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub id: String,
    pub user_id: Option<String>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids(None, None)
    }

    /// Build a context from stored ids, generating a fresh id when none was kept.
    #[must_use]
    pub fn with_ids(id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            user_id,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Value {
        json!({ "id": self.id, "user_id": self.user_id })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Remote,
}

impl EventOrigin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventOrigin {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "LOCAL" => Ok(Self::Local),
            "REMOTE" => Ok(Self::Remote),
            other => Err(ModelError::InvalidOrigin(other.to_string())),
        }
    }
}

/// Split an entity id into `(domain, object_id)` at the first `.`.
///
/// Ids without a separator come back whole as the domain with an empty
/// object id; legacy rows can hold such ids.
#[must_use]
pub fn split_entity_id(entity_id: &str) -> (&str, &str) {
    entity_id.split_once('.').unwrap_or((entity_id, ""))
}

#[must_use]
pub fn valid_entity_id(entity_id: &str) -> bool {
    match entity_id.split_once('.') {
        Some((domain, object_id)) => valid_slug_part(domain) && valid_slug_part(object_id),
        None => false,
    }
}

fn valid_slug_part(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('_')
        && !part.ends_with('_')
        && !part.contains("__")
        && part
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_')
}

#[must_use]
pub fn valid_state(state: &str) -> bool {
    state.chars().count() <= MAX_STATE_LENGTH
}

/// How strictly entity ids are checked when building a [`State`].
///
/// `LegacyBypass` exists for rows written before ids were validated; it skips
/// the id check only, states are still length checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityIdPolicy {
    Strict,
    #[default]
    LegacyBypass,
}

impl EntityIdPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::LegacyBypass => "legacy_bypass",
        }
    }
}

/// A snapshot of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub entity_id: String,
    pub domain: String,
    pub object_id: String,
    pub state: String,
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: Context,
}

impl State {
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: Map<String, Value>,
        last_changed: Option<DateTime<Utc>>,
        last_updated: Option<DateTime<Utc>>,
        context: Option<Context>,
        policy: EntityIdPolicy,
    ) -> Result<Self, ModelError> {
        let entity_id = entity_id.into();
        let state = state.into();

        if policy == EntityIdPolicy::Strict && !valid_entity_id(&entity_id) {
            return Err(ModelError::InvalidEntityId(entity_id));
        }
        if !valid_state(&state) {
            return Err(ModelError::InvalidState {
                entity_id,
                reason: format!("state longer than {MAX_STATE_LENGTH} characters"),
            });
        }

        let last_updated = last_updated.unwrap_or_else(Utc::now);
        let last_changed = last_changed.unwrap_or(last_updated);
        let (domain, object_id) = split_entity_id(&entity_id);
        let (domain, object_id) = (domain.to_string(), object_id.to_string());

        Ok(Self {
            entity_id,
            domain,
            object_id,
            state,
            attributes,
            last_changed,
            last_updated,
            context: context.unwrap_or_default(),
        })
    }

    /// Dict form used when a state is embedded in an event payload.
    #[must_use]
    pub fn as_dict(&self) -> Map<String, Value> {
        let mut dict = Map::new();
        dict.insert("entity_id".to_string(), Value::from(self.entity_id.clone()));
        dict.insert("state".to_string(), Value::from(self.state.clone()));
        dict.insert(
            "attributes".to_string(),
            Value::Object(self.attributes.clone()),
        );
        dict.insert(
            "last_changed".to_string(),
            Value::from(self.last_changed.to_rfc3339()),
        );
        dict.insert(
            "last_updated".to_string(),
            Value::from(self.last_updated.to_rfc3339()),
        );
        dict.insert("context".to_string(), self.context.as_dict());
        dict
    }

    /// Rebuild a state from its dict form.
    ///
    /// Returns `Ok(None)` when `entity_id` or `state` is missing. Timestamps
    /// that fail to parse fall back to the constructor defaults.
    pub fn from_dict(dict: &Value, policy: EntityIdPolicy) -> Result<Option<Self>, ModelError> {
        let Some(dict) = dict.as_object() else {
            return Ok(None);
        };
        let (Some(entity_id), Some(state)) = (
            dict.get("entity_id").and_then(Value::as_str),
            dict.get("state").and_then(Value::as_str),
        ) else {
            return Ok(None);
        };

        let attributes = dict
            .get("attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let context = dict.get("context").and_then(Value::as_object).map(|ctx| {
            Context::with_ids(
                ctx.get("id").and_then(Value::as_str).map(str::to_string),
                ctx.get("user_id").and_then(Value::as_str).map(str::to_string),
            )
        });

        Self::new(
            entity_id,
            state,
            attributes,
            parse_dict_timestamp(dict.get("last_changed")),
            parse_dict_timestamp(dict.get("last_updated")),
            context,
            policy,
        )
        .map(Some)
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_dict().serialize(serializer)
    }
}

fn parse_dict_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedData {
    pub entity_id: String,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
    /// Any further top-level keys fired alongside the states.
    pub extra: Map<String, Value>,
    // Top-level keys in fired order. A state key missing here was absent
    // from the payload rather than explicitly null.
    key_order: Vec<String>,
}

impl StateChangedData {
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        old_state: Option<State>,
        new_state: Option<State>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            old_state,
            new_state,
            extra: Map::new(),
            key_order: ["entity_id", "old_state", "new_state"]
                .map(str::to_string)
                .to_vec(),
        }
    }

    /// Decode a payload map; `Ok(None)` means the payload has the wrong shape.
    pub fn from_map(
        mut map: Map<String, Value>,
        policy: EntityIdPolicy,
    ) -> Result<Option<Self>, ModelError> {
        let key_order = map.keys().cloned().collect::<Vec<_>>();
        let Some(Value::String(entity_id)) = map.remove("entity_id") else {
            return Ok(None);
        };
        let Some(old_state) = embedded_state(map.remove("old_state"), policy)? else {
            return Ok(None);
        };
        let Some(new_state) = embedded_state(map.remove("new_state"), policy)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            entity_id,
            old_state,
            new_state,
            extra: map,
            key_order,
        }))
    }

    /// Top-level keys in the order they were fired.
    #[must_use]
    pub fn key_order(&self) -> &[String] {
        &self.key_order
    }
}

// Outer `None` marks a malformed embedded state, inner `None` an absent one.
fn embedded_state(
    value: Option<Value>,
    policy: EntityIdPolicy,
) -> Result<Option<Option<State>>, ModelError> {
    match value {
        None | Some(Value::Null) => Ok(Some(None)),
        Some(dict) => Ok(State::from_dict(&dict, policy)?.map(Some)),
    }
}

/// Event payload, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    StateChanged(StateChangedData),
    Other(Map<String, Value>),
}

/// A fired domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: EventData,
    pub origin: EventOrigin,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl Event {
    /// Build an event from a raw payload map.
    ///
    /// `state_changed` payloads are decoded into [`StateChangedData`] so they
    /// take the same path as [`Event::state_changed`]; a payload without a
    /// string `entity_id` or with a broken embedded state is rejected.
    pub fn new(
        event_type: impl Into<String>,
        data: Map<String, Value>,
        origin: EventOrigin,
        time_fired: Option<DateTime<Utc>>,
        context: Option<Context>,
    ) -> Result<Self, ModelError> {
        let event_type = event_type.into();
        let data = if event_type == EVENT_STATE_CHANGED {
            let data = StateChangedData::from_map(data, EntityIdPolicy::Strict)?
                .ok_or_else(|| ModelError::MalformedEventData(event_type.clone()))?;
            EventData::StateChanged(data)
        } else {
            EventData::Other(data)
        };

        Ok(Self {
            event_type,
            data,
            origin,
            time_fired: time_fired.unwrap_or_else(Utc::now),
            context: context.unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn state_changed(
        data: StateChangedData,
        origin: EventOrigin,
        time_fired: Option<DateTime<Utc>>,
        context: Option<Context>,
    ) -> Self {
        Self {
            event_type: EVENT_STATE_CHANGED.to_string(),
            data: EventData::StateChanged(data),
            origin,
            time_fired: time_fired.unwrap_or_else(Utc::now),
            context: context.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value, json};

    use super::{
        Context, EntityIdPolicy, Event, EventData, EventOrigin, State, StateChangedData,
        split_entity_id, valid_entity_id,
    };
    use crate::error::ModelError;

    #[test]
    fn origin_round_trips_through_its_tag() {
        for origin in [EventOrigin::Local, EventOrigin::Remote] {
            let parsed = origin.to_string().parse::<EventOrigin>();
            assert!(matches!(parsed, Ok(value) if value == origin));
        }
        assert!(matches!(
            "local".parse::<EventOrigin>(),
            Err(ModelError::InvalidOrigin(raw)) if raw == "local"
        ));
    }

    #[test]
    fn entity_id_validation_matches_slug_rules() {
        assert!(valid_entity_id("light.kitchen"));
        assert!(valid_entity_id("sensor.temp_2"));
        assert!(!valid_entity_id("light"));
        assert!(!valid_entity_id("Light.kitchen"));
        assert!(!valid_entity_id("light._kitchen"));
        assert!(!valid_entity_id("light.kitchen_"));
        assert!(!valid_entity_id("light.kit__chen"));
        assert!(!valid_entity_id("light.kitchen.extra"));
    }

    #[test]
    fn split_entity_id_tolerates_missing_separator() {
        assert_eq!(split_entity_id("light.kitchen"), ("light", "kitchen"));
        assert_eq!(split_entity_id("legacy"), ("legacy", ""));
    }

    #[test]
    fn strict_policy_rejects_invalid_ids_and_legacy_policy_accepts_them() {
        let strict = State::new(
            "Bad Id",
            "on",
            Map::new(),
            None,
            None,
            None,
            EntityIdPolicy::Strict,
        );
        assert!(matches!(strict, Err(ModelError::InvalidEntityId(_))));

        let legacy = State::new(
            "Bad Id",
            "on",
            Map::new(),
            None,
            None,
            None,
            EntityIdPolicy::LegacyBypass,
        );
        assert!(matches!(legacy, Ok(ref state) if state.domain == "Bad Id"));
    }

    #[test]
    fn overlong_state_is_rejected_under_either_policy() {
        let result = State::new(
            "sensor.long",
            "x".repeat(256),
            Map::new(),
            None,
            None,
            None,
            EntityIdPolicy::LegacyBypass,
        );
        assert!(matches!(result, Err(ModelError::InvalidState { .. })));
    }

    #[test]
    fn last_changed_defaults_to_last_updated() -> Result<(), ModelError> {
        let updated = chrono::Utc::now();
        let state = State::new(
            "light.kitchen",
            "on",
            Map::new(),
            None,
            Some(updated),
            None,
            EntityIdPolicy::Strict,
        )?;
        assert_eq!(state.last_changed, updated);
        Ok(())
    }

    #[test]
    fn dict_form_round_trips() -> Result<(), ModelError> {
        let mut attributes = Map::new();
        attributes.insert("brightness".to_string(), json!(180));
        let state = State::new(
            "light.kitchen",
            "on",
            attributes,
            None,
            None,
            Some(Context::with_ids(Some("ctx".to_string()), Some("user".to_string()))),
            EntityIdPolicy::Strict,
        )?;

        let restored = State::from_dict(&Value::Object(state.as_dict()), EntityIdPolicy::Strict)?;
        assert_eq!(restored, Some(state));
        Ok(())
    }

    #[test]
    fn dict_without_state_is_not_a_state() -> Result<(), ModelError> {
        let restored = State::from_dict(
            &json!({ "entity_id": "light.kitchen" }),
            EntityIdPolicy::Strict,
        )?;
        assert!(restored.is_none());
        Ok(())
    }

    #[test]
    fn state_changed_payload_keeps_extra_keys() -> Result<(), ModelError> {
        let map = json!({
            "entity_id": "light.kitchen",
            "old_state": null,
            "new_state": null,
            "source": "test"
        });
        let Value::Object(map) = map else {
            return Ok(());
        };
        let decoded = StateChangedData::from_map(map, EntityIdPolicy::LegacyBypass)?;
        let Some(decoded) = decoded else {
            assert!(false, "payload should decode");
            return Ok(());
        };
        assert_eq!(decoded.entity_id, "light.kitchen");
        assert!(decoded.old_state.is_none() && decoded.new_state.is_none());
        assert_eq!(decoded.extra.get("source"), Some(&json!("test")));
        Ok(())
    }

    #[test]
    fn state_changed_payload_with_broken_state_is_malformed() -> Result<(), ModelError> {
        let Value::Object(map) = json!({
            "entity_id": "light.kitchen",
            "new_state": "on"
        }) else {
            return Ok(());
        };
        let decoded = StateChangedData::from_map(map, EntityIdPolicy::LegacyBypass)?;
        assert!(decoded.is_none());
        Ok(())
    }

    #[test]
    fn serialized_state_matches_dict_form() -> Result<(), ModelError> {
        let state = State::new(
            "sensor.outside",
            "12.5",
            Map::from_iter([("unit_of_measurement".to_string(), json!("°C"))]),
            None,
            None,
            None,
            EntityIdPolicy::Strict,
        )?;
        assert_eq!(serde_json::to_value(&state)?, Value::Object(state.as_dict()));
        Ok(())
    }

    #[test]
    fn raw_state_changed_event_is_decoded() -> Result<(), ModelError> {
        let Value::Object(map) = json!({
            "entity_id": "light.kitchen",
            "new_state": {
                "entity_id": "light.kitchen",
                "state": "on",
                "attributes": { "icon": "x", "brightness": 3 }
            }
        }) else {
            return Ok(());
        };
        let event = Event::new("state_changed", map, EventOrigin::Local, None, None)?;
        let EventData::StateChanged(data) = event.data else {
            assert!(false, "state_changed payload should be decoded");
            return Ok(());
        };
        assert!(data.old_state.is_none());
        assert_eq!(data.key_order(), ["entity_id", "new_state"]);
        assert_eq!(data.new_state.map(|state| state.state).as_deref(), Some("on"));
        Ok(())
    }

    #[test]
    fn raw_state_changed_event_without_entity_id_is_rejected() {
        let Value::Object(map) = json!({ "new_state": null }) else {
            return;
        };
        let event = Event::new("state_changed", map, EventOrigin::Local, None, None);
        assert!(matches!(
            event,
            Err(ModelError::MalformedEventData(kind)) if kind == "state_changed"
        ));
    }
}

//! Attribute filtering applied before anything reaches the database.

use serde_json::{Map, Value};

use crate::domain::{State, StateChangedData};

/// Attribute keys that are derivable elsewhere and not worth storing per row.
///
/// `unit_of_measurement` and `friendly_name` stay: history rendering reads
/// them from every stored row, so they are kept despite the storage cost.
pub const KEYS_TO_FILTER_FROM_DB: [&str; 7] = [
    "entity_id",
    "area_id",
    "entity_picture",
    "hidden",
    "icon",
    "device_class",
    "editable",
];

#[must_use]
pub fn filter_attributes(unfiltered: &Map<String, Value>) -> Map<String, Value> {
    unfiltered
        .iter()
        .filter(|(key, _)| !KEYS_TO_FILTER_FROM_DB.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Build the stored payload of a `state_changed` event.
///
/// Embedded states are flattened to their dict form with filtered attributes
/// so the dropped keys are not kept a second time inside the event row. Keys
/// keep their fired order, and a state key that was never fired stays absent
/// unless a state was set on it afterwards.
#[must_use]
pub fn filter_state_change_event_data(data: &StateChangedData) -> Map<String, Value> {
    let mut filtered = Map::new();
    for key in data.key_order() {
        if let Some(value) = payload_value(data, key) {
            filtered.insert(key.clone(), value);
        }
    }

    if !filtered.contains_key("entity_id") {
        filtered.insert("entity_id".to_string(), Value::from(data.entity_id.clone()));
    }
    for (key, state) in [("old_state", &data.old_state), ("new_state", &data.new_state)] {
        if state.is_some() && !filtered.contains_key(key) {
            filtered.insert(key.to_string(), filtered_state_dict(state.as_ref()));
        }
    }
    for (key, value) in &data.extra {
        if !filtered.contains_key(key) {
            filtered.insert(key.clone(), value.clone());
        }
    }
    filtered
}

fn payload_value(data: &StateChangedData, key: &str) -> Option<Value> {
    match key {
        "entity_id" => Some(Value::from(data.entity_id.clone())),
        "old_state" => Some(filtered_state_dict(data.old_state.as_ref())),
        "new_state" => Some(filtered_state_dict(data.new_state.as_ref())),
        other => data.extra.get(other).cloned(),
    }
}

fn filtered_state_dict(state: Option<&State>) -> Value {
    let Some(state) = state else {
        return Value::Null;
    };
    let mut dict = state.as_dict();
    dict.insert(
        "attributes".to_string(),
        Value::Object(filter_attributes(&state.attributes)),
    );
    Value::Object(dict)
}

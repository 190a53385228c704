//! Player Records
//!
//! The shared unit of presence: one record under `online_players/{identity}`.
//! Decoding is lenient because records come from other clients; encoding
//! always stamps `lastUpdated` with the server-timestamp sentinel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::grid::{Facing, GridPos};
use crate::store::server_timestamp;

/// One player's published state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    /// Human-readable label.
    pub display_name: String,
    /// Grid cell.
    pub position: GridPos,
    /// Last direction of intended movement.
    pub facing: Facing,
    /// Whether the owner reports a transition between cells.
    pub is_moving: bool,
    /// Server timestamp of the last write (ms since epoch).
    pub last_updated: i64,
    /// Active chat bubble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_message: Option<String>,
}

impl PlayerRecord {
    /// Decode a record written by another client.
    ///
    /// Returns `None` when `value` is not an object or has no `position`
    /// object. Other fields fall back to defaults: coordinates to 0 (floats
    /// truncated), facing to down, the flag to false, the timestamp to 0.
    pub fn from_store(value: &Value) -> Option<PlayerRecord> {
        let record = value.as_object()?;
        let position = record.get("position")?.as_object()?;

        let chat_message = record
            .get("chatMessage")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        Some(PlayerRecord {
            display_name: record
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            position: GridPos::new(coordinate(position.get("x")), coordinate(position.get("y"))),
            facing: record
                .get("facing")
                .and_then(Value::as_str)
                .and_then(Facing::parse)
                .unwrap_or_default(),
            is_moving: record.get("isMoving").and_then(Value::as_bool).unwrap_or(false),
            last_updated: record.get("lastUpdated").map(timestamp).unwrap_or(0),
            chat_message,
        })
    }
}

fn coordinate(value: Option<&Value>) -> i32 {
    match value {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            // `as` saturates and maps NaN to 0.
            None => n.as_f64().map(|f| f.trunc() as i32).unwrap_or(0),
        },
        _ => 0,
    }
}

fn timestamp(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

/// Full record for the initial write of a session.
pub fn initial_value(display_name: &str, position: GridPos, facing: Facing) -> Value {
    json!({
        "displayName": display_name,
        "position": position,
        "facing": facing,
        "isMoving": false,
        "lastUpdated": server_timestamp(),
    })
}

/// Merge patch for a movement or facing change.
pub fn state_patch(position: GridPos, facing: Facing, is_moving: bool) -> Value {
    json!({
        "position": position,
        "facing": facing,
        "isMoving": is_moving,
        "lastUpdated": server_timestamp(),
    })
}

/// Merge patch that only refreshes `lastUpdated`.
pub fn keep_alive_patch() -> Value {
    json!({ "lastUpdated": server_timestamp() })
}

/// Merge patch setting (`Some`) or clearing (`None`) the chat bubble.
pub fn chat_patch(text: Option<&str>) -> Value {
    let mut patch = Map::new();
    patch.insert("chatMessage".into(), text.map_or(Value::Null, Value::from));
    patch.insert("lastUpdated".into(), server_timestamp());
    Value::Object(patch)
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub const FIELD_MAX_WIDTH: f32 = 4000.0;
pub const FIELD_MAX_HEIGHT: f32 = 4000.0;
pub const SPAWN_X: f32 = 2000.0;
pub const SPAWN_Y: f32 = 2000.0;
pub const PLAYER_SPEED: f32 = 12.0;
pub const VELOCITY_DECAY: f32 = 0.9;
pub const PICKUP_RADIUS: f32 = 40.0;
pub const MAX_NAME_LEN: usize = 16;
pub const DEFAULT_NAME: &str = "unknown";
pub const DEFAULT_INSTANCE: &str = "game1";
pub const TICK_MILLIS: u64 = 50;
pub const HEARTBEAT_MILLIS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub const ZERO: Vector2 = Vector2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vector2) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Rounds both components to two decimal places for the wire.
    pub fn rounded(&self) -> Vector2 {
        Vector2 {
            x: round_hundredths(self.x),
            y: round_hundredths(self.y),
        }
    }
}

pub fn round_hundredths(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Short opaque player identity handed out by a gateway on connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What every client sees of a player in a `player_state` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub identity: PlayerId,
    pub name: String,
    pub position: Vector2,
}

/// A static collectible placed on the field when the instance starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: u32,
    pub position: Vector2,
    pub label: String,
}

/// Truncates a user supplied display name, falling back to the placeholder
/// when nothing printable is left.
pub fn sanitize_name(name: &str) -> String {
    let truncated: String = name.chars().take(MAX_NAME_LEN).collect();
    if truncated.trim().is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// How `movement` payloads are interpreted and how players are integrated.
/// Chosen once per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionModel {
    /// Four direction keys, each snapping one velocity axis to full speed.
    #[default]
    Impulse,
    /// A single heading angle in radians driving constant-speed motion.
    Heading,
}

impl MotionModel {
    /// Decodes a `movement` payload for this model. Returns `None` for any
    /// payload that does not have the shape this model expects.
    pub fn parse_movement(&self, payload: &Value) -> Option<MovementUpdate> {
        match self {
            MotionModel::Impulse => {
                let key = KeyPayload::deserialize(payload).ok()?;
                Some(MovementUpdate::Key {
                    direction: key.direction,
                    pressed: key.pressed.is_pressed(),
                })
            }
            MotionModel::Heading => {
                let heading = HeadingPayload::deserialize(payload).ok()?;
                heading
                    .angle
                    .is_finite()
                    .then_some(MovementUpdate::Heading {
                        angle: heading.angle,
                    })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MovementUpdate {
    Key { direction: Direction, pressed: bool },
    Heading { angle: f32 },
}

#[derive(Deserialize)]
struct KeyPayload {
    #[serde(alias = "dir")]
    direction: Direction,
    pressed: Pressed,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Pressed {
    Flag(bool),
    Code(i64),
}

impl Pressed {
    fn is_pressed(&self) -> bool {
        match self {
            Pressed::Flag(flag) => *flag,
            Pressed::Code(code) => *code == 1,
        }
    }
}

#[derive(Deserialize)]
struct HeadingPayload {
    angle: f32,
}

/// Server to client envelope: `{"code": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Register {
        identity: PlayerId,
    },
    ProblemState {
        objects: Vec<Problem>,
    },
    PlayerState {
        players: HashMap<PlayerId, PlayerView>,
    },
    Ping {
        ping: u64,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Client to server envelope. The `movement` payload is kept raw because its
/// shape depends on the instance's [`MotionModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Movement(Value),
    SetName { name: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;

    #[test]
    fn test_vector_distance() {
        let a = Vector2::new(100.0, 100.0);
        let b = Vector2::new(130.0, 140.0);
        assert_approx_eq!(a.distance(&b), 50.0, 0.0001);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_vector_rounding() {
        let v = Vector2::new(12.3456, -7.0862);
        let r = v.rounded();
        assert_approx_eq!(r.x, 12.35, 0.0001);
        assert_approx_eq!(r.y, -7.09, 0.0001);
    }

    #[test]
    fn test_sanitize_name_truncates() {
        let name = sanitize_name("a_very_long_name_over_sixteen_chars");
        assert_eq!(name.chars().count(), MAX_NAME_LEN);
        assert_eq!(name, "a_very_long_name");
    }

    #[test]
    fn test_sanitize_name_counts_characters_not_bytes() {
        let name = sanitize_name("ééééééééééééééééééé");
        assert_eq!(name.chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_sanitize_name_blank_falls_back() {
        assert_eq!(sanitize_name(""), DEFAULT_NAME);
        assert_eq!(sanitize_name("   "), DEFAULT_NAME);
        assert_eq!(sanitize_name("ada"), "ada");
    }

    #[test]
    fn test_register_envelope_shape() {
        let message = ServerMessage::Register {
            identity: PlayerId::new("3f2a9c1b"),
        };
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"code": "register", "payload": {"identity": "3f2a9c1b"}})
        );
    }

    #[test]
    fn test_player_state_envelope_shape() {
        let id = PlayerId::new("abc");
        let mut players = HashMap::new();
        players.insert(
            id.clone(),
            PlayerView {
                identity: id,
                name: "ada".to_string(),
                position: Vector2::new(112.0, 100.5),
            },
        );
        let message = ServerMessage::PlayerState { players };
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["code"], "player_state");
        let player = &value["payload"]["players"]["abc"];
        assert_eq!(player["identity"], "abc");
        assert_eq!(player["name"], "ada");
        assert_eq!(player["position"]["x"], 112.0);
        assert_eq!(player["position"]["y"], 100.5);
    }

    #[test]
    fn test_ping_and_problem_envelopes() {
        let ping: Value =
            serde_json::from_str(&ServerMessage::Ping { ping: 17 }.to_json().unwrap()).unwrap();
        assert_eq!(ping, json!({"code": "ping", "payload": {"ping": 17}}));

        let problems = ServerMessage::ProblemState {
            objects: vec![Problem {
                id: 3,
                position: Vector2::new(10.0, 20.0),
                label: "4 + 5".to_string(),
            }],
        };
        let value: Value = serde_json::from_str(&problems.to_json().unwrap()).unwrap();
        assert_eq!(value["code"], "problem_state");
        assert_eq!(value["payload"]["objects"][0]["id"], 3);
        assert_eq!(value["payload"]["objects"][0]["label"], "4 + 5");
    }

    #[test]
    fn test_client_message_decoding() {
        let set_name = ClientMessage::from_json(r#"{"code":"set_name","payload":{"name":"ada"}}"#)
            .unwrap();
        assert_eq!(
            set_name,
            ClientMessage::SetName {
                name: "ada".to_string()
            }
        );

        let movement = ClientMessage::from_json(
            r#"{"code":"movement","payload":{"pressed":1,"direction":"up"}}"#,
        )
        .unwrap();
        assert!(matches!(movement, ClientMessage::Movement(_)));
    }

    #[test]
    fn test_client_message_rejects_malformed() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"code":"teleport","payload":{}}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"code":"set_name","payload":{}}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"code":"set_name","payload":{"name":5}}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"payload":{"name":"ada"}}"#).is_err());
    }

    #[test]
    fn test_impulse_movement_parsing() {
        let model = MotionModel::Impulse;

        assert_eq!(
            model.parse_movement(&json!({"pressed": true, "direction": "left"})),
            Some(MovementUpdate::Key {
                direction: Direction::Left,
                pressed: true
            })
        );
        assert_eq!(
            model.parse_movement(&json!({"pressed": 1, "dir": "down"})),
            Some(MovementUpdate::Key {
                direction: Direction::Down,
                pressed: true
            })
        );
        assert_eq!(
            model.parse_movement(&json!({"pressed": 0, "dir": "down"})),
            Some(MovementUpdate::Key {
                direction: Direction::Down,
                pressed: false
            })
        );
        assert_eq!(model.parse_movement(&json!({"pressed": true})), None);
        assert_eq!(
            model.parse_movement(&json!({"pressed": true, "direction": "north"})),
            None
        );
        assert_eq!(model.parse_movement(&json!({"angle": 1.0})), None);
    }

    #[test]
    fn test_heading_movement_parsing() {
        let model = MotionModel::Heading;

        match model.parse_movement(&json!({"angle": 1.5})) {
            Some(MovementUpdate::Heading { angle }) => assert_approx_eq!(angle, 1.5, 0.0001),
            other => panic!("Unexpected update {:?}", other),
        }
        assert_eq!(model.parse_movement(&json!({"angle": "left"})), None);
        assert_eq!(
            model.parse_movement(&json!({"pressed": true, "direction": "up"})),
            None
        );
        assert_eq!(model.parse_movement(&json!({"angle": 1e300})), None);
    }
}

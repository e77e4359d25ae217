// Core types for recorded playlogs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Event code of an application message event
pub const EVENT_CODE_MESSAGE: u64 = 32;
/// Event code of a pointer-down event
pub const EVENT_CODE_POINT_DOWN: u64 = 33;
/// Event code of a pointer-move event
pub const EVENT_CODE_POINT_MOVE: u64 = 34;
/// Event code of a pointer-up event
pub const EVENT_CODE_POINT_UP: u64 = 35;

/// Message payload `type` used by scenario commands
pub const SCENARIO_MESSAGE_TYPE: &str = "scenario";

/// A 2D offset or position in content coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One event inside a tick
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Pointer pressed at an absolute position
    PointDown { pointer_id: i64, position: Point },

    /// Pointer moved; `position` is the press position and `start_delta` the
    /// offset travelled since the press
    PointMove {
        pointer_id: i64,
        position: Point,
        start_delta: Point,
    },

    /// Pointer released; coordinates are stored like [`Event::PointMove`]
    PointUp {
        pointer_id: i64,
        position: Point,
        start_delta: Point,
    },

    /// Application message with an arbitrary JSON payload
    Message { data: Value },

    /// Any event code the harness does not act on
    Other { code: u64 },
}

impl Event {
    /// Decode the scenario command carried by a message event, if any
    pub fn scenario_command(&self) -> Option<ScenarioCommand> {
        match self {
            Event::Message { data } => ScenarioCommand::from_message_data(data),
            _ => None,
        }
    }

    /// Absolute position a pointer handler should receive for this event
    pub fn pointer_target(&self) -> Option<Point> {
        match self {
            Event::PointDown { position, .. } => Some(*position),
            Event::PointMove {
                position,
                start_delta,
                ..
            }
            | Event::PointUp {
                position,
                start_delta,
                ..
            } => Some(Point::new(
                position.x + start_delta.x,
                position.y + start_delta.y,
            )),
            _ => None,
        }
    }
}

/// Commands a scenario message can carry
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioCommand {
    /// Tells the in-content helper where to send its output
    Init { options: Value },
    /// Capture the screen under the given file name
    Screenshot { file_name: String },
    /// The scenario is over
    Finish,
}

impl ScenarioCommand {
    /// Decode `{ "type": "scenario", "command": { "name": ..., "options": ... } }`
    pub fn from_message_data(data: &Value) -> Option<Self> {
        if data.get("type").and_then(Value::as_str) != Some(SCENARIO_MESSAGE_TYPE) {
            return None;
        }
        let command = data.get("command")?;
        match command.get("name").and_then(Value::as_str)? {
            "init" => Some(ScenarioCommand::Init {
                options: command.get("options").cloned().unwrap_or(Value::Null),
            }),
            "screenshot" => {
                let file_name = command
                    .get("options")
                    .and_then(|o| o.get("fileName"))
                    .and_then(Value::as_str)?;
                Some(ScenarioCommand::Screenshot {
                    file_name: file_name.to_string(),
                })
            }
            "finish" => Some(ScenarioCommand::Finish),
            _ => None,
        }
    }

    /// Encode as a message payload
    pub fn to_message_data(&self) -> Value {
        let command = match self {
            ScenarioCommand::Init { options } => {
                serde_json::json!({ "name": "init", "options": options })
            }
            ScenarioCommand::Screenshot { file_name } => {
                serde_json::json!({ "name": "screenshot", "options": { "fileName": file_name } })
            }
            ScenarioCommand::Finish => serde_json::json!({ "name": "finish" }),
        };
        serde_json::json!({ "type": SCENARIO_MESSAGE_TYPE, "command": command })
    }
}

/// A frame-indexed slot in the log
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Frame (game age) at which the events fire
    pub frame: u64,
    /// Events in log order
    pub events: Vec<Event>,
}

/// The tick list of a playlog
#[derive(Debug, Clone, PartialEq)]
pub struct TickList {
    /// First age covered by the log
    pub age_from: u64,
    /// Last age covered by the log
    pub age_to: u64,
    /// Ticks that carry events, in non-decreasing frame order
    pub ticks: Vec<Tick>,
}

/// A recorded starting point of the play
#[derive(Debug, Clone, PartialEq)]
pub struct StartPoint {
    pub frame: u64,
    /// Wall-clock timestamp of the start point (milliseconds)
    pub timestamp: f64,
    /// Frames per second of the content
    pub fps: Option<f64>,
}

/// Result type for playlog operations
pub type PlaylogResult<T> = Result<T, PlaylogError>;

/// Error types for playlog operations
#[derive(Debug, Error)]
pub enum PlaylogError {
    /// I/O error reading or writing a playlog
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON
    #[error("Invalid playlog JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON that does not have the playlog shape
    #[error("Malformed playlog: {0}")]
    Malformed(String),

    /// The first start point carries no positive fps
    #[error("Playlog has no positive fps in its first start point")]
    MissingFps,

    /// The fps gives a frame span that is zero or does not fit a `Duration`
    #[error("Playlog fps {0} does not give a usable frame duration")]
    UnusableFps(f64),

    /// A tick is earlier than the tick before it
    #[error("Tick at frame {frame} follows a tick at frame {previous}")]
    UnorderedTicks { previous: u64, frame: u64 },
}

/// Duration of one frame at `fps`
pub fn frame_duration(fps: f64) -> PlaylogResult<Duration> {
    frames_duration(1.0, fps)
}

/// Duration of `frames` frames at `fps`; zero or overflowing spans are rejected
pub fn frames_duration(frames: f64, fps: f64) -> PlaylogResult<Duration> {
    Duration::try_from_secs_f64(frames / fps)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or(PlaylogError::UnusableFps(fps))
}

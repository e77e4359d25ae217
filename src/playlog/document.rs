//! Loading, inspecting and rewriting playlog JSON documents.
//!
//! A playlog is stored as positional JSON arrays:
//!
//! ```text
//! { "tickList": [ageFrom, ageTo, [[frame, [event, ...]?, storage?], ...]?],
//!   "startPoints": [{ "frame": 0, "timestamp": 0, "data": { "fps": 30, ... } }] }
//! ```
//!
//! Events are arrays whose first element is the event code. Pointer events keep
//! the pointer id at index 3 and the press position at 4/5; move and up events
//! additionally store the offset from the press position at 6/7. Message events
//! keep their payload at index 3.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::types::{
    EVENT_CODE_MESSAGE, EVENT_CODE_POINT_DOWN, EVENT_CODE_POINT_MOVE, EVENT_CODE_POINT_UP, Event,
    PlaylogError, PlaylogResult, Point, ScenarioCommand, StartPoint, Tick, TickList,
    frame_duration, frames_duration,
};

/// Player id stamped on messages the harness adds to a playlog
const HARNESS_PLAYER_ID: &str = "engine-files-reftest-player-id";

/// A parsed playlog, keeping the original document for rewriting
#[derive(Debug, Clone)]
pub struct Playlog {
    /// Decoded tick list
    pub tick_list: TickList,
    /// Decoded start points
    pub start_points: Vec<StartPoint>,
    raw: Value,
}

impl Playlog {
    /// Read and parse a playlog file
    ///
    /// The file is read fresh on every call so that a rewritten copy never
    /// leaks into a later run.
    pub fn load(path: &Path) -> PlaylogResult<Self> {
        let text = fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&text)?;
        Self::from_value(raw)
    }

    /// Parse a playlog from an already decoded JSON document
    pub fn from_value(raw: Value) -> PlaylogResult<Self> {
        let tick_list = raw
            .get("tickList")
            .ok_or_else(|| PlaylogError::Malformed("missing tickList".to_string()))
            .and_then(parse_tick_list)?;
        let start_points = match raw.get("startPoints") {
            Some(Value::Array(points)) => points
                .iter()
                .map(parse_start_point)
                .collect::<PlaylogResult<Vec<_>>>()?,
            Some(_) => {
                return Err(PlaylogError::Malformed(
                    "startPoints is not an array".to_string(),
                ));
            }
            None => Vec::new(),
        };
        Ok(Self {
            tick_list,
            start_points,
            raw,
        })
    }

    /// Frames per second recorded in the first start point
    pub fn fps(&self) -> PlaylogResult<f64> {
        self.start_points
            .first()
            .and_then(|p| p.fps)
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .ok_or(PlaylogError::MissingFps)
    }

    /// Length of one frame of the content
    pub fn frame_duration(&self) -> PlaylogResult<Duration> {
        frame_duration(self.fps()?)
    }

    /// Time the content needs to play the whole log once
    ///
    /// Measured from the first start point up to the last age the tick list
    /// covers, whichever of `ageTo` or the last event tick is later.
    pub fn finished_time(&self) -> PlaylogResult<Duration> {
        let fps = self.fps()?;
        let start_frame = self.start_points.first().map(|p| p.frame).unwrap_or(0);
        let last_frame = self
            .tick_list
            .ticks
            .last()
            .map(|t| t.frame)
            .unwrap_or(0)
            .max(self.tick_list.age_to);
        let frames = last_frame.saturating_sub(start_frame) + 1;
        frames_duration(frames as f64, fps)
    }

    /// Number of screenshot commands in the log
    pub fn screenshot_count(&self) -> usize {
        self.tick_list
            .ticks
            .iter()
            .flat_map(|t| &t.events)
            .filter(|e| matches!(e.scenario_command(), Some(ScenarioCommand::Screenshot { .. })))
            .count()
    }

    /// Return a copy of the document with an `init` scenario command added to
    /// frame 0, creating that tick when it does not exist yet
    pub fn with_init_command(&self, options: Value) -> Value {
        let event = Value::Array(vec![
            Value::from(EVENT_CODE_MESSAGE),
            Value::from(0),
            Value::from(HARNESS_PLAYER_ID),
            ScenarioCommand::Init { options }.to_message_data(),
        ]);

        let mut doc = self.raw.clone();
        if let Some(Value::Array(tick_list)) = doc.get_mut("tickList") {
            push_init_event(tick_list, event);
        }
        doc
    }

    /// Write [`Playlog::with_init_command`] into `dir` and return the new path
    pub fn write_with_init_command(&self, options: Value, dir: &Path) -> PlaylogResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "playlog_{}.json",
            chrono::Utc::now().timestamp_millis()
        ));
        fs::write(&path, serde_json::to_string(&self.with_init_command(options))?)?;
        debug!(path = %path.display(), "wrote playlog with init command");
        Ok(path)
    }
}

fn push_init_event(tick_list: &mut Vec<Value>, event: Value) {
    while tick_list.len() < 3 {
        tick_list.push(Value::Null);
    }
    if !tick_list[2].is_array() {
        tick_list[2] = Value::Array(Vec::new());
    }
    let Value::Array(ticks) = &mut tick_list[2] else {
        return;
    };
    let first_is_zero = ticks
        .first()
        .and_then(|t| t.get(0))
        .and_then(Value::as_u64)
        == Some(0);
    if !first_is_zero {
        ticks.insert(0, Value::Array(vec![Value::from(0), Value::Array(vec![event])]));
        return;
    }
    if let Value::Array(tick) = &mut ticks[0] {
        if tick.len() < 2 || !tick[1].is_array() {
            tick.resize(tick.len().max(2), Value::Null);
            tick[1] = Value::Array(Vec::new());
        }
        if let Value::Array(events) = &mut tick[1] {
            events.push(event);
        }
    }
}

fn parse_tick_list(value: &Value) -> PlaylogResult<TickList> {
    let items = value
        .as_array()
        .ok_or_else(|| PlaylogError::Malformed("tickList is not an array".to_string()))?;
    let age_from = items.first().and_then(Value::as_u64).unwrap_or(0);
    let age_to = items.get(1).and_then(Value::as_u64).unwrap_or(age_from);

    let mut ticks: Vec<Tick> = Vec::new();
    if let Some(Value::Array(raw_ticks)) = items.get(2) {
        for raw in raw_ticks {
            let tick = parse_tick(raw)?;
            if let Some(previous) = ticks.last().map(|t| t.frame) {
                if tick.frame < previous {
                    return Err(PlaylogError::UnorderedTicks {
                        previous,
                        frame: tick.frame,
                    });
                }
            }
            ticks.push(tick);
        }
    }

    Ok(TickList {
        age_from,
        age_to,
        ticks,
    })
}

fn parse_tick(value: &Value) -> PlaylogResult<Tick> {
    let items = value
        .as_array()
        .ok_or_else(|| PlaylogError::Malformed("tick is not an array".to_string()))?;
    let frame = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| PlaylogError::Malformed("tick has no frame".to_string()))?;
    let events = match items.get(1) {
        Some(Value::Array(events)) => events
            .iter()
            .map(parse_event)
            .collect::<PlaylogResult<Vec<_>>>()?,
        _ => Vec::new(),
    };
    Ok(Tick { frame, events })
}

fn parse_event(value: &Value) -> PlaylogResult<Event> {
    let items = value
        .as_array()
        .ok_or_else(|| PlaylogError::Malformed("event is not an array".to_string()))?;
    let code = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| PlaylogError::Malformed("event has no code".to_string()))?;

    let number = |index: usize, what: &str| -> PlaylogResult<f64> {
        items.get(index).and_then(Value::as_f64).ok_or_else(|| {
            PlaylogError::Malformed(format!("event {} is missing {}", code, what))
        })
    };
    let pointer_id = || items.get(3).and_then(Value::as_i64).unwrap_or(0);

    let event = match code {
        EVENT_CODE_MESSAGE => Event::Message {
            data: items.get(3).cloned().unwrap_or(Value::Null),
        },
        EVENT_CODE_POINT_DOWN => Event::PointDown {
            pointer_id: pointer_id(),
            position: Point::new(number(4, "x")?, number(5, "y")?),
        },
        EVENT_CODE_POINT_MOVE | EVENT_CODE_POINT_UP => {
            let position = Point::new(number(4, "x")?, number(5, "y")?);
            let start_delta = Point::new(number(6, "startDeltaX")?, number(7, "startDeltaY")?);
            if code == EVENT_CODE_POINT_MOVE {
                Event::PointMove {
                    pointer_id: pointer_id(),
                    position,
                    start_delta,
                }
            } else {
                Event::PointUp {
                    pointer_id: pointer_id(),
                    position,
                    start_delta,
                }
            }
        }
        other => Event::Other { code: other },
    };
    Ok(event)
}

fn parse_start_point(value: &Value) -> PlaylogResult<StartPoint> {
    if !value.is_object() {
        return Err(PlaylogError::Malformed(
            "start point is not an object".to_string(),
        ));
    }
    Ok(StartPoint {
        frame: value.get("frame").and_then(Value::as_u64).unwrap_or(0),
        timestamp: value.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
        fps: value
            .get("data")
            .and_then(|d| d.get("fps"))
            .and_then(Value::as_f64),
    })
}

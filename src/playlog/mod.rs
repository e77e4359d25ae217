pub mod document;
pub mod types;

pub use document::Playlog;
pub use types::{
    Event, PlaylogError, PlaylogResult, Point, ScenarioCommand, StartPoint, Tick, TickList,
    frame_duration, frames_duration,
};

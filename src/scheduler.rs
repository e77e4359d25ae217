//! Real-time replay of a playlog against injected action handlers.
//!
//! A virtual frame counter starts at 0 and advances once per frame period
//! (`1 / fps`). When the counter reaches the frame of the next pending tick,
//! that tick's events are dispatched in log order. Handler futures are never
//! awaited inline: they are collected in a pending set that is polled
//! alongside the frame timer and drained once the log is exhausted, so a slow
//! screenshot never holds the virtual clock back.
//!
//! The scheduler has no deadline of its own; wrap it in
//! [`crate::timer::with_time_limit`] when one is needed.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::playlog::{Event, Playlog, PlaylogError, ScenarioCommand, Tick};

/// Actions the scheduler triggers while replaying a log.
///
/// Pointer coordinates are absolute content coordinates: move and up events
/// already have their start delta applied.
pub trait TickHandlers: Sync {
    /// Error produced by a handler
    type Error: std::error::Error + Send + Sync + 'static;

    fn point_down(&self, x: f64, y: f64) -> BoxFuture<'_, Result<(), Self::Error>>;

    fn point_move(&self, x: f64, y: f64) -> BoxFuture<'_, Result<(), Self::Error>>;

    fn point_up(&self, x: f64, y: f64) -> BoxFuture<'_, Result<(), Self::Error>>;

    /// Capture the screen and store it under `file_name`
    fn take_screenshot(&self, file_name: String) -> BoxFuture<'_, Result<(), Self::Error>>;
}

/// Error types for a replay
#[derive(Debug, Error)]
pub enum SchedulerError<E: std::error::Error + 'static> {
    /// The playlog cannot be replayed (e.g. it has no fps)
    #[error("Playlog error: {0}")]
    Playlog(#[from] PlaylogError),

    /// A handler failed; the first failure wins
    #[error("Handler error: {0}")]
    Handler(#[source] E),
}

/// Replay every tick of `playlog` through `handlers` in real time.
///
/// Resolves once the tick queue is exhausted and every handler future has
/// settled. Handler failures do not stop the clock; the first one is returned
/// after the drain.
pub async fn replay<H: TickHandlers>(
    playlog: &Playlog,
    handlers: &H,
) -> Result<(), SchedulerError<H::Error>> {
    let period = playlog.frame_duration()?;
    let mut queue: VecDeque<&Tick> = playlog.tick_list.ticks.iter().collect();
    let mut pending: FuturesUnordered<BoxFuture<'_, Result<(), H::Error>>> =
        FuturesUnordered::new();
    let mut first_error: Option<H::Error> = None;

    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut frame: u64 = 0;

    debug!(ticks = queue.len(), ?period, "starting replay");
    loop {
        tokio::select! {
            _ = timer.tick() => {
                if queue.is_empty() {
                    break;
                }
                while let Some(tick) = queue.front().copied().filter(|t| t.frame == frame) {
                    queue.pop_front();
                    trace!(frame, events = tick.events.len(), "dispatching tick");
                    for event in &tick.events {
                        if let Some(action) = dispatch(event, handlers) {
                            pending.push(action);
                        }
                    }
                }
                frame += 1;
            }
            Some(settled) = pending.next(), if !pending.is_empty() => {
                record(settled, &mut first_error);
            }
        }
    }

    while let Some(settled) = pending.next().await {
        record(settled, &mut first_error);
    }
    debug!(frames = frame, "replay finished");

    match first_error {
        Some(e) => Err(SchedulerError::Handler(e)),
        None => Ok(()),
    }
}

/// Map one event to the handler future it triggers, if any
fn dispatch<'a, H: TickHandlers>(
    event: &Event,
    handlers: &'a H,
) -> Option<BoxFuture<'a, Result<(), H::Error>>> {
    match event {
        Event::Message { .. } => match event.scenario_command()? {
            ScenarioCommand::Screenshot { file_name } => {
                debug!(%file_name, "screenshot");
                Some(handlers.take_screenshot(file_name))
            }
            _ => None,
        },
        Event::PointDown { .. } => {
            let p = event.pointer_target()?;
            Some(handlers.point_down(p.x, p.y))
        }
        Event::PointMove { .. } => {
            let p = event.pointer_target()?;
            Some(handlers.point_move(p.x, p.y))
        }
        Event::PointUp { .. } => {
            let p = event.pointer_target()?;
            Some(handlers.point_up(p.x, p.y))
        }
        Event::Other { .. } => None,
    }
}

fn record<E>(settled: Result<(), E>, first_error: &mut Option<E>) {
    if let Err(e) = settled {
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }
}

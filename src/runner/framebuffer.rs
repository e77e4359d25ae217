//! In-memory runtime for headless runs and tests.
//!
//! [`FramebufferDriver`] implements [`RuntimeDriver`] on top of a plain RGB
//! [`Framebuffer`]:
//! - `launch()` clears the screen to the background colour
//! - pointer presses paint a marker where they land, moves paint a dot
//! - `capture()` encodes the current screen as PNG
//!
//! Every call is recorded so a test can assert what the harness did.

use futures::future::BoxFuture;
use image::{Rgb, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::passive::RuntimeDriver;
use super::types::{RunnerError, RunnerResult};

/// Marker colour of a pointer press
pub const POINT_DOWN_COLOR: [u8; 3] = [255, 0, 0];
/// Marker colour of a pointer release
pub const POINT_UP_COLOR: [u8; 3] = [0, 0, 255];
/// Dot colour of a pointer move
pub const POINT_MOVE_COLOR: [u8; 3] = [0, 160, 0];

/// Half size of the square painted for presses and releases
const MARKER_RADIUS: u32 = 1;

/// A virtual RGB screen
#[derive(Debug, Clone)]
pub struct Framebuffer {
    image: RgbImage,
}

impl Framebuffer {
    /// Create a new framebuffer with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    /// Create a framebuffer initialized to a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(color)),
        }
    }

    /// Load a framebuffer from PNG image bytes
    pub fn from_png_bytes(data: &[u8]) -> RunnerResult<Self> {
        let img = image::load_from_memory(data)?;
        Ok(Self {
            image: img.to_rgb8(),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Draw a filled rectangle, clipped to the screen
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..y.saturating_add(h).min(self.height()) {
            for px in x..x.saturating_add(w).min(self.width()) {
                self.image.put_pixel(px, py, Rgb(color));
            }
        }
    }

    /// Colour of a pixel; black outside the screen
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel_checked(x, y).map(|p| p.0).unwrap_or([0, 0, 0])
    }

    /// Set the colour of a pixel; ignored outside the screen
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if let Some(p) = self.image.get_pixel_mut_checked(x, y) {
            *p = Rgb(color);
        }
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> RunnerResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }

    /// Paint a square marker centred on a content coordinate
    fn mark(&mut self, x: f64, y: f64, radius: u32, color: [u8; 3]) {
        let Some((cx, cy)) = self.to_pixel(x, y) else {
            return;
        };
        let left = cx.saturating_sub(radius);
        let top = cy.saturating_sub(radius);
        let side = radius * 2 + 1;
        self.draw_rect(left, top, side, side, color);
    }

    fn to_pixel(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return None;
        }
        let (px, py) = (x.round() as u32, y.round() as u32);
        (px < self.width() && py < self.height()).then_some((px, py))
    }
}

/// One call received by a [`FramebufferDriver`]
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Launch(PathBuf),
    PointDown { x: f64, y: f64 },
    PointMove { x: f64, y: f64 },
    PointUp { x: f64, y: f64 },
    Capture,
    Close,
}

#[derive(Debug)]
struct DriverState {
    screen: Option<Framebuffer>,
    launches: u32,
    calls: Vec<DriverCall>,
}

/// A [`RuntimeDriver`] drawing into an in-memory framebuffer
#[derive(Debug)]
pub struct FramebufferDriver {
    width: u32,
    height: u32,
    background: [u8; 3],
    stall_pointer: bool,
    state: Mutex<DriverState>,
}

impl FramebufferDriver {
    /// Driver with a white screen of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: [255, 255, 255],
            stall_pointer: false,
            state: Mutex::new(DriverState {
                screen: None,
                launches: 0,
                calls: Vec::new(),
            }),
        }
    }

    /// Set the colour the screen is cleared to on launch
    pub fn background(mut self, color: [u8; 3]) -> Self {
        self.background = color;
        self
    }

    /// Make pointer operations never complete, like a hung runtime
    pub fn stall_pointer(mut self, stall: bool) -> Self {
        self.stall_pointer = stall;
        self
    }

    /// Calls received so far, in order
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    /// How many times a content was launched
    pub fn launch_count(&self) -> u32 {
        self.lock().launches
    }

    /// Whether a content is currently running
    pub fn is_running(&self) -> bool {
        self.lock().screen.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pointer(
        &self,
        call: DriverCall,
        radius: u32,
        color: [u8; 3],
    ) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async move {
            let (x, y) = match call {
                DriverCall::PointDown { x, y }
                | DriverCall::PointMove { x, y }
                | DriverCall::PointUp { x, y } => (x, y),
                _ => return Ok(()),
            };
            {
                let mut state = self.lock();
                state.calls.push(call);
                let screen = state
                    .screen
                    .as_mut()
                    .ok_or_else(|| RunnerError::Capture("runtime is not running".to_string()))?;
                screen.mark(x, y, radius, color);
            }
            if self.stall_pointer {
                futures::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

impl RuntimeDriver for FramebufferDriver {
    fn launch<'a>(&'a self, content_dir: &'a Path) -> BoxFuture<'a, RunnerResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(DriverCall::Launch(content_dir.to_path_buf()));
            state.launches += 1;
            state.screen = Some(Framebuffer::with_color(
                self.width,
                self.height,
                self.background,
            ));
            debug!(content = %content_dir.display(), "framebuffer runtime launched");
            Ok(())
        })
    }

    fn point_down(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.pointer(DriverCall::PointDown { x, y }, MARKER_RADIUS, POINT_DOWN_COLOR)
    }

    fn point_move(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.pointer(DriverCall::PointMove { x, y }, 0, POINT_MOVE_COLOR)
    }

    fn point_up(&self, x: f64, y: f64) -> BoxFuture<'_, RunnerResult<()>> {
        self.pointer(DriverCall::PointUp { x, y }, MARKER_RADIUS, POINT_UP_COLOR)
    }

    fn capture(&self) -> BoxFuture<'_, RunnerResult<Vec<u8>>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(DriverCall::Capture);
            match &state.screen {
                Some(screen) => screen.to_png(),
                None => Err(RunnerError::Capture("runtime is not running".to_string())),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(DriverCall::Close);
            state.screen = None;
            Ok(())
        })
    }

    fn version_info(&self) -> String {
        format!("framebuffer@{}", env!("CARGO_PKG_VERSION"))
    }
}

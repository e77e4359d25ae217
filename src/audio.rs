//! Audio regression as an image.
//!
//! The audio a content plays is recorded by an [`AudioSource`] and drawn as a
//! waveform: every column of the image shows the min/max envelope of the
//! samples that fall into it. The image is compared like any screenshot, under
//! its own looser threshold since playback timing and volume vary between runs.

use futures::future::BoxFuture;
use image::{Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::runner::{AudioExtractor, ExecutionMode, RunnerResult, Screenshot};
use crate::timer::with_time_limit;

/// File name of the rendered waveform
pub const AUDIO_IMAGE_FILE_NAME: &str = "audio.png";

/// Default waveform size in pixels
pub const DEFAULT_WAVEFORM_SIZE: (u32, u32) = (800, 160);

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const WAVE: Rgb<u8> = Rgb([32, 96, 224]);

/// Records what a content plays as mono samples in `-1.0..=1.0`
pub trait AudioSource: Send + Sync {
    fn record<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
    ) -> BoxFuture<'a, RunnerResult<Vec<f32>>>;

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Renders the samples of an [`AudioSource`] into [`AUDIO_IMAGE_FILE_NAME`]
#[derive(Debug)]
pub struct WaveformAudioExtractor<S> {
    source: S,
    size: (u32, u32),
    time_limit: Duration,
}

impl<S: AudioSource> WaveformAudioExtractor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            size: DEFAULT_WAVEFORM_SIZE,
            time_limit: crate::config::content_time_limit(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    async fn extract(
        &self,
        content_dir: &Path,
        scenario_path: &Path,
        mode: ExecutionMode,
    ) -> RunnerResult<Screenshot> {
        let samples = with_time_limit(
            self.time_limit,
            "content did not end in time",
            self.source.record(content_dir, scenario_path, mode),
        )
        .await?;
        debug!(samples = samples.len(), "rendering waveform");
        let (width, height) = self.size;
        let image = render_waveform(&samples, width, height);
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        Ok(Screenshot::from_png(AUDIO_IMAGE_FILE_NAME, &png))
    }
}

impl<S: AudioSource> AudioExtractor for WaveformAudioExtractor<S> {
    fn run<'a>(
        &'a self,
        content_dir: &'a Path,
        scenario_path: &'a Path,
        mode: ExecutionMode,
    ) -> BoxFuture<'a, RunnerResult<Screenshot>> {
        Box::pin(self.extract(content_dir, scenario_path, mode))
    }

    fn dispose(&self) -> BoxFuture<'_, RunnerResult<()>> {
        self.source.dispose()
    }
}

/// Draw the min/max envelope of `samples` on a white image.
///
/// Silence renders as a flat line through the middle row. An empty or
/// degenerate image size yields an empty image.
pub fn render_waveform(samples: &[f32], width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    if width == 0 || height == 0 {
        return image;
    }
    let to_row = |v: f32| -> u32 {
        let v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
        let scaled = (1.0 - v) / 2.0 * (height - 1) as f32;
        scaled.round() as u32
    };

    for x in 0..width {
        let (lo, hi) = column_range(samples, x, width);
        let (min, max) = samples[lo..hi]
            .iter()
            .fold(None, |acc: Option<(f32, f32)>, &s| match acc {
                None => Some((s, s)),
                Some((min, max)) => Some((min.min(s), max.max(s))),
            })
            .unwrap_or((0.0, 0.0));
        for y in to_row(max)..=to_row(min) {
            image.put_pixel(x, y, WAVE);
        }
    }
    image
}

/// Sample range drawn into column `x`
fn column_range(samples: &[f32], x: u32, width: u32) -> (usize, usize) {
    let len = samples.len();
    let lo = len * x as usize / width as usize;
    let hi = (len * (x as usize + 1) / width as usize).max(lo + 1).min(len);
    (lo.min(hi), hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ToneSource(Vec<f32>);

    impl AudioSource for ToneSource {
        fn record<'a>(
            &'a self,
            _content_dir: &'a Path,
            _scenario_path: &'a Path,
            _mode: ExecutionMode,
        ) -> BoxFuture<'a, RunnerResult<Vec<f32>>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }
    }

    #[test]
    fn test_silence_is_a_flat_line() {
        let image = render_waveform(&[0.0; 100], 10, 9);
        for x in 0..10 {
            assert_eq!(*image.get_pixel(x, 4), WAVE);
            assert_eq!(*image.get_pixel(x, 0), BACKGROUND);
            assert_eq!(*image.get_pixel(x, 8), BACKGROUND);
        }
    }

    #[test]
    fn test_full_scale_fills_the_column() {
        let samples: Vec<f32> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let image = render_waveform(&samples, 4, 5);
        for y in 0..5 {
            assert_eq!(*image.get_pixel(0, y), WAVE);
        }
    }

    #[test]
    fn test_no_samples_and_zero_size() {
        let image = render_waveform(&[], 3, 3);
        assert_eq!(*image.get_pixel(1, 1), WAVE);
        assert_eq!(render_waveform(&[0.5], 0, 0).width(), 0);
    }

    #[tokio::test]
    async fn test_extractor_names_the_image() {
        let extractor = WaveformAudioExtractor::new(ToneSource(vec![0.25; 64])).with_size(8, 8);
        let shot = extractor
            .run(Path::new("."), Path::new("playlog.json"), ExecutionMode::Replay)
            .await
            .unwrap();
        assert_eq!(shot.file_name, AUDIO_IMAGE_FILE_NAME);
        let decoded = image::load_from_memory(&shot.decode().unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }
}

//! Comparing produced screenshots against the accepted ones.
//!
//! Two steps: the file sets of both directories must match exactly, then every
//! pair of PNGs is compared pixel by pixel. A pixel mismatches when its YIQ
//! colour distance exceeds a per-pixel tolerance (alpha is blended on white
//! first). The result per file is the mismatch ratio plus a diff image where
//! matching pixels are drawn as faded grayscale and mismatching ones in red.

use image::{ImageBuffer, Rgba, RgbaImage};
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::audio::AUDIO_IMAGE_FILE_NAME;
use crate::config::CompareSettings;

/// Maximum possible YIQ distance between two colours
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Opacity of matching pixels in the diff image
const DIFF_FADE_ALPHA: f64 = 0.1;

/// Colour of mismatching pixels in the diff image
const DIFF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Result of comparing one produced image with its expected counterpart
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// Ratio of mismatching pixels, `0.0..=1.0`
    pub difference: f64,
    /// PNG-encoded diff visualisation
    #[serde(skip)]
    pub content: Vec<u8>,
    pub target_path: PathBuf,
    pub expected_path: PathBuf,
}

impl FileDiff {
    /// File name of the compared image
    pub fn file_name(&self) -> String {
        self.target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Result type for comparisons
pub type CompareResult<T> = Result<T, CompareError>;

/// Error types for comparisons
#[derive(Debug, Error)]
pub enum CompareError {
    /// The directories do not hold the same file names
    #[error(
        "expected file set are not same as output file set\n - unmatched expected files : {}\n - unmatched output files : {}",
        missing.join(","),
        extra.join(",")
    )]
    FileSetMismatch {
        /// Expected files with no produced counterpart
        missing: Vec<String>,
        /// Produced files with no expected counterpart
        extra: Vec<String>,
    },

    /// The two images of a pair have different dimensions
    #[error("Image sizes do not match for {}: expected {expected:?}, got {actual:?}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot decode {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Names only in `a` and names only in `b`, each sorted.
///
/// Both inputs are sorted and merged in one linear pass.
pub fn diff_strings_each_other(a: &[String], b: &[String]) -> (Vec<String>, Vec<String>) {
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();

    let (mut only_a, mut only_b) = (Vec::new(), Vec::new());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) if x < y => {
                only_a.push((*x).clone());
                i += 1;
            }
            (Some(x), Some(y)) if x > y => {
                only_b.push((*y).clone());
                j += 1;
            }
            (Some(_), Some(_)) => {
                i += 1;
                j += 1;
            }
            (Some(x), None) => {
                only_a.push((*x).clone());
                i += 1;
            }
            (None, Some(y)) => {
                only_b.push((*y).clone());
                j += 1;
            }
            (None, None) => break,
        }
    }
    (only_a, only_b)
}

/// Compare every file of `expected_dir` with the same-named file of
/// `actual_dir`, using the configured per-pixel tolerance
pub fn diff_directory(expected_dir: &Path, actual_dir: &Path) -> CompareResult<Vec<FileDiff>> {
    diff_directory_with_threshold(
        expected_dir,
        actual_dir,
        crate::config::compare_settings().pixel_threshold,
    )
}

/// [`diff_directory`] with an explicit per-pixel tolerance
///
/// Fails without comparing anything when the file sets differ.
pub fn diff_directory_with_threshold(
    expected_dir: &Path,
    actual_dir: &Path,
    pixel_threshold: f64,
) -> CompareResult<Vec<FileDiff>> {
    info!(
        expected = %expected_dir.display(),
        actual = %actual_dir.display(),
        "checking differences"
    );
    let expected_files = list_files(expected_dir)?;
    let actual_files = list_files(actual_dir)?;
    let (missing, extra) = diff_strings_each_other(&expected_files, &actual_files);
    if !missing.is_empty() || !extra.is_empty() {
        return Err(CompareError::FileSetMismatch { missing, extra });
    }

    let mut diffs = Vec::with_capacity(expected_files.len());
    for name in &expected_files {
        let diff = verify_image(&expected_dir.join(name), &actual_dir.join(name), pixel_threshold)?;
        debug!(file = %name, difference = diff.difference, "validated");
        diffs.push(diff);
    }
    Ok(diffs)
}

/// Sorted names of the regular files in `dir`
fn list_files(dir: &Path) -> CompareResult<Vec<String>> {
    let io_err = |source| CompareError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Compare one produced PNG against its expected counterpart
pub fn verify_image(
    expected_path: &Path,
    target_path: &Path,
    pixel_threshold: f64,
) -> CompareResult<FileDiff> {
    let expected = load_rgba(expected_path)?;
    let actual = load_rgba(target_path)?;
    let (mismatched, diff_image) =
        compare_images(&expected, &actual, pixel_threshold).map_err(|(e, a)| {
            CompareError::SizeMismatch {
                path: target_path.to_path_buf(),
                expected: e,
                actual: a,
            }
        })?;

    let pixels = u64::from(expected.width()) * u64::from(expected.height());
    let difference = if pixels == 0 {
        0.0
    } else {
        mismatched as f64 / pixels as f64
    };

    let mut content = Vec::new();
    diff_image
        .write_to(&mut Cursor::new(&mut content), image::ImageFormat::Png)
        .map_err(|source| CompareError::Image {
            path: target_path.to_path_buf(),
            source,
        })?;

    Ok(FileDiff {
        difference,
        content,
        target_path: target_path.to_path_buf(),
        expected_path: expected_path.to_path_buf(),
    })
}

fn load_rgba(path: &Path) -> CompareResult<RgbaImage> {
    let bytes = fs::read(path).map_err(|source| CompareError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let img = image::load_from_memory(&bytes).map_err(|source| CompareError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.to_rgba8())
}

/// Count mismatching pixels and draw the diff image.
///
/// `threshold` is the per-pixel tolerance in `0..=1`, relative to the largest
/// possible YIQ distance. Images of different sizes yield both sizes as the
/// error.
pub fn compare_images(
    expected: &RgbaImage,
    actual: &RgbaImage,
    threshold: f64,
) -> Result<(u64, RgbaImage), ((u32, u32), (u32, u32))> {
    if expected.dimensions() != actual.dimensions() {
        return Err((expected.dimensions(), actual.dimensions()));
    }
    let (width, height) = expected.dimensions();
    let max_delta = MAX_YIQ_DELTA * threshold * threshold;
    let mut diff: RgbaImage = ImageBuffer::new(width, height);
    let mut mismatched = 0u64;

    for ((e, a), out) in expected
        .pixels()
        .zip(actual.pixels())
        .zip(diff.pixels_mut())
    {
        if e == a || color_delta(e, a).abs() <= max_delta {
            *out = faded_gray(e);
        } else {
            *out = DIFF_COLOR;
            mismatched += 1;
        }
    }
    Ok((mismatched, diff))
}

/// Blend a channel over white with opacity `alpha`
fn blend(c: f64, alpha: f64) -> f64 {
    255.0 + (c - 255.0) * alpha
}

fn blended_rgb(p: &Rgba<u8>) -> (f64, f64, f64) {
    let a = f64::from(p[3]) / 255.0;
    (
        blend(f64::from(p[0]), a),
        blend(f64::from(p[1]), a),
        blend(f64::from(p[2]), a),
    )
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

/// Squared YIQ distance; negative when the first pixel is lighter
fn color_delta(p1: &Rgba<u8>, p2: &Rgba<u8>) -> f64 {
    let (r1, g1, b1) = blended_rgb(p1);
    let (r2, g2, b2) = blended_rgb(p2);
    let (y1, y2) = (rgb2y(r1, g1, b1), rgb2y(r2, g2, b2));
    let y = y1 - y2;
    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;
    if y1 > y2 { -delta } else { delta }
}

fn faded_gray(p: &Rgba<u8>) -> Rgba<u8> {
    let (r, g, b) = blended_rgb(p);
    let alpha = DIFF_FADE_ALPHA * f64::from(p[3]) / 255.0;
    let v = blend(rgb2y(r, g, b), alpha).clamp(0.0, 255.0).round() as u8;
    Rgba([v, v, v, 255])
}

/// Which diffs count as failures
///
/// The audio waveform image varies more between runs than screenshots do, so
/// it is judged against its own threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffPolicy {
    pub image_threshold: f64,
    pub audio_threshold: f64,
}

impl DiffPolicy {
    pub fn new(image_threshold: f64, audio_threshold: f64) -> Self {
        Self {
            image_threshold,
            audio_threshold,
        }
    }

    /// Whether a diff exceeds the threshold for its kind of image
    pub fn is_failure(&self, diff: &FileDiff) -> bool {
        let threshold = if diff.file_name() == AUDIO_IMAGE_FILE_NAME {
            self.audio_threshold
        } else {
            self.image_threshold
        };
        diff.difference > threshold
    }

    /// The failing subset of `diffs`, in order
    pub fn failures<'a>(&self, diffs: &'a [FileDiff]) -> Vec<&'a FileDiff> {
        diffs.iter().filter(|d| self.is_failure(d)).collect()
    }
}

impl From<CompareSettings> for DiffPolicy {
    fn from(settings: CompareSettings) -> Self {
        Self::new(settings.image_threshold, settings.audio_threshold)
    }
}

impl Default for DiffPolicy {
    fn default() -> Self {
        CompareSettings::defaults().into()
    }
}

/// Write the diff images of `diffs` into `dir` under their file names
pub fn write_diff_images<'a>(
    diffs: impl IntoIterator<Item = &'a FileDiff>,
    dir: &Path,
) -> CompareResult<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CompareError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    for diff in diffs {
        let path = dir.join(diff.file_name());
        fs::write(&path, &diff.content).map_err(io_err(&path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn write_png(path: &Path, width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 4]) {
        let img = RgbaImage::from_fn(width, height, |x, y| Rgba(paint(x, y)));
        img.save(path).unwrap();
    }

    #[test]
    fn test_diff_strings_each_other() {
        let (a, b) = diff_strings_each_other(
            &strings(&["c.png", "a.png", "b.png"]),
            &strings(&["d.png", "b.png", "a.png"]),
        );
        assert_eq!(a, strings(&["c.png"]));
        assert_eq!(b, strings(&["d.png"]));

        let (a, b) = diff_strings_each_other(&[], &strings(&["x"]));
        assert!(a.is_empty());
        assert_eq!(b, strings(&["x"]));
    }

    #[test]
    fn test_identical_pixels_do_not_count() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 200, 30, 255]));
        let (count, diff) = compare_images(&img, &img, 0.1).unwrap();
        assert_eq!(count, 0);
        assert_ne!(*diff.get_pixel(0, 0), DIFF_COLOR);
    }

    #[test]
    fn test_small_colour_shift_is_tolerated() {
        let a = RgbaImage::from_pixel(2, 2, Rgba([100, 100, 100, 255]));
        let b = RgbaImage::from_pixel(2, 2, Rgba([102, 101, 100, 255]));
        assert_eq!(compare_images(&a, &b, 0.1).unwrap().0, 0);
        // zero tolerance counts every change
        assert_eq!(compare_images(&a, &b, 0.0).unwrap().0, 4);
    }

    #[test]
    fn test_transparent_pixels_blend_on_white() {
        let clear_black = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 0]));
        let white = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
        assert_eq!(compare_images(&clear_black, &white, 0.1).unwrap().0, 0);
    }

    #[test]
    fn test_size_mismatch() {
        let a = RgbaImage::new(2, 2);
        let b = RgbaImage::new(3, 2);
        assert_eq!(compare_images(&a, &b, 0.1).unwrap_err(), ((2, 2), (3, 2)));
    }

    #[test]
    fn test_directory_against_itself_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 8, 8, |x, _| [x as u8 * 30, 0, 0, 255]);
        write_png(&dir.path().join("b.png"), 4, 4, |_, y| [0, y as u8 * 60, 0, 255]);

        let diffs = diff_directory_with_threshold(dir.path(), dir.path(), 0.1).unwrap();
        assert_eq!(diffs.len(), 2);
        assert!(diffs.iter().all(|d| d.difference == 0.0));
        assert_eq!(diffs[0].file_name(), "a.png");
    }

    #[test]
    fn test_differing_file_sets_are_rejected() {
        let expected = tempfile::tempdir().unwrap();
        let actual = tempfile::tempdir().unwrap();
        write_png(&expected.path().join("a.png"), 2, 2, |_, _| [0, 0, 0, 255]);
        write_png(&actual.path().join("b.png"), 2, 2, |_, _| [0, 0, 0, 255]);

        match diff_directory_with_threshold(expected.path(), actual.path(), 0.1) {
            Err(CompareError::FileSetMismatch { missing, extra }) => {
                assert_eq!(missing, strings(&["a.png"]));
                assert_eq!(extra, strings(&["b.png"]));
            }
            other => panic!("expected a file set mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_difference_ratio_and_diff_image() {
        let expected = tempfile::tempdir().unwrap();
        let actual = tempfile::tempdir().unwrap();
        write_png(&expected.path().join("s.png"), 4, 4, |_, _| [255, 255, 255, 255]);
        write_png(&actual.path().join("s.png"), 4, 4, |x, y| {
            if x == 0 && y < 2 { [0, 0, 0, 255] } else { [255, 255, 255, 255] }
        });

        let diffs = diff_directory_with_threshold(expected.path(), actual.path(), 0.1).unwrap();
        assert_eq!(diffs[0].difference, 2.0 / 16.0);
        let diff_image = image::load_from_memory(&diffs[0].content).unwrap().to_rgba8();
        assert_eq!(*diff_image.get_pixel(0, 0), DIFF_COLOR);
        assert_eq!(*diff_image.get_pixel(3, 3), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_policy_uses_audio_threshold_for_waveform() {
        let policy = DiffPolicy::new(0.0, 0.07);
        let diff = |name: &str, difference| FileDiff {
            difference,
            content: Vec::new(),
            target_path: PathBuf::from("/out").join(name),
            expected_path: PathBuf::from("/expected").join(name),
        };
        assert!(!policy.is_failure(&diff("audio.png", 0.05)));
        assert!(policy.is_failure(&diff("audio.png", 0.08)));
        assert!(policy.is_failure(&diff("try0_a.png", 0.01)));
        assert!(!policy.is_failure(&diff("try0_a.png", 0.0)));

        let diffs = vec![diff("a.png", 0.5), diff("b.png", 0.0)];
        assert_eq!(policy.failures(&diffs).len(), 1);
    }

    #[test]
    fn test_write_diff_images() {
        let dir = tempfile::tempdir().unwrap();
        let diff = FileDiff {
            difference: 0.5,
            content: vec![1, 2, 3],
            target_path: PathBuf::from("/out/x.png"),
            expected_path: PathBuf::from("/expected/x.png"),
        };
        write_diff_images([&diff], &dir.path().join("diffs")).unwrap();
        assert_eq!(fs::read(dir.path().join("diffs/x.png")).unwrap(), vec![1, 2, 3]);
    }
}

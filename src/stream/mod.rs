//! Ordered image-sequence sources.
//!
//! A [`FrameSource`] yields decoded frames from an ordered list of files, either by random
//! access or sequentially. Files are ordered by the integer embedded in their name, see
//! [`frame_number`], never lexicographically.

pub mod file_stream;

pub use file_stream::FileFrameSource;

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// Image extensions a directory scan picks up, compared case-insensitively.
pub const STREAM_FILETYPES: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "exr"];

/// Single-channel floating point image, as decoded from EXR depth maps.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Frame source was initialized with an empty filename list")]
    EmptyList,
    #[error("Unknown naming convention for {0}, expecting 000x, prefix_000x, 000x_suffix or prefix_000x_suffix")]
    UnknownNamingConvention(String),
    #[error("Frame source is already initialized")]
    AlreadyInitialized,
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// How non-EXR images are decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    #[default]
    Grayscale,
    Color,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Gray(GrayImage),
    Rgb(RgbImage),
    Depth(DepthImage),
}

impl Frame {
    /// `(width, height)` in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Frame::Gray(img) => img.dimensions(),
            Frame::Rgb(img) => img.dimensions(),
            Frame::Depth(img) => img.dimensions(),
        }
    }

    /// Converts the frame into per-pixel depth values.
    ///
    /// Only single-channel frames carry depth, color frames return `None`.
    pub fn to_depth(&self) -> Option<DepthImage> {
        match self {
            Frame::Depth(img) => Some(img.clone()),
            Frame::Gray(img) => Some(ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                Luma([img.get_pixel(x, y)[0] as f32])
            })),
            Frame::Rgb(_) => None,
        }
    }

    /// Converts the frame into an 8-bit gray image using the Rec. 709 luma weights.
    ///
    /// Depth frames return `None`.
    pub fn to_gray(&self) -> Option<GrayImage> {
        match self {
            Frame::Gray(img) => Some(img.clone()),
            Frame::Rgb(img) => Some(image::imageops::grayscale(img)),
            Frame::Depth(_) => None,
        }
    }

    /// Converts the frame into an 8-bit RGB image, gray values are replicated.
    ///
    /// Depth frames return `None`.
    pub fn to_rgb(&self) -> Option<RgbImage> {
        match self {
            Frame::Rgb(img) => Some(img.clone()),
            Frame::Gray(img) => Some(ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
                let v = img.get_pixel(x, y)[0];
                Rgb([v, v, v])
            })),
            Frame::Depth(_) => None,
        }
    }
}

/// Directory scan parameters.
///
/// `prefix`/`suffix` filter on the `_`-separated tokens of the filename stem; the
/// `[from_frame, to_frame)` slice is applied after ordering. A `to_frame` that is not
/// greater than `from_frame` leaves the range open-ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryScan {
    pub dir: PathBuf,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub from_frame: Option<usize>,
    pub to_frame: Option<usize>,
}

impl DirectoryScan {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_range(mut self, from_frame: usize, to_frame: usize) -> Self {
        self.from_frame = Some(from_frame);
        self.to_frame = Some(to_frame);
        self
    }

    /// Whether a filename stem passes the prefix/suffix filters.
    pub fn accepts(&self, stem: &str) -> bool {
        let tokens: Vec<&str> = stem.split('_').collect();
        match (self.prefix.as_deref(), self.suffix.as_deref()) {
            (None, None) => true,
            (Some(prefix), Some(suffix)) => {
                tokens.len() == 3 && tokens[0] == prefix && tokens[2] == suffix
            }
            (None, Some(suffix)) => tokens.len() > 1 && tokens.last() == Some(&suffix),
            (Some(prefix), None) => tokens.len() > 1 && tokens[0] == prefix,
        }
    }
}

/// Where a frame source takes its files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameInput {
    Filename(PathBuf),
    Filenames(Vec<PathBuf>),
    Directory(DirectoryScan),
}

/// Capability interface of an ordered frame sequence.
///
/// The cursor starts before the first frame. Running past the end is not an error: a
/// non-looping source answers `Ok(None)`, a looping source wraps around.
pub trait FrameSource {
    /// Sets the source up once, a second call fails with [`StreamError::AlreadyInitialized`].
    fn initialize(&mut self, input: FrameInput) -> Result<(), StreamError>;

    /// Decodes the frame at `index`, or at the cursor when `index` is `None`.
    ///
    /// A successful access moves the cursor to the frame returned.
    fn get(&mut self, index: Option<usize>) -> Result<Option<Frame>, StreamError>;

    /// Advances the cursor and decodes the frame under it.
    fn next(&mut self) -> Result<Option<Frame>, StreamError>;

    /// Moves the cursor back before the first frame.
    fn reset(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the frame under the cursor.
    fn current_filename(&self) -> Option<&Path>;
}

/// Part of the filename before its first `.`.
pub fn filename_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    Some(name.split('.').next().unwrap_or(name))
}

/// Whether `path` carries one of the [`STREAM_FILETYPES`] extensions.
pub fn is_stream_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| STREAM_FILETYPES.contains(&e.as_str()))
}

/// Extracts the frame number from a filename stem of the form `000x`, `prefix_000x`,
/// `000x_suffix` or `prefix_000x_suffix`.
///
/// Two-token stems try the second token first and fall back to the first one.
///
/// ```rust
/// use calibtool::stream::frame_number;
/// use std::path::Path;
///
/// assert_eq!(frame_number(Path::new("img_0010.png")).unwrap(), 10);
/// assert_eq!(frame_number(Path::new("0003_depth.exr")).unwrap(), 3);
/// ```
pub fn frame_number(path: &Path) -> Result<i64, StreamError> {
    let unknown = || StreamError::UnknownNamingConvention(path.display().to_string());
    let stem = filename_stem(path).ok_or_else(unknown)?;
    let tokens: Vec<&str> = stem.split('_').collect();
    let parsed: Option<i64> = match tokens.as_slice() {
        [number] => number.parse().ok(),
        [first, second] => second.parse().or_else(|_| first.parse()).ok(),
        [_, number, _] => number.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(unknown)
}

/// Orders `paths` by [`frame_number`], ties are broken by path.
pub fn sort_by_frame_number(paths: Vec<PathBuf>) -> Result<Vec<PathBuf>, StreamError> {
    let mut keyed = paths
        .into_iter()
        .map(|path| Ok((frame_number(&path)?, path)))
        .collect::<Result<Vec<_>, StreamError>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(keyed.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_number_conventions() {
        assert_eq!(frame_number(Path::new("0007.png")).unwrap(), 7);
        assert_eq!(frame_number(Path::new("dir/img_0010.png")).unwrap(), 10);
        assert_eq!(frame_number(Path::new("0003_depth.exr")).unwrap(), 3);
        assert_eq!(frame_number(Path::new("left_0042_rgb.png")).unwrap(), 42);
        assert_eq!(frame_number(Path::new("img_0005.depth.png")).unwrap(), 5);
        // The second token wins when both parse.
        assert_eq!(frame_number(Path::new("12_34.png")).unwrap(), 34);
    }

    #[test]
    fn test_frame_number_rejects_unknown_names() {
        for name in ["calib.png", "left_rgb.png", "a_1_b_c.png", "left_x_rgb.png"] {
            let err = frame_number(Path::new(name)).unwrap_err();
            assert!(
                matches!(err, StreamError::UnknownNamingConvention(_)),
                "{name}"
            );
        }
    }

    #[test]
    fn test_sort_is_numeric() {
        let paths = ["img_0010.png", "img_0002.png", "img_0001.png", "img_100.png"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let sorted = sort_by_frame_number(paths).unwrap();
        let names: Vec<_> = sorted.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(
            names,
            ["img_0001.png", "img_0002.png", "img_0010.png", "img_100.png"]
        );
    }

    #[test]
    fn test_prefix_suffix_filters() {
        let both = DirectoryScan::new("d").with_prefix("left").with_suffix("rgb");
        assert!(both.accepts("left_0001_rgb"));
        assert!(!both.accepts("left_0001"));
        assert!(!both.accepts("right_0001_rgb"));

        let suffix = DirectoryScan::new("d").with_suffix("rgb");
        assert!(suffix.accepts("left_0001_rgb"));
        assert!(suffix.accepts("0001_rgb"));
        assert!(!suffix.accepts("rgb"));

        let prefix = DirectoryScan::new("d").with_prefix("left");
        assert!(prefix.accepts("left_0001"));
        assert!(!prefix.accepts("left"));

        assert!(DirectoryScan::new("d").accepts("anything"));
    }

    #[test]
    fn test_is_stream_file() {
        assert!(is_stream_file(Path::new("a/0001.PNG")));
        assert!(is_stream_file(Path::new("0001.exr")));
        assert!(!is_stream_file(Path::new("0001.yaml")));
        assert!(!is_stream_file(Path::new("0001")));
    }

    #[test]
    fn test_frame_conversions() {
        let gray = Frame::Gray(GrayImage::from_pixel(2, 3, Luma([7])));
        assert_eq!(gray.dimensions(), (2, 3));
        assert_eq!(gray.to_depth().unwrap().get_pixel(1, 2)[0], 7.0);
        assert_eq!(gray.to_rgb().unwrap().get_pixel(0, 0), &Rgb([7, 7, 7]));

        let depth = Frame::Depth(DepthImage::from_pixel(2, 2, Luma([1.5])));
        assert!(depth.to_rgb().is_none());
        let rgb = Frame::Rgb(RgbImage::new(1, 1));
        assert!(rgb.to_depth().is_none());
    }
}

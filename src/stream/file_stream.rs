//! File-backed frame source.

use image::{ImageBuffer, Luma};
use log::{debug, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    filename_stem, is_stream_file, sort_by_frame_number, DirectoryScan, Frame, FrameInput,
    FrameSource, ReadMode, StreamError,
};

/// Lazily decoding frame source over image files on disk.
///
/// Nothing is cached: every [`get`](FrameSource::get) and [`next`](FrameSource::next)
/// reads the file again.
///
/// # Examples
///
/// ```rust,no_run
/// use calibtool::stream::{DirectoryScan, FileFrameSource, FrameInput, FrameSource};
///
/// let mut source = FileFrameSource::new();
/// source
///     .initialize(FrameInput::Directory(DirectoryScan::new("data/intrinsics")))
///     .unwrap();
/// while let Some(frame) = source.next().unwrap() {
///     println!("{:?} {:?}", source.current_filename(), frame.dimensions());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FileFrameSource {
    dir: Option<PathBuf>,
    filenames: Vec<PathBuf>,
    cursor: isize,
    looping: bool,
    read_mode: ReadMode,
    initialized: bool,
}

impl Default for FileFrameSource {
    fn default() -> Self {
        Self {
            dir: None,
            filenames: Vec::new(),
            cursor: -1,
            looping: false,
            read_mode: ReadMode::default(),
            initialized: false,
        }
    }
}

impl FileFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn looping(looping: bool) -> Self {
        Self {
            looping,
            ..Self::new()
        }
    }

    /// Convenience constructor that initializes from `input`.
    pub fn open(input: FrameInput) -> Result<Self, StreamError> {
        let mut source = Self::new();
        source.initialize(input)?;
        Ok(source)
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    pub fn set_read_mode(&mut self, read_mode: ReadMode) {
        self.read_mode = read_mode;
    }

    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    /// Ordered filenames of the sequence.
    pub fn filenames(&self) -> &[PathBuf] {
        &self.filenames
    }

    /// Cursor position, `-1` before the first access.
    pub fn frame_index(&self) -> isize {
        self.cursor
    }

    fn scan_directory(scan: &DirectoryScan) -> Result<Vec<PathBuf>, StreamError> {
        if !scan.dir.is_dir() {
            return Err(StreamError::NotFound(format!(
                "directory {}",
                scan.dir.display()
            )));
        }
        let mut filenames = Vec::new();
        for entry in fs::read_dir(&scan.dir)? {
            let path = entry?.path();
            if !path.is_file() || !is_stream_file(&path) {
                continue;
            }
            if filename_stem(&path).is_some_and(|stem| scan.accepts(stem)) {
                filenames.push(path);
            }
        }
        let filenames = sort_by_frame_number(filenames)?;

        let from = scan.from_frame.unwrap_or(0).min(filenames.len());
        let to = match scan.to_frame {
            Some(to) if to > from => to.min(filenames.len()),
            _ => filenames.len(),
        };
        let selected = filenames[from..to].to_vec();
        if selected.is_empty() {
            return Err(StreamError::NotFound(format!(
                "no matching images in {}",
                scan.dir.display()
            )));
        }
        Ok(selected)
    }

    fn resolve(&self, index: isize) -> Option<usize> {
        let len = self.filenames.len() as isize;
        if index < 0 || len == 0 {
            return None;
        }
        if index < len {
            Some(index as usize)
        } else if self.looping {
            Some((index % len) as usize)
        } else {
            None
        }
    }

    fn read_at(&mut self, index: usize) -> Result<Option<Frame>, StreamError> {
        let frame = read_frame(&self.filenames[index], self.read_mode)?;
        self.cursor = index as isize;
        Ok(Some(frame))
    }
}

impl FrameSource for FileFrameSource {
    fn initialize(&mut self, input: FrameInput) -> Result<(), StreamError> {
        if self.initialized {
            return Err(StreamError::AlreadyInitialized);
        }
        let filenames = match input {
            FrameInput::Filename(path) => {
                if !path.is_file() {
                    return Err(StreamError::NotFound(format!("file {}", path.display())));
                }
                self.dir = path.parent().map(Path::to_path_buf);
                vec![path]
            }
            FrameInput::Filenames(paths) => {
                if paths.is_empty() {
                    return Err(StreamError::EmptyList);
                }
                sort_by_frame_number(paths)?
            }
            FrameInput::Directory(scan) => {
                let filenames = Self::scan_directory(&scan)?;
                self.dir = Some(scan.dir);
                filenames
            }
        };
        info!("Frame source initialized with {} frames", filenames.len());
        self.filenames = filenames;
        self.cursor = -1;
        self.initialized = true;
        Ok(())
    }

    fn get(&mut self, index: Option<usize>) -> Result<Option<Frame>, StreamError> {
        let requested = match index {
            Some(i) => isize::try_from(i).unwrap_or(isize::MAX),
            None => self.cursor,
        };
        match self.resolve(requested) {
            Some(i) => self.read_at(i),
            None => Ok(None),
        }
    }

    fn next(&mut self) -> Result<Option<Frame>, StreamError> {
        let len = self.filenames.len() as isize;
        let advanced = self.cursor.saturating_add(1);
        if advanced < len {
            return self.read_at(advanced as usize);
        }
        if self.looping && len > 0 {
            return self.read_at(0);
        }
        self.cursor = len;
        debug!("Frame source exhausted after {len} frames");
        Ok(None)
    }

    fn reset(&mut self) {
        self.cursor = -1;
    }

    fn len(&self) -> usize {
        self.filenames.len()
    }

    fn current_filename(&self) -> Option<&Path> {
        usize::try_from(self.cursor)
            .ok()
            .and_then(|i| self.filenames.get(i))
            .map(PathBuf::as_path)
    }
}

impl fmt::Display for FileFrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = self
            .dir
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| d.display().to_string());
        write!(f, "Stream:\n{dir}\nframes: {}", self.filenames.len())
    }
}

/// Decodes a single image file.
///
/// EXR files always decode to a [`Frame::Depth`] holding their R channel, other formats
/// follow `mode`.
pub fn read_frame(path: &Path, mode: ReadMode) -> Result<Frame, StreamError> {
    if !path.is_file() {
        return Err(StreamError::NotFound(format!("file {}", path.display())));
    }
    let image = image::open(path).map_err(|source| StreamError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let is_exr = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("exr"));
    if is_exr {
        let rgb = image.into_rgb32f();
        let depth = ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
            Luma([rgb.get_pixel(x, y)[0]])
        });
        return Ok(Frame::Depth(depth));
    }
    Ok(match mode {
        ReadMode::Grayscale => Frame::Gray(image.into_luma8()),
        ReadMode::Color => Frame::Rgb(image.into_rgb8()),
    })
}

//! ChArUco calibration target description.

use nalgebra::Point3;
use std::fmt;
use std::str::FromStr;

use super::CalibrationError;

/// Predefined ArUco marker dictionaries.
///
/// Each family is used with a fixed dictionary size: `DICT_4X4` holds 50 markers,
/// `DICT_5X5` 250, `DICT_6X6` and `DICT_7X7` 1000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArucoDictionary {
    Dict4x4,
    Dict5x5,
    Dict6x6,
    Dict7x7,
}

impl ArucoDictionary {
    pub fn marker_count(self) -> usize {
        match self {
            ArucoDictionary::Dict4x4 => 50,
            ArucoDictionary::Dict5x5 => 250,
            ArucoDictionary::Dict6x6 | ArucoDictionary::Dict7x7 => 1000,
        }
    }

    /// Marker side length in bits.
    pub fn marker_bits(self) -> usize {
        match self {
            ArucoDictionary::Dict4x4 => 4,
            ArucoDictionary::Dict5x5 => 5,
            ArucoDictionary::Dict6x6 => 6,
            ArucoDictionary::Dict7x7 => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArucoDictionary::Dict4x4 => "DICT_4X4",
            ArucoDictionary::Dict5x5 => "DICT_5X5",
            ArucoDictionary::Dict6x6 => "DICT_6X6",
            ArucoDictionary::Dict7x7 => "DICT_7X7",
        }
    }
}

impl FromStr for ArucoDictionary {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DICT_4X4" => Ok(ArucoDictionary::Dict4x4),
            "DICT_5X5" => Ok(ArucoDictionary::Dict5x5),
            "DICT_6X6" => Ok(ArucoDictionary::Dict6x6),
            "DICT_7X7" => Ok(ArucoDictionary::Dict7x7),
            other => Err(CalibrationError::UnknownDictionary(other.to_string())),
        }
    }
}

impl fmt::Display for ArucoDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A checkerboard of `cols` x `rows` squares overlaid with ArUco markers.
///
/// Its inner corners are numbered row by row starting at the origin, corner `i` lies at
/// `((i % (cols - 1)) * square_size, (i / (cols - 1)) * square_size, 0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CharucoBoard {
    pub dictionary: ArucoDictionary,
    pub cols: usize,
    pub rows: usize,
    pub square_size: f64,
    pub marker_size: f64,
}

impl CharucoBoard {
    pub fn new(
        dictionary: ArucoDictionary,
        cols: usize,
        rows: usize,
        square_size: f64,
        marker_size: f64,
    ) -> Result<Self, CalibrationError> {
        if cols < 2 || rows < 2 {
            return Err(CalibrationError::InvalidBoard(format!(
                "board needs at least 2x2 squares, got {cols}x{rows}"
            )));
        }
        if !(square_size > 0.0) || !(marker_size > 0.0) || marker_size >= square_size {
            return Err(CalibrationError::InvalidBoard(format!(
                "marker size {marker_size} must be positive and smaller than square size {square_size}"
            )));
        }
        let markers = cols * rows / 2;
        if markers > dictionary.marker_count() {
            return Err(CalibrationError::InvalidBoard(format!(
                "{markers} markers exceed the {} dictionary",
                dictionary
            )));
        }
        Ok(Self {
            dictionary,
            cols,
            rows,
            square_size,
            marker_size,
        })
    }

    /// Number of inner chessboard corners, `(cols - 1) * (rows - 1)`.
    pub fn corner_count(&self) -> usize {
        (self.cols - 1) * (self.rows - 1)
    }

    /// Board coordinates of corner `id`, `None` for ids outside the board.
    pub fn object_point(&self, id: usize) -> Option<Point3<f64>> {
        if id >= self.corner_count() {
            return None;
        }
        let per_row = self.cols - 1;
        Some(Point3::new(
            (id % per_row) as f64 * self.square_size,
            (id / per_row) as f64 * self.square_size,
            0.0,
        ))
    }

    /// Board coordinates of every inner corner, indexed by corner id.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        (0..self.corner_count())
            .filter_map(|id| self.object_point(id))
            .collect()
    }
}

//! Seam to the computer-vision library doing detection, solving and remapping.
//!
//! The calibration driver only orchestrates: marker detection with ChArUco corner
//! interpolation, the intrinsic solver, PnP and undistortion are provided by an
//! implementation of [`VisionBackend`].

use image::GrayImage;
use nalgebra::{Matrix3, Point2, Point3, Vector3};

use super::board::CharucoBoard;
use crate::stream::Frame;

/// Failure reported by a [`VisionBackend`] implementation.
#[derive(thiserror::Error, Debug)]
#[error("Vision backend failure: {0}")]
pub struct BackendError(pub String);

/// Termination criteria for iterative refinement (sub-pixel corners, solvers).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermCriteria {
    pub max_count: usize,
    pub epsilon: f64,
}

impl Default for TermCriteria {
    fn default() -> Self {
        Self {
            max_count: 10000,
            epsilon: 1e-5,
        }
    }
}

/// Interpolated ChArUco corners of one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Sub-pixel corner positions.
    pub corners: Vec<Point2<f64>>,
    /// Board corner id of each entry in `corners`.
    pub ids: Vec<usize>,
}

impl Detection {
    pub fn len(&self) -> usize {
        self.corners.len().min(self.ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of the intrinsic solver.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicEstimate {
    /// Overall RMS reprojection error in pixels.
    pub rms: f64,
    pub intrinsics: Matrix3<f64>,
    /// `[k1, k2, p1, p2, k3]`
    pub distortion: [f64; 5],
    pub per_view_errors: Vec<f64>,
    pub std_dev_intrinsics: Vec<f64>,
    pub std_dev_extrinsics: Vec<f64>,
}

/// Board pose in camera coordinates as returned by a PnP solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Axis-angle rotation.
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

/// A computer-vision library able to calibrate against ChArUco boards.
pub trait VisionBackend {
    /// Detects markers on `image` and interpolates the board corners.
    ///
    /// # Arguments
    ///
    /// * `image` - The image to search.
    /// * `board` - The calibration target.
    /// * `criteria` - Termination criteria of the sub-pixel refinement.
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - If no marker was found.
    /// * `Ok(Some(Detection))` - The interpolated corners and their ids.
    fn detect(
        &self,
        image: &GrayImage,
        board: &CharucoBoard,
        criteria: &TermCriteria,
    ) -> Result<Option<Detection>, BackendError>;

    /// Estimates intrinsics and distortion from the detections of several views.
    ///
    /// `image_size` is `(width, height)` in pixels.
    fn calibrate(
        &self,
        detections: &[Detection],
        board: &CharucoBoard,
        image_size: (u32, u32),
    ) -> Result<IntrinsicEstimate, BackendError>;

    /// Estimates the pose of the board from 3D-2D correspondences.
    ///
    /// Returns `Ok(None)` when the solver does not converge.
    fn solve_pnp(
        &self,
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
        intrinsics: &Matrix3<f64>,
        distortion: &[f64; 5],
    ) -> Result<Option<Pose>, BackendError>;

    /// Removes lens distortion from a frame, keeping its size and kind.
    fn undistort(
        &self,
        frame: &Frame,
        intrinsics: &Matrix3<f64>,
        distortion: &[f64; 5],
    ) -> Result<Frame, BackendError>;
}

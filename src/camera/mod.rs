//! Camera data model.
//!
//! The [`PinholeCamera`] keeps intrinsics, lens distortion, sensor geometry and a rigid
//! transform together with the transform expressed in the scene-tool convention.

pub mod pinhole;

pub use pinhole::PinholeCamera;

/// Errors raised while mutating a [`PinholeCamera`].
#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("{what} must be {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    Shape {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Missing camera parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Sensor and image sizes must be positive")]
    SizeMustBePositive,
    #[error("Transform is singular, the scene-tool transform cannot be derived")]
    SingularTransform,
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::CameraError;

    pub fn validate_focal_length(f_mm: f64) -> Result<(), CameraError> {
        if !(f_mm > 0.0) || !f_mm.is_finite() {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        Ok(())
    }

    pub fn validate_size(size: (f64, f64)) -> Result<(), CameraError> {
        if !(size.0 > 0.0) || !(size.1 > 0.0) {
            return Err(CameraError::SizeMustBePositive);
        }
        Ok(())
    }

    pub fn validate_shape(
        what: &'static str,
        (rows, cols): (usize, usize),
        (expected_rows, expected_cols): (usize, usize),
    ) -> Result<(), CameraError> {
        if rows != expected_rows || cols != expected_cols {
            return Err(CameraError::Shape {
                what,
                expected_rows,
                expected_cols,
                rows,
                cols,
            });
        }
        Ok(())
    }
}

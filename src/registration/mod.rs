//! Back-projection of depth maps into colored world-space point clouds.
//!
//! A depth map seen by a calibrated [`PinholeCamera`] is lifted into 3D either in the
//! scene-tool convention (y up, camera looking down -z, placed by the camera's
//! `external_transform`) or in the vision convention (y down, looking down +z, placed by
//! the inverse of its `transform`).

use image::RgbImage;
use log::debug;
use nalgebra::{Matrix4, Point3, Vector3, Vector4};
use rand::Rng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::camera::PinholeCamera;
use crate::stream::DepthImage;

/// Depths beyond this distance are truncated in the vision convention.
pub const DEPTH_TRUNCATION: f32 = 100.0;

/// Color given to every point when no color image is available.
pub const DEFAULT_GRAY: u8 = 200;

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    #[error("Camera is missing {0} required for registration")]
    MissingCalibration(&'static str),
    #[error("Color image is {color:?} but depth map is {depth:?}")]
    SizeMismatch { depth: (u32, u32), color: (u32, u32) },
    #[error("Downsample ratio must lie in [0, 1], got {0}")]
    InvalidRatio(f64),
    #[error("Camera transform is not invertible")]
    SingularTransform,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Points with per-point RGB colors in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: Point3<f64>, color: Vector3<f64>) {
        self.points.push(point);
        self.colors.push(color);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Keeps a uniformly drawn subset of `floor(len * ratio)` points.
    ///
    /// The retained points keep their relative order.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::InvalidRatio`] if `ratio` is outside `[0, 1]`.
    pub fn random_down_sample<R: Rng + ?Sized>(
        &self,
        ratio: f64,
        rng: &mut R,
    ) -> Result<PointCloud, RegistrationError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(RegistrationError::InvalidRatio(ratio));
        }
        let amount = (self.len() as f64 * ratio).floor() as usize;
        let mut indices = rand::seq::index::sample(rng, self.len(), amount).into_vec();
        indices.sort_unstable();

        let mut sampled = PointCloud::with_capacity(amount);
        for i in indices {
            sampled.push(self.points[i], self.colors[i]);
        }
        Ok(sampled)
    }

    /// Writes the cloud as an ASCII PLY file with double coordinates and 8-bit colors.
    pub fn write_ply(&self, path: impl AsRef<Path>) -> Result<(), RegistrationError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writeln!(writer, "ply")?;
        writeln!(writer, "format ascii 1.0")?;
        writeln!(writer, "element vertex {}", self.len())?;
        for axis in ["x", "y", "z"] {
            writeln!(writer, "property double {axis}")?;
        }
        for channel in ["red", "green", "blue"] {
            writeln!(writer, "property uchar {channel}")?;
        }
        writeln!(writer, "end_header")?;
        for (p, c) in self.points.iter().zip(&self.colors) {
            writeln!(
                writer,
                "{} {} {} {} {} {}",
                p.x,
                p.y,
                p.z,
                to_byte(c.x),
                to_byte(c.y),
                to_byte(c.z)
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn to_byte(channel: f64) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Lifts every valid pixel of `depth` into world coordinates and downsamples the result.
///
/// # Arguments
///
/// * `camera` - Calibrated camera with intrinsics and transform.
/// * `depth` - Per-pixel depth along the optical axis.
/// * `color` - Optional, already undistorted color image of the same size.
/// * `downsample` - Fraction of points to keep.
/// * `blender_conform` - Selects the scene-tool convention instead of the vision one.
/// * `rng` - Random source of the downsampling.
///
/// # Errors
///
/// * [`RegistrationError::MissingCalibration`] if intrinsics or transforms are unset.
/// * [`RegistrationError::SizeMismatch`] if `color` and `depth` differ in size.
/// * [`RegistrationError::InvalidRatio`] if `downsample` is outside `[0, 1]`.
pub fn register_depthmap_to_world<R: Rng + ?Sized>(
    camera: &PinholeCamera,
    depth: &DepthImage,
    color: Option<&RgbImage>,
    downsample: f64,
    blender_conform: bool,
    rng: &mut R,
) -> Result<PointCloud, RegistrationError> {
    let (fx, fy, cx, cy) = match (camera.fx(), camera.fy(), camera.cx(), camera.cy()) {
        (Some(fx), Some(fy), Some(cx), Some(cy)) => (fx, fy, cx, cy),
        _ => return Err(RegistrationError::MissingCalibration("intrinsics")),
    };
    if let Some(color) = color {
        if color.dimensions() != depth.dimensions() {
            return Err(RegistrationError::SizeMismatch {
                depth: depth.dimensions(),
                color: color.dimensions(),
            });
        }
    }

    let to_world: Matrix4<f64> = if blender_conform {
        *camera
            .external_transform()
            .ok_or(RegistrationError::MissingCalibration("external_transform"))?
    } else {
        camera
            .transform()
            .ok_or(RegistrationError::MissingCalibration("transform"))?
            .try_inverse()
            .ok_or(RegistrationError::SingularTransform)?
    };

    let gray = f64::from(DEFAULT_GRAY) / 255.0;
    let mut cloud = PointCloud::with_capacity((depth.width() * depth.height()) as usize);
    for (u, v, pixel) in depth.enumerate_pixels() {
        let d = pixel[0];
        if !d.is_finite() || (!blender_conform && (d <= 0.0 || d > DEPTH_TRUNCATION)) {
            continue;
        }
        let d = f64::from(d);
        let x = (f64::from(u) - cx) * d / fx;
        let y = (f64::from(v) - cy) * d / fy;
        let local = if blender_conform {
            Vector4::new(x, -y, -d, 1.0)
        } else {
            Vector4::new(x, y, d, 1.0)
        };
        let world = to_world * local;

        let rgb = match color {
            Some(img) => {
                let c = img.get_pixel(u, v);
                Vector3::new(
                    f64::from(c[0]) / 255.0,
                    f64::from(c[1]) / 255.0,
                    f64::from(c[2]) / 255.0,
                )
            }
            None => Vector3::repeat(gray),
        };
        cloud.push(Point3::new(world.x, world.y, world.z), rgb);
    }
    debug!(
        "Back-projected {} of {} pixels",
        cloud.len(),
        depth.width() * depth.height()
    );

    cloud.random_down_sample(downsample, rng)
}

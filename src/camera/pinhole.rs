//! Implements the pinhole camera data model.
//!
//! This module provides the [`PinholeCamera`] struct, which keeps the intrinsic matrix,
//! the 5-parameter lens distortion, sensor and image geometry and a rigid transform for
//! a single view. Every time the primary transform is set, the transform expressed in the
//! scene-tool convention is recomputed from it, so the two can never disagree.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, SMatrix, Vector3};
use std::fmt;

use crate::camera::{validation, CameraError};
use crate::geometry;
use crate::persist::{FieldMap, FieldValue, Persist, PersistError};

/// Default focal length used by [`PinholeCamera::quick_default`], in millimeters.
pub const DEFAULT_FOCAL_LENGTH_MM: f64 = 50.0;
/// Default full-frame sensor size `(height, width)` in millimeters.
pub const DEFAULT_SENSOR_SIZE_MM: (f64, f64) = (20.25, 36.0);
/// Default image size `(height, width)` in pixels.
pub const DEFAULT_IMAGE_SIZE_PX: (u32, u32) = (1080, 1920);

/// A pinhole camera with radial-tangential distortion and a rigid transform.
///
/// All fields start out unset. A camera is populated either through
/// [`quick_default`](Self::quick_default) or field by field by the calibration pipeline,
/// and copied (`clone`) once per processed view.
///
/// Sizes follow the `(height, width)` order throughout.
///
/// # Examples
///
/// ```rust
/// use calibtool::camera::PinholeCamera;
/// use nalgebra::Matrix4;
///
/// let mut camera = PinholeCamera::new();
/// camera.quick_default().unwrap();
///
/// assert_eq!(camera.image_size_px(), Some((1080, 1920)));
/// assert_eq!(camera.cx(), Some(960.0));
/// assert_eq!(camera.transform(), Some(&Matrix4::identity()));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinholeCamera {
    name: Option<String>,
    focal_length_mm: Option<f64>,
    sensor_size_mm: Option<(f64, f64)>,
    image_size_px: Option<(u32, u32)>,
    intrinsics: Option<Matrix3<f64>>,
    /// `[k1, k2, p1, p2, k3]`
    distortion: Option<[f64; 5]>,
    transform: Option<Matrix4<f64>>,
    external_transform: Option<Matrix4<f64>>,
}

impl PinholeCamera {
    /// Creates a camera with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the camera as a 50mm full-frame camera rendering 1920x1080 images,
    /// with zero distortion and the identity transform.
    ///
    /// The scene-tool transform of the identity pose is `diag(1, -1, -1, 1)`.
    pub fn quick_default(&mut self) -> Result<(), CameraError> {
        self.quick_init(
            DEFAULT_FOCAL_LENGTH_MM,
            DEFAULT_SENSOR_SIZE_MM,
            DEFAULT_IMAGE_SIZE_PX,
        )
    }

    /// Like [`quick_default`](Self::quick_default) with a custom optical setup.
    ///
    /// # Errors
    ///
    /// * [`CameraError::FocalLengthMustBePositive`]
    /// * [`CameraError::SizeMustBePositive`]
    pub fn quick_init(
        &mut self,
        f_mm: f64,
        sensor_size_mm: (f64, f64),
        image_size_px: (u32, u32),
    ) -> Result<(), CameraError> {
        self.set_intrinsics_from_focal_length(
            Some(f_mm),
            Some(sensor_size_mm),
            Some(image_size_px),
        )?;
        self.distortion = Some([0.0; 5]);
        self.set_transform_matrix(Matrix4::identity())
    }

    /// Computes the intrinsic matrix from the focal length in millimeters.
    ///
    /// Each argument that is `Some` is stored first; afterwards focal length, sensor size
    /// and image size must all be known:
    ///
    /// `fx = f / sensor_w * image_w`, `fy = f / sensor_h * image_h`,
    /// `cx = image_w / 2`, `cy = image_h / 2`.
    ///
    /// # Errors
    ///
    /// * [`CameraError::MissingParameter`] if one of the three inputs is still unknown.
    /// * [`CameraError::FocalLengthMustBePositive`], [`CameraError::SizeMustBePositive`]
    pub fn set_intrinsics_from_focal_length(
        &mut self,
        f_mm: Option<f64>,
        sensor_size_mm: Option<(f64, f64)>,
        image_size_px: Option<(u32, u32)>,
    ) -> Result<(), CameraError> {
        if let Some(f_mm) = f_mm {
            self.set_focal_length_mm(f_mm)?;
        }
        if let Some(sensor) = sensor_size_mm {
            self.set_sensor_size_mm(sensor)?;
        }
        if let Some(image) = image_size_px {
            self.set_image_size_px(image)?;
        }
        let f_mm = self
            .focal_length_mm
            .ok_or(CameraError::MissingParameter("focal_length_mm"))?;
        let sensor = self
            .sensor_size_mm
            .ok_or(CameraError::MissingParameter("sensor_size_mm"))?;
        let image = self
            .image_size_px
            .ok_or(CameraError::MissingParameter("image_size_px"))?;
        self.intrinsics = Some(intrinsics_from_focal_length(f_mm, sensor, image));
        Ok(())
    }

    /// Sets the intrinsic matrix from pixel focal lengths, principal point and skew.
    pub fn set_intrinsics_direct(&mut self, fx: f64, fy: f64, cx: f64, cy: f64, skew: f64) {
        self.intrinsics = Some(Matrix3::new(fx, skew, cx, 0.0, fy, cy, 0.0, 0.0, 1.0));
    }

    /// Sets the intrinsic matrix from a dynamically sized matrix, which must be 3x3.
    pub fn set_intrinsics(&mut self, intrinsics: &DMatrix<f64>) -> Result<(), CameraError> {
        validation::validate_shape("intrinsics", intrinsics.shape(), (3, 3))?;
        self.intrinsics = Some(Matrix3::from_fn(|r, c| intrinsics[(r, c)]));
        Ok(())
    }

    pub fn set_intrinsics_matrix(&mut self, intrinsics: Matrix3<f64>) {
        self.intrinsics = Some(intrinsics);
    }

    /// Sets the distortion from a dynamically sized matrix, which must be 1x5.
    pub fn set_distortion(&mut self, distortion: &DMatrix<f64>) -> Result<(), CameraError> {
        validation::validate_shape("distortion", distortion.shape(), (1, 5))?;
        let mut coefficients = [0.0; 5];
        for (i, c) in coefficients.iter_mut().enumerate() {
            *c = distortion[(0, i)];
        }
        self.distortion = Some(coefficients);
        Ok(())
    }

    pub fn set_distortion_coefficients(&mut self, k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) {
        self.distortion = Some([k1, k2, p1, p2, k3]);
    }

    /// Sets the primary transform from a dynamically sized matrix, which must be 4x4.
    ///
    /// See [`set_transform_matrix`](Self::set_transform_matrix) for the derived transform.
    pub fn set_transform(&mut self, transform: &DMatrix<f64>) -> Result<(), CameraError> {
        validation::validate_shape("transform", transform.shape(), (4, 4))?;
        self.set_transform_matrix(Matrix4::from_fn(|r, c| transform[(r, c)]))
    }

    /// Stores `transform` verbatim and deterministically recomputes the scene-tool
    /// transform `T^-1 * F`, `F = diag(1, -1, -1, 1)`.
    ///
    /// This is the only place the scene-tool transform is written.
    ///
    /// Rigidity is not checked. On error neither transform is modified.
    ///
    /// # Errors
    ///
    /// * [`CameraError::SingularTransform`] if `transform` cannot be inverted.
    pub fn set_transform_matrix(&mut self, transform: Matrix4<f64>) -> Result<(), CameraError> {
        let external =
            geometry::scene_transform(&transform).ok_or(CameraError::SingularTransform)?;
        self.transform = Some(transform);
        self.external_transform = Some(external);
        Ok(())
    }

    /// Builds `[[R, t], [0, 0, 0, 1]]` from a 3x3 rotation and a length-3 translation and
    /// sets it as the primary transform.
    pub fn set_rotation_translation(
        &mut self,
        rotation: &DMatrix<f64>,
        translation: &DVector<f64>,
    ) -> Result<(), CameraError> {
        validation::validate_shape("rotation", rotation.shape(), (3, 3))?;
        validation::validate_shape("translation", translation.shape(), (3, 1))?;
        let rotation = Matrix3::from_fn(|r, c| rotation[(r, c)]);
        let translation = Vector3::new(translation[0], translation[1], translation[2]);
        self.set_rotation_translation_matrix(&rotation, &translation)
    }

    pub fn set_rotation_translation_matrix(
        &mut self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<(), CameraError> {
        self.set_transform_matrix(geometry::rigid_transform(rotation, translation))
    }

    /// Back-computes the focal length in millimeters from the intrinsics:
    /// `f_mm = f_px / image_w * sensor_w`.
    ///
    /// Does nothing while image size, sensor size or intrinsics are unknown.
    pub fn compute_focal_length_mm(&mut self) {
        let (Some(image), Some(sensor), Some(f_px)) =
            (self.image_size_px, self.sensor_size_mm, self.f_px())
        else {
            debug!("Focal length not computed, image or sensor size unknown");
            return;
        };
        let f_mm = f_px / image.1 as f64 * sensor.1;
        if validation::validate_focal_length(f_mm).is_err() {
            warn!("Ignoring non-positive focal length estimate {f_mm} mm");
            return;
        }
        self.focal_length_mm = Some(f_mm);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn set_focal_length_mm(&mut self, f_mm: f64) -> Result<(), CameraError> {
        validation::validate_focal_length(f_mm)?;
        self.focal_length_mm = Some(f_mm);
        Ok(())
    }

    pub fn set_sensor_size_mm(&mut self, sensor_size_mm: (f64, f64)) -> Result<(), CameraError> {
        validation::validate_size(sensor_size_mm)?;
        self.sensor_size_mm = Some(sensor_size_mm);
        Ok(())
    }

    pub fn set_image_size_px(&mut self, image_size_px: (u32, u32)) -> Result<(), CameraError> {
        validation::validate_size((image_size_px.0 as f64, image_size_px.1 as f64))?;
        self.image_size_px = Some(image_size_px);
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn focal_length_mm(&self) -> Option<f64> {
        self.focal_length_mm
    }

    /// Sensor size `(height, width)` in millimeters.
    pub fn sensor_size_mm(&self) -> Option<(f64, f64)> {
        self.sensor_size_mm
    }

    /// Image size `(height, width)` in pixels.
    pub fn image_size_px(&self) -> Option<(u32, u32)> {
        self.image_size_px
    }

    pub fn intrinsics(&self) -> Option<&Matrix3<f64>> {
        self.intrinsics.as_ref()
    }

    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub fn distortion(&self) -> Option<&[f64; 5]> {
        self.distortion.as_ref()
    }

    /// The primary transform, in the vision-library convention.
    pub fn transform(&self) -> Option<&Matrix4<f64>> {
        self.transform.as_ref()
    }

    /// The transform in the scene-tool convention, derived from [`transform`](Self::transform).
    pub fn external_transform(&self) -> Option<&Matrix4<f64>> {
        self.external_transform.as_ref()
    }

    pub fn fx(&self) -> Option<f64> {
        self.intrinsics.map(|k| k[(0, 0)])
    }

    pub fn fy(&self) -> Option<f64> {
        self.intrinsics.map(|k| k[(1, 1)])
    }

    pub fn cx(&self) -> Option<f64> {
        self.intrinsics.map(|k| k[(0, 2)])
    }

    pub fn cy(&self) -> Option<f64> {
        self.intrinsics.map(|k| k[(1, 2)])
    }

    /// Mean pixel focal length `(fx + fy) / 2`.
    pub fn f_px(&self) -> Option<f64> {
        self.intrinsics.map(|k| (k[(0, 0)] + k[(1, 1)]) / 2.0)
    }

    fn clear_transform(&mut self) {
        self.transform = None;
        self.external_transform = None;
    }
}

fn intrinsics_from_focal_length(
    f_mm: f64,
    (sensor_h, sensor_w): (f64, f64),
    (image_h, image_w): (u32, u32),
) -> Matrix3<f64> {
    let (image_h, image_w) = (image_h as f64, image_w as f64);
    let fx = f_mm / sensor_w * image_w;
    let fy = f_mm / sensor_h * image_h;
    Matrix3::new(fx, 0.0, image_w / 2.0, 0.0, fy, image_h / 2.0, 0.0, 0.0, 1.0)
}

fn field_mismatch(field: &str, expected: &'static str) -> PersistError {
    PersistError::FieldType {
        field: field.to_string(),
        expected,
    }
}

fn restore_matrix<const R: usize, const C: usize>(
    field: &str,
    what: &'static str,
    value: &FieldValue,
) -> Result<SMatrix<f64, R, C>, PersistError> {
    let (values, shape) = value
        .as_matrix()
        .ok_or_else(|| field_mismatch(field, "numeric matrix"))?;
    validation::validate_shape(what, shape, (R, C))?;
    Ok(SMatrix::<f64, R, C>::from_row_slice(&values))
}

fn restore_pair(field: &str, value: &FieldValue) -> Result<(f64, f64), PersistError> {
    let pair: SMatrix<f64, 1, 2> = restore_matrix(field, "size", value)?;
    Ok((pair[0], pair[1]))
}

fn restore_pixel_size(field: &str, value: &FieldValue) -> Result<(u32, u32), PersistError> {
    let items = value
        .as_list()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| field_mismatch(field, "[height, width]"))?;
    let to_u32 = |v: &FieldValue| {
        v.as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| field_mismatch(field, "non-negative integer"))
    };
    Ok((to_u32(&items[0])?, to_u32(&items[1])?))
}

fn pair_value<T: Into<FieldValue>>((a, b): (T, T)) -> FieldValue {
    FieldValue::List(vec![a.into(), b.into()])
}

impl Persist for PinholeCamera {
    fn fields(&self) -> FieldMap {
        let mut data = FieldMap::new();
        data.insert("name".to_string(), self.name.clone().into());
        data.insert("focal_length_mm".to_string(), self.focal_length_mm.into());
        data.insert(
            "sensor_size_mm".to_string(),
            self.sensor_size_mm.map_or(FieldValue::Null, pair_value),
        );
        data.insert(
            "image_size_px".to_string(),
            self.image_size_px
                .map_or(FieldValue::Null, |(h, w)| pair_value((h as i64, w as i64))),
        );
        data.insert(
            "intrinsics".to_string(),
            self.intrinsics.as_ref().map_or(FieldValue::Null, FieldValue::matrix),
        );
        data.insert(
            "distortion".to_string(),
            self.distortion.map_or(FieldValue::Null, |d| {
                FieldValue::matrix(&SMatrix::<f64, 1, 5>::from_row_slice(&d))
            }),
        );
        data.insert(
            "transform".to_string(),
            self.transform.as_ref().map_or(FieldValue::Null, FieldValue::matrix),
        );
        data.insert(
            "external_transform".to_string(),
            self.external_transform
                .as_ref()
                .map_or(FieldValue::Null, FieldValue::matrix),
        );
        data
    }

    fn restore_field(&mut self, name: &str, value: FieldValue) -> Result<(), PersistError> {
        match name {
            "name" => {
                self.name = match value {
                    FieldValue::Null => None,
                    FieldValue::Str(s) => Some(s),
                    _ => return Err(field_mismatch(name, "string")),
                }
            }
            "focal_length_mm" => {
                self.focal_length_mm = match value {
                    FieldValue::Null => None,
                    v => Some(v.as_f64().ok_or_else(|| field_mismatch(name, "number"))?),
                }
            }
            "sensor_size_mm" => {
                self.sensor_size_mm = match value {
                    FieldValue::Null => None,
                    v => Some(restore_pair(name, &v)?),
                }
            }
            "image_size_px" => {
                self.image_size_px = match value {
                    FieldValue::Null => None,
                    v => Some(restore_pixel_size(name, &v)?),
                }
            }
            "intrinsics" => {
                self.intrinsics = match value {
                    FieldValue::Null => None,
                    v => Some(restore_matrix::<3, 3>(name, "intrinsics", &v)?),
                }
            }
            "distortion" => {
                self.distortion = match value {
                    FieldValue::Null => None,
                    v => {
                        let d = restore_matrix::<1, 5>(name, "distortion", &v)?;
                        Some([d[0], d[1], d[2], d[3], d[4]])
                    }
                }
            }
            "transform" => match value {
                FieldValue::Null => self.clear_transform(),
                v => self.set_transform_matrix(restore_matrix::<4, 4>(name, "transform", &v)?)?,
            },
            // Derived from `transform`, the stored copy is never trusted.
            "external_transform" => {}
            other => warn!("Ignoring unknown camera field '{other}'"),
        }
        Ok(())
    }

    /// Restores every field on a copy and keeps it only if all of them succeed.
    fn restore_fields(&mut self, data: FieldMap) -> Result<(), PersistError> {
        let mut staged = self.clone();
        for (name, value) in data {
            staged.restore_field(&name, value)?;
        }
        *self = staged;
        Ok(())
    }
}

impl fmt::Display for PinholeCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PinholeCamera:")?;
        writeln!(f, "-----------------------------------")?;
        for (key, value) in self.fields() {
            match value.as_matrix() {
                Some((values, (rows, cols))) if rows > 1 => {
                    writeln!(f, " - {key}:")?;
                    for row in values.chunks(cols) {
                        writeln!(f, "\t{row:?}")?;
                    }
                }
                _ => writeln!(f, " - {key}: {}", display_value(&value))?,
            }
        }
        Ok(())
    }
}

fn display_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Null => "None".to_string(),
        FieldValue::Bool(b) => b.to_string(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Float(x) => x.to_string(),
        FieldValue::Str(s) => s.clone(),
        FieldValue::List(items) => format!(
            "[{}]",
            items.iter().map(display_value).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Contains unit tests for the pinhole camera.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{self, FieldMap};
    use approx::assert_relative_eq;

    fn flip() -> Matrix4<f64> {
        Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, -1.0, -1.0, 1.0))
    }

    /// Tests the quick default configuration against hand-computed values.
    #[test]
    fn test_quick_default_consistency() {
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();

        assert_eq!(cam.focal_length_mm(), Some(50.0));
        assert_eq!(cam.sensor_size_mm(), Some((20.25, 36.0)));
        assert_eq!(cam.image_size_px(), Some((1080, 1920)));
        assert_eq!(cam.distortion(), Some(&[0.0; 5]));

        let expected = Matrix3::new(
            2666.6666666666665,
            0.0,
            960.0,
            0.0,
            2666.6666666666665,
            540.0,
            0.0,
            0.0,
            1.0,
        );
        assert_relative_eq!(*cam.intrinsics().unwrap(), expected, epsilon = 1e-6);
        assert_relative_eq!(*cam.transform().unwrap(), Matrix4::identity(), epsilon = 1e-12);
        assert_relative_eq!(*cam.external_transform().unwrap(), flip(), epsilon = 1e-12);
    }

    #[test]
    fn test_quick_init_matches_quick_default() {
        let mut a = PinholeCamera::new();
        a.quick_default().unwrap();
        let mut b = PinholeCamera::new();
        b.quick_init(50.0, (20.25, 36.0), (1080, 1920)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scalar_accessors() {
        let mut cam = PinholeCamera::new();
        assert_eq!(cam.fx(), None);
        assert_eq!(cam.f_px(), None);

        cam.set_intrinsics_direct(1000.0, 1010.0, 320.0, 240.0, 0.5);
        assert_eq!(cam.fx(), Some(1000.0));
        assert_eq!(cam.fy(), Some(1010.0));
        assert_eq!(cam.cx(), Some(320.0));
        assert_eq!(cam.cy(), Some(240.0));
        assert_eq!(cam.f_px(), Some(1005.0));
        assert_eq!(cam.intrinsics().unwrap()[(0, 1)], 0.5);
    }

    #[test]
    fn test_set_transform_rejects_wrong_shape() {
        let mut cam = PinholeCamera::new();
        let err = cam.set_transform(&DMatrix::identity(3, 4)).unwrap_err();
        assert!(matches!(
            err,
            CameraError::Shape {
                rows: 3,
                cols: 4,
                ..
            }
        ));
        assert!(cam.transform().is_none());
        assert!(cam.external_transform().is_none());
    }

    #[test]
    fn test_singular_transform_keeps_previous_state() {
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();
        let err = cam.set_transform_matrix(Matrix4::zeros()).unwrap_err();
        assert!(matches!(err, CameraError::SingularTransform));
        assert_eq!(cam.transform(), Some(&Matrix4::identity()));
        assert_eq!(cam.external_transform(), Some(&flip()));
    }

    #[test]
    fn test_external_transform_follows_every_set() {
        let mut cam = PinholeCamera::new();
        let rotation = geometry::rotation_from_rodrigues(&Vector3::new(0.1, -0.2, 0.3));
        let translation = Vector3::new(0.5, -1.0, 2.0);
        let transform = geometry::rigid_transform(&rotation, &translation);

        cam.set_transform_matrix(transform).unwrap();
        let first = *cam.external_transform().unwrap();
        // Repeated reads are stable.
        assert_eq!(cam.external_transform(), Some(&first));
        assert_relative_eq!(first, transform.try_inverse().unwrap() * flip(), epsilon = 1e-12);

        cam.set_transform_matrix(Matrix4::identity()).unwrap();
        assert_relative_eq!(*cam.external_transform().unwrap(), flip(), epsilon = 1e-12);
    }

    #[test]
    fn test_set_rotation_translation() {
        let mut cam = PinholeCamera::new();
        let rotation = DMatrix::<f64>::identity(3, 3);
        let translation = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        cam.set_rotation_translation(&rotation, &translation).unwrap();

        let transform = cam.transform().unwrap();
        assert_eq!(transform[(0, 3)], 1.0);
        assert_eq!(transform[(1, 3)], 2.0);
        assert_eq!(transform[(2, 3)], 3.0);
        assert_eq!(transform[(3, 3)], 1.0);
        assert_eq!(transform[(3, 0)], 0.0);
        assert!(cam.external_transform().is_some());

        let err = cam
            .set_rotation_translation(&rotation, &DVector::from_vec(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, CameraError::Shape { what: "translation", .. }));
    }

    #[test]
    fn test_intrinsics_from_focal_length_requires_all_inputs() {
        let mut cam = PinholeCamera::new();
        let err = cam
            .set_intrinsics_from_focal_length(Some(16.0), Some((7.5, 10.0)), None)
            .unwrap_err();
        assert!(matches!(err, CameraError::MissingParameter("image_size_px")));
        assert!(cam.intrinsics().is_none());

        // Previously stored values are picked up.
        cam.set_intrinsics_from_focal_length(None, None, Some((960, 1280)))
            .unwrap();
        assert_relative_eq!(cam.fx().unwrap(), 16.0 / 10.0 * 1280.0);
        assert_relative_eq!(cam.fy().unwrap(), 16.0 / 7.5 * 960.0);
        assert_eq!(cam.cx(), Some(640.0));
        assert_eq!(cam.cy(), Some(480.0));
    }

    #[test]
    fn test_invalid_focal_length() {
        let mut cam = PinholeCamera::new();
        assert!(matches!(
            cam.set_focal_length_mm(0.0),
            Err(CameraError::FocalLengthMustBePositive)
        ));
        assert!(cam.focal_length_mm().is_none());
    }

    #[test]
    fn test_compute_focal_length_mm() {
        let mut cam = PinholeCamera::new();
        cam.set_intrinsics_direct(2049.07412, 2049.07412, 640.06, 479.23, 0.0);

        cam.compute_focal_length_mm();
        assert_eq!(cam.focal_length_mm(), None);

        cam.set_sensor_size_mm((7.5, 10.0)).unwrap();
        cam.set_image_size_px((960, 1280)).unwrap();
        cam.compute_focal_length_mm();
        assert_relative_eq!(cam.focal_length_mm().unwrap(), 16.0084, epsilon = 1e-4);
    }

    #[test]
    fn test_distortion_shape() {
        let mut cam = PinholeCamera::new();
        let err = cam.set_distortion(&DMatrix::zeros(5, 1)).unwrap_err();
        assert!(matches!(err, CameraError::Shape { what: "distortion", .. }));

        cam.set_distortion(&DMatrix::from_row_slice(1, 5, &[0.1, 0.2, 0.3, 0.4, 0.5]))
            .unwrap();
        assert_eq!(cam.distortion(), Some(&[0.1, 0.2, 0.3, 0.4, 0.5]));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();
        let mut copy = cam.clone();
        copy.set_name("0001");
        copy.set_rotation_translation_matrix(&Matrix3::identity(), &Vector3::new(0.0, 0.0, 5.0))
            .unwrap();

        assert_eq!(cam.name(), None);
        assert_eq!(cam.transform(), Some(&Matrix4::identity()));
        assert_eq!(copy.transform().unwrap()[(2, 3)], 5.0);
    }

    /// Tests saving and restoring a camera with every supported encoding.
    #[test]
    fn test_serializing_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();
        cam.set_name("cam0");
        cam.set_distortion_coefficients(-4.4e-4, 1.95e-2, -1.0e-4, 6.85e-5, -1.17e-1);
        cam.set_rotation_translation_matrix(
            &geometry::rotation_from_rodrigues(&Vector3::new(0.3, 0.2, -0.1)),
            &Vector3::new(0.1, 0.2, 1.5),
        )
        .unwrap();

        for ext in ["bin", "yaml", "json"] {
            let path = dir.path().join(format!("test.{ext}"));
            persist::save(&cam, &path).unwrap();

            let mut restored = PinholeCamera::new();
            persist::load(&mut restored, &path).unwrap();

            assert_eq!(restored.name(), Some("cam0"));
            assert_eq!(restored.focal_length_mm(), cam.focal_length_mm());
            assert_eq!(restored.sensor_size_mm(), cam.sensor_size_mm());
            assert_eq!(restored.image_size_px(), cam.image_size_px());
            assert_relative_eq!(*restored.intrinsics().unwrap(), *cam.intrinsics().unwrap(), epsilon = 1e-9);
            assert_relative_eq!(*restored.transform().unwrap(), *cam.transform().unwrap(), epsilon = 1e-9);
            assert_relative_eq!(
                *restored.external_transform().unwrap(),
                *cam.external_transform().unwrap(),
                epsilon = 1e-9
            );
            for (a, b) in restored.distortion().unwrap().iter().zip(cam.distortion().unwrap()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_quick_default_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();

        for ext in ["bin", "yaml", "json"] {
            let path = dir.path().join(format!("default.{ext}"));
            persist::save(&cam, &path).unwrap();

            let mut restored = PinholeCamera::new();
            persist::load(&mut restored, &path).unwrap();
            assert_relative_eq!(*restored.intrinsics().unwrap(), *cam.intrinsics().unwrap(), epsilon = 1e-9);
            assert_eq!(restored.transform(), Some(&Matrix4::identity()));
            assert_eq!(restored.external_transform(), Some(&flip()));
            assert_eq!(restored.external_transform(), cam.external_transform(), "encoding {ext}");
            assert_eq!(restored.image_size_px(), cam.image_size_px());
            assert_eq!(restored.distortion(), cam.distortion());
        }
    }

    #[test]
    fn test_failed_restore_leaves_camera_unchanged() {
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();
        let before = cam.clone();

        // Keys apply in order, the valid focal length comes before the bad intrinsics.
        let data = FieldMap::from([
            ("focal_length_mm".to_string(), FieldValue::Float(35.0)),
            ("intrinsics".to_string(), FieldValue::matrix(&Matrix4::<f64>::identity())),
            ("name".to_string(), FieldValue::from("cam1")),
        ]);
        let err = persist::from_map(&mut cam, data).unwrap_err();
        assert!(matches!(err, PersistError::Camera(CameraError::Shape { .. })));
        assert_eq!(cam, before);

        let data = FieldMap::from([
            ("_name".to_string(), FieldValue::from("cam1")),
            ("transform".to_string(), FieldValue::matrix(&Matrix4::<f64>::zeros())),
        ]);
        let err = persist::from_map(&mut cam, data).unwrap_err();
        assert!(matches!(err, PersistError::Camera(CameraError::SingularTransform)));
        assert_eq!(cam, before);
    }

    #[test]
    fn test_restore_recomputes_external_transform() {
        let mut cam = PinholeCamera::new();
        let data = FieldMap::from([
            ("_transform".to_string(), FieldValue::matrix(&Matrix4::<f64>::identity())),
            ("_external_transform".to_string(), FieldValue::matrix(&Matrix4::<f64>::zeros())),
        ]);
        persist::from_map(&mut cam, data).unwrap();
        assert_eq!(cam.external_transform(), Some(&flip()));
    }

    #[test]
    fn test_restore_rejects_bad_shapes() {
        let mut cam = PinholeCamera::new();
        let data = FieldMap::from([(
            "intrinsics".to_string(),
            FieldValue::matrix(&Matrix4::<f64>::identity()),
        )]);
        let err = persist::from_map(&mut cam, data).unwrap_err();
        assert!(matches!(err, PersistError::Camera(CameraError::Shape { .. })));

        let data = FieldMap::from([("name".to_string(), FieldValue::Int(3))]);
        let err = persist::from_map(&mut cam, data).unwrap_err();
        assert!(matches!(err, PersistError::FieldType { .. }));
    }

    #[test]
    fn test_display_lists_fields() {
        let mut cam = PinholeCamera::new();
        cam.quick_default().unwrap();
        let text = cam.to_string();
        assert!(text.starts_with("PinholeCamera:"));
        assert!(text.contains(" - focal_length_mm: 50"));
        assert!(text.contains(" - name: None"));
        assert!(text.contains(" - intrinsics:"));
    }
}

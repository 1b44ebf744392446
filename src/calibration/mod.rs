//! ChArUco calibration pipeline.
//!
//! [`Calibration`] drives a [`VisionBackend`] over the frames of a [`FrameSource`]:
//! intrinsic calibration collects the board corners of every usable frame and hands them
//! to the solver, extrinsic calibration estimates one board pose per frame and returns a
//! copy of the calibrated camera for each.

pub mod backend;
pub mod board;

#[cfg(test)]
pub(crate) mod test_utils;

pub use backend::{BackendError, Detection, IntrinsicEstimate, Pose, TermCriteria, VisionBackend};
pub use board::{ArucoDictionary, CharucoBoard};

use log::{debug, info, warn};
use std::path::Path;

use crate::camera::{CameraError, PinholeCamera};
use crate::geometry;
use crate::settings::{ParamKind, Settings, SettingsError};
use crate::stream::{filename_stem, FrameSource, StreamError};

/// PnP needs at least this many correspondences.
pub const MIN_PNP_CORNERS: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Unknown ArUco dictionary {0}, supported are DICT_4X4, DICT_5X5, DICT_6X6, DICT_7X7")]
    UnknownDictionary(String),
    #[error("Invalid calibration board: {0}")]
    InvalidBoard(String),
    #[error("Insufficient calibration data: {found} usable images, at least {required} required")]
    InsufficientData { found: usize, required: usize },
    #[error("Extrinsic calibration needs intrinsics and distortion")]
    MissingIntrinsics,
    #[error("Detected corner id {0} is not on the board")]
    UnknownCornerId(usize),
    #[error("Frame {0} carries no image data usable for detection")]
    UnsupportedFrame(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Calibration parameters read from a settings document.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub dictionary: ArucoDictionary,
    pub cols: usize,
    pub rows: usize,
    pub square_size: f64,
    pub marker_size: f64,
    pub min_number_of_corners: usize,
    pub min_number_of_calibration_images: usize,
    pub criteria: TermCriteria,
    /// `(height, width)` in millimeters, set when both sensor dimensions are configured.
    pub sensor_size_mm: Option<(f64, f64)>,
    /// Known focal length, only used to report the estimation error.
    pub f_mm: Option<f64>,
}

impl CalibrationConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, CalibrationError> {
        settings.ensure("aruco_dict", ParamKind::Str)?;
        settings.ensure("cols", ParamKind::Int)?;
        settings.ensure("rows", ParamKind::Int)?;
        settings.ensure("square_size", ParamKind::Float)?;
        settings.ensure("marker_size", ParamKind::Float)?;
        settings.ensure("min_number_of_corners", ParamKind::Int)?;
        settings.ensure("min_number_of_calibration_images", ParamKind::Int)?;

        let defaults = TermCriteria::default();
        let max_count = if settings.contains("max_count") {
            settings.get_usize("max_count")?
        } else {
            defaults.max_count
        };
        let epsilon = settings.opt_f64("epsilon")?.unwrap_or(defaults.epsilon);

        let sensor_size_mm = match (
            settings.opt_f64("sensor_height_mm")?,
            settings.opt_f64("sensor_width_mm")?,
        ) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        };

        Ok(Self {
            dictionary: settings.get_str("aruco_dict")?.parse()?,
            cols: settings.get_usize("cols")?,
            rows: settings.get_usize("rows")?,
            square_size: settings.get_f64("square_size")?,
            marker_size: settings.get_f64("marker_size")?,
            min_number_of_corners: settings.get_usize("min_number_of_corners")?,
            min_number_of_calibration_images: settings
                .get_usize("min_number_of_calibration_images")?,
            criteria: TermCriteria { max_count, epsilon },
            sensor_size_mm,
            f_mm: settings.opt_f64("f_mm")?,
        })
    }

    pub fn board(&self) -> Result<CharucoBoard, CalibrationError> {
        CharucoBoard::new(
            self.dictionary,
            self.cols,
            self.rows,
            self.square_size,
            self.marker_size,
        )
    }
}

/// Solver statistics of an intrinsic calibration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationReport {
    pub rms: f64,
    /// Names of the frames accepted for calibration, in view order.
    pub frames: Vec<String>,
    pub per_view_errors: Vec<f64>,
    pub std_dev_intrinsics: Vec<f64>,
    pub std_dev_extrinsics: Vec<f64>,
}

const INTRINSIC_LABELS: [&str; 18] = [
    "fx", "fy", "cx", "cy", "k1", "k2", "p1", "p2", "k3", "k4", "k5", "k6", "s1", "s2", "s3",
    "s4", "tau_x", "tau_y",
];
const EXTRINSIC_LABELS: [&str; 6] = ["rx", "ry", "rz", "tx", "ty", "tz"];

impl CalibrationReport {
    /// Writes the report as `quantity,index,label,value` rows.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["quantity", "index", "label", "value"])?;
        write_row(&mut writer, "rms", 0, "", self.rms)?;
        for (i, error) in self.per_view_errors.iter().enumerate() {
            let label = self.frames.get(i).map_or("", String::as_str);
            write_row(&mut writer, "per_view_error", i, label, *error)?;
        }
        for (i, std_dev) in self.std_dev_intrinsics.iter().enumerate() {
            let label = INTRINSIC_LABELS.get(i).copied().unwrap_or_default();
            write_row(&mut writer, "std_dev_intrinsics", i, label, *std_dev)?;
        }
        for (i, std_dev) in self.std_dev_extrinsics.iter().enumerate() {
            let view = self.frames.get(i / 6).map_or("", String::as_str);
            let label = format!("{view}:{}", EXTRINSIC_LABELS[i % 6]);
            write_row(&mut writer, "std_dev_extrinsics", i, &label, *std_dev)?;
        }
        writer.flush()?;
        info!("Calibration report written to {}", path.display());
        Ok(())
    }
}

fn write_row<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    quantity: &str,
    index: usize,
    label: &str,
    value: f64,
) -> Result<(), csv::Error> {
    writer.write_record([
        quantity,
        index.to_string().as_str(),
        label,
        value.to_string().as_str(),
    ])
}

/// Calibrated camera together with the solver statistics.
#[derive(Debug, Clone)]
pub struct IntrinsicCalibration {
    pub camera: PinholeCamera,
    pub report: CalibrationReport,
}

/// Calibration driver for a single ChArUco board.
#[derive(Debug, Clone)]
pub struct Calibration {
    config: CalibrationConfig,
    board: CharucoBoard,
}

impl Calibration {
    pub fn new(config: CalibrationConfig) -> Result<Self, CalibrationError> {
        let board = config.board()?;
        Ok(Self { config, board })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, CalibrationError> {
        Self::new(CalibrationConfig::from_settings(settings)?)
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn board(&self) -> &CharucoBoard {
        &self.board
    }

    /// Calibrates intrinsics and distortion from the frames of `stream`.
    ///
    /// The stream is rewound and each frame is visited once, also when it loops.
    /// Frames without detection or with fewer than `min_number_of_corners` corners are
    /// skipped. When the sensor size is configured the returned camera also carries sensor
    /// size, image size and the back-computed focal length.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientData`] if the stream holds, or the detector accepts,
    ///   fewer than `min_number_of_calibration_images` frames.
    pub fn calibrate_intrinsics<S, B>(
        &self,
        stream: &mut S,
        backend: &B,
    ) -> Result<IntrinsicCalibration, CalibrationError>
    where
        S: FrameSource + ?Sized,
        B: VisionBackend + ?Sized,
    {
        let required = self.config.min_number_of_calibration_images;
        if stream.len() < required {
            return Err(CalibrationError::InsufficientData {
                found: stream.len(),
                required,
            });
        }

        let mut detections = Vec::new();
        let mut frames = Vec::new();
        let mut image_size = None;
        stream.reset();
        for index in 0..stream.len() {
            let Some(frame) = stream.next()? else { break };
            let label = frame_label(stream, index);
            let gray = frame
                .to_gray()
                .ok_or_else(|| CalibrationError::UnsupportedFrame(label.clone()))?;
            let size = *image_size.get_or_insert(gray.dimensions());
            if gray.dimensions() != size {
                warn!("Frame {label} skipped, size {:?} differs from {size:?}", gray.dimensions());
                continue;
            }
            match backend.detect(&gray, &self.board, &self.config.criteria)? {
                Some(detection) if detection.len() >= self.config.min_number_of_corners => {
                    debug!("Frame {label} accepted with {} corners", detection.len());
                    detections.push(detection);
                    frames.push(label);
                }
                Some(detection) => debug!(
                    "Frame {label} skipped, {} corners below {}",
                    detection.len(),
                    self.config.min_number_of_corners
                ),
                None => debug!("Frame {label} skipped, no markers found"),
            }
        }

        if detections.len() < required || detections.is_empty() {
            return Err(CalibrationError::InsufficientData {
                found: detections.len(),
                required: required.max(1),
            });
        }
        info!("{} valid captures", detections.len());
        let image_size = image_size.ok_or(CalibrationError::InsufficientData {
            found: 0,
            required: required.max(1),
        })?;

        let estimate = backend.calibrate(&detections, &self.board, image_size)?;
        info!("Reprojection error: {}", estimate.rms);

        let mut camera = PinholeCamera::new();
        camera.set_intrinsics_matrix(estimate.intrinsics);
        let [k1, k2, p1, p2, k3] = estimate.distortion;
        camera.set_distortion_coefficients(k1, k2, p1, p2, k3);
        if let Some(sensor) = self.config.sensor_size_mm {
            camera.set_sensor_size_mm(sensor)?;
            camera.set_image_size_px((image_size.1, image_size.0))?;
            camera.compute_focal_length_mm();
        }
        if let (Some(expected), Some(estimated)) = (self.config.f_mm, camera.focal_length_mm()) {
            info!(
                "Focal length: {expected} mm, estimated {estimated} mm, error {} mm",
                (estimated - expected).abs()
            );
        }

        Ok(IntrinsicCalibration {
            camera,
            report: CalibrationReport {
                rms: estimate.rms,
                frames,
                per_view_errors: estimate.per_view_errors,
                std_dev_intrinsics: estimate.std_dev_intrinsics,
                std_dev_extrinsics: estimate.std_dev_extrinsics,
            },
        })
    }

    /// Estimates the board pose in every frame of `stream`.
    ///
    /// The stream is rewound and each frame is visited once, also when it loops.
    ///
    /// Each frame is undistorted with the intrinsics of `camera` before detection. Frames
    /// without detection, with fewer than [`MIN_PNP_CORNERS`] corners or where PnP fails
    /// are skipped. Every accepted frame yields a copy of `camera` named after the frame
    /// file with the board pose as its transform.
    pub fn calibrate_extrinsics<S, B>(
        &self,
        stream: &mut S,
        camera: &PinholeCamera,
        backend: &B,
    ) -> Result<Vec<PinholeCamera>, CalibrationError>
    where
        S: FrameSource + ?Sized,
        B: VisionBackend + ?Sized,
    {
        let (Some(intrinsics), Some(distortion)) = (camera.intrinsics(), camera.distortion())
        else {
            return Err(CalibrationError::MissingIntrinsics);
        };

        let mut cameras = Vec::new();
        stream.reset();
        for index in 0..stream.len() {
            let Some(frame) = stream.next()? else { break };
            let name = frame_label(stream, index);
            let undistorted = backend.undistort(&frame, intrinsics, distortion)?;
            let gray = undistorted
                .to_gray()
                .ok_or_else(|| CalibrationError::UnsupportedFrame(name.clone()))?;

            let detection = match backend.detect(&gray, &self.board, &self.config.criteria)? {
                Some(detection) if detection.len() >= MIN_PNP_CORNERS => detection,
                Some(detection) => {
                    warn!("Frame {name} skipped, {} corners are too few for PnP", detection.len());
                    continue;
                }
                None => {
                    warn!("Frame {name} skipped, no markers found");
                    continue;
                }
            };

            let object_points = detection
                .ids
                .iter()
                .take(detection.len())
                .map(|&id| {
                    self.board
                        .object_point(id)
                        .ok_or(CalibrationError::UnknownCornerId(id))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let image_points = &detection.corners[..detection.len()];

            let Some(pose) =
                backend.solve_pnp(&object_points, image_points, intrinsics, distortion)?
            else {
                warn!("Frame {name} skipped, PnP did not converge");
                continue;
            };

            let mut view = camera.clone();
            view.set_name(name.as_str());
            view.set_rotation_translation_matrix(
                &geometry::rotation_from_rodrigues(&pose.rvec),
                &pose.tvec,
            )?;
            debug!("Frame {name} registered");
            cameras.push(view);
        }
        info!("Extrinsics estimated for {} frames", cameras.len());
        Ok(cameras)
    }
}

/// Frame name used for logging and camera naming: the stem of the current file.
fn frame_label<S: FrameSource + ?Sized>(stream: &S, index: usize) -> String {
    stream
        .current_filename()
        .and_then(filename_stem)
        .map_or_else(|| format!("{index:06}"), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::test_utils::{calibration_settings, write_frames, ScriptedBackend};
    use super::*;
    use crate::stream::{DirectoryScan, FileFrameSource, FrameInput};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix4, Vector3};
    use serde_yaml::Value;

    fn calibration() -> Calibration {
        Calibration::from_settings(&calibration_settings()).unwrap()
    }

    fn directory_source(dir: &Path) -> FileFrameSource {
        FileFrameSource::open(FrameInput::Directory(DirectoryScan::new(dir))).unwrap()
    }

    #[test]
    fn test_config_from_settings() {
        let config = CalibrationConfig::from_settings(&calibration_settings()).unwrap();
        assert_eq!(config.dictionary, ArucoDictionary::Dict6x6);
        assert_eq!((config.cols, config.rows), (5, 4));
        assert_eq!(config.min_number_of_corners, 6);
        assert_eq!(config.min_number_of_calibration_images, 3);
        assert_eq!(config.criteria, TermCriteria::default());
        assert_eq!(config.sensor_size_mm, Some((7.5, 10.0)));
        assert_eq!(config.f_mm, None);
    }

    #[test]
    fn test_config_type_checks() {
        let mut settings = calibration_settings();
        settings.set("square_size", 1);
        let err = CalibrationConfig::from_settings(&settings).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Settings(SettingsError::MissingParameter { .. })
        ));

        let mut settings = calibration_settings();
        settings.set("aruco_dict", "DICT_3X3");
        assert!(matches!(
            CalibrationConfig::from_settings(&settings).unwrap_err(),
            CalibrationError::UnknownDictionary(_)
        ));

        let mut settings = calibration_settings();
        settings.from_map([("max_count", Value::from(30)), ("epsilon", Value::from(0.001))]);
        let config = CalibrationConfig::from_settings(&settings).unwrap();
        assert_eq!(config.criteria.max_count, 30);
        assert_eq!(config.criteria.epsilon, 0.001);
    }

    #[test]
    fn test_intrinsics_skip_weak_frames() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=5);
        let calib = calibration();

        // Frame 2 has no markers and frame 4 too few corners.
        let backend = ScriptedBackend::new(calib.board())
            .with_detection(1, 12)
            .with_detection(3, 8)
            .with_detection(4, 3)
            .with_detection(5, 6);
        let mut source = directory_source(dir.path());
        let result = calib.calibrate_intrinsics(&mut source, &backend).unwrap();

        assert_eq!(result.report.frames, ["0001", "0003", "0005"]);
        assert_eq!(backend.calibrated_views(), 3);
        assert_eq!(result.report.rms, 0.25);

        let camera = result.camera;
        assert_eq!(camera.fx(), Some(2049.07412));
        assert_eq!(camera.distortion().unwrap()[0], -0.1);
        assert_eq!(camera.sensor_size_mm(), Some((7.5, 10.0)));
        assert_eq!(camera.image_size_px(), Some((3, 4)));
        assert_relative_eq!(camera.focal_length_mm().unwrap(), 2049.07412 / 4.0 * 10.0);
        assert!(camera.transform().is_none());
    }

    #[test]
    fn test_intrinsics_insufficient_data() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=2);
        let calib = calibration();
        let backend = ScriptedBackend::new(calib.board()).with_detection(1, 12);

        let err = calib
            .calibrate_intrinsics(&mut directory_source(dir.path()), &backend)
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData {
                found: 2,
                required: 3
            }
        ));

        write_frames(dir.path(), 3..=4);
        let err = calib
            .calibrate_intrinsics(&mut directory_source(dir.path()), &backend)
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData {
                found: 1,
                required: 3
            }
        ));
    }

    #[test]
    fn test_extrinsics_one_camera_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=3);
        let calib = calibration();
        let pose = Pose {
            rvec: Vector3::zeros(),
            tvec: Vector3::new(0.1, -0.2, 1.5),
        };
        let backend = ScriptedBackend::new(calib.board())
            .with_detection(1, 12)
            .with_detection(2, 3)
            .with_detection(3, 4)
            .with_pose(pose);

        let mut intrinsics = PinholeCamera::new();
        intrinsics.set_intrinsics_direct(1000.0, 1000.0, 2.0, 1.5, 0.0);
        intrinsics.set_distortion_coefficients(0.0, 0.0, 0.0, 0.0, 0.0);

        let cameras = calib
            .calibrate_extrinsics(&mut directory_source(dir.path()), &intrinsics, &backend)
            .unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].name(), Some("0001"));
        assert_eq!(cameras[1].name(), Some("0003"));

        let transform = cameras[0].transform().unwrap();
        let mut expected = Matrix4::identity();
        expected[(0, 3)] = 0.1;
        expected[(1, 3)] = -0.2;
        expected[(2, 3)] = 1.5;
        assert_relative_eq!(*transform, expected, epsilon = 1e-12);
        assert!(cameras[0].external_transform().is_some());
        assert_eq!(cameras[0].intrinsics(), intrinsics.intrinsics());
        assert!(intrinsics.name().is_none());

        // Object points handed to PnP follow the detected ids.
        let calls = backend.pnp_object_points();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calib.board().object_points());
    }

    #[test]
    fn test_looping_source_is_visited_once() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=3);
        let calib = calibration();
        let backend = ScriptedBackend::new(calib.board())
            .with_detection(1, 12)
            .with_detection(2, 12)
            .with_detection(3, 12);

        let mut source = directory_source(dir.path());
        source.set_looping(true);
        // Consumed frames are visited again after the rewind.
        source.next().unwrap();
        let result = calib.calibrate_intrinsics(&mut source, &backend).unwrap();
        assert_eq!(result.report.frames, ["0001", "0002", "0003"]);
        assert_eq!(backend.calibrated_views(), 3);

        let cameras = calib
            .calibrate_extrinsics(&mut source, &result.camera, &backend)
            .unwrap();
        assert_eq!(cameras.len(), 3);
        assert_eq!(cameras[2].name(), Some("0003"));
    }

    #[test]
    fn test_extrinsics_requires_intrinsics() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=1);
        let calib = calibration();
        let backend = ScriptedBackend::new(calib.board());
        let err = calib
            .calibrate_extrinsics(
                &mut directory_source(dir.path()),
                &PinholeCamera::new(),
                &backend,
            )
            .unwrap_err();
        assert!(matches!(err, CalibrationError::MissingIntrinsics));
    }

    #[test]
    fn test_extrinsics_unknown_corner_id() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), 1..=1);
        let calib = calibration();
        let detection = Detection {
            corners: vec![nalgebra::Point2::new(1.0, 1.0); 4],
            ids: vec![0, 1, 2, 99],
        };
        let backend = ScriptedBackend::new(calib.board()).with_raw_detection(1, detection);
        let mut intrinsics = PinholeCamera::new();
        intrinsics.set_intrinsics_matrix(Matrix3::identity());
        intrinsics.set_distortion_coefficients(0.0, 0.0, 0.0, 0.0, 0.0);

        let err = calib
            .calibrate_extrinsics(&mut directory_source(dir.path()), &intrinsics, &backend)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::UnknownCornerId(99)));
    }

    #[test]
    fn test_report_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration_report.csv");
        let report = CalibrationReport {
            rms: 0.5,
            frames: vec!["0001".to_string(), "0002".to_string()],
            per_view_errors: vec![0.4, 0.6],
            std_dev_intrinsics: vec![1.0, 2.0],
            std_dev_extrinsics: vec![0.01; 12],
        };
        report.write_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), ["quantity", "index", "label", "value"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1 + 2 + 2 + 12);
        assert_eq!(&rows[0][3], "0.5");
        assert_eq!(&rows[2][2], "0002");
        assert_eq!(&rows[3][2], "fx");
        assert_eq!(&rows[16][2], "0002:tz");
    }
}

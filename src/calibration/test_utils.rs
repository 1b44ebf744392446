//! Deterministic vision backend and fixtures for pipeline tests.
//!
//! Frames written by [`write_frames`] carry their frame number as pixel value, the
//! [`ScriptedBackend`] looks detections up by that value.

use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde_yaml::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::backend::{BackendError, Detection, IntrinsicEstimate, Pose, TermCriteria, VisionBackend};
use super::board::CharucoBoard;
use crate::settings::Settings;
use crate::stream::Frame;

pub(crate) const SCRIPTED_FX: f64 = 2049.07412;

pub(crate) struct ScriptedBackend {
    board: CharucoBoard,
    detections: HashMap<u8, Detection>,
    pose: Option<Pose>,
    calibrated_views: Cell<usize>,
    pnp_object_points: RefCell<Vec<Vec<Point3<f64>>>>,
}

impl ScriptedBackend {
    pub(crate) fn new(board: &CharucoBoard) -> Self {
        Self {
            board: board.clone(),
            detections: HashMap::new(),
            pose: Some(Pose {
                rvec: Vector3::zeros(),
                tvec: Vector3::new(0.0, 0.0, 1.0),
            }),
            calibrated_views: Cell::new(0),
            pnp_object_points: RefCell::new(Vec::new()),
        }
    }

    /// Frames with pixel value `key` yield the first `corners` board corners.
    pub(crate) fn with_detection(self, key: u8, corners: usize) -> Self {
        let ids: Vec<usize> = (0..corners.min(self.board.corner_count())).collect();
        let corners = ids
            .iter()
            .map(|&id| Point2::new(10.0 + id as f64, 20.0 + id as f64))
            .collect();
        self.with_raw_detection(key, Detection { corners, ids })
    }

    pub(crate) fn with_raw_detection(mut self, key: u8, detection: Detection) -> Self {
        self.detections.insert(key, detection);
        self
    }

    pub(crate) fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = Some(pose);
        self
    }

    pub(crate) fn calibrated_views(&self) -> usize {
        self.calibrated_views.get()
    }

    pub(crate) fn pnp_object_points(&self) -> Vec<Vec<Point3<f64>>> {
        self.pnp_object_points.borrow().clone()
    }
}

impl VisionBackend for ScriptedBackend {
    fn detect(
        &self,
        image: &GrayImage,
        _board: &CharucoBoard,
        _criteria: &TermCriteria,
    ) -> Result<Option<Detection>, BackendError> {
        let key = image.get_pixel(0, 0)[0];
        Ok(self.detections.get(&key).cloned())
    }

    fn calibrate(
        &self,
        detections: &[Detection],
        _board: &CharucoBoard,
        image_size: (u32, u32),
    ) -> Result<IntrinsicEstimate, BackendError> {
        self.calibrated_views.set(detections.len());
        let (w, h) = image_size;
        Ok(IntrinsicEstimate {
            rms: 0.25,
            intrinsics: Matrix3::new(
                SCRIPTED_FX,
                0.0,
                w as f64 / 2.0,
                0.0,
                SCRIPTED_FX,
                h as f64 / 2.0,
                0.0,
                0.0,
                1.0,
            ),
            distortion: [-0.1, 0.01, 0.0, 0.0, 0.0],
            per_view_errors: vec![0.25; detections.len()],
            std_dev_intrinsics: vec![0.5; 18],
            std_dev_extrinsics: vec![0.01; 6 * detections.len()],
        })
    }

    fn solve_pnp(
        &self,
        object_points: &[Point3<f64>],
        _image_points: &[Point2<f64>],
        _intrinsics: &Matrix3<f64>,
        _distortion: &[f64; 5],
    ) -> Result<Option<Pose>, BackendError> {
        self.pnp_object_points
            .borrow_mut()
            .push(object_points.to_vec());
        Ok(self.pose)
    }

    fn undistort(
        &self,
        frame: &Frame,
        _intrinsics: &Matrix3<f64>,
        _distortion: &[f64; 5],
    ) -> Result<Frame, BackendError> {
        Ok(frame.clone())
    }
}

/// Writes `NNNN.png` 4x3 gray frames whose pixels hold the frame number.
pub(crate) fn write_frames(dir: &Path, numbers: impl IntoIterator<Item = u8>) -> Vec<PathBuf> {
    numbers
        .into_iter()
        .map(|n| {
            let path = dir.join(format!("{n:04}.png"));
            GrayImage::from_pixel(4, 3, Luma([n]))
                .save(&path)
                .expect("test frame written");
            path
        })
        .collect()
}

/// Settings of a 5x4 DICT_6X6 board requiring three views with six corners.
pub(crate) fn calibration_settings() -> Settings {
    let mut settings = Settings::new();
    settings.from_map([
        ("aruco_dict", Value::from("DICT_6X6")),
        ("cols", Value::from(5)),
        ("rows", Value::from(4)),
        ("square_size", Value::from(0.04)),
        ("marker_size", Value::from(0.03)),
        ("min_number_of_corners", Value::from(6)),
        ("min_number_of_calibration_images", Value::from(3)),
        ("sensor_width_mm", Value::from(10.0)),
        ("sensor_height_mm", Value::from(7.5)),
    ]);
    settings
}

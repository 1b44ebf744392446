//! Calibration Tools Library
//!
//! A Rust library for pinhole camera calibration with ChArUco targets and the
//! registration of depth maps into world-space point clouds. It provides:
//! - Pinhole camera model with a scene-tool transform kept in sync with its pose
//! - Ordered image-sequence sources with numeric filename ordering
//! - Typed parameter stores read from YAML
//! - Explicit-field persistence to binary, YAML and JSON
//! - Intrinsic and extrinsic calibration driven through a vision backend
//! - Depth registration, PLY export and scene-tool camera export
//!
//! The single-camera pipeline tying these together lives in [`workflow`].

pub mod calibration;
pub mod camera;
pub mod geometry;
pub mod persist;
pub mod registration;
pub mod scene;
pub mod settings;
pub mod stream;
pub mod util;
pub mod workflow;

// Re-export commonly used types
pub use calibration::{Calibration, CalibrationConfig, CharucoBoard, VisionBackend};
pub use camera::{CameraError, PinholeCamera};
pub use persist::{Persist, PersistError};
pub use registration::PointCloud;
pub use settings::Settings;
pub use stream::{FileFrameSource, FrameSource};
pub use workflow::{single_cam_workflow, ProjectConfig};

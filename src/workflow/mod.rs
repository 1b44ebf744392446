//! Single-camera pipeline: intrinsics, extrinsics, then depth registration.
//!
//! Every stage writes its results below `<project_dir>/<project_name>` and stops the
//! pipeline when its input is not configured.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

use crate::calibration::{Calibration, CalibrationError, VisionBackend};
use crate::camera::PinholeCamera;
use crate::persist::{self, Encoding, PersistError};
use crate::registration::{register_depthmap_to_world, PointCloud, RegistrationError};
use crate::scene::{write_scene_script, SceneCamera, SceneError};
use crate::settings::{Settings, SettingsError};
use crate::stream::{DirectoryScan, FileFrameSource, Frame, FrameInput, FrameSource, ReadMode, StreamError};
use crate::util::{ensure_dir, savename_pattern, NamePattern, UtilError};

pub const CALIBRATION_REPORT: &str = "calibration_report.csv";
pub const SCENE_SCRIPT: &str = "scene_cameras.py";

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("{0} requires a vision backend")]
    MissingBackend(&'static str),
    #[error("Insufficient data for {stage}: {found} found, at least {required} required")]
    InsufficientData {
        stage: &'static str,
        found: usize,
        required: usize,
    },
    #[error("Input {0} is neither a file nor a directory")]
    NotFound(PathBuf),
    #[error("Unsupported checkpoint format {0}, expecting bin, yaml or json")]
    UnsupportedFormat(String),
    #[error("Frame {0} holds no depth values")]
    NotADepthFrame(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Util(#[from] UtilError),
}

/// Project description read from a settings document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    pub project_dir: PathBuf,
    pub project_name: String,
    pub intrinsic_calibration_input_dir: PathBuf,
    pub calibration_config_file: PathBuf,
    /// Single image or image directory.
    pub extrinsic_calibration_input: Option<PathBuf>,
    /// Single depth map or depth map directory.
    pub depth_registration_input: Option<PathBuf>,
    pub color_registration_input: Option<PathBuf>,
    pub blender_conform: bool,
    pub register_from_frame: usize,
    pub register_to_frame: usize,
    pub lazy_intrinsics: bool,
    pub lazy_extrinsics: bool,
    pub checkpoint_format: Encoding,
    pub downsample_factor: f64,
    pub seed: u64,
}

impl ProjectConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, WorkflowError> {
        let format = settings.opt_str("checkpoint_format")?.unwrap_or("bin");
        let checkpoint_format = Encoding::from_name(format)
            .ok_or_else(|| WorkflowError::UnsupportedFormat(format.to_string()))?;
        let opt_path = |key: &str| -> Result<Option<PathBuf>, SettingsError> {
            Ok(settings.opt_str(key)?.map(PathBuf::from))
        };
        let opt_count = |key: &str, default: usize| -> Result<usize, SettingsError> {
            if settings.opt_i64(key)?.is_some() {
                settings.get_usize(key)
            } else {
                Ok(default)
            }
        };

        Ok(Self {
            project_dir: PathBuf::from(settings.get_str("project_dir")?),
            project_name: settings.get_str("project_name")?.to_string(),
            intrinsic_calibration_input_dir: PathBuf::from(
                settings.get_str("intrinsic_calibration_input_dir")?,
            ),
            calibration_config_file: PathBuf::from(settings.get_str("calibration_config_file")?),
            extrinsic_calibration_input: opt_path("extrinsic_calibration_input")?,
            depth_registration_input: opt_path("depth_registration_input")?,
            color_registration_input: opt_path("color_registration_input")?,
            blender_conform: settings.opt_bool("blender_conform")?.unwrap_or(true),
            register_from_frame: opt_count("register_from_frame", 0)?,
            register_to_frame: opt_count("register_to_frame", 1)?,
            lazy_intrinsics: settings.opt_bool("lazy_intrinsics")?.unwrap_or(true),
            lazy_extrinsics: settings.opt_bool("lazy_extrinsics")?.unwrap_or(false),
            checkpoint_format,
            downsample_factor: settings.opt_f64("downsample_factor")?.unwrap_or(0.1),
            seed: opt_count("seed", 0)? as u64,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        Self::from_settings(&Settings::load(path)?)
    }

    /// Directory all results are written to.
    pub fn output_root(&self) -> PathBuf {
        self.project_dir.join(&self.project_name)
    }

    fn checkpoint(&self, name: &str, pattern: NamePattern) -> Option<PathBuf> {
        savename_pattern(
            Some(self.output_root().as_path()),
            name,
            pattern,
            self.checkpoint_format.extension(),
        )
    }
}

/// Results of [`single_cam_workflow`], later stages are `None` when not configured.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOutput {
    pub intrinsics: PinholeCamera,
    pub extrinsics: Option<Vec<PinholeCamera>>,
    pub point_clouds: Option<Vec<PointCloud>>,
}

/// Runs the single-camera pipeline of `config`.
///
/// `backend` may be `None` as long as every calibration stage can be restored from its
/// checkpoint.
///
/// # Errors
///
/// * [`WorkflowError::MissingBackend`] when a stage has to calibrate without a backend.
/// * [`WorkflowError::InsufficientData`] when no extrinsic camera is available for
///   registration.
pub fn single_cam_workflow<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    backend: Option<&B>,
) -> Result<WorkflowOutput, WorkflowError> {
    let out_root = config.output_root();
    ensure_dir(&out_root)?;

    let settings = Settings::load(&config.calibration_config_file)?;
    let calibration = Calibration::from_settings(&settings)?;

    let intrinsics = intrinsic_calibration(config, &calibration, backend)?;
    let mut output = WorkflowOutput {
        intrinsics,
        ..Default::default()
    };

    let Some(extrinsic_input) = &config.extrinsic_calibration_input else {
        return Ok(output);
    };
    let extrinsics = if extrinsic_input.is_file() {
        vec![extrinsic_calibration_image(
            config,
            &calibration,
            &output.intrinsics,
            extrinsic_input,
            backend,
        )?]
    } else if extrinsic_input.is_dir() {
        extrinsic_calibration_sequence(
            config,
            &calibration,
            &output.intrinsics,
            extrinsic_input,
            backend,
        )?
    } else {
        return Err(WorkflowError::NotFound(extrinsic_input.clone()));
    };

    let Some(depth_input) = &config.depth_registration_input else {
        output.extrinsics = Some(extrinsics);
        return Ok(output);
    };
    if extrinsics.is_empty() {
        return Err(WorkflowError::InsufficientData {
            stage: "depth registration",
            found: 0,
            required: 1,
        });
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let point_clouds = if depth_input.is_file() {
        vec![register_view(config, &extrinsics[0], depth_input, backend, &mut rng)?]
    } else if depth_input.is_dir() {
        register_stream(config, &extrinsics, depth_input, backend, &mut rng)?
    } else {
        return Err(WorkflowError::NotFound(depth_input.clone()));
    };

    output.extrinsics = Some(extrinsics);
    output.point_clouds = Some(point_clouds);
    Ok(output)
}

fn intrinsic_calibration<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    calibration: &Calibration,
    backend: Option<&B>,
) -> Result<PinholeCamera, WorkflowError> {
    let fname = config.checkpoint("intrinsics", NamePattern::None);
    if let Some(path) = fname.as_deref().filter(|p| p.is_file() && config.lazy_intrinsics) {
        let mut camera = PinholeCamera::new();
        persist::load(&mut camera, path)?;
        if camera.name().is_none() {
            camera.set_name(config.project_name.as_str());
        }
        info!("Intrinsics restored from {}", path.display());
        return Ok(camera);
    }

    let backend = backend.ok_or(WorkflowError::MissingBackend("intrinsic calibration"))?;
    let mut stream = FileFrameSource::open(FrameInput::Directory(DirectoryScan::new(
        &config.intrinsic_calibration_input_dir,
    )))?;
    let mut result = calibration.calibrate_intrinsics(&mut stream, backend)?;
    result.camera.set_name(config.project_name.as_str());

    if let Some(path) = fname {
        persist::save(&result.camera, &path)?;
    }
    let report = config.output_root().join(CALIBRATION_REPORT);
    result.report.write_csv(&report)?;
    info!("Calibration report written to {}", report.display());
    Ok(result.camera)
}

fn extrinsic_calibration_image<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    calibration: &Calibration,
    intrinsics: &PinholeCamera,
    image: &Path,
    backend: Option<&B>,
) -> Result<PinholeCamera, WorkflowError> {
    let name = format!("{}_extrinsics", intrinsics.name().unwrap_or(config.project_name.as_str()));
    let fname = config.checkpoint(&name, NamePattern::None);
    if let Some(path) = fname.as_deref().filter(|p| p.is_file() && config.lazy_extrinsics) {
        let mut camera = PinholeCamera::new();
        persist::load(&mut camera, path)?;
        info!("Extrinsics restored from {}", path.display());
        return Ok(camera);
    }

    let backend = backend.ok_or(WorkflowError::MissingBackend("extrinsic calibration"))?;
    let mut stream = FileFrameSource::open(FrameInput::Filename(image.to_path_buf()))?;
    let camera = calibration
        .calibrate_extrinsics(&mut stream, intrinsics, backend)?
        .into_iter()
        .next()
        .ok_or(WorkflowError::InsufficientData {
            stage: "extrinsic calibration",
            found: 0,
            required: 1,
        })?;
    if let Some(path) = fname {
        persist::save(&camera, &path)?;
    }
    Ok(camera)
}

fn extrinsic_calibration_sequence<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    calibration: &Calibration,
    intrinsics: &PinholeCamera,
    dir: &Path,
    backend: Option<&B>,
) -> Result<Vec<PinholeCamera>, WorkflowError> {
    if config.lazy_extrinsics {
        let stored = sequence_checkpoints(config, "extrinsics");
        if !stored.is_empty() {
            let mut cameras = Vec::with_capacity(stored.len());
            for path in &stored {
                let mut camera = PinholeCamera::new();
                persist::load(&mut camera, path)?;
                cameras.push(camera);
            }
            info!("{} extrinsic cameras restored", cameras.len());
            return Ok(cameras);
        }
    }

    let backend = backend.ok_or(WorkflowError::MissingBackend("extrinsic calibration"))?;
    let scan = DirectoryScan::new(dir).with_range(config.register_from_frame, config.register_to_frame);
    let mut stream = FileFrameSource::open(FrameInput::Directory(scan))?;
    let cameras = calibration.calibrate_extrinsics(&mut stream, intrinsics, backend)?;
    for (n, camera) in cameras.iter().enumerate() {
        if let Some(path) = config.checkpoint("extrinsics", NamePattern::Index(n)) {
            persist::save(camera, &path)?;
        }
    }
    Ok(cameras)
}

/// Consecutive `<name>_000000`, `<name>_000001`, ... checkpoints present on disk.
fn sequence_checkpoints(config: &ProjectConfig, name: &str) -> Vec<PathBuf> {
    (0..)
        .map_while(|n| {
            config
                .checkpoint(name, NamePattern::Index(n))
                .filter(|path| path.is_file())
        })
        .collect()
}

fn register_view<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    camera: &PinholeCamera,
    depth_file: &Path,
    backend: Option<&B>,
    rng: &mut StdRng,
) -> Result<PointCloud, WorkflowError> {
    let mut depths = FileFrameSource::open(FrameInput::Filename(depth_file.to_path_buf()))?;
    let mut colors = match &config.color_registration_input {
        Some(color) if color.is_file() => Some(
            FileFrameSource::open(FrameInput::Filename(color.clone()))?
                .with_read_mode(ReadMode::Color),
        ),
        _ => None,
    };

    let cloud = register_frame(config, camera, &mut depths, colors.as_mut(), 0, backend, rng)?;
    if let Some(path) = savename_pattern(Some(config.output_root().as_path()), "pcl", NamePattern::None, "ply") {
        cloud.write_ply(&path)?;
        info!("Point cloud with {} points written to {}", cloud.len(), path.display());
    }
    Ok(cloud)
}

fn register_stream<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    cameras: &[PinholeCamera],
    depth_dir: &Path,
    backend: Option<&B>,
    rng: &mut StdRng,
) -> Result<Vec<PointCloud>, WorkflowError> {
    let scan = |dir: &Path| {
        DirectoryScan::new(dir).with_range(config.register_from_frame, config.register_to_frame)
    };
    let mut depths = FileFrameSource::open(FrameInput::Directory(scan(depth_dir)))?;
    let mut colors = match &config.color_registration_input {
        Some(color) if color.is_dir() => Some(
            FileFrameSource::open(FrameInput::Directory(scan(color.as_path())))?
                .with_read_mode(ReadMode::Color),
        ),
        _ => None,
    };

    let mut count = cameras.len().min(depths.len());
    if let Some(colors) = &colors {
        count = count.min(colors.len());
    }
    if count < cameras.len() {
        warn!(
            "Registering {count} of {} views, not enough depth or color frames",
            cameras.len()
        );
    }

    let mut clouds = Vec::with_capacity(count);
    for (i, camera) in cameras.iter().take(count).enumerate() {
        let cloud = register_frame(config, camera, &mut depths, colors.as_mut(), i, backend, rng)?;
        if let Some(path) =
            savename_pattern(Some(config.output_root().as_path()), "pcl", NamePattern::Index(i), "ply")
        {
            cloud.write_ply(&path)?;
            info!("Point cloud with {} points written to {}", cloud.len(), path.display());
        }
        clouds.push(cloud);
    }
    Ok(clouds)
}

fn register_frame<B: VisionBackend + ?Sized>(
    config: &ProjectConfig,
    camera: &PinholeCamera,
    depths: &mut FileFrameSource,
    colors: Option<&mut FileFrameSource>,
    index: usize,
    backend: Option<&B>,
    rng: &mut StdRng,
) -> Result<PointCloud, WorkflowError> {
    let label = || format!("{index:06}");
    let depth = depths
        .get(Some(index))?
        .and_then(|frame| frame.to_depth())
        .ok_or_else(|| WorkflowError::NotADepthFrame(label()))?;

    let color = match colors {
        Some(colors) => colors.get(Some(index))?,
        None => None,
    };
    let color = match (color, backend, camera.intrinsics(), camera.distortion()) {
        (Some(frame), Some(backend), Some(k), Some(dist)) => Some(
            backend
                .undistort(&frame, k, dist)
                .map_err(CalibrationError::from)?,
        ),
        (Some(frame), _, _, _) => {
            warn!("Color frame {} used without undistortion", label());
            Some(frame)
        }
        (None, ..) => None,
    };
    let color = color.as_ref().and_then(Frame::to_rgb);

    Ok(register_depthmap_to_world(
        camera,
        &depth,
        color.as_ref(),
        config.downsample_factor,
        config.blender_conform,
        rng,
    )?)
}

/// Writes the scene-tool script for every extrinsic checkpoint of the project.
///
/// Returns the path of the script.
pub fn scene_export(config: &ProjectConfig) -> Result<PathBuf, WorkflowError> {
    let out_root = config.output_root();
    let ext = config.checkpoint_format.extension();
    let mut singles = Vec::new();
    if out_root.is_dir() {
        for entry in fs::read_dir(&out_root).map_err(PersistError::from)? {
            let path = entry.map_err(PersistError::from)?.path();
            let matches = path.extension().and_then(|e| e.to_str()) == Some(ext)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.ends_with("_extrinsics"));
            if matches {
                singles.push(path);
            }
        }
    }
    singles.sort();
    let checkpoints: Vec<PathBuf> = singles
        .into_iter()
        .chain(sequence_checkpoints(config, "extrinsics"))
        .collect();
    if checkpoints.is_empty() {
        return Err(WorkflowError::InsufficientData {
            stage: "scene export",
            found: 0,
            required: 1,
        });
    }

    let mut cameras = Vec::with_capacity(checkpoints.len());
    for path in &checkpoints {
        let mut camera = PinholeCamera::new();
        persist::load(&mut camera, path)?;
        cameras.push(SceneCamera::from_camera(&camera)?);
    }
    let script = out_root.join(SCENE_SCRIPT);
    write_scene_script(&cameras, &script)?;
    Ok(script)
}

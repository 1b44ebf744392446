//! Export of calibrated cameras to the 3D content-creation tool.
//!
//! The tool consumes a generated Python script that creates one camera object per
//! calibrated view, replacing any existing object of the same name.

use log::info;
use nalgebra::Matrix4;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::camera::PinholeCamera;

/// Object name used for cameras without a name.
pub const DEFAULT_CAMERA_NAME: &str = "CalibratedCam";

#[derive(thiserror::Error, Debug)]
pub enum SceneError {
    #[error("Camera is missing {0} required for scene export")]
    MissingParameter(&'static str),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Camera object properties in the scene tool's own units and convention.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneCamera {
    pub name: String,
    pub lens_mm: f64,
    pub sensor_height_mm: f64,
    pub sensor_width_mm: f64,
    /// Object-to-world matrix, the camera's `external_transform`.
    pub matrix_world: Matrix4<f64>,
}

impl SceneCamera {
    /// Extracts the scene properties of a calibrated camera.
    ///
    /// # Errors
    ///
    /// * [`SceneError::MissingParameter`] when focal length, sensor size or the
    ///   external transform are unknown.
    pub fn from_camera(camera: &PinholeCamera) -> Result<Self, SceneError> {
        let lens_mm = camera
            .focal_length_mm()
            .ok_or(SceneError::MissingParameter("focal_length_mm"))?;
        let (sensor_height_mm, sensor_width_mm) = camera
            .sensor_size_mm()
            .ok_or(SceneError::MissingParameter("sensor_size_mm"))?;
        let matrix_world = *camera
            .external_transform()
            .ok_or(SceneError::MissingParameter("external_transform"))?;
        let name = match camera.name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => DEFAULT_CAMERA_NAME.to_string(),
        };
        Ok(Self {
            name,
            lens_mm,
            sensor_height_mm,
            sensor_width_mm,
            matrix_world,
        })
    }

    /// `matrix_world` as a scene-tool matrix literal, `Matrix(((m00,m01,m02,m03),...))`.
    pub fn matrix_world_string(&self) -> String {
        let rows: Vec<String> = self
            .matrix_world
            .row_iter()
            .map(|row| {
                let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                format!("({})", values.join(","))
            })
            .collect();
        format!("Matrix(({}))", rows.join(","))
    }

    fn write_creation<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "create_camera(")?;
        writeln!(out, "    {:?},", self.name)?;
        writeln!(out, "    {},", self.lens_mm)?;
        writeln!(out, "    {},", self.sensor_height_mm)?;
        writeln!(out, "    {},", self.sensor_width_mm)?;
        writeln!(out, "    {},", self.matrix_world_string())?;
        writeln!(out, ")")
    }
}

const SCRIPT_HEADER: &str = r#"import bpy
from mathutils import Matrix


def create_camera(name, lens, sensor_height, sensor_width, matrix_world):
    if name in bpy.data.objects:
        bpy.data.objects.remove(bpy.data.objects[name], do_unlink=True)
    data = bpy.data.cameras.new(name)
    data.lens_unit = 'MILLIMETERS'
    data.lens = lens
    data.sensor_height = sensor_height
    data.sensor_width = sensor_width
    obj = bpy.data.objects.new(name, data)
    bpy.context.scene.collection.objects.link(obj)
    obj.matrix_world = matrix_world
    return obj

"#;

/// Writes a script creating or replacing every camera in the scene tool.
pub fn write_scene_script(cameras: &[SceneCamera], path: impl AsRef<Path>) -> Result<(), SceneError> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(SCRIPT_HEADER.as_bytes())?;
    for camera in cameras {
        writeln!(out)?;
        camera.write_creation(&mut out)?;
    }
    out.flush()?;
    info!("Wrote {} scene cameras to {}", cameras.len(), path.display());
    Ok(())
}

//! Command line entry point of the calibration pipeline.
//!
//! Usage:
//! ```bash
//! calibtool -i project.yaml -w single_cam_workflow
//! calibtool -i project.yaml -w scene_export
//! ```
//!
//! No vision backend is linked into the binary, so `single_cam_workflow` runs from the
//! intrinsic and extrinsic checkpoints of a previous calibration.

use calibtool::calibration::VisionBackend;
use calibtool::workflow::{scene_export, single_cam_workflow, ProjectConfig};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
enum Workflow {
    SingleCamWorkflow,
    SceneExport,
}

/// Camera calibration and depth registration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the project settings YAML file
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Workflow to run
    #[arg(short = 'w', long, value_enum, default_value = "single_cam_workflow")]
    workflow: Workflow,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ProjectConfig::load(&cli.input)?;
    info!("Project {} from {}", config.project_name, cli.input.display());

    match cli.workflow {
        Workflow::SingleCamWorkflow => {
            let output = single_cam_workflow::<dyn VisionBackend>(&config, None)?;

            println!("##############################");
            println!("#\tSINGLE CAM WORKFLOW");
            println!("\nIntrinsics:");
            println!("{}", output.intrinsics);
            if let Some(extrinsics) = &output.extrinsics {
                println!("\nExtrinsics:");
                for (n, camera) in extrinsics.iter().enumerate() {
                    println!("--------------------");
                    println!("frame: {n:06}");
                    println!("{camera}");
                }
            }
            if let Some(clouds) = &output.point_clouds {
                let points: usize = clouds.iter().map(|c| c.len()).sum();
                info!("Registered {} point clouds, {points} points", clouds.len());
            }
        }
        Workflow::SceneExport => {
            let script = scene_export(&config)?;
            println!("Scene script written to {}", script.display());
        }
    }
    Ok(())
}

//! Problem and solution files.
//!
//! A problem is one YAML document holding the run settings, the control
//! network and, per image, a frame camera and its trajectory:
//!
//! ```yaml
//! settings:
//!   pointing: Angles
//!   error_propagation: true
//! network:
//!   network_id: demo
//!   target: Moon
//!   points:
//!     - id: P0001
//!       point_type: Free
//!       apriori: [1737.4, 0.0, 0.0]
//!       measures:
//!         - { serial: IMG0, sample: 512.0, line: 512.0 }
//! images:
//!   - serial: IMG0
//!     file_name: img0.cub
//!     camera: { focal_length: 5000.0, principal_sample: 512.0, principal_line: 512.0 }
//!     trajectory:
//!       base_time: 0.0
//!       time_scale: 1.0
//!       position: [[1837.4], [0.0], [0.0]]
//!       pointing: [[3.14159], [0.0], [0.0]]
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bundle::{BundleImage, BundleSettings, BundleSolutionInfo, Trajectory};
use crate::camera::{CameraModel, FrameCamera};
use crate::control::{ControlNet, SerialNumber};

/// One image of a problem file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub serial: SerialNumber,
    #[serde(default)]
    pub file_name: Option<String>,
    pub camera: FrameCamera,
    pub trajectory: Trajectory,
}

impl ImageEntry {
    pub fn to_bundle_image(&self) -> BundleImage {
        let camera: Arc<dyn CameraModel> = Arc::new(self.camera.clone());
        let file_name = self
            .file_name
            .clone()
            .unwrap_or_else(|| self.serial.to_string());
        BundleImage::new(self.serial.clone(), file_name, camera, self.trajectory.clone())
    }
}

/// A bundle adjustment problem as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemFile {
    #[serde(default)]
    pub settings: BundleSettings,
    pub network: ControlNet,
    pub images: Vec<ImageEntry>,
}

impl ProblemFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let problem: ProblemFile =
            serde_yaml::from_str(yaml).context("Failed to parse bundle problem")?;
        problem.check()?;
        Ok(problem)
    }

    /// Reject problems the bundle could never start on.
    fn check(&self) -> Result<()> {
        if self.images.is_empty() {
            bail!("Problem has no images");
        }
        for image in &self.images {
            if image.camera.focal_length <= 0.0 {
                bail!(
                    "Image {} has a non-positive focal length {}",
                    image.serial,
                    image.camera.focal_length
                );
            }
        }
        Ok(())
    }

    pub fn bundle_images(&self) -> Vec<BundleImage> {
        self.images.iter().map(ImageEntry::to_bundle_image).collect()
    }
}

/// Load a YAML problem file.
pub fn load_problem<P: AsRef<Path>>(path: P) -> Result<ProblemFile> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let problem: ProblemFile = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    problem
        .check()
        .with_context(|| format!("Invalid problem {}", path.display()))?;

    info!(
        "Loaded problem {}: {} points, {} measures, {} images",
        path.display(),
        problem.network.num_points(),
        problem.network.num_measures(),
        problem.images.len()
    );
    Ok(problem)
}

/// Write a solution as pretty-printed JSON.
pub fn write_solution<P: AsRef<Path>>(path: P, solution: &BundleSolutionInfo) -> Result<()> {
    let path = path.as_ref();
    let json = solution
        .to_json()
        .context("Failed to serialize bundle solution")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote bundle solution to {}", path.display());
    Ok(())
}

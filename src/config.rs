use crate::types::{Config, SourceConfig};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).context("Invalid config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot run with. Called before any
    /// pipeline is started.
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("No cameras configured");
        }

        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                bail!("Camera id must not be empty");
            }
            if camera.frame_width == 0 || camera.frame_height == 0 {
                bail!("Camera {}: frame size must be non-zero", camera.id);
            }
            if !(camera.fps > 0.0) {
                bail!("Camera {}: fps must be positive", camera.id);
            }
            if let Some(roadway) = &camera.roadway {
                if roadway.len() < 3 {
                    bail!("Camera {}: roadway polygon needs at least 3 vertices", camera.id);
                }
            }
            if let SourceConfig::Video { uri } = &camera.source {
                if uri.trim().is_empty() {
                    bail!("Camera {}: video source uri is empty", camera.id);
                }
            }
        }

        let ids: std::collections::HashSet<&str> =
            self.cameras.iter().map(|c| c.id.as_str()).collect();
        if ids.len() != self.cameras.len() {
            bail!("Camera ids must be unique");
        }

        self.tracker.validate()?;
        self.incident.validate()?;
        self.recorder.validate()?;
        Ok(())
    }
}

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.model.confidence_threshold) {
            anyhow::bail!(
                "confidence_threshold must be in [0, 1], got {}",
                self.model.confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.model.iou_threshold) {
            anyhow::bail!(
                "iou_threshold must be in [0, 1], got {}",
                self.model.iou_threshold
            );
        }
        if self.stream.buffer_size == 0 {
            anyhow::bail!("stream.buffer_size must be at least 1");
        }
        if self.processing.skip_frames == 0 {
            anyhow::bail!("processing.skip_frames must be at least 1");
        }
        if self.mqtt.qos > 1 {
            anyhow::bail!("mqtt.qos must be 0 or 1, got {}", self.mqtt.qos);
        }
        Ok(())
    }
}

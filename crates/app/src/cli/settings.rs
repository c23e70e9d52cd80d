//! Loading the engine configuration document

use anyhow::{Context, Result};
use audiomirror_core::{ConversionPolicy, DeviceId, EngineConfig};
use std::fs;
use std::path::Path;

/// Parse a JSON configuration document; missing fields take their defaults
pub fn parse(text: &str) -> Result<EngineConfig> {
    serde_json::from_str(text).context("invalid configuration document")
}

/// Load the document at `path`, or the defaults when no path is given
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    parse(&text).with_context(|| format!("in {}", path.display()))
}

/// Command-line settings layered over the loaded document
#[derive(Debug, Default)]
pub struct Overrides {
    pub main_device: Option<String>,
    pub aux_device: Option<String>,
    pub flexible: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(id) = &self.main_device {
            config.main.device_id = Some(DeviceId::new(id.as_str()));
        }
        if let Some(id) = &self.aux_device {
            config.aux.device_id = Some(DeviceId::new(id.as_str()));
        }
        if self.flexible {
            config.conversion = ConversionPolicy::Flexible;
        }
    }
}

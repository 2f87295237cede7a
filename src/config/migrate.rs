use serde::Deserialize;

use crate::error::{FlotillaError, Result};

use super::FlotillaConfig;

/// Highest schema version this build understands.
pub const MAX_SCHEMA_VERSION: u32 = 1;

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    schema_version: u32,
}

/// Parse raw YAML, dispatching on schema version. Version 0 (or a missing
/// field) is treated as version 1; anything newer is rejected.
pub fn migrate(raw: &str) -> Result<FlotillaConfig> {
    let probe: VersionProbe = serde_yaml_bw::from_str(raw)
        .map_err(|e| FlotillaError::Config(format!("parse schema_version: {}", e)))?;

    match probe.schema_version {
        0 | 1 => parse_v1(raw),
        found => Err(FlotillaError::UnsupportedSchema {
            found,
            max: MAX_SCHEMA_VERSION,
        }),
    }
}

fn parse_v1(raw: &str) -> Result<FlotillaConfig> {
    let mut config: FlotillaConfig = serde_yaml_bw::from_str(raw)
        .map_err(|e| FlotillaError::Config(format!("parse config: {}", e)))?;
    config.schema_version = 1;
    Ok(config)
}

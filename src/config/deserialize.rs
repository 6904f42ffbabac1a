// ABOUTME: Custom serde deserializers for service config fields.
// ABOUTME: Rejects malformed port mappings and volume mounts at load time.

use crate::deploy::{PortMapping, VolumeMount};
use serde::Deserialize;

pub fn deserialize_ports<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<PortEntry> = Vec::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|entry| {
            let spec = entry.into_string();
            spec.parse::<PortMapping>()
                .map(|_| spec)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

pub fn deserialize_volumes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<String> = Vec::deserialize(deserializer)?;
    for spec in &values {
        spec.parse::<VolumeMount>()
            .map_err(serde::de::Error::custom)?;
    }
    Ok(values)
}

/// YAML reads `- 8080` as a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Number(u16),
    Text(String),
}

impl PortEntry {
    fn into_string(self) -> String {
        match self {
            PortEntry::Number(port) => port.to_string(),
            PortEntry::Text(spec) => spec,
        }
    }
}

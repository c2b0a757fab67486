use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which end of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// The wearable companion device that captures audio
    Wearable,
    /// The host device that ingests chunks and finalized recordings
    Host,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Wearable => "wearable",
            DeviceRole::Host => "host",
        }
    }

    pub fn peer(&self) -> DeviceRole {
        match self {
            DeviceRole::Wearable => DeviceRole::Host,
            DeviceRole::Host => DeviceRole::Wearable,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wearable" | "watch" => Ok(DeviceRole::Wearable),
            "host" | "phone" => Ok(DeviceRole::Host),
            other => anyhow::bail!("Unknown device role: {}", other),
        }
    }
}

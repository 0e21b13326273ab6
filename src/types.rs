use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder fault id reported when a device has no active faults
pub const NO_FAULT_ID: &str = "INDICATOR_NONE_IN_DEVICE";

/// Level limits in dB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelRange {
    pub min: f64,
    pub max: f64,
}

impl LevelRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Check if a value lies within the limits (inclusive)
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Structural description of one channel, as recorded in the block map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// 1-based channel index
    pub index: u32,

    /// Channel label (`channelName` on Dante blocks); empty if the device has none
    #[serde(default)]
    pub label: String,

    /// Level limits, for blocks with per-channel level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<LevelRange>,
}

/// Structural description of one selector source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// 1-based source index
    pub index: u32,

    #[serde(default)]
    pub label: String,

    pub range: LevelRange,
}

/// Live view of a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub index: u32,
    pub label: String,

    // Level and limits (absent on mute-only blocks)
    pub range: Option<LevelRange>,
    pub level: Option<f64>,

    pub muted: bool,

    // Dante-only attributes
    pub inverted: Option<bool>,
    pub fault_on_inactive: Option<bool>,
}

impl Channel {
    pub(crate) fn from_info(info: &ChannelInfo) -> Self {
        Self {
            index: info.index,
            label: info.label.clone(),
            range: info.range,
            level: None,
            muted: false,
            inverted: None,
            fault_on_inactive: None,
        }
    }
}

/// Live view of a selector source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub index: u32,
    pub label: String,
    pub range: LevelRange,
    pub level: f64,

    /// True if this is the currently selected source
    pub selected: bool,
}

/// Live view of a graphic equalizer band
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Band {
    /// 1-based band index
    pub index: u32,

    /// Gain in dB
    pub gain: f64,

    pub bypassed: bool,
}

/// Live settings of a ducker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuckerSettings {
    pub bypassed: bool,

    /// Sense input mixed into the output
    pub mix_sense: bool,
    pub sense_level: f64,
    pub sense_muted: bool,

    // Ducking behaviour, levels in dB and times in milliseconds
    pub threshold: f64,
    pub ducking_level: f64,
    pub attack_time: f64,
    pub release_time: f64,

    pub input_muted: bool,
    pub input_level: f64,
    /// `minInputLevel` and `maxInputLevel`, both settable
    pub input_range: LevelRange,
}

/// An active device fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub id: String,

    #[serde(default)]
    pub name: String,
}

/// Device identity and health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub hostname: String,
    pub serial_number: String,
    pub software_version: String,
    pub faults: Vec<Fault>,

    /// Raw `networkStatus` value
    pub network_status: Value,
}

/// Parse an `activeFaultList` value into faults, dropping the "no fault" placeholder
pub(crate) fn parse_faults(value: &Value) -> Vec<Fault> {
    let mut faults = Vec::new();
    collect_faults(value, &mut faults);
    faults
}

fn collect_faults(value: &Value, faults: &mut Vec<Fault>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_faults(item, faults);
            }
        }
        Value::Object(entry) => {
            if let Some(id) = entry.get("id").and_then(Value::as_str) {
                if id != NO_FAULT_ID {
                    faults.push(Fault {
                        id: id.to_string(),
                        name: entry
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            // Some firmwares nest per-unit faults
            if let Some(nested) = entry.get("faults") {
                collect_faults(nested, faults);
            }
        }
        _ => {}
    }
}

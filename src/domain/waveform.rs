use serde::{Deserialize, Serialize};

/// Ordered amplitude peaks, each in `[0, 1]`.
pub type Peaks = Vec<f32>;

/// Persisted waveform of one recording.
///
/// `full` holds one peak per `1 / sample_rate` seconds; `simplified` has a
/// fixed length regardless of duration and is what clients usually draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformRecord {
    pub full: Peaks,
    pub simplified: Peaks,
    pub sample_rate: u32,
}

impl WaveformRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

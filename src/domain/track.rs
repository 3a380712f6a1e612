use std::{fmt::Display, str::FromStr};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::waveform::WaveformRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub i64);

/// Opaque user identity handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Zero-padded version label, e.g. `"001"` for version number 1.
///
/// Labels are what tracks and comments refer to; numbers are what
/// versions are ordered by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionLabel(String);

impl VersionLabel {
    pub fn from_number(number: u32) -> Self {
        Self(format!("{number:03}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn number(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl FromStr for VersionLabel {
    type Err = anyhow::Error;

    /// Accepts `"2"`, `"02"` or `"002"` and normalizes to the padded form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u32 = s
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid version label '{s}'"))?;
        if number == 0 {
            return Err(anyhow!("version numbers start at 1"));
        }
        Ok(Self::from_number(number))
    }
}

impl Display for VersionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Unlisted,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Unlisted => "unlisted",
            Visibility::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "unlisted" => Ok(Visibility::Unlisted),
            "public" => Ok(Visibility::Public),
            other => Err(anyhow!("unknown visibility '{other}'")),
        }
    }
}

/// The logical song a user keeps iterating on.
///
/// `version`, `file_url`, `duration` and `waveform_data` mirror the canonical
/// version: the pinned one, or the original upload while nothing is pinned.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub owner: UserId,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub version: VersionLabel,
    pub file_url: String,
    pub duration: Option<f64>,
    pub waveform_data: Option<WaveformRecord>,
    pub pinned_version_id: Option<VersionId>,
    pub created_at: DateTime<Utc>,
}

impl Track {
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.owner == user
    }

    pub fn is_readable_by(&self, user: Option<&UserId>) -> bool {
        match self.visibility {
            Visibility::Public | Visibility::Unlisted => true,
            Visibility::Private => user.is_some_and(|u| self.is_owned_by(u)),
        }
    }
}

/// One recording in a track's append-only history.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackVersion {
    pub id: VersionId,
    pub track_id: TrackId,
    pub version_number: u32,
    pub title: Option<String>,
    pub description: Option<String>,
    pub file_url: String,
    pub filename: String,
    pub duration: Option<f64>,
    pub waveform_data: Option<WaveformRecord>,
    pub created_at: DateTime<Utc>,
}

impl TrackVersion {
    pub fn label(&self) -> VersionLabel {
        VersionLabel::from_number(self.version_number)
    }

    /// Pinning is derived from the track's pointer, never stored per version.
    pub fn is_pinned_on(&self, track: &Track) -> bool {
        track.pinned_version_id == Some(self.id)
    }
}

/// Metadata for a brand new track.
#[derive(Debug, Clone, Default)]
pub struct NewTrack {
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
}

/// A stored upload, with analysis results when extraction succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecording {
    pub file_url: String,
    pub filename: String,
    pub duration: Option<f64>,
    pub waveform: Option<WaveformRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::track::{TrackId, UserId, VersionLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

impl Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user comment, bound at creation time to a version label.
///
/// `version == None` means the comment belongs to whatever the track's
/// canonical version is.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: CommentId,
    pub track_id: TrackId,
    pub user: UserId,
    pub content: String,
    pub timestamp: Option<f64>,
    pub version: Option<VersionLabel>,
    pub created_at: DateTime<Utc>,
}

/// The version a listener currently has selected.
#[derive(Debug, Clone)]
pub struct ViewedVersion {
    pub label: VersionLabel,
    pub is_canonical: bool,
    pub duration: Option<f64>,
}

impl ViewedVersion {
    pub fn shows(&self, comment: &Comment) -> bool {
        match &comment.version {
            Some(label) => *label == self.label,
            None => self.is_canonical,
        }
    }

    /// Marker position of a comment along this version's waveform.
    pub fn marker(&self, comment: &Comment) -> Option<f64> {
        marker_position(comment.timestamp?, self.duration?)
    }
}

/// Comments to display for `viewed`, keeping their input order.
pub fn visible_comments<'a>(comments: &'a [Comment], viewed: &ViewedVersion) -> Vec<&'a Comment> {
    comments.iter().filter(|c| viewed.shows(c)).collect()
}

/// `timestamp / duration`, clamped to `[0, 1]`.
pub fn marker_position(timestamp: f64, duration: f64) -> Option<f64> {
    if !timestamp.is_finite() || !duration.is_finite() || duration <= 0.0 {
        return None;
    }
    Some((timestamp / duration).clamp(0.0, 1.0))
}

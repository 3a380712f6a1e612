use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::{
    domain::{
        comment::{Comment, CommentId, ViewedVersion, visible_comments},
        track::{TrackId, UserId, VersionLabel},
    },
    storage::{
        db::{self, SecondsSinceUnix, i64_seconds_to_utc},
        error::StorageError,
        operations::{Storage, load_readable_track},
        schema::tables::*,
    },
};

#[derive(Debug, Clone, Default)]
pub struct NewComment {
    pub content: String,
    pub timestamp: Option<f64>,
    /// Explicit binding; defaults to the canonical version's label.
    pub version: Option<VersionLabel>,
}

#[derive(Debug, Clone)]
pub struct PlacedComment {
    pub comment: Comment,
    pub marker: Option<f64>,
}

/// Comments shown while a given version is selected, in creation order.
#[derive(Debug, Clone)]
pub struct CommentThread {
    pub viewed: ViewedVersion,
    pub comments: Vec<PlacedComment>,
}

struct RawComment {
    id: i64,
    track_id: i64,
    user: String,
    content: String,
    timestamp: Option<f64>,
    version: Option<String>,
    created_at: SecondsSinceUnix,
}

impl RawComment {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            track_id: row.get(1)?,
            user: row.get(2)?,
            content: row.get(3)?,
            timestamp: row.get(4)?,
            version: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_domain(self) -> Result<Comment, StorageError> {
        Ok(Comment {
            id: CommentId(self.id),
            track_id: TrackId(self.track_id),
            user: UserId(self.user),
            content: self.content,
            timestamp: self.timestamp,
            version: self.version.as_deref().map(str::parse::<VersionLabel>).transpose()?,
            created_at: i64_seconds_to_utc(self.created_at)?,
        })
    }
}

const COMMENT_COLUMNS: &str = "id, track_id, user_id, content, timestamp, version, created_at";

impl Storage {
    /// Creates a comment bound to a version label that never changes afterwards.
    pub fn add_comment(
        &mut self,
        track_id: TrackId,
        author: &UserId,
        new: NewComment,
    ) -> Result<Comment, StorageError> {
        let content = new.content.trim();
        if content.is_empty() {
            return Err(StorageError::InvalidInput("comment must not be empty".into()));
        }
        if new.timestamp.is_some_and(|t| !t.is_finite() || t < 0.0) {
            return Err(StorageError::InvalidInput(
                "timestamp must be a non-negative number of seconds".into(),
            ));
        }
        let now = db::now()?;

        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let track = load_readable_track(&tx, track_id, Some(author))?;

        let label = match new.version {
            Some(label) => {
                let exists = tx
                    .query_row(
                        &format!(
                            "SELECT 1 FROM {TRACK_VERSIONS} WHERE track_id = ?1 AND version_number = ?2"
                        ),
                        params![track_id.0, label.number()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !exists {
                    return Err(StorageError::VersionLabelNotFound {
                        track: track_id,
                        label: label.to_string(),
                    });
                }
                label
            }
            None => match track.pinned_version_id {
                Some(pinned) => tx.query_row(
                    &format!("SELECT version_number FROM {TRACK_VERSIONS} WHERE id = ?1"),
                    params![pinned.0],
                    |row| row.get(0).map(VersionLabel::from_number),
                )?,
                None => track.version.clone(),
            },
        };

        tx.execute(
            &format!(
                "INSERT INTO {COMMENTS} (track_id, user_id, content, timestamp, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![track_id.0, author.0, content, new.timestamp, label.as_str(), now],
        )?;
        let id = tx.last_insert_rowid();
        let comment = tx
            .query_row(
                &format!("SELECT {COMMENT_COLUMNS} FROM {COMMENTS} WHERE id = ?1"),
                params![id],
                RawComment::from_row,
            )?
            .into_domain()?;
        tx.commit()?;

        Ok(comment)
    }

    /// Comments for the selected version (canonical by default), with their
    /// marker positions along that version's waveform.
    pub fn list_comments(
        &mut self,
        track_id: TrackId,
        requester: Option<&UserId>,
        version: Option<&VersionLabel>,
    ) -> Result<CommentThread, StorageError> {
        let view = self.resolve_view(track_id, requester, version)?;
        let viewed = ViewedVersion {
            label: view.version.label(),
            is_canonical: view.is_canonical,
            duration: view.version.duration,
        };

        let mut stmt = self.db.prepare(&format!(
            "SELECT {COMMENT_COLUMNS} FROM {COMMENTS} WHERE track_id = ?1 ORDER BY id"
        ))?;
        let all = stmt
            .query_map(params![track_id.0], RawComment::from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(RawComment::into_domain)
            .collect::<Result<Vec<_>, _>>()?;

        let comments = visible_comments(&all, &viewed)
            .into_iter()
            .map(|comment| PlacedComment {
                marker: viewed.marker(comment),
                comment: comment.clone(),
            })
            .collect();

        Ok(CommentThread { viewed, comments })
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;
    use crate::{
        domain::track::Visibility,
        storage::operations::tests::{create_track, owner, setup_storage, upload},
    };

    fn say(content: &str, timestamp: Option<f64>) -> NewComment {
        NewComment {
            content: content.into(),
            timestamp,
            version: None,
        }
    }

    fn contents(thread: &CommentThread) -> Vec<&str> {
        thread
            .comments
            .iter()
            .map(|c| c.comment.content.as_str())
            .collect()
    }

    #[test]
    fn test_comment_binds_to_canonical_label() -> anyhow::Result<()> {
        let mut storage = setup_storage()?;
        let (track, _) = create_track(&mut storage, Visibility::Public)?;

        let on_original = storage.add_comment(track.id, &owner(), say("nice intro", Some(1.0)))?;
        storage.upload_version(track.id, &owner(), &upload("b.wav", 20.0, true))?;
        let on_second = storage.add_comment(track.id, &owner(), say("better mix", None))?;

        assert_eq!(on_original.version, Some(VersionLabel::from_number(1)));
        assert_eq!(on_second.version, Some(VersionLabel::from_number(2)));
        Ok(())
    }

    #[test]
    fn test_labels_survive_pin_changes() -> anyhow::Result<()> {
        let mut storage = setup_storage()?;
        let (track, original) = create_track(&mut storage, Visibility::Private)?;
        let (v2, _) = storage.upload_version(track.id, &owner(), &upload("b.wav", 20.0, true))?;
        let comment = storage.add_comment(track.id, &owner(), say("kick is loud", Some(5.0)))?;

        storage.pin_version(track.id, original.id, &owner())?;
        storage.pin_version(track.id, v2.id, &owner())?;
        storage.pin_version(track.id, original.id, &owner())?;

        let thread = storage.list_comments(track.id, Some(&owner()), Some(&v2.label()))?;
        assert_eq!(thread.comments.len(), 1);
        assert_eq!(thread.comments[0].comment, comment);
        Ok(())
    }

    #[test]
    fn test_version_label_cannot_be_rewritten() -> anyhow::Result<()> {
        let mut storage = setup_storage()?;
        let (track, _) = create_track(&mut storage, Visibility::Private)?;
        storage.upload_version(track.id, &owner(), &upload("b.wav", 2.0, false))?;
        let comment = storage.add_comment(track.id, &owner(), say("hi", None))?;

        let result = storage.db.execute(
            &format!("UPDATE {COMMENTS} SET version = '002' WHERE id = ?1"),
            params![comment.id.0],
        );

        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_listing_filters_by_viewed_version() -> anyhow::Result<()> {
        let mut storage = setup_storage()?;
        let (track, original) = create_track(&mut storage, Visibility::Private)?;
        storage.add_comment(track.id, &owner(), say("first", Some(2.5)))?;
        let (v2, _) = storage.upload_version(track.id, &owner(), &upload("b.wav", 20.0, true))?;
        storage.add_comment(track.id, &owner(), say("second", Some(5.0)))?;
        storage.add_comment(
            track.id,
            &owner(),
            NewComment {
                version: Some(original.label()),
                ..say("late note on first", None)
            },
        )?;
        storage.db.execute(
            &format!(
                "INSERT INTO {COMMENTS} (track_id, user_id, content, timestamp, version, created_at)
                 VALUES (?1, 'legacy', 'unbound', 10.0, NULL, 0)"
            ),
            params![track.id.0],
        )?;

        let canonical = storage.list_comments(track.id, Some(&owner()), None)?;
        assert_eq!(canonical.viewed.label, v2.label());
        assert_eq!(contents(&canonical), vec!["second", "unbound"]);
        assert_eq!(canonical.comments[0].marker, Some(0.25));
        assert_eq!(canonical.comments[1].marker, Some(0.5));

        let older = storage.list_comments(track.id, Some(&owner()), Some(&original.label()))?;
        assert!(!older.viewed.is_canonical);
        assert_eq!(contents(&older), vec!["first", "late note on first"]);
        assert_eq!(older.comments[0].marker, Some(0.25));
        assert_eq!(older.comments[1].marker, None);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_comments() -> anyhow::Result<()> {
        let mut storage = setup_storage()?;
        let (track, _) = create_track(&mut storage, Visibility::Private)?;

        assert!(matches!(
            storage.add_comment(track.id, &owner(), say("   ", None)),
            Err(StorageError::InvalidInput(_))
        ));
        assert!(matches!(
            storage.add_comment(track.id, &owner(), say("when?", Some(-3.0))),
            Err(StorageError::InvalidInput(_))
        ));
        assert!(matches!(
            storage.add_comment(
                track.id,
                &owner(),
                NewComment {
                    version: Some(VersionLabel::from_number(4)),
                    ..say("ghost", None)
                }
            ),
            Err(StorageError::VersionLabelNotFound { .. })
        ));
        assert!(matches!(
            storage.add_comment(track.id, &UserId::new("stranger"), say("hey", None)),
            Err(StorageError::TrackNotFound(_))
        ));
        Ok(())
    }
}

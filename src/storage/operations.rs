use log::{info, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};

use crate::{
    config,
    domain::{
        track::{
            NewRecording, NewTrack, Track, TrackId, TrackVersion, UserId, VersionId,
            VersionLabel, VersionPatch,
        },
        waveform::WaveformRecord,
    },
    storage::{
        db::{self, SecondsSinceUnix, i64_seconds_to_utc},
        error::StorageError,
        schema::tables::*,
    },
};

/// Attempts at allocating a version number before giving up on a conflict.
const VERSION_NUMBER_ATTEMPTS: usize = 5;

const TRACK_COLUMNS: &str = "id, owner_id, title, description, tags, visibility, version, \
     file_url, duration, waveform_data, pinned_version_id, created_at";

const VERSION_COLUMNS: &str = "id, track_id, version_number, title, description, file_url, \
     filename, duration, waveform_data, created_at";

/// Main structure that implements all storage logic
pub struct Storage {
    pub(crate) db: Connection,
}

/// A new recording offered as the next version of a track.
#[derive(Debug, Clone)]
pub struct VersionUpload {
    pub recording: NewRecording,
    pub title: Option<String>,
    pub description: Option<String>,
    pub make_default: bool,
}

/// One row of a version listing as a given requester may see it.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: TrackVersion,
    pub is_pinned: bool,
    show_filename: bool,
}

impl VersionEntry {
    /// Original filename, only revealed to the track owner.
    pub fn filename(&self) -> Option<&str> {
        self.show_filename.then_some(self.version.filename.as_str())
    }
}

/// The version a reader selected, resolved against the track.
#[derive(Debug, Clone)]
pub struct ResolvedView {
    pub track: Track,
    pub version: TrackVersion,
    pub is_canonical: bool,
}

#[derive(Debug)]
pub struct RepairReport {
    pub track: TrackId,
    pub reason: String,
    /// false when the violation could not be fixed automatically
    pub repaired: bool,
}

struct RawTrack {
    id: i64,
    owner: String,
    title: String,
    description: Option<String>,
    tags: String,
    visibility: String,
    version: String,
    file_url: String,
    duration: Option<f64>,
    waveform: Option<String>,
    pinned: Option<i64>,
    created_at: SecondsSinceUnix,
}

impl RawTrack {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            tags: row.get(4)?,
            visibility: row.get(5)?,
            version: row.get(6)?,
            file_url: row.get(7)?,
            duration: row.get(8)?,
            waveform: row.get(9)?,
            pinned: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_domain(self) -> Result<Track, StorageError> {
        Ok(Track {
            id: TrackId(self.id),
            owner: UserId(self.owner),
            title: self.title,
            description: self.description,
            tags: serde_json::from_str(&self.tags)?,
            visibility: self.visibility.parse()?,
            version: self.version.parse()?,
            file_url: self.file_url,
            duration: self.duration,
            waveform_data: self
                .waveform
                .as_deref()
                .map(WaveformRecord::from_json)
                .transpose()?,
            pinned_version_id: self.pinned.map(VersionId),
            created_at: i64_seconds_to_utc(self.created_at)?,
        })
    }
}

struct RawVersion {
    id: i64,
    track_id: i64,
    version_number: u32,
    title: Option<String>,
    description: Option<String>,
    file_url: String,
    filename: String,
    duration: Option<f64>,
    waveform: Option<String>,
    created_at: SecondsSinceUnix,
}

impl RawVersion {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            track_id: row.get(1)?,
            version_number: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            file_url: row.get(5)?,
            filename: row.get(6)?,
            duration: row.get(7)?,
            waveform: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_domain(self) -> Result<TrackVersion, StorageError> {
        Ok(TrackVersion {
            id: VersionId(self.id),
            track_id: TrackId(self.track_id),
            version_number: self.version_number,
            title: self.title,
            description: self.description,
            file_url: self.file_url,
            filename: self.filename,
            duration: self.duration,
            waveform_data: self
                .waveform
                .as_deref()
                .map(WaveformRecord::from_json)
                .transpose()?,
            created_at: i64_seconds_to_utc(self.created_at)?,
        })
    }
}

fn waveform_json(waveform: Option<&WaveformRecord>) -> Result<Option<String>, StorageError> {
    Ok(waveform.map(WaveformRecord::to_json).transpose()?)
}

pub(crate) fn load_track(conn: &Connection, id: TrackId) -> Result<Track, StorageError> {
    conn.query_row(
        &format!("SELECT {TRACK_COLUMNS} FROM {TRACKS} WHERE id = ?1"),
        params![id.0],
        RawTrack::from_row,
    )
    .optional()?
    .ok_or(StorageError::TrackNotFound(id))?
    .into_domain()
}

/// Loads a track the requester is allowed to see; hidden tracks look absent.
pub(crate) fn load_readable_track(
    conn: &Connection,
    id: TrackId,
    requester: Option<&UserId>,
) -> Result<Track, StorageError> {
    let track = load_track(conn, id)?;
    if !track.is_readable_by(requester) {
        return Err(StorageError::TrackNotFound(id));
    }
    Ok(track)
}

fn ensure_owner(track: &Track, requester: &UserId) -> Result<(), StorageError> {
    if track.is_owned_by(requester) {
        Ok(())
    } else {
        Err(StorageError::PermissionDenied(track.id))
    }
}

/// Loads a version, requiring it to belong to `track`.
fn load_version(
    conn: &Connection,
    track: TrackId,
    version: VersionId,
) -> Result<TrackVersion, StorageError> {
    conn.query_row(
        &format!("SELECT {VERSION_COLUMNS} FROM {TRACK_VERSIONS} WHERE id = ?1 AND track_id = ?2"),
        params![version.0, track.0],
        RawVersion::from_row,
    )
    .optional()?
    .ok_or(StorageError::VersionNotFound { track, version })?
    .into_domain()
}

pub(crate) fn load_versions(
    conn: &Connection,
    track: TrackId,
) -> Result<Vec<TrackVersion>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM {TRACK_VERSIONS} WHERE track_id = ?1 ORDER BY version_number"
    ))?;
    let raw = stmt
        .query_map(params![track.0], RawVersion::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawVersion::into_domain).collect()
}

fn next_version_number(conn: &Connection, track: TrackId) -> Result<u32, StorageError> {
    let max: u32 = conn.query_row(
        &format!("SELECT COALESCE(MAX(version_number), 0) FROM {TRACK_VERSIONS} WHERE track_id = ?1"),
        params![track.0],
        |row| row.get(0),
    )?;
    Ok(max + 1)
}

fn insert_version(
    conn: &Connection,
    track: TrackId,
    number: u32,
    recording: &NewRecording,
    title: Option<&str>,
    description: Option<&str>,
    created_at: SecondsSinceUnix,
) -> Result<VersionId, StorageError> {
    conn.execute(
        &format!(
            "INSERT INTO {TRACK_VERSIONS} (track_id, version_number, title, description, \
             file_url, filename, duration, waveform_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            track.0,
            number,
            title,
            description,
            recording.file_url,
            recording.filename,
            recording.duration,
            waveform_json(recording.waveform.as_ref())?,
            created_at,
        ],
    )?;
    Ok(VersionId(conn.last_insert_rowid()))
}

/// Copies `version`'s canonical fields onto its track, and moves the pin
/// pointer to it when `pin` is set.
fn write_canonical(
    conn: &Connection,
    track: TrackId,
    version: &TrackVersion,
    pin: bool,
) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "UPDATE {TRACKS} SET version = ?1, file_url = ?2, duration = ?3, waveform_data = ?4, \
             pinned_version_id = CASE WHEN ?5 THEN ?6 ELSE pinned_version_id END WHERE id = ?7"
        ),
        params![
            version.label().as_str(),
            version.file_url,
            version.duration,
            waveform_json(version.waveform_data.as_ref())?,
            pin,
            version.id.0,
            track.0,
        ],
    )?;
    Ok(())
}

/// The version whose fields the track must mirror: the pinned one, or the
/// original upload while nothing has been pinned.
fn canonical_of<'a>(track: &Track, versions: &'a [TrackVersion]) -> Result<&'a TrackVersion, String> {
    match track.pinned_version_id {
        Some(pinned) => versions
            .iter()
            .find(|v| v.id == pinned)
            .ok_or_else(|| format!("pinned version {pinned} does not belong to the track")),
        None => versions
            .first()
            .ok_or_else(|| "track has no versions".to_string()),
    }
}

/// Describes how `track` disagrees with its canonical version, if it does.
fn find_violation(track: &Track, versions: &[TrackVersion]) -> Option<String> {
    let canonical = match canonical_of(track, versions) {
        Ok(canonical) => canonical,
        Err(reason) => return Some(reason),
    };

    let in_sync = track.version == canonical.label()
        && track.file_url == canonical.file_url
        && track.duration == canonical.duration
        && track.waveform_data == canonical.waveform_data;

    (!in_sync).then(|| {
        format!(
            "canonical fields are stale relative to version {}",
            canonical.label()
        )
    })
}

fn is_unique_violation(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
    )
}

impl Storage {
    /// when called, opens a data base connection
    pub fn new(db_config: &config::Database) -> Result<Self, StorageError> {
        Ok(Self::from_existing_conn(db::open(db_config)?))
    }

    pub fn from_existing_conn(db: Connection) -> Self {
        Self { db }
    }

    /// Creates a track from its original upload, recorded as version 1.
    ///
    /// Nothing is pinned yet; the track mirrors the original.
    pub fn create_track(
        &mut self,
        owner: &UserId,
        track: NewTrack,
        recording: NewRecording,
    ) -> Result<(Track, TrackVersion), StorageError> {
        if track.title.trim().is_empty() {
            return Err(StorageError::InvalidInput("title must not be empty".into()));
        }
        let now = db::now()?;
        let label = VersionLabel::from_number(1);

        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!(
                "INSERT INTO {TRACKS} (owner_id, title, description, tags, visibility, version, \
                 file_url, duration, waveform_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                owner.0,
                track.title.trim(),
                track.description,
                serde_json::to_string(&track.tags)?,
                track.visibility.as_str(),
                label.as_str(),
                recording.file_url,
                recording.duration,
                waveform_json(recording.waveform.as_ref())?,
                now,
            ],
        )?;
        let track_id = TrackId(tx.last_insert_rowid());
        let version_id = insert_version(&tx, track_id, 1, &recording, None, None, now)?;

        let created = load_track(&tx, track_id)?;
        let original = load_version(&tx, track_id, version_id)?;
        tx.commit()?;

        info!("created track {track_id} for {owner} from {}", recording.filename);
        Ok((created, original))
    }

    /// Reads a track, repairing it first if it drifted from its canonical version.
    pub fn get_track(
        &mut self,
        id: TrackId,
        requester: Option<&UserId>,
    ) -> Result<Track, StorageError> {
        let track = load_readable_track(&self.db, id, requester)?;
        let versions = load_versions(&self.db, id)?;

        match find_violation(&track, &versions) {
            None => Ok(track),
            Some(reason) => {
                warn!("track {id} failed its consistency check: {reason}");
                self.repair_track(id)?;
                load_track(&self.db, id)
            }
        }
    }

    /// The requester's own tracks and everyone's public tracks, by id.
    ///
    /// Each listed track goes through the same consistency check as
    /// [`Storage::get_track`].
    pub fn list_tracks(&mut self, requester: Option<&UserId>) -> Result<Vec<Track>, StorageError> {
        let owner = requester.map(|u| u.0.as_str());
        let raw = {
            let mut stmt = self.db.prepare(&format!(
                "SELECT {TRACK_COLUMNS} FROM {TRACKS}
                 WHERE visibility = 'public' OR owner_id = ?1 ORDER BY id"
            ))?;
            stmt.query_map(params![owner], RawTrack::from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };

        raw.into_iter()
            .map(|raw| {
                let track = raw.into_domain()?;
                self.get_track(track.id, requester)
            })
            .collect()
    }

    pub fn track_ids(&mut self) -> Result<Vec<TrackId>, StorageError> {
        let mut stmt = self
            .db
            .prepare(&format!("SELECT id FROM {TRACKS} ORDER BY id"))?;
        let ids = stmt
            .query_map([], |row| Ok(TrackId(row.get(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Appends the next version to a track; with `make_default` it is pinned
    /// in the same transaction.
    ///
    /// Numbers come from `max + 1` under an immediate transaction; a unique
    /// constraint conflict from a concurrent writer is retried.
    pub fn upload_version(
        &mut self,
        track_id: TrackId,
        requester: &UserId,
        upload: &VersionUpload,
    ) -> Result<(TrackVersion, Track), StorageError> {
        let mut attempt = 1;
        loop {
            match self.try_upload_version(track_id, requester, upload) {
                Err(e) if is_unique_violation(&e) && attempt < VERSION_NUMBER_ATTEMPTS => {
                    warn!("version number conflict on track {track_id}, retrying ({attempt})");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn try_upload_version(
        &mut self,
        track_id: TrackId,
        requester: &UserId,
        upload: &VersionUpload,
    ) -> Result<(TrackVersion, Track), StorageError> {
        let now = db::now()?;
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let track = load_readable_track(&tx, track_id, Some(requester))?;
        ensure_owner(&track, requester)?;

        let number = next_version_number(&tx, track_id)?;
        let version_id = insert_version(
            &tx,
            track_id,
            number,
            &upload.recording,
            upload.title.as_deref(),
            upload.description.as_deref(),
            now,
        )?;
        let version = load_version(&tx, track_id, version_id)?;

        if upload.make_default {
            write_canonical(&tx, track_id, &version, true)?;
        }
        let track = load_track(&tx, track_id)?;
        tx.commit()?;

        info!(
            "track {track_id}: uploaded version {}{}",
            version.label(),
            if upload.make_default { " (pinned)" } else { "" }
        );
        Ok((version, track))
    }

    /// Makes `version_id` the pinned version of `track_id` and mirrors it onto
    /// the track, all in one transaction.
    ///
    /// Fails without writing anything when the version is not part of the track.
    pub fn pin_version(
        &mut self,
        track_id: TrackId,
        version_id: VersionId,
        requester: &UserId,
    ) -> Result<(TrackVersion, Track), StorageError> {
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let track = load_readable_track(&tx, track_id, Some(requester))?;
        ensure_owner(&track, requester)?;
        let version = load_version(&tx, track_id, version_id)?;

        write_canonical(&tx, track_id, &version, true)?;
        let track = load_track(&tx, track_id)?;
        tx.commit()?;

        info!("track {track_id}: pinned version {}", version.label());
        Ok((version, track))
    }

    pub fn update_version(
        &mut self,
        track_id: TrackId,
        version_id: VersionId,
        requester: &UserId,
        patch: &VersionPatch,
    ) -> Result<TrackVersion, StorageError> {
        let tx = self.db.transaction()?;

        let track = load_readable_track(&tx, track_id, Some(requester))?;
        ensure_owner(&track, requester)?;
        load_version(&tx, track_id, version_id)?;

        tx.execute(
            &format!(
                "UPDATE {TRACK_VERSIONS} SET title = COALESCE(?1, title), \
                 description = COALESCE(?2, description) WHERE id = ?3"
            ),
            params![patch.title, patch.description, version_id.0],
        )?;
        let version = load_version(&tx, track_id, version_id)?;
        tx.commit()?;

        Ok(version)
    }

    /// Versions ordered by number; filenames are hidden from non-owners.
    pub fn list_versions(
        &mut self,
        track_id: TrackId,
        requester: Option<&UserId>,
    ) -> Result<Vec<VersionEntry>, StorageError> {
        let track = self.get_track(track_id, requester)?;
        let is_owner = requester.is_some_and(|u| track.is_owned_by(u));

        Ok(load_versions(&self.db, track_id)?
            .into_iter()
            .map(|version| VersionEntry {
                is_pinned: version.is_pinned_on(&track),
                show_filename: is_owner,
                version,
            })
            .collect())
    }

    /// Resolves the version a reader wants to look at; the canonical one by default.
    pub fn resolve_view(
        &mut self,
        track_id: TrackId,
        requester: Option<&UserId>,
        label: Option<&VersionLabel>,
    ) -> Result<ResolvedView, StorageError> {
        let track = self.get_track(track_id, requester)?;
        let versions = load_versions(&self.db, track_id)?;
        let canonical = canonical_of(&track, &versions)
            .map_err(|reason| StorageError::InvariantViolation {
                track: track_id,
                reason,
            })?
            .id;

        let version = match label {
            Some(label) => versions
                .into_iter()
                .find(|v| v.label() == *label)
                .ok_or_else(|| StorageError::VersionLabelNotFound {
                    track: track_id,
                    label: label.to_string(),
                })?,
            None => versions
                .into_iter()
                .find(|v| v.id == canonical)
                .ok_or(StorageError::TrackNotFound(track_id))?,
        };

        Ok(ResolvedView {
            is_canonical: version.id == canonical,
            track,
            version,
        })
    }

    /// Reports a consistency violation on the track without changing it.
    pub fn check_track(&mut self, track_id: TrackId) -> Result<Option<StorageError>, StorageError> {
        let track = load_track(&self.db, track_id)?;
        let versions = load_versions(&self.db, track_id)?;
        Ok(find_violation(&track, &versions).map(|reason| StorageError::InvariantViolation {
            track: track_id,
            reason,
        }))
    }

    /// Restores "the track mirrors its canonical version".
    ///
    /// A pin pointing outside the track moves to the highest-numbered version.
    /// Returns None when the track was already consistent.
    pub fn repair_track(&mut self, track_id: TrackId) -> Result<Option<RepairReport>, StorageError> {
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let track = load_track(&tx, track_id)?;
        let versions = load_versions(&tx, track_id)?;

        let Some(reason) = find_violation(&track, &versions) else {
            return Ok(None);
        };

        let repaired = match canonical_of(&track, &versions) {
            Ok(canonical) => {
                write_canonical(&tx, track_id, canonical, false)?;
                true
            }
            Err(_) => match versions.last() {
                Some(highest) => {
                    write_canonical(&tx, track_id, highest, true)?;
                    true
                }
                None => false,
            },
        };
        tx.commit()?;

        if repaired {
            warn!("track {track_id} repaired: {reason}");
        } else {
            warn!("track {track_id} could not be repaired: {reason}");
        }
        Ok(Some(RepairReport {
            track: track_id,
            reason,
            repaired,
        }))
    }

    /// Runs [`Storage::repair_track`] over every track.
    pub fn repair_all(&mut self) -> Result<Vec<RepairReport>, StorageError> {
        let mut reports = Vec::new();
        for id in self.track_ids()? {
            if let Some(report) = self.repair_track(id)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Versions whose waveform was never extracted, oldest first.
    pub fn versions_missing_waveform(&mut self) -> Result<Vec<TrackVersion>, StorageError> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM {TRACK_VERSIONS} WHERE waveform_data IS NULL ORDER BY id"
        ))?;
        let raw = stmt
            .query_map([], RawVersion::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawVersion::into_domain).collect()
    }

    /// Stores recomputed analysis for a version, refreshing the track's
    /// mirror when that version is canonical.
    pub fn set_version_analysis(
        &mut self,
        track_id: TrackId,
        version_id: VersionId,
        duration: f64,
        waveform: &WaveformRecord,
    ) -> Result<TrackVersion, StorageError> {
        let tx = self.db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_version(&tx, track_id, version_id)?;

        tx.execute(
            &format!(
                "UPDATE {TRACK_VERSIONS} SET duration = ?1, waveform_data = ?2 WHERE id = ?3"
            ),
            params![duration, waveform.to_json()?, version_id.0],
        )?;
        let version = load_version(&tx, track_id, version_id)?;

        let track = load_track(&tx, track_id)?;
        let versions = load_versions(&tx, track_id)?;
        if canonical_of(&track, &versions).is_ok_and(|c| c.id == version_id) {
            write_canonical(&tx, track_id, &version, false)?;
        }
        tx.commit()?;

        Ok(version)
    }
}

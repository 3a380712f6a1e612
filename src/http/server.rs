use anyhow::anyhow;
use log::{debug, info};
use rouille::{Request, Response};
use serde::{Deserialize, Serialize};
use std::{
    io::Read,
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    config::HttpConfig,
    domain::{
        track::{NewTrack, Track, TrackId, TrackVersion, UserId, VersionId, VersionLabel, VersionPatch, Visibility},
        waveform::WaveformRecord,
    },
    http::error::ApiError,
    storage::{
        comments::{NewComment, PlacedComment},
        error::StorageError,
        files::LocalFileStore,
        operations::{Storage, VersionEntry, VersionUpload},
    },
    waveform::{extract::PeakExtractor, ingest::ingest, render::render_bars},
};

pub const USER_HEADER: &str = "X-User-Id";

const DEFAULT_BARS: usize = 100;
const MAX_BARS: usize = 4096;

pub struct HttpServer {
    storage: Arc<Mutex<Storage>>,
    files: LocalFileStore,
    extractor: PeakExtractor,
    pub config: HttpConfig,
}

impl HttpServer {
    pub fn new(
        storage: Storage,
        files: LocalFileStore,
        extractor: PeakExtractor,
        config: HttpConfig,
    ) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
            files,
            extractor,
            config,
        }
    }

    pub fn run(self) {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        rouille::start_server(addr, move |request| self.handle_request(request));
    }

    fn handle_request(&self, request: &Request) -> Response {
        Self::log_request(request);

        let result = rouille::router!(request,
            (POST) (/tracks) => {
                self.create_track(request)
            },
            (GET) (/tracks) => {
                self.list_tracks(request)
            },
            (GET) (/tracks/{id: i64}) => {
                self.get_track(request, TrackId(id))
            },
            (GET) (/tracks/{id: i64}/versions) => {
                self.list_versions(request, TrackId(id))
            },
            (POST) (/tracks/{id: i64}/versions) => {
                self.upload_version(request, TrackId(id))
            },
            (PATCH) (/tracks/{id: i64}/versions/{vid: i64}) => {
                self.update_version(request, TrackId(id), VersionId(vid))
            },
            (POST) (/tracks/{id: i64}/versions/{vid: i64}/pin) => {
                self.pin_version(request, TrackId(id), VersionId(vid))
            },
            (GET) (/tracks/{id: i64}/waveform) => {
                self.waveform(request, TrackId(id))
            },
            (GET) (/tracks/{id: i64}/comments) => {
                self.list_comments(request, TrackId(id))
            },
            (POST) (/tracks/{id: i64}/comments) => {
                self.add_comment(request, TrackId(id))
            },
            (GET) (/files/{key: String}) => {
                self.get_file(&key)
            },
            _ => Ok(Response::empty_404())
        );

        let response = result.unwrap_or_else(ApiError::into_response);
        info!("Response: {} {}", request.method(), response.status_code);
        response
    }

    fn log_request(request: &Request) {
        info!("{} {}", request.method(), request.url());
    }

    fn lock(&self) -> Result<MutexGuard<'_, Storage>, ApiError> {
        self.storage.lock().map_err(|e| {
            StorageError::Internal(anyhow!("Could not access trackvault storage under lock: {e}"))
                .into()
        })
    }

    fn create_track(&self, request: &Request) -> Result<Response, ApiError> {
        let owner = require_user(request)?;
        let title = require_param(request, "title")?;
        let filename = require_param(request, "filename")?;
        let visibility = match request.get_param("visibility") {
            Some(v) => parse_param::<Visibility>("visibility", &v)?,
            None => Visibility::default(),
        };
        let bytes = read_body(request)?;

        let recording = ingest(&self.files, &self.extractor, &bytes, &filename)?;
        let new_track = NewTrack {
            title,
            description: request.get_param("description"),
            tags: request.get_param("tags").map(|t| parse_tags(&t)).unwrap_or_default(),
            visibility,
        };
        let (track, _) = self.lock()?.create_track(&owner, new_track, recording)?;

        Ok(Response::json(&TrackResponse::from_domain(&track)).with_status_code(201))
    }

    fn list_tracks(&self, request: &Request) -> Result<Response, ApiError> {
        let requester = requester(request);
        let tracks = self.lock()?.list_tracks(requester.as_ref())?;
        let body: Vec<TrackResponse> = tracks.iter().map(TrackResponse::from_domain).collect();
        Ok(Response::json(&body))
    }

    fn get_track(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let track = self.lock()?.get_track(id, requester(request).as_ref())?;
        Ok(Response::json(&TrackResponse::from_domain(&track)))
    }

    fn list_versions(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let entries = self.lock()?.list_versions(id, requester(request).as_ref())?;
        let body: Vec<VersionResponse> = entries.iter().map(VersionResponse::from_entry).collect();
        Ok(Response::json(&body))
    }

    fn upload_version(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let owner = require_user(request)?;
        let filename = require_param(request, "filename")?;
        let make_default = match request.get_param("make_default") {
            Some(v) => parse_param::<bool>("make_default", &v)?,
            None => false,
        };
        let bytes = read_body(request)?;

        // Fail before storing anything the requester may not attach.
        {
            let mut storage = self.lock()?;
            let track = storage.get_track(id, Some(&owner))?;
            if !track.is_owned_by(&owner) {
                return Err(StorageError::PermissionDenied(id).into());
            }
        }

        let upload = VersionUpload {
            recording: ingest(&self.files, &self.extractor, &bytes, &filename)?,
            title: request.get_param("title"),
            description: request.get_param("description"),
            make_default,
        };
        let (version, track) = self.lock()?.upload_version(id, &owner, &upload)?;

        Ok(Response::json(&VersionResponse::for_owner(&version, &track)).with_status_code(201))
    }

    fn update_version(
        &self,
        request: &Request,
        id: TrackId,
        version_id: VersionId,
    ) -> Result<Response, ApiError> {
        let owner = require_user(request)?;
        let patch: VersionPatch = read_json(request)?;

        let mut storage = self.lock()?;
        let version = storage.update_version(id, version_id, &owner, &patch)?;
        let track = storage.get_track(id, Some(&owner))?;

        Ok(Response::json(&VersionResponse::for_owner(&version, &track)))
    }

    fn pin_version(
        &self,
        request: &Request,
        id: TrackId,
        version_id: VersionId,
    ) -> Result<Response, ApiError> {
        let owner = require_user(request)?;
        let (version, track) = self.lock()?.pin_version(id, version_id, &owner)?;

        Ok(Response::json(&PinResponse {
            version: VersionResponse::for_owner(&version, &track),
            track: TrackResponse::from_domain(&track),
        }))
    }

    fn waveform(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let width = match request.get_param("width") {
            Some(w) => parse_param::<usize>("width", &w)?,
            None => DEFAULT_BARS,
        };
        if width == 0 || width > MAX_BARS {
            return Err(ApiError::BadRequest(format!(
                "width must be between 1 and {MAX_BARS}"
            )));
        }
        let label = optional_label(request)?;

        let view = self
            .lock()?
            .resolve_view(id, requester(request).as_ref(), label.as_ref())?;
        let seed = view.version.id.0 as u64;
        let rendered = render_bars(view.version.waveform_data.as_ref(), width, seed);

        Ok(Response::json(&WaveformResponse {
            version: view.version.label().to_string(),
            placeholder: rendered.is_placeholder(),
            bars: rendered.bars().to_vec(),
        }))
    }

    fn list_comments(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let label = optional_label(request)?;
        let thread = self
            .lock()?
            .list_comments(id, requester(request).as_ref(), label.as_ref())?;

        Ok(Response::json(&CommentsResponse {
            version: thread.viewed.label.to_string(),
            is_canonical: thread.viewed.is_canonical,
            comments: thread.comments.iter().map(CommentResponse::from_placed).collect(),
        }))
    }

    fn add_comment(&self, request: &Request, id: TrackId) -> Result<Response, ApiError> {
        let author = require_user(request)?;
        let body: CommentRequest = read_json(request)?;
        let version = body
            .version
            .as_deref()
            .map(|v| parse_param::<VersionLabel>("version", v))
            .transpose()?;

        let comment = self.lock()?.add_comment(
            id,
            &author,
            NewComment {
                content: body.content,
                timestamp: body.timestamp,
                version,
            },
        )?;

        let placed = PlacedComment {
            comment,
            marker: None,
        };
        Ok(Response::json(&CommentResponse::from_placed(&placed)).with_status_code(201))
    }

    fn get_file(&self, key: &str) -> Result<Response, ApiError> {
        let (file, path) = self.files.open(key)?;
        let mime = Self::mime_for_track(&path);
        debug!("FILE {key} -> 200 OK, MIME type: {mime}");
        Ok(Response::from_file(mime, file))
    }

    fn mime_for_track(path: &Path) -> String {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy())
            .map(|s| s.to_lowercase());
        let default = || {
            mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string()
        };
        ext.and_then(|ext| Self::mime_from_ext(ext.as_str()))
            .unwrap_or_else(default)
    }

    /// Map file extension (without dot) to proper MIME type for browser playback.
    /// Returns None if the extension is not recognized.
    pub fn mime_from_ext(ext: &str) -> Option<String> {
        match ext {
            "m4a" => Some("audio/x-m4a".to_string()), // Safari iOS compatible
            "aac" => Some("audio/aac".to_string()),
            "mp3" => Some("audio/mpeg".to_string()),
            "wav" => Some("audio/wav".to_string()),
            "ogg" => Some("audio/ogg".to_string()),
            "flac" => Some("audio/flac".to_string()),
            _ => None,
        }
    }
}

fn requester(request: &Request) -> Option<UserId> {
    request
        .header(USER_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(UserId::new)
}

fn require_user(request: &Request) -> Result<UserId, ApiError> {
    requester(request).ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_HEADER} header")))
}

fn require_param(request: &Request, name: &str) -> Result<String, ApiError> {
    request
        .get_param(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter '{name}'")))
}

fn parse_param<T: FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {name} '{value}'")))
}

/// `tags=demo,rough mix` becomes `["demo", "rough mix"]`.
fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

fn optional_label(request: &Request) -> Result<Option<VersionLabel>, ApiError> {
    request
        .get_param("version")
        .map(|v| parse_param::<VersionLabel>("version", &v))
        .transpose()
}

fn read_body(request: &Request) -> Result<Vec<u8>, ApiError> {
    let mut data = request
        .data()
        .ok_or_else(|| ApiError::BadRequest("request body was already read".into()))?;
    let mut bytes = Vec::new();
    data.read_to_end(&mut bytes).map_err(StorageError::Fs)?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".into()));
    }
    Ok(bytes)
}

fn read_json<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, ApiError> {
    let bytes = read_body(request)?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    pub id: i64,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub version: String,
    pub file_url: String,
    pub duration: Option<f64>,
    pub waveform_data: Option<WaveformRecord>,
    pub pinned_version_id: Option<i64>,
    pub created_at: String,
}

impl TrackResponse {
    pub fn from_domain(track: &Track) -> Self {
        Self {
            id: track.id.0,
            owner: track.owner.0.clone(),
            title: track.title.clone(),
            description: track.description.clone(),
            tags: track.tags.clone(),
            visibility: track.visibility,
            version: track.version.to_string(),
            file_url: track.file_url.clone(),
            duration: track.duration,
            waveform_data: track.waveform_data.clone(),
            pinned_version_id: track.pinned_version_id.map(|id| id.0),
            created_at: track.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub id: i64,
    pub version_number: u32,
    pub label: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub file_url: String,
    /// Original upload name, only shown to the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub duration: Option<f64>,
    pub is_pinned: bool,
    pub created_at: String,
    pub waveform_data: Option<WaveformRecord>,
}

impl VersionResponse {
    fn new(version: &TrackVersion, is_pinned: bool, filename: Option<&str>) -> Self {
        Self {
            id: version.id.0,
            version_number: version.version_number,
            label: version.label().to_string(),
            title: version.title.clone(),
            description: version.description.clone(),
            file_url: version.file_url.clone(),
            filename: filename.map(str::to_string),
            duration: version.duration,
            is_pinned,
            created_at: version.created_at.to_rfc3339(),
            waveform_data: version.waveform_data.clone(),
        }
    }

    pub fn from_entry(entry: &VersionEntry) -> Self {
        Self::new(&entry.version, entry.is_pinned, entry.filename())
    }

    pub fn for_owner(version: &TrackVersion, track: &Track) -> Self {
        Self::new(version, version.is_pinned_on(track), Some(&version.filename))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PinResponse {
    pub version: VersionResponse,
    pub track: TrackResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaveformResponse {
    pub version: String,
    pub bars: Vec<f32>,
    /// True when the bars are decorative rather than extracted from audio.
    pub placeholder: bool,
}

#[derive(Debug, Deserialize)]
struct CommentRequest {
    content: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentResponse {
    pub id: i64,
    pub track_id: i64,
    pub user_id: String,
    pub content: String,
    pub timestamp: Option<f64>,
    pub version: Option<String>,
    pub created_at: String,
    pub marker: Option<f64>,
}

impl CommentResponse {
    fn from_placed(placed: &PlacedComment) -> Self {
        let comment = &placed.comment;
        Self {
            id: comment.id.0,
            track_id: comment.track_id.0,
            user_id: comment.user.0.clone(),
            content: comment.content.clone(),
            timestamp: comment.timestamp,
            version: comment.version.as_ref().map(|v| v.to_string()),
            created_at: comment.created_at.to_rfc3339(),
            marker: placed.marker,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentsResponse {
    pub version: String,
    pub is_canonical: bool,
    pub comments: Vec<CommentResponse>,
}

pub fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: rouille::Response,
) -> anyhow::Result<T> {
    Ok(serde_json::from_reader(
        response.data.into_reader_and_size().0,
    )?)
}

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::domain::track::{NewTrack, TrackId, UserId, VersionLabel, Visibility};
use crate::http::server::HttpServer;
use crate::storage::files::{LocalFileStore, is_music_file};
use crate::storage::operations::{Storage, VersionUpload};
use crate::waveform::extract::PeakExtractor;
use crate::waveform::ingest::{ingest, recompute_missing};

#[derive(Parser)]
#[command(name = "trackvault")]
#[command(version = "0.1")]
#[command(about = "Versioned audio track hosting")]
pub struct Cli {
    /// Path to the config TOML file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run http server
    Serve,
    /// Create a track from an audio file
    Import {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        owner: String,
        /// private, unlisted or public
        #[arg(long, default_value = "private")]
        visibility: Visibility,
    },
    /// Upload a new version of a track
    AddVersion {
        track: i64,
        file: PathBuf,
        #[arg(long)]
        owner: String,
        /// Pin the new version right away
        #[arg(long)]
        make_default: bool,
    },
    /// Pin a version (by label, e.g. 2 or 002)
    Pin {
        track: i64,
        version: VersionLabel,
        #[arg(long)]
        owner: String,
    },
    /// List versions of a track
    Versions {
        track: i64,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Extract waveforms that are still missing
    Recompute,
    /// Check every track against its canonical version and repair drift
    Check {
        /// Only report, change nothing
        #[arg(long)]
        dry_run: bool,
    },
}

struct Services {
    storage: Storage,
    files: LocalFileStore,
    extractor: PeakExtractor,
}

impl Services {
    fn open(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            storage: Storage::new(&cfg.database).context("Failed to initialize storage")?,
            files: LocalFileStore::new(&cfg.files).context("Failed to open file store")?,
            extractor: PeakExtractor::from_config(&cfg.waveform),
        })
    }
}

fn read_upload(path: &Path) -> anyhow::Result<(Vec<u8>, String)> {
    if !is_music_file(path) {
        return Err(anyhow!("{} is not a supported audio file", path.display()));
    }
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok((bytes, filename))
}

/// Entrypoint for CLI
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = config::Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let Services {
                storage,
                files,
                extractor,
            } = Services::open(&cfg)?;
            let http_server = HttpServer::new(storage, files, extractor, cfg.http);

            info!(
                "HTTP server running at http://{}:{}",
                http_server.config.bind_addr, http_server.config.port
            );
            http_server.run();
        }

        Commands::Import {
            file,
            title,
            owner,
            visibility,
        } => {
            let mut services = Services::open(&cfg)?;
            let (bytes, filename) = read_upload(&file)?;
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| filename.clone())
            });

            let recording = ingest(&services.files, &services.extractor, &bytes, &filename)?;
            let (track, original) = services.storage.create_track(
                &UserId::new(owner),
                NewTrack {
                    title,
                    visibility,
                    ..Default::default()
                },
                recording,
            )?;

            println!("Created track {} \"{}\"", track.id, track.title);
            println!("  version {} at {}", original.label(), original.file_url);
            if original.waveform_data.is_none() {
                println!("  waveform missing, run \"recompute\" later");
            }
        }

        Commands::AddVersion {
            track,
            file,
            owner,
            make_default,
        } => {
            let mut services = Services::open(&cfg)?;
            let (bytes, filename) = read_upload(&file)?;
            let owner = UserId::new(owner);
            let track_id = TrackId(track);

            // surfaces missing track or wrong owner before the file is stored
            let current = services.storage.get_track(track_id, Some(&owner))?;
            if !current.is_owned_by(&owner) {
                return Err(anyhow!("{owner} does not own track {track_id}"));
            }

            let upload = VersionUpload {
                recording: ingest(&services.files, &services.extractor, &bytes, &filename)?,
                title: None,
                description: None,
                make_default,
            };
            let (version, track) = services.storage.upload_version(track_id, &owner, &upload)?;

            println!("Uploaded version {} of track {}", version.label(), track.id);
            println!("  canonical version is now {}", track.version);
        }

        Commands::Pin {
            track,
            version,
            owner,
        } => {
            let mut storage = Storage::new(&cfg.database)?;
            let owner = UserId::new(owner);
            let track_id = TrackId(track);

            let target = storage
                .list_versions(track_id, Some(&owner))?
                .into_iter()
                .find(|entry| entry.version.label() == version)
                .ok_or_else(|| anyhow!("track {track_id} has no version {version}"))?;
            let (pinned, track) = storage.pin_version(track_id, target.version.id, &owner)?;

            println!("Pinned version {} of track {}", pinned.label(), track.id);
        }

        Commands::Versions { track, owner } => {
            let mut storage = Storage::new(&cfg.database)?;
            let owner = owner.map(UserId::new);
            let track_id = TrackId(track);

            let track = storage.get_track(track_id, owner.as_ref())?;
            println!("Track {}: {} ({})", track.id, track.title, track.visibility.as_str());

            for entry in storage.list_versions(track_id, owner.as_ref())? {
                let version = &entry.version;
                let marker = if entry.is_pinned { "*" } else { " " };
                let duration = version
                    .duration
                    .map(|d| format!("{d:.1}s"))
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    " {marker} {}  {}  {}  {}",
                    version.label(),
                    version.title.as_deref().unwrap_or("-"),
                    duration,
                    entry.filename().unwrap_or("")
                );
            }
        }

        Commands::Recompute => {
            let mut services = Services::open(&cfg)?;
            let summary = recompute_missing(
                &mut services.storage,
                &services.files,
                &services.extractor,
            )?;

            for version in &summary.recomputed {
                println!("    - track {} version {}", version.track_id, version.label());
            }
            println!(
                "Recomputed {} version(s), {} failed",
                summary.recomputed.len(),
                summary.failed
            );
        }

        Commands::Check { dry_run: true } => {
            let mut storage = Storage::new(&cfg.database)?;
            let mut broken = 0;
            for id in storage.track_ids()? {
                if let Some(violation) = storage.check_track(id)? {
                    broken += 1;
                    println!("  [BROKEN]  {violation}");
                }
            }
            println!("{broken} track(s) need repair");
        }

        Commands::Check { dry_run: false } => {
            let mut storage = Storage::new(&cfg.database)?;
            let reports = storage.repair_all()?;

            if reports.is_empty() {
                println!("All tracks match their canonical version");
            }
            for report in &reports {
                let status = if report.repaired { "REPAIRED" } else { "BROKEN" };
                println!("  [{status}]  track {}: {}", report.track, report.reason);
            }
        }
    }

    Ok(())
}

use log::{info, warn};

use crate::{
    domain::{
        track::{NewRecording, TrackVersion},
        waveform::WaveformRecord,
    },
    storage::{error::StorageError, files::ObjectStore, operations::Storage},
    waveform::extract::PeakExtractor,
};

/// Stores an upload and analyzes it.
///
/// Extraction failures never fail the upload: the recording simply comes back
/// without duration and waveform so a later recompute can fill them in.
pub fn ingest(
    files: &dyn ObjectStore,
    extractor: &PeakExtractor,
    bytes: &[u8],
    filename: &str,
) -> Result<NewRecording, StorageError> {
    let stored = files.put(bytes, filename)?;

    let (duration, waveform) = match extractor.analyze(bytes, filename) {
        Ok((duration, waveform)) => {
            info!(
                "extracted {} peaks ({duration:.1}s) from {filename}",
                waveform.full.len()
            );
            (Some(duration), Some(waveform))
        }
        Err(e) => {
            warn!("{filename} stored as {} without waveform: {e}", stored.file_url);
            (None, None)
        }
    };

    Ok(NewRecording {
        file_url: stored.file_url,
        filename: filename.to_string(),
        duration,
        waveform,
    })
}

/// Re-extracts a stored file for the batch recompute job.
pub fn reanalyze(
    files: &dyn ObjectStore,
    extractor: &PeakExtractor,
    file_url: &str,
    filename: &str,
) -> Result<Option<(f64, WaveformRecord)>, StorageError> {
    let bytes = files.get(file_url)?;
    match extractor.analyze(&bytes, filename) {
        Ok(analysis) => Ok(Some(analysis)),
        Err(e) => {
            warn!("recompute of {file_url} failed: {e}");
            Ok(None)
        }
    }
}

#[derive(Debug, Default)]
pub struct RecomputeSummary {
    pub recomputed: Vec<TrackVersion>,
    /// Versions whose stored file could not be read or decoded.
    pub failed: usize,
}

/// Fills in waveforms for every version that lacks one.
///
/// A version that cannot be processed is logged and skipped; the batch
/// carries on with the rest.
pub fn recompute_missing(
    storage: &mut Storage,
    files: &dyn ObjectStore,
    extractor: &PeakExtractor,
) -> Result<RecomputeSummary, StorageError> {
    let mut summary = RecomputeSummary::default();

    for version in storage.versions_missing_waveform()? {
        let analysis = match reanalyze(files, extractor, &version.file_url, &version.filename) {
            Ok(Some(analysis)) => analysis,
            Ok(None) => {
                summary.failed += 1;
                continue;
            }
            Err(e) => {
                warn!(
                    "skipping track {} version {}: {e}",
                    version.track_id,
                    version.label()
                );
                summary.failed += 1;
                continue;
            }
        };

        let (duration, waveform) = analysis;
        let updated =
            storage.set_version_analysis(version.track_id, version.id, duration, &waveform)?;
        summary.recomputed.push(updated);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::{config::FilesConfig, storage::files::LocalFileStore, waveform::fixtures::wav_bytes};

    fn setup(root: &std::path::Path) -> anyhow::Result<(LocalFileStore, PeakExtractor)> {
        let files = LocalFileStore::new(&FilesConfig {
            root: root.to_path_buf(),
            base_url: "/files".into(),
        })?;
        Ok((files, PeakExtractor::new(10, 5, Duration::from_secs(30))))
    }

    #[test]
    fn test_ingest_valid_audio() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (files, extractor) = setup(dir.path())?;
        let bytes = wav_bytes(8000, 1, &vec![0.4f32; 8000])?;

        let recording = ingest(&files, &extractor, &bytes, "demo.wav")?;

        assert!(recording.file_url.starts_with("/files/"));
        assert_eq!(recording.filename, "demo.wav");
        assert!((recording.duration.unwrap() - 1.0).abs() < 0.01);
        let waveform = recording.waveform.unwrap();
        assert_eq!(waveform.full.len(), 10);
        assert_eq!(waveform.simplified.len(), 5);
        assert_eq!(files.get(&recording.file_url)?, bytes);
        Ok(())
    }

    #[test]
    fn test_corrupt_audio_is_still_stored() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (files, extractor) = setup(dir.path())?;

        let recording = ingest(&files, &extractor, b"\x00\x01garbage", "broken.mp3")?;

        assert_eq!(recording.duration, None);
        assert_eq!(recording.waveform, None);
        assert_eq!(files.get(&recording.file_url)?, b"\x00\x01garbage");
        Ok(())
    }

    #[test]
    fn test_non_audio_upload_is_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (files, extractor) = setup(dir.path())?;

        let err = ingest(&files, &extractor, b"hello", "notes.txt").unwrap_err();

        assert!(matches!(err, StorageError::UnsupportedFile(_)));
        Ok(())
    }

    #[test]
    fn test_reanalyze_reads_back_stored_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (files, extractor) = setup(dir.path())?;
        let bytes = wav_bytes(8000, 1, &vec![0.4f32; 4000])?;
        let stored = files.put(&bytes, "late.wav")?;

        let (duration, record) = reanalyze(&files, &extractor, &stored.file_url, "late.wav")?
            .expect("valid audio analyzes");

        assert!((duration - 0.5).abs() < 0.01);
        assert_eq!(record.full.len(), 5);
        Ok(())
    }

    #[test]
    fn test_recompute_skips_unreadable_versions() -> anyhow::Result<()> {
        use crate::{
            domain::track::{NewTrack, UserId},
            storage::operations::{VersionUpload, tests::setup_storage},
        };

        let dir = tempdir()?;
        let (files, extractor) = setup(dir.path())?;
        let mut storage = setup_storage()?;
        let owner = UserId::new("owner");

        let missing = NewRecording {
            file_url: files.put(b"gone soon", "lost.wav")?.file_url,
            filename: "lost.wav".into(),
            duration: None,
            waveform: None,
        };
        std::fs::remove_dir_all(dir.path())?;
        std::fs::create_dir_all(dir.path())?;
        let (track, _) = storage.create_track(
            &owner,
            NewTrack {
                title: "Demo".into(),
                ..Default::default()
            },
            missing,
        )?;

        let bytes = wav_bytes(8000, 1, &vec![0.4f32; 8000])?;
        let stored = files.put(&bytes, "late.wav")?;
        let late = NewRecording {
            file_url: stored.file_url,
            filename: "late.wav".into(),
            duration: None,
            waveform: None,
        };
        storage.upload_version(
            track.id,
            &owner,
            &VersionUpload {
                recording: late,
                title: None,
                description: None,
                make_default: true,
            },
        )?;

        let summary = recompute_missing(&mut storage, &files, &extractor)?;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recomputed.len(), 1);
        assert_eq!(summary.recomputed[0].version_number, 2);
        assert_eq!(storage.versions_missing_waveform()?.len(), 1);
        let track = storage.get_track(track.id, Some(&owner))?;
        assert!((track.duration.unwrap() - 1.0).abs() < 0.01);
        Ok(())
    }
}

//! Content-addressed object store for uploaded audio.

use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::debug;
use tempfile::NamedTempFile;

use crate::{config::FilesConfig, domain::hash::ContentHash, storage::error::StorageError};

const MUSIC_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "m4a", "ogg", "aac"];

pub fn is_music_file(path: &Path) -> bool {
    music_extension(path).is_some()
}

fn music_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .filter(|ext| MUSIC_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub file_url: String,
}

/// Binary storage for audio uploads.
pub trait ObjectStore: Send + Sync {
    /// Persists `bytes` and returns a durable url for them.
    fn put(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, StorageError>;

    /// Reads back the bytes behind a url issued by [`ObjectStore::put`].
    fn get(&self, file_url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Stores each upload as `<root>/<blake3 hex>.<ext>`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    base_url: String,
}

impl LocalFileStore {
    pub fn new(config: &FilesConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Opens a stored object for streaming. Only `<hex>.<ext>` keys resolve.
    pub fn open(&self, key: &str) -> Result<(File, PathBuf), StorageError> {
        let path = self.path_for_key(key)?;
        match File::open(&path) {
            Ok(file) => Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Fs(e)),
        }
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = || StorageError::ObjectNotFound(key.to_string());

        if key.contains(['/', '\\']) {
            return Err(invalid());
        }
        let (stem, ext) = key.rsplit_once('.').ok_or_else(invalid)?;
        let is_hash = stem.len() == 64 && ContentHash::from_hex(stem).is_ok();
        if !is_hash || !MUSIC_EXTENSIONS.contains(&ext) {
            return Err(invalid());
        }
        Ok(self.root.join(key))
    }

    fn key_from_url<'a>(&self, file_url: &'a str) -> Option<&'a str> {
        file_url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl ObjectStore for LocalFileStore {
    fn put(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, StorageError> {
        let ext = music_extension(Path::new(filename))
            .ok_or_else(|| StorageError::UnsupportedFile(filename.to_string()))?;

        let key = format!("{}.{ext}", ContentHash::from_bytes(bytes).to_hex());
        let path = self.root.join(&key);
        if !path.exists() {
            let mut staged = NamedTempFile::new_in(&self.root)?;
            staged.write_all(bytes)?;
            staged.as_file().sync_all()?;
            if let Err(e) = staged.persist(&path) {
                // a concurrent upload of the same bytes already landed
                if !path.exists() {
                    return Err(StorageError::Fs(e.error));
                }
            }
        }
        debug!("stored {filename} ({} bytes) as {key}", bytes.len());

        Ok(StoredObject {
            file_url: format!("{}/{key}", self.base_url),
            key,
        })
    }

    fn get(&self, file_url: &str) -> Result<Vec<u8>, StorageError> {
        let key = self
            .key_from_url(file_url)
            .ok_or_else(|| StorageError::ObjectNotFound(file_url.to_string()))?;
        let path = self.path_for_key(key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::ObjectNotFound(file_url.to_string()),
            _ => StorageError::Fs(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path) -> anyhow::Result<LocalFileStore> {
        Ok(LocalFileStore::new(&FilesConfig {
            root: root.to_path_buf(),
            base_url: "/files/".to_string(),
        })?)
    }

    #[test]
    fn test_is_music_file() {
        assert!(is_music_file(Path::new("demo.MP3")));
        assert!(is_music_file(Path::new("/a/b/take.flac")));
        assert!(!is_music_file(Path::new("notes.txt")));
        assert!(!is_music_file(Path::new("no_extension")));
    }

    #[test]
    fn test_put_is_content_addressed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;

        let first = store.put(b"riff", "Take 1.WAV")?;
        let again = store.put(b"riff", "renamed.wav")?;

        assert_eq!(first, again);
        assert_eq!(first.file_url, format!("/files/{}", first.key));
        assert!(first.key.ends_with(".wav"));

        let stored_path = dir.path().join(&first.key);
        assert_eq!(ContentHash::from_bytes(&fs::read(&stored_path)?), ContentHash::from_bytes(b"riff"));
        assert_eq!(store.get(&first.file_url)?, b"riff");
        Ok(())
    }

    #[test]
    fn test_put_rejects_non_audio() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;

        let err = store.put(b"#!/bin/sh", "install.sh").unwrap_err();

        assert!(matches!(err, StorageError::UnsupportedFile(_)));
        Ok(())
    }

    #[test]
    fn test_open_rejects_foreign_keys() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;

        let hex = ContentHash::from_bytes(b"data").to_hex();
        let escaping = format!("{hex}./../../secret.wav");
        let backslashed = format!("{hex}.\\..\\secret.wav");
        let uppercase_ext = format!("{hex}.WAV");
        let short_stem = format!("{}.wav", &hex[..32]);

        for key in [
            "../secret.wav",
            "abc.wav",
            "config.toml",
            "nodot",
            escaping.as_str(),
            backslashed.as_str(),
            uppercase_ext.as_str(),
            short_stem.as_str(),
        ] {
            assert!(matches!(
                store.open(key),
                Err(StorageError::ObjectNotFound(_))
            ));
        }

        let stored = store.put(b"data", "a.ogg")?;
        let (_, path) = store.open(&stored.key)?;
        assert_eq!(path, dir.path().join(&stored.key));
        Ok(())
    }

    #[test]
    fn test_get_rejects_escaping_url() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("objects");
        let store = store(&root)?;
        let hex = ContentHash::from_bytes(b"x").to_hex();
        fs::create_dir(root.join(format!("{hex}.")))?;
        fs::write(dir.path().join("secret.wav"), b"TOP SECRET")?;

        assert!(matches!(
            store.get(&format!("/files/{hex}./../../secret.wav")),
            Err(StorageError::ObjectNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_put_leaves_no_staging_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;

        let first = store.put(b"take", "a.flac")?;
        store.put(b"take", "b.flac")?;

        let names = fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec![first.key.clone()]);
        assert_eq!(fs::read(dir.path().join(&first.key))?, b"take");
        Ok(())
    }

    #[test]
    fn test_get_unknown_url() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = store(dir.path())?;

        assert!(matches!(
            store.get("https://elsewhere/x.wav"),
            Err(StorageError::ObjectNotFound(_))
        ));
        Ok(())
    }
}

//! JSON-file gallery of registered missing persons.
//!
//! The file is re-read on every fetch, so each identification sees the
//! gallery as it is at that moment. Writers serialize on an exclusive lock
//! of a `<gallery>.lock` sidecar and replace the file atomically, so
//! concurrent `enroll` and `remove` runs never drop each other's records.

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use reunite_core::{FaceEmbedding, GalleryEntry, GallerySource};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One registered missing person and the descriptor of their photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingPersonRecord {
    pub id: String,
    pub name: String,
    pub embedding: FaceEmbedding,
    pub created_at: DateTime<Utc>,
}

impl MissingPersonRecord {
    pub fn new(name: impl Into<String>, embedding: FaceEmbedding) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            embedding,
            created_at: Utc::now(),
        }
    }
}

impl From<MissingPersonRecord> for GalleryEntry {
    fn from(r: MissingPersonRecord) -> Self {
        GalleryEntry::new(r.id, r.embedding).with_label(r.name)
    }
}

pub struct JsonGalleryStore {
    path: PathBuf,
}

impl JsonGalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records; a missing file is an empty gallery.
    pub fn records(&self) -> Result<Vec<MissingPersonRecord>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn insert(&self, record: MissingPersonRecord) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let mut records = self.records()?;
        tracing::info!(id = %record.id, name = %record.name, "registering missing person");
        records.push(record);
        self.write(&records)
    }

    /// Remove a record by ID. Returns false if no such record exists.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _lock = self.lock()?;
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.write(&records)?;
        tracing::info!(id, "removed missing person");
        Ok(true)
    }

    /// Take the writer lock. Released when the returned file is dropped.
    fn lock(&self) -> Result<File, StoreError> {
        std::fs::create_dir_all(self.dir()).map_err(|e| self.io_error(e))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| self.io_error(e))?;
        file.lock_exclusive().map_err(|e| self.io_error(e))?;
        Ok(file)
    }

    /// Replace the file contents via a uniquely named temporary file.
    ///
    /// Callers must hold the writer lock.
    fn write(&self, records: &[MissingPersonRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_error(e))?;
        tmp.write_all(&json).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(OsString::from).unwrap_or_else(|| "gallery".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io { path: self.path.clone(), source }
    }
}

impl GallerySource for JsonGalleryStore {
    type Error = StoreError;

    fn fetch(&self) -> Result<Vec<GalleryEntry>, Self::Error> {
        let entries: Vec<GalleryEntry> = self.records()?.into_iter().map(GalleryEntry::from).collect();
        tracing::debug!(path = %self.path.display(), entries = entries.len(), "gallery snapshot loaded");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> JsonGalleryStore {
        JsonGalleryStore::new(dir.path().join("nested").join("gallery.json"))
    }

    #[test]
    fn test_missing_file_is_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.records().unwrap().is_empty());
        assert!(store.fetch().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let alice = MissingPersonRecord::new("Alice", FaceEmbedding::new(vec![0.1, 0.2]));
        let bob = MissingPersonRecord::new("Bob", FaceEmbedding::new(vec![0.3, 0.4]));
        let alice_id = alice.id.clone();
        store.insert(alice).unwrap();
        store.insert(bob).unwrap();

        let gallery = store.fetch().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].identity, alice_id);
        assert_eq!(gallery[0].label.as_deref(), Some("Alice"));
        assert_eq!(gallery[0].embedding.values(), &[0.1, 0.2]);
        assert_eq!(gallery[1].label.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let rec = MissingPersonRecord::new("Carol", FaceEmbedding::new(vec![1.0]));
        let id = rec.id.clone();
        store.insert(rec).unwrap();

        assert!(!store.remove("no-such-id").unwrap());
        assert!(store.remove(&id).unwrap());
        assert!(store.records().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_sees_external_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert(MissingPersonRecord::new("A", FaceEmbedding::new(vec![1.0]))).unwrap();
        assert_eq!(store.fetch().unwrap().len(), 1);

        let other = JsonGalleryStore::new(store.path());
        other.insert(MissingPersonRecord::new("B", FaceEmbedding::new(vec![2.0]))).unwrap();
        assert_eq!(store.fetch().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_inserts_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = JsonGalleryStore::new(path);
                    for i in 0..5 {
                        let embedding = FaceEmbedding::new(vec![t as f32, i as f32]);
                        store.insert(MissingPersonRecord::new(format!("person-{t}-{i}"), embedding)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let records = JsonGalleryStore::new(&path).records().unwrap();
        assert_eq!(records.len(), 40);
        let mut names: Vec<_> = records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 40);

        // Only the gallery and its lock remain; no stray temporary files.
        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, ["gallery.json", "gallery.json.lock"]);
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let store = JsonGalleryStore::new(&path);
        let doomed: Vec<_> = (0..10)
            .map(|i| {
                let rec = MissingPersonRecord::new(format!("old-{i}"), FaceEmbedding::new(vec![i as f32]));
                let id = rec.id.clone();
                store.insert(rec).unwrap();
                id
            })
            .collect();

        let remover = {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = JsonGalleryStore::new(path);
                for id in doomed {
                    assert!(store.remove(&id).unwrap());
                }
            })
        };
        let inserter = {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = JsonGalleryStore::new(path);
                for i in 0..10 {
                    let embedding = FaceEmbedding::new(vec![1.0]);
                    store.insert(MissingPersonRecord::new(format!("new-{i}"), embedding)).unwrap();
                }
            })
        };
        remover.join().unwrap();
        inserter.join().unwrap();

        let records = store.records().unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.name.starts_with("new-")));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonGalleryStore::new(&path).fetch().unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = MissingPersonRecord::new("A", FaceEmbedding::new(vec![1.0]));
        let b = MissingPersonRecord::new("A", FaceEmbedding::new(vec![1.0]));
        assert_ne!(a.id, b.id);
    }
}

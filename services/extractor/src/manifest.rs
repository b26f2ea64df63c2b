//! Frame URL manifests.
//!
//! A manifest is a pretty-printed JSON array of frame URLs in decode order,
//! stored as `<stem>_frames.json` next to the frames it lists.

use crate::artifacts::ArtifactStore;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writes manifests into an [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct ManifestWriter {
    store: ArtifactStore,
}

impl ManifestWriter {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Write the manifest for `stem`, replacing any previous one.
    ///
    /// The content lands in a temporary file in the output root first and is
    /// renamed over the target, so readers see either the old or the new
    /// manifest in full.
    pub fn write(&self, stem: &str, urls: &[String]) -> Result<PathBuf, ManifestError> {
        let target = self.store.manifest_path(stem);
        let temp = self
            .store
            .root()
            .join(format!(".{stem}_frames.{}.tmp", Uuid::new_v4().simple()));

        let body = serde_json::to_vec_pretty(urls)?;

        if let Err(source) = write_file(&temp, &body) {
            let _ = std::fs::remove_file(&temp);
            return Err(ManifestError::Io { path: temp, source });
        }

        if let Err(source) = std::fs::rename(&temp, &target) {
            let _ = std::fs::remove_file(&temp);
            return Err(ManifestError::Io {
                path: target,
                source,
            });
        }

        debug!(path = %target.display(), frames = urls.len(), "Wrote frame manifest");
        Ok(target)
    }
}

fn write_file(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(body)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_is_pretty_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ManifestWriter::new(ArtifactStore::new(dir.path()));
        let urls = vec![
            "http://localhost:8000/static/clip_0.jpg".to_string(),
            "http://localhost:8000/static/clip_30.jpg".to_string(),
        ];

        let path = writer.write("clip", &urls).unwrap();

        assert_eq!(path, dir.path().join("clip_frames.json"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "[\n  \"http://localhost:8000/static/clip_0.jpg\",\n  \"http://localhost:8000/static/clip_30.jpg\"\n]"
        );
        let parsed: Vec<String> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, urls);
    }

    #[test]
    fn test_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ManifestWriter::new(ArtifactStore::new(dir.path()));

        let path = writer.write("clip", &[]).unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "[]");
    }

    #[test]
    fn test_manifest_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ManifestWriter::new(ArtifactStore::new(dir.path()));

        writer
            .write("clip", &["a".to_string(), "b".to_string()])
            .unwrap();
        let path = writer.write("clip", &["c".to_string()]).unwrap();

        let parsed: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, vec!["c"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ManifestWriter::new(ArtifactStore::new(dir.path().join("missing")));

        let result = writer.write("clip", &[]);
        assert!(matches!(result, Err(ManifestError::Io { .. })));
    }
}

//! Output root layout and public links for extracted artifacts.
//!
//! Every artifact of a video shares its stem as a filename prefix:
//!
//! ```text
//! <output_root>/
//!   <stem>_<decode_index>.jpg   sampled frames
//!   <stem>_frames.json          frame URL manifest
//!   <stem>.m4a                  mono 16 kHz audio
//! ```
//!
//! There is no locking around the output root. Two requests that resolve to
//! the same stem overwrite each other's files.

use std::io;
use std::path::{Path, PathBuf};

/// Route prefix under which the output root is served.
pub const STATIC_ROUTE: &str = "/static";

/// File extension of persisted frames.
pub const FRAME_EXTENSION: &str = "jpg";

/// File extension of extracted audio.
pub const AUDIO_EXTENSION: &str = "m4a";

/// Filesystem layout of the output root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root`. The directory is not touched.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the output root if it does not exist.
    pub fn ensure_root(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the frame captured at `decode_index`.
    pub fn frame_path(&self, stem: &str, decode_index: u64) -> PathBuf {
        self.root
            .join(format!("{stem}_{decode_index}.{FRAME_EXTENSION}"))
    }

    /// Path of the frame manifest for `stem`.
    pub fn manifest_path(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}_frames.json"))
    }

    /// Path of the audio track for `stem`.
    pub fn audio_path(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.{AUDIO_EXTENSION}"))
    }
}

/// Builds public URLs for files in the output root.
#[derive(Debug, Clone)]
pub struct ArtifactLinks {
    base_url: String,
}

impl ArtifactLinks {
    /// `base_url` is the externally visible origin, e.g. `http://host:8000`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public URL of an artifact, addressed by its file name.
    pub fn url_for(&self, artifact: &Path) -> String {
        let name = artifact
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        format!("{}{}/{}", self.base_url, STATIC_ROUTE, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_paths_share_stem() {
        let store = ArtifactStore::new("/outputs");

        assert_eq!(
            store.frame_path("clip", 90),
            PathBuf::from("/outputs/clip_90.jpg")
        );
        assert_eq!(
            store.manifest_path("clip"),
            PathBuf::from("/outputs/clip_frames.json")
        );
        assert_eq!(store.audio_path("clip"), PathBuf::from("/outputs/clip.m4a"));
    }

    #[test]
    fn test_frame_paths_keep_decode_index() {
        let store = ArtifactStore::new("/outputs");
        assert_ne!(store.frame_path("clip", 0), store.frame_path("clip", 30));
    }

    #[test]
    fn test_url_for_uses_static_route() {
        let links = ArtifactLinks::new("http://localhost:8000/");
        let url = links.url_for(Path::new("/outputs/clip_30.jpg"));
        assert_eq!(url, "http://localhost:8000/static/clip_30.jpg");
    }

    #[test]
    fn test_ensure_root_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nested/outputs"));

        store.ensure_root().unwrap();
        assert!(store.root().is_dir());
    }
}

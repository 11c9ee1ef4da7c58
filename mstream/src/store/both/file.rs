use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::MstreamResult;
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{DumpProgress, ResumeMarker};

/// Stores state as one file per collection.
///
/// Resume markers are written as the raw bytes issued by the source, dump progress as JSON.
/// Files are replaced atomically through a temporary file in the same directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    resume_markers_dir: PathBuf,
    dump_progress_dir: PathBuf,
}

impl FileStore {
    pub fn new(resume_markers_dir: impl Into<PathBuf>, dump_progress_dir: impl Into<PathBuf>) -> Self {
        Self {
            resume_markers_dir: resume_markers_dir.into(),
            dump_progress_dir: dump_progress_dir.into(),
        }
    }

    fn resume_marker_path(&self, collection: &str) -> PathBuf {
        self.resume_markers_dir.join(collection)
    }

    fn dump_progress_path(&self, collection: &str) -> PathBuf {
        self.dump_progress_dir.join(collection)
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    fs::write(&tmp_path, bytes).await?;
    fs::rename(&tmp_path, path).await
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

impl ResumePositionStore for FileStore {
    async fn get_resume_marker(&self, collection: &str) -> MstreamResult<Option<ResumeMarker>> {
        let bytes = read_optional(&self.resume_marker_path(collection)).await?;

        Ok(bytes.filter(|bytes| !bytes.is_empty()).map(ResumeMarker::new))
    }

    async fn write_resume_marker(
        &self,
        collection: &str,
        marker: Option<&ResumeMarker>,
    ) -> MstreamResult<()> {
        let path = self.resume_marker_path(collection);
        match marker {
            Some(marker) => write_atomically(&path, marker.as_bytes()).await?,
            None => {
                debug!(collection, "deleting resume marker file");
                remove_if_exists(&path).await?
            }
        }

        Ok(())
    }
}

impl DumpProgressStore for FileStore {
    async fn get_dump_progress(&self, collection: &str) -> MstreamResult<Option<DumpProgress>> {
        let Some(bytes) = read_optional(&self.dump_progress_path(collection)).await? else {
            return Ok(None);
        };

        let progress = serde_json::from_slice::<DumpProgress>(&bytes)?;

        Ok(Some(progress.loaded()))
    }

    async fn write_dump_progress(
        &self,
        collection: &str,
        progress: &DumpProgress,
    ) -> MstreamResult<()> {
        let bytes = serde_json::to_vec(progress)?;
        write_atomically(&self.dump_progress_path(collection), &bytes).await?;

        Ok(())
    }

    async fn reset_dump_progress(&self, collection: &str) -> MstreamResult<DumpProgress> {
        let progress = DumpProgress::default();
        self.write_dump_progress(collection, &progress).await?;

        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::DocumentKey;

    fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path().join("resumeTokens"), dir.path().join("dumpProgress"))
    }

    #[tokio::test]
    async fn missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.get_resume_marker("users").await.unwrap(), None);
        assert_eq!(store.get_dump_progress("users").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writing_none_deletes_the_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let marker = ResumeMarker::new(vec![0x16, 0, 0, 0, 1, 2, 3]);

        store.write_resume_marker("users", Some(&marker)).await.unwrap();
        assert_eq!(
            store.get_resume_marker("users").await.unwrap(),
            Some(marker)
        );
        assert!(dir.path().join("resumeTokens/users").exists());

        store.reset_resume_marker("users").await.unwrap();
        assert_eq!(store.get_resume_marker("users").await.unwrap(), None);
        assert!(!dir.path().join("resumeTokens/users").exists());

        // Deleting twice is fine.
        store.reset_resume_marker("users").await.unwrap();
    }

    #[tokio::test]
    async fn progress_is_loaded_with_start_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let progress = DumpProgress {
            last_key: Some(DocumentKey::ObjectId("65a1f0c2e4b0a1b2c3d4e5f6".to_owned())),
            count: 1200,
            start_count: 0,
            completed_at: None,
        };

        store.write_dump_progress("orders", &progress).await.unwrap();
        let loaded = store.get_dump_progress("orders").await.unwrap().unwrap();

        assert_eq!(loaded.last_key, progress.last_key);
        assert_eq!(loaded.count, 1200);
        assert_eq!(loaded.start_count, 1200);
    }

    #[tokio::test]
    async fn corrupt_progress_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::create_dir_all(dir.path().join("dumpProgress")).unwrap();
        std::fs::write(dir.path().join("dumpProgress/orders"), b"{not json").unwrap();

        let err = store.get_dump_progress("orders").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }

    #[tokio::test]
    async fn reset_progress_writes_zero_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let progress = store.reset_dump_progress("orders").await.unwrap();
        assert_eq!(progress, DumpProgress::default());
        assert_eq!(
            store.get_dump_progress("orders").await.unwrap(),
            Some(DumpProgress::default())
        );
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where resume markers and dump progress are persisted.
///
/// The backend is chosen once for the whole process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// One file per collection under each directory.
    File {
        #[serde(default = "default_resume_markers_dir")]
        resume_markers_dir: PathBuf,
        #[serde(default = "default_dump_progress_dir")]
        dump_progress_dir: PathBuf,
    },
    /// One record per collection, keyed by collection name, in collections of the source database.
    Collection {
        resume_markers_collection: String,
        dump_progress_collection: String,
    },
}

fn default_resume_markers_dir() -> PathBuf {
    PathBuf::from("./resumeTokens")
}

fn default_dump_progress_dir() -> PathBuf {
    PathBuf::from("./dumpProgress")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            resume_markers_dir: default_resume_markers_dir(),
            dump_progress_dir: default_dump_progress_dir(),
        }
    }
}

//! Hand-off of captured session parts.
//!
//! After a capture, each node delivers its part of the session (its metadata
//! fragment and raw sensor streams) to a shared session tree where the parts of all
//! nodes meet and can be merged.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::session::{METADATA_DIR, RAW_DATA_DIR};
use crate::status::SessionPartNotice;

/// Destination of session parts.
pub trait SessionUploader: Send + Sync {
    /// Deliver the session tree at `session_dir` as `part_name` of `session_name`.
    fn upload(
        &self,
        session_name: &str,
        part_name: &str,
        session_dir: &Path,
    ) -> AppResult<SessionPartNotice>;
}

/// Copies parts into `<sessions_root>/<session_name>/`.
#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    sessions_root: PathBuf,
    base_url: String,
}

impl LocalDirUploader {
    /// Parts land under `sessions_root`; notices point below `base_url`.
    pub fn new(sessions_root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            base_url: base_url.into(),
        }
    }
}

impl SessionUploader for LocalDirUploader {
    fn upload(
        &self,
        session_name: &str,
        part_name: &str,
        session_dir: &Path,
    ) -> AppResult<SessionPartNotice> {
        let target = self.sessions_root.join(session_name);
        for sub in [METADATA_DIR, RAW_DATA_DIR] {
            let copied = copy_files(&session_dir.join(sub), &target.join(sub))
                .map_err(|e| DaqError::Transfer(format!("{sub}: {e}")))?;
            debug!(dir = sub, files = copied, "copied session part files");
        }

        let url = format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            session_name,
            part_name
        );
        info!(session = session_name, target = %target.display(), "session part delivered");
        Ok(SessionPartNotice {
            session_name: session_name.to_string(),
            file_name: part_name.to_string(),
            url,
        })
    }
}

fn copy_files(from: &Path, to: &Path) -> std::io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copies_part_and_announces_url() {
        let capture = TempDir::new().unwrap();
        let session = capture.path().join("walk");
        fs::create_dir_all(session.join(METADATA_DIR)).unwrap();
        fs::create_dir_all(session.join(RAW_DATA_DIR)).unwrap();
        fs::write(session.join(METADATA_DIR).join("rpi_session_info.yml"), "name: walk\n").unwrap();
        fs::write(session.join(RAW_DATA_DIR).join("rpi_B1A104"), [1u8, 2, 3, 4]).unwrap();

        let root = TempDir::new().unwrap();
        let uploader = LocalDirUploader::new(root.path(), "http://hub:8000/sessions/");
        let notice = uploader.upload("walk", "walk_rpi", &session).unwrap();

        assert_eq!(notice.file_name, "walk_rpi");
        assert_eq!(notice.url, "http://hub:8000/sessions/walk/walk_rpi");
        assert_eq!(
            fs::read(root.path().join("walk/raw_data/rpi_B1A104")).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert!(root.path().join("walk/metadata/rpi_session_info.yml").exists());
    }

    #[test]
    fn missing_part_is_a_transfer_error() {
        let root = TempDir::new().unwrap();
        let uploader = LocalDirUploader::new(root.path(), "file://sessions");
        let err = uploader
            .upload("walk", "walk_rpi", &root.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, DaqError::Transfer(_)));
    }
}

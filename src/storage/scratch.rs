use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::StorageError;

/// Local scratch copy of a consultation recording.
///
/// The file is deleted when the value is dropped, so every exit path of a
/// pipeline stage (success, adapter error, timeout) releases it.
#[derive(Debug)]
pub struct ScratchAudio {
    file: NamedTempFile,
    file_name: String,
    content_type: String,
}

impl ScratchAudio {
    /// Write `bytes` to a fresh temp file in `dir` (or the system temp dir).
    pub async fn create(
        dir: Option<&Path>,
        bytes: Vec<u8>,
        extension: &str,
        content_type: &str,
    ) -> Result<Self, StorageError> {
        let dir = dir.map(Path::to_path_buf);
        let suffix = format!(".{extension}");
        let file = tokio::task::spawn_blocking(move || -> Result<NamedTempFile, std::io::Error> {
            use std::io::Write;
            let mut builder = tempfile::Builder::new();
            builder.prefix("consultation-").suffix(&suffix);
            let mut file = match dir {
                Some(dir) => {
                    std::fs::create_dir_all(&dir)?;
                    builder.tempfile_in(dir)?
                }
                None => builder.tempfile()?,
            };
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))??;

        let file_name = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{extension}"));

        Ok(Self {
            file,
            file_name,
            content_type: content_type.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn path_buf(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }
}

/// File extension of an audio key, defaulting to `bin`.
pub fn extension_of(key: &str) -> &str {
    Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
}

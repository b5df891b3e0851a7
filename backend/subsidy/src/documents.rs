//! Supporting documents uploaded by producers: certificates, meter readings
//! and similar evidence for a production claim.
//!
//! Files live flat in one directory under a sanitized name. Uploading a file
//! whose sanitized name already exists replaces it.

use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;
use tracing::info;

use crate::errors::{Result, SubsidyError};

const ALLOWED_EXTENSIONS: [&str; 4] = ["pdf", "png", "jpg", "jpeg"];

#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Create the upload directory if it is missing.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Store `bytes` under the sanitized form of `original_name` and return
    /// the name it was stored as.
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<String> {
        if original_name.is_empty() {
            return Err(SubsidyError::Validation("no file selected".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(SubsidyError::TooLarge(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_bytes
            )));
        }
        let name = secure_filename(original_name)
            .filter(|name| allowed_file(name))
            .ok_or_else(|| {
                SubsidyError::Validation(format!(
                    "invalid file type, expected one of {}",
                    ALLOWED_EXTENSIONS.join(", ")
                ))
            })?;

        self.ensure_dir().await?;
        fs::write(self.dir.join(&name), bytes).await?;
        info!("Stored document {name} ({} bytes)", bytes.len());
        Ok(name)
    }

    /// Names of every stored document, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read a stored document. A name that is not already in sanitized form
    /// cannot have been stored, so it reads as absent.
    pub async fn open(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if secure_filename(name).as_deref() != Some(name) {
            return Ok(None);
        }
        match fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// True when `name` ends in one of the accepted document extensions.
pub fn allowed_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduce a client-supplied file name to a flat ASCII name that cannot leave
/// the upload directory. Returns `None` when nothing usable remains.
pub fn secure_filename(name: &str) -> Option<String> {
    let flattened: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

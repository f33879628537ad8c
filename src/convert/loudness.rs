//! The loudness stage: measuring and tagging loudness-normalization data
//! for a set of files, then correcting the reference-loudness tag.

use super::tools::{Tool, ToolLocator};
use crate::tags::{TagError, TagMap, TagStore};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors that can occur during loudness scanning.
#[derive(Debug, Error)]
pub enum LoudnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tag error: {0}")]
    Tag(#[from] TagError),
}

/// The traditional reference loudness other consumers expect. The scanner
/// writes the RG 2.0 relative form (-18 LUFS); misread as traditional it
/// would be a catastrophically wrong -125 dB, so it is rewritten here.
const REFERENCE_LOUDNESS: &str = "89.00 dB";

/// Measures loudness and writes normalization tags for a set of files.
#[async_trait]
pub trait LoudnessScanner: Send + Sync {
    async fn scan(&self, files: &[PathBuf]) -> Result<(), LoudnessError>;
}

/// Scanner backed by loudgain: one invocation over the whole (sorted)
/// file list so album gain sees every track, then a per-file
/// reference-loudness correction through the tag store.
pub struct LoudgainScanner {
    locator: Arc<dyn ToolLocator>,
    tags: Arc<dyn TagStore>,
}

impl LoudgainScanner {
    pub fn new(locator: Arc<dyn ToolLocator>, tags: Arc<dyn TagStore>) -> Self {
        Self { locator, tags }
    }

    fn correct_reference_loudness(&self, file: &Path) {
        let mut update = TagMap::new();
        update.insert(
            "replaygain_reference_loudness".to_string(),
            vec![REFERENCE_LOUDNESS.to_string()],
        );
        if let Err(e) = self.tags.write_tags(file, &update) {
            warn!(
                "Failed to correct reference loudness on {}: {}",
                file.display(),
                e
            );
        }
    }
}

#[async_trait]
impl LoudnessScanner for LoudgainScanner {
    async fn scan(&self, files: &[PathBuf]) -> Result<(), LoudnessError> {
        // Failed jobs leave empty paths behind; they have nothing to scan
        let mut files: Vec<&PathBuf> = files
            .iter()
            .filter(|path| !path.as_os_str().is_empty())
            .collect();
        files.sort();

        if files.is_empty() {
            return Ok(());
        }

        let Some(loudgain) = self.locator.locate(Tool::Loudgain) else {
            debug!("loudgain is unavailable, skipping loudness stage");
            return Ok(());
        };

        // -a: album gain, -k: clip prevention, -s e: write the extra
        // reference-loudness and range information
        let mut args: Vec<OsString> = vec!["-a".into(), "-k".into(), "-s".into(), "e".into()];
        args.extend(files.iter().map(|path| OsString::from(path.as_path())));

        let output = Command::new(&loudgain)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("loudgain exited with {}: {}", output.status, stderr.trim());
        }

        for file in files {
            self.correct_reference_loudness(file);
        }

        Ok(())
    }
}

//! Locating the external encoder and loudness executables.
//!
//! A missing tool is never an error here: [`ToolLocator::locate`] returns
//! `None` and the caller treats the feature as unavailable.

use crate::config::ToolPaths;
use std::env;
use std::path::PathBuf;

/// The external programs the pipeline can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Flac,
    Sox,
    OpusEnc,
    Lame,
    Loudgain,
}

impl Tool {
    /// Conventional binary name on the PATH.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Flac => "flac",
            Tool::Sox => "sox",
            Tool::OpusEnc => "opusenc",
            Tool::Lame => "lame",
            Tool::Loudgain => "loudgain",
        }
    }
}

/// Resolves a logical tool to an executable path, or `None` when the tool
/// is unavailable on this host.
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: Tool) -> Option<PathBuf>;
}

/// Locator that prefers an explicitly configured path and otherwise scans
/// the PATH for the conventional binary name. A configured path that is
/// not a file is ignored rather than trusted.
#[derive(Debug, Default)]
pub struct SystemToolLocator {
    overrides: ToolPaths,
}

impl SystemToolLocator {
    pub fn new(overrides: ToolPaths) -> Self {
        Self { overrides }
    }

    fn override_for(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::Flac => self.overrides.flac.as_ref(),
            Tool::Sox => self.overrides.sox.as_ref(),
            Tool::OpusEnc => self.overrides.opusenc.as_ref(),
            Tool::Lame => self.overrides.lame.as_ref(),
            Tool::Loudgain => self.overrides.loudgain.as_ref(),
        }
    }
}

impl ToolLocator for SystemToolLocator {
    fn locate(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(path) = self.override_for(tool) {
            if path.is_file() {
                return Some(path.clone());
            }
        }

        let path_var = env::var_os("PATH")?;
        for dir in env::split_paths(&path_var) {
            let candidate = dir.join(tool.binary_name());
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_override_path_wins_when_it_exists() {
        let dir = tempdir().unwrap();
        let fake = dir.path().join("flac");
        fs::write(&fake, b"#!/bin/sh\n").unwrap();

        let locator = SystemToolLocator::new(ToolPaths {
            flac: Some(fake.clone()),
            ..ToolPaths::default()
        });
        assert_eq!(locator.locate(Tool::Flac), Some(fake));
    }

    #[test]
    fn test_missing_override_falls_back_to_path_scan() {
        let dir = tempdir().unwrap();
        let locator = SystemToolLocator::new(ToolPaths {
            sox: Some(dir.path().join("does-not-exist")),
            ..ToolPaths::default()
        });
        // Whatever the host PATH holds, the bogus override must not be
        // returned as-is.
        assert_ne!(
            locator.locate(Tool::Sox),
            Some(dir.path().join("does-not-exist"))
        );
    }

    #[test]
    fn test_binary_names() {
        assert_eq!(Tool::Flac.binary_name(), "flac");
        assert_eq!(Tool::OpusEnc.binary_name(), "opusenc");
        assert_eq!(Tool::Loudgain.binary_name(), "loudgain");
    }
}

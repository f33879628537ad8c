//! Tracksmith library
//!
//! Batch conversion of lossless audio to FLAC/Opus/MP3 via the stock
//! command-line encoders, with template-driven output naming and a
//! codec-aware loudness-tagging stage.

pub mod config;
pub mod convert;
pub mod scan;
pub mod tags;
pub mod template;

// Re-export commonly used types for convenience
pub use config::{Codec, ConversionConfig, FlacPreset, Mp3Preset, OpusPreset, Preset, ToolPaths};
pub use convert::{
    ConversionPipeline, LoudgainScanner, PipelineError, ShellEncoder, SystemToolLocator,
};
pub use tags::{LoftyTagStore, TagStore};
pub use template::Template;

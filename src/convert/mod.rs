//! Batch conversion of lossless tracks to a target codec.
//!
//! Flow for one batch:
//! 1. Batch extrema are computed up front so every file name in a
//!    mixed-quality batch agrees on the same disambiguating values
//! 2. The loudness stage runs before or after the convert stage,
//!    depending on the target codec
//! 3. Tracks fan out across a bounded worker pool, one external encoder
//!    process per job, with a join barrier before results are consumed
//! 4. The collected output paths are returned sorted; failed jobs stay
//!    in the list as empty paths for the caller to inspect

mod encoder;
mod loudness;
mod pipeline;
mod tools;

pub use encoder::{
    migrate_tags, wav_to_flac, ConversionJob, EncodeError, ShellEncoder, TrackEncoder,
};
pub use loudness::{LoudgainScanner, LoudnessError, LoudnessScanner};
pub use pipeline::{
    BatchExtrema, BatchStage, ConversionPipeline, NullStatusSink, PipelineError, StatusSink,
};
pub use tools::{SystemToolLocator, Tool, ToolLocator};

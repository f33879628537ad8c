use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracksmith::config::{Codec, ConversionConfig, Preset, ToolPaths};
use tracksmith::convert::{
    wav_to_flac, BatchStage, ConversionPipeline, LoudgainScanner, ShellEncoder, StatusSink,
    SystemToolLocator, ToolLocator,
};
use tracksmith::scan::{self, guess_album_identity};
use tracksmith::tags::LoftyTagStore;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory containing the lossless input tracks.
    #[clap(value_parser = parse_path)]
    pub input_dir: PathBuf,

    /// Directory the converted files are written into. Must exist.
    #[clap(value_parser = parse_path)]
    pub output_dir: PathBuf,

    /// Target codec.
    #[clap(short, long, value_enum)]
    pub codec: Codec,

    /// Codec preset, e.g. "V0", "320kbps CBR", "160", "force 16-bit".
    #[clap(short, long, default_value = "standard")]
    pub preset: String,

    /// Naming template evaluated against each track's tags. %name% reads
    /// a tag, &name& a computed field (bps, samplerate, short-samplerate,
    /// codec, bitrate, smartbit, paddedtracknumber).
    #[clap(
        short,
        long,
        default_value = "%albumartist%/%album% [&smartbit&]/&paddedtracknumber& - %title%"
    )]
    pub template: String,

    /// Skip the loudness-tagging stage.
    #[clap(long)]
    pub no_loudness: bool,

    /// Re-encode .wav files found in the input directory to .flac before
    /// converting (the .wav is removed on success).
    #[clap(long)]
    pub convert_wavs: bool,

    /// Number of parallel encoder processes. Zero means one per
    /// available CPU.
    #[clap(short, long, default_value_t = 0)]
    pub jobs: usize,

    /// Path to the flac executable, if it is not on the PATH.
    #[clap(long, value_parser = parse_path)]
    pub flac_path: Option<PathBuf>,

    /// Path to the sox executable.
    #[clap(long, value_parser = parse_path)]
    pub sox_path: Option<PathBuf>,

    /// Path to the opusenc executable.
    #[clap(long, value_parser = parse_path)]
    pub opusenc_path: Option<PathBuf>,

    /// Path to the lame executable.
    #[clap(long, value_parser = parse_path)]
    pub lame_path: Option<PathBuf>,

    /// Path to the loudgain executable.
    #[clap(long, value_parser = parse_path)]
    pub loudgain_path: Option<PathBuf>,
}

/// Reports stage transitions through the log.
struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn stage_changed(&self, stage: BatchStage) {
        info!("{}...", stage.as_str());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .ok();

    let preset = Preset::parse(cli_args.codec, &cli_args.preset).with_context(|| {
        format!(
            "Unknown {} preset: {}",
            cli_args.codec.label(),
            cli_args.preset
        )
    })?;

    if !cli_args.input_dir.is_dir() {
        bail!(
            "Input directory does not exist: {}",
            cli_args.input_dir.display()
        );
    }

    let locator: Arc<dyn ToolLocator> = Arc::new(SystemToolLocator::new(ToolPaths {
        flac: cli_args.flac_path,
        sox: cli_args.sox_path,
        opusenc: cli_args.opusenc_path,
        lame: cli_args.lame_path,
        loudgain: cli_args.loudgain_path,
    }));
    let tags = Arc::new(LoftyTagStore::new());

    if cli_args.convert_wavs {
        convert_input_wavs(locator.as_ref(), &cli_args.input_dir).await;
    }

    let tracks = scan::find_flac_files(&cli_args.input_dir);
    if tracks.is_empty() {
        bail!("No FLAC files found under {}", cli_args.input_dir.display());
    }

    let identity = guess_album_identity(tags.as_ref(), &tracks);
    match (&identity.artist, &identity.album) {
        (Some(artist), Some(album)) => {
            info!("Converting {} - {} ({} tracks)", artist, album, tracks.len())
        }
        _ => info!("Converting {} tracks", tracks.len()),
    }

    let config = ConversionConfig {
        preset,
        template: cli_args.template,
        output_dir: cli_args.output_dir,
        apply_loudness: !cli_args.no_loudness,
    };

    let pipeline = ConversionPipeline::new(
        Arc::new(ShellEncoder::new(Arc::clone(&locator), tags.clone())),
        Arc::new(LoudgainScanner::new(Arc::clone(&locator), tags.clone())),
        tags,
    )
    .with_workers(cli_args.jobs)
    .with_status_sink(Arc::new(LogStatusSink));

    let outputs = pipeline.run(&tracks, &config).await?;

    let produced: Vec<_> = outputs
        .iter()
        .filter(|path| !path.as_os_str().is_empty())
        .collect();
    if produced.is_empty() {
        bail!("No valid output produced");
    }

    let failed = outputs.len() - produced.len();
    if failed > 0 {
        warn!("{} of {} tracks failed to convert", failed, outputs.len());
    }

    for path in &produced {
        println!("{}", path.display());
    }

    Ok(())
}

/// Re-encode every .wav under the input directory to .flac, in place.
async fn convert_input_wavs(locator: &dyn ToolLocator, input_dir: &Path) {
    let wavs = scan::find_files_with_extension(input_dir, "wav");
    if wavs.is_empty() {
        return;
    }

    info!("Converting {} WAV files to FLAC...", wavs.len());
    for wav in &wavs {
        match wav_to_flac(locator, wav).await {
            Ok(Some(flac)) => info!("Converted {} -> {}", wav.display(), flac.display()),
            Ok(None) => warn!("Could not convert {}", wav.display()),
            Err(e) => warn!("Failed to convert {}: {}", wav.display(), e),
        }
    }
}

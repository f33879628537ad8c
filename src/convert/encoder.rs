//! Per-codec invocation of the external encoders, plus the metadata work
//! that follows an encode: tag migration, artwork migration, and the
//! scrubbing of encoder-identification tags.
//!
//! A job that cannot run because its tool is missing fails silently: the
//! returned path is empty and sibling jobs are unaffected.

use super::tools::{Tool, ToolLocator};
use crate::config::{ConversionConfig, FlacPreset, Mp3Preset, OpusPreset, Preset};
use crate::tags::{AudioProperties, TagError, TagMap, TagStore};
use crate::template::{RenderContext, Template};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// Errors that can occur while converting a single track.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{} is not available on this system", .0.binary_name())]
    ToolUnavailable(Tool),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tag error: {0}")]
    Tag(#[from] TagError),
}

/// One unit of conversion work: a track plus the batch configuration and
/// the batch-level disambiguation values (`None` for lossy codecs, where
/// naming never depends on the PCM format).
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub track: PathBuf,
    pub config: ConversionConfig,
    pub future_bit_depth: Option<u32>,
    pub future_sample_rate: Option<u32>,
}

/// Converts one track to the configured codec.
#[async_trait]
pub trait TrackEncoder: Send + Sync {
    /// Returns the resolved output path. An empty path signals that the
    /// job failed; it is kept in the batch result for the caller to see.
    async fn encode(&self, job: &ConversionJob) -> PathBuf;
}

/// The real encoder: shells out to flac/sox/opusenc/lame.
pub struct ShellEncoder {
    locator: Arc<dyn ToolLocator>,
    tags: Arc<dyn TagStore>,
}

impl ShellEncoder {
    pub fn new(locator: Arc<dyn ToolLocator>, tags: Arc<dyn TagStore>) -> Self {
        Self { locator, tags }
    }

    fn resolve_relative(&self, job: &ConversionJob, tags: &TagMap, props: AudioProperties) -> String {
        Template::parse(&job.config.template).resolve(&RenderContext {
            tags,
            properties: props,
            preset: &job.config.preset,
            future_bit_depth: job.future_bit_depth,
            future_sample_rate: job.future_sample_rate,
        })
    }

    /// Join the resolved name onto the output directory and make sure the
    /// folders it references exist.
    async fn prepare_output(
        &self,
        job: &ConversionJob,
        relative: &str,
        extension: &str,
    ) -> Result<PathBuf, EncodeError> {
        let output = job
            .config
            .output_dir
            .join(format!("{}.{}", relative, extension));
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(output)
    }

    async fn encode_flac(
        &self,
        job: &ConversionJob,
        preset: FlacPreset,
    ) -> Result<PathBuf, EncodeError> {
        let tags = self.tags.read_tags(&job.track)?;
        let props = self.tags.audio_properties(&job.track)?;
        let relative = self.resolve_relative(job, &tags, props);
        let output = self.prepare_output(job, &relative, "flac").await?;

        // Only resample when the preset asks for a transform and this
        // track actually exceeds the target format. The output name stays
        // the batch-level one either way, so an album of mixed sources
        // still lands in a single folder.
        let needs_transform = preset.requests_transform()
            && (props.bit_depth >= 24
                || (props.sample_rate != 44100 && props.sample_rate != 48000));

        if needs_transform {
            let sox = self
                .locator
                .locate(Tool::Sox)
                .ok_or(EncodeError::ToolUnavailable(Tool::Sox))?;

            let scratch = transform_scratch_path(&job.track);
            run_tool(&sox, &sox_args(&job.track, &scratch, preset, props)).await?;

            if tokio::fs::try_exists(&scratch).await.unwrap_or(false) {
                let _ = tokio::fs::remove_file(&output).await;
                if let Err(e) = tokio::fs::rename(&scratch, &output).await {
                    warn!(
                        "Failed to move {} into place: {}",
                        scratch.display(),
                        e
                    );
                }
            }
        } else {
            let flac = self
                .locator
                .locate(Tool::Flac)
                .ok_or(EncodeError::ToolUnavailable(Tool::Flac))?;
            run_tool(&flac, &flac_encode_args(&job.track, &output)).await?;
        }

        Ok(output)
    }

    async fn encode_opus(
        &self,
        job: &ConversionJob,
        preset: OpusPreset,
    ) -> Result<PathBuf, EncodeError> {
        let tags = self.tags.read_tags(&job.track)?;
        let props = self.tags.audio_properties(&job.track)?;
        let relative = self.resolve_relative(job, &tags, props);
        let output = self.prepare_output(job, &relative, "opus").await?;

        let opusenc = self
            .locator
            .locate(Tool::OpusEnc)
            .ok_or(EncodeError::ToolUnavailable(Tool::OpusEnc))?;
        run_tool(&opusenc, &opus_args(preset, &job.track, &output)).await?;

        // opusenc stamps itself into the output; that is nondeterministic
        // noise, so take it back out
        if let Err(e) = self
            .tags
            .remove_tags(&output, &["encoder", "encoder_options"])
        {
            warn!(
                "Failed to scrub encoder tags from {}: {}",
                output.display(),
                e
            );
        }

        Ok(output)
    }

    async fn encode_mp3(
        &self,
        job: &ConversionJob,
        preset: Mp3Preset,
    ) -> Result<PathBuf, EncodeError> {
        let tags = self.tags.read_tags(&job.track)?;
        let props = self.tags.audio_properties(&job.track)?;
        let artwork = self.tags.artwork(&job.track)?;
        let relative = self.resolve_relative(job, &tags, props);
        let wav = self.prepare_output(job, &relative, "wav").await?;
        let mp3 = self.prepare_output(job, &relative, "mp3").await?;

        // LAME cannot read FLAC; decode to an intermediate WAV first
        let flac = self
            .locator
            .locate(Tool::Flac)
            .ok_or(EncodeError::ToolUnavailable(Tool::Flac))?;
        run_tool(&flac, &flac_decode_args(&job.track, &wav)).await?;

        let lame = self
            .locator
            .locate(Tool::Lame)
            .ok_or(EncodeError::ToolUnavailable(Tool::Lame))?;
        run_tool(&lame, &lame_args(preset, &wav, &mp3)).await?;

        let _ = tokio::fs::remove_file(&wav).await;

        // The WAV intermediate carried no tags, so everything the source
        // had is mapped onto the MP3's vocabulary, pictures included, and
        // anything else in the destination is stripped.
        let migrated = migrate_tags(&tags);
        if let Err(e) = self.tags.replace_all_tags(&mp3, &migrated, &artwork) {
            warn!("Failed to migrate tags to {}: {}", mp3.display(), e);
        }

        Ok(mp3)
    }
}

#[async_trait]
impl TrackEncoder for ShellEncoder {
    async fn encode(&self, job: &ConversionJob) -> PathBuf {
        let result = match job.config.preset {
            Preset::Flac(preset) => self.encode_flac(job, preset).await,
            Preset::Opus(preset) => self.encode_opus(job, preset).await,
            Preset::Mp3(preset) => self.encode_mp3(job, preset).await,
        };

        match result {
            Ok(path) => path,
            Err(EncodeError::ToolUnavailable(tool)) => {
                warn!(
                    "{} is unavailable, skipping {}",
                    tool.binary_name(),
                    job.track.display()
                );
                PathBuf::new()
            }
            Err(e) => {
                error!("Failed to convert {}: {}", job.track.display(), e);
                PathBuf::new()
            }
        }
    }
}

/// Re-encode a WAV to FLAC next to it, deleting the WAV on success.
/// Returns the FLAC path, or `None` when the encoder is missing or the
/// encode produced nothing.
pub async fn wav_to_flac(
    locator: &dyn ToolLocator,
    wav: &Path,
) -> Result<Option<PathBuf>, EncodeError> {
    let Some(flac) = locator.locate(Tool::Flac) else {
        debug!("flac is unavailable, keeping {}", wav.display());
        return Ok(None);
    };

    let output = wav.with_extension("flac");
    run_tool(&flac, &flac_encode_args(wav, &output)).await?;

    if tokio::fs::try_exists(&output).await.unwrap_or(false) {
        tokio::fs::remove_file(wav).await?;
        Ok(Some(output))
    } else {
        Ok(None)
    }
}

/// Run an external tool to completion. A non-zero exit is logged but not
/// treated as an error here: the absence of the expected output file is
/// the failure signal downstream.
async fn run_tool(program: &Path, args: &[OsString]) -> Result<(), EncodeError> {
    debug!("Running {} {:?}", program.display(), args);
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}

/// The sibling scratch file SoX writes before the result is moved onto
/// the real output path.
fn transform_scratch_path(track: &Path) -> PathBuf {
    let stem = track
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    track.with_file_name(format!("{}downsampled.flac", stem))
}

/// SoX arguments: clip-guarded, linear-phase, dithered resample, with an
/// optional 16-bit reduction. The rate is chosen by divisibility so
/// 88.2/176.4kHz material lands on 44100 and 96/192kHz on 48000; a rate
/// that divides neither stays as-is.
fn sox_args(
    input: &Path,
    scratch: &Path,
    preset: FlacPreset,
    props: AudioProperties,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![OsString::from(input), "-G".into()];

    if preset.forces_bit_depth() {
        args.push("-b".into());
        args.push("16".into());
    }

    args.push(OsString::from(scratch));
    args.push("rate".into());
    args.push("-v".into());
    args.push("-L".into());

    let rate = if preset.forces_sample_rate() {
        if props.sample_rate % 44100 == 0 {
            44100
        } else if props.sample_rate % 48000 == 0 {
            48000
        } else {
            props.sample_rate
        }
    } else {
        props.sample_rate
    };
    args.push(rate.to_string().into());
    args.push("dither".into());
    args
}

/// flac arguments: force overwrite, verify the encode, maximum
/// compression.
fn flac_encode_args(input: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-f".into(),
        "-V".into(),
        "-8".into(),
        OsString::from(input),
        "-o".into(),
        OsString::from(output),
    ]
}

fn flac_decode_args(input: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-d".into(),
        OsString::from(input),
        "-o".into(),
        OsString::from(output),
    ]
}

/// opusenc arguments; --bitrate defaults to VBR mode.
fn opus_args(preset: OpusPreset, input: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "--quiet".into(),
        "--bitrate".into(),
        preset.bitrate.to_string().into(),
        OsString::from(input),
        OsString::from(output),
    ]
}

/// LAME arguments: highest-quality algorithms, then VBR level or CBR
/// bitrate from the preset.
fn lame_args(preset: Mp3Preset, input: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-q".into(), "0".into()];
    match preset {
        Mp3Preset::Vbr(level) => {
            args.push("-V".into());
            args.push(level.to_string().into());
        }
        Mp3Preset::Cbr(kbps) => {
            args.push("-b".into());
            args.push(kbps.to_string().into());
        }
    }
    args.push(OsString::from(input));
    args.push(OsString::from(output));
    args
}

/// Map a source tag map onto the destination format's conventional field
/// names. Artist, album artist, composer and genre are additive (multiple
/// values allowed); everything else is single-valued, last value wins.
pub fn migrate_tags(source: &TagMap) -> TagMap {
    fn add(dest: &mut TagMap, name: &str, value: &str) {
        dest.entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    fn set(dest: &mut TagMap, name: &str, value: &str) {
        dest.insert(name.to_string(), vec![value.to_string()]);
    }

    let mut dest = TagMap::new();
    for (name, values) in source {
        for value in values {
            match name.as_str() {
                "albumartist" | "album artist" => add(&mut dest, "albumartist", value),
                "artist" | "performer" => add(&mut dest, "artist", value),
                "composer" => add(&mut dest, "composer", value),
                "genre" => add(&mut dest, "genre", value),
                "beatsperminute" => set(&mut dest, "bpm", value),
                "description" => set(&mut dest, "comment", value),
                "disc" => set(&mut dest, "discnumber", value),
                "date" => set(&mut dest, "year", value),
                "musicbrainzartistid" => set(&mut dest, "musicbrainz_artistid", value),
                "musicbrainzdiscid" => set(&mut dest, "musicbrainz_discid", value),
                "musicbrainzreleaseartistid" => {
                    set(&mut dest, "musicbrainz_albumartistid", value)
                }
                "musicbrainzreleasecountry" => set(&mut dest, "releasecountry", value),
                "musicbrainzreleaseid" => set(&mut dest, "musicbrainz_albumid", value),
                "musicbrainzreleasestatus" => set(&mut dest, "musicbrainz_albumstatus", value),
                "musicbrainzreleasetype" => set(&mut dest, "musicbrainz_albumtype", value),
                "musicbrainztrackid" => set(&mut dest, "musicbrainz_trackid", value),
                "musicipid" => set(&mut dest, "musicip_puid", value),
                other => set(&mut dest, other, value),
            }
        }
    }
    dest
}

//! The conversion scheduler: computes the batch-wide extrema, orders the
//! loudness and convert stages for the target codec, fans the tracks out
//! across a bounded worker pool, and aggregates the results.
//!
//! Stage ordering is an invariant, not a choice:
//! - FLAC: convert first, then measure loudness on the converted outputs
//!   (resampling changes the PCM content and therefore its loudness).
//! - Opus/MP3: measure loudness on the lossless sources first (the lossy
//!   encoders read the source's loudness tags to calibrate their own),
//!   then convert.

use super::encoder::{ConversionJob, TrackEncoder};
use super::loudness::LoudnessScanner;
use crate::config::{Codec, ConversionConfig, Preset};
use crate::tags::TagStore;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Batch-fatal errors. Everything else is local to a job and surfaces as
/// an empty output path.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input tracks")]
    EmptyBatch,

    #[error("output directory does not exist: {}", .0.display())]
    OutputDirMissing(PathBuf),

    #[error("no track in the batch has readable audio properties")]
    NoReadableTracks,
}

/// Where a batch currently is, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    PendingLoudness,
    Converting,
    Done,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStage::PendingLoudness => "Calculating loudness",
            BatchStage::Converting => "Converting",
            BatchStage::Done => "Done",
        }
    }
}

/// Receives stage transitions for progress reporting.
pub trait StatusSink: Send + Sync {
    fn stage_changed(&self, stage: BatchStage);
}

/// Sink that drops every update.
#[derive(Debug, Default)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn stage_changed(&self, _stage: BatchStage) {}
}

/// Batch-wide maxima, computed once before any per-track decision so all
/// file names in a mixed-quality batch agree on the same disambiguating
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchExtrema {
    pub max_bit_depth: u32,
    pub max_sample_rate: u32,
    /// The largest standard rate (44100 or 48000) that evenly divides
    /// `max_sample_rate`, or `max_sample_rate` itself when neither does.
    pub base_sample_rate: u32,
}

impl BatchExtrema {
    pub fn scan(tags: &dyn TagStore, tracks: &[PathBuf]) -> Result<BatchExtrema, PipelineError> {
        let mut max_bit_depth = 0u32;
        let mut max_sample_rate = 0u32;
        let mut readable = false;

        for track in tracks {
            match tags.audio_properties(track) {
                Ok(props) => {
                    readable = true;
                    max_bit_depth = max_bit_depth.max(props.bit_depth);
                    max_sample_rate = max_sample_rate.max(props.sample_rate);
                }
                Err(e) => {
                    warn!("Failed to read properties of {}: {}", track.display(), e);
                }
            }
        }

        if !readable {
            return Err(PipelineError::NoReadableTracks);
        }

        let base_sample_rate = if max_sample_rate % 44100 == 0 {
            44100
        } else if max_sample_rate % 48000 == 0 {
            48000
        } else {
            max_sample_rate
        };

        Ok(BatchExtrema {
            max_bit_depth,
            max_sample_rate,
            base_sample_rate,
        })
    }
}

/// Drives a whole batch through the loudness and convert stages.
pub struct ConversionPipeline {
    encoder: Arc<dyn TrackEncoder>,
    loudness: Arc<dyn LoudnessScanner>,
    tags: Arc<dyn TagStore>,
    status: Arc<dyn StatusSink>,
    workers: usize,
}

impl ConversionPipeline {
    pub fn new(
        encoder: Arc<dyn TrackEncoder>,
        loudness: Arc<dyn LoudnessScanner>,
        tags: Arc<dyn TagStore>,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            encoder,
            loudness,
            tags,
            status: Arc::new(NullStatusSink),
            workers,
        }
    }

    /// Bound the worker pool to `workers` (ignored when zero).
    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Convert every track in the batch. Returns the resolved output
    /// paths sorted lexicographically; failed jobs contribute empty paths
    /// that the caller is expected to check for.
    pub async fn run(
        &self,
        tracks: &[PathBuf],
        config: &ConversionConfig,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        if tracks.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        if !config.output_dir.is_dir() {
            return Err(PipelineError::OutputDirMissing(config.output_dir.clone()));
        }

        let extrema = BatchExtrema::scan(self.tags.as_ref(), tracks)?;
        info!(
            "Batch of {} tracks, max {}bit/{}Hz",
            tracks.len(),
            extrema.max_bit_depth,
            extrema.max_sample_rate
        );

        // Lossy codecs never disambiguate names by PCM format, so the
        // batch values are injected for FLAC only.
        let (future_bit_depth, future_sample_rate) = match config.preset {
            Preset::Flac(preset) => {
                let bits = if preset.forces_bit_depth() {
                    16
                } else {
                    extrema.max_bit_depth
                };
                let rate = if preset.forces_sample_rate() {
                    extrema.base_sample_rate
                } else {
                    extrema.max_sample_rate
                };
                (Some(bits), Some(rate))
            }
            Preset::Opus(_) | Preset::Mp3(_) => (None, None),
        };

        let mut outputs = match config.codec() {
            Codec::Flac => {
                self.status.stage_changed(BatchStage::Converting);
                let outputs = self
                    .convert_all(tracks, config, future_bit_depth, future_sample_rate)
                    .await;
                if config.apply_loudness {
                    self.status.stage_changed(BatchStage::PendingLoudness);
                    if let Err(e) = self.loudness.scan(&outputs).await {
                        error!("Loudness stage failed: {}", e);
                    }
                }
                outputs
            }
            Codec::Opus | Codec::Mp3 => {
                if config.apply_loudness {
                    self.status.stage_changed(BatchStage::PendingLoudness);
                    if let Err(e) = self.loudness.scan(tracks).await {
                        error!("Loudness stage failed: {}", e);
                    }
                }
                self.status.stage_changed(BatchStage::Converting);
                self.convert_all(tracks, config, future_bit_depth, future_sample_rate)
                    .await
            }
        };

        self.status.stage_changed(BatchStage::Done);

        // Completion order is meaningless; hand back a deterministic one
        outputs.sort();
        Ok(outputs)
    }

    /// Fan the batch out across the bounded pool and wait for every job
    /// to finish before any result is consumed.
    async fn convert_all(
        &self,
        tracks: &[PathBuf],
        config: &ConversionConfig,
        future_bit_depth: Option<u32>,
        future_sample_rate: Option<u32>,
    ) -> Vec<PathBuf> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();

        for track in tracks {
            let job = ConversionJob {
                track: track.clone(),
                config: config.clone(),
                future_bit_depth,
                future_sample_rate,
            };
            let encoder = Arc::clone(&self.encoder);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return PathBuf::new();
                };
                encoder.encode(&job).await
            });
        }

        let mut outputs = Vec::with_capacity(tracks.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(path) => outputs.push(path),
                Err(e) => {
                    error!("Conversion task failed: {}", e);
                    outputs.push(PathBuf::new());
                }
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlacPreset, Mp3Preset, OpusPreset};
    use crate::convert::loudness::LoudnessError;
    use crate::tags::{Artwork, AudioProperties, TagError, TagMap};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Encoded {
            track: PathBuf,
            future_bit_depth: Option<u32>,
            future_sample_rate: Option<u32>,
        },
        Scanned(Vec<PathBuf>),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    struct StubTagStore {
        props: BTreeMap<PathBuf, AudioProperties>,
    }

    impl StubTagStore {
        fn new(entries: &[(&str, u32, u32)]) -> Self {
            Self {
                props: entries
                    .iter()
                    .map(|(path, bits, rate)| {
                        (
                            PathBuf::from(path),
                            AudioProperties {
                                bit_depth: *bits,
                                sample_rate: *rate,
                            },
                        )
                    })
                    .collect(),
            }
        }
    }

    impl TagStore for StubTagStore {
        fn read_tags(&self, _path: &Path) -> Result<TagMap, TagError> {
            Ok(TagMap::new())
        }

        fn audio_properties(&self, path: &Path) -> Result<AudioProperties, TagError> {
            self.props
                .get(path)
                .copied()
                .ok_or_else(|| TagError::NoTag(path.display().to_string()))
        }

        fn artwork(&self, _path: &Path) -> Result<Vec<Artwork>, TagError> {
            Ok(Vec::new())
        }

        fn write_tags(&self, _path: &Path, _tags: &TagMap) -> Result<(), TagError> {
            Ok(())
        }

        fn replace_all_tags(
            &self,
            _path: &Path,
            _tags: &TagMap,
            _artwork: &[Artwork],
        ) -> Result<(), TagError> {
            Ok(())
        }

        fn remove_tags(&self, _path: &Path, _names: &[&str]) -> Result<(), TagError> {
            Ok(())
        }
    }

    /// Encoder double: maps each track to a canned output path, with an
    /// optional delay to scramble completion order.
    struct FakeEncoder {
        recorder: Arc<Recorder>,
        outputs: BTreeMap<PathBuf, (PathBuf, u64)>,
    }

    impl FakeEncoder {
        fn new(recorder: Arc<Recorder>, entries: &[(&str, &str, u64)]) -> Self {
            Self {
                recorder,
                outputs: entries
                    .iter()
                    .map(|(track, output, delay_ms)| {
                        (
                            PathBuf::from(track),
                            (PathBuf::from(output), *delay_ms),
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl TrackEncoder for FakeEncoder {
        async fn encode(&self, job: &ConversionJob) -> PathBuf {
            let (output, delay_ms) = self
                .outputs
                .get(&job.track)
                .cloned()
                .unwrap_or((PathBuf::new(), 0));
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.recorder.push(Event::Encoded {
                track: job.track.clone(),
                future_bit_depth: job.future_bit_depth,
                future_sample_rate: job.future_sample_rate,
            });
            output
        }
    }

    struct RecordingScanner {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl LoudnessScanner for RecordingScanner {
        async fn scan(&self, files: &[PathBuf]) -> Result<(), LoudnessError> {
            self.recorder.push(Event::Scanned(files.to_vec()));
            Ok(())
        }
    }

    fn pipeline_with(
        recorder: &Arc<Recorder>,
        encoder_entries: &[(&str, &str, u64)],
        tag_entries: &[(&str, u32, u32)],
    ) -> ConversionPipeline {
        ConversionPipeline::new(
            Arc::new(FakeEncoder::new(Arc::clone(recorder), encoder_entries)),
            Arc::new(RecordingScanner {
                recorder: Arc::clone(recorder),
            }),
            Arc::new(StubTagStore::new(tag_entries)),
        )
        .with_workers(4)
    }

    fn config(preset: Preset, output_dir: &Path) -> ConversionConfig {
        ConversionConfig {
            preset,
            template: "%title%".to_string(),
            output_dir: output_dir.to_path_buf(),
            apply_loudness: true,
        }
    }

    #[test]
    fn test_batch_extrema_across_mixed_batch() {
        let store = StubTagStore::new(&[("/in/a.flac", 16, 44100), ("/in/b.flac", 24, 96000)]);
        let extrema = BatchExtrema::scan(
            &store,
            &[PathBuf::from("/in/a.flac"), PathBuf::from("/in/b.flac")],
        )
        .unwrap();
        assert_eq!(
            extrema,
            BatchExtrema {
                max_bit_depth: 24,
                max_sample_rate: 96000,
                base_sample_rate: 48000,
            }
        );
    }

    #[test]
    fn test_batch_extrema_base_rate_divisibility() {
        let base = |rate: u32| {
            let store = StubTagStore::new(&[("/in/a.flac", 24, rate)]);
            BatchExtrema::scan(&store, &[PathBuf::from("/in/a.flac")])
                .unwrap()
                .base_sample_rate
        };
        assert_eq!(base(88200), 44100);
        assert_eq!(base(176400), 44100);
        assert_eq!(base(96000), 48000);
        assert_eq!(base(44100), 44100);
        // divides neither standard rate: kept as-is
        assert_eq!(base(22050), 22050);
    }

    #[test]
    fn test_batch_extrema_requires_a_readable_track() {
        let store = StubTagStore::new(&[]);
        let result = BatchExtrema::scan(&store, &[PathBuf::from("/in/na.flac")]);
        assert!(matches!(result, Err(PipelineError::NoReadableTracks)));
    }

    #[tokio::test]
    async fn test_flac_measures_loudness_after_converting() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.flac", 0), ("/in/b.flac", "/out/b.flac", 0)],
            &[("/in/a.flac", 16, 44100), ("/in/b.flac", 24, 96000)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac"), PathBuf::from("/in/b.flac")];
        let cfg = config(Preset::Flac(FlacPreset::Standard), out_dir.path());
        pipeline.run(&tracks, &cfg).await.unwrap();

        let events = recorder.events();
        let scan_index = events
            .iter()
            .position(|e| matches!(e, Event::Scanned(_)))
            .expect("loudness stage never ran");
        // every encode precedes the scan
        assert_eq!(scan_index, events.len() - 1);

        // and the scan saw the converted outputs, not the sources
        let Event::Scanned(scanned) = &events[scan_index] else {
            unreachable!()
        };
        let mut scanned = scanned.clone();
        scanned.sort();
        assert_eq!(
            scanned,
            vec![PathBuf::from("/out/a.flac"), PathBuf::from("/out/b.flac")]
        );
    }

    #[tokio::test]
    async fn test_lossy_measures_loudness_before_converting() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.mp3", 0), ("/in/b.flac", "/out/b.mp3", 0)],
            &[("/in/a.flac", 16, 44100), ("/in/b.flac", 16, 44100)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac"), PathBuf::from("/in/b.flac")];
        let cfg = config(Preset::Mp3(Mp3Preset::Vbr(0)), out_dir.path());
        pipeline.run(&tracks, &cfg).await.unwrap();

        let events = recorder.events();
        // the scan comes first and saw the lossless sources
        assert_eq!(events[0], Event::Scanned(tracks.clone()));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_flac_jobs_carry_batch_level_values() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.flac", 0), ("/in/b.flac", "/out/b.flac", 0)],
            &[("/in/a.flac", 16, 44100), ("/in/b.flac", 24, 96000)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac"), PathBuf::from("/in/b.flac")];
        let cfg = config(
            Preset::Flac(FlacPreset::Force16BitAndBaseRate),
            out_dir.path(),
        );
        pipeline.run(&tracks, &cfg).await.unwrap();

        for event in recorder.events() {
            if let Event::Encoded {
                future_bit_depth,
                future_sample_rate,
                ..
            } = event
            {
                assert_eq!(future_bit_depth, Some(16));
                assert_eq!(future_sample_rate, Some(48000));
            }
        }
    }

    #[tokio::test]
    async fn test_lossy_jobs_use_track_own_values() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.opus", 0)],
            &[("/in/a.flac", 24, 96000)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac")];
        let cfg = config(Preset::Opus(OpusPreset { bitrate: 192 }), out_dir.path());
        pipeline.run(&tracks, &cfg).await.unwrap();

        let encoded: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Encoded { .. }))
            .collect();
        assert_eq!(
            encoded,
            vec![Event::Encoded {
                track: PathBuf::from("/in/a.flac"),
                future_bit_depth: None,
                future_sample_rate: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_results_are_sorted_regardless_of_completion_order() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        // completion order is C, B, A; the returned order must not be
        let pipeline = pipeline_with(
            &recorder,
            &[
                ("/in/1.flac", "/out/C.mp3", 0),
                ("/in/2.flac", "/out/A.mp3", 40),
                ("/in/3.flac", "/out/B.mp3", 20),
            ],
            &[
                ("/in/1.flac", 16, 44100),
                ("/in/2.flac", 16, 44100),
                ("/in/3.flac", 16, 44100),
            ],
        );

        let tracks = vec![
            PathBuf::from("/in/1.flac"),
            PathBuf::from("/in/2.flac"),
            PathBuf::from("/in/3.flac"),
        ];
        let mut cfg = config(Preset::Mp3(Mp3Preset::Cbr(320)), out_dir.path());
        cfg.apply_loudness = false;
        let outputs = pipeline.run(&tracks, &cfg).await.unwrap();

        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/out/A.mp3"),
                PathBuf::from("/out/B.mp3"),
                PathBuf::from("/out/C.mp3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_jobs_keep_their_empty_paths() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        // no canned output for the second track: it fails
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.mp3", 0)],
            &[("/in/a.flac", 16, 44100), ("/in/b.flac", 16, 44100)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac"), PathBuf::from("/in/b.flac")];
        let mut cfg = config(Preset::Mp3(Mp3Preset::Cbr(320)), out_dir.path());
        cfg.apply_loudness = false;
        let outputs = pipeline.run(&tracks, &cfg).await.unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0], PathBuf::new());
        assert_eq!(outputs[1], PathBuf::from("/out/a.mp3"));
    }

    #[tokio::test]
    async fn test_loudness_stage_can_be_disabled() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.mp3", 0)],
            &[("/in/a.flac", 16, 44100)],
        );

        let tracks = vec![PathBuf::from("/in/a.flac")];
        let mut cfg = config(Preset::Mp3(Mp3Preset::Cbr(320)), out_dir.path());
        cfg.apply_loudness = false;
        pipeline.run(&tracks, &cfg).await.unwrap();

        assert!(recorder
            .events()
            .iter()
            .all(|e| !matches!(e, Event::Scanned(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_is_fatal() {
        let out_dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(&recorder, &[], &[]);

        let cfg = config(Preset::Mp3(Mp3Preset::Cbr(320)), out_dir.path());
        let result = pipeline.run(&[], &cfg).await;
        assert!(matches!(result, Err(PipelineError::EmptyBatch)));
    }

    #[tokio::test]
    async fn test_missing_output_dir_is_fatal() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline_with(
            &recorder,
            &[("/in/a.flac", "/out/a.mp3", 0)],
            &[("/in/a.flac", 16, 44100)],
        );

        let cfg = config(
            Preset::Mp3(Mp3Preset::Cbr(320)),
            Path::new("/definitely/not/a/real/dir"),
        );
        let result = pipeline.run(&[PathBuf::from("/in/a.flac")], &cfg).await;
        assert!(matches!(result, Err(PipelineError::OutputDirMissing(_))));
    }
}

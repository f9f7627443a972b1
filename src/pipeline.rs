//! Every failure after segmentation saves a checkpoint before it is returned.
//! A run that completes removes its checkpoint.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::checkpoint;
use crate::config::{InputSource, PipelineConfig};
use crate::error::{IoContext, PipelineError};
use crate::progress::progress_bar;
use crate::retry::{RetryError, with_backoff};
use crate::segment::{Segment, build_segments};
use crate::synth::SpeechSynthesizer;

const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Cooperative cancellation shared with the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub segments: usize,
    pub synthesized: usize,
    pub output_bytes: u64,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    synthesizer: &'a dyn SpeechSynthesizer,
    cancel: CancelFlag,
    pause: Box<dyn FnMut(Duration) -> bool + 'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        synthesizer: &'a dyn SpeechSynthesizer,
        cancel: CancelFlag,
    ) -> Self {
        let flag = cancel.clone();
        Self {
            config,
            synthesizer,
            cancel,
            pause: Box::new(move |delay| sleep_unless_cancelled(delay, &flag)),
        }
    }

    /// Replaces the wait between retries. The closure returns false to abort.
    #[cfg(test)]
    pub fn with_pause(mut self, pause: impl FnMut(Duration) -> bool + 'a) -> Self {
        self.pause = Box::new(pause);
        self
    }

    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let config = self.config;
        let checkpoint_path = &config.checkpoint;
        let mut segments = self.prepare()?;

        let synthesized = match self.synthesize_pending(&mut segments) {
            Ok(count) => count,
            Err(err) => {
                match &err {
                    PipelineError::Cancelled => info!("exiting, saving progress"),
                    other => error!("exiting: {other}"),
                }
                checkpoint::save(&segments, checkpoint_path, true, config.show_progress)?;
                return Err(err);
            }
        };

        checkpoint::save(&segments, checkpoint_path, false, config.show_progress)?;
        info!("speech synthesis done ({synthesized} new segments)");

        let output_bytes = join_segments(&segments, &config.output, config.show_progress)?;
        info!(
            "wrote {output_bytes} bytes of audio to {}",
            config.output.display()
        );

        fs::remove_file(checkpoint_path).io_context(|| {
            format!("failed removing checkpoint {}", checkpoint_path.display())
        })?;

        Ok(RunSummary {
            segments: segments.len(),
            synthesized,
            output_bytes,
        })
    }

    /// Restores the segment list from the checkpoint, or segments the input
    /// and checkpoints the result.
    fn prepare(&self) -> Result<Vec<Segment>, PipelineError> {
        let checkpoint_path = &self.config.checkpoint;
        if checkpoint_path.is_file() {
            info!("resuming from {}", checkpoint_path.display());
            return checkpoint::load(
                checkpoint_path,
                &self.config.scratch_dir,
                self.config.show_progress,
            );
        }

        let InputSource::TextFile(input) = &self.config.source else {
            return Err(PipelineError::Validation(format!(
                "recover file {} does not exist",
                checkpoint_path.display()
            )));
        };
        let text = fs::read_to_string(input)
            .io_context(|| format!("failed reading text file {}", input.display()))?;
        let segments = build_segments(&text, self.config.segment_size);
        info!(
            "split {} into {} segments of up to {} chars",
            input.display(),
            segments.len(),
            self.config.segment_size
        );

        checkpoint::save(&segments, checkpoint_path, true, self.config.show_progress)?;
        Ok(segments)
    }

    fn synthesize_pending(&mut self, segments: &mut [Segment]) -> Result<usize, PipelineError> {
        let config = self.config;
        let pending = segments.iter().filter(|s| s.is_pending()).count();
        let progress = progress_bar(pending as u64, "Calling TTS service", config.show_progress);
        let mut synthesized = 0;
        let mut since_save = 0;

        for index in 0..segments.len() {
            if self.cancel.is_cancelled() {
                progress.abandon();
                return Err(PipelineError::Cancelled);
            }
            if !segments[index].is_pending() {
                continue;
            }

            let audio = self.synthesize_segment(&segments[index])?;
            let path = checkpoint::write_payload(&config.scratch_dir, &audio).io_context(|| {
                format!("failed storing audio in {}", config.scratch_dir.display())
            })?;
            segments[index].attach_audio(path);
            synthesized += 1;
            since_save += 1;
            progress.inc(1);

            if since_save >= config.autosave_every {
                progress.suspend(|| {
                    info!("autosave...");
                    checkpoint::save(segments, &config.checkpoint, false, config.show_progress)
                })?;
                since_save = 0;
            }
        }

        progress.finish_and_clear();
        Ok(synthesized)
    }

    fn synthesize_segment(&mut self, segment: &Segment) -> Result<Vec<u8>, PipelineError> {
        let config = self.config;
        let synthesizer = self.synthesizer;
        let id = segment.id();
        debug!(
            "synthesizing segment {id} ({} chars) with {}",
            segment.text().chars().count(),
            synthesizer.name()
        );

        with_backoff(
            &config.retry,
            || synthesizer.synthesize(segment.text(), &config.language),
            &mut self.pause,
        )
        .map_err(|err| match err {
            RetryError::Rejected(source) => PipelineError::SynthesisRejected { id, source },
            RetryError::Exhausted {
                attempts,
                last_error,
            } => PipelineError::SynthesisExhausted {
                id,
                attempts,
                source: last_error,
            },
            RetryError::Interrupted => PipelineError::Cancelled,
        })
    }
}

/// Writes every payload, in order, into a freshly truncated `output`,
/// removing each payload once copied.
fn join_segments(
    segments: &[Segment],
    output: &Path,
    show_progress: bool,
) -> Result<u64, PipelineError> {
    if let Some(missing) = segments.iter().find(|s| s.is_pending()) {
        return Err(PipelineError::MissingAudio { id: missing.id() });
    }

    let file = File::create(output)
        .io_context(|| format!("failed creating output {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let progress = progress_bar(segments.len() as u64, "Joining segments", show_progress);
    let mut total = 0;

    for segment in segments {
        progress.inc(1);
        let Some(path) = segment.audio() else {
            continue;
        };
        let mut payload =
            File::open(path).io_context(|| format!("failed opening audio {}", path.display()))?;
        total += io::copy(&mut payload, &mut writer)
            .io_context(|| format!("failed appending audio to {}", output.display()))?;
        drop(payload);
        fs::remove_file(path).io_context(|| format!("failed removing {}", path.display()))?;
    }

    writer
        .flush()
        .io_context(|| format!("failed writing output {}", output.display()))?;
    progress.finish_and_clear();
    Ok(total)
}

/// Sleeps for `delay` in short slices; returns false as soon as the run is
/// cancelled.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

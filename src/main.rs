mod checkpoint;
mod config;
mod error;
mod languages;
mod pipeline;
mod progress;
mod retry;
mod segment;
mod synth;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{
    DEFAULT_LANGUAGE, InputSource, PipelineConfig, SEGMENT_SIZE_MAX, clamp_segment_size,
    default_checkpoint_path,
};
use crate::error::PipelineError;
use crate::pipeline::{CancelFlag, Pipeline, RunSummary};
use crate::synth::{GoogleTranslateTts, GoogleTtsOptions};

#[derive(Debug, Parser)]
#[command(name = "txt2mp3")]
#[command(about = "Uses Google TTS to read up a long text file, split into resumable pieces")]
struct Cli {
    #[arg(short, long = "input", value_name = "FILE", help = "Input txt file")]
    input: Option<PathBuf>,
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present = "list_languages",
        help = "Output file name"
    )]
    output: Option<PathBuf>,
    #[arg(short, long, default_value = DEFAULT_LANGUAGE, help = "Language to be used")]
    language: String,
    #[arg(
        short,
        long,
        default_value_t = SEGMENT_SIZE_MAX,
        help = "Maximum length of segments, between 100 and 5000"
    )]
    segment_size: usize,
    #[arg(long, help = "List all available languages")]
    list_languages: bool,
    #[arg(
        short,
        long = "resume",
        value_name = "FILE",
        conflicts_with = "input",
        help = "Load partial results from a file to continue interrupted generation"
    )]
    resume: Option<PathBuf>,
    #[arg(long, default_value = "com", help = "Top-level domain of the Google host to use")]
    tld: String,
    #[arg(long, help = "Read more slowly")]
    slow: bool,
    #[arg(long, help = "Do not draw progress bars")]
    no_progress: bool,
}

impl Cli {
    fn into_config(self) -> Result<PipelineConfig, PipelineError> {
        let output = self
            .output
            .ok_or_else(|| PipelineError::Validation("-o/--output must be specified".into()))?;

        let (source, checkpoint) = match (self.input, self.resume) {
            (Some(input), None) => (
                InputSource::TextFile(input),
                default_checkpoint_path(&output),
            ),
            (None, Some(resume)) => (InputSource::Checkpoint, resume),
            _ => {
                return Err(PipelineError::Validation(
                    "-i or -r must be specified".into(),
                ));
            }
        };

        let segment_size = clamp_segment_size(self.segment_size);
        if segment_size != self.segment_size {
            info!(
                "segment size {} clamped to {segment_size}",
                self.segment_size
            );
        }

        let mut config = PipelineConfig::new(source, output, checkpoint);
        config.language = self.language;
        config.segment_size = segment_size;
        config.show_progress = !self.no_progress;
        config.validate()?;
        Ok(config)
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn list_languages() {
    for (code, name) in languages::supported_languages() {
        println!("{code}: {name}");
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let options = GoogleTtsOptions {
        tld: cli.tld.clone(),
        slow: cli.slow,
    };
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || handler_flag.cancel())
        .context("failed installing Ctrl-C handler")?;

    let synthesizer =
        GoogleTranslateTts::new(&options).context("failed building HTTP client")?;

    let outcome = Pipeline::new(&config, &synthesizer, cancel).run();
    let status = exit_status(&outcome);
    match outcome {
        Ok(summary) => info!(
            "done: {} segments, {} synthesized this run, {} bytes in {}",
            summary.segments,
            summary.synthesized,
            summary.output_bytes,
            config.output.display()
        ),
        Err(PipelineError::Cancelled) => {
            info!("progress saved to {}", config.checkpoint.display());
        }
        Err(err) => {
            error!("{:#}", anyhow::Error::new(err));
            if config.checkpoint.exists() {
                info!("resume with -r {}", config.checkpoint.display());
            }
        }
    }
    Ok(ExitCode::from(status))
}

/// An interrupted run has saved its progress, so it exits cleanly.
fn exit_status(outcome: &Result<RunSummary, PipelineError>) -> u8 {
    match outcome {
        Ok(_) | Err(PipelineError::Cancelled) => 0,
        Err(_) => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    if cli.list_languages {
        list_languages();
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("txt2mp3").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn defaults_cover_common_case() {
        let cli = parse(&["-i", "book.txt", "-o", "book.mp3"]);
        assert_eq!(cli.language, "en");
        assert_eq!(cli.segment_size, 5000);
        assert_eq!(cli.tld, "com");
        assert!(!cli.slow);
    }

    #[test]
    fn output_is_optional_only_for_language_listing() {
        assert!(Cli::try_parse_from(["txt2mp3", "-i", "book.txt"]).is_err());
        assert!(Cli::try_parse_from(["txt2mp3", "--list-languages"]).is_ok());
    }

    #[test]
    fn input_and_resume_conflict() {
        let result =
            Cli::try_parse_from(["txt2mp3", "-i", "a.txt", "-r", "a.resume", "-o", "a.mp3"]);
        assert!(result.is_err());
    }

    #[test]
    fn input_or_resume_is_required() {
        let err = parse(&["-o", "book.mp3"]).into_config().unwrap_err();
        assert_eq!(err.to_string(), "-i or -r must be specified");
    }

    #[test]
    fn config_uses_output_checkpoint_and_clamps_size() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("book.txt");
        std::fs::write(&input, "Hello world.").unwrap();
        let output = dir.path().join("book.mp3");

        let cli = parse(&[
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-s",
            "10",
            "-l",
            "de",
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.source, InputSource::TextFile(input));
        assert_eq!(config.checkpoint, dir.path().join("book.mp3.resume"));
        assert_eq!(config.segment_size, 100);
        assert_eq!(config.language, "de");
    }

    #[test]
    fn resume_path_becomes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let resume = dir.path().join("old.resume");
        std::fs::write(&resume, b"zip").unwrap();

        let cli = parse(&[
            "-r",
            resume.to_str().unwrap(),
            "-o",
            dir.path().join("out.mp3").to_str().unwrap(),
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.source, InputSource::Checkpoint);
        assert_eq!(config.checkpoint, resume);
    }

    #[test]
    fn cancelled_run_exits_cleanly() {
        let summary = RunSummary {
            segments: 3,
            synthesized: 3,
            output_bytes: 12,
        };
        assert_eq!(exit_status(&Ok(summary)), 0);
        assert_eq!(exit_status(&Err(PipelineError::Cancelled)), 0);
        assert_eq!(
            exit_status(&Err(PipelineError::Validation("bad".into()))),
            1
        );
        assert_eq!(
            exit_status(&Err(PipelineError::corrupt("x.resume", "truncated"))),
            1
        );
    }

    #[test]
    fn missing_input_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cli = parse(&[
            "-i",
            dir.path().join("nope.txt").to_str().unwrap(),
            "-o",
            dir.path().join("out.mp3").to_str().unwrap(),
        ]);
        assert!(matches!(
            cli.into_config(),
            Err(PipelineError::Validation(_))
        ));
    }
}

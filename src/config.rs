//! Command-line parsing and validation helpers.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const DEFAULT_CHANNELS: u16 = 1;
const DEFAULT_CHUNK_SECS: f64 = 1.0;
const DEFAULT_CALIBRATION_SECS: f64 = 3.0;
const DEFAULT_SILENCE_LIMIT: usize = 5;
const DEFAULT_MAX_SESSION_SECS: u64 = 180;
const MAX_SESSION_HARD_LIMIT_SECS: u64 = 3_600;
const DEFAULT_API_BASE: &str = "https://api.groq.com/openai/v1";
const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-large-v3";
const DEFAULT_CLASSIFICATION_MODEL: &str = "llama-3.1-8b-instant";
const DEFAULT_API_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RESULTS_FILE: &str = "sentivox_results.tsv";
const DEFAULT_CRM_FILE: &str = "sentivox_crm.tsv";
const DEFAULT_SUMMARIES_FILE: &str = "sentivox_summaries.tsv";

/// CLI options for the Sentivox terminal. Validated values keep the capture
/// loop and the API client inside safe bounds.
#[derive(Debug, Parser, Clone)]
#[command(about = "Sentivox voice sentiment terminal", author, version)]
pub struct AppConfig {
    /// API key for the hosted transcription/classification service
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Model used for speech-to-text
    #[arg(long, default_value = DEFAULT_TRANSCRIPTION_MODEL)]
    pub transcription_model: String,

    /// Model used for sentiment/emotion classification and call summaries
    #[arg(long, default_value = DEFAULT_CLASSIFICATION_MODEL)]
    pub classification_model: String,

    /// Per-request timeout for API calls (seconds)
    #[arg(long, default_value_t = DEFAULT_API_TIMEOUT_SECS)]
    pub api_timeout_secs: u64,

    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Print an environment diagnostic report and exit
    #[arg(long, default_value_t = false)]
    pub doctor: bool,

    /// Run one calibrate/capture/analyze/save cycle without the dashboard
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Seed the CRM table with demo customers when it is empty, then exit
    #[arg(long = "seed-crm", default_value_t = false)]
    pub seed_crm: bool,

    /// Capture sample rate (Hz)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Capture channel count (1 = mono downmix at the device)
    #[arg(long, default_value_t = DEFAULT_CHANNELS)]
    pub channels: u16,

    /// Duration of each captured chunk (seconds)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SECS)]
    pub chunk_secs: f64,

    /// Ambient sampling window used for calibration (seconds)
    #[arg(long, default_value_t = DEFAULT_CALIBRATION_SECS)]
    pub calibration_secs: f64,

    /// Consecutive quiet chunks required before capture stops
    #[arg(long, default_value_t = DEFAULT_SILENCE_LIMIT)]
    pub silence_limit: usize,

    /// Hard cap on one recording session (seconds)
    #[arg(long, default_value_t = DEFAULT_MAX_SESSION_SECS)]
    pub max_session_secs: u64,

    /// Results table file
    #[arg(long, default_value = DEFAULT_RESULTS_FILE)]
    pub results_file: PathBuf,

    /// CRM customer table file
    #[arg(long, default_value = DEFAULT_CRM_FILE)]
    pub crm_file: PathBuf,

    /// Post-call summaries table file
    #[arg(long, default_value = DEFAULT_SUMMARIES_FILE)]
    pub summaries_file: PathBuf,

    /// Skip generating a post-call summary on save
    #[arg(long = "no-summary")]
    pub no_summary: bool,

    /// Enable verbose timing logs
    #[arg(long)]
    pub log_timings: bool,
}

/// Snapshot of the capture-loop settings, passed to the audio layer so the
/// worker thread does not need the whole CLI surface.
#[derive(Debug, Clone)]
pub struct CapturePipelineConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_secs: f64,
    pub calibration_secs: f64,
    pub silence_limit: usize,
    pub max_session_secs: u64,
}

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values before anything touches the device or the network.
    pub fn validate(&mut self) -> Result<()> {
        if !(8_000..=96_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 96000 Hz, got {}",
                self.sample_rate
            );
        }
        if !(1..=8).contains(&self.channels) {
            bail!("--channels must be between 1 and 8, got {}", self.channels);
        }
        if !(0.1..=10.0).contains(&self.chunk_secs) {
            bail!(
                "--chunk-secs must be between 0.1 and 10.0, got {}",
                self.chunk_secs
            );
        }
        if !(0.5..=10.0).contains(&self.calibration_secs) {
            bail!(
                "--calibration-secs must be between 0.5 and 10.0, got {}",
                self.calibration_secs
            );
        }
        if !(1..=60).contains(&self.silence_limit) {
            bail!(
                "--silence-limit must be between 1 and 60 chunks, got {}",
                self.silence_limit
            );
        }
        if self.max_session_secs == 0 || self.max_session_secs > MAX_SESSION_HARD_LIMIT_SECS {
            bail!(
                "--max-session-secs must be between 1 and {MAX_SESSION_HARD_LIMIT_SECS}, got {}",
                self.max_session_secs
            );
        }
        let min_session = (self.chunk_secs * self.silence_limit as f64).ceil() as u64;
        if self.max_session_secs < min_session {
            bail!(
                "--max-session-secs ({}) is shorter than the silence window ({} chunks of {}s)",
                self.max_session_secs,
                self.silence_limit,
                self.chunk_secs
            );
        }
        if !(1..=300).contains(&self.api_timeout_secs) {
            bail!(
                "--api-timeout-secs must be between 1 and 300, got {}",
                self.api_timeout_secs
            );
        }
        if self.api_base.trim().is_empty()
            || !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://"))
        {
            bail!("--api-base must be an http(s) URL, got '{}'", self.api_base);
        }
        for (flag, value) in [
            ("--transcription-model", &self.transcription_model),
            ("--classification-model", &self.classification_model),
        ] {
            if value.trim().is_empty() {
                bail!("{flag} cannot be empty");
            }
        }
        Ok(())
    }

    /// Snapshot the capture-loop settings for downstream consumers.
    pub fn capture_pipeline_config(&self) -> CapturePipelineConfig {
        CapturePipelineConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_secs: self.chunk_secs,
            calibration_secs: self.calibration_secs,
            silence_limit: self.silence_limit,
            max_session_secs: self.max_session_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn accepts_valid_defaults() {
        let mut cfg = AppConfig::parse_from(["sentivox-tests"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_sample_rate_out_of_bounds() {
        let mut cfg = AppConfig::parse_from(["sentivox-tests", "--sample-rate", "4000"]);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::parse_from(["sentivox-tests", "--sample-rate", "192000"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_silence_limit() {
        let mut cfg = AppConfig::parse_from(["sentivox-tests", "--silence-limit", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_session_shorter_than_silence_window() {
        let mut cfg = AppConfig::parse_from([
            "sentivox-tests",
            "--max-session-secs",
            "3",
            "--silence-limit",
            "5",
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_session_above_hard_limit() {
        let mut cfg = AppConfig::parse_from(["sentivox-tests", "--max-session-secs", "7200"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_http_api_base() {
        let mut cfg = AppConfig::parse_from(["sentivox-tests", "--api-base", "ftp://nope"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pipeline_snapshot_mirrors_cli_values() {
        let mut cfg = AppConfig::parse_from([
            "sentivox-tests",
            "--sample-rate",
            "22050",
            "--silence-limit",
            "7",
            "--max-session-secs",
            "60",
        ]);
        cfg.validate().unwrap();
        let pipeline = cfg.capture_pipeline_config();
        assert_eq!(pipeline.sample_rate, 22_050);
        assert_eq!(pipeline.silence_limit, 7);
        assert_eq!(pipeline.max_session_secs, 60);
    }
}

//! Microphone access, silence calibration, and the chunked capture loop that
//! decides in real time when a speaker has stopped talking.

use crate::config::CapturePipelineConfig;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Floor for the calibrated threshold so near-silent hardware cannot produce
/// a baseline that makes everything register as speech.
pub const MIN_THRESHOLD: f32 = 0.000_05;
/// Headroom applied to the ambient baseline.
pub const THRESHOLD_MARGIN: f32 = 1.2;
/// Duration of the guard chunk acquired when a session would otherwise end
/// empty, so downstream merging never sees a zero-chunk session.
pub const FALLBACK_CHUNK_SECS: f64 = 0.5;

/// One fixed-duration slice of captured audio. Samples are interleaved when
/// `channels > 1`; the assembler owns the downmix.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub channels: u16,
}

impl AudioChunk {
    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            samples,
            channels: 1,
        }
    }

    pub fn magnitude(&self) -> f32 {
        magnitude(&self.samples)
    }

    /// Number of time steps (interleaved sample groups) in the chunk.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

/// Shared volume convention: L2 norm over every sample divided by the sample
/// count. This is not a true RMS; the 1.2x calibration margin and the
/// 0.00005 floor are tuned to this exact scale, so every magnitude in the
/// pipeline must come from this function.
pub fn magnitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
    (sum_sq.sqrt() / samples.len() as f64) as f32
}

/// Why a capture session ended. Exactly one reason is recorded per session and
/// drives whether classification runs at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    TimedOut,
    SilenceDetected,
    UserRequested,
    InterruptedByOperator,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::TimedOut => "time limit reached",
            StopReason::SilenceDetected => "silence detected",
            StopReason::UserRequested => "stopped by user",
            StopReason::InterruptedByOperator => "interrupted by operator",
        }
    }
}

/// Everything one recording produced: the ordered chunks, the accumulated
/// duration, and the termination cause. Lives only until the assembler merges
/// it.
#[derive(Debug)]
pub struct CaptureSession {
    pub chunks: Vec<AudioChunk>,
    pub elapsed_secs: f64,
    pub stop_reason: StopReason,
}

/// External stop flags observed by the capture loop, once per chunk tick and
/// only after the in-flight chunk has been stored.
#[derive(Clone, Default)]
pub struct CaptureSignals {
    /// One-shot cancellation set by the dashboard's stop control.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Process-level interrupt (Ctrl-C in one-shot mode), converted to a
    /// normal return instead of a fault.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl CaptureSignals {
    fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Anything that can produce fixed-duration chunks. The production source is
/// [`Recorder`]; tests drive the loop with scripted sources.
pub trait ChunkSource {
    /// Acquire one chunk, blocking for approximately `duration_secs`.
    fn record_chunk(&mut self, duration_secs: f64) -> Result<AudioChunk>;
}

/// Tracks elapsed time and the consecutive-silence streak for one session.
/// Separated from the device loop so the exit transitions are testable
/// without hardware.
pub(crate) struct CaptureState {
    chunk_secs: f64,
    max_session_secs: f64,
    silence_limit: usize,
    threshold: f32,
    elapsed_secs: f64,
    silence_streak: usize,
}

impl CaptureState {
    pub(crate) fn new(cfg: &CapturePipelineConfig, threshold: f32) -> Self {
        Self {
            chunk_secs: cfg.chunk_secs,
            max_session_secs: cfg.max_session_secs as f64,
            silence_limit: cfg.silence_limit,
            threshold,
            elapsed_secs: 0.0,
            silence_streak: 0,
        }
    }

    /// Account for one appended chunk and check the session budget.
    pub(crate) fn on_chunk_appended(&mut self) -> Option<StopReason> {
        self.elapsed_secs += self.chunk_secs;
        if self.elapsed_secs >= self.max_session_secs {
            return Some(StopReason::TimedOut);
        }
        None
    }

    /// Evaluate the silence exit, then fold in the appended chunk's volume.
    /// The exit fires once the streak from the preceding chunks has reached
    /// the limit; the streak resets whenever a chunk's volume meets or
    /// exceeds the threshold.
    pub(crate) fn on_volume(&mut self, volume: f32) -> Option<StopReason> {
        if self.silence_streak >= self.silence_limit {
            return Some(StopReason::SilenceDetected);
        }
        if volume < self.threshold {
            self.silence_streak += 1;
        } else {
            self.silence_streak = 0;
        }
        None
    }

    pub(crate) fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }

    #[cfg(test)]
    pub(crate) fn silence_streak(&self) -> usize {
        self.silence_streak
    }
}

/// Record a short ambient sample and derive the speech/silence threshold for
/// this environment. Device faults are fatal: capture cannot proceed without
/// a microphone.
pub fn calibrate<S: ChunkSource>(source: &mut S, cfg: &CapturePipelineConfig) -> Result<f32> {
    let sample = source.record_chunk(cfg.calibration_secs)?;
    let baseline = sample.magnitude();
    let threshold = (baseline * THRESHOLD_MARGIN).max(MIN_THRESHOLD);
    log_debug(&format!(
        "calibration|baseline={baseline:.6}|threshold={threshold:.6}"
    ));
    Ok(threshold)
}

/// Run the recording loop until one of the exit transitions fires.
///
/// Per tick: acquire a chunk, append it, then evaluate (in order) the session
/// budget, the external stop flags, and the silence streak. The flags are
/// checked only after the append so a stop request never discards the
/// in-flight second of audio. `on_chunk` observes (elapsed, volume) for
/// progress reporting.
pub fn run_capture<S: ChunkSource>(
    source: &mut S,
    cfg: &CapturePipelineConfig,
    threshold: f32,
    signals: &CaptureSignals,
    mut on_chunk: impl FnMut(f64, f32),
) -> Result<CaptureSession> {
    let mut chunks: Vec<AudioChunk> = Vec::new();
    let mut state = CaptureState::new(cfg, threshold);

    let stop_reason = loop {
        let chunk = source.record_chunk(cfg.chunk_secs)?;
        let volume = chunk.magnitude();
        chunks.push(chunk);

        let budget_stop = state.on_chunk_appended();
        on_chunk(state.elapsed_secs(), volume);
        if let Some(reason) = budget_stop {
            break reason;
        }
        if signals.cancel_requested() {
            break StopReason::UserRequested;
        }
        if signals.interrupted() {
            break StopReason::InterruptedByOperator;
        }
        if let Some(reason) = state.on_volume(volume) {
            break reason;
        }
    };

    // The loop above appends before every exit check, so this only fires if a
    // future reordering breaks that contract. An empty session would fault the
    // merge step, so recover with a short guard chunk.
    if chunks.is_empty() {
        chunks.push(source.record_chunk(FALLBACK_CHUNK_SECS)?);
    }

    log_debug(&format!(
        "capture|chunks={}|elapsed_s={:.1}|reason={}",
        chunks.len(),
        state.elapsed_secs(),
        stop_reason.label()
    ));

    Ok(CaptureSession {
        chunks,
        elapsed_secs: state.elapsed_secs(),
        stop_reason,
    })
}

/// Wraps the system input device so the capture loop can ask for
/// speech-ready chunks without touching cpal formats or sample rates.
pub struct Recorder {
    device: cpal::Device,
    target_rate: u32,
    target_channels: u16,
}

impl Recorder {
    /// List microphone names so the CLI can expose a human-friendly selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Create a recorder, optionally forcing a specific device so users can
    /// pick the right microphone when the host exposes several inputs.
    pub fn new(preferred_device: Option<&str>, cfg: &CapturePipelineConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => {
                let mut devices = host.input_devices().context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };
        Ok(Self {
            device,
            target_rate: cfg.sample_rate,
            target_channels: cfg.channels,
        })
    }

    /// Get the name of the active recording device.
    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    /// Open an input stream, collect samples for the requested duration, and
    /// normalize the incoming format to f32 at the configured rate/layout.
    fn capture_raw(&self, duration_secs: f64) -> Result<AudioChunk> {
        let default_config = self.device.default_input_config()?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_sample_rate = device_config.sample_rate.0;
        let device_channels = usize::from(device_config.channels.max(1));
        let device_name = self.device_name();
        let downmix = self.target_channels == 1;

        // cpal delivers samples on a callback thread; collect them in a shared
        // buffer so ownership stays on the caller side.
        let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
        let buffer_clone = buffer.clone();

        let err_fn = |err| log_debug(&format!("audio_stream_error: {err}"));
        let stream = match format {
            SampleFormat::F32 => self.device.build_input_stream(
                &device_config,
                move |data: &[f32], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_samples(&mut buf, data, device_channels, downmix, |s| s);
                    }
                },
                err_fn,
                None,
            )?,
            SampleFormat::I16 => self.device.build_input_stream(
                &device_config,
                move |data: &[i16], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_samples(&mut buf, data, device_channels, downmix, |s| {
                            f32::from(s) / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            )?,
            SampleFormat::U16 => self.device.build_input_stream(
                &device_config,
                move |data: &[u16], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_samples(&mut buf, data, device_channels, downmix, |s| {
                            (f32::from(s) - 32_768.0_f32) / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            )?,
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };

        stream.play()?;
        std::thread::sleep(Duration::from_secs_f64(duration_secs));
        if let Err(err) = stream.pause() {
            log_debug(&format!("failed to pause audio stream: {err}"));
        }
        drop(stream);

        let samples = buffer
            .lock()
            .map_err(|_| anyhow!("audio capture buffer poisoned"))?
            .clone();
        if samples.is_empty() {
            return Err(anyhow!(
                "no samples captured from '{device_name}'; check microphone permissions and availability"
            ));
        }

        let channels = if downmix {
            1
        } else {
            device_config.channels.max(1)
        };
        let resampled = resample_chunk(&samples, channels, device_sample_rate, self.target_rate);
        let desired =
            (f64::from(self.target_rate) * duration_secs).round() as usize * usize::from(channels);
        Ok(AudioChunk {
            samples: fit_length(resampled, desired.max(1)),
            channels,
        })
    }
}

impl ChunkSource for Recorder {
    fn record_chunk(&mut self, duration_secs: f64) -> Result<AudioChunk> {
        self.capture_raw(duration_secs)
    }
}

/// Push converted samples, averaging interleaved frames to mono when asked so
/// the rest of the pipeline sees the configured channel layout.
fn append_samples<T, F>(
    buf: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    downmix: bool,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 || !downmix {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

/// Linear per-channel resampling to the configured rate. Short speech chunks
/// care about latency more than phase accuracy.
fn resample_chunk(input: &[f32], channels: u16, device_rate: u32, target_rate: u32) -> Vec<f32> {
    if device_rate == 0 || input.is_empty() || device_rate == target_rate {
        return input.to_vec();
    }

    let channels = usize::from(channels.max(1));
    let frames = input.len() / channels;
    let ratio = f64::from(target_rate) / f64::from(device_rate);
    let out_frames = ((frames as f64) * ratio).round() as usize;
    let mut output = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        for ch in 0..channels {
            let a = input.get(idx * channels + ch).copied().unwrap_or(0.0);
            let b = input.get((idx + 1) * channels + ch).copied().unwrap_or(a);
            output.push(a * (1.0 - frac) + b * frac);
        }
    }
    output
}

/// Pad or truncate to the expected sample count so chunk lengths (and thus the
/// magnitude denominator) stay uniform across ticks.
fn fit_length(mut data: Vec<f32>, desired: usize) -> Vec<f32> {
    if data.len() > desired {
        data.truncate(desired);
    } else if data.len() < desired {
        let pad = data.last().copied().unwrap_or(0.0);
        data.resize(desired, pad);
    }
    data
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Chunk source that replays a fixed script of chunks and can trip a stop
    /// flag after a given tick.
    pub(crate) struct ScriptedSource {
        chunks: Vec<AudioChunk>,
        cursor: usize,
        pub(crate) requests: Vec<f64>,
        pub(crate) set_flag_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl ScriptedSource {
        pub(crate) fn new(chunks: Vec<AudioChunk>) -> Self {
            Self {
                chunks,
                cursor: 0,
                requests: Vec::new(),
                set_flag_after: None,
            }
        }

        /// Build a mono chunk whose magnitude equals `target` under the shared
        /// norm/len convention: constant amplitude a over n samples yields
        /// sqrt(n*a^2)/n = a/sqrt(n).
        pub(crate) fn chunk_with_magnitude(target: f32, samples: usize) -> AudioChunk {
            let amplitude = target * (samples as f32).sqrt();
            AudioChunk::mono(vec![amplitude; samples])
        }
    }

    impl ChunkSource for ScriptedSource {
        fn record_chunk(&mut self, duration_secs: f64) -> Result<AudioChunk> {
            self.requests.push(duration_secs);
            let chunk = self
                .chunks
                .get(self.cursor)
                .cloned()
                .unwrap_or_else(|| AudioChunk::mono(vec![0.0; 16]));
            self.cursor += 1;
            if let Some((after, flag)) = &self.set_flag_after {
                if self.cursor >= *after {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            Ok(chunk)
        }
    }
}

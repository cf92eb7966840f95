//! Background worker that calibrates, records until silence, and routes the
//! captured audio through the hosted classifier. Keeps the dashboard
//! responsive while guaranteeing exactly one terminal message per session.

use crate::assemble::{self, Assembled};
use crate::audio::{self, CaptureSession, CaptureSignals, Recorder, StopReason};
use crate::classify::TranscriptionClassifier;
use crate::config::CapturePipelineConfig;
use crate::labels::{self, NOT_APPLICABLE, NO_SPEECH_TRANSCRIPT};
use crate::log_debug;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver as EventReceiver, Sender as EventSender};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

/// Capacity of the progress-event channel. Events are dropped, never blocked
/// on, so a stalled renderer cannot stall capture.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Final tuple produced once per session and never mutated afterwards.
/// Sentiment and emotion hold the classifier's trimmed reply (or a sentinel /
/// error marker); normalization onto the canonical taxonomy happens at
/// display and bucketing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub transcript: String,
    pub sentiment: String,
    pub emotion: String,
}

impl ClassificationResult {
    fn no_speech() -> Self {
        Self {
            transcript: NO_SPEECH_TRANSCRIPT.to_string(),
            sentiment: NOT_APPLICABLE.to_string(),
            emotion: NOT_APPLICABLE.to_string(),
        }
    }
}

/// Everything the dashboard needs from a finished session.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: ClassificationResult,
    pub stop_reason: StopReason,
    pub threshold: f32,
    pub captured_secs: f64,
    pub timestamp: String,
}

/// Progress events streamed while the worker runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Calibrated { threshold: f32 },
    ChunkCaptured { elapsed_secs: f64, magnitude: f32 },
    Classifying,
}

/// Terminal message: sent exactly once, immediately before the worker exits.
#[derive(Debug)]
pub enum AnalysisJobMessage {
    Finished(Box<AnalysisOutcome>),
    Failed(String),
}

/// Handle the dashboard polls for progress and completion.
pub struct AnalysisJob {
    pub receiver: mpsc::Receiver<AnalysisJobMessage>,
    pub events: EventReceiver<AnalysisEvent>,
    pub cancel: Arc<AtomicBool>,
    pub handle: Option<thread::JoinHandle<()>>,
}

/// Spawn the worker thread for one full calibrate -> capture -> analyze pass.
/// The returned job owns the one-shot cancel flag the capture loop observes
/// once per chunk tick.
pub fn start_analysis_job(
    recorder: Arc<Mutex<Recorder>>,
    classifier: Option<Arc<dyn TranscriptionClassifier>>,
    cfg: CapturePipelineConfig,
    interrupt: Option<Arc<AtomicBool>>,
) -> AnalysisJob {
    let (tx, rx) = mpsc::channel();
    let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
    let cancel = Arc::new(AtomicBool::new(false));
    let signals = CaptureSignals {
        cancel: Some(cancel.clone()),
        interrupt,
    };

    let handle = thread::spawn(move || {
        let message = match run_session(&recorder, &cfg, &signals, &event_tx) {
            Ok(outcome) => {
                let outcome = classify_session(outcome, classifier.as_deref(), &cfg, &event_tx);
                AnalysisJobMessage::Finished(Box::new(outcome))
            }
            Err(err) => AnalysisJobMessage::Failed(format!("{err:#}")),
        };
        let _ = tx.send(message);
    });

    AnalysisJob {
        receiver: rx,
        events: event_rx,
        cancel,
        handle: Some(handle),
    }
}

struct SessionCapture {
    session: CaptureSession,
    threshold: f32,
}

fn run_session(
    recorder: &Arc<Mutex<Recorder>>,
    cfg: &CapturePipelineConfig,
    signals: &CaptureSignals,
    events: &EventSender<AnalysisEvent>,
) -> Result<SessionCapture> {
    let mut guard = recorder
        .lock()
        .map_err(|_| anyhow!("audio recorder lock poisoned"))?;

    let record_start = Instant::now();
    let threshold = audio::calibrate(&mut *guard, cfg)?;
    let _ = events.try_send(AnalysisEvent::Calibrated { threshold });

    let session = audio::run_capture(&mut *guard, cfg, threshold, signals, |elapsed, volume| {
        let _ = events.try_send(AnalysisEvent::ChunkCaptured {
            elapsed_secs: elapsed,
            magnitude: volume,
        });
    })?;
    log_debug(&format!(
        "session|record_s={:.2}|reason={}",
        record_start.elapsed().as_secs_f64(),
        session.stop_reason.label()
    ));

    Ok(SessionCapture { session, threshold })
}

fn classify_session(
    capture: SessionCapture,
    classifier: Option<&dyn TranscriptionClassifier>,
    cfg: &CapturePipelineConfig,
    events: &EventSender<AnalysisEvent>,
) -> AnalysisOutcome {
    let _ = events.try_send(AnalysisEvent::Classifying);
    let result = analyze_session(&capture.session, cfg, classifier);
    AnalysisOutcome {
        result,
        stop_reason: capture.session.stop_reason,
        threshold: capture.threshold,
        captured_secs: capture.session.elapsed_secs,
        timestamp: current_timestamp(),
    }
}

/// Row timestamps in the table's `%Y-%m-%d %H:%M:%S` format.
pub fn current_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Turn one capture session into its final result tuple.
///
/// Pure with respect to its inputs: the session, configuration, and
/// classifier fully determine the outcome. Silence-terminated or empty
/// sessions short-circuit to the no-speech sentinel without any network call;
/// classifier faults degrade to field-level error markers so one bad call
/// never discards an otherwise-valid transcript.
pub fn analyze_session(
    session: &CaptureSession,
    cfg: &CapturePipelineConfig,
    classifier: Option<&dyn TranscriptionClassifier>,
) -> ClassificationResult {
    if session.stop_reason == StopReason::SilenceDetected {
        return ClassificationResult::no_speech();
    }

    let assembled = assemble::assemble(
        &session.chunks,
        session.stop_reason,
        cfg.silence_limit,
        cfg.sample_rate,
    );
    let pcm = match assembled {
        Assembled::Empty => return ClassificationResult::no_speech(),
        Assembled::Pcm(pcm) => pcm,
    };

    let Some(classifier) = classifier else {
        return ClassificationResult {
            transcript: error_marker("transcription", "classifier unavailable (no API key)"),
            sentiment: NOT_APPLICABLE.to_string(),
            emotion: NOT_APPLICABLE.to_string(),
        };
    };

    let wav = match pcm.wav_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            return ClassificationResult {
                transcript: error_marker("transcription", &format!("{err:#}")),
                sentiment: NOT_APPLICABLE.to_string(),
                emotion: NOT_APPLICABLE.to_string(),
            }
        }
    };

    let transcript = match classifier.transcribe(&wav) {
        Ok(text) => text,
        Err(err) => {
            log_debug(&format!("transcription failed: {err:#}"));
            return ClassificationResult {
                transcript: error_marker("transcription", &format!("{err:#}")),
                sentiment: NOT_APPLICABLE.to_string(),
                emotion: NOT_APPLICABLE.to_string(),
            };
        }
    };

    if labels::transcript_is_empty(&transcript) {
        return ClassificationResult::no_speech();
    }

    // Each classification is independent; a sentiment fault must not block
    // the emotion call.
    let sentiment = classify_label(classifier, &transcript, labels::LabelDomain::Sentiment);
    let emotion = classify_label(classifier, &transcript, labels::LabelDomain::Emotion);

    ClassificationResult {
        transcript,
        sentiment,
        emotion,
    }
}

fn classify_label(
    classifier: &dyn TranscriptionClassifier,
    transcript: &str,
    domain: labels::LabelDomain,
) -> String {
    let field = match domain {
        labels::LabelDomain::Sentiment => "sentiment",
        labels::LabelDomain::Emotion => "emotion",
    };
    match classifier.classify(transcript, domain.canonical(), domain.system_instruction()) {
        Ok(reply) => reply.trim().to_string(),
        Err(err) => {
            log_debug(&format!("{field} classification failed: {err:#}"));
            error_marker(field, &format!("{err:#}"))
        }
    }
}

fn error_marker(field: &str, cause: &str) -> String {
    // Single-line markers keep the sink's row shape intact.
    let cause = cause.replace('\n', " ");
    format!("[{field} error: {cause}]")
}

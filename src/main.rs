use anyhow::{Context, Result};
use clap::Parser;
use sentivox::{
    analysis, audio,
    audio::{CaptureSignals, Recorder},
    classify::{GroqClient, TranscriptionClassifier},
    config::AppConfig,
    crm,
    doctor::base_doctor_report,
    init_debug_log_file, log_debug, log_file_path,
    sink::{ResultSink, TableFileSink, RESULT_HEADERS},
    ui, App,
};
use std::env;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(not(test))]
fn main() -> Result<()> {
    run_with_args(env::args_os())
}

#[cfg_attr(test, allow(dead_code))]
fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut config = AppConfig::parse_from(args);
    if config.doctor {
        let report = base_doctor_report(&config);
        println!("{}", report.render());
        return Ok(());
    }

    if config.list_input_devices {
        let output = list_input_devices()?;
        print!("{output}");
        return Ok(());
    }

    config.validate()?;
    init_debug_log_file();
    log_debug("=== Sentivox started ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    if config.seed_crm {
        let sink = TableFileSink::new(&config.crm_file);
        let seeded = crm::seed_demo_customers(&sink)?;
        if seeded == 0 {
            println!("CRM table already has customers; nothing seeded.");
        } else {
            println!("Seeded {seeded} demo customers into {}.", config.crm_file.display());
        }
        return Ok(());
    }

    if config.once {
        return run_once(&config);
    }

    let mut app = App::new(config);
    let result = ui::run_app(&mut app);

    log_debug("=== Sentivox exiting ===");
    if let Err(ref e) = result {
        log_debug(&format!("Exit with error: {e:#}"));
    }

    result
}

/// One headless calibrate -> capture -> analyze -> save cycle. Ctrl-C while
/// recording becomes the operator-interrupt stop reason instead of killing
/// the run.
fn run_once(config: &AppConfig) -> Result<()> {
    let cfg = config.capture_pipeline_config();

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("failed to install interrupt handler")?;

    println!(
        "Assistant started (max {}s, stops after {} quiet chunks)",
        cfg.max_session_secs, cfg.silence_limit
    );
    println!(
        "Calibrating... stay quiet for {:.0}s...",
        cfg.calibration_secs
    );

    let mut recorder = Recorder::new(config.input_device.as_deref(), &cfg)?;
    let threshold = audio::calibrate(&mut recorder, &cfg)?;
    println!("Calibration done. Threshold={threshold:.6}");

    let signals = CaptureSignals {
        cancel: None,
        interrupt: Some(interrupt),
    };
    let record_start = std::time::Instant::now();
    let session = audio::run_capture(&mut recorder, &cfg, threshold, &signals, |elapsed, volume| {
        print!("\r{elapsed:>4.0}s | volume {volume:.6}  ");
        let _ = io::stdout().flush();
    })?;
    let record_elapsed = record_start.elapsed().as_secs_f64();
    println!("\nRecording stopped: {}", session.stop_reason.label());

    let client = match GroqClient::from_config(config) {
        Ok(client) => Some(client),
        Err(err) => {
            eprintln!("Classifier unavailable: {err:#}");
            None
        }
    };
    let classifier = client.as_ref().map(|c| c as &dyn TranscriptionClassifier);
    let analyze_start = std::time::Instant::now();
    let result = analysis::analyze_session(&session, &cfg, classifier);
    if config.log_timings {
        log_debug(&format!(
            "timing|phase=once|record_s={:.3}|analyze_s={:.3}|chars={}",
            record_elapsed,
            analyze_start.elapsed().as_secs_f64(),
            result.transcript.len()
        ));
    }
    let timestamp = analysis::current_timestamp();

    let sink = TableFileSink::new(&config.results_file);
    sink.ensure_header_row(&RESULT_HEADERS)?;
    sink.append_row(&[
        timestamp,
        result.transcript.clone(),
        result.sentiment.clone(),
        result.emotion.clone(),
        session.stop_reason.label().to_string(),
    ])?;

    println!("Transcript: {}", result.transcript);
    println!(
        "Sentiment: {} | Emotion: {}",
        result.sentiment, result.emotion
    );
    println!("Results saved to {}", config.results_file.display());
    Ok(())
}

fn list_input_devices() -> Result<String> {
    let devices = if let Ok(raw) = env::var("SENTIVOX_TEST_DEVICES") {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        }
    } else {
        Recorder::list_devices()?
    };
    let mut output = String::new();
    if devices.is_empty() {
        output.push_str("No audio input devices detected.\n");
    } else {
        output.push_str("Available audio input devices:\n");
        for name in devices {
            output.push_str(&format!("  - {name}\n"));
        }
    }
    Ok(output)
}

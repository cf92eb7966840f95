//! Environment diagnostics behind `--doctor`: everything a user needs to see
//! before blaming the microphone, the API, or the terminal.

use crate::{audio::Recorder, config::AppConfig, log_file_path, sink::TableFileSink};
use crate::sink::ResultSink;
use crossterm::terminal::size as terminal_size;
use std::{env, fmt::Display, path::Path};

pub struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

pub fn base_doctor_report(config: &AppConfig) -> DoctorReport {
    let mut report = DoctorReport::new("Sentivox Doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", env::consts::OS, env::consts::ARCH));

    report.section("Terminal");
    match terminal_size() {
        Ok((cols, rows)) => report.push_kv("size", format!("{cols}x{rows}")),
        Err(err) => report.push_kv("size", format!("error: {err}")),
    }
    if let Ok(term) = env::var("TERM") {
        report.push_kv("term", term);
    }

    report.section("Config");
    let mut validated = config.clone();
    match validated.validate() {
        Ok(()) => report.push_kv("validation", "ok"),
        Err(err) => report.push_kv("validation", format!("error: {err}")),
    }
    report.push_kv(
        "capture",
        format!(
            "{} Hz, {} ch, {}s chunks, silence limit {}, max {}s",
            config.sample_rate,
            config.channels,
            config.chunk_secs,
            config.silence_limit,
            config.max_session_secs
        ),
    );
    report.push_kv("log_file", log_file_path().display());

    report.section("API");
    let key_state = match config.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => "present",
        _ => "missing (set GROQ_API_KEY)",
    };
    report.push_kv("api_key", key_state);
    report.push_kv("api_base", &config.api_base);
    report.push_kv("transcription_model", &config.transcription_model);
    report.push_kv("classification_model", &config.classification_model);

    report.section("Audio input");
    match Recorder::list_devices() {
        Ok(devices) if devices.is_empty() => report.push_kv("devices", "none detected"),
        Ok(devices) => {
            report.push_kv("devices", devices.len());
            for name in devices {
                report.push_line(format!("    - {name}"));
            }
        }
        Err(err) => report.push_kv("devices", format!("error: {err:#}")),
    }
    if let Some(device) = &config.input_device {
        report.push_kv("preferred", device);
    }

    report.section("Tables");
    for (label, path) in [
        ("results", config.results_file.as_path()),
        ("crm", config.crm_file.as_path()),
        ("summaries", config.summaries_file.as_path()),
    ] {
        report.push_kv(label, describe_table(path));
    }

    report
}

fn describe_table(path: &Path) -> String {
    if !path.exists() {
        return format!("{} (not created yet)", path.display());
    }
    let sink = TableFileSink::new(path);
    match sink.rows() {
        Ok(rows) => format!(
            "{} ({} data rows)",
            path.display(),
            rows.len().saturating_sub(1)
        ),
        Err(err) => format!("{} (unreadable: {err:#})", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn report_renders_required_sections() {
        let config = AppConfig::parse_from(["sentivox-tests"]);
        let report = base_doctor_report(&config);
        let rendered = report.render();
        assert!(rendered.starts_with("Sentivox Doctor"));
        for section in ["Terminal:", "Config:", "API:", "Audio input:", "Tables:"] {
            assert!(rendered.contains(section), "missing section {section}");
        }
    }

    #[test]
    fn api_key_presence_is_reported_without_the_key() {
        let mut config = AppConfig::parse_from(["sentivox-tests"]);
        config.api_key = Some("secret-key".into());
        let rendered = base_doctor_report(&config).render();
        assert!(rendered.contains("api_key: present"));
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn missing_api_key_points_at_the_env_var() {
        let mut config = AppConfig::parse_from(["sentivox-tests"]);
        config.api_key = None;
        let rendered = base_doctor_report(&config).render();
        assert!(rendered.contains("GROQ_API_KEY"));
    }
}

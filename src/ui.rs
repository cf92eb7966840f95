//! Full-screen `ratatui` dashboard: Record, History, and Analytics tabs over
//! the shared `App` state.

use crate::app::{App, Tab};
use crate::labels::LabelDomain;
use crate::log_debug;
use anyhow::Result;
use crossterm::event;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{BarChart, Block, BorderType, Borders, Cell, Paragraph, Row, Table, Wrap},
    Terminal,
};
use std::io;
use std::time::Duration;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

// Theme colors - deep teal accent.
const BORDER_COLOR: Color = Color::Rgb(64, 180, 170);
const TITLE_COLOR: Color = Color::Rgb(90, 210, 200);
const DIM_BORDER: Color = Color::Rgb(50, 100, 95);
const BODY_TEXT: Color = Color::Rgb(210, 210, 205);
const STATUS_TEXT: Color = Color::Rgb(150, 160, 155);
const POSITIVE_COLOR: Color = Color::Rgb(110, 200, 120);
const NEGATIVE_COLOR: Color = Color::Rgb(220, 110, 110);
const NEUTRAL_COLOR: Color = Color::Rgb(180, 180, 180);

/// Configure the terminal, run the drawing loop, and tear everything down.
pub fn run_app(app: &mut App) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = app_loop(&mut terminal, app);

    drop(terminal);
    let _ = disable_raw_mode();
    let _ = crossterm::execute!(io::stdout(), LeaveAlternateScreen);

    result
}

/// Core event/render loop: poll the worker, then block on terminal events
/// with a refresh timeout so progress updates render without busy-sleeping.
fn app_loop(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    terminal.draw(|frame| draw(frame, app))?;

    loop {
        app.poll_analysis_job()?;

        let poll_duration = if app.is_recording() {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(250)
        };

        let mut should_draw = app.take_redraw_request() || app.is_recording();
        let mut should_quit = false;

        if event::poll(poll_duration)? {
            match event::read()? {
                Event::Key(key) => {
                    should_quit = handle_key_event(app, key)?;
                    should_draw = true;
                }
                Event::Resize(_, _) => {
                    should_draw = true;
                }
                _ => {}
            }
        }

        if should_draw {
            terminal.draw(|frame| draw(frame, app))?;
        }

        if should_quit {
            break;
        }
    }
    Ok(())
}

/// Interpret keystrokes into modifications to the shared `App` state.
/// Returns true when the app should quit.
pub(crate) fn handle_key_event(app: &mut App, key: KeyEvent) -> Result<bool> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Ok(true);
    }

    match key.code {
        KeyCode::Char('q') => return Ok(true),
        KeyCode::Tab => app.next_tab(),
        KeyCode::BackTab => app.prev_tab(),
        KeyCode::Char('1') => app.select_tab(Tab::Record),
        KeyCode::Char('2') => app.select_tab(Tab::History),
        KeyCode::Char('3') => app.select_tab(Tab::Analytics),
        KeyCode::Char('r') => {
            if let Err(err) = app.toggle_recording() {
                log_debug(&format!("recording toggle failed: {err:#}"));
            }
        }
        KeyCode::Char('s') => {
            if let Err(err) = app.save_last_result() {
                log_debug(&format!("save failed: {err:#}"));
            }
        }
        KeyCode::Char('c') => app.cycle_customer(),
        KeyCode::Char('h') => {
            if let Err(err) = app.reload_history() {
                log_debug(&format!("history refresh failed: {err:#}"));
            }
        }
        _ => {}
    }

    Ok(false)
}

/// Render the tab bar, the active view, and the status line.
pub fn draw(frame: &mut ratatui::Frame<'_>, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_tab_bar(frame, app, chunks[0]);
    match app.tab() {
        Tab::Record => draw_record_tab(frame, app, chunks[1]),
        Tab::History => draw_history_tab(frame, app, chunks[1]),
        Tab::Analytics => draw_analytics_tab(frame, app, chunks[1]),
    }
    draw_status_bar(frame, app, chunks[2]);
}

fn titled_block(title: &str, active: bool) -> Block<'_> {
    let border = if active { BORDER_COLOR } else { DIM_BORDER };
    Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border))
        .title(Span::styled(
            format!(" {title} "),
            Style::default().fg(TITLE_COLOR).add_modifier(Modifier::BOLD),
        ))
}

fn draw_tab_bar(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let mut spans = Vec::new();
    for (i, tab) in Tab::ALL.iter().enumerate() {
        let style = if *tab == app.tab() {
            Style::default().fg(TITLE_COLOR).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(STATUS_TEXT)
        };
        spans.push(Span::styled(format!(" {} {} ", i + 1, tab.title()), style));
        spans.push(Span::raw(" "));
    }
    let bar = Paragraph::new(Line::from(spans)).block(titled_block("Sentivox", true));
    frame.render_widget(bar, area);
}

fn draw_status_bar(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let hints = "r record/stop  s save  c customer  h refresh  1/2/3 tabs  q quit";
    let line = format!("{}  |  {}", app.status_text(), hints);
    let status = Paragraph::new(line)
        .block(titled_block("Status", false))
        .style(Style::default().fg(STATUS_TEXT));
    frame.render_widget(status, area);
}

fn draw_record_tab(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    draw_recorder_panel(frame, app, columns[0]);
    draw_result_panel(frame, app, columns[1]);
}

fn draw_recorder_panel(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let cfg = app.config();
    let live = app.live();
    let mut lines = vec![
        Line::from(format!(
            "Sample rate: {} Hz | Channels: {} | Silence limit: {} chunks",
            cfg.sample_rate, cfg.channels, cfg.silence_limit
        )),
        Line::from(""),
    ];

    if app.is_recording() {
        match live.threshold {
            Some(threshold) if !live.classifying => {
                lines.push(Line::from(format!("Threshold: {threshold:.6}")));
                lines.push(Line::from(format!(
                    "Recording: {:>4.0}s | volume {:.6}",
                    live.elapsed_secs, live.magnitude
                )));
            }
            Some(_) => lines.push(Line::from("Analyzing captured audio...")),
            None => lines.push(Line::from("Calibrating... stay quiet.")),
        }
    } else {
        lines.push(Line::from("Idle. Press r to start a session."));
        if let Some(outcome) = app.last_outcome() {
            lines.push(Line::from(format!(
                "Last session: {:.0}s, stopped by {}",
                outcome.captured_secs,
                outcome.stop_reason.label()
            )));
        }
    }

    lines.push(Line::from(""));
    match app.selected_customer() {
        Some(customer) => {
            lines.push(Line::from(Span::styled(
                format!("Customer: {}", customer.display_label()),
                Style::default().add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(format!(
                "{} | budget {} | interest {}",
                customer.industry, customer.budget, customer.interest_level
            )));
            lines.push(Line::from(format!(
                "{} | {}",
                customer.email, customer.phone
            )));
            let ranked = app.ranked_products();
            if ranked.is_empty() {
                lines.push(Line::from("No recommendations on file."));
            } else {
                lines.push(Line::from("Recommended products:"));
                for product in ranked {
                    lines.push(Line::from(format!("  - {product}")));
                }
            }
        }
        None => {
            lines.push(Line::from(format!(
                "No customer selected ({} on file, press c).",
                app.customers().len()
            )));
        }
    }

    let panel = Paragraph::new(Text::from(lines))
        .block(titled_block("Voice Recorder", app.is_recording()))
        .style(Style::default().fg(BODY_TEXT))
        .wrap(Wrap { trim: false });
    frame.render_widget(panel, area);
}

fn sentiment_color(label: &str) -> Color {
    let lowered = label.to_lowercase();
    if lowered.contains("pos") {
        POSITIVE_COLOR
    } else if lowered.contains("neg") {
        NEGATIVE_COLOR
    } else {
        NEUTRAL_COLOR
    }
}

fn draw_result_panel(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let mut lines = Vec::new();
    match app.last_outcome() {
        Some(outcome) => {
            lines.push(Line::from(Span::styled(
                "Transcript",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(clip_line(&outcome.result.transcript, 400)));
            lines.push(Line::from(""));
            if let Some((sentiment, emotion)) = app.badge_labels() {
                lines.push(Line::from(vec![
                    Span::raw("Sentiment: "),
                    Span::styled(
                        sentiment.clone(),
                        Style::default()
                            .fg(sentiment_color(&sentiment))
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::raw("   Emotion: "),
                    Span::styled(emotion, Style::default().add_modifier(Modifier::BOLD)),
                ]));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(format!(
                "Stop reason: {}",
                outcome.stop_reason.label()
            )));
            lines.push(Line::from(if app.last_saved() {
                "Saved."
            } else {
                "Not saved yet; press s to save."
            }));
        }
        None => {
            lines.push(Line::from("Waiting for a recording..."));
        }
    }

    let panel = Paragraph::new(Text::from(lines))
        .block(titled_block("Analysis Results", false))
        .style(Style::default().fg(BODY_TEXT))
        .wrap(Wrap { trim: false });
    frame.render_widget(panel, area);
}

fn draw_history_tab(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let header = Row::new(
        ["Timestamp", "Transcript", "Sentiment", "Emotion", "Stop reason"]
            .map(|title| Cell::from(Span::styled(title, Style::default().fg(TITLE_COLOR)))),
    );

    let rows: Vec<Row> = app
        .history()
        .iter()
        .map(|row| {
            let cell = |i: usize, max: usize| {
                Cell::from(clip_line(row.get(i).map(String::as_str).unwrap_or(""), max))
            };
            Row::new(vec![cell(0, 19), cell(1, 60), cell(2, 18), cell(3, 18), cell(4, 24)])
        })
        .collect();

    let empty = rows.is_empty();
    let table = Table::new(
        rows,
        [
            Constraint::Length(19),
            Constraint::Min(30),
            Constraint::Length(18),
            Constraint::Length(18),
            Constraint::Length(24),
        ],
    )
    .header(header)
    .block(titled_block("Recording History (newest first)", true))
    .style(Style::default().fg(BODY_TEXT));
    frame.render_widget(table, area);

    if empty {
        let hint = Paragraph::new("No rows yet. Save a session to populate history.")
            .style(Style::default().fg(STATUS_TEXT));
        let inner = Rect {
            x: area.x + 2,
            y: area.y + 2,
            width: area.width.saturating_sub(4),
            height: 1,
        };
        if inner.width > 0 && area.height > 3 {
            frame.render_widget(hint, inner);
        }
    }
}

fn draw_analytics_tab(frame: &mut ratatui::Frame<'_>, app: &App, area: Rect) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(5)])
        .split(area);

    let total = Paragraph::new(format!("Total recordings: {}", app.history().len()))
        .block(titled_block("Analytics", true))
        .style(Style::default().fg(BODY_TEXT));
    frame.render_widget(total, rows[0]);

    let charts = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[1]);

    draw_distribution(
        frame,
        charts[0],
        "Sentiment Distribution",
        app.label_counts(LabelDomain::Sentiment),
    );
    draw_distribution(
        frame,
        charts[1],
        "Emotion Distribution",
        app.label_counts(LabelDomain::Emotion),
    );
}

fn draw_distribution(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    title: &str,
    counts: Vec<(String, u64)>,
) {
    if counts.is_empty() {
        let hint = Paragraph::new("No data yet.")
            .block(titled_block(title, false))
            .style(Style::default().fg(STATUS_TEXT));
        frame.render_widget(hint, area);
        return;
    }

    let data: Vec<(&str, u64)> = counts
        .iter()
        .map(|(label, count)| (label.as_str(), *count))
        .collect();
    let chart = BarChart::default()
        .block(titled_block(title, false))
        .bar_width(9)
        .bar_gap(2)
        .bar_style(Style::default().fg(BORDER_COLOR))
        .value_style(Style::default().fg(BODY_TEXT).add_modifier(Modifier::BOLD))
        .label_style(Style::default().fg(STATUS_TEXT))
        .data(&data);
    frame.render_widget(chart, area);
}

/// Clamp a cell to a display width, appending an ellipsis when content was
/// cut. Width-aware so wide glyphs cannot push the table out of shape.
fn clip_line(text: &str, max_width: usize) -> String {
    let flattened = text.replace(['\n', '\r'], " ");
    if UnicodeWidthStr::width(flattened.as_str()) <= max_width {
        return flattened;
    }
    let mut out = String::new();
    let mut width = 0usize;
    for ch in flattened.chars() {
        let ch_width = ch.width().unwrap_or(0);
        if width + ch_width > max_width.saturating_sub(1) {
            break;
        }
        width += ch_width;
        out.push(ch);
    }
    out.push('…');
    out
}

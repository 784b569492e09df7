use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use pingwatch_core::{DeviceId, DeviceStatus, Health, MonitorRegistry};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, Paragraph};
use ratatui::Terminal;

struct LatencySeries {
    last_record_id: u64,
    points: VecDeque<(f64, f64)>,
}

impl LatencySeries {
    fn new() -> Self {
        Self {
            last_record_id: 0,
            points: VecDeque::new(),
        }
    }

    fn push(&mut self, x: f64, y: f64, window_sec: f64) {
        self.points.push_back((x, y));
        while let Some((old_x, _)) = self.points.front() {
            if x - old_x > window_sec {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    fn bounds(&self) -> [f64; 2] {
        let max = self.points.iter().map(|(_, y)| *y).fold(0.0_f64, f64::max);
        if max <= f64::EPSILON {
            [0.0, 1.0]
        } else {
            [0.0, max * 1.15]
        }
    }
}

struct ViewerState {
    start: Instant,
    statuses: Vec<DeviceStatus>,
    series: HashMap<DeviceId, LatencySeries>,
    selected: usize,
    error: Option<String>,
}

impl ViewerState {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            statuses: Vec::new(),
            series: HashMap::new(),
            selected: 0,
            error: None,
        }
    }

    fn update(&mut self, statuses: Vec<DeviceStatus>, window_sec: f64) {
        let t = self.start.elapsed().as_secs_f64();
        for status in &statuses {
            let Some(record) = &status.last_record else {
                continue;
            };
            let series = self.series.entry(status.device.id).or_insert_with(LatencySeries::new);
            if record.id == series.last_record_id {
                continue;
            }
            series.last_record_id = record.id;
            // a down probe plots as zero so outages show up as gaps to the floor
            series.push(t, record.latency_ms().unwrap_or(0.0), window_sec);
        }
        self.statuses = statuses;
        self.error = None;
        if self.selected >= self.statuses.len() {
            self.selected = self.statuses.len().saturating_sub(1);
        }
    }

    fn select_next(&mut self) {
        if self.selected + 1 < self.statuses.len() {
            self.selected += 1;
        }
    }

    fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }
}

pub async fn run_viewer(registry: &MonitorRegistry, refresh: Duration, window_sec: f64) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = ViewerState::new();
    let mut next_tick = Instant::now();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Down | KeyCode::Char('j') => state.select_next(),
                        KeyCode::Up | KeyCode::Char('k') => state.select_prev(),
                        _ => {}
                    }
                }
            }

            if Instant::now() >= next_tick {
                match registry.current_status().await {
                    Ok(view) => state.update(view.into_values().collect(), window_sec),
                    Err(err) => state.error = Some(err.to_string()),
                }
                next_tick = Instant::now() + refresh;
            }

            terminal.draw(|frame| draw_ui(frame.size(), frame, &state, window_sec))?;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, state: &ViewerState, window_sec: f64) {
    let list_height = (state.statuses.len() as u16).saturating_add(2).min(area.height / 2).max(3);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(list_height),
            Constraint::Min(0),
        ])
        .split(area);

    frame.render_widget(render_header(state, window_sec), rows[0]);
    frame.render_widget(render_device_list(state), rows[1]);

    match state.statuses.get(state.selected) {
        Some(status) => render_latency_chart(frame, rows[2], status, state, window_sec),
        None => frame.render_widget(Paragraph::new(Line::from(" ")), rows[2]),
    }
}

fn health_color(health: Health) -> Color {
    match health {
        Health::Up => Color::Green,
        Health::Down => Color::Red,
        Health::Unknown => Color::DarkGray,
    }
}

fn render_header(state: &ViewerState, window_sec: f64) -> Paragraph<'static> {
    let count = |h: Health| state.statuses.iter().filter(|s| s.health() == h).count();
    let mut lines = vec![Line::from(vec![
        Span::styled("pingwatch  ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::styled(format!("up={} ", count(Health::Up)), Style::default().fg(Color::Green)),
        Span::styled(format!("down={} ", count(Health::Down)), Style::default().fg(Color::Red)),
        Span::raw(format!(
            "no data={}  window={}s  (up/down to select, 'q' to quit)",
            count(Health::Unknown),
            window_sec as u64
        )),
    ])];
    if let Some(err) = &state.error {
        lines.push(Line::from(Span::styled(
            format!("status unavailable: {err}"),
            Style::default().fg(Color::Yellow),
        )));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"))
}

fn render_device_list(state: &ViewerState) -> Paragraph<'static> {
    let lines: Vec<Line> = state
        .statuses
        .iter()
        .enumerate()
        .map(|(idx, status)| {
            let health = status.health();
            let (latency, seen) = match &status.last_record {
                Some(record) => (
                    record
                        .latency_ms()
                        .map(|ms| format!("{ms:.1}ms"))
                        .unwrap_or_else(|| "-".to_string()),
                    record.timestamp.with_timezone(&Local).format("%H:%M:%S").to_string(),
                ),
                None => ("-".to_string(), "no data".to_string()),
            };
            let marker = if idx == state.selected { "> " } else { "  " };
            let mut style = Style::default();
            if idx == state.selected {
                style = style.add_modifier(Modifier::BOLD);
            }
            Line::from(vec![
                Span::styled(marker.to_string(), style),
                Span::styled(format!("{:<8}", health.as_str()), Style::default().fg(health_color(health))),
                Span::styled(
                    format!(
                        "{:<24} {:<20} {:>9}  {}{}",
                        status.device.display_name,
                        status.device.address,
                        latency,
                        seen,
                        if status.monitored { "" } else { "  (not monitored)" }
                    ),
                    style,
                ),
            ])
        })
        .collect();

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Devices"))
}

fn render_latency_chart(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    status: &DeviceStatus,
    state: &ViewerState,
    window_sec: f64,
) {
    let now_sec = state.start.elapsed().as_secs_f64();
    let empty = LatencySeries::new();
    let series = state.series.get(&status.device.id).unwrap_or(&empty);
    let points: Vec<(f64, f64)> = series.points.iter().copied().collect();

    let x_min = (now_sec - window_sec).max(0.0);
    let x_max = now_sec.max(window_sec);
    let y_bounds = series.bounds();
    let title = format!("{} latency (ms)", status.device.display_name);

    let dataset = Dataset::default()
        .name(status.device.address.clone())
        .marker(symbols::Marker::Braille)
        .graph_type(ratatui::widgets::GraphType::Line)
        .style(Style::default().fg(health_color(status.health())))
        .data(&points);

    let x_mid = (x_min + x_max) / 2.0;

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title("time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([x_min, x_max])
                .labels(vec![
                    Span::raw(format!("{x_min:.0}")),
                    Span::raw(format!("{x_mid:.0}")),
                    Span::raw(format!("{x_max:.0}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("ms")
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(vec![
                    Span::raw(format!("{:.1}", y_bounds[0])),
                    Span::raw(format!("{:.1}", (y_bounds[0] + y_bounds[1]) / 2.0)),
                    Span::raw(format!("{:.1}", y_bounds[1])),
                ]),
        );

    frame.render_widget(chart, area);
}

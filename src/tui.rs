use anyhow::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    text::Line,
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap},
};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::analysis::{self, RESULTS_FILE};
use crate::analyzer::AnalysisRun;
use crate::presets::Preset;
use crate::report::{format_market_cap, intensity};
use crate::storage_utils::{AppConfig, AsyncStorageManager};

const MAX_ROWS: usize = 200;

// --- App State ---

struct App {
    config: AppConfig,
    run: Option<AnalysisRun>,
    selected_preset: usize,
    is_refreshing: bool,
    last_error: Option<String>,
}

impl App {
    fn new(config: AppConfig, run: Option<AnalysisRun>) -> Self {
        let current = Preset::parse_lenient(&config.preset);
        let selected_preset = Preset::ALL.iter().position(|p| *p == current).unwrap_or(0);
        Self {
            config,
            run,
            selected_preset,
            is_refreshing: false,
            last_error: None,
        }
    }

    fn preset(&self) -> Preset {
        Preset::ALL[self.selected_preset % Preset::ALL.len()]
    }

    /// Config for the next run, using the preset picked in the sidebar.
    fn run_config(&self) -> AppConfig {
        AppConfig {
            preset: self.preset().name().to_string(),
            ..self.config.clone()
        }
    }

    fn finish_refresh(&mut self, result: Result<AnalysisRun>) {
        self.is_refreshing = false;
        match result {
            Ok(run) => {
                self.run = Some(run);
                self.last_error = None;
            }
            Err(e) => self.last_error = Some(format!("{e:#}")),
        }
    }
}

// --- TUI ---

pub async fn run_tui(config: AppConfig) -> Result<()> {
    let storage = AsyncStorageManager::new_relative("storage").await?;
    let saved = match storage.load_optional::<AnalysisRun>(RESULTS_FILE).await {
        Ok(run) => run,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable saved results");
            None
        }
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, App::new(config, saved)).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    res
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, mut app: App) -> Result<()> {
    let (run_tx, mut run_rx) = mpsc::channel::<Result<AnalysisRun>>(1);

    loop {
        terminal.draw(|f| ui(f, &app))?;

        if let Ok(result) = run_rx.try_recv() {
            app.finish_refresh(result);
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && !handle_key_event(key, &mut app, &run_tx) {
                    return Ok(());
                }
            }
        }
    }
}

async fn refresh(config: AppConfig) -> Result<AnalysisRun> {
    let storage = AsyncStorageManager::new_relative("storage").await?;
    analysis::run_analysis_pipeline(&config, &storage).await
}

fn spawn_refresh(config: AppConfig, tx: mpsc::Sender<Result<AnalysisRun>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = refresh(config).await;
        if tx.send(result).await.is_err() {
            tracing::debug!("dashboard closed before the refresh finished");
        }
    })
}

/// Returns `false` when the user asked to quit.
fn handle_key_event(key: KeyEvent, app: &mut App, tx: &mpsc::Sender<Result<AnalysisRun>>) -> bool {
    let count = Preset::ALL.len();
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return false,
        KeyCode::F(5) if !app.is_refreshing => {
            app.is_refreshing = true;
            app.last_error = None;
            spawn_refresh(app.run_config(), tx.clone());
        }
        KeyCode::Up => app.selected_preset = app.selected_preset.checked_sub(1).unwrap_or(count - 1),
        KeyCode::Down => app.selected_preset = (app.selected_preset + 1) % count,
        KeyCode::Char(c) => {
            if let Some(digit) = c.to_digit(10) {
                if (1..=count as u32).contains(&digit) {
                    app.selected_preset = (digit - 1) as usize;
                }
            }
        }
        _ => {}
    }
    true
}

fn preset_details(preset: Preset) -> Vec<Line<'static>> {
    let c = preset.config();
    vec![
        Line::from(preset.blurb()).style(Style::default().fg(Color::DarkGray)),
        Line::from(""),
        Line::from(format!("Workers:     {}", c.max_workers)),
        Line::from(format!("Batch size:  {}", c.batch_size)),
        Line::from(format!("Delay:       {}", c.delay_range)),
        Line::from(format!("Batch pause: {}", c.inter_batch_delay)),
        Line::from(format!("Retries:     {}", c.max_retries)),
        Line::from(format!("~{:.1} min / 1000", c.estimated_minutes_per_1000())),
    ]
}

fn run_title(run: Option<&AnalysisRun>) -> String {
    match run {
        None => "No saved results".to_string(),
        Some(run) => format!(
            "{} | {} universe | {} | flagged {} of {} analyzed ({} failed) at <= {:.1}%",
            run.started_at.format("%d-%m-%Y %H:%M:%S"),
            run.universe,
            run.preset,
            run.summary.flagged,
            run.summary.analyzed,
            run.summary.failed(),
            run.drop_threshold,
        ),
    }
}

fn ui(f: &mut Frame, app: &App) {
    let main_layout = Layout::horizontal([Constraint::Length(28), Constraint::Min(0)]).split(f.size());
    let right_chunks = Layout::vertical([Constraint::Length(3), Constraint::Min(0)]).split(main_layout[1]);

    // Sidebar: preset picker and details
    let sidebar_block = Block::default()
        .borders(Borders::ALL)
        .title("Rate limit preset")
        .title_alignment(Alignment::Center);
    let inner_sidebar_area = sidebar_block.inner(main_layout[0]);
    f.render_widget(sidebar_block, main_layout[0]);

    let sidebar_chunks = Layout::vertical([
        Constraint::Length(Preset::ALL.len() as u16 + 1),
        Constraint::Min(1),
        Constraint::Length(2),
    ])
    .split(inner_sidebar_area);

    let preset_lines: Vec<Line> = Preset::ALL
        .iter()
        .enumerate()
        .map(|(i, preset)| {
            let line = Line::from(format!("{}. {}", i + 1, preset.name()));
            if i == app.selected_preset {
                line.style(Style::default().fg(Color::Yellow).bg(Color::DarkGray))
            } else {
                line
            }
        })
        .collect();
    f.render_widget(Paragraph::new(preset_lines), sidebar_chunks[0]);
    f.render_widget(
        Paragraph::new(preset_details(app.preset())).wrap(Wrap { trim: false }),
        sidebar_chunks[1],
    );
    f.render_widget(
        Paragraph::new("F5 run analysis\nq quit").alignment(Alignment::Center),
        sidebar_chunks[2],
    );

    f.render_widget(
        Block::default()
            .borders(Borders::ALL)
            .title_alignment(Alignment::Center)
            .title(run_title(app.run.as_ref())),
        right_chunks[0],
    );

    let header = Row::new([
        Cell::from("Rank"),
        Cell::from("Symbol"),
        Cell::from("Company"),
        Cell::from("Sector"),
        Cell::from("Change"),
        Cell::from("Price"),
        Cell::from("Mkt Cap"),
        Cell::from("From High"),
        Cell::from("RSI"),
    ])
    .style(Style::default().bg(Color::DarkGray));

    let records = app.run.as_ref().map_or(&[][..], |r| r.records.as_slice());
    let worst = records.first().map_or(0.0, |r| r.percent_change);
    let rows = records.iter().take(MAX_ROWS).enumerate().map(|(i, record)| {
        let red = (255.0 * intensity(record.percent_change, worst)) as u8;
        Row::new([
            Cell::from(format!("{}", i + 1)).style(Style::default().fg(Color::DarkGray)),
            Cell::from(record.symbol.clone()).style(Style::default().fg(Color::Cyan)),
            Cell::from(record.company_name.clone()),
            Cell::from(record.sector.clone()).style(Style::default().fg(Color::Gray)),
            Cell::from(format!("{:.2}%", record.percent_change)).style(Style::default().fg(Color::Rgb(red, 0, 0))),
            Cell::from(format!("${:.2}", record.current_price)),
            Cell::from(format_market_cap(record.market_cap)),
            Cell::from(
                record
                    .distance_from_high
                    .map_or_else(|| "N/A".to_string(), |d| format!("{d:.1}%")),
            ),
            Cell::from(record.indicators.rsi.map_or_else(|| "N/A".to_string(), |r| format!("{r:.1}"))),
        ])
        .height(1)
    });

    f.render_widget(
        Table::new(
            rows,
            [
                Constraint::Length(5),
                Constraint::Length(8),
                Constraint::Percentage(25),
                Constraint::Percentage(18),
                Constraint::Length(9),
                Constraint::Length(10),
                Constraint::Length(10),
                Constraint::Length(10),
                Constraint::Length(6),
            ],
        )
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Biggest Drops")),
        right_chunks[1],
    );

    if app.is_refreshing {
        let area = centered_rect(60, 20, main_layout[1]);
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new(format!(
                "Running analysis with the {} preset...\nPlease wait.",
                app.preset()
            ))
            .block(Block::default().title("Analyzing").borders(Borders::ALL))
            .alignment(Alignment::Center),
            area,
        );
    } else if let Some(error) = &app.last_error {
        let area = centered_rect(60, 20, main_layout[1]);
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new(error.as_str())
                .wrap(Wrap { trim: true })
                .block(
                    Block::default()
                        .title("Analysis failed")
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(Color::Red)),
                ),
            area,
        );
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);
    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}

use crate::tunnel::{GatewayTunnelKind, RegistryView, TunnelSnapshot, TunnelStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 刷新间隔
const TICK_RATE: Duration = Duration::from_millis(250);

/// 表格过滤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum View {
    #[default]
    All,
    Ecs,
    Api,
}

impl View {
    fn includes(&self, tunnel: &TunnelSnapshot) -> bool {
        match (self, tunnel) {
            (Self::All, _) => true,
            (Self::Ecs, TunnelSnapshot::Ecs(_)) => true,
            (Self::Api, TunnelSnapshot::Gateway(_)) => true,
            _ => false,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::All => "Tunnels",
            Self::Ecs => "ECS tunnels",
            Self::Api => "API tunnels",
        }
    }
}

/// 仪表盘状态
pub struct Dashboard {
    profile: String,
    region: String,
    view: View,
    selected: TableState,
    message: Option<String>,
}

impl Dashboard {
    pub fn new(profile: impl Into<String>, region: impl Into<String>, view: View) -> Self {
        Self {
            profile: profile.into(),
            region: region.into(),
            view,
            selected: TableState::default(),
            message: None,
        }
    }

    fn visible(&self, all: Vec<TunnelSnapshot>) -> Vec<TunnelSnapshot> {
        all.into_iter().filter(|t| self.view.includes(t)).collect()
    }

    fn select_next(&mut self, len: usize) {
        if len == 0 {
            self.selected.select(None);
            return;
        }
        let next = match self.selected.selected() {
            Some(i) if i + 1 < len => i + 1,
            Some(i) => i,
            None => 0,
        };
        self.selected.select(Some(next));
    }

    fn select_prev(&mut self, len: usize) {
        if len == 0 {
            self.selected.select(None);
            return;
        }
        let prev = self.selected.selected().map(|i| i.saturating_sub(1)).unwrap_or(0);
        self.selected.select(Some(prev));
    }

    /// 行数变化后修正选中项
    fn clamp_selection(&mut self, len: usize) {
        match self.selected.selected() {
            _ if len == 0 => self.selected.select(None),
            Some(i) if i >= len => self.selected.select(Some(len - 1)),
            None => self.selected.select(Some(0)),
            _ => {}
        }
    }

    fn selected_id(&self, tunnels: &[TunnelSnapshot]) -> Option<String> {
        self.selected
            .selected()
            .and_then(|i| tunnels.get(i))
            .map(|t| t.id().to_string())
    }

    fn render(&mut self, f: &mut Frame, tunnels: &[TunnelSnapshot], live: usize) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ])
            .split(f.area());

        self.render_header(f, chunks[0], live);
        self.render_table(f, chunks[1], tunnels);
        self.render_footer(f, chunks[2]);
    }

    fn render_header(&self, f: &mut Frame, area: Rect, live: usize) {
        let title = format!(
            "SSM Tunnels - profile: {} - region: {} - live: {}",
            self.profile, self.region, live
        );
        let header = Paragraph::new(title)
            .style(
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            )
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(header, area);
    }

    fn render_table(&mut self, f: &mut Frame, area: Rect, tunnels: &[TunnelSnapshot]) {
        if tunnels.is_empty() {
            let empty = Paragraph::new("No tunnels")
                .style(Style::default().fg(Color::Yellow))
                .block(Block::default().borders(Borders::ALL).title(self.view.title()));
            f.render_widget(empty, area);
            return;
        }

        let now = Utc::now();
        let rows: Vec<Row> = tunnels
            .iter()
            .map(|t| {
                let cells = row_cells(t, now);
                let status_color = status_color(t.status());
                Row::new(
                    cells
                        .into_iter()
                        .enumerate()
                        .map(|(i, text)| {
                            let cell = Cell::from(text);
                            match i {
                                5 => cell.style(Style::default().fg(status_color)),
                                7 => cell.style(Style::default().fg(Color::Red)),
                                _ => cell,
                            }
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .collect();

        let bold = Style::default().add_modifier(Modifier::BOLD);
        let header = Row::new(
            COLUMNS
                .iter()
                .map(|c| Cell::from(*c).style(bold))
                .collect::<Vec<_>>(),
        )
        .style(Style::default().bg(Color::DarkGray));

        let table = Table::new(
            rows,
            [
                Constraint::Length(8),
                Constraint::Length(12),
                Constraint::Length(28),
                Constraint::Length(7),
                Constraint::Length(36),
                Constraint::Length(11),
                Constraint::Length(9),
                Constraint::Min(20),
            ],
        )
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("{} ({})", self.view.title(), tunnels.len())),
        )
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .style(Style::default().fg(Color::White));

        f.render_stateful_widget(table, area, &mut self.selected);
    }

    fn render_footer(&self, f: &mut Frame, area: Rect) {
        let key = |k: &'static str| {
            Span::styled(
                k,
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            )
        };
        let text = |t: &'static str| Span::styled(t, Style::default().fg(Color::Gray));

        let mut spans = vec![
            key("↑/↓"),
            text(" select, "),
            key("'s'"),
            text(" stop, "),
            key("'c'"),
            text(" clear terminated, "),
            key("'q'"),
            text(" quit"),
        ];
        if let Some(ref msg) = self.message {
            spans.push(Span::raw("  "));
            spans.push(Span::styled(msg.clone(), Style::default().fg(Color::Cyan)));
        }

        let footer = Paragraph::new(vec![Line::from(spans)])
            .block(Block::default().borders(Borders::ALL).title("Controls"));
        f.render_widget(footer, area);
    }
}

const COLUMNS: [&str; 8] = [
    "ID", "Kind", "Target", "Local", "Remote", "Status", "Uptime", "Error/Notice",
];

fn status_color(status: TunnelStatus) -> Color {
    match status {
        TunnelStatus::Starting => Color::Yellow,
        TunnelStatus::Active => Color::Green,
        TunnelStatus::Error => Color::Red,
        TunnelStatus::Terminated => Color::Gray,
    }
}

/// 一行表格的文本
fn row_cells(tunnel: &TunnelSnapshot, now: DateTime<Utc>) -> [String; 8] {
    let uptime = if tunnel.status().is_live() {
        let secs = (now - tunnel.started_at()).num_seconds().max(0) as u64;
        format_duration(secs)
    } else {
        "-".to_string()
    };

    match tunnel {
        TunnelSnapshot::Ecs(t) => [
            t.id.clone(),
            "ecs".to_string(),
            format!("{}/{}", t.service_name, t.container_name),
            t.local_port.to_string(),
            format!("{}:{}", t.task_id, t.remote_port),
            t.status.to_string(),
            uptime,
            t.last_error.clone().unwrap_or_default(),
        ],
        TunnelSnapshot::Gateway(t) => {
            let remote = match t.kind {
                GatewayTunnelKind::PublicProxy => t.upstream_host.clone(),
                GatewayTunnelKind::PrivateViaBastion => format!(
                    "{} via {}",
                    t.vpc_endpoint_id.as_deref().unwrap_or("?"),
                    t.jump_host_id.as_deref().unwrap_or("?")
                ),
            };
            [
                t.id.clone(),
                format!("api {}", t.kind),
                format!("{}/{}", t.api_name, t.stage_name),
                t.local_port.to_string(),
                remote,
                t.status.to_string(),
                uptime,
                t.last_error
                    .clone()
                    .or_else(|| t.notice.clone())
                    .unwrap_or_default(),
            ]
        }
    }
}

/// 格式化时长
fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {:02}h", days, hours)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// 运行仪表盘，直到用户退出
///
/// 退出后由调用方负责停止所有隧道。
pub async fn run_dashboard(registry: RegistryView, mut dashboard: Dashboard) -> Result<()> {
    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("Failed to setup terminal")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("Failed to create terminal")?;

    let result = event_loop(&mut terminal, &registry, &mut dashboard);

    disable_raw_mode().context("Failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("Failed to restore terminal")?;
    terminal.show_cursor().context("Failed to show cursor")?;

    result
}

fn event_loop<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    registry: &RegistryView,
    dashboard: &mut Dashboard,
) -> Result<()> {
    let mut last_tick = Instant::now();
    loop {
        let tunnels = dashboard.visible(registry.snapshot());
        dashboard.clamp_selection(tunnels.len());
        let live = registry.live_count();
        terminal
            .draw(|f| dashboard.render(f, &tunnels, live))
            .context("Failed to draw terminal")?;

        let timeout = TICK_RATE.saturating_sub(last_tick.elapsed());
        if event::poll(timeout).context("Event poll failed")? {
            if let Event::Key(key) = event::read().context("Failed to read event")? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(())
                    }
                    KeyCode::Down | KeyCode::Char('j') => dashboard.select_next(tunnels.len()),
                    KeyCode::Up | KeyCode::Char('k') => dashboard.select_prev(tunnels.len()),
                    KeyCode::Char('s') => {
                        if let Some(id) = dashboard.selected_id(&tunnels) {
                            dashboard.message = Some(match registry.stop_tunnel(&id) {
                                Ok(()) => format!("Stopping {}", id),
                                Err(e) => {
                                    warn!("Failed to stop {}: {}", id, e);
                                    e.to_string()
                                }
                            });
                        }
                    }
                    KeyCode::Char('c') => {
                        let cleared = registry.clear_terminated();
                        info!("Cleared {} terminated tunnel(s)", cleared);
                        dashboard.message = Some(format!("Cleared {} tunnel(s)", cleared));
                    }
                    _ => {}
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            last_tick = Instant::now();
        }
    }
}

//! doorwatch-dash
//!
//! Live terminal dashboard for an access-control server. Mounts a
//! `doorwatch::Interface` and renders its view; keys send operator commands.
//!
//! Quit: q / Esc / Ctrl-C

use doorwatch::model::{AccessLogEntry, LinkHealth, LinkState, UserId};
use doorwatch::sync::{Phase, Severity};
use doorwatch::{Config, DashboardView, Event, Interface};
use doorwatch_tools::{doorwatch_opts, init_file_logging, init_logging, load_config, parse_opts, usage};

use chrono::Local;
use crossbeam::channel;
use crossterm::event::{EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::{cursor, terminal, ExecutableCommand, QueueableCommand};
use futures::{future::FutureExt, select, StreamExt};
use futures_timer::Delay;
use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::info;

const FRAME: Duration = Duration::from_millis(100);

macro_rules! log {
    ($tf:expr, $msg:expr) => {{
        println!("{}{}", chrono::Local::now().format(&$tf), $msg);
    }};
    ($tf:expr, $f:expr, $($a:tt)*) => {{
        log!($tf, format!($f, $($a)*));
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tab {
    Dashboard,
    Users,
    History,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Confirm {
    OpenDoor,
    Delete(UserId, String),
}

struct App {
    dashboard: Interface,
    tab: Tab,
    selected: usize,
    confirm: Option<Confirm>,
    /// Local feedback for commands the interface refused.
    status: Option<String>,
}

impl App {
    fn selected_user(&self, view: &DashboardView) -> Option<(UserId, String, bool)> {
        let row = view.users.get(self.selected)?;
        let id = row.id.clone()?;
        Some((id, row.name.clone(), row.is_active))
    }

    fn report(&mut self, result: Result<(), doorwatch::InterfaceError>) {
        self.status = result.err().map(|e| e.to_string());
    }

    /// Returns false when the operator asked to quit.
    fn on_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return true;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return false;
        }
        if let Some(confirm) = self.confirm.take() {
            if key.code == KeyCode::Char('y') {
                let result = match confirm {
                    Confirm::OpenDoor => self.dashboard.open_door(),
                    Confirm::Delete(id, _) => self.dashboard.delete_user(id),
                };
                self.report(result);
            }
            return true;
        }
        let view = self.dashboard.view();
        self.status = None;
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return false,
            KeyCode::Char('1') => self.tab = Tab::Dashboard,
            KeyCode::Char('2') => self.tab = Tab::Users,
            KeyCode::Char('3') => self.tab = Tab::History,
            KeyCode::Char('o') => {
                if view.trigger_enabled {
                    self.confirm = Some(Confirm::OpenDoor);
                } else {
                    self.status = Some(format!("manual open already {}", view.phase.as_str()));
                }
            }
            KeyCode::Char('r') => {
                let result = self.dashboard.refresh();
                self.report(result);
            }
            KeyCode::Char('t') if self.tab == Tab::Users => {
                if let Some((id, _, active)) = self.selected_user(&view) {
                    let result = self.dashboard.set_user_active(id, !active);
                    self.report(result);
                }
            }
            KeyCode::Char('d') if self.tab == Tab::Users => {
                if let Some((id, name, _)) = self.selected_user(&view) {
                    self.confirm = Some(Confirm::Delete(id, name));
                }
            }
            KeyCode::Up => self.selected = self.selected.saturating_sub(1),
            KeyCode::Down => {
                if self.selected + 1 < view.users.len() {
                    self.selected += 1;
                }
            }
            _ => {}
        }
        true
    }
}

fn link_color(state: LinkState) -> Color {
    match state {
        LinkState::Connected => Color::Green,
        LinkState::Connecting => Color::Yellow,
        LinkState::Disconnected | LinkState::Error => Color::Red,
    }
}

fn link_text(link: &LinkHealth) -> String {
    match link.relay {
        Some(relay) => format!("push {} / relay {}", link.transport.as_str(), relay.as_str()),
        None => format!("push {}", link.transport.as_str()),
    }
}

struct Tui {
    stdout: io::Stdout,
}

impl Tui {
    fn setup() -> io::Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        stdout.execute(terminal::EnterAlternateScreen)?;
        stdout.execute(cursor::Hide)?;
        Ok(Self { stdout })
    }

    fn teardown(&mut self) {
        let _ = self.stdout.execute(cursor::Show);
        let _ = self.stdout.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        let _ = self.stdout.flush();
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        self.stdout.queue(Print(text))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        Ok(())
    }

    fn colored(&mut self, color: Color, text: &str) -> io::Result<()> {
        self.stdout.queue(SetForegroundColor(color))?;
        self.stdout.queue(Print(text))?;
        self.stdout.queue(ResetColor)?;
        Ok(())
    }

    fn bold(&mut self, text: &str) -> io::Result<()> {
        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(Print(text))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        Ok(())
    }

    fn entries(&mut self, entries: &[AccessLogEntry], max: usize) -> io::Result<()> {
        for e in entries.iter().take(max) {
            let (color, verdict) = if e.granted {
                (Color::Green, "granted")
            } else {
                (Color::Red, "denied ")
            };
            self.stdout.queue(Print(format!(
                "{}  ",
                e.timestamp.with_timezone(&Local).format("%F %T")
            )))?;
            self.colored(color, verdict)?;
            self.line(&format!(
                "  {:<20} {:<8} {:<13} {}",
                e.subject(),
                e.access_code,
                e.status.as_str(),
                e.reason.as_deref().unwrap_or("")
            ))?;
        }
        if entries.is_empty() {
            self.line("  (none)")?;
        }
        Ok(())
    }

    fn draw_dashboard(&mut self, view: &DashboardView, rows: usize) -> io::Result<()> {
        match &view.door {
            Some(door) => {
                self.stdout.queue(Print("Door: "))?;
                if door.is_open {
                    self.colored(Color::Yellow, "OPEN")?;
                } else {
                    self.colored(Color::Green, "closed")?;
                }
                self.line(&format!(
                    " since {}",
                    door.last_event_ts.with_timezone(&Local).format("%T")
                ))?;
            }
            None => self.line("Door: unknown")?,
        }
        let manual = match (view.phase, view.manual_open.and_then(|s| s.deadline)) {
            (Phase::Monitoring, Some(deadline)) => format!(
                "monitoring, {:.1}s left",
                deadline.saturating_duration_since(Instant::now()).as_secs_f64()
            ),
            (phase, _) => phase.as_str().to_string(),
        };
        self.line(&format!("Manual open: {}", manual))?;
        self.line("")?;

        let c = &view.counters;
        self.line(&format!(
            "Active users: {}   Granted (recent): {}   Unauthorized (recent): {}",
            c.active_users, c.granted_accesses, c.unauthorized_attempts
        ))?;
        if let Some(s) = &view.stats {
            self.line(&format!(
                "Server: {} users, {} accesses ({} granted, {} denied, {} unauthorized)",
                s.total_users,
                s.total_accesses,
                s.granted_accesses,
                s.denied_accesses,
                s.unauthorized_attempts
            ))?;
        }
        self.line("")?;
        self.bold("Recent activity")?;
        self.entries(&view.access_log, rows.saturating_sub(12).max(3))
    }

    fn draw_users(&mut self, view: &DashboardView, selected: usize) -> io::Result<()> {
        self.bold(&format!("{:<2}{:<26} {:<24} {:<10} {}", "", "id", "name", "code", "state"))?;
        for (i, u) in view.users.iter().enumerate() {
            let id = u.id.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "...".to_string());
            let text = format!(
                "{:<2}{:<26} {:<24} {:<10} {}{}",
                if i == selected { ">" } else { "" },
                id,
                u.name,
                u.access_code,
                if u.is_active { "active" } else { "inactive" },
                if u.pending { " *" } else { "" }
            );
            if i == selected {
                self.stdout.queue(SetAttribute(Attribute::Reverse))?;
                self.stdout.queue(Print(text))?;
                self.stdout.queue(SetAttribute(Attribute::Reset))?;
                self.stdout.queue(cursor::MoveToNextLine(1))?;
            } else {
                self.line(&text)?;
            }
        }
        if view.users.is_empty() {
            self.line("  (no users)")?;
        }
        Ok(())
    }

    fn draw_history(&mut self, view: &DashboardView, rows: usize) -> io::Result<()> {
        let unauthorized = view.unauthorized.len().min(5);
        self.bold("Access log")?;
        self.entries(&view.access_log, rows.saturating_sub(10 + unauthorized).max(3))?;
        self.line("")?;
        self.bold("Unauthorized attempts")?;
        self.entries(&view.unauthorized, 5)
    }

    fn draw(&mut self, app: &App, view: &DashboardView, api_url: &str) -> io::Result<()> {
        let (_, height) = terminal::size()?;
        let rows = height as usize;
        self.stdout.queue(cursor::MoveTo(0, 0))?;
        self.stdout.queue(terminal::Clear(terminal::ClearType::All))?;

        self.stdout.queue(SetAttribute(Attribute::Bold))?;
        self.stdout.queue(Print(format!("doorwatch  {}  ", api_url)))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.colored(link_color(view.link.transport), &link_text(&view.link))?;
        self.stdout.queue(cursor::MoveToNextLine(1))?;
        let tabs = [(Tab::Dashboard, "1 Dashboard"), (Tab::Users, "2 Users"), (Tab::History, "3 History")];
        for (tab, label) in tabs {
            if tab == app.tab {
                self.stdout.queue(SetAttribute(Attribute::Reverse))?;
                self.stdout.queue(Print(format!(" {} ", label)))?;
                self.stdout.queue(SetAttribute(Attribute::Reset))?;
            } else {
                self.stdout.queue(Print(format!(" {} ", label)))?;
            }
        }
        self.stdout.queue(cursor::MoveToNextLine(2))?;

        match app.tab {
            Tab::Dashboard => self.draw_dashboard(view, rows)?,
            Tab::Users => self.draw_users(view, app.selected)?,
            Tab::History => self.draw_history(view, rows)?,
        }

        // Notifications and footer at the bottom.
        let footer_rows = view.notifications.len() as u16 + 1;
        self.stdout.queue(cursor::MoveTo(0, height.saturating_sub(footer_rows)))?;
        for n in &view.notifications {
            let color = match n.severity {
                Severity::Success => Color::Green,
                Severity::Error => Color::Red,
            };
            self.colored(color, &format!("{} {}", n.created.with_timezone(&Local).format("%T"), n.message))?;
            self.stdout.queue(cursor::MoveToNextLine(1))?;
        }
        let footer = match (&app.confirm, &app.status) {
            (Some(Confirm::OpenDoor), _) => "Open the main door? (y/n)".to_string(),
            (Some(Confirm::Delete(_, name)), _) => format!("Delete user {}? (y/n)", name),
            (None, Some(status)) => status.clone(),
            (None, None) => {
                "q quit  1/2/3 tabs  o open door  r refresh  t toggle user  d delete user".to_string()
            }
        };
        self.stdout.queue(SetAttribute(Attribute::Dim))?;
        self.stdout.queue(Print(footer))?;
        self.stdout.queue(SetAttribute(Attribute::Reset))?;
        self.stdout.flush()
    }
}

async fn run_dashboard(app: &mut App, tui: &mut Tui, api_url: &str) -> io::Result<()> {
    let mut reader = EventStream::new();

    'drawing: loop {
        let mut delay = Delay::new(FRAME).fuse();
        let mut event = reader.next().fuse();

        select! {
            _ = delay => {
                let view = app.dashboard.view();
                tui.draw(app, &view, api_url)?;
            },
            some_event = event => {
                match some_event {
                    Some(Ok(crossterm::event::Event::Key(key))) => {
                        if !app.on_key(key) {
                            break 'drawing;
                        }
                        let view = app.dashboard.view();
                        tui.draw(app, &view, api_url)?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => break 'drawing,
                }
            }
        }
    }
    Ok(())
}

fn describe(event: &Event) -> Option<String> {
    Some(match event {
        Event::Mounted => "dashboard mounted".to_string(),
        Event::SnapshotApplied { kind, cause, changed: true } => {
            format!("{} loaded ({:?})", kind, cause)
        }
        Event::SnapshotApplied { .. } => return None,
        Event::FetchFailed(kind, err) => format!("failed to load {}: {}", kind, err),
        Event::PushApplied { event, .. } => format!("push: {}", event),
        Event::PushDropped(reason) => format!("dropped push event: {}", reason),
        Event::Link(link) => link_text(link),
        Event::RepairRequested => "reconnected, reloading".to_string(),
        Event::Monitor(phase) => format!("manual open {}", phase.as_str()),
        Event::ManualOpenRejected(reason) => format!("manual open rejected: {}", reason),
        Event::ManualOpenBusy(phase) => format!("manual open busy ({})", phase.as_str()),
        Event::CommandConfirmed(id) => format!("command {} confirmed", id),
        Event::CommandRejected(id, reason) => format!("command {} rejected: {}", id, reason),
        Event::Notified(message, severity) => format!("[{:?}] {}", severity, message),
        Event::Unmounted => "dashboard unmounted".to_string(),
    })
}

/// Prints dashboard events as timestamped lines until the core stops.
fn run_headless(config: &Config, tf: &str, duration: Option<Duration>) -> ExitCode {
    let (status_tx, status_rx) = channel::unbounded();
    let dashboard = match Interface::connect(config, Some(status_tx)) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        let timeout = match deadline {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left
            }
            None => Duration::from_secs(3600),
        };
        match status_rx.recv_timeout(timeout) {
            Ok(event) => {
                if let Some(text) = describe(&event) {
                    log!(tf, text);
                }
                if event == Event::Unmounted {
                    return ExitCode::SUCCESS;
                }
            }
            Err(channel::RecvTimeoutError::Timeout) => {}
            Err(channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    dashboard.unmount();
    for event in status_rx.try_iter() {
        if let Some(text) = describe(&event) {
            log!(tf, text);
        }
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(|s| s.as_str()).unwrap_or("doorwatch-dash");
    let mut opts = doorwatch_opts();
    opts.optopt("", "log", "Write logs to this file (TUI mode)", "path");
    opts.optflag("", "headless", "Print state changes instead of drawing the dashboard");
    opts.optopt("", "for", "Headless mode: stop after this many seconds", "sec");
    opts.optopt("t", "", "Timestamp format (default '%T%.3f ')", "fmt");

    let matches = match parse_opts(&opts, &args) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}\n\n{}", e, usage(&opts, program, ""));
            return ExitCode::from(2);
        }
    };
    if matches.opt_present("h") {
        println!("{}", usage(&opts, program, ""));
        return ExitCode::SUCCESS;
    }
    let verbose = matches.opt_present("v");
    let config = match load_config(&matches) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    if matches.opt_present("headless") {
        init_logging(verbose);
        info!("watching {}", config.api_url);
        let tf = matches.opt_str("t").unwrap_or("%T%.3f ".to_string());
        let duration = matches
            .opt_str("for")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        return run_headless(&config, &tf, duration);
    }

    if let Some(path) = matches.opt_str("log") {
        if let Err(e) = init_file_logging(&path, verbose) {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    }

    info!("dashboard starting against {}", config.api_url);
    let dashboard = match Interface::connect(&config, None) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut app = App {
        dashboard,
        tab: Tab::Dashboard,
        selected: 0,
        confirm: None,
        status: None,
    };

    let mut tui = match Tui::setup() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("terminal setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let mut t = Tui {
            stdout: io::stdout(),
        };
        t.teardown();
        original_hook(panic_info);
    }));

    let result = async_std::task::block_on(run_dashboard(&mut app, &mut tui, &config.api_url));
    tui.teardown();
    app.dashboard.unmount();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

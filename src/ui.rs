use crate::commands::short_time;
use crate::protocol::{ChatStats, Message, Role};
use crate::session::{ChatSession, LoadOutcome, SendOutcome};
use crate::state::{ChatState, Status};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 5;
const SCROLL_STEP: u16 = 10;
// Rows from the top of the log at which older history is requested.
const NEAR_TOP_ROWS: u16 = 2;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = stdout.flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn message_lines(message: &Message, character: &str, status: Status, open: bool) -> Vec<LineSpec> {
    let (speaker, color) = match message.role {
        Role::User => ("You".to_string(), Color::Blue),
        Role::Assistant => (character.to_string(), Color::Magenta),
        Role::System => ("System".to_string(), Color::Gray),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let header = match message.timestamp.as_deref() {
        Some(timestamp) => format!("{} · {}", speaker, short_time(timestamp)),
        None => speaker,
    };
    let mut lines = vec![LineSpec::new(header, header_style)];

    if message.content.is_empty() && open {
        let hint = if status == Status::Streaming {
            "typing..."
        } else {
            "thinking..."
        };
        lines.push(LineSpec::new(
            format!("  {}", hint),
            body_style.add_modifier(Modifier::ITALIC),
        ));
    }
    for line in message.content.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    for image in &message.images {
        let text = match image.strip_prefix("emoji:") {
            Some(glyph) => format!("  {}", glyph),
            None => format!("  [image] {}", image),
        };
        lines.push(LineSpec::new(text, body_style.add_modifier(Modifier::DIM)));
    }
    lines.push(LineSpec::new("", Style::default()));
    lines
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Notice {
    Info(String),
    Error(String),
}

impl Notice {
    fn line_specs(&self) -> Vec<LineSpec> {
        let (text, style) = match self {
            Notice::Info(text) => (
                text,
                Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC),
            ),
            Notice::Error(text) => (text, Style::default().fg(Color::Red)),
        };
        let mut lines: Vec<LineSpec> = text
            .lines()
            .map(|line| LineSpec::new(format!("ℹ {}", line), style))
            .collect();
        lines.push(LineSpec::new("", Style::default()));
        lines
    }
}

#[derive(Debug)]
pub enum UiEvent {
    SendFinished(Result<SendOutcome, String>),
    HistoryLoaded {
        older: bool,
        result: Result<LoadOutcome, String>,
    },
    SearchFinished {
        query: String,
        result: Result<Vec<Message>, String>,
    },
    Exported(Result<PathBuf, String>),
    Stats(Result<ChatStats, String>),
    Cleared(Result<(), String>),
}

struct InputBuffer {
    lines: Vec<String>,
    // Cursor column counts chars, not bytes.
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn byte_index(line: &str, char_idx: usize) -> usize {
        line.char_indices()
            .nth(char_idx)
            .map_or(line.len(), |(idx, _)| idx)
    }

    fn insert_char(&mut self, c: char) {
        let line = &mut self.lines[self.cursor_y];
        let idx = Self::byte_index(line, self.cursor_x);
        line.insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let idx = Self::byte_index(line, self.cursor_x - 1);
            line.remove(idx);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let removed = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&removed);
        }
    }

    fn new_line(&mut self) {
        let line = &mut self.lines[self.cursor_y];
        let idx = Self::byte_index(line, self.cursor_x);
        let remaining = line.split_off(idx);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn to_string(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Type your message here... (/help for commands)",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct App {
    session: ChatSession,
    updates: watch::Receiver<ChatState>,
    state: ChatState,
    notices: Vec<Notice>,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    // Lines scrolled up from the newest message; 0 follows the tail.
    scroll_from_bottom: u16,
    max_scroll: u16,
    load_more_pending: bool,
    clear_armed: bool,
}

impl App {
    pub fn new(session: ChatSession) -> Self {
        let (sender, receiver) = mpsc::channel(100);
        let updates = session.subscribe();
        let state = updates.borrow().clone();

        Self {
            session,
            updates,
            state,
            notices: Vec::new(),
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            scroll_from_bottom: 0,
            max_scroll: 0,
            load_more_pending: false,
            clear_armed: false,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [log_area, input_area] =
            Layout::vertical([Constraint::Min(3), Constraint::Length(INPUT_HEIGHT)]).areas(f.area());

        let log_lines = self.log_lines();
        let inner_width = log_area.width.saturating_sub(2).max(1);
        let visible = log_area.height.saturating_sub(2);
        let total: u16 = log_lines
            .iter()
            .map(|line| wrapped_height(line, inner_width))
            .fold(0u16, u16::saturating_add);
        self.max_scroll = total.saturating_sub(visible);
        self.scroll_from_bottom = self.scroll_from_bottom.min(self.max_scroll);
        let top = self.max_scroll - self.scroll_from_bottom;

        let log = Paragraph::new(Text::from(log_lines))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(self.log_title())
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false })
            .scroll((top, 0));
        f.render_widget(log, log_area);

        let mut input_block = Block::default()
            .borders(Borders::ALL)
            .title(self.input_title())
            .border_style(Style::default().fg(Color::DarkGray));
        if let Some(error) = &self.state.error {
            input_block = input_block.title_bottom(Line::from(Span::styled(
                format!(" Error: {} ", error),
                Style::default().fg(Color::Red),
            )));
        }
        let input_paragraph = Paragraph::new(self.input.render())
            .block(input_block)
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input_area.x + cursor_x).min(input_area.x + input_area.width.saturating_sub(2));
        let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn log_title(&self) -> String {
        let mut title = format!(
            " {} | {} of {} messages",
            self.session.character_id(),
            self.state.messages.len(),
            self.state.total_messages.max(self.state.messages.len())
        );
        if self.state.loading || self.state.loading_more {
            title.push_str(" | loading...");
        } else if self.state.has_more {
            title.push_str(" | PgUp for older");
        }
        title.push(' ');
        title
    }

    fn input_title(&self) -> &'static str {
        match self.state.status {
            Status::Idle => " Message (Enter to send, Shift+Enter newline, Esc to quit) ",
            Status::Sending => " Message [thinking...] ",
            Status::Streaming => " Message [typing...] ",
        }
    }

    fn log_lines(&self) -> Vec<Line<'static>> {
        let character = self.session.character_id();
        let last = self.state.messages.len().saturating_sub(1);
        let open = self.state.has_open_placeholder();

        let mut specs = Vec::new();
        if self.state.messages.is_empty() && !self.state.loading {
            specs.push(LineSpec::new(
                format!("Start your first conversation with {}.", character),
                Style::default().fg(Color::DarkGray),
            ));
            specs.push(LineSpec::new("", Style::default()));
        }
        for (idx, message) in self.state.messages.iter().enumerate() {
            specs.extend(message_lines(
                message,
                character,
                self.state.status,
                open && idx == last,
            ));
        }
        for notice in &self.notices {
            specs.extend(notice.line_specs());
        }

        specs
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect()
    }

    /// Pulls in session snapshots and finished background work.
    fn sync(&mut self) {
        if self.updates.has_changed().unwrap_or(false) {
            self.state = self.updates.borrow_and_update().clone();
        }

        while let Ok(event) = self.receiver.try_recv() {
            self.handle_ui_event(event);
        }
    }

    fn handle_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::SendFinished(Ok(SendOutcome::Rejected)) => {
                self.notify(Notice::Info("Still replying, wait for the answer first.".into()));
            }
            // Send failures already surface through the session error.
            UiEvent::SendFinished(_) => {}
            UiEvent::HistoryLoaded { older, result } => {
                if older {
                    self.load_more_pending = false;
                }
                if let Err(err) = result {
                    self.notify(Notice::Error(err));
                }
            }
            UiEvent::SearchFinished { query, result } => match result {
                Ok(results) if results.is_empty() => {
                    self.notify(Notice::Info(format!("No messages match \"{}\".", query)));
                }
                Ok(results) => {
                    let mut text = format!("{} match(es) for \"{}\":", results.len(), query);
                    for message in &results {
                        text.push('\n');
                        text.push_str(&crate::commands::format_message(message));
                    }
                    self.notify(Notice::Info(text));
                }
                Err(err) => self.notify(Notice::Error(err)),
            },
            UiEvent::Exported(Ok(path)) => {
                self.notify(Notice::Info(format!("History exported to {}", path.display())));
            }
            UiEvent::Exported(Err(err)) => self.notify(Notice::Error(err)),
            UiEvent::Stats(Ok(stats)) => self.notify(Notice::Info(format!(
                "{} messages over {} day(s), {} character(s)",
                stats.total_messages, stats.chat_days, stats.total_characters
            ))),
            UiEvent::Stats(Err(err)) => self.notify(Notice::Error(err)),
            UiEvent::Cleared(Ok(())) => {
                self.notices.clear();
                self.notify(Notice::Info("History cleared.".into()));
            }
            UiEvent::Cleared(Err(err)) => self.notify(Notice::Error(err)),
        }
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
        self.scroll_from_bottom = 0;
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Esc => self.should_quit = true,
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => self.input.new_line(),
            KeyCode::Enter => self.submit(),
            KeyCode::PageUp => self.scroll_up(SCROLL_STEP),
            KeyCode::PageDown => {
                self.scroll_from_bottom = self.scroll_from_bottom.saturating_sub(SCROLL_STEP);
            }
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_up(),
            KeyCode::Down => self.input.move_down(),
            KeyCode::Home => self.input.cursor_x = 0,
            KeyCode::End => self.input.cursor_x = self.input.line_len(self.input.cursor_y),
            _ => {}
        }
    }

    fn scroll_up(&mut self, rows: u16) {
        self.scroll_from_bottom = self.scroll_from_bottom.saturating_add(rows).min(self.max_scroll);
        if self.max_scroll - self.scroll_from_bottom <= NEAR_TOP_ROWS {
            self.load_older();
        }
    }

    fn submit(&mut self) {
        let text = self.input.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        if let Some(command) = trimmed.strip_prefix('/') {
            let command = command.to_string();
            self.input.clear();
            self.run_command(&command);
            return;
        }

        if !self.state.is_idle() {
            self.notify(Notice::Info("Still replying, wait for the answer first.".into()));
            return;
        }

        self.input.clear();
        self.clear_armed = false;
        self.scroll_from_bottom = 0;
        let session = self.session.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = session.send_message(&text).await.map_err(|e| e.to_string());
            let _ = sender.send(UiEvent::SendFinished(result)).await;
        });
    }

    fn run_command(&mut self, command: &str) {
        let (name, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, arg)| (name, arg.trim()));
        let session = self.session.clone();
        let sender = self.sender.clone();

        if name != "clear" {
            self.clear_armed = false;
        }

        match name {
            "search" if arg.is_empty() => {
                self.notify(Notice::Error("Usage: /search <text>".into()));
            }
            "search" => {
                let query = arg.to_string();
                tokio::spawn(async move {
                    let result = session.search_history(&query).await.map_err(|e| e.to_string());
                    let _ = sender.send(UiEvent::SearchFinished { query, result }).await;
                });
            }
            "export" => {
                let path = if arg.is_empty() {
                    PathBuf::from(format!("{}-history.json", session.character_id()))
                } else {
                    PathBuf::from(arg)
                };
                tokio::spawn(async move {
                    let result = export_to(&session, path).await;
                    let _ = sender.send(UiEvent::Exported(result)).await;
                });
            }
            "stats" => {
                tokio::spawn(async move {
                    let result = session.get_stats().await.map_err(|e| e.to_string());
                    let _ = sender.send(UiEvent::Stats(result)).await;
                });
            }
            "clear" if arg == "confirm" && self.clear_armed => {
                self.clear_armed = false;
                tokio::spawn(async move {
                    let result = session.clear_messages().await.map_err(|e| e.to_string());
                    let _ = sender.send(UiEvent::Cleared(result)).await;
                });
            }
            "clear" => {
                self.clear_armed = true;
                self.notify(Notice::Info(
                    "This deletes the whole conversation and cannot be undone. Type /clear confirm to proceed."
                        .into(),
                ));
            }
            "more" => self.load_older(),
            "help" => self.notify(Notice::Info(
                [
                    "/search <text>   search past messages",
                    "/export [path]   save history as JSON",
                    "/stats           conversation statistics",
                    "/more            load older messages",
                    "/clear           delete all history (asks to confirm)",
                    "PgUp / PgDn      scroll the conversation",
                ]
                .join("\n"),
            )),
            other => self.notify(Notice::Error(format!("Unknown command: /{}", other))),
        }
    }

    fn load_history(&mut self) {
        let session = self.session.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = session.load_history().await.map_err(|e| e.to_string());
            let _ = sender
                .send(UiEvent::HistoryLoaded {
                    older: false,
                    result,
                })
                .await;
        });
    }

    /// Requests the next older page unless one is already on its way.
    fn load_older(&mut self) {
        if self.load_more_pending
            || self.state.loading
            || self.state.loading_more
            || !self.state.has_more
        {
            return;
        }

        self.load_more_pending = true;
        let session = self.session.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = session.load_more_history().await.map_err(|e| e.to_string());
            let _ = sender
                .send(UiEvent::HistoryLoaded {
                    older: true,
                    result,
                })
                .await;
        });
    }
}

async fn export_to(session: &ChatSession, path: PathBuf) -> Result<PathBuf, String> {
    let snapshot = session.export_history().await.map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
    Ok(path)
}

fn wrapped_height(line: &Line, width: u16) -> u16 {
    let width = usize::from(width.max(1));
    let len = line.width().max(1);
    len.div_ceil(width).min(usize::from(u16::MAX)) as u16
}

pub fn run_tui(session: ChatSession) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let _guard = TerminalGuard::new();
    // Dropping this abandons a reply that is still streaming.
    let _teardown = session.teardown_guard();

    let mut terminal: TuiTerminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let mut app = App::new(session);
    app.load_history();

    while !app.should_quit {
        app.sync();
        terminal.draw(|f| app.draw(f))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key);
                }
            }
        }
    }

    Ok(())
}

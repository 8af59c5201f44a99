use crate::protocol::{HistoryPage, Message, Role};

/// Send lifecycle. A failed send returns to `Idle` with `ChatState::error` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Sending,
    Streaming,
}

/// How a loaded history page is merged into the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// First page; replaces the list wholesale.
    Replace,
    /// Older page; prepended in server order.
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    UserSend { content: String },
    StreamStart,
    StreamChunk(String),
    StreamEnd,
    StreamError(String),
    /// The reader was abandoned before `END`.
    StreamCancelled,
    PageRequested { seq: u64, mode: PageMode },
    PageLoaded { seq: u64, mode: PageMode, page: HistoryPage },
    PageFailed { seq: u64, mode: PageMode },
    Cleared,
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The event was not valid in the current state and changed nothing.
    Ignored,
    /// A page response older than one already applied.
    Stale,
}

/// Working copy of one character's conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub status: Status,
    pub error: Option<String>,
    pub total_messages: usize,
    pub has_more: bool,
    pub loading: bool,
    pub loading_more: bool,
    // True while the tail is [user, assistant placeholder] of the in-flight send.
    open_turn: bool,
    history_loads: usize,
    next_seq: u64,
    applied_seq: u64,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            status: Status::Idle,
            error: None,
            total_messages: 0,
            has_more: true,
            loading: false,
            loading_more: false,
            open_turn: false,
            history_loads: 0,
            next_seq: 0,
            applied_seq: 0,
        }
    }
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.status == Status::Idle
    }

    /// Whether the assistant placeholder is still receiving fragments.
    pub fn has_open_placeholder(&self) -> bool {
        self.open_turn
    }

    /// Reserves the next page sequence number.
    pub fn next_page_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn apply(&mut self, event: ChatEvent) -> Transition {
        match event {
            ChatEvent::UserSend { content } => self.user_send(content),
            ChatEvent::StreamStart => {
                if self.status != Status::Sending {
                    return Transition::Ignored;
                }
                self.status = Status::Streaming;
                Transition::Applied
            }
            ChatEvent::StreamChunk(fragment) => self.merge_fragment(&fragment),
            ChatEvent::StreamEnd => {
                if self.is_idle() {
                    return Transition::Ignored;
                }
                self.open_turn = false;
                self.status = Status::Idle;
                Transition::Applied
            }
            ChatEvent::StreamError(message) => self.finish_failed(Some(message)),
            ChatEvent::StreamCancelled => self.finish_failed(None),
            ChatEvent::PageRequested { seq, mode } => {
                match mode {
                    PageMode::Replace => {
                        self.history_loads += 1;
                        self.loading = true;
                    }
                    PageMode::Prepend => self.loading_more = true,
                }
                self.next_seq = self.next_seq.max(seq);
                Transition::Applied
            }
            ChatEvent::PageLoaded { seq, mode, page } => {
                self.page_settled(mode);
                if seq <= self.applied_seq {
                    return Transition::Stale;
                }
                self.applied_seq = seq;
                self.merge_page(mode, page);
                Transition::Applied
            }
            ChatEvent::PageFailed { mode, .. } => {
                self.page_settled(mode);
                Transition::Applied
            }
            ChatEvent::Cleared => {
                self.messages.clear();
                self.total_messages = 0;
                self.has_more = false;
                self.open_turn = false;
                // Anything still in flight predates the clear.
                self.applied_seq = self.next_seq;
                Transition::Applied
            }
        }
    }

    fn user_send(&mut self, content: String) -> Transition {
        let content = content.trim();
        if !self.is_idle() || content.is_empty() {
            return Transition::Ignored;
        }

        self.messages.push(Message::user(content));
        self.messages.push(Message::assistant_placeholder());
        self.open_turn = true;
        self.status = Status::Sending;
        self.error = None;
        Transition::Applied
    }

    fn merge_fragment(&mut self, fragment: &str) -> Transition {
        if self.is_idle() || !self.open_turn {
            return Transition::Ignored;
        }
        let Some(placeholder) = self.messages.last_mut() else {
            return Transition::Ignored;
        };
        if placeholder.role != Role::Assistant {
            return Transition::Ignored;
        }

        placeholder.content.push_str(fragment);
        self.status = Status::Streaming;
        Transition::Applied
    }

    fn finish_failed(&mut self, message: Option<String>) -> Transition {
        if self.is_idle() {
            return Transition::Ignored;
        }

        if self.open_turn {
            let empty_placeholder = self
                .messages
                .last()
                .is_some_and(|m| m.role == Role::Assistant && m.content.is_empty());
            if empty_placeholder {
                self.messages.pop();
            }
        }
        self.open_turn = false;
        self.status = Status::Idle;
        if message.is_some() {
            self.error = message;
        }
        Transition::Applied
    }

    fn page_settled(&mut self, mode: PageMode) {
        match mode {
            PageMode::Replace => {
                self.history_loads = self.history_loads.saturating_sub(1);
                self.loading = self.history_loads > 0;
            }
            PageMode::Prepend => self.loading_more = false,
        }
    }

    fn merge_page(&mut self, mode: PageMode, page: HistoryPage) {
        let HistoryPage {
            messages,
            total,
            has_more,
        } = page;

        match mode {
            PageMode::Replace => {
                let in_flight = if self.open_turn && self.messages.len() >= 2 {
                    self.messages.split_off(self.messages.len() - 2)
                } else {
                    Vec::new()
                };
                let mut messages = messages;
                // The server stores a turn just before its stream ends, so the
                // page can already carry the exchange that is still open here.
                if let Some(sent) = in_flight.first() {
                    let tail = messages.len().saturating_sub(2);
                    if let Some(pos) = messages.iter().rposition(|m| m.role == Role::User) {
                        if pos >= tail && messages[pos].content == sent.content {
                            messages.truncate(pos);
                        }
                    }
                }
                self.messages = messages;
                self.messages.extend(in_flight);
            }
            PageMode::Prepend => {
                let newer = std::mem::replace(&mut self.messages, messages);
                self.messages.extend(newer);
            }
        }
        self.total_messages = total;
        self.has_more = has_more;
    }
}

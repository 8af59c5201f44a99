//! Chat session for one character: history paging plus the live reply stream.
//!
//! All mutation goes through [`ChatState::apply`] under a lock that is never
//! held across an `.await`. Observers get snapshots from a `watch` channel;
//! fragment merges are throttled, every other transition publishes at once.

use crate::client::{ByteStream, ChatClient};
use crate::error::ChatError;
use crate::frame::{Frame, FrameDecoder};
use crate::protocol::{ChatStats, Message};
use crate::state::{ChatEvent, ChatState, PageMode, Transition};
use crate::throttle::RenderThrottle;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub character_id: String,
    pub page_size: usize,
    pub render_interval: Duration,
}

impl SessionConfig {
    pub fn new(character_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            page_size: DEFAULT_PAGE_SIZE,
            render_interval: DEFAULT_RENDER_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    /// Another send was in flight or the input was blank; nothing was sent.
    Rejected,
    /// The session was torn down before the reply finished.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// A newer page had already been applied; this response was dropped.
    Stale,
    /// Nothing to load, or a load was already running.
    Skipped,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

struct Inner {
    client: ChatClient,
    config: SessionConfig,
    state: Mutex<ChatState>,
    updates: watch::Sender<ChatState>,
    cancel: CancellationToken,
}

enum StreamFinish {
    Ended,
    Cancelled,
}

impl ChatSession {
    pub fn new(client: ChatClient, config: SessionConfig) -> Self {
        let (updates, _) = watch::channel(ChatState::new());
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                state: Mutex::new(ChatState::new()),
                updates,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn character_id(&self) -> &str {
        &self.inner.config.character_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.inner.updates.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.lock().clone()
    }

    /// Abandons any running stream. The session is not usable for sends afterwards.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Returns a guard that shuts the session down when dropped.
    pub fn teardown_guard(&self) -> DropGuard {
        self.inner.cancel.clone().drop_guard()
    }

    pub async fn send_message(&self, content: &str) -> Result<SendOutcome, ChatError> {
        if self.inner.cancel.is_cancelled() {
            return Ok(SendOutcome::Cancelled);
        }
        if self.dispatch(user_send(content)) == Transition::Ignored {
            tracing::debug!(character = %self.character_id(), "send rejected");
            return Ok(SendOutcome::Rejected);
        }

        tracing::info!(character = %self.character_id(), "sending message");
        let token = self.inner.cancel.child_token();
        match self.stream_reply(content.trim(), &token).await {
            Ok(StreamFinish::Ended) => {
                self.dispatch(ChatEvent::StreamEnd);
                tracing::info!(character = %self.character_id(), "reply complete");
                Ok(SendOutcome::Completed)
            }
            Ok(StreamFinish::Cancelled) => {
                self.dispatch(ChatEvent::StreamCancelled);
                tracing::info!(character = %self.character_id(), "reply stream abandoned");
                Ok(SendOutcome::Cancelled)
            }
            Err(err) => {
                tracing::warn!(character = %self.character_id(), error = %err, "reply stream failed");
                self.dispatch(ChatEvent::StreamError(err.to_string()));
                Err(err)
            }
        }
    }

    /// Sends through the non-streaming endpoint; the reply lands as one fragment.
    pub async fn send_message_once(&self, content: &str) -> Result<SendOutcome, ChatError> {
        if self.inner.cancel.is_cancelled() {
            return Ok(SendOutcome::Cancelled);
        }
        if self.dispatch(user_send(content)) == Transition::Ignored {
            return Ok(SendOutcome::Rejected);
        }

        let request = self.inner.client.send(self.character_id(), content.trim());
        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            result = request => Some(result),
        };

        match result {
            None => {
                self.dispatch(ChatEvent::StreamCancelled);
                Ok(SendOutcome::Cancelled)
            }
            Some(Ok(reply)) => {
                self.dispatch(ChatEvent::StreamStart);
                self.dispatch(ChatEvent::StreamChunk(reply.response));
                self.dispatch(ChatEvent::StreamEnd);
                Ok(SendOutcome::Completed)
            }
            Some(Err(err)) => {
                let err = ChatError::Transport(err);
                tracing::warn!(character = %self.character_id(), error = %err, "send failed");
                self.dispatch(ChatEvent::StreamError(err.to_string()));
                Err(err)
            }
        }
    }

    /// Replaces the working copy with the newest page.
    pub async fn load_history(&self) -> Result<LoadOutcome, ChatError> {
        let seq = self.mutate(|state| {
            let seq = state.next_page_seq();
            state.apply(ChatEvent::PageRequested {
                seq,
                mode: PageMode::Replace,
            });
            seq
        });
        self.publish();

        self.fetch_page(seq, PageMode::Replace, 0).await
    }

    /// Prepends the next older page, using the current length as offset.
    /// Skipped while any page load is still outstanding.
    pub async fn load_more_history(&self) -> Result<LoadOutcome, ChatError> {
        let ticket = self.mutate(|state| {
            if state.loading || state.loading_more || !state.has_more {
                return None;
            }
            let seq = state.next_page_seq();
            state.apply(ChatEvent::PageRequested {
                seq,
                mode: PageMode::Prepend,
            });
            Some((seq, state.messages.len()))
        });
        let Some((seq, offset)) = ticket else {
            return Ok(LoadOutcome::Skipped);
        };
        self.publish();

        self.fetch_page(seq, PageMode::Prepend, offset).await
    }

    pub async fn search_history(&self, query: &str) -> Result<Vec<Message>, ChatError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        self.inner
            .client
            .search(self.character_id(), query)
            .await
            .map_err(|err| {
                tracing::warn!(character = %self.character_id(), error = %err, "history search failed");
                ChatError::Search(err)
            })
    }

    pub async fn export_history(&self) -> Result<serde_json::Value, ChatError> {
        self.inner
            .client
            .export(self.character_id())
            .await
            .map_err(|err| {
                tracing::warn!(character = %self.character_id(), error = %err, "history export failed");
                ChatError::Export(err)
            })
    }

    /// Deletes the server-side history. Irreversible; callers confirm first.
    pub async fn clear_messages(&self) -> Result<(), ChatError> {
        if let Err(err) = self.inner.client.clear(self.character_id()).await {
            tracing::warn!(character = %self.character_id(), error = %err, "clearing history failed");
            return Err(ChatError::Clear(err));
        }

        self.dispatch(ChatEvent::Cleared);
        tracing::info!(character = %self.character_id(), "history cleared");
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<ChatStats, ChatError> {
        self.inner
            .client
            .stats(self.character_id())
            .await
            .map_err(|err| {
                tracing::warn!(character = %self.character_id(), error = %err, "loading stats failed");
                ChatError::Stats(err)
            })
    }

    async fn fetch_page(
        &self,
        seq: u64,
        mode: PageMode,
        offset: usize,
    ) -> Result<LoadOutcome, ChatError> {
        let result = self
            .inner
            .client
            .history(self.character_id(), offset, self.inner.config.page_size)
            .await;

        match result {
            Ok(page) => {
                tracing::debug!(seq, ?mode, offset, count = page.messages.len(), "history page loaded");
                match self.dispatch(ChatEvent::PageLoaded { seq, mode, page }) {
                    Transition::Stale => {
                        tracing::debug!(seq, ?mode, "dropping stale history page");
                        Ok(LoadOutcome::Stale)
                    }
                    _ => Ok(LoadOutcome::Applied),
                }
            }
            Err(err) => {
                tracing::warn!(seq, ?mode, error = %err, "failed to load history page");
                self.dispatch(ChatEvent::PageFailed { seq, mode });
                Err(ChatError::History(err))
            }
        }
    }

    async fn stream_reply(
        &self,
        message: &str,
        token: &CancellationToken,
    ) -> Result<StreamFinish, ChatError> {
        let open = self.inner.client.open_stream(self.character_id(), message);
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(StreamFinish::Cancelled),
            opened = open => opened,
        };
        let mut body: ByteStream = opened.map_err(ChatError::Transport)?;

        let mut decoder = FrameDecoder::new();
        let mut throttle = RenderThrottle::new(self.inner.config.render_interval);
        let mut started = false;

        loop {
            let flush_at = throttle.deadline();
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamFinish::Cancelled),
                _ = flush_due(flush_at) => {
                    self.publish();
                    throttle.mark_published(Instant::now());
                    continue;
                }
                chunk = body.next() => chunk,
            };

            let frames = match chunk {
                Some(Ok(bytes)) => {
                    if !started {
                        started = true;
                        self.dispatch(ChatEvent::StreamStart);
                    }
                    decoder.push(&bytes)
                }
                Some(Err(err)) => return Err(ChatError::StreamRead(err)),
                None => {
                    if self.apply_frames(decoder.finish(), &mut throttle)? {
                        return Ok(StreamFinish::Ended);
                    }
                    return Err(ChatError::StreamIncomplete);
                }
            };

            if self.apply_frames(frames, &mut throttle)? {
                return Ok(StreamFinish::Ended);
            }
        }
    }

    /// Returns `true` once the `END` frame has been seen.
    fn apply_frames(
        &self,
        frames: Vec<Frame>,
        throttle: &mut RenderThrottle,
    ) -> Result<bool, ChatError> {
        for frame in frames {
            match frame {
                Frame::Start => tracing::debug!("stream start frame"),
                Frame::Content(fragment) => {
                    self.mutate(|state| state.apply(ChatEvent::StreamChunk(fragment)));
                    if throttle.ready(Instant::now()) {
                        self.publish();
                    }
                }
                Frame::End => return Ok(true),
                Frame::Error(message) => return Err(ChatError::StreamAborted(message)),
                Frame::Malformed(payload) => {
                    tracing::debug!(%payload, "skipping malformed stream frame");
                }
            }
        }
        Ok(false)
    }

    fn dispatch(&self, event: ChatEvent) -> Transition {
        let (transition, snapshot) = {
            let mut state = self.lock();
            let transition = state.apply(event);
            (transition, state.clone())
        };
        if transition != Transition::Ignored {
            self.inner.updates.send_replace(snapshot);
        }
        transition
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        f(&mut self.lock())
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.inner.updates.send_replace(snapshot);
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn user_send(content: &str) -> ChatEvent {
    ChatEvent::UserSend {
        content: content.to_string(),
    }
}

async fn flush_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::{ClientEvent, TypingEvent, TypingEventKind};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(2);
pub const IDLE_CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Local typing state machine. Each method returns the event to send, if the
/// call crossed an Idle/Typing edge.
#[derive(Debug)]
pub struct TypingState {
    is_typing: bool,
    last_typing_time: Instant,
    last_input_len: usize,
}

impl TypingState {
    pub fn new(now: Instant) -> Self {
        Self {
            is_typing: false,
            last_typing_time: now,
            last_input_len: 0,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    pub fn observe_input(&mut self, current_len: usize, now: Instant) -> Option<TypingEventKind> {
        let previous_len = std::mem::replace(&mut self.last_input_len, current_len);

        if current_len == 0 {
            return self.set_typing(false);
        }
        if current_len != previous_len {
            self.last_typing_time = now;
            return self.set_typing(true);
        }
        None
    }

    pub fn check_idle(&mut self, now: Instant, timeout: Duration) -> Option<TypingEventKind> {
        if self.is_typing && now.saturating_duration_since(self.last_typing_time) > timeout {
            return self.set_typing(false);
        }
        None
    }

    /// The editor buffer was submitted and cleared.
    pub fn line_submitted(&mut self) -> Option<TypingEventKind> {
        self.last_input_len = 0;
        self.set_typing(false)
    }

    pub fn force_idle(&mut self) -> Option<TypingEventKind> {
        self.set_typing(false)
    }

    fn set_typing(&mut self, typing: bool) -> Option<TypingEventKind> {
        if self.is_typing == typing {
            return None;
        }
        self.is_typing = typing;
        Some(if typing {
            TypingEventKind::Start
        } else {
            TypingEventKind::Stop
        })
    }
}

/// Turns buffer-length notifications from the line editor into
/// edge-triggered `START`/`STOP` events. A buffer that stops changing for
/// longer than [`IDLE_TIMEOUT`] is treated as idle by the periodic check.
///
/// Transitions and the sends they trigger happen under one lock, so edges
/// reach the outbound queue in the order they occurred.
#[derive(Debug)]
pub struct TypingDebouncer {
    username: String,
    state: Mutex<TypingState>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    idle_timeout: Duration,
}

impl TypingDebouncer {
    pub fn new(username: impl Into<String>, outbound: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            username: username.into(),
            state: Mutex::new(TypingState::new(Instant::now())),
            outbound,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.with_state(|state| state.is_typing())
    }

    pub fn input_changed(&self, current_len: usize) {
        self.input_changed_at(current_len, Instant::now());
    }

    pub fn input_changed_at(&self, current_len: usize, now: Instant) {
        self.transition(|state| state.observe_input(current_len, now));
    }

    pub fn idle_check(&self) {
        self.idle_check_at(Instant::now());
    }

    pub fn idle_check_at(&self, now: Instant) {
        let timeout = self.idle_timeout;
        self.transition(|state| state.check_idle(now, timeout));
    }

    pub fn line_submitted(&self) {
        self.transition(TypingState::line_submitted);
    }

    /// Forces Idle on exit or disconnect. The STOP is best effort.
    pub fn stop(&self) {
        self.transition(TypingState::force_idle);
    }

    fn transition(&self, f: impl FnOnce(&mut TypingState) -> Option<TypingEventKind>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(kind) = f(&mut *state) else {
            return;
        };
        if self
            .outbound
            .send(ClientEvent::typing(&self.username, kind))
            .is_err()
        {
            debug!(?kind, "typing update dropped, connection is closing");
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&TypingState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&*state)
    }
}

/// Runs the idle check every [`IDLE_CHECK_PERIOD`] until `done` fires.
pub fn spawn_idle_checker(debouncer: Arc<TypingDebouncer>, done: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(IDLE_CHECK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => debouncer.idle_check(),
            }
        }
    })
}

/// Other participants currently announcing that they are typing. Display
/// only; it never feeds the local state machine.
#[derive(Debug)]
pub struct RemoteTyping {
    own_name: String,
    typing: BTreeSet<String>,
}

impl RemoteTyping {
    pub fn new(own_name: impl Into<String>) -> Self {
        Self {
            own_name: own_name.into(),
            typing: BTreeSet::new(),
        }
    }

    /// Applies a typing event from the hub. Returns whether the set changed.
    pub fn apply(&mut self, event: &TypingEvent) -> bool {
        if event.username == self.own_name {
            return false;
        }
        match event.kind {
            TypingEventKind::Start => self.typing.insert(event.username.clone()),
            TypingEventKind::Stop => self.typing.remove(&event.username),
        }
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.typing.remove(username)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.typing.iter().map(String::as_str)
    }

    /// Text shown next to the prompt, e.g. `alice, bob typing...`.
    pub fn indicator(&self) -> Option<String> {
        if self.typing.is_empty() {
            return None;
        }
        Some(format!("{} typing...", self.names().collect::<Vec<_>>().join(", ")))
    }
}

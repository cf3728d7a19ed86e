//! Capture state machine and reconnect backoff

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Lifecycle of the capture device as seen by the capture loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Streaming,
    Failed(String),
}

/// Everything that can happen to the capture loop in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Start,
    Opened,
    OpenFailed(String),
    FrameCaptured,
    TransientError,
    FatalError(String),
    BackoffElapsed,
    Shutdown,
}

impl CaptureState {
    /// Transition table. Events that make no sense in a state leave it as is.
    pub fn on(&self, event: &CaptureEvent) -> CaptureState {
        use CaptureEvent as E;
        use CaptureState as S;

        match (self, event) {
            (_, E::Shutdown) => S::Disconnected,
            (_, E::FatalError(reason)) => S::Failed(reason.clone()),
            (S::Disconnected, E::Start) => S::Connecting,
            (S::Connecting, E::Opened) => S::Streaming,
            (S::Connecting, E::OpenFailed(reason)) => S::Failed(reason.clone()),
            (S::Streaming, E::FrameCaptured | E::TransientError) => S::Streaming,
            (S::Failed(_), E::BackoffElapsed) => S::Connecting,
            (state, _) => state.clone(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, CaptureState::Streaming)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Disconnected => f.write_str("disconnected"),
            CaptureState::Connecting => f.write_str("connecting"),
            CaptureState::Streaming => f.write_str("streaming"),
            CaptureState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Shared view of the capture state. Only the capture loop calls `set`.
#[derive(Clone)]
pub struct CaptureStatus {
    state: Arc<ArcSwap<CaptureState>>,
}

impl CaptureStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(CaptureState::Disconnected)),
        }
    }

    pub fn current(&self) -> Arc<CaptureState> {
        self.state.load_full()
    }

    pub(crate) fn set(&self, state: CaptureState) {
        self.state.store(Arc::new(state));
    }
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait now; doubles the following one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

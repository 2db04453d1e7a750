//! Process-wide routing of native engine callbacks back to sessions.
//!
//! The native layer can only carry an opaque integer token into a callback,
//! so sessions register themselves here under a monotonically generated id
//! when constructed and remove themselves on dispose. The map is only ever
//! consulted by exact-key lookup. A callback arriving for an unknown id is
//! a lifecycle bug, not a recoverable condition: it is logged at error
//! level and, for the encoder-begin veto, answered with "do not continue".

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::Segment;
use crate::engine::{EngineState, SessionId};
use crate::event::AutoResetEvent;

/// Handler invoked with the engine's progress percentage.
pub type ProgressHandler = Arc<dyn Fn(i32) + Send + Sync>;

static SESSIONS: LazyLock<DashMap<SessionId, Arc<SessionShared>>> = LazyLock::new(DashMap::new);
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between a session's consumer loop and the callbacks firing
/// on the inference thread. One per session; per-run fields are reset by
/// `begin_run` under the session's single-permit serialization.
pub struct SessionShared {
    queue: SegQueue<Segment>,
    bridge: AutoResetEvent,
    /// Index of the first segment not yet relayed in the current run.
    cursor: AtomicUsize,
    compute_probabilities: bool,
    cancel: Mutex<CancellationToken>,
    progress: Mutex<Option<ProgressHandler>>,
}

impl SessionShared {
    fn new(compute_probabilities: bool) -> Self {
        Self {
            queue: SegQueue::new(),
            bridge: AutoResetEvent::new(),
            cursor: AtomicUsize::new(0),
            compute_probabilities,
            cancel: Mutex::new(CancellationToken::new()),
            progress: Mutex::new(None),
        }
    }

    /// Arms a new run: fresh cancellation token, cursor at zero, and no
    /// leftovers from an abandoned previous run.
    pub(crate) fn begin_run(&self, cancel: CancellationToken) {
        *self.cancel.lock() = cancel;
        self.cursor.store(0, Ordering::Release);
        self.clear_queue();
        self.bridge.reset();
    }

    pub(crate) fn clear_queue(&self) {
        while self.queue.pop().is_some() {}
    }

    pub(crate) fn pop_segment(&self) -> Option<Segment> {
        self.queue.pop()
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) async fn wait_signal(&self) {
        self.bridge.wait().await;
    }

    pub(crate) fn set_progress(&self, handler: Option<ProgressHandler>) {
        *self.progress.lock() = handler;
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    /// Relays every not-yet-seen segment from the native state into the
    /// queue. Runs synchronously inside the native call; it must never
    /// block on the consumer.
    fn handle_new_segment(&self, state: &dyn EngineState) {
        if self.cancel_requested() {
            return;
        }

        let total = state.segment_count();
        while self.cursor.load(Ordering::Acquire) < total {
            let index = self.cursor.load(Ordering::Acquire);
            let text = state.segment_text(index);
            let start = Duration::from_millis(state.segment_start(index).max(0) as u64 * 10);
            let end = Duration::from_millis(state.segment_end(index).max(0) as u64 * 10);
            let speaker_turn = state.speaker_turn(index);
            // Re-queried per segment: the engine may revise its language
            // estimate mid-file during auto-detection.
            let language = state.detected_language();

            let mut min_probability = 0f32;
            let mut max_probability = 0f32;
            let mut probability = 0f32;
            if self.compute_probabilities {
                let tokens = state.token_count(index);
                let mut sum = 0f64;
                for token in 0..tokens {
                    let p = state.token_probability(index, token);
                    sum += p as f64;
                    if token == 0 {
                        min_probability = p;
                        max_probability = p;
                    } else {
                        min_probability = min_probability.min(p);
                        max_probability = max_probability.max(p);
                    }
                }
                if tokens > 0 {
                    probability = (sum / tokens as f64) as f32;
                }
            }

            // Empty segments are skipped, not emitted; the cursor still
            // advances past them.
            if !text.is_empty() {
                self.queue.push(Segment {
                    text,
                    start,
                    end,
                    min_probability,
                    max_probability,
                    probability,
                    language,
                    speaker_turn,
                });
                self.bridge.set();
                if self.cancel_requested() {
                    return;
                }
            }

            self.cursor.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Registers a new session, returning its id and shared callback state.
pub(crate) fn register(compute_probabilities: bool) -> (SessionId, Arc<SessionShared>) {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::new(SessionShared::new(compute_probabilities));
    SESSIONS.insert(id, Arc::clone(&shared));
    (id, shared)
}

/// Removes a session from the registry. Idempotent.
pub(crate) fn unregister(id: SessionId) {
    SESSIONS.remove(&id);
}

/// Entry point for the engine's new-segment callback.
pub fn on_new_segment(session: SessionId, state: &dyn EngineState) {
    match SESSIONS.get(&session) {
        Some(shared) => shared.handle_new_segment(state),
        None => error!(session, "new-segment callback for unregistered session"),
    }
}

/// Entry point for the engine's progress callback. Suppressed once
/// cancellation has been requested.
pub fn on_progress(session: SessionId, percent: i32) {
    let Some(shared) = SESSIONS.get(&session) else {
        error!(session, "progress callback for unregistered session");
        return;
    };
    if shared.cancel_requested() {
        return;
    }
    let handler = shared.progress.lock().clone();
    if let Some(handler) = handler {
        handler(percent);
    }
}

/// Entry point for the engine's encoder-begin callback. Returns whether the
/// engine should continue; `false` lets it abort the call early.
pub fn on_encoder_begin(session: SessionId) -> bool {
    let Some(shared) = SESSIONS.get(&session) else {
        error!(session, "encoder-begin callback for unregistered session");
        return false;
    };
    !shared.cancel_requested()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeState {
        texts: Vec<&'static str>,
    }

    impl EngineState for FakeState {
        fn segment_count(&self) -> usize {
            self.texts.len()
        }
        fn segment_start(&self, index: usize) -> i64 {
            index as i64 * 50
        }
        fn segment_end(&self, index: usize) -> i64 {
            (index as i64 + 1) * 50
        }
        fn segment_text(&self, index: usize) -> String {
            self.texts[index].to_string()
        }
        fn token_count(&self, _index: usize) -> usize {
            0
        }
        fn token_probability(&self, _index: usize, _token: usize) -> f32 {
            0.0
        }
        fn speaker_turn(&self, _index: usize) -> bool {
            false
        }
        fn detected_language(&self) -> Option<String> {
            Some("en".into())
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn callbacks_for_unknown_sessions_veto_and_do_not_panic() {
        assert!(!on_encoder_begin(u64::MAX));
        on_progress(u64::MAX, 50);
        on_new_segment(
            u64::MAX,
            &FakeState {
                texts: vec!["lost"],
            },
        );
    }

    #[test]
    fn new_segments_are_queued_in_order_and_empties_skipped() {
        let (id, shared) = register(false);
        shared.begin_run(CancellationToken::new());

        let state = FakeState {
            texts: vec!["first", "", "second"],
        };
        on_new_segment(id, &state);

        let first = shared.pop_segment().unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(first.start, Duration::ZERO);
        assert_eq!(first.end, Duration::from_millis(500));
        let second = shared.pop_segment().unwrap();
        assert_eq!(second.text, "second");
        assert_eq!(second.start, Duration::from_millis(1000));
        assert!(shared.pop_segment().is_none());

        // Redelivering the same state emits nothing new.
        on_new_segment(id, &state);
        assert!(shared.pop_segment().is_none());

        unregister(id);
    }

    #[test]
    fn cancellation_stops_relaying_and_vetoes_encoder() {
        let (id, shared) = register(false);
        let cancel = CancellationToken::new();
        shared.begin_run(cancel.clone());

        cancel.cancel();
        on_new_segment(id, &FakeState { texts: vec!["late"] });
        assert!(shared.pop_segment().is_none());
        assert!(!on_encoder_begin(id));

        unregister(id);
    }
}

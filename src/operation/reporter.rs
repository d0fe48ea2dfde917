use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{MessageKind, OperationStatus};

/// One event in an operation's progress stream. The engine guarantees that
/// subscribers of a single operation observe these in emission order and
/// that Completed is the final event.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Message {
        kind: MessageKind,
        text: String,
        indent: i32,
    },
    ProgressStarted {
        id: String,
        description: String,
        total: u64,
        indent: i32,
    },
    ProgressUpdate {
        id: String,
        current: u64,
        rate: f64,
    },
    ProgressCompleted {
        id: String,
        success: bool,
        message: String,
    },
    Completed {
        success: bool,
        error: String,
    },
}

/// Where an operation's events go. Production uses a D-Bus signal sink;
/// tests record events in memory.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OperationEvent);
}

/// State shared between the engine task, the exported D-Bus object, and the
/// reporter: identity, status cell, and the cancellation flag.
#[derive(Debug)]
pub struct OperationState {
    pub id: u64,
    pub kind: &'static str,
    pub target: String,
    status: Mutex<OperationStatus>,
    cancelled: AtomicBool,
}

impl OperationState {
    pub fn new(id: u64, kind: &'static str, target: String) -> Self {
        Self {
            id,
            kind,
            target,
            status: Mutex::new(OperationStatus::Running),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> OperationStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the cancellation flag. Returns false when the operation already
    /// reached a terminal state, making late cancels a no-op.
    pub fn request_cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Transition out of Running. Only the first caller wins; later calls
    /// return false and change nothing.
    fn try_transition(&self, to: OperationStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.is_terminal() {
            return false;
        }
        *status = to;
        true
    }
}

/// Pairs the state with the event sink and the per-operation progress
/// counter. The engine keeps one of these per live operation.
pub struct OperationHandle {
    pub state: Arc<OperationState>,
    sink: Arc<dyn EventSink>,
    progress_seq: AtomicU64,
}

impl OperationHandle {
    pub fn new(state: Arc<OperationState>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state,
            sink,
            progress_seq: AtomicU64::new(1),
        }
    }

    /// Emit a progress event unless the operation already finished; events
    /// after the terminal transition are dropped, never delivered.
    fn emit(&self, event: OperationEvent) {
        if self.state.status().is_terminal() {
            debug!(
                operation = self.state.id,
                "dropping event after terminal state: {:?}", event
            );
            return;
        }
        self.sink.emit(event);
    }

    /// Perform the terminal transition and emit the Completed signal.
    /// Exactly one caller succeeds.
    pub fn finish(&self, status: OperationStatus, error: &str) -> bool {
        debug_assert!(status.is_terminal());
        if !self.state.try_transition(status) {
            return false;
        }
        self.sink.emit(OperationEvent::Completed {
            success: status == OperationStatus::Completed,
            error: error.to_string(),
        });
        true
    }

    fn next_progress_id(&self) -> String {
        self.progress_seq.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Progress reporting capability handed to executing work items.
///
/// All methods are non-blocking and safe to call from the operation's task;
/// emission order is preserved per operation.
#[derive(Clone)]
pub struct Reporter {
    handle: Arc<OperationHandle>,
    indent: i32,
}

impl Reporter {
    pub fn new(handle: Arc<OperationHandle>) -> Self {
        Self { handle, indent: 1 }
    }

    /// A reporter one indent level deeper, for nested sub-steps.
    pub fn indented(&self) -> Reporter {
        Reporter {
            handle: Arc::clone(&self.handle),
            indent: self.indent + 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.state.is_cancelled()
    }

    /// Cancellation poll for suspension points.
    pub fn check_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::KapsuleError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn message(&self, kind: MessageKind, text: String, indent: i32) {
        self.handle.emit(OperationEvent::Message { kind, text, indent });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(MessageKind::Info, text.into(), self.indent);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.message(MessageKind::Success, text.into(), self.indent);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.message(MessageKind::Warning, text.into(), self.indent);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(MessageKind::Error, text.into(), self.indent);
    }

    pub fn dim(&self, text: impl Into<String>) {
        self.message(MessageKind::Dim, text.into(), self.indent);
    }

    pub fn hint(&self, text: impl Into<String>) {
        self.message(MessageKind::Hint, text.into(), self.indent);
    }

    /// Begin a named sub-progress; `total == 0` means indeterminate.
    pub fn progress_start(&self, description: impl Into<String>, total: u64) -> ProgressHandle {
        let id = self.handle.next_progress_id();
        self.handle.emit(OperationEvent::ProgressStarted {
            id: id.clone(),
            description: description.into(),
            total,
            indent: self.indent,
        });
        ProgressHandle {
            handle: Arc::clone(&self.handle),
            id,
        }
    }
}

/// Handle for an open sub-progress.
pub struct ProgressHandle {
    handle: Arc<OperationHandle>,
    id: String,
}

impl ProgressHandle {
    pub fn update(&self, current: u64, rate: f64) {
        self.handle.emit(OperationEvent::ProgressUpdate {
            id: self.id.clone(),
            current,
            rate,
        });
    }

    pub fn complete(&self, success: bool, message: impl Into<String>) {
        self.handle.emit(OperationEvent::ProgressCompleted {
            id: self.id.clone(),
            success,
            message: message.into(),
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Sink that records every emitted event, for asserting order.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<OperationEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<OperationEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: OperationEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub fn test_handle() -> (Arc<OperationHandle>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let state = Arc::new(OperationState::new(1, "create", "box".to_string()));
        let events: Arc<dyn EventSink> = sink.clone();
        let handle = Arc::new(OperationHandle::new(state, events));
        (handle, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn completed_is_emitted_exactly_once_and_last() {
        let (handle, sink) = test_handle();
        let reporter = Reporter::new(Arc::clone(&handle));

        reporter.info("step one");
        reporter.success("step two");
        assert!(handle.finish(OperationStatus::Completed, ""));
        assert!(!handle.finish(OperationStatus::Failed, "late"));

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last().unwrap(),
            OperationEvent::Completed { success: true, .. }
        ));
        let completed = events
            .iter()
            .filter(|e| matches!(e, OperationEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn events_after_terminal_state_are_dropped() {
        let (handle, sink) = test_handle();
        let reporter = Reporter::new(Arc::clone(&handle));

        reporter.info("before");
        handle.finish(OperationStatus::Failed, "boom");
        reporter.info("after");
        reporter.progress_start("late", 10).update(5, 0.0);

        let events = sink.events();
        assert!(matches!(
            events.last().unwrap(),
            OperationEvent::Completed { success: false, .. }
        ));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn cancel_after_terminal_state_is_a_no_op() {
        let (handle, _sink) = test_handle();
        handle.finish(OperationStatus::Completed, "");
        assert!(!handle.state.request_cancel());
        assert_eq!(handle.state.status(), OperationStatus::Completed);
    }

    #[test]
    fn cancel_arms_the_flag_while_running() {
        let (handle, _sink) = test_handle();
        let reporter = Reporter::new(Arc::clone(&handle));
        assert!(!reporter.is_cancelled());
        assert!(handle.state.request_cancel());
        assert!(reporter.is_cancelled());
        assert!(reporter.check_cancelled().is_err());
    }

    #[test]
    fn indented_reporter_raises_indent_level() {
        let (handle, sink) = test_handle();
        let reporter = Reporter::new(Arc::clone(&handle));
        reporter.info("top");
        reporter.indented().info("nested");

        let events = sink.events();
        match (&events[0], &events[1]) {
            (
                OperationEvent::Message { indent: a, .. },
                OperationEvent::Message { indent: b, .. },
            ) => {
                assert_eq!(*a, 1);
                assert_eq!(*b, 2);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn progress_ids_are_unique_per_operation() {
        let (handle, sink) = test_handle();
        let reporter = Reporter::new(Arc::clone(&handle));
        let first = reporter.progress_start("a", 0);
        let second = reporter.progress_start("b", 100);
        first.complete(true, "");
        second.complete(false, "nope");

        let ids: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OperationEvent::ProgressStarted { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    proptest! {
        /// Whatever sequence of terminal transitions is attempted, exactly
        /// one wins and the status never changes afterwards.
        #[test]
        fn first_terminal_transition_wins(
            attempts in proptest::collection::vec(0_u8..3, 1..8)
        ) {
            let (handle, sink) = test_handle();
            let mut won = 0;
            let mut first = None;
            for attempt in &attempts {
                let status = match attempt {
                    0 => OperationStatus::Completed,
                    1 => OperationStatus::Failed,
                    _ => OperationStatus::Cancelled,
                };
                if handle.finish(status, "") {
                    won += 1;
                    first.get_or_insert(status);
                }
            }
            prop_assert_eq!(won, 1);
            prop_assert_eq!(handle.state.status(), first.unwrap());
            let completed = sink
                .events()
                .iter()
                .filter(|e| matches!(e, OperationEvent::Completed { .. }))
                .count();
            prop_assert_eq!(completed, 1);
        }
    }
}

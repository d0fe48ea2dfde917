mod engine;
mod reporter;

pub use engine::{Engine, OperationPublisher};
pub use reporter::{
    EventSink, OperationEvent, OperationHandle, OperationState, ProgressHandle, Reporter,
};

/// A user-facing work item, one per Manager method invocation.
#[derive(Debug, Clone)]
pub enum Work {
    Create {
        name: String,
        image: String,
        session_mode: bool,
        dbus_mux: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        force: bool,
    },
    Delete {
        name: String,
        force: bool,
    },
}

impl Work {
    pub fn kind(&self) -> &'static str {
        match self {
            Work::Create { .. } => "create",
            Work::Start { .. } => "start",
            Work::Stop { .. } => "stop",
            Work::Delete { .. } => "delete",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Work::Create { name, .. }
            | Work::Start { name }
            | Work::Stop { name, .. }
            | Work::Delete { name, .. } => name,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Work::Create { name, .. } => format!("Creating container: {name}"),
            Work::Start { name } => format!("Starting container: {name}"),
            Work::Stop { name, .. } => format!("Stopping container: {name}"),
            Work::Delete { name, .. } => format!("Removing container: {name}"),
        }
    }
}

/// Lifecycle of an operation. Pending exists only between id assignment and
/// publication and is never observable, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Running => "Running",
            OperationStatus::Completed => "Completed",
            OperationStatus::Failed => "Failed",
            OperationStatus::Cancelled => "Cancelled",
        }
    }
}

/// Kinds of progress messages, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info = 0,
    Success = 1,
    Warning = 2,
    Error = 3,
    Dim = 4,
    Hint = 5,
}

impl MessageKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_kind_and_target() {
        let work = Work::Create {
            name: "box".into(),
            image: "images:alpine/edge".into(),
            session_mode: false,
            dbus_mux: false,
        };
        assert_eq!(work.kind(), "create");
        assert_eq!(work.target(), "box");
        assert_eq!(work.description(), "Creating container: box");

        let work = Work::Delete {
            name: "box".into(),
            force: true,
        };
        assert_eq!(work.kind(), "delete");
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn message_kind_codes_match_the_wire() {
        assert_eq!(MessageKind::Info.code(), 0);
        assert_eq!(MessageKind::Success.code(), 1);
        assert_eq!(MessageKind::Warning.code(), 2);
        assert_eq!(MessageKind::Error.code(), 3);
        assert_eq!(MessageKind::Dim.code(), 4);
        assert_eq!(MessageKind::Hint.code(), 5);
    }
}

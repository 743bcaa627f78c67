use serde::{Deserialize, Serialize};

/// Rich display payload attached to a `result` event. Callers inspect
/// whichever fields are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RichResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub png: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub svg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub javascript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
}

/// Typed execution events emitted by a kernel, in wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterpreterEvent {
    /// Kernel boot complete; internal, never forwarded to clients.
    Ready,
    Stdout {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Stderr {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Result {
        #[serde(flatten)]
        payload: RichResult,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    ExecutionComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_count: Option<u64>,
    },
}

/// One JSON line read from a kernel's stdout.
#[derive(Debug, Deserialize)]
pub struct KernelLine {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub event: InterpreterEvent,
}

/// Structured execution failure, returned inside a 200 payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionErrorInfo {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunCodeLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Aggregate of a non-streaming `run_code` call.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunCodeResult {
    pub logs: RunCodeLogs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionErrorInfo>,
    pub results: Vec<RichResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_lines_parse_with_and_without_id() {
        let ready: KernelLine = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready.event, InterpreterEvent::Ready);
        assert!(ready.id.is_none());

        let stdout: KernelLine =
            serde_json::from_str(r#"{"id":"e1","type":"stdout","text":"43\n"}"#).unwrap();
        assert_eq!(stdout.id.as_deref(), Some("e1"));
        assert!(matches!(stdout.event, InterpreterEvent::Stdout { .. }));
    }

    #[test]
    fn result_event_flattens_rich_fields() {
        let line: KernelLine = serde_json::from_str(
            r#"{"id":"e2","type":"result","text":"42","execution_count":3}"#,
        )
        .unwrap();
        match line.event {
            InterpreterEvent::Result { payload } => {
                assert_eq!(payload.text.as_deref(), Some("42"));
                assert_eq!(payload.execution_count, Some(3));
                assert!(payload.png.is_none());
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn error_event_round_trips() {
        let json = r#"{"type":"error","ename":"NameError","evalue":"name 'x' is not defined","traceback":["line 1"]}"#;
        let line: KernelLine = serde_json::from_str(json).unwrap();
        match line.event {
            InterpreterEvent::Error { ename, .. } => assert_eq!(ename, "NameError"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}

// Failure records carried from a child back to the master

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::io::Write;
use std::panic::{self, PanicHookInfo};

/// What kind of fatal condition a child reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DiagnosticKind {
    Panic = 1,
    Failure = 2,
}

impl From<DiagnosticKind> for u8 {
    fn from(kind: DiagnosticKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for DiagnosticKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            1 => Ok(DiagnosticKind::Panic),
            2 => Ok(DiagnosticKind::Failure),
            other => Err(format!("unknown diagnostic kind {}", other)),
        }
    }
}

/// One structured failure record, written once by a dying child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(default)]
    pub location: String,
}

impl Diagnostic {
    pub fn panic(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Panic,
            message: message.into(),
            location: location.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Failure,
            message: message.into(),
            location: String::new(),
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Last line of `output` that decodes as a record; other output is ignored
    pub fn parse_last(output: &[u8]) -> Option<Self> {
        String::from_utf8_lossy(output)
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line.trim()).ok())
    }

    /// Write the record to stdout, the diagnostic channel of a child process
    pub fn emit(&self) {
        if let Ok(line) = self.to_line() {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.location.is_empty()) {
            (DiagnosticKind::Panic, false) => {
                write!(f, "panicked at {}: {}", self.location, self.message)
            }
            (DiagnosticKind::Panic, true) => write!(f, "panicked: {}", self.message),
            (DiagnosticKind::Failure, _) => write!(f, "{}", self.message),
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Install a panic hook that reports the panic on the diagnostic channel.
///
/// Only child processes call this; the previous hook still runs afterwards so
/// the panic also lands on stderr.
pub fn install_panic_reporter() {
    let original_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        Diagnostic::panic(panic_message(info.payload()), location).emit();

        original_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_serialized_as_integer() {
        let line = Diagnostic::panic("boom", "src/lib.rs:1:1").to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], 1);
        assert_eq!(value["message"], "boom");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed: Result<Diagnostic, _> =
            serde_json::from_str(r#"{"kind":9,"message":"x","location":""}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_last_skips_unrelated_output() {
        let output = b"starting\n{\"kind\":2,\"message\":\"first\",\"location\":\"\"}\n\
{\"kind\":1,\"message\":\"second\",\"location\":\"a.rs:2:3\"}\ntrailing noise\n";
        let diagnostic = Diagnostic::parse_last(output).unwrap();
        assert_eq!(diagnostic.message, "second");
        assert_eq!(diagnostic.to_string(), "panicked at a.rs:2:3: second");
    }

    #[test]
    fn test_parse_last_without_record() {
        assert!(Diagnostic::parse_last(b"").is_none());
        assert!(Diagnostic::parse_last(b"not json\n").is_none());
    }

    #[test]
    fn test_panic_message_downcasts_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}

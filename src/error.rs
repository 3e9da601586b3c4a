//! Agent error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Agent error that can be serialized for the request layer.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No process matches the queried name
    NotFound,
    /// More than one process matches the queried name
    AmbiguousMatch,
    /// Target PID is already monitored
    DuplicateTarget,
    /// Target PID is not monitored
    UnknownTarget,
    /// Target process is not running
    NotAlive,
    /// Monitor is already running
    AlreadyRunning,
    /// Neither a PID nor a process name was configured
    InvalidTarget,
    /// Restart command could not be launched
    RestartFailed,
    /// Process could not be terminated
    KillFailed,
    /// Log sink write failed
    SinkWriteFailed,
    /// Other process / OS query error
    Process,
    /// File system error
    Io,
    /// Configuration error
    Config,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound => 1001,
            Self::AmbiguousMatch => 1002,
            Self::DuplicateTarget => 1003,
            Self::UnknownTarget => 1004,
            Self::NotAlive => 1005,
            Self::AlreadyRunning => 1006,
            Self::InvalidTarget => 1007,
            Self::RestartFailed => 2001,
            Self::KillFailed => 2002,
            Self::Process => 2003,
            Self::SinkWriteFailed => 3001,
            Self::Io => 3002,
            Self::Config => 3003,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    fn with_pid(kind: ErrorKind, pid: u32) -> Self {
        Self::new(kind, HashMap::from([("pid".to_string(), pid.to_string())]))
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            HashMap::from([("name".to_string(), name.to_string())]),
        )
    }

    pub fn ambiguous_match(name: &str, candidates: &[u32]) -> Self {
        let joined = candidates
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Self::new(
            ErrorKind::AmbiguousMatch,
            HashMap::from([
                ("name".to_string(), name.to_string()),
                ("candidates".to_string(), joined),
            ]),
        )
    }

    pub fn duplicate_target(pid: u32) -> Self {
        Self::with_pid(ErrorKind::DuplicateTarget, pid)
    }

    pub fn unknown_target(pid: u32) -> Self {
        Self::with_pid(ErrorKind::UnknownTarget, pid)
    }

    pub fn not_alive(pid: u32) -> Self {
        Self::with_pid(ErrorKind::NotAlive, pid)
    }

    pub fn already_running() -> Self {
        Self::new(ErrorKind::AlreadyRunning, HashMap::new())
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::InvalidTarget, message)
    }

    pub fn restart_failed(command: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::RestartFailed,
            HashMap::from([
                ("command".to_string(), command.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn kill_failed(pid: u32, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::KillFailed,
            HashMap::from([
                ("pid".to_string(), pid.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn sink_write_failed(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::SinkWriteFailed, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Candidate PIDs carried by an `AmbiguousMatch` error; empty for every other kind.
    pub fn candidates(&self) -> Vec<u32> {
        self.payload
            .get("candidates")
            .map(|joined| {
                joined
                    .split(',')
                    .filter_map(|pid| pid.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::sink_write_failed(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_match_carries_candidates() {
        let err = AppError::ambiguous_match("worker", &[41, 42, 97]);
        assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
        assert_eq!(err.candidates(), vec![41, 42, 97]);
        assert!(err.to_string().contains("name=worker"));
    }

    #[test]
    fn candidates_empty_for_other_kinds() {
        assert!(AppError::not_found("worker").candidates().is_empty());
    }

    #[test]
    fn serializes_code_and_payload() {
        let json = serde_json::to_value(AppError::unknown_target(7)).unwrap();
        assert_eq!(json["code"], 1004);
        assert_eq!(json["payload"]["pid"], "7");
    }
}

//! Crate-wide error type.

use std::fmt;

/// Bridge error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bridge error kind.
#[derive(Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// failed to load configuration: {0}
    Config(String),
    /// D-Bus error
    Dbus,
    /// MQTT client error
    Mqtt,
    /// template rendering failed
    Template,
    /// undefined variable referenced in template: {0}
    UndefinedVariable(String),
    /// the target object was either not present or removed
    NotFound,
    /// internal error: {0}
    Internal(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        Self::with_message(ErrorKind::Dbus, err.message().unwrap_or_default().to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::with_message(ErrorKind::Internal("task join failed".into()), err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::with_message(ErrorKind::Internal("io".into()), err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::with_message(ErrorKind::Config(err.to_string()), "")
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::with_message(ErrorKind::Config(err.to_string()), "")
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        if err.kind() == minijinja::ErrorKind::UndefinedError {
            return Self::with_message(
                ErrorKind::UndefinedVariable(err.to_string()),
                "",
            );
        }
        Self::with_message(ErrorKind::Template, err.to_string())
    }
}

/// Bridge result.
pub type Result<T> = std::result::Result<T, Error>;

use std::fmt;

#[derive(Debug)]
pub enum RippleError {
    /// Markup could not be read, or a tag/attribute was rejected.
    Parse(String),
    /// Unbalanced records, a depth overflow or a malformed record at a stream offset.
    Structural { index: usize, message: String },
    Resource(String),
    /// Stream or index growth failed or would exceed the record length field.
    Capacity(String),
    Reentrant(String),
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl RippleError {
    pub(crate) fn structural(index: usize, message: impl Into<String>) -> Self {
        RippleError::Structural {
            index,
            message: message.into(),
        }
    }
}

impl fmt::Display for RippleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RippleError::Parse(message) => write!(f, "parse error: {}", message),
            RippleError::Structural { index, message } => {
                write!(f, "structural error at stream index {}: {}", index, message)
            }
            RippleError::Resource(message) => write!(f, "resource error: {}", message),
            RippleError::Capacity(message) => write!(f, "capacity exceeded: {}", message),
            RippleError::Reentrant(message) => write!(f, "re-entrant call rejected: {}", message),
            RippleError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            RippleError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for RippleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RippleError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RippleError {
    fn from(value: std::io::Error) -> Self {
        RippleError::Io(value)
    }
}

impl From<roxmltree::Error> for RippleError {
    fn from(value: roxmltree::Error) -> Self {
        RippleError::Parse(value.to_string())
    }
}

impl From<std::collections::TryReserveError> for RippleError {
    fn from(value: std::collections::TryReserveError) -> Self {
        RippleError::Capacity(value.to_string())
    }
}

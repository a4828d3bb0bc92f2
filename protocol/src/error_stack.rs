//! Ordered error stack forwarded verbatim from a failing server to the caller.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Frame code used when a layer forwards an error it did not originate.
pub const FORWARDING_CODE: i32 = 0;

/// One entry of an [`ErrorStack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: i32,
    pub subsystem: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: i32, subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            subsystem: subsystem.into(),
            message: message.into(),
        }
    }
}

/// Errors accumulated on the way from the failing component to the caller.
///
/// The first frame is the root cause; every layer that passes the error on
/// appends a forwarding frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorStack(Vec<ErrorFrame>);

impl ErrorStack {
    pub fn new(frame: ErrorFrame) -> Self {
        Self(vec![frame])
    }

    /// Shorthand for a single-frame stack.
    pub fn from_message(code: i32, subsystem: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorFrame::new(code, subsystem, message))
    }

    pub fn push(&mut self, frame: ErrorFrame) {
        self.0.push(frame);
    }

    /// Append a forwarding frame, consuming and returning the stack.
    pub fn forward(mut self, subsystem: &str, message: impl Into<String>) -> Self {
        self.0.push(ErrorFrame::new(FORWARDING_CODE, subsystem, message));
        self
    }

    pub fn frames(&self) -> &[ErrorFrame] {
        &self.0
    }

    /// The frame that started the stack.
    pub fn root(&self) -> Option<&ErrorFrame> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{}:{}] {}", frame.subsystem, frame.code, frame.message)?;
        }
        Ok(())
    }
}

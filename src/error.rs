//! Error types for device setup, kernel compilation and dispatch.

use std::fmt;

use thiserror::Error;

/// Specialized result type for this crate.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// A single compiler message attached to a [`ComputeError::Compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    /// One-based line in the kernel source, when the message has a span.
    pub line: Option<u32>,
    /// One-based column in the kernel source.
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, location: Option<naga::SourceLocation>) -> Self {
        if let Some(loc) = location {
            self.line = Some(loc.line_number);
            self.column = Some(loc.line_position);
        }
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "{line}:{col}: {}", self.message),
            (Some(line), None) => write!(f, "{line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Every diagnostic reported for one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    pub(crate) fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self(vec![diagnostic])
    }
}

/// Errors raised while setting up a device or running a kernel.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// No backend produced a usable adapter and device.
    #[error("no compatible compute device found: {0}")]
    NoDeviceFound(String),

    /// The kernel failed to parse, validate or build against the device.
    #[error("kernel compilation failed: {diagnostics}")]
    Compile { diagnostics: Diagnostics },

    /// The device could not provide the requested memory.
    #[error("device allocation failed: {0}")]
    Allocation(String),

    /// Buffers do not fit the kernel's binding layout.
    #[error("binding layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A request exceeds what the device supports. Never clamped.
    #[error("device limit exceeded: {what} is {requested}, limit is {limit}")]
    DeviceLimitExceeded {
        what: &'static str,
        requested: u64,
        limit: u64,
    },

    /// The device is gone; the context and everything derived from it is unusable.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Mapping a buffer for host access failed.
    #[error("buffer mapping failed: {0}")]
    MapFailed(String),
}

impl ComputeError {
    pub(crate) fn compile(diagnostics: impl Into<Diagnostics>) -> Self {
        Self::Compile {
            diagnostics: diagnostics.into(),
        }
    }

    /// The failure category, used for dispatcher state reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoDeviceFound(_) => ErrorKind::NoDeviceFound,
            Self::Compile { .. } => ErrorKind::Compile,
            Self::Allocation(_) => ErrorKind::Allocation,
            Self::LayoutMismatch(_) => ErrorKind::LayoutMismatch,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::DeviceLimitExceeded { .. } => ErrorKind::DeviceLimitExceeded,
            Self::DeviceLost(_) => ErrorKind::DeviceLost,
            Self::MapFailed(_) => ErrorKind::MapFailed,
        }
    }

    /// Whether the context that produced this error can still be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

/// Field-less mirror of [`ComputeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoDeviceFound,
    Compile,
    Allocation,
    LayoutMismatch,
    InvalidArgument,
    DeviceLimitExceeded,
    DeviceLost,
    MapFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_render_with_locations() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.push(Diagnostic {
            message: "no definition in scope for identifier: `y`".into(),
            line: Some(7),
            column: Some(5),
        });
        diagnostics.push(Diagnostic::new("exactly one output slot is required"));

        let err = ComputeError::compile(diagnostics);
        assert_eq!(
            err.to_string(),
            "kernel compilation failed: 7:5: no definition in scope for identifier: `y`; \
             exactly one output slot is required"
        );
        assert_eq!(err.kind(), ErrorKind::Compile);
    }

    #[test]
    fn only_device_loss_is_fatal() {
        assert!(ComputeError::DeviceLost("reset".into()).is_fatal());
        assert!(!ComputeError::MapFailed("aborted".into()).is_fatal());
        let limit = ComputeError::DeviceLimitExceeded {
            what: "workgroups in x",
            requested: 70_000,
            limit: 65_535,
        };
        assert!(!limit.is_fatal());
        assert_eq!(limit.kind(), ErrorKind::DeviceLimitExceeded);
        assert_eq!(
            limit.to_string(),
            "device limit exceeded: workgroups in x is 70000, limit is 65535"
        );
    }
}

//! Error kinds shared by the credential broker, mount primitives, and the
//! Pod/Service mounters. Kept independent of any RPC transport: the CSI
//! gRPC boundary (out of scope here) maps [`ErrorKind`] to gRPC status codes.

use std::path::PathBuf;

use thiserror::Error;

/// The closed set of error categories produced by the mount engine (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing required fields, malformed tokens/secrets, unknown auth source.
    InvalidInput,
    /// No attachment record or helper pod was ever observed.
    NotFound,
    /// Helper pod observed but never reached `Running`.
    NotReady,
    /// Filesystem/syscall failure, helper-pod communication failure.
    Internal,
    /// Transient condition the core already retried internally; surfaced
    /// only once the enclosing deadline has been exhausted.
    RetryableTransient,
}

/// An error produced by the mount engine, annotated with enough context for
/// an operator to act on without reading source: the operation name, the
/// target path, and (for helper-pod failures) a `kubectl` hint.
#[derive(Debug, Error)]
#[error("{kind:?} during {operation} (target={target:?}, helper_pod={helper_pod:?}): {message}{hint}")]
pub struct MountError {
    pub kind: ErrorKind,
    pub operation: &'static str,
    pub target: Option<PathBuf>,
    pub helper_pod: Option<String>,
    pub message: String,
    hint: HintDisplay,
}

#[derive(Debug, Default, Clone)]
struct HintDisplay(Option<String>);

impl std::fmt::Display for HintDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(hint) => write!(f, " ({hint})"),
            None => Ok(()),
        }
    }
}

impl MountError {
    pub fn new(kind: ErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        MountError {
            kind,
            operation,
            target: None,
            helper_pod: None,
            message: message.into(),
            hint: HintDisplay::default(),
        }
    }

    pub fn invalid_input(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, operation, message)
    }

    pub fn not_ready(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady, operation, message)
    }

    pub fn internal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, operation, message)
    }

    pub fn retryable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryableTransient, operation, message)
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_helper_pod(mut self, name: impl Into<String>) -> Self {
        self.helper_pod = Some(name.into());
        self
    }

    /// Attaches a `kubectl logs`/`describe` hint for helper-pod-related failures.
    pub fn with_kubectl_hint(mut self, namespace: &str, pod: &str) -> Self {
        self.hint = HintDisplay(Some(format!(
            "see `kubectl logs -n {namespace} {pod}` or `kubectl describe pods -n {namespace} {pod}`"
        )));
        self
    }

    /// Downgrades a `RetryableTransient` error to its terminal kind once the
    /// enclosing deadline has expired, per §7's propagation rule.
    pub fn into_deadline_exceeded(mut self, terminal: ErrorKind) -> Self {
        if self.kind == ErrorKind::RetryableTransient {
            self.kind = terminal;
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, MountError>;

impl From<std::io::Error> for MountError {
    fn from(err: std::io::Error) -> Self {
        MountError::new(ErrorKind::Internal, "io", err.to_string())
    }
}

impl From<nix::Error> for MountError {
    fn from(err: nix::Error) -> Self {
        MountError::new(ErrorKind::Internal, "syscall", err.to_string())
    }
}

impl From<kube::Error> for MountError {
    fn from(err: kube::Error) -> Self {
        MountError::new(ErrorKind::Internal, "kube-api", err.to_string())
    }
}

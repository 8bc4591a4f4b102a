//! The seam between this process and the foreign runtime hosting the engine.
//!
//! Everything that crosses the runtime boundary goes through a [`Runtime`].
//! Callers never see raw foreign types: values come back as opaque
//! [`ForeignValue`] references and go in as [`Arg`]s.

pub mod handle;
pub mod julia;
pub mod mock;

pub use handle::{EngineHandle, global, install_global};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Errors raised while talking to the foreign runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The runtime failed to start or could not load the engine module.
    #[error("failed to start foreign runtime: {0}")]
    Initialization(String),

    /// The requested attribute does not exist on the loaded module.
    #[error("engine has no attribute `{0}`")]
    AttributeResolution(String),

    /// Foreign code raised during evaluation or application.
    #[error("foreign evaluation failed: {0}")]
    Evaluation(String),

    /// The foreign side answered with a value of the wrong shape.
    #[error("expected {expected} from foreign runtime, got `{found}`")]
    UnexpectedValue { expected: &'static str, found: String },

    /// The runtime replied with something that is not a valid protocol message.
    #[error("malformed bridge message: {0}")]
    Protocol(String),

    /// The runtime's output stream closed.
    #[error("foreign runtime disconnected")]
    Disconnected,

    #[error("foreign runtime i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Opaque reference to a value owned by the foreign runtime.
///
/// Plain values (booleans, numbers, strings, `nothing`) also carry a decoded
/// copy so callers can read answers without another round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignValue {
    handle: u64,
    summary: String,
    plain: Option<serde_json::Value>,
}

impl ForeignValue {
    pub fn new(handle: u64, summary: impl Into<String>) -> Self {
        Self {
            handle,
            summary: summary.into(),
            plain: None,
        }
    }

    /// Attach the decoded copy of a plain value.
    pub fn with_plain(mut self, plain: serde_json::Value) -> Self {
        self.plain = Some(plain);
        self
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// The foreign runtime's printed representation.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn plain(&self) -> Option<&serde_json::Value> {
        self.plain.as_ref()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.plain.as_ref().and_then(serde_json::Value::as_bool)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.plain.as_ref().and_then(serde_json::Value::as_str)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.plain.as_ref().and_then(serde_json::Value::as_f64)
    }
}

impl fmt::Display for ForeignValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

/// An argument passed into a foreign call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A value that already lives in the foreign runtime.
    Value(ForeignValue),
    /// Plain data, converted by the runtime on arrival.
    Data(serde_json::Value),
}

impl From<&ForeignValue> for Arg {
    fn from(value: &ForeignValue) -> Self {
        Arg::Value(value.clone())
    }
}

impl From<ForeignValue> for Arg {
    fn from(value: ForeignValue) -> Self {
        Arg::Value(value)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Data(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Data(serde_json::Value::String(value.to_string()))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Data(serde_json::Value::Bool(value))
    }
}

/// The capabilities this crate needs from a foreign runtime.
///
/// Implementations are expected to serialize their own execution; callers may
/// share one runtime across tasks but must not assume foreign calls run in
/// parallel.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start the runtime and load `module`, returning a reference to it.
    async fn start(&self, module: &str) -> BridgeResult<ForeignValue>;

    /// Resolve a dotted attribute path relative to the runtime's main namespace.
    async fn resolve(&self, path: &str) -> BridgeResult<ForeignValue>;

    /// Evaluate `code` verbatim.
    async fn eval(&self, code: &str) -> BridgeResult<ForeignValue>;

    /// Construct a foreign symbol from `text`.
    async fn symbol(&self, text: &str) -> BridgeResult<ForeignValue>;

    /// Apply `function` to positional and keyword arguments.
    async fn call(
        &self,
        function: &ForeignValue,
        args: &[Arg],
        kwargs: &[(String, Arg)],
    ) -> BridgeResult<ForeignValue>;

    /// Drop the runtime's references to `handles`. Unknown handles are ignored.
    async fn release(&self, handles: &[u64]) -> BridgeResult<()>;
}

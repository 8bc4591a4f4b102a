//! The local side of one optimization run.
//!
//! A [`Model`] moves through `Uninitialized → Generated → Optimized`, or ends
//! in `Failed` when generation does not succeed. Generation failures are
//! recorded in the status rather than returned; optimization failures are
//! returned as errors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{Arg, BridgeError, EngineHandle, ForeignValue};

/// Extra keyword arguments forwarded to the engine's `generate!`.
pub type ModelOptions = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Generated,
    Failed,
    Optimized,
}

impl ModelStatus {
    /// No further lifecycle step is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ModelStatus::Failed | ModelStatus::Optimized)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelStatus::Uninitialized => "uninitialized",
            ModelStatus::Generated => "generated",
            ModelStatus::Failed => "failed",
            ModelStatus::Optimized => "optimized",
        })
    }
}

/// How much the engine and its solver print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Verbose engine; the solver is verbose unless the model config says otherwise.
    #[default]
    Verbose,
    /// Warnings and errors only; silent solver.
    Warning,
    /// Errors only.
    Silent,
}

impl Verbosity {
    fn as_arg(self) -> Arg {
        match self {
            Verbosity::Verbose => Arg::from(true),
            Verbosity::Warning => Arg::from("warning"),
            Verbosity::Silent => Arg::from(false),
        }
    }
}

impl From<bool> for Verbosity {
    fn from(verbose: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Silent
        }
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "verbose" => Ok(Verbosity::Verbose),
            "warning" => Ok(Verbosity::Warning),
            "false" | "silent" => Ok(Verbosity::Silent),
            other => Err(format!(
                "invalid verbosity `{other}` (expected true, warning or false)"
            )),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// `optimize` needs a generated model.
    #[error("model is {0}, not generated")]
    NotGenerated(ModelStatus),

    #[error("model is {0}, not optimized")]
    NotOptimized(ModelStatus),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

pub struct Model {
    handle: Arc<EngineHandle>,
    source: PathBuf,
    verbosity: Verbosity,
    options: ModelOptions,
    status: ModelStatus,
    core: Option<ForeignValue>,
}

impl Model {
    pub fn new(
        handle: Arc<EngineHandle>,
        source: impl Into<PathBuf>,
        verbosity: Verbosity,
        options: ModelOptions,
    ) -> Self {
        Self {
            handle,
            source: source.into(),
            verbosity,
            options,
            status: ModelStatus::Uninitialized,
            core: None,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// The engine-side model. Owned by the engine; present once generated.
    pub fn core(&self) -> Option<&ForeignValue> {
        self.core.as_ref()
    }

    /// Build the engine-side model from `source`.
    ///
    /// Returns the resulting status. A failure is logged and leaves the model
    /// `Failed`; inspect the status rather than expecting an error. Only an
    /// uninitialized model is generated; any other state is left untouched.
    pub async fn generate(&mut self) -> ModelStatus {
        if self.status != ModelStatus::Uninitialized {
            warn!(
                source = %self.source.display(),
                status = %self.status,
                "model already {}, not generating again",
                self.status
            );
            return self.status;
        }

        info!(source = %self.source.display(), "generating model");
        match self.build().await {
            Ok(core) => {
                self.core = Some(core);
                self.status = ModelStatus::Generated;
            }
            Err(e) => {
                warn!(source = %self.source.display(), "exception during generate: {e}");
                self.status = ModelStatus::Failed;
            }
        }
        self.status
    }

    async fn build(&self) -> Result<ForeignValue, BridgeError> {
        let generate = self.handle.get(Some("IESopt.generate!")).await?;
        let core = self.call_generate(&generate).await;
        self.handle.discard(&[&generate]).await;
        core
    }

    async fn call_generate(&self, generate: &ForeignValue) -> Result<ForeignValue, BridgeError> {
        let source = self.source.to_string_lossy().into_owned();
        let mut kwargs = vec![("verbosity".to_string(), self.verbosity.as_arg())];
        kwargs.extend(
            self.options
                .iter()
                .map(|(key, value)| (key.clone(), Arg::Data(value.clone()))),
        );
        self.handle
            .call(generate, &[Arg::from(source.as_str())], &kwargs)
            .await
    }

    /// Solve the generated model.
    ///
    /// Must only be called on a `Generated` model; otherwise returns
    /// [`ModelError::NotGenerated`] without contacting the engine. If the
    /// solver call itself fails the error is returned and the status stays
    /// `Generated`.
    pub async fn optimize(&mut self) -> Result<(), ModelError> {
        let core = match (&self.status, &self.core) {
            (ModelStatus::Generated, Some(core)) => core,
            _ => return Err(ModelError::NotGenerated(self.status)),
        };

        info!(source = %self.source.display(), "optimizing model");
        let optimize = self.handle.get(Some("IESopt.optimize!")).await?;
        let result = self.handle.call(&optimize, &[core.into()], &[]).await;
        self.handle.discard(&[&optimize]).await;
        let result = result?;
        self.handle.discard(&[&result]).await;
        self.status = ModelStatus::Optimized;
        Ok(())
    }

    /// Objective value of the solved model.
    pub async fn objective_value(&self) -> Result<f64, ModelError> {
        let core = match (&self.status, &self.core) {
            (ModelStatus::Optimized, Some(core)) => core,
            _ => return Err(ModelError::NotOptimized(self.status)),
        };

        let objective = self.handle.get(Some("IESopt.JuMP.objective_value")).await?;
        let value = self.handle.call(&objective, &[core.into()], &[]).await;
        self.handle.discard(&[&objective]).await;
        let value = value?;
        self.handle.discard(&[&value]).await;
        value.as_f64().ok_or_else(|| {
            ModelError::Bridge(BridgeError::UnexpectedValue {
                expected: "a number",
                found: value.summary().to_string(),
            })
        })
    }
}

impl Model {
    /// Free the engine-side model. The status is kept.
    ///
    /// Dropping a model inside a tokio runtime releases it in the background;
    /// `close` does the same and reports failures.
    pub async fn close(mut self) -> Result<(), ModelError> {
        if let Some(core) = self.core.take() {
            self.handle.release(&[&core]).await?;
        }
        Ok(())
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = Arc::clone(&self.handle);
                runtime.spawn(async move { handle.discard(&[&core]).await });
            }
            Err(_) => debug!(
                source = %self.source.display(),
                "no async runtime; engine-side model not released"
            ),
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("source", &self.source)
            .field("verbosity", &self.verbosity)
            .field("options", &self.options)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

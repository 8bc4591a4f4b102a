use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::julia::JuliaRuntime;
use super::{Arg, BridgeError, BridgeResult, ForeignValue, Runtime};
use crate::config::EngineConfig;
use crate::consts::ENGINE_MODULE;

/// Process-wide handle, created on first use.
static GLOBAL_HANDLE: OnceLock<Arc<EngineHandle>> = OnceLock::new();

/// Reference to the engine module loaded inside a foreign runtime.
///
/// The runtime is started lazily by the first operation that needs it and
/// exactly once, even when several tasks race to trigger it. A failed start
/// leaves the handle uninitialized, so the next caller sees the failure too.
pub struct EngineHandle {
    runtime: Arc<dyn Runtime>,
    module_name: String,
    module: OnceCell<ForeignValue>,
}

impl EngineHandle {
    /// A handle that loads the IESopt engine module.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self::with_module(runtime, ENGINE_MODULE)
    }

    pub fn with_module(runtime: Arc<dyn Runtime>, module_name: impl Into<String>) -> Self {
        Self {
            runtime,
            module_name: module_name.into(),
            module: OnceCell::new(),
        }
    }

    /// The process-wide handle. See [`global`].
    pub fn global() -> Arc<EngineHandle> {
        global()
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Whether the foreign runtime has been started.
    pub fn is_initialized(&self) -> bool {
        self.module.initialized()
    }

    async fn module(&self) -> BridgeResult<&ForeignValue> {
        self.module
            .get_or_try_init(|| async {
                info!(module = %self.module_name, "starting foreign runtime");
                let module = self.runtime.start(&self.module_name).await?;
                debug!(module = %module, "engine module loaded");
                Ok::<_, BridgeError>(module)
            })
            .await
    }

    /// The loaded module, or one of its attributes.
    ///
    /// `attribute` is a dotted path resolved in the runtime's main namespace,
    /// e.g. `"IESopt.generate!"` or `"Docs.doc"`.
    pub async fn get(&self, attribute: Option<&str>) -> BridgeResult<ForeignValue> {
        let module = self.module().await?;
        match attribute {
            None => Ok(module.clone()),
            Some(path) => {
                debug!(attribute = path, "resolving engine attribute");
                self.runtime.resolve(path).await
            }
        }
    }

    /// Evaluate code without logging. Prefer [`crate::interop::safe_eval`].
    pub async fn eval(&self, code: &str) -> BridgeResult<ForeignValue> {
        self.module().await?;
        self.runtime.eval(code).await
    }

    pub async fn symbol(&self, text: &str) -> BridgeResult<ForeignValue> {
        self.module().await?;
        self.runtime.symbol(text).await
    }

    pub async fn call(
        &self,
        function: &ForeignValue,
        args: &[Arg],
        kwargs: &[(String, Arg)],
    ) -> BridgeResult<ForeignValue> {
        self.module().await?;
        self.runtime.call(function, args, kwargs).await
    }

    /// Free foreign values that are no longer needed.
    ///
    /// The loaded module itself is never released. Values must not be used
    /// after this returns.
    pub async fn release(&self, values: &[&ForeignValue]) -> BridgeResult<()> {
        let Some(module) = self.module.get() else {
            return Ok(());
        };
        let handles: Vec<u64> = values
            .iter()
            .map(|v| v.handle())
            .filter(|&h| h != module.handle())
            .collect();
        if handles.is_empty() {
            return Ok(());
        }
        self.runtime.release(&handles).await
    }

    /// Like [`release`](Self::release), but a failure is only logged.
    pub async fn discard(&self, values: &[&ForeignValue]) {
        if let Err(e) = self.release(values).await {
            debug!("failed to release foreign values: {e}");
        }
    }
}

/// Install the process-wide handle explicitly.
///
/// Returns the handle back if one is already installed (either explicitly or
/// by an earlier call to [`global`]).
pub fn install_global(handle: Arc<EngineHandle>) -> Result<(), Arc<EngineHandle>> {
    GLOBAL_HANDLE.set(handle)
}

/// The process-wide handle.
///
/// Unless one was installed with [`install_global`], the first call builds a
/// Julia-backed handle configured from the environment.
pub fn global() -> Arc<EngineHandle> {
    GLOBAL_HANDLE
        .get_or_init(|| {
            let config = EngineConfig::from_env().unwrap_or_else(|e| {
                warn!("invalid engine configuration in environment, using defaults: {e:#}");
                EngineConfig::default()
            });
            Arc::new(EngineHandle::new(Arc::new(JuliaRuntime::new(config))))
        })
        .clone()
}

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

use crate::bridge::EngineHandle;
use crate::model::{Model, ModelError, ModelOptions, ModelStatus, Verbosity};

/// Generate and optimize a model.
///
/// Optimization only runs if generation left the model `Generated`. A model
/// that failed to generate is returned as-is, in the `Failed` state, after
/// logging an error. Errors from the optimization step are returned.
pub async fn run(
    handle: Arc<EngineHandle>,
    source: impl Into<PathBuf>,
    verbosity: Verbosity,
    options: ModelOptions,
) -> Result<Model, ModelError> {
    let mut model = Model::new(handle, source, verbosity, options);

    if model.generate().await == ModelStatus::Generated {
        model.optimize().await?;
    } else {
        error!(
            source = %model.source().display(),
            "model could not be generated; skipping optimization"
        );
    }

    Ok(model)
}

/// Objective value to report for a finished run.
///
/// `None` unless the model is optimized. A model that solved but has no
/// readable objective (e.g. after an infeasible solve) is logged, not an error.
pub async fn reported_objective(model: &Model) -> Option<f64> {
    if model.status() != ModelStatus::Optimized {
        return None;
    }
    model
        .objective_value()
        .await
        .inspect_err(|e| warn!(source = %model.source().display(), "could not read objective value: {e}"))
        .ok()
}

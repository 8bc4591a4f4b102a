//! Startup banner and run summary display.

use std::path::Path;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::consts::{AUTHOR, HOMEPAGE, REPO};
use crate::model::{ModelStatus, Verbosity};
use crate::spinner::format_elapsed;

/// What is about to run, for the startup banner.
pub struct BannerInfo<'a> {
    pub source: &'a Path,
    pub engine: &'a EngineConfig,
    pub verbosity: Verbosity,
    pub db_path: &'a Path,
}

pub fn print_banner(info: &BannerInfo) {
    let project = info
        .engine
        .project
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(default environment)".to_string());
    let threads = info
        .engine
        .threads
        .map(|t| t.to_string())
        .unwrap_or_else(|| "auto".to_string());

    println!(
        r#"
   ╔═══════════════════════════════════════╗
   ║             I E S O P T               ║
   ╚═══════════════════════════════════════╝

   version   {}
   by        {}
   home      {}
   repo      {}
   model     {}
   verbose   {:?}
   julia     {}
   project   {}
   threads   {}
   config    {}
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        HOMEPAGE,
        REPO,
        info.source.display(),
        info.verbosity,
        info.engine.executable.display(),
        project,
        threads,
        info.db_path.display(),
    );
}

/// One-line outcome of a run.
pub fn run_summary(status: ModelStatus, objective: Option<f64>, elapsed: Option<Duration>) -> String {
    let mut line = format!("status: {status}");
    if let Some(objective) = objective {
        line.push_str(&format!(", objective: {objective}"));
    }
    if let Some(elapsed) = elapsed {
        line.push_str(&format!(", took {}", format_elapsed(elapsed)));
    }
    line
}

pub fn print_run_summary(status: ModelStatus, objective: Option<f64>, elapsed: Option<Duration>) {
    println!("{}", run_summary(status, objective, elapsed));
}

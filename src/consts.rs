//! Project-wide constants.

use std::path::PathBuf;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Name of the engine module loaded into the foreign runtime.
pub const ENGINE_MODULE: &str = "IESopt";

/// The only namespace documentation can be looked up in.
pub const DOCS_NAMESPACE: &str = "IESopt";

/// Julia executable used when nothing else is configured.
pub const DEFAULT_JULIA: &str = "julia";

/// File suffix of model definitions shipped as examples.
pub const EXAMPLE_SUFFIX: &str = ".iesopt.yaml";

/// Data folder that sits next to the example model definitions.
pub const EXAMPLE_DATA_DIR: &str = "files";

/// Default database path: `~/.iesopt/iesopt.db`, or `./iesopt.db` when the
/// home directory cannot be determined.
pub fn default_db_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".iesopt").join("iesopt.db"),
        None => PathBuf::from("iesopt.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consts_are_non_empty() {
        assert!(!AUTHOR.is_empty());
        assert!(!HOMEPAGE.is_empty());
        assert!(!REPO.is_empty());
        assert!(!DEFAULT_JULIA.is_empty());
    }

    #[test]
    fn docs_namespace_is_the_engine_module() {
        assert_eq!(DOCS_NAMESPACE, ENGINE_MODULE);
    }

    #[test]
    fn default_db_path_ends_with_db_file() {
        assert!(default_db_path().ends_with("iesopt.db"));
    }
}

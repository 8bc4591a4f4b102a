use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iesopt::banner::{BannerInfo, print_banner, print_run_summary};
use iesopt::bridge::julia::JuliaRuntime;
use iesopt::bridge::{self, EngineHandle};
use iesopt::config::{Config, EngineConfig};
use iesopt::consts::{DOCS_NAMESPACE, default_db_path};
use iesopt::interop::get_docs;
use iesopt::model::{ModelOptions, ModelStatus, Verbosity};
use iesopt::scaffold;
use iesopt::spinner::Spinner;

#[derive(Parser)]
#[command(name = "iesopt", version, about = "Generate and optimize IESopt models.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding persistent settings
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Generate and optimize a model
    Run {
        /// Path to the model definition file
        file: PathBuf,

        /// Engine verbosity: true, warning or false
        #[arg(long, default_value = "true")]
        verbosity: Verbosity,

        /// Extra engine option as key=value (value parsed as JSON if possible)
        #[arg(short = 'o', long = "option", value_parser = parse_option)]
        options: Vec<(String, serde_json::Value)>,
    },
    /// List the example models shipped with the engine
    Examples,
    /// Copy an example model (and its data folder) into a directory
    MakeExample {
        /// Example name, as printed by `iesopt examples`
        name: String,

        #[arg(long, default_value = ".")]
        dst_dir: PathBuf,

        /// File name for the copy, without the .iesopt.yaml suffix
        #[arg(long)]
        dst_name: Option<String>,
    },
    /// Print the documentation of an engine binding
    Docs {
        binding: String,

        #[arg(long, default_value = DOCS_NAMESPACE)]
        namespace: String,
    },
    /// Read or change persistent settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    Remove { key: String },
    List,
}

fn parse_option(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty option name in `{raw}`"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let db = db_path
        .to_str()
        .context("database path is not valid UTF-8")?;
    let store = Config::open(db)?;

    if let Command::Config { action } = &cli.command {
        return handle_config(&store, action);
    }

    let engine = EngineConfig::load(&store)?;
    let handle = Arc::new(EngineHandle::new(Arc::new(JuliaRuntime::new(engine.clone()))));
    if bridge::install_global(handle).is_err() {
        bail!("engine handle already installed");
    }
    let handle = EngineHandle::global();

    match cli.command {
        Command::Run {
            file,
            verbosity,
            options,
        } => {
            print_banner(&BannerInfo {
                source: &file,
                engine: &engine,
                verbosity,
                db_path: &db_path,
            });

            let options: ModelOptions = options.into_iter().collect();
            let spinner = (verbosity != Verbosity::Verbose).then(|| Spinner::start("running model"));
            let result = iesopt::run(handle, file, verbosity, options).await;
            let elapsed = match spinner {
                Some(spinner) => Some(spinner.stop().await),
                None => None,
            };

            let model = result?;
            let objective = iesopt::pipeline::reported_objective(&model).await;
            let status = model.status();
            if let Err(e) = model.close().await {
                warn!("failed to release engine-side model: {e}");
            }
            print_run_summary(status, objective, elapsed);
            if status != ModelStatus::Optimized {
                std::process::exit(1);
            }
        }
        Command::Examples => {
            for name in scaffold::examples(&handle).await? {
                println!("{name}");
            }
        }
        Command::MakeExample {
            name,
            dst_dir,
            dst_name,
        } => {
            let path =
                scaffold::make_example(&handle, &name, &dst_dir, dst_name.as_deref()).await?;
            println!("{}", path.display());
        }
        Command::Docs { binding, namespace } => {
            if namespace != DOCS_NAMESPACE {
                bail!("only the `{DOCS_NAMESPACE}` namespace is supported");
            }
            println!("{}", get_docs(&handle, &binding, &namespace).await?);
        }
        Command::Config { .. } => unreachable!("handled before the engine is configured"),
    }

    Ok(())
}

fn handle_config(store: &Config, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match store.get(key)? {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            store.set(key, value)?;
            println!("✓ {key} = {value}");
        }
        ConfigAction::Remove { key } => {
            store.remove(key)?;
            println!("✓ removed {key}");
        }
        ConfigAction::List => {
            for (key, value) in store.entries()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

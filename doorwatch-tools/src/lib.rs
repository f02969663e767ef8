use doorwatch::api::{CommandError, FetchError};
use doorwatch::{Config, ConfigError, InterfaceError};

use getopts::{Matches, Options};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    Options(#[from] getopts::Fail),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0}")]
    Usage(String),
}

/// Options shared by all doorwatch tools.
pub fn doorwatch_opts() -> Options {
    let mut opts = Options::new();
    opts.optflag("h", "help", "Show help");
    opts.optopt("c", "config", "YAML config file", "path");
    opts.optopt(
        "a",
        "api",
        &format!("API base URL (default {})", Config::default().api_url),
        "url",
    );
    opts.optopt(
        "p",
        "push",
        "Push server host:port, empty to disable (default localhost:3001)",
        "addr",
    );
    opts.optopt("n", "admin", "Administrator name for manual opens", "name");
    opts.optflag("v", "", "Verbose output");
    opts
}

pub fn parse_opts(opts: &Options, args: &[String]) -> Result<Matches, ToolError> {
    Ok(opts.parse(args.get(1..).unwrap_or(&[]))?)
}

pub fn usage(opts: &Options, program: &str, brief: &str) -> String {
    opts.usage(&format!("Usage: {} [options] {}", program, brief))
}

fn read_config_file(path: &str) -> Result<Config, ToolError> {
    let file = File::open(Path::new(path)).map_err(|source| ToolError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(serde_yaml::from_reader(file)?)
}

/// Config file, then environment, then command line.
pub fn load_config(matches: &Matches) -> Result<Config, ToolError> {
    let mut config = match matches.opt_str("c") {
        Some(path) => read_config_file(&path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(url) = matches.opt_str("a") {
        config.api_url = url;
    }
    if let Some(addr) = matches.opt_str("p") {
        config.push_addr = if addr.is_empty() { None } else { Some(addr) };
    }
    if let Some(name) = matches.opt_str("n") {
        config.admin_name = name;
    }
    config.validate()?;
    Ok(config)
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

/// Logs to stderr.
pub fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

/// Logs to a file, keeping the terminal free for the dashboard.
pub fn init_file_logging(path: &str, verbose: bool) -> Result<(), ToolError> {
    let file = File::create(path).map_err(|source| ToolError::Io {
        path: path.to_string(),
        source,
    })?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use picproxy::config::{self, Bootstrap};
use picproxy::logging;
use picproxy::runtime::{self, PidFile};
use picproxy::server;

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(name = "picproxy", about = "Caching proxy for remote images", version)]
struct Cli {
    /// Config file path; a missing default file means built-in defaults
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Listen address, overrides server.addr
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Cache directory, overrides storage.path
    #[arg(short = 'd', long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    runtime::mark_started();

    let (mut cfg, unknown) = read_config(&cli.config)?;
    logging::init(&cfg.logger, cli.verbose)?;

    if !unknown.is_empty() {
        if cfg.strict {
            bail!("unknown config fields: {}", unknown.join(", "));
        }
        log::warn!("ignoring unknown config fields: {}", unknown.join(", "));
    }

    if let Some(addr) = cli.listen {
        cfg.server.addr = addr;
    }
    if let Some(dir) = cli.cache_dir {
        cfg.storage.path = dir;
    }
    cfg.resolve_storage_path()?;
    cfg.validate()?;

    let _pid = match cfg.pidfile.as_deref() {
        Some(path) => Some(PidFile::create(Path::new(path))?),
        None => None,
    };

    log::info!(
        "picproxy {} starting, config {}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );
    let result = server::run(Arc::new(cfg)).await;
    if let Err(err) = &result {
        log::error!("picproxy stopped: {err:#}");
    }
    logging::flush();
    result
}

fn read_config(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    if path == Path::new(DEFAULT_CONFIG) && !path.exists() {
        return Ok((Bootstrap::default(), Vec::new()));
    }
    config::load(path)
}

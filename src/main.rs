use anyhow::{Context, Result};
use clap::Parser;
use manager::torrent_manager::{SessionConfig, TorrentManager};
use metadata::metainfo::Metainfo;
use rlimit::{getrlimit, setrlimit, Resource};
use std::cmp::min;
use std::env::current_dir;
use std::path::PathBuf;
use std::{fmt, fs};

mod bencoding;
mod bitfield;
mod manager;
mod metadata;
mod persistence;
mod torrent_protocol;
mod tracker;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long, env)]
    torrent_file: String,

    /// Optional base path where the file is downloaded (directory will be created if it does not exist), defaults to the current directory
    #[arg(short, long, env)]
    base_path: Option<PathBuf>,

    /// Optional listening port
    #[arg(short, long, env, default_value_t = 8000)]
    port: u16,

    /// Optional maximum number of connected peers
    #[arg(short, long, env, default_value_t = 20)]
    max_peers: usize,

    /// Do not upload to other peers and stop once the download is complete
    #[arg(long, env)]
    no_upload: bool,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

const MAX_OPENED_FILES: u64 = 16384;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    log::info!(
        "tatorrent {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT")
    );

    // bump ulimit if needed
    match getrlimit(Resource::NOFILE) {
        Ok((soft_limit, hard_limit)) if soft_limit < MAX_OPENED_FILES => {
            if let Err(e) = setrlimit(
                Resource::NOFILE,
                min(hard_limit, MAX_OPENED_FILES),
                hard_limit,
            ) {
                log::warn!("could not increase NOFILE ulimit: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("could not read current NOFILE ulimit: {e}"),
    }

    let base_path = match args.base_path {
        Some(p) => p,
        None => current_dir().context("could not determine the current directory")?,
    };

    let contents = fs::read(&args.torrent_file)
        .with_context(|| format!("could not read .torrent file {}", args.torrent_file))?;
    let metainfo = Metainfo::new(&contents)
        .context("the .torrent file is invalid: could not parse metainfo")?;
    log::info!("torrent file metainfo:\n{metainfo}");
    if metainfo.announce_urls().is_empty() {
        log::warn!("the .torrent file does not contain valid announces (\"announce-list\" or \"announce\" fields): only incoming peers will be served");
    }

    TorrentManager::new(
        metainfo,
        base_path,
        SessionConfig {
            port: args.port,
            max_peers: args.max_peers,
            upload: !args.no_upload,
        },
    )
    .start()
    .await
}

mod blob_file;
mod blob_upload;
mod blobs_dir;
mod config;
mod container;
mod error;
mod inode;
mod logging;
mod naming;
mod notify;
mod package;
mod prewarm;
mod reconcile;
mod refresher;
mod root;
mod val_file;
mod vals_dir;
mod valfs;

use clap::{Parser, Subcommand};
use log::error;
use std::path::PathBuf;

use crate::config::{api_key_from_env, ValfsConfig};
use crate::error::{FsError, FsResult};
use crate::logging::init_logging;
use crate::valfs::{run_mount, MountOptions};

#[derive(Parser, Debug)]
#[command(name = "valfs", version, about = "Mount a Val Town account as a filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount vals and blobs at MOUNTPOINT (or the configured root).
    Mount {
        mountpoint: Option<PathBuf>,
        /// Write JSON lines to this file instead of the console.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

fn mount(mountpoint: Option<PathBuf>, config: ValfsConfig) -> FsResult<()> {
    let mountpoint = mountpoint
        .or_else(|| config.root.clone())
        .ok_or_else(|| FsError::Invalid("no mount point given and no root configured".to_string()))?;
    let api_key = api_key_from_env()?;
    run_mount(MountOptions {
        mountpoint,
        config,
        api_key,
    })
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Mount {
            mountpoint,
            log_file,
        } => {
            let config = match ValfsConfig::load() {
                Ok(v) => v,
                Err(err) => {
                    eprintln!("load config failed: {}", err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = init_logging(log_file.as_deref(), config.fuse_debug) {
                eprintln!("init logging failed: {}", err);
                std::process::exit(1);
            }
            if let Err(err) = mount(mountpoint, config) {
                error!("mount valfs failed: {}", err);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod test_support;




#[cfg(test)]
mod valfs_tests;

use chrono::{SecondsFormat, Utc};
use env_logger::{Builder, Env, Target};
use log::{LevelFilter, Record};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{FsError, FsResult};

fn json_line(record: &Record) -> String {
    serde_json::json!({
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "level": record.level().as_str(),
        "target": record.target(),
        "msg": record.args().to_string(),
    })
    .to_string()
}

/// Console output on stderr, or JSON lines appended to `log_file`.
/// `RUST_LOG` still wins over the default `info` level.
pub fn init_logging(log_file: Option<&Path>, fuse_debug: bool) -> FsResult<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    if fuse_debug {
        builder.filter_module("fuser", LevelFilter::Debug);
    }

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FsError::Io(format!("open log file {} failed: {}", path.display(), e)))?;
        builder
            .format(|buf, record| writeln!(buf, "{}", json_line(record)))
            .target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| FsError::Io(format!("init logger failed: {}", e)))
}

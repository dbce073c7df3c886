use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FsError, FsResult};

pub const API_KEY_ENV: &str = "VAL_TOWN_API_KEY";
pub const CONFIG_ENV_PREFIX: &str = "VALFS_";
const CONFIG_FILE_STEM: &str = "config";
const CONFIG_EXTENSIONS: [&str; 4] = ["json", "toml", "yaml", "yml"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValfsConfig {
    /// Re-fetch a val on every open even when it is already loaded.
    pub do_reload: bool,
    /// Mount point used when none is given on the command line.
    pub root: Option<PathBuf>,
    pub deno_cache: bool,
    pub deno_json: bool,
    pub cursor_rules: bool,
    pub auto_refresh: bool,
    /// Seconds between two refreshes of a directory.
    pub auto_refresh_interval: u64,
    pub auto_unmount_on_exit: bool,
    pub enable_vals_directory: bool,
    pub enable_blobs_directory: bool,
    #[serde(alias = "goFuseDebug")]
    pub fuse_debug: bool,
    pub static_meta: bool,
    pub executable_vals: bool,
    pub api_base_url: String,
}

impl Default for ValfsConfig {
    fn default() -> Self {
        Self {
            do_reload: false,
            root: None,
            deno_cache: false,
            deno_json: true,
            cursor_rules: false,
            auto_refresh: true,
            auto_refresh_interval: 5,
            auto_unmount_on_exit: true,
            enable_vals_directory: true,
            enable_blobs_directory: true,
            fuse_debug: false,
            static_meta: false,
            executable_vals: false,
            api_base_url: valtown_lib::DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

impl ValfsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.auto_refresh_interval.max(1))
    }

    /// Loads the first config file found, then applies `VALFS_*` overrides
    /// from the process environment.
    pub fn load() -> FsResult<Self> {
        let mut dirs = vec![PathBuf::from(".")];
        if let Some(home) = dirs::home_dir() {
            dirs.push(home.join(".config").join("valfs"));
        }
        let mut config = match find_config_file(&dirs) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> FsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FsError::Io(format!("read {} failed: {}", path.display(), e)))?;
        let ext = path.extension().and_then(|v| v.to_str()).unwrap_or("");
        match ext {
            "json" => parse_with(path, || serde_json::from_str::<Self>(&content)),
            "toml" => parse_with(path, || toml::from_str::<Self>(&content)),
            "yaml" | "yml" => parse_with(path, || serde_yaml_ng::from_str::<Self>(&content)),
            other => Err(FsError::Invalid(format!(
                "unsupported config format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Overrides keys from `VALFS_<SCREAMING_SNAKE_KEY>` variables.
    pub fn apply_env<I>(&mut self, vars: I) -> FsResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(CONFIG_ENV_PREFIX) else {
                continue;
            };
            match key {
                "DO_RELOAD" => self.do_reload = parse_bool(&name, &value)?,
                "ROOT" => self.root = Some(PathBuf::from(value)),
                "DENO_CACHE" => self.deno_cache = parse_bool(&name, &value)?,
                "DENO_JSON" => self.deno_json = parse_bool(&name, &value)?,
                "CURSOR_RULES" => self.cursor_rules = parse_bool(&name, &value)?,
                "AUTO_REFRESH" => self.auto_refresh = parse_bool(&name, &value)?,
                "AUTO_REFRESH_INTERVAL" => {
                    self.auto_refresh_interval = value.trim().parse().map_err(|e| {
                        FsError::Invalid(format!("{}={} is not a number: {}", name, value, e))
                    })?
                }
                "AUTO_UNMOUNT_ON_EXIT" => self.auto_unmount_on_exit = parse_bool(&name, &value)?,
                "ENABLE_VALS_DIRECTORY" => {
                    self.enable_vals_directory = parse_bool(&name, &value)?
                }
                "ENABLE_BLOBS_DIRECTORY" => {
                    self.enable_blobs_directory = parse_bool(&name, &value)?
                }
                "FUSE_DEBUG" | "GO_FUSE_DEBUG" => self.fuse_debug = parse_bool(&name, &value)?,
                "STATIC_META" => self.static_meta = parse_bool(&name, &value)?,
                "EXECUTABLE_VALS" => self.executable_vals = parse_bool(&name, &value)?,
                "API_BASE_URL" => self.api_base_url = value,
                _ => {}
            }
        }
        Ok(())
    }
}

pub fn api_key_from_env() -> FsResult<String> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(FsError::Invalid(format!("{} is not set", API_KEY_ENV))),
    }
}

fn find_config_file(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| {
            CONFIG_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{}.{}", CONFIG_FILE_STEM, ext)))
        })
        .find(|path| path.is_file())
}

fn parse_with<T, E, F>(path: &Path, parse: F) -> FsResult<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
    T: DeserializeOwned,
{
    parse().map_err(|e| FsError::Invalid(format!("parse {} failed: {}", path.display(), e)))
}

fn parse_bool(name: &str, value: &str) -> FsResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(FsError::Invalid(format!(
            "{}={} is not a boolean",
            name, other
        ))),
    }
}

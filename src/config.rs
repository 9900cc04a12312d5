use std::{env, path::PathBuf, time::Duration};

use color_eyre::Result;
use config::{Environment, File};
use directories::ProjectDirs;
use educe::Educe;
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, de::Error};

const DEFAULT_CONFIG: &str = include_str!("../.config/config.json5");

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub config_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Educe)]
#[educe(Default)]
pub struct AutosaveConfig {
    /// Time without edits before a save fires.
    #[serde(deserialize_with = "human_duration")]
    #[educe(Default(expression = Duration::from_millis(500)))]
    pub quiet_interval: Duration,
}

#[derive(Clone, Debug, Deserialize, Educe)]
#[educe(Default)]
pub struct RealtimeConfig {
    #[serde(deserialize_with = "human_duration")]
    #[educe(Default(expression = Duration::from_secs(1)))]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "human_duration")]
    #[educe(Default(expression = Duration::from_secs(30)))]
    pub max_backoff: Duration,
    #[educe(Default = 256)]
    pub channel_capacity: usize,
}

#[derive(Clone, Debug, Deserialize, Educe)]
#[educe(Default)]
pub struct DatabaseConfig {
    #[educe(Default(expression = "memos.sqlite".into()))]
    pub file_name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default, flatten)]
    pub config: AppConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase().to_string();
    pub static ref DATA_FOLDER: Option<PathBuf> =
        env::var(format!("{}_DATA", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_CONFIG", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub static ref LOG_ENV: String = format!("{}_LOG_LEVEL", PROJECT_NAME.clone());
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

impl Config {
    pub fn new() -> Result<Self, config::ConfigError> {
        let data_dir = get_data_dir();
        let config_dir = get_config_dir();

        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.to_string_lossy().to_string())?
            .set_default("config_dir", config_dir.to_string_lossy().to_string())?
            .add_source(File::from_str(DEFAULT_CONFIG, config::FileFormat::Json5));

        let config_files = [
            ("config.json5", config::FileFormat::Json5),
            ("config.json", config::FileFormat::Json),
            ("config.yaml", config::FileFormat::Yaml),
            ("config.toml", config::FileFormat::Toml),
        ];
        for (file, format) in &config_files {
            let source = config::File::from(config_dir.join(file))
                .format(*format)
                .required(false);
            builder = builder.add_source(source);
        }

        let cfg: Self = builder
            .add_source(Environment::with_prefix(&PROJECT_NAME).separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(cfg)
    }

    /// Where the memo database lives unless overridden on the command line.
    pub fn database_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.database.file_name)
    }
}

fn human_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(D::Error::custom)
}

pub fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "memo-sync", env!("CARGO_PKG_NAME"))
}

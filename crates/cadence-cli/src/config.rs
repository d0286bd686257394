use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub worker: WorkerSettings,
}

/// Sweep settings for the materialization worker.
#[derive(Deserialize, Debug)]
pub struct WorkerSettings {
    /// Windows ending within this many months are due for work
    pub look_ahead_months: i32,
    /// Upper bound on organizations picked up per sweep
    pub max_organizations: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            look_ahead_months: 1,
            max_organizations: 50,
        }
    }
}

fn default_database_path() -> String {
    "cadence.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("cadence.toml"))
            .merge(Env::prefixed("CADENCE_"))
            .extract()
    }
}

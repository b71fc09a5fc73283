//! Configuration management for the CodeCell gateway.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_port() -> u16 {
    3000
}

fn default_max_concurrent() -> usize {
    5
}

fn default_cors_origin() -> String {
    "*".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("CODECELL"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

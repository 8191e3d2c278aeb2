//! Configuration loading.
//!
//! Values come from an optional `config/default.{toml,yaml,json}` file and
//! from `TOPICMQ_`-prefixed environment variables, where `__` separates the
//! section from the key (`TOPICMQ_BROKER__CLOSE_GRACE_MS=250`). Anything not
//! provided keeps its default.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, Settings};

pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("TOPICMQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        broker: BrokerSettings {
            close_grace_ms: partial
                .broker
                .as_ref()
                .and_then(|b| b.close_grace_ms)
                .unwrap_or(default.broker.close_grace_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}

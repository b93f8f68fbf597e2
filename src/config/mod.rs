//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, `config/default.*`
//! in the working directory, an optional explicit file, then environment
//! variables such as `RELAYMQ__BROKER__PORT=9000`.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    AuthScheme, AuthenticationSettings, BackPressureKind, BrokerSettings, PublisherSettings,
    ReceiverSettings, RetrySettings, ServiceSettings, Settings, TlsSettings,
};

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Like [`load_config`], with an extra required file layered on top of `config/default`.
pub fn load_config_from(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .add_source(
            Environment::with_prefix("RELAYMQ")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_over(Settings::default()))
}

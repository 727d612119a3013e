//! Configuration module.

mod settings;

pub use settings::{
    AuthSettings, CacheTtlSettings, ConfigError, ConsumerSettings, FanoutSettings, NotifySettings,
    PublishSettings, RelayConfig, RetrySettings, ServerSettings,
};

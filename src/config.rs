pub use self::parser::{
    BridgeConfig, Config, DatabaseConfig, DbType, LimitsConfig, LocalConfig, LoggingConfig,
    MetricsConfig, QueueConfig, RemoteConfig, SubscriptionsConfig, SyncDirection,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;

#[cfg(test)]
pub(crate) use self::parser::test_config;

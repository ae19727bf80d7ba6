use crate::config::cache::CacheConfig;
use crate::config::environment::{ENVIRONMENT_ENV_VAR_NAME, Environment};
use crate::config::queue::QueueStoreConfig;
use crate::config::tracing::Tracing;
use crate::config::worker::WorkerServiceConfig;
use crate::error::ErrandResult;
use crate::util::serde::default_true;
use ::tracing::warn;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, FileFormat};
use convert_case::Case;
use dotenvy::dotenv;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;

pub mod cache;
pub mod environment;
pub mod queue;
pub mod tracing;
pub mod worker;

pub type CustomConfig = BTreeMap<String, Value>;

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct AppConfig {
    pub environment: Environment,
    #[validate(nested)]
    pub app: App,
    #[validate(nested)]
    pub tracing: Tracing,
    #[validate(nested)]
    pub queue: QueueStoreConfig,
    #[validate(nested)]
    pub worker: WorkerServiceConfig,
    #[validate(nested)]
    pub cache: CacheConfig,
    /// Allows providing custom config values. Any configs that aren't pre-defined above
    /// will be collected here.
    ///
    /// # Examples
    ///
    /// ```toml
    /// [orders]
    /// notify-from = "orders@example.com"
    /// ```
    ///
    /// This will be parsed as:
    /// ```raw
    /// AppConfig#custom: {
    ///     "orders": {
    ///         "notify-from": "orders@example.com",
    ///     }
    /// }
    /// ```
    #[serde(flatten, default)]
    pub custom: CustomConfig,
}

pub const ENV_VAR_PREFIX: &str = "ERRAND";
pub const ENV_VAR_SEPARATOR: &str = "__";

impl AppConfig {
    /// Load the config from the `config/` directory in the current working directory.
    pub fn new(environment: Option<Environment>) -> ErrandResult<Self> {
        Self::new_with_config_dir(environment, Some(PathBuf::from("config/")))
    }

    // This runs before tracing is initialized, so we need to use `println` in order to
    // log from this method.
    #[allow(clippy::disallowed_macros)]
    pub fn new_with_config_dir(
        environment: Option<Environment>,
        config_dir: Option<PathBuf>,
    ) -> ErrandResult<Self> {
        dotenv().ok();

        let environment = if let Some(environment) = environment {
            println!("Using environment from CLI args: {environment:?}");
            environment
        } else {
            Environment::new()?
        };
        let environment_str = environment.to_string();

        let config_root_dir = config_dir.unwrap_or_else(|| PathBuf::from("config/"));

        println!("Loading configuration from directory {config_root_dir:?}");

        let config = Self::default_config();
        let config = config_env_file("default", &config_root_dir, config);
        let config = config_env_dir("default", &config_root_dir, config)?;
        let config = config_env_file(&environment_str, &config_root_dir, config);
        let config = config_env_dir(&environment_str, &config_root_dir, config)?;
        let config = config
            .add_source(
                config::Environment::default()
                    .prefix(ENV_VAR_PREFIX)
                    .convert_case(Case::Kebab)
                    .separator(ENV_VAR_SEPARATOR),
            )
            .set_override(ENVIRONMENT_ENV_VAR_NAME, environment_str)?
            .build()?;
        let config: AppConfig = config.try_deserialize()?;

        Ok(config)
    }

    /// Build a config for tests from the built-in defaults plus the given TOML. If no TOML is
    /// provided, a config suitable for most tests is used (in-memory queue store and cache).
    #[cfg(any(test, feature = "testing"))]
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn test(config_str: Option<&str>) -> ErrandResult<Self> {
        let config = Self::default_config()
            .add_source(config::File::from_str(
                config_str.unwrap_or(
                    r#"
                    environment = "test"

                    [app]
                    name = "Test"

                    [tracing]
                    level = "debug"

                    [worker]
                    # This field normally is determined by the number of CPU cores if not provided.
                    # We provide it in the test config to keep tests independent of the hardware.
                    num-workers = 2

                    [worker.enqueue-config]
                    queue = "default"

                    [worker.queue-fetch-config]
                    empty-delay = 0
                    error-delay = 0
                    "#,
                ),
                FileFormat::Toml,
            ))
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        Ok(config)
    }

    fn default_config() -> ConfigBuilder<DefaultState> {
        Config::builder()
            .add_source(config::File::from_str(
                include_str!("default.toml"),
                FileFormat::Toml,
            ))
            .add_source(crate::config::tracing::default_config())
    }

    pub fn validate(&self, exit_on_error: bool) -> ErrandResult<()> {
        let result = Validate::validate(self);
        if exit_on_error {
            result?;
        } else if let Err(err) = result {
            warn!("An error occurred when validating the app config: {}", err);
        }
        Ok(())
    }
}

/// Adds a config file in the relative path `config/{environment}.toml` to the
/// [`ConfigBuilder`]. If no such file exists, does nothing.
fn config_env_file(
    environment: &str,
    config_dir: &Path,
    config: ConfigBuilder<DefaultState>,
) -> ConfigBuilder<DefaultState> {
    let path = config_dir.join(format!("{environment}.toml"));
    if !path.is_file() {
        return config;
    }

    config.add_source(config::File::from(path))
}

/// Recursively adds all the config files in the given relative path `config/{environment}/` to the
/// [`ConfigBuilder`]. If no such directory exists, does nothing.
fn config_env_dir(
    environment: &str,
    config_dir: &Path,
    config: ConfigBuilder<DefaultState>,
) -> ErrandResult<ConfigBuilder<DefaultState>> {
    let path = config_dir.join(environment);
    if !path.is_dir() {
        return Ok(config);
    }

    config_env_dir_recursive(&path, config)
}

/// Helper method for [`config_env_dir`] to recursively add config files in the given path
/// to the [`ConfigBuilder`].
fn config_env_dir_recursive(
    path: &Path,
    config: ConfigBuilder<DefaultState>,
) -> ErrandResult<ConfigBuilder<DefaultState>> {
    fs::read_dir(path)?.try_fold(config, |config, dir_entry| {
        let path = dir_entry?.path();
        if path.is_dir() {
            config_env_dir_recursive(&path, config)
        } else if path.is_file() && path.extension().unwrap_or_default() == "toml" {
            Ok(config.add_source(config::File::from(path)))
        } else {
            Ok(config)
        }
    })
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct App {
    pub name: String,
    /// Stop the processor (and the rest of the app) if one of its tasks panics. Otherwise, the
    /// remaining tasks keep processing jobs.
    #[serde(default = "default_true")]
    pub shutdown_on_error: bool,
}

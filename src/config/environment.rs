use crate::config::{ENV_VAR_PREFIX, ENV_VAR_SEPARATOR};
use crate::error::ErrandResult;
use crate::error::config::ConfigError;
#[cfg(feature = "cli")]
use clap::ValueEnum;
#[cfg(feature = "cli")]
use clap::builder::PossibleValue;
use const_format::concatcp;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
#[cfg(feature = "cli")]
use std::sync::OnceLock;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Environment {
    Development,
    Test,
    Production,
    #[serde(untagged)]
    Custom(String),
}

#[cfg(feature = "cli")]
static ENV_VARIANTS: OnceLock<Vec<Environment>> = OnceLock::new();

const DEVELOPMENT: &str = "development";
const TEST: &str = "test";
const PRODUCTION: &str = "production";

// We need to manually implement (vs. deriving) `ValueEnum` in order to support the
// `Environment::Custom` variant.
#[cfg(feature = "cli")]
impl ValueEnum for Environment {
    fn value_variants<'a>() -> &'a [Self] {
        ENV_VARIANTS.get_or_init(|| {
            vec![
                Environment::Development,
                Environment::Test,
                Environment::Production,
                Environment::Custom("<custom>".to_string()),
            ]
        })
    }

    fn from_str(input: &str, _ignore_case: bool) -> Result<Self, String> {
        <Environment as FromStr>::from_str(input)
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Environment::Development => Some(PossibleValue::new(DEVELOPMENT).alias("dev")),
            Environment::Test => Some(PossibleValue::new(TEST)),
            Environment::Production => Some(PossibleValue::new(PRODUCTION).alias("prod")),
            Environment::Custom(custom) => Some(
                PossibleValue::new(custom).help("Any other value will be captured as a String."),
            ),
        }
    }
}

// We need to manually implement `Display` (vs. deriving `IntoStaticStr` from `strum`) in order to
// support the `Environment::Custom` variant.
impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "{DEVELOPMENT}"),
            Environment::Test => write!(f, "{TEST}"),
            Environment::Production => write!(f, "{PRODUCTION}"),
            Environment::Custom(custom) => write!(f, "{custom}"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let env = match s.trim().to_lowercase().as_str() {
            DEVELOPMENT | "dev" => Environment::Development,
            TEST => Environment::Test,
            PRODUCTION | "prod" => Environment::Production,
            "" => return Err("Environment can not be empty".to_owned()),
            _ => Environment::Custom(s.trim().to_owned()),
        };
        Ok(env)
    }
}

pub(crate) const ENVIRONMENT_ENV_VAR_NAME: &str = "ENVIRONMENT";

const ENV_VAR_WITH_PREFIX: &str =
    concatcp!(ENV_VAR_PREFIX, ENV_VAR_SEPARATOR, ENVIRONMENT_ENV_VAR_NAME);

impl Environment {
    // This runs before tracing is initialized, so we need to use `println` in order to
    // log from this method.
    #[allow(clippy::disallowed_macros)]
    pub fn new() -> ErrandResult<Self> {
        let environment = env::var(ENV_VAR_WITH_PREFIX)
            .map_err(|_| ConfigError::MissingEnvironment(ENV_VAR_WITH_PREFIX.to_owned()))?;
        let environment = <Environment as FromStr>::from_str(&environment).map_err(|err| {
            ConfigError::InvalidEnvironment(ENV_VAR_WITH_PREFIX.to_owned(), environment, err)
        })?;
        println!("Using environment from `{ENV_VAR_WITH_PREFIX}` env var: {environment:?}");
        Ok(environment)
    }
}

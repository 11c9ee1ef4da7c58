use std::fmt;
use std::io::Error;

/// Environment variable selecting the configuration overlay and the logging mode.
const ENVIRONMENT_VAR: &str = "APP_ENVIRONMENT";

const PROD: &str = "prod";
const STAGING: &str = "staging";
const DEV: &str = "dev";

/// Runtime environment of the replicator.
///
/// Selects `configuration/{environment}.yaml` on top of the base file and decides whether logs go
/// to rolling JSON files or to a pretty terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    /// Reads the environment from `APP_ENVIRONMENT`, defaulting to [`Environment::Prod`].
    pub fn load() -> Result<Environment, Error> {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(value) => value.try_into(),
            Err(_) => Ok(Environment::Prod),
        }
    }

    /// Exports this environment as `APP_ENVIRONMENT` for the current process.
    pub fn set(&self) {
        unsafe { std::env::set_var(ENVIRONMENT_VAR, self.to_string()) }
    }

    /// Production-like environments log to files instead of the terminal.
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod | Self::Staging)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Environment::Prod => PROD,
            Environment::Staging => STAGING,
            Environment::Dev => DEV,
        };

        f.write_str(name)
    }
}

impl TryFrom<String> for Environment {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            PROD => Ok(Self::Prod),
            STAGING => Ok(Self::Staging),
            DEV => Ok(Self::Dev),
            other => Err(Error::other(format!(
                "unsupported environment `{other}`, expected one of `{PROD}`, `{STAGING}` or `{DEV}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!(
            Environment::try_from("DEV".to_string()).unwrap(),
            Environment::Dev
        );
        assert_eq!(
            Environment::try_from(" staging ".to_string()).unwrap(),
            Environment::Staging
        );
        assert!(Environment::try_from("qa".to_string()).is_err());
    }

    #[test]
    fn staging_counts_as_production() {
        assert!(Environment::Staging.is_prod());
        assert!(Environment::Prod.is_prod());
        assert!(!Environment::Dev.is_prod());
    }
}

//! Environment variable lookups with typed errors.
//!
//! Secrets such as the open-data API key never live in the TOML settings; the
//! settings only name the variable and these helpers resolve it.

use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvVarError {
    /// The variable is not set at all.
    #[error("Missing environment variable: {0}")]
    Missing(String),

    /// The variable is set but holds only whitespace.
    #[error("Environment variable {0} is empty")]
    Empty(String),

    /// The variable is set but is not valid unicode.
    #[error("Environment variable {0} is not valid unicode")]
    NotUnicode(String),
}

/// Reads an environment variable, returning a structured error if it's missing
/// or blank. The returned value is trimmed.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, EnvVarError> {
    match optional_env_var(name)? {
        Some(value) => Ok(value),
        None => Err(EnvVarError::Missing(name.to_string())),
    }
}

/// Like [`get_env_var`] but treats an unset variable as `Ok(None)`.
///
/// A variable that is set to whitespace only is still an error: it is almost
/// always a deployment mistake rather than an intentional "no value".
pub fn optional_env_var(name: &str) -> Result<Option<String>, EnvVarError> {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                Err(EnvVarError::Empty(name.to_string()))
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(EnvVarError::NotUnicode(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_reported_by_name() {
        let name = "SHARED_UTILS_TEST_SURELY_UNSET_1F0A";
        assert_eq!(optional_env_var(name), Ok(None));
        assert_eq!(get_env_var(name), Err(EnvVarError::Missing(name.to_string())));
    }

    #[test]
    fn cargo_sets_package_name_for_tests() {
        assert_eq!(get_env_var("CARGO_PKG_NAME").as_deref(), Ok("shared_utils"));
    }
}

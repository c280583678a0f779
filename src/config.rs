//! Loads the bucket-rule config file named by `--rules` (§6), falling back to
//! [`crate::bucket_match::default_rules`] when no path is given.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::bucket_match::{self, BucketMatch, ConfigError as RuleError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rule file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error(transparent)]
    Rules(#[from] RuleError),
}

pub fn load_rules(path: Option<&Path>) -> Result<Vec<BucketMatch>, ConfigError> {
    match path {
        None => Ok(bucket_match::default_rules()),
        Some(path) => {
            let contents = fs::read_to_string(path)
                .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
            Ok(bucket_match::parse_rules(&contents)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_path_falls_back_to_defaults() {
        let rules = load_rules(None).unwrap();
        assert_eq!(rules.len(), bucket_match::default_rules().len());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = load_rules(Some(Path::new("/nonexistent/rules.json")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}

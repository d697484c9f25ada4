//! Small helpers shared by the binary crate's CLI parsing that don't belong
//! to any single protocol component.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("seed address {0:?} contains characters other than letters, digits, '.' and '-'")]
    InvalidSeed(String),
}

/// Splits a `--seeds` CLI value (`"host,host,..."`) into its individual
/// entries, trimming whitespace and dropping empty entries.
pub fn parse_seeds(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A seed entry must match `^[A-Za-z0-9.-]+$` (base spec §6's CLI surface).
pub fn validate_seed(seed: &str) -> Result<(), UtilError> {
    let ok = !seed.is_empty() && seed.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(UtilError::InvalidSeed(seed.to_string()))
    }
}

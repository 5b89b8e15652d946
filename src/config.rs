use std::{fs::File, io::Read, path::Path};

use jane_eyre::eyre::{self, Context};
use serde::Deserialize;
use tracing::debug;

use crate::gc::Unterminated;

/// Read from `gcdecode.toml` in the working directory if present, or the `--config` path.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub unterminated: Unterminated,
    pub output: Output,
    pub pretty: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    /// One `{"traceEvents": [...]}` document.
    #[default]
    Trace,
    /// One event per line.
    Lines,
}

pub static DEFAULT_PATH: &str = "gcdecode.toml";

impl Config {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let mut result = String::default();
        File::open(path)
            .wrap_err_with(|| format!("Failed to open config {}", path.display()))?
            .read_to_string(&mut result)?;
        let result: Config = toml::from_str(&result)
            .wrap_err_with(|| format!("Failed to parse config {}", path.display()))?;
        debug!(?path, ?result, "Loaded config");

        Ok(result)
    }

    /// Load `path` if given, otherwise [DEFAULT_PATH] if it exists, otherwise the defaults.
    pub fn load_or_default(path: Option<&str>) -> eyre::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if std::fs::exists(DEFAULT_PATH)? => Self::load(DEFAULT_PATH),
            None => Ok(Self::default()),
        }
    }
}

#[test]
fn test_load() -> eyre::Result<()> {
    let path = mktemp::Temp::new_file()?;
    std::fs::write(&path, "unterminated = \"drop\"\noutput = \"lines\"\n")?;
    assert_eq!(
        Config::load(&path)?,
        Config {
            unterminated: Unterminated::Drop,
            output: Output::Lines,
            pretty: false,
        }
    );
    Ok(())
}

#[test]
fn test_load_empty() -> eyre::Result<()> {
    let path = mktemp::Temp::new_file()?;
    assert_eq!(Config::load(&path)?, Config::default());
    assert_eq!(Config::default().unterminated, Unterminated::Flush);
    assert_eq!(Config::default().output, Output::Trace);
    Ok(())
}

#[test]
fn test_load_rejects_unknown_keys() -> eyre::Result<()> {
    let path = mktemp::Temp::new_file()?;
    std::fs::write(&path, "unterminated = \"flush\"\ncolour = true\n")?;
    assert!(Config::load(&path).is_err());
    std::fs::write(&path, "unterminated = \"keep\"\n")?;
    assert!(Config::load(&path).is_err());
    Ok(())
}

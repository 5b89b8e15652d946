use std::{fs::File, io::Read, path::Path};

use jane_eyre::eyre::{self, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::FormatError;

pub fn main(args: Vec<String>) -> eyre::Result<()> {
    let [path] = &args[..] else {
        bail!("Usage: gcdecode clock <systeminfo.json>");
    };
    let clock = ClockReference::load(path)?;
    info!(?clock, "Clock reference");
    println!("{}", serde_json::to_string(&clock)?);

    Ok(())
}

/// Maps the traced process's monotonic clock onto wall-clock time.
///
/// `process_start_offset_micros` is the monotonic sample taken when the wall-clock
/// reference was captured, and `absolute_reference_millis` is that wall-clock instant.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockReference {
    pub process_start_offset_micros: f64,
    pub absolute_reference_millis: f64,
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    clock: Clock,
}

#[derive(Debug, Deserialize)]
struct Clock {
    /// `[seconds, nanoseconds]`, as returned by `process.hrtime()`.
    hrtime: (f64, f64),
    /// Milliseconds since the Unix epoch.
    unixtime: f64,
}

impl ClockReference {
    pub fn new(process_start_offset_micros: f64, absolute_reference_millis: f64) -> Self {
        Self {
            process_start_offset_micros,
            absolute_reference_millis,
        }
    }

    /// Decode the clock reference out of a SystemInfo document.
    pub fn from_system_info(input: &[u8]) -> Result<Self, FormatError> {
        let value: Value = serde_json::from_slice(input).map_err(FormatError::MalformedPayload)?;
        let info: SystemInfo =
            serde_json::from_value(value).map_err(|e| FormatError::InvalidClock(e.to_string()))?;
        let (seconds, nanoseconds) = info.clock.hrtime;
        let result = Self::new(
            seconds * 1_000_000.0 + nanoseconds / 1000.0,
            info.clock.unixtime,
        );
        if !result.process_start_offset_micros.is_finite()
            || !result.absolute_reference_millis.is_finite()
        {
            return Err(FormatError::InvalidClock(format!(
                "non-finite clock values: {result:?}"
            )));
        }
        debug!(?result, "Decoded clock reference");

        Ok(result)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let mut input = vec![];
        File::open(path)?.read_to_end(&mut input)?;

        Self::from_system_info(&input)
    }
}

#[test]
fn test_from_system_info() -> jane_eyre::eyre::Result<()> {
    let clock = ClockReference::from_system_info(
        br#"{"clock":{"hrtime":[2,400000],"unixtime":33000000},"nodeVersions":{}}"#,
    )?;
    assert_eq!(clock, ClockReference::new(2_000_400.0, 33_000_000.0));
    Ok(())
}

#[test]
fn test_from_system_info_missing_unixtime() {
    let result = ClockReference::from_system_info(br#"{"clock":{"hrtime":[0,400000]}}"#);
    assert!(matches!(result, Err(FormatError::InvalidClock(_))));
}

#[test]
fn test_from_system_info_non_numeric_hrtime() {
    let result =
        ClockReference::from_system_info(br#"{"clock":{"hrtime":["0",400000],"unixtime":1}}"#);
    assert!(matches!(result, Err(FormatError::InvalidClock(_))));
}

#[test]
fn test_from_system_info_not_json() {
    let result = ClockReference::from_system_info(b"clock");
    assert!(matches!(result, Err(FormatError::MalformedPayload(_))));
}

#[test]
fn test_load() -> jane_eyre::eyre::Result<()> {
    let path = mktemp::Temp::new_file()?;
    std::fs::write(&path, r#"{"clock":{"hrtime":[0,400000],"unixtime":33000000}}"#)?;
    assert_eq!(
        ClockReference::load(&path)?,
        ClockReference::new(400.0, 33_000_000.0)
    );
    Ok(())
}

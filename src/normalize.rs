use crate::system_info::ClockReference;

/// Absolute start and end of an event, in fractional milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timestamps {
    pub start: f64,
    pub end: f64,
}

/// Convert a process-relative `(ts, dur)` pair in microseconds into absolute time.
///
/// Pure arithmetic. Nothing is rejected: a `ts` earlier than the clock reference gives
/// a timestamp before the reference, and NaN in gives NaN out.
pub fn normalize(ts: f64, dur: f64, clock: &ClockReference) -> Timestamps {
    let relative_millis = (ts - clock.process_start_offset_micros) / 1000.0;
    let start = clock.absolute_reference_millis + relative_millis;

    Timestamps {
        start,
        end: start + dur / 1000.0,
    }
}

#[test]
fn test_normalize() {
    let clock = ClockReference::new(400.0, 33_000_000.0);
    assert_eq!(
        normalize(1400.0, 500.0, &clock),
        Timestamps {
            start: 33_000_001.0,
            end: 33_000_001.5,
        }
    );
}

#[test]
fn test_normalize_keeps_sub_millisecond_precision() {
    let clock = ClockReference::new(0.0, 1000.0);
    let result = normalize(1.0, 2.0, &clock);
    assert!((result.start - 1000.001).abs() < 1e-9);
    assert!((result.end - 1000.003).abs() < 1e-9);
    assert_ne!(result.start, 1000.0);
}

#[test]
fn test_normalize_is_repeatable() {
    let clock = ClockReference::new(400.0, 33_000_000.0);
    assert_eq!(
        normalize(9400.0, 500.0, &clock),
        normalize(9400.0, 500.0, &clock)
    );
}

#[test]
fn test_normalize_before_reference() {
    let clock = ClockReference::new(2000.0, 33_000_000.0);
    let result = normalize(1000.0, 500.0, &clock);
    assert_eq!(result.start, 32_999_999.0);
    assert_eq!(result.end, 32_999_999.5);
}

#[test]
fn test_normalize_propagates_nan() {
    let clock = ClockReference::new(400.0, 33_000_000.0);
    let result = normalize(f64::NAN, 500.0, &clock);
    assert!(result.start.is_nan());
    assert!(result.end.is_nan());
    let result = normalize(1400.0, f64::NAN, &clock);
    assert_eq!(result.start, 33_000_001.0);
    assert!(result.end.is_nan());
}

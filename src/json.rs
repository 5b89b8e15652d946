use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Chromium JSON trace, object form.
///
/// Format spec: <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU>
#[derive(Clone, Debug, Default, Serialize)]
#[allow(non_snake_case)]
pub struct JsonTrace {
    pub traceEvents: Vec<TraceEvent>,
}

/// [JsonTrace] as read, before each event is looked at.
///
/// Events are deserialized one at a time so that a bad event can be skipped
/// without losing the rest of the trace.
#[derive(Clone, Debug, Deserialize)]
#[allow(non_snake_case)]
pub struct RawJsonTrace {
    pub traceEvents: Vec<Value>,
}

/// One trace event, either as recorded or after decoding.
///
/// Only `name`, `ts`, `dur` and `args` are interpreted. Everything else is carried
/// through untouched, including fields we have no name for. `ts` and `dur` are kept
/// as the JSON values they were recorded as, so integers stay integers.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TraceEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ph: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat: Option<Value>,
    #[serde(default, deserialize_with = "lenient_name")]
    pub name: String,
    /// Microseconds, process-relative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
    /// Microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<Value>,
    #[serde(default, deserialize_with = "lenient_args")]
    pub args: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub _rest: BTreeMap<String, Value>,
}

/// Non-string names become their JSON text, so they never match a GC phase.
fn lenient_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(name) => name,
        other => other.to_string(),
    })
}

/// Anything other than an object is read as empty args.
fn lenient_args<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(args) => args.into_iter().collect(),
        _ => BTreeMap::default(),
    })
}

fn as_f64_or_nan(value: &Option<Value>) -> f64 {
    value.as_ref().and_then(Value::as_f64).unwrap_or(f64::NAN)
}

impl TraceEvent {
    /// `ts`, or NaN if the event has none or it is not a number.
    pub fn ts_or_nan(&self) -> f64 {
        as_f64_or_nan(&self.ts)
    }

    /// `dur`, or NaN if the event has none or it is not a number.
    pub fn dur_or_nan(&self) -> f64 {
        as_f64_or_nan(&self.dur)
    }

    /// End of the event in trace time (`ts + dur`).
    pub fn end(&self) -> f64 {
        self.ts_or_nan() + self.dur_or_nan()
    }

    /// `ts + dur`, if both are integers and the sum fits.
    pub fn end_exact(&self) -> Option<i64> {
        let ts = self.ts.as_ref().and_then(Value::as_i64)?;
        let dur = self.dur.as_ref().and_then(Value::as_i64)?;
        ts.checked_add(dur)
    }
}

#[test]
fn test_trace_event_keeps_unknown_fields() -> jane_eyre::eyre::Result<()> {
    let event: TraceEvent = serde_json::from_str(
        r#"{"pid":10,"tid":1,"ph":"X","cat":"v8","name":"V8.GCScavenger","ts":1400,"dur":500,"args":{},"id":"0x1"}"#,
    )?;
    assert_eq!(event.name, "V8.GCScavenger");
    assert_eq!(event.ts, Some(1400.into()));
    assert_eq!(event.end(), 1900.0);
    assert_eq!(event.end_exact(), Some(1900));
    assert_eq!(event._rest.get("id"), Some(&Value::from("0x1")));

    let value = serde_json::to_value(&event)?;
    assert_eq!(value["id"], "0x1");
    assert_eq!(value["pid"], 10);
    assert_eq!(value["ts"], serde_json::json!(1400));
    assert!(value["ts"].is_u64());
    Ok(())
}

#[test]
fn test_trace_event_missing_timing() -> jane_eyre::eyre::Result<()> {
    let event: TraceEvent = serde_json::from_str(r#"{"name":"V8.GCScavenger"}"#)?;
    assert!(event.ts_or_nan().is_nan());
    assert!(event.end().is_nan());
    assert_eq!(event.end_exact(), None);

    let value = serde_json::to_value(&event)?;
    assert!(value.get("ts").is_none());
    assert!(value.get("pid").is_none());
    Ok(())
}

#[test]
fn test_trace_event_fractional_timing() -> jane_eyre::eyre::Result<()> {
    let event: TraceEvent =
        serde_json::from_str(r#"{"name":"V8.GCScavenger","ts":1400.5,"dur":500}"#)?;
    assert_eq!(event.end(), 1900.5);
    assert_eq!(event.end_exact(), None);
    assert_eq!(serde_json::to_value(&event)?["ts"], serde_json::json!(1400.5));
    Ok(())
}

#[test]
fn test_trace_event_malformed_fields() -> jane_eyre::eyre::Result<()> {
    let event: TraceEvent = serde_json::from_str(
        r#"{"name":7,"ph":1,"ts":"1400","dur":[500],"args":null}"#,
    )?;
    assert_eq!(event.name, "7");
    assert!(event.ts_or_nan().is_nan());
    assert!(event.dur_or_nan().is_nan());
    assert!(event.args.is_empty());

    // Bad values are kept as recorded.
    let value = serde_json::to_value(&event)?;
    assert_eq!(value["ts"], "1400");
    assert_eq!(value["dur"], serde_json::json!([500]));
    assert_eq!(value["ph"], 1);
    Ok(())
}

use std::{
    collections::VecDeque,
    fs::File,
    io::{stdout, BufWriter, Read, Write},
    vec,
};

use jane_eyre::eyre::{self, bail, Context, OptionExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Output},
    error::FormatError,
    gc::{Merger, Unterminated},
    json::{JsonTrace, RawJsonTrace, TraceEvent},
    normalize::normalize,
    system_info::ClockReference,
};

pub fn main(args: Vec<String>) -> eyre::Result<()> {
    let mut config_path = None;
    let mut paths = vec![];
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = Some(args.next().ok_or_eyre("Missing path after --config")?);
        } else {
            paths.push(arg);
        }
    }
    let [system_info_path, trace_path] = &paths[..] else {
        bail!("Usage: gcdecode decode <systeminfo.json> <traceevent.json> [--config <gcdecode.toml>]");
    };
    let config = Config::load_or_default(config_path.as_deref())?;

    let events = TraceEventDecoder::join(
        || ClockReference::load(system_info_path).wrap_err("Failed to load system info"),
        || -> eyre::Result<Vec<u8>> {
            let mut result = vec![];
            File::open(trace_path)
                .wrap_err("Failed to open trace events")?
                .read_to_end(&mut result)?;
            Ok(result)
        },
        config.unterminated,
    )?;

    let mut output = BufWriter::new(stdout().lock());
    match config.output {
        Output::Trace => {
            let trace = JsonTrace {
                traceEvents: events,
            };
            if config.pretty {
                serde_json::to_writer_pretty(&mut output, &trace)?;
            } else {
                serde_json::to_writer(&mut output, &trace)?;
            }
            writeln!(output)?;
        }
        Output::Lines => {
            for event in events {
                serde_json::to_writer(&mut output, &event)?;
                writeln!(output)?;
            }
        }
    }
    output.flush()?;

    Ok(())
}

/// Decodes a Chromium JSON trace of V8 GC events against a clock reference.
#[derive(Clone, Copy, Debug)]
pub struct TraceEventDecoder {
    clock: ClockReference,
    unterminated: Unterminated,
}

/// Decoded events, produced lazily and in order.
#[derive(Debug)]
pub struct DecodedEvents {
    clock: ClockReference,
    input: vec::IntoIter<TraceEvent>,
    merger: Option<Merger>,
    pending: VecDeque<TraceEvent>,
}

impl TraceEventDecoder {
    pub fn new(clock: ClockReference, unterminated: Unterminated) -> Self {
        Self {
            clock,
            unterminated,
        }
    }

    /// Parse a complete `{"traceEvents": [...]}` document.
    ///
    /// Entries of `traceEvents` that are not objects are skipped.
    pub fn parse(payload: &[u8]) -> Result<JsonTrace, FormatError> {
        let raw: RawJsonTrace =
            serde_json::from_slice(payload).map_err(FormatError::MalformedPayload)?;
        let mut events = Vec::with_capacity(raw.traceEvents.len());
        for (index, value) in raw.traceEvents.into_iter().enumerate() {
            match serde_json::from_value::<TraceEvent>(value) {
                Ok(event) => events.push(event),
                Err(error) => warn!(index, %error, "Skipping malformed trace event"),
            }
        }

        Ok(JsonTrace {
            traceEvents: events,
        })
    }

    pub fn events(&self, trace: JsonTrace) -> DecodedEvents {
        DecodedEvents {
            clock: self.clock,
            input: trace.traceEvents.into_iter(),
            merger: Some(Merger::new(self.unterminated)),
            pending: VecDeque::default(),
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Vec<TraceEvent>, FormatError> {
        let trace = Self::parse(payload)?;
        let input_len = trace.traceEvents.len();
        let result = self.events(trace).collect::<Vec<_>>();
        info!(input = input_len, output = result.len(), "Decoded trace events");

        Ok(result)
    }

    /// Wait for both the clock reference and the trace payload, then decode.
    ///
    /// The two sources run concurrently. If the clock source fails, its error is returned
    /// as is and the payload is dropped without being parsed, even if it was read first.
    #[tracing::instrument(level = "error", skip_all)]
    pub fn join<C, P, E>(
        clock_source: C,
        payload_source: P,
        unterminated: Unterminated,
    ) -> Result<Vec<TraceEvent>, E>
    where
        C: FnOnce() -> Result<ClockReference, E> + Send,
        P: FnOnce() -> Result<Vec<u8>, E> + Send,
        E: From<FormatError> + Send,
    {
        let (clock, payload) = rayon::join(clock_source, payload_source);
        let clock = clock?;
        let payload = payload?;
        debug!(?clock, payload_len = payload.len(), "Both inputs ready");

        Ok(Self::new(clock, unterminated).decode(&payload)?)
    }
}

/// Fill in `args.startTimestamp` and `args.endTimestamp` from the event's own `ts` and `dur`.
pub fn normalize_event(mut event: TraceEvent, clock: &ClockReference) -> TraceEvent {
    let timestamps = normalize(event.ts_or_nan(), event.dur_or_nan(), clock);
    event
        .args
        .insert("startTimestamp".to_owned(), Value::from(timestamps.start));
    event
        .args
        .insert("endTimestamp".to_owned(), Value::from(timestamps.end));
    event
}

impl Iterator for DecodedEvents {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(normalize_event(event, &self.clock));
            }
            let merger = self.merger.as_mut()?;
            match self.input.next() {
                Some(event) => self.pending.extend(merger.push(event)),
                None => {
                    let merger = self.merger.take()?;
                    self.pending.extend(merger.finish());
                }
            }
        }
    }
}

#[cfg(test)]
fn trace_event(name: &str, ts: u64, dur: u64) -> serde_json::Value {
    serde_json::json!({ "pid": 10, "tid": 1, "ph": "X", "cat": "v8", "args": {}, "name": name, "ts": ts, "dur": dur })
}

#[cfg(test)]
const TIME_OFFSET: f64 = 33000000.0;

#[cfg(test)]
fn clock() -> ClockReference {
    ClockReference::from_system_info(
        br#"{"clock":{"hrtime":[0,400000],"unixtime":33000000}}"#,
    )
    .expect("Failed to decode clock")
}

#[cfg(test)]
fn payload(events: &[serde_json::Value]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "traceEvents": events }))
        .expect("Failed to serialize payload")
}

#[cfg(test)]
fn timestamps(event: &TraceEvent) -> (Option<f64>, Option<f64>) {
    (
        event.args.get("startTimestamp").and_then(Value::as_f64),
        event.args.get("endTimestamp").and_then(Value::as_f64),
    )
}

#[test]
fn test_decode_combines_incremental_marking() -> jane_eyre::eyre::Result<()> {
    let input = payload(&[
        trace_event("V8.GCScavenger", 1400, 500),
        trace_event("V8.GCIncrementalMarkingStart", 2400, 50),
        trace_event("V8.GCIncrementalMarking", 3400, 1000),
        trace_event("V8.GCIncrementalMarking", 4400, 1000),
        trace_event("V8.GCIncrementalMarkingFinalize", 5400, 50),
        trace_event("V8.GCIncrementalMarking", 6400, 1000),
        trace_event("V8.GCFinalizeMC", 7400, 1000),
        trace_event("V8.GCScavenger", 8400, 500),
        trace_event("V8.GCIncrementalMarking", 9400, 500),
        trace_event("V8.GCCompactor", 10400, 500),
    ]);
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&input)?;

    let expected = [
        ("V8.GCScavenger", 1400, 500, 1.0, 1.5),
        ("V8.GCMarkSweepCompact", 2400, 6000, 2.0, 8.0),
        ("V8.GCScavenger", 8400, 500, 8.0, 8.5),
        ("V8.GCIncrementalMarking", 9400, 500, 9.0, 9.5),
        ("V8.GCCompactor", 10400, 500, 10.0, 10.5),
    ];
    assert_eq!(result.len(), expected.len());
    for (event, (name, ts, dur, start, end)) in result.iter().zip(expected) {
        assert_eq!(event.name, name);
        assert_eq!(event.ts, Some(Value::from(ts)));
        assert_eq!(event.dur, Some(Value::from(dur)));
        assert_eq!(event.pid, Some(Value::from(10)));
        assert_eq!(event.tid, Some(Value::from(1)));
        assert_eq!(event.ph, Some(Value::from("X")));
        assert_eq!(event.cat, Some(Value::from("v8")));
        assert_eq!(event.args.len(), 2);
        assert_eq!(
            timestamps(event),
            (Some(start + TIME_OFFSET), Some(end + TIME_OFFSET))
        );
    }
    Ok(())
}

#[test]
fn test_decode_pass_through_keeps_fields() -> jane_eyre::eyre::Result<()> {
    let mut scavenger = trace_event("V8.GCScavenger", 1400, 500);
    scavenger["args"] = serde_json::json!({ "type": "minor" });
    scavenger["id2"] = serde_json::json!({ "local": "0x2" });
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush)
        .decode(&payload(&[scavenger.clone()]))?;

    let [event] = &result[..] else {
        panic!("Expected exactly one event, got {result:?}");
    };
    assert_eq!(event.args.get("type"), Some(&Value::from("minor")));
    let mut value = serde_json::to_value(event)?;
    if let Some(args) = value["args"].as_object_mut() {
        args.retain(|key, _| key == "type");
    }
    assert_eq!(value, scavenger);
    assert_eq!(serde_json::from_value::<u64>(value["ts"].clone())?, 1400);
    assert_eq!(serde_json::from_value::<u64>(value["dur"].clone())?, 500);
    Ok(())
}

#[test]
fn test_decode_empty_trace() -> jane_eyre::eyre::Result<()> {
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&payload(&[]))?;
    assert!(result.is_empty());
    Ok(())
}

#[test]
fn test_decode_rejects_malformed_payload() {
    let decoder = TraceEventDecoder::new(clock(), Unterminated::Flush);
    let inputs: [&[u8]; 4] = [b"{\"traceEvents\": [", b"[]", b"{}", b"{\"traceEvents\": 1}"];
    for input in inputs {
        assert!(matches!(
            decoder.decode(input),
            Err(FormatError::MalformedPayload(_))
        ));
    }
}

#[test]
fn test_decode_event_without_ts() -> jane_eyre::eyre::Result<()> {
    let input = br#"{"traceEvents":[{"name":"V8.GCScavenger","dur":500},{"name":"V8.GCScavenger","ts":1400,"dur":500}]}"#;
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(input)?;
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].args.get("startTimestamp"), Some(&Value::Null));
    assert_eq!(result[0].args.get("endTimestamp"), Some(&Value::Null));
    assert_eq!(
        timestamps(&result[1]),
        (Some(1.0 + TIME_OFFSET), Some(1.5 + TIME_OFFSET))
    );
    Ok(())
}

#[test]
fn test_decode_event_with_non_numeric_timing() -> jane_eyre::eyre::Result<()> {
    let mut bad = trace_event("V8.GCScavenger", 1400, 500);
    bad["ts"] = Value::from("1400");
    let input = payload(&[bad, trace_event("V8.GCScavenger", 8400, 500)]);
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&input)?;
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].ts, Some(Value::from("1400")));
    assert_eq!(result[0].args.get("startTimestamp"), Some(&Value::Null));
    assert_eq!(
        timestamps(&result[1]),
        (Some(8.0 + TIME_OFFSET), Some(8.5 + TIME_OFFSET))
    );
    Ok(())
}

#[test]
fn test_decode_event_with_non_object_args() -> jane_eyre::eyre::Result<()> {
    let mut bad = trace_event("V8.GCScavenger", 1400, 500);
    bad["args"] = Value::Null;
    let input = payload(&[bad, trace_event("V8.GCScavenger", 8400, 500)]);
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&input)?;
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].args.len(), 2);
    assert_eq!(
        timestamps(&result[0]),
        (Some(1.0 + TIME_OFFSET), Some(1.5 + TIME_OFFSET))
    );
    assert_eq!(
        timestamps(&result[1]),
        (Some(8.0 + TIME_OFFSET), Some(8.5 + TIME_OFFSET))
    );
    Ok(())
}

#[test]
fn test_decode_skips_non_object_events() -> jane_eyre::eyre::Result<()> {
    let input = payload(&[
        Value::from(1),
        trace_event("V8.GCScavenger", 1400, 500),
        Value::Null,
    ]);
    let result = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&input)?;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].name, "V8.GCScavenger");
    Ok(())
}

#[test]
fn test_decode_unterminated_group() -> jane_eyre::eyre::Result<()> {
    let input = payload(&[
        trace_event("V8.GCIncrementalMarkingStart", 2400, 50),
        trace_event("V8.GCIncrementalMarking", 3400, 1000),
    ]);
    let flushed = TraceEventDecoder::new(clock(), Unterminated::Flush).decode(&input)?;
    assert_eq!(
        flushed.iter().map(|e| &*e.name).collect::<Vec<_>>(),
        ["V8.GCIncrementalMarkingStart", "V8.GCIncrementalMarking"]
    );
    assert_eq!(
        timestamps(&flushed[1]),
        (Some(3.0 + TIME_OFFSET), Some(4.0 + TIME_OFFSET))
    );

    let dropped = TraceEventDecoder::new(clock(), Unterminated::Drop).decode(&input)?;
    assert!(dropped.is_empty());
    Ok(())
}

#[test]
fn test_events_are_lazy() -> jane_eyre::eyre::Result<()> {
    let trace = TraceEventDecoder::parse(&payload(&[
        trace_event("V8.GCScavenger", 1400, 500),
        trace_event("V8.GCIncrementalMarkingStart", 2400, 50),
        trace_event("V8.GCFinalizeMC", 7400, 1000),
    ]))?;
    let mut events = TraceEventDecoder::new(clock(), Unterminated::Flush).events(trace);
    assert_eq!(events.next().map(|e| e.name), Some("V8.GCScavenger".to_owned()));
    assert_eq!(events.input.len(), 2);
    assert_eq!(
        events.next().map(|e| e.name),
        Some("V8.GCMarkSweepCompact".to_owned())
    );
    assert_eq!(events.next(), None);
    assert_eq!(events.next(), None);
    Ok(())
}

#[test]
fn test_join() -> jane_eyre::eyre::Result<()> {
    let result = TraceEventDecoder::join(
        || Ok::<_, jane_eyre::eyre::Report>(clock()),
        || Ok(payload(&[trace_event("V8.GCScavenger", 1400, 500)])),
        Unterminated::Flush,
    )?;
    assert_eq!(result.len(), 1);
    assert_eq!(
        timestamps(&result[0]),
        (Some(1.0 + TIME_OFFSET), Some(1.5 + TIME_OFFSET))
    );
    Ok(())
}

#[test]
fn test_join_propagates_clock_failure() {
    for input in [payload(&[]), b"not json".to_vec()] {
        let result = TraceEventDecoder::join(
            || Err(jane_eyre::eyre::eyre!("expected error")),
            move || Ok(input),
            Unterminated::Flush,
        );
        let Err(error) = result else {
            panic!("Expected an error");
        };
        assert_eq!(error.to_string(), "expected error");
        assert!(error.downcast_ref::<FormatError>().is_none());
    }
}

#[test]
fn test_join_propagates_malformed_payload() {
    let result = TraceEventDecoder::join(
        || Ok::<_, jane_eyre::eyre::Report>(clock()),
        || Ok(b"{}".to_vec()),
        Unterminated::Flush,
    );
    let Err(error) = result else {
        panic!("Expected an error");
    };
    assert!(matches!(
        error.downcast_ref::<FormatError>(),
        Some(FormatError::MalformedPayload(_))
    ));
}

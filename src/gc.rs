use std::mem;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::json::TraceEvent;

/// Name given to a coalesced incremental marking sequence.
pub static MARK_SWEEP_COMPACT: &str = "V8.GCMarkSweepCompact";

/// The V8 GC phases that take part in incremental marking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcEventName {
    IncrementalMarkingStart,
    IncrementalMarking,
    IncrementalMarkingFinalize,
    FinalizeMC,
}

impl GcEventName {
    pub const ALL: [Self; 4] = [
        Self::IncrementalMarkingStart,
        Self::IncrementalMarking,
        Self::IncrementalMarkingFinalize,
        Self::FinalizeMC,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncrementalMarkingStart => "V8.GCIncrementalMarkingStart",
            Self::IncrementalMarking => "V8.GCIncrementalMarking",
            Self::IncrementalMarkingFinalize => "V8.GCIncrementalMarkingFinalize",
            Self::FinalizeMC => "V8.GCFinalizeMC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// What to do with a merge group that is still open when the input ends.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Unterminated {
    /// Release the group's events unchanged, in input order.
    #[default]
    Flush,
    /// Discard the group's own events. Unrelated events held behind it are still released.
    Drop,
}

#[derive(Clone, Debug, PartialEq)]
enum Buffered {
    Member(TraceEvent),
    Unrelated(TraceEvent),
}

impl Buffered {
    fn event(&self) -> &TraceEvent {
        match self {
            Buffered::Member(event) | Buffered::Unrelated(event) => event,
        }
    }
}

/// An incremental marking sequence that has started but not yet reached `V8.GCFinalizeMC`.
///
/// Events that are not part of the sequence are held here too, so that they come out
/// after the merged event rather than before it.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeGroup {
    /// Always starts with the `V8.GCIncrementalMarkingStart` member.
    buffered: Vec<Buffered>,
    /// Index of the most recent member.
    last_member: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum MergeState {
    #[default]
    Idle,
    Collecting(MergeGroup),
}

impl MergeGroup {
    fn open(start: TraceEvent) -> Self {
        Self {
            buffered: vec![Buffered::Member(start)],
            last_member: 0,
        }
    }

    // Both indices only ever point at members: `open` puts the start event at 0,
    // and only `extend` moves `last_member`.
    pub fn first(&self) -> &TraceEvent {
        self.buffered[0].event()
    }

    pub fn last(&self) -> &TraceEvent {
        self.buffered[self.last_member].event()
    }

    fn extend(&mut self, event: TraceEvent) {
        self.last_member = self.buffered.len();
        self.buffered.push(Buffered::Member(event));
    }

    fn hold(&mut self, event: TraceEvent) {
        self.buffered.push(Buffered::Unrelated(event));
    }

    /// The combined event, followed by any events held behind the group.
    fn close(self) -> Vec<TraceEvent> {
        let first = self.first();
        let mut merged = first.clone();
        merged.name = MARK_SWEEP_COMPACT.to_owned();
        merged.dur = Some(merged_duration(first, self.last()));
        debug!(
            ts = ?merged.ts,
            dur = ?merged.dur,
            members = self.members().count(),
            "Merged incremental marking sequence"
        );

        let mut result = vec![merged];
        result.extend(self.buffered.into_iter().filter_map(|b| match b {
            Buffered::Member(_) => None,
            Buffered::Unrelated(event) => Some(event),
        }));
        result
    }

    fn members(&self) -> impl Iterator<Item = &TraceEvent> {
        self.buffered.iter().filter_map(|b| match b {
            Buffered::Member(event) => Some(event),
            Buffered::Unrelated(_) => None,
        })
    }

    fn abandon(self, policy: Unterminated) -> Vec<TraceEvent> {
        warn!(
            ts = ?self.first().ts,
            members = self.members().count(),
            ?policy,
            "Input ended inside an incremental marking sequence"
        );
        self.buffered
            .into_iter()
            .filter_map(|b| match (b, policy) {
                (Buffered::Member(event), Unterminated::Flush) => Some(event),
                (Buffered::Member(_), Unterminated::Drop) => None,
                (Buffered::Unrelated(event), _) => Some(event),
            })
            .collect()
    }
}

/// `last.ts + last.dur - first.ts`, kept as an integer when all three are integers.
fn merged_duration(first: &TraceEvent, last: &TraceEvent) -> Value {
    let exact = first
        .ts
        .as_ref()
        .and_then(Value::as_i64)
        .zip(last.end_exact())
        .and_then(|(start, end)| end.checked_sub(start));
    match exact {
        Some(dur) => Value::from(dur),
        None => Value::from(last.end() - first.ts_or_nan()),
    }
}

/// Advance the merge state by one event, returning the new state and the events released.
pub fn step(state: MergeState, event: TraceEvent) -> (MergeState, Vec<TraceEvent>) {
    use GcEventName::*;

    let kind = GcEventName::from_name(&event.name);
    trace!(name = event.name.as_str(), ?kind, "Merge step");
    match (state, kind) {
        (MergeState::Idle, Some(IncrementalMarkingStart)) => {
            (MergeState::Collecting(MergeGroup::open(event)), vec![])
        }
        (MergeState::Idle, _) => (MergeState::Idle, vec![event]),
        (MergeState::Collecting(mut group), Some(IncrementalMarking | IncrementalMarkingFinalize)) => {
            group.extend(event);
            (MergeState::Collecting(group), vec![])
        }
        (MergeState::Collecting(mut group), Some(FinalizeMC)) => {
            group.extend(event);
            (MergeState::Idle, group.close())
        }
        (MergeState::Collecting(mut group), _) => {
            group.hold(event);
            (MergeState::Collecting(group), vec![])
        }
    }
}

/// Release whatever is still buffered once the input has ended.
pub fn finish(state: MergeState, policy: Unterminated) -> Vec<TraceEvent> {
    match state {
        MergeState::Idle => vec![],
        MergeState::Collecting(group) => group.abandon(policy),
    }
}

/// Owns the merge state across a whole decode pass.
#[derive(Debug, Default)]
pub struct Merger {
    state: MergeState,
    unterminated: Unterminated,
}

impl Merger {
    pub fn new(unterminated: Unterminated) -> Self {
        Self {
            state: MergeState::Idle,
            unterminated,
        }
    }

    pub fn push(&mut self, event: TraceEvent) -> Vec<TraceEvent> {
        let (state, result) = step(mem::take(&mut self.state), event);
        self.state = state;
        result
    }

    pub fn finish(self) -> Vec<TraceEvent> {
        finish(self.state, self.unterminated)
    }

    #[cfg(test)]
    pub fn merge_all(
        events: impl IntoIterator<Item = TraceEvent>,
        unterminated: Unterminated,
    ) -> Vec<TraceEvent> {
        let mut merger = Self::new(unterminated);
        let mut result = vec![];
        for event in events {
            result.extend(merger.push(event));
        }
        result.extend(merger.finish());
        result
    }
}

#[cfg(test)]
fn event(name: &str, ts: u64, dur: u64) -> TraceEvent {
    TraceEvent {
        pid: Some(10.into()),
        tid: Some(1.into()),
        ph: Some("X".into()),
        cat: Some("v8".into()),
        name: name.to_owned(),
        ts: Some(ts.into()),
        dur: Some(dur.into()),
        ..Default::default()
    }
}

#[cfg(test)]
fn names(events: &[TraceEvent]) -> Vec<&str> {
    events.iter().map(|e| &*e.name).collect()
}

#[test]
fn test_from_name() {
    for kind in GcEventName::ALL {
        assert_eq!(GcEventName::from_name(kind.as_str()), Some(kind));
    }
    assert_eq!(GcEventName::from_name("V8.GCScavenger"), None);
    assert_eq!(GcEventName::from_name("GCIncrementalMarking"), None);
}

#[test]
fn test_merge_sequence() {
    let result = Merger::merge_all(
        [
            event("V8.GCIncrementalMarkingStart", 2400, 50),
            event("V8.GCIncrementalMarking", 3400, 1000),
            event("V8.GCIncrementalMarking", 4400, 1000),
            event("V8.GCIncrementalMarkingFinalize", 5400, 50),
            event("V8.GCIncrementalMarking", 6400, 1000),
            event("V8.GCFinalizeMC", 7400, 1000),
        ],
        Unterminated::Flush,
    );
    assert_eq!(
        result,
        [TraceEvent {
            dur: Some(Value::from(6000)),
            ..event(MARK_SWEEP_COMPACT, 2400, 0)
        }]
    );
}

#[test]
fn test_step_states() {
    let (state, released) = step(
        MergeState::Idle,
        event("V8.GCIncrementalMarkingStart", 2400, 50),
    );
    assert!(released.is_empty());
    let MergeState::Collecting(group) = &state else {
        panic!("Expected a merge group to be open");
    };
    assert_eq!(group.first().ts, Some(Value::from(2400)));
    assert_eq!(group.last().ts, Some(Value::from(2400)));

    let (state, released) = step(state, event("V8.GCIncrementalMarking", 3400, 1000));
    assert!(released.is_empty());
    let MergeState::Collecting(group) = &state else {
        panic!("Expected a merge group to be open");
    };
    assert_eq!(group.first().ts, Some(Value::from(2400)));
    assert_eq!(group.last().ts, Some(Value::from(3400)));

    // Unrelated events do not move the last member.
    let (state, released) = step(state, event("V8.GCScavenger", 3500, 10));
    assert!(released.is_empty());
    let MergeState::Collecting(group) = &state else {
        panic!("Expected a merge group to be open");
    };
    assert_eq!(group.last().ts, Some(Value::from(3400)));

    let (state, released) = step(state, event("V8.GCFinalizeMC", 7400, 1000));
    assert_eq!(state, MergeState::Idle);
    assert_eq!(names(&released), [MARK_SWEEP_COMPACT, "V8.GCScavenger"]);
    assert_eq!(released[0].ts, Some(Value::from(2400)));
    assert_eq!(released[0].dur, Some(Value::from(6000)));
}

#[test]
fn test_pass_through_when_idle() {
    let scavenger = TraceEvent {
        args: [("usedHeapSizeBefore".to_owned(), serde_json::json!(1024))]
            .into_iter()
            .collect(),
        ..event("V8.GCScavenger", 1400, 500)
    };
    let (state, released) = step(MergeState::Idle, scavenger.clone());
    assert_eq!(state, MergeState::Idle);
    assert_eq!(released, [scavenger]);
}

#[test]
fn test_standalone_marking_is_not_merged() {
    let result = Merger::merge_all(
        [
            event("V8.GCIncrementalMarking", 9400, 500),
            event("V8.GCIncrementalMarkingFinalize", 9900, 50),
            event("V8.GCFinalizeMC", 10000, 500),
        ],
        Unterminated::Flush,
    );
    assert_eq!(
        result,
        [
            event("V8.GCIncrementalMarking", 9400, 500),
            event("V8.GCIncrementalMarkingFinalize", 9900, 50),
            event("V8.GCFinalizeMC", 10000, 500),
        ]
    );
}

#[test]
fn test_unrelated_events_follow_merged_event() {
    let result = Merger::merge_all(
        [
            event("V8.GCScavenger", 1400, 500),
            event("V8.GCIncrementalMarkingStart", 2400, 50),
            event("V8.GCScavenger", 2500, 100),
            event("V8.GCIncrementalMarking", 3400, 1000),
            event("V8.GCCompactor", 4500, 100),
            event("V8.GCFinalizeMC", 7400, 1000),
            event("V8.GCScavenger", 8400, 500),
        ],
        Unterminated::Flush,
    );
    assert_eq!(
        result.iter().map(|e| (&*e.name, e.ts.clone())).collect::<Vec<_>>(),
        [
            ("V8.GCScavenger", Some(Value::from(1400))),
            (MARK_SWEEP_COMPACT, Some(Value::from(2400))),
            ("V8.GCScavenger", Some(Value::from(2500))),
            ("V8.GCCompactor", Some(Value::from(4500))),
            ("V8.GCScavenger", Some(Value::from(8400))),
        ]
    );
    assert_eq!(result[1].dur, Some(Value::from(6000)));
}

#[test]
fn test_start_inside_group_is_unrelated() {
    let result = Merger::merge_all(
        [
            event("V8.GCIncrementalMarkingStart", 2400, 50),
            event("V8.GCIncrementalMarkingStart", 2500, 50),
            event("V8.GCFinalizeMC", 3000, 100),
        ],
        Unterminated::Flush,
    );
    assert_eq!(
        names(&result),
        [MARK_SWEEP_COMPACT, "V8.GCIncrementalMarkingStart"]
    );
    assert_eq!(result[0].dur, Some(Value::from(700)));
    assert_eq!(result[1].ts, Some(Value::from(2500)));
}

#[test]
fn test_unterminated_group_is_flushed_unmerged() {
    let input = [
        event("V8.GCScavenger", 1400, 500),
        event("V8.GCIncrementalMarkingStart", 2400, 50),
        event("V8.GCIncrementalMarking", 3400, 1000),
        event("V8.GCCompactor", 4500, 100),
        event("V8.GCIncrementalMarkingFinalize", 5400, 50),
    ];
    let result = Merger::merge_all(input.clone(), Unterminated::Flush);
    assert_eq!(result, input);
}

#[test]
fn test_unterminated_group_is_dropped() {
    let result = Merger::merge_all(
        [
            event("V8.GCScavenger", 1400, 500),
            event("V8.GCIncrementalMarkingStart", 2400, 50),
            event("V8.GCIncrementalMarking", 3400, 1000),
            event("V8.GCCompactor", 4500, 100),
        ],
        Unterminated::Drop,
    );
    assert_eq!(names(&result), ["V8.GCScavenger", "V8.GCCompactor"]);
}

#[test]
fn test_merge_without_timing() {
    let mut start = event("V8.GCIncrementalMarkingStart", 2400, 50);
    start.ts = None;
    let result = Merger::merge_all(
        [start, event("V8.GCFinalizeMC", 7400, 1000)],
        Unterminated::Flush,
    );
    assert_eq!(names(&result), [MARK_SWEEP_COMPACT]);
    assert_eq!(result[0].ts, None);
    assert_eq!(result[0].dur, Some(Value::Null));
}

#[test]
fn test_merged_duration_stays_integer() -> jane_eyre::eyre::Result<()> {
    let result = Merger::merge_all(
        [
            event("V8.GCIncrementalMarkingStart", 2400, 50),
            event("V8.GCFinalizeMC", 7400, 1000),
        ],
        Unterminated::Flush,
    );
    let value = serde_json::to_value(&result[0])?;
    assert_eq!(value["ts"], serde_json::json!(2400));
    assert_eq!(value["dur"], serde_json::json!(6000));
    assert!(value["dur"].is_i64());
    Ok(())
}

#[test]
fn test_merged_duration_with_fractional_timing() {
    let start = TraceEvent {
        ts: Some(Value::from(2400.5)),
        ..event("V8.GCIncrementalMarkingStart", 0, 50)
    };
    let result = Merger::merge_all(
        [start, event("V8.GCFinalizeMC", 7400, 1000)],
        Unterminated::Flush,
    );
    assert_eq!(result[0].dur, Some(Value::from(5999.5)));
}

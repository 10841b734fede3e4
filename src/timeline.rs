// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::time::Instant;

use serde::Serialize;

/// Phases a participant can report against the shared monotonic origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ReleaseRequested,
    ReleaseCompleted,
    CohortStarted,
    CohortDrained,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::ReleaseRequested => "release requested",
            Phase::ReleaseCompleted => "release completed",
            Phase::CohortStarted => "cohort started",
            Phase::CohortDrained => "cohort drained",
        }
    }
}

/// One `(participant, phase, timestamp)` entry of the timing log.
#[derive(Clone, Debug, Serialize)]
pub struct Record {
    pub participant: String,
    pub phase: Phase,
    pub nanos: u64,
}

impl Record {
    /// Takes a timestamp against `origin` and prints the measurement line.
    /// Works from any thread or forked child sharing the origin.
    pub fn taken(origin: Instant, participant: &str, phase: Phase) -> Self {
        let nanos = origin.elapsed().as_nanos() as u64;
        let record = Record {
            participant: participant.to_owned(),
            phase,
            nanos,
        };
        println!(
            "[{:>4}.{:09}] {}: {}",
            nanos / 1_000_000_000,
            nanos % 1_000_000_000,
            record.participant,
            record.phase.label()
        );
        record
    }
}

#[derive(Debug, Serialize)]
pub struct ParticipantLatency {
    pub participant: String,
    pub nanos: u64,
}

/// Aggregate view of one run: per-participant release latency, the spread of
/// the whole cohort, and the slowest individual release.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub release_latencies: Vec<ParticipantLatency>,
    pub total_wall_ns: u64,
    pub max_individual_ns: u64,
}

/// Timing log over one monotonic origin, shared by every participant of a
/// run regardless of the concurrency shape.
pub struct Timeline {
    origin: Instant,
    records: Vec<Record>,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline {
            origin: Instant::now(),
            records: Vec::new(),
        }
    }

    /// The shared origin, for participants that record on their own.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Takes and keeps a timestamp for `participant`.
    pub fn stamp(&mut self, participant: &str, phase: Phase) {
        let record = Record::taken(self.origin, participant, phase);
        self.records.push(record);
    }

    /// Adopts a record taken elsewhere (worker thread, forked child).
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Folds the records into per-participant latencies and cohort totals.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();

        for completed in &self.records {
            if completed.phase != Phase::ReleaseCompleted {
                continue;
            }
            let requested = self.records.iter().find(|r| {
                r.phase == Phase::ReleaseRequested && r.participant == completed.participant
            });
            if let Some(requested) = requested {
                let nanos = completed.nanos.saturating_sub(requested.nanos);
                summary.max_individual_ns = summary.max_individual_ns.max(nanos);
                summary.release_latencies.push(ParticipantLatency {
                    participant: completed.participant.clone(),
                    nanos,
                });
            }
        }

        let first = self.records.iter().map(|r| r.nanos).min().unwrap_or(0);
        let last = self.records.iter().map(|r| r.nanos).max().unwrap_or(0);
        summary.total_wall_ns = last - first;

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(participant: &str, phase: Phase, nanos: u64) -> Record {
        Record {
            participant: participant.to_owned(),
            phase,
            nanos,
        }
    }

    #[test]
    fn test_summary_latencies() {
        let mut timeline = Timeline::new();
        timeline.push(record("a", Phase::ReleaseRequested, 100));
        timeline.push(record("a", Phase::ReleaseCompleted, 600));
        timeline.push(record("b", Phase::ReleaseRequested, 150));
        timeline.push(record("b", Phase::ReleaseCompleted, 1_150));

        let summary = timeline.summary();
        assert_eq!(summary.release_latencies.len(), 2);
        assert_eq!(summary.release_latencies[0].nanos, 500);
        assert_eq!(summary.release_latencies[1].nanos, 1_000);
        assert_eq!(summary.max_individual_ns, 1_000);
        assert_eq!(summary.total_wall_ns, 1_050);
    }

    #[test]
    fn test_summary_ignores_unpaired_records() {
        let mut timeline = Timeline::new();
        timeline.push(record("parent", Phase::CohortStarted, 10));
        timeline.push(record("parent", Phase::CohortDrained, 400));

        let summary = timeline.summary();
        assert!(summary.release_latencies.is_empty());
        assert_eq!(summary.max_individual_ns, 0);
        assert_eq!(summary.total_wall_ns, 390);
    }

    #[test]
    fn test_stamp_orders_records() {
        let mut timeline = Timeline::new();
        timeline.stamp("a", Phase::ReleaseRequested);
        timeline.stamp("a", Phase::ReleaseCompleted);
        let records = timeline.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].nanos <= records[1].nanos);
    }
}

//! Concurrent per-host steps with barrier semantics
//!
//! One campaign step (measure capacity, apply limits, clear limits, verify
//! units) touches every host. Hosts are independent, so the step is issued
//! concurrently with bounded parallelism, and the caller gets back the result
//! for every host before moving on. Nothing from a partially completed step
//! leaks into the next one.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one step across the fleet, in input order
#[derive(Debug)]
pub struct StepSummary<T, R, E> {
    /// Step name used in logs
    pub step: &'static str,
    /// Per-member results
    pub results: Vec<(T, Result<R, E>)>,
    /// Wall-clock time for the whole step
    pub duration: Duration,
}

impl<T, R, E> StepSummary<T, R, E> {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Members that failed, with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&T, &E)> {
        self.results
            .iter()
            .filter_map(|(member, r)| r.as_ref().err().map(|e| (member, e)))
    }

    /// All results if every member succeeded, otherwise every failure.
    ///
    /// # Errors
    /// Returns the failed members with their errors.
    pub fn into_all(self) -> Result<Vec<(T, R)>, Vec<(T, E)>> {
        let mut ok = Vec::with_capacity(self.results.len());
        let mut failed = Vec::new();
        for (member, result) in self.results {
            match result {
                Ok(value) => ok.push((member, value)),
                Err(e) => failed.push((member, e)),
            }
        }
        if failed.is_empty() { Ok(ok) } else { Err(failed) }
    }
}

/// Bounded-concurrency fan-out over fleet members
#[derive(Debug, Clone, Copy)]
pub struct Fleet {
    max_concurrent: usize,
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Fleet {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run `op` for every member and wait for all of them.
    pub async fn run<T, R, E, F, Fut>(&self, step: &'static str, members: Vec<T>, op: F) -> StepSummary<T, R, E>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let start = Instant::now();
        debug!(step, members = members.len(), "Starting fleet step");

        let mut indexed: Vec<(usize, T, Result<R, E>)> = stream::iter(members.into_iter().enumerate())
            .map(|(index, member)| {
                let fut = op(member.clone());
                async move { (index, member, fut.await) }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _, _)| *index);

        let summary = StepSummary {
            step,
            results: indexed
                .into_iter()
                .map(|(_, member, result)| (member, result))
                .collect(),
            duration: start.elapsed(),
        };

        info!(
            step,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            duration_ms = summary.duration.as_millis(),
            "Fleet step complete"
        );

        summary
    }
}

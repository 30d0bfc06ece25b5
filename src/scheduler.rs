//! Long-running scheduler: fires ingest-then-clean at declared wall-clock
//! moments.
//!
//! The loop is single-threaded with respect to pipeline runs: a run executes
//! inline, and any tick that comes due while it is still executing is
//! dropped, not queued. That keeps exactly one writer against the store.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::ingest::IngestEngine;
use crate::models::UpdateFrequency;
use crate::pipeline::{CleanOptions, CleaningPipeline};

/// Declared firing moments (seconds-resolution cron expressions, UTC):
/// hourly at :05, daily at 00:05, monthly on day 1 at 00:10, quarterly on
/// quarter start at 00:15.
fn cron_expr(frequency: UpdateFrequency) -> &'static str {
    match frequency {
        UpdateFrequency::Hourly => "0 5 * * * *",
        UpdateFrequency::Daily => "0 5 0 * * *",
        UpdateFrequency::Monthly => "0 10 0 1 * *",
        UpdateFrequency::Quarterly => "0 15 0 1 1,4,7,10 *",
    }
}

const FREQUENCIES: [UpdateFrequency; 4] = [
    UpdateFrequency::Hourly,
    UpdateFrequency::Daily,
    UpdateFrequency::Monthly,
    UpdateFrequency::Quarterly,
];

pub struct Scheduler {
    engine: IngestEngine,
    pipeline: CleaningPipeline,
}

impl Scheduler {
    pub fn new(engine: IngestEngine, pipeline: CleaningPipeline) -> Self {
        Self { engine, pipeline }
    }

    /// Tick loop. Returns on cancellation after draining the current run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let schedules: Vec<(UpdateFrequency, Schedule)> = FREQUENCIES
            .iter()
            .map(|&f| {
                let schedule = Schedule::from_str(cron_expr(f))
                    .unwrap_or_else(|e| panic!("invalid cron expression for {}: {e}", f.as_str()));
                (f, schedule)
            })
            .collect();

        info!("scheduler started");

        loop {
            let now = Utc::now();
            let Some((_, fire_at)) = next_fire(&schedules, now) else {
                warn!("no upcoming schedule; scheduler exiting");
                return Ok(());
            };
            // every frequency due at the same instant runs on this tick
            let due: Vec<UpdateFrequency> = schedules
                .iter()
                .filter(|(_, s)| s.after(&now).next() == Some(fire_at))
                .map(|(f, _)| *f)
                .collect();

            let wait = (fire_at - now).to_std().unwrap_or_default();
            info!(fire_at = %fire_at, due = due.len(), "next tick scheduled");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown signal received; scheduler exiting");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // runs execute inline: ticks for any frequency that come due
            // while one is in flight are dropped when we recompute below
            for frequency in due {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_once(frequency, cancel).await;
            }

            let after = Utc::now();
            for (f, schedule) in &schedules {
                let missed = schedule
                    .after(&fire_at)
                    .take_while(|t| *t <= after)
                    .count();
                if missed > 0 {
                    warn!(
                        frequency = f.as_str(),
                        dropped = missed,
                        "dropped ticks that came due during the previous run"
                    );
                }
            }
        }
    }

    async fn run_once(&self, frequency: UpdateFrequency, cancel: &CancellationToken) {
        info!(frequency = frequency.as_str(), "pipeline run starting");

        match self.engine.ingest(frequency, None, cancel).await {
            Ok(report) => {
                if report.raw_rows_written > 0 {
                    match self.pipeline.clean(&CleanOptions::default(), cancel).await {
                        Ok(_) => {}
                        Err(e) => warn!(
                            error_kind = e.error_kind(),
                            error = %e,
                            "cleaning failed; raw rows remain for the next run"
                        ),
                    }
                } else {
                    info!(
                        frequency = frequency.as_str(),
                        "no new raw rows; skipping cleaning"
                    );
                }
            }
            Err(e) => warn!(
                frequency = frequency.as_str(),
                error_kind = e.error_kind(),
                error = %e,
                "ingestion run failed"
            ),
        }

        info!(frequency = frequency.as_str(), "pipeline run finished");
    }
}

/// Earliest upcoming fire across all frequencies.
fn next_fire(
    schedules: &[(UpdateFrequency, Schedule)],
    now: DateTime<Utc>,
) -> Option<(UpdateFrequency, DateTime<Utc>)> {
    schedules
        .iter()
        .filter_map(|(f, schedule)| schedule.after(&now).next().map(|t| (*f, t)))
        .min_by_key(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedules() -> Vec<(UpdateFrequency, Schedule)> {
        FREQUENCIES
            .iter()
            .map(|&f| (f, Schedule::from_str(cron_expr(f)).unwrap()))
            .collect()
    }

    #[test]
    fn all_cron_expressions_parse() {
        for f in FREQUENCIES {
            assert!(Schedule::from_str(cron_expr(f)).is_ok(), "{}", f.as_str());
        }
    }

    #[test]
    fn hourly_fires_at_minute_five() {
        let schedules = schedules();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 9, 30, 0).unwrap();
        let (frequency, fire_at) = next_fire(&schedules, now).unwrap();
        assert_eq!(frequency, UpdateFrequency::Hourly);
        assert_eq!(fire_at, Utc.with_ymd_and_hms(2025, 6, 15, 10, 5, 0).unwrap());
    }

    #[test]
    fn daily_beats_hourly_just_after_midnight() {
        let schedules = schedules();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 0, 4, 0).unwrap();
        let (frequency, fire_at) = next_fire(&schedules, now).unwrap();
        // both hourly and daily fire at 00:05; either is acceptable as long
        // as the time is right
        assert_eq!(fire_at, Utc.with_ymd_and_hms(2025, 6, 15, 0, 5, 0).unwrap());
        assert!(matches!(
            frequency,
            UpdateFrequency::Hourly | UpdateFrequency::Daily
        ));
    }

    #[test]
    fn quarterly_fires_on_quarter_start() {
        let schedules = schedules();
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 23, 0, 0).unwrap();
        let quarterly = schedules
            .iter()
            .find(|(f, _)| *f == UpdateFrequency::Quarterly)
            .unwrap();
        let fire_at = quarterly.1.after(&now).next().unwrap();
        assert_eq!(fire_at, Utc.with_ymd_and_hms(2025, 4, 1, 0, 15, 0).unwrap());
    }
}

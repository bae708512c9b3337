//! Per-chunk outcome ledger.
//!
//! Every chunk of a job generation has at most one ledger entry. A new report is folded
//! into the job counters as the difference against that entry, so a redelivered chunk
//! replaces its earlier outcome instead of adding to it. Both stores share this planner
//! and differ only in how they lock and write.

use super::types::{
    ChunkDisposition, ChunkReport, ChunkStatus, ChunkTally, JobStatus, RowError,
};

/// Job columns the planner needs, read under the job row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub generation: i32,
    pub total_chunks: i32,
}

/// Signed adjustment to the job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub processed_rows: i32,
    pub created_count: i32,
    pub error_count: i32,
    pub chunks_completed: i32,
    pub chunks_failed: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTransition {
    /// Write `entry` to the ledger, add `delta` to the job, swap the chunk's row errors.
    Apply {
        delta: CounterDelta,
        entry: ChunkTally,
        previous: Option<ChunkStatus>,
    },
    Skip(ChunkDisposition),
}

pub fn plan_chunk_transition(
    job: &JobSnapshot,
    existing: Option<&ChunkTally>,
    report: &ChunkReport,
) -> ChunkTransition {
    if report.generation != job.generation {
        return ChunkTransition::Skip(ChunkDisposition::StaleGeneration {
            current: job.generation,
        });
    }
    if job.status != JobStatus::Processing {
        return ChunkTransition::Skip(ChunkDisposition::JobNotProcessing(job.status));
    }
    if report.chunk_index < 0 || report.chunk_index >= job.total_chunks {
        return ChunkTransition::Skip(ChunkDisposition::OutOfRange {
            total_chunks: job.total_chunks,
        });
    }

    let entry = ChunkTally::from(report);
    let mut delta = CounterDelta {
        processed_rows: entry.processed_rows,
        created_count: entry.created_count,
        error_count: entry.error_count,
        ..CounterDelta::default()
    };
    bump_status(&mut delta, entry.status, 1);

    match existing {
        None => ChunkTransition::Apply {
            delta,
            entry,
            previous: None,
        },
        Some(prior) if prior.status == ChunkStatus::Completed => {
            ChunkTransition::Skip(ChunkDisposition::AlreadyCompleted)
        }
        Some(prior) => {
            delta.processed_rows -= prior.processed_rows;
            delta.created_count -= prior.created_count;
            delta.error_count -= prior.error_count;
            bump_status(&mut delta, prior.status, -1);
            ChunkTransition::Apply {
                delta,
                entry,
                previous: Some(prior.status),
            }
        }
    }
}

/// Job error list after one chunk's recorded errors are replaced by `current`.
///
/// `previous` is what the ledger holds for the chunk, so each of its entries occurs in
/// `job_errors` exactly once. Errors of other chunks and file-level errors keep their order.
pub fn replace_chunk_errors(
    job_errors: Vec<RowError>,
    previous: &[RowError],
    current: &[RowError],
) -> Vec<RowError> {
    let mut stale = previous.to_vec();
    let mut errors: Vec<RowError> = job_errors
        .into_iter()
        .filter(|error| match stale.iter().position(|old| old == error) {
            Some(at) => {
                stale.swap_remove(at);
                false
            }
            None => true,
        })
        .collect();
    errors.extend(current.iter().cloned());
    errors
}

fn bump_status(delta: &mut CounterDelta, status: ChunkStatus, by: i32) {
    match status {
        ChunkStatus::Completed => delta.chunks_completed += by,
        ChunkStatus::Failed => delta.chunks_failed += by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RowError;

    fn processing(total_chunks: i32) -> JobSnapshot {
        JobSnapshot {
            status: JobStatus::Processing,
            generation: 0,
            total_chunks,
        }
    }

    fn report(status: ChunkStatus, processed: i32, created: i32, errors: i32) -> ChunkReport {
        ChunkReport {
            generation: 0,
            chunk_index: 0,
            status,
            processed_rows: processed,
            created_count: created,
            error_count: errors,
            errors: (0..errors)
                .map(|row| RowError::new(i64::from(row) + 1, "Name is required"))
                .collect(),
        }
    }

    #[test]
    fn first_outcome_adds_full_counts() {
        let plan = plan_chunk_transition(
            &processing(2),
            None,
            &report(ChunkStatus::Completed, 3, 2, 1),
        );

        assert_eq!(
            plan,
            ChunkTransition::Apply {
                delta: CounterDelta {
                    processed_rows: 3,
                    created_count: 2,
                    error_count: 1,
                    chunks_completed: 1,
                    chunks_failed: 0,
                },
                entry: ChunkTally {
                    status: ChunkStatus::Completed,
                    processed_rows: 3,
                    created_count: 2,
                    error_count: 1,
                },
                previous: None,
            }
        );
    }

    #[test]
    fn failed_chunk_upgraded_by_successful_redelivery_moves_counters() {
        let prior = ChunkTally {
            status: ChunkStatus::Failed,
            processed_rows: 5,
            created_count: 0,
            error_count: 5,
        };

        let plan = plan_chunk_transition(
            &processing(1),
            Some(&prior),
            &report(ChunkStatus::Completed, 5, 5, 0),
        );

        let ChunkTransition::Apply { delta, previous, .. } = plan else {
            panic!("expected an applied transition, got {plan:?}");
        };
        assert_eq!(previous, Some(ChunkStatus::Failed));
        assert_eq!(
            delta,
            CounterDelta {
                processed_rows: 0,
                created_count: 5,
                error_count: -5,
                chunks_completed: 1,
                chunks_failed: -1,
            }
        );
    }

    #[test]
    fn repeated_failure_keeps_chunk_counted_once() {
        let prior = ChunkTally {
            status: ChunkStatus::Failed,
            processed_rows: 4,
            created_count: 0,
            error_count: 4,
        };

        let plan = plan_chunk_transition(
            &processing(1),
            Some(&prior),
            &report(ChunkStatus::Failed, 4, 0, 4),
        );

        let ChunkTransition::Apply { delta, .. } = plan else {
            panic!("expected an applied transition, got {plan:?}");
        };
        assert_eq!(delta, CounterDelta::default());
    }

    #[test]
    fn duplicate_completed_delivery_is_ignored() {
        let prior = ChunkTally {
            status: ChunkStatus::Completed,
            processed_rows: 3,
            created_count: 3,
            error_count: 0,
        };

        let plan = plan_chunk_transition(
            &processing(1),
            Some(&prior),
            &report(ChunkStatus::Completed, 3, 3, 0),
        );
        assert_eq!(plan, ChunkTransition::Skip(ChunkDisposition::AlreadyCompleted));
    }

    #[test]
    fn reports_from_earlier_generations_are_stale() {
        let job = JobSnapshot {
            generation: 1,
            ..processing(1)
        };

        let plan = plan_chunk_transition(&job, None, &report(ChunkStatus::Completed, 1, 1, 0));
        assert_eq!(
            plan,
            ChunkTransition::Skip(ChunkDisposition::StaleGeneration { current: 1 })
        );
    }

    #[test]
    fn finalized_jobs_accept_no_more_outcomes() {
        let job = JobSnapshot {
            status: JobStatus::Completed,
            ..processing(1)
        };

        let plan = plan_chunk_transition(&job, None, &report(ChunkStatus::Failed, 1, 0, 1));
        assert_eq!(
            plan,
            ChunkTransition::Skip(ChunkDisposition::JobNotProcessing(JobStatus::Completed))
        );
    }

    #[test]
    fn replacing_a_chunk_drops_only_its_earlier_errors() {
        let file_error = RowError::new(0, "Source file not found");
        let other_chunk = RowError::new(7, "Price must be a positive number");
        let failed = vec![
            RowError::new(2, "Price must be a positive number"),
            RowError::new(1, "Failed to insert rows 1-3: connection reset"),
        ];
        let job_errors = vec![
            file_error.clone(),
            failed[0].clone(),
            other_chunk.clone(),
            failed[1].clone(),
        ];

        let retried = vec![RowError::new(2, "Price must be a positive number")];
        let errors = replace_chunk_errors(job_errors, &failed, &retried);

        assert_eq!(errors, vec![file_error, other_chunk, retried[0].clone()]);
    }

    #[test]
    fn identical_errors_from_another_chunk_survive_a_replacement() {
        let shared = RowError::new(4, "Name is required");
        let errors = replace_chunk_errors(
            vec![shared.clone(), shared.clone()],
            std::slice::from_ref(&shared),
            &[],
        );
        assert_eq!(errors, vec![shared]);
    }

    #[test]
    fn chunk_index_must_fall_inside_the_plan() {
        let mut outside = report(ChunkStatus::Completed, 1, 1, 0);
        outside.chunk_index = 2;

        let plan = plan_chunk_transition(&processing(2), None, &outside);
        assert_eq!(
            plan,
            ChunkTransition::Skip(ChunkDisposition::OutOfRange { total_chunks: 2 })
        );
    }
}

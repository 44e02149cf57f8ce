//! In-memory job table and its state machine.
//!
//! Every transition takes `now` explicitly so scheduling decisions are
//! deterministic and testable without a clock. The processor owns one table
//! behind a mutex and never holds it across an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::domain::job::{
    Job, JobConfig, JobFailure, JobId, JobOrigin, JobSpec, JobStatus, Recurrence,
};
use crate::jobs::{JobError, JobStats};

pub(crate) const DEADLINE_EXCEEDED_CODE: &str = "DEADLINE_EXCEEDED";

/// What happened to a job whose handler reported failure.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FailureDisposition {
    Retrying { job: Job, delay_ms: u64 },
    Failed { job: Job, cascaded: Vec<JobId> },
}

#[derive(Default)]
pub(crate) struct JobQueue {
    jobs: HashMap<JobId, Job>,
}

impl JobQueue {
    pub(crate) fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| status.map_or(true, |status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub(crate) fn non_terminal_count(&self) -> usize {
        self.jobs.values().filter(|job| !job.status.is_terminal()).count()
    }

    pub(crate) fn running_count(&self) -> usize {
        self.jobs.values().filter(|job| job.status == JobStatus::Running).count()
    }

    /// Validates and stores a new job. The handler check happens in the
    /// processor, which owns the registry.
    pub(crate) fn insert(
        &mut self,
        spec: JobSpec,
        defaults: &JobConfig,
        max_queue_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        if spec.job_type.trim().is_empty() {
            return Err(JobError::EmptyJobType);
        }
        let config = spec.config.clone().unwrap_or_else(|| defaults.clone());
        validate_job_config(&config)?;

        let id = match &spec.id {
            Some(id) if self.jobs.contains_key(id) => return Err(JobError::DuplicateId(id.clone())),
            Some(id) => id.clone(),
            None => JobId::generate(),
        };

        for dependency in &spec.dependencies {
            if dependency == &id {
                return Err(JobError::DependencyCycle(vec![id.clone(), id.clone()]));
            }
            let Some(upstream) = self.jobs.get(dependency) else {
                return Err(JobError::UnknownDependency(dependency.clone()));
            };
            if matches!(upstream.status, JobStatus::Failed | JobStatus::Cancelled) {
                return Err(JobError::DependencyFailed(dependency.clone()));
            }
        }
        if let Some(cycle) = self.find_cycle(&id, &spec.dependencies) {
            return Err(JobError::DependencyCycle(cycle));
        }

        if self.non_terminal_count() >= max_queue_size {
            return Err(JobError::QueueFull { limit: max_queue_size });
        }

        let job = Job::from_spec(id.clone(), spec, config, now);
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    /// Depth-first search from the candidate's dependencies back to the
    /// candidate; returns the offending path when one exists.
    fn find_cycle(&self, candidate: &JobId, dependencies: &BTreeSet<JobId>) -> Option<Vec<JobId>> {
        let mut visited = HashSet::new();
        let mut path = vec![candidate.clone()];
        for dependency in dependencies {
            if self.reaches(dependency, candidate, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn reaches(
        &self,
        node: &JobId,
        target: &JobId,
        visited: &mut HashSet<JobId>,
        path: &mut Vec<JobId>,
    ) -> bool {
        path.push(node.clone());
        if node == target {
            return true;
        }
        if visited.insert(node.clone()) {
            if let Some(job) = self.jobs.get(node) {
                for next in &job.dependencies {
                    if self.reaches(next, target, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    /// Moves `retrying` jobs whose backoff elapsed back to `pending`.
    pub(crate) fn promote_retrying(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut promoted = Vec::new();
        for job in self.jobs.values_mut() {
            if job.status == JobStatus::Retrying && job.available_at <= now {
                job.record(JobStatus::Pending, "backoff elapsed", now);
                promoted.push(job.id.clone());
            }
        }
        promoted.sort();
        promoted
    }

    /// Fails waiting jobs whose deadline has passed. Returns each failed job
    /// with the dependents cancelled because of it.
    pub(crate) fn expire_deadlines(&mut self, now: DateTime<Utc>) -> Vec<(Job, Vec<JobId>)> {
        let mut expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Retrying))
            .filter(|job| job.schedule.deadline.is_some_and(|deadline| deadline <= now))
            .map(|job| job.id.clone())
            .collect();
        expired.sort();

        let mut failed = Vec::new();
        for id in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.error = Some(
                JobFailure::terminal(format!("deadline passed before job `{id}` could run"))
                    .with_code(DEADLINE_EXCEEDED_CODE),
            );
            job.completed_at = Some(now);
            job.record(JobStatus::Failed, "deadline exceeded", now);
            let snapshot = job.clone();
            let cascaded = self.cascade_cancel(&id, now);
            failed.push((snapshot, cascaded));
        }
        failed
    }

    /// Claims up to `limit` ready jobs: pending, past `start_after`, every
    /// dependency completed, and below the per-type concurrency cap. Ordered
    /// by priority, then earliest `scheduled_at`.
    pub(crate) fn claim_ready(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<Job> {
        if limit == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .filter(|job| self.dependencies_completed(job))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.schedule.scheduled_at.cmp(&b.schedule.scheduled_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut running_by_type: HashMap<&str, usize> = HashMap::new();
        for job in self.jobs.values().filter(|job| job.status == JobStatus::Running) {
            *running_by_type.entry(job.job_type.as_str()).or_default() += 1;
        }

        let mut selected = Vec::new();
        for job in candidates {
            if selected.len() >= limit {
                break;
            }
            let running = running_by_type.entry(job.job_type.as_str()).or_default();
            if *running >= job.config.concurrency {
                continue;
            }
            *running += 1;
            selected.push(job.id.clone());
        }

        selected
            .into_iter()
            .filter_map(|id| {
                let job = self.jobs.get_mut(&id)?;
                job.started_at = Some(now);
                let note = if job.retry_count == 0 {
                    "claimed".to_owned()
                } else {
                    format!("claimed for retry {}", job.retry_count)
                };
                job.record(JobStatus::Running, note, now);
                Some(job.clone())
            })
            .collect()
    }

    fn dependencies_completed(&self, job: &Job) -> bool {
        job.dependencies.iter().all(|dependency| {
            self.jobs
                .get(dependency)
                .is_some_and(|upstream| upstream.status == JobStatus::Completed)
        })
    }

    /// Records handler progress for a running job.
    pub(crate) fn set_progress(&mut self, id: &JobId, progress: f64, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(id).filter(|job| job.status == JobStatus::Running) {
            job.progress = progress.clamp(0.0, 1.0);
            job.updated_at = now;
        }
    }

    /// `running → completed`. Returns `None` when the job is no longer
    /// running (cancelled while the handler was in flight).
    pub(crate) fn complete(
        &mut self,
        id: &JobId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let job = self.jobs.get_mut(id).filter(|job| job.status == JobStatus::Running)?;
        job.result = result;
        job.error = None;
        job.progress = 1.0;
        job.completed_at = Some(now);
        job.record(JobStatus::Completed, "handler succeeded", now);
        Some(job.clone())
    }

    /// Applies the retry policy to a failed run of a running job.
    pub(crate) fn fail(
        &mut self,
        id: &JobId,
        failure: JobFailure,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Option<FailureDisposition> {
        let job = self.jobs.get_mut(id).filter(|job| job.status == JobStatus::Running)?;
        job.result = result;

        if failure.retryable && job.retry_count < job.config.max_retries {
            let delay_ms = job.config.backoff().delay_ms_for(job.retry_count);
            job.retry_count += 1;
            job.available_at = now + Duration::milliseconds(delay_ms as i64);
            let note = format!(
                "retry {} of {} in {delay_ms}ms: {}",
                job.retry_count, job.config.max_retries, failure.message
            );
            job.error = Some(failure);
            job.record(JobStatus::Retrying, note, now);
            return Some(FailureDisposition::Retrying { job: job.clone(), delay_ms });
        }

        job.retries_exhausted = failure.retryable;
        let note = if failure.retryable {
            format!("retries exhausted: {}", failure.message)
        } else {
            format!("failed: {}", failure.message)
        };
        job.error = Some(failure);
        job.completed_at = Some(now);
        job.record(JobStatus::Failed, note, now);
        let snapshot = job.clone();
        let cascaded = self.cascade_cancel(id, now);
        Some(FailureDisposition::Failed { job: snapshot, cascaded })
    }

    /// Cancels a pending, retrying or running job and every dependent that
    /// can no longer run.
    pub(crate) fn cancel(
        &mut self,
        id: &JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Job, Vec<JobId>), JobError> {
        let job = self.jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.clone()))?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition { from: job.status, to: JobStatus::Cancelled });
        }
        job.completed_at = Some(now);
        job.record(JobStatus::Cancelled, format!("cancelled: {reason}"), now);
        let snapshot = job.clone();
        let cascaded = self.cascade_cancel(id, now);
        Ok((snapshot, cascaded))
    }

    /// Cancels, transitively, non-terminal jobs that depend on `root`.
    fn cascade_cancel(&mut self, root: &JobId, now: DateTime<Utc>) -> Vec<JobId> {
        let mut cancelled = Vec::new();
        let mut frontier = VecDeque::from([root.clone()]);

        while let Some(upstream) = frontier.pop_front() {
            let mut dependents: Vec<JobId> = self
                .jobs
                .values()
                .filter(|job| !job.status.is_terminal() && job.dependencies.contains(&upstream))
                .map(|job| job.id.clone())
                .collect();
            dependents.sort();

            for dependent in dependents {
                if let Some(job) = self.jobs.get_mut(&dependent) {
                    job.completed_at = Some(now);
                    job.record(
                        JobStatus::Cancelled,
                        format!("dependency `{upstream}` did not complete"),
                        now,
                    );
                }
                cancelled.push(dependent.clone());
                frontier.push_back(dependent);
            }
        }
        cancelled
    }

    /// Next occurrence of a completed recurring job.
    pub(crate) fn next_occurrence(job: &Job, now: DateTime<Utc>) -> Option<JobSpec> {
        let token = job.schedule.recurrence.as_deref()?;
        let next_at = now + Recurrence::parse(token).interval();
        let mut spec = job.to_spec();
        spec.schedule.scheduled_at = next_at;
        spec.schedule.start_after = Some(next_at);
        spec.origin =
            JobOrigin { recurrence_of: Some(job.id.clone()), ..job.origin.clone() };
        Some(spec)
    }

    /// Earliest future instant at which a waiting job becomes available.
    pub(crate) fn next_wake_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Retrying))
            .map(|job| job.available_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Drops terminal jobs finished at or before `cutoff`, keeping any that a
    /// waiting job still depends on.
    pub(crate) fn evict(&mut self, cutoff: DateTime<Utc>) -> usize {
        let still_needed: HashSet<JobId> = self
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .flat_map(|job| job.dependencies.iter().cloned())
            .collect();
        let before = self.jobs.len();
        self.jobs.retain(|id, job| {
            !(job.status.is_terminal()
                && job.completed_at.is_some_and(|at| at <= cutoff)
                && !still_needed.contains(id))
        });
        before - self.jobs.len()
    }

    pub(crate) fn stats(&self) -> JobStats {
        let mut stats = JobStats { total: self.jobs.len(), ..JobStats::default() };
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut durations = Vec::new();

        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            if !job.status.is_terminal() {
                *by_type.entry(job.job_type.clone()).or_default() += 1;
            }
            if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                if let (Some(started), Some(finished)) = (job.started_at, job.completed_at) {
                    durations.push((finished - started).num_milliseconds().max(0) as u64);
                }
            }
        }

        stats.queue_depth = stats.pending + stats.retrying;
        stats.waiting_by_type = by_type;
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.failure_rate = stats.failed as f64 / finished as f64;
        }
        if !durations.is_empty() {
            stats.average_processing_ms =
                Some(durations.iter().sum::<u64>() / durations.len() as u64);
        }
        stats
    }
}

fn validate_job_config(config: &JobConfig) -> Result<(), JobError> {
    if config.timeout_ms == 0 {
        return Err(JobError::InvalidConfig("timeout_ms must be greater than zero".to_owned()));
    }
    if config.concurrency == 0 {
        return Err(JobError::InvalidConfig("concurrency must be at least 1".to_owned()));
    }
    if config.retry_delay_ms > config.max_backoff_ms {
        return Err(JobError::InvalidConfig(format!(
            "retry_delay_ms ({}) must not exceed max_backoff_ms ({})",
            config.retry_delay_ms, config.max_backoff_ms
        )));
    }
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        return Err(JobError::InvalidConfig("backoff_multiplier must be at least 1.0".to_owned()));
    }
    Ok(())
}

//! Scheduler registration records.
//!
//! The scheduler itself is external. It is handed [`JobSpec`]s describing
//! when to fire, and calls the `run` method of the cache named by the job's
//! namespace with the job's [`RefreshTarget`].

use crate::config::CacheSettings;
use crate::error::{Error, Result};
use chrono::{DateTime, Days, NaiveTime, Utc};
use std::fmt;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Once a day at this UTC time of day.
    FixedTime(NaiveTime),
    /// Repeatedly, this long after the previous run.
    FixedInterval(Duration),
}

/// Which refresh protocol a job runs.
///
/// The job's namespace picks the cache. A `Full` job on an auxiliary
/// namespace runs that cache's `refresh_entire_cache`; auxiliary caches
/// have no incremental protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTarget {
    /// Rebuild and replace the whole namespace.
    Full,
    /// Merge entries changed since the stored watermark.
    Incremental,
}

impl fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshTarget::Full => write!(f, "full"),
            RefreshTarget::Incremental => write!(f, "incremental"),
        }
    }
}

/// One scheduled refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job_key: String,
    pub namespace: String,
    pub trigger: Trigger,
    pub target: RefreshTarget,
}

impl JobSpec {
    pub fn daily(
        job_key: impl Into<String>,
        namespace: impl Into<String>,
        at: NaiveTime,
        target: RefreshTarget,
    ) -> Self {
        JobSpec {
            job_key: job_key.into(),
            namespace: namespace.into(),
            trigger: Trigger::FixedTime(at),
            target,
        }
    }

    pub fn every(
        job_key: impl Into<String>,
        namespace: impl Into<String>,
        interval: Duration,
        target: RefreshTarget,
    ) -> Self {
        JobSpec {
            job_key: job_key.into(),
            namespace: namespace.into(),
            trigger: Trigger::FixedInterval(interval),
            target,
        }
    }

    /// Longest time between two consecutive runs.
    pub fn period(&self) -> Duration {
        match self.trigger {
            Trigger::FixedTime(_) => DAY,
            Trigger::FixedInterval(interval) => interval,
        }
    }

    /// First run strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.trigger {
            Trigger::FixedTime(at) => {
                let today = now.date_naive().and_time(at).and_utc();
                if today > now {
                    today
                } else {
                    today
                        .checked_add_days(Days::new(1))
                        .unwrap_or(today)
                }
            }
            Trigger::FixedInterval(interval) => chrono::Duration::from_std(interval)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Check that `ttl` outlives the gap between full rewrites of `namespace`.
///
/// Incremental updates only rewrite changed entries, so only `Full` jobs
/// keep every entry alive. With no TTL there is nothing to check.
///
/// # Errors
///
/// - `Error::ConfigError`: a TTL is set but no full refresh is scheduled for
///   the namespace, or the TTL does not exceed the full refresh period
pub fn validate_namespace_ttl(jobs: &[JobSpec], namespace: &str, ttl: Option<Duration>) -> Result<()> {
    let Some(ttl) = ttl else {
        return Ok(());
    };

    let period = jobs
        .iter()
        .filter(|j| j.namespace == namespace && j.target == RefreshTarget::Full)
        .map(JobSpec::period)
        .min()
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "namespace {} has a TTL but no full refresh job",
                namespace
            ))
        })?;

    if ttl <= period {
        return Err(Error::ConfigError(format!(
            "TTL {:?} for {} must exceed its refresh period {:?}",
            ttl, namespace, period
        )));
    }
    Ok(())
}

/// Jobs for the metadata and access-control caches described by `settings`.
pub fn default_jobs(settings: &CacheSettings) -> Vec<JobSpec> {
    vec![
        JobSpec::daily(
            "refresh-metadata-cache",
            &settings.metadata_namespace,
            settings.full_refresh_at,
            RefreshTarget::Full,
        ),
        JobSpec::every(
            "update-metadata-cache",
            &settings.metadata_namespace,
            settings.incremental_interval,
            RefreshTarget::Incremental,
        ),
        JobSpec::every(
            "refresh-acl-cache",
            &settings.acl_namespace,
            settings.acl_refresh_interval,
            RefreshTarget::Full,
        ),
    ]
}

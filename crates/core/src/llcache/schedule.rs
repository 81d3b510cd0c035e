//! Single-threaded timer queue for deferred cache work.

/// Deferred work the cache runs from [`super::Cache::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    /// Advance every handle toward its object's state.
    CatchUp,
    /// Write fresh objects to the backing store.
    Persist,
    /// Disable the backing store if writes have been too slow.
    SlowCheck,
}

/// Pending jobs with their due times in monotonic milliseconds.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: Vec<(Job, u64)>,
}

impl Schedule {
    /// Run `job` `delay_ms` after `now_ms`, replacing any pending run of it.
    /// A negative delay cancels the job.
    pub fn schedule(&mut self, now_ms: u64, delay_ms: i64, job: Job) {
        self.entries.retain(|(j, _)| *j != job);
        if let Ok(delay) = u64::try_from(delay_ms) {
            self.entries.push((job, now_ms.saturating_add(delay)));
        }
    }

    pub fn cancel(&mut self, job: Job) {
        self.entries.retain(|(j, _)| *j != job);
    }

    /// Remove and return the jobs due at `now_ms`, earliest first.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<Job> {
        let mut due: Vec<(Job, u64)> = Vec::new();
        self.entries.retain(|&(job, at)| {
            if at <= now_ms {
                due.push((job, at));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|&(_, at)| at);
        due.into_iter().map(|(job, _)| job).collect()
    }

    /// Earliest due time, if anything is pending.
    pub fn next_due(&self) -> Option<u64> {
        self.entries.iter().map(|&(_, at)| at).min()
    }

    pub fn is_scheduled(&self, job: Job) -> bool {
        self.entries.iter().any(|(j, _)| *j == job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reschedule_replaces() {
        let mut schedule = Schedule::default();
        schedule.schedule(0, 100, Job::Persist);
        schedule.schedule(0, 5000, Job::Persist);
        assert!(schedule.take_due(100).is_empty());
        assert_eq!(schedule.take_due(5000), vec![Job::Persist]);
    }

    #[test]
    fn test_negative_delay_cancels() {
        let mut schedule = Schedule::default();
        schedule.schedule(0, 100, Job::Persist);
        schedule.schedule(0, -1, Job::Persist);
        assert!(!schedule.is_scheduled(Job::Persist));
        assert_eq!(schedule.next_due(), None);
    }

    #[test]
    fn test_take_due_orders_by_time() {
        let mut schedule = Schedule::default();
        schedule.schedule(0, 50, Job::SlowCheck);
        schedule.schedule(0, 0, Job::CatchUp);
        schedule.schedule(0, 500, Job::Persist);
        assert_eq!(schedule.take_due(60), vec![Job::CatchUp, Job::SlowCheck]);
        assert_eq!(schedule.next_due(), Some(500));
    }
}

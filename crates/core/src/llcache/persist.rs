//! Bandwidth-limited writeout of fresh objects to the backing store.
//!
//! A pass writes objects until either the time quantum or the byte budget
//! for one quantum (`maximum_bandwidth * time_quantum`) is used up, then
//! schedules the next pass from the bandwidth it achieved. Writeout that
//! stays below `minimum_bandwidth` disables the backing store.

use super::metadata;
use super::object::{FetchState, ObjectId, StoreState};
use super::schedule::Job;
use super::store::ListKind;
use super::Cache;
use crate::Error;
use crate::backing::StoreFlags;

/// Objects considered by one persistence pass.
const MAX_PERSIST_CANDIDATES: usize = 128;

impl Cache {
    /// Cached objects worth writing to the backing store.
    fn persist_candidates(&self, now: i64) -> Vec<ObjectId> {
        self.objects
            .ids(ListKind::Cached)
            .into_iter()
            .filter(|id| {
                self.objects.get(*id).is_some_and(|o| {
                    matches!(o.url.scheme(), "http" | "https")
                        && o.candidate_count == 0
                        && o.fetch.handle.is_none()
                        && o.fetch.state == FetchState::Complete
                        && !o.fetch.failed
                        && o.store_state == StoreState::Ram
                        && o.source.is_some()
                        && o.cache.remaining_lifetime(now) > self.params.minimum_lifetime
                })
            })
            .take(MAX_PERSIST_CANDIDATES)
            .collect()
    }

    /// Write one object's source and metadata.
    ///
    /// Returns the bytes written and the milliseconds taken (at least 1).
    fn write_backing_store(&mut self, id: ObjectId) -> Result<(u64, u64), Error> {
        let start = self.clock.monotonic_ms();
        let Some(object) = self.objects.get(id) else {
            return Ok((0, 1));
        };
        let source = object.source.as_deref().unwrap_or_default();

        self.backing.store(&object.url, StoreFlags::None, source)?;
        let meta = metadata::serialise(object);
        if let Err(e) = self.backing.store(&object.url, StoreFlags::Meta, &meta) {
            if let Err(e) = self.backing.invalidate(&object.url) {
                tracing::debug!(url = %object.url, error = %e, "backing store invalidate failed");
            }
            return Err(e);
        }
        if let Err(e) = self.backing.release(&object.url, StoreFlags::Meta) {
            tracing::debug!(url = %object.url, error = %e, "backing store release failed");
        }
        let written = (source.len() + meta.len()) as u64;

        if let Some(object) = self.objects.get_mut(id) {
            object.store_state = StoreState::Disc;
        }
        let elapsed = self.clock.monotonic_ms().saturating_sub(start).max(1);
        Ok((written, elapsed))
    }

    /// Run one persistence pass and schedule the next.
    pub(super) fn persist(&mut self) {
        if !self.store_enabled {
            return;
        }
        let now = self.clock.now();
        let quantum = self.params.time_quantum;
        let write_limit = (self.params.maximum_bandwidth * quantum / 1000).max(1);
        let to_delay = |ms: u64| i64::try_from(ms).unwrap_or(i64::MAX);

        let mut total_written: u64 = 0;
        let mut total_elapsed: u64 = 1;
        let mut next = None;

        for id in self.persist_candidates(now) {
            match self.write_backing_store(id) {
                Ok((written, elapsed)) => {
                    total_written += written;
                    total_elapsed += elapsed;
                }
                Err(e) => {
                    tracing::warn!(?id, error = %e, "failed to persist object");
                    continue;
                }
            }

            let bandwidth = total_written * 1000 / total_elapsed;
            let throttled = to_delay(total_written * quantum / write_limit) - to_delay(total_elapsed);

            if total_elapsed > quantum {
                if bandwidth < self.params.minimum_bandwidth {
                    tracing::info!(bandwidth, "backing store below minimum bandwidth; checking later");
                    self.schedule.schedule(self.clock.monotonic_ms(), to_delay(quantum * 100), Job::SlowCheck);
                    next = Some(-1);
                } else if bandwidth > self.params.maximum_bandwidth {
                    next = Some(throttled);
                } else {
                    next = Some(to_delay(quantum));
                }
                break;
            }
            if total_written > write_limit {
                next = Some(if bandwidth > self.params.maximum_bandwidth {
                    throttled
                } else {
                    to_delay(quantum) - to_delay(total_elapsed)
                });
                break;
            }
        }

        let next = next.unwrap_or(if total_written > 0 { to_delay(quantum) - to_delay(total_elapsed) } else { -1 });

        self.total_written += total_written;
        self.total_elapsed += total_elapsed;
        if total_written > 0 {
            tracing::info!(written = total_written, elapsed_ms = total_elapsed, next, "persisted objects");
        }
        self.schedule.schedule(self.clock.monotonic_ms(), next, Job::Persist);
    }

    /// Disable the backing store if writeout has been persistently slow.
    pub(super) fn persist_slowcheck(&mut self) {
        let minimum = self.params.minimum_bandwidth;
        if self.total_written <= 2 * minimum {
            return;
        }
        let bandwidth = self.total_written * 1000 / self.total_elapsed.max(1);
        if bandwidth >= minimum {
            return;
        }

        tracing::warn!(bandwidth, minimum, "backing store writeout too slow; disabling");
        self.store_enabled = false;
        self.schedule.cancel(Job::Persist);
        if let Err(e) = self.backing.finalise() {
            tracing::warn!(error = %e, "backing store finalise failed");
        }
    }
}

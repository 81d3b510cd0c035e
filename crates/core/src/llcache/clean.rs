//! Reclaiming RAM from unreferenced objects.

use super::Cache;
use super::object::StoreState;
use super::store::ListKind;

impl Cache {
    /// Reclaim memory, cheapest losses first.
    ///
    /// Unreferenced uncachable and stale objects always go. While still over
    /// the RAM limit (0 when `purge` is set) the cleaner persists, then drops
    /// RAM copies of disc-backed objects, then disc-backed objects, and
    /// finally RAM-only objects.
    pub fn clean(&mut self, purge: bool) {
        let limit = if purge { 0 } else { self.params.limit };
        let now = self.clock.now();
        let mut size = 0usize;

        for id in self.objects.ids(ListKind::Uncached) {
            let Some(object) = self.objects.get(id) else { continue };
            if object.is_unreferenced() {
                self.destroy_object(id);
            } else {
                size += object.total_size();
            }
        }

        for id in self.objects.ids(ListKind::Cached) {
            let Some(object) = self.objects.get(id) else { continue };
            if object.is_unreferenced() && object.cache.remaining_lifetime(now) <= 0 {
                if object.store_state == StoreState::Disc
                    && let Err(e) = self.backing.invalidate(&object.url)
                {
                    tracing::debug!(url = %object.url, error = %e, "backing store invalidate failed");
                }
                self.destroy_object(id);
            } else {
                size += object.total_size();
            }
        }

        if size > limit {
            self.persist();
        }

        for id in self.objects.ids(ListKind::Cached) {
            if size <= limit {
                break;
            }
            let Some(object) = self.objects.get_mut(id) else { continue };
            if object.is_unreferenced() && object.store_state == StoreState::Disc && object.source.take().is_some() {
                size = size.saturating_sub(object.source_len);
            }
        }

        for store_state in [StoreState::Disc, StoreState::Ram] {
            for id in self.objects.ids(ListKind::Cached) {
                if size <= limit {
                    break;
                }
                let Some(object) = self.objects.get(id) else { continue };
                let only_on_disc = object.source.is_none();
                if object.is_unreferenced()
                    && object.store_state == store_state
                    && (store_state == StoreState::Ram || only_on_disc)
                {
                    size = size.saturating_sub(object.total_size());
                    self.destroy_object(id);
                }
            }
        }

        tracing::debug!(size, limit, objects = self.objects.len(), "cache cleaned");
    }
}

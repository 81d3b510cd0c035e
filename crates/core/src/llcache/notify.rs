//! Handle bookkeeping and event delivery.
//!
//! Each handle keeps its own cursor (state and byte count) into its object
//! and is advanced toward the object's fetch state one event at a time. A
//! [`Delivery::Replay`] reply rewinds the cursor to before the event and asks
//! for another pass.

use std::rc::Rc;

use bytes::Bytes;

use super::event::{CacheEvent, Delivery, HandleCallback, RetrieveFlags};
use super::object::{FetchState, ObjectId};
use super::schedule::Job;
use super::{Cache, HandleId};
use crate::Error;

/// One consumer's subscription to an object.
pub(super) struct User {
    pub object: ObjectId,
    pub callback: HandleCallback,
    /// How far this handle has been notified.
    pub state: FetchState,
    /// Source bytes delivered so far.
    pub bytes: usize,
    /// The handle's callback is running.
    pub iterator_target: bool,
    /// Released during its own callback; removed when that returns.
    pub queued_for_delete: bool,
}

impl Cache {
    pub(super) fn add_user(&mut self, object: ObjectId, callback: HandleCallback) -> HandleId {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        let user = User {
            object,
            callback,
            state: FetchState::Init,
            bytes: 0,
            iterator_target: false,
            queued_for_delete: false,
        };
        self.users.insert(handle, user);
        if let Some(obj) = self.objects.get_mut(object) {
            obj.users.insert(0, handle);
        }
        handle
    }

    pub(super) fn remove_user(&mut self, handle: HandleId) {
        let Some(user) = self.users.remove(&handle) else {
            return;
        };
        if let Some(obj) = self.objects.get_mut(user.object) {
            obj.users.retain(|h| *h != handle);
        }
    }

    /// Move a handle onto another object, keeping its cursor.
    pub(super) fn move_user(&mut self, handle: HandleId, to: ObjectId) {
        let Some(user) = self.users.get_mut(&handle) else {
            return;
        };
        let from = std::mem::replace(&mut user.object, to);
        if let Some(obj) = self.objects.get_mut(from) {
            obj.users.retain(|h| *h != handle);
        }
        if let Some(obj) = self.objects.get_mut(to) {
            obj.users.insert(0, handle);
        }
        self.users_not_caught_up();
    }

    /// Move a handle onto another object and restart its notifications.
    pub(super) fn move_user_reset(&mut self, handle: HandleId, to: ObjectId) {
        if let Some(user) = self.users.get_mut(&handle) {
            user.state = FetchState::Init;
            user.bytes = 0;
        }
        self.move_user(handle, to);
    }

    /// Restart notifications for every handle on an object.
    pub(super) fn reset_users(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get(id) else {
            return;
        };
        for handle in &object.users {
            if let Some(user) = self.users.get_mut(handle) {
                user.state = FetchState::Init;
                user.bytes = 0;
            }
        }
    }

    /// Whether `handle` is still a live user of `object`.
    fn user_on(&self, handle: HandleId, object: ObjectId) -> bool {
        self.users.get(&handle).is_some_and(|u| u.object == object && !u.queued_for_delete)
    }

    /// Run a handle's callback.
    ///
    /// A callback that is already running cannot take the event and is
    /// answered with [`Delivery::Replay`].
    fn invoke(&mut self, handle: HandleId, event: &CacheEvent) -> Delivery {
        let Some(user) = self.users.get_mut(&handle) else {
            return Delivery::Delivered;
        };
        let callback = Rc::clone(&user.callback);
        let Ok(mut f) = callback.try_borrow_mut() else {
            return Delivery::Replay;
        };

        let was_target = std::mem::replace(&mut user.iterator_target, true);
        let delivery = (&mut *f)(self, handle, event);
        drop(f);

        if let Some(user) = self.users.get_mut(&handle) {
            user.iterator_target = was_target;
            if !was_target && user.queued_for_delete {
                self.remove_user(handle);
            }
        }
        delivery
    }

    fn set_user_state(&mut self, handle: HandleId, state: FetchState) {
        if let Some(user) = self.users.get_mut(&handle) {
            user.state = state;
        }
    }

    /// Advance every handle on an object as far as it will go.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Callback`] if a callback reports a failure; later
    /// handles are not notified on this pass.
    pub(super) fn notify_users(&mut self, id: ObjectId) -> Result<(), Error> {
        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };
        for handle in object.users.clone() {
            self.notify_user(id, handle)?;
        }
        Ok(())
    }

    fn notify_user(&mut self, id: ObjectId, handle: HandleId) -> Result<(), Error> {
        let Some(user) = self.users.get(&handle) else {
            return Ok(());
        };
        if user.object != id || user.queued_for_delete || user.iterator_target {
            return Ok(());
        }
        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };
        let objstate = object.fetch.state;

        if objstate >= FetchState::Headers && user.state < FetchState::Headers {
            if let Some(chain) = object.cert_chain.clone() {
                match self.invoke(handle, &CacheEvent::GotCerts(chain)) {
                    Delivery::Delivered => {}
                    Delivery::Replay => {
                        self.users_not_caught_up();
                        return Ok(());
                    }
                    Delivery::Error(msg) => return Err(Error::Callback(msg)),
                }
                if !self.user_on(handle, id) {
                    return Ok(());
                }
            }

            if self.objects.get(id).is_some_and(|o| o.fetch.failed) {
                self.set_user_state(handle, FetchState::Complete);
                return Ok(());
            }

            self.set_user_state(handle, FetchState::Headers);
            match self.invoke(handle, &CacheEvent::HadHeaders) {
                Delivery::Delivered => {}
                Delivery::Replay => {
                    self.set_user_state(handle, FetchState::Init);
                    self.users_not_caught_up();
                    return Ok(());
                }
                Delivery::Error(msg) => return Err(Error::Callback(msg)),
            }
            if !self.user_on(handle, id) {
                return Ok(());
            }
        }

        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };
        if object.fetch.failed {
            self.set_user_state(handle, FetchState::Complete);
            return Ok(());
        }
        let Some(user) = self.users.get_mut(&handle) else {
            return Ok(());
        };
        if user.state == FetchState::Headers && objstate >= FetchState::Data {
            user.state = FetchState::Data;
        }

        if user.state == FetchState::Data
            && let Some(source) = object.source.as_deref()
            && object.source_len > user.bytes
        {
            let streaming = object.fetch.flags.contains(RetrieveFlags::STREAM_DATA);
            let from = user.bytes;
            let chunk = Bytes::copy_from_slice(&source[from..object.source_len]);
            user.bytes = object.source_len;

            match self.invoke(handle, &CacheEvent::HadData(chunk)) {
                Delivery::Delivered => {
                    if streaming {
                        self.discard_streamed(id, handle);
                    }
                }
                Delivery::Replay => {
                    // Streamed bytes are gone once delivered; nothing to rewind to.
                    if !streaming && let Some(user) = self.users.get_mut(&handle) {
                        user.bytes = from;
                    }
                    self.users_not_caught_up();
                    return Ok(());
                }
                Delivery::Error(msg) => return Err(Error::Callback(msg)),
            }
            if !self.user_on(handle, id) {
                return Ok(());
            }
        }

        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };
        let Some(user) = self.users.get_mut(&handle) else {
            return Ok(());
        };
        if user.state == FetchState::Data && objstate == FetchState::Complete && user.bytes >= object.source_len {
            user.state = FetchState::Complete;
            match self.invoke(handle, &CacheEvent::Done) {
                Delivery::Delivered => {}
                Delivery::Replay => {
                    self.set_user_state(handle, FetchState::Data);
                    self.users_not_caught_up();
                }
                Delivery::Error(msg) => return Err(Error::Callback(msg)),
            }
        }
        Ok(())
    }

    /// Drop bytes a streaming handle has consumed.
    fn discard_streamed(&mut self, id: ObjectId, handle: HandleId) {
        if let Some(object) = self.objects.get_mut(id)
            && let Some(source) = object.source.as_mut()
        {
            source.clear();
            object.source_len = 0;
        }
        if let Some(user) = self.users.get_mut(&handle) {
            user.bytes = 0;
        }
    }

    /// Deliver one event to every handle on an object.
    ///
    /// Replay replies are treated as delivered; broadcast events are not
    /// repeated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Callback`] if a callback reports a failure; later
    /// handles do not receive the event.
    pub(super) fn send_event_to_users(&mut self, id: ObjectId, event: &CacheEvent) -> Result<(), Error> {
        self.broadcast(id, event, FetchState::Init)
    }

    /// As [`Cache::send_event_to_users`], skipping handles that have not
    /// yet been sent their headers.
    pub(super) fn send_event_to_notified(&mut self, id: ObjectId, event: &CacheEvent) -> Result<(), Error> {
        self.broadcast(id, event, FetchState::Headers)
    }

    fn broadcast(&mut self, id: ObjectId, event: &CacheEvent, min_state: FetchState) -> Result<(), Error> {
        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };
        for handle in object.users.clone() {
            if !self.user_on(handle, id) || self.users.get(&handle).is_some_and(|u| u.state < min_state) {
                continue;
            }
            if let Delivery::Error(msg) = self.invoke(handle, event) {
                return Err(Error::Callback(msg));
            }
        }
        Ok(())
    }

    /// Notify every object's handles. A failing callback stops its object's
    /// fetch but not other objects.
    pub(super) fn catch_up_all_users(&mut self) {
        self.all_caught_up = true;

        for id in self.objects.all_ids() {
            if let Err(e) = self.notify_users(id) {
                tracing::warn!(?id, error = %e, "notification failed; stopping fetch");
                self.abort_fetch(id);
                if let Some(object) = self.objects.get_mut(id) {
                    object.cache.invalidate();
                    object.fetch.state = FetchState::Complete;
                    object.fetch.failed = true;
                }
            }
        }
    }

    /// Ask for a notification pass on the next poll.
    pub(super) fn users_not_caught_up(&mut self) {
        if self.all_caught_up {
            self.all_caught_up = false;
            self.schedule.schedule(self.clock.monotonic_ms(), 0, Job::CatchUp);
        }
    }
}

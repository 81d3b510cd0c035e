//! The set of live cache objects.
//!
//! Every object sits in exactly one of two lists: cached objects may be
//! returned to later retrievals, uncached ones serve only their current
//! handles. Lists are ordered most recently inserted first.

use std::collections::HashMap;

use super::object::{CacheObject, ObjectId};

/// Which list an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Cached,
    Uncached,
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, CacheObject>,
    cached: Vec<ObjectId>,
    uncached: Vec<ObjectId>,
    next_id: u64,
}

impl ObjectStore {
    /// Add an object at the head of a list.
    pub fn insert(&mut self, object: CacheObject, list: ListKind) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(id, object);
        self.list_mut(list).insert(0, id);
        id
    }

    /// Remove an object from the store and its list.
    pub fn remove(&mut self, id: ObjectId) -> Option<CacheObject> {
        self.cached.retain(|o| *o != id);
        self.uncached.retain(|o| *o != id);
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&CacheObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut CacheObject> {
        self.objects.get_mut(&id)
    }

    /// Move an object to the head of another list.
    pub fn move_to(&mut self, id: ObjectId, list: ListKind) {
        if self.list_of(id) == Some(list) || !self.objects.contains_key(&id) {
            return;
        }
        self.cached.retain(|o| *o != id);
        self.uncached.retain(|o| *o != id);
        self.list_mut(list).insert(0, id);
    }

    pub fn list_of(&self, id: ObjectId) -> Option<ListKind> {
        if self.cached.contains(&id) {
            Some(ListKind::Cached)
        } else if self.uncached.contains(&id) {
            Some(ListKind::Uncached)
        } else {
            None
        }
    }

    /// Snapshot of a list's ids, head first.
    pub fn ids(&self, list: ListKind) -> Vec<ObjectId> {
        match list {
            ListKind::Cached => self.cached.clone(),
            ListKind::Uncached => self.uncached.clone(),
        }
    }

    /// Every object id, cached list first.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        self.cached.iter().chain(self.uncached.iter()).copied().collect()
    }

    /// Most recently requested cached object for `url`; earlier list
    /// entries win ties.
    pub fn find_newest(&self, url: &url::Url) -> Option<ObjectId> {
        let mut newest: Option<(ObjectId, i64)> = None;
        for id in &self.cached {
            let Some(obj) = self.objects.get(id) else { continue };
            if obj.url != *url {
                continue;
            }
            if newest.is_none_or(|(_, t)| obj.cache.req_time > t) {
                newest = Some((*id, obj.cache.req_time));
            }
        }
        newest.map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Sum of [`CacheObject::total_size`] over all objects.
    pub fn total_size(&self) -> usize {
        self.objects.values().map(CacheObject::total_size).sum()
    }

    pub fn clear(&mut self) -> Vec<CacheObject> {
        self.cached.clear();
        self.uncached.clear();
        self.objects.drain().map(|(_, o)| o).collect()
    }

    fn list_mut(&mut self, list: ListKind) -> &mut Vec<ObjectId> {
        match list {
            ListKind::Cached => &mut self.cached,
            ListKind::Uncached => &mut self.uncached,
        }
    }
}

//! Deterministic collaborators for driving the cache in tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use url::Url;

use super::{Cache, CacheEvent, CacheParams, Delivery, ErrorCode, HandleCallback, ManualClock, callback};
use crate::Error;
use crate::backing::MemoryStore;
use crate::transport::{FetchId, FetchMsg, FetchRequest, Fetcher};

pub const EPOCH: i64 = 1_700_000_000;

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

#[derive(Default)]
struct StubState {
    next_id: u64,
    started: Vec<(FetchId, FetchRequest)>,
    active: HashSet<FetchId>,
    aborted: Vec<FetchId>,
    queue: VecDeque<(FetchId, FetchMsg)>,
    codes: HashMap<FetchId, u16>,
    refuse: bool,
}

/// A transport whose responses are scripted by the test.
#[derive(Clone, Default)]
pub struct StubFetcher {
    state: Rc<RefCell<StubState>>,
}

impl StubFetcher {
    pub fn started(&self) -> usize {
        self.state.borrow().started.len()
    }

    pub fn last_fetch(&self) -> FetchId {
        self.state.borrow().started.last().map(|(id, _)| *id).unwrap()
    }

    pub fn request(&self, id: FetchId) -> FetchRequest {
        self.state.borrow().started.iter().find(|(f, _)| *f == id).map(|(_, r)| r.clone()).unwrap()
    }

    pub fn last_request(&self) -> FetchRequest {
        self.request(self.last_fetch())
    }

    pub fn is_active(&self, id: FetchId) -> bool {
        self.state.borrow().active.contains(&id)
    }

    pub fn aborted(&self) -> Vec<FetchId> {
        self.state.borrow().aborted.clone()
    }

    pub fn refuse_starts(&self) {
        self.state.borrow_mut().refuse = true;
    }

    pub fn has_queued(&self) -> bool {
        !self.state.borrow().queue.is_empty()
    }

    /// Queue a message; status lines also set the fetch's HTTP code.
    pub fn push(&self, id: FetchId, msg: FetchMsg) {
        let mut state = self.state.borrow_mut();
        if let FetchMsg::Header(line) = &msg
            && line.starts_with("HTTP/")
            && let Some(code) = line.split_whitespace().nth(1).and_then(|c| c.parse().ok())
        {
            state.codes.insert(id, code);
        }
        state.queue.push_back((id, msg));
    }

    pub fn header(&self, id: FetchId, line: &str) {
        self.push(id, FetchMsg::Header(line.to_string()));
    }

    pub fn data(&self, id: FetchId, body: &[u8]) {
        self.push(id, FetchMsg::Data(Bytes::copy_from_slice(body)));
    }

    /// Queue a complete response.
    pub fn respond(&self, id: FetchId, headers: &[&str], body: &[u8]) {
        for line in headers {
            self.header(id, line);
        }
        if !body.is_empty() {
            self.data(id, body);
        }
        self.push(id, FetchMsg::Finished);
    }
}

impl Fetcher for StubFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https" | "data" | "file" | "resource")
    }

    fn start(&mut self, request: FetchRequest) -> Result<FetchId, Error> {
        let mut state = self.state.borrow_mut();
        if state.refuse {
            return Err(Error::FetchStart(request.url.to_string()));
        }
        state.next_id += 1;
        let id = FetchId(state.next_id);
        state.started.push((id, request));
        state.active.insert(id);
        Ok(id)
    }

    fn abort(&mut self, id: FetchId) {
        let mut state = self.state.borrow_mut();
        state.active.remove(&id);
        state.aborted.push(id);
        state.queue.retain(|(f, _)| *f != id);
    }

    fn http_code(&self, id: FetchId) -> u16 {
        self.state.borrow().codes.get(&id).copied().unwrap_or(200)
    }

    fn poll(&mut self) -> Vec<(FetchId, FetchMsg)> {
        let mut state = self.state.borrow_mut();
        let drained: Vec<_> = state.queue.drain(..).collect();
        for (id, msg) in &drained {
            if matches!(
                msg,
                FetchMsg::Finished | FetchMsg::TimedOut | FetchMsg::Error(_) | FetchMsg::CertErr | FetchMsg::SslErr
            ) {
                state.active.remove(id);
            }
        }
        drained
    }
}

#[derive(Default)]
struct RecorderState {
    events: Vec<CacheEvent>,
    replies: VecDeque<Delivery>,
}

/// A consumer that records every event it is sent.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Rc<RefCell<RecorderState>>,
}

impl Recorder {
    pub fn callback(&self) -> HandleCallback {
        let state = Rc::clone(&self.state);
        callback(move |_cache, _handle, event| {
            let mut state = state.borrow_mut();
            state.events.push(event.clone());
            state.replies.pop_front().unwrap_or(Delivery::Delivered)
        })
    }

    /// Answer the next event with `reply` instead of `Delivered`.
    pub fn reply_with(&self, reply: Delivery) {
        self.state.borrow_mut().replies.push_back(reply);
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.state.borrow().events.clone()
    }

    pub fn data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for event in &self.state.borrow().events {
            if let CacheEvent::HadData(chunk) = event {
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    pub fn count(&self, matches: impl Fn(&CacheEvent) -> bool) -> usize {
        self.state.borrow().events.iter().filter(|e| matches(e)).count()
    }

    pub fn done(&self) -> bool {
        self.count(|e| *e == CacheEvent::Done) > 0
    }

    pub fn errors(&self) -> Vec<ErrorCode> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                CacheEvent::Error { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }
}

/// A cache wired to a stub transport, an in-memory store and a manual clock.
pub struct Harness {
    pub cache: Cache,
    pub fetcher: StubFetcher,
    pub store: MemoryStore,
    pub clock: Rc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_params(CacheParams::default())
    }

    pub fn with_params(params: CacheParams) -> Self {
        Self::with_parts(params, MemoryStore::new(), Rc::new(ManualClock::new(EPOCH)))
    }

    /// A cache over an existing store and clock, as after a restart.
    pub fn with_parts(params: CacheParams, store: MemoryStore, clock: Rc<ManualClock>) -> Self {
        let fetcher = StubFetcher::default();
        let cache = Cache::initialise_with_clock(
            params,
            Box::new(fetcher.clone()),
            Box::new(store.clone()),
            clock.clone(),
        );
        Self { cache, fetcher, store, clock }
    }

    /// Poll until queued messages and immediate jobs are exhausted.
    pub fn run(&mut self) {
        for _ in 0..100 {
            self.cache.poll();
            if !self.fetcher.has_queued() && self.cache.next_deadline_ms().is_none_or(|d| d > 0) {
                break;
            }
        }
    }
}

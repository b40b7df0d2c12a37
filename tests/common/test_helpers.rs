#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use pollgate::gate::NoticeId;
use pollgate::{
    ChatId, Destination, DestinationResolver, ItemSource, NoticeSink, Notifier, SourceError,
    WorkItem,
};
use serde_json::Value;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Returns the configured items, or fails a set number of times first.
#[derive(Default)]
pub struct MockSource {
    items: Mutex<Vec<WorkItem>>,
    failures_left: AtomicU32,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn with_items(items: Vec<WorkItem>) -> Self {
        Self { items: Mutex::new(items), ..Self::default() }
    }

    pub fn set_items(&self, items: Vec<WorkItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail_times(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemSource for MockSource {
    async fn fetch_all(&self) -> Result<Vec<WorkItem>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Status { endpoint: "courseworks".into(), status: 503 });
        }
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Owner refs map to chat ids; unknown owners have no destination.
#[derive(Default)]
pub struct MockResolver {
    owners: Mutex<HashMap<String, ChatId>>,
    broken: Mutex<HashSet<String>>,
    related: Mutex<HashMap<String, Value>>,
}

impl MockResolver {
    pub fn bind(&self, owner: &str, chat: ChatId) {
        self.owners.lock().unwrap().insert(owner.to_string(), chat);
    }

    pub fn break_owner(&self, owner: &str) {
        self.broken.lock().unwrap().insert(owner.to_string());
    }

    pub fn add_related(&self, related_ref: &str, details: Value) {
        self.related.lock().unwrap().insert(related_ref.to_string(), details);
    }
}

#[async_trait]
impl DestinationResolver for MockResolver {
    async fn resolve(&self, owner_ref: &str) -> Result<Option<Destination>, SourceError> {
        if self.broken.lock().unwrap().contains(owner_ref) {
            return Err(SourceError::transport("lookup timed out"));
        }
        Ok(self.owners.lock().unwrap().get(owner_ref).copied().map(Destination::chat))
    }

    async fn related(&self, related_ref: &str) -> Result<Option<Value>, SourceError> {
        Ok(self.related.lock().unwrap().get(related_ref).cloned())
    }
}

type DispatchHook = Box<dyn Fn(&WorkItem) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub destination: Destination,
    pub item_id: String,
    pub related: Option<Value>,
}

/// Records every dispatch; can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Dispatched>>,
    fail: AtomicBool,
    hook: Option<DispatchHook>,
}

impl RecordingNotifier {
    pub fn on_dispatch<F>(hook: F) -> Self
    where
        F: Fn(&WorkItem) + Send + Sync + 'static,
    {
        Self { hook: Some(Box::new(hook)), ..Self::default() }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Dispatched> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent().into_iter().map(|d| d.item_id).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dispatch(
        &self,
        destination: &Destination,
        item: &WorkItem,
        related: Option<&Value>,
    ) -> Result<(), SourceError> {
        if let Some(hook) = &self.hook {
            hook(item);
        }
        self.sent.lock().unwrap().push(Dispatched {
            destination: *destination,
            item_id: item.id.clone(),
            related: related.cloned(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::Rejected("chat not found".into()));
        }
        Ok(())
    }
}

/// Notice sink that records posts, retractions, and acknowledgements.
#[derive(Default)]
pub struct RecordingSink {
    next_id: AtomicI64,
    posts: Mutex<Vec<(ChatId, NoticeId, String)>>,
    retracted: Mutex<Vec<(ChatId, NoticeId)>>,
    acks: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn posts(&self) -> Vec<(ChatId, NoticeId, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn retracted(&self) -> Vec<(ChatId, NoticeId)> {
        self.retracted.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<(String, String)> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl NoticeSink for RecordingSink {
    async fn post(&self, chat: ChatId, text: &str) -> Result<NoticeId, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.posts.lock().unwrap().push((chat, id, text.to_string()));
        Ok(id)
    }

    async fn retract(&self, chat: ChatId, notice: NoticeId) -> Result<(), SourceError> {
        self.retracted.lock().unwrap().push((chat, notice));
        Ok(())
    }

    async fn acknowledge(&self, ack_id: &str, text: &str) -> Result<(), SourceError> {
        self.acks.lock().unwrap().push((ack_id.to_string(), text.to_string()));
        Ok(())
    }
}

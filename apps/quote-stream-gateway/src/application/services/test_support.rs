//! In-memory capability fakes shared by service tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{
    CapabilityConnector, ErrorCallback, StatusCallback, UpstreamCapability, UpstreamError,
};
use crate::domain::streaming::{FeedKey, QuoteEvent, Symbol};

pub struct FakeCapability {
    pub feed: FeedKey,
    pub ready: AtomicBool,
    pub alive: AtomicBool,
    pub closed: AtomicBool,
    pub fail_next_subscribes: AtomicU32,
    pub subscribe_calls: AtomicU32,
    pub unsubscribe_calls: AtomicU32,
    pub subscribed: Mutex<HashSet<Symbol>>,
}

impl FakeCapability {
    pub fn subscribed(&self) -> HashSet<Symbol> {
        self.subscribed.lock().clone()
    }
}

#[async_trait]
impl UpstreamCapability for FakeCapability {
    fn feed(&self) -> FeedKey {
        self.feed.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_next_subscribes.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_subscribes.store(pending - 1, Ordering::SeqCst);
            return Err(UpstreamError::RequestFailed("injected".to_string()));
        }
        self.subscribed.lock().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> Result<(), UpstreamError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        let mut subscribed = self.subscribed.lock();
        for symbol in symbols {
            subscribed.remove(symbol);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), UpstreamError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(UpstreamError::Closed)
        }
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_status_change(&self, _callback: StatusCallback) {}

    fn on_error(&self, _callback: ErrorCallback) {}
}

/// `fail_first_subscribes` applies to the first capability opened only.
pub struct FakeConnector {
    pub opens: AtomicU32,
    pub ready_on_open: bool,
    pub fail_first_subscribes: u32,
    pub open_delay: Duration,
    pub capabilities: Mutex<Vec<Arc<FakeCapability>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            opens: AtomicU32::new(0),
            ready_on_open: true,
            fail_first_subscribes: 0,
            open_delay: Duration::ZERO,
            capabilities: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn capability(&self, index: usize) -> Arc<FakeCapability> {
        Arc::clone(&self.capabilities.lock()[index])
    }
}

#[async_trait]
impl CapabilityConnector for FakeConnector {
    async fn open(
        &self,
        feed: &FeedKey,
        _events: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn UpstreamCapability>, UpstreamError> {
        let first_open = self.opens.fetch_add(1, Ordering::SeqCst) == 0;
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let capability = Arc::new(FakeCapability {
            feed: feed.clone(),
            ready: AtomicBool::new(self.ready_on_open),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_next_subscribes: AtomicU32::new(if first_open {
                self.fail_first_subscribes
            } else {
                0
            }),
            subscribe_calls: AtomicU32::new(0),
            unsubscribe_calls: AtomicU32::new(0),
            subscribed: Mutex::new(HashSet::new()),
        });
        self.capabilities.lock().push(Arc::clone(&capability));
        Ok(capability)
    }
}

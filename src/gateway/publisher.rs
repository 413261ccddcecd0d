//! Event bus seam: the narrow interface the session publishes through,
//! plus an in-memory fan-out used by tests and single-node deployments.

use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;

use crate::gateway::DeviceId;

/// One published (or delivered) event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub name: String,
    pub is_public: bool,
    pub ttl_secs: u32,
    /// `None` when the frame carried no payload.
    pub data: Option<Vec<u8>>,
    pub device_id: DeviceId,
    /// Owner of the publishing device; empty when unclaimed.
    pub user_id: String,
    pub published_at_secs: u32,
}

/// A device-side subscription registered against the bus.
pub struct SubscriptionRequest {
    /// Event-name prefix to match.
    pub prefix: String,
    /// `Some(userid)`: only events from that user's devices.
    pub user_scope: Option<String>,
    /// Only events from this one device.
    pub device_filter: Option<DeviceId>,
    pub subscriber: DeviceId,
    pub sender: Sender<EventRecord>,
}

impl SubscriptionRequest {
    fn matches(&self, record: &EventRecord) -> bool {
        if !record.name.starts_with(self.prefix.as_str()) {
            return false;
        }
        if let Some(user) = &self.user_scope
            && record.user_id != *user
        {
            return false;
        }
        if let Some(filter) = &self.device_filter
            && record.device_id != *filter
        {
            return false;
        }
        true
    }
}

/// The session never introspects the bus beyond these calls.
pub trait Publisher: Send + Sync {
    /// `false` means the publisher is rate-limiting this device.
    fn publish(&self, record: &EventRecord) -> bool;
    fn subscribe(&self, request: SubscriptionRequest);
    /// Drop every subscription held by `subscriber` (session teardown).
    fn unsubscribe(&self, subscriber: &DeviceId);
}

/// Crossbeam fan-out bus.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    inner: Arc<Mutex<MemoryPublisherInner>>,
}

#[derive(Default)]
struct MemoryPublisherInner {
    subscriptions: Vec<SubscriptionRequest>,
    log: Vec<EventRecord>,
    rate_limited: bool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make subsequent publishes report rate limiting.
    pub fn set_rate_limited(&self, limited: bool) {
        self.inner.lock().expect("publisher lock").rate_limited = limited;
    }

    pub fn published(&self) -> Vec<EventRecord> {
        self.inner.lock().expect("publisher lock").log.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().expect("publisher lock").subscriptions.len()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, record: &EventRecord) -> bool {
        let mut inner = self.inner.lock().expect("publisher lock");
        if inner.rate_limited {
            return false;
        }
        inner.log.push(record.clone());
        inner.subscriptions.retain(|subscription| {
            if subscription.matches(record) {
                // a gone subscriber drops out of the bus
                return subscription.sender.send(record.clone()).is_ok();
            }
            true
        });
        true
    }

    fn subscribe(&self, request: SubscriptionRequest) {
        self.inner
            .lock()
            .expect("publisher lock")
            .subscriptions
            .push(request);
    }

    fn unsubscribe(&self, subscriber: &DeviceId) {
        self.inner
            .lock()
            .expect("publisher lock")
            .subscriptions
            .retain(|subscription| subscription.subscriber != *subscriber);
    }
}

//! In-memory queue and scaling group.
//!
//! Used by `backlogd local` and by tests across the workspace. The queue
//! follows the same visibility-timeout model as a hosted queue: a received
//! message is hidden until it is deleted or its visibility expires, after
//! which it is handed out again with a higher receive count.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::boundary::{
    GroupSize, ReceiveOptions, ScalingGroup, ServiceError, ServiceResult, WorkQueue,
};
use crate::types::QueueMessage;

struct Entry {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    /// Receipt of the delivery currently holding this message.
    receipt: Option<String>,
}

struct QueueInner {
    entries: VecDeque<Entry>,
    next_id: u64,
    next_receipt: u64,
    visibility: Duration,
    deleted: u64,
    unavailable: bool,
}

/// Thread-safe in-memory work queue.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
    arrivals: Arc<Notify>,
}

impl MemoryQueue {
    /// Create an empty queue with the given default visibility timeout.
    pub fn new(visibility: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                entries: VecDeque::new(),
                next_id: 1,
                next_receipt: 1,
                visibility,
                deleted: 0,
                unavailable: false,
            })),
            arrivals: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a message body and return its id.
    pub fn push(&self, body: impl Into<String>) -> String {
        let id = {
            let mut inner = self.lock();
            let id = format!("msg-{}", inner.next_id);
            inner.next_id += 1;
            inner.entries.push_back(Entry {
                message_id: id.clone(),
                body: body.into(),
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
            id
        };
        self.arrivals.notify_waiters();
        id
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether every message has been deleted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful deletes so far.
    pub fn deleted(&self) -> u64 {
        self.lock().deleted
    }

    /// Receive count of a message still in the queue.
    pub fn receive_count(&self, message_id: &str) -> Option<u32> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.message_id == message_id)
            .map(|e| e.receive_count)
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A poisoned lock only means another test thread panicked.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_available(&self) -> ServiceResult<()> {
        if self.lock().unavailable {
            return Err(ServiceError::Unavailable("memory queue offline".to_string()));
        }
        Ok(())
    }

    /// Hand out up to `max` visible messages. Returns the deliveries and the
    /// next instant a hidden message becomes visible, if any.
    fn take_visible(
        &self,
        max: u32,
        visibility: Option<Duration>,
    ) -> (Vec<QueueMessage>, Option<Instant>) {
        let mut inner = self.lock();
        let now = Instant::now();
        let hide_for = visibility.unwrap_or(inner.visibility);
        let mut out = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut next_receipt = inner.next_receipt;

        for entry in inner.entries.iter_mut() {
            if out.len() as u32 >= max {
                break;
            }
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |t| t.min(entry.visible_at)));
                continue;
            }
            let receipt = format!("{}#{}", entry.message_id, next_receipt);
            next_receipt += 1;
            entry.receive_count += 1;
            entry.visible_at = now + hide_for;
            entry.receipt = Some(receipt.clone());
            out.push(QueueMessage {
                message_id: entry.message_id.clone(),
                body: entry.body.clone(),
                receipt,
                receive_count: entry.receive_count,
            });
        }

        inner.next_receipt = next_receipt;
        (out, next_visible)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive(&self, opts: ReceiveOptions) -> ServiceResult<Vec<QueueMessage>> {
        self.check_available()?;
        let deadline = Instant::now() + opts.wait;

        loop {
            let arrival = self.arrivals.notified();
            let (batch, next_visible) = self.take_visible(opts.max_messages, opts.visibility_timeout);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> ServiceResult<()> {
        self.check_available()?;
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.receipt.as_deref() != Some(receipt));
        if inner.entries.len() < before {
            inner.deleted += 1;
        }
        // Deleting an unknown receipt is not an error.
        Ok(())
    }

    async fn approximate_depth(&self) -> ServiceResult<u64> {
        self.check_available()?;
        let inner = self.lock();
        let now = Instant::now();
        Ok(inner.entries.iter().filter(|e| e.visible_at <= now).count() as u64)
    }

    async fn send(&self, body: &str) -> ServiceResult<String> {
        self.check_available()?;
        Ok(self.push(body))
    }
}

struct GroupInner {
    members: u32,
    desired: u32,
    requests: Vec<u32>,
    completed_lifecycles: Vec<String>,
    describe_calls: u32,
    unavailable: bool,
}

/// In-memory scaling group that converges instantly to the requested size
/// unless a lagging size is set explicitly.
#[derive(Clone)]
pub struct MemoryGroup {
    inner: Arc<Mutex<GroupInner>>,
}

impl MemoryGroup {
    pub fn new(members: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GroupInner {
                members,
                desired: members,
                requests: Vec::new(),
                completed_lifecycles: Vec::new(),
                describe_calls: 0,
                unavailable: false,
            })),
        }
    }

    /// Current member count.
    pub fn members(&self) -> u32 {
        self.lock().members
    }

    /// Overwrite the member count, as an external actor would.
    pub fn set_members(&self, members: u32) {
        let mut inner = self.lock();
        inner.members = members;
        inner.desired = members;
    }

    /// Report `live` members while the group converges to `desired`.
    pub fn set_lagging(&self, live: u32, desired: u32) {
        let mut inner = self.lock();
        inner.members = live;
        inner.desired = desired;
    }

    /// Every desired count requested so far, in order.
    pub fn requests(&self) -> Vec<u32> {
        self.lock().requests.clone()
    }

    /// Instance ids whose lifecycle action was completed.
    pub fn completed_lifecycles(&self) -> Vec<String> {
        self.lock().completed_lifecycles.clone()
    }

    /// Number of `describe_members` calls served.
    pub fn describe_calls(&self) -> u32 {
        self.lock().describe_calls
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, GroupInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_available(&self) -> ServiceResult<()> {
        if self.lock().unavailable {
            return Err(ServiceError::Unavailable("memory group offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScalingGroup for MemoryGroup {
    async fn describe_members(&self) -> ServiceResult<GroupSize> {
        self.check_available()?;
        let mut inner = self.lock();
        inner.describe_calls += 1;
        Ok(GroupSize {
            live: inner.members,
            desired: inner.desired,
        })
    }

    async fn set_desired_count(&self, desired: u32) -> ServiceResult<()> {
        self.check_available()?;
        let mut inner = self.lock();
        inner.requests.push(desired);
        inner.members = desired;
        inner.desired = desired;
        Ok(())
    }

    async fn complete_lifecycle(&self, instance_id: &str) -> ServiceResult<()> {
        self.check_available()?;
        self.lock().completed_lifecycles.push(instance_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(wait_ms: u64) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: 1,
            wait: Duration::from_millis(wait_ms),
            visibility_timeout: None,
        }
    }

    #[tokio::test]
    async fn receive_hides_message_until_visibility_expires() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let id = queue.push(r#"{"exec_cmd": "true"}"#);

        let first = queue.receive(quick(0)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id, id);
        assert_eq!(first[0].receive_count, 1);

        // Hidden while in flight.
        assert!(queue.receive(quick(0)).await.unwrap().is_empty());
        assert_eq!(queue.approximate_depth().await.unwrap(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let id = queue.push("{}");

        let first = queue.receive(quick(0)).await.unwrap();
        assert_eq!(first[0].receive_count, 1);

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = queue.receive(quick(0)).await.unwrap();
        assert_eq!(second[0].message_id, id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt, second[0].receipt);
    }

    #[tokio::test]
    async fn delete_removes_message_and_is_idempotent() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.push("{}");
        let msg = queue.receive(quick(0)).await.unwrap().remove(0);

        queue.delete(&msg.receipt).await.unwrap();
        queue.delete(&msg.receipt).await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.deleted(), 1);
    }

    #[tokio::test]
    async fn long_poll_wakes_on_arrival() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("{\"1\": {}}");
        });

        let got = queue.receive(quick(5_000)).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_returns_empty_after_wait() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let got = queue.receive(quick(20_000)).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn unavailable_queue_errors() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.set_unavailable(true);
        assert!(matches!(
            queue.approximate_depth().await,
            Err(ServiceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn sent_jobs_are_received() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let id = queue.send("{\"exec_cmd\":\"true\"}").await.unwrap();
        assert_eq!(queue.approximate_depth().await.unwrap(), 1);

        let batch = queue.receive(quick(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);

        queue.set_unavailable(true);
        assert!(queue.send("{}").await.is_err());
    }

    #[tokio::test]
    async fn group_records_requests_and_converges() {
        let group = MemoryGroup::new(2);
        group.set_desired_count(3).await.unwrap();
        assert_eq!(group.describe_members().await.unwrap(), GroupSize::settled(3));
        assert_eq!(group.requests(), vec![3]);
        assert_eq!(group.describe_calls(), 1);

        group.set_lagging(3, 5);
        let size = group.describe_members().await.unwrap();
        assert_eq!((size.live, size.desired), (3, 5));

        group.complete_lifecycle("i-0abc").await.unwrap();
        assert_eq!(group.completed_lifecycles(), vec!["i-0abc".to_string()]);
    }
}

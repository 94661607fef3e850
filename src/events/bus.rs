use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::UserEvent;

/// Partition an event for `user_id` is routed to.
pub fn partition_for(user_id: Uuid, partitions: u32) -> u32 {
    (user_id.as_u128() % u128::from(partitions.max(1))) as u32
}

/// Outbound side of the event channel.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &UserEvent) -> anyhow::Result<()>;
}

/// One message read from a partition, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    /// Substrate message id, used for the acknowledgement.
    pub id: String,
    pub payload: Vec<u8>,
}

/// Inbound side of the event channel: ordered per partition, at least once.
#[async_trait]
pub trait EventStream: Send + Sync {
    fn partitions(&self) -> u32;

    /// Waits a bounded time for the next message of `partition`.
    /// `Ok(None)` means nothing arrived; callers simply poll again.
    async fn receive(&self, partition: u32) -> anyhow::Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// In-process partitioned channel for single-instance runs and tests.
/// Unacknowledged messages are not redelivered.
pub struct MemoryEventBus {
    senders: Vec<mpsc::UnboundedSender<Delivery>>,
    receivers: Vec<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    next_id: AtomicUsize,
    published: StdMutex<Vec<UserEvent>>,
    acked: StdMutex<Vec<String>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryEventBus {
    pub fn new(partitions: u32) -> Self {
        let (senders, receivers) = (0..partitions.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Mutex::new(rx))
            })
            .unzip();
        Self {
            senders,
            receivers,
            next_id: AtomicUsize::new(0),
            published: StdMutex::new(Vec::new()),
            acked: StdMutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes `publish` fail, as an unreachable broker would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Enqueues raw bytes on a partition, bypassing encoding.
    pub fn push_raw(&self, partition: u32, payload: Vec<u8>) -> anyhow::Result<Delivery> {
        let tx = self
            .senders
            .get(partition as usize)
            .with_context(|| format!("no partition {partition}"))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            partition,
            id: format!("{partition}-{id}"),
            payload,
        };
        tx.send(delivery.clone())
            .map_err(|_| anyhow::anyhow!("partition {partition} is closed"))?;
        Ok(delivery)
    }

    /// Every event published so far, oldest first.
    pub fn published(&self) -> Vec<UserEvent> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_acked(&self, delivery: &Delivery) -> bool {
        self.acked().contains(&delivery.id)
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: &UserEvent) -> anyhow::Result<()> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "event bus unavailable");
        let payload = event.encode().context("encode event")?;
        let partition = event
            .user_id()
            .map(|id| partition_for(id, self.partitions()))
            .unwrap_or(0);
        self.push_raw(partition, payload)?;
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStream for MemoryEventBus {
    fn partitions(&self) -> u32 {
        self.senders.len() as u32
    }

    async fn receive(&self, partition: u32) -> anyhow::Result<Option<Delivery>> {
        anyhow::ensure!(!self.closed.load(Ordering::SeqCst), "event bus closed");
        let rx = self
            .receivers
            .get(partition as usize)
            .with_context(|| format!("no partition {partition}"))?;
        let mut rx = rx.lock().await;
        match tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            // the bus owns every sender, so the channel never ends while it lives
            Ok(None) | Err(_) => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.acked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(delivery.id.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

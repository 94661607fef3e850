//! Event channel on Redis Streams consumer groups.
//!
//! Partition `n` is the stream `<prefix>:<n>`; each entry carries the JSON envelope in a
//! single `envelope` field. A reader first drains the entries still pending for its
//! consumer name (delivered before a restart but never acknowledged), then switches to
//! new entries with a blocking read.

use anyhow::Context;
use async_trait::async_trait;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::{StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    bus::{partition_for, Delivery, EventPublisher, EventStream},
    UserEvent,
};
use crate::config::EventsConfig;

const ENVELOPE_FIELD: &str = "envelope";

enum Cursor {
    /// Re-reading this consumer's pending entries after the given id.
    Backlog(String),
    Live,
}

struct PartitionReader {
    conn: MultiplexedConnection,
    cursor: Cursor,
}

pub struct RedisEventBus {
    producer: ConnectionManager,
    readers: Vec<Mutex<PartitionReader>>,
    prefix: String,
    group: String,
    consumer: String,
    block_ms: usize,
}

impl RedisEventBus {
    pub async fn connect(cfg: &EventsConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(cfg.redis_url.as_str()).context("parse events redis url")?;
        let mut producer = ConnectionManager::new(client.clone())
            .await
            .context("connect events producer")?;

        let mut readers = Vec::with_capacity(cfg.partitions as usize);
        for partition in 0..cfg.partitions {
            let key = stream_key(&cfg.stream_prefix, partition);
            ensure_group(&mut producer, &key, &cfg.group).await?;

            // blocking reads hold the connection, so every partition gets its own
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .with_context(|| format!("connect reader for {key}"))?;
            readers.push(Mutex::new(PartitionReader {
                conn,
                cursor: Cursor::Backlog("0".into()),
            }));
        }

        info!(
            prefix = %cfg.stream_prefix,
            group = %cfg.group,
            consumer = %cfg.consumer_name,
            partitions = cfg.partitions,
            "redis event streams ready"
        );

        Ok(Self {
            producer,
            readers,
            prefix: cfg.stream_prefix.clone(),
            group: cfg.group.clone(),
            consumer: cfg.consumer_name.clone(),
            block_ms: cfg.block_ms as usize,
        })
    }

    fn key(&self, partition: u32) -> String {
        stream_key(&self.prefix, partition)
    }
}

fn stream_key(prefix: &str, partition: u32) -> String {
    format!("{prefix}:{partition}")
}

async fn ensure_group(conn: &mut ConnectionManager, key: &str, group: &str) -> anyhow::Result<()> {
    let res: redis::RedisResult<()> = conn.xgroup_create_mkstream(key, group, "0").await;
    match res {
        Ok(()) => {
            debug!(stream = key, group, "consumer group created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e).with_context(|| format!("create consumer group {group} on {key}")),
    }
}

#[async_trait]
impl EventPublisher for RedisEventBus {
    async fn publish(&self, event: &UserEvent) -> anyhow::Result<()> {
        let payload = event.encode().context("encode event")?;
        let partition = event
            .user_id()
            .map(|id| partition_for(id, self.partitions()))
            .unwrap_or(0);
        let key = self.key(partition);

        let mut conn = self.producer.clone();
        let id: String = conn
            .xadd(&key, "*", &[(ENVELOPE_FIELD, payload)])
            .await
            .with_context(|| format!("XADD {key}"))?;
        debug!(stream = %key, id = %id, event_type = event.event_type(), "event published");
        Ok(())
    }
}

#[async_trait]
impl EventStream for RedisEventBus {
    fn partitions(&self) -> u32 {
        self.readers.len() as u32
    }

    async fn receive(&self, partition: u32) -> anyhow::Result<Option<Delivery>> {
        let reader = self
            .readers
            .get(partition as usize)
            .with_context(|| format!("no partition {partition}"))?;
        let mut reader = reader.lock().await;
        let key = self.key(partition);

        loop {
            let (start, opts) = match &reader.cursor {
                Cursor::Backlog(last) => (
                    last.clone(),
                    StreamReadOptions::default()
                        .group(&self.group, &self.consumer)
                        .count(1),
                ),
                Cursor::Live => (
                    ">".to_string(),
                    StreamReadOptions::default()
                        .group(&self.group, &self.consumer)
                        .count(1)
                        .block(self.block_ms),
                ),
            };

            let reply: Option<StreamReadReply> = reader
                .conn
                .xread_options(&[&key], &[&start], &opts)
                .await
                .with_context(|| format!("XREADGROUP {key}"))?;

            let entry = reply
                .and_then(|r| r.keys.into_iter().next())
                .and_then(|k| k.ids.into_iter().next());

            let Some(entry) = entry else {
                if matches!(reader.cursor, Cursor::Backlog(_)) {
                    debug!(stream = %key, "pending backlog drained");
                    reader.cursor = Cursor::Live;
                    continue;
                }
                return Ok(None);
            };

            if let Cursor::Backlog(last) = &mut reader.cursor {
                last.clone_from(&entry.id);
            }

            // an entry without the field still has to be acknowledged by the consumer
            let payload = entry
                .get::<Vec<u8>>(ENVELOPE_FIELD)
                .unwrap_or_default();
            return Ok(Some(Delivery {
                partition,
                id: entry.id,
                payload,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let key = self.key(delivery.partition);
        let mut conn = self.producer.clone();
        let _: i64 = conn
            .xack(&key, &self.group, &[&delivery.id])
            .await
            .with_context(|| format!("XACK {key} {}", delivery.id))?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // connections close when the bus is dropped; nothing is buffered client side
        info!(prefix = %self.prefix, "redis event streams closed");
        Ok(())
    }
}

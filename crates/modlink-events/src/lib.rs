use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use indexmap::IndexMap;
use modlink_protocol::{EventEnvelope, EventSink, ModuleId, ProtocolError, ProtocolResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

/// One envelope handed to one recipient, numbered in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub sequence: u64,
    pub recipient: ModuleId,
    pub envelope: EventEnvelope,
}

// ─── Sinks ─────────────────────────────────────────────────────────

/// Keeps every delivered envelope in a per-recipient outbox. Used by tests
/// and by hosts embedded in a process that polls for output.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    outboxes: Mutex<IndexMap<ModuleId, Vec<EventEnvelope>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered to `recipient` so far.
    pub fn delivered(&self, recipient: &ModuleId) -> Vec<EventEnvelope> {
        self.outboxes
            .lock()
            .get(recipient)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain the outbox of `recipient`.
    pub fn take(&self, recipient: &ModuleId) -> Vec<EventEnvelope> {
        self.outboxes
            .lock()
            .get_mut(recipient)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn event_types(&self, recipient: &ModuleId) -> Vec<String> {
        self.outboxes
            .lock()
            .get(recipient)
            .map(|outbox| {
                outbox
                    .iter()
                    .map(|envelope| envelope.event_type().to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.outboxes.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn deliver(&self, recipient: &ModuleId, envelope: EventEnvelope) -> ProtocolResult<()> {
        self.outboxes
            .lock()
            .entry(recipient.clone())
            .or_default()
            .push(envelope);
        Ok(())
    }
}

/// Forwards envelopes to an unbounded channel per connected module.
#[derive(Debug, Default)]
pub struct ChannelEventSink {
    channels: Mutex<HashMap<ModuleId, mpsc::UnboundedSender<EventEnvelope>>>,
}

impl ChannelEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reopen) the channel for `module`.
    pub fn register(&self, module: ModuleId) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels.lock().insert(module, sender);
        receiver
    }

    pub fn unregister(&self, module: &ModuleId) -> bool {
        self.channels.lock().remove(module).is_some()
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn deliver(&self, recipient: &ModuleId, envelope: EventEnvelope) -> ProtocolResult<()> {
        let sender = self
            .channels
            .lock()
            .get(recipient)
            .cloned()
            .ok_or_else(|| ProtocolError::Delivery(format!("no channel for {recipient}")))?;
        sender
            .send(envelope)
            .map_err(|_| ProtocolError::Delivery(format!("channel for {recipient} is closed")))
    }
}

// ─── Delivery log ──────────────────────────────────────────────────

#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append(&self, delivery: &Delivery) -> Result<()>;
    async fn read_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<Delivery>>;
}

/// Appends deliveries as JSON lines to `<root>/deliveries.jsonl`.
#[derive(Debug)]
pub struct FileDeliveryLog {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileDeliveryLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.root.join("deliveries.jsonl")
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create journal dir {parent:?}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryLog for FileDeliveryLog {
    #[instrument(
        skip(self, delivery),
        fields(recipient = %delivery.recipient, sequence = delivery.sequence)
    )]
    async fn append(&self, delivery: &Delivery) -> Result<()> {
        let path = self.file_path();
        Self::ensure_parent(&path).await?;
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening delivery log {path:?}"))?;

        let line = serde_json::to_string(delivery).context("failed serializing delivery")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!("delivery appended to log");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn read_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<Delivery>> {
        let path = self.file_path();
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let delivery: Delivery = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing delivery line in {path:?}"))?;
            if delivery.sequence >= from_sequence {
                out.push(delivery);
            }
            if out.len() >= limit {
                break;
            }
        }
        debug!(count = out.len(), "deliveries loaded from log");
        Ok(out)
    }
}

// ─── Fan-out ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EventStreamHub<T: Clone = Delivery> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventStreamHub<T> {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, item: T) {
        let _ = self.sender.send(item);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<T> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl EventStreamHub<Delivery> {
    /// Deliveries addressed to `recipient`. Lagged gaps are logged and
    /// skipped.
    pub fn recipient_stream(&self, recipient: ModuleId) -> BoxStream<'static, Delivery> {
        let mut inner = self.subscribe_stream();
        stream! {
            while let Some(item) = inner.next().await {
                match item {
                    Ok(delivery) if delivery.recipient == recipient => yield delivery,
                    Ok(_) => {}
                    Err(error) => warn!(%recipient, %error, "delivery stream lagged"),
                }
            }
        }
        .boxed()
    }
}

/// Delivers through the sink, records to the optional log, then publishes
/// to subscribers. Sequence numbers are assigned per journal.
#[derive(Clone)]
pub struct EventJournal {
    sink: Arc<dyn EventSink>,
    stream: EventStreamHub,
    log: Option<Arc<dyn DeliveryLog>>,
    sequence: Arc<AtomicU64>,
}

impl EventJournal {
    pub fn new(sink: Arc<dyn EventSink>, stream: EventStreamHub) -> Self {
        Self {
            sink,
            stream,
            log: None,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn DeliveryLog>) -> Self {
        self.log = Some(log);
        self
    }

    #[instrument(
        skip(self, envelope),
        fields(recipient = %recipient, event_type = envelope.event_type())
    )]
    pub async fn deliver_and_publish(
        &self,
        recipient: &ModuleId,
        envelope: EventEnvelope,
    ) -> Result<Delivery> {
        self.sink
            .deliver(recipient, envelope.clone())
            .await
            .with_context(|| {
                format!("failed delivering {} to {recipient}", envelope.event_type())
            })?;

        let delivery = Delivery {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            recipient: recipient.clone(),
            envelope,
        };
        if let Some(log) = &self.log {
            log.append(&delivery).await?;
        }
        self.stream.publish(delivery.clone());
        debug!(sequence = delivery.sequence, "delivery published to stream");
        Ok(delivery)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.stream.subscribe()
    }

    pub fn stream(&self) -> &EventStreamHub {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use futures_util::StreamExt;
    use modlink_protocol::{EventEnvelope, EventSink, ModuleId, ProtocolEvent};
    use serde_json::json;
    use tokio::fs;

    use crate::{
        ChannelEventSink, DeliveryLog, EventJournal, EventStreamHub, FileDeliveryLog,
        MemoryEventSink,
    };

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn envelope(kind: &str) -> EventEnvelope {
        EventEnvelope::new(ProtocolEvent::custom(kind, json!({})))
    }

    #[tokio::test]
    async fn memory_sink_keeps_per_recipient_outboxes() -> Result<()> {
        let sink = MemoryEventSink::new();
        let bot = ModuleId::from("bot");
        let ui = ModuleId::from("ui");

        sink.deliver(&bot, envelope("a:one")).await?;
        sink.deliver(&ui, envelope("a:two")).await?;
        sink.deliver(&bot, envelope("a:three")).await?;

        assert_eq!(sink.event_types(&bot), vec!["a:one", "a:three"]);
        assert_eq!(sink.take(&ui).len(), 1);
        assert!(sink.delivered(&ui).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn channel_sink_rejects_unregistered_recipients() -> Result<()> {
        let sink = ChannelEventSink::new();
        let bot = ModuleId::from("bot");
        assert!(sink.deliver(&bot, envelope("a:x")).await.is_err());

        let mut receiver = sink.register(bot.clone());
        sink.deliver(&bot, envelope("a:x")).await?;
        let received = receiver.recv().await;
        assert_eq!(received.map(|e| e.event_type().to_owned()).as_deref(), Some("a:x"));

        assert!(sink.unregister(&bot));
        assert!(sink.deliver(&bot, envelope("a:y")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn journal_numbers_deliveries_and_filters_recipient_stream() -> Result<()> {
        let sink = Arc::new(MemoryEventSink::new());
        let hub = EventStreamHub::new(16);
        let journal = EventJournal::new(sink.clone(), hub.clone());
        let bot = ModuleId::from("bot");
        let mut bot_stream = hub.recipient_stream(bot.clone());

        let first = journal.deliver_and_publish(&ModuleId::from("ui"), envelope("a:ui")).await?;
        let second = journal.deliver_and_publish(&bot, envelope("a:bot")).await?;
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let next = bot_stream.next().await;
        assert_eq!(next.map(|d| d.sequence), Some(2));
        assert_eq!(sink.event_types(&bot), vec!["a:bot"]);
        Ok(())
    }

    #[tokio::test]
    async fn file_delivery_log_appends_and_reads_from_sequence() -> Result<()> {
        let root = unique_test_root("modlink-deliveries");
        let log = Arc::new(FileDeliveryLog::new(&root));
        let journal = EventJournal::new(Arc::new(MemoryEventSink::new()), EventStreamHub::new(4))
            .with_log(log.clone());
        let bot = ModuleId::from("bot");

        journal.deliver_and_publish(&bot, envelope("a:one")).await?;
        journal.deliver_and_publish(&bot, envelope("a:two")).await?;

        let from_two = log.read_from(2, 10).await?;
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].envelope.event_type(), "a:two");

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}

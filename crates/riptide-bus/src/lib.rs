//! Change propagation: deterministic channel naming, the broker seam, and
//! the in-process broadcast broker used by the server, the demo, and tests.
//!
//! An external at-least-once broker plugs in behind [`MessageBroker`]; the
//! engine only requires publish. Delivery may duplicate, and subscribers
//! dedup on the publication's version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use riptide_protocol::{
    CollectionPath, CommittedWrite, DocumentPath, EngineResult, Publication,
};

/// Replaces `/` in paths for channel names. Stable across publishers and
/// subscribers; the client uses the same transform.
pub const CHANNEL_SEPARATOR: char = '.';

fn dotted(segments: &[String]) -> String {
    segments.join(&CHANNEL_SEPARATOR.to_string())
}

/// Channel carrying every publication for one collection level.
pub fn collection_channel(path: &CollectionPath) -> String {
    format!("collection:{}", dotted(path.segments()))
}

/// Channel carrying publications for a single document.
pub fn document_channel(path: &DocumentPath) -> String {
    format!("path:{}", dotted(path.segments()))
}

/// The pub/sub seam. Implementations must be at-least-once; ordering per
/// channel follows publish order within one publisher.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, publication: Publication) -> EngineResult<()>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Publication>;
    /// Presence: how many live subscribers a channel has.
    fn subscriber_count(&self, channel: &str) -> usize;
}

/// Broker multiplexing one `tokio::sync::broadcast` sender per channel.
pub struct InProcessBroker {
    buffer: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Publication>>>,
}

impl InProcessBroker {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Publication> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .clone()
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    async fn publish(&self, channel: &str, publication: Publication) -> EngineResult<()> {
        // A send with no receivers is not an error; the channel simply has
        // no audience right now.
        let _ = self.sender(channel).send(publication);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Publication> {
        self.sender(channel).subscribe()
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

/// Turns committed writes into publications on the collection and document
/// channels, in commit order. Publishing is best-effort: a broker failure is
/// logged and never unwinds a committed write; the client's periodic sync
/// reconciles missed publications.
#[derive(Clone)]
pub struct ChangePublisher {
    broker: Arc<dyn MessageBroker>,
}

impl ChangePublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> Arc<dyn MessageBroker> {
        self.broker.clone()
    }

    pub async fn publish_committed(&self, writes: &[CommittedWrite]) {
        for write in writes {
            let publication = write.publication();
            let channels = [
                collection_channel(&write.path.parent()),
                document_channel(&write.path),
            ];
            for channel in channels {
                if let Err(error) = self.broker.publish(&channel, publication.clone()).await {
                    warn!(%channel, version = write.version, %error, "publish failed; relying on sync");
                } else {
                    debug!(%channel, version = write.version, "publication dispatched");
                }
            }
        }
    }
}

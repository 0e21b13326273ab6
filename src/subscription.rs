use crate::error::{Result, TesiraError};
use crate::protocol::{Argument, Command, Target};
use crate::sync::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A publish routed to the block that owns its token
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub token: String,
    pub attribute: String,
    pub index: Option<u32>,
    pub value: Value,
}

/// Sending half of a block's publication queue
pub type PublicationSink = mpsc::UnboundedSender<Publication>;

/// A block state change caused by a device publish
#[derive(Debug, Clone, PartialEq)]
pub struct BlockUpdate {
    pub block_id: String,
    pub attribute: String,
    pub index: Option<u32>,
    pub value: Value,
}

/// Receiver for block updates
pub struct UpdateReceiver {
    rx: broadcast::Receiver<BlockUpdate>,
}

impl UpdateReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<BlockUpdate>) -> Self {
        Self { rx }
    }

    /// Receive the next block update
    ///
    /// Fails with `ConnectionClosed` once the DSP has been torn down.
    pub async fn recv(&mut self) -> Result<BlockUpdate> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => TesiraError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => TesiraError::Lagged(n),
        })
    }

    /// Try to receive an update without blocking
    ///
    /// Returns `None` if no update is available.
    pub fn try_recv(&mut self) -> Result<Option<BlockUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(TesiraError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(TesiraError::Lagged(n)),
        }
    }
}

struct Subscription {
    block_id: String,
    attribute: String,
    index: Option<u32>,
    command: Command,
    sink: PublicationSink,
}

/// Maps publish tokens to the blocks that registered them
///
/// Routing never blocks: publications are pushed onto the owning block's
/// queue and applied by that block's delivery task.
pub struct SubscriptionRouter {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    publish_interval: Option<Duration>,
    updates: broadcast::Sender<BlockUpdate>,
}

impl SubscriptionRouter {
    pub fn new(publish_interval: Option<Duration>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            publish_interval,
            updates,
        }
    }

    /// Register a subscription and build the command that creates it on the device
    ///
    /// The token is chosen here; the device echoes it back on every publish.
    pub fn register(
        &self,
        block_id: &str,
        attribute: &str,
        index: Option<u32>,
        sink: PublicationSink,
    ) -> (String, Command) {
        let token = format!("{}{}", attribute, Uuid::new_v4().simple());
        let mut command = Command::subscribe(Target::block(block_id), attribute)
            .with_optional_index(index)
            .with_arg(Argument::Word(token.clone()));
        if let Some(interval) = self.publish_interval {
            let millis = u32::try_from(interval.as_millis()).unwrap_or(u32::MAX);
            command = command.with_index(millis);
        }

        lock(&self.subscriptions).insert(
            token.clone(),
            Subscription {
                block_id: block_id.to_string(),
                attribute: attribute.to_string(),
                index,
                command: command.clone(),
                sink,
            },
        );
        tracing::debug!(block = block_id, attribute, ?index, token = %token, "Registered subscription");
        (token, command)
    }

    /// Forget a single token
    pub fn remove(&self, token: &str) {
        lock(&self.subscriptions).remove(token);
    }

    /// Hand a publish to its owning block
    ///
    /// Returns false (and drops the value) if the token is unknown.
    pub fn route(&self, token: &str, value: Value) -> bool {
        let mut subscriptions = lock(&self.subscriptions);
        let Some(sub) = subscriptions.get(token) else {
            tracing::warn!(token, "Dropping publish for unknown token");
            return false;
        };

        let publication = Publication {
            token: token.to_string(),
            attribute: sub.attribute.clone(),
            index: sub.index,
            value,
        };
        if sub.sink.send(publication).is_err() {
            tracing::debug!(block = %sub.block_id, token, "Block gone, dropping its subscription");
            subscriptions.remove(token);
            return false;
        }
        true
    }

    /// Commands needed to recreate every registered subscription
    pub fn subscribe_commands(&self) -> Vec<Command> {
        let subscriptions = lock(&self.subscriptions);
        let mut commands: Vec<(&String, Command)> = subscriptions
            .iter()
            .map(|(token, sub)| (token, sub.command.clone()))
            .collect();
        commands.sort_by(|a, b| a.0.cmp(b.0));
        commands.into_iter().map(|(_, command)| command).collect()
    }

    /// Commands that cancel every registered subscription on the device
    pub fn unsubscribe_commands(&self) -> Vec<Command> {
        let subscriptions = lock(&self.subscriptions);
        let mut tokens: Vec<&String> = subscriptions.keys().collect();
        tokens.sort();
        tokens
            .into_iter()
            .map(|token| {
                let sub = &subscriptions[token];
                Command::unsubscribe(Target::block(sub.block_id.as_str()), sub.attribute.as_str())
                    .with_optional_index(sub.index)
                    .with_arg(Argument::Word(token.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription, ending all block delivery tasks
    pub fn clear(&self) {
        lock(&self.subscriptions).clear();
    }

    /// Sender used by blocks to announce applied publications
    pub(crate) fn updates(&self) -> broadcast::Sender<BlockUpdate> {
        self.updates.clone()
    }

    /// Subscribe to block updates
    pub fn subscribe_updates(&self) -> UpdateReceiver {
        UpdateReceiver::new(self.updates.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routes_known_token_to_its_block() {
        let router = SubscriptionRouter::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (token, command) = router.register("Level1", "levels", None, tx);

        assert!(command.encode().starts_with(r#""Level1" subscribe levels levels"#));
        assert!(router.route(&token, json!([-10.0])));

        let publication = rx.try_recv().unwrap();
        assert_eq!(publication.attribute, "levels");
        assert_eq!(publication.index, None);
        assert_eq!(publication.value, json!([-10.0]));
    }

    #[test]
    fn unknown_token_is_dropped() {
        let router = SubscriptionRouter::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.register("Level1", "levels", None, tx);

        assert!(!router.route("nobody", json!(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_sink_unregisters_token() {
        let router = SubscriptionRouter::new(None);
        let (tx, rx) = mpsc::unbounded_channel();
        let (token, _) = router.register("Mute1", "mutes", None, tx);
        drop(rx);

        assert!(!router.route(&token, json!([true])));
        assert!(router.is_empty());
    }

    #[test]
    fn publish_interval_is_appended() {
        let router = SubscriptionRouter::new(Some(Duration::from_millis(250)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (token, command) = router.register("Src", "sourceLevel", Some(2), tx);
        assert_eq!(
            command.encode(),
            format!(r#""Src" subscribe sourceLevel 2 {token} 250"#)
        );
        assert_eq!(router.subscribe_commands(), vec![command]);
        assert_eq!(
            router.unsubscribe_commands()[0].encode(),
            format!(r#""Src" unsubscribe sourceLevel 2 {token}"#)
        );
    }
}

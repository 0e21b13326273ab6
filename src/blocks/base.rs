use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_f64, value_as_string, Argument, Command, Target};
use crate::subscription::{BlockUpdate, Publication};
use crate::sync::lock;
use crate::types::LevelRange;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Live state of a block that can absorb device publishes
pub(crate) trait BlockState: Send + 'static {
    /// Apply one publication. On error the state must be left untouched.
    fn apply(&mut self, publication: &Publication) -> Result<()>;
}

/// Identity, session handle and locked live state shared by every block type
///
/// The state mutex is the single write point for both confirmed setter
/// results and publishes delivered by the block's delivery task.
pub(crate) struct BlockCore<S> {
    id: Arc<str>,
    session: Arc<Session>,
    state: Arc<Mutex<S>>,
}

impl<S> Clone for BlockCore<S> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            session: Arc::clone(&self.session),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Send + 'static> BlockCore<S> {
    pub(crate) fn new(session: Arc<Session>, id: &str, state: S) -> Self {
        Self {
            id: Arc::from(id),
            session,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Read from the cached state without touching the network
    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&lock(&self.state))
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.state))
    }

    pub(crate) async fn get(&self, attribute: &str, index: Option<u32>) -> Result<Value> {
        query(&self.session, &self.id, attribute, index).await
    }

    /// Send a `set` and wait for the device to confirm it
    pub(crate) async fn set(
        &self,
        attribute: &str,
        index: Option<u32>,
        value: impl Into<Argument>,
    ) -> Result<()> {
        let command = Command::set(Target::block(&*self.id), attribute)
            .with_optional_index(index)
            .with_arg(value);
        self.session.send(&command).await?;
        tracing::debug!(block = %self.id, attribute, ?index, "Set confirmed");
        Ok(())
    }

    /// Query one attribute and store it as soon as the reply arrives
    ///
    /// Requests are serialized on the wire, so a setter issued while a
    /// refresh is running is confirmed (and cached) after any earlier poll
    /// of the same attribute has been stored.
    pub(crate) async fn poll<T>(
        &self,
        attribute: &str,
        index: Option<u32>,
        parse: impl FnOnce(&Value) -> Result<T>,
        store: impl FnOnce(&mut S, T),
    ) -> Result<()> {
        let value = parse(&self.get(attribute, index).await?)?;
        self.update(|s| store(s, value));
        Ok(())
    }
}

impl<S: BlockState> BlockCore<S> {

    /// Register and issue subscriptions, starting the block's delivery task
    ///
    /// A subscription the device rejects is dropped with a warning; connection
    /// failures are returned.
    pub(crate) async fn subscribe(&self, subscriptions: &[(&str, Option<u32>)]) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }

        let router = self.session.router();
        let (sink, publications) = mpsc::unbounded_channel();
        spawn_delivery(
            Arc::clone(&self.id),
            Arc::clone(&self.state),
            publications,
            router.updates(),
        );

        for &(attribute, index) in subscriptions {
            let (token, command) = router.register(&self.id, attribute, index, sink.clone());
            match self.session.send(&command).await {
                Ok(_) => {}
                Err(e @ TesiraError::Device { .. }) => {
                    tracing::warn!(block = %self.id, attribute, ?index, error = %e, "Subscription rejected");
                    router.remove(&token);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Apply publications for one block, in arrival order, off the read loop
fn spawn_delivery<S: BlockState>(
    block_id: Arc<str>,
    state: Arc<Mutex<S>>,
    mut publications: mpsc::UnboundedReceiver<Publication>,
    updates: broadcast::Sender<BlockUpdate>,
) {
    tokio::spawn(async move {
        while let Some(publication) = publications.recv().await {
            let applied = lock(&state).apply(&publication);
            match applied {
                Ok(()) => {
                    tracing::trace!(block = %block_id, attribute = %publication.attribute, "Publish applied");
                    // No listeners is fine
                    let _ = updates.send(BlockUpdate {
                        block_id: block_id.to_string(),
                        attribute: publication.attribute,
                        index: publication.index,
                        value: publication.value,
                    });
                }
                Err(e) => {
                    tracing::warn!(block = %block_id, attribute = %publication.attribute, error = %e, "Ignoring publish");
                }
            }
        }
        tracing::debug!(block = %block_id, "Publication delivery stopped");
    });
}

// ========== Queries used during discovery and refresh ==========

pub(crate) async fn query(
    session: &Session,
    id: &str,
    attribute: &str,
    index: Option<u32>,
) -> Result<Value> {
    let command = Command::get(Target::block(id), attribute).with_optional_index(index);
    session.send(&command).await
}

/// Query a label; a label the device refuses to report is empty
pub(crate) async fn query_label(
    session: &Session,
    id: &str,
    attribute: &str,
    index: u32,
) -> Result<String> {
    match query(session, id, attribute, Some(index)).await {
        Ok(value) => Ok(value_as_string(&value).unwrap_or_default()),
        Err(TesiraError::Device { message, .. }) => {
            tracing::debug!(block = id, index, "No {} ({})", attribute, message);
            Ok(String::new())
        }
        Err(e) => Err(e),
    }
}

pub(crate) async fn query_range(
    session: &Session,
    id: &str,
    min_attribute: &str,
    max_attribute: &str,
    index: Option<u32>,
) -> Result<LevelRange> {
    let min = value_as_f64(&query(session, id, min_attribute, index).await?)?;
    let max = value_as_f64(&query(session, id, max_attribute, index).await?)?;
    Ok(LevelRange::new(min, max))
}

// ========== Argument validation ==========

/// Reject a 1-based index outside `1..=count`
pub(crate) fn check_index(block: &str, what: &str, index: u32, count: usize) -> Result<()> {
    if index == 0 || index as usize > count {
        return Err(TesiraError::validation(format!(
            "{what} {index} out of range 1..={count} on '{block}'"
        )));
    }
    Ok(())
}

pub(crate) fn check_finite(block: &str, what: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(TesiraError::validation(format!(
            "{what} must be a finite number on '{block}', got {value}"
        )));
    }
    Ok(())
}

/// Warn about a value outside the recorded limits; it is still sent
pub(crate) fn warn_if_outside(block: &str, what: &str, value: f64, range: Option<LevelRange>) {
    if let Some(range) = range {
        if !range.contains(value) {
            tracing::warn!(
                block,
                "{what} {value} outside device limits {}..={}",
                range.min,
                range.max
            );
        }
    }
}

/// Element addressed by a 1-based publish index
pub(crate) fn slot_mut<T>(items: &mut [T], index: Option<u32>) -> Result<&mut T> {
    let index = index.ok_or_else(|| TesiraError::protocol("indexed publish without index"))?;
    let len = items.len();
    index
        .checked_sub(1)
        .and_then(|i| items.get_mut(i as usize))
        .ok_or_else(|| TesiraError::protocol(format!("publish index {index} out of range 1..={len}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_bounds_are_one_based() {
        assert!(check_index("Level1", "channel", 1, 2).is_ok());
        assert!(check_index("Level1", "channel", 2, 2).is_ok());
        assert!(matches!(
            check_index("Level1", "channel", 0, 2),
            Err(TesiraError::Validation(_))
        ));
        assert!(matches!(
            check_index("Level1", "channel", 3, 2),
            Err(TesiraError::Validation(_))
        ));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert!(check_finite("Level1", "level", -20.0).is_ok());
        assert!(check_finite("Level1", "level", f64::NAN).is_err());
        assert!(check_finite("Level1", "level", f64::INFINITY).is_err());
    }

    #[test]
    fn slot_lookup() {
        let mut items = vec![10, 20];
        *slot_mut(&mut items, Some(2)).unwrap() += 1;
        assert_eq!(items, vec![10, 21]);
        assert!(slot_mut(&mut items, Some(0)).is_err());
        assert!(slot_mut(&mut items, Some(3)).is_err());
        assert!(slot_mut(&mut items, None).is_err());
    }
}

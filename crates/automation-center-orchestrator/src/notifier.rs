use std::sync::Arc;

use automation_center_domain::{ChangeEvent, RunId};
use automation_center_store_core::ChangeSink;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

struct Subscriber {
    run_id: Option<RunId>,
    sender: UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        match self.run_id {
            Some(run_id) => event.run_id() == run_id,
            None => true,
        }
    }
}

/// Fans committed transitions out to live subscribers.
///
/// Installed as the store's [`ChangeSink`], so events are queued from inside
/// the store's commit section. Each subscriber owns an unbounded queue: a slow
/// reader delays only itself and never loses an event. Dropping a
/// [`ChangeSubscription`] detaches it on the next publish.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of one run, or of every run when `run_id` is `None`.
    #[must_use]
    pub fn subscribe(&self, run_id: Option<RunId>) -> ChangeSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { run_id, sender });
        ChangeSubscription { receiver, run_id }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        subscribers.len()
    }
}

impl ChangeSink for ChangeNotifier {
    fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !subscriber.wants(&event) {
                return !subscriber.sender.is_closed();
            }
            let delivered = subscriber.sender.send(event.clone()).is_ok();
            if !delivered {
                debug!(run_id = ?subscriber.run_id, "change subscriber dropped; detaching");
            }
            delivered
        });
    }
}

#[derive(Debug)]
pub struct ChangeSubscription {
    receiver: UnboundedReceiver<ChangeEvent>,
    run_id: Option<RunId>,
}

impl ChangeSubscription {
    /// Run this subscription is filtered to, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    /// Wait for the next event. `None` once every notifier handle is gone and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Next event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drain every event already queued.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

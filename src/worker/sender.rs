use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::Sender;

use crate::message::OutgoingMessage;
use crate::queue::LocklessQueue;

/// Handed to command handlers; pushes onto the worker's outgoing queue.
pub type QueueSendCallback = Arc<dyn Fn(OutgoingMessage) + Send + Sync>;

struct SendShared {
    queue: LocklessQueue<OutgoingMessage>,
    // The only lock on the send path. The event loop also takes it while it
    // swaps endpoints during reconnect.
    wakeup: Mutex<Option<Sender<()>>>,
}

/// Producer side of the outgoing path. Cheap to clone and safe to use from
/// any thread; messages queued while no loop is running wait for the next
/// `start`.
#[derive(Clone)]
pub struct SendWorker {
    shared: Arc<SendShared>,
}

impl SendWorker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SendShared {
                queue: LocklessQueue::new(),
                wakeup: Mutex::new(None),
            }),
        }
    }

    pub fn queue_send(&self, message: OutgoingMessage) {
        self.shared.queue.push(message);

        // The loop already detached our message; nothing left to wake it for.
        if self.shared.queue.is_empty() {
            return;
        }
        self.wake();
    }

    pub fn callback(&self) -> QueueSendCallback {
        let sender = self.clone();
        Arc::new(move |message| sender.queue_send(message))
    }

    /// Posts a notification unless one is already pending.
    pub(crate) fn wake(&self) {
        if let Some(wakeup) = self.lock_wakeup().as_ref() {
            let _ = wakeup.try_send(());
        }
    }

    pub(crate) fn drain(&self) -> Vec<OutgoingMessage> {
        self.shared.queue.drain_all()
    }

    pub(crate) fn install_wakeup(&self, wakeup: Option<Sender<()>>) {
        *self.lock_wakeup() = wakeup;
    }

    pub(crate) fn lock_wakeup(&self) -> MutexGuard<'_, Option<Sender<()>>> {
        self.shared
            .wakeup
            .lock()
            .expect("wakeup sender lock poisoned")
    }
}

impl Default for SendWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use crate::message::{Identity, OutgoingMessage};

    use super::SendWorker;

    fn message(id: u32) -> OutgoingMessage {
        OutgoingMessage::new(Identity::new(vec![1]), "push", id, Vec::new())
    }

    #[test]
    fn notifications_coalesce_into_one_pending_signal() {
        let sender = SendWorker::new();
        let (wakeup_tx, wakeup_rx) = bounded(1);
        sender.install_wakeup(Some(wakeup_tx));

        for id in 0..5 {
            sender.queue_send(message(id));
        }

        assert_eq!(wakeup_rx.len(), 1);
        let ids = sender.drain().into_iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn queue_send_without_a_loop_keeps_messages() {
        let sender = SendWorker::new();
        sender.queue_send(message(1));
        (sender.callback())(message(2));

        assert_eq!(sender.drain().len(), 2);
    }
}

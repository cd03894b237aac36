//! In-process message transport between replicas

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use raft::prelude::Message;
use tokio::sync::mpsc::{error::TrySendError, Sender};

/// Delivers raft messages to the mailbox of the addressed replica.
///
/// Messages to replicas that are not registered are dropped, the way a
/// network drops packets to a stopped process; raft retries on its own.
#[derive(Clone, Default)]
pub struct Router {
    mailboxes: Arc<RwLock<HashMap<u64, Sender<Message>>>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    pub fn register(&self, id: u64, mailbox: Sender<Message>) {
        self.mailboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, mailbox);
    }

    pub fn unregister(&self, id: u64) {
        self.mailboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.mailboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn send(&self, msg: Message) {
        let to = msg.to;
        let mailbox = self
            .mailboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .cloned();
        match mailbox {
            Some(mailbox) => match mailbox.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    log::warn!(
                        "mailbox of {} is full, dropping {:?}",
                        to,
                        msg.get_msg_type()
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("replica {} is gone, dropping message", to);
                }
            },
            None => log::trace!("replica {} is not reachable", to),
        }
    }

    pub fn send_all(&self, msgs: Vec<Message>) {
        for msg in msgs {
            self.send(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn message(to: u64) -> Message {
        let mut msg = Message::default();
        msg.to = to;
        msg
    }

    #[test]
    fn test_routes_by_recipient() {
        let router = Router::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.register(1, tx1);
        router.register(2, tx2);

        router.send_all(vec![message(2), message(1), message(3)]);
        assert_eq!(rx1.try_recv().unwrap().to, 1);
        assert_eq!(rx2.try_recv().unwrap().to, 2);
        assert!(rx1.try_recv().is_err());

        router.unregister(2);
        assert!(!router.is_registered(2));
        router.send(message(2));
        assert!(rx2.try_recv().is_err());
    }
}

//! In-process transport.
//!
//! Every participant joins a shared [`MemoryHub`] and gets an inbox. Useful
//! for multi-node simulations without sockets. Links can be made lossy to
//! exercise timeouts and retries.

use super::transport::{ready_ack, InboundFrame, SendAck, Transport, TransportError};
use crate::types::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

const INBOX_CAPACITY: usize = 1024;

#[derive(Default)]
pub struct MemoryHub {
    inboxes: RwLock<HashMap<PeerId, mpsc::Sender<InboundFrame>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, peer: PeerId) -> (Arc<MemoryTransport>, mpsc::Receiver<InboundFrame>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().insert(peer, tx);
        let transport = Arc::new(MemoryTransport {
            local: peer,
            hub: self.clone(),
            lossy: Mutex::new(HashSet::new()),
        });
        (transport, rx)
    }

    pub fn leave(&self, peer: &PeerId) {
        self.inboxes.write().remove(peer);
    }
}

pub struct MemoryTransport {
    local: PeerId,
    hub: Arc<MemoryHub>,
    /// Destinations whose frames are acknowledged but silently lost
    lossy: Mutex<HashSet<PeerId>>,
}

impl MemoryTransport {
    pub fn set_lossy(&self, to: PeerId, lossy: bool) {
        let mut set = self.lossy.lock();
        if lossy {
            set.insert(to);
        } else {
            set.remove(&to);
        }
    }
}

impl Transport for MemoryTransport {
    fn send_frame(&self, to: &PeerId, frame: Vec<u8>) -> SendAck {
        if self.lossy.lock().contains(to) {
            trace!("Dropping frame {} -> {}", self.local, to);
            return ready_ack(Ok(()));
        }

        let inbox = self.hub.inboxes.read().get(to).cloned();
        let result = match inbox {
            Some(inbox) => inbox
                .try_send(InboundFrame { via: self.local, frame })
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(*to),
                    mpsc::error::TrySendError::Closed(_) => TransportError::Closed(*to),
                }),
            None => Err(TransportError::NotConnected(*to)),
        };
        ready_ack(result)
    }
}

// Message router: demultiplexes inbound envelopes into typed per-domain
// streams.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::protocol::{Domain, Envelope, Inbound, MessageType};

const STREAM_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Router {
    domains: HashMap<Domain, broadcast::Sender<Inbound>>,
    all: broadcast::Sender<Inbound>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let domains = Domain::ALL
            .iter()
            .map(|domain| (*domain, broadcast::channel(STREAM_CAPACITY).0))
            .collect();
        Router {
            domains,
            all: broadcast::channel(STREAM_CAPACITY).0,
        }
    }

    /// Messages of one domain, in arrival order.
    pub fn subscribe(&self, domain: Domain) -> broadcast::Receiver<Inbound> {
        self.domains[&domain].subscribe()
    }

    /// Every decoded message regardless of domain, in arrival order.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Inbound> {
        self.all.subscribe()
    }

    /// Decode `envelope` and publish it. Returns `false` when the message was
    /// ignored (unknown tag or a payload of the wrong shape).
    pub fn dispatch(&self, envelope: &Envelope) -> bool {
        let Some(kind) = MessageType::from_tag(&envelope.kind) else {
            trace!("Ignoring message with unknown type {}", envelope.kind);
            return false;
        };

        let inbound = match Inbound::decode(kind, envelope) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping {}: {e}", envelope.kind);
                return false;
            }
        };

        trace!("Routing {} to {:?}", envelope.kind, kind.domain());
        // Sends fail only when nobody is subscribed.
        let _ = self.domains[&kind.domain()].send(inbound.clone());
        let _ = self.all.send(inbound);
        true
    }

    /// Dispatch everything arriving on `messages` until the source closes.
    pub fn spawn(&self, mut messages: broadcast::Receiver<Envelope>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(envelope) => {
                        router.dispatch(&envelope);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Router fell behind; {skipped} inbound message(s) skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

//! Routes an inbound message to the controller (replies) or the worker
//! (requests). §4.7 — trivial but load-bearing: this is what lets a
//! dual-role node serve both roles over the same connections.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::Controller;
use crate::transport::{Inbound, Transport};
use crate::worker::Worker;

pub struct Dispatcher;

impl Dispatcher {
    /// Spawn the dispatch loop over `inbound`, which the transport feeds
    /// every successfully decrypted, non-duplicate application message.
    pub fn spawn(transport: Arc<Transport>, controller: Arc<Controller>, worker: Arc<Worker>, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(Inbound { peer_id, message }) = inbound.recv().await {
                if message.is_reply() {
                    if !controller.deliver_reply(message).await {
                        debug!(%peer_id, "dropped reply with no matching pending request");
                    }
                    continue;
                }

                match transport.connection(&peer_id).await {
                    Some(conn) => worker.handle(&conn, &message).await,
                    None => debug!(%peer_id, "dropped request: connection no longer live"),
                }
            }
        })
    }
}

// src/wire.rs

//! Bridges a `ReliableOperationSender`'s synchronous `SendCallback` to the
//! async `Transport` trait: a bounded channel plus a background task that
//! actually awaits `Transport::send`. `try_send` failing with `Full` is what
//! surfaces as `TransportSendQueueFull` to the sender (pause this tick,
//! don't fault); a transport-reported `MessageTooLarge` instead reaches the
//! session through `on_fault`, since by the time the background task sees
//! it the synchronous sender has already moved on.

use crate::message::Message;
use crate::operation::Operation;
use crate::sender::SendCallback;
use crate::transport::{Transport, TransportError};
use crate::types::ReplicaTarget;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Builds a `SendCallback` that forwards accepted sends to `transport` for
/// `target`, translating `(op, request_ack)` into a wire `Message` via
/// `build_message`. `on_fault` is invoked out-of-band when a background
/// send ultimately fails in a way the session must react to.
pub fn spawn_transport_sender<B, F>(
    transport: Arc<dyn Transport>,
    target: ReplicaTarget,
    build_message: B,
    on_fault: F,
    queue_capacity: usize,
) -> SendCallback
where
    B: Fn(Option<&Operation>, bool) -> Message + Send + 'static,
    F: Fn(TransportError) + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(queue_capacity.max(1));
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = transport.send(&target, msg).await {
                warn!(remote = %target, error = %err, "transport send failed");
                on_fault(err);
            }
        }
    });

    Box::new(move |op, request_ack| {
        let msg = build_message(op, request_ack);
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    })
}

//! One-shot byte-stream handoff points keyed by plan id.

use crate::artifact::ByteStream;
use crate::cancellation::CancellationToken;
use crate::core::PlanId;
use crate::errors::{ExecError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

enum Slot {
    /// A sender is parked with its stream, waiting to hear it was taken.
    Sending {
        stream: ByteStream,
        taken: oneshot::Sender<()>,
    },
    /// A receiver is parked, waiting for a stream.
    Receiving(oneshot::Sender<ByteStream>),
}

/// Blocking handoff of byte streams between a step and an outside party.
///
/// Whichever side arrives first parks until the other shows up; each use of
/// a plan id hands over exactly one stream. Both sides give up when their
/// cancellation token fires.
#[derive(Default)]
pub struct Rendezvous {
    slots: Mutex<HashMap<PlanId, Slot>>,
}

impl Rendezvous {
    /// Creates an empty rendezvous table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `stream` to the receiver for `id`, waiting until it is taken.
    pub async fn send(
        &self,
        id: &PlanId,
        stream: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = stream;
        let mut taken = {
            let mut slots = self.slots.lock();
            match slots.remove(id) {
                Some(Slot::Receiving(tx)) => match tx.send(stream) {
                    Ok(()) => {
                        debug!(plan_id = %id, "stream handed to waiting receiver");
                        return Ok(());
                    }
                    // The receiver gave up; wait for the next one.
                    Err(returned) => stream = returned,
                },
                Some(busy @ Slot::Sending { .. }) => {
                    slots.insert(id.clone(), busy);
                    return Err(ExecError::RendezvousBusy {
                        plan_id: id.to_string(),
                    });
                }
                None => {}
            }

            let (tx, rx) = oneshot::channel();
            slots.insert(id.clone(), Slot::Sending { stream, taken: tx });
            rx
        };

        tokio::select! {
            biased;
            res = &mut taken => res.map_err(|_| ExecError::internal("rendezvous dropped")),
            () = cancel.cancelled() => {
                let mut slots = self.slots.lock();
                if matches!(slots.get(id), Some(Slot::Sending { .. })) {
                    slots.remove(id);
                }
                drop(slots);

                // Taken just before the slot was cleared.
                if taken.try_recv().is_ok() {
                    return Ok(());
                }
                Err(ExecError::Interrupted)
            }
        }
    }

    /// Waits for the stream sent for `id`.
    pub async fn receive(&self, id: &PlanId, cancel: &CancellationToken) -> Result<ByteStream> {
        let mut incoming = {
            let mut slots = self.slots.lock();
            match slots.remove(id) {
                Some(Slot::Sending { stream, taken }) => {
                    let _ = taken.send(());
                    debug!(plan_id = %id, "took stream from waiting sender");
                    return Ok(stream);
                }
                Some(busy @ Slot::Receiving(_)) => {
                    slots.insert(id.clone(), busy);
                    return Err(ExecError::RendezvousBusy {
                        plan_id: id.to_string(),
                    });
                }
                None => {}
            }

            let (tx, rx) = oneshot::channel();
            slots.insert(id.clone(), Slot::Receiving(tx));
            rx
        };

        tokio::select! {
            biased;
            res = &mut incoming => res.map_err(|_| ExecError::internal("rendezvous dropped")),
            () = cancel.cancelled() => {
                let mut slots = self.slots.lock();
                if matches!(slots.get(id), Some(Slot::Receiving(_))) {
                    slots.remove(id);
                }
                drop(slots);

                // The sender already counts this stream as delivered.
                match incoming.try_recv() {
                    Ok(stream) => Ok(stream),
                    Err(_) => Err(ExecError::Interrupted),
                }
            }
        }
    }

    /// Returns true if either side is parked on `id`.
    #[must_use]
    pub fn is_pending(&self, id: &PlanId) -> bool {
        self.slots.lock().contains_key(id)
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending: Vec<String> = self.slots.lock().keys().map(ToString::to_string).collect();
        f.debug_struct("Rendezvous").field("pending", &pending).finish()
    }
}

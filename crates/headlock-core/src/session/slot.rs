//! Rendezvous slot: a capacity-one, generation-tagged handoff
//!
//! The agent side arms the slot and waits on the returned [`WaitHandle`];
//! the controller side fulfils it exactly once. Every arm, fulfil and disarm
//! bumps the generation, so a fulfil aimed at an abandoned wait can be
//! recognised and rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// Value handed from the controller to a waiting agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub instruction: Option<String>,
    pub should_terminate: bool,
}

impl Delivery {
    /// An instruction for the agent to carry out
    pub fn instruction(instruction: impl Into<String>) -> Self {
        Self {
            instruction: Some(instruction.into()),
            should_terminate: false,
        }
    }

    /// Tells the agent to stop
    pub fn terminate() -> Self {
        Self {
            instruction: None,
            should_terminate: true,
        }
    }
}

/// Slot-level failures; the coordinator maps these onto session errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot is already armed")]
    AlreadyArmed,
    #[error("slot is not armed")]
    NotArmed,
}

struct Armed {
    generation: u64,
    tx: oneshot::Sender<Delivery>,
}

/// Per-session single-waiter slot
#[derive(Default)]
pub struct RendezvousSlot {
    generation: u64,
    armed: Option<Armed>,
}

/// Receiving side of an armed slot
#[derive(Debug)]
pub struct WaitHandle {
    generation: u64,
    rx: oneshot::Receiver<Delivery>,
}

impl WaitHandle {
    /// Generation the slot was armed at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn receiver(&mut self) -> &mut oneshot::Receiver<Delivery> {
        &mut self.rx
    }
}

impl RendezvousSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation counter
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a live waiter is attached
    pub fn is_armed(&self) -> bool {
        self.armed.as_ref().is_some_and(|armed| !armed.tx.is_closed())
    }

    /// Generation of the armed wait, if any
    pub fn armed_generation(&self) -> Option<u64> {
        self.armed.as_ref().map(|armed| armed.generation)
    }

    /// Arm the slot for a new wait.
    ///
    /// A slot whose waiter vanished without disarming is reclaimed here.
    pub fn arm(&mut self) -> Result<WaitHandle, SlotError> {
        if self.is_armed() {
            return Err(SlotError::AlreadyArmed);
        }

        let (tx, rx) = oneshot::channel();
        self.generation += 1;
        self.armed = Some(Armed {
            generation: self.generation,
            tx,
        });

        Ok(WaitHandle {
            generation: self.generation,
            rx,
        })
    }

    /// Hand `delivery` to whoever is waiting.
    ///
    /// Returns the generation that was fulfilled. Fails with `NotArmed` when
    /// nothing is armed or the waiter has already gone away; in the latter
    /// case the slot is still cleared.
    pub fn fulfil(&mut self, delivery: Delivery) -> Result<u64, SlotError> {
        let armed = self.armed.take().ok_or(SlotError::NotArmed)?;
        self.generation += 1;

        armed
            .tx
            .send(delivery)
            .map(|_| armed.generation)
            .map_err(|_| SlotError::NotArmed)
    }

    /// Fulfil only if the armed wait carries `generation`
    pub fn fulfil_generation(&mut self, generation: u64, delivery: Delivery) -> Result<(), SlotError> {
        if self.armed_generation() != Some(generation) {
            return Err(SlotError::NotArmed);
        }
        self.fulfil(delivery).map(|_| ())
    }

    /// Clear the slot if it is still armed at `generation`.
    ///
    /// Returns false when the wait was already fulfilled or superseded.
    pub fn disarm(&mut self, generation: u64) -> bool {
        if self.armed_generation() != Some(generation) {
            return false;
        }
        self.armed = None;
        self.generation += 1;
        true
    }

    /// Drop any armed sender; the waiter observes cancellation
    pub fn close(&mut self) -> bool {
        match self.armed.take() {
            Some(_) => {
                self.generation += 1;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RendezvousSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousSlot")
            .field("generation", &self.generation)
            .field("armed", &self.armed_generation())
            .finish()
    }
}

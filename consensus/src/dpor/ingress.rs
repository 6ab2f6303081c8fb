//! Mailbox and message types for the [Driver](super::Driver).

use super::types::{Block, Input, MsgCode, Phase};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Messages that can be sent to the driver.
pub enum Message {
    /// A consensus message received from a peer.
    Deliver { input: Input, code: MsgCode },
    /// A block proposed by the local node.
    Propose { block: Block },
    /// The proposal timer expired.
    Expire,
    /// A full block received out of band.
    Cache { block: Block },
    /// Request for the current phase.
    Status { response: oneshot::Sender<Phase> },
}

/// Mailbox for sending messages to the driver.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Delivers a consensus message received from a peer.
    pub async fn deliver(&mut self, input: Input, code: MsgCode) {
        self.sender
            .send(Message::Deliver { input, code })
            .await
            .expect("Failed to send deliver");
    }

    /// Proposes a block built locally.
    pub async fn propose(&mut self, block: Block) {
        self.sender
            .send(Message::Propose { block })
            .await
            .expect("Failed to send propose");
    }

    /// Signals that the proposer failed to propose in time.
    pub async fn expire(&mut self) {
        self.sender
            .send(Message::Expire)
            .await
            .expect("Failed to send expire");
    }

    /// Registers a full block so a later commit quorum on its header can be finalized.
    pub async fn cache(&mut self, block: Block) {
        self.sender
            .send(Message::Cache { block })
            .await
            .expect("Failed to send cache");
    }

    /// Returns the phase once every previously sent message has been processed.
    pub async fn status(&mut self) -> Phase {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(Message::Status { response })
            .await
            .expect("Failed to send status");
        receiver.await.expect("Failed to receive status")
    }
}

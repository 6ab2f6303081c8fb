//! Ingest loop feeding a [StateMachine] and executing its instructions.

use super::{
    ingress::{Mailbox, Message},
    types::{Action, Input, Instruction, MsgCode, Output},
    Chain, Network, Service, StateMachine,
};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the [Driver].
pub struct Config<S: Service, N: Network, C: Chain> {
    /// State machine to drive.
    pub machine: Arc<StateMachine<S>>,

    /// Sends instructed broadcasts.
    pub network: N,

    /// Receives finalized blocks.
    pub chain: C,

    /// Number of messages buffered before [Mailbox] senders wait.
    pub mailbox_size: usize,
}

/// Processes messages one at a time until every [Mailbox] is dropped.
pub struct Driver<S: Service, N: Network, C: Chain> {
    machine: Arc<StateMachine<S>>,
    network: N,
    chain: C,

    mailbox: mpsc::Receiver<Message>,
}

impl<S: Service, N: Network, C: Chain> Driver<S, N, C> {
    pub fn new(cfg: Config<S, N, C>) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        (
            Self {
                machine: cfg.machine,
                network: cfg.network,
                chain: cfg.chain,
                mailbox: receiver,
            },
            Mailbox::new(sender),
        )
    }

    pub async fn run(mut self) {
        while let Some(message) = self.mailbox.next().await {
            let (input, code) = match message {
                Message::Deliver { input, code } => (input, code),
                Message::Propose { block } => (Input::Block(block), MsgCode::Preprepare),
                Message::Expire => (Input::None, MsgCode::ImpeachPreprepare),
                Message::Cache { block } => {
                    self.machine.cache_block(block);
                    continue;
                }
                Message::Status { response } => {
                    let _ = response.send(self.machine.phase());
                    continue;
                }
            };

            let instruction = match self.machine.step(input, code) {
                Ok(instruction) => instruction,
                Err(err) => {
                    warn!(?err, ?code, "dropped message");
                    continue;
                }
            };
            if let Some(fault) = &instruction.fault {
                warn!(?fault, "proposer fault detected");
            }
            self.execute(instruction).await;
        }
        debug!("mailbox closed, shutting down");
    }

    async fn execute(&mut self, instruction: Instruction) {
        let Instruction {
            output,
            action,
            code,
            ..
        } = instruction;
        match action {
            Action::None => {}
            Action::Broadcast => self.network.broadcast(code, output).await,
            Action::InsertBlock => self.insert(output).await,
            Action::BroadcastAndInsertBlock => {
                self.network.broadcast(code, output.clone()).await;
                self.insert(output).await;
            }
        }
    }

    async fn insert(&mut self, output: Output) {
        let Output::Block(block) = output else {
            warn!(kind = ?output.kind(), "no block to insert");
            return;
        };
        let height = block.number();
        let hash = block.hash();
        match self.chain.insert(block).await {
            Ok(()) => info!(height, %hash, "inserted block"),
            Err(err) => warn!(?err, height, %hash, "failed to insert block"),
        }
    }
}

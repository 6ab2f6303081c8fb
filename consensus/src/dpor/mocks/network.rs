use crate::dpor::{
    types::{Block, Height, MsgCode, Output},
    Chain as C, Network as N,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use thiserror::Error;

/// Records every broadcast.
#[derive(Clone, Default)]
pub struct Network {
    sent: Arc<Mutex<Vec<(MsgCode, Output)>>>,
}

impl Network {
    pub fn sent(&self) -> Vec<(MsgCode, Output)> {
        self.sent.lock().unwrap().clone()
    }
}

impl N for Network {
    async fn broadcast(&mut self, code: MsgCode, output: Output) {
        self.sent.lock().unwrap().push((code, output));
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {0} rejected")]
    Rejected(Height),
}

/// Records every inserted block.
#[derive(Clone, Default)]
pub struct Chain {
    blocks: Arc<Mutex<Vec<Block>>>,
    reject: Arc<AtomicBool>,
}

impl Chain {
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }
}

impl C for Chain {
    type Error = Error;

    async fn insert(&mut self, block: Block) -> Result<(), Self::Error> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(Error::Rejected(block.number()));
        }
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }
}

//! Finalize blocks with a committee of validators elected by Dynamic Proof of Reputation (DPoR).
//!
//! `dpor` is the validator-side finite state machine of a PBFT-like, three-phase agreement
//! (preprepare, prepare, commit) over one block per height. When a proposer misbehaves or stays
//! silent, validators run a parallel two-phase path that agrees on an *impeachment block* instead,
//! so the chain keeps making progress.
//!
//! # Features
//!
//! * Single Block per Height
//! * `2f + 1` Certificates over a `3f + 1` Committee
//! * Impeachment of Faulty or Silent Proposers
//! * Tolerant of Duplicate, Reordered and Late Messages
//! * Pluggable Signing, Validation and Block Construction (via [Service])
//!
//! # Design
//!
//! ## Protocol Description
//!
//! ### Phases
//!
//! ```text
//!                 Preprepare (valid)         2f+1 Prepare
//!       +------+ -----------------> +-------------+ ----------> +----------+
//!       | Idle |                    | Preprepared |             | Prepared |
//!       +------+ <----------------- +-------------+ <---------- +----------+
//!          ^      2f+1 Commit / Validate           Commit (no quorum)  |
//!          |                                                           |
//!          +-------------------- 2f+1 Commit / Validate ---------------+
//!
//!       Preprepare (faulty) / timer expiry
//!   * ---------------------------------> +--------------------+ 2f+1 ImpeachPrepare
//!                                        | ImpeachPreprepared | ----------------+
//!                                        +--------------------+                 v
//!        Idle <----------- 2f+1 ImpeachCommit / ImpeachValidate ----- +-----------------+
//!                                                                     | ImpeachPrepared |
//!                                                                     +-----------------+
//! ```
//!
//! ### Specification for Height `h`
//!
//! Upon receiving `preprepare(b)` while idle:
//! * If `b` is invalid, propose an impeachment block and broadcast `impeach_prepare`
//! * Otherwise, sign `b` (as preprepared), cache it and broadcast `prepare(header(b))`
//!
//! Upon receiving `prepare(h)` (or `impeach_prepare(h)`):
//! * Recover the embedded signatures and record them for the current height
//! * Upon observing `2f + 1` matching signatures, sign `h` (as prepared) and broadcast
//!   `commit(h)` (or `impeach_commit(h)`)
//!
//! Upon receiving `commit(h)` (or `impeach_commit(h)`):
//! * Recover the embedded signatures and record them for the current height
//! * Upon observing `2f + 1` matching signatures, fill the cached block's empty signature
//!   slots, insert it and broadcast `validate(b)` (or `impeach_validate(b)`)
//!
//! Upon receiving `validate(b)` (or `impeach_validate(b)`):
//! * Insert `b` and return to idle
//!
//! Upon timer expiry:
//! * Propose an impeachment block and broadcast `impeach_prepare`
//!
//! ### Heights
//!
//! Every signature is recorded against the highest height observed so far (the watermark).
//! Observing a higher height discards everything recorded for lower heights, so a quorum is never
//! assembled from signatures over different heights. Each validator contributes at most one
//! signature per certificate: a later signature from the same validator replaces the earlier one.
//!
//! ## Architecture
//!
//! The [StateMachine] is synchronous and performs no I/O. It returns an
//! [Instruction](types::Instruction) telling the caller what to broadcast and what to insert into
//! the chain. The [Driver] is the async ingest loop that feeds messages from a [Mailbox] into the
//! state machine and executes the resulting actions through a [Network] and a [Chain].

pub mod cache;
pub mod certificate;
mod config;
pub use config::{Config, ConfigError};
mod driver;
pub use driver::{Config as DriverConfig, Driver};
mod fsm;
pub use fsm::StateMachine;
mod ingress;
pub use ingress::{Mailbox, Message};
mod metrics;
pub use metrics::Metrics;
pub mod types;

#[cfg(test)]
pub mod mocks;

use std::future::Future;
use types::{Address, Block, Hash, Header, Height, MsgCode, Output, Phase, Signature};

/// Capabilities the state machine needs from the surrounding node.
///
/// Implementations are called synchronously from [StateMachine::step].
pub trait Service: Send + Sync + 'static {
    /// Error returned by fallible operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Verifies that a proposed block is valid.
    fn validate_block(&self, block: &Block) -> Result<(), Self::Error>;

    /// Recovers the signers (and their signatures) embedded in `header`, produced under `phase`.
    ///
    /// The two returned vectors are index-aligned.
    fn ecrecover_sigs(
        &self,
        header: &Header,
        phase: Phase,
    ) -> Result<(Vec<Address>, Vec<Signature>), Self::Error>;

    /// Returns the validator committee at `height`.
    fn validators_of(&self, height: Height) -> Result<Vec<Address>, Self::Error>;

    /// Adds the local validator's signature (produced under `phase`) to `header`.
    fn sign_header(&self, header: &mut Header, phase: Phase) -> Result<(), Self::Error>;

    /// Persists a prepare signature collected by the state machine.
    fn update_prepare_sigs_cache(&self, signer: &Address, hash: &Hash, signature: &Signature);

    /// Persists a commit signature collected by the state machine.
    fn update_final_sigs_cache(&self, signer: &Address, hash: &Hash, signature: &Signature);

    /// Builds an impeachment block for the current height.
    fn create_impeach_block(&self) -> Result<Block, Self::Error>;
}

/// Broadcasts consensus messages to the committee.
pub trait Network: Clone + Send + 'static {
    /// Sends `output` tagged with `code` to every validator.
    fn broadcast(&mut self, code: MsgCode, output: Output) -> impl Future<Output = ()> + Send;
}

/// Stores finalized blocks.
pub trait Chain: Clone + Send + 'static {
    /// Error returned when a block cannot be inserted.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts a finalized block.
    fn insert(&mut self, block: Block) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

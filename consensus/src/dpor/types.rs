//! Types used in [`dpor`](crate::dpor).

use bytes::{BufMut, Bytes, BytesMut};
use dpor_utils::FixedBytes;
use prometheus_client::encoding::EncodeLabelValue;
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

/// Height of a block in the chain.
///
/// Heights are monotonically increasing and act as the unit of agreement: every signature the
/// state machine tracks is bound to exactly one height.
pub type Height = u64;

/// Address of an account (and of a validator).
pub type Address = FixedBytes<20>;

/// Hash of a block header.
pub type Hash = FixedBytes<32>;

/// Recoverable signature (`r || s || v`) over a header.
///
/// An all-zero signature marks an empty slot.
pub type Signature = FixedBytes<65>;

/// Error returned by an external collaborator.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Position of a validator in the consensus cycle of the current height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Ready for the next height.
    #[default]
    Idle,
    /// Accepted a proposal and broadcast a prepare message.
    Preprepared,
    /// Observed a prepare quorum and broadcast a commit message.
    Prepared,
    /// Proposed an impeachment block and broadcast an impeach prepare message.
    ImpeachPreprepared,
    /// Observed an impeach prepare quorum and broadcast an impeach commit message.
    ImpeachPrepared,
}

impl Phase {
    /// Returns a stable numeric identifier for the phase (used as a gauge value).
    pub const fn id(&self) -> i64 {
        match self {
            Phase::Idle => 0,
            Phase::Preprepared => 1,
            Phase::Prepared => 2,
            Phase::ImpeachPreprepared => 3,
            Phase::ImpeachPrepared => 4,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Preprepared => "preprepared",
            Phase::Prepared => "prepared",
            Phase::ImpeachPreprepared => "impeach_preprepared",
            Phase::ImpeachPrepared => "impeach_prepared",
        };
        f.write_str(s)
    }
}

/// Type of protocol message fed into (or emitted by) the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum MsgCode {
    /// No message (used for outputs that are not broadcast).
    None,
    Preprepare,
    Prepare,
    Commit,
    Validate,
    /// Local timer expiry (or a faulty proposal) triggering impeachment.
    ImpeachPreprepare,
    ImpeachPrepare,
    ImpeachCommit,
    ImpeachValidate,
}

/// Discriminant of an [Input] or [Output].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    None,
    Header,
    Block,
    ImpeachBlock,
}

/// Side effect the caller of [`StateMachine::step`](super::StateMachine::step) should perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    None,
    Broadcast,
    InsertBlock,
    BroadcastAndInsertBlock,
}

/// DPoR consensus fields embedded in every header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Proposer's seal over the header.
    pub seal: Signature,

    /// One signature slot per validator, indexed like `validators`.
    pub sigs: Vec<Signature>,

    /// Proposers of the current term.
    pub proposers: Vec<Address>,

    /// Validator committee of this height.
    pub validators: Vec<Address>,
}

impl Snapshot {
    /// Creates a snapshot with one empty signature slot per validator.
    pub fn new(proposers: Vec<Address>, validators: Vec<Address>) -> Self {
        Self {
            seal: Signature::zero(),
            sigs: vec![Signature::zero(); validators.len()],
            proposers,
            validators,
        }
    }

    /// Returns the slot index of `validator`, if it is part of the committee.
    pub fn slot(&self, validator: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v == validator)
    }

    /// Returns the number of filled signature slots.
    pub fn signed(&self) -> usize {
        self.sigs.iter().filter(|s| !s.is_zero()).count()
    }
}

/// Block header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub parent: Hash,
    pub coinbase: Address,
    pub state_root: Hash,
    pub txs_root: Hash,
    pub receipts_root: Hash,
    pub number: Height,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra: Bytes,
    pub dpor: Snapshot,
}

impl Header {
    /// Deterministic encoding of every field except the seal and the signature slots.
    fn encode_unsigned(&self) -> BytesMut {
        let dpor = &self.dpor;
        let size = Hash::LEN * 4
            + Address::LEN
            + 8 * 4
            + 8
            + self.extra.len()
            + 8
            + dpor.proposers.len() * Address::LEN
            + 8
            + dpor.validators.len() * Address::LEN;
        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&self.parent);
        buf.put_slice(&self.coinbase);
        buf.put_slice(&self.state_root);
        buf.put_slice(&self.txs_root);
        buf.put_slice(&self.receipts_root);
        buf.put_u64(self.number);
        buf.put_u64(self.gas_limit);
        buf.put_u64(self.gas_used);
        buf.put_u64(self.timestamp);
        buf.put_u64(self.extra.len() as u64);
        buf.put_slice(&self.extra);
        buf.put_u64(dpor.proposers.len() as u64);
        for proposer in &dpor.proposers {
            buf.put_slice(proposer);
        }
        buf.put_u64(dpor.validators.len() as u64);
        for validator in &dpor.validators {
            buf.put_slice(validator);
        }
        buf
    }

    /// Returns the identity of the header.
    ///
    /// The seal and signature slots are excluded so that collecting signatures never changes
    /// the hash validators vote on.
    pub fn hash(&self) -> Hash {
        let digest = Sha256::digest(self.encode_unsigned());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hash::new(out)
    }
}

/// Full block (header and body).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Bytes>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> Height {
        self.header.number
    }
}

/// Input to [`StateMachine::step`](super::StateMachine::step).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// No payload (a local timer expired).
    None,
    /// A header-level protocol message (prepare or commit).
    Header(Header),
    /// A full block (proposal or validate message).
    Block(Block),
    /// A full impeachment block.
    ImpeachBlock(Block),
}

impl Input {
    pub fn kind(&self) -> Kind {
        match self {
            Input::None => Kind::None,
            Input::Header(_) => Kind::Header,
            Input::Block(_) => Kind::Block,
            Input::ImpeachBlock(_) => Kind::ImpeachBlock,
        }
    }

    pub(crate) fn into_header(self, code: MsgCode) -> Result<Header, Error> {
        match self {
            Input::Header(header) => Ok(header),
            other => Err(Error::UnexpectedDataKind {
                code,
                kind: other.kind(),
            }),
        }
    }

    pub(crate) fn into_block(self, code: MsgCode) -> Result<Block, Error> {
        match self {
            Input::Block(block) => Ok(block),
            other => Err(Error::UnexpectedDataKind {
                code,
                kind: other.kind(),
            }),
        }
    }

    /// Accepts either a regular or an impeachment block.
    pub(crate) fn into_any_block(self, code: MsgCode) -> Result<Block, Error> {
        match self {
            Input::Block(block) | Input::ImpeachBlock(block) => Ok(block),
            other => Err(Error::UnexpectedDataKind {
                code,
                kind: other.kind(),
            }),
        }
    }

    pub(crate) fn into_none(self, code: MsgCode) -> Result<(), Error> {
        match self {
            Input::None => Ok(()),
            other => Err(Error::UnexpectedDataKind {
                code,
                kind: other.kind(),
            }),
        }
    }
}

/// Output of [`StateMachine::step`](super::StateMachine::step).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    None,
    Header(Header),
    Block(Block),
}

impl Output {
    pub fn kind(&self) -> Kind {
        match self {
            Output::None => Kind::None,
            Output::Header(_) => Kind::Header,
            Output::Block(_) => Kind::Block,
        }
    }
}

/// Instruction returned by [`StateMachine::step`](super::StateMachine::step).
///
/// `output` should be handled according to `action` and, if broadcast, tagged with `code`.
#[derive(Debug)]
pub struct Instruction {
    pub output: Output,
    pub action: Action,
    pub code: MsgCode,

    /// Error observed while producing a valid output.
    ///
    /// Set when a faulty proposal triggers impeachment: the impeachment message must still be
    /// broadcast.
    pub fault: Option<Error>,
}

impl Instruction {
    pub(crate) fn none() -> Self {
        Self {
            output: Output::None,
            action: Action::None,
            code: MsgCode::None,
            fault: None,
        }
    }

    pub(crate) fn broadcast(header: Header, code: MsgCode) -> Self {
        Self {
            output: Output::Header(header),
            action: Action::Broadcast,
            code,
            fault: None,
        }
    }

    pub(crate) fn insert(block: Block) -> Self {
        Self {
            output: Output::Block(block),
            action: Action::InsertBlock,
            code: MsgCode::None,
            fault: None,
        }
    }

    pub(crate) fn finalize(block: Block, code: MsgCode) -> Self {
        Self {
            output: Output::Block(block),
            action: Action::BroadcastAndInsertBlock,
            code,
            fault: None,
        }
    }

    pub(crate) fn with_fault(mut self, fault: Error) -> Self {
        self.fault = Some(fault);
        self
    }
}

/// Errors that may be encountered when stepping the state machine.
///
/// None of these are fatal: the caller should drop the offending message and continue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unexpected {kind:?} input for {code:?}")]
    UnexpectedDataKind { code: MsgCode, kind: Kind },
    #[error("block at height {height} is too old (watermark {watermark})")]
    BlockTooOld { height: Height, watermark: Height },
    #[error("proposed block is faulty: {0}")]
    FaultyBlock(#[source] BoxedError),

    // Phase Errors
    #[error("{0:?} is not a proper input for idle phase")]
    UnexpectedIdleInput(MsgCode),
    #[error("{0:?} is not a proper input for preprepared phase")]
    UnexpectedPrepreparedInput(MsgCode),
    #[error("{0:?} is not a proper input for prepared phase")]
    UnexpectedPreparedInput(MsgCode),
    #[error("{0:?} is not a proper input for impeach preprepared phase")]
    UnexpectedImpeachPrepreparedInput(MsgCode),
    #[error("{0:?} is not a proper input for impeach prepared phase")]
    UnexpectedImpeachPreparedInput(MsgCode),

    // Cache Errors
    #[error("block {0} not found")]
    BlockNotFound(Hash),

    // Signature Errors
    #[error("signers not in validator committee: {0:?}")]
    InvalidSigners(Vec<Address>),
    #[error("recovered {signers} signers but {signatures} signatures")]
    SignatureCountMismatch { signers: usize, signatures: usize },

    // Collaborator Errors
    #[error("failed to propose impeach block: {0}")]
    ImpeachProposalFailed(#[source] BoxedError),
    #[error("failed to recover signatures: {0}")]
    Recover(#[source] BoxedError),
    #[error("failed to fetch validators at height {0}: {1}")]
    Validators(Height, #[source] BoxedError),
    #[error("failed to sign header: {0}")]
    Sign(#[source] BoxedError),
}

impl Error {
    /// Returns the error for an unrecognized message in `phase`.
    pub(crate) fn unexpected(phase: Phase, code: MsgCode) -> Self {
        match phase {
            Phase::Idle => Error::UnexpectedIdleInput(code),
            Phase::Preprepared => Error::UnexpectedPrepreparedInput(code),
            Phase::Prepared => Error::UnexpectedPreparedInput(code),
            Phase::ImpeachPreprepared => Error::UnexpectedImpeachPrepreparedInput(code),
            Phase::ImpeachPrepared => Error::UnexpectedImpeachPreparedInput(code),
        }
    }
}

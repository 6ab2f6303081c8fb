//! The DPoR consensus state machine.
//!
//! [StateMachine::step] maps `(phase, message)` to an [Instruction] and the next [Phase]. The phase
//! is guarded by its own lock so status queries never contend with signature bookkeeping, which
//! lives behind a second lock together with the height watermark and the block cache.

use super::{
    cache::Cache,
    certificate::{Certificates, Stage},
    config::{Config, ConfigError},
    metrics::{Message, Metrics},
    types::{Address, Block, Error, Hash, Header, Height, Input, Instruction, MsgCode, Phase},
    Service,
};
use prometheus_client::registry::Registry;
use std::{num::NonZeroUsize, sync::RwLock};
use tracing::{debug, info, warn};

/// Data guarded by the data lock.
struct Data {
    certificates: Certificates,
    blocks: Cache<Hash, Block>,

    /// Last block handed to the chain.
    finalized: Option<Hash>,
}

/// Result of a transition: the outcome for the caller and the phase to enter.
type Transition = (Result<Instruction, Error>, Phase);

/// Consensus state machine of a single validator.
///
/// A single driver is expected to call [StateMachine::step] at a time. [StateMachine::phase] may
/// be called concurrently from anywhere.
pub struct StateMachine<S: Service> {
    service: S,
    quorum: usize,

    phase: RwLock<Phase>,
    data: RwLock<Data>,

    metrics: Metrics,
}

impl<S: Service> StateMachine<S> {
    /// Creates a new state machine in [Phase::Idle].
    pub fn new(service: S, cfg: Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let capacity = NonZeroUsize::new(cfg.cache_size).ok_or(ConfigError::ZeroCacheSize)?;
        let metrics = Metrics::default();
        metrics.set_phase(Phase::Idle);
        Ok(Self {
            service,
            quorum: cfg.quorum(),
            phase: RwLock::new(Phase::Idle),
            data: RwLock::new(Data {
                certificates: Certificates::new(),
                blocks: Cache::new(capacity),
                finalized: None,
            }),
            metrics,
        })
    }

    /// Returns the external collaborator.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Returns the metrics of the state machine.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Registers the metrics of the state machine in `registry`.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.read().unwrap()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write().unwrap() = phase;
        self.metrics.set_phase(phase);
    }

    /// Returns the highest height observed.
    pub fn watermark(&self) -> Height {
        self.data.read().unwrap().certificates.watermark()
    }

    /// Returns the number of validators whose latest `stage` signature is for `hash`.
    pub fn votes(&self, stage: Stage, hash: &Hash) -> usize {
        self.data.read().unwrap().certificates.get(stage).count(hash)
    }

    /// Returns true if `2f + 1` validators signed `header` for `stage`.
    pub fn certified(&self, stage: Stage, header: &Header) -> bool {
        let hash = header.hash();
        let count = self.votes(stage, &hash);
        debug!(?stage, count, quorum = self.quorum, "certificate");
        count >= self.quorum
    }

    /// Registers a full block received out of band.
    ///
    /// A later commit quorum on the block's header can then be finalized even if the proposal
    /// was never stepped locally.
    pub fn cache_block(&self, block: Block) {
        let mut data = self.data.write().unwrap();
        self.remember(&mut data, block);
    }

    /// Returns true if the block with `hash` is cached.
    pub fn is_cached(&self, hash: &Hash) -> bool {
        self.data.read().unwrap().blocks.contains(hash)
    }

    fn is_finalized(&self, hash: &Hash) -> bool {
        self.data.read().unwrap().finalized.as_ref() == Some(hash)
    }

    /// Records `hash` as handed to the chain. Returns false if it already was.
    fn finalize(&self, hash: Hash) -> bool {
        let mut data = self.data.write().unwrap();
        if data.finalized == Some(hash) {
            return false;
        }
        data.finalized = Some(hash);
        self.metrics.finalized.inc();
        true
    }

    fn remember(&self, data: &mut Data, block: Block) {
        if let Some(evicted) = data.blocks.insert(block.hash(), block) {
            self.metrics.evictions.inc();
            debug!(%evicted, "evicted block from cache");
        }
    }

    /// Feeds one message (or a local event) into the state machine.
    ///
    /// The returned [Instruction] tells the caller what to broadcast and/or insert. On error, the
    /// message should be dropped. Errors never leave the state machine in an unusable state.
    pub fn step(&self, input: Input, code: MsgCode) -> Result<Instruction, Error> {
        let phase = self.phase();
        debug!(%phase, ?code, kind = ?input.kind(), "state machine input");
        self.metrics.inbound.get_or_create(&Message::new(code)).inc();

        let (result, next) = self.transition(phase, input, code);
        match &result {
            Ok(instruction) => debug!(
                action = ?instruction.action,
                kind = ?instruction.output.kind(),
                code = ?instruction.code,
                next = %next,
                "state machine result"
            ),
            Err(err) => {
                self.metrics.rejected.get_or_create(&Message::new(code)).inc();
                debug!(?err, next = %next, "state machine rejected input");
            }
        }

        self.set_phase(next);
        result
    }

    fn transition(&self, phase: Phase, input: Input, code: MsgCode) -> Transition {
        use Phase::*;
        match (phase, code) {
            (Idle | Preprepared | Prepared, MsgCode::Validate) => {
                self.on_validate(phase, input, code)
            }
            (Idle | Preprepared, MsgCode::Commit) => {
                self.on_commit(phase, input, code, Stage::Commit, phase)
            }
            // Without a commit quorum, a prepared validator falls back to preprepared
            (Prepared, MsgCode::Commit) => {
                self.on_commit(phase, input, code, Stage::Commit, Preprepared)
            }
            (Idle | Preprepared, MsgCode::Prepare) => {
                self.on_prepare(phase, input, code, Stage::Prepare)
            }
            (Idle, MsgCode::Preprepare) => self.on_preprepare(phase, input, code),
            (_, MsgCode::ImpeachValidate) => self.on_validate(phase, input, code),
            (_, MsgCode::ImpeachCommit) => {
                self.on_commit(phase, input, code, Stage::ImpeachCommit, phase)
            }
            (_, MsgCode::ImpeachPrepare) => {
                self.on_prepare(phase, input, code, Stage::ImpeachPrepare)
            }
            (
                Idle | Preprepared | Prepared | ImpeachPreprepared,
                MsgCode::ImpeachPreprepare,
            ) => self.on_impeach_preprepare(phase, input, code),
            (ImpeachPrepared, _) => (Err(Error::unexpected(phase, code)), Idle),
            _ => (Err(Error::unexpected(phase, code)), phase),
        }
    }

    /// Accepts a block finalized by the rest of the committee.
    fn on_validate(&self, phase: Phase, input: Input, code: MsgCode) -> Transition {
        let block = match code {
            MsgCode::ImpeachValidate => input.into_any_block(code),
            _ => input.into_block(code),
        };
        let block = match block {
            Ok(block) => block,
            Err(err) => return (Err(err), phase),
        };
        let hash = block.hash();
        if !self.finalize(hash) {
            debug!(height = block.number(), %hash, ?code, "block already finalized");
            return (Ok(Instruction::none()), phase);
        }
        info!(height = block.number(), %hash, ?code, "accepted final block");
        (Ok(Instruction::insert(block)), Phase::Idle)
    }

    /// Records commit signatures and finalizes the block once a quorum is reached.
    fn on_commit(
        &self,
        phase: Phase,
        input: Input,
        code: MsgCode,
        stage: Stage,
        pending: Phase,
    ) -> Transition {
        let header = match input.into_header(code) {
            Ok(header) => header,
            Err(err) => return (Err(err), phase),
        };
        if let Err(err) = self.accrue(stage, &header) {
            warn!(?err, %phase, ?code, "failed to record signatures");
            return (Err(err), phase);
        }
        if self.is_finalized(&header.hash()) {
            debug!(height = header.number, ?code, "block already finalized");
            return (Ok(Instruction::none()), phase);
        }
        if !self.certified(stage, &header) {
            return (Ok(Instruction::none()), pending);
        }

        let validate = if stage.is_impeach() {
            MsgCode::ImpeachValidate
        } else {
            MsgCode::Validate
        };
        match self.compose_validate(stage, &header) {
            Ok(block) => {
                info!(
                    height = block.number(),
                    hash = %block.hash(),
                    signatures = block.header.dpor.signed(),
                    ?validate,
                    "finalized block"
                );
                self.finalize(block.hash());
                (Ok(Instruction::finalize(block, validate)), Phase::Idle)
            }
            Err(err) => {
                warn!(?err, %phase, ?code, "failed to compose validate message");
                (Err(err), phase)
            }
        }
    }

    /// Records prepare signatures and broadcasts a commit once a quorum is reached.
    fn on_prepare(&self, phase: Phase, input: Input, code: MsgCode, stage: Stage) -> Transition {
        let header = match input.into_header(code) {
            Ok(header) => header,
            Err(err) => return (Err(err), phase),
        };
        if let Err(err) = self.accrue(stage, &header) {
            warn!(?err, %phase, ?code, "failed to record signatures");
            return (Err(err), phase);
        }
        if !self.certified(stage, &header) {
            return (Ok(Instruction::none()), phase);
        }

        let (commit, next) = if stage.is_impeach() {
            (MsgCode::ImpeachCommit, Phase::ImpeachPrepared)
        } else {
            (MsgCode::Commit, Phase::Prepared)
        };
        match self.compose_commit(stage, header) {
            Ok(header) => (Ok(Instruction::broadcast(header, commit)), next),
            Err(err) => {
                warn!(?err, %phase, ?code, "failed to compose commit message");
                (Err(err), phase)
            }
        }
    }

    /// Handles a newly proposed block.
    fn on_preprepare(&self, phase: Phase, input: Input, code: MsgCode) -> Transition {
        let block = match input.into_block(code) {
            Ok(block) => block,
            Err(err) => return (Err(err), phase),
        };

        if let Err(err) = self.service.validate_block(&block) {
            warn!(?err, height = block.number(), "proposed block is faulty");
            let fault = Error::FaultyBlock(Box::new(err));
            return match self.propose_impeach() {
                Ok(impeach) => (
                    Ok(Instruction::broadcast(impeach.header, MsgCode::ImpeachPrepare)
                        .with_fault(fault)),
                    Phase::ImpeachPreprepared,
                ),
                Err(err) => (Err(err), Phase::Idle),
            };
        }

        match self.compose_prepare(block) {
            Ok(header) => (
                Ok(Instruction::broadcast(header, MsgCode::Prepare)),
                Phase::Preprepared,
            ),
            Err(err) => {
                warn!(?err, %phase, "failed to compose prepare message");
                (Err(err), phase)
            }
        }
    }

    /// Handles a local timer expiry.
    fn on_impeach_preprepare(&self, phase: Phase, input: Input, code: MsgCode) -> Transition {
        if let Err(err) = input.into_none(code) {
            return (Err(err), phase);
        }
        match self.propose_impeach() {
            Ok(impeach) => (
                Ok(Instruction::broadcast(impeach.header, MsgCode::ImpeachPrepare)),
                Phase::ImpeachPreprepared,
            ),
            Err(err) => (Err(err), Phase::Idle),
        }
    }

    /// Merges the signatures embedded in `header` into the certificate of `stage`.
    ///
    /// Either every recovered signature is recorded or none is.
    fn accrue(&self, stage: Stage, header: &Header) -> Result<(), Error> {
        let height = header.number;
        let hash = header.hash();

        // Recovery and merge happen under one lock so a concurrent watermark advance cannot
        // interleave with them
        let mut data = self.data.write().unwrap();
        let watermark = data.certificates.watermark();
        if height < watermark {
            return Err(Error::BlockTooOld { height, watermark });
        }
        if data.certificates.refresh(height) {
            debug!(height, "advanced watermark");
        }

        let (signers, signatures) = self
            .service
            .ecrecover_sigs(header, stage.phase())
            .map_err(|err| Error::Recover(Box::new(err)))?;
        if signers.len() != signatures.len() {
            return Err(Error::SignatureCountMismatch {
                signers: signers.len(),
                signatures: signatures.len(),
            });
        }
        let validators = self
            .service
            .validators_of(height)
            .map_err(|err| Error::Validators(height, Box::new(err)))?;
        let invalid: Vec<Address> = signers
            .iter()
            .filter(|signer| !validators.contains(signer))
            .copied()
            .collect();
        if !invalid.is_empty() {
            warn!(?invalid, height, "signers not in validator committee");
            return Err(Error::InvalidSigners(invalid));
        }

        data.certificates.merge(stage, hash, &signers, &signatures);
        debug!(
            ?stage,
            height,
            %hash,
            signers = signers.len(),
            votes = data.certificates.get(stage).count(&hash),
            "recorded signatures"
        );
        Ok(())
    }

    /// Signs a valid proposal and returns the header to broadcast as a prepare message.
    ///
    /// Nothing is recorded unless signing succeeds.
    fn compose_prepare(&self, mut block: Block) -> Result<Header, Error> {
        let height = block.number();
        let watermark = self.watermark();
        if height <= watermark {
            return Err(Error::BlockTooOld { height, watermark });
        }
        self.service
            .sign_header(&mut block.header, Phase::Preprepared)
            .map_err(|err| Error::Sign(Box::new(err)))?;
        let header = block.header.clone();

        let pending = {
            let mut data = self.data.write().unwrap();
            let watermark = data.certificates.watermark();
            if height <= watermark {
                return Err(Error::BlockTooOld { height, watermark });
            }

            // Hand off what was collected for earlier heights before it is discarded
            let pending: Vec<_> = data
                .certificates
                .get(Stage::Prepare)
                .iter()
                .map(|(signer, vote)| (*signer, *vote))
                .collect();
            data.certificates.refresh(height);
            self.remember(&mut data, block);
            pending
        };
        for (signer, vote) in &pending {
            self.service
                .update_prepare_sigs_cache(signer, &vote.hash, &vote.signature);
        }

        info!(
            height,
            hash = %header.hash(),
            signatures = header.dpor.signed(),
            "signed block at prepare"
        );
        Ok(header)
    }

    /// Signs a prepared header and returns it to broadcast as a commit message.
    fn compose_commit(&self, stage: Stage, mut header: Header) -> Result<Header, Error> {
        let height = header.number;
        let watermark = self.watermark();
        if height < watermark {
            return Err(Error::BlockTooOld { height, watermark });
        }
        self.service
            .sign_header(&mut header, Phase::Prepared)
            .map_err(|err| Error::Sign(Box::new(err)))?;

        let pending = {
            let mut data = self.data.write().unwrap();
            let watermark = data.certificates.watermark();
            if height < watermark {
                return Err(Error::BlockTooOld { height, watermark });
            }
            data.certificates.refresh(height);
            data.certificates
                .get(stage.commit())
                .iter()
                .map(|(signer, vote)| (*signer, *vote))
                .collect::<Vec<_>>()
        };
        for (signer, vote) in &pending {
            self.service
                .update_final_sigs_cache(signer, &vote.hash, &vote.signature);
        }

        info!(
            height,
            hash = %header.hash(),
            signatures = header.dpor.signed(),
            "signed block at commit"
        );
        Ok(header)
    }

    /// Rebuilds the full block for `header`, filling empty signature slots from the commit
    /// certificate.
    fn compose_validate(&self, stage: Stage, header: &Header) -> Result<Block, Error> {
        let hash = header.hash();
        let mut data = self.data.write().unwrap();
        let Data {
            certificates,
            blocks,
            ..
        } = &mut *data;
        let certificate = certificates.get(stage.commit());
        let Some(block) = blocks.get_mut(&hash) else {
            warn!(%hash, "failed to retrieve block from cache");
            return Err(Error::BlockNotFound(hash));
        };

        let dpor = &mut block.header.dpor;
        for (validator, slot) in dpor.validators.iter().zip(dpor.sigs.iter_mut()) {
            if !slot.is_zero() {
                continue;
            }
            if let Some(vote) = certificate.get(validator) {
                if vote.hash == hash {
                    slot.copy_from(&vote.signature);
                }
            }
        }
        Ok(block.clone())
    }

    /// Asks the collaborator for an impeachment block, then signs and caches it.
    fn propose_impeach(&self) -> Result<Block, Error> {
        let mut block = self.service.create_impeach_block().map_err(|err| {
            warn!(?err, "creating impeachment block failed");
            Error::ImpeachProposalFailed(Box::new(err))
        })?;
        self.service
            .sign_header(&mut block.header, Phase::Preprepared)
            .map_err(|err| Error::Sign(Box::new(err)))?;

        let mut data = self.data.write().unwrap();
        data.certificates.refresh(block.number());
        self.remember(&mut data, block.clone());
        drop(data);

        self.metrics.impeachments.inc();
        info!(
            height = block.number(),
            hash = %block.hash(),
            signatures = block.header.dpor.signed(),
            "proposed impeachment block"
        );
        Ok(block)
    }
}

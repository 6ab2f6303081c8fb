use super::fixtures::{signature, Committee};
use crate::dpor::{
    types::{Address, Block, Hash, Header, Height, Phase, Signature},
    Service as S,
};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {0} is invalid")]
    InvalidBlock(Height),
    #[error("impeachment block unavailable")]
    ImpeachUnavailable,
    #[error("unknown committee at height {0}")]
    UnknownCommittee(Height),
    #[error("signer unavailable")]
    SignerUnavailable,
    #[error("recovery unavailable")]
    RecoveryUnavailable,
}

/// A recorded signature hand-off.
pub type Handoff = (Address, Hash, Signature);

#[derive(Default)]
struct State {
    height: Height,

    reject_blocks: bool,
    fail_impeach: bool,
    fail_validators: bool,
    fail_signing: bool,
    fail_recover: bool,
    outsider: Option<Address>,

    prepare_sigs: Vec<Handoff>,
    final_sigs: Vec<Handoff>,
}

/// Collaborator of a single validator.
///
/// Signatures are derived deterministically from the signer, the header hash and the phase (see
/// [signature]). Recovery only returns signatures valid under the requested phase.
#[derive(Clone)]
pub struct Service {
    committee: Committee,
    me: Address,
    state: Arc<Mutex<State>>,
}

impl Service {
    pub fn new(committee: Committee, me: usize) -> Self {
        let me = committee.validators[me];
        Self {
            committee,
            me,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Sets the height impeachment blocks are created at.
    ///
    /// Validating a block also moves the height to that of the block.
    pub fn set_height(&self, height: Height) {
        self.state.lock().unwrap().height = height;
    }

    pub fn reject_blocks(&self, reject: bool) {
        self.state.lock().unwrap().reject_blocks = reject;
    }

    pub fn fail_impeach(&self, fail: bool) {
        self.state.lock().unwrap().fail_impeach = fail;
    }

    pub fn fail_validators(&self, fail: bool) {
        self.state.lock().unwrap().fail_validators = fail;
    }

    pub fn fail_signing(&self, fail: bool) {
        self.state.lock().unwrap().fail_signing = fail;
    }

    pub fn fail_recover(&self, fail: bool) {
        self.state.lock().unwrap().fail_recover = fail;
    }

    /// Appends `outsider` to every set of recovered signers.
    pub fn recover_outsider(&self, outsider: Option<Address>) {
        self.state.lock().unwrap().outsider = outsider;
    }

    pub fn prepare_sigs(&self) -> Vec<Handoff> {
        self.state.lock().unwrap().prepare_sigs.clone()
    }

    pub fn final_sigs(&self) -> Vec<Handoff> {
        self.state.lock().unwrap().final_sigs.clone()
    }
}

impl S for Service {
    type Error = Error;

    fn validate_block(&self, block: &Block) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.height = block.number();
        if state.reject_blocks {
            return Err(Error::InvalidBlock(block.number()));
        }
        Ok(())
    }

    fn ecrecover_sigs(
        &self,
        header: &Header,
        phase: Phase,
    ) -> Result<(Vec<Address>, Vec<Signature>), Self::Error> {
        let state = self.state.lock().unwrap();
        if state.fail_recover {
            return Err(Error::RecoveryUnavailable);
        }
        let hash = header.hash();
        let mut signers = Vec::new();
        let mut signatures = Vec::new();
        for (validator, sig) in header.dpor.validators.iter().zip(&header.dpor.sigs) {
            if sig.is_zero() || *sig != signature(validator, &hash, phase) {
                continue;
            }
            signers.push(*validator);
            signatures.push(*sig);
        }
        if let Some(outsider) = state.outsider {
            signers.push(outsider);
            signatures.push(signature(&outsider, &hash, phase));
        }
        Ok((signers, signatures))
    }

    fn validators_of(&self, height: Height) -> Result<Vec<Address>, Self::Error> {
        if self.state.lock().unwrap().fail_validators {
            return Err(Error::UnknownCommittee(height));
        }
        Ok(self.committee.validators.clone())
    }

    fn sign_header(&self, header: &mut Header, phase: Phase) -> Result<(), Self::Error> {
        if self.state.lock().unwrap().fail_signing {
            return Err(Error::SignerUnavailable);
        }
        let hash = header.hash();
        let slot = header.dpor.slot(&self.me).ok_or(Error::SignerUnavailable)?;
        let sig = header
            .dpor
            .sigs
            .get_mut(slot)
            .ok_or(Error::SignerUnavailable)?;
        *sig = signature(&self.me, &hash, phase);
        Ok(())
    }

    fn update_prepare_sigs_cache(&self, signer: &Address, hash: &Hash, signature: &Signature) {
        self.state
            .lock()
            .unwrap()
            .prepare_sigs
            .push((*signer, *hash, *signature));
    }

    fn update_final_sigs_cache(&self, signer: &Address, hash: &Hash, signature: &Signature) {
        self.state
            .lock()
            .unwrap()
            .final_sigs
            .push((*signer, *hash, *signature));
    }

    fn create_impeach_block(&self) -> Result<Block, Self::Error> {
        let state = self.state.lock().unwrap();
        if state.fail_impeach {
            return Err(Error::ImpeachUnavailable);
        }
        Ok(self.committee.impeach_block(state.height))
    }
}

//! Signature certificates collected at the current height.
//!
//! A [Certificate] records, for one protocol [Stage], the latest `(hash, signature)` pair each
//! validator contributed. [Certificates] groups the four stages behind a single height watermark:
//! observing a higher height discards everything recorded so far.

use super::types::{Address, Hash, Height, Phase, Signature};
use std::collections::HashMap;

/// Protocol step a certificate collects signatures for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Commit,
    ImpeachPrepare,
    ImpeachCommit,
}

impl Stage {
    /// Phase tag under which signatures of this stage are produced (and recovered).
    pub const fn phase(&self) -> Phase {
        match self {
            Stage::Prepare | Stage::ImpeachPrepare => Phase::Preprepared,
            Stage::Commit | Stage::ImpeachCommit => Phase::Prepared,
        }
    }

    pub const fn is_impeach(&self) -> bool {
        matches!(self, Stage::ImpeachPrepare | Stage::ImpeachCommit)
    }

    /// Returns the commit stage on the same path (normal or impeach).
    pub const fn commit(&self) -> Stage {
        if self.is_impeach() {
            Stage::ImpeachCommit
        } else {
            Stage::Commit
        }
    }
}

/// Latest contribution of a validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vote {
    pub hash: Hash,
    pub signature: Signature,
}

/// Signatures collected for a single [Stage].
#[derive(Clone, Debug, Default)]
pub struct Certificate {
    votes: HashMap<Address, Vote>,
}

impl Certificate {
    pub fn new() -> Self {
        Self {
            votes: HashMap::new(),
        }
    }

    /// Number of validators whose latest vote is for `hash`.
    pub fn count(&self, hash: &Hash) -> usize {
        self.votes.values().filter(|v| &v.hash == hash).count()
    }

    /// Returns true if at least `threshold` validators voted for `hash`.
    pub fn has_quorum(&self, hash: &Hash, threshold: usize) -> bool {
        self.count(hash) >= threshold
    }

    /// Overwrites the vote of `signer`.
    pub fn record(&mut self, signer: Address, hash: Hash, signature: Signature) {
        self.votes.insert(signer, Vote { hash, signature });
    }

    pub fn get(&self, signer: &Address) -> Option<&Vote> {
        self.votes.get(signer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Vote)> {
        self.votes.iter()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    fn clear(&mut self) {
        self.votes.clear();
    }
}

/// All certificates tracked by a validator, sharing one height watermark.
#[derive(Clone, Debug)]
pub struct Certificates {
    watermark: Height,
    prepare: Certificate,
    commit: Certificate,
    impeach_prepare: Certificate,
    impeach_commit: Certificate,
}

impl Default for Certificates {
    fn default() -> Self {
        Self::new()
    }
}

impl Certificates {
    pub fn new() -> Self {
        Self {
            watermark: 0,
            prepare: Certificate::new(),
            commit: Certificate::new(),
            impeach_prepare: Certificate::new(),
            impeach_commit: Certificate::new(),
        }
    }

    /// Highest height observed so far.
    pub fn watermark(&self) -> Height {
        self.watermark
    }

    /// Advances the watermark to `height`, clearing every certificate if it moved.
    ///
    /// Returns true if the certificates were reset.
    pub fn refresh(&mut self, height: Height) -> bool {
        if height <= self.watermark {
            return false;
        }
        self.watermark = height;
        self.prepare.clear();
        self.commit.clear();
        self.impeach_prepare.clear();
        self.impeach_commit.clear();
        true
    }

    pub fn get(&self, stage: Stage) -> &Certificate {
        match stage {
            Stage::Prepare => &self.prepare,
            Stage::Commit => &self.commit,
            Stage::ImpeachPrepare => &self.impeach_prepare,
            Stage::ImpeachCommit => &self.impeach_commit,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut Certificate {
        match stage {
            Stage::Prepare => &mut self.prepare,
            Stage::Commit => &mut self.commit,
            Stage::ImpeachPrepare => &mut self.impeach_prepare,
            Stage::ImpeachCommit => &mut self.impeach_commit,
        }
    }

    /// Records every `(signer, signature)` pair for `hash` in the certificate of `stage`.
    pub fn merge(
        &mut self,
        stage: Stage,
        hash: Hash,
        signers: &[Address],
        signatures: &[Signature],
    ) {
        let certificate = self.get_mut(stage);
        for (signer, signature) in signers.iter().zip(signatures) {
            certificate.record(*signer, hash, *signature);
        }
    }
}

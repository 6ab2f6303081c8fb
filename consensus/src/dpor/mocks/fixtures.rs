//! Deterministic committees, blocks and signatures.

use crate::dpor::types::{Address, Block, Hash, Header, Height, Phase, Signature, Snapshot};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Address that is never part of a [Committee].
pub fn outsider() -> Address {
    Address::new([0xff; 20])
}

/// Deterministic signature of `signer` over `hash` under `phase`.
pub fn signature(signer: &Address, hash: &Hash, phase: Phase) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(phase.id().to_be_bytes());
    hasher.update(hash);
    hasher.update(signer);
    let digest = hasher.finalize();

    let mut raw = [0u8; 65];
    raw[..32].copy_from_slice(&digest);
    raw[32..64].copy_from_slice(&digest);
    raw[64] = 27;
    Signature::new(raw)
}

/// A committee of validators shared by every participant of a test.
#[derive(Clone, Debug)]
pub struct Committee {
    pub validators: Vec<Address>,
}

impl Committee {
    pub fn new(n: u8) -> Self {
        Self {
            validators: (1..=n).map(|i| Address::new([i; 20])).collect(),
        }
    }

    fn header(&self, height: Height, extra: &'static [u8]) -> Header {
        Header {
            parent: Hash::new([height.wrapping_sub(1) as u8; 32]),
            coinbase: self.validators[0],
            number: height,
            gas_limit: 8_000_000,
            timestamp: 1_000 + height,
            extra: Bytes::from_static(extra),
            dpor: Snapshot::new(vec![self.validators[0]], self.validators.clone()),
            ..Default::default()
        }
    }

    /// Returns the (unsigned) proposal at `height`.
    pub fn block(&self, height: Height) -> Block {
        let transactions = vec![Bytes::from(format!("transfer-{height}"))];
        Block::new(self.header(height, b"proposal"), transactions)
    }

    /// Returns the (unsigned) impeachment block at `height`.
    pub fn impeach_block(&self, height: Height) -> Block {
        let mut header = self.header(height, b"impeach");
        header.coinbase = Address::zero();
        Block::new(header, Vec::new())
    }

    /// Signature of the validator at `index` over `hash` under `phase`.
    pub fn signature(&self, index: usize, hash: &Hash, phase: Phase) -> Signature {
        signature(&self.validators[index], hash, phase)
    }

    /// Fills the slots of the validators at `signers` with their signature under `phase`.
    pub fn sign(&self, mut header: Header, signers: &[usize], phase: Phase) -> Header {
        let hash = header.hash();
        for index in signers {
            let slot = header
                .dpor
                .slot(&self.validators[*index])
                .expect("signer not in header committee");
            header.dpor.sigs[slot] = self.signature(*index, &hash, phase);
        }
        header
    }
}

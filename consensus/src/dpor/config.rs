//! Configuration for the [`dpor`](super) state machine.

use super::cache::DEFAULT_CAPACITY;
use dpor_utils::{max_faults, quorum_of};
use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The block cache must be able to hold at least one block.
    #[error("cache size must be greater than zero")]
    ZeroCacheSize,

    /// `3f + 1` must be representable.
    #[error("fault bound {0} is too large")]
    TooManyFaults(u32),

    /// The committee is too small to tolerate a single fault.
    #[error("committee of {0} validators cannot tolerate any faults")]
    CommitteeTooSmall(u32),
}

/// Configuration for the [`StateMachine`](super::StateMachine).
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Maximum number of Byzantine validators tolerated, assuming a committee of `3f + 1`.
    ///
    /// A certificate requires `2f + 1` matching signatures.
    pub faults: u32,

    /// Maximum number of blocks retained to rebuild a block from a header-level quorum.
    pub cache_size: usize,
}

impl Config {
    /// Returns a configuration tolerating `faults` Byzantine validators.
    pub fn new(faults: u32) -> Self {
        Self {
            faults,
            cache_size: DEFAULT_CAPACITY,
        }
    }

    /// Derives the fault bound from the size of the validator committee.
    pub fn from_committee(validators: u32) -> Result<Self, ConfigError> {
        let faults = max_faults(validators).ok_or(ConfigError::CommitteeTooSmall(validators))?;
        Ok(Self::new(faults))
    }

    /// Ensures the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        let committee = self
            .faults
            .checked_mul(3)
            .and_then(|n| n.checked_add(1));
        if committee.is_none() {
            return Err(ConfigError::TooManyFaults(self.faults));
        }
        Ok(())
    }

    /// Number of matching signatures required for a certificate (`2f + 1`).
    pub fn quorum(&self) -> usize {
        quorum_of(self.faults).map_or(usize::MAX, |q| q as usize)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(Config::new(0).quorum(), 1);
        assert_eq!(Config::new(1).quorum(), 3);
        assert_eq!(Config::new(2).quorum(), 5);
    }

    #[test]
    fn test_from_committee() {
        assert_eq!(Config::from_committee(4).unwrap().faults, 1);
        assert_eq!(Config::from_committee(7).unwrap().faults, 2);
        assert_eq!(
            Config::from_committee(3),
            Err(ConfigError::CommitteeTooSmall(3))
        );
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(Config::default().cache_size, DEFAULT_CAPACITY);

        let cfg = Config {
            faults: 1,
            cache_size: 0,
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCacheSize));

        let cfg = Config::new(u32::MAX / 2);
        assert_eq!(cfg.validate(), Err(ConfigError::TooManyFaults(u32::MAX / 2)));
    }
}

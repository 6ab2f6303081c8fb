//! Finalize blocks in a Byzantine environment.
//!
//! # Status
//!
//! `dpor-consensus` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod dpor;

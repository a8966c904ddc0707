//! Proof-of-work targets, chain work and difficulty retargeting.

pub mod difficulty;
pub mod validation;

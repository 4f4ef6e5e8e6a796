pub mod core;
pub mod types;

#[cfg(test)]
pub mod test_support;

pub use self::core::{DpopError, compute_ath, verify_proof};
pub use types::{DpopPolicy, VerifiedDpop};

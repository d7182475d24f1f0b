//! Command security: static validation, the dangerous-pattern set, and
//! policy evolution.
//!
//! The three submodules correspond to three distinct trust decisions:
//!
//! - [`validator`]: is this text safe enough to even consider? Stateless
//!   checks on length, control characters, and injection shapes, plus an
//!   additive risk score.
//! - [`patterns`]: the hard deny-list. A match here disqualifies a command
//!   from execution with `force_execute` and from automatic promotion,
//!   no matter what its statistics say.
//! - [`policy`]: the pure rules that evolve a command's policy from its
//!   observed execution history.

pub mod patterns;
pub mod policy;
pub mod validator;

pub use patterns::{matches_dangerous_pattern, validate_promotion, SecurityError, SecurityEvent};
pub use policy::{CommandStats, Policy, PolicyDecision, UserOverride};
pub use validator::{ValidationError, Validator};

use sha2::{Digest, Sha256};

/// SHA-256 of the raw command text, hex-encoded. This is the identity of a
/// command everywhere in the system: registry primary key, log field, and
/// the only form in which rejected commands appear in telemetry.
#[must_use]
pub fn command_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

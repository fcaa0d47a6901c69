//! Hardware sealing collaborator.
//!
//! The core consumes a sealing primitive bound to a verified
//! hardware/firmware state (TPM or equivalent); it never implements one.
//! Devices without such a primitive run with `None`, which disables the
//! pre-auth phase entirely — both volumes are then gated by the admin
//! credential. That fallback is deliberate, not a defect.

use zeroize::Zeroizing;

use crate::error::Result;

pub trait HardwareSealer: Send + Sync {
    /// Wrap `secret` against the current hardware policy.
    fn seal(&self, secret: &[u8]) -> Result<Vec<u8>>;

    /// Release a sealed secret. Fails when the hardware/firmware state no
    /// longer satisfies the policy the blob was sealed under.
    fn unseal(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Hex digest of the sealing policy currently in force. Recorded next to
    /// every sealed blob; a mismatch at boot means the blob was sealed on
    /// different hardware and must be re-bound before use.
    fn policy_digest(&self) -> String;
}

//! Server-side admission control.

use std::sync::Arc;

use crate::crypto::SharedSecret;
use crate::error::{Error, Result};
use crate::handshake::{token, HandshakeHeader};
use crate::hopping::within_skew;

/// Decides whether a header may pass: skew check first, then token check.
///
/// The returned error is for local logs and metrics only. Callers must not
/// send anything back to the peer on rejection.
#[derive(Debug, Clone)]
pub struct Admission {
    secret: Arc<SharedSecret>,
    identity: String,
    skew_steps: u32,
}

impl Admission {
    /// Create an admission policy for one route.
    pub fn new(secret: Arc<SharedSecret>, identity: impl Into<String>, skew_steps: u32) -> Self {
        Self {
            secret,
            identity: identity.into(),
            skew_steps,
        }
    }

    /// Identity tokens are verified against.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Allowed distance between declared and current step.
    pub fn skew_steps(&self) -> u32 {
        self.skew_steps
    }

    /// Check a decoded header against the verifier's current step.
    pub fn check(&self, header: &HandshakeHeader, current_step: i64) -> Result<()> {
        if !within_skew(header.step, current_step, self.skew_steps) {
            return Err(Error::StepSkew {
                declared: header.step,
                current: current_step,
            });
        }

        if !token::verify(
            &self.secret,
            header.step,
            &header.nonce,
            &header.token,
            &self.identity,
        ) {
            return Err(Error::Authentication);
        }

        Ok(())
    }
}

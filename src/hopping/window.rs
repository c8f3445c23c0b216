//! Skew-tolerant port windows.

use crate::crypto::SharedSecret;
use crate::hopping::{port_for_step, PortRange};

/// A port together with the step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Derived port
    pub port: u16,
    /// Step the port was derived for
    pub step: i64,
}

/// Ports for `step - 1`, `step` and `step + 1`, deduplicated.
///
/// Candidates are kept in dial priority order: current, previous, next.
/// When two steps collide on the same port the higher-priority step wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortWindow {
    step: i64,
    candidates: Vec<Candidate>,
}

impl PortWindow {
    /// Compute the window around `step`.
    pub fn new(secret: &SharedSecret, step: i64, range: PortRange) -> Self {
        let steps = [step, step.wrapping_sub(1), step.wrapping_add(1)];
        let mut candidates: Vec<Candidate> = Vec::with_capacity(steps.len());

        for s in steps {
            let port = port_for_step(secret, s, range);
            if !candidates.iter().any(|c| c.port == port) {
                candidates.push(Candidate { port, step: s });
            }
        }

        Self { step, candidates }
    }

    /// Step the window is centred on.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Candidates in dial priority order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Ports in dial priority order.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.candidates.iter().map(|c| c.port)
    }

    /// Check whether the window includes `port`.
    pub fn contains(&self, port: u16) -> bool {
        self.candidates.iter().any(|c| c.port == port)
    }

    /// Step that produced `port`, if it is part of the window.
    pub fn step_for(&self, port: u16) -> Option<i64> {
        self.candidates
            .iter()
            .find(|c| c.port == port)
            .map(|c| c.step)
    }

    /// Number of distinct ports (1 to 3).
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false; a window holds at least the current step's port.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

//! Admission control for new connections.
//!
//! The controller is a pure check against the registry's current size.
//! It is only ever consulted from inside the registry actor, which
//! processes one command at a time, so the check and the insertion that
//! follows it cannot interleave with another admission.

use tracing::warn;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(AdmissionRejection),
}

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    /// The connection ceiling has been reached.
    CapacityExceeded { max: usize },
}

/// Gates entry to the connection registry against a global ceiling.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    max_clients: usize,
}

impl AdmissionController {
    pub fn new(max_clients: usize) -> Self {
        Self { max_clients }
    }

    /// Decides whether one more connection may be admitted.
    ///
    /// `open_connections` is the registry's size at the moment of the
    /// check; rejection happens at or above the ceiling.
    pub fn try_admit(&self, open_connections: usize) -> Admission {
        if open_connections >= self.max_clients {
            warn!(
                current = open_connections,
                max = self.max_clients,
                "Connection ceiling reached, rejecting"
            );
            return Admission::Rejected(AdmissionRejection::CapacityExceeded {
                max: self.max_clients,
            });
        }
        Admission::Accepted
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::claims;
use crate::types::{AccessToken, Role};

/// Sequence number taken when a store mutation is *initiated*.
///
/// Results are applied last-writer-by-freshness: a mutation lands only if
/// no mutation initiated after it has landed already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticket(u64);

/// Read-only view of the store at one instant.
#[derive(Debug, Clone, Default)]
pub struct CredentialView {
    pub token: Option<AccessToken>,
    pub roles: Vec<Role>,
    /// Ticket of the mutation that produced this state.
    pub generation: Ticket,
}

impl CredentialView {
    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.token.is_some()
    }
}

/// In-memory holder of the access credential and its decoded roles.
///
/// Cheap to clone; clones share state. Nothing here is ever persisted.
#[derive(Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<CredentialView>>,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("CredentialStore")
            .field("has_credential", &slot.token.is_some())
            .field("roles", &slot.roles)
            .field("generation", &slot.generation)
            .finish()
    }
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a ticket for a mutation that will land later (e.g. a refresh).
    #[must_use]
    pub fn ticket(&self) -> Ticket {
        Ticket(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[must_use]
    pub fn token(&self) -> Option<AccessToken> {
        self.slot.read().token.clone()
    }

    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        self.slot.read().roles.clone()
    }

    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.slot.read().token.is_some()
    }

    #[must_use]
    pub fn generation(&self) -> Ticket {
        self.slot.read().generation
    }

    #[must_use]
    pub fn view(&self) -> CredentialView {
        self.slot.read().clone()
    }

    /// Install `token` now, replacing whatever is held.
    pub fn install(&self, token: AccessToken) -> Ticket {
        let ticket = self.ticket();
        self.install_with(ticket, token);
        ticket
    }

    /// Install `token` unless a fresher mutation already landed.
    ///
    /// Roles are decoded from this exact token and written together with
    /// it, so readers never see a token paired with another token's roles.
    pub fn install_with(&self, ticket: Ticket, token: AccessToken) -> bool {
        let roles = claims::decode_roles(token.as_str());
        let mut slot = self.slot.write();
        if ticket <= slot.generation {
            return false;
        }
        *slot = CredentialView {
            token: Some(token),
            roles,
            generation: ticket,
        };
        true
    }

    /// Drop the credential and roles now.
    pub fn clear(&self) -> Ticket {
        let ticket = self.ticket();
        self.clear_with(ticket);
        ticket
    }

    /// Drop the credential unless a fresher mutation already landed.
    pub fn clear_with(&self, ticket: Ticket) -> bool {
        let mut slot = self.slot.write();
        if ticket <= slot.generation {
            return false;
        }
        *slot = CredentialView {
            token: None,
            roles: Vec::new(),
            generation: ticket,
        };
        true
    }
}

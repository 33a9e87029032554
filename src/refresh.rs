//! Coalesced credential refresh.
//!
//! At most one refresh exchange is in flight at any instant. Callers that
//! trigger a refresh while one is running await the same outcome instead of
//! issuing their own call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::client::IdentityClient;
use crate::error::Error;
use crate::store::{CredentialStore, Ticket};
use crate::types::AccessToken;

/// Outcome shared between every waiter of one refresh.
#[derive(Debug, Clone)]
enum Failure {
    Denied { status: u16 },
    Transport(Arc<reqwest::Error>),
    Config(String),
    /// The store was cleared (logout) while the refresh was in flight.
    Superseded,
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Denied { status } => Self::RefreshDenied { status },
            Failure::Transport(source) => Self::Transport(source),
            Failure::Config(detail) => Self::Config(detail),
            Failure::Superseded => Self::NotAuthenticated,
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, Failure>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

/// Single-flight wrapper around [`IdentityClient::refresh`].
///
/// Results land in the [`CredentialStore`] by freshness: a refresh takes its
/// ticket when it starts, so a credential installed after that (a login, or
/// a newer refresh) is never overwritten by it. A failed refresh clears only
/// credentials older than itself.
#[derive(Clone)]
pub struct Refresher {
    client: Arc<IdentityClient>,
    store: CredentialStore,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_id: Arc<AtomicU64>,
}

impl Refresher {
    #[must_use]
    pub fn new(client: Arc<IdentityClient>, store: CredentialStore) -> Self {
        Self {
            client,
            store,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a refresh exchange is currently running.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Refresh the access credential, joining an in-flight refresh if any.
    ///
    /// Returns the credential the caller should use next: the refreshed one,
    /// or a fresher one installed while the refresh was running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshDenied`] if the service rejected the exchange,
    /// [`Error::Transport`] (keeping the `reqwest` source) on network
    /// failure, or
    /// [`Error::NotAuthenticated`] if the session was cleared meanwhile.
    pub async fn refresh(&self) -> Result<AccessToken, Error> {
        let (id, future) = self.join_or_start();
        let outcome = future.await;
        self.finish(id);
        outcome.map_err(Error::from)
    }

    fn join_or_start(&self) -> (u64, RefreshFuture) {
        let mut slot = self.in_flight.lock();
        if let Some(in_flight) = slot.as_ref() {
            tracing::debug!("joining in-flight credential refresh");
            return (in_flight.id, in_flight.future.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = self.store.ticket();
        let future = exchange(Arc::clone(&self.client), self.store.clone(), ticket)
            .boxed()
            .shared();
        *slot = Some(InFlight {
            id,
            future: future.clone(),
        });
        (id, future)
    }

    fn finish(&self, id: u64) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|f| f.id == id) {
            *slot = None;
        }
    }
}

async fn exchange(
    client: Arc<IdentityClient>,
    store: CredentialStore,
    ticket: Ticket,
) -> Result<AccessToken, Failure> {
    match client.refresh().await {
        Ok(token) => {
            if store.install_with(ticket, token.clone()) {
                tracing::info!("access credential refreshed");
                return Ok(token);
            }
            tracing::debug!("discarding stale refresh result; a fresher credential landed first");
            store.token().ok_or(Failure::Superseded)
        }
        Err(e) => {
            if store.clear_with(ticket) {
                tracing::warn!(error = %e, "credential refresh failed; session cleared");
            } else {
                tracing::debug!(error = %e, "credential refresh failed after a fresher credential landed");
            }
            Err(match e {
                Error::RefreshDenied { status } => Failure::Denied { status },
                Error::Http(source) => Failure::Transport(Arc::new(source)),
                other => Failure::Config(other.to_string()),
            })
        }
    }
}

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use url::Url;

use crate::authz;
use crate::client::{IdentityClient, LoginRequest, Profile, SignupRequest};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::gateway::{Gateway, HttpTransport};
use crate::refresh::Refresher;
use crate::store::{CredentialStore, CredentialView, Ticket};
use crate::types::{AccessToken, Role};

const EVENT_CAPACITY: usize = 16;

/// Lifecycle status of the session.
///
/// `Uninitialized → Initializing → Ready`. Once `Ready`, credential changes
/// only flip `authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready { authenticated: bool },
}

impl SessionStatus {
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Consistent view of the session for presentation code.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub roles: Vec<Role>,
    pub profile: Option<Profile>,
    pub error: Option<String>,
    pub loading: bool,
    has_credential: bool,
    generation: Ticket,
}

impl SessionSnapshot {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.has_credential
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        authz::is_admin(&self.roles)
    }

    /// Name to greet the user with, empty when unknown.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .and_then(Profile::greeting_name)
            .unwrap_or_default()
    }

    /// Pull credential-derived fields from the store. A new credential
    /// generation invalidates the profile fetched for the previous one.
    fn absorb(&mut self, view: &CredentialView) -> bool {
        let mut changed = false;
        if self.generation != view.generation {
            self.generation = view.generation;
            self.roles = view.roles.clone();
            self.profile = None;
            changed = true;
        }
        if self.has_credential != view.has_credential() {
            self.has_credential = view.has_credential();
            changed = true;
        }
        if let SessionStatus::Ready { authenticated } = self.status {
            if authenticated != self.has_credential {
                self.status = SessionStatus::Ready {
                    authenticated: self.has_credential,
                };
                changed = true;
            }
        }
        changed
    }

    fn ready(&mut self) {
        self.status = SessionStatus::Ready {
            authenticated: self.has_credential,
        };
    }
}

/// Notifications for navigation collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session was lost mid-use; navigate to the login entry point.
    LoginRequired { login_path: String },
    /// The user logged out.
    LoggedOut,
}

/// One-shot hints read from the entry URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryHints {
    skip_refresh: bool,
}

impl EntryHints {
    pub const SKIP_REFRESH_PARAM: &'static str = "skipRefresh";

    /// Read `skipRefresh=1` from the entry URL's query.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let skip_refresh = url
            .query_pairs()
            .any(|(k, v)| k == Self::SKIP_REFRESH_PARAM && v == "1");
        Self { skip_refresh }
    }

    /// Hints that skip the automatic initial refresh.
    #[must_use]
    pub fn skipping_refresh() -> Self {
        Self { skip_refresh: true }
    }

    #[must_use]
    pub fn skips_refresh(&self) -> bool {
        self.skip_refresh
    }
}

/// Result of [`Session::logout`]. The local session is cleared either way.
#[derive(Debug)]
pub enum LogoutOutcome {
    Acknowledged,
    /// The server call failed; only the local session was cleared.
    LocalOnly(Error),
}

impl LogoutOutcome {
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}

struct Inner {
    client: Arc<IdentityClient>,
    store: CredentialStore,
    refresher: Refresher,
    state: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

/// Session state machine: owns lifecycle status, profile and error state,
/// and orchestrates login, refresh and logout against the identity service.
///
/// Cheap to clone; clones share one session. Create one per application
/// and hand clones to whatever needs it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session with its own cookie jar and credential store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP clients cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Ok(Self::with_client(IdentityClient::new(config)?))
    }

    #[must_use]
    pub fn with_client(client: IdentityClient) -> Self {
        Self::with_parts(Arc::new(client), CredentialStore::new())
    }

    /// Create a session over an existing client and store.
    #[must_use]
    pub fn with_parts(client: Arc<IdentityClient>, store: CredentialStore) -> Self {
        let refresher = Refresher::new(Arc::clone(&client), store.clone());
        let (state, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                refresher,
                state,
                events,
            }),
        }
    }

    #[must_use]
    pub fn client(&self) -> &IdentityClient {
        &self.inner.client
    }

    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    #[must_use]
    pub fn refresher(&self) -> &Refresher {
        &self.inner.refresher
    }

    /// Gateway for protected calls over the cookie-carrying HTTP client.
    #[must_use]
    pub fn gateway(&self) -> Gateway<HttpTransport> {
        let transport = HttpTransport::new(
            self.inner.client.http().clone(),
            self.inner.client.config().base_url().clone(),
        );
        Gateway::new(transport, self.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.sync();
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.snapshot().status
    }

    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        self.inner.store.roles()
    }

    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.snapshot().profile
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        authz::is_admin(&self.inner.store.roles())
    }

    /// Receiver that observes every snapshot change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.sync();
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Restore the session at application start.
    ///
    /// Runs at most once per session: the first call dispatches a refresh
    /// (unless `hints` skip it or a credential is already held) and the
    /// status becomes `Ready` once it settles, success or not. A skipped
    /// call leaves the latch unset. Later calls return the current status.
    pub async fn initialize(&self, hints: EntryHints) -> SessionStatus {
        if hints.skips_refresh() {
            tracing::debug!("entry hint set; skipping initial refresh");
            return self.status();
        }
        let started = self.inner.state.send_if_modified(|snap| {
            if snap.status == SessionStatus::Uninitialized {
                snap.status = SessionStatus::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return self.status();
        }
        if self.inner.store.has_credential() {
            self.update(SessionSnapshot::ready);
            self.ensure_profile().await;
            return self.status();
        }
        if let Err(e) = self.refresh_and_load().await {
            tracing::debug!(error = %e, "no session restored at startup");
        }
        self.status()
    }

    /// Run the refresh + profile sequence regardless of the startup latch.
    ///
    /// Used by recovery flows that need a fresh credential, such as a
    /// return from an external identity provider.
    ///
    /// # Errors
    ///
    /// Returns the refresh error; the session is already settled as
    /// unauthenticated when it does.
    pub async fn reinitialize(&self) -> Result<(), Error> {
        self.refresh_and_load().await
    }

    async fn refresh_and_load(&self) -> Result<(), Error> {
        self.update(|s| {
            s.loading = true;
            s.error = None;
        });
        match self.inner.refresher.refresh().await {
            Ok(_) => {
                self.update(|s| {
                    s.loading = false;
                    s.error = None;
                    s.ready();
                });
                self.ensure_profile().await;
                Ok(())
            }
            Err(e) => {
                self.settle_refresh_failure(&e);
                Err(e)
            }
        }
    }

    /// Install a newly obtained credential.
    ///
    /// Roles are decoded from it (empty if malformed), and the profile and
    /// error are cleared: the profile must be re-fetched for the new identity.
    pub fn set_credential(&self, token: AccessToken) {
        self.inner.store.install(token);
        self.update(|s| {
            s.error = None;
            if s.status != SessionStatus::Initializing {
                s.ready();
            }
        });
    }

    /// Drop credential, roles and profile. The session stays `Ready`.
    pub fn clear_credential(&self) {
        self.inner.store.clear();
        self.update(|s| {
            s.error = None;
            s.loading = false;
            s.ready();
        });
    }

    /// Load the profile for the current credential.
    ///
    /// A failure is recorded in the snapshot's `error` but leaves the
    /// credential alone. A profile that arrives after the credential changed
    /// is returned but not stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] without any call when no
    /// credential is held, or the profile fetch error.
    pub async fn fetch_profile(&self) -> Result<Profile, Error> {
        let view = self.inner.store.view();
        let Some(token) = view.token.clone() else {
            return Err(Error::NotAuthenticated);
        };
        self.update(|s| s.loading = true);
        self.load_profile(&token, view.generation).await
    }

    /// Load the profile for the credential now held, unless it is already
    /// present or a load is running. Every credential change that does not
    /// go through [`Session::fetch_profile`] ends here.
    pub(crate) async fn ensure_profile(&self) {
        let view = self.inner.store.view();
        let Some(token) = view.token else {
            return;
        };
        let mut claimed = false;
        self.update(|s| {
            if s.profile.is_none() && !s.loading {
                s.loading = true;
                claimed = true;
            }
        });
        if !claimed {
            return;
        }
        if let Err(e) = self.load_profile(&token, view.generation).await {
            tracing::debug!(error = %e, "profile load after credential change failed");
        }
    }

    async fn load_profile(&self, token: &AccessToken, generation: Ticket) -> Result<Profile, Error> {
        match self.inner.client.profile(token).await {
            Ok(profile) => {
                self.update(|s| {
                    s.loading = false;
                    if s.generation == generation {
                        s.profile = Some(profile.clone());
                    }
                });
                Ok(profile)
            }
            Err(e) => {
                tracing::warn!(error = %e, "profile fetch failed");
                self.update(|s| {
                    s.loading = false;
                    s.error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    /// Log in with user credentials, then load the profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoginRejected`] with the server's message; the
    /// session is untouched in that case.
    pub async fn login(&self, request: &LoginRequest) -> Result<(), Error> {
        let device_id = self.inner.client.device().get_or_create();
        let token = self.inner.client.login(request, &device_id).await?;
        tracing::info!(user_id = %request.user_id, "login succeeded");

        self.set_credential(token);
        if let Err(e) = self.fetch_profile().await {
            tracing::debug!(error = %e, "profile load after login failed");
        }
        Ok(())
    }

    /// Register an account. Does not log in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignupRejected`] with the server's message.
    pub async fn signup(&self, request: &SignupRequest) -> Result<(), Error> {
        self.inner.client.signup(request).await?;
        tracing::info!(user_id = %request.user_id, "signup succeeded");
        Ok(())
    }

    /// Log out. The local session is cleared even if the server is unreachable.
    pub async fn logout(&self) -> LogoutOutcome {
        let token = self.inner.store.token();
        let device_id = self.inner.client.device().read();

        let outcome = match self
            .inner
            .client
            .logout(token.as_ref(), device_id.as_ref())
            .await
        {
            Ok(()) => {
                tracing::info!("logged out");
                LogoutOutcome::Acknowledged
            }
            Err(e) => {
                tracing::warn!(error = %e, "logout request failed; clearing local session anyway");
                LogoutOutcome::LocalOnly(e)
            }
        };

        self.clear_credential();
        self.emit(SessionEvent::LoggedOut);
        outcome
    }

    /// Re-read the credential store into the snapshot.
    pub(crate) fn sync(&self) {
        let store = &self.inner.store;
        self.inner
            .state
            .send_if_modified(|snap| snap.absorb(&store.view()));
    }

    fn settle_refresh_failure(&self, error: &Error) {
        self.update(|s| {
            s.loading = false;
            s.error = Some(error.to_string());
            s.ready();
        });
    }

    /// Settle after a gateway-triggered refresh failed. The refresher has
    /// already cleared any credential older than the attempt.
    pub(crate) fn expire_after_refresh_failure(&self, error: &Error) {
        self.settle_refresh_failure(error);
        if !self.inner.store.has_credential() {
            self.require_login();
        }
    }

    /// Clear the session because a retried request was rejected again.
    pub(crate) fn force_logout(&self) {
        self.clear_credential();
        self.require_login();
    }

    fn require_login(&self) {
        tracing::warn!("session lost; login required");
        self.emit(SessionEvent::LoginRequired {
            login_path: self.inner.client.config().login_path().to_owned(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let store = &self.inner.store;
        self.inner.state.send_modify(|snap| {
            snap.absorb(&store.view());
            f(snap);
        });
    }
}

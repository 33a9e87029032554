//! Completion of the external (social) login redirect.
//!
//! Two delivery variants exist. In the cookie variant the identity provider
//! has already set the refresh cookie, so the session is re-initialized
//! after a short grace delay. In the token variant the access credential
//! arrives as the `accessToken` query parameter of the return URL.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::session::Session;
use crate::types::AccessToken;

pub const ACCESS_TOKEN_PARAM: &str = "accessToken";

/// Where to navigate once the redirect has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Home,
    Login,
}

/// Handle to a pending cookie-variant redirect completion.
///
/// Dropping the handle, or a pending [`RedirectTask::outcome`] future,
/// cancels the completion if it has not started its refresh yet. The
/// caller's token is never cancelled by this.
#[derive(Debug)]
pub struct RedirectTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Option<Landing>>>,
}

impl RedirectTask {
    /// Abandon the completion. No effect once the grace delay has elapsed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the completion. `None` means it was cancelled.
    pub async fn outcome(mut self) -> Option<Landing> {
        let handle = self.handle.take()?;
        match handle.await {
            Ok(landing) => landing,
            Err(e) => {
                tracing::warn!(error = %e, "redirect completion task failed");
                None
            }
        }
    }
}

impl Drop for RedirectTask {
    fn drop(&mut self) {
        // no-op once the task is past its grace delay
        self.cancel.cancel();
    }
}

impl Session {
    /// Complete a cookie-variant redirect: wait the configured grace delay,
    /// then refresh and load the profile regardless of the startup latch.
    ///
    /// Cancelling `cancel` (or the returned task) during the grace delay
    /// abandons the completion without touching the session.
    pub fn complete_cookie_redirect(&self, cancel: CancellationToken) -> RedirectTask {
        let session = self.clone();
        let grace = self.client().config().redirect_grace();
        let cancel = cancel.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("redirect completion cancelled during grace delay");
                    return None;
                }
                () = tokio::time::sleep(grace) => {}
            }
            match session.reinitialize().await {
                Ok(()) => Some(Landing::Home),
                Err(e) => {
                    tracing::warn!(error = %e, "redirect completion could not restore the session");
                    Some(Landing::Login)
                }
            }
        });

        RedirectTask {
            cancel,
            handle: Some(handle),
        }
    }

    /// Complete a token-variant redirect from the return URL.
    ///
    /// A present `accessToken` parameter is installed as the credential and
    /// the profile is loaded; without one the user is sent to login.
    pub async fn complete_token_redirect(&self, url: &Url) -> Landing {
        let token = url
            .query_pairs()
            .find(|(k, v)| k == ACCESS_TOKEN_PARAM && !v.is_empty())
            .map(|(_, v)| AccessToken::new(v.into_owned()));

        let Some(token) = token else {
            tracing::warn!("redirect returned without an access credential");
            return Landing::Login;
        };

        self.set_credential(token);
        if let Err(e) = self.fetch_profile().await {
            tracing::debug!(error = %e, "profile load after redirect failed");
        }
        Landing::Home
    }
}

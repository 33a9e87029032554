use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::device::DeviceIdentity;
use crate::error::Error;
use crate::types::{AccessToken, DeviceId, UserId};

pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Credentials for `POST auth/login`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: UserId,
    pub password: String,
}

impl LoginRequest {
    #[must_use]
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            password: password.into(),
        }
    }
}

/// Registration form for `POST auth/signup`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SignupRequest {
    pub user_id: UserId,
    pub display_name: String,
    pub email: String,
    pub password: String,
}

impl SignupRequest {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            display_name: display_name.into(),
            email: email.into(),
            password: password.into(),
        }
    }
}

/// User-facing attributes from `GET auth/me`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Profile {
    /// Name to greet the user with: `displayName`, then `nickname`.
    #[must_use]
    pub fn greeting_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or(self.nickname.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: AccessToken,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the identity service's `auth/*` endpoints.
///
/// Holds two transports: a cookie-carrying one sharing the jar (login,
/// refresh, profile, logout) and a cookie-less one (signup). The refresh
/// credential only ever travels inside the jar; this type never sees it.
pub struct IdentityClient {
    config: ClientConfig,
    http: reqwest::Client,
    plain: reqwest::Client,
    jar: Arc<Jar>,
    device: DeviceIdentity,
}

impl IdentityClient {
    /// Create a client with a fresh in-memory cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP clients cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::with_jar(config, Arc::new(Jar::default()))
    }

    /// Create a client over an existing cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP clients cannot be built.
    pub fn with_jar(config: ClientConfig, jar: Arc<Jar>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;
        let plain = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;
        let device = DeviceIdentity::new(Arc::clone(&jar), &config);
        Ok(Self {
            config,
            http,
            plain,
            jar,
            device,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    #[must_use]
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// The cookie-carrying transport, shared with the request gateway.
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Exchange user credentials for an access credential.
    ///
    /// The refresh credential comes back as a cookie and stays in the jar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoginRejected`] with the server's message on a
    /// non-2xx response, or [`Error::Http`] on network failure.
    pub async fn login(
        &self,
        request: &LoginRequest,
        device_id: &DeviceId,
    ) -> Result<AccessToken, Error> {
        let response = self
            .http
            .post(self.config.endpoint("auth/login")?)
            .header(DEVICE_ID_HEADER, device_id.as_str())
            .header(USER_AGENT, self.config.user_agent.as_str())
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, message) = rejection(response, "Login failed.").await;
            return Err(Error::LoginRejected { status, message });
        }
        let body: TokenResponse = response.json().await?;
        Ok(body.access_token)
    }

    /// Register a new account. No session is implied, so cookies are off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignupRejected`] with the server's message on a
    /// non-2xx response, or [`Error::Http`] on network failure.
    pub async fn signup(&self, request: &SignupRequest) -> Result<(), Error> {
        let response = self
            .plain
            .post(self.config.endpoint("auth/signup")?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, message) = rejection(response, "Signup failed.").await;
            return Err(Error::SignupRejected { status, message });
        }
        Ok(())
    }

    /// Trade the cookie-held refresh credential for a new access credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefreshDenied`] when the service rejects the
    /// exchange, or [`Error::Http`] on network failure.
    pub async fn refresh(&self) -> Result<AccessToken, Error> {
        let response = self
            .http
            .post(self.config.endpoint("auth/refresh")?)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RefreshDenied {
                status: status.as_u16(),
            });
        }
        let body: TokenResponse = response.json().await?;
        Ok(body.access_token)
    }

    /// Fetch the profile of the identity behind `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProfileFetch`] on a non-2xx or undecodable response,
    /// or [`Error::Http`] on network failure.
    pub async fn profile(&self, token: &AccessToken) -> Result<Profile, Error> {
        let response = self
            .http
            .get(self.config.endpoint("auth/me")?)
            .bearer_auth(token.as_str())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::ProfileFetch {
                status: Some(status.as_u16()),
                detail,
            });
        }
        response.json::<Profile>().await.map_err(|e| Error::ProfileFetch {
            status: Some(status.as_u16()),
            detail: e.to_string(),
        })
    }

    /// Tell the service to revoke the session for this device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogoutTransport`] on a non-2xx response or network failure.
    pub async fn logout(
        &self,
        token: Option<&AccessToken>,
        device_id: Option<&DeviceId>,
    ) -> Result<(), Error> {
        let mut request = self
            .http
            .post(self.config.endpoint("auth/logout")?)
            .json(&serde_json::json!({}));
        if let Some(token) = token {
            request = request.bearer_auth(token.as_str());
        }
        if let Some(device_id) = device_id {
            request = request.header(DEVICE_ID_HEADER, device_id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::LogoutTransport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::LogoutTransport(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Status plus the human-readable `message` field of a rejected call.
async fn rejection(response: reqwest::Response, fallback: &str) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback.to_owned());
    (status, message)
}

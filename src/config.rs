use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_USER_AGENT: &str = concat!("login-session/", env!("CARGO_PKG_VERSION"));

/// Identity service client configuration.
///
/// The required field (`base_url`) is a constructor parameter. Everything
/// else has a default and a `with_*` override.
///
/// ```rust,ignore
/// use login_session::ClientConfig;
///
/// let config = ClientConfig::new("https://app.example.com/api/".parse()?)
///     .with_redirect_grace(std::time::Duration::from_millis(300));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) user_agent: String,
    pub(crate) device_cookie_name: String,
    pub(crate) device_cookie_max_age: time::Duration,
    pub(crate) redirect_grace: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) login_path: String,
    pub(crate) home_path: String,
}

impl ClientConfig {
    /// Create a configuration rooted at `base_url` (e.g. `https://host/api/`).
    ///
    /// Endpoint paths such as `auth/login` are resolved against it, so a
    /// missing trailing slash is added.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            user_agent: DEFAULT_USER_AGENT.into(),
            device_cookie_name: "device_id".into(),
            device_cookie_max_age: time::Duration::days(2 * 365),
            redirect_grace: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            login_path: "/login".into(),
            home_path: "/".into(),
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// # Required env vars
    /// - `AUTH_BASE_URL`: identity service base URL
    ///
    /// # Optional env vars
    /// - `AUTH_USER_AGENT`: user agent sent with every call
    /// - `AUTH_DEVICE_COOKIE`: device identifier cookie name
    /// - `AUTH_REDIRECT_GRACE_MS`: delay before refreshing after a provider redirect
    /// - `AUTH_REQUEST_TIMEOUT_SECS`: per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or a value does not parse.
    pub fn from_env() -> Result<Self, Error> {
        let base_url_str = std::env::var("AUTH_BASE_URL")
            .map_err(|_| Error::Config("AUTH_BASE_URL is required".into()))?;
        let base_url: Url = base_url_str
            .parse()
            .map_err(|e| Error::Config(format!("AUTH_BASE_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(user_agent) = std::env::var("AUTH_USER_AGENT") {
            config = config.with_user_agent(user_agent);
        }
        if let Ok(name) = std::env::var("AUTH_DEVICE_COOKIE") {
            if name.trim().is_empty() {
                return Err(Error::Config("AUTH_DEVICE_COOKIE must not be empty".into()));
            }
            config = config.with_device_cookie_name(name.trim());
        }
        if let Ok(ms) = std::env::var("AUTH_REDIRECT_GRACE_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| Error::Config(format!("AUTH_REDIRECT_GRACE_MS: {e}")))?;
            config = config.with_redirect_grace(Duration::from_millis(ms));
        }
        if let Ok(secs) = std::env::var("AUTH_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("AUTH_REQUEST_TIMEOUT_SECS: {e}")))?;
            config = config.with_request_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_device_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.device_cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_device_cookie_max_age(mut self, max_age: time::Duration) -> Self {
        self.device_cookie_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_redirect_grace(mut self, grace: Duration) -> Self {
        self.redirect_grace = grace;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_home_path(mut self, path: impl Into<String>) -> Self {
        self.home_path = path.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[must_use]
    pub fn device_cookie_name(&self) -> &str {
        &self.device_cookie_name
    }

    #[must_use]
    pub fn redirect_grace(&self) -> Duration {
        self.redirect_grace
    }

    /// Where navigation goes when a session is lost.
    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn home_path(&self) -> &str {
        &self.home_path
    }

    /// Resolve an endpoint path (e.g. `auth/refresh`) against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }
}

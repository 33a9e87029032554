//! Request gateway for protected calls.
//!
//! [`Gateway`] is a policy layer composed around a [`Transport`]: it
//! attaches the current credential to every request and, on a 401, refreshes
//! the credential and re-issues the same request exactly once.

use std::future::Future;
use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;
use crate::session::Session;
use crate::types::AccessToken;

/// A protected call, described independently of any transport.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `body` does not serialize.
    pub fn json(mut self, body: &impl Serialize) -> Result<Self, Error> {
        let value =
            serde_json::to_value(body).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Copy of this request carrying `token` as its bearer credential.
    fn authorized(&self, token: Option<&AccessToken>) -> Result<Self, Error> {
        let mut request = self.clone();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|_| Error::InvalidRequest("credential is not a valid header value".into()))?;
            value.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// One dispatch of a logical request.
///
/// The attempt number is fixed at construction; [`Attempt::retry`] yields
/// the follow-up attempt only while the retry budget lasts.
#[derive(Debug, Clone)]
pub struct Attempt {
    request: Arc<OutboundRequest>,
    number: u8,
}

impl Attempt {
    /// Original dispatch plus one refresh-and-retry.
    pub const LIMIT: u8 = 2;

    #[must_use]
    pub fn first(request: OutboundRequest) -> Self {
        Self {
            request: Arc::new(request),
            number: 1,
        }
    }

    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.number > 1
    }

    #[must_use]
    pub fn request(&self) -> &OutboundRequest {
        &self.request
    }

    /// The re-issue of this same request, if the budget allows one.
    #[must_use]
    pub fn retry(&self) -> Option<Self> {
        (self.number < Self::LIMIT).then(|| Self {
            request: Arc::clone(&self.request),
            number: self.number + 1,
        })
    }
}

/// Buffered response of a protected call.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`Error::Status`] for any non-2xx status.
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::Status {
            status: self.status.as_u16(),
            detail: self.text(),
        })
    }
}

/// Carries a prepared request to the protected API.
pub trait Transport: Send + Sync {
    fn send(&self, request: OutboundRequest) -> impl Future<Output = Result<Response, Error>> + Send;
}

/// [`Transport`] over the session's cookie-carrying HTTP client.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<Response, Error> {
        let url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("{}: {e}", request.path)))?;

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(Response::new(status, headers, body))
    }
}

/// Retry-once authorization policy wrapped around a [`Transport`].
pub struct Gateway<T> {
    transport: T,
    session: Session,
}

impl<T: Transport> Gateway<T> {
    #[must_use]
    pub fn new(transport: T, session: Session) -> Self {
        Self { transport, session }
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send `request` with the current credential attached.
    ///
    /// A 401 on the first attempt refreshes the credential (joining any
    /// refresh already in flight) and re-issues the request once with the
    /// refreshed credential. If a newer credential landed while the request
    /// was out, it is replayed with that one and no refresh is made. After a
    /// refresh the profile is reloaded for the new credential. Statuses
    /// other than 401 are returned as-is.
    ///
    /// # Errors
    ///
    /// When the session cannot be recovered the credential is cleared and
    /// [`SessionEvent::LoginRequired`](crate::SessionEvent::LoginRequired)
    /// is broadcast *before* the error is returned: the refresh error (e.g.
    /// [`Error::RefreshDenied`]) if the refresh failed, or
    /// [`Error::Unauthorized`] if the retried request got a 401 again.
    /// Transport failures are returned unchanged.
    pub async fn send(&self, request: OutboundRequest) -> Result<Response, Error> {
        let mut attempt = Attempt::first(request);
        let sent = self.session.store().view();
        let mut token = sent.token;
        let mut sent_with = sent.generation;
        let mut refreshed = false;

        loop {
            let prepared = attempt.request().authorized(token.as_ref())?;
            let response = self.transport.send(prepared).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                if refreshed {
                    self.session.ensure_profile().await;
                }
                return Ok(response);
            }

            let Some(next) = attempt.retry() else {
                tracing::warn!(
                    path = %attempt.request().path(),
                    "request rejected again after refresh; forcing logout"
                );
                self.session.force_logout();
                return Err(Error::Unauthorized);
            };

            // A credential newer than the one this attempt carried already
            // landed; replay with it instead of exchanging again.
            let current = self.session.store().view();
            if current.generation > sent_with {
                if let Some(newer) = current.token {
                    tracing::debug!(
                        path = %attempt.request().path(),
                        "401 for a replaced credential; retrying with the current one"
                    );
                    self.session.sync();
                    token = Some(newer);
                    sent_with = current.generation;
                    attempt = next;
                    continue;
                }
            }

            tracing::debug!(path = %attempt.request().path(), "401 received; refreshing credential");
            match self.session.refresher().refresh().await {
                Ok(fresh) => {
                    self.session.sync();
                    sent_with = self.session.store().generation();
                    token = Some(fresh);
                    refreshed = true;
                    attempt = next;
                }
                Err(e) => {
                    self.session.expire_after_refresh_failure(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Send `request` and decode a 2xx JSON body.
    ///
    /// # Errors
    ///
    /// As [`Gateway::send`], plus [`Error::Status`] for other non-2xx
    /// statuses and [`Error::Decode`] for an unexpected body.
    pub async fn send_json<R: DeserializeOwned>(&self, request: OutboundRequest) -> Result<R, Error> {
        self.send(request).await?.error_for_status()?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::{SessionEvent, SessionStatus};
    use httpmock::prelude::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    type Rule = Box<dyn Fn(Option<&str>) -> StatusCode + Send + Sync>;

    /// Answers by bearer header and records every dispatch.
    struct ScriptedTransport {
        rule: Rule,
        slow: Option<(&'static str, Duration)>,
        seen: Mutex<Vec<(Method, String, Option<String>, Option<serde_json::Value>)>>,
    }

    impl ScriptedTransport {
        fn new(rule: impl Fn(Option<&str>) -> StatusCode + Send + Sync + 'static) -> Self {
            Self {
                rule: Box::new(rule),
                slow: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        /// Hold the answer for `path` back by `delay`; the status is still
        /// decided by the credential the request was sent with.
        fn answering_late(mut self, path: &'static str, delay: Duration) -> Self {
            self.slow = Some((path, delay));
            self
        }

        fn bearers(&self) -> Vec<Option<String>> {
            self.seen.lock().iter().map(|s| s.2.clone()).collect()
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, request: OutboundRequest) -> Result<Response, Error> {
            let bearer = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let status = (self.rule)(bearer.as_deref());
            if let Some((path, delay)) = self.slow {
                if request.path() == path {
                    tokio::time::sleep(delay).await;
                }
            }
            self.seen.lock().push((
                request.method().clone(),
                request.path().to_owned(),
                bearer,
                request.body().cloned(),
            ));
            Ok(Response::new(
                status,
                HeaderMap::new(),
                br#"{"ok":true}"#.to_vec(),
            ))
        }
    }

    fn session_for(server: &MockServer) -> Session {
        let config = ClientConfig::new(server.url("/api/").parse().unwrap());
        Session::new(config).unwrap()
    }

    async fn refresh_returns<'a>(server: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
        let token = token.to_owned();
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh");
                then.status(200).json_body(json!({ "accessToken": token }));
            })
            .await
    }

    #[test]
    fn attempts_allow_exactly_one_retry() {
        let first = Attempt::first(OutboundRequest::get("/x"));
        assert!(!first.is_retry());
        let second = first.retry().expect("one retry allowed");
        assert!(second.is_retry());
        assert_eq!(second.number(), 2);
        assert!(second.retry().is_none());
        assert_eq!(second.request().path(), "/x");
    }

    #[tokio::test]
    async fn attaches_current_credential() {
        let server = MockServer::start_async().await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(ScriptedTransport::new(|_| StatusCode::OK), session);
        gateway.send(OutboundRequest::get("/private")).await.unwrap();

        assert_eq!(gateway.transport().bearers(), vec![Some("Bearer abc".into())]);
    }

    #[tokio::test]
    async fn no_credential_means_no_header() {
        let server = MockServer::start_async().await;
        let session = session_for(&server);

        let gateway = Gateway::new(ScriptedTransport::new(|_| StatusCode::OK), session);
        gateway.send(OutboundRequest::get("/public")).await.unwrap();

        assert_eq!(gateway.transport().bearers(), vec![None]);
    }

    #[tokio::test]
    async fn unauthorized_once_is_retried_transparently() {
        let server = MockServer::start_async().await;
        let refresh = refresh_returns(&server, "def").await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(
            ScriptedTransport::new(|bearer| match bearer {
                Some("Bearer def") => StatusCode::OK,
                _ => StatusCode::UNAUTHORIZED,
            }),
            session.clone(),
        );
        let body = json!({ "item": 1 });
        let response = gateway
            .send(OutboundRequest::post("/orders").json(&body).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session.store().token(), Some(AccessToken::from("def")));
        assert_eq!(refresh.hits_async().await, 1);

        let seen = gateway.transport().seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
        assert_eq!(seen[0].1, seen[1].1);
        assert_eq!(seen[0].3, seen[1].3);
        assert_eq!(seen[1].2.as_deref(), Some("Bearer def"));
    }

    #[tokio::test]
    async fn second_unauthorized_is_terminal() {
        let server = MockServer::start_async().await;
        let refresh = refresh_returns(&server, "def").await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));
        let mut events = session.events();

        let gateway = Gateway::new(
            ScriptedTransport::new(|_| StatusCode::UNAUTHORIZED),
            session.clone(),
        );
        let err = gateway.send(OutboundRequest::get("/private")).await.unwrap_err();

        assert!(matches!(err, Error::Unauthorized));
        assert_eq!(gateway.transport().calls(), 2);
        assert_eq!(refresh.hits_async().await, 1);
        assert!(!session.store().has_credential());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LoginRequired {
                login_path: "/login".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_refresh_forces_logout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh");
                then.status(401);
            })
            .await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));
        let mut events = session.events();

        let gateway = Gateway::new(
            ScriptedTransport::new(|_| StatusCode::UNAUTHORIZED),
            session.clone(),
        );
        let err = gateway.send(OutboundRequest::get("/private")).await.unwrap_err();

        assert!(matches!(err, Error::RefreshDenied { status: 401 }));
        assert_eq!(gateway.transport().calls(), 1);
        assert!(!session.store().has_credential());
        assert_eq!(session.status(), SessionStatus::Ready { authenticated: false });
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::LoginRequired { .. }
        ));
    }

    #[tokio::test]
    async fn other_failures_pass_through_without_refresh() {
        let server = MockServer::start_async().await;
        let refresh = refresh_returns(&server, "def").await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(
            ScriptedTransport::new(|_| StatusCode::FORBIDDEN),
            session.clone(),
        );
        let response = gateway.send(OutboundRequest::get("/admin")).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(refresh.hits_async().await, 0);
        assert!(session.store().has_credential());
        assert!(matches!(
            response.error_for_status(),
            Err(Error::Status { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_unauthorized_calls_share_one_refresh() {
        let server = MockServer::start_async().await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh");
                then.status(200)
                    .delay(Duration::from_millis(100))
                    .json_body(json!({ "accessToken": "def" }));
            })
            .await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(
            ScriptedTransport::new(|bearer| match bearer {
                Some("Bearer def") => StatusCode::OK,
                _ => StatusCode::UNAUTHORIZED,
            }),
            session.clone(),
        );
        let (a, b) = tokio::join!(
            gateway.send(OutboundRequest::get("/a")),
            gateway.send(OutboundRequest::get("/b")),
        );

        assert_eq!(a.unwrap().status(), StatusCode::OK);
        assert_eq!(b.unwrap().status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 1);
        assert_eq!(gateway.transport().calls(), 4);
    }

    #[tokio::test]
    async fn send_json_decodes_body() {
        let server = MockServer::start_async().await;
        let session = session_for(&server);
        let gateway = Gateway::new(ScriptedTransport::new(|_| StatusCode::OK), session);

        let body: serde_json::Value = gateway
            .send_json(OutboundRequest::get("/data"))
            .await
            .unwrap();
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn late_unauthorized_reuses_credential_refreshed_meanwhile() {
        let server = MockServer::start_async().await;
        let refresh = refresh_returns(&server, "def").await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(
            ScriptedTransport::new(|bearer| match bearer {
                Some("Bearer def") => StatusCode::OK,
                _ => StatusCode::UNAUTHORIZED,
            })
            .answering_late("/slow", Duration::from_millis(300)),
            session.clone(),
        );
        let (fast, slow) = tokio::join!(
            gateway.send(OutboundRequest::get("/fast")),
            gateway.send(OutboundRequest::get("/slow")),
        );

        assert_eq!(fast.unwrap().status(), StatusCode::OK);
        assert_eq!(slow.unwrap().status(), StatusCode::OK);
        assert_eq!(refresh.hits_async().await, 1);
        assert_eq!(session.store().token(), Some(AccessToken::from("def")));
        assert_eq!(
            gateway.transport().bearers().iter().filter(|b| b.as_deref() == Some("Bearer def")).count(),
            2
        );
    }

    #[tokio::test]
    async fn profile_reloaded_after_transparent_refresh() {
        let server = MockServer::start_async().await;
        refresh_returns(&server, "def").await;
        let me = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/auth/me")
                    .header("Authorization", "Bearer def");
                then.status(200).json_body(json!({ "displayName": "Alice" }));
            })
            .await;
        let session = session_for(&server);
        session.set_credential(AccessToken::from("abc"));

        let gateway = Gateway::new(
            ScriptedTransport::new(|bearer| match bearer {
                Some("Bearer def") => StatusCode::OK,
                _ => StatusCode::UNAUTHORIZED,
            }),
            session.clone(),
        );
        gateway.send(OutboundRequest::get("/orders")).await.unwrap();

        let snap = session.snapshot();
        assert!(snap.is_authenticated());
        assert_eq!(snap.display_name(), "Alice");
        assert_eq!(me.hits_async().await, 1);
    }
}

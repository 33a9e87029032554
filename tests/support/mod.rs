use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use httpmock::MockServer;
use login_session::{ClientConfig, Session};

/// Unsigned JWT-shaped token carrying `claims`. Signature is not checked
/// client-side.
pub fn token_with(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

pub fn session_for(server: &MockServer) -> Session {
    let config = ClientConfig::new(server.url("/api/").parse().expect("mock url"));
    Session::new(config).expect("session")
}

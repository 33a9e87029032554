use std::sync::Arc;

use cookie::{Cookie, SameSite};
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use crate::config::ClientConfig;
use crate::types::DeviceId;

/// Reads or creates the long-lived device identifier cookie.
///
/// The cookie lives in the same jar the HTTP clients use, so the identity
/// service sees it on every cookie-carrying call.
#[derive(Clone)]
pub struct DeviceIdentity {
    jar: Arc<Jar>,
    url: Url,
    cookie_name: String,
    max_age: time::Duration,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(jar: Arc<Jar>, config: &ClientConfig) -> Self {
        Self {
            jar,
            url: config.base_url.clone(),
            cookie_name: config.device_cookie_name.clone(),
            max_age: config.device_cookie_max_age,
        }
    }

    /// Current identifier, if the cookie is set.
    #[must_use]
    pub fn read(&self) -> Option<DeviceId> {
        let header = self.jar.cookies(&self.url)?;
        let header = header.to_str().ok()?;
        Cookie::split_parse(header)
            .filter_map(Result::ok)
            .find(|c| c.name() == self.cookie_name && !c.value().is_empty())
            .map(|c| DeviceId(c.value().to_owned()))
    }

    /// Return the identifier, generating and storing a new one if absent.
    pub fn get_or_create(&self) -> DeviceId {
        if let Some(id) = self.read() {
            return id;
        }
        let id = DeviceId(uuid::Uuid::new_v4().to_string());
        let cookie = Cookie::build((self.cookie_name.clone(), id.0.clone()))
            .path("/")
            .max_age(self.max_age)
            .same_site(SameSite::Strict)
            .build();
        self.jar.add_cookie_str(&cookie.to_string(), &self.url);
        tracing::debug!(device_id = %id, "generated device identifier");
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        let config = ClientConfig::new("https://app.example.com/api/".parse().unwrap());
        DeviceIdentity::new(Arc::new(Jar::default()), &config)
    }

    #[test]
    fn absent_until_created() {
        let device = identity();
        assert!(device.read().is_none());
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let device = identity();
        let first = device.get_or_create();
        let second = device.get_or_create();
        assert_eq!(first, second);
        assert_eq!(device.read(), Some(first));
    }

    #[test]
    fn generated_value_is_uuid() {
        let device = identity();
        let id = device.get_or_create();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn existing_cookie_is_reused() {
        let device = identity();
        device.jar.add_cookie_str(
            "device_id=preexisting; Path=/",
            &"https://app.example.com/".parse().unwrap(),
        );
        assert_eq!(device.get_or_create(), DeviceId("preexisting".into()));
    }

    #[test]
    fn other_cookies_are_ignored() {
        let device = identity();
        device.jar.add_cookie_str(
            "theme=dark; Path=/",
            &"https://app.example.com/".parse().unwrap(),
        );
        assert!(device.read().is_none());
    }

    #[test]
    fn clones_share_the_jar() {
        let device = identity();
        let other = device.clone();
        let id = device.get_or_create();
        assert_eq!(other.get_or_create(), id);
    }
}

#![doc = include_str!("../README.md")]

pub mod authz;
pub mod claims;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
#[cfg(feature = "redirect")]
pub mod redirect;
pub mod refresh;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use authz::{ROLE_ADMIN, ROLE_USER, has_any_role, has_role, is_admin};
pub use claims::{Claims, decode_lenient, decode_roles};
pub use client::{DEVICE_ID_HEADER, IdentityClient, LoginRequest, Profile, SignupRequest};
pub use config::ClientConfig;
pub use device::DeviceIdentity;
pub use error::Error;
pub use gateway::{Attempt, Gateway, HttpTransport, OutboundRequest, Response, Transport};
#[cfg(feature = "redirect")]
pub use redirect::{Landing, RedirectTask};
pub use refresh::Refresher;
pub use session::{
    EntryHints, LogoutOutcome, Session, SessionEvent, SessionSnapshot, SessionStatus,
};
pub use store::{CredentialStore, CredentialView, Ticket};
pub use types::{AccessToken, DeviceId, Role, UserId};

//! Authenticator and wire-protocol registries
//!
//! Both registries map the mode strings found in [`MembershipConfig`] to
//! factories. They are filled once at startup and only read afterwards; an
//! unknown mode fails service construction with
//! [`MembershipError::ServiceLoading`].

use crate::codec::{BinaryCodec, JsonCodec, MessageCodec};
use crate::config::MembershipConfig;
use crate::error::{MembershipError, Result};
use crate::member::MemberIdentifier;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::hmac;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Checks the credentials a candidate presents with its join request
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Credentials the local member attaches to its own join request
    fn credentials(&self, candidate: &MemberIdentifier) -> Option<String>;

    fn authenticate(&self, candidate: &MemberIdentifier, credentials: Option<&str>) -> Result<()>;
}

/// Accepts every candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn name(&self) -> &'static str {
        AuthenticatorRegistry::NOOP
    }

    fn credentials(&self, _candidate: &MemberIdentifier) -> Option<String> {
        None
    }

    fn authenticate(&self, _candidate: &MemberIdentifier, _credentials: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// HMAC-SHA256 of the candidate identifier under a secret shared by all
/// members, base64 encoded
pub struct SharedSecretAuthenticator {
    key: hmac::Key,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    fn token(&self, candidate: &MemberIdentifier) -> String {
        let tag = hmac::sign(&self.key, candidate.to_string().as_bytes());
        BASE64.encode(tag.as_ref())
    }
}

impl Authenticator for SharedSecretAuthenticator {
    fn name(&self) -> &'static str {
        AuthenticatorRegistry::SHARED_SECRET
    }

    fn credentials(&self, candidate: &MemberIdentifier) -> Option<String> {
        Some(self.token(candidate))
    }

    fn authenticate(&self, candidate: &MemberIdentifier, credentials: Option<&str>) -> Result<()> {
        let token = credentials
            .ok_or_else(|| MembershipError::authentication(format!("{} presented no credentials", candidate)))?;
        let tag = BASE64
            .decode(token)
            .map_err(|e| MembershipError::authentication(format!("Malformed credentials from {}: {}", candidate, e)))?;

        hmac::verify(&self.key, candidate.to_string().as_bytes(), &tag)
            .map_err(|_| MembershipError::authentication(format!("Invalid credentials from {}", candidate)))
    }
}

pub type AuthenticatorFactory = fn(&MembershipConfig) -> Result<Arc<dyn Authenticator>>;

/// Authenticator factories keyed by `authentication_mode`
#[derive(Clone)]
pub struct AuthenticatorRegistry {
    factories: BTreeMap<String, AuthenticatorFactory>,
}

impl AuthenticatorRegistry {
    pub const NOOP: &'static str = "NOOP";
    pub const SHARED_SECRET: &'static str = "SHARED_SECRET";

    /// Registry without any authenticator
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<T: Into<String>>(&mut self, mode: T, factory: AuthenticatorFactory) {
        self.factories.insert(mode.into(), factory);
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, config: &MembershipConfig) -> Result<Arc<dyn Authenticator>> {
        let mode = config.authentication_mode.as_str();
        let factory = self.factories.get(mode).ok_or_else(|| {
            MembershipError::service_loading(format!("No authenticator implementation registered for '{}'", mode))
        })?;
        factory(config)
    }
}

impl Default for AuthenticatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Self::NOOP, noop_authenticator);
        registry.register(Self::SHARED_SECRET, shared_secret_authenticator);
        registry
    }
}

fn noop_authenticator(_config: &MembershipConfig) -> Result<Arc<dyn Authenticator>> {
    Ok(Arc::new(NoopAuthenticator))
}

fn shared_secret_authenticator(config: &MembershipConfig) -> Result<Arc<dyn Authenticator>> {
    let secret = config
        .shared_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| MembershipError::configuration("SHARED_SECRET authentication requires a shared_secret"))?;
    Ok(Arc::new(SharedSecretAuthenticator::new(secret.as_bytes())))
}

pub type CodecFactory = fn() -> Arc<dyn MessageCodec>;

/// Codec factories keyed by `wire_protocol`
#[derive(Clone)]
pub struct CodecRegistry {
    factories: BTreeMap<String, CodecFactory>,
}

impl CodecRegistry {
    pub const BINARY: &'static str = BinaryCodec::NAME;
    pub const JSON: &'static str = JsonCodec::NAME;

    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<T: Into<String>>(&mut self, protocol: T, factory: CodecFactory) {
        self.factories.insert(protocol.into(), factory);
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, protocol: &str) -> Result<Arc<dyn MessageCodec>> {
        self.factories
            .get(protocol)
            .map(|factory| factory())
            .ok_or_else(|| {
                MembershipError::service_loading(format!("No wire protocol implementation registered for '{}'", protocol))
            })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Self::BINARY, binary_codec);
        registry.register(Self::JSON, json_codec);
        registry
    }
}

fn binary_codec() -> Arc<dyn MessageCodec> {
    Arc::new(BinaryCodec)
}

fn json_codec() -> Arc<dyn MessageCodec> {
    Arc::new(JsonCodec)
}

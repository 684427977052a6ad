//! Auth token providers
//!
//! The streaming client asks a [`TokenProvider`] for a bearer token right
//! before each request, so rotated credentials are picked up without
//! rebuilding the client.

use async_trait::async_trait;

use crate::error::{ForkchatError, Result};

/// Source of the bearer token used to authorize upstream requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the current token
    ///
    /// # Errors
    ///
    /// Returns `ForkchatError::Authentication` when no token is available.
    async fn current_token(&self) -> Result<String>;
}

/// Fixed token, mostly for tests and local endpoints
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always returns `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on every call
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    /// Creates a provider reading `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn current_token(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ForkchatError::Authentication(format!("{} is not set", self.var)).into()),
        }
    }
}

/// Reads the token from the system keyring
#[derive(Debug, Clone)]
pub struct KeyringTokenProvider {
    service: String,
    user: String,
}

impl KeyringTokenProvider {
    /// Creates a provider for the keyring entry `service`/`user`
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for KeyringTokenProvider {
    async fn current_token(&self) -> Result<String> {
        let entry = keyring::Entry::new(&self.service, &self.user)?;
        let token = entry.get_password().map_err(|e| {
            ForkchatError::Authentication(format!(
                "no token in keyring entry {}/{}: {}",
                self.service, self.user, e
            ))
        })?;
        if token.trim().is_empty() {
            return Err(ForkchatError::Authentication("keyring token is empty".into()).into());
        }
        Ok(token)
    }
}

/// Tries each provider in order and returns the first token found
pub struct ChainedTokenProvider {
    providers: Vec<Box<dyn TokenProvider>>,
}

impl ChainedTokenProvider {
    /// Creates a chain over `providers`
    pub fn new(providers: Vec<Box<dyn TokenProvider>>) -> Self {
        Self { providers }
    }

    /// Environment variable first, then the keyring
    pub fn env_then_keyring(var: &str, keyring_service: &str) -> Self {
        Self::new(vec![
            Box::new(EnvTokenProvider::new(var)),
            Box::new(KeyringTokenProvider::new(keyring_service, "api_key")),
        ])
    }
}

#[async_trait]
impl TokenProvider for ChainedTokenProvider {
    async fn current_token(&self) -> Result<String> {
        let mut reasons = Vec::new();
        for provider in &self.providers {
            match provider.current_token().await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::debug!("Token provider skipped: {}", e);
                    reasons.push(e.to_string());
                }
            }
        }
        Err(ForkchatError::Authentication(format!(
            "no API token available ({})",
            reasons.join("; ")
        ))
        .into())
    }
}

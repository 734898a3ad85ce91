//! Credential resolution for the reference store.
//!
//! Providers are tried in order and the first success is cached for the lifetime of
//! the resolver. Nothing here retries; a failed run is retried by the scheduler.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const SECRET_ACCESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const PASSWORD_ENV_VAR: &str = "DATABASE_PASSWORD";

/// Address of a secret in the external secret service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    pub secret_id: String,
    pub project_id: String,
}

impl SecretRef {
    pub fn new(secret_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            project_id: project_id.into(),
        }
    }
}

/// An opaque credential. Its `Debug` output is redacted so it can sit inside
/// structs that get logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Only the zero-length value counts as empty; whitespace is a valid password.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider had nothing to offer (e.g. the variable is unset).
    Missing,
    Timeout,
    AccessDenied,
    NotFound,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: &'static str,
    pub failure: ProviderFailure,
}

impl fmt::Display for ProviderAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}): {}",
            self.provider, self.failure.kind, self.failure.message
        )
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error(
        "credential unavailable for secret {secret_id} in project {project_id}; attempts: [{}]",
        join_attempts(.attempts)
    )]
    CredentialUnavailable {
        secret_id: String,
        project_id: String,
        attempts: Vec<ProviderAttempt>,
    },

    #[error("no credential providers are configured")]
    NoProviders,
}

fn join_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, secret: &SecretRef) -> Result<Credential, ProviderFailure>;
}

/// A credential handed to the process ahead of time, usually through
/// `DATABASE_PASSWORD`.
#[derive(Clone, Default)]
pub struct InjectedCredential {
    value: Option<Credential>,
}

impl InjectedCredential {
    pub fn new(value: Option<String>) -> Self {
        Self {
            value: value.map(Credential::new),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(PASSWORD_ENV_VAR).ok())
    }
}

impl fmt::Debug for InjectedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedCredential")
            .field("present", &self.value.is_some())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for InjectedCredential {
    fn name(&self) -> &'static str {
        "injected"
    }

    async fn attempt(&self, _secret: &SecretRef) -> Result<Credential, ProviderFailure> {
        match &self.value {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(ProviderFailure::new(
                FailureKind::Missing,
                format!("{PASSWORD_ENV_VAR} is not set"),
            )),
        }
    }
}

/// Reads the latest secret version through the `gcloud` CLI.
#[derive(Debug, Clone)]
pub struct GcloudSecretProvider {
    program: String,
    timeout: Duration,
}

impl Default for GcloudSecretProvider {
    fn default() -> Self {
        Self {
            program: "gcloud".to_string(),
            timeout: SECRET_ACCESS_TIMEOUT,
        }
    }
}

impl GcloudSecretProvider {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialProvider for GcloudSecretProvider {
    fn name(&self) -> &'static str {
        "gcloud"
    }

    async fn attempt(&self, secret: &SecretRef) -> Result<Credential, ProviderFailure> {
        let mut command = Command::new(&self.program);
        command
            .args(["secrets", "versions", "access", "latest", "--secret"])
            .arg(&secret.secret_id)
            .arg("--project")
            .arg(&secret.project_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(secret_id = %secret.secret_id, program = %self.program, "requesting secret");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(ProviderFailure::new(
                    FailureKind::Unavailable,
                    format!("failed to launch {}: {err}", self.program),
                ))
            }
            Err(_) => {
                return Err(ProviderFailure::new(
                    FailureKind::Timeout,
                    format!("secret access timed out after {:?}", self.timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderFailure::new(classify_stderr(&stderr), stderr));
        }

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            return Err(ProviderFailure::new(
                FailureKind::Unavailable,
                "secret payload was empty",
            ));
        }
        Ok(Credential::new(value))
    }
}

fn classify_stderr(stderr: &str) -> FailureKind {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission_denied") || lowered.contains("permission denied") {
        FailureKind::AccessDenied
    } else if lowered.contains("not_found") || lowered.contains("not found") {
        FailureKind::NotFound
    } else {
        FailureKind::Unavailable
    }
}

pub struct SecretResolver {
    secret: SecretRef,
    providers: Vec<Box<dyn CredentialProvider>>,
    resolved: OnceCell<Credential>,
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretResolver")
            .field("secret", &self.secret)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("resolved", &self.resolved.initialized())
            .finish()
    }
}

impl SecretResolver {
    pub fn new(secret: SecretRef, providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self {
            secret,
            providers,
            resolved: OnceCell::new(),
        }
    }

    /// Environment variable first, then the secret service.
    pub fn with_default_providers(secret: SecretRef) -> Self {
        Self::new(
            secret,
            vec![
                Box::new(InjectedCredential::from_env()),
                Box::new(GcloudSecretProvider::default()),
            ],
        )
    }

    pub fn secret(&self) -> &SecretRef {
        &self.secret
    }

    pub async fn resolve(&self) -> Result<Credential, SecretError> {
        self.resolved
            .get_or_try_init(|| self.resolve_uncached())
            .await
            .cloned()
    }

    async fn resolve_uncached(&self) -> Result<Credential, SecretError> {
        if self.providers.is_empty() {
            return Err(SecretError::NoProviders);
        }

        let mut attempts = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            match provider.attempt(&self.secret).await {
                Ok(credential) => {
                    info!(
                        provider = provider.name(),
                        secret_id = %self.secret.secret_id,
                        "resolved reference store credential"
                    );
                    return Ok(credential);
                }
                Err(failure) => {
                    if failure.kind != FailureKind::Missing {
                        warn!(
                            provider = provider.name(),
                            kind = ?failure.kind,
                            "credential provider failed: {}",
                            failure.message
                        );
                    }
                    attempts.push(ProviderAttempt {
                        provider: provider.name(),
                        failure,
                    });
                }
            }
        }

        Err(SecretError::CredentialUnavailable {
            secret_id: self.secret.secret_id.clone(),
            project_id: self.secret.project_id.clone(),
            attempts,
        })
    }
}

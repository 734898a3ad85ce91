use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use salesflow_core::secrets::{
    Credential, CredentialProvider, FailureKind, GcloudSecretProvider, InjectedCredential,
    ProviderFailure, SecretError, SecretRef, SecretResolver,
};

struct CountingProvider {
    calls: Arc<AtomicUsize>,
    value: &'static str,
}

#[async_trait]
impl CredentialProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn attempt(&self, _secret: &SecretRef) -> Result<Credential, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new(self.value))
    }
}

fn secret() -> SecretRef {
    SecretRef::new("sql-password", "acme-analytics")
}

#[tokio::test]
async fn injected_value_short_circuits_external_lookup() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = SecretResolver::new(
        secret(),
        vec![
            Box::new(InjectedCredential::new(Some("from-env".into()))),
            Box::new(CountingProvider {
                calls: Arc::clone(&calls),
                value: "from-service",
            }),
        ],
    );

    let credential = resolver.resolve().await?;
    assert_eq!(credential.expose(), "from-env");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn whitespace_injected_password_is_used_verbatim() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = SecretResolver::new(
        secret(),
        vec![
            Box::new(InjectedCredential::new(Some("  ".into()))),
            Box::new(CountingProvider {
                calls: Arc::clone(&calls),
                value: "from-service",
            }),
        ],
    );

    let credential = resolver.resolve().await?;
    assert_eq!(credential.expose(), "  ");
    assert!(!credential.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn missing_injection_falls_back_and_caches() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = SecretResolver::new(
        secret(),
        vec![
            Box::new(InjectedCredential::new(None)),
            Box::new(CountingProvider {
                calls: Arc::clone(&calls),
                value: "from-service",
            }),
        ],
    );

    assert_eq!(resolver.resolve().await?.expose(), "from-service");
    assert_eq!(resolver.resolve().await?.expose(), "from-service");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second resolve must hit the cache");
    Ok(())
}

#[tokio::test]
async fn unlaunchable_secret_tool_yields_credential_unavailable() -> Result<()> {
    let resolver = SecretResolver::new(
        secret(),
        vec![
            Box::new(InjectedCredential::new(Some(String::new()))),
            Box::new(
                GcloudSecretProvider::default().with_program("/nonexistent/salesflow-gcloud"),
            ),
        ],
    );

    match resolver.resolve().await {
        Err(SecretError::CredentialUnavailable {
            secret_id,
            project_id,
            attempts,
        }) => {
            assert_eq!(secret_id, "sql-password");
            assert_eq!(project_id, "acme-analytics");
            let kinds: Vec<_> = attempts.iter().map(|a| (a.provider, a.failure.kind)).collect();
            assert_eq!(
                kinds,
                vec![
                    ("injected", FailureKind::Missing),
                    ("gcloud", FailureKind::Unavailable)
                ]
            );
        }
        other => panic!("expected CredentialUnavailable, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn empty_provider_list_is_an_error() {
    let resolver = SecretResolver::new(secret(), Vec::new());
    assert!(matches!(resolver.resolve().await, Err(SecretError::NoProviders)));
}

#[cfg(unix)]
mod scripted {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &tempfile::TempDir, body: &str) -> Result<PathBuf> {
        let path = dir.path().join("fake-gcloud");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn resolver_for(program: PathBuf, timeout: Duration) -> SecretResolver {
        SecretResolver::new(
            secret(),
            vec![Box::new(
                GcloudSecretProvider::default()
                    .with_program(program.to_string_lossy())
                    .with_timeout(timeout),
            )],
        )
    }

    #[tokio::test]
    async fn reads_secret_from_tool_stdout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let program = script(&dir, r#"[ "$6" = "sql-password" ] && [ "$8" = "acme-analytics" ] && echo "s3cret""#)?;

        let credential = resolver_for(program, Duration::from_secs(10)).resolve().await?;
        assert_eq!(credential.expose(), "s3cret");
        Ok(())
    }

    #[tokio::test]
    async fn slow_tool_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let program = script(&dir, "sleep 5\necho late")?;

        let err = resolver_for(program, Duration::from_millis(200))
            .resolve()
            .await
            .unwrap_err();
        match err {
            SecretError::CredentialUnavailable { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].failure.kind, FailureKind::Timeout);
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn permission_denied_is_classified() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let program = script(
            &dir,
            "echo 'ERROR: PERMISSION_DENIED: caller lacks secretAccessor' >&2\nexit 1",
        )?;

        let err = resolver_for(program, Duration::from_secs(10))
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SecretError::CredentialUnavailable { ref attempts, .. }
                if attempts[0].failure.kind == FailureKind::AccessDenied
        ));
        Ok(())
    }
}

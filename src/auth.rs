//! # Service credential lifecycle
//!
//! Two tokens are tracked: the service-access token handed out by the
//! registration service, and the self-signed chain-registration token sent
//! with each registration. One `register` call replaces both together.
//!
//! Refresh rules:
//!
//! - a token is due once less than `refresh_window` remains before expiry
//! - refreshes are serialized by `refresh_lock`; callers that queue behind an
//!   in-flight refresh re-check freshness and reuse its result
//! - a failed refresh keeps the old access token in use until it expires,
//!   after which [`AuthTokenManager::ensure_fresh`] returns `AuthExpired`
//! - failed attempts back off for [`REFRESH_RETRY`] unless the credential was
//!   rejected outright ([`AuthTokenManager::invalidate`])

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ValidatorError;
use crate::messages::RegisterRequest;
use crate::protocols::{RegistrationService, RegistrationSigner};
use crate::registry::Uid;

/// Back-off after a failed refresh while the old token is still usable.
pub const REFRESH_RETRY: Duration = Duration::from_secs(30);

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render a secret for logs.
pub fn redact(secret: &str) -> String {
    format!("***({})", secret.len())
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub subject: String,
    /// Unix seconds.
    pub expires_at: u64,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &redact(&self.value))
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AuthToken {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn needs_refresh(&self, now: u64, window: Duration) -> bool {
        self.expires_at.saturating_sub(now) < window.as_secs()
    }
}

/// Fixed identity fields sent with every registration.
#[derive(Clone, Debug)]
pub struct RegistrationProfile {
    pub uid: Uid,
    pub chain: String,
    pub netuid: u16,
    pub neuron_type: String,
}

/// On-disk form of the credential cache.
#[derive(Serialize, Deserialize)]
struct CachedCredential {
    access: AuthToken,
    #[serde(default)]
    registration: Option<AuthToken>,
}

#[derive(Default)]
struct TokenPair {
    access: Option<AuthToken>,
    registration: Option<AuthToken>,
    retry_after: u64,
}

pub struct AuthTokenManager {
    service: Arc<dyn RegistrationService>,
    signer: Arc<dyn RegistrationSigner>,
    profile: RegistrationProfile,
    token_ttl: Duration,
    refresh_window: Duration,
    tokens: RwLock<TokenPair>,
    refresh_lock: Mutex<()>,
}

impl AuthTokenManager {
    pub fn new(
        service: Arc<dyn RegistrationService>,
        signer: Arc<dyn RegistrationSigner>,
        profile: RegistrationProfile,
        token_ttl: Duration,
        refresh_window: Duration,
    ) -> Self {
        Self {
            service,
            signer,
            profile,
            token_ttl,
            refresh_window,
            tokens: RwLock::new(TokenPair::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current service-access token, whether or not it is due for refresh.
    pub async fn current(&self) -> Option<AuthToken> {
        self.tokens.read().await.access.clone()
    }

    pub async fn registration_token(&self) -> Option<AuthToken> {
        self.tokens.read().await.registration.clone()
    }

    pub async fn ensure_fresh(&self) -> Result<String, ValidatorError> {
        self.ensure_fresh_at(unix_now()).await
    }

    /// Return a usable credential, refreshing first if one is due.
    pub async fn ensure_fresh_at(&self, now: u64) -> Result<String, ValidatorError> {
        if let Some(value) = self.fresh_value(now).await {
            return Ok(value);
        }

        let _refreshing = self.refresh_lock.lock().await;
        if let Some(value) = self.fresh_value(now).await {
            return Ok(value);
        }

        let retry_after = self.tokens.read().await.retry_after;
        if now >= retry_after {
            if let Err(e) = self.refresh_locked(now).await {
                self.tokens.write().await.retry_after = now + REFRESH_RETRY.as_secs();
                warn!(error = %e, "credential refresh failed");
            }
        } else {
            debug!(retry_in = retry_after - now, "credential refresh backing off");
        }

        self.usable_value(now).await.ok_or(ValidatorError::AuthExpired)
    }

    /// Refresh regardless of remaining lifetime.
    pub async fn refresh_now(&self) -> Result<()> {
        let _refreshing = self.refresh_lock.lock().await;
        self.refresh_locked(unix_now()).await
    }

    /// Drop the access token after the service rejected it, so the next
    /// [`ensure_fresh`](Self::ensure_fresh) refreshes immediately.
    pub async fn invalidate(&self) {
        let mut tokens = self.tokens.write().await;
        if let Some(access) = tokens.access.as_mut() {
            access.expires_at = 0;
        }
        tokens.retry_after = 0;
        info!("service credential invalidated");
    }

    async fn fresh_value(&self, now: u64) -> Option<String> {
        let tokens = self.tokens.read().await;
        let access = tokens.access.as_ref()?;
        let registration = tokens.registration.as_ref()?;
        if access.needs_refresh(now, self.refresh_window)
            || registration.needs_refresh(now, self.refresh_window)
        {
            return None;
        }
        Some(access.value.clone())
    }

    async fn usable_value(&self, now: u64) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens
            .access
            .as_ref()
            .filter(|t| !t.is_expired(now))
            .map(|t| t.value.clone())
    }

    /// Caller holds `refresh_lock`.
    async fn refresh_locked(&self, now: u64) -> Result<()> {
        let mut request = RegisterRequest {
            uid: self.profile.uid,
            chain: self.profile.chain.clone(),
            netuid: self.profile.netuid,
            neuron_type: self.profile.neuron_type.clone(),
            account: self.signer.account(),
            token: String::new(),
        };
        request.token = self
            .signer
            .registration_token(&request, now)
            .context("failed to sign registration token")?;
        let registration = AuthToken {
            value: request.token.clone(),
            subject: request.account.clone(),
            expires_at: now + self.token_ttl.as_secs(),
        };

        let bearer = self.usable_value(now).await.unwrap_or_default();
        let response = self
            .service
            .register(&bearer, &request)
            .await
            .context("registration call failed")?;

        let (Some(value), Some(expires_at), true) =
            (response.access_token, response.exp, response.success)
        else {
            return Err(anyhow!("registration rejected by service"));
        };
        if expires_at <= now {
            return Err(anyhow!("registration returned an already expired token"));
        }

        let access = AuthToken { value, subject: request.account, expires_at };
        info!(
            uid = self.profile.uid,
            token = %redact(&access.value),
            expires_at,
            "service credential refreshed"
        );
        let mut tokens = self.tokens.write().await;
        tokens.access = Some(access);
        tokens.registration = Some(registration);
        tokens.retry_after = 0;
        Ok(())
    }

    /// Seed both tokens from a previous run. An unexpired pair that is not
    /// yet due for refresh is used as is, without a registration call.
    pub async fn restore(&self, path: &Path) -> Result<bool> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let cached: CachedCredential =
            serde_json::from_slice(&raw).context("malformed credential file")?;
        let now = unix_now();
        if cached.access.is_expired(now) {
            debug!(path = %path.display(), "stored credential already expired");
            return Ok(false);
        }
        debug!(path = %path.display(), token = ?cached.access, "restored service credential");
        let mut tokens = self.tokens.write().await;
        tokens.access = Some(cached.access);
        tokens.registration = cached.registration.filter(|t| !t.is_expired(now));
        Ok(true)
    }

    /// Write both tokens, owner-readable only.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let cached = {
            let tokens = self.tokens.read().await;
            let Some(access) = tokens.access.clone() else {
                return Ok(());
            };
            CachedCredential { access, registration: tokens.registration.clone() }
        };
        let bytes = serde_json::to_vec(&cached)?;
        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
        }
        .with_context(|| format!("failed to open {}", path.display()))?;
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::messages::RegisterResponse;

    const NOW: u64 = 1_700_000_000;

    #[derive(Default)]
    struct FakeRegistrar {
        calls: AtomicUsize,
        failing: AtomicBool,
        lifetime: u64,
        bearers: std::sync::Mutex<Vec<String>>,
    }

    impl FakeRegistrar {
        fn with_lifetime(lifetime: u64) -> Self {
            Self { lifetime, ..Default::default() }
        }
    }

    #[async_trait]
    impl RegistrationService for FakeRegistrar {
        async fn register(&self, credential: &str, request: &RegisterRequest) -> Result<RegisterResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.bearers.lock().unwrap().push(credential.to_string());
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("service down"));
            }
            assert!(request.token.starts_with("signed:"));
            let issued_at: u64 = request.token.rsplit(':').next().unwrap().parse().unwrap();
            Ok(RegisterResponse {
                access_token: Some(format!("access-{n}")),
                exp: Some(issued_at + self.lifetime),
                success: true,
            })
        }
    }

    struct FakeSigner;

    impl RegistrationSigner for FakeSigner {
        fn account(&self) -> String {
            "acct".into()
        }

        fn registration_token(&self, request: &RegisterRequest, issued_at: u64) -> Result<String> {
            Ok(format!("signed:{}:{issued_at}", request.uid))
        }
    }

    fn manager(registrar: Arc<FakeRegistrar>) -> AuthTokenManager {
        AuthTokenManager::new(
            registrar,
            Arc::new(FakeSigner),
            RegistrationProfile {
                uid: 9,
                chain: "bittensor".into(),
                netuid: 2,
                neuron_type: "validator".into(),
            },
            Duration::from_secs(1800),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let registrar = Arc::new(FakeRegistrar::with_lifetime(3600));
        let auth = Arc::new(manager(registrar.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.ensure_fresh_at(NOW).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "access-1");
        }
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_inside_window_only() {
        let registrar = Arc::new(FakeRegistrar::with_lifetime(3600));
        let auth = manager(registrar.clone());

        auth.ensure_fresh_at(NOW).await.unwrap();
        // Registration token lives 1800s, window is 300s.
        auth.ensure_fresh_at(NOW + 1400).await.unwrap();
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);

        let value = auth.ensure_fresh_at(NOW + 1550).await.unwrap();
        assert_eq!(value, "access-2");
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
        assert_eq!(registrar.bearers.lock().unwrap()[1], "access-1");
    }

    #[tokio::test]
    async fn failed_refresh_fails_open_until_expiry() {
        let registrar = Arc::new(FakeRegistrar::with_lifetime(600));
        let auth = manager(registrar.clone());
        auth.ensure_fresh_at(NOW).await.unwrap();

        registrar.failing.store(true, Ordering::SeqCst);
        // Due for refresh (less than 300s left) but still valid.
        assert_eq!(auth.ensure_fresh_at(NOW + 400).await.unwrap(), "access-1");
        // Past expiry: fail closed.
        let err = auth.ensure_fresh_at(NOW + 700).await.unwrap_err();
        assert!(matches!(err, ValidatorError::AuthExpired));
    }

    #[tokio::test]
    async fn failed_refresh_backs_off() {
        let registrar = Arc::new(FakeRegistrar::with_lifetime(600));
        let auth = manager(registrar.clone());
        auth.ensure_fresh_at(NOW).await.unwrap();
        registrar.failing.store(true, Ordering::SeqCst);

        auth.ensure_fresh_at(NOW + 400).await.unwrap();
        auth.ensure_fresh_at(NOW + 405).await.unwrap();
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
        auth.ensure_fresh_at(NOW + 431).await.unwrap();
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidate_forces_immediate_refresh() {
        let registrar = Arc::new(FakeRegistrar::with_lifetime(3600));
        let auth = manager(registrar.clone());
        auth.ensure_fresh_at(NOW).await.unwrap();

        auth.invalidate().await;
        assert_eq!(auth.ensure_fresh_at(NOW + 1).await.unwrap(), "access-2");

        registrar.failing.store(true, Ordering::SeqCst);
        auth.invalidate().await;
        let err = auth.ensure_fresh_at(NOW + 2).await.unwrap_err();
        assert!(matches!(err, ValidatorError::AuthExpired));
    }

    #[tokio::test]
    async fn credential_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        let registrar = Arc::new(FakeRegistrar::with_lifetime(1_000_000_000));

        let auth = manager(registrar.clone());
        auth.refresh_now().await.unwrap();
        auth.persist(&path).await.unwrap();

        let restarted = manager(registrar.clone());
        assert!(restarted.restore(&path).await.unwrap());
        assert_eq!(restarted.current().await, auth.current().await);
        assert_eq!(restarted.registration_token().await, auth.registration_token().await);
        assert!(!format!("{:?}", auth.current().await.unwrap()).contains("access-"));

        // The restored pair is fresh, so no registration call is needed.
        assert_eq!(restarted.ensure_fresh().await.unwrap(), "access-1");
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_without_registration_token_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        let registrar = Arc::new(FakeRegistrar::with_lifetime(1_000_000_000));
        let access = AuthToken { value: "old-access".into(), subject: "acct".into(), expires_at: u64::MAX };
        std::fs::write(&path, serde_json::json!({ "access": access }).to_string()).unwrap();

        let auth = manager(registrar.clone());
        assert!(auth.restore(&path).await.unwrap());
        assert_eq!(auth.ensure_fresh().await.unwrap(), "access-1");
        assert_eq!(registrar.bearers.lock().unwrap()[0], "old-access");
    }
}

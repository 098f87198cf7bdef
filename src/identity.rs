//! # Node signing identity
//!
//! An Ed25519 keypair stored as 32 raw secret bytes in an owner-only file.
//! The account string is the hex public key.
//!
//! Registration tokens have the form
//!
//! ```text
//! <hex pubkey>.<issued_at unix secs>.<hex signature>
//! ```
//!
//! where the signature covers [`REGISTRATION_SIGNATURE_DOMAIN`] followed by
//! the registration fields and the issue time, so a token cannot be replayed
//! for a different uid, subnet or neuron type.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::messages::RegisterRequest;
use crate::protocols::RegistrationSigner;

/// Domain separation prefix for registration signatures.
pub const REGISTRATION_SIGNATURE_DOMAIN: &[u8] = b"peerscore-register-v1:";

pub struct Keypair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("account", &self.account_hex()).finish()
    }
}

impl Keypair {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(bytes) }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn account_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
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
        .with_context(|| format!("failed to open key file {}", path.display()))?;
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open key file {}", path.display()))?;
        file.write_all(&self.signing_key.to_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("invalid key file: expected 32 bytes"))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let keypair = Self::load(path)?;
            info!(account = %keypair.account_hex(), path = %path.display(), "loaded signing key");
            Ok(keypair)
        } else {
            let keypair = Self::generate();
            keypair.save(path)?;
            info!(account = %keypair.account_hex(), path = %path.display(), "generated signing key");
            Ok(keypair)
        }
    }

    fn sign(&self, message: &[u8]) -> Signature {
        let mut prefixed = Vec::with_capacity(REGISTRATION_SIGNATURE_DOMAIN.len() + message.len());
        prefixed.extend_from_slice(REGISTRATION_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(message);
        self.signing_key.sign(&prefixed)
    }
}

fn registration_message(request: &RegisterRequest, issued_at: u64) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}|{}|{}",
        request.uid, request.chain, request.netuid, request.neuron_type, request.account, issued_at
    )
    .into_bytes()
}

impl RegistrationSigner for Keypair {
    fn account(&self) -> String {
        self.account_hex()
    }

    fn registration_token(&self, request: &RegisterRequest, issued_at: u64) -> Result<String> {
        if request.account != self.account_hex() {
            bail!("registration account does not match signing key");
        }
        let signature = self.sign(&registration_message(request, issued_at));
        Ok(format!(
            "{}.{}.{}",
            self.account_hex(),
            issued_at,
            hex::encode(signature.to_bytes())
        ))
    }
}

/// Check a registration token against `request`. Returns the issue time.
pub fn verify_registration_token(token: &str, request: &RegisterRequest) -> Result<u64> {
    let mut parts = token.splitn(3, '.');
    let (Some(account), Some(issued_at), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("registration token must have three parts");
    };
    if account != request.account {
        bail!("registration token signed by a different account");
    }
    let issued_at: u64 = issued_at.parse().context("bad issue time")?;

    let key_bytes: [u8; 32] = hex::decode(account)
        .context("bad account encoding")?
        .try_into()
        .map_err(|_| anyhow!("account must be 32 bytes"))?;
    let sig_bytes: [u8; 64] = hex::decode(signature)
        .context("bad signature encoding")?
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes"))?;
    let key = VerifyingKey::from_bytes(&key_bytes).context("invalid public key")?;

    let mut prefixed = REGISTRATION_SIGNATURE_DOMAIN.to_vec();
    prefixed.extend_from_slice(&registration_message(request, issued_at));
    key.verify(&prefixed, &Signature::from_bytes(&sig_bytes))
        .context("registration signature invalid")?;
    Ok(issued_at)
}

use anyhow::{anyhow, bail, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const PUBLIC_KEY_BYTES: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
pub const SECRET_KEY_BYTES: usize = ed25519_dalek::SECRET_KEY_LENGTH;

/// Wallet identifiers are the hex SHA-256 of the owner's public key.
pub type WalletId = String;

/// SHA-256 over arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Lowercase hex SHA-256, the encoding used for block hashes and Merkle roots.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

pub fn wallet_id_from_pk(pk: &VerifyingKey) -> WalletId {
    sha256_hex(pk.as_bytes())
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn signing_key_from_hex(hex_sk: &str) -> Result<SigningKey> {
    let bytes = Zeroizing::new(hex::decode(hex_sk.trim()).context("secret key is not valid hex")?);
    let arr: [u8; SECRET_KEY_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("secret key must be {} bytes, got {}", SECRET_KEY_BYTES, bytes.len()))?;
    Ok(SigningKey::from_bytes(&arr))
}

pub fn verifying_key_from_hex(hex_pk: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_pk.trim()).context("public key is not valid hex")?;
    let arr: [u8; PUBLIC_KEY_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("public key must be {} bytes, got {}", PUBLIC_KEY_BYTES, bytes.len()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| anyhow!("invalid public key: {}", e))
}

/// Signs `message` and returns the hex-encoded detached signature.
pub fn sign(sk: &SigningKey, message: &[u8]) -> String {
    hex::encode(sk.sign(message).to_bytes())
}

/// Verifies a hex signature; malformed hex or length counts as a failure.
pub fn verify(pk: &VerifyingKey, message: &[u8], sig_hex: &str) -> bool {
    let Ok(bytes) = hex::decode(sig_hex) else { return false };
    let Ok(sig) = Signature::from_slice(&bytes) else { return false };
    pk.verify(message, &sig).is_ok()
}

// -----------------------------------------------------------------------------
// Secret key resolution for the CLI (cached once per process)
// -----------------------------------------------------------------------------
static SECRET_KEY_HEX: OnceCell<Zeroizing<String>> = OnceCell::new();

/// Obtain the sender's hex secret key.
/// Source order:
///   1) LEDGER_SECRET_KEY env var
///   2) Interactive prompt (only once per process)
/// Non-interactive without env returns an error.
pub fn secret_key_from_env_or_prompt(prompt: Option<&str>) -> Result<SigningKey> {
    if let Some(existing) = SECRET_KEY_HEX.get() {
        return signing_key_from_hex(existing);
    }
    let hex_sk = if let Ok(val) = std::env::var("LEDGER_SECRET_KEY") {
        Zeroizing::new(val)
    } else if atty::is(atty::Stream::Stdin) {
        let text = prompt.unwrap_or("Enter wallet secret key (hex): ");
        Zeroizing::new(rpassword::prompt_password(text)?)
    } else {
        bail!("LEDGER_SECRET_KEY is required in non-interactive mode")
    };
    let sk = signing_key_from_hex(&hex_sk)?;
    let _ = SECRET_KEY_HEX.set(hex_sk);
    Ok(sk)
}

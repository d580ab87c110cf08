//! ED25519 request signing for Backpack's authenticated channels.
//!
//! Every private REST instruction and the stream subscribe handshake are
//! signed the same way: URL-encode the key-sorted parameter map together
//! with the instruction name, timestamp and receive window, sign the
//! resulting string with the account's ED25519 key, and transmit the
//! base64 signature next to the base64 verifying key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer as _, SigningKey};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::SignerError;

/// Receive window sent with every signed request, in milliseconds.
pub const SIGNING_WINDOW_MS: u64 = 5_000;

/// Transport-ready authentication fields for one signed request.
#[derive(Clone, Debug)]
pub struct SignedHeaders {
    pub api_key: String,
    pub timestamp: String,
    pub window: String,
    pub signature: String,
}

/// Signature material for the stream subscribe handshake.
#[derive(Clone, Debug)]
pub struct SubscribeSignature {
    pub verifying_key: String,
    pub signature: String,
    pub timestamp: String,
    pub window: String,
}

/// Seam between the trading components and the concrete key handling, so
/// tests and alternative key stores can inject their own implementation.
pub trait InstructionSigner: Send + Sync {
    /// Sign `instruction` with the given parameters, producing the header
    /// set for a private REST call.
    fn sign(&self, instruction: &str, params: &[(String, String)]) -> SignedHeaders;

    /// Sign the `subscribe` handshake for the private event stream.
    fn subscribe_signature(&self) -> SubscribeSignature;
}

/// ED25519 signer over a base64-encoded 32-byte seed, as issued by the
/// exchange.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key_b64: String,
}

impl Ed25519Signer {
    pub fn from_base64_secret(secret: &str) -> Result<Self, SignerError> {
        let seed = BASE64.decode(secret.trim())?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| SignerError::InvalidSecret("expected a 32-byte ED25519 seed".into()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key_b64 = BASE64.encode(signing_key.verifying_key().to_bytes());
        Ok(Self {
            signing_key,
            verifying_key_b64,
        })
    }

    pub fn verifying_key(&self) -> &str {
        &self.verifying_key_b64
    }

    fn sign_message(&self, message: &str) -> String {
        let signature = self.signing_key.sign(message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

impl InstructionSigner for Ed25519Signer {
    fn sign(&self, instruction: &str, params: &[(String, String)]) -> SignedHeaders {
        let timestamp = now_millis().to_string();
        let window = SIGNING_WINDOW_MS.to_string();
        let message = signing_payload(instruction, params, &timestamp, &window);
        SignedHeaders {
            api_key: self.verifying_key_b64.clone(),
            signature: self.sign_message(&message),
            timestamp,
            window,
        }
    }

    fn subscribe_signature(&self) -> SubscribeSignature {
        let timestamp = now_millis().to_string();
        let window = SIGNING_WINDOW_MS.to_string();
        let message = format!("instruction=subscribe&timestamp={timestamp}&window={window}");
        SubscribeSignature {
            verifying_key: self.verifying_key_b64.clone(),
            signature: self.sign_message(&message),
            timestamp,
            window,
        }
    }
}

/// Builds the canonical signing string: instruction first, then the
/// parameters sorted by key, then timestamp and window, URL-encoded.
fn signing_payload(
    instruction: &str,
    params: &[(String, String)],
    timestamp: &str,
    window: &str,
) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.append_pair("instruction", instruction);
    for (key, value) in sorted {
        serializer.append_pair(key, value);
    }
    serializer.append_pair("timestamp", timestamp);
    serializer.append_pair("window", window);
    serializer.finish()
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// Resume tokens: a signed, opaque capture of the table state needed to
// reattach a session to a fresh transport. The kernel defines the shape and
// the signing; storage and TTL policy belong to the caller.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::AllocatorWatermarks;

pub const SNAPSHOT_VERSION: u32 = 1;

/// One import-table entry as captured for resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSnapshot {
    pub id: i64,
    pub refcount: u32,
    pub introductions: u32,
}

/// One export-table entry as captured for resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub id: i64,
    pub introductions: u32,
}

/// Everything needed to rebuild the tables on a new transport. Hooks are
/// not captured; re-binding IDs to live objects is the resuming host's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: String,
    pub allocator: AllocatorWatermarks,
    pub imports: Vec<ImportSnapshot>,
    pub exports: Vec<ExportSnapshot>,
}

/// Opaque token handed to the peer or stored alongside the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    /// Base64 of the signed snapshot envelope.
    pub token_data: String,
    pub session_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeTokenError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
    #[error("token is not valid base64 or JSON")]
    Malformed,
    #[error("token signature mismatch")]
    SignatureMismatch,
    #[error("token expired at {0}")]
    Expired(u64),
    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    snapshot: SessionSnapshot,
    issued_at: u64,
    expires_at: u64,
    signature: String,
}

/// Issues and verifies resume tokens with a shared secret.
#[derive(Debug)]
pub struct ResumeTokenManager {
    secret: Vec<u8>,
    ttl_seconds: u64,
}

impl ResumeTokenManager {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            ttl_seconds: 3600,
        }
    }

    pub fn with_ttl(secret: Vec<u8>, ttl_seconds: u64) -> Self {
        Self {
            secret,
            ttl_seconds,
        }
    }

    pub fn generate_secret_key() -> Vec<u8> {
        use rand::RngCore;
        let mut key = vec![0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    pub fn issue(&self, snapshot: SessionSnapshot) -> Result<ResumeToken, ResumeTokenError> {
        let issued_at = unix_now();
        let expires_at = issued_at + self.ttl_seconds;
        let session_id = snapshot.session_id.clone();

        let signature = self.sign(&snapshot, issued_at, expires_at)?;
        let envelope = Envelope {
            snapshot,
            issued_at,
            expires_at,
            signature,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| ResumeTokenError::Serialization(e.to_string()))?;

        Ok(ResumeToken {
            token_data: URL_SAFE_NO_PAD.encode(bytes),
            session_id,
            issued_at,
            expires_at,
        })
    }

    /// Check signature and expiry, returning the embedded snapshot.
    pub fn verify(&self, token_data: &str) -> Result<SessionSnapshot, ResumeTokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token_data)
            .map_err(|_| ResumeTokenError::Malformed)?;
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|_| ResumeTokenError::Malformed)?;

        if envelope.snapshot.version != SNAPSHOT_VERSION {
            return Err(ResumeTokenError::UnsupportedVersion(envelope.snapshot.version));
        }

        let expected = self.sign(&envelope.snapshot, envelope.issued_at, envelope.expires_at)?;
        if expected != envelope.signature {
            return Err(ResumeTokenError::SignatureMismatch);
        }
        if unix_now() >= envelope.expires_at {
            return Err(ResumeTokenError::Expired(envelope.expires_at));
        }
        Ok(envelope.snapshot)
    }

    fn sign(
        &self,
        snapshot: &SessionSnapshot,
        issued_at: u64,
        expires_at: u64,
    ) -> Result<String, ResumeTokenError> {
        let payload = serde_json::to_vec(snapshot)
            .map_err(|e| ResumeTokenError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(issued_at.to_be_bytes());
        hasher.update(expires_at.to_be_bytes());
        hasher.update(&payload);
        Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: "sess-1".to_string(),
            allocator: AllocatorWatermarks {
                next_import: 4,
                next_export: -2,
                next_inbound_push: 3,
            },
            imports: vec![ImportSnapshot {
                id: 1,
                refcount: 2,
                introductions: 1,
            }],
            exports: vec![ExportSnapshot {
                id: -1,
                introductions: 2,
            }],
        }
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let manager = ResumeTokenManager::new(ResumeTokenManager::generate_secret_key());
        let token = manager.issue(snapshot()).unwrap();
        let restored = manager.verify(&token.token_data).unwrap();
        assert_eq!(restored, snapshot());
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let manager = ResumeTokenManager::new(b"secret".to_vec());
        let token = manager.issue(snapshot()).unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&token.token_data).unwrap();
        // Flip a byte inside the payload.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x20;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        assert!(matches!(
            manager.verify(&tampered),
            Err(ResumeTokenError::SignatureMismatch) | Err(ResumeTokenError::Malformed)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = ResumeTokenManager::new(b"alpha".to_vec());
        let verifier = ResumeTokenManager::new(b"beta".to_vec());
        let token = issuer.issue(snapshot()).unwrap();
        assert!(matches!(
            verifier.verify(&token.token_data),
            Err(ResumeTokenError::SignatureMismatch)
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let manager = ResumeTokenManager::with_ttl(b"secret".to_vec(), 0);
        let token = manager.issue(snapshot()).unwrap();
        assert!(matches!(
            manager.verify(&token.token_data),
            Err(ResumeTokenError::Expired(_))
        ));
    }
}

// Request signing/verification (§4.8 Authentication). Every sync request
// carries device id, unix timestamp, a random nonce, and an ed25519
// signature over `method\nurl\ntimestamp\nnonce\nSHA-256(body)`. Verifying
// a request means: the device is a pinned peer, its current public key
// still matches the fingerprint pinned at pairing time, the signature
// checks out, the timestamp is within the clock-skew window, and the
// nonce hasn't been seen before.

use crate::db::sync::check_and_record_nonce;
use crate::db::types::SyncPeer;
use crate::error::{Error, Result};
use crate::identity::{decode_public_key, fingerprint_of, DeviceIdentity};
use base64::Engine;
use ed25519_dalek::{Signature, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

pub const DEVICE_ID_HEADER: &str = "x-codemem-device-id";
pub const TIMESTAMP_HEADER: &str = "x-codemem-timestamp";
pub const NONCE_HEADER: &str = "x-codemem-nonce";
pub const SIGNATURE_HEADER: &str = "x-codemem-signature";

const CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub device_id: String,
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

fn signing_string(method: &str, url: &str, timestamp: &str, nonce: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let body_hash = hex::encode(hasher.finalize());
    format!("{method}\n{url}\n{timestamp}\n{nonce}\n{body_hash}")
}

pub fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the four `X-Codemem-*` header values for an outbound request.
pub fn sign(identity: &DeviceIdentity, method: &str, url: &str, body: &[u8]) -> RequestAuth {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let nonce = random_nonce();
    let message = signing_string(method, url, &timestamp, &nonce, body);
    let signature = identity.sign(message.as_bytes());
    RequestAuth {
        device_id: identity.device_id.clone(),
        timestamp,
        nonce,
        signature: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signature),
    }
}

/// Verify an inbound request against its claimed peer. `url` is the
/// request's path and query exactly as received, matching what the caller
/// signed (`request.uri()`'s string form on the server side).
pub fn verify(conn: &Connection, auth: &RequestAuth, method: &str, url: &str, body: &[u8]) -> Result<SyncPeer> {
    let peer = crate::db::sync::get_peer(conn, &auth.device_id)?
        .ok_or_else(|| Error::Unauthorized(format!("unknown peer {}", auth.device_id)))?;

    let public_key = decode_public_key(&peer.public_key)?;
    if fingerprint_of(&public_key) != peer.pinned_fingerprint {
        return Err(Error::Forbidden(
            "peer public key no longer matches its pinned fingerprint".to_string(),
        ));
    }

    let timestamp: i64 = auth
        .timestamp
        .parse()
        .map_err(|_| Error::Unauthorized("malformed timestamp".to_string()))?;
    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > CLOCK_SKEW_SECS {
        return Err(Error::Unauthorized("timestamp outside acceptable clock skew".to_string()));
    }

    let signature_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(&auth.signature)
        .map_err(|_| Error::Unauthorized("malformed signature encoding".to_string()))?;
    let signature_bytes: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| Error::Unauthorized("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let message = signing_string(method, url, &auth.timestamp, &auth.nonce, body);
    public_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| Error::Unauthorized("signature verification failed".to_string()))?;

    if !check_and_record_nonce(conn, &auth.device_id, &auth.nonce)? {
        return Err(Error::Unauthorized("nonce already used".to_string()));
    }

    Ok(peer)
}

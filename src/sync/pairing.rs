// Pairing payload (§4.8 "Pairing"): out-of-band (QR code, copy-pasted
// JSON) handshake that seeds a `SyncPeer` row. The fingerprint is the
// trust anchor — accepting a payload pins it for every future request
// from that device until the peer is re-paired or removed.

use crate::config::Config;
use crate::db::types::SyncPeer;
use crate::error::{Error, Result};
use crate::identity::{decode_public_key, fingerprint_of, DeviceIdentity};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPayload {
    pub device_id: String,
    pub fingerprint: String,
    pub public_key: String,
    pub addresses: Vec<String>,
}

/// This device's own pairing payload, meant to be shared out-of-band with
/// the device being paired (the spec does not mandate a QR encoder; the
/// CLI prints this as JSON for the operator to transfer however they like).
pub fn own_payload(identity: &DeviceIdentity, config: &Config) -> PairingPayload {
    PairingPayload {
        device_id: identity.device_id.clone(),
        fingerprint: identity.fingerprint(),
        public_key: identity.public_key_base64(),
        addresses: advertised_addresses(config),
    }
}

/// Addresses this device advertises to a newly-paired peer, per
/// `sync_advertise` (`auto`/`tailscale` use `sync_host:sync_port` as-is;
/// a literal hostname overrides the host component).
pub fn advertised_addresses(config: &Config) -> Vec<String> {
    match config.sync_advertise.as_str() {
        "auto" | "tailscale" => vec![format!("{}:{}", config.sync_host, config.sync_port)],
        host => vec![format!("{host}:{}", config.sync_port)],
    }
}

/// Accept a peer's pairing payload: validate that the claimed fingerprint
/// actually matches the claimed public key (catching a corrupted or
/// tampered payload before it's trusted), then pin it. New peers inherit
/// this device's outbound project filter defaults; callers can narrow it
/// per-peer afterward via `db::sync::set_project_filter`.
pub fn accept(conn: &Connection, payload: &PairingPayload, name: Option<String>, config: &Config) -> Result<SyncPeer> {
    let public_key = decode_public_key(&payload.public_key)?;
    if fingerprint_of(&public_key) != payload.fingerprint {
        return Err(Error::InvalidInput(
            "pairing payload fingerprint does not match its public key".to_string(),
        ));
    }

    let peer = SyncPeer {
        peer_device_id: payload.device_id.clone(),
        name,
        pinned_fingerprint: payload.fingerprint.clone(),
        public_key: payload.public_key.clone(),
        addresses: payload.addresses.clone(),
        last_seen_at: None,
        last_sync_at: None,
        last_error: None,
        project_filter_include: config.sync_projects_include.clone(),
        project_filter_exclude: config.sync_projects_exclude.clone(),
    };
    crate::db::sync::upsert_peer(conn, &peer)?;
    crate::db::sync::get_peer(conn, &payload.device_id)?
        .ok_or_else(|| Error::Other("peer vanished immediately after pairing".to_string()))
}

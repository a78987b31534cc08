// Signed LAN replication (§4.8 Sync Protocol): a small HTTP server exposing
// `/v1/status` and `/v1/ops`, a client that drives one pass per peer, a
// pairing handshake that pins trust, and a daemon loop that ties them
// together on a fixed interval. Every request is authenticated with an
// ed25519 signature over the request's method, URL, timestamp, nonce, and
// body hash (`auth`); nothing here trusts a device id without that check.

pub mod auth;
pub mod client;
pub mod daemon;
pub mod pairing;
pub mod server;

pub use auth::{sign, verify, RequestAuth};
pub use client::{run_peer_pass, SyncPassOutcome};
pub use daemon::{run_loop, shutdown_flag, status as daemon_status, tick, DaemonStatus, ShutdownFlag};
pub use pairing::{accept as accept_pairing, own_payload, PairingPayload};
pub use server::{router, SyncServerState};

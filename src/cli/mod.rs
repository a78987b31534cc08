// src/cli/mod.rs
// CLI module for codemem commands

use clap::{Parser, Subcommand};

pub mod export;
pub mod ingest;
pub mod maintenance;
pub mod serve;
pub mod sync;

pub use export::run_export_import;
pub use ingest::run_ingest;
pub use maintenance::run_maintenance;
pub use serve::run_mcp_server;
pub use sync::run_sync;

#[derive(Parser)]
#[command(name = "codemem")]
#[command(about = "Local-first persistent memory store for developer agent CLIs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a raw-event ingest payload from stdin and record it
    Ingest,

    /// Run the MCP/viewer surface (default). Forwards tool calls to ingest.
    Mcp,
    /// Alias for `mcp`
    Serve,

    /// Sync daemon and peer management
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Recompute `tags_text` on rows that carry none
    BackfillTags {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },

    /// Stamp `metadata.discovery_tokens` on rows missing it
    BackfillDiscoveryTokens {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },

    /// Embed active memory rows missing a vector under the configured model
    Embed {
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },

    /// Run one retention/dispatch sweep and flush any session it surfaces
    FlushRawEvents,

    /// Raw-event queue health
    RawEventsStatus {
        #[arg(long, default_value_t = 24)]
        window_hours: i64,
    },
    /// Reclaim stuck `claimed` batches and requeue sessions with unflushed events
    RawEventsRetry,
    /// Check reliability metrics against the configured gate thresholds
    RawEventsGate {
        #[arg(long, default_value_t = 24)]
        window_hours: i64,
    },

    /// Assemble a pack for `context` and report its token-budget metrics
    PackBenchmark {
        context: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        token_budget: Option<usize>,
    },

    /// Run hybrid recall for `context` and report which routing class it took
    HybridEval {
        context: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Database maintenance
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Export the entity tables as a versioned JSON document (stdout)
    Export,
    /// Import a previously exported JSON document (stdin)
    Import,
}

#[derive(Subcommand)]
pub enum SyncAction {
    /// Turn the sync daemon on in config
    Enable,
    /// Turn the sync daemon off in config
    Disable,
    /// Report last tick outcome and pidfile state
    Status,
    /// Print this device's pairing payload as JSON
    Pair,
    /// Accept a peer's pairing payload (JSON on stdin)
    PairAccept {
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a single daemon tick and exit
    Once,
    /// Run the daemon loop until interrupted
    Daemon,
    /// Peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },
    /// Alias for `enable`: thin dispatch, no service-manager integration (out of scope)
    Install,
    /// Alias for `disable`
    Uninstall,
    /// Preflight checks: pidfile/process liveness, last error
    Doctor,
    /// Rewrite legacy `legacy:memory_item:<n>` import keys to canonical form
    RepairLegacyKeys {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
    /// List recent sync attempts
    Attempts {
        #[arg(long)]
        peer: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum PeersAction {
    List,
    Remove { device_id: String },
    Rename { device_id: String, name: String },
}

#[derive(Subcommand)]
pub enum DbAction {
    /// Soft-delete low-confidence `observation` rows older than `older_than_days`
    PruneObservations {
        #[arg(long, default_value_t = 90)]
        older_than_days: i64,
        #[arg(long, default_value_t = 0.3)]
        min_confidence: f64,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Soft-delete low-confidence rows of any kind older than `older_than_days`
    PruneMemories {
        #[arg(long, default_value_t = 180)]
        older_than_days: i64,
        #[arg(long, default_value_t = 0.2)]
        min_confidence: f64,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Collapse `project` values to their basename
    NormalizeProjects,
    /// Rename a project across every session that carries it
    RenameProject { from: String, to: String },
}

// Raw-Event Queue (§4.1): ingest, flush-batch state machine, periodic
// sweeper, and reliability metrics, split by concern.

pub mod flush;
pub mod queue;
pub mod reliability;
pub mod sweeper;

pub use flush::{claim_batch, complete_batch, fail_batch, get_or_create_batch};
pub use queue::{events_in_range, record, record_batch, start_session, RawEventInput, RecordBatchResult};
pub use reliability::{reliability_report, ReliabilityReport};
pub use sweeper::{run_sweep, SweepReport};

// Memory Model (§4.2-§4.5): writes, tag derivation, vector maintenance,
// hybrid-retrieval scoring primitives, candidate generation, and pack
// assembly all live under this module, split by concern.

pub mod pack;
pub mod ranking;
pub mod retrieval;
pub mod store;
pub mod tags;
pub mod vectors;

pub use pack::{assemble_pack, record_pack_usage, Pack, PackItem, PackMetrics};
pub use retrieval::{classify_query, timeline_expand, QueryClass, RecallFilters};
pub use store::{forget, get_memory_item, remember, remember_observation, row_to_memory_item, RememberOptions};

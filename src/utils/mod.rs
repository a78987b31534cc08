pub mod json;
pub mod text;

use std::path::Path;

/// Render a path as a `&str`-compatible `String`, accepting non-UTF-8 paths
/// lossily rather than panicking (connection strings need owned `String`s).
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Current UTC time as an RFC-3339 string with offset, matching the wire
/// protocol's timestamp format.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

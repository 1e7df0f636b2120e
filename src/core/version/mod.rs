// ─── Version Discovery ───
// Adaptive remote probing for the newest build of a branch, with TTL caches
// and single-flight coalescing owned by the resolver instance.

pub mod cache;
pub mod coalesce;
pub mod marker;
pub mod probe;
pub mod resolver;

pub use marker::{read_marker, write_marker, MARKER_FILE};
pub use probe::{DiscoveryError, HttpVersionProbe, VersionProbe};
pub use resolver::VersionResolver;

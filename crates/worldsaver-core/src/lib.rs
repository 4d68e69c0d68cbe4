mod errors;

pub mod container;
pub mod markers;
pub mod naming;
pub mod retention;

pub use container::{ConnectionSpec, ContainerSpec, Endpoint, RconSpec, ServerKind};
pub use errors::{CoreError, Result};
pub use markers::{HealthMarker, HoldMarker};
pub use retention::{RetentionPolicy, TrimReport};

pub fn pkg_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

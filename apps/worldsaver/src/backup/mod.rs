pub mod actor;
pub mod connection;
pub mod presence;
pub mod schedule;
pub mod service;

#[cfg(test)]
mod testing;

pub use actor::{BackupActor, PassOutcome};
pub use connection::{ChannelFactory, ContainerConnection};
pub use presence::{PlayerEvent, PresenceKind};
pub use service::run_service;

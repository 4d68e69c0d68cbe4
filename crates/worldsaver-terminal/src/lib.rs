pub mod channel;
pub mod expect;
pub mod known_hosts;
pub mod protocol;

pub use channel::{ConsoleOutput, ProcessControl, TerminalChannel};
pub use expect::{ExpectMatcher, MatchResult, Pattern};
pub use known_hosts::{HostKeyStatus, HostKeyStore};
pub use protocol::ContainerTerminal;

pub mod browser;
pub mod client;
pub mod extract;
pub mod navigator;
pub mod transport;

pub use navigator::{PageCursor, RosterNavigator};
pub use transport::Transport;

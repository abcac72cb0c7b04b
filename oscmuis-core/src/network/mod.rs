//! Network topology: the mode state machine and broadcast resolution.

pub mod broadcast;
pub mod controller;
pub mod state;

pub use broadcast::{resolve, Topology, AP_ADDRESS, AP_BROADCAST};
pub use controller::{ConnectTicket, NetworkModeController};
pub use state::{ConnectOutcome, NetworkMode, NetworkState, ScanPhase, ScanPoll};

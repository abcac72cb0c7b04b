//! OSC trigger output: message encoding, target resolution and UDP sends.

pub mod codec;
pub mod dispatcher;
pub mod transport;

pub use codec::{OscArg, OscMessage};
pub use dispatcher::{DispatchReport, OscConfig, OscDispatcher, TestPreview};
pub use transport::UdpTransport;

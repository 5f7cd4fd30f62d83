pub mod amfi;
pub mod heartbeat;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

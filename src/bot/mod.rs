/// Inbound message model and command parsing
pub mod command;
/// The per-message download pipeline
pub mod handlers;
/// Outbound chat transport
pub mod transport;

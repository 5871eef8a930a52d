/// Artifact overrides and keypad submissions.
pub mod artifact_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Gateway connection supervision and degraded mode.
pub mod gateway_supervisor;
/// Health check service.
pub mod health_service;
/// Time-bank and currency ledgers.
pub mod ledger_service;
/// Participant membership, presence and moderation.
pub mod participant_service;
/// Event dispatch: persistence, triggers, broadcast.
pub mod pipeline;
/// Realtime subscription and delivery.
pub mod realtime_service;
/// Per-session broadcast sequence numbers.
pub mod sequencer;
/// Session creation and lifecycle commands.
pub mod session_service;
#[cfg(test)]
pub(crate) mod test_support;
/// Session timer commands and expiry.
pub mod timer_service;
/// Trigger evaluation and firing.
pub mod trigger_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;

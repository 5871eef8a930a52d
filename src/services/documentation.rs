use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI document for the play session runtime.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sessions::create_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::run_lifecycle,
        crate::routes::sessions::set_step,
        crate::routes::sessions::set_phase,
        crate::routes::sessions::start_timer,
        crate::routes::sessions::adjust_timer,
        crate::routes::sessions::timer_verb,
        crate::routes::sessions::moderate_participant,
        crate::routes::sessions::artifact_action,
        crate::routes::sessions::fire_trigger,
        crate::routes::sessions::arm_trigger,
        crate::routes::sessions::disable_trigger,
        crate::routes::sessions::disable_all_triggers,
        crate::routes::sessions::apply_time_bank,
        crate::routes::sessions::list_time_bank,
        crate::routes::sessions::session_log,
        crate::routes::sessions::session_stream,
        crate::routes::play::join,
        crate::routes::play::heartbeat,
        crate::routes::play::ready,
        crate::routes::play::leave,
        crate::routes::play::state_view,
        crate::routes::play::submit_keypad,
        crate::routes::play::ws_handler,
        crate::routes::currency::create_transaction,
        crate::routes::currency::refund_transaction,
        crate::routes::currency::balance,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::ws::ParticipantInboundMessage,
            crate::state::RealtimeMessage,
            crate::services::timer_service::TimerCommand,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Session creation and lifecycle"),
        (name = "timer", description = "Session timer commands"),
        (name = "participants", description = "Participant moderation"),
        (name = "artifacts", description = "Artifact overrides"),
        (name = "triggers", description = "Trigger firing and status"),
        (name = "ledgers", description = "Time-bank and currency ledgers"),
        (name = "play", description = "Participant commands"),
        (name = "realtime", description = "SSE and WebSocket channels"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_participant_and_facilitator_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/play/join"));
        assert!(doc.paths.paths.contains_key("/sessions/{id}/time-bank"));
        assert!(doc.paths.paths.contains_key("/currency/balance"));
    }
}

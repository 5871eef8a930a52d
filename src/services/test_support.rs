//! Fixtures shared by the service tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    dao::gateway::memory::MemoryGateway,
    dto::{
        participant::{JoinRequest, JoinResponse},
        session::{ArtifactInput, CreateSessionRequest, SettingsInput},
    },
    services::{
        participant_service,
        session_service::{self, LifecycleCommand},
    },
    state::{
        AppState, SessionActor, SharedState,
        artifact::{ArtifactVariant, KeypadConfig, VariantVisibility},
        session::PlayMode,
        trigger::TriggerDefinition,
    },
};

pub(crate) struct TestSession {
    pub state: SharedState,
    pub gateway: MemoryGateway,
    pub actor: Arc<SessionActor>,
    pub session_id: Uuid,
    pub host_id: Uuid,
    pub tenant_id: Uuid,
    pub join_code: String,
    pub participant: Option<JoinResponse>,
}

pub(crate) async fn app_state() -> (SharedState, MemoryGateway) {
    let state = AppState::new(RuntimeConfig::default());
    let gateway = MemoryGateway::new();
    state.install_gateway(Arc::new(gateway.clone())).await;
    (state, gateway)
}

fn variant(key: &str, visibility: VariantVisibility) -> ArtifactVariant {
    ArtifactVariant {
        key: key.into(),
        title: None,
        body: format!("{key} body"),
        visibility,
        min_state: crate::state::artifact::ArtifactState::Revealed,
    }
}

/// Draft session with a `vault` keypad (code 4321, three attempts), a `map` artifact with
/// one public and one `navigator` variant, and five steps.
pub(crate) async fn draft_session_with(triggers: Vec<TriggerDefinition>) -> TestSession {
    let (state, gateway) = app_state().await;
    let host_id = Uuid::new_v4();
    let tenant_id = Uuid::new_v4();

    let request = CreateSessionRequest {
        display_name: "Escape the lab".into(),
        tenant_id,
        play_mode: PlayMode::Facilitated,
        step_count: 5,
        phase_count: 3,
        settings: SettingsInput::default(),
        artifacts: vec![
            ArtifactInput {
                key: "vault".into(),
                title: "Vault".into(),
                variants: vec![variant("door", VariantVisibility::Public)],
                keypad: Some(KeypadConfig {
                    code: "4321".into(),
                    max_attempts: Some(3),
                }),
            },
            ArtifactInput {
                key: "map".into(),
                title: "Map".into(),
                variants: vec![
                    variant("overview", VariantVisibility::Public),
                    variant(
                        "route",
                        VariantVisibility::Role {
                            role: "navigator".into(),
                        },
                    ),
                    variant("answer", VariantVisibility::Facilitator),
                ],
                keypad: None,
            },
        ],
        triggers,
    };
    let view = session_service::create(&state, host_id, request)
        .await
        .expect("session created");
    let actor = state.session(view.id).await.expect("session resident");

    TestSession {
        state,
        gateway,
        actor,
        session_id: view.id,
        host_id,
        tenant_id,
        join_code: view.join_code,
        participant: None,
    }
}

pub(crate) async fn draft_session() -> TestSession {
    draft_session_with(Vec::new()).await
}

/// Lobby session with one active participant.
pub(crate) async fn lobby_with_participant() -> TestSession {
    lobby_with_triggers(Vec::new()).await
}

pub(crate) async fn lobby_with_triggers(triggers: Vec<TriggerDefinition>) -> TestSession {
    let mut session = draft_session_with(triggers).await;
    session_service::transition(
        &session.state,
        session.host_id,
        session.session_id,
        LifecycleCommand::Open,
    )
    .await
    .expect("session opened");
    session.participant = Some(join(&session.state, &session.join_code, "Ada").await);
    session
}

/// Active session with one participant.
pub(crate) async fn active_with_triggers(triggers: Vec<TriggerDefinition>) -> TestSession {
    let session = lobby_with_triggers(triggers).await;
    session_service::transition(
        &session.state,
        session.host_id,
        session.session_id,
        LifecycleCommand::Start,
    )
    .await
    .expect("session started");
    session
}

pub(crate) async fn join(state: &SharedState, join_code: &str, name: &str) -> JoinResponse {
    participant_service::join(
        state,
        JoinRequest {
            join_code: join_code.to_lowercase(),
            display_name: name.into(),
            role: None,
            previous_token: None,
        },
    )
    .await
    .expect("participant joined")
}

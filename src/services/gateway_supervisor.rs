use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{gateway::PlayGateway, storage::StorageError},
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Connect the persistence gateway and keep polling its health.
///
/// While the gateway is unhealthy the shared state stays degraded, so commands fail fast
/// with `Degraded` instead of waiting on a dead backend.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn PlayGateway>, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(gateway) => {
                state.install_gateway(gateway.clone()).await;
                info!("gateway connection established; leaving degraded mode");
                delay = INITIAL_DELAY;

                if !supervise(&state, gateway.as_ref()).await {
                    warn!("exhausted gateway reconnect attempts; staying in degraded mode");
                }
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "gateway connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll health until reconnection gives up. Returns `false` once it does.
async fn supervise(state: &SharedState, gateway: &dyn PlayGateway) -> bool {
    loop {
        if gateway.health_check().await.is_ok() {
            if state.is_degraded() {
                info!("gateway healthy again; leaving degraded mode");
                state.update_degraded(false);
            }
            sleep(HEALTH_POLL_INTERVAL).await;
            continue;
        }

        if !reconnect(state, gateway).await {
            return false;
        }
        state.update_degraded(false);
        sleep(HEALTH_POLL_INTERVAL).await;
    }
}

async fn reconnect(state: &SharedState, gateway: &dyn PlayGateway) -> bool {
    let mut reconnect_delay = INITIAL_DELAY;
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        match gateway.try_reconnect().await {
            Ok(()) => {
                info!(attempt, "gateway reconnection succeeded after health check failure");
                return true;
            }
            Err(err) => {
                if attempt == 0 {
                    warn!(attempt, error = %err, "gateway reconnect first attempt failed; entering degraded mode");
                    state.update_degraded(true);
                } else {
                    warn!(attempt, error = %err, "gateway reconnect attempt failed");
                }
                sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(MAX_DELAY);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RuntimeConfig, dao::gateway::memory::MemoryGateway, state::AppState};

    #[tokio::test]
    async fn failed_reconnect_enters_degraded_mode() {
        let state = AppState::new(RuntimeConfig::default());
        let gateway = MemoryGateway::new();
        state.install_gateway(Arc::new(gateway.clone())).await;
        gateway.set_offline(true);

        let handle = tokio::spawn({
            let state = state.clone();
            let gateway = gateway.clone();
            async move { reconnect(&state, &gateway).await }
        });
        let mut watcher = state.degraded_watcher();
        watcher.wait_for(|degraded| *degraded).await.unwrap();
        handle.abort();

        assert!(state.is_degraded());
    }

    #[tokio::test]
    async fn reconnect_succeeds_when_backend_is_back() {
        let state = AppState::new(RuntimeConfig::default());
        let gateway = MemoryGateway::new();
        state.install_gateway(Arc::new(gateway.clone())).await;

        assert!(reconnect(&state, &gateway).await);
        assert!(!state.is_degraded());
    }
}

//! Process-wide wiring: singletons are constructed once at startup and
//! handed to every handler through this injected context.

use std::sync::Arc;
use std::time::Duration;

use moor_sandbox::SandboxManager;

use crate::broadcast::{BroadcasterRegistry, DEFAULT_SUBSCRIBER_BUFFER};
use crate::session::SessionService;
use crate::store::Store;
use crate::supervisor::{SupervisorConfig, SupervisorRegistry};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub provision_timeout: Duration,
    pub rpc_timeout: Duration,
    pub subscriber_buffer: usize,
    /// Journal retention window.
    pub retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(30),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub manager: Arc<SandboxManager>,
    pub broadcasters: Arc<BroadcasterRegistry>,
    pub supervisors: Arc<SupervisorRegistry>,
    pub sessions: Arc<SessionService>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(store: Store, manager: Arc<SandboxManager>, config: ServerConfig) -> Self {
        let broadcasters = Arc::new(BroadcasterRegistry::new(
            store.clone(),
            config.subscriber_buffer,
        ));
        let supervisors = Arc::new(SupervisorRegistry::new(
            store.clone(),
            manager.clone(),
            broadcasters.clone(),
            SupervisorConfig {
                rpc_timeout: config.rpc_timeout,
                ..SupervisorConfig::default()
            },
        ));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            manager.clone(),
            broadcasters.clone(),
            supervisors.clone(),
            config.provision_timeout,
        ));

        Self {
            store,
            manager,
            broadcasters,
            supervisors,
            sessions,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Periodic journal retention sweep. Runs until the process exits.
    pub fn spawn_retention_loop(&self, retention: Duration) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(retention)
                        .unwrap_or_else(|_| chrono::Duration::days(7));
                let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                match store.prune_events_older_than(&cutoff) {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::info!(removed, %cutoff, "pruned journal entries");
                    }
                    Err(error) => {
                        tracing::warn!(%error, "journal retention sweep failed");
                    }
                }
            }
        });
    }
}

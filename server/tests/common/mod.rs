pub mod loopback_bridge;
pub mod memory_store;

use std::sync::Arc;

use server::config::{HandlerConfig, WaiterConfig};
use server::handler::LobbyHandler;
use server::matcher::{Matcher, MatcherConfig};
use server::store::LobbyStore;
use server::streamer::StreamManager;
use server::waiter::Waiter;
use tokio_util::sync::CancellationToken;

pub use loopback_bridge::LoopbackBridge;
pub use memory_store::MemoryStore;

/// One logical matchmaking node: its own stream registry, waiter and handler
/// on top of a (possibly shared) store and bridge.
pub struct TestNode {
    pub store: Arc<dyn LobbyStore>,
    pub streamer: Arc<StreamManager>,
    pub matcher: Arc<Matcher>,
    pub waiter: Arc<Waiter>,
    pub handler: Arc<LobbyHandler>,
    pub shutdown: CancellationToken,
}

impl TestNode {
    pub fn new(store: Arc<dyn LobbyStore>, bridge: Arc<LoopbackBridge>) -> Self {
        Self::with_configs(store, bridge, HandlerConfig::default(), fast_waiter_config())
    }

    pub fn with_configs(
        store: Arc<dyn LobbyStore>,
        bridge: Arc<LoopbackBridge>,
        handler_cfg: HandlerConfig,
        waiter_cfg: WaiterConfig,
    ) -> Self {
        let streamer = StreamManager::new(bridge);
        let matcher = Arc::new(Matcher::new(MatcherConfig::default()));
        let waiter = Arc::new(Waiter::new(store.clone(), streamer.clone(), waiter_cfg));
        let shutdown = CancellationToken::new();

        let handler = Arc::new(LobbyHandler::new(
            store.clone(),
            streamer.clone(),
            matcher.clone(),
            waiter.clone(),
            handler_cfg,
            shutdown.clone(),
        ));

        Self {
            store,
            streamer,
            matcher,
            waiter,
            handler,
            shutdown,
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The fastest tick the floors allow, so lifecycle tests converge quickly.
pub fn fast_waiter_config() -> WaiterConfig {
    WaiterConfig {
        ticker_timeout: std::time::Duration::from_millis(500),
        ..Default::default()
    }
}

//! Node wiring.
//!
//! [`PorNode`] assembles the protocol stack over any [`Transport`] and runs
//! two tasks: the inbound loop feeding frames to the dispatcher, and the
//! scheduler.

use crate::config::NetConfig;
use crate::net::counters::{CounterSnapshot, Counters};
use crate::net::dispatcher::Dispatcher;
use crate::net::rate_limit::RateLimiter;
use crate::net::registry::PeerRegistry;
use crate::net::routing::RoutingTable;
use crate::net::transport::{InboundFrame, Transport};
use crate::por::{PorError, PorEvent, SessionHandle, SessionManager};
use crate::scheduler::{ConnectNotifier, Scheduler, TimerHandle};
use crate::types::PeerId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

pub struct PorNode {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    routing: Arc<RoutingTable>,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<SessionManager>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PorNode {
    /// Build the stack and spawn its tasks. Must be called inside a tokio
    /// runtime.
    pub fn start(
        config: &NetConfig,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundFrame>,
    ) -> Arc<Self> {
        let local_id = registry.local_id();
        let counters = Arc::new(Counters::default());

        let routing = Arc::new(RoutingTable::new(
            registry.clone(),
            config.route_back_cache_size,
            config.route_back_ttl(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            routing.clone(),
            limiter.clone(),
            transport,
            counters.clone(),
        ));

        let (timers, timer_rx) = TimerHandle::channel();
        let manager = SessionManager::new(config, registry.clone(), dispatcher.clone(), counters.clone(), timers);
        let (notifier, connect_rx) = ConnectNotifier::channel();

        registry.subscribe(routing.clone());
        registry.subscribe(limiter);
        registry.subscribe(manager.clone());
        registry.subscribe(notifier);

        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(
            config,
            manager.clone(),
            registry.clone(),
            routing.clone(),
            timer_rx,
            connect_rx,
        );

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));
        tasks.push(tokio::spawn(Self::inbound_loop(
            dispatcher.clone(),
            manager.clone(),
            inbound,
            shutdown.clone(),
        )));

        info!(
            "PoR node {} started (por_enabled: {}, ttl: {})",
            local_id, config.por_enabled, config.routed_message_ttl
        );

        Arc::new(Self {
            local_id,
            registry,
            routing,
            dispatcher,
            manager,
            counters,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    async fn inbound_loop(
        dispatcher: Arc<Dispatcher>,
        manager: Arc<SessionManager>,
        mut inbound: mpsc::Receiver<InboundFrame>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = inbound.recv() => {
                    let Some(InboundFrame { via, frame }) = frame else {
                        break;
                    };
                    if let Err(e) = dispatcher.on_receive(&via, &frame, manager.as_ref()) {
                        trace!("Dropped frame from {}: {}", via, e);
                    }
                }
            }
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PorEvent> {
        self.manager.subscribe()
    }

    pub fn initiate(&self, peer: PeerId) -> Result<SessionHandle, PorError> {
        self.manager.initiate(peer)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Stop the node's tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("PoR node {} stopped", self.local_id);
    }
}

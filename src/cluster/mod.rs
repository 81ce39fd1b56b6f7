mod consensus;
mod election;
mod error;
mod membership;
mod node;
mod state;

pub use self::consensus::{majority_value, reconcile_round, RandomValue, ValueSource};
pub use self::election::Election;
pub use self::error::ClusterError;
pub use self::membership::Membership;
pub use self::node::{Node, Timer};
pub use self::state::{NodeRole, NodeState};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::message::{Message, Pid};
use crate::network::{MulticastTransport, MAX_DATAGRAM};

/// One peer of the multicast group: the controller plus the tasks that
/// drive it. All controller state changes funnel through `node`, so the
/// receive loop, the timer mailbox, and the heartbeat ticker never step on
/// each other.
pub struct Cluster {
    pub node: Arc<Mutex<Node>>,
    config: Config,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(pid: Pid, config: Config) -> Self {
        Self::with_value_source(pid, config.clone(), Box::new(RandomValue::new(pid)))
    }

    pub fn with_value_source(pid: Pid, config: Config, values: Box<dyn ValueSource>) -> Self {
        let node = Node::new(pid, config.clone(), values);
        Self {
            node: Arc::new(Mutex::new(node)),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the peer's tasks on the already-bound transport and kick off
    /// discovery. The returned channel yields at most one fatal error: a
    /// receive failure that terminated the loop.
    pub async fn start(&self, transport: MulticastTransport) -> mpsc::Receiver<ClusterError> {
        let transport = Arc::new(transport);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::channel(1);

        {
            let mut node = self.node.lock().unwrap();
            node.set_outbox(out_tx);
            node.set_timer_sender(timer_tx);
        }

        // Outbound drain: one datagram per message, transient send errors
        // are logged and dropped.
        let send_transport = Arc::clone(&transport);
        let send_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let data = msg.encode();
                if let Err(e) = send_transport.send(&data).await {
                    warn!("dropping outbound datagram: {}", e);
                }
            }
        });

        // Receive loop: malformed datagrams are dropped, a socket error is
        // fatal for the whole peer.
        let recv_node = Arc::clone(&self.node);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match transport.recv(&mut buf).await {
                    Ok((len, addr)) => match Message::decode(&buf[..len]) {
                        Ok(msg) => recv_node.lock().unwrap().handle_message(msg),
                        Err(e) => debug!("dropping datagram from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("receive loop terminated: {}", e);
                        let _ = fatal_tx.send(ClusterError::Network(e)).await;
                        break;
                    }
                }
            }
        });

        // Timer mailbox: deadline events are applied under the same lock as
        // incoming messages.
        let timer_node = Arc::clone(&self.node);
        let timer_task = tokio::spawn(async move {
            while let Some(timer) = timer_rx.recv().await {
                timer_node.lock().unwrap().handle_timer(timer);
            }
        });

        // Heartbeat and failure sweep at the configured cadence.
        let tick_node = Arc::clone(&self.node);
        let interval_ms = self.config.heartbeat_interval_ms.max(1);
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                tick_node.lock().unwrap().heartbeat_tick();
            }
        });

        self.node.lock().unwrap().start();

        self.tasks
            .lock()
            .unwrap()
            .extend([send_task, recv_task, timer_task, tick_task]);

        fatal_rx
    }

    /// Stop every task of this peer. The peer falls silent immediately; the
    /// rest of the group will detect the failure through missing heartbeats.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

//! WebSocket push channel
//!
//! Every connected client receives the round events forwarded by the game
//! gateway plus a periodic heartbeat. Delivery is at-least-once from the
//! client's point of view: a lagging client skips events rather than
//! stalling the others, so consumers must tolerate gaps and duplicate ticks.

use super::handlers::AppState;
use crate::{gateway::EventPublisher, metrics::GameMetrics, scheduler::GameEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::interval};
use tracing::{debug, error, info, warn};

/// WebSocket subscription filters
#[derive(Debug, Clone, Deserialize)]
pub struct WsSubscription {
    /// Receive `multiplier_tick` events
    #[serde(default = "default_true")]
    pub ticks: bool,

    /// Receive `bet_placed` and `cashed_out` events
    #[serde(default = "default_true")]
    pub bets: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WsSubscription {
    fn default() -> Self {
        Self { ticks: true, bets: true }
    }
}

/// WebSocket connection manager
#[derive(Clone)]
pub struct WebSocketManager {
    tx: broadcast::Sender<GameEvent>,
    client_count: Arc<AtomicU64>,
    metrics: GameMetrics,
    heartbeat_interval: Duration,
}

impl WebSocketManager {
    pub fn new(buffer: usize, heartbeat_interval: Duration, metrics: GameMetrics) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            client_count: Arc::new(AtomicU64::new(0)),
            metrics,
            heartbeat_interval,
        }
    }

    /// Start the heartbeat task
    pub fn start_background_tasks(&self) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                // no receivers is fine
                let _ = tx.send(GameEvent::Heartbeat {
                    timestamp: Utc::now().timestamp(),
                });
            }
        })
    }

    /// Get current client count
    pub fn client_count(&self) -> u64 {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    pub fn handle_upgrade(&self, ws: WebSocketUpgrade, subscription: WsSubscription) -> Response {
        let manager = self.clone();
        ws.on_upgrade(move |socket| async move { manager.handle_connection(socket, subscription).await })
    }

    async fn handle_connection(&self, socket: WebSocket, subscription: WsSubscription) {
        let client_id = generate_client_id();
        let connected = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.websocket_clients.set(connected as i64);
        info!("WebSocket client {} connected (total: {})", client_id, connected);

        let (mut sender, mut receiver) = socket.split();
        let mut rx = self.tx.subscribe();

        let receive_id = client_id.clone();
        let receive_task = tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Close(_)) => {
                        debug!("Client {} requested close", receive_id);
                        break;
                    }
                    Ok(Message::Text(text)) => {
                        debug!("Ignoring message from client {}: {}", receive_id, text);
                    }
                    Err(e) => {
                        warn!("WebSocket error from client {}: {}", receive_id, e);
                        break;
                    }
                    Ok(_) => {}
                }
            }
        });

        let send_id = client_id.clone();
        let send_task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Client {} lagged, skipped {} event(s)", send_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !should_send_event(&event, &subscription) {
                    continue;
                }

                let message = match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        error!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if sender.send(message).await.is_err() {
                    debug!("Client {} disconnected", send_id);
                    break;
                }
            }
        });

        tokio::select! {
            _ = receive_task => debug!("Receive task completed for client {}", client_id),
            _ = send_task => debug!("Send task completed for client {}", client_id),
        }

        let remaining = self.client_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.websocket_clients.set(remaining as i64);
        info!("WebSocket client {} disconnected (remaining: {})", client_id, remaining);
    }
}

impl EventPublisher for WebSocketManager {
    fn publish(&self, event: GameEvent) {
        // nobody connected is fine
        let _ = self.tx.send(event);
    }
}

/// Check if event should be sent to client based on subscription
fn should_send_event(event: &GameEvent, subscription: &WsSubscription) -> bool {
    match event {
        GameEvent::MultiplierTick { .. } => subscription.ticks,
        GameEvent::BetPlaced { .. } | GameEvent::CashedOut { .. } => subscription.bets,
        GameEvent::NewRound { .. }
        | GameEvent::RoundStarted { .. }
        | GameEvent::RoundCrashed { .. }
        | GameEvent::Heartbeat { .. } => true,
    }
}

fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("ws_{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// GET /ws?ticks=false
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(subscription): Query<WsSubscription>,
) -> Response {
    state.websocket_manager.handle_upgrade(ws, subscription)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        multiplier::Multiplier,
        types::{BetId, RoundId, UserId},
    };

    #[test]
    fn test_subscription_filters() {
        let quiet = WsSubscription { ticks: false, bets: false };
        let tick = GameEvent::MultiplierTick {
            round_id: RoundId(1),
            multiplier: Multiplier::ONE,
        };
        let bet = GameEvent::BetPlaced {
            round_id: RoundId(1),
            user_id: UserId(1),
            bet_id: BetId(1),
            amount: 10,
        };
        let crash = GameEvent::RoundCrashed {
            round_id: RoundId(1),
            crash_point: Multiplier::ONE,
            final_multiplier: Multiplier::ONE,
            server_seed: String::new(),
            seed_hash: String::new(),
            forced: false,
            settled_bets: Vec::new(),
        };

        assert!(!should_send_event(&tick, &quiet));
        assert!(!should_send_event(&bet, &quiet));
        assert!(should_send_event(&crash, &quiet));
        assert!(should_send_event(&tick, &WsSubscription::default()));
    }

    #[test]
    fn test_event_wire_format() {
        let event = GameEvent::MultiplierTick {
            round_id: RoundId(7),
            multiplier: Multiplier::from_hundredths(250),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "multiplier_tick");
        assert_eq!(json["round_id"], 7);
        assert_eq!(json["multiplier"], 2.5);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let manager = WebSocketManager::new(16, Duration::from_secs(30), GameMetrics::new().unwrap());
        let mut rx = manager.subscribe();
        manager.publish(GameEvent::Heartbeat { timestamp: 1 });
        assert_eq!(rx.recv().await.unwrap(), GameEvent::Heartbeat { timestamp: 1 });
    }
}

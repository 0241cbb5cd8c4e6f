//! Prometheus metrics for the crash table

use crate::errors::CrashResult;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges exported on `/metrics`
#[derive(Clone)]
pub struct GameMetrics {
    registry: Registry,
    pub rounds_total: IntCounter,
    pub forced_crashes_total: IntCounter,
    pub bets_placed_total: IntCounter,
    pub bets_rejected_total: IntCounter,
    pub cashouts_total: IntCounter,
    pub bets_lost_total: IntCounter,
    pub wagered_points_total: IntCounter,
    pub paid_points_total: IntCounter,
    pub settlement_retries_total: IntCounter,
    pub reconciliation_flags_total: IntCounter,
    pub settlement_in_flight: IntGauge,
    pub websocket_clients: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> CrashResult<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> CrashResult<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl GameMetrics {
    pub fn new() -> CrashResult<Self> {
        let registry = Registry::new();
        Ok(Self {
            rounds_total: counter(&registry, "crash_rounds_total", "Rounds that reached a crash")?,
            forced_crashes_total: counter(
                &registry,
                "crash_forced_crashes_total",
                "Rounds force-crashed after a tick fault",
            )?,
            bets_placed_total: counter(&registry, "crash_bets_placed_total", "Accepted bets")?,
            bets_rejected_total: counter(
                &registry,
                "crash_bets_rejected_total",
                "Bet and cash-out requests rejected by the scheduler",
            )?,
            cashouts_total: counter(&registry, "crash_cashouts_total", "Bets cashed out before the crash")?,
            bets_lost_total: counter(&registry, "crash_bets_lost_total", "Bets still active at the crash")?,
            wagered_points_total: counter(&registry, "crash_wagered_points_total", "Points staked")?,
            paid_points_total: counter(&registry, "crash_paid_points_total", "Points paid out on cash-outs")?,
            settlement_retries_total: counter(
                &registry,
                "crash_settlement_retries_total",
                "Archive attempts retried after a store failure",
            )?,
            reconciliation_flags_total: counter(
                &registry,
                "crash_reconciliation_flags_total",
                "Settlement jobs flagged for manual reconciliation",
            )?,
            settlement_in_flight: gauge(
                &registry,
                "crash_settlement_in_flight",
                "Settlement jobs not yet finished",
            )?,
            websocket_clients: gauge(&registry, "crash_websocket_clients", "Connected WebSocket clients")?,
            registry,
        })
    }

    /// Text exposition format
    pub fn render(&self) -> CrashResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::errors::CrashError::Monitoring(e.to_string()))
    }
}

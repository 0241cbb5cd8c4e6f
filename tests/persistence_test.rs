//! Balances, archives and id sequences survive a table restart over RocksDB

use crash_table::{
    config::CrashConfig,
    factory::GameFactory,
    fairness::FixedCrashPoint,
    storage::RocksStore,
    store::LedgerStore,
    types::{BetStatus, RoundPhase, UserId},
    GameEvent, Multiplier,
};
use std::sync::Arc;
use tokio::sync::broadcast;

async fn wait_crashed(events: &mut broadcast::Receiver<GameEvent>) -> GameEvent {
    loop {
        match events.recv().await {
            Ok(event @ GameEvent::RoundCrashed { .. }) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("event stream ended: {}", e),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn LedgerStore> = Arc::new(RocksStore::open(dir.path()).unwrap());
    let config = CrashConfig::default();

    println!("=== Phase 1: play one round ===");
    let (first_round, first_bet) = {
        let source = Box::new(FixedCrashPoint(Multiplier::from_hundredths(150)));
        let table = GameFactory::create_with_source(&config, store.clone(), source)
            .await
            .unwrap();
        table.fund(UserId(7), 500).await.unwrap();

        let mut events = table.gateway.subscribe();
        let bet = table.gateway.place_bet(UserId(7), 200).await.unwrap();
        let GameEvent::RoundCrashed { round_id, forced, .. } = wait_crashed(&mut events).await else {
            unreachable!()
        };
        assert_eq!(round_id, bet.round_id);
        assert!(!forced);

        table.settlement.wait_idle().await;
        table.shutdown().await.unwrap();
        (round_id, bet)
    };

    assert_eq!(store.balance(UserId(7)).await.unwrap(), Some(300));
    let archived = store.round_bets(first_round).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].status, BetStatus::Lost);

    println!("=== Phase 2: restart on the same store ===");
    let source = Box::new(FixedCrashPoint(Multiplier::from_hundredths(150)));
    let table = GameFactory::create_with_source(&config, store.clone(), source)
        .await
        .unwrap();

    let current = table.gateway.current_round().await.unwrap();
    assert_eq!(current.round.phase, RoundPhase::Waiting);
    assert!(current.round.round_id > first_round);
    assert!(current.bets.is_empty());

    let history = table.gateway.history(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].round_id, first_round);
    assert_eq!(history[0].crash_point, Multiplier::from_hundredths(150));
    assert_eq!(history[0].total_wagered, 200);

    let bet = table.gateway.place_bet(UserId(7), 100).await.unwrap();
    assert!(bet.id > first_bet.id);
    assert_eq!(table.gateway.balance(UserId(7)).await.unwrap(), 200);

    let stats = table.gateway.user_stats(UserId(7)).await.unwrap();
    assert_eq!(stats.losses, 1);
    assert_eq!(stats.total_wagered, 300);

    table.shutdown().await.unwrap();
}

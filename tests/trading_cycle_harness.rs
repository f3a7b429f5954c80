//! End-to-end controller scenarios
//!
//! Drives the full cycle with scripted collaborators:
//! price/sentiment → policy → risk → execution → recording → persistence

mod mock_collaborators;

use mock_collaborators::{
    biased_state, collaborators, swap_response, test_config, MemoryStore, ScriptedPriceFeed,
    ScriptedSwapSubmitter, FLAT_STATE,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use scalp_runner::{
    error::{BotError, ErrorKind, SwapError},
    executor::SwapStatus,
    risk::RiskReason,
    runner::{shutdown_channel, BotController, CyclePhase, CycleResult},
    types::{Action, TradeOutcome},
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const BONK: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";
const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

const FULL_CYCLE: [CyclePhase; 6] = [
    CyclePhase::FetchingSignals,
    CyclePhase::Deciding,
    CyclePhase::RiskChecking,
    CyclePhase::Executing,
    CyclePhase::RecordingOutcome,
    CyclePhase::Idle,
];

struct Harness {
    controller: BotController,
    prices: Arc<ScriptedPriceFeed>,
    submitter: Arc<ScriptedSwapSubmitter>,
    store: Arc<MemoryStore>,
}

async fn harness(
    tokens: &[&str],
    prices: ScriptedPriceFeed,
    submitter: ScriptedSwapSubmitter,
    store: MemoryStore,
) -> Harness {
    let (_handle, shutdown) = shutdown_channel();
    harness_with_shutdown(tokens, prices, submitter, store, shutdown).await
}

async fn harness_with_shutdown(
    tokens: &[&str],
    prices: ScriptedPriceFeed,
    submitter: ScriptedSwapSubmitter,
    store: MemoryStore,
    shutdown: scalp_runner::Shutdown,
) -> Harness {
    let prices = Arc::new(prices);
    let submitter = Arc::new(submitter);
    let store = Arc::new(store);
    let mut controller = BotController::new(
        test_config(tokens),
        collaborators(prices.clone(), submitter.clone(), store.clone()),
        shutdown,
    );
    controller.restore().await.unwrap();
    Harness {
        controller,
        prices,
        submitter,
        store,
    }
}

fn phases(controller: &BotController) -> Vec<CyclePhase> {
    controller.phase_log().iter().map(|r| r.phase).collect()
}

fn completed(result: CycleResult) -> TradeOutcome {
    match result {
        CycleResult::Completed(outcome) => outcome,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_buy_cycle_walks_every_phase() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    let outcome = completed(h.controller.run_cycle(BONK).await.unwrap());

    assert_eq!(outcome.action, Action::Buy);
    assert!(outcome.success);
    assert_eq!(phases(&h.controller), FULL_CYCLE.to_vec());

    // 2% of 100 at a price of 1
    let position = h.controller.state().portfolio.position(BONK);
    assert_eq!(position.quantity_held, dec!(2));
    assert_eq!(position.average_entry_price, dec!(1));
    assert_eq!(h.controller.state().portfolio.cash, dec!(98));
    assert_eq!(h.store.journal().len(), 1);
}

#[tokio::test]
async fn test_cycles_never_overlap() {
    let mut h = harness(
        &["BONK", "USDC"],
        ScriptedPriceFeed::new()
            .with_constant(BONK, dec!(1))
            .with_constant(USDC, dec!(1)),
        ScriptedSwapSubmitter::new().with_delay(Duration::from_millis(5)),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    h.controller.run_tick().await.unwrap();
    h.controller.run_tick().await.unwrap();

    let log = h.controller.phase_log();
    assert_eq!(log.len(), 4 * FULL_CYCLE.len());
    let records: Vec<_> = log.iter().collect();
    for (i, cycle) in records.chunks(FULL_CYCLE.len()).enumerate() {
        let cycle_phases: Vec<CyclePhase> = cycle.iter().map(|r| r.phase).collect();
        assert_eq!(cycle_phases, FULL_CYCLE.to_vec());
        assert!(cycle.iter().all(|r| r.cycle == i as u64 + 1));
    }
    assert_eq!(h.submitter.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.submitter.request_count(), 4);
    // One checkpoint per tick
    assert_eq!(h.store.save_count(), 2);
}

#[tokio::test]
async fn test_stop_loss_overrides_policy() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_script(BONK, vec![Some(dec!(1)), Some(dec!(0.85))]),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    completed(h.controller.run_cycle(BONK).await.unwrap());
    let exit = completed(h.controller.run_cycle(BONK).await.unwrap());

    assert_eq!(exit.action, Action::Sell);
    assert!(exit.success);
    assert_eq!(exit.filled_amount, dec!(2));
    assert!(h.controller.state().portfolio.get_position(BONK).is_none());
    assert_eq!(h.controller.state().portfolio.cash, dec!(99.70));
    assert_eq!(h.controller.state().portfolio.realized_pnl, dec!(-0.30));

    let journal = h.store.journal();
    assert_eq!(journal[1].reason, RiskReason::StopLoss);
    assert!(journal[1].reward < 0.0);
}

#[tokio::test]
async fn test_failed_swaps_leave_position_unchanged() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new().with_script(vec![
            swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
            swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
            swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
        ]),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    let outcome = completed(h.controller.run_cycle(BONK).await.unwrap());

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ExecutionFailed));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.submitter.request_count(), 3);
    assert!(h.controller.state().portfolio.get_position(BONK).is_none());
    assert_eq!(h.controller.state().portfolio.cash, dec!(100));
    assert_eq!(h.controller.state().stats.failed_executions, 1);
    // A failed cycle still records its phases in full
    assert_eq!(phases(&h.controller), FULL_CYCLE.to_vec());
}

#[tokio::test]
async fn test_already_confirmed_retry_increments_once() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new().with_script(vec![
            Err(SwapError::Transient("connection reset".into())),
            swap_response(SwapStatus::AlreadyConfirmed, dec!(2), dec!(1)),
        ]),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    let outcome = completed(h.controller.run_cycle(BONK).await.unwrap());

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        h.controller.state().portfolio.position(BONK).quantity_held,
        dec!(2)
    );
    assert_eq!(h.controller.state().stats.fills, 1);

    let requests = h.submitter.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].order_id, requests[1].order_id);
    assert_ne!(requests[0].request_id, requests[1].request_id);
}

#[tokio::test]
async fn test_unauthorized_is_fatal_and_persists() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new().with_script(vec![Err(SwapError::Unauthorized(
            "401 Unauthorized".into(),
        ))]),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    let err = h.controller.run().await.unwrap_err();

    assert!(matches!(err, BotError::Fatal(_)));
    assert_eq!(h.controller.phase(), CyclePhase::ShuttingDown);
    assert_eq!(h.store.save_count(), 1);
    let saved = h.store.saved().unwrap();
    assert_eq!(saved.portfolio.cash, dec!(100));
    assert!(saved.pending.is_empty());
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_swap() {
    let (handle, shutdown) = shutdown_channel();
    let mut h = harness_with_shutdown(
        &["BONK", "USDC"],
        ScriptedPriceFeed::new()
            .with_constant(BONK, dec!(1))
            .with_constant(USDC, dec!(1)),
        ScriptedSwapSubmitter::new()
            .shutting_down_on_submit(handle)
            .with_delay(Duration::from_millis(20)),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
        shutdown,
    )
    .await;

    let report = h.controller.run().await.unwrap();

    assert_eq!(
        phases(&h.controller),
        vec![
            CyclePhase::FetchingSignals,
            CyclePhase::Deciding,
            CyclePhase::RiskChecking,
            CyclePhase::Executing,
            CyclePhase::RecordingOutcome,
            CyclePhase::ShuttingDown,
        ]
    );
    // The second token was never started
    assert_eq!(h.prices.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.submitter.request_count(), 1);
    assert_eq!(report.stats.fills, 1);

    let saved = h.store.saved().unwrap();
    assert_eq!(saved.portfolio.position(BONK).quantity_held, dec!(2));
    assert!(saved.pending.is_empty());
    assert_eq!(saved.policy.stats.updates, 1);
    assert_eq!(h.store.journal().len(), 1);
}

#[tokio::test]
async fn test_one_update_per_recorded_outcome() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    for _ in 0..3 {
        completed(h.controller.run_cycle(BONK).await.unwrap());
    }
    // The latest outcome waits for the next state
    assert_eq!(h.controller.policy().stats().updates, 2);
    assert_eq!(h.controller.state().pending.len(), 1);

    h.controller.shut_down().await.unwrap();
    assert_eq!(h.controller.policy().stats().updates, 3);
    assert!(h.controller.state().pending.is_empty());
    assert_eq!(h.store.journal().len(), 3);
}

#[tokio::test]
async fn test_restart_resumes_saved_state() {
    let mut first = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;
    completed(first.controller.run_cycle(BONK).await.unwrap());
    first.controller.shut_down().await.unwrap();

    let (_handle, shutdown) = shutdown_channel();
    let mut second = BotController::new(
        test_config(&["BONK"]),
        collaborators(
            first.prices.clone(),
            Arc::new(ScriptedSwapSubmitter::new()),
            first.store.clone(),
        ),
        shutdown,
    );
    second.restore().await.unwrap();

    assert_eq!(second.state().portfolio.position(BONK).quantity_held, dec!(2));
    assert_eq!(second.state().portfolio.cash, dec!(98));
    assert_eq!(second.policy().stats().updates, 1);
    assert!(second.policy().q_table().get(&FLAT_STATE, Action::Buy) > 0.0);
}

#[tokio::test]
async fn test_missing_market_data_skips_cycle() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_script(BONK, vec![None]),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    let result = h.controller.run_cycle(BONK).await.unwrap();

    assert!(matches!(result, CycleResult::Skipped(_)));
    assert_eq!(
        phases(&h.controller),
        vec![CyclePhase::FetchingSignals, CyclePhase::Idle]
    );
    assert_eq!(h.submitter.request_count(), 0);
    assert!(h.store.journal().is_empty());
    assert_eq!(h.controller.state().stats.skipped, 1);
}

#[tokio::test]
async fn test_stale_price_vetoes_buy() {
    let mut h = harness(
        &["BONK"],
        ScriptedPriceFeed::new().with_script(BONK, vec![Some(dec!(1)), None]),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
    )
    .await;

    completed(h.controller.run_cycle(BONK).await.unwrap());
    let second = completed(h.controller.run_cycle(BONK).await.unwrap());

    assert_eq!(second.action, Action::Hold);
    assert_eq!(h.submitter.request_count(), 1);
    let journal = h.store.journal();
    assert_eq!(journal[1].proposed, Action::Buy);
    assert_eq!(journal[1].reason, RiskReason::StalePrice);
}

#[tokio::test]
async fn test_shutdown_stops_retrying_failed_swap() {
    let (handle, shutdown) = shutdown_channel();
    let mut h = harness_with_shutdown(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new()
            .shutting_down_on_submit(handle)
            .with_script(vec![
                swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
                swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
                swap_response(SwapStatus::Failed, Decimal::ZERO, dec!(1)),
            ]),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
        shutdown,
    )
    .await;

    let report = h.controller.run().await.unwrap();

    assert_eq!(h.submitter.request_count(), 1);
    assert_eq!(report.stats.failed_executions, 1);
    let journal = h.store.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].outcome.error_kind, Some(ErrorKind::ExecutionFailed));
    assert_eq!(journal[0].outcome.attempts, 1);
    assert!(phases(&h.controller).ends_with(&[
        CyclePhase::RecordingOutcome,
        CyclePhase::ShuttingDown
    ]));
    assert_eq!(h.store.saved().unwrap().portfolio.cash, dec!(100));
}

#[tokio::test(start_paused = true)]
async fn test_cycles_start_on_interval() {
    let (handle, shutdown) = shutdown_channel();
    let mut h = harness_with_shutdown(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        ScriptedSwapSubmitter::new(),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
        shutdown,
    )
    .await;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.trigger();
    });

    h.controller.run().await.unwrap();

    let gaps = h.prices.call_gaps();
    assert_eq!(gaps.len(), 2);
    assert!(gaps.iter().all(|g| *g >= Duration::from_secs(1)));
    assert_eq!(h.submitter.request_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_cycle_delays_next_tick_without_burst() {
    let (handle, shutdown) = shutdown_channel();
    let mut h = harness_with_shutdown(
        &["BONK"],
        ScriptedPriceFeed::new().with_constant(BONK, dec!(1)),
        // Each swap outlasts the one second interval
        ScriptedSwapSubmitter::new().with_delay(Duration::from_millis(1500)),
        MemoryStore::with_state(biased_state(Action::Buy, dec!(100))),
        shutdown,
    )
    .await;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(4200)).await;
        handle.trigger();
    });

    h.controller.run().await.unwrap();

    // Cycles start at 0s, 1.5s and 3s; missed ticks are not replayed back to back
    let gaps = h.prices.call_gaps();
    assert_eq!(gaps.len(), 2);
    for gap in gaps {
        assert!(gap >= Duration::from_millis(1500), "gap {:?}", gap);
        assert!(gap < Duration::from_millis(1600), "gap {:?}", gap);
    }
    assert_eq!(h.submitter.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.submitter.request_count(), 3);
    assert_eq!(h.controller.state().stats.fills, 3);
}

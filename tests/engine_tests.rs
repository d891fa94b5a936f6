//! End-to-end tests for the position lifecycle: entry execution, protective
//! stop management, trailing ratchet, fill detection, and failure recovery,
//! driven against a scripted in-memory exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use trailbot::config::{Config, ProtectionPolicy, Sizing, SymbolConfig, TradingConfig};
use trailbot::exchange::{
    Exchange, ExchangeError, LotSize, OrderFill, OrderResult, OrderState, OrderStatus, PriceBand,
    SymbolFilters,
};
use trailbot::{Candle, Engine, Notifier, PositionStore, Side, Symbol};

// =============================================================================
// Mock exchange
// =============================================================================

#[derive(Debug)]
struct MockOrder {
    state: OrderState,
    quantity: f64,
    trigger: f64,
    executed_qty: f64,
    cumulative_quote: f64,
}

struct MockExchange {
    price: Mutex<f64>,
    balance: Mutex<f64>,
    filters: SymbolFilters,
    candle_series: Mutex<Option<Vec<Candle>>>,
    market_queue: Mutex<VecDeque<Result<OrderResult, ExchangeError>>>,
    stop_failures: Mutex<VecDeque<ExchangeError>>,
    orders: Mutex<HashMap<String, MockOrder>>,
    cancelled: Mutex<Vec<String>>,
    market_submissions: Mutex<Vec<f64>>,
    stop_submissions: Mutex<Vec<(String, f64)>>,
    counter: AtomicU64,
}

impl MockExchange {
    fn new(price: f64, balance: f64) -> Arc<Self> {
        Arc::new(MockExchange {
            price: Mutex::new(price),
            balance: Mutex::new(balance),
            filters: SymbolFilters {
                lot_size: Some(LotSize {
                    min_qty: 0.001,
                    max_qty: 100_000.0,
                    step_size: 0.001,
                }),
                price_filter: Some(PriceBand {
                    min_price: 0.01,
                    max_price: 1_000_000.0,
                    tick_size: 0.01,
                }),
            },
            candle_series: Mutex::new(None),
            market_queue: Mutex::new(VecDeque::new()),
            stop_failures: Mutex::new(VecDeque::new()),
            orders: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            market_submissions: Mutex::new(Vec::new()),
            stop_submissions: Mutex::new(Vec::new()),
            counter: AtomicU64::new(1),
        })
    }

    fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    fn set_candles(&self, closes: &[f64]) {
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let datetime = Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap();
                Candle::new(datetime, close, close, close, close, 1000.0)
            })
            .collect();
        *self.candle_series.lock().unwrap() = Some(candles);
    }

    fn queue_market_error(&self, error: ExchangeError) {
        self.market_queue.lock().unwrap().push_back(Err(error));
    }

    fn queue_stop_failure(&self, error: ExchangeError) {
        self.stop_failures.lock().unwrap().push_back(error);
    }

    /// Register a resting stop order without going through submit
    fn seed_stop_order(&self, order_id: &str, quantity: f64, trigger: f64) {
        self.orders.lock().unwrap().insert(
            order_id.to_string(),
            MockOrder {
                state: OrderState::New,
                quantity,
                trigger,
                executed_qty: 0.0,
                cumulative_quote: 0.0,
            },
        );
    }

    fn fill_order(&self, order_id: &str, price: f64) {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id).expect("unknown order");
        order.state = OrderState::Filled;
        order.executed_qty = order.quantity;
        order.cumulative_quote = price * order.quantity;
    }

    fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn live_stop_orders(&self) -> Vec<(String, f64)> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o)| o.state.is_live())
            .map(|(id, o)| (id.clone(), o.trigger))
            .collect()
    }

    fn stop_submission_count(&self) -> usize {
        self.stop_submissions.lock().unwrap().len()
    }

    fn market_submission_count(&self) -> usize {
        self.market_submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn get_candles(
        &self,
        _symbol: &Symbol,
        _interval: &str,
        _limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if let Some(series) = self.candle_series.lock().unwrap().clone() {
            return Ok(series);
        }

        let price = *self.price.lock().unwrap();
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Ok(vec![
            Candle::new(base, price, price, price, price, 100.0),
            Candle::new(base + chrono::Duration::minutes(1), price, price, price, price, 100.0),
        ])
    }

    async fn get_symbol_filters(&self, _symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        Ok(self.filters)
    }

    async fn submit_market_order(
        &self,
        _symbol: &Symbol,
        _side: Side,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError> {
        if let Some(scripted) = self.market_queue.lock().unwrap().pop_front() {
            return scripted;
        }

        self.market_submissions.lock().unwrap().push(quantity);
        let price = *self.price.lock().unwrap();
        let id = self.counter.fetch_add(1, Ordering::SeqCst);

        Ok(OrderResult {
            order_id: format!("mkt-{}", id),
            state: OrderState::Filled,
            executed_qty: quantity,
            fills: vec![OrderFill { price, quantity }],
        })
    }

    async fn submit_stop_order(
        &self,
        _symbol: &Symbol,
        _side: Side,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        if let Some(error) = self.stop_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("stop-{}", id);

        self.orders.lock().unwrap().insert(
            order_id.clone(),
            MockOrder {
                state: OrderState::New,
                quantity,
                trigger: trigger_price,
                executed_qty: 0.0,
                cumulative_quote: 0.0,
            },
        );
        self.stop_submissions
            .lock()
            .unwrap()
            .push((order_id.clone(), trigger_price));

        Ok(OrderResult {
            order_id,
            state: OrderState::New,
            executed_qty: 0.0,
            fills: vec![],
        })
    }

    async fn cancel_order(&self, _symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) => {
                if order.state.is_live() {
                    order.state = OrderState::Canceled;
                }
                self.cancelled.lock().unwrap().push(order_id.to_string());
                Ok(())
            }
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_order(
        &self,
        _symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderStatus, ExchangeError> {
        let orders = self.orders.lock().unwrap();
        match orders.get(order_id) {
            Some(order) => Ok(OrderStatus {
                order_id: order_id.to_string(),
                state: order.state,
                executed_qty: order.executed_qty,
                cumulative_quote_qty: order.cumulative_quote,
            }),
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        Ok(*self.balance.lock().unwrap())
    }
}

// =============================================================================
// Harness
// =============================================================================

const SYMBOL: &str = "ETHUSDT";

fn test_config() -> Config {
    Config {
        trading: TradingConfig {
            symbols: vec![SYMBOL.to_string()],
            defaults: SymbolConfig {
                protection: ProtectionPolicy::Trailing { fraction: 0.05 },
                sizing: Sizing::Notional { amount: 1000.0 },
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    exchange: Arc<MockExchange>,
    store: Arc<PositionStore>,
    engine: Engine,
    messages: Arc<Mutex<Vec<String>>>,
    _shutdown_tx: watch::Sender<bool>,
}

fn harness_with_config(exchange: Arc<MockExchange>, config: Config) -> Harness {
    let store = Arc::new(PositionStore::in_memory().unwrap());
    let (notifier, messages) = Notifier::memory();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Engine::new(
        config,
        exchange.clone(),
        store.clone(),
        notifier,
        shutdown_rx,
    );

    Harness {
        exchange,
        store,
        engine,
        messages,
        _shutdown_tx: shutdown_tx,
    }
}

fn harness(price: f64, balance: f64) -> Harness {
    harness_with_config(MockExchange::new(price, balance), test_config())
}

fn symbol() -> Symbol {
    Symbol::new(SYMBOL)
}

// =============================================================================
// Lifecycle scenarios
// =============================================================================

#[tokio::test]
async fn full_lifecycle_ratchet_and_close() {
    let h = harness(100.0, 10_000.0);

    // Entry at 100 with a 5% trail puts the initial stop at 95
    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();
    assert_relative_eq!(position.quantity, 10.0);
    assert_relative_eq!(position.entry_price, 100.0);
    assert_relative_eq!(position.stop_price, 95.0);
    let first_stop = position.protective_order_id.clone().unwrap();

    // Price rises to 110: stop ratchets to 104.5, old order cancelled
    h.exchange.set_price(110.0);
    h.engine.monitor().sweep().await;

    let ratcheted = h.store.get(position.id).unwrap().unwrap();
    assert_relative_eq!(ratcheted.stop_price, 104.5);
    let second_stop = ratcheted.protective_order_id.clone().unwrap();
    assert_ne!(first_stop, second_stop);
    assert!(h.exchange.cancelled_ids().contains(&first_stop));

    // Price dips to 105: candidate 99.75 is below the stop, nothing moves
    h.exchange.set_price(105.0);
    let submissions_before = h.exchange.stop_submission_count();
    h.engine.monitor().sweep().await;

    let unchanged = h.store.get(position.id).unwrap().unwrap();
    assert_relative_eq!(unchanged.stop_price, 104.5);
    assert_eq!(unchanged.protective_order_id.as_deref(), Some(second_stop.as_str()));
    assert_eq!(h.exchange.stop_submission_count(), submissions_before);

    // Price falls through the stop: the protective order fills and the
    // position closes with the stop-to-entry PnL
    h.exchange.fill_order(&second_stop, 104.5);
    h.engine.monitor().sweep().await;

    let closed = h.store.get(position.id).unwrap().unwrap();
    assert!(!closed.is_open());
    assert!(closed.closed_at.is_some());
    assert_relative_eq!(closed.realized_pnl.unwrap(), 45.0);
    assert_relative_eq!(closed.realized_pnl_pct.unwrap(), 4.5);
}

#[tokio::test]
async fn stop_never_moves_down() {
    let h = harness(100.0, 10_000.0);
    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();

    let mut last_stop = position.stop_price;
    for price in [110.0, 105.0, 108.0, 120.0, 90.0, 119.0, 121.0] {
        h.exchange.set_price(price);
        h.engine.monitor().sweep().await;

        let current = h.store.get(position.id).unwrap().unwrap();
        assert!(
            current.stop_price >= last_stop,
            "stop moved down at price {}: {} -> {}",
            price,
            last_stop,
            current.stop_price
        );
        last_stop = current.stop_price;
    }

    assert_relative_eq!(last_stop, 114.95); // 121 * 0.95, floored to tick
}

#[tokio::test]
async fn exactly_one_live_protective_order() {
    let h = harness(100.0, 10_000.0);
    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();

    for price in [102.0, 106.0, 111.0, 109.0, 115.0] {
        h.exchange.set_price(price);
        h.engine.monitor().sweep().await;
    }

    let live = h.exchange.live_stop_orders();
    assert_eq!(live.len(), 1, "expected one live stop, got {:?}", live);

    let stored = h.store.get(position.id).unwrap().unwrap();
    assert_eq!(stored.protective_order_id.as_deref(), Some(live[0].0.as_str()));
    assert_relative_eq!(live[0].1, stored.stop_price);
}

#[tokio::test]
async fn closed_position_is_never_touched_again() {
    let h = harness(100.0, 10_000.0);
    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();
    let stop_id = position.protective_order_id.clone().unwrap();

    h.exchange.fill_order(&stop_id, 95.0);
    h.engine.monitor().sweep().await;

    let closed = h.store.get(position.id).unwrap().unwrap();
    assert!(!closed.is_open());
    let pnl = closed.realized_pnl;
    let messages_after_close = h.messages.lock().unwrap().len();

    // Further sweeps see no open positions and change nothing
    h.exchange.set_price(200.0);
    h.engine.monitor().sweep().await;
    h.engine.monitor().sweep().await;

    let still_closed = h.store.get(position.id).unwrap().unwrap();
    assert!(!still_closed.is_open());
    assert_eq!(still_closed.realized_pnl, pnl);
    assert_relative_eq!(still_closed.stop_price, 95.0);
    assert_eq!(h.messages.lock().unwrap().len(), messages_after_close);
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
async fn failed_entry_records_nothing() {
    let h = harness(100.0, 10_000.0);
    h.exchange
        .queue_market_error(ExchangeError::InsufficientBalance("USDT".into()));

    let result = h.engine.executor().open_position(&symbol(), 100.0).await;
    assert!(result.is_err());

    assert!(h.store.all_positions().unwrap().is_empty());
    assert_eq!(h.exchange.stop_submission_count(), 0);

    let messages = h.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Entry order failed"));
}

#[tokio::test]
async fn protective_failure_persists_unprotected_position() {
    let h = harness(100.0, 10_000.0);
    h.exchange
        .queue_stop_failure(ExchangeError::InvalidRequest("bad trigger".into()));

    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();
    assert!(position.protective_order_id.is_none());
    assert!(position.is_open());
    assert_relative_eq!(position.stop_price, 95.0);

    assert!(h
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("URGENT")));

    // Next sweep repairs the protection at the stored stop before any
    // ratcheting happens
    h.engine.monitor().sweep().await;

    let repaired = h.store.get(position.id).unwrap().unwrap();
    let order_id = repaired.protective_order_id.clone().unwrap();
    assert_relative_eq!(repaired.stop_price, 95.0);

    let live = h.exchange.live_stop_orders();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].0, order_id);
    assert_relative_eq!(live[0].1, 95.0);

    // And the sweep after that resumes trailing
    h.exchange.set_price(110.0);
    h.engine.monitor().sweep().await;
    let ratcheted = h.store.get(position.id).unwrap().unwrap();
    assert_relative_eq!(ratcheted.stop_price, 104.5);
}

#[tokio::test]
async fn replacement_failure_leaves_recoverable_unprotected_state() {
    let h = harness(100.0, 10_000.0);
    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();

    // The cancel leg succeeds, the replacement leg fails
    h.exchange
        .queue_stop_failure(ExchangeError::Timeout("submit".into()));
    h.exchange.set_price(110.0);
    h.engine.monitor().sweep().await;

    let unprotected = h.store.get(position.id).unwrap().unwrap();
    assert!(unprotected.protective_order_id.is_none());
    assert_relative_eq!(unprotected.stop_price, 95.0);
    assert!(h.exchange.live_stop_orders().is_empty());

    // Next sweep restores protection at the stored stop
    h.engine.monitor().sweep().await;
    let repaired = h.store.get(position.id).unwrap().unwrap();
    assert!(repaired.protective_order_id.is_some());
    assert_relative_eq!(repaired.stop_price, 95.0);
    assert_eq!(h.exchange.live_stop_orders().len(), 1);
}

#[tokio::test]
async fn vanished_protective_order_is_replaced() {
    let h = harness(100.0, 10_000.0);

    let position = h
        .store
        .insert(&trailbot::store::NewPosition {
            symbol: SYMBOL.to_string(),
            quantity: 10.0,
            entry_price: 100.0,
            stop_price: 95.0,
            protective_order_id: Some("ghost".to_string()),
        })
        .unwrap();

    h.engine.monitor().sweep().await;

    let repaired = h.store.get(position.id).unwrap().unwrap();
    let order_id = repaired.protective_order_id.clone().unwrap();
    assert_ne!(order_id, "ghost");
    assert_eq!(h.exchange.live_stop_orders().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_ratchets_apply_once() {
    let h = harness(100.0, 10_000.0);

    let position = h
        .store
        .insert(&trailbot::store::NewPosition {
            symbol: SYMBOL.to_string(),
            quantity: 10.0,
            entry_price: 100.0,
            stop_price: 95.0,
            protective_order_id: Some("stop-0".to_string()),
        })
        .unwrap();
    h.exchange.seed_stop_order("stop-0", 10.0, 95.0);
    h.exchange.set_price(110.0);

    // Two overlapping ticks observe the same stale position
    let monitor_a = h.engine.monitor().clone();
    let monitor_b = h.engine.monitor().clone();
    let stale_a = position.clone();
    let stale_b = position.clone();

    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { monitor_a.check_position(stale_a).await }),
        tokio::spawn(async move { monitor_b.check_position(stale_b).await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    // The ratchet applied at most once and the store agrees with the single
    // live protective order, whatever the interleaving was
    let stored = h.store.get(position.id).unwrap().unwrap();
    assert!(
        stored.stop_price == 104.5 || stored.stop_price == 95.0,
        "unexpected stop {}",
        stored.stop_price
    );

    let live = h.exchange.live_stop_orders();
    assert_eq!(live.len(), 1, "expected one live stop, got {:?}", live);
    assert_eq!(stored.protective_order_id.as_deref(), Some(live[0].0.as_str()));
    assert_relative_eq!(live[0].1, stored.stop_price);
}

// =============================================================================
// Evaluation loop
// =============================================================================

#[tokio::test]
async fn signal_driven_entry_end_to_end() {
    let mut config = test_config();
    config.signal.macd_fast = 2;
    config.signal.macd_slow = 4;
    config.signal.macd_signal = 3;
    config.signal.rsi_period = 2;
    config.signal.rsi_entry_min = 0.0;
    config.signal.rsi_entry_max = 100.0;

    let exchange = MockExchange::new(12.0, 10_000.0);
    let h = harness_with_config(exchange, config);

    let mut closes = vec![10.0; 8];
    closes.push(9.0);
    closes.push(12.0);
    h.exchange.set_candles(&closes);

    let opened = h.engine.evaluate_symbol(&symbol()).await.unwrap();
    assert!(opened);

    let position = h.store.open_position_for(&symbol()).unwrap().unwrap();
    assert_relative_eq!(position.entry_price, 12.0);
    assert_relative_eq!(position.stop_price, 11.4);
    assert!(position.protective_order_id.is_some());

    // A second evaluation sees the open position and does not re-enter
    let reopened = h.engine.evaluate_symbol(&symbol()).await.unwrap();
    assert!(!reopened);
    assert_eq!(h.exchange.market_submission_count(), 1);
}

#[tokio::test]
async fn no_entry_without_signal() {
    let h = harness(100.0, 10_000.0);

    // Flat synthetic candles: no crossover, no entry
    let opened = h.engine.evaluate_symbol(&symbol()).await.unwrap();
    assert!(!opened);
    assert_eq!(h.exchange.market_submission_count(), 0);
    assert!(h.store.all_positions().unwrap().is_empty());
}

#[tokio::test]
async fn fixed_stop_policy_never_ratchets() {
    let mut config = test_config();
    config.trading.defaults.protection = ProtectionPolicy::Fixed { fraction: 0.05 };

    let exchange = MockExchange::new(100.0, 10_000.0);
    let h = harness_with_config(exchange, config);

    let position = h.engine.executor().open_position(&symbol(), 100.0).await.unwrap();
    let stop_id = position.protective_order_id.clone().unwrap();

    h.exchange.set_price(150.0);
    h.engine.monitor().sweep().await;

    let unchanged = h.store.get(position.id).unwrap().unwrap();
    assert_relative_eq!(unchanged.stop_price, 95.0);
    assert_eq!(unchanged.protective_order_id.as_deref(), Some(stop_id.as_str()));
    assert!(h.exchange.cancelled_ids().is_empty());

    // Fill detection still works
    h.exchange.fill_order(&stop_id, 95.0);
    h.engine.monitor().sweep().await;
    let closed = h.store.get(position.id).unwrap().unwrap();
    assert!(!closed.is_open());
    assert_relative_eq!(closed.realized_pnl.unwrap(), -50.0);
}

#[tokio::test]
async fn balance_gate_skips_small_entries() {
    // 15% of a 50 USDT balance is below the 10 USDT minimum notional
    let exchange = MockExchange::new(100.0, 50.0);
    let mut config = test_config();
    config.trading.defaults.sizing = Sizing::BalancePct { pct: 0.15 };
    let h = harness_with_config(exchange, config);

    let result = h.engine.executor().open_position(&symbol(), 100.0).await;
    assert!(matches!(
        result,
        Err(trailbot::executor::ExecutorError::BelowMinNotional { .. })
    ));
    assert_eq!(h.exchange.market_submission_count(), 0);
    assert!(h.store.all_positions().unwrap().is_empty());
}

//! Property tests for engine invariants.
//!
//! 1. Confidence is always within [0, 1]
//! 2. Stops sit on the losing side of entry at a positive distance
//! 3. Signals on one symbol are spaced by at least the cooldown
//! 4. Open risk never exceeds the portfolio cap, whatever the order flow
//! 5. Zone pruning is idempotent
//! 6. Positions written to the file store come back unchanged

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

use confluence_engine::config::{BiasConfig, PerSymbol};
use confluence_engine::execution::{AccountState, ExecutionEngine, Position, PositionStatus, SharedAccount};
use confluence_engine::persistence::{FileStore, PersistenceStore};
use confluence_engine::trading_core::bias::{confidence, FrameReading, ZonePresence};
use confluence_engine::trading_core::fvg::FvgDetector;
use confluence_engine::trading_core::order_block::OrderBlockDetector;
use confluence_engine::trading_core::signals::{Candidate, EntryZoneKind};
use confluence_engine::trading_core::{Signal, SignalGenerator, SymbolBias};
use confluence_engine::{Bias, Candle, Direction, EngineConfig, MarketRegime, Session, Side, Timeframe};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

fn candidate(symbol: &str, side: Side, entry: f64, confidence: f64, at: DateTime<Utc>) -> Candidate {
    Candidate {
        symbol: symbol.to_string(),
        timeframe: Timeframe::M15,
        side,
        entry,
        zone: EntryZoneKind::OrderBlock,
        zone_low: entry * 0.99,
        zone_high: entry * 1.01,
        invalidation: entry * 0.99,
        confidence,
        factors: Vec::new(),
        session: Session::at(at),
        regime: Some(MarketRegime::Trending),
        at,
    }
}

fn long_signal(symbol: &str, entry: f64, stop_distance: f64, at: DateTime<Utc>) -> Signal {
    let c = candidate(symbol, Side::Buy, entry, 0.8, at);
    Signal::new(
        &c,
        MarketRegime::Trending,
        entry - stop_distance,
        entry + 2.0 * stop_distance,
        Duration::hours(1),
    )
    .unwrap()
}

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_direction() -> impl Strategy<Value = Option<Direction>> {
    prop_oneof![
        Just(None),
        Just(Some(Direction::Bullish)),
        Just(Some(Direction::Bearish)),
    ]
}

fn arb_reading() -> impl Strategy<Value = FrameReading> {
    (
        arb_direction(),
        arb_direction(),
        arb_direction(),
        prop::array::uniform6(any::<bool>()),
    )
        .prop_map(|(trend, recent_break, recent_sweep, z)| FrameReading {
            timeframe: Timeframe::H1,
            trend,
            recent_break,
            recent_sweep,
            zones: ZonePresence {
                bullish_order_block: z[0],
                bearish_order_block: z[1],
                bullish_fvg: z[2],
                bearish_fvg: z[3],
                equal_highs: z[4],
                equal_lows: z[5],
            },
            at: t0(),
        })
}

fn arb_weights() -> impl Strategy<Value = BiasConfig> {
    (0.0..1.0_f64, 0.0..1.0_f64, 0.0..1.0_f64, 0.01..1.0_f64).prop_map(|(t, s, c, l)| BiasConfig {
        htf_trend_weight: t,
        structure_weight: s,
        confluence_weight: c,
        liquidity_weight: l,
        neutral_band: 0.2,
    })
}

/// Random-walk candles, valid OHLC, 15m apart
fn arb_candles(len: usize) -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::vec((-2.0..2.0_f64, 0.0..1.5_f64, 0.0..1.5_f64), len).prop_map(|steps| {
        let mut price = 100.0;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (delta, up, down))| {
                let open = price;
                let close = (price + delta).max(1.0);
                price = close;
                Candle {
                    symbol: "BTCUSDT".to_string(),
                    timeframe: Timeframe::M15,
                    open_time: t0() + Duration::minutes(15 * i as i64),
                    open,
                    high: open.max(close) + up,
                    low: (open.min(close) - down).max(0.5),
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    })
}

// ── 1. Confidence bounds ─────────────────────────────────────────────

proptest! {
    #[test]
    fn confidence_is_bounded(
        entry in arb_reading(),
        context in prop::collection::vec(arb_reading(), 0..4),
        weights in arb_weights(),
        bullish in any::<bool>(),
    ) {
        let direction = if bullish { Direction::Bullish } else { Direction::Bearish };
        let context: Vec<&FrameReading> = context.iter().collect();
        let c = confidence(direction, &entry, &context, &weights);
        prop_assert!(c.is_finite());
        prop_assert!((0.0..=1.0).contains(&c));
    }
}

// ── 2. Stop geometry ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn stop_is_beyond_entry(
        entry in 1.0..100_000.0_f64,
        offset in -0.2..0.4_f64,
        buy in any::<bool>(),
        conf in 0.0..=1.0_f64,
    ) {
        let config = Arc::new(EngineConfig::default());
        let exec = ExecutionEngine::new(
            config.clone(),
            SharedAccount::new(AccountState::new(config.starting_balance, t0())),
        );
        let side = if buy { Side::Buy } else { Side::Sell };
        // Positive offset puts invalidation on the losing side
        let invalidation = entry * (1.0 - side.sign() * offset);

        let levels = exec.exit_levels(side, entry, invalidation, conf).unwrap();
        let floor = entry * config.min_stop_distance_pct / 100.0;
        prop_assert!(levels.stop_distance > 0.0);
        prop_assert!(levels.stop_distance >= floor - 1e-9);
        prop_assert!(side.sign() * (entry - levels.stop_loss) > 0.0);
        prop_assert!(side.sign() * (levels.take_profit - entry) > 0.0);
        prop_assert!(levels.stop_loss > 0.0);
    }
}

// ── 3. Cooldown spacing ──────────────────────────────────────────────

proptest! {
    #[test]
    fn signals_respect_cooldown(
        gaps in prop::collection::vec(1i64..120, 1..60),
        fills in prop::collection::vec(any::<bool>(), 60),
    ) {
        let cooldown = Duration::minutes(60);
        let mut generator = SignalGenerator::new("BTCUSDT", 0.5, cooldown, Duration::minutes(30));
        let bias = SymbolBias {
            direction: Bias::Bullish,
            anchor: Some(Timeframe::H4),
            strength: 0.6,
        };

        let mut at = t0();
        let mut issued: Vec<DateTime<Utc>> = Vec::new();
        for (i, gap) in gaps.iter().enumerate() {
            at += Duration::minutes(*gap);
            generator.expire(at);
            let c = candidate("BTCUSDT", Side::Buy, 100.0, 0.8, at);
            if let Ok(regime) = generator.screen(&c, &bias, false) {
                let signal = generator.issue(&c, regime, 99.0, 102.0).unwrap();
                issued.push(signal.generated_at);
                if fills[i] {
                    generator.resolve(
                        signal.id,
                        confluence_engine::trading_core::SignalStatus::Executed,
                        None,
                    );
                }
            }
        }

        for pair in issued.windows(2) {
            prop_assert!(pair[1] - pair[0] >= cooldown);
        }
    }
}

// ── 4. Portfolio risk cap ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Open { symbol: usize, stop_distance: f64 },
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..6, 0.2..20.0_f64).prop_map(|(symbol, stop_distance)| Op::Open { symbol, stop_distance }),
        1 => (0usize..8).prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn open_risk_stays_under_cap(ops in prop::collection::vec(arb_op(), 1..40)) {
        let config = Arc::new(EngineConfig {
            starting_balance: 10_000.0,
            risk_per_trade: 0.02,
            max_portfolio_risk: 0.05,
            max_concurrent_positions: 4,
            qty_step: PerSymbol::uniform(0.01),
            ..Default::default()
        });
        let exec = ExecutionEngine::new(
            config.clone(),
            SharedAccount::new(AccountState::new(config.starting_balance, t0())),
        );

        let mut open: Vec<Position> = Vec::new();
        for op in ops {
            match op {
                Op::Open { symbol, stop_distance } => {
                    let signal = long_signal(&format!("SYM{}", symbol), 100.0, stop_distance, t0());
                    if let Ok((position, _)) = exec.open(&signal) {
                        open.push(position);
                    }
                }
                Op::Release(i) if !open.is_empty() => {
                    let position = open.remove(i % open.len());
                    exec.release(&position).unwrap();
                }
                Op::Release(_) => {}
            }

            let account = exec.account().snapshot().unwrap();
            prop_assert!(account.open_risk <= config.max_portfolio_risk * account.balance + 1e-6);
            prop_assert!(account.open_positions <= config.max_concurrent_positions);
            prop_assert_eq!(account.open_positions, open.len());
        }
    }
}

// ── 5. Pruning idempotence ───────────────────────────────────────────

proptest! {
    #[test]
    fn pruning_is_idempotent(candles in arb_candles(60), age_hours in 1u64..48) {
        let max_age = std::time::Duration::from_secs(age_hours * 3_600);
        let mut blocks = OrderBlockDetector::new(Default::default(), max_age);
        let mut gaps = FvgDetector::new(0.1, 0.75, max_age);

        for n in 1..=candles.len() {
            let window = &candles[..n];
            let now = window[n - 1].close_time();
            blocks.update(window);
            gaps.update(window);

            blocks.prune(now);
            gaps.prune(now);
            let kept_blocks = blocks.blocks().to_vec();
            let kept_gaps = gaps.gaps().to_vec();

            prop_assert!(blocks.prune(now).is_empty());
            prop_assert!(gaps.prune(now).is_empty());
            prop_assert_eq!(blocks.blocks(), kept_blocks.as_slice());
            prop_assert_eq!(gaps.gaps(), kept_gaps.as_slice());
            prop_assert!(blocks.blocks().iter().all(|b| !b.mitigated && !b.invalidated));
            prop_assert!(gaps.gaps().iter().all(|g| !g.filled));
        }
    }
}

// ── 6. File store round trip ─────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn file_store_round_trips_positions(
        entry in 1.0..50_000.0_f64,
        stop_distance in 0.01..100.0_f64,
        size in 0.001..1_000.0_f64,
        minutes in 0i64..100_000,
    ) {
        let at = t0() + Duration::minutes(minutes);
        let signal = long_signal("BTCUSDT", entry + stop_distance, stop_distance, at);
        let position = Position {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            side: signal.side,
            size,
            entry_price: signal.entry,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            risk_amount: size * stop_distance,
            status: PositionStatus::Pending,
            created_at: at,
            expires_at: signal.expires_at,
            entry_time: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        };

        let root = std::env::temp_dir().join(format!("confluence-prop-{}", Uuid::new_v4()));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let loaded = runtime.block_on(async {
            let store = FileStore::open(root.clone()).await.unwrap();
            store.save_signal(&signal).await.unwrap();
            store.save_trade(&position).await.unwrap();
            // Second write of the same id replaces, never duplicates
            store.save_trade(&position).await.unwrap();
            store.load_open_positions().await.unwrap()
        });
        let _ = std::fs::remove_dir_all(&root);

        prop_assert_eq!(loaded, vec![position]);
    }
}

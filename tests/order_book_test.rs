//! Order book reconstruction tests.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tickmux::book::{BookOutcome, OrderBookStore, ResnapshotReason, SequencePolicy};
use tickmux::models::{BookSide, LevelDelta, PriceLevel};

fn level(price: Decimal, amount: Decimal) -> PriceLevel {
    PriceLevel::new(price, amount)
}

#[test]
fn test_snapshot_then_deltas_yields_expected_book() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);

    let outcome = store.apply_snapshot(
        "BTC/USD",
        &[level(dec!(100), dec!(2)), level(dec!(98), dec!(1))],
        &[level(dec!(101), dec!(1))],
        1_000,
        Some(10),
    );
    assert!(matches!(outcome, BookOutcome::Changed(ref change) if change.is_snapshot));

    for (seq, price, amount) in [
        (11, dec!(99), dec!(5)),
        (12, dec!(100), dec!(0)),
        (13, dec!(98), dec!(0)),
    ] {
        let outcome = store.apply_delta("BTC/USD", BookSide::Bid, price, amount, Some(seq));
        assert!(matches!(outcome, BookOutcome::Changed(_)), "delta {seq} not applied");
    }

    let book = store.get("BTC/USD").expect("Book should exist");
    assert_eq!(book.bids, vec![level(dec!(99), dec!(5))]);
    assert_eq!(book.asks, vec![level(dec!(101), dec!(1))]);
    assert_eq!(book.sequence, Some(13));
    assert_eq!(book.spread(), Some(dec!(2)));
}

#[test]
fn test_removal_and_insertions_on_both_sides() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);
    store.apply_snapshot(
        "BTC/USD",
        &[level(dec!(100), dec!(2))],
        &[level(dec!(101), dec!(3))],
        0,
        Some(1),
    );

    store.apply_delta("BTC/USD", BookSide::Bid, dec!(100), dec!(0), Some(2));
    store.apply_delta("BTC/USD", BookSide::Bid, dec!(99), dec!(5), Some(3));
    store.apply_delta("BTC/USD", BookSide::Ask, dec!(101), dec!(1), Some(4));

    let book = store.get("BTC/USD").expect("Book should exist");
    assert_eq!(book.bids, vec![level(dec!(99), dec!(5))]);
    assert_eq!(book.asks, vec![level(dec!(101), dec!(1))]);
}

#[test]
fn test_stale_delta_is_rejected_under_strict_policy() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);
    store.apply_snapshot("BTC/USD", &[level(dec!(100), dec!(1))], &[], 0, Some(5));

    let outcome = store.apply_delta("BTC/USD", BookSide::Bid, dec!(99), dec!(1), Some(5));
    let BookOutcome::Resnapshot(reason) = outcome else {
        panic!("expected a resnapshot, got {outcome:?}");
    };
    assert_eq!(
        reason.to_error("BTC/USD").to_string(),
        "sequence gap on BTC/USD: expected 6, received 5"
    );
    let book = store.get("BTC/USD").expect("Book should exist");
    assert_eq!(book.bids, vec![level(dec!(100), dec!(1))]);
}

#[test]
fn test_delta_change_carries_only_touched_levels() {
    let mut store = OrderBookStore::new(SequencePolicy::Unchecked, 16);
    store.apply_snapshot(
        "ETH/USD",
        &[level(dec!(10), dec!(1)), level(dec!(9), dec!(1))],
        &[level(dec!(11), dec!(1))],
        1,
        None,
    );

    let outcome = store.apply_deltas(
        "ETH/USD",
        &[
            LevelDelta::new(BookSide::Bid, dec!(10), dec!(0)),
            LevelDelta::new(BookSide::Ask, dec!(12), dec!(4)),
        ],
        Some(2),
        None,
    );

    let BookOutcome::Changed(change) = outcome else {
        panic!("expected a change, got {outcome:?}");
    };
    assert!(!change.is_snapshot);
    assert_eq!(change.bids, vec![level(dec!(10), dec!(0))]);
    assert_eq!(change.asks, vec![level(dec!(12), dec!(4))]);
    assert_eq!(change.timestamp, 2);
}

#[test]
fn test_deltas_before_snapshot_are_replayed() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);

    // Seq 5 predates the snapshot and must be skipped; seq 7 applies on top.
    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Ask, dec!(105), dec!(9), Some(5)),
        BookOutcome::Buffered
    );
    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Ask, dec!(102), dec!(3), Some(7)),
        BookOutcome::Buffered
    );
    assert_eq!(store.buffered("BTC/USD"), 2);

    store.apply_snapshot(
        "BTC/USD",
        &[level(dec!(100), dec!(1))],
        &[level(dec!(101), dec!(1))],
        0,
        Some(6),
    );

    let book = store.get("BTC/USD").expect("Book should exist");
    assert_eq!(
        book.asks,
        vec![level(dec!(101), dec!(1)), level(dec!(102), dec!(3))]
    );
    assert_eq!(book.sequence, Some(7));
    assert_eq!(store.buffered("BTC/USD"), 0);
}

#[test]
fn test_sequence_gap_requests_exactly_one_resnapshot() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);
    store.apply_snapshot("BTC/USD", &[level(dec!(100), dec!(1))], &[], 0, Some(1));

    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(99), dec!(1), Some(3)),
        BookOutcome::Resnapshot(ResnapshotReason::SequenceGap {
            expected: 2,
            received: 3
        })
    );
    assert!(store.is_stale("BTC/USD"));
    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(98), dec!(1), Some(4)),
        BookOutcome::Buffered
    );

    // The stale book stays readable and untouched.
    let book = store.get("BTC/USD").expect("Stale book should remain readable");
    assert_eq!(book.bids, vec![level(dec!(100), dec!(1))]);

    store.apply_snapshot("BTC/USD", &[level(dec!(97), dec!(2))], &[], 5, Some(10));
    assert!(!store.is_stale("BTC/USD"));
    let book = store.get("BTC/USD").expect("Book should exist");
    assert_eq!(book.bids, vec![level(dec!(97), dec!(2))]);
}

#[test]
fn test_delta_after_maximum_sequence_is_a_gap() {
    let mut store = OrderBookStore::new(SequencePolicy::Strict, 16);
    store.apply_snapshot("BTC/USD", &[level(dec!(100), dec!(1))], &[], 0, Some(i64::MAX));

    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(99), dec!(1), Some(5)),
        BookOutcome::Resnapshot(ResnapshotReason::SequenceGap {
            expected: i64::MAX,
            received: 5
        })
    );
    assert!(store.is_stale("BTC/USD"));
}

#[test]
fn test_monotonic_policy_allows_gaps_but_not_regressions() {
    let mut store = OrderBookStore::new(SequencePolicy::Monotonic, 16);
    store.apply_snapshot("BTC/USD", &[], &[], 0, Some(100));

    assert!(matches!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(1), dec!(1), Some(150)),
        BookOutcome::Changed(_)
    ));
    assert!(matches!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(2), dec!(1), Some(120)),
        BookOutcome::Resnapshot(_)
    ));
}

#[test]
fn test_buffer_overflow_requests_resnapshot_once() {
    let mut store = OrderBookStore::new(SequencePolicy::Unchecked, 2);

    store.apply_delta("BTC/USD", BookSide::Bid, dec!(1), dec!(1), None);
    store.apply_delta("BTC/USD", BookSide::Bid, dec!(2), dec!(1), None);
    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(3), dec!(1), None),
        BookOutcome::Resnapshot(ResnapshotReason::BufferOverflow { limit: 2 })
    );
    store.apply_delta("BTC/USD", BookSide::Bid, dec!(4), dec!(1), None);
    store.apply_delta("BTC/USD", BookSide::Bid, dec!(5), dec!(1), None);
    assert_eq!(
        store.apply_delta("BTC/USD", BookSide::Bid, dec!(6), dec!(1), None),
        BookOutcome::Buffered
    );
    assert!(store.buffered("BTC/USD") <= 2);
}

/// Minimal deterministic generator so the test needs no extra crates.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn test_random_deltas_keep_ladders_sorted_and_unique() {
    let mut store = OrderBookStore::new(SequencePolicy::Unchecked, 16);
    store.apply_snapshot("BTC/USD", &[], &[], 0, None);
    let mut rng = Lcg(42);

    for _ in 0..2_000 {
        let side = if rng.next() % 2 == 0 {
            BookSide::Bid
        } else {
            BookSide::Ask
        };
        let price = Decimal::from(rng.next() % 50 + 1);
        // Roughly one in four updates removes a level.
        let amount = match rng.next() % 4 {
            0 => Decimal::ZERO,
            n => Decimal::from(n),
        };
        store.apply_delta("BTC/USD", side, price, amount, None);

        let book = store.get("BTC/USD").expect("Book should exist");
        assert!(book.bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(book.asks.windows(2).all(|w| w[0].price < w[1].price));
        assert!(book.bids.iter().chain(&book.asks).all(|l| l.amount > Decimal::ZERO));
    }
}

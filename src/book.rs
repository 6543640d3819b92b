//! Per-symbol order book reconstruction from snapshots and deltas.
//!
//! [`OrderBookStore`] keeps one sorted bid ladder (descending) and one ask
//! ladder (ascending) per symbol. Levels live in a `Vec` and are located by
//! binary search, so a delta costs one search plus one shift instead of a
//! full re-sort.
//!
//! Deltas that arrive before the first snapshot are buffered (bounded) and
//! replayed when the snapshot lands. When the exchange supplies sequence
//! numbers, a delta that breaks the [`SequencePolicy`] marks the book stale
//! and asks the caller for exactly one resnapshot; the stale book stays
//! readable until the replacement snapshot arrives.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::TickmuxError;
use crate::models::{BookChange, BookSide, LevelDelta, OrderBook, PriceLevel};

/// How delta sequence numbers are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Every delta must carry exactly `last + 1`.
    Strict,
    /// Deltas must carry a sequence greater than the last one; gaps are allowed.
    Monotonic,
    /// Sequence numbers are ignored and arrival order is trusted.
    Unchecked,
}

/// Why a book needs a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResnapshotReason {
    /// A delta broke the sequence policy.
    SequenceGap { expected: i64, received: i64 },
    /// Too many deltas arrived before any snapshot.
    BufferOverflow { limit: usize },
}

impl ResnapshotReason {
    /// The crate error describing this inconsistency for `symbol`.
    pub fn to_error(&self, symbol: &str) -> TickmuxError {
        match *self {
            Self::SequenceGap { expected, received } => TickmuxError::SequenceGap {
                symbol: symbol.to_string(),
                expected,
                received,
            },
            Self::BufferOverflow { limit } => TickmuxError::Protocol(format!(
                "{limit} deltas buffered for {symbol} without a snapshot"
            )),
        }
    }
}

/// Result of feeding one message into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum BookOutcome {
    /// The book changed; forward this event to subscribers.
    Changed(BookChange),
    /// The delta is held until a snapshot arrives.
    Buffered,
    /// The book is inconsistent; request a new snapshot.
    Resnapshot(ResnapshotReason),
}

/// One side of the book, kept sorted best-first.
#[derive(Debug, Clone)]
struct Ladder {
    side: BookSide,
    levels: Vec<PriceLevel>,
}

impl Ladder {
    fn new(side: BookSide) -> Self {
        Self {
            side,
            levels: Vec::new(),
        }
    }

    /// Builds a ladder from unsorted levels, dropping tombstones.
    ///
    /// When a price repeats, the last occurrence wins.
    fn from_levels(side: BookSide, levels: &[PriceLevel]) -> Self {
        let mut sorted: Vec<PriceLevel> = levels
            .iter()
            .rev()
            .filter(|level| level.amount > Decimal::ZERO)
            .copied()
            .collect();
        sorted.sort_by(|a, b| Self::order(side, a.price, b.price));
        sorted.dedup_by(|later, earlier| later.price == earlier.price);
        Self {
            side,
            levels: sorted,
        }
    }

    /// Best-first ordering: descending for bids, ascending for asks.
    fn order(side: BookSide, a: Decimal, b: Decimal) -> Ordering {
        match side {
            BookSide::Bid => b.cmp(&a),
            BookSide::Ask => a.cmp(&b),
        }
    }

    fn search(&self, price: Decimal) -> Result<usize, usize> {
        let side = self.side;
        self.levels
            .binary_search_by(|level| Self::order(side, level.price, price))
    }

    /// Upserts or removes one level, returning the change if any.
    fn apply(&mut self, price: Decimal, amount: Decimal) -> Option<PriceLevel> {
        match (self.search(price), amount.is_zero()) {
            (Ok(index), true) => {
                self.levels.remove(index);
                Some(PriceLevel::new(price, Decimal::ZERO))
            }
            (Ok(index), false) => {
                self.levels[index].amount = amount;
                Some(self.levels[index])
            }
            // Removing a level that does not exist is a no-op.
            (Err(_), true) => None,
            (Err(index), false) => {
                let level = PriceLevel::new(price, amount);
                self.levels.insert(index, level);
                Some(level)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Book {
    bids: Ladder,
    asks: Ladder,
    timestamp: i64,
    sequence: Option<i64>,
}

impl Book {
    fn to_order_book(&self, symbol: &str) -> OrderBook {
        OrderBook {
            symbol: symbol.to_string(),
            bids: self.bids.levels.clone(),
            asks: self.asks.levels.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Clone)]
struct BufferedDelta {
    levels: Vec<LevelDelta>,
    timestamp: Option<i64>,
    sequence: Option<i64>,
}

#[derive(Debug, Default)]
struct BookState {
    book: Option<Book>,
    /// `true` once a snapshot has been applied on this connection and no
    /// sequence break has been seen since.
    live: bool,
    resnapshot_requested: bool,
    buffer: VecDeque<BufferedDelta>,
}

/// Order books for every symbol on one connection.
#[derive(Debug)]
pub struct OrderBookStore {
    policy: SequencePolicy,
    buffer_limit: usize,
    books: HashMap<String, BookState>,
}

impl OrderBookStore {
    /// Creates a store. `buffer_limit` bounds the deltas held per symbol
    /// while waiting for a snapshot.
    #[must_use]
    pub fn new(policy: SequencePolicy, buffer_limit: usize) -> Self {
        Self {
            policy,
            buffer_limit,
            books: HashMap::new(),
        }
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    /// Replaces the book for `symbol` wholesale and replays any buffered
    /// deltas newer than the snapshot.
    pub fn apply_snapshot(
        &mut self,
        symbol: &str,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        timestamp: i64,
        sequence: Option<i64>,
    ) -> BookOutcome {
        let policy = self.policy;
        let state = self.books.entry(symbol.to_string()).or_default();

        state.book = Some(Book {
            bids: Ladder::from_levels(BookSide::Bid, bids),
            asks: Ladder::from_levels(BookSide::Ask, asks),
            timestamp,
            sequence,
        });
        state.live = true;
        state.resnapshot_requested = false;

        let buffered: Vec<BufferedDelta> = state.buffer.drain(..).collect();
        let mut replayed = 0usize;
        for delta in buffered {
            if let (Some(snap), Some(seq)) = (sequence, delta.sequence)
                && seq <= snap
            {
                continue;
            }
            if let Err(reason) = Self::merge(policy, symbol, state, &delta) {
                return Self::mark_stale(symbol, state, reason);
            }
            replayed += 1;
        }

        let Some(book) = state.book.as_ref() else {
            return BookOutcome::Buffered;
        };
        debug!(
            symbol,
            bids = book.bids.levels.len(),
            asks = book.asks.levels.len(),
            sequence = ?book.sequence,
            replayed,
            "Applied book snapshot"
        );

        BookOutcome::Changed(BookChange {
            symbol: symbol.to_string(),
            bids: book.bids.levels.clone(),
            asks: book.asks.levels.clone(),
            timestamp: book.timestamp,
            sequence: book.sequence,
            is_snapshot: true,
        })
    }

    /// Applies a single-level delta.
    pub fn apply_delta(
        &mut self,
        symbol: &str,
        side: BookSide,
        price: Decimal,
        amount: Decimal,
        sequence: Option<i64>,
    ) -> BookOutcome {
        self.apply_deltas(
            symbol,
            &[LevelDelta::new(side, price, amount)],
            None,
            sequence,
        )
    }

    /// Applies every level of one delta message, producing at most one
    /// change event.
    pub fn apply_deltas(
        &mut self,
        symbol: &str,
        levels: &[LevelDelta],
        timestamp: Option<i64>,
        sequence: Option<i64>,
    ) -> BookOutcome {
        let policy = self.policy;
        let limit = self.buffer_limit;
        let state = self.books.entry(symbol.to_string()).or_default();
        let delta = BufferedDelta {
            levels: levels.to_vec(),
            timestamp,
            sequence,
        };

        if !state.live {
            if state.buffer.len() >= limit {
                state.buffer.clear();
                if !state.resnapshot_requested {
                    state.resnapshot_requested = true;
                    warn!(symbol, limit, "Delta buffer overflowed before snapshot");
                    return BookOutcome::Resnapshot(ResnapshotReason::BufferOverflow { limit });
                }
            }
            state.buffer.push_back(delta);
            return BookOutcome::Buffered;
        }

        match Self::merge(policy, symbol, state, &delta) {
            Ok(change) => BookOutcome::Changed(change),
            Err(reason) => Self::mark_stale(symbol, state, reason),
        }
    }

    /// Validates the sequence and merges one delta into a live book.
    fn merge(
        policy: SequencePolicy,
        symbol: &str,
        state: &mut BookState,
        delta: &BufferedDelta,
    ) -> Result<BookChange, ResnapshotReason> {
        let Some(book) = state.book.as_mut() else {
            return Err(ResnapshotReason::SequenceGap {
                expected: 0,
                received: delta.sequence.unwrap_or_default(),
            });
        };

        if let (Some(last), Some(received)) = (book.sequence, delta.sequence) {
            // No sequence follows i64::MAX; anything after it needs a snapshot.
            let next = last.checked_add(1);
            let in_order = match policy {
                SequencePolicy::Strict => next == Some(received),
                SequencePolicy::Monotonic => received > last,
                SequencePolicy::Unchecked => true,
            };
            if !in_order {
                return Err(ResnapshotReason::SequenceGap {
                    expected: next.unwrap_or(last),
                    received,
                });
            }
        }

        let mut change = BookChange {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: book.timestamp,
            sequence: book.sequence,
            is_snapshot: false,
        };

        for level in &delta.levels {
            if level.amount < Decimal::ZERO {
                warn!(
                    symbol,
                    price = %level.price,
                    amount = %level.amount,
                    "Ignoring level with negative amount"
                );
                continue;
            }
            let (ladder, changed) = match level.side {
                BookSide::Bid => (&mut book.bids, &mut change.bids),
                BookSide::Ask => (&mut book.asks, &mut change.asks),
            };
            if let Some(applied) = ladder.apply(level.price, level.amount) {
                changed.push(applied);
            }
        }

        if let Some(timestamp) = delta.timestamp {
            book.timestamp = timestamp;
        }
        if delta.sequence.is_some() {
            book.sequence = delta.sequence;
        }
        change.timestamp = book.timestamp;
        change.sequence = book.sequence;

        Ok(change)
    }

    fn mark_stale(symbol: &str, state: &mut BookState, reason: ResnapshotReason) -> BookOutcome {
        state.live = false;
        state.buffer.clear();
        if state.resnapshot_requested {
            return BookOutcome::Buffered;
        }
        state.resnapshot_requested = true;
        warn!(symbol, ?reason, "Order book is stale, requesting resnapshot");
        BookOutcome::Resnapshot(reason)
    }

    /// Returns a copy of the current book for `symbol`.
    ///
    /// A stale book is still returned until its replacement snapshot lands.
    pub fn get(&self, symbol: &str) -> Option<OrderBook> {
        let state = self.books.get(symbol)?;
        state.book.as_ref().map(|book| book.to_order_book(symbol))
    }

    /// Returns `true` if `symbol` has a book that is waiting for a snapshot.
    pub fn is_stale(&self, symbol: &str) -> bool {
        self.books
            .get(symbol)
            .is_some_and(|state| state.book.is_some() && !state.live)
    }

    /// Number of deltas buffered for `symbol`.
    pub fn buffered(&self, symbol: &str) -> usize {
        self.books.get(symbol).map_or(0, |state| state.buffer.len())
    }

    /// Drops all state for `symbol`.
    pub fn remove(&mut self, symbol: &str) -> Option<OrderBook> {
        let state = self.books.remove(symbol)?;
        state.book.map(|book| book.to_order_book(symbol))
    }

    /// Marks every book as awaiting a fresh snapshot, e.g. after a reconnect.
    ///
    /// Existing books stay readable; buffered deltas are discarded because
    /// the new connection will resend everything.
    pub fn invalidate_all(&mut self) {
        for state in self.books.values_mut() {
            state.live = false;
            state.resnapshot_requested = false;
            state.buffer.clear();
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.books.keys().map(String::as_str)
    }
}

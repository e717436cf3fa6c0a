//! Materialized sort orders over the cached quotes.
//!
//! Three permutations of the quote array are kept: newest first, most popular
//! first and most controversial first. Popularity and controversy are built by
//! stably re-sorting the time order, so equal scores stay in chronological
//! order. Ascending reads walk the same arrays backward.
//!
//! Writers only flag that a rebuild is due ([`IndexGenerator::request_regenerate`]);
//! a background thread checks the flag every interval.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::index::Slot;
use crate::lock::SpinMutex;
use crate::model::Quote;
use crate::store::{CacheState, QuoteCache, QuoteHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Time,
    Popularity,
    Controversy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteOrder {
    TimeAsc,
    TimeDesc,
    PopularityAsc,
    PopularityDesc,
    ControversyAsc,
    ControversyDesc,
}

impl QuoteOrder {
    pub const ALL: [QuoteOrder; 6] = [
        QuoteOrder::TimeAsc,
        QuoteOrder::TimeDesc,
        QuoteOrder::PopularityAsc,
        QuoteOrder::PopularityDesc,
        QuoteOrder::ControversyAsc,
        QuoteOrder::ControversyDesc,
    ];

    pub fn key(self) -> SortKey {
        match self {
            QuoteOrder::TimeAsc | QuoteOrder::TimeDesc => SortKey::Time,
            QuoteOrder::PopularityAsc | QuoteOrder::PopularityDesc => SortKey::Popularity,
            QuoteOrder::ControversyAsc | QuoteOrder::ControversyDesc => SortKey::Controversy,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            QuoteOrder::TimeAsc | QuoteOrder::PopularityAsc | QuoteOrder::ControversyAsc => Direction::Ascending,
            _ => Direction::Descending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuoteOrder::TimeAsc => "time_asc",
            QuoteOrder::TimeDesc => "time_desc",
            QuoteOrder::PopularityAsc => "popularity_asc",
            QuoteOrder::PopularityDesc => "popularity_desc",
            QuoteOrder::ControversyAsc => "controversy_asc",
            QuoteOrder::ControversyDesc => "controversy_desc",
        }
    }
}

impl fmt::Display for QuoteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuoteOrder::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown quote order {s:?}"))
    }
}

/// The three descending permutations.
#[derive(Debug, Default, Clone)]
pub struct Orders {
    by_time: Vec<QuoteHandle>,
    by_popularity: Vec<QuoteHandle>,
    by_controversy: Vec<QuoteHandle>,
}

impl Orders {
    pub fn build(quotes: &[Quote]) -> Self {
        let mut by_time: Vec<usize> = (0..quotes.len()).collect();
        by_time.sort_by(|&a, &b| quotes[b].created_at.cmp(&quotes[a].created_at));

        // sort_by is stable: equal scores keep the time order
        let mut by_popularity = by_time.clone();
        by_popularity.sort_by(|&a, &b| desc(quotes[a].stats.popularity, quotes[b].stats.popularity));

        let mut by_controversy = by_time.clone();
        by_controversy.sort_by(|&a, &b| desc(quotes[a].stats.controversy, quotes[b].stats.controversy));

        let handles = |order: Vec<usize>| -> Vec<QuoteHandle> {
            order
                .into_iter()
                .map(|i| QuoteHandle { slot: Slot(i as u32), id: quotes[i].id })
                .collect()
        };
        Self {
            by_time: handles(by_time),
            by_popularity: handles(by_popularity),
            by_controversy: handles(by_controversy),
        }
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    pub fn sequence(&self, key: SortKey) -> &[QuoteHandle] {
        match key {
            SortKey::Time => &self.by_time,
            SortKey::Popularity => &self.by_popularity,
            SortKey::Controversy => &self.by_controversy,
        }
    }

    /// Up to `count` handles starting at logical position `offset` of `order`.
    pub fn page(&self, order: QuoteOrder, count: usize, offset: usize) -> Vec<QuoteHandle> {
        let seq = self.sequence(order.key());
        let len = seq.len();
        if offset >= len {
            return Vec::new();
        }
        let take = count.min(len - offset);
        match order.direction() {
            Direction::Descending => seq[offset..offset + take].to_vec(),
            Direction::Ascending => {
                let real = len - offset - 1;
                (0..take).map(|i| seq[real - i]).collect()
            }
        }
    }
}

fn desc(a: f32, b: f32) -> CmpOrdering {
    b.partial_cmp(&a).unwrap_or(CmpOrdering::Equal)
}

#[derive(Default)]
struct GeneratorState {
    orders: Orders,
    active: bool,
}

struct Ticker {
    wake: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

pub struct IndexGenerator {
    interval: Duration,
    pending: AtomicBool,
    state: SpinMutex<GeneratorState>,
    ticker: Mutex<Option<Ticker>>,
}

impl IndexGenerator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: AtomicBool::new(false),
            state: SpinMutex::new(GeneratorState::default()),
            ticker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Marks the orders stale; the next tick rebuilds them.
    pub fn request_regenerate(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Rebuilds all three orders now.
    pub fn force_regenerate(&self, cache: &QuoteCache) {
        let view = cache.read();
        self.rebuild(&view);
    }

    /// Rebuild from a state the caller already holds shared access to.
    pub fn rebuild(&self, view: &CacheState) {
        let orders = Orders::build(view.quotes());
        debug!(quotes = orders.len(), "regenerated quote orders");
        self.state.lock().orders = orders;
    }

    /// One periodic check. Returns false once the generator has been stopped;
    /// a pending request then stays pending for the next start.
    pub fn tick(&self, cache: &QuoteCache) -> bool {
        if !self.state.lock().active {
            return false;
        }
        if !self.pending.swap(false, Ordering::AcqRel) {
            return true;
        }
        let view = cache.read();
        let mut state = self.state.lock();
        if !state.active {
            self.pending.store(true, Ordering::Release);
            return false;
        }
        state.orders = Orders::build(view.quotes());
        debug!(quotes = state.orders.len(), "regenerated quote orders on request");
        true
    }

    /// Handles for one page of `order`, taken from the last generated orders.
    pub fn page(&self, order: QuoteOrder, count: usize, offset: usize) -> Vec<QuoteHandle> {
        self.state.lock().orders.page(order, count, offset)
    }

    /// Copy of the last generated orders.
    pub fn orders(&self) -> Orders {
        self.state.lock().orders.clone()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Spawns the periodic task. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>, cache: Arc<QuoteCache>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            warn!("index generator already running");
            return;
        }
        self.state.lock().active = true;

        let wake = Arc::new((Mutex::new(false), Condvar::new()));
        let generator = Arc::clone(self);
        let signal = Arc::clone(&wake);
        let handle = thread::spawn(move || generator.run(&cache, &signal));
        info!(interval_secs = self.interval.as_secs(), "index generator started");
        *ticker = Some(Ticker { wake, handle });
    }

    fn run(&self, cache: &QuoteCache, wake: &(Mutex<bool>, Condvar)) {
        let (stopped, cvar) = wake;
        loop {
            {
                let mut stopped = stopped.lock();
                if !*stopped {
                    cvar.wait_for(&mut stopped, self.interval);
                }
                if *stopped {
                    break;
                }
            }
            if !self.tick(cache) {
                break;
            }
        }
        debug!("index generator thread exiting");
    }

    /// Cancels the periodic task and waits for an in-flight rebuild to finish.
    /// Safe to call any number of times, but not while holding the cache lock:
    /// the rebuild being waited for may need it.
    pub fn stop(&self) {
        self.state.lock().active = false;
        let Some(ticker) = self.ticker.lock().take() else { return };
        {
            let (stopped, cvar) = &*ticker.wake;
            *stopped.lock() = true;
            cvar.notify_all();
        }
        if ticker.handle.join().is_err() {
            warn!("index generator thread panicked");
        }
        info!("index generator stopped");
    }
}

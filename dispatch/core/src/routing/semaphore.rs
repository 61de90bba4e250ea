//! Per-Provider Concurrency Management
//!
//! Bounds the number of simultaneous in-flight calls to each provider, with
//! an optional reservoir bucket and a pause between acquiring a permit and
//! starting the request.
//!
//! # Acquire Flow
//!
//! ```text
//! acquire(provider)
//!     |
//!     v
//! [reservoir]  take a token, or sleep until the next refresh and retry
//!     |
//!     v
//! [semaphore]  free slot and empty queue -> take it
//!              otherwise                 -> join FIFO queue, wait for hand-off
//!     |
//!     v
//! [spacing]    sleep min_time_between
//!     |
//!     v
//! ConcurrencyPermit (released exactly once, on drop)
//! ```
//!
//! Releasing a permit hands it straight to the oldest live waiter. A waiter
//! whose acquire future is dropped leaves the queue, and a permit already
//! handed to it is passed on. A reservoir token taken by an abandoned acquire
//! goes back to the reservoir unless the reservoir has refreshed since.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::config::{ConcurrencyLimits, ConcurrencySettings, ReservoirSettings};

// ============================================================================
// Errors and Status
// ============================================================================

/// No permit became available within the caller's timeout
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Timed out after {timeout_ms}ms waiting for a concurrency permit for {provider}")]
pub struct PermitTimeout {
    pub provider: String,
    pub timeout_ms: u64,
}

/// Point-in-time view of a provider's slots
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrencyStatus {
    /// Free permits
    pub available: u32,
    /// Configured maximum
    pub max: u32,
    /// Acquirers queued for a permit
    pub waiting: usize,
    /// Permits currently held
    pub in_flight: u32,
    /// Highest `in_flight` observed
    pub peak_in_flight: u32,
}

// ============================================================================
// Provider State
// ============================================================================

struct ReservoirState {
    settings: ReservoirSettings,
    tokens: u32,
    last_refresh: Instant,
}

impl ReservoirState {
    fn new(settings: ReservoirSettings, now: Instant) -> Self {
        Self {
            settings,
            tokens: settings.capacity,
            last_refresh: now,
        }
    }

    /// Refill to capacity if an interval has passed; true when refilled
    fn refresh(&mut self, now: Instant) -> bool {
        let interval = self.settings.refresh_interval;
        if interval.is_zero() {
            self.tokens = self.settings.capacity;
            self.last_refresh = now;
            return true;
        }
        let elapsed = now.saturating_duration_since(self.last_refresh);
        if elapsed >= interval {
            let periods = (elapsed.as_nanos() / interval.as_nanos()) as u32;
            self.tokens = self.settings.capacity;
            self.last_refresh += interval * periods;
            return true;
        }
        false
    }

    /// Take a token, or report how long until the next refresh
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            let next = self.last_refresh + self.settings.refresh_interval;
            Err(next.saturating_duration_since(now).max(Duration::from_millis(1)))
        }
    }
}

struct ProviderSlots {
    limits: ConcurrencyLimits,
    in_flight: u32,
    peak_in_flight: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
    reservoir: Option<ReservoirState>,
    /// Bumped on every reservoir refresh or replacement
    reservoir_generation: u64,
}

impl ProviderSlots {
    fn new(limits: ConcurrencyLimits) -> Self {
        let now = Instant::now();
        Self {
            limits,
            in_flight: 0,
            peak_in_flight: 0,
            waiters: VecDeque::new(),
            reservoir: limits.reservoir.map(|r| ReservoirState::new(r, now)),
            reservoir_generation: 0,
        }
    }

    /// Take a reservoir token
    ///
    /// Returns the generation the token belongs to, `None` without a
    /// reservoir, or the wait until the next refresh.
    fn take_reservoir(&mut self, now: Instant) -> Result<Option<u64>, Duration> {
        let Some(reservoir) = self.reservoir.as_mut() else {
            return Ok(None);
        };
        if reservoir.refresh(now) {
            self.reservoir_generation += 1;
        }
        reservoir.try_take(now)?;
        Ok(Some(self.reservoir_generation))
    }

    /// Give back an unused token taken in `generation`
    fn restore_reservoir(&mut self, generation: u64) {
        if generation != self.reservoir_generation {
            return;
        }
        if let Some(reservoir) = self.reservoir.as_mut() {
            reservoir.tokens = (reservoir.tokens + 1).min(reservoir.settings.capacity);
        }
    }

    fn status(&self) -> ConcurrencyStatus {
        ConcurrencyStatus {
            available: self.limits.max_concurrent.saturating_sub(self.in_flight),
            max: self.limits.max_concurrent,
            waiting: self.live_waiters(),
            in_flight: self.in_flight,
            peak_in_flight: self.peak_in_flight,
        }
    }

    fn grant(&mut self) {
        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
    }

    /// Hand free permits to the oldest live waiters
    fn dispatch_waiters(&mut self) {
        while self.in_flight < self.limits.max_concurrent {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                self.grant();
            }
        }
    }

    fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.dispatch_waiters();
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn update_limits(&mut self, limits: ConcurrencyLimits) {
        if limits.reservoir != self.limits.reservoir {
            let now = Instant::now();
            self.reservoir = limits.reservoir.map(|r| ReservoirState::new(r, now));
            self.reservoir_generation += 1;
        }
        self.limits = limits;
        self.dispatch_waiters();
    }
}

type SharedSlots = Arc<Mutex<ProviderSlots>>;

/// A queued acquire; leaving the queue early passes on any granted permit
struct PendingAcquire {
    rx: oneshot::Receiver<()>,
    slots: SharedSlots,
    done: bool,
}

impl PendingAcquire {
    async fn granted(mut self) {
        // The sender lives in the queue until it sends, so this only
        // resolves on a hand-off.
        let _ = (&mut self.rx).await;
        self.done = true;
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.slots.lock().release();
        }
    }
}

/// A reservoir token held by an acquire that has not finished yet
struct ReservoirClaim {
    slots: SharedSlots,
    generation: Option<u64>,
}

impl ReservoirClaim {
    /// The acquire completed; the token stays spent
    fn keep(mut self) {
        self.generation = None;
    }
}

impl Drop for ReservoirClaim {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            self.slots.lock().restore_reservoir(generation);
        }
    }
}

// ============================================================================
// Permit
// ============================================================================

/// RAII handle for one acquired slot
///
/// Dropping the permit releases it. `release` does the same explicitly.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct ConcurrencyPermit {
    provider: String,
    slots: SharedSlots,
    acquired_at: Instant,
}

impl ConcurrencyPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// How long the permit has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.slots.lock().release();
    }
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("provider", &self.provider)
            .finish()
    }
}

// ============================================================================
// Concurrency Manager
// ============================================================================

/// Per-provider concurrency limiter
pub struct ConcurrencyManager {
    providers: DashMap<String, SharedSlots>,
    default_limits: RwLock<ConcurrencyLimits>,
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(&ConcurrencySettings::default())
    }
}

impl ConcurrencyManager {
    pub fn new(settings: &ConcurrencySettings) -> Self {
        let manager = Self {
            providers: DashMap::new(),
            default_limits: RwLock::new(settings.default_limits),
        };
        manager.apply_settings(settings);
        manager
    }

    /// Apply a full settings table (hot reload)
    ///
    /// Every live provider takes the limits the new table gives it, so
    /// providers created from the old default follow the new default and a
    /// removed provider table falls back to it.
    pub fn apply_settings(&self, settings: &ConcurrencySettings) {
        *self.default_limits.write() = settings.default_limits;

        let live: Vec<(String, SharedSlots)> = self
            .providers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (provider, slots) in live {
            slots.lock().update_limits(settings.limits_for(&provider));
        }
        for (provider, limits) in &settings.providers {
            self.update_limits(provider, *limits);
        }
    }

    fn existing(&self, provider: &str) -> Option<SharedSlots> {
        self.providers.get(provider).map(|e| Arc::clone(e.value()))
    }

    fn slots(&self, provider: &str) -> SharedSlots {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderSlots::new(*self.default_limits.read()))))
            .clone()
    }

    /// Acquire a permit, waiting as long as it takes
    pub async fn acquire(&self, provider: &str) -> ConcurrencyPermit {
        let slots = self.slots(provider);
        let start = Instant::now();

        // Reservoir refresh wait
        let claim = loop {
            let taken = slots.lock().take_reservoir(Instant::now());
            match taken {
                Ok(generation) => {
                    break ReservoirClaim {
                        slots: Arc::clone(&slots),
                        generation,
                    }
                }
                Err(delay) => {
                    tracing::debug!(
                        provider = %provider,
                        delay_ms = delay.as_millis() as u64,
                        "Reservoir empty, waiting for refresh"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let pending = {
            let mut state = slots.lock();
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.is_empty() && state.in_flight < state.limits.max_concurrent {
                state.grant();
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(PendingAcquire {
                    rx,
                    slots: Arc::clone(&slots),
                    done: false,
                })
            }
        };
        if let Some(pending) = pending {
            tracing::debug!(provider = %provider, "Waiting for concurrency permit");
            pending.granted().await;
        }

        let permit = ConcurrencyPermit {
            provider: provider.to_string(),
            slots: Arc::clone(&slots),
            acquired_at: Instant::now(),
        };

        let spacing = slots.lock().limits.min_time_between;
        if let Some(spacing) = spacing {
            // Request spacing
            tokio::time::sleep(spacing).await;
        }
        claim.keep();

        tracing::trace!(
            provider = %provider,
            waited_ms = start.elapsed().as_millis() as u64,
            "Concurrency permit acquired"
        );
        permit
    }

    /// Acquire a permit, giving up after `timeout`
    pub async fn acquire_timeout(
        &self,
        provider: &str,
        timeout: Duration,
    ) -> Result<ConcurrencyPermit, PermitTimeout> {
        tokio::time::timeout(timeout, self.acquire(provider))
            .await
            .map_err(|_| PermitTimeout {
                provider: provider.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Slot status; a provider never acquired reports idle default limits
    pub fn get_status(&self, provider: &str) -> ConcurrencyStatus {
        match self.existing(provider) {
            Some(slots) => slots.lock().status(),
            None => {
                let max = self.default_limits.read().max_concurrent;
                ConcurrencyStatus {
                    available: max,
                    max,
                    waiting: 0,
                    in_flight: 0,
                    peak_in_flight: 0,
                }
            }
        }
    }

    /// Current limits for a provider
    pub fn limits(&self, provider: &str) -> ConcurrencyLimits {
        match self.existing(provider) {
            Some(slots) => slots.lock().limits,
            None => *self.default_limits.read(),
        }
    }

    /// Providers with live slot state
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Replace a provider's limits
    ///
    /// Raising the maximum wakes queued waiters. Lowering it below the
    /// in-flight count only stops new grants until enough permits return.
    pub fn update_limits(&self, provider: &str, limits: ConcurrencyLimits) {
        self.slots(provider).lock().update_limits(limits);
        tracing::debug!(
            provider = %provider,
            max_concurrent = limits.max_concurrent,
            "Concurrency limits updated"
        );
    }
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ConcurrencyManager")
            .field("providers", &providers)
            .finish()
    }
}

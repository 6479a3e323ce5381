//! # Timing System
//!
//! The single global clock of the emulated machine.
//!
//! ## Philosophy
//!
//! **Time only moves when the execution loop says so.**
//!
//! The clock is split into slices. At the start of a slice the CPU backend
//! is granted a budget (the downcount) and charges executed cycles against
//! it through [`Clock::consume`]. [`TimingSystem::advance`] closes the
//! slice: it folds the executed cycles (or the idle period, when nothing
//! ran) into the global tick count and opens the next slice.
//!
//! Ticks are monotonic: every call to `advance` after a slice that either
//! executed or idled moves the clock forward.

use crate::config::TimingConfig;
use hal::Clock;
use state_stream::StateStream;

/// Global clock and slice bookkeeping
///
/// # Examples
///
/// ```
/// use emu_kernel::timer::TimingSystem;
/// use emu_kernel::config::TimingConfig;
/// use hal::Clock;
///
/// let mut timing = TimingSystem::with_config(TimingConfig {
///     slice_ticks: 100,
///     idle_ticks: 40,
/// });
///
/// timing.consume(30);
/// timing.advance();
/// assert_eq!(timing.ticks(), 30);
///
/// timing.idle();
/// timing.advance();
/// assert_eq!(timing.ticks(), 70);
/// ```
#[derive(Debug, Clone)]
pub struct TimingSystem {
    config: TimingConfig,
    /// Ticks folded in by completed slices
    ticks: u64,
    /// Budget granted to the current slice
    slice_length: u64,
    /// Budget left in the current slice
    downcount: u64,
    /// Set when the current slice is spent idling
    idling: bool,
    /// Ticks spent idling since boot
    idle_total: u64,
}

impl TimingSystem {
    pub fn new() -> Self {
        Self::with_config(TimingConfig::default())
    }

    pub fn with_config(config: TimingConfig) -> Self {
        Self {
            slice_length: config.slice_ticks,
            downcount: config.slice_ticks,
            config,
            ticks: 0,
            idling: false,
            idle_total: 0,
        }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Marks the current slice as idle
    ///
    /// The next `advance` adds the configured idle period instead of
    /// waiting for executed cycles.
    pub fn idle(&mut self) {
        self.idling = true;
    }

    pub fn is_idling(&self) -> bool {
        self.idling
    }

    /// Cycles executed so far in the current slice
    pub fn executed_in_slice(&self) -> u64 {
        self.slice_length - self.downcount
    }

    /// Closes the current slice and opens the next one
    pub fn advance(&mut self) {
        let executed = self.executed_in_slice();
        let idled = if self.idling {
            self.config.idle_ticks
        } else {
            0
        };

        self.ticks += executed + idled;
        self.idle_total += idled;
        self.idling = false;

        self.slice_length = self.config.slice_ticks;
        self.downcount = self.config.slice_ticks;
    }

    /// Ticks spent idling since boot
    pub fn idle_ticks(&self) -> u64 {
        self.idle_total
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Timing", 1, |s| {
            s.absorb(&mut self.ticks);
            s.absorb(&mut self.slice_length);
            s.absorb(&mut self.downcount);
            s.absorb(&mut self.idling);
            s.absorb(&mut self.idle_total);
        });
    }
}

impl Default for TimingSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TimingSystem {
    fn ticks(&self) -> u64 {
        self.ticks + self.executed_in_slice()
    }

    fn downcount(&self) -> u64 {
        self.downcount
    }

    fn consume(&mut self, cycles: u64) {
        self.downcount = self.downcount.saturating_sub(cycles);
    }
}

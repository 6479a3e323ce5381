//! # Clock
//!
//! Hardware abstraction for the single global clock of the emulated machine.
//!
//! ## Design Principles
//!
//! 1. **Monotonic**: Ticks never go backwards
//! 2. **Sliced**: Execution is granted a budget (the downcount) per slice
//! 3. **Explicit**: The clock only moves when the execution loop or the
//!    CPU backend tells it to
//!
//! The concrete timing service lives in the kernel crate; CPU backends
//! only see this trait, through which they charge executed cycles.

/// The global clock as seen by a CPU backend
///
/// # Examples
///
/// ```
/// use hal::Clock;
///
/// fn run_budget<C: Clock>(clock: &mut C) -> u64 {
///     let mut executed = 0;
///     while clock.downcount() > 0 {
///         clock.consume(1);
///         executed += 1;
///     }
///     executed
/// }
/// ```
pub trait Clock {
    /// Total ticks since boot
    fn ticks(&self) -> u64;

    /// Cycles left in the current slice
    fn downcount(&self) -> u64;

    /// Charges executed cycles against the current slice
    ///
    /// Charging more than the remaining downcount saturates at zero.
    fn consume(&mut self, cycles: u64);
}

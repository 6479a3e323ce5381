//! # State Stream
//!
//! Versioned, section-tagged save/restore of machine state.
//!
//! ## Philosophy
//!
//! One code path for both directions. Each entity writes a `do_state`
//! method that opens its section and absorbs its fields; the stream's mode
//! decides whether that saves, loads or just measures.
//!
//! ## Example
//!
//! ```
//! use state_stream::StateStream;
//!
//! let mut count = 3u32;
//! let mut name = String::from("Main");
//!
//! let mut out = StateStream::writer();
//! out.section("Thread", 1, |s| {
//!     s.absorb(&mut count);
//!     s.absorb(&mut name);
//! });
//!
//! let (mut count2, mut name2) = (0u32, String::new());
//! let mut input = StateStream::reader(out.into_bytes());
//! assert!(input.section("Thread", 1, |s| {
//!     s.absorb(&mut count2);
//!     s.absorb(&mut name2);
//! }));
//! assert_eq!((count2, name2.as_str()), (3, "Main"));
//! ```

pub mod absorb;
pub mod stream;

pub use absorb::Absorb;
pub use stream::{StateStream, StreamError, StreamMode};

//! # sbuffer - two-reader shared buffer
//!
//! An insertion-ordered buffer written by one producer and drained,
//! independently and at different speeds, by exactly two readers: analytics and
//! persistence. Every value is delivered to each reader once, in insertion
//! order, and is released only after both readers have seen it.
//!
//! ## Writing
//!
//! ```rust
//! use sbuffer::SharedBuffer;
//! use std::time::Duration;
//!
//! let buffer = SharedBuffer::new(Duration::from_secs(10));
//! buffer.insert(21.5_f64)?;
//! # Ok::<(), sbuffer::SBufferError>(())
//! ```
//!
//! An insert also releases every value both readers are done with, so a busy
//! buffer stays bounded by the slower reader's backlog.
//!
//! ## Reading
//!
//! ```rust
//! use sbuffer::{Read, ReaderId, SharedBuffer};
//! use std::time::Duration;
//!
//! let buffer = SharedBuffer::new(Duration::from_millis(10));
//! buffer.insert(1)?;
//! buffer.insert(2)?;
//!
//! assert_eq!(buffer.read(ReaderId::Analytics, false), Read::Item { value: 1, more: true });
//! assert_eq!(buffer.read(ReaderId::Analytics, false), Read::Item { value: 2, more: false });
//! assert_eq!(buffer.read(ReaderId::Analytics, false), Read::Empty);
//!
//! // the persistence reader has its own progress
//! assert_eq!(buffer.read(ReaderId::Persistence, false), Read::Item { value: 1, more: true });
//! # Ok::<(), sbuffer::SBufferError>(())
//! ```
//!
//! ### Waiting for data
//!
//! A blocking read waits for an insert, but never longer than the wait timeout
//! given to [`SharedBuffer::new`], so the caller regains control regularly:
//!
//! ```rust
//! use sbuffer::{Read, ReaderId, SharedBuffer};
//! use std::time::Duration;
//!
//! let buffer: SharedBuffer<u32> = SharedBuffer::new(Duration::from_millis(10));
//! assert_eq!(buffer.read(ReaderId::Persistence, true), Read::TimedOut);
//! ```
//!
//! [`SharedBuffer::interrupt`] wakes blocked readers early, e.g. at shutdown.
//!
//! ## Maintenance
//!
//! [`SharedBuffer::remove_consumed`] runs the same release sweep as an insert
//! and is meant for idle periods with no inserts.

pub use buffer::{Read, ReaderId, SharedBuffer};
pub use error::SBufferError;

pub mod buffer;
pub mod error;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod sync;

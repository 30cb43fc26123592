//! # cdda-paranoia
//!
//! CD audio extraction that survives unreliable drives.
//!
//! Raw audio reads from optical drives are not deterministic: repeated reads
//! of the same region can land a few bytes off ("jitter"), drift by a
//! growing amount, or come back damaged. This crate reads every region more
//! than once, keeps only what independent reads agree on, and stitches the
//! result into a single verified stream.
//!
//! ## Features
//!
//! - Two-stage verification with overlap detection and rift repair
//! - Detection and repair of dropped/duplicated samples
//! - Dynamic overlap adjustment and drift correction based on drive behavior
//! - Bounded retries with shrinking batches at the drive layer
//! - Progress callbacks for monitoring extraction status
//!
//! ## Example
//!
//! ```
//! use cdda_paranoia::{CdromDrive, MemoryDisc, Paranoia, ParanoiaMode, CD_FRAMEWORDS};
//!
//! let drive = CdromDrive::open(MemoryDisc::new(20))?;
//! let mut paranoia = Paranoia::open(drive);
//! paranoia.set_mode(ParanoiaMode::FULL);
//!
//! for frame in paranoia.iter() {
//!     assert_eq!(frame?.len(), CD_FRAMEWORDS);
//! }
//! # Ok::<(), cdda_paranoia::Error>(())
//! ```
//!
//! Real drives plug in by implementing [`SectorSource`].

pub mod cache;
pub mod constants;
pub mod error;
pub mod gap;
pub mod overlap;
pub mod source;
pub mod types;

mod block;
mod cdda;
mod isort;
mod paranoia;

pub use block::{CBlock, RootBlock, VFragment};
pub use cdda::CdromDrive;
pub use constants::*;
pub use error::{Error, Result, TransportError};
pub use isort::SortInfo;
pub use paranoia::{Paranoia, ParanoiaIter};
pub use source::{MemoryDisc, SectorSource};
pub use types::*;

//! # Updater - Partition Fetch-and-Merge
//!
//! Keeps one partition directory in step with a remote, versioned source of
//! truth. Each partition is a pair of logs, a `cueball` index and a `curly`
//! value log, stored as one base and any number of deltas per log.
//!
//! ## Update flow
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PartitionUpdater                      │
//! │                                                          │
//! │ Fetcher ─► copy missing bases/deltas (FileSource)        │
//! │    │                                                     │
//! │    v                                                     │
//! │ CurlyMerger ─► <v>.base.curly.staged + OffsetAdjustments │
//! │    │                                                     │
//! │    v                                                     │
//! │ CueballMerger + OffsetTransform ─► <v>.base.cueball      │
//! │    │                                                     │
//! │    v                                                     │
//! │ rename staged ─► <v>.base.curly        (commit point)    │
//! │    │                                                     │
//! │    v                                                     │
//! │ delete older bases and merged deltas                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                |
//! |----------------|--------------------------------------------------------|
//! | [`layout`]     | File naming, directory scans, generation discovery     |
//! | [`fetch`]      | `FileSource`, `FileSelector`, `Fetcher`                |
//! | [`transform`]  | `OffsetTransform`, the value-log to index bridge       |
//! | [`update`]     | `PartitionUpdater` state machine and cleanup           |
//! | [`recovery`]   | Removal of debris left by an interrupted update        |
//! | [`generation`] | Writing a matching index/value file pair               |
//! | [`reader`]     | Point lookups against the current generation           |

pub mod error;
pub mod fetch;
pub mod generation;
pub mod layout;
pub mod reader;
pub mod recovery;
pub mod transform;
pub mod update;

pub use error::{TransportError, UpdateError};
pub use fetch::{FileSelector, FileSource, Fetcher, LocalFileSource, VersionFileSelector};
pub use generation::{FilePair, GenerationWriter};
pub use layout::{FileKind, Generation, LogFile, LogKind, PartitionFiles, MAX_VERSION};
pub use reader::PartitionReader;
pub use recovery::{recover, RecoveryReport};
pub use transform::OffsetTransform;
pub use update::{NoopObserver, PartitionUpdater, UpdateObserver, UpdateOutcome, UpdateState};

#[cfg(test)]
mod tests;

#![warn(missing_docs)]

//! Lochness transfer subsystem: incremental change-set selection, archival and
//! PHOENIX-to-PHOENIX delivery.
//!
//! The sending side computes a [`window::SyncWindow`] from the
//! [`watermark::WatermarkStore`], collects the files modified inside it with
//! [`scan::ChangeSetScanner`], packs them with [`archive::Archiver`] and pushes
//! the blob through one of the [`transport`] variants. The receiving side polls
//! an inbox with [`receive::SecureCopyReceive`] and merges each blob into its
//! tree with [`unpack::unpack`].

pub mod archive;
pub mod error;
pub mod receive;
pub mod scan;
pub mod transport;
pub mod unpack;
pub mod watermark;
pub mod window;

pub use archive::{ArchiveBlob, Archiver, ArchiverConfig, CompressionAlgo};
pub use error::{ArchiveError, ScanError, TransportError, WatermarkError};
pub use receive::{ReceiveConfig, ReceiveReport, SecureCopyReceive};
pub use scan::{ChangeEntry, ChangeSet, ChangeSetScanner};
pub use transport::{send, Transport, TransportAttemptResult, TransportConfig, TransportKind};
pub use unpack::{list_entries, unpack, UnpackReport};
pub use watermark::{SyncHistoryRecord, WatermarkStore};
pub use window::{SyncWindow, Timestamp};

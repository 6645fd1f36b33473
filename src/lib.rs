//! Concurrent media harvesting.
//!
//! A [`Harvester`] turns a request (a user and a list of catalog identifiers)
//! into a session: a working directory, a [`Branch`] carrying the session's
//! facts and cancellation, and a [`Scheduler`] running the session's units
//! with bounded concurrency. Units download media and thumbnails in ranges,
//! mux audio with its cover, cut oversized artifacts into parts and hand the
//! results to an [`ArtifactSink`](services::ArtifactSink).

pub mod artifact;
pub mod branch;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fsutil;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod split;
pub mod thumbnail;
pub mod transcode;

pub use artifact::{ArtifactKind, Item, ItemDescriptor};
pub use branch::Branch;
pub use config::Config;
pub use downloader::{ChunkedDownloader, DownloadJob};
pub use error::TaskError;
pub use scheduler::Scheduler;
pub use services::Services;
pub use session::{Harvester, SessionContext, SessionId, SessionReport, SessionRequest};
pub use split::SplitPipeline;
pub use transcode::TranscodePipeline;

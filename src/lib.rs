//! segfetch: a resumable multipart HTTP(S) download engine.
//!
//! Embedding hosts construct a [`DownloadManager`], submit (URL, output
//! path) jobs, and get back a [`JobHandle`] for progress, waiting, and
//! cancellation. The engine probes the origin for size and range support,
//! splits the body into segments fetched in parallel, journals progress
//! durably next to the output path, and publishes the final file with an
//! atomic rename. A killed process resumes from the journal without
//! refetching completed bytes.

pub mod assembler;
pub mod digest;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod journal;
pub mod manager;
pub mod options;
pub mod planner;
pub mod pool;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod staging;

pub use error::{DownloadError, ErrorKind, Outcome};
pub use job::JobState;
pub use manager::{DownloadManager, JobHandle};
pub use options::{Auth, DigestAlgorithm, DownloadOptions, ExpectedDigest, ProgressObserver};
pub use probe::RemoteDescriptor;
pub use progress::Progress;

//! Lazy overlay of a remote content root onto a local filesystem.
//!
//! Paths under the working root are fetched from the content root the first
//! time the runtime stats or read-opens them, written into the local tree,
//! and never fetched again for the rest of the session. Remote failures are
//! absorbed: the runtime only ever sees its filesystem's own "not found".
//!
//! The fetch is blocking. Embeddings without blocking requests available from
//! inside the filesystem hook should use [`StaticFetcher`] with everything
//! the session may touch.

mod fetcher;
mod interceptor;
mod materializer;
mod resolver;

pub use fetcher::{
    fetcher_for_root, guess_content_type, DirFetcher, FetchOutcome, HttpFetcher, RemoteFetcher,
    StaticFetcher, DIRECTORY_LISTING_CONTENT_TYPE,
};
pub use interceptor::OverlayFs;
pub use materializer::{apply, classify, MaterializeStatus, Materializer, OverlayEntry};
pub use resolver::{Exclusion, PathResolver, RemotePath, Resolution, ResolvedPath};

//! Atrium asset layer -- content-addressed, type-indexed, dedup-in-flight.
//!
//! Assets are immutable blobs named by `asset://<hash>.<ext>` URLs: two keys
//! with identical hash denote the same bytes, so a cache entry never needs
//! invalidation. The [`AssetCache`] guarantees that for each
//! (type, url) key at most one fetch is in flight; every concurrent `load`
//! observes the same outcome.
//!
//! # Architecture
//!
//! - **[`url`]**: the `asset://` grammar, extension/type table, and SHA-256
//!   minting of URLs for locally published bytes.
//! - **[`cache`]**: the cache itself plus the [`AssetFetcher`] (external
//!   downloader) and [`AssetDecoder`] (format adapter) collaborator traits.
//!
//! The cache is single-threaded by design: the whole simulation runs on one
//! cooperative loop, and fetches are detached local tasks whose results are
//! observed through oneshot subscriptions.

#![deny(unsafe_code)]

pub mod cache;
pub mod url;

pub use cache::{
    AssetCache, AssetDecoder, AssetFetcher, AssetKey, AssetPayload, DefaultDecoder, SceneTemplate,
};
pub use url::{AssetExt, AssetKind, AssetUrl};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the asset layer.
///
/// `Clone` because a single fetch outcome is delivered to every waiter of
/// that key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssetError {
    /// The URL does not match the `asset://<hash>.<ext>` grammar.
    #[error("invalid asset url {url:?}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The downloader failed.
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        /// The URL being fetched.
        url: String,
        /// Downloader-reported reason.
        reason: String,
    },

    /// The format adapter rejected the bytes.
    #[error("decode failed for {url}: {reason}")]
    Decode {
        /// The URL being decoded.
        url: String,
        /// Adapter-reported reason.
        reason: String,
    },

    /// The in-flight fetch task was dropped before completing (runtime
    /// shutdown). Waiters observe this instead of hanging.
    #[error("fetch for {url} was abandoned")]
    Abandoned {
        /// The URL whose fetch disappeared.
        url: String,
    },
}

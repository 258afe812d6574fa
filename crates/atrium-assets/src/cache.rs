//! The asset cache and its collaborator traits.
//!
//! Invariant: for each (type, url) key, at most one fetch is in flight.
//! The first `load` for a key spawns a detached local fetch task; every
//! caller (including the first) subscribes to its outcome through a oneshot
//! channel, so cancelling a caller's future never orphans other waiters.
//!
//! Successful outcomes are cached forever (content-addressed URLs never go
//! stale). A failed fetch is delivered to all current waiters and then
//! forgotten, so a later rebuild may retry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::url::{AssetExt, AssetKind, AssetUrl};
use crate::AssetError;

// ---------------------------------------------------------------------------
// Key & payloads
// ---------------------------------------------------------------------------

/// Cache key: the type axis plus the canonical URL string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    /// How the bytes will be decoded.
    pub kind: AssetKind,
    /// Canonical `asset://` URL.
    pub url: String,
}

impl AssetKey {
    /// Build a key.
    pub fn new(kind: AssetKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}

/// A scene-graph factory source: enough to instantiate a subtree. Real
/// geometry decoding belongs to the renderer, which is an external
/// collaborator; the runtime only needs the bytes and a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTemplate {
    /// Source URL, or a well-known tag for built-ins.
    pub source: String,
    /// Raw model bytes. Empty for built-in placeholder templates.
    pub bytes: Rc<Vec<u8>>,
}

impl SceneTemplate {
    /// The unit-cube placeholder shown while a remote peer is still
    /// uploading the real model.
    pub fn placeholder_cube() -> Self {
        Self {
            source: "builtin://placeholder-cube".to_owned(),
            bytes: Rc::new(Vec::new()),
        }
    }

    /// The crash-block shown when a build fails.
    pub fn crash_block() -> Self {
        Self {
            source: "builtin://crash-block".to_owned(),
            bytes: Rc::new(Vec::new()),
        }
    }

    /// Empty avatar stand-in used when a build refuses avatar decoding
    /// (the server does).
    pub fn empty_avatar() -> Self {
        Self {
            source: "builtin://empty-avatar".to_owned(),
            bytes: Rc::new(Vec::new()),
        }
    }

    /// Whether this template is one of the built-ins.
    pub fn is_builtin(&self) -> bool {
        self.source.starts_with("builtin://")
    }
}

/// A decoded asset, one variant per [`AssetKind`] family.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetPayload {
    /// Model or avatar scene source.
    Scene(SceneTemplate),
    /// Animation clip bytes.
    Clip {
        /// Source URL.
        source: String,
        /// Raw clip bytes.
        bytes: Rc<Vec<u8>>,
    },
    /// Texture or environment map handle.
    Texture {
        /// Source URL.
        source: String,
        /// Byte length, for budget accounting.
        byte_len: usize,
    },
    /// Script module source, handed to the sandbox verbatim.
    Script {
        /// Source URL.
        source: String,
        /// Raw wasm/wat bytes.
        bytes: Rc<Vec<u8>>,
    },
}

impl AssetPayload {
    /// Borrow the scene template, if this is one.
    pub fn as_scene(&self) -> Option<&SceneTemplate> {
        match self {
            AssetPayload::Scene(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow the script bytes, if this is a script.
    pub fn as_script_bytes(&self) -> Option<&[u8]> {
        match self {
            AssetPayload::Script { bytes, .. } => Some(bytes),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// External downloader. The runtime never talks to the network directly;
/// tests substitute scripted fetchers.
pub trait AssetFetcher {
    /// Fetch the bytes behind `url`.
    fn fetch<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, AssetError>>;
}

/// Format adapter: raw bytes to a decoded payload. A build may substitute
/// adapters (the server replaces avatar decoding with an empty stand-in).
pub trait AssetDecoder {
    /// Decode `bytes` as `kind`.
    ///
    /// # Errors
    ///
    /// [`AssetError::Decode`] when the bytes do not parse as the kind.
    fn decode(&self, kind: AssetKind, url: &str, bytes: Vec<u8>)
        -> Result<AssetPayload, AssetError>;
}

/// The default adapter set. Validates the URL extension against the kind
/// and wraps the bytes in the matching payload; `decode_avatars: false`
/// yields the empty avatar stand-in instead of touching the bytes.
#[derive(Debug, Clone)]
pub struct DefaultDecoder {
    /// Whether avatar bytes are decoded or replaced by the stand-in.
    pub decode_avatars: bool,
}

impl Default for DefaultDecoder {
    fn default() -> Self {
        Self {
            decode_avatars: true,
        }
    }
}

impl AssetDecoder for DefaultDecoder {
    fn decode(
        &self,
        kind: AssetKind,
        url: &str,
        bytes: Vec<u8>,
    ) -> Result<AssetPayload, AssetError> {
        let parsed = AssetUrl::parse(url)?;
        let ext_ok = matches!(
            (kind, parsed.ext()),
            (AssetKind::Model, AssetExt::Glb)
                | (AssetKind::Avatar, AssetExt::Vrm)
                | (AssetKind::Emote, AssetExt::Glb)
                | (AssetKind::Texture, AssetExt::Jpg | AssetExt::Png)
                | (AssetKind::Hdr, AssetExt::Hdr)
                | (AssetKind::Script, AssetExt::Wat)
        );
        if !ext_ok {
            return Err(AssetError::Decode {
                url: url.to_owned(),
                reason: format!(
                    "extension .{} does not decode as {}",
                    parsed.ext().as_str(),
                    kind.name()
                ),
            });
        }

        Ok(match kind {
            AssetKind::Model => AssetPayload::Scene(SceneTemplate {
                source: url.to_owned(),
                bytes: Rc::new(bytes),
            }),
            AssetKind::Avatar => {
                if self.decode_avatars {
                    AssetPayload::Scene(SceneTemplate {
                        source: url.to_owned(),
                        bytes: Rc::new(bytes),
                    })
                } else {
                    AssetPayload::Scene(SceneTemplate::empty_avatar())
                }
            }
            AssetKind::Emote => AssetPayload::Clip {
                source: url.to_owned(),
                bytes: Rc::new(bytes),
            },
            AssetKind::Texture | AssetKind::Hdr => AssetPayload::Texture {
                source: url.to_owned(),
                byte_len: bytes.len(),
            },
            AssetKind::Script => AssetPayload::Script {
                source: url.to_owned(),
                bytes: Rc::new(bytes),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// AssetCache
// ---------------------------------------------------------------------------

type Outcome = Result<Rc<AssetPayload>, AssetError>;

enum Entry {
    Ready(Rc<AssetPayload>),
    Pending(Vec<oneshot::Sender<Outcome>>),
}

struct Inner {
    entries: HashMap<AssetKey, Entry>,
}

/// The process-wide asset cache. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct AssetCache {
    inner: Rc<RefCell<Inner>>,
    fetcher: Rc<dyn AssetFetcher>,
    decoder: Rc<dyn AssetDecoder>,
}

impl AssetCache {
    /// Build a cache over the given downloader and adapter set.
    pub fn new(fetcher: Rc<dyn AssetFetcher>, decoder: Rc<dyn AssetDecoder>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: HashMap::new(),
            })),
            fetcher,
            decoder,
        }
    }

    /// Whether a decoded asset is already available (no fetch implied).
    pub fn has(&self, kind: AssetKind, url: &str) -> bool {
        matches!(
            self.inner.borrow().entries.get(&AssetKey::new(kind, url)),
            Some(Entry::Ready(_))
        )
    }

    /// The decoded asset if available; never triggers a fetch.
    pub fn get(&self, kind: AssetKind, url: &str) -> Option<Rc<AssetPayload>> {
        match self.inner.borrow().entries.get(&AssetKey::new(kind, url)) {
            Some(Entry::Ready(payload)) => Some(payload.clone()),
            _ => None,
        }
    }

    /// Publish locally sourced bytes under the key, satisfying any pending
    /// waiters of the same key.
    ///
    /// # Errors
    ///
    /// [`AssetError::Decode`] if the adapter rejects the bytes. Pending
    /// waiters observe the same failure.
    pub fn insert(
        &self,
        kind: AssetKind,
        url: &str,
        bytes: Vec<u8>,
    ) -> Result<Rc<AssetPayload>, AssetError> {
        let outcome = self
            .decoder
            .decode(kind, url, bytes)
            .map(Rc::new);
        self.publish(&AssetKey::new(kind, url), outcome.clone());
        outcome
    }

    /// Load the asset for (kind, url), starting a fetch only if no result
    /// exists and none is in flight.
    ///
    /// # Errors
    ///
    /// The shared outcome of the single fetch: [`AssetError::Fetch`],
    /// [`AssetError::Decode`], [`AssetError::InvalidUrl`] or
    /// [`AssetError::Abandoned`].
    pub async fn load(&self, kind: AssetKind, url: &str) -> Result<Rc<AssetPayload>, AssetError> {
        let key = AssetKey::new(kind, url);

        // Decide under the borrow; spawn (if we are first) after releasing it.
        let mut start_fetch = false;
        let rx = {
            let mut inner = self.inner.borrow_mut();
            match inner.entries.get_mut(&key) {
                Some(Entry::Ready(payload)) => return Ok(payload.clone()),
                Some(Entry::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.entries.insert(key.clone(), Entry::Pending(vec![tx]));
                    start_fetch = true;
                    rx
                }
            }
        };
        if start_fetch {
            self.spawn_fetch(key.clone());
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The fetch task died without publishing (runtime teardown).
            Err(_) => Err(AssetError::Abandoned {
                url: key.url.clone(),
            }),
        }
    }

    /// Resolve every listed key. Completes once all are available; the
    /// caller signals "ready" to whoever is waiting on the preload.
    ///
    /// # Errors
    ///
    /// The first failure encountered; remaining fetches keep running for
    /// later consumers.
    pub async fn preload(&self, items: &[AssetKey]) -> Result<(), AssetError> {
        let loads = items
            .iter()
            .map(|key| self.load(key.kind, &key.url))
            .collect::<Vec<_>>();
        for outcome in futures_util::future::join_all(loads).await {
            outcome?;
        }
        debug!(count = items.len(), "preload complete");
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    /// Spawn the single detached fetch task for `key`. Detaching means a
    /// cancelled caller cannot orphan the other waiters of the same key.
    fn spawn_fetch(&self, key: AssetKey) {
        let cache = self.clone();
        tokio::task::spawn_local(async move {
            let outcome = async {
                let bytes = cache.fetcher.fetch(&key.url).await?;
                cache.decoder.decode(key.kind, &key.url, bytes).map(Rc::new)
            }
            .await;
            if let Err(err) = &outcome {
                warn!(url = %key.url, kind = key.kind.name(), error = %err, "asset fetch failed");
            }
            cache.publish(&key, outcome);
        });
    }

    /// Store the outcome and wake all waiters. Failures are not cached so a
    /// later build may retry.
    fn publish(&self, key: &AssetKey, outcome: Outcome) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            let waiters = match inner.entries.remove(key) {
                Some(Entry::Pending(waiters)) => waiters,
                // insert() over a Ready entry re-publishes the same content
                // (content-addressed), nothing to wake.
                Some(Entry::Ready(_)) | None => Vec::new(),
            };
            if let Ok(payload) = &outcome {
                inner
                    .entries
                    .insert(key.clone(), Entry::Ready(payload.clone()));
            }
            waiters
        };
        for waiter in waiters {
            // A dropped waiter already lost interest.
            let _ = waiter.send(outcome.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::sync::Notify;

    use super::*;

    /// Scripted fetcher: counts calls, optionally holds responses behind a
    /// gate so tests can create real overlap.
    struct ScriptedFetcher {
        calls: Cell<usize>,
        gate: Option<Rc<Notify>>,
        fail: bool,
    }

    impl ScriptedFetcher {
        fn instant() -> Self {
            Self {
                calls: Cell::new(0),
                gate: None,
                fail: false,
            }
        }

        fn gated(gate: Rc<Notify>) -> Self {
            Self {
                calls: Cell::new(0),
                gate: Some(gate),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: Cell::new(0),
                gate: None,
                fail: true,
            }
        }
    }

    impl AssetFetcher for ScriptedFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Vec<u8>, AssetError>> {
            self.calls.set(self.calls.get() + 1);
            let gate = self.gate.clone();
            let fail = self.fail;
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                if fail {
                    Err(AssetError::Fetch {
                        url: url.to_owned(),
                        reason: "scripted failure".to_owned(),
                    })
                } else {
                    Ok(b"model bytes".to_vec())
                }
            })
        }
    }

    fn cache_with(fetcher: ScriptedFetcher) -> (AssetCache, Rc<ScriptedFetcher>) {
        let fetcher = Rc::new(fetcher);
        let cache = AssetCache::new(fetcher.clone(), Rc::new(DefaultDecoder::default()));
        (cache, fetcher)
    }

    fn model_url() -> String {
        AssetUrl::for_bytes(b"model bytes", AssetExt::Glb).to_url_string()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn load_fetches_then_caches() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (cache, fetcher) = cache_with(ScriptedFetcher::instant());
                let url = model_url();

                assert!(!cache.has(AssetKind::Model, &url));
                let first = cache.load(AssetKind::Model, &url).await.unwrap();
                assert!(first.as_scene().is_some());
                assert!(cache.has(AssetKind::Model, &url));

                let second = cache.load(AssetKind::Model, &url).await.unwrap();
                assert!(Rc::ptr_eq(&first, &second), "cache must return the same payload");
                assert_eq!(fetcher.calls.get(), 1, "second load must not refetch");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_loads_share_one_fetch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gate = Rc::new(Notify::new());
                let (cache, fetcher) = cache_with(ScriptedFetcher::gated(gate.clone()));
                let url = model_url();

                let a = tokio::task::spawn_local({
                    let cache = cache.clone();
                    let url = url.clone();
                    async move { cache.load(AssetKind::Model, &url).await }
                });
                let b = tokio::task::spawn_local({
                    let cache = cache.clone();
                    let url = url.clone();
                    async move { cache.load(AssetKind::Model, &url).await }
                });

                // Let both loads register while the fetch hangs on the gate.
                tokio::task::yield_now().await;
                assert_eq!(fetcher.calls.get(), 1, "only one fetch may be in flight");

                gate.notify_waiters();
                let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
                assert!(Rc::ptr_eq(&ra, &rb));
                assert_eq!(fetcher.calls.get(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn different_kinds_are_distinct_keys() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (cache, fetcher) = cache_with(ScriptedFetcher::instant());
                let url = AssetUrl::for_bytes(b"model bytes", AssetExt::Glb).to_url_string();

                cache.load(AssetKind::Model, &url).await.unwrap();
                cache.load(AssetKind::Emote, &url).await.unwrap();
                assert_eq!(fetcher.calls.get(), 2, "kind is part of the key");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn insert_satisfies_pending_waiters() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gate = Rc::new(Notify::new());
                let (cache, _fetcher) = cache_with(ScriptedFetcher::gated(gate));
                let url = model_url();

                let waiter = tokio::task::spawn_local({
                    let cache = cache.clone();
                    let url = url.clone();
                    async move { cache.load(AssetKind::Model, &url).await }
                });
                tokio::task::yield_now().await;

                // Local publish wins the race; the gated fetch never finishes.
                cache
                    .insert(AssetKind::Model, &url, b"model bytes".to_vec())
                    .unwrap();

                let got = waiter.await.unwrap().unwrap();
                assert!(got.as_scene().is_some());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failure_reaches_every_waiter_and_allows_retry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (cache, fetcher) = cache_with(ScriptedFetcher::failing());
                let url = model_url();

                let a = cache.load(AssetKind::Model, &url).await;
                assert!(matches!(a, Err(AssetError::Fetch { .. })), "{a:?}");
                assert!(!cache.has(AssetKind::Model, &url), "failures are not cached");

                // A later load retries.
                let b = cache.load(AssetKind::Model, &url).await;
                assert!(b.is_err());
                assert_eq!(fetcher.calls.get(), 2);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn preload_resolves_all() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (cache, fetcher) = cache_with(ScriptedFetcher::instant());
                let url = model_url();
                let items = vec![
                    AssetKey::new(AssetKind::Model, url.clone()),
                    AssetKey::new(AssetKind::Emote, url.clone()),
                ];

                cache.preload(&items).await.unwrap();
                assert!(cache.has(AssetKind::Model, &url));
                assert!(cache.has(AssetKind::Emote, &url));
                assert_eq!(fetcher.calls.get(), 2);
            })
            .await;
    }

    #[test]
    fn server_decoder_substitutes_avatar_placeholder() {
        let decoder = DefaultDecoder {
            decode_avatars: false,
        };
        let url = AssetUrl::for_bytes(b"vrm bytes", AssetExt::Vrm).to_url_string();
        let payload = decoder
            .decode(AssetKind::Avatar, &url, b"vrm bytes".to_vec())
            .unwrap();
        let scene = payload.as_scene().unwrap();
        assert!(scene.is_builtin());
        assert_eq!(scene, &SceneTemplate::empty_avatar());
    }

    #[test]
    fn decoder_rejects_mismatched_extension() {
        let decoder = DefaultDecoder::default();
        let url = AssetUrl::for_bytes(b"x", AssetExt::Png).to_url_string();
        let err = decoder
            .decode(AssetKind::Model, &url, b"x".to_vec())
            .unwrap_err();
        assert!(matches!(err, AssetError::Decode { .. }));
    }
}

pub mod config;
pub mod fetch;
pub mod http;
pub mod ids;
pub mod ignore_cache;
pub mod manifest;
pub mod overlay;
pub mod peer;
pub mod queues;
pub mod store;
pub mod stream;
pub mod version_cache;
pub mod wire;

pub use config::{FetchConfig, TierConfig};
pub use fetch::{
    ActiveFetch, FetchEngine, PrefixFetchStart, QueuedFetch, SlotState, SuggestOutcome,
};
pub use ids::{BundleId, PayloadHash, Sid};
pub use ignore_cache::IgnoreCache;
pub use manifest::{BundleKeypair, BundleManifest};
pub use overlay::{
    BlockKind, BlockWindow, OverlayTransport, MANIFEST_IDLE_TIMEOUT, MANIFEST_RETRANSMIT,
    PAYLOAD_IDLE_TIMEOUT, PAYLOAD_RETRANSMIT,
};
pub use peer::FetchPeer;
pub use queues::{FetchCandidate, FetchTier, DEFAULT_PRIORITY};
pub use store::{BundleStore, ImportedBundle, MemoryBundleStore, SqliteBundleStore};
pub use stream::{BoxedStream, StreamConnector, TcpConnector};
pub use version_cache::{VersionCache, VersionLookup};
pub use wire::{BlockRequest, OverlayFrame, OverlayPort, QueueClass, BLOCK_SIZE, WINDOW_BLOCKS};

#[cfg(test)]
mod conformance;

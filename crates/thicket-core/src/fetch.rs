//! The fetch engine: size-tiered queues of fetch candidates, one active
//! slot per tier, and the dual-transport state machine that fills each
//! slot's scratch file.  Every fetch starts on the stream transport and
//! falls back to windowed datagram requests when the stream fails.
//!
//! All queue, cache and slot state lives behind one short-critical-section
//! lock; transport tasks own their sockets and re-enter the engine only at
//! transition points.  The engine spawns onto the ambient Tokio runtime,
//! so it must be created and driven inside one.

use std::cmp::Ordering;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::config::FetchConfig;
use crate::ids::{BundleId, PayloadHash};
use crate::ignore_cache::IgnoreCache;
use crate::manifest::BundleManifest;
use crate::overlay::{self, BlockKind, BlockWindow, OverlayTransport};
use crate::peer::FetchPeer;
use crate::queues::{self, FetchCandidate, FetchTier, DEFAULT_PRIORITY};
use crate::store::BundleStore;
use crate::stream::{self, StreamConnector, StreamOutcome};
use crate::version_cache::{VersionCache, VersionLookup};
use crate::wire::{self, BlockRequest, OverlayFrame};

/// Manifests never exceed this, so a manifest-by-prefix fetch fits any
/// tier's slot.
const MANIFEST_SIZE_CEILING: u64 = 8192;

/// How long a manifest that failed verification stays ignored.
const IGNORE_TTL: Duration = Duration::from_secs(60);

/// Lifecycle of a fetch slot.  `Free` is both initial and terminal; the
/// four stream states progress in order, and any of them can fail over
/// into `RxDatagram`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Connecting,
    SendingRequest,
    RxHeaders,
    RxStream,
    RxDatagram,
}

/// Result of offering a manifest to a slot.  The manifest moves into the
/// slot only on `Started`; `Imported` hands it to the store; every other
/// variant returns it so the caller decides whether to keep or drop it.
#[derive(Debug)]
pub(crate) enum StartFetch {
    Started,
    Imported,
    /// The store already holds this version or newer.
    Superseded(BundleManifest),
    SameBundle(BundleManifest),
    /// An older version of the same bundle is mid-fetch; it is allowed to
    /// finish first so constant re-publishing cannot starve us.
    OlderBundle(BundleManifest),
    NewerBundle(BundleManifest),
    /// Another slot is already fetching the identical payload under a
    /// different bundle id.
    SamePayload(BundleManifest),
    SlotBusy(BundleManifest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestOutcome {
    Queued,
    Imported,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixFetchStart {
    Started,
    SlotBusy,
}

/// Introspection row for a queued candidate.
#[derive(Debug, Clone)]
pub struct QueuedFetch {
    pub tier: usize,
    pub bid: BundleId,
    pub version: u64,
    pub priority: i32,
}

/// Introspection row for an occupied slot.
#[derive(Debug, Clone)]
pub struct ActiveFetch {
    pub tier: usize,
    pub state: SlotState,
    pub bid: Option<BundleId>,
}

#[derive(Debug, Clone)]
enum FetchTarget {
    Payload {
        bid: BundleId,
        version: u64,
        hash: PayloadHash,
    },
    ManifestPrefix {
        prefix: Vec<u8>,
    },
}

struct Slot {
    state: SlotState,
    /// Bumped on every close; outstanding transport tasks carry the value
    /// they started with and stand down on mismatch.
    generation: u64,
    manifest: Option<BundleManifest>,
    peer: Option<FetchPeer>,
    target: Option<FetchTarget>,
    path: Option<PathBuf>,
    /// Scratch file handle.  `None` while a stream task owns it.
    file: Option<File>,
    /// Declared payload end, once known.  Stream: `Content-Length`.
    /// Datagram: set by the tail block only.
    expected: Option<u64>,
    written: u64,
    window: Option<BlockWindow>,
    last_rx: Instant,
    idle_timeout: Duration,
    retransmit: Duration,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            generation: 0,
            manifest: None,
            peer: None,
            target: None,
            path: None,
            file: None,
            expected: None,
            written: 0,
            window: None,
            last_rx: Instant::now(),
            idle_timeout: overlay::PAYLOAD_IDLE_TIMEOUT,
            retransmit: overlay::PAYLOAD_RETRANSMIT,
        }
    }
}

struct EngineState {
    tiers: Vec<FetchTier>,
    slots: Vec<Slot>,
    versions: VersionCache,
    ignored: IgnoreCache,
    activator_armed: bool,
}

struct EngineShared {
    /// Back-reference handed to spawned transport tasks.
    me: Weak<EngineShared>,
    config: FetchConfig,
    store: Arc<dyn BundleStore>,
    connector: Arc<dyn StreamConnector>,
    overlay: Arc<dyn OverlayTransport>,
    state: Mutex<EngineState>,
}

/// Handle to the fetch engine; cheap to clone.
#[derive(Clone)]
pub struct FetchEngine {
    shared: Arc<EngineShared>,
}

impl FetchEngine {
    pub fn new(
        config: FetchConfig,
        store: Arc<dyn BundleStore>,
        connector: Arc<dyn StreamConnector>,
        overlay: Arc<dyn OverlayTransport>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.tiers.is_empty(), "at least one fetch tier required");
        let mut prev = 0u64;
        let last = config.tiers.len() - 1;
        for (idx, tier) in config.tiers.iter().enumerate() {
            anyhow::ensure!(tier.queue_depth >= 1, "tier queue depth must be at least 1");
            match tier.size_limit {
                Some(limit) => {
                    anyhow::ensure!(limit > prev, "tier size limits must strictly ascend");
                    prev = limit;
                }
                None => anyhow::ensure!(idx == last, "only the last tier may be unbounded"),
            }
        }

        let tiers = config.tiers.iter().map(|c| FetchTier::new(*c)).collect();
        let slots = config.tiers.iter().map(|_| Slot::new()).collect();
        Ok(Self {
            shared: Arc::new_cyclic(|me| EngineShared {
                me: me.clone(),
                config,
                store,
                connector,
                overlay,
                state: Mutex::new(EngineState {
                    tiers,
                    slots,
                    versions: VersionCache::new(),
                    ignored: IgnoreCache::new(),
                    activator_armed: false,
                }),
            }),
        })
    }

    /// Consider a freshly advertised manifest for fetching.  Admits it to
    /// the right size tier, deduplicates against queued and in-flight
    /// work, and arms the deferred activator.  The engine owns the
    /// manifest from here on, whatever the outcome.
    pub fn suggest_queue_manifest_import(
        &self,
        manifest: BundleManifest,
        peer: FetchPeer,
    ) -> anyhow::Result<SuggestOutcome> {
        let mut state = self.shared.lock();
        self.shared.suggest_inner(&mut state, manifest, peer)
    }

    /// Incoming payload block from the overlay.  Returns whether any
    /// datagram-mode slot claimed it.
    pub fn received_content(
        &self,
        bid_prefix: &[u8; 16],
        version: u64,
        offset: u64,
        bytes: &[u8],
        kind: BlockKind,
    ) -> bool {
        let mut state = self.shared.lock();
        let matched = state.slots.iter().position(|slot| {
            slot.state == SlotState::RxDatagram
                && matches!(
                    &slot.target,
                    Some(FetchTarget::Payload { bid, .. }) if bid.matches_prefix(bid_prefix)
                )
        });
        let Some(slot_idx) = matched else {
            tracing::debug!(
                prefix = %hex::encode(bid_prefix),
                version,
                "payload block matches no active fetch, dropping"
            );
            return false;
        };
        self.shared.apply_block(&mut state, slot_idx, offset, bytes, kind);
        true
    }

    /// Fetch a manifest we only know a bundle-id prefix for; on completion
    /// the fetched manifest re-enters through the suggestion path.
    pub fn request_manifest_by_prefix(
        &self,
        peer: FetchPeer,
        prefix: &[u8],
    ) -> anyhow::Result<PrefixFetchStart> {
        anyhow::ensure!(
            !prefix.is_empty() && prefix.len() <= 32,
            "manifest prefix must be 1..=32 bytes"
        );
        let shared = &self.shared;
        let mut state = shared.lock();
        let slot_idx = (0..state.slots.len()).find(|&i| {
            state.slots[i].state == SlotState::Free && state.tiers[i].accepts(MANIFEST_SIZE_CEILING)
        });
        let Some(slot_idx) = slot_idx else {
            return Ok(PrefixFetchStart::SlotBusy);
        };

        let path = shared
            .config
            .import_dir
            .join(format!("manifest.{}", hex::encode(prefix)));
        let file = shared.create_scratch(&path)?;
        let request = stream::manifest_request(prefix);
        let target = FetchTarget::ManifestPrefix {
            prefix: prefix.to_vec(),
        };
        shared.occupy_slot(&mut state, slot_idx, None, peer, target, path, file, request);
        Ok(PrefixFetchStart::Started)
    }

    /// Run the activator now instead of waiting for the armed alarm.
    pub fn activate_queued_fetches(&self) {
        self.shared.activate();
    }

    pub fn any_fetch_active(&self) -> bool {
        let state = self.shared.lock();
        state.slots.iter().any(|s| s.state != SlotState::Free)
    }

    pub fn any_fetch_queued(&self) -> bool {
        let state = self.shared.lock();
        state.tiers.iter().any(|t| !t.is_empty())
    }

    pub fn queued_fetches(&self) -> Vec<QueuedFetch> {
        let state = self.shared.lock();
        state
            .tiers
            .iter()
            .enumerate()
            .flat_map(|(tier, t)| {
                t.candidates().iter().map(move |c| QueuedFetch {
                    tier,
                    bid: c.manifest.bid,
                    version: c.manifest.version,
                    priority: c.priority,
                })
            })
            .collect()
    }

    pub fn active_fetches(&self) -> Vec<ActiveFetch> {
        let state = self.shared.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SlotState::Free)
            .map(|(tier, s)| ActiveFetch {
                tier,
                state: s.state,
                bid: match &s.target {
                    Some(FetchTarget::Payload { bid, .. }) => Some(*bid),
                    _ => None,
                },
            })
            .collect()
    }
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state lock poisoned")
    }

    fn arc(&self) -> Arc<EngineShared> {
        // `self` is only reachable through the owning Arc, so the upgrade
        // cannot fail.
        self.me.upgrade().expect("engine dropped")
    }

    fn suggest_inner(
        &self,
        state: &mut EngineState,
        mut manifest: BundleManifest,
        peer: FetchPeer,
    ) -> anyhow::Result<SuggestOutcome> {
        tracing::debug!(
            bid = %manifest.bid.to_hex(),
            version = manifest.version,
            size = manifest.payload_length,
            "considering advertised bundle"
        );

        if state.versions.lookup(&*self.store, &manifest.bid, manifest.version)?
            != VersionLookup::New
        {
            tracing::debug!(bid = %manifest.bid.to_hex(), "already have that version or newer");
            return Ok(SuggestOutcome::Rejected);
        }

        // Nil payload: nothing to fetch, so verify and import on the spot.
        if manifest.payload_length == 0 {
            if let Err(err) = manifest.verify() {
                tracing::warn!(error = %err, "manifest failed verification, ignoring for a while");
                state.ignored.mark(&manifest.bid, peer, IGNORE_TTL);
                return Ok(SuggestOutcome::Rejected);
            }
            self.import_bundle(state, manifest, None)?;
            return Ok(SuggestOutcome::Imported);
        }

        let Some(tier_idx) = queues::tier_for_size(&state.tiers, manifest.payload_length) else {
            tracing::warn!(size = manifest.payload_length, "no fetch queue accepts payload size");
            return Ok(SuggestOutcome::Rejected);
        };

        // The same bundle could sit in any tier (payload size may change
        // between versions).  Keep the newest, unqueue the rest.
        for t in 0..state.tiers.len() {
            let mut j = 0;
            while j < state.tiers[t].len() {
                let queued = &state.tiers[t].candidates()[j];
                if queued.manifest.bid != manifest.bid {
                    j += 1;
                    continue;
                }
                if queued.manifest.version >= manifest.version {
                    tracing::debug!("same bundle already queued at same or newer version");
                    return Ok(SuggestOutcome::Rejected);
                }
                if let Err(err) = manifest.verify() {
                    tracing::warn!(error = %err, "manifest failed verification, ignoring for a while");
                    state.ignored.mark(&manifest.bid, peer, IGNORE_TTL);
                    return Ok(SuggestOutcome::Rejected);
                }
                drop(state.tiers[t].remove(j));
            }
        }

        let Some(ci) = state.tiers[tier_idx].insertion_index(DEFAULT_PRIORITY) else {
            tracing::debug!(tier = tier_idx, "queue full at equal or higher priority, rejecting");
            return Ok(SuggestOutcome::Rejected);
        };
        if let Err(err) = manifest.verify() {
            tracing::warn!(error = %err, "manifest failed verification, ignoring for a while");
            state.ignored.mark(&manifest.bid, peer, IGNORE_TTL);
            return Ok(SuggestOutcome::Rejected);
        }

        state.tiers[tier_idx].insert(
            ci,
            FetchCandidate {
                manifest,
                peer,
                priority: DEFAULT_PRIORITY,
            },
        );
        self.dump_queues(state);
        self.arm_activator(state);
        Ok(SuggestOutcome::Queued)
    }

    /// Offer a manifest to a specific free slot.  See [`StartFetch`] for
    /// the ownership contract.
    fn try_start_fetch(
        &self,
        state: &mut EngineState,
        slot_idx: usize,
        manifest: BundleManifest,
        peer: FetchPeer,
    ) -> anyhow::Result<StartFetch> {
        if state.slots[slot_idx].state != SlotState::Free {
            return Ok(StartFetch::SlotBusy(manifest));
        }
        tracing::debug!(
            slot = slot_idx,
            bid = %manifest.bid.to_hex(),
            version = manifest.version,
            size = manifest.payload_length,
            "fetching bundle"
        );

        if manifest.payload_length == 0 {
            self.import_bundle(state, manifest, None)?;
            return Ok(StartFetch::Imported);
        }
        if state.versions.lookup(&*self.store, &manifest.bid, manifest.version)?
            != VersionLookup::New
        {
            return Ok(StartFetch::Superseded(manifest));
        }

        for slot in &state.slots {
            if slot.state == SlotState::Free {
                continue;
            }
            if let Some(FetchTarget::Payload { bid, version, .. }) = &slot.target {
                if *bid == manifest.bid {
                    return Ok(match version.cmp(&manifest.version) {
                        Ordering::Less => StartFetch::OlderBundle(manifest),
                        Ordering::Greater => StartFetch::NewerBundle(manifest),
                        Ordering::Equal => StartFetch::SameBundle(manifest),
                    });
                }
            }
        }

        let Some(hash) = manifest.payload_hash else {
            anyhow::bail!("manifest missing payload hash");
        };
        if self.store.payload_present(&hash)? {
            tracing::debug!("payload already present, importing manifest instead");
            self.import_bundle(state, manifest, None)?;
            return Ok(StartFetch::Imported);
        }
        for slot in &state.slots {
            if slot.state == SlotState::Free {
                continue;
            }
            if let Some(FetchTarget::Payload { hash: active, .. }) = &slot.target {
                if *active == hash {
                    return Ok(StartFetch::SamePayload(manifest));
                }
            }
        }

        let path = self
            .config
            .import_dir
            .join(format!("payload.{}", manifest.bid.to_hex()));
        let file = self.create_scratch(&path)?;
        let request = stream::payload_request(&hash);
        let target = FetchTarget::Payload {
            bid: manifest.bid,
            version: manifest.version,
            hash,
        };
        self.occupy_slot(state, slot_idx, Some(manifest), peer, target, path, file, request);
        Ok(StartFetch::Started)
    }

    #[allow(clippy::too_many_arguments)]
    fn occupy_slot(
        &self,
        state: &mut EngineState,
        slot_idx: usize,
        manifest: Option<BundleManifest>,
        peer: FetchPeer,
        target: FetchTarget,
        path: PathBuf,
        file: File,
        request: String,
    ) {
        let generation = {
            let slot = &mut state.slots[slot_idx];
            slot.manifest = manifest;
            slot.peer = Some(peer);
            slot.target = Some(target);
            slot.path = Some(path);
            slot.expected = None;
            slot.written = 0;
            slot.window = None;
            slot.generation
        };
        match peer.addr {
            Some(addr) => {
                state.slots[slot_idx].state = SlotState::Connecting;
                state.slots[slot_idx].file = None;
                self.spawn_stream_task(slot_idx, generation, addr, request, file);
            }
            None => {
                // No direct route advertised; go straight to the overlay.
                state.slots[slot_idx].file = Some(file);
                self.enter_datagram_mode(state, slot_idx);
            }
        }
    }

    fn spawn_stream_task(
        &self,
        slot_idx: usize,
        generation: u64,
        addr: std::net::SocketAddrV4,
        request: String,
        mut file: File,
    ) {
        let shared = self.arc();
        let idle = self.config.stream_idle_timeout;
        tokio::spawn(async move {
            let connector = Arc::clone(&shared.connector);
            let outcome = stream::fetch_over_stream(
                &*connector,
                addr,
                &request,
                &mut file,
                idle,
                |slot_state| {
                    let mut state = shared.lock();
                    let slot = &mut state.slots[slot_idx];
                    if slot.generation == generation {
                        slot.state = slot_state;
                    }
                },
            )
            .await;

            let mut state = shared.lock();
            if state.slots[slot_idx].generation != generation {
                return;
            }
            match outcome {
                StreamOutcome::Done { written } => {
                    let slot = &mut state.slots[slot_idx];
                    slot.file = Some(file);
                    slot.written = written;
                    slot.expected = Some(written);
                    shared.finish_fetch(&mut state, slot_idx);
                }
                StreamOutcome::Failed { written } => {
                    let slot = &mut state.slots[slot_idx];
                    slot.file = Some(file);
                    slot.written = written;
                    tracing::debug!(
                        slot = slot_idx,
                        written,
                        "stream transport failed, switching to datagram transport"
                    );
                    shared.enter_datagram_mode(&mut state, slot_idx);
                }
                StreamOutcome::Aborted { .. } => {
                    state.slots[slot_idx].file = Some(file);
                    shared.close_slot(&mut state, slot_idx);
                }
            }
        });
    }

    fn enter_datagram_mode(&self, state: &mut EngineState, slot_idx: usize) {
        let generation = {
            let slot = &mut state.slots[slot_idx];
            let (idle, cadence) = match &slot.target {
                Some(FetchTarget::Payload { .. }) => {
                    (overlay::PAYLOAD_IDLE_TIMEOUT, overlay::PAYLOAD_RETRANSMIT)
                }
                _ => (overlay::MANIFEST_IDLE_TIMEOUT, overlay::MANIFEST_RETRANSMIT),
            };
            slot.state = SlotState::RxDatagram;
            slot.window = Some(BlockWindow::new(wire::BLOCK_SIZE as usize));
            slot.expected = None;
            slot.last_rx = Instant::now();
            slot.idle_timeout = idle;
            slot.retransmit = cadence;
            slot.generation
        };
        self.send_block_request(state, slot_idx);
        self.spawn_retransmit(slot_idx, generation);
    }

    /// Solicit the next window of blocks (or the manifest) from the peer.
    fn send_block_request(&self, state: &EngineState, slot_idx: usize) {
        let slot = &state.slots[slot_idx];
        let Some(peer) = slot.peer else { return };
        let payload = match &slot.target {
            Some(FetchTarget::Payload { bid, version, .. }) => BlockRequest {
                bid: *bid,
                version: *version,
                window_start: slot.written,
                bitmap: slot.window.as_ref().map_or(0, |w| w.bitmap()),
                block_size: wire::BLOCK_SIZE,
            }
            .encode(),
            Some(FetchTarget::ManifestPrefix { prefix }) => {
                match wire::encode_manifest_request(prefix) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot encode manifest request");
                        return;
                    }
                }
            }
            None => return,
        };
        if let Err(err) = self.overlay.dispatch(OverlayFrame::request(peer.sid, payload)) {
            tracing::debug!(error = %err, "overlay dispatch failed");
        }
    }

    fn spawn_retransmit(&self, slot_idx: usize, generation: u64) {
        let shared = self.arc();
        tokio::spawn(async move {
            loop {
                let interval = {
                    let state = shared.lock();
                    let slot = &state.slots[slot_idx];
                    if slot.generation != generation || slot.state != SlotState::RxDatagram {
                        return;
                    }
                    slot.retransmit
                };
                tokio::time::sleep(interval).await;

                let mut state = shared.lock();
                let slot = &state.slots[slot_idx];
                if slot.generation != generation || slot.state != SlotState::RxDatagram {
                    return;
                }
                if slot.last_rx.elapsed() > slot.idle_timeout {
                    tracing::debug!(slot = slot_idx, "datagram fetch timed out");
                    shared.close_slot(&mut state, slot_idx);
                    return;
                }
                shared.send_block_request(&state, slot_idx);
            }
        });
    }

    fn apply_block(
        &self,
        state: &mut EngineState,
        slot_idx: usize,
        offset: u64,
        bytes: &[u8],
        kind: BlockKind,
    ) {
        enum Next {
            Keep,
            Close,
            Finish,
        }
        let next = {
            let slot = &mut state.slots[slot_idx];
            slot.last_rx = Instant::now();
            let Some(window) = slot.window.as_mut() else {
                return;
            };
            let outcome = window.accept(slot.written, offset, bytes, kind);
            if let Some(tail_len) = outcome.tail_len {
                slot.expected = Some(tail_len);
            }
            let mut next = Next::Keep;
            if !outcome.append.is_empty() {
                let mut take = outcome.append.len() as u64;
                if let Some(expected) = slot.expected {
                    take = take.min(expected.saturating_sub(slot.written));
                }
                match slot.file.as_mut() {
                    Some(file) => {
                        if let Err(err) = file.write_all(&outcome.append[..take as usize]) {
                            tracing::warn!(error = %err, "scratch file write failed");
                            next = Next::Close;
                        } else {
                            slot.written += take;
                        }
                    }
                    None => next = Next::Close,
                }
            }
            if matches!(next, Next::Keep) && slot.expected == Some(slot.written) {
                next = Next::Finish;
            }
            next
        };
        match next {
            Next::Keep => {}
            Next::Close => self.close_slot(state, slot_idx),
            Next::Finish => {
                tracing::debug!(slot = slot_idx, "datagram fetch complete");
                self.finish_fetch(state, slot_idx);
            }
        }
    }

    /// Completion for both transports: hand the scratch file to the
    /// importer (payload fetches) or decode and re-suggest it (manifest
    /// fetches), then release the slot.
    fn finish_fetch(&self, state: &mut EngineState, slot_idx: usize) {
        let (manifest, path, peer) = {
            let slot = &mut state.slots[slot_idx];
            slot.file = None;
            (slot.manifest.take(), slot.path.clone(), slot.peer)
        };
        match manifest {
            Some(m) => {
                if let Some(path) = path {
                    match self.import_bundle(state, m, Some(&path)) {
                        // The importer owns the file now; don't unlink it.
                        Ok(()) => state.slots[slot_idx].path = None,
                        Err(err) => tracing::warn!(error = %err, "bundle import failed"),
                    }
                }
            }
            None => {
                if let (Some(path), Some(peer)) = (path, peer) {
                    let decoded = std::fs::read(&path)
                        .map_err(anyhow::Error::from)
                        .and_then(|bytes| BundleManifest::from_bytes(&bytes));
                    match decoded {
                        Ok(m) => {
                            tracing::debug!(
                                bid = %m.bid.to_hex(),
                                "fetched manifest by prefix, considering for import"
                            );
                            if let Err(err) = self.suggest_inner(state, m, peer) {
                                tracing::warn!(error = %err, "fetched manifest not usable");
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "fetched bytes are not a manifest")
                        }
                    }
                }
            }
        }
        self.close_slot(state, slot_idx);
    }

    /// The single reclamation point: closes the socket-side task (via
    /// generation bump), the file, and the scratch path, then cascades
    /// queued work into the freed slot.
    fn close_slot(&self, state: &mut EngineState, slot_idx: usize) {
        {
            let slot = &mut state.slots[slot_idx];
            tracing::debug!(slot = slot_idx, "closing fetch slot");
            slot.generation += 1;
            slot.file = None;
            if let Some(path) = slot.path.take() {
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::debug!(
                        path = %path.display(),
                        error = %err,
                        "scratch file unlink failed"
                    );
                }
            }
            slot.manifest = None;
            slot.peer = None;
            slot.target = None;
            slot.window = None;
            slot.expected = None;
            slot.written = 0;
            slot.state = SlotState::Free;
        }
        self.start_next_queued(state, slot_idx);
    }

    /// Feed the slot from its own tier first, then any smaller tier; a
    /// big-payload slot can serve any candidate that fits under its
    /// bound.
    fn start_next_queued(&self, state: &mut EngineState, slot_idx: usize) {
        for tier_idx in (0..=slot_idx).rev() {
            let mut i = 0;
            while i < state.tiers[tier_idx].len() {
                if state.slots[slot_idx].state != SlotState::Free {
                    return;
                }
                let FetchCandidate {
                    manifest,
                    peer,
                    priority,
                } = state.tiers[tier_idx].remove(i);
                match self.try_start_fetch(state, slot_idx, manifest, peer) {
                    Ok(StartFetch::Started) => return,
                    Ok(StartFetch::SlotBusy(manifest)) => {
                        state.tiers[tier_idx].insert(
                            i,
                            FetchCandidate {
                                manifest,
                                peer,
                                priority,
                            },
                        );
                        return;
                    }
                    Ok(StartFetch::OlderBundle(manifest)) => {
                        // Leave it queued: when the in-flight older version
                        // finishes, this newer one gets its turn.
                        state.tiers[tier_idx].insert(
                            i,
                            FetchCandidate {
                                manifest,
                                peer,
                                priority,
                            },
                        );
                        i += 1;
                    }
                    // Imported, superseded, duplicate payload, or a newer
                    // version already in flight: the candidate is resolved.
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "failed to start queued fetch"),
                }
            }
        }
    }

    fn activate(&self) {
        let mut state = self.lock();
        state.activator_armed = false;
        for slot_idx in 0..state.slots.len() {
            self.start_next_queued(&mut state, slot_idx);
        }
    }

    /// One-shot alarm so a whole packet's worth of advertisements gets
    /// queued and prioritised before fetching begins.
    fn arm_activator(&self, state: &mut EngineState) {
        if state.activator_armed {
            return;
        }
        state.activator_armed = true;
        let shared = self.arc();
        let delay = self.config.fetch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.activate();
        });
    }

    fn import_bundle(
        &self,
        state: &mut EngineState,
        mut manifest: BundleManifest,
        payload: Option<&Path>,
    ) -> anyhow::Result<()> {
        let bid = manifest.bid;
        let version = manifest.version;
        manifest.ttl = manifest.ttl.saturating_sub(1);
        self.store
            .import(manifest, payload)
            .context("bundle import failed")?;
        state.versions.store(&bid, version);
        tracing::info!(bid = %bid.to_hex(), version, "imported bundle");
        Ok(())
    }

    fn create_scratch(&self, path: &Path) -> anyhow::Result<File> {
        std::fs::create_dir_all(&self.config.import_dir)
            .context("creating import directory failed")?;
        File::create(path).with_context(|| format!("creating {} failed", path.display()))
    }

    fn dump_queues(&self, state: &EngineState) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        for (tier_idx, tier) in state.tiers.iter().enumerate() {
            for (i, c) in tier.candidates().iter().enumerate() {
                tracing::debug!(
                    tier = tier_idx,
                    position = i,
                    bid = %c.manifest.bid.to_hex(),
                    version = c.manifest.version,
                    priority = c.priority,
                    size = c.manifest.payload_length,
                    "queued candidate"
                );
            }
        }
    }
}

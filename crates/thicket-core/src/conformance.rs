// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;
    use std::net::SocketAddrV4;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::config::FetchConfig;
    use crate::fetch::{FetchEngine, PrefixFetchStart, SlotState, SuggestOutcome};
    use crate::ids::Sid;
    use crate::manifest::{BundleKeypair, BundleManifest};
    use crate::overlay::{BlockKind, OverlayTransport};
    use crate::peer::FetchPeer;
    use crate::store::MemoryBundleStore;
    use crate::stream::{BoxedStream, StreamConnector};
    use crate::wire::{BlockRequest, OverlayFrame};

    type ConnectFuture = Pin<Box<dyn Future<Output = anyhow::Result<BoxedStream>> + Send>>;
    type Handler = Box<dyn Fn() -> ConnectFuture + Send + Sync>;

    struct MockConnector {
        handlers: Mutex<HashMap<SocketAddrV4, Handler>>,
    }

    impl MockConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handlers: Mutex::new(HashMap::new()),
            })
        }

        fn register<F, Fut>(&self, addr: SocketAddrV4, factory: F)
        where
            F: Fn() -> Fut + Send + Sync + 'static,
            Fut: Future<Output = anyhow::Result<BoxedStream>> + Send + 'static,
        {
            self.handlers
                .lock()
                .expect("lock poisoned")
                .insert(addr, Box::new(move || Box::pin(factory())));
        }
    }

    #[async_trait]
    impl StreamConnector for MockConnector {
        async fn connect(&self, addr: SocketAddrV4) -> anyhow::Result<BoxedStream> {
            let fut = {
                let handlers = self.handlers.lock().expect("lock poisoned");
                let Some(factory) = handlers.get(&addr) else {
                    anyhow::bail!("connection refused");
                };
                (factory)()
            };
            fut.await
        }
    }

    struct RecordingOverlay {
        frames: Mutex<Vec<OverlayFrame>>,
    }

    impl RecordingOverlay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<OverlayFrame> {
            self.frames.lock().expect("lock poisoned").clone()
        }
    }

    impl OverlayTransport for RecordingOverlay {
        fn dispatch(&self, frame: OverlayFrame) -> anyhow::Result<()> {
            self.frames.lock().expect("lock poisoned").push(frame);
            Ok(())
        }
    }

    struct Harness {
        engine: FetchEngine,
        store: Arc<MemoryBundleStore>,
        connector: Arc<MockConnector>,
        overlay: Arc<RecordingOverlay>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryBundleStore::new();
        let connector = MockConnector::new();
        let overlay = RecordingOverlay::new();
        let config = FetchConfig {
            import_dir: dir.path().to_path_buf(),
            fetch_delay: Duration::from_millis(10),
            ..FetchConfig::default()
        };
        let engine = FetchEngine::new(config, store.clone(), connector.clone(), overlay.clone())
            .expect("engine");
        Harness {
            engine,
            store,
            connector,
            overlay,
            dir,
        }
    }

    fn keypair() -> BundleKeypair {
        BundleKeypair::new(SigningKey::generate(&mut OsRng))
    }

    fn signed_manifest(key: &BundleKeypair, version: u64, payload: &[u8]) -> BundleManifest {
        let mut m = BundleManifest::new(key.bundle_id(), version, payload, 4);
        m.sign(key).expect("sign");
        m
    }

    fn run(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn addr(host: u8) -> SocketAddrV4 {
        format!("10.0.0.{host}:4110").parse().expect("valid addr")
    }

    fn sid(fill: u8) -> Sid {
        Sid([fill; 32])
    }

    fn prefix16(manifest: &BundleManifest) -> [u8; 16] {
        let mut p = [0u8; 16];
        p.copy_from_slice(&manifest.bid.0[..16]);
        p
    }

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = server.read(&mut chunk).await.expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8(buf).expect("request is ascii")
    }

    async fn serve_reply(mut server: DuplexStream, reply: Vec<u8>) {
        let _ = read_request(&mut server).await;
        let _ = server.write_all(&reply).await;
    }

    fn ok_reply(body: &[u8]) -> Vec<u8> {
        let mut reply =
            format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        reply.extend_from_slice(body);
        reply
    }

    fn register_http(connector: &MockConnector, at: SocketAddrV4, reply: Vec<u8>) {
        connector.register(at, move || {
            let reply = reply.clone();
            async move {
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(serve_reply(server, reply));
                Ok(Box::new(client) as BoxedStream)
            }
        });
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    // S1: a nil-payload bundle needs no fetch; it is verified and imported
    // on the spot.
    #[tokio::test]
    async fn nil_payload_imports_without_fetching() {
        let h = harness();
        let m = signed_manifest(&keypair(), 7, b"");
        let bid = m.bid;

        let outcome = h
            .engine
            .suggest_queue_manifest_import(m, FetchPeer::new(None, sid(1)))
            .expect("suggest");
        assert_eq!(outcome, SuggestOutcome::Imported);

        let imports = h.store.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].manifest.bid, bid);
        assert_eq!(imports[0].manifest.version, 7);
        // One store-and-forward hop spent.
        assert_eq!(imports[0].manifest.ttl, 3);
        assert!(!h.engine.any_fetch_active());
        assert!(!h.engine.any_fetch_queued());
    }

    // S2: stream transport happy path end to end.
    #[tokio::test]
    async fn stream_happy_path_imports_payload() {
        let h = harness();
        let body = run(1234, 11);
        let m = signed_manifest(&keypair(), 3, &body);
        let bid = m.bid;
        let peer = FetchPeer::new(Some(addr(1)), sid(1));
        register_http(&h.connector, addr(1), ok_reply(&body));

        assert_eq!(
            h.engine.suggest_queue_manifest_import(m, peer).expect("suggest"),
            SuggestOutcome::Queued
        );
        assert!(h.engine.any_fetch_queued());
        h.engine.activate_queued_fetches();

        let engine = h.engine.clone();
        wait_until(move || !engine.any_fetch_active()).await;

        let imports = h.store.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].manifest.bid, bid);
        assert_eq!(imports[0].payload.as_deref(), Some(&body[..]));
        // The importer took ownership of the scratch file.
        let scratch = h.dir.path().join(format!("payload.{}", bid.to_hex()));
        assert_eq!(std::fs::metadata(&scratch).expect("scratch kept").len(), 1234);
        assert!(!h.engine.any_fetch_queued());
    }

    // S3: a 404 from the stream peer switches the slot to the datagram
    // transport, which completes the same fetch.
    #[tokio::test]
    async fn stream_failure_falls_back_to_datagram() {
        let h = harness();
        let body = run(1234, 23);
        let m = signed_manifest(&keypair(), 3, &body);
        let p16 = prefix16(&m);
        let version = m.version;
        let peer = FetchPeer::new(Some(addr(1)), sid(1));
        register_http(
            &h.connector,
            addr(1),
            b"HTTP/1.0 404 Not Found\r\n\r\n".to_vec(),
        );

        h.engine.suggest_queue_manifest_import(m, peer).expect("suggest");
        h.engine.activate_queued_fetches();

        let overlay = h.overlay.clone();
        wait_until(move || !overlay.frames().is_empty()).await;
        let request = BlockRequest::decode(&h.overlay.frames()[0].payload).expect("decode");
        assert_eq!(request.window_start, 0);

        assert!(h.engine.received_content(&p16, version, 0, &body[..1000], BlockKind::Body));
        assert!(h
            .engine
            .received_content(&p16, version, 1000, &body[1000..1200], BlockKind::Body));
        assert!(h
            .engine
            .received_content(&p16, version, 1200, &body[1200..], BlockKind::Tail));

        assert!(!h.engine.any_fetch_active());
        let imports = h.store.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].payload.as_deref(), Some(&body[..]));
    }

    // S4 + idempotence: for one bundle id, the queue holds exactly the
    // newest advertised version, whichever order versions arrive in.
    #[tokio::test]
    async fn newest_version_wins_the_queue() {
        let h = harness();
        let key = keypair();
        let peer = FetchPeer::new(None, sid(1));

        let v5 = signed_manifest(&key, 5, &run(600, 1));
        let v7 = signed_manifest(&key, 7, &run(700, 2));
        assert_eq!(
            h.engine.suggest_queue_manifest_import(v5, peer).expect("suggest"),
            SuggestOutcome::Queued
        );
        assert_eq!(
            h.engine.suggest_queue_manifest_import(v7, peer).expect("suggest"),
            SuggestOutcome::Queued
        );

        let queued = h.engine.queued_fetches();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].version, 7);

        // An older advertisement afterwards changes nothing.
        let v6 = signed_manifest(&key, 6, &run(650, 3));
        assert_eq!(
            h.engine.suggest_queue_manifest_import(v6, peer).expect("suggest"),
            SuggestOutcome::Rejected
        );
        let queued = h.engine.queued_fetches();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].version, 7);
    }

    // S5: different size tiers fetch in parallel.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn size_tiers_fetch_in_parallel() {
        let h = harness();
        let small_body = run(5_000, 5);
        let big_body = run(50_000, 6);
        let small = signed_manifest(&keypair(), 1, &small_body);
        let big = signed_manifest(&keypair(), 1, &big_body);

        let barrier = Arc::new(tokio::sync::Barrier::new(3));
        for (at, body) in [(addr(1), small_body.clone()), (addr(2), big_body.clone())] {
            let barrier = barrier.clone();
            h.connector.register(at, move || {
                let body = body.clone();
                let barrier = barrier.clone();
                async move {
                    let (client, mut server) = tokio::io::duplex(128 * 1024);
                    tokio::spawn(async move {
                        let _ = read_request(&mut server).await;
                        let head =
                            format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
                        let _ = server.write_all(head.as_bytes()).await;
                        // Hold the bodies until both fetches are mid-flight.
                        barrier.wait().await;
                        let _ = server.write_all(&body).await;
                    });
                    Ok(Box::new(client) as BoxedStream)
                }
            });
        }

        h.engine
            .suggest_queue_manifest_import(small, FetchPeer::new(Some(addr(1)), sid(1)))
            .expect("suggest");
        h.engine
            .suggest_queue_manifest_import(big, FetchPeer::new(Some(addr(2)), sid(2)))
            .expect("suggest");
        h.engine.activate_queued_fetches();

        let engine = h.engine.clone();
        wait_until(move || engine.active_fetches().len() == 2).await;
        let mut tiers: Vec<usize> = h.engine.active_fetches().iter().map(|a| a.tier).collect();
        tiers.sort_unstable();
        assert_eq!(tiers, vec![0, 1]);

        barrier.wait().await;
        let engine = h.engine.clone();
        wait_until(move || !engine.any_fetch_active()).await;
        assert_eq!(h.store.imports().len(), 2);
    }

    // S6: two bundles sharing one payload never fetch it twice.
    #[tokio::test]
    async fn duplicate_payload_fetches_once() {
        let h = harness();
        let body = run(900, 9);
        let first = signed_manifest(&keypair(), 1, &body);
        let second = signed_manifest(&keypair(), 1, &body);
        let p16 = prefix16(&first);
        let version = first.version;
        let first_bid = first.bid;
        let peer = FetchPeer::new(None, sid(1));

        h.engine.suggest_queue_manifest_import(first, peer).expect("suggest");
        h.engine.suggest_queue_manifest_import(second, peer).expect("suggest");
        h.engine.activate_queued_fetches();

        // One slot took the payload; the duplicate resolved away.
        let active = h.engine.active_fetches();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bid, Some(first_bid));
        assert!(!h.engine.any_fetch_queued());

        assert!(h.engine.received_content(&p16, version, 0, &body, BlockKind::Tail));
        assert!(!h.engine.any_fetch_active());
        assert_eq!(h.store.imports().len(), 1);
    }

    // Bytes that already arrived over the stream survive the fallback; the
    // datagram window resumes exactly where the stream died.
    #[tokio::test]
    async fn fallback_resumes_at_stream_offset() {
        let h = harness();
        let body = run(1234, 31);
        let m = signed_manifest(&keypair(), 2, &body);
        let p16 = prefix16(&m);
        let version = m.version;
        let peer = FetchPeer::new(Some(addr(1)), sid(1));

        // Serve the head plus the first 1000 body bytes, then hang up.
        let mut reply = ok_reply(&body);
        reply.truncate(reply.len() - 234);
        register_http(&h.connector, addr(1), reply);

        h.engine.suggest_queue_manifest_import(m, peer).expect("suggest");
        h.engine.activate_queued_fetches();

        let overlay = h.overlay.clone();
        wait_until(move || !overlay.frames().is_empty()).await;
        let request = BlockRequest::decode(&h.overlay.frames()[0].payload).expect("decode");
        assert_eq!(request.window_start, 1000);

        // Deliver the tail out of order, then the gap.
        assert!(h
            .engine
            .received_content(&p16, version, 1200, &body[1200..], BlockKind::Tail));
        assert!(h
            .engine
            .received_content(&p16, version, 1000, &body[1000..1200], BlockKind::Body));

        assert!(!h.engine.any_fetch_active());
        let imports = h.store.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].payload.as_deref(), Some(&body[..]));
    }

    // A manifest fetched by id prefix re-enters through the suggestion
    // path and imports like any advertised bundle.
    #[tokio::test]
    async fn manifest_by_prefix_roundtrip() {
        let h = harness();
        let m = signed_manifest(&keypair(), 4, b"");
        let bid = m.bid;
        let encoded = m.to_bytes().expect("encode");
        register_http(&h.connector, addr(1), ok_reply(&encoded));

        let outcome = h
            .engine
            .request_manifest_by_prefix(FetchPeer::new(Some(addr(1)), sid(1)), &bid.0[..8])
            .expect("request");
        assert_eq!(outcome, PrefixFetchStart::Started);

        let engine = h.engine.clone();
        wait_until(move || !engine.any_fetch_active()).await;

        let imports = h.store.imports();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].manifest.bid, bid);
        // The manifest scratch file is gone; only the import remains.
        let scratch = h
            .dir
            .path()
            .join(format!("manifest.{}", hex::encode(&bid.0[..8])));
        assert!(!scratch.exists());
    }

    // Version ordering: an in-flight fetch of an older version runs to
    // completion; the newer candidate waits its turn and then fetches.
    #[tokio::test]
    async fn newer_version_waits_for_inflight_older_fetch() {
        let h = harness();
        let key = keypair();
        let body_v1 = run(600, 1);
        let body_v2 = run(700, 2);
        let v1 = signed_manifest(&key, 1, &body_v1);
        let v2 = signed_manifest(&key, 2, &body_v2);
        let p16 = prefix16(&v1);
        let peer = FetchPeer::new(None, sid(1));

        h.engine.suggest_queue_manifest_import(v1, peer).expect("suggest");
        h.engine.activate_queued_fetches();
        assert_eq!(h.engine.active_fetches()[0].state, SlotState::RxDatagram);

        h.engine.suggest_queue_manifest_import(v2, peer).expect("suggest");
        h.engine.activate_queued_fetches();
        // No pre-emption: v1 still active, v2 still queued.
        assert_eq!(h.engine.active_fetches().len(), 1);
        assert_eq!(h.engine.queued_fetches().len(), 1);
        assert_eq!(h.engine.queued_fetches()[0].version, 2);

        // Completing v1 cascades straight into fetching v2.
        assert!(h.engine.received_content(&p16, 1, 0, &body_v1, BlockKind::Tail));
        assert!(h.engine.any_fetch_active());
        assert!(!h.engine.any_fetch_queued());
        assert!(h.engine.received_content(&p16, 2, 0, &body_v2, BlockKind::Tail));

        let imports = h.store.imports();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].manifest.version, 1);
        assert_eq!(imports[1].manifest.version, 2);
    }
}

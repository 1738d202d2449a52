// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pipeline tests for ResourceLoader
//!
//! Drive the memory -> disk -> network pipeline with in-process
//! collaborators: a scripted network loader, a decoder that rejects bytes
//! without an `ok:` prefix, and counting wrappers around the real caches.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use resloader::cache::{CacheEditor, DiskCache, FsDiskCache, MemoryCache, MemoryReport, RecyclingCache};
use resloader::loader::{
    Decoder, ExceptionHandler, KeyDeriver, LoadListener, LoadLogger, LoadRequest, NetworkLoader,
    Sha256KeyDeriver,
};
use resloader::{CancelToken, LoaderConfig, LoaderError, ResourceLoader};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT_SECS: u64 = 10;
const URL: &str = "https://assets.test/x.png";

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Serves canned bodies, optionally holding every fetch until a gate opens.
struct ScriptedNetwork {
    bodies: HashMap<String, Vec<u8>>,
    fetches: AtomicUsize,
    gate: AtomicBool,
    /// Keep going after cancellation, like a loader stuck in a blocking read.
    ignores_cancel: bool,
}

impl ScriptedNetwork {
    fn new() -> Arc<Self> {
        Self::with_gate(true)
    }

    fn held() -> Arc<Self> {
        Self::with_gate(false)
    }

    fn held_ignoring_cancel() -> Arc<Self> {
        Self::build(false, true)
    }

    fn with_gate(open: bool) -> Arc<Self> {
        Self::build(open, false)
    }

    fn build(open: bool, ignores_cancel: bool) -> Arc<Self> {
        let mut bodies = HashMap::new();
        bodies.insert(URL.to_string(), b"ok:pixels".to_vec());
        bodies.insert("https://assets.test/y.png".to_string(), b"ok:other".to_vec());
        Arc::new(Self {
            bodies,
            fetches: AtomicUsize::new(0),
            gate: AtomicBool::new(open),
            ignores_cancel,
        })
    }

    fn release(&self) {
        self.gate.store(true, Ordering::SeqCst);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl NetworkLoader for ScriptedNetwork {
    fn fetch(&self, identifier: &str, sink: &mut dyn Write, token: &CancelToken) -> anyhow::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        while !self.gate.load(Ordering::SeqCst) {
            if !self.ignores_cancel {
                token.check()?;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let body = self
            .bodies
            .get(identifier)
            .ok_or_else(|| anyhow!("404 for {}", identifier))?;
        for chunk in body.chunks(3) {
            if !self.ignores_cancel {
                token.check()?;
            }
            sink.write_all(chunk)?;
        }
        Ok(())
    }
}

/// Accepts only bytes starting with `ok:`.
struct PrefixDecoder;

impl PrefixDecoder {
    fn check(bytes: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        if bytes.starts_with(b"ok:") {
            Ok(bytes)
        } else {
            Err(anyhow!("bad magic"))
        }
    }
}

impl Decoder<Vec<u8>> for PrefixDecoder {
    fn decode_file(&self, path: &Path, _request: &LoadRequest) -> anyhow::Result<Vec<u8>> {
        Self::check(std::fs::read(path)?)
    }

    fn decode_bytes(&self, bytes: &[u8], _request: &LoadRequest) -> anyhow::Result<Vec<u8>> {
        Self::check(bytes.to_vec())
    }
}

/// Forwards listener callbacks to a channel as short strings.
struct Recorder {
    tx: mpsc::UnboundedSender<String>,
}

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LoadListener<Vec<u8>> for Recorder {
    fn on_succeed(&self, _key: &str, resource: Arc<Vec<u8>>) {
        let _ = self.tx.send(format!("succeed:{}", String::from_utf8_lossy(&resource)));
    }

    fn on_failed(&self, _key: &str, _err: &anyhow::Error) {
        let _ = self.tx.send("failed".to_string());
    }

    fn on_canceled(&self, _key: &str) {
        let _ = self.tx.send("canceled".to_string());
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), rx.recv())
        .await
        .expect("no listener callback in time")
        .expect("listener channel closed")
}

/// Exactly-once: nothing else arrives after the first callback.
async fn assert_no_more_events(rx: &mut mpsc::UnboundedReceiver<String>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra listener callback");
}

#[derive(Default)]
struct CountingExceptions {
    disk_open: AtomicUsize,
    disk_write: AtomicUsize,
    corrupt: AtomicUsize,
    load: AtomicUsize,
}

impl ExceptionHandler for CountingExceptions {
    fn on_disk_open_error(&self, _err: &anyhow::Error) {
        self.disk_open.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disk_write_error(&self, _key: &str, _err: &anyhow::Error) {
        self.disk_write.fetch_add(1, Ordering::SeqCst);
    }

    fn on_corrupt_entry(&self, _key: &str, _err: &anyhow::Error) {
        self.corrupt.fetch_add(1, Ordering::SeqCst);
    }

    fn on_load_error(&self, _key: &str, _err: &anyhow::Error) {
        self.load.fetch_add(1, Ordering::SeqCst);
    }
}

/// RecyclingCache that remembers every `unused` call.
struct TrackingMemory {
    inner: RecyclingCache<Vec<u8>>,
    unused_calls: Mutex<Vec<String>>,
}

impl TrackingMemory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RecyclingCache::default(),
            unused_calls: Mutex::new(Vec::new()),
        })
    }

    fn unused_calls(&self, key: &str) -> usize {
        self.unused_calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

impl MemoryCache<Vec<u8>> for TrackingMemory {
    fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, resource: Arc<Vec<u8>>) {
        self.inner.put(key, resource)
    }

    fn unused(&self, key: &str) {
        self.unused_calls.lock().unwrap().push(key.to_string());
        self.inner.unused(key)
    }

    fn remove_all(&self) {
        self.inner.remove_all()
    }

    fn reduce(&self) {
        self.inner.reduce()
    }

    fn report(&self) -> MemoryReport {
        self.inner.report()
    }
}

/// FsDiskCache that counts commits.
struct CountingDisk {
    inner: FsDiskCache,
    commits: Arc<AtomicUsize>,
}

struct CountingEditor {
    inner: Box<dyn CacheEditor>,
    commits: Arc<AtomicUsize>,
}

impl CacheEditor for CountingEditor {
    fn output(&mut self, index: usize) -> Result<&mut dyn Write, LoaderError> {
        self.inner.output(index)
    }

    fn commit(self: Box<Self>) -> Result<(), LoaderError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit()
    }

    fn abort(self: Box<Self>) {
        self.inner.abort()
    }
}

impl CountingDisk {
    fn open(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FsDiskCache::open(dir, 1, 1, 1024 * 1024).unwrap(),
            commits: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl DiskCache for CountingDisk {
    fn get_file(&self, key: &str, index: usize) -> Option<PathBuf> {
        self.inner.get_file(key, index)
    }

    fn edit(&self, key: &str) -> Result<Option<Box<dyn CacheEditor>>, LoaderError> {
        Ok(self.inner.edit(key)?.map(|inner| {
            Box::new(CountingEditor {
                inner,
                commits: Arc::clone(&self.commits),
            }) as Box<dyn CacheEditor>
        }))
    }

    fn flush(&self) -> Result<(), LoaderError> {
        self.inner.flush()
    }

    fn close(&self) -> Result<(), LoaderError> {
        self.inner.close()
    }

    fn wipe(&self) -> Result<(), LoaderError> {
        self.inner.wipe()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Disk cache whose sinks refuse every write.
struct BrokenDisk;

struct BrokenEditor {
    sink: BrokenSink,
}

struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheEditor for BrokenEditor {
    fn output(&mut self, _index: usize) -> Result<&mut dyn Write, LoaderError> {
        Ok(&mut self.sink)
    }

    fn commit(self: Box<Self>) -> Result<(), LoaderError> {
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

impl DiskCache for BrokenDisk {
    fn get_file(&self, _key: &str, _index: usize) -> Option<PathBuf> {
        None
    }

    fn edit(&self, _key: &str) -> Result<Option<Box<dyn CacheEditor>>, LoaderError> {
        Ok(Some(Box::new(BrokenEditor { sink: BrokenSink })))
    }

    fn flush(&self) -> Result<(), LoaderError> {
        Ok(())
    }

    fn close(&self) -> Result<(), LoaderError> {
        Ok(())
    }

    fn wipe(&self) -> Result<(), LoaderError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingLogger {
    lines: Mutex<Vec<String>>,
}

impl LoadLogger for RecordingLogger {
    fn log(&self, _key: &str, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }
}

/// Parks the disk-to-network handover until `proceed` is set.
struct HandoverGate {
    reached: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    proceed: AtomicBool,
}

impl HandoverGate {
    fn new() -> (Arc<Self>, tokio::sync::oneshot::Receiver<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let gate = Arc::new(Self {
            reached: Mutex::new(Some(tx)),
            proceed: AtomicBool::new(false),
        });
        (gate, rx)
    }
}

impl LoadLogger for HandoverGate {
    fn log(&self, _key: &str, message: &str) {
        if message != "handing over to network stage" {
            return;
        }
        if let Some(tx) = self.reached.lock().unwrap().take() {
            let _ = tx.send(());
        }
        while !self.proceed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

struct Fixture {
    _tmp: TempDir,
    loader: ResourceLoader<Vec<u8>>,
    network: Arc<ScriptedNetwork>,
    memory: Arc<TrackingMemory>,
    disk: Arc<CountingDisk>,
    exceptions: Arc<CountingExceptions>,
}

fn config_in(tmp: &TempDir) -> LoaderConfig {
    LoaderConfig {
        cache_dir: Some(tmp.path().join("cache")),
        ..Default::default()
    }
}

fn fixture_with(config: impl FnOnce(&mut LoaderConfig), network: Arc<ScriptedNetwork>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config_in(&tmp);
    config(&mut cfg);
    let memory = TrackingMemory::new();
    let disk = CountingDisk::open(&tmp.path().join("cache"));
    let exceptions = Arc::new(CountingExceptions::default());
    let loader = ResourceLoader::builder(cfg)
        .decoder(Arc::new(PrefixDecoder))
        .network(network.clone())
        .memory_cache(memory.clone())
        .disk_cache(disk.clone())
        .exception_handler(exceptions.clone())
        .build()
        .unwrap();
    Fixture {
        _tmp: tmp,
        loader,
        network,
        memory,
        disk,
        exceptions,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {}, ScriptedNetwork::new())
}

impl Fixture {
    fn key(&self) -> String {
        self.loader.key_for(URL, "")
    }

    fn load(&self, listener: Arc<Recorder>) -> Option<resloader::TaskHandle> {
        self.loader
            .load(URL, "", 64, 64, serde_json::Value::Null, listener)
            .unwrap()
    }

    async fn wait_for_fetches(&self, count: usize) {
        let reached = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
            while self.network.fetches() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "network fetch never started");
    }
}

// =============================================================================
// PIPELINE SCENARIOS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cold_load_goes_disk_then_network_with_one_commit() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();

    let handle = fx.load(listener);
    assert!(handle.is_some(), "a cold load queues a disk-stage task");

    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_no_more_events(&mut rx).await;
    assert_eq!(fx.network.fetches(), 1);
    assert_eq!(fx.disk.commits(), 1);
    assert!(fx.disk.get_file(&fx.key(), 0).is_some());
    assert!(fx.loader.get(URL, "").is_some());

    let stats = fx.loader.stats().await.unwrap();
    assert_eq!(stats.disk_queue.name, "disk");
    assert_eq!(stats.disk_queue.completed, 1);
    assert_eq!(stats.net_queue.completed, 1);
    assert_eq!(stats.memory.entries, 1);
    assert_eq!(stats.disk_bytes, Some(b"ok:pixels".len() as u64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_hit_succeeds_synchronously_without_task() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();
    fx.load(listener.clone());
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");

    let handle = fx.load(listener);
    assert!(handle.is_none());
    // Delivered before load returned, so it is already in the channel.
    assert_eq!(rx.try_recv().unwrap(), "succeed:ok:pixels");
    assert_eq!(fx.network.fetches(), 1);
    assert_eq!(fx.loader.stats().await.unwrap().disk_queue.completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unused_during_network_stage_cancels_load() {
    let fx = fixture_with(|_| {}, ScriptedNetwork::held());
    let (listener, mut rx) = Recorder::new();
    fx.load(listener);
    fx.wait_for_fetches(1).await;

    fx.loader.unused(URL, "");
    assert_eq!(next_event(&mut rx).await, "canceled");
    assert_no_more_events(&mut rx).await;
    assert!(fx.memory.unused_calls(&fx.key()) >= 1);
    assert!(fx.loader.get(URL, "").is_none());
    assert!(fx.disk.get_file(&fx.key(), 0).is_none());
    assert_eq!(fx.disk.commits(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resource_evicted_from_memory_comes_back_from_disk() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();
    fx.load(listener.clone());
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");

    fx.loader.unused(URL, "");
    fx.loader.reduce_memory_cache();
    assert!(fx.loader.get(URL, "").is_none());

    let handle = fx.load(listener);
    assert!(handle.is_some(), "memory miss goes back to the disk stage");
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_eq!(fx.network.fetches(), 1, "disk cache alone must serve the reload");
    assert_eq!(fx.disk.commits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unused_twice_is_same_as_once() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();
    fx.load(listener);
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");

    fx.loader.unused(URL, "");
    let once = fx.memory.report();
    fx.loader.unused(URL, "");
    let twice = fx.memory.report();
    assert_eq!(once, twice);
    assert_eq!(twice.unused, 1);
    assert_eq!(twice.reclaimed, 0);
    assert_no_more_events(&mut rx).await;

    fx.loader.reduce_memory_cache();
    assert_eq!(fx.memory.report().reclaimed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unused_during_stage_handover_cancels_load() {
    let fx = fixture();
    let (gate, reached) = HandoverGate::new();
    fx.loader.set_logger(Some(gate.clone()));
    let (listener, mut rx) = Recorder::new();
    fx.load(listener);

    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), reached)
        .await
        .expect("disk stage never handed over")
        .unwrap();
    // Neither queue holds the load right now.
    fx.loader.unused(URL, "");
    gate.proceed.store(true, Ordering::SeqCst);

    assert_eq!(next_event(&mut rx).await, "canceled");
    assert_no_more_events(&mut rx).await;
    assert_eq!(fx.network.fetches(), 0);
    assert_eq!(fx.disk.commits(), 0);
    assert!(fx.loader.get(URL, "").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_after_unused_is_not_released() {
    let fx = fixture_with(|_| {}, ScriptedNetwork::held());
    let (first, mut first_rx) = Recorder::new();
    fx.load(first);
    fx.wait_for_fetches(1).await;
    fx.loader.unused(URL, "");
    assert_eq!(next_event(&mut first_rx).await, "canceled");

    fx.network.release();
    let (second, mut second_rx) = Recorder::new();
    fx.load(second);
    assert_eq!(next_event(&mut second_rx).await, "succeed:ok:pixels");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resource_larger_than_disk_budget_still_loads() {
    let tmp = TempDir::new().unwrap();
    let network = ScriptedNetwork::new();
    let mut config = config_in(&tmp);
    config.disk_cache_bytes = 4;
    let loader = ResourceLoader::builder(config)
        .decoder(Arc::new(PrefixDecoder))
        .network(network.clone())
        .build()
        .unwrap();

    let (listener, mut rx) = Recorder::new();
    loader.load(URL, "", 0, 0, serde_json::Value::Null, listener.clone()).unwrap();
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_no_more_events(&mut rx).await;
    assert_eq!(network.fetches(), 1);
    let stats = loader.stats().await.unwrap();
    assert_eq!(stats.disk_bytes, Some(b"ok:pixels".len() as u64));

    // Kept until the next commit trims it, so a reload comes from disk.
    loader.unused(URL, "");
    loader.reduce_memory_cache();
    loader.load(URL, "", 0, 0, serde_json::Value::Null, listener).unwrap();
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_eq!(network.fetches(), 1);
}

// =============================================================================
// FAILURE PATHS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_disk_entry_is_refetched() {
    let fx = fixture();
    let mut editor = fx.disk.edit(&fx.key()).unwrap().unwrap();
    editor.output(0).unwrap().write_all(b"garbage").unwrap();
    editor.commit().unwrap();

    let (listener, mut rx) = Recorder::new();
    fx.load(listener);
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_eq!(fx.exceptions.corrupt.load(Ordering::SeqCst), 1);
    assert_eq!(fx.network.fetches(), 1);

    let path = fx.disk.get_file(&fx.key(), 0).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"ok:pixels");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_network_error_fails_load_and_releases_entry() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();
    fx.loader
        .load("https://assets.test/missing.png", "", 0, 0, serde_json::Value::Null, listener)
        .unwrap();

    assert_eq!(next_event(&mut rx).await, "failed");
    assert_no_more_events(&mut rx).await;
    assert_eq!(fx.exceptions.load.load(Ordering::SeqCst), 1);
    let key = fx.loader.key_for("https://assets.test/missing.png", "");
    assert_eq!(fx.memory.unused_calls(&key), 1);
    assert!(fx.disk.get_file(&key, 0).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disk_write_failure_reports_and_fails() {
    let tmp = TempDir::new().unwrap();
    let exceptions = Arc::new(CountingExceptions::default());
    let loader = ResourceLoader::builder(config_in(&tmp))
        .decoder(Arc::new(PrefixDecoder))
        .network(ScriptedNetwork::new())
        .disk_cache(Arc::new(BrokenDisk))
        .exception_handler(exceptions.clone())
        .build()
        .unwrap();

    let (listener, mut rx) = Recorder::new();
    loader.load(URL, "", 0, 0, serde_json::Value::Null, listener).unwrap();
    assert_eq!(next_event(&mut rx).await, "failed");
    assert_eq!(exceptions.disk_write.load(Ordering::SeqCst), 1);
    assert!(loader.get(URL, "").is_none());
}

// =============================================================================
// DISK-LESS OPERATION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_disk_cache_fetches_into_memory() {
    let tmp = TempDir::new().unwrap();
    let network = ScriptedNetwork::new();
    let mut config = config_in(&tmp);
    config.disk_cache_enabled = false;
    let loader = ResourceLoader::builder(config)
        .decoder(Arc::new(PrefixDecoder))
        .network(network.clone())
        .build()
        .unwrap();
    assert!(!loader.has_disk_cache());

    let (listener, mut rx) = Recorder::new();
    loader.load(URL, "", 0, 0, serde_json::Value::Null, listener.clone()).unwrap();
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");

    let stats = loader.stats().await.unwrap();
    assert_eq!(stats.disk_queue.completed, 0);
    assert_eq!(stats.net_queue.completed, 1);
    assert_eq!(stats.disk_bytes, None);
    assert!(!tmp.path().join("cache").exists());

    assert!(loader.load(URL, "", 0, 0, serde_json::Value::Null, listener).unwrap().is_none());
    assert_eq!(network.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unopenable_disk_cache_falls_back_to_network_only() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let exceptions = Arc::new(CountingExceptions::default());
    let config = LoaderConfig {
        cache_dir: Some(blocker.join("cache")),
        ..Default::default()
    };
    let loader = ResourceLoader::builder(config)
        .decoder(Arc::new(PrefixDecoder))
        .network(ScriptedNetwork::new())
        .exception_handler(exceptions.clone())
        .build()
        .unwrap();

    assert_eq!(exceptions.disk_open.load(Ordering::SeqCst), 1);
    assert!(!loader.has_disk_cache());
    let (listener, mut rx) = Recorder::new();
    loader.load(URL, "", 0, 0, serde_json::Value::Null, listener).unwrap();
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
}

// =============================================================================
// DUPLICATE LOADS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_load_is_rejected_by_default() {
    let fx = fixture_with(|_| {}, ScriptedNetwork::held());
    let (first, mut first_rx) = Recorder::new();
    let (second, mut second_rx) = Recorder::new();

    fx.load(first);
    fx.wait_for_fetches(1).await;
    fx.load(second);
    assert_eq!(next_event(&mut second_rx).await, "canceled");

    fx.network.release();
    assert_eq!(next_event(&mut first_rx).await, "succeed:ok:pixels");
    assert_eq!(fx.network.fetches(), 1);
    assert_no_more_events(&mut second_rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_load_follows_when_enabled() {
    let fx = fixture_with(|c| c.duplicate_load = true, ScriptedNetwork::held());
    let (first, mut first_rx) = Recorder::new();
    let (second, mut second_rx) = Recorder::new();

    fx.load(first);
    fx.wait_for_fetches(1).await;
    fx.load(second);
    // Let the second load reach the network stage and attach.
    let attached = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while fx.loader.stats().await.unwrap().net_queue.followers == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(attached.is_ok(), "second load never attached to the first");

    fx.network.release();
    assert_eq!(next_event(&mut first_rx).await, "succeed:ok:pixels");
    assert_eq!(next_event(&mut second_rx).await, "succeed:ok:pixels");
    assert_eq!(fx.network.fetches(), 1);
    assert_eq!(fx.disk.commits(), 1);
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_cancels_in_flight_and_refuses_new_loads() {
    let fx = fixture_with(|_| {}, ScriptedNetwork::held());
    let (listener, mut rx) = Recorder::new();
    fx.load(listener.clone());
    fx.wait_for_fetches(1).await;

    fx.loader.destroy();
    fx.loader.destroy();
    assert_eq!(next_event(&mut rx).await, "canceled");
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), fx.loader.closed())
        .await
        .expect("queues did not drain");

    assert!(fx.loader.is_destroyed());
    let result = fx.loader.load(URL, "", 0, 0, serde_json::Value::Null, listener);
    assert!(matches!(result, Err(LoaderError::Destroyed)));
    assert!(fx.loader.get(URL, "").is_none());
    assert!(matches!(fx.disk.edit(&fx.key()), Err(LoaderError::CacheClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_during_commit_is_not_a_disk_error() {
    let fx = fixture_with(|_| {}, ScriptedNetwork::held_ignoring_cancel());
    let (listener, mut rx) = Recorder::new();
    fx.load(listener);
    fx.wait_for_fetches(1).await;

    fx.loader.destroy();
    fx.network.release();
    assert_eq!(next_event(&mut rx).await, "canceled");
    assert_no_more_events(&mut rx).await;
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), fx.loader.closed())
        .await
        .expect("queues did not drain");
    assert_eq!(fx.exceptions.disk_write.load(Ordering::SeqCst), 0);
    assert_eq!(fx.exceptions.load.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_timeout_cancels_stalled_fetch() {
    let fx = fixture_with(|c| c.task_timeout_secs = Some(1), ScriptedNetwork::held());
    let (listener, mut rx) = Recorder::new();
    fx.load(listener);
    assert_eq!(next_event(&mut rx).await, "canceled");
    assert_eq!(fx.disk.commits(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logger_can_be_swapped_and_disabled() {
    let fx = fixture();
    let logger = Arc::new(RecordingLogger::default());
    fx.loader.set_logger(Some(logger.clone()));

    let (listener, mut rx) = Recorder::new();
    fx.load(listener.clone());
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    let lines = logger.lines.lock().unwrap().clone();
    assert!(lines.iter().any(|l| l == "disk cache miss"));
    assert!(lines.iter().any(|l| l == "loaded from network"));

    fx.loader.set_logger(None);
    let before = logger.lines.lock().unwrap().len();
    fx.load(listener);
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_eq!(logger.lines.lock().unwrap().len(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wipe_disk_cache_forces_refetch() {
    let fx = fixture();
    let (listener, mut rx) = Recorder::new();
    fx.load(listener.clone());
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");

    fx.loader.wipe_disk_cache().unwrap();
    fx.loader.unused(URL, "");
    fx.loader.reduce_memory_cache();
    fx.load(listener);
    assert_eq!(next_event(&mut rx).await, "succeed:ok:pixels");
    assert_eq!(fx.network.fetches(), 2);
}

#[tokio::test]
async fn test_builder_requires_decoder_and_network() {
    let tmp = TempDir::new().unwrap();
    let missing_network = ResourceLoader::<Vec<u8>>::builder(config_in(&tmp))
        .decoder(Arc::new(PrefixDecoder))
        .build();
    assert!(matches!(missing_network, Err(LoaderError::MissingCollaborator(_))));

    let missing_decoder = ResourceLoader::<Vec<u8>>::builder(config_in(&tmp))
        .network(ScriptedNetwork::new())
        .build();
    assert!(matches!(missing_decoder, Err(LoaderError::MissingCollaborator("decoder"))));
}

#[test]
fn test_key_for_matches_sha256_deriver() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let tmp = TempDir::new().unwrap();
    let loader = ResourceLoader::builder(config_in(&tmp))
        .decoder(Arc::new(PrefixDecoder))
        .network(ScriptedNetwork::new())
        .build()
        .unwrap();
    assert_eq!(loader.key_for(URL, "thumb"), Sha256KeyDeriver.derive(URL, "thumb"));
    assert_ne!(loader.key_for(URL, "thumb"), loader.key_for(URL, ""));
    loader.destroy();
}

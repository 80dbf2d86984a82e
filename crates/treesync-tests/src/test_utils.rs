//! Shared helpers for treesync integration tests
//!
//! Tree builders, tree snapshots and an in-process update server bound to an
//! ephemeral port.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use treesync_config::{AppConfig, ClientConfig, ServerConfig, CLIENT_STATE_FILE};
use treesync_network::{serve_on, SyncCoordinator};
use treesync_sync::{FingerprintIndex, IgnoreSet};
use treesync_types::{Fingerprints, TransferMode};

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros - highly compressible
    Zeros,
    /// Deterministic pseudo-random bytes - incompressible
    Random,
    /// Structured bytes similar to real files
    Realistic,
}

/// Generate test data with specified pattern
pub fn generate_test_data(size: usize, pattern: TestDataPattern) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Random => {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};

            let mut data = Vec::with_capacity(size);
            let mut hasher = DefaultHasher::new();
            for i in 0..size {
                i.hash(&mut hasher);
                data.push((hasher.finish() % 256) as u8);
            }
            data
        }
        TestDataPattern::Realistic => (0..size).map(|i| ((i * 7 + 13) % 256) as u8).collect(),
    }
}

/// Write one file under `root`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create test directory");
    }
    fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Write every `(relative path, text)` pair under `root`
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        write_file(root, relative, content.as_bytes());
    }
}

/// A small app tree with nested directories and mixed file sizes
pub fn sample_tree(root: &Path) {
    write_file(root, "game.exe", &generate_test_data(64 * 1024, TestDataPattern::Random));
    write_file(root, "readme.txt", b"Welcome to the game\n");
    write_file(root, "data/levels/1.map", &generate_test_data(4096, TestDataPattern::Realistic));
    write_file(root, "data/levels/2.map", &generate_test_data(8192, TestDataPattern::Realistic));
    write_file(root, "data/textures/sky.bin", &generate_test_data(16 * 1024, TestDataPattern::Zeros));
    write_file(root, "empty.dat", b"");
}

/// Fingerprints of every file under `root` except client bookkeeping files
pub fn tree_hashes(root: &Path) -> Fingerprints {
    let ignore = IgnoreSet::new([CLIENT_STATE_FILE, "*.autoupdatetmpfile", "**/*.autoupdatetmpfile"])
        .expect("Failed to compile ignore patterns");
    FingerprintIndex::build_or_empty(root, &ignore, true)
        .expect("Failed to index test tree")
        .into_hashes()
}

/// Update server running on an ephemeral local port
pub struct TestServer {
    /// Address the server listens on
    pub addr: SocketAddr,
    /// Coordinator shared with the running server
    pub coordinator: Arc<SyncCoordinator>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<treesync_types::Result<()>>>,
    _cache_dir: TempDir,
}

impl TestServer {
    /// Serve each `(name, dir)` app with default settings and no watcher
    pub async fn start(apps: &[(&str, &Path)]) -> Self {
        Self::start_with(apps, &[]).await
    }

    /// Serve each app with `ignore` as its server-side ignore list
    pub async fn start_with(apps: &[(&str, &Path)], ignore: &[&str]) -> Self {
        let cache_dir = TempDir::new().expect("Failed to create cache dir");
        let mut config = ServerConfig::default();
        config.cache_dir = cache_dir.path().to_path_buf();
        config.watch.enabled = false;
        for (name, dir) in apps {
            let mut app = AppConfig::new(dir);
            app.ignore = ignore.iter().map(|p| (*p).to_string()).collect();
            config.apps.insert((*name).to_string(), app);
        }

        let coordinator =
            Arc::new(SyncCoordinator::new(&config).expect("Failed to build coordinator"));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local address");

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve_on(listener, Arc::clone(&coordinator), async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            coordinator,
            shutdown: Some(shutdown),
            handle: Some(handle),
            _cache_dir: cache_dir,
        }
    }

    /// `host:port` for client configurations
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Base URL for raw HTTP requests
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Client configuration for `app` syncing into `dir`
    pub fn client_config(&self, app: &str, dir: &Path, mode: TransferMode) -> ClientConfig {
        let mut config = ClientConfig::new(self.host(), app, dir);
        config.transfer = mode;
        config
    }

    /// Stop the server and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .expect("Server task panicked")
                .expect("Server failed");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_data_patterns() {
        let zeros = generate_test_data(1024, TestDataPattern::Zeros);
        assert_eq!(zeros.len(), 1024);
        assert!(zeros.iter().all(|&b| b == 0));

        let random = generate_test_data(1024, TestDataPattern::Random);
        assert_eq!(random, generate_test_data(1024, TestDataPattern::Random));
    }

    #[test]
    fn test_tree_hashes_skip_bookkeeping() {
        let temp_dir = TempDir::new().unwrap();
        write_tree(
            temp_dir.path(),
            &[
                ("a.txt", "a"),
                (CLIENT_STATE_FILE, "{}"),
                ("bin/tool.exe.autoupdatetmpfile", "old"),
            ],
        );

        let hashes = tree_hashes(temp_dir.path());
        assert_eq!(hashes.keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }
}

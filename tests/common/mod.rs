//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestEngine;
//! ```
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use kbsearch::telemetry::MemorySink;
use kbsearch::{EngineConfig, NewEntry, SearchEngine};
use tempfile::TempDir;

/// Engine over a temporary store, with automatic cleanup
///
/// Keeps the backing `TempDir` alive as long as the engine is in use.
pub struct TestEngine {
    pub engine: SearchEngine,
    /// Ids of the seeded entries, in [`seed_entries`] order
    pub ids: Vec<String>,
    pub telemetry: Arc<MemorySink>,
    pub path: PathBuf,
    _dir: TempDir,
}

impl TestEngine {
    /// Empty store, default configuration
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        Self::open_in(dir, config).await
    }

    /// Store seeded with [`seed_entries`]
    pub async fn seeded() -> Self {
        Self::seeded_with_config(EngineConfig::default()).await
    }

    pub async fn seeded_with_config(config: EngineConfig) -> Self {
        let mut test = Self::with_config(config).await;
        for entry in seed_entries() {
            let id = test.engine.add_entry(entry).await.expect("Failed to seed entry");
            test.ids.push(id);
        }
        test
    }

    /// Reopen the same directory with a new engine (simulates a restart)
    pub async fn reopen(self, config: EngineConfig) -> Self {
        self.engine.close().await;
        let Self { ids, _dir, .. } = self;
        let mut test = Self::open_in(_dir, config).await;
        test.ids = ids;
        test
    }

    async fn open_in(dir: TempDir, config: EngineConfig) -> Self {
        let path = dir.path().join("kb.db");
        let telemetry = Arc::new(MemorySink::new());
        let engine = SearchEngine::open_with_telemetry(&path, config, telemetry.clone())
            .await
            .expect("Failed to open engine");
        Self {
            engine,
            ids: Vec::new(),
            telemetry,
            path,
            _dir: dir,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = SearchEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Mainframe troubleshooting entries used across the integration tests
pub fn seed_entries() -> Vec<NewEntry> {
    vec![
        NewEntry::new(
            "S0C7 data exception",
            "COBOL program abends with S0C7 on packed decimal field",
            "Initialize COMP-3 fields before arithmetic",
            "COBOL",
        )
        .with_tags(["abend", "cobol"]),
        NewEntry::new(
            "Dataset not found in JCL",
            "JCL step fails because the file not found on volume",
            "Check DSN spelling and catalog entry",
            "JCL",
        )
        .with_tags(["jcl", "dataset"]),
        NewEntry::new(
            "VSAM open error",
            "Program receives status 35 when the file not found",
            "Define the cluster with IDCAMS",
            "VSAM",
        )
        .with_tags(["vsam", "dataset", "abend"]),
        NewEntry::new(
            "JCL condition codes",
            "Step skipped unexpectedly",
            "Review COND parameters on the EXEC statement",
            "jcl",
        ),
        NewEntry::new(
            "S806 module not found",
            "Program load fails with S806 abend",
            "Add the load library to STEPLIB",
            "JCL",
        )
        .with_tags(["abend", "jcl"]),
    ]
}

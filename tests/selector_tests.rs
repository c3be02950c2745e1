//! Integration tests for store selection: version gating, privilege checks,
//! validation of the target file, and persisted defaults.

use sharedstore::config::{AppConfig, RetryConfig};
use sharedstore::migration::REQUIRED_SCHEMA_VERSION;
use sharedstore::session::{SelectionStore, StoreState};
use sharedstore::{CallerContext, CanonicalPath, SelectOutcome, StoreError, StoreRuntime};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct SelectorHarness {
    runtime: StoreRuntime,
    temp_dir: TempDir,
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry = RetryConfig {
        max_attempts: 10,
        base_delay_ms: 5,
        max_delay_ms: 50,
    };
    config
}

impl SelectorHarness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config();
        adjust(&mut config);
        let runtime = StoreRuntime::from_config(&config).unwrap();
        Self { runtime, temp_dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// A store left at version 0.
    async fn empty_store(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        self.runtime
            .selector()
            .provision(&CallerContext::privileged("setup"), &path, None)
            .await
            .unwrap();
        path
    }

    /// A store at the required version.
    async fn current_store(&self, name: &str) -> PathBuf {
        let path = self.empty_store(name).await;
        self.runtime
            .selector()
            .force_migrate(&CallerContext::privileged("setup"), &path)
            .await
            .unwrap();
        path
    }
}

async fn history_len(path: &Path) -> i64 {
    let mut conn = SqliteConnection::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _schema_history")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    count
}

#[tokio::test(flavor = "multi_thread")]
async fn test_current_store_is_ready_without_migration() {
    let harness = SelectorHarness::new();
    let path = harness.current_store("ready.db").await;
    let history_before = history_len(&path).await;

    let mut alice = harness.runtime.binding(CallerContext::new("alice"));
    let mut bob = harness.runtime.binding(CallerContext::new("bob"));
    let selector = harness.runtime.selector();

    let outcome = selector.select(&mut alice, &path).await.unwrap();
    assert!(outcome.is_ready());
    selector.select(&mut bob, &path).await.unwrap();

    assert_eq!(history_len(&path).await, history_before);
    let a = selector.current(&alice).unwrap();
    let b = selector.current(&bob).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(
        alice.selected_path(),
        Some(&CanonicalPath::resolve(&path).unwrap())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unprivileged_caller_gets_migration_required() {
    let harness = SelectorHarness::new();
    let path = harness.empty_store("stale.db").await;

    let mut binding = harness.runtime.binding(CallerContext::new("alice"));
    let outcome = harness
        .runtime
        .selector()
        .select(&mut binding, &path)
        .await
        .unwrap();

    match outcome {
        SelectOutcome::MigrationRequired {
            current,
            required,
            pending,
        } => {
            assert_eq!(current, 0);
            assert_eq!(required, REQUIRED_SCHEMA_VERSION);
            assert_eq!(pending as i64, REQUIRED_SCHEMA_VERSION);
        }
        other => panic!("expected MigrationRequired, got {:?}", other),
    }

    assert!(!binding.is_bound());
    assert_eq!(history_len(&path).await, 0);
    let canonical = CanonicalPath::resolve(&path).unwrap();
    assert!(harness.runtime.cache().get(&canonical).is_none());

    let status = harness.runtime.selector().status(&path).await.unwrap();
    assert_eq!(status.state, StoreState::MigrationRequired);
    assert!(!status.cached);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_migrate_disabled_leaves_store_alone() {
    let harness = SelectorHarness::with_config(|c| c.store.auto_migrate = false);
    let path = harness.empty_store("manual.db").await;

    let mut binding = harness.runtime.binding(CallerContext::privileged("admin"));
    let outcome = harness
        .runtime
        .selector()
        .select(&mut binding, &path)
        .await
        .unwrap();
    assert!(matches!(outcome, SelectOutcome::MigrationRequired { current: 0, .. }));
    assert_eq!(history_len(&path).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_newer_store_is_rejected() {
    let harness = SelectorHarness::new();
    let path = harness.current_store("future.db").await;

    // An older build that only knows v1.
    let old_build = SelectorHarness::with_config(|c| c.store.required_version = Some(1));
    let mut binding = old_build.runtime.binding(CallerContext::privileged("admin"));
    let err = old_build
        .runtime
        .selector()
        .select(&mut binding, &path)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StoreError::IncompatibleSchema {
            current,
            supported: 1
        } if current == REQUIRED_SCHEMA_VERSION
    ));
    assert!(!binding.is_bound());
    assert!(old_build.runtime.cache().list().is_empty());

    let forced = old_build
        .runtime
        .selector()
        .force_migrate(&CallerContext::privileged("admin"), &path)
        .await;
    assert!(matches!(forced, Err(StoreError::IncompatibleSchema { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_and_foreign_files() {
    let harness = SelectorHarness::new();
    let selector = harness.runtime.selector();
    let mut binding = harness.runtime.binding(CallerContext::new("alice"));

    let missing = selector
        .select(&mut binding, harness.path("nowhere.db"))
        .await;
    assert!(matches!(missing, Err(StoreError::StoreUnavailable { .. })));

    let text = harness.path("readme.db");
    std::fs::write(&text, "plain text, not a database").unwrap();
    let result = selector.select(&mut binding, &text).await;
    assert!(matches!(result, Err(StoreError::StoreInvalid { .. })));

    // A real SQLite file that was never provisioned as a store.
    let foreign = harness.path("foreign.db");
    let options = SqliteConnectOptions::new()
        .filename(&foreign)
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::query("CREATE TABLE other (id INTEGER PRIMARY KEY)")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let result = selector.select(&mut binding, &foreign).await;
    assert!(matches!(result, Err(StoreError::StoreInvalid { .. })));
    assert!(!binding.is_bound());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_force_migrate_requires_privilege() {
    let harness = SelectorHarness::new();
    let path = harness.empty_store("locked.db").await;

    let result = harness
        .runtime
        .selector()
        .force_migrate(&CallerContext::new("alice"), &path)
        .await;
    assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
    assert_eq!(history_len(&path).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rebind_switches_only_on_ready() {
    let harness = SelectorHarness::new();
    let first = harness.current_store("first.db").await;
    let second = harness.current_store("second.db").await;
    let stale = harness.empty_store("stale.db").await;
    let selector = harness.runtime.selector();

    let mut binding = harness.runtime.binding(CallerContext::new("alice"));
    selector.select(&mut binding, &first).await.unwrap();
    let first_handle = selector.current(&binding).unwrap();

    let outcome = selector.rebind(&mut binding, &second).await.unwrap();
    assert!(outcome.is_ready());
    assert_eq!(
        binding.selected_path(),
        Some(&CanonicalPath::resolve(&second).unwrap())
    );
    // The old handle stays cached for other callers.
    assert!(!first_handle.is_disposed());
    assert!(harness
        .runtime
        .cache()
        .get(&CanonicalPath::resolve(&first).unwrap())
        .is_some());

    let outcome = selector.rebind(&mut binding, &stale).await.unwrap();
    assert!(!outcome.is_ready());
    assert_eq!(
        binding.selected_path(),
        Some(&CanonicalPath::resolve(&second).unwrap())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_select_default_prefers_persisted_selection() {
    let harness = SelectorHarness::new();
    let fallback = harness.current_store("fallback.db").await;
    let chosen = harness.current_store("chosen.db").await;

    let mut unconfigured = harness.runtime.binding(CallerContext::new("alice"));
    let result = harness
        .runtime
        .selector()
        .select_default(&mut unconfigured)
        .await;
    assert!(matches!(result, Err(StoreError::NotSelected)));

    let state_path = harness.path("state").join("selections.json");
    let fallback_str = fallback.to_string_lossy().to_string();
    let state_str = state_path.to_string_lossy().to_string();
    let configure = |c: &mut AppConfig| {
        c.store.default_path = Some(fallback_str.clone());
        c.selection.state_path = Some(state_str.clone());
    };

    let mut config = test_config();
    configure(&mut config);
    let runtime = StoreRuntime::from_config(&config).unwrap();

    let mut binding = runtime.binding(CallerContext::new("alice"));
    runtime.selector().select_default(&mut binding).await.unwrap();
    assert_eq!(
        binding.selected_path(),
        Some(&CanonicalPath::resolve(&fallback).unwrap())
    );

    runtime.selector().select(&mut binding, &chosen).await.unwrap();
    drop(binding);
    drop(runtime);

    // A new process reads the persisted choice.
    let mut config = test_config();
    configure(&mut config);
    let runtime = StoreRuntime::from_config(&config).unwrap();
    let saved = runtime
        .selector()
        .selections()
        .load("alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.display_name, "chosen");

    let mut binding = runtime.binding(CallerContext::new("alice"));
    runtime.selector().select_default(&mut binding).await.unwrap();
    assert_eq!(
        binding.selected_path(),
        Some(&CanonicalPath::resolve(&chosen).unwrap())
    );

    // Other principals still get the configured default.
    let mut bob = runtime.binding(CallerContext::new("bob"));
    runtime.selector().select_default(&mut bob).await.unwrap();
    assert_eq!(
        bob.selected_path(),
        Some(&CanonicalPath::resolve(&fallback).unwrap())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_provision_never_overwrites() {
    let harness = SelectorHarness::new();
    let path = harness.current_store("keep.db").await;
    let history_before = history_len(&path).await;

    let result = harness
        .runtime
        .selector()
        .provision(&CallerContext::privileged("admin"), &path, Some("Keep"))
        .await;
    match result {
        Err(StoreError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
        other => panic!("expected AlreadyExists, got {:?}", other),
    }
    assert_eq!(history_len(&path).await, history_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_provision_records_display_name() {
    let harness = SelectorHarness::new();
    let path = harness.path("named.db");
    let admin = CallerContext::privileged("admin");

    let canonical = harness
        .runtime
        .selector()
        .provision(&admin, &path, Some("Head Office"))
        .await
        .unwrap();

    let saved = harness
        .runtime
        .selector()
        .selections()
        .load("admin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.display_name, "Head Office");
    assert_eq!(saved.last_selected_path, canonical.to_string());

    // Selecting the same store again keeps the chosen name.
    let mut binding = harness.runtime.binding(admin);
    harness
        .runtime
        .selector()
        .select_default(&mut binding)
        .await
        .unwrap();
    let saved = harness
        .runtime
        .selector()
        .selections()
        .load("admin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.display_name, "Head Office");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_with_edited_history_is_not_selected() {
    let harness = SelectorHarness::new();
    let path = harness.current_store("edited.db").await;

    let mut conn = SqliteConnection::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    sqlx::query("UPDATE _schema_history SET checksum = 'edited' WHERE version = 1")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let mut binding = harness.runtime.binding(CallerContext::new("alice"));
    let err = harness
        .runtime
        .selector()
        .select(&mut binding, &path)
        .await
        .unwrap_err();
    match err {
        StoreError::CatalogDrift {
            version, stored, ..
        } => {
            assert_eq!(version, 1);
            assert_eq!(stored, "edited");
        }
        other => panic!("expected CatalogDrift, got {:?}", other),
    }
    assert!(!binding.is_bound());

    let status = harness.runtime.selector().status(&path).await.unwrap();
    assert_eq!(status.state, StoreState::Drifted);
    assert_eq!(status.current, REQUIRED_SCHEMA_VERSION);
}

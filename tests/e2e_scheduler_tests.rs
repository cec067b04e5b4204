//! End-to-end tests driving changes through the hub into timed schedulers
//! backed by a real SQLite database.

use buildgate::changes::{ChangeHub, ChangeSource, ChangeStore, NewChange};
use buildgate::config::{AppConfig, CliConfig, FileConfig};
use buildgate::scheduler_store::{ClassificationStore, SqliteSchedulerStore};
use buildgate::timed_scheduler::{FakeClock, SchedulerManager};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
[[schedulers]]
name = "nightly"
branch = "master"
time_range = ["9:00", "17:00"]
builder_names = ["build-x86", "build-arm"]
file_is_important = ["\\.c$"]

[schedulers.properties]
tree = "mainline"

[[schedulers]]
name = "stable"
kind = "any_branch"
time_range = ["9:00", "17:00"]
builder_names = ["build-all"]
collapse_requests = true

[schedulers.change_filter]
branches = ["linux-6.6.y", "linux-6.1.y"]
"#;

struct TestEnv {
    store: Arc<SqliteSchedulerStore>,
    hub: ChangeHub,
    manager: SchedulerManager,
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn resolve_config(db_path: &Path) -> AppConfig {
    let cli = CliConfig {
        db_path: Some(db_path.to_path_buf()),
        metrics_port: 0,
        change_horizon: 0,
    };
    AppConfig::resolve(&cli, Some(FileConfig::parse(CONFIG).unwrap())).unwrap()
}

async fn start_env(db_path: &Path, now: NaiveDateTime) -> TestEnv {
    let config = resolve_config(db_path);
    let store = Arc::new(SqliteSchedulerStore::new(&config.db_path).unwrap());
    let hub = ChangeHub::new(store.clone() as Arc<dyn ChangeStore>, config.change_horizon);
    let manager =
        SchedulerManager::new(store.clone(), Arc::new(FakeClock::new(now)), config.schedulers)
            .unwrap();
    manager.start(&hub).await;
    TestEnv {
        store,
        hub,
        manager,
    }
}

fn change(branch: &str, file: &str) -> NewChange {
    NewChange {
        author: "dev@example.org".into(),
        repository: "git://example.org/linux.git".into(),
        branch: Some(branch.into()),
        files: vec![file.into()],
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_changes_before_window_build_at_window_start() {
    let temp_dir = TempDir::new().unwrap();
    let env = start_env(&temp_dir.path().join("buildgate.db"), at(8, 0)).await;

    let important = env.hub.add_change(&change("master", "mm/slab.c")).await.unwrap();
    let docs = env
        .hub
        .add_change(&change("master", "Documentation/index.rst"))
        .await
        .unwrap();
    env.hub
        .add_change(&change("linux-5.4.y", "kernel/fork.c"))
        .await
        .unwrap();

    let nightly = env.manager.get("nightly").unwrap();
    assert_eq!(nightly.pending_build_times().await, vec![at(9, 0)]);
    assert!(env.store.get_buildsets(10).unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(3601)).await;

    let buildsets = env.store.get_buildsets(10).unwrap();
    assert_eq!(buildsets.len(), 1);
    let buildset = &buildsets[0];
    assert_eq!(buildset.scheduler, "nightly");
    assert_eq!(buildset.change_ids, vec![important.id, docs.id]);
    assert_eq!(buildset.builder_names, vec!["build-x86", "build-arm"]);
    assert_eq!(buildset.properties["tree"], "mainline");
    assert!(buildset.reason.contains("'nightly'"));

    assert!(nightly.pending_build_times().await.is_empty());
    assert!(env
        .store
        .get_change_classifications(nightly.objectid())
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_changes_inside_window_build_immediately() {
    let temp_dir = TempDir::new().unwrap();
    let env = start_env(&temp_dir.path().join("buildgate.db"), at(11, 30)).await;

    let first = env
        .hub
        .add_change(&change("linux-6.6.y", "fs/ext4/inode.c"))
        .await
        .unwrap();
    let second = env
        .hub
        .add_change(&change("linux-6.1.y", "fs/ext4/super.c"))
        .await
        .unwrap();

    let buildsets = env.store.get_buildsets(10).unwrap();
    assert_eq!(buildsets.len(), 2);
    assert!(buildsets.iter().all(|b| b.scheduler == "stable"));
    assert_eq!(buildsets[0].change_ids, vec![second.id]);
    assert_eq!(buildsets[1].change_ids, vec![first.id]);

    let stable = env.manager.get("stable").unwrap();
    assert!(stable.pending_build_times().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pending_changes_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("buildgate.db");

    let env = start_env(&db_path, at(7, 0)).await;
    let first = env
        .hub
        .add_change(&change("linux-6.6.y", "net/core/dev.c"))
        .await
        .unwrap();
    let second = env
        .hub
        .add_change(&change("linux-6.6.y", "net/core/sock.c"))
        .await
        .unwrap();
    env.manager.stop(&env.hub).await;
    drop(env);

    tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
    {
        let store = SqliteSchedulerStore::new(&db_path).unwrap();
        assert!(store.get_buildsets(10).unwrap().is_empty());
    }

    // A fresh process at 08:30 picks the pending changes back up.
    let TestEnv {
        store,
        hub,
        manager,
    } = start_env(&db_path, at(8, 30)).await;

    let stable = manager.get("stable").unwrap();
    assert_eq!(stable.pending_build_times().await, vec![at(9, 0)]);

    tokio::time::sleep(Duration::from_secs(1801)).await;

    let buildsets = store.get_buildsets(10).unwrap();
    assert_eq!(buildsets.len(), 1);
    // collapse_requests keeps only the newest change.
    assert_eq!(buildsets[0].change_ids, vec![second.id]);
    assert!(store
        .get_change_classifications(stable.objectid())
        .unwrap()
        .keys()
        .all(|id| *id > second.id));
    assert!(store.get_change(first.id).unwrap().is_some());

    manager.stop(&hub).await;
}

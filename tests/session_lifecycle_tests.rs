use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use testsession::{
    ProcessEnvironment, RequestBarrier, RequestLifecycleHook, SessionCoordinator, SessionError,
    SessionState, SqliteServer, StateStore, TestSessionConfig,
};

fn params(value: Value) -> SessionState {
    SessionState::from_value(value).expect("session params")
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }
}

#[test]
fn driver_and_server_processes_share_one_record() {
    let temp = TempDir::new().expect("temp dir");
    let config = TestSessionConfig::new(temp.path());
    let driver = SessionCoordinator::new(config.clone()).expect("driver");
    let server = SessionCoordinator::new(config).expect("server");

    assert!(!server.is_running());
    let started = driver
        .start(params(json!({"mailer": "TestMailer", "datetime": "2020-01-01 08:30:00"})))
        .expect("start");
    let name = started.database().expect("database").to_string();

    assert!(server.is_running());
    let seen = server.get_state().expect("server state");
    assert_eq!(seen, started);

    server.apply_state(seen).expect("server applies record");
    assert_eq!(server.database().selected_database().as_deref(), Some(name.as_str()));

    let updated = server
        .update(params(json!({"stubfile": "mysite/tests/stub.sql"})))
        .expect("update from server");
    assert_eq!(updated.database(), Some(name.as_str()));
    assert_eq!(driver.get_state().expect("driver state").stubfile(), Some("mysite/tests/stub.sql"));

    driver.end().expect("end");
    assert!(!server.is_running());
    assert!(!server.database().exists(&name));
    assert!(server.get_state().expect("empty state").is_empty());

    server.end().expect("second end is a no-op");
}

#[test]
fn end_restores_database_selection_and_assets() {
    let temp = TempDir::new().expect("temp dir");
    let config = TestSessionConfig::new(temp.path()).default_database("app");
    write_tree(
        &config.assets_dir,
        &[
            ("Uploads/logo.png", "png-bytes"),
            ("Uploads/deep/nested/file.txt", "nested"),
            (".htaccess", "deny from all"),
        ],
    );

    let coordinator = SessionCoordinator::new(config.clone()).expect("coordinator");
    coordinator.database().server().create_database("app").expect("app db");
    coordinator.database().connect("app").expect("connect app");

    let state = coordinator.start(SessionState::new()).expect("start");
    let temp_db = state.database().expect("database").to_string();
    assert_ne!(temp_db, "app");
    assert!(!config.assets_dir.join("Uploads/logo.png").exists());
    assert!(config.assets_dir.join(".htaccess").exists());

    coordinator.end().expect("end");
    assert_eq!(coordinator.database().selected_database().as_deref(), Some("app"));
    assert!(!coordinator.database().exists(&temp_db));
    assert_eq!(
        fs::read_to_string(config.assets_dir.join("Uploads/deep/nested/file.txt")).expect("restored"),
        "nested"
    );
    assert_eq!(
        fs::read_to_string(config.assets_dir.join("Uploads/logo.png")).expect("restored"),
        "png-bytes"
    );
    assert!(!config.assets_backup_dir.exists());
}

fn table_count(coordinator: &SessionCoordinator, database: &str, table: &str) -> i64 {
    coordinator
        .database()
        .with_database(database, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(|e| SessionError::Connection(e.to_string()))
        })
        .expect("table count")
}

#[test]
fn ending_one_session_leaves_another_in_flight_request_alone() {
    let temp = TempDir::new().expect("temp dir");
    let config = TestSessionConfig::new(temp.path()).default_database("app");
    fs::write(
        temp.path().join("stub.sql"),
        "CREATE TABLE IF NOT EXISTS Stubbed (n INTEGER);\n",
    )
    .expect("stub");

    let coordinator = SessionCoordinator::new(config.clone()).expect("coordinator");
    coordinator.database().server().create_database("app").expect("app db");
    coordinator.database().connect("app").expect("connect app");

    let alpha = coordinator.with_id(Some("alpha")).expect("alpha");
    let beta = coordinator.with_id(Some("beta")).expect("beta");
    let alpha_db = alpha
        .start(SessionState::new())
        .expect("start alpha")
        .database()
        .expect("alpha database")
        .to_string();
    let beta_db = beta
        .start(params(json!({"stubfile": "stub.sql"})))
        .expect("start beta")
        .database()
        .expect("beta database")
        .to_string();

    let environment = Arc::new(ProcessEnvironment::new(config.environment));
    let hook = RequestLifecycleHook::new(coordinator.clone(), environment);
    let request = hook.enter(Some("beta")).expect("enter").expect("beta is running");

    alpha.end().expect("end alpha");
    assert_eq!(coordinator.database().selected_database().as_deref(), Some(beta_db.as_str()));

    // Host code of the in-flight request writes through the process connection.
    coordinator
        .database()
        .with_connection(|conn| {
            conn.execute_batch("CREATE TABLE Written (n INTEGER)")
                .map_err(|e| SessionError::Connection(e.to_string()))
        })
        .expect("request write");
    hook.finish(request).expect("finish");

    assert!(!coordinator.database().exists(&alpha_db));
    assert_eq!(table_count(&coordinator, &beta_db, "Written"), 1);
    assert_eq!(table_count(&coordinator, &beta_db, "Stubbed"), 1);
    assert_eq!(table_count(&coordinator, "app", "Written"), 0);
    assert_eq!(table_count(&coordinator, "app", "Stubbed"), 0);

    assert_eq!(beta.clear().expect("clear beta"), 2);
    beta.end().expect("end beta");
    assert_eq!(coordinator.database().selected_database().as_deref(), Some("app"));
}

#[test]
fn stale_record_is_replaced_on_start() {
    let temp = TempDir::new().expect("temp dir");
    let coordinator = SessionCoordinator::new(TestSessionConfig::new(temp.path())).expect("coordinator");

    let store = coordinator.store();
    store
        .write(&params(json!({"custom": "leftover"})))
        .expect("stale record");

    let state = coordinator.start(params(json!({"fresh": true}))).expect("start");
    assert!(state.get("custom").is_none());
    assert_eq!(state.get("fresh"), Some(&json!(true)));
}

#[test]
fn barrier_counts_requests_from_many_processes() {
    let temp = TempDir::new().expect("temp dir");
    let coordinator = SessionCoordinator::new(TestSessionConfig::new(temp.path())).expect("coordinator");
    let state = coordinator.start(SessionState::new()).expect("start");
    let name = state.database().expect("database").to_string();
    let data_dir = coordinator.config().data_dir.clone();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let data_dir = data_dir.clone();
            let name = name.clone();
            thread::spawn(move || {
                let barrier = RequestBarrier::new(
                    SqliteServer::new(&data_dir, Duration::from_secs(10)),
                    name,
                );
                for _ in 0..25 {
                    let _guard = barrier.enter().expect("enter");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let record = coordinator.barrier().expect("barrier").read().expect("record");
    assert_eq!(record.pending_requests, 0);
    assert!(record.last_response_timestamp > 0);
}

#[tokio::test]
async fn wait_returns_once_in_flight_request_finishes() {
    let temp = TempDir::new().expect("temp dir");
    let coordinator = SessionCoordinator::new(TestSessionConfig::new(temp.path())).expect("coordinator");
    coordinator.start(SessionState::new()).expect("start");

    let guard = coordinator.barrier().expect("barrier").enter().expect("enter");
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(400));
        drop(guard);
    });

    let idle = coordinator
        .wait_for_pending_requests(0, 5_000)
        .await
        .expect("wait");
    releaser.join().expect("releaser");
    assert!(idle);

    let _held = coordinator.barrier().expect("barrier").enter().expect("enter");
    let idle = coordinator
        .wait_for_pending_requests(0, 500)
        .await
        .expect("wait");
    assert!(!idle);
}

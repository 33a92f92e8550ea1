//! Registry and dispatch tests for [`SshConnectionManager`].

mod common;

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{new_connection, new_manager, FakeRunner, PORT_RANGE_END, PORT_RANGE_START};
use sshmux::error::Error;
use sshmux::resolver::StaticHostResolver;

fn plain_resolver() -> StaticHostResolver {
    StaticHostResolver::new(Vec::<(String, String)>::new())
}

#[tokio::test]
async fn get_creates_once_and_reuses() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());

    let first = manager.get("web01.example.com").await.unwrap();
    let second = manager.get("web01.example.com").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_connected().await);
    assert_eq!(runner.state.lock().master_spawns, 1);
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn aliases_share_one_connection() {
    let runner = FakeRunner::new();
    let resolver = StaticHostResolver::new([
        ("web01", "web01.example.com"),
        ("WEB01.EXAMPLE.COM", "web01.example.com"),
    ]);
    let manager = new_manager(&runner, resolver);

    let by_alias = manager.get("web01").await.unwrap();
    let by_name = manager.get("web01.example.com").await.unwrap();

    assert!(Arc::ptr_eq(&by_alias, &by_name));
    assert_eq!(by_alias.host(), "web01.example.com");
    assert_eq!(runner.state.lock().master_spawns, 1);
    assert_eq!(manager.hosts(), vec!["web01.example.com".to_string()]);
}

#[tokio::test]
async fn add_connection_does_not_overwrite() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());

    let first = Arc::new(new_connection("web01.example.com", &runner));
    let second = Arc::new(new_connection("web01.example.com", &runner));
    manager.add_connection(first.clone());
    manager.add_connection(second);

    assert_eq!(manager.len(), 1);
    let fetched = manager.get("web01.example.com").await.unwrap();
    assert!(Arc::ptr_eq(&fetched, &first));
}

#[tokio::test]
async fn remove_connection_requires_disconnect() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());
    let conn = manager.get("web01.example.com").await.unwrap();

    assert!(matches!(
        manager.remove_connection(&conn).await,
        Err(Error::RegistryState(_))
    ));
    assert_eq!(manager.len(), 1);

    conn.disconnect().await.unwrap();
    manager.remove_connection(&conn).await.unwrap();
    assert!(manager.is_empty());
}

#[tokio::test]
async fn remove_by_name_is_unconditional() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());
    let conn = manager.get("web01.example.com").await.unwrap();

    manager.remove_by_name("web01.example.com");
    assert!(manager.is_empty());
    // The connection object itself is untouched.
    assert!(conn.is_connected().await);
}

#[tokio::test]
async fn close_disconnects_and_removes() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());
    let conn = manager.get("web01.example.com").await.unwrap();

    manager.close("web01.example.com").await.unwrap();

    assert!(manager.is_empty());
    assert!(!conn.is_connected().await);
    assert!(runner.state.lock().masters.is_empty());

    assert!(matches!(
        manager.close("web01.example.com").await,
        Err(Error::RegistryState(_))
    ));
}

#[tokio::test]
async fn forward_and_transfer_dispatch() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());

    let port = manager
        .request_forward("web01.example.com", "db.local", 5432)
        .await
        .unwrap();
    assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
    assert!(runner
        .state
        .lock()
        .forwards
        .contains(&format!("L{}:db.local:5432", port)));

    manager
        .remove_forward("web01.example.com", "db.local", 5432)
        .await
        .unwrap();
    assert!(runner.state.lock().forwards.is_empty());

    manager
        .put_file("web01.example.com", Path::new("/tmp/app.tar"), "/opt/app.tar")
        .await
        .unwrap();
    manager
        .get_file("web01.example.com", "/etc/os-release", Path::new("/tmp/os-release"))
        .await
        .unwrap();

    let state = runner.state.lock();
    assert!(state.runs.iter().any(|a| a.program == "rsync"));
    assert!(state.runs.iter().any(|a| a.program == "scp"));
}

#[tokio::test]
async fn close_all_empties_registry_in_any_state() {
    let runner = FakeRunner::new();
    let manager = new_manager(&runner, plain_resolver());

    let healthy = manager.get("web01.example.com").await.unwrap();
    let stale = manager.get("web02.example.com").await.unwrap();
    let idle = Arc::new(new_connection("web03.example.com", &runner));
    manager.add_connection(idle.clone());
    assert_eq!(manager.len(), 3);

    // web02's keepalive crashed underneath it.
    let flag = runner.state.lock().keepalives[1].clone();
    flag.store(false, std::sync::atomic::Ordering::SeqCst);

    manager.close_all().await.unwrap();

    assert!(manager.is_empty());
    assert!(!healthy.is_connected().await);
    assert!(!stale.is_connected().await);
    assert!(!idle.is_connected().await);
    assert!(runner.state.lock().masters.is_empty());
}

#[tokio::test]
async fn multiplexed_session_end_to_end() {
    let runner = FakeRunner::new();
    let resolver = StaticHostResolver::new([("host-a", "host-a.internal")]);
    let manager = new_manager(&runner, resolver);

    let conn = manager.get("host-a").await.unwrap();
    let again = manager.get("host-a.internal").await.unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
    assert_eq!(runner.state.lock().master_spawns, 1);

    assert_eq!(conn.run_command("systemctl is-active postgresql").await.unwrap(), 0);

    let port = manager
        .request_forward("host-a", "db.local", 5432)
        .await
        .unwrap();
    assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
    assert!(runner
        .state
        .lock()
        .forwards
        .contains(&format!("L{}:db.local:5432", port)));

    manager.close("host-a").await.unwrap();
    assert!(manager.is_empty());
    let state = runner.state.lock();
    assert!(state.masters.is_empty());
    assert!(state.forwards.is_empty());
    assert!(state
        .runs
        .iter()
        .any(|a| a.args.windows(2).any(|p| p[0] == "-O" && p[1] == "exit")));
}

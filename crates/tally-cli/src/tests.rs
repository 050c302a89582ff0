use std::path::Path;

use pretty_assertions::assert_eq;
use serde_json::json;
use tally_core::remote::RestRemoteConfig;
use tally_core::{EngineConfig, LocalStore, Record};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::commands::add::run_add;
use crate::commands::clear::run_clear;
use crate::commands::conflicts::{format_sync_conflict_lines, run_conflicts};
use crate::commands::common::{
    format_dead_letter_lines, format_record_line, format_timestamp, parse_mutation_id,
    parse_patch, parse_record, resolve_remote, Context,
};
use crate::commands::dead_letters::{run_discard, run_requeue};
use crate::commands::edit::run_edit;
use crate::commands::list::list_records;
use crate::commands::remove::run_remove;
use crate::commands::status::{format_status_lines, load_status};
use crate::commands::sync::run_sync;
use crate::error::CliError;

fn test_context(dir: &Path) -> Context {
    Context {
        db_path: dir.join("tally.db"),
        config: EngineConfig::new(vec!["products".to_string(), "sales".to_string()]),
        remote: None,
    }
}

#[test]
fn resolve_remote_prefers_flag_over_env() {
    let remote = resolve_remote(
        Some(" https://flag.example.com ".to_string()),
        Some("https://env.example.com".to_string()),
        Some("token".to_string()),
    )
    .unwrap()
    .unwrap();

    assert_eq!(remote.base_url, "https://flag.example.com");
    assert_eq!(remote.auth.as_deref(), Some("token"));
}

#[test]
fn resolve_remote_falls_back_to_env_and_validates_scheme() {
    let remote = resolve_remote(None, Some("http://localhost:9000".to_string()), None)
        .unwrap()
        .unwrap();
    assert_eq!(remote.base_url, "http://localhost:9000");
    assert_eq!(remote.auth, None);

    assert!(resolve_remote(None, None, None).unwrap().is_none());
    assert!(resolve_remote(Some("   ".to_string()), None, None).unwrap().is_none());
    assert!(matches!(
        resolve_remote(Some("example.com".to_string()), None, None),
        Err(CliError::Config(_))
    ));
}

#[test]
fn parse_patch_requires_object() {
    let patch = parse_patch(r#"{"qty": 4}"#).unwrap();
    assert_eq!(patch.get("qty"), Some(&json!(4)));

    assert!(matches!(parse_patch("[1, 2]"), Err(CliError::InvalidPatch(_))));
    assert!(matches!(parse_patch("{"), Err(CliError::Serialization(_))));
}

#[test]
fn parse_record_and_mutation_id_validate_input() {
    assert_eq!(parse_record(r#" {"id": "p1"} "#).unwrap().id(), "p1");
    assert!(parse_record(r#"{"name": "no id"}"#).is_err());
    assert!(matches!(
        parse_mutation_id("not-a-uuid"),
        Err(CliError::InvalidMutationId(_))
    ));
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
    assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
}

#[test]
fn format_record_line_puts_id_first() {
    let record = Record::from_value(json!({"id": "p1", "name": "Widget", "qty": 2})).unwrap();
    assert_eq!(format_record_line(&record), r#"p1  {"name":"Widget","qty":2}"#);
}

#[tokio::test]
async fn add_edit_remove_round_through_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context(dir.path());

    run_add("products", r#"{"id": "p1", "name": "Widget"}"#, &context)
        .await
        .unwrap();
    run_add("products", r#"{"id": "p2", "name": "Bolt"}"#, &context)
        .await
        .unwrap();
    run_edit("products", "p1", r#"{"name": "Gadget"}"#, &context)
        .await
        .unwrap();

    let records = list_records("products", None, &context).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("name"), Some(&json!("Gadget")));
    assert_eq!(list_records("products", Some(1), &context).await.unwrap().len(), 1);

    run_remove("products", "p2", &context).await.unwrap();
    let records = list_records("products", None, &context).await.unwrap();
    assert_eq!(records.len(), 1);

    let status = load_status(&context).await.unwrap();
    assert_eq!(status.status.pending, 4);
    assert!(!status.remote_configured);
    let lines = format_status_lines(&status);
    assert_eq!(lines[1], "4 items pending sync");
    assert!(lines.contains(&"Remote: not configured".to_string()));
}

#[tokio::test]
async fn commands_reject_unknown_collections_and_missing_records() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context(dir.path());

    let error = run_add("reports", r#"{"id": "r1"}"#, &context)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        CliError::Core(tally_core::Error::UnknownCollection(_))
    ));

    let error = run_edit("products", "missing", "{}", &context)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::Core(tally_core::Error::NotFound { .. })));
}

#[tokio::test]
async fn clear_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context(dir.path());
    run_add("products", r#"{"id": "p1"}"#, &context)
        .await
        .unwrap();

    assert!(matches!(
        run_clear(false, &context).await,
        Err(CliError::ConfirmationRequired)
    ));
    assert_eq!(list_records("products", None, &context).await.unwrap().len(), 1);

    run_clear(true, &context).await.unwrap();
    assert!(list_records("products", None, &context).await.unwrap().is_empty());
    assert_eq!(load_status(&context).await.unwrap().status.pending, 0);
}

#[tokio::test]
async fn sync_requires_remote_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context(dir.path());

    let error = run_sync(false, &context).await.unwrap_err();
    assert!(matches!(error, CliError::RemoteNotConfigured));
}

#[tokio::test]
async fn sync_pushes_queue_and_pulls_remote_records() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/products/p1.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/products.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "p1": {"id": "p1", "updatedAt": 1},
            "p9": {"id": "p9", "name": "From remote", "updatedAt": 2_000}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sales.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut context = test_context(dir.path());
    context.remote = Some(RestRemoteConfig::new(server.uri()));

    run_add("products", r#"{"id": "p1", "name": "Local"}"#, &context)
        .await
        .unwrap();
    run_sync(false, &context).await.unwrap();

    let records = list_records("products", None, &context).await.unwrap();
    let ids: Vec<_> = records.iter().map(Record::id).collect();
    assert_eq!(ids, vec!["p1", "p9"]);
    // The older remote copy of p1 loses to the local one
    assert_eq!(records[0].get("name"), Some(&json!("Local")));

    let status = load_status(&context).await.unwrap();
    assert_eq!(status.status.pending, 0);
    assert_eq!(status.checkpoints.len(), 1);
    assert_eq!(status.checkpoints[0].last_synced_at, 2_000);

    let store = LocalStore::open_path(&context.db_path, &context.config.collections).unwrap();
    let conflicts = store.list_conflicts(10).await.unwrap();
    drop(store);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].record_id, "p1");
    assert_eq!(conflicts[0].incoming_updated_at, 1);
    let lines = format_sync_conflict_lines(&conflicts);
    assert!(lines[0].contains("products/p1"));
    assert!(lines[0].contains("incoming=1"));
    run_conflicts(10, true, &context).await.unwrap();
}

#[tokio::test]
async fn dead_letters_can_be_requeued_and_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let context = test_context(dir.path());
    let store = LocalStore::open_path(&context.db_path, &context.config.collections).unwrap();

    for id in ["p1", "p2"] {
        let record = Record::from_value(json!({"id": id})).unwrap();
        let committed = store
            .commit(
                "products",
                tally_core::models::Write::Put(record),
                tally_core::Origin::Local,
            )
            .await
            .unwrap();
        store
            .quarantine(&committed.mutation.unwrap().id, "permission denied")
            .await
            .unwrap();
    }
    let dead = store.dead_letters().await.unwrap();
    drop(store);

    let lines = format_dead_letter_lines(&dead);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("add products/p1"));
    assert!(lines[0].ends_with("permission denied"));

    run_requeue(&dead[0].mutation.id.to_string(), &context)
        .await
        .unwrap();
    run_discard(&dead[1].mutation.id.to_string(), &context)
        .await
        .unwrap();
    assert!(matches!(
        run_discard(&dead[1].mutation.id.to_string(), &context).await,
        Err(CliError::DeadLetterNotFound(_))
    ));

    let status = load_status(&context).await.unwrap();
    assert_eq!(status.status.pending, 1);
    assert_eq!(status.status.dead_letters, 0);
}

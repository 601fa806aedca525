//! Object versioning integration tests
//!
//! Require `git` on PATH.

use cme_core::{
    Author, ChangeRecord, CmeError, Engine, EngineConfig, ObjectContent, ObjectType, UpstreamNode,
};
use tempfile::TempDir;

fn engine(tmp: &TempDir) -> Engine {
    let config = EngineConfig::new(tmp.path().join("repos")).with_bin_path("git");
    Engine::new(config).unwrap()
}

fn bird() -> Author {
    Author::new("Larry Bird", "tootall@celtics.net")
}

fn device(name: &str, file: &str, data: &str) -> ChangeRecord {
    let content = ObjectContent::new(name).with_file(file, data.as_bytes().to_vec());
    ChangeRecord::new(ObjectType::Device, content, bird())
}

#[tokio::test]
async fn test_version_and_get_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);

    let id = engine
        .version_object(&device("sw1", "config", "hostname sw1\n"), "Add sw1", None)
        .await
        .unwrap();
    assert_eq!(id.len(), 40);

    let record = engine.get_object(ObjectType::Device, "sw1").await.unwrap();
    assert_eq!(record.content.object, "sw1");
    assert_eq!(record.content.files["config"], b"hostname sw1\n");
    assert_eq!(record.commit_id, id);
    assert_eq!(record.author.name, "Larry Bird");
    assert_eq!(record.author.email, "tootall@celtics.net");

    let log = record.log.unwrap();
    assert_eq!(log.message, "Add sw1");
    assert_eq!(log.committer, "Change Management Engine");
    assert_eq!(log.committer_email, "ignore@ignore");
}

#[tokio::test]
async fn test_unchanged_content_is_noop() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let record = device("sw1", "config", "a");

    let first = engine.version_object(&record, "", None).await.unwrap();
    assert!(!first.is_empty());
    let second = engine.version_object(&record, "", None).await.unwrap();
    assert_eq!(second, "");

    let log = engine.log(ObjectType::Device, "sw1", 0).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, cme_core::DEFAULT_MESSAGE);
    assert_eq!(engine.latest_commit_id(ObjectType::Device).await.unwrap(), first);
}

#[tokio::test]
async fn test_history_and_diff() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);

    let a = engine
        .version_object(&device("sw1", "config", "a\n"), "first", None)
        .await
        .unwrap();
    let b = engine
        .version_object(&device("sw1", "config", "b\n"), "second", None)
        .await
        .unwrap();

    let log = engine.log(ObjectType::Device, "sw1", 0).await.unwrap();
    let ids: Vec<&str> = log.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![b.as_str(), a.as_str()]);

    let limited = engine.log(ObjectType::Device, "sw1", 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].message, "second");

    // Whole-repository history includes the initial commit.
    let all = engine.log(ObjectType::Device, "", 0).await.unwrap();
    assert_eq!(all.len(), 3);

    let diff = engine
        .diff(ObjectType::Device, "sw1", &[a.as_str(), b.as_str()])
        .await
        .unwrap();
    assert!(diff.contains("-a"));
    assert!(diff.contains("+b"));

    let err = engine
        .diff(ObjectType::Device, "sw1", &["a", "b", "c"])
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::Generic(_)));
}

#[tokio::test]
async fn test_diff_revisions_are_not_options() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let a = engine
        .version_object(&device("sw1", "config", "a\n"), "", None)
        .await
        .unwrap();

    let target = tmp.path().join("written-by-diff");
    let option = format!("--output={}", target.display());
    for revs in [vec![option.as_str()], vec![a.as_str(), option.as_str()], vec!["-p"]] {
        let err = engine
            .diff(ObjectType::Device, "sw1", &revs)
            .await
            .unwrap_err();
        assert!(matches!(err, CmeError::InvalidName(_)), "{:?}", revs);
    }
    assert!(!target.exists());

    let err = engine
        .diff(ObjectType::Device, "", &["no-such-revision"])
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::InvalidName(_)));
    assert!(engine.diff(ObjectType::Device, "", &["HEAD"]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_branch_names_are_refs_not_options() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .version_object(&device("sw1", "config", "a"), "", None)
        .await
        .unwrap();
    let before = engine.log(ObjectType::Device, "", 0).await.unwrap().len();

    for bad in ["--orphan=sneaky", "-b", "a..b", "x y", "HEAD@{1}"] {
        let err = engine
            .version_object(&device("sw1", "config", "b"), "", Some(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, CmeError::InvalidName(_)), "{}", bad);
    }

    let lock = engine.repos().lock(ObjectType::Device).await;
    assert!(engine.repos().branches(&lock).await.unwrap().is_empty());
    assert!(!engine.repos().is_dirty(&lock).await.unwrap());
    drop(lock);
    assert_eq!(engine.log(ObjectType::Device, "", 0).await.unwrap().len(), before);
    let record = engine.get_object(ObjectType::Device, "sw1").await.unwrap();
    assert_eq!(record.content.files["config"], b"a");
}

#[tokio::test]
async fn test_lost_master_after_branch_commit() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .version_object(&device("sw1", "config", "a"), "", None)
        .await
        .unwrap();
    {
        let lock = engine.repos().lock(ObjectType::Device).await;
        engine.repos().create_branch(&lock, "side").await.unwrap();
        engine.repos().checkout(&lock, "side").await.unwrap();
        engine
            .repos()
            .git(&lock, &["branch", "-D", "master"])
            .await
            .unwrap();
    }

    let err = engine
        .version_object(&device("sw1", "config", "b"), "", Some("side"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::Command { .. }));

    let lock = engine.repos().lock(ObjectType::Device).await;
    assert!(!engine.repos().is_dirty(&lock).await.unwrap());
    let subject = engine
        .repos()
        .git(&lock, &["log", "-1", "--format=%s", "side"])
        .await
        .unwrap();
    assert_eq!(subject.trim(), cme_core::DEFAULT_MESSAGE);
}

#[tokio::test]
async fn test_list_includes_top_level_files() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.load_ontology().await.unwrap();
    assert_eq!(
        engine.list_objects(ObjectType::Ontology).await.unwrap(),
        vec!["ontology"]
    );
}

#[tokio::test]
async fn test_list_remove_rename() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    for name in ["sw2", "sw1", "rtr9"] {
        engine
            .version_object(&device(name, "config", name), "", None)
            .await
            .unwrap();
    }
    assert_eq!(
        engine.list_objects(ObjectType::Device).await.unwrap(),
        vec!["rtr9", "sw1", "sw2"]
    );

    engine
        .remove_object(ObjectType::Device, "sw2", &bird())
        .await
        .unwrap();
    engine
        .rename_object(ObjectType::Device, "rtr9", "rtr1", &bird())
        .await
        .unwrap();
    assert_eq!(
        engine.list_objects(ObjectType::Device).await.unwrap(),
        vec!["rtr1", "sw1"]
    );

    let moved = engine.get_object(ObjectType::Device, "rtr1").await.unwrap();
    assert_eq!(moved.content.files["config"], b"rtr9");
    let log = engine.log(ObjectType::Device, "", 1).await.unwrap();
    assert_eq!(log[0].message, "Moving rtr9 to rtr1 in the repository");

    assert!(matches!(
        engine.get_object(ObjectType::Device, "sw2").await,
        Err(CmeError::ObjectNotFound(_))
    ));
}

#[tokio::test]
async fn test_raw_area_separate_from_data() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let raw = ChangeRecord::new(
        ObjectType::Report,
        ObjectContent::new("weekly").with_file("out.bin", vec![0u8, 159, 146, 150]),
        bird(),
    );
    engine.version_raw(&raw, "raw results", None).await.unwrap();

    let back = engine
        .get_raw_object(ObjectType::Report, "weekly")
        .await
        .unwrap();
    assert_eq!(back.content.files["out.bin"], vec![0u8, 159, 146, 150]);
    assert!(matches!(
        engine.get_object(ObjectType::Report, "weekly").await,
        Err(CmeError::ObjectNotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_repository() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    assert!(matches!(
        engine.list_objects(ObjectType::Policy).await,
        Err(CmeError::NoRepo(ObjectType::Policy))
    ));
    assert!(matches!(
        engine.get_object(ObjectType::Policy, "p1").await,
        Err(CmeError::NoRepo(_))
    ));
    assert!(matches!(
        engine.log(ObjectType::Policy, "", 0).await,
        Err(CmeError::NoRepo(_))
    ));
}

#[tokio::test]
async fn test_invalid_names_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    for bad in ["", "../escape", ".git", "README"] {
        let err = engine
            .version_object(&device(bad, "config", "x"), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CmeError::InvalidName(_)), "{}", bad);
    }
    let err = engine
        .version_object(&device("sw1", "../../etc", "x"), "", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::InvalidName(_)));
}

#[tokio::test]
async fn test_failed_write_leaves_clean_master() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .version_object(&device("sw1", "config", "a"), "", None)
        .await
        .unwrap();

    let err = engine
        .version_object(&device("sw1", "config", "b"), "", Some("no-such-branch"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::Command { .. }));

    let record = engine.get_object(ObjectType::Device, "sw1").await.unwrap();
    assert_eq!(record.content.files["config"], b"a");
    assert!(!engine
        .repos()
        .is_dirty(&engine.repos().lock(ObjectType::Device).await)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_pull_unreachable_upstream() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let upstream = UpstreamNode::new("127.0.0.1:1");
    let err = engine.pull(ObjectType::Device, &upstream).await.unwrap_err();
    match err {
        CmeError::Communication { stderr, .. } => assert!(!stderr.is_empty()),
        other => panic!("unexpected error: {:?}", other),
    }
    let err = engine
        .push(ObjectType::Device, &upstream, Some("node1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CmeError::Communication { .. }));
}

#[tokio::test]
async fn test_closed_engine() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.close();
    assert!(matches!(
        engine.version_object(&device("sw1", "c", "x"), "", None).await,
        Err(CmeError::NotInitialized)
    ));
    assert!(matches!(
        engine.list_objects(ObjectType::Device).await,
        Err(CmeError::NotInitialized)
    ));
}

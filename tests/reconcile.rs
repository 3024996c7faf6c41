mod common;

use common::{read, remove, write, Pair};
use syncmd::index::ConflictReason;
use syncmd::sync::DeltaPlanner;

#[tokio::test]
async fn test_two_replicas_converge_and_stay_converged() {
    let pair = Pair::new().await;
    write(&pair.alpha, "notes/monday.md", b"# Monday\n\n- groceries\n").await;
    write(&pair.alpha, "img/photo.png", &[0x89, b'P', b'N', b'G', 0, 1, 2, 3].repeat(400)).await;
    write(&pair.beta, "inbox.md", b"call the plumber\n").await;
    write(&pair.beta, "notes/tuesday.md", b"# Tuesday\n").await;

    let report = pair.round().await;
    assert_eq!(report.peer_device, "beta");
    assert_eq!(report.pushed, 2);
    assert_eq!(report.fetched, 2);
    assert!(report.is_clean());
    pair.assert_converged().await;

    // Nothing left to do
    let plan = DeltaPlanner::plan(
        &pair.alpha.build_manifest().unwrap(),
        &pair.beta.build_manifest().unwrap(),
    );
    assert!(plan.is_empty());
    let again = pair.round().await;
    assert_eq!(again.applied(), 0);
    pair.assert_converged().await;
}

#[tokio::test]
async fn test_fast_forward_edit_and_delete_propagate() {
    let pair = Pair::new().await;
    write(&pair.alpha, "draft.md", b"v1\n").await;
    write(&pair.alpha, "old.md", b"obsolete\n").await;
    pair.round().await;

    write(&pair.beta, "draft.md", b"v1\nv2\n").await;
    remove(&pair.alpha, "old.md").await;

    let report = pair.round().await;
    assert_eq!(report.fetched, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.conflicts + report.merged, 0);
    assert_eq!(read(&pair.alpha, "draft.md").await, b"v1\nv2\n");
    assert!(!pair.beta.abs_path("old.md").exists());
    pair.assert_converged().await;
}

#[tokio::test]
async fn test_true_conflict_splits_into_copy() {
    let pair = Pair::new().await;
    let ours = b"alpha's cover art".to_vec();
    let theirs = b"beta's cover art".to_vec();
    write(&pair.alpha, "cover.png", &ours).await;
    write(&pair.beta, "cover.png", &theirs).await;

    let report = pair.round().await;
    assert_eq!(report.conflicts, 1);

    // Equal versions: the higher device id keeps the canonical path
    assert_eq!(read(&pair.alpha, "cover.png").await, theirs);
    assert_eq!(read(&pair.beta, "cover.png").await, theirs);

    for replica in [&pair.alpha, &pair.beta] {
        let conflicts = replica.store().list_conflicts(false).unwrap();
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0].conflict;
        assert_eq!(conflict.reason, ConflictReason::ConcurrentEdit);
        assert_eq!(conflict.loser.device_id, "alpha");
        assert!(conflict.copy_path.starts_with("cover.conflict-alpha-"));
        assert!(conflict.copy_path.ends_with(".png"));
        assert_eq!(read(replica, &conflict.copy_path).await, ours);
    }
    pair.assert_converged().await;

    assert_eq!(pair.round().await.applied(), 0);
}

#[tokio::test]
async fn test_markdown_edit_wins_over_delete() {
    let pair = Pair::new().await;
    write(&pair.alpha, "plan.md", b"step one\n").await;
    pair.round().await;

    remove(&pair.alpha, "plan.md").await;
    write(&pair.beta, "plan.md", b"step one\nstep two\n").await;

    let report = pair.round().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(read(&pair.alpha, "plan.md").await, b"step one\nstep two\n");
    assert!(!pair.alpha.store().get("plan.md").unwrap().unwrap().deleted);
    pair.assert_converged().await;
}

#[tokio::test]
async fn test_binary_delete_vs_edit_keeps_edit_as_copy() {
    let pair = Pair::new().await;
    write(&pair.alpha, "scan.jpg", b"original scan").await;
    pair.round().await;

    // beta's tombstone wins the tie-break at equal versions
    write(&pair.alpha, "scan.jpg", b"retouched scan").await;
    remove(&pair.beta, "scan.jpg").await;

    let report = pair.round().await;
    assert_eq!(report.conflicts, 1);
    assert!(!pair.alpha.abs_path("scan.jpg").exists());

    let conflicts = pair.alpha.store().list_conflicts(false).unwrap();
    assert_eq!(conflicts[0].conflict.reason, ConflictReason::EditVsDelete);
    let copy = &conflicts[0].conflict.copy_path;
    assert_eq!(read(&pair.alpha, copy).await, b"retouched scan");
    assert_eq!(read(&pair.beta, copy).await, b"retouched scan");
    pair.assert_converged().await;
}

#[tokio::test]
async fn test_concurrent_non_overlapping_edits_merge() {
    let pair = Pair::new().await;
    write(&pair.alpha, "list.md", b"one\ntwo\nthree\n").await;
    pair.round().await;

    write(&pair.alpha, "list.md", b"zero\none\ntwo\nthree\n").await;
    write(&pair.beta, "list.md", b"one\ntwo\nthree\nfour\n").await;

    let report = pair.round().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.conflicts, 0);

    let merged = b"zero\none\ntwo\nthree\nfour\n";
    assert_eq!(read(&pair.alpha, "list.md").await, merged);
    assert_eq!(read(&pair.beta, "list.md").await, merged);
    assert_eq!(String::from_utf8(merged.to_vec()).unwrap().lines().count(), 5);

    let record = pair.alpha.store().get("list.md").unwrap().unwrap();
    assert_eq!(record.logical_version, 3);
    assert!(pair.alpha.store().list_conflicts(true).unwrap().is_empty());
    pair.assert_converged().await;

    assert_eq!(pair.round().await.applied(), 0);
}

#[tokio::test]
async fn test_frontmatter_tags_union_with_body_edits() {
    let pair = Pair::new().await;
    let base = "---\ntitle: Trip\ntags:\n- travel\n---\nDay one.\nDay two.\nDay three.\n";
    write(&pair.alpha, "trip.md", base.as_bytes()).await;
    pair.round().await;

    write(
        &pair.alpha,
        "trip.md",
        b"---\ntitle: Trip\ntags:\n- travel\n- japan\n---\nDay one, Tokyo.\nDay two.\nDay three.\n",
    )
    .await;
    write(
        &pair.beta,
        "trip.md",
        b"---\ntitle: Trip\ntags:\n- travel\n- food\n---\nDay one.\nDay two.\nDay three, Kyoto.\n",
    )
    .await;

    let report = pair.round().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.conflicts, 0);

    let merged = String::from_utf8(read(&pair.beta, "trip.md").await).unwrap();
    for tag in ["- travel", "- japan", "- food"] {
        assert!(merged.contains(tag), "missing {} in {}", tag, merged);
    }
    assert!(merged.contains("title: Trip"));
    assert!(merged.ends_with("---\nDay one, Tokyo.\nDay two.\nDay three, Kyoto.\n"));
    pair.assert_converged().await;
}

#[tokio::test]
async fn test_overlapping_text_edits_split() {
    let pair = Pair::new().await;
    write(&pair.alpha, "poem.md", b"roses are red\n").await;
    pair.round().await;

    write(&pair.alpha, "poem.md", b"roses are crimson\n").await;
    write(&pair.beta, "poem.md", b"roses are scarlet\n").await;

    let report = pair.round().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(read(&pair.alpha, "poem.md").await, b"roses are scarlet\n");

    let conflicts = pair.beta.store().list_conflicts(false).unwrap();
    assert_eq!(conflicts[0].conflict.reason, ConflictReason::OverlappingEdit);
    assert_eq!(read(&pair.beta, &conflicts[0].conflict.copy_path).await, b"roses are crimson\n");
    pair.assert_converged().await;
}

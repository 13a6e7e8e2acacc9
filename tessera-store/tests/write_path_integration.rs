//! Write path integration tests against the in-memory backend.
//!
//! Verifies:
//! - Same-id documents in one batch apply strictly in order
//! - The live document count equals the sum of reported deltas
//! - New edits conflict where replicated history is accepted
//! - One failing document never affects the rest of its batch
//! - Stemming bounds history depth across batches
//! - Distinct ids progress concurrently
//! - Attachment bodies are stored once per digest
//! - Unreferenced attachment files are reclaimed after each batch
//! - Keys-only `_all_docs` lookups

use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tessera_core::{attachment_file_name, md5_digest, DocError, RevId};
use tessera_store::{
    AllDocsOptions, AttachmentConfig, AttachmentStore, BatchOptions, BulkWriter, DocBackend,
    MemoryBackend,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const HELLO_FILE: &str = "5d41402abc4b2a76b9719d911017c592.plain";

async fn writer() -> (BulkWriter<MemoryBackend>, TempDir) {
    let dir = tempdir().unwrap();
    let attachments = AttachmentStore::open(AttachmentConfig::for_database(dir.path(), "test"))
        .await
        .unwrap();
    (BulkWriter::new(MemoryBackend::new(), attachments), dir)
}

/// Apply a batch and return the revisions, panicking on any error.
async fn apply_ok(writer: &BulkWriter<MemoryBackend>, docs: Vec<Value>, opts: &BatchOptions) -> Vec<String> {
    writer
        .bulk_docs(docs, opts)
        .await
        .results
        .into_iter()
        .map(|r| r.unwrap().rev)
        .collect()
}

// ─── Same-Id Ordering ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_id_docs_apply_in_order() {
    let (writer, _dir) = writer().await;
    let docs = vec![
        json!({ "_id": "a", "_rev": "1-x" }),
        json!({ "_id": "b", "_rev": "1-z" }),
        json!({ "_id": "a", "_revisions": { "start": 2, "ids": ["y", "x"] } }),
        json!({ "_id": "a", "_revisions": { "start": 3, "ids": ["w", "y", "x"] } }),
    ];
    let revs = apply_ok(&writer, docs, &BatchOptions::replication()).await;
    assert_eq!(revs, vec!["1-x", "1-z", "2-y", "3-w"]);

    let order: Vec<RevId> = writer
        .backend()
        .writes()
        .await
        .into_iter()
        .filter(|(id, _)| id == "a")
        .map(|(_, rev)| rev)
        .collect();
    assert_eq!(order, vec![RevId::new(1, "x"), RevId::new(2, "y"), RevId::new(3, "w")]);

    let meta = writer.backend().get_metadata("a").await.unwrap().unwrap();
    assert_eq!(meta.rev, RevId::new(3, "w"));
    assert_eq!(meta.rev_tree.leaves().len(), 1);
}

#[tokio::test]
async fn test_distinct_ids_interleave() {
    let (writer, _dir) = writer().await;
    let docs = vec![
        json!({ "_id": "a", "_rev": "1-x" }),
        json!({ "_id": "a", "_revisions": { "start": 2, "ids": ["y", "x"] } }),
        json!({ "_id": "b", "_rev": "1-z" }),
        json!({ "_id": "b", "_revisions": { "start": 2, "ids": ["w", "z"] } }),
    ];
    let revs = apply_ok(&writer, docs, &BatchOptions::replication()).await;
    assert_eq!(revs, vec!["1-x", "2-y", "1-z", "2-w"]);

    let writes = writer.backend().writes().await;
    let positions = |id: &str| -> Vec<usize> {
        writes
            .iter()
            .enumerate()
            .filter(|(_, (w, _))| w == id)
            .map(|(i, _)| i)
            .collect()
    };
    let (a, b) = (positions("a"), positions("b"));
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);

    // each id keeps its own order
    assert_eq!(writes[a[0]].1, RevId::new(1, "x"));
    assert_eq!(writes[a[1]].1, RevId::new(2, "y"));
    assert_eq!(writes[b[0]].1, RevId::new(1, "z"));
    assert_eq!(writes[b[1]].1, RevId::new(2, "w"));

    // but b does not wait for a to finish
    assert!(b[0] < a[1]);
}

#[tokio::test]
async fn test_second_blind_write_of_same_id_conflicts() {
    let (writer, _dir) = writer().await;
    let outcome = writer
        .bulk_docs(
            vec![json!({ "_id": "a", "v": 1 }), json!({ "_id": "a", "v": 2 })],
            &BatchOptions::default(),
        )
        .await;
    assert!(outcome.results[0].is_ok());
    assert_eq!(outcome.results[1], Err(DocError::Conflict));
    assert_eq!(outcome.doc_count_delta, 1);
}

// ─── Document Count ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_doc_count_follows_deltas() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions::default();
    let mut total = 0;

    let outcome = writer
        .bulk_docs(
            vec![json!({ "_id": "a" }), json!({ "_id": "b" }), json!({ "_id": "c" })],
            &opts,
        )
        .await;
    total += outcome.doc_count_delta;
    let rev_b = outcome.results[1].as_ref().unwrap().rev.clone();
    assert_eq!(outcome.doc_count_delta, 3);

    let outcome = writer
        .bulk_docs(vec![json!({ "_id": "b", "_rev": rev_b, "_deleted": true })], &opts)
        .await;
    total += outcome.doc_count_delta;
    assert_eq!(outcome.doc_count_delta, -1);

    // recreate b, insert an already-deleted d
    let outcome = writer
        .bulk_docs(
            vec![json!({ "_id": "b", "v": 2 }), json!({ "_id": "d", "_deleted": true })],
            &opts,
        )
        .await;
    total += outcome.doc_count_delta;
    assert!(outcome.results.iter().all(Result::is_ok));
    assert_eq!(outcome.doc_count_delta, 1);

    assert_eq!(total, 3);
    assert_eq!(writer.backend().doc_count().await, total);
}

#[tokio::test]
async fn test_delete_of_unknown_doc_on_delete_request_is_not_found() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions {
        was_delete: true,
        ..BatchOptions::default()
    };
    let outcome = writer
        .bulk_docs(vec![json!({ "_id": "ghost", "_deleted": true })], &opts)
        .await;
    assert_eq!(outcome.results[0].as_ref().unwrap_err().status(), 404);
    assert_eq!(writer.backend().update_seq().await, 0);
}

// ─── Conflicts ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_edit_conflicts_replicated_branch_accepted() {
    let (writer, _dir) = writer().await;
    let revs = apply_ok(&writer, vec![json!({ "_id": "a", "v": 0 })], &BatchOptions::default()).await;
    let r1 = revs[0].clone();

    let outcome = writer
        .bulk_docs(
            vec![
                json!({ "_id": "a", "_rev": r1, "v": 1 }),
                json!({ "_id": "a", "_rev": r1, "v": 2 }),
            ],
            &BatchOptions::default(),
        )
        .await;
    assert!(outcome.results[0].is_ok());
    assert!(outcome.results[1].as_ref().unwrap_err().is_conflict());

    // the same kind of sibling arriving by replication is kept as a branch
    let r1_hash = r1.split_once('-').unwrap().1.to_string();
    let revs = apply_ok(
        &writer,
        vec![json!({ "_id": "a", "_revisions": { "start": 2, "ids": ["0000", r1_hash] } })],
        &BatchOptions::replication(),
    )
    .await;
    assert_eq!(revs, vec!["2-0000"]);

    let meta = writer.backend().get_metadata("a").await.unwrap().unwrap();
    assert_eq!(meta.rev_tree.leaves().len(), 2);
    assert_eq!(writer.backend().doc_count().await, 1);
}

#[tokio::test]
async fn test_replayed_revision_is_not_rewritten() {
    let (writer, _dir) = writer().await;
    let doc = json!({ "_id": "a", "_rev": "1-x", "v": 1 });
    apply_ok(&writer, vec![doc.clone()], &BatchOptions::replication()).await;
    let revs = apply_ok(&writer, vec![doc], &BatchOptions::replication()).await;
    assert_eq!(revs, vec!["1-x"]);
    assert_eq!(writer.backend().writes().await.len(), 1);
}

// ─── Failure Isolation ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_backend_failure_stays_in_its_slot() {
    let (writer, _dir) = writer().await;
    writer.backend().fail_writes_for("b").await;

    let outcome = writer
        .bulk_docs(
            vec![
                json!({ "_id": "a" }),
                json!({ "_id": "b" }),
                json!({ "_id": "c" }),
                json!({ "_id": "b", "v": 2 }),
            ],
            &BatchOptions::default(),
        )
        .await;

    assert!(outcome.results[0].is_ok());
    assert!(matches!(outcome.results[1], Err(DocError::Backend(_))));
    assert!(outcome.results[2].is_ok());
    // nothing was stored for b, so its successor fails at the backend too
    assert!(matches!(outcome.results[3], Err(DocError::Backend(_))));
    assert_eq!(outcome.doc_count_delta, 2);
    assert_eq!(writer.backend().doc_count().await, 2);
}

// ─── Stemming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_history_depth_bounded_across_batches() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions {
        rev_limit: 3,
        ..BatchOptions::default()
    };

    let mut revs = apply_ok(&writer, vec![json!({ "_id": "a", "n": 0 })], &opts).await;
    let first = revs[0].clone();
    for n in 1..6 {
        let prev = revs[0].clone();
        revs = apply_ok(&writer, vec![json!({ "_id": "a", "_rev": prev, "n": n })], &opts).await;
    }

    let meta = writer.backend().get_metadata("a").await.unwrap().unwrap();
    assert_eq!(meta.rev.pos, 6);
    assert_eq!(meta.rev_tree.depth(), 3);
    let first: RevId = first.parse().unwrap();
    assert!(!meta.rev_tree.contains(&first));
    assert!(writer.backend().get_body("a", &first).await.is_none());
}

// ─── Attachments ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_identical_attachments_share_one_file() {
    let (writer, _dir) = writer().await;
    let att = json!({ "note.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } });
    let revs = apply_ok(
        &writer,
        vec![
            json!({ "_id": "a", "_attachments": att.clone() }),
            json!({ "_id": "b", "_attachments": att }),
        ],
        &BatchOptions::default(),
    )
    .await;
    assert_eq!(revs.len(), 2);

    let files: Vec<_> = std::fs::read_dir(writer.attachments().dir()).unwrap().collect();
    assert_eq!(files.len(), 1);
    assert_eq!(writer.backend().attachment_refs(HELLO_FILE).await, 2);

    let rev_a: RevId = revs[0].parse().unwrap();
    let body = writer.backend().get_body("a", &rev_a).await.unwrap();
    assert_eq!(
        body.get("_attachments").unwrap()["note.txt"],
        json!({
            "content_type": "text/plain",
            "digest": "md5-XUFAKrxLKna5cZ2REBfFkg==",
            "length": 5,
            "data": HELLO_FILE
        })
    );
}

#[tokio::test]
async fn test_orphaned_attachment_deleted_after_stemming() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions {
        rev_limit: 1,
        ..BatchOptions::default()
    };
    let att = json!({ "note.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } });
    let revs = apply_ok(&writer, vec![json!({ "_id": "a", "_attachments": att })], &opts).await;
    let path = writer.attachments().path_for(HELLO_FILE);
    assert!(path.exists());

    let outcome = writer
        .bulk_docs(vec![json!({ "_id": "a", "_rev": revs[0], "v": 2 })], &opts)
        .await;
    assert!(outcome.results[0].is_ok());
    assert_eq!(outcome.orphaned_attachments, vec![HELLO_FILE.to_string()]);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_file_orphaned_and_reused_in_one_batch_is_kept() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions {
        rev_limit: 1,
        ..BatchOptions::default()
    };
    let att = json!({ "note.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } });
    let revs = apply_ok(&writer, vec![json!({ "_id": "a", "_attachments": att.clone() })], &opts).await;

    // a's edit stems the only revision holding the file while b takes it up
    let outcome = writer
        .bulk_docs(
            vec![
                json!({ "_id": "a", "_rev": revs[0], "v": 2 }),
                json!({ "_id": "b", "_attachments": att }),
            ],
            &opts,
        )
        .await;
    assert!(outcome.results.iter().all(Result::is_ok));
    assert_eq!(writer.backend().attachment_refs(HELLO_FILE).await, 1);
    assert!(writer.attachments().path_for(HELLO_FILE).exists());
}

#[tokio::test]
async fn test_rejected_document_files_reclaimed() {
    let (writer, _dir) = writer().await;
    let world = attachment_file_name(&md5_digest(b"world"), "text/plain").unwrap();

    let outcome = writer
        .bulk_docs(
            vec![
                json!({ "_id": "a" }),
                json!({ "_id": "a", "_attachments": {
                    "w.txt": { "content_type": "text/plain", "data": "d29ybGQ=" }
                }}),
            ],
            &BatchOptions::default(),
        )
        .await;
    assert!(outcome.results[0].is_ok());
    assert_eq!(outcome.results[1], Err(DocError::Conflict));
    assert_eq!(writer.backend().attachment_refs(&world).await, 0);
    assert!(!writer.attachments().path_for(&world).exists());
}

#[tokio::test]
async fn test_partially_stored_attachments_reclaimed() {
    let (writer, _dir) = writer().await;
    let outcome = writer
        .bulk_docs(
            vec![json!({ "_id": "a", "_attachments": {
                "good.txt": { "content_type": "text/plain", "data": "aGVsbG8=" },
                "bad.txt": { "content_type": "text/plain", "data": "***" }
            }})],
            &BatchOptions::default(),
        )
        .await;
    assert_eq!(outcome.results[0].as_ref().unwrap_err().status(), 400);
    assert_eq!(std::fs::read_dir(writer.attachments().dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rejected_document_keeps_file_of_accepted_one() {
    let (writer, _dir) = writer().await;
    let att = json!({ "note.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } });
    let outcome = writer
        .bulk_docs(
            vec![
                json!({ "_id": "a", "_attachments": att.clone() }),
                json!({ "_id": "a", "_attachments": att }),
            ],
            &BatchOptions::default(),
        )
        .await;
    assert!(outcome.results[0].is_ok());
    assert_eq!(outcome.results[1], Err(DocError::Conflict));
    assert_eq!(writer.backend().attachment_refs(HELLO_FILE).await, 1);
    assert!(writer.attachments().path_for(HELLO_FILE).exists());
}

// ─── Parsing Through The Front Door ──────────────────────────────────────────

#[tokio::test]
async fn test_plain_document_gets_generation_one() {
    let (writer, _dir) = writer().await;
    let revs = apply_ok(&writer, vec![json!({ "_id": "a", "foo": 1 })], &BatchOptions::default()).await;
    let rev: RevId = revs[0].parse().unwrap();
    assert_eq!(rev.pos, 1);
    assert_eq!(rev.hash.len(), 32);

    let body = writer.backend().get_body("a", &rev).await.unwrap();
    assert_eq!(body.into_value(), json!({ "foo": 1 }));
}

#[tokio::test]
async fn test_unknown_underscore_member_rejected() {
    let (writer, _dir) = writer().await;
    let outcome = writer
        .bulk_docs(vec![json!({ "_id": "a", "_bogus": 1 })], &BatchOptions::default())
        .await;
    let err = outcome.results[0].as_ref().unwrap_err();
    assert_eq!(err.status(), 400);
    assert!(err.to_string().contains("_bogus"));
    assert_eq!(writer.backend().update_seq().await, 0);
}

// ─── All Docs ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_all_docs_by_keys() {
    let (writer, _dir) = writer().await;
    let opts = BatchOptions::replication();
    apply_ok(
        &writer,
        vec![
            json!({ "_id": "a", "_rev": "1-x", "v": 1 }),
            json!({ "_id": "b", "_rev": "1-y", "_deleted": true }),
        ],
        &opts,
    )
    .await;

    let res = writer
        .all_docs(&AllDocsOptions {
            keys: vec!["a".into(), "nope".into(), "b".into()],
            include_docs: true,
            update_seq: true,
            ..AllDocsOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(res.total_rows, 1);
    assert_eq!(res.update_seq, Some(2));
    assert_eq!(
        serde_json::to_value(&res.rows).unwrap(),
        json!([
            {
                "id": "a",
                "key": "a",
                "value": { "rev": "1-x" },
                "doc": { "_id": "a", "_rev": "1-x", "v": 1 }
            },
            { "key": "nope", "error": "not_found" },
            { "id": "b", "key": "b", "value": { "rev": "1-y", "deleted": true } }
        ])
    );
}

//! Crash recovery: replaying the durable log reproduces the exact pre-image
//! record set, torn tails are truncated, and undecodable annotated entries
//! halt replay instead of being skipped.

use retrolog::{
    ApplyContext, CollectionCatalog, Document, DocumentId, DurableOplog, EntryDurability,
    LogEntryAnnotator, LogFrame, LogTimestamp, MetricsRegistry, Node, NodeConfig, NodeError,
    NodeMode, PreImageStore, PreImageWriter, ReplayApplier, ReplicationStateMachine, WalError,
    WriteOp,
};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;

#[test]
fn restart_reproduces_the_exact_record_set() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.oplog");
    let (orders, audit, digest, records, last_ts);
    {
        let mut node = Node::primary(NodeConfig::new("n", &path)).unwrap();
        orders = node.create_collection("orders", true);
        audit = node.create_collection("audit", false);
        for id in ["a", "b"] {
            node.insert(
                orders,
                Document {
                    id: DocumentId::new(id),
                    body: json!({"_id": id, "v": 1}),
                },
            )
            .unwrap();
        }
        node.update(orders, DocumentId::new("a"), json!({"_id": "a", "v": 2}))
            .unwrap();
        node.apply_ops(vec![
            WriteOp::Update {
                collection: orders,
                document_id: DocumentId::new("b"),
                post: json!({"_id": "b", "v": 2}),
            },
            WriteOp::Delete {
                collection: orders,
                document_id: DocumentId::new("a"),
            },
        ])
        .unwrap();
        node.insert(
            audit,
            Document {
                id: DocumentId::new("x"),
                body: json!({"_id": "x"}),
            },
        )
        .unwrap();
        node.delete(audit, DocumentId::new("x")).unwrap();

        digest = node.preimage_digest().unwrap();
        records = node.store().scan().cloned().collect::<Vec<_>>();
        last_ts = node.last_appended().unwrap();
        // Node dropped here: the in-memory store and catalog are lost, the
        // log survives.
    }

    let mut node = Node::restart(NodeConfig::new("n", &path)).unwrap();
    assert_eq!(node.mode(), NodeMode::Recovering);
    node.register_collection(orders, "orders", true).unwrap();
    node.register_collection(audit, "audit", false).unwrap();
    let summary = node.recover().unwrap();

    assert_eq!(node.mode(), NodeMode::SteadyReplay);
    assert_eq!(summary.replayed_entries, 6);
    assert_eq!(summary.truncated_bytes, 0);
    assert_eq!(node.preimage_digest().unwrap(), digest);
    assert_eq!(node.store().scan().cloned().collect::<Vec<_>>(), records);
    assert_eq!(node.last_applied(), Some(last_ts));
    // Collection state replayed too: "a" deleted, "b" at its final version.
    let collection = node.catalog().get(orders).unwrap();
    assert!(collection.get(&DocumentId::new("a")).is_none());
    assert_eq!(
        collection.get(&DocumentId::new("b")).unwrap().body,
        json!({"_id": "b", "v": 2})
    );
}

#[test]
fn recovery_from_a_checkpoint_replays_only_the_suffix() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.oplog");
    let (orders, checkpoint, final_key);
    {
        let mut node = Node::primary(NodeConfig::new("n", &path)).unwrap();
        orders = node.create_collection("orders", true);
        node.insert(
            orders,
            Document {
                id: DocumentId::new("a"),
                body: json!({"_id": "a", "v": 1}),
            },
        )
        .unwrap();
        let second = node
            .update(orders, DocumentId::new("a"), json!({"_id": "a", "v": 2}))
            .unwrap();
        let third = node
            .update(orders, DocumentId::new("a"), json!({"_id": "a", "v": 3}))
            .unwrap();
        checkpoint = second.ts;
        final_key = third.preimage_key.unwrap();
    }

    let mut node = Node::restart(NodeConfig::new("n", &path)).unwrap();
    node.register_collection(orders, "orders", true).unwrap();
    let summary = node.recover_from(checkpoint).unwrap();

    assert_eq!(summary.replayed_entries, 1);
    assert_eq!(summary.preimages_written, 1);
    assert_eq!(node.store().len(), 1);
    let record = node.store().get(&final_key).unwrap();
    assert_eq!(record.payload, json!({"_id": "a", "v": 2}));
}

#[test]
fn torn_tail_is_truncated_during_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.oplog");
    let (orders, digest, last_ts);
    {
        let mut node = Node::primary(NodeConfig::new("n", &path)).unwrap();
        orders = node.create_collection("orders", true);
        node.insert(
            orders,
            Document {
                id: DocumentId::new("a"),
                body: json!({"_id": "a", "v": 1}),
            },
        )
        .unwrap();
        node.update(orders, DocumentId::new("a"), json!({"_id": "a", "v": 2}))
            .unwrap();
        digest = node.preimage_digest().unwrap();
        last_ts = node.last_appended().unwrap();
    }

    // Simulate a crash mid-append: half of a valid frame at the tail.
    let durable_len = fs::metadata(&path).unwrap().len();
    let unfinished = LogEntryAnnotator::annotate_write(
        last_ts.next(),
        900,
        WriteOp::Update {
            collection: orders,
            document_id: DocumentId::new("a"),
            post: json!({"_id": "a", "v": 3}),
        },
        Some(json!({"_id": "a", "v": 2})),
    );
    let mut torn = LogFrame::for_entry(&unfinished).unwrap().encode();
    torn.truncate(torn.len() / 2);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&torn).unwrap();
    drop(file);

    let mut node = Node::restart(NodeConfig::new("n", &path)).unwrap();
    node.register_collection(orders, "orders", true).unwrap();
    let summary = node.recover().unwrap();

    assert_eq!(summary.replayed_entries, 2);
    assert_eq!(summary.truncated_bytes, torn.len() as u64);
    assert_eq!(fs::metadata(&path).unwrap().len(), durable_len);
    assert_eq!(node.preimage_digest().unwrap(), digest);
    // The log accepts new appends at the position after the durable prefix.
    assert_eq!(node.last_appended(), Some(last_ts));
    node.update(orders, DocumentId::new("a"), json!({"_id": "a", "v": 3}))
        .unwrap();
}

#[test]
fn undecodable_annotated_entry_halts_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.oplog");
    let (orders, last_ts);
    {
        let mut node = Node::primary(NodeConfig::new("n", &path)).unwrap();
        orders = node.create_collection("orders", true);
        node.insert(
            orders,
            Document {
                id: DocumentId::new("a"),
                body: json!({"_id": "a"}),
            },
        )
        .unwrap();
        last_ts = node.last_appended().unwrap();
    }

    // An annotated entry whose frame header disagrees with its payload. The
    // CRC covers only the payload, so the frame itself still validates and
    // the failure surfaces as an entry decode fault, not a torn tail.
    let orders_op = WriteOp::Delete {
        collection: orders,
        document_id: DocumentId::new("a"),
    };
    let entry = LogEntryAnnotator::annotate_write(
        last_ts.next(),
        900,
        orders_op,
        Some(json!({"_id": "a"})),
    );
    let mut bytes = LogFrame::for_entry(&entry).unwrap().encode();
    bytes[16] = 0; // clear the annotated flag in the header
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&bytes).unwrap();
    drop(file);

    let err = Node::restart(NodeConfig::new("n", &path)).unwrap_err();
    assert!(matches!(err, NodeError::Wal(WalError::Entry(_))));
}

#[test]
fn re_replay_of_a_durable_entry_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut catalog = CollectionCatalog::new();
    let orders = catalog.create("orders", true);
    let mut store = PreImageStore::new();
    let mut oplog = DurableOplog::open(dir.path().join("node.oplog")).unwrap();
    let machine = ReplicationStateMachine::new(NodeMode::SteadyReplay);
    let writer = PreImageWriter::new(machine.gate());
    let mut metrics = MetricsRegistry::new("retrolog");

    let entry = LogEntryAnnotator::annotate_write(
        LogTimestamp(1),
        100,
        WriteOp::Delete {
            collection: orders,
            document_id: DocumentId::new("a"),
        },
        Some(json!({"_id": "a", "v": 1})),
    );

    let mut ctx = ApplyContext {
        catalog: &mut catalog,
        store: &mut store,
        oplog: &mut oplog,
        writer: &writer,
        metrics: &mut metrics,
    };
    let first = ReplayApplier::new()
        .apply_entry(&mut ctx, &entry, EntryDurability::NeedsAppend)
        .unwrap();
    assert_eq!(first.preimages_written, 1);

    // A second recovery pass over the same durable entry, as after a crash
    // that landed between append and checkpoint.
    let second = ReplayApplier::new()
        .apply_entry(&mut ctx, &entry, EntryDurability::AlreadyDurable)
        .unwrap();
    assert_eq!(second.preimages_written, 0);
    assert_eq!(second.preimages_duplicate, 1);
    assert_eq!(ctx.store.len(), 1);
    assert_eq!(
        ctx.store
            .get(&entry.annotations[0].key)
            .unwrap()
            .payload,
        json!({"_id": "a", "v": 1})
    );
}

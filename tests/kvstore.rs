use std::sync::Arc;

use quadra::kv::{Kv, MemoryKv};
use quadra::kvstore::{self, KvQuadStore};
use quadra::{
    Delta, Direction, IgnoreOpts, Options, Quad, QuadStore, Ref, StoreError, Value,
};

fn iri(s: &str) -> Value {
    Value::iri(s)
}

fn quad(s: &str, p: &str, o: &str) -> Quad {
    Quad::new(iri(s), iri(p), iri(o), None)
}

fn open_store() -> (Arc<MemoryKv>, KvQuadStore) {
    let db = Arc::new(MemoryKv::new());
    kvstore::init(&*db, &Options::new()).expect("init");
    let qs = kvstore::open(Box::new(Arc::clone(&db)), &Options::new()).expect("open");
    (db, qs)
}

fn node_id(qs: &KvQuadStore, v: &Value) -> u64 {
    match qs.value_of(v).expect("value_of").expect("value resolves") {
        Ref::Node(id) => id,
        other => panic!("expected a node ref, got {other:?}"),
    }
}

#[test]
fn open_requires_init_and_init_is_once() {
    let db = Arc::new(MemoryKv::new());
    let err = kvstore::open(Box::new(Arc::clone(&db)), &Options::new())
        .err()
        .expect("open must fail before init");
    assert!(matches!(err, StoreError::NotInitialized));

    kvstore::init(&*db, &Options::new()).expect("init");
    let err = kvstore::init(&*db, &Options::new())
        .err()
        .expect("second init must fail");
    assert!(matches!(err, StoreError::DatabaseExists));

    kvstore::open(Box::new(db), &Options::new()).expect("open after init");
}

#[test]
fn version_mismatch_is_rejected() {
    let db = Arc::new(MemoryKv::new());
    kvstore::init(&*db, &Options::new()).expect("init");
    quadra::kv::update(&*db, |tx| {
        tx.put(b"meta\x00version", &7u64.to_le_bytes())
    })
    .expect("clobber version");

    let err = kvstore::open(Box::new(db), &Options::new())
        .err()
        .expect("open must fail");
    match err {
        StoreError::VersionMismatch { stored, supported } => {
            assert_eq!(stored, 7);
            assert_eq!(supported, kvstore::LATEST_DATA_VERSION);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn add_resolve_and_iterate() {
    let (_db, mut qs) = open_store();
    qs.apply_deltas(
        &[Delta::add(quad("alice", "knows", "bob"))],
        IgnoreOpts::default(),
    )
    .expect("apply");

    let stats = qs.stats(false).expect("stats");
    assert_eq!(stats.quads.value, 1);
    assert!(stats.quads.exact);

    let alice = qs
        .value_of(&iri("alice"))
        .expect("value_of")
        .expect("alice resolves");
    assert_eq!(qs.name_of(&alice).expect("name_of"), Some(iri("alice")));

    let found: Vec<Ref> = qs
        .quad_iterator(Direction::Subject, &alice)
        .expect("iterator")
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(
        qs.quad(&found[0]).expect("quad"),
        quad("alice", "knows", "bob")
    );

    // reverse traversal through the object-leading index
    let bob = qs.value_of(&iri("bob")).expect("value_of").expect("bob");
    let found: Vec<Ref> = qs
        .quad_iterator(Direction::Object, &bob)
        .expect("iterator")
        .collect();
    assert_eq!(found.len(), 1);

    // predicate has no leading index; the log fallback must agree
    let knows = qs
        .value_of(&iri("knows"))
        .expect("value_of")
        .expect("knows");
    let found: Vec<Ref> = qs
        .quad_iterator(Direction::Predicate, &knows)
        .expect("iterator")
        .collect();
    assert_eq!(found.len(), 1);
}

#[test]
fn ids_are_assigned_monotonically() {
    let (_db, mut qs) = open_store();
    let mut last = 0u64;
    for i in 0..10 {
        qs.apply_deltas(
            &[Delta::add(quad(&format!("s{i}"), "p", &format!("o{i}")))],
            IgnoreOpts::default(),
        )
        .expect("apply");
        let id = node_id(&qs, &iri(&format!("s{i}")));
        assert!(id > last, "id {id} not above {last}");
        last = id;
    }
    // 21 nodes (10 subjects, 10 objects, one shared predicate) + 10 quads
    assert_eq!(qs.horizon(), 31);
}

#[test]
fn subject_predicate_index_holds_all_quads() {
    let (db, mut qs) = open_store();
    qs.apply_deltas(
        &[
            Delta::add(quad("alice", "knows", "bob")),
            Delta::add(quad("alice", "likes", "carol")),
            Delta::add(quad("alice", "fears", "dave")),
        ],
        IgnoreOpts::default(),
    )
    .expect("apply");

    let alice = node_id(&qs, &iri("alice"));
    let quad_ids: Vec<u64> = qs
        .quad_iterator(Direction::Subject, &Ref::Node(alice))
        .expect("iterator")
        .map(|r| r.id())
        .collect();
    assert_eq!(quad_ids.len(), 3);

    // prefix scan of the subject-predicate bucket under alice's id
    let mut prefix = b"sp\x00".to_vec();
    prefix.extend_from_slice(&alice.to_be_bytes());
    let tx = db.tx(false).expect("tx");
    let mut indexed: Vec<u64> = Vec::new();
    for pair in tx.scan(&prefix).expect("scan") {
        let (key, value) = pair.expect("pair");
        assert_eq!(key.len(), prefix.len() + 8, "sp key is two ids wide");
        for id in decode_varints(&value) {
            indexed.push(id);
        }
    }
    let mut want = quad_ids.clone();
    want.sort_unstable();
    indexed.sort_unstable();
    assert_eq!(indexed, want);

    // every quad is also present in the object-leading index
    for r in qs
        .quad_iterator(Direction::Subject, &Ref::Node(alice))
        .expect("iterator")
    {
        let obj = match qs.quad_direction(&r, Direction::Object).expect("dir") {
            Some(Ref::Node(id)) => id,
            other => panic!("unexpected object ref {other:?}"),
        };
        let mut key = b"ops\x00".to_vec();
        key.extend_from_slice(&obj.to_be_bytes());
        let entries: Vec<_> = tx
            .scan(&key)
            .expect("scan")
            .map(|p| p.expect("pair"))
            .collect();
        assert!(
            entries
                .iter()
                .any(|(_, v)| decode_varints(v).contains(&r.id())),
            "quad {} missing from ops index",
            r.id()
        );
    }
}

#[test]
fn duplicate_adds_are_detected() {
    let (_db, mut qs) = open_store();
    let q = quad("a", "p", "b");
    qs.apply_deltas(&[Delta::add(q.clone())], IgnoreOpts::default())
        .expect("add");
    let id_before = qs
        .quad_iterator(Direction::Subject, &Ref::Node(node_id(&qs, &iri("a"))))
        .expect("iterator")
        .next()
        .expect("one quad")
        .id();

    let err = qs
        .apply_deltas(&[Delta::add(q.clone())], IgnoreOpts::default())
        .expect_err("duplicate must fail");
    assert!(matches!(err.cause(), StoreError::QuadExists));
    match &err {
        StoreError::Delta { delta, .. } => assert_eq!(delta.quad, q),
        other => panic!("expected a delta error, got {other}"),
    }

    qs.apply_deltas(
        &[Delta::add(q.clone())],
        IgnoreOpts {
            ignore_dup: true,
            ignore_missing: false,
        },
    )
    .expect("ignored duplicate");

    let stats = qs.stats(false).expect("stats");
    assert_eq!(stats.quads.value, 1);
    let id_after = qs
        .quad_iterator(Direction::Subject, &Ref::Node(node_id(&qs, &iri("a"))))
        .expect("iterator")
        .next()
        .expect("one quad")
        .id();
    assert_eq!(id_before, id_after);
}

#[test]
fn delete_tombstones_and_releases_nodes() {
    let (db, mut qs) = open_store();
    let q = quad("a", "p", "b");
    qs.apply_deltas(&[Delta::add(q.clone())], IgnoreOpts::default())
        .expect("add");
    let keys_before = db.len();

    qs.apply_deltas(&[Delta::delete(q.clone())], IgnoreOpts::default())
        .expect("delete");

    assert_eq!(qs.size(), 0);
    for v in ["a", "p", "b"] {
        assert_eq!(qs.value_of(&iri(v)).expect("value_of"), None);
    }
    // nodes were fully removed, quad log entry remains as a tombstone
    assert!(db.len() < keys_before);
    let tombstones = quadra::kv::view(&*db, |tx| {
        let mut n = 0;
        for pair in tx.scan(b"log\x00")? {
            let (k, v) = pair?;
            if k.len() == 4 || v.is_empty() {
                continue;
            }
            let p = kvstore::Primitive::decode(&v)?;
            if p.deleted {
                n += 1;
            }
        }
        Ok(n)
    })
    .expect("scan log");
    assert_eq!(tombstones, 1);

    let err = qs
        .apply_deltas(&[Delta::delete(q.clone())], IgnoreOpts::default())
        .expect_err("second delete must fail");
    assert!(matches!(err.cause(), StoreError::QuadNotExist));

    qs.apply_deltas(
        &[Delta::delete(q)],
        IgnoreOpts {
            ignore_dup: false,
            ignore_missing: true,
        },
    )
    .expect("ignored missing delete");
}

#[test]
fn failed_batch_leaves_no_partial_state() {
    let (_db, mut qs) = open_store();
    qs.apply_deltas(&[Delta::add(quad("a", "p", "b"))], IgnoreOpts::default())
        .expect("seed");

    // second delta fails the batch; the first must not stick
    let err = qs
        .apply_deltas(
            &[
                Delta::add(quad("x", "p", "y")),
                Delta::add(quad("a", "p", "b")),
            ],
            IgnoreOpts::default(),
        )
        .expect_err("batch must fail");
    assert!(matches!(err.cause(), StoreError::QuadExists));

    assert_eq!(qs.size(), 1);
    assert_eq!(qs.value_of(&iri("x")).expect("value_of"), None);
}

#[test]
fn mixed_batch_applies_adds_before_deletes() {
    let (_db, mut qs) = open_store();
    qs.apply_deltas(&[Delta::add(quad("a", "p", "b"))], IgnoreOpts::default())
        .expect("seed");
    qs.apply_deltas(
        &[
            Delta::add(quad("b", "p", "c")),
            Delta::delete(quad("a", "p", "b")),
        ],
        IgnoreOpts::default(),
    )
    .expect("mixed batch");
    assert_eq!(qs.size(), 1);
    assert_eq!(qs.value_of(&iri("a")).expect("value_of"), None);
    assert!(qs.value_of(&iri("b")).expect("value_of").is_some());
}

#[test]
fn reopened_store_rebuilds_existence_filter() {
    let db = Arc::new(MemoryKv::new());
    kvstore::init(&*db, &Options::new()).expect("init");
    {
        let mut qs =
            kvstore::open(Box::new(Arc::clone(&db)), &Options::new()).expect("open");
        qs.apply_deltas(
            &[
                Delta::add(quad("a", "p", "b")),
                Delta::add(quad("b", "p", "c")),
            ],
            IgnoreOpts::default(),
        )
        .expect("apply");
    }

    let mut qs = kvstore::open(Box::new(Arc::clone(&db)), &Options::new()).expect("reopen");
    assert_eq!(qs.size(), 2);
    // the warmed bloom must not report the live quad absent
    qs.apply_deltas(&[Delta::delete(quad("a", "p", "b"))], IgnoreOpts::default())
        .expect("delete after reopen");
    // and a duplicate is still caught
    let err = qs
        .apply_deltas(&[Delta::add(quad("b", "p", "c"))], IgnoreOpts::default())
        .expect_err("duplicate detected after reopen");
    assert!(matches!(err.cause(), StoreError::QuadExists));
}

#[test]
fn no_bloom_store_stays_correct() {
    let db = Arc::new(MemoryKv::new());
    kvstore::init(&*db, &Options::new()).expect("init");
    let opt = Options::new().with(kvstore::OPT_NO_BLOOM, true);
    let mut qs = kvstore::open(Box::new(Arc::clone(&db)), &opt).expect("open");

    let q = quad("a", "p", "b");
    qs.apply_deltas(&[Delta::add(q.clone())], IgnoreOpts::default())
        .expect("add");
    let err = qs
        .apply_deltas(&[Delta::add(q.clone())], IgnoreOpts::default())
        .expect_err("duplicate still detected");
    assert!(matches!(err.cause(), StoreError::QuadExists));
    qs.apply_deltas(&[Delta::delete(q)], IgnoreOpts::default())
        .expect("delete");
    assert_eq!(qs.size(), 0);
}

#[test]
fn upfront_init_creates_value_buckets() {
    let db = Arc::new(MemoryKv::new());
    let opt = Options::new().with(kvstore::OPT_UPFRONT, true);
    kvstore::init(&*db, &opt).expect("init");
    // 256*256 value buckets and as many refcount buckets
    assert!(db.len() >= 2 * 256 * 256);
    kvstore::open(Box::new(db), &Options::new()).expect("open");
}

#[test]
fn missing_index_metadata_falls_back_to_legacy() {
    let db = Arc::new(MemoryKv::new());
    kvstore::init(&*db, &Options::new()).expect("init");
    quadra::kv::update(&*db, |tx| tx.del(b"meta\x00indexes")).expect("drop indexes meta");

    let mut qs = kvstore::open(Box::new(Arc::clone(&db)), &Options::new()).expect("open");
    qs.apply_deltas(&[Delta::add(quad("a", "p", "b"))], IgnoreOpts::default())
        .expect("apply");

    // writes land in the legacy single-direction subject bucket
    let a = node_id(&qs, &iri("a"));
    let mut prefix = b"s\x00".to_vec();
    prefix.extend_from_slice(&a.to_be_bytes());
    let entries = quadra::kv::view(&*db, |tx| {
        Ok(tx.scan(&prefix)?.count())
    })
    .expect("scan");
    assert_eq!(entries, 1);
}

#[test]
fn stats_estimate_and_exact_node_count() {
    let (_db, mut qs) = open_store();
    for i in 0..6 {
        qs.apply_deltas(
            &[Delta::add(quad(&format!("s{i}"), "p", "o"))],
            IgnoreOpts::default(),
        )
        .expect("apply");
    }
    let est = qs.stats(false).expect("stats");
    assert_eq!(est.quads.value, 6);
    assert_eq!(est.nodes.value, 2); // size/3 estimate
    assert!(!est.nodes.exact);

    let exact = qs.stats(true).expect("stats");
    assert_eq!(exact.nodes.value, 8); // s0..s5, p, o
    assert!(exact.nodes.exact);
}

#[test]
fn quad_writer_buffers_and_commits() {
    let (_db, mut qs) = open_store();
    {
        let mut w = qs.new_quad_writer().expect("writer");
        let batch: Vec<Quad> = (0..500)
            .map(|i| quad(&format!("n{i}"), "next", &format!("n{}", i + 1)))
            .collect();
        let n = w.write_quads(&batch).expect("write");
        assert_eq!(n, 500);
        w.close().expect("close");
    }
    assert_eq!(qs.size(), 500);

    // a later stream sees the committed quads and drops duplicates
    {
        let mut w = qs.new_quad_writer().expect("second writer");
        w.write_quad(quad("n0", "next", "n1")).expect("rewrite");
        w.close().expect("close");
    }
    assert_eq!(qs.size(), 500);
    let n0 = qs.value_of(&iri("n0")).expect("value_of").expect("n0");
    assert_eq!(
        qs.quad_iterator(Direction::Subject, &n0)
            .expect("iterator")
            .count(),
        1
    );
}

#[test]
fn custom_index_set_from_environment() {
    // the label-leading index is added on top of the defaults, so any
    // store initialized while the variable is set stays compatible
    std::env::set_var(
        kvstore::ENV_KV_INDEXES,
        r#"{"all":[{"dirs":["subject","predicate"],"unique":false},{"dirs":["object","predicate","subject"],"unique":false},{"dirs":["label"],"unique":false}]}"#,
    );
    let db = Arc::new(MemoryKv::new());
    let init_res = kvstore::init(&*db, &Options::new());
    std::env::remove_var(kvstore::ENV_KV_INDEXES);
    init_res.expect("init");

    let mut qs = kvstore::open(Box::new(Arc::clone(&db)), &Options::new()).expect("open");
    qs.apply_deltas(
        &[Delta::add(Quad::new(iri("a"), iri("p"), iri("b"), iri("g")))],
        IgnoreOpts::default(),
    )
    .expect("apply");

    let g = node_id(&qs, &iri("g"));
    let mut prefix = b"l\x00".to_vec();
    prefix.extend_from_slice(&g.to_be_bytes());
    let entries = quadra::kv::view(&*db, |tx| Ok(tx.scan(&prefix)?.count())).expect("scan");
    assert_eq!(entries, 1, "label index must be maintained");
}

fn decode_varints(mut b: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    while !b.is_empty() {
        let mut x = 0u64;
        let mut shift = 0;
        loop {
            let byte = b[0];
            b = &b[1..];
            x |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        out.push(x);
    }
    out
}

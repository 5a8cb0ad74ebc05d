//! Property tests: index/heap consistency under arbitrary mutation
//! sequences, constraint failures leaving no trace, and content-hash
//! insertion-order invariance.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;

use stonetable::context::{ExecutorContext, TableId};
use stonetable::datum::{Datum, Type};
use stonetable::index::IndexSpec;
use stonetable::schema::{Column, Schema};
use stonetable::table::{ConstraintError, PersistentTable};
use stonetable::tuple::Tuple;

fn table(ctx: &Arc<ExecutorContext>, export: bool) -> PersistentTable {
    let schema = Schema::new(vec![
        Column::not_null("id", Type::Int64),
        Column::not_null("a", Type::Int64),
    ]);
    let mut table = PersistentTable::new(TableId::new(1), "t", schema, Arc::clone(ctx), export);
    table.add_index(IndexSpec::unique_ordered("t_pk", vec![0]), true);
    table.add_index(IndexSpec::multi_ordered("t_by_a", vec![1]), false);
    table
}

fn row(id: i64, a: i64) -> Tuple {
    Tuple::new(vec![Datum::Int64(id), Datum::Int64(a)])
}

fn probe(id: i64) -> Tuple {
    Tuple::new(vec![Datum::Int64(id), Datum::Null])
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, i64),
    Update(i64, i64),
    Delete(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..24, any::<i64>()).prop_map(|(id, a)| Op::Insert(id, a)),
        (0i64..24, any::<i64>()).prop_map(|(id, a)| Op::Update(id, a)),
        (0i64..24).prop_map(Op::Delete),
    ]
}

/// Applies one op to the table and the model, asserting they agree on the
/// outcome.
fn apply(table: &mut PersistentTable, model: &mut BTreeMap<i64, i64>, op: Op) {
    match op {
        Op::Insert(id, a) => {
            let result = table.insert(&row(id, a));
            if model.contains_key(&id) {
                assert!(matches!(result, Err(ConstraintError::Unique { .. })));
            } else {
                result.unwrap();
                model.insert(id, a);
            }
        }
        Op::Update(id, a) => {
            if let Some(addr) = table.lookup(&probe(id)) {
                table.update(addr, &row(id, a), true).unwrap();
                model.insert(id, a);
            } else {
                assert!(!model.contains_key(&id));
            }
        }
        Op::Delete(id) => {
            if let Some(addr) = table.lookup(&probe(id)) {
                table.delete(addr);
                assert!(model.remove(&id).is_some());
            } else {
                assert!(!model.contains_key(&id));
            }
        }
    }
}

proptest! {
    /// After any mutation sequence, every index's entry count equals the
    /// active tuple count, and primary-key lookups agree with the model.
    #[test]
    fn prop_index_counts_track_active_tuples(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let ctx = ExecutorContext::new(0, 0);
        let mut t = table(&ctx, false);
        let mut model = BTreeMap::new();

        for op in ops {
            apply(&mut t, &mut model, op);

            prop_assert_eq!(t.active_tuple_count(), model.len());
            for index in t.indexes().iter() {
                prop_assert_eq!(index.len(), model.len());
            }
        }

        for (&id, &a) in &model {
            let addr = t.lookup(&probe(id)).expect("model row present in table");
            prop_assert_eq!(t.get(addr).expect("live slot").get(1), &Datum::Int64(a));
        }
    }

    /// Every heap tuple resolves back to its own slot through the primary
    /// key.
    #[test]
    fn prop_heap_and_primary_agree(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let ctx = ExecutorContext::new(0, 0);
        let mut t = table(&ctx, false);
        let mut model = BTreeMap::new();
        for op in ops {
            apply(&mut t, &mut model, op);
        }

        let pairs: Vec<_> = t.iter().map(|(addr, tuple)| (addr, tuple.clone())).collect();
        for (addr, tuple) in pairs {
            prop_assert_eq!(t.lookup(&tuple), Some(addr));
        }
    }

    /// A failed insert leaves the tuple count, every index, and the export
    /// tail exactly as they were.
    #[test]
    fn prop_failed_insert_leaves_no_trace(id in 0i64..10, a in any::<i64>()) {
        let ctx = ExecutorContext::new(0, 0);
        let mut t = table(&ctx, true);
        t.insert(&row(id, a)).unwrap();
        ctx.commit_transaction();
        t.flush_old_tuples(-1);
        let exported = t.committed_export_bytes().unwrap().len();

        prop_assert!(t.insert(&row(id, a.wrapping_add(1))).is_err());
        prop_assert!(t
            .insert(&Tuple::new(vec![Datum::Int64(id + 100), Datum::Null]))
            .is_err());

        prop_assert_eq!(t.active_tuple_count(), 1);
        for index in t.indexes().iter() {
            prop_assert_eq!(index.len(), 1);
        }
        t.flush_old_tuples(-1);
        prop_assert_eq!(t.committed_export_bytes().unwrap().len(), exported);
    }

    /// The content hash depends on logical contents only, never insertion
    /// order.
    #[test]
    fn prop_content_hash_is_order_invariant(ids in prop::collection::btree_set(0i64..1000, 1..64)) {
        let ctx = ExecutorContext::new(0, 0);
        let mut forward = table(&ctx, false);
        let mut backward = table(&ctx, false);

        for &id in &ids {
            forward.insert(&row(id, id * 3)).unwrap();
        }
        for &id in ids.iter().rev() {
            backward.insert(&row(id, id * 3)).unwrap();
        }

        prop_assert_eq!(forward.content_hash(), backward.content_hash());
    }
}

#[test]
fn test_random_stress_against_model() {
    let mut rng = rand::thread_rng();
    let ctx = ExecutorContext::new(0, 0);
    let mut t = table(&ctx, false);
    let mut model: BTreeMap<i64, i64> = BTreeMap::new();

    for _ in 0..2000 {
        let id = rng.gen_range(0..200);
        let a = rng.gen_range(-1000..1000);
        match rng.gen_range(0..3) {
            0 => {
                let result = t.insert(&row(id, a));
                if model.contains_key(&id) {
                    assert!(result.is_err());
                } else {
                    result.unwrap();
                    model.insert(id, a);
                }
            }
            1 => {
                if let Some(addr) = t.lookup(&probe(id)) {
                    t.update(addr, &row(id, a), true).unwrap();
                    model.insert(id, a);
                }
            }
            _ => {
                if let Some(addr) = t.lookup(&probe(id)) {
                    t.delete(addr);
                    model.remove(&id);
                }
            }
        }
    }

    assert_eq!(t.active_tuple_count(), model.len());

    // Rebuild a table from the model in shuffled order: same content hash.
    let mut entries: Vec<(i64, i64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    entries.shuffle(&mut rng);
    let mut rebuilt = table(&ctx, false);
    for (id, a) in entries {
        rebuilt.insert(&row(id, a)).unwrap();
    }
    assert_eq!(rebuilt.content_hash(), t.content_hash());
}

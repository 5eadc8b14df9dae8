use crate::id_set::DeleteSet;
use crate::sticky_index::{Assoc, StickyIndex};
use crate::struct_store::StateVector;
use crate::types::xml::XmlFragment;
use crate::types::{
    Array, ArrayPrelim, Change, DeepObservable, EntryChange, GetString, Map, MapPrelim, Observable,
    Text, ToJson, XmlElementPrelim, XmlTextPrelim,
};
use crate::types::{Attrs, BranchPtr, Delta, Value};
use crate::updates::decoder::Decode;
use crate::{Any, Doc, ReadTxn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

fn attrs(pairs: &[(&str, Any)]) -> Attrs {
    let mut map = Attrs::new();
    for (key, value) in pairs {
        map.insert(Arc::from(*key), value.clone());
    }
    map
}

fn json(source: &str) -> Any {
    Any::from_json(source).unwrap()
}

/// Pairwise differential synchronization across all peers.
fn exchange(docs: &[&Doc]) {
    for source in docs {
        for target in docs {
            if std::ptr::eq(*source, *target) {
                continue;
            }
            let sv = StateVector::decode_from(&target.encode_state_vector()).unwrap();
            let update = source.encode_state_as_update(&sv);
            target.apply_update(&update).unwrap();
        }
    }
}

fn check_store_invariants(doc: &Doc) {
    let txn = doc.transact();
    let store = txn.store();
    // per-client struct vectors are gap-free and start at clock 0
    for (client, list) in store.blocks.clients() {
        let mut expected = 0u32;
        for cell in list.iter() {
            assert_eq!(
                cell.clock_start(),
                expected,
                "struct store gap for client {}",
                client
            );
            assert!(cell.len() > 0);
            expected = cell.clock_end();
        }
    }
    for branch in store.types.values() {
        let ptr = BranchPtr::from(branch);
        // cached sequence length matches countable, undeleted items
        let mut len = 0u32;
        let mut current = ptr.start;
        let mut prev = None;
        while let Some(item) = current {
            assert_eq!(item.left, prev, "broken left link at {}", item.id);
            if !item.is_deleted() && item.is_countable() {
                len += item.len();
            }
            prev = current;
            current = item.right;
        }
        assert_eq!(ptr.len(), len, "length bookkeeping broken");
        // map entries point at the rightmost item of their key
        for (key, item) in ptr.map.iter() {
            assert!(item.right.is_none(), "map entry '{}' is not rightmost", key);
        }
    }
}

fn check_delete_set_minimality(doc: &Doc) {
    let txn = doc.transact();
    let ds = DeleteSet::from_store(&txn.store().blocks);
    for (_, ranges) in ds.iter() {
        for window in ranges.windows(2) {
            assert!(window[0].end < window[1].start, "delete runs not merged");
        }
    }
}

#[test]
fn array_insert_conflict_resolution_orders_by_client() {
    // S1: concurrent inserts at the same position are ordered by client id
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let doc_c = Doc::with_client_id(3);
    for (doc, value) in [(&doc_a, "a"), (&doc_b, "b"), (&doc_c, "c")].iter() {
        let array = doc.get_array("array");
        let mut txn = doc.transact_mut();
        array.insert(&mut txn, 0, *value);
    }
    exchange(&[&doc_a, &doc_b, &doc_c]);
    let expected = json(r#"["a","b","c"]"#);
    for doc in [&doc_a, &doc_b, &doc_c].iter() {
        let array = doc.get_array("array");
        let txn = doc.transact();
        assert_eq!(array.to_json(&txn), expected);
        drop(txn);
        check_store_invariants(doc);
        check_delete_set_minimality(doc);
    }
}

#[test]
fn concurrent_insert_and_delete_converge() {
    // S2: an insert inside a concurrently deleted range survives
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let doc_c = Doc::with_client_id(3);
    {
        let array = doc_a.get_array("array");
        let mut txn = doc_a.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from("x"), Any::from("y"), Any::from("z")]);
    }
    exchange(&[&doc_a, &doc_b, &doc_c]);

    {
        let array = doc_a.get_array("array");
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 1, "0");
    }
    {
        let array = doc_b.get_array("array");
        let mut txn = doc_b.transact_mut();
        array.remove_range(&mut txn, 0, 2);
    }
    {
        let array = doc_c.get_array("array");
        let mut txn = doc_c.transact_mut();
        array.insert(&mut txn, 1, "2");
    }
    exchange(&[&doc_a, &doc_b, &doc_c]);
    exchange(&[&doc_a, &doc_b, &doc_c]);

    let expected = json(r#"["0","2","z"]"#);
    for doc in [&doc_a, &doc_b, &doc_c].iter() {
        let array = doc.get_array("array");
        let txn = doc.transact();
        assert_eq!(array.to_json(&txn), expected);
        drop(txn);
        check_store_invariants(doc);
    }
}

#[test]
fn text_format_round_trip() {
    // S3: formatting-aware inserts, deletes and format toggles
    let doc = Doc::with_client_id(1);
    let text = doc.get_text("text");
    let bold = attrs(&[("bold", Any::Bool(true))]);

    {
        let mut txn = doc.transact_mut();
        text.insert_with_attributes(&mut txn, 0, "abc", bold.clone());
    }
    {
        let txn = doc.transact();
        let diff = text.diff(&txn);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].insert, Value::from("abc"));
        assert_eq!(diff[0].attributes.as_deref(), Some(&bold));
    }

    {
        let mut txn = doc.transact_mut();
        text.remove_range(&mut txn, 0, 1);
    }
    {
        let txn = doc.transact();
        assert_eq!(text.get_string(&txn), "bc");
        let diff = text.diff(&txn);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].insert, Value::from("bc"));
        assert_eq!(diff[0].attributes.as_deref(), Some(&bold));
    }

    {
        let mut txn = doc.transact_mut();
        text.insert_with_attributes(&mut txn, 0, "z", bold.clone());
    }
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "y");
    }
    {
        let txn = doc.transact();
        assert_eq!(text.get_string(&txn), "yzbc");
        let diff = text.diff(&txn);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].insert, Value::from("y"));
        assert_eq!(diff[0].attributes, None);
        assert_eq!(diff[1].insert, Value::from("zbc"));
        assert_eq!(diff[1].attributes.as_deref(), Some(&bold));
    }

    {
        let mut txn = doc.transact_mut();
        text.format(&mut txn, 0, 2, attrs(&[("bold", Any::Null)]));
    }
    {
        let txn = doc.transact();
        let diff = text.diff(&txn);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].insert, Value::from("yz"));
        assert_eq!(diff[0].attributes, None);
        assert_eq!(diff[1].insert, Value::from("bc"));
        assert_eq!(diff[1].attributes.as_deref(), Some(&bold));
    }
    check_store_invariants(&doc);
}

#[test]
fn text_formatting_converges_across_peers() {
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let bold = attrs(&[("bold", Any::Bool(true))]);
    {
        let text = doc_a.get_text("text");
        let mut txn = doc_a.transact_mut();
        text.insert(&mut txn, 0, "hello world");
    }
    exchange(&[&doc_a, &doc_b]);
    // concurrent: A bolds "hello", B deletes "world"
    {
        let text = doc_a.get_text("text");
        let mut txn = doc_a.transact_mut();
        text.format(&mut txn, 0, 5, bold.clone());
    }
    {
        let text = doc_b.get_text("text");
        let mut txn = doc_b.transact_mut();
        text.remove_range(&mut txn, 5, 6);
    }
    exchange(&[&doc_a, &doc_b]);
    exchange(&[&doc_a, &doc_b]);
    for doc in [&doc_a, &doc_b].iter() {
        let text = doc.get_text("text");
        let txn = doc.transact();
        assert_eq!(text.get_string(&txn), "hello");
        let diff = text.diff(&txn);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].attributes.as_deref(), Some(&bold));
        drop(txn);
        check_store_invariants(doc);
    }
}

#[test]
fn map_conflict_last_writer_by_client_wins() {
    // S4: three concurrent writers, the highest client id wins
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let doc_c = Doc::with_client_id(3);
    {
        let map = doc_a.get_map("map");
        let mut txn = doc_a.transact_mut();
        map.insert(&mut txn, "k", "0");
    }
    {
        let map = doc_b.get_map("map");
        let mut txn = doc_b.transact_mut();
        map.insert(&mut txn, "k", "1");
        drop(txn);
        let mut txn = doc_b.transact_mut();
        map.insert(&mut txn, "k", "2");
    }
    {
        let map = doc_c.get_map("map");
        let mut txn = doc_c.transact_mut();
        map.insert(&mut txn, "k", "3");
    }
    exchange(&[&doc_a, &doc_b, &doc_c]);
    exchange(&[&doc_a, &doc_b, &doc_c]);
    for doc in [&doc_a, &doc_b, &doc_c].iter() {
        let map = doc.get_map("map");
        let txn = doc.transact();
        assert_eq!(map.get(&txn, "k"), Some(Value::from("3")));
        assert_eq!(map.len(&txn), 1);
        drop(txn);
        check_store_invariants(doc);
    }
}

#[test]
fn undo_skips_entries_overwritten_remotely() {
    // S5: an undo concedes to a remote overwrite of the same key
    let doc_a = Doc::with_client_id(1);
    let map_a = doc_a.get_map("map");
    {
        let mut txn = doc_a.transact_mut();
        map_a.insert(&mut txn, "a", 0i64);
    }
    let mut mgr = crate::UndoManager::new(&doc_a, &map_a);
    {
        let mut txn = doc_a.transact_mut();
        map_a.insert(&mut txn, "a", 1i64);
    }
    assert!(mgr.undo());
    assert_eq!(map_a.get(&doc_a.transact(), "a"), Some(Value::from(0i64)));
    assert!(mgr.redo());
    assert_eq!(map_a.get(&doc_a.transact(), "a"), Some(Value::from(1i64)));

    let doc_b = Doc::with_client_id(2);
    doc_b
        .apply_update_with(
            &doc_a.encode_state_as_update(&StateVector::default()),
            "remote",
        )
        .unwrap();
    let map_b = doc_b.get_map("map");
    {
        let mut txn = doc_b.transact_mut();
        map_b.insert(&mut txn, "a", 44i64);
    }
    doc_a
        .apply_update_with(
            &doc_b.encode_state_as_update(
                &StateVector::decode_from(&doc_a.encode_state_vector()).unwrap(),
            ),
            "remote",
        )
        .unwrap();
    assert_eq!(map_a.get(&doc_a.transact(), "a"), Some(Value::from(44i64)));

    // undo is skipped: the local change has been overwritten remotely
    mgr.undo();
    assert_eq!(map_a.get(&doc_a.transact(), "a"), Some(Value::from(44i64)));
    check_store_invariants(&doc_a);
}

#[test]
fn differential_sync_transfers_only_missing_structs() {
    // S6: A knows {1:5, 2:3}, B knows {1:5}; the step-2 answer covers
    // exactly the client-2 structs
    let doc_a = Doc::with_client_id(1);
    {
        let text = doc_a.get_text("text");
        let mut txn = doc_a.transact_mut();
        text.insert(&mut txn, 0, "abcde");
    }
    let doc_b = Doc::with_client_id(5);
    doc_b
        .apply_update(&doc_a.encode_state_as_update(&StateVector::default()))
        .unwrap();

    let writer = Doc::with_client_id(2);
    writer
        .apply_update(&doc_a.encode_state_as_update(&StateVector::default()))
        .unwrap();
    {
        let array = writer.get_array("array");
        let mut txn = writer.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from(1), Any::from(2), Any::from(3)]);
    }
    doc_a
        .apply_update(
            &writer.encode_state_as_update(
                &StateVector::decode_from(&doc_a.encode_state_vector()).unwrap(),
            ),
        )
        .unwrap();
    let sv_a = StateVector::decode_from(&doc_a.encode_state_vector()).unwrap();
    assert_eq!(sv_a.get(&1), 5);
    assert_eq!(sv_a.get(&2), 3);

    // B sends step-1 {1:5}; A's step-2 reply covers only client 2
    let sv_b = StateVector::decode_from(&doc_b.encode_state_vector()).unwrap();
    assert_eq!(sv_b.get(&1), 5);
    assert_eq!(sv_b.get(&2), 0);
    let step2 = doc_a.encode_state_as_update(&sv_b);
    let decoded = crate::Update::decode_from(&step2).unwrap();
    assert_eq!(decoded.state_vector().get(&1), 0);
    assert_eq!(decoded.state_vector().get(&2), 3);

    doc_b.apply_update(&step2).unwrap();
    let sv_b = StateVector::decode_from(&doc_b.encode_state_vector()).unwrap();
    assert_eq!(sv_b.get(&1), 5);
    assert_eq!(sv_b.get(&2), 3);
    let txn = doc_b.transact();
    assert_eq!(doc_b.get_array("array").to_json(&txn), json("[1,2,3]"));
}

#[test]
fn apply_update_is_idempotent() {
    let doc_a = Doc::with_client_id(1);
    {
        let array = doc_a.get_array("array");
        let mut txn = doc_a.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from(1), Any::from(2)]);
    }
    let update = doc_a.encode_state_as_update(&StateVector::default());
    let doc_b = Doc::with_client_id(2);
    doc_b.apply_update(&update).unwrap();
    doc_b.apply_update(&update).unwrap();
    let array = doc_b.get_array("array");
    let txn = doc_b.transact();
    assert_eq!(array.to_json(&txn), json("[1,2]"));
    drop(txn);
    check_store_invariants(&doc_b);
}

#[test]
fn updates_commute() {
    let doc_a = Doc::with_client_id(1);
    let updates: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let updates = updates.clone();
        doc_a.observe_update(move |_txn, event| {
            updates.borrow_mut().push(event.update.clone());
        })
    };
    let array = doc_a.get_array("array");
    {
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 0, "a");
    }
    {
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 1, "b");
    }
    {
        let mut txn = doc_a.transact_mut();
        array.remove(&mut txn, 0);
    }
    let updates = updates.borrow();
    assert_eq!(updates.len(), 3);

    let forward = Doc::with_client_id(2);
    for update in updates.iter() {
        forward.apply_update(update).unwrap();
    }
    let backward = Doc::with_client_id(3);
    for update in updates.iter().rev() {
        backward.apply_update(update).unwrap();
    }
    let expected = json(r#"["b"]"#);
    for doc in [&forward, &backward].iter() {
        let array = doc.get_array("array");
        let txn = doc.transact();
        assert_eq!(array.to_json(&txn), expected);
    }
}

#[test]
fn full_state_round_trip() {
    let doc = Doc::with_client_id(1);
    {
        let array = doc.get_array("array");
        let map = doc.get_map("map");
        let text = doc.get_text("text");
        let mut txn = doc.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from(1), Any::from("two"), Any::Null]);
        map.insert(&mut txn, "nested", MapPrelim::from({
            let mut entries = std::collections::HashMap::new();
            entries.insert("inner", 1i64);
            entries
        }));
        text.insert(&mut txn, 0, "hello");
        text.insert_with_attributes(&mut txn, 5, " world", attrs(&[("bold", Any::Bool(true))]));
    }
    let snapshot = doc.encode_state_as_update(&StateVector::default());
    let restored = Doc::with_client_id(2);
    restored.apply_update(&snapshot).unwrap();

    let txn_a = doc.transact();
    let txn_b = restored.transact();
    assert_eq!(
        doc.get_array("array").to_json(&txn_a),
        restored.get_array("array").to_json(&txn_b)
    );
    assert_eq!(
        doc.get_map("map").to_json(&txn_a),
        restored.get_map("map").to_json(&txn_b)
    );
    assert_eq!(
        doc.get_text("text").diff(&txn_a),
        restored.get_text("text").diff(&txn_b)
    );
    drop(txn_b);
    // the restored state re-encodes to an equivalent snapshot
    let reencoded = restored.encode_state_as_update(&StateVector::default());
    let third = Doc::with_client_id(3);
    third.apply_update(&reencoded).unwrap();
    let txn_c = third.transact();
    assert_eq!(
        doc.get_text("text").get_string(&txn_a),
        third.get_text("text").get_string(&txn_c)
    );
}

#[test]
fn state_vector_sufficiency() {
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    {
        let array = doc_a.get_array("array");
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 0, "a");
    }
    exchange(&[&doc_a, &doc_b]);
    {
        let array = doc_b.get_array("array");
        let mut txn = doc_b.transact_mut();
        array.insert(&mut txn, 1, "b");
        array.remove(&mut txn, 0);
    }
    // a is brought into full sync by the diff against its state vector
    let sv_a = StateVector::decode_from(&doc_a.encode_state_vector()).unwrap();
    doc_a
        .apply_update(&doc_b.encode_state_as_update(&sv_a))
        .unwrap();
    let txn_a = doc_a.transact();
    let txn_b = doc_b.transact();
    assert_eq!(
        doc_a.get_array("array").to_json(&txn_a),
        doc_b.get_array("array").to_json(&txn_b)
    );
    assert_eq!(txn_a.state_vector(), txn_b.state_vector());
}

#[test]
fn pending_update_waits_for_dependencies() {
    let doc_a = Doc::with_client_id(1);
    let updates: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let updates = updates.clone();
        doc_a.observe_update(move |_txn, event| {
            updates.borrow_mut().push(event.update.clone());
        })
    };
    let array = doc_a.get_array("array");
    {
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 0, "a");
    }
    {
        let mut txn = doc_a.transact_mut();
        array.insert(&mut txn, 1, "b");
    }
    let updates = updates.borrow();

    let doc_b = Doc::with_client_id(2);
    // the later update alone cannot be integrated: its predecessor is missing
    doc_b.apply_update(&updates[1]).unwrap();
    {
        let txn = doc_b.transact();
        assert_eq!(doc_b.get_array("array").len(&txn), 0);
        assert!(txn.store().pending.is_some());
    }
    // once the missing dependency lands, both resolve
    doc_b.apply_update(&updates[0]).unwrap();
    {
        let txn = doc_b.transact();
        assert_eq!(doc_b.get_array("array").to_json(&txn), json(r#"["a","b"]"#));
        assert!(txn.store().pending.is_none());
    }
    check_store_invariants(&doc_b);
}

#[test]
fn pending_delete_waits_for_dependencies() {
    let doc_a = Doc::with_client_id(1);
    let updates: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let updates = updates.clone();
        doc_a.observe_update(move |_txn, event| {
            updates.borrow_mut().push(event.update.clone());
        })
    };
    let array = doc_a.get_array("array");
    {
        let mut txn = doc_a.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from(1), Any::from(2), Any::from(3)]);
    }
    {
        let mut txn = doc_a.transact_mut();
        array.remove(&mut txn, 1);
    }
    let updates = updates.borrow();

    let doc_b = Doc::with_client_id(2);
    doc_b.apply_update(&updates[1]).unwrap();
    {
        let txn = doc_b.transact();
        assert!(txn.store().pending_ds.is_some());
    }
    doc_b.apply_update(&updates[0]).unwrap();
    {
        let txn = doc_b.transact();
        assert_eq!(doc_b.get_array("array").to_json(&txn), json("[1,3]"));
        assert!(txn.store().pending_ds.is_none());
    }
}

#[test]
fn array_observer_reports_delta() {
    let doc = Doc::with_client_id(1);
    let array = doc.get_array("array");
    {
        let mut txn = doc.transact_mut();
        array.insert_range(&mut txn, 0, vec![Any::from(1), Any::from(2)]);
    }
    let received: Rc<RefCell<Vec<Vec<Change>>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let received = received.clone();
        array.observe(move |txn, event| {
            received.borrow_mut().push(event.delta(txn).to_vec());
        })
    };
    {
        let mut txn = doc.transact_mut();
        array.insert(&mut txn, 2, "x");
        array.remove(&mut txn, 0);
    }
    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0],
        vec![
            Change::Removed(1),
            Change::Retain(1),
            Change::Added(vec![Value::from("x")])
        ]
    );
}

#[test]
fn map_observer_reports_changed_keys() {
    let doc = Doc::with_client_id(1);
    let map = doc.get_map("map");
    {
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, "stays", 1i64);
        map.insert(&mut txn, "goes", 2i64);
    }
    let received: Rc<RefCell<Vec<(String, EntryChange)>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let received = received.clone();
        map.observe(move |txn, event| {
            let mut changes: Vec<(String, EntryChange)> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| (key.to_string(), change.clone()))
                .collect();
            changes.sort_by(|a, b| a.0.cmp(&b.0));
            received.borrow_mut().extend(changes);
        })
    };
    {
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, "fresh", 3i64);
        map.insert(&mut txn, "stays", 11i64);
        map.remove(&mut txn, "goes");
    }
    let received = received.borrow();
    assert_eq!(
        received.as_slice(),
        &[
            (
                "fresh".to_string(),
                EntryChange::Inserted(Value::from(3i64))
            ),
            (
                "goes".to_string(),
                EntryChange::Removed(Value::from(2i64))
            ),
            (
                "stays".to_string(),
                EntryChange::Updated(Value::from(1i64), Value::from(11i64))
            ),
        ]
    );
}

#[test]
fn deep_observer_bubbles_nested_events() {
    let doc = Doc::with_client_id(1);
    let root = doc.get_map("root");
    {
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, "child", MapPrelim::default());
    }
    let paths: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let paths = paths.clone();
        root.observe_deep(move |_txn, events| {
            for event in events.iter() {
                paths.borrow_mut().push(format!("{:?}", event.path()));
            }
        })
    };
    let child = match root.get(&doc.transact(), "child").unwrap() {
        Value::Map(map) => map,
        other => panic!("expected a nested map, got {}", other),
    };
    {
        let mut txn = doc.transact_mut();
        child.insert(&mut txn, "leaf", 1i64);
    }
    let paths = paths.borrow();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].contains("child"), "unexpected path: {}", paths[0]);
}

#[test]
fn text_event_delta_reports_retain_and_insert() {
    let doc = Doc::with_client_id(1);
    let text = doc.get_text("text");
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "ab");
    }
    let received: Rc<RefCell<Vec<Vec<Delta>>>> = Rc::new(RefCell::new(Vec::new()));
    let _sub = {
        let received = received.clone();
        text.observe(move |txn, event| {
            received.borrow_mut().push(event.delta(txn).to_vec());
        })
    };
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 1, "X");
    }
    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0],
        vec![
            Delta::Retain(1, None),
            Delta::Inserted(Value::from("X"), None)
        ]
    );
}

#[test]
fn undo_redo_restores_text() {
    let doc = Doc::with_client_id(1);
    let text = doc.get_text("text");
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "hello");
    }
    let mut mgr = crate::UndoManager::new(&doc, &text);
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 5, " world");
    }
    mgr.reset();
    {
        let mut txn = doc.transact_mut();
        text.remove_range(&mut txn, 0, 5);
    }
    assert_eq!(text.get_string(&doc.transact()), " world");

    assert!(mgr.undo());
    assert_eq!(text.get_string(&doc.transact()), "hello world");
    assert!(mgr.undo());
    assert_eq!(text.get_string(&doc.transact()), "hello");
    assert!(!mgr.can_undo() || {
        // nothing before the manager's creation is undoable
        !mgr.undo()
    });
    assert!(mgr.redo());
    assert_eq!(text.get_string(&doc.transact()), "hello world");
    assert!(mgr.redo());
    assert_eq!(text.get_string(&doc.transact()), " world");
    check_store_invariants(&doc);
}

#[test]
fn undo_coalesces_rapid_edits() {
    let doc = Doc::with_client_id(1);
    let text = doc.get_text("text");
    let mut mgr = crate::UndoManager::new(&doc, &text);
    for (index, chunk) in [(0, "a"), (1, "b"), (2, "c")].iter() {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, *index, chunk);
    }
    // all three edits happened within the capture timeout
    assert!(mgr.undo());
    assert_eq!(text.get_string(&doc.transact()), "");
    assert!(!mgr.can_undo());
}

#[test]
fn undo_symmetry_preserves_state_vector() {
    let doc = Doc::with_client_id(1);
    let map = doc.get_map("map");
    {
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, "a", 1i64);
    }
    let mut mgr = crate::UndoManager::new(&doc, &map);
    {
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, "b", 2i64);
    }
    let before = doc.get_map("map").to_json(&doc.transact());
    assert!(mgr.undo());
    assert!(mgr.redo());
    let after = doc.get_map("map").to_json(&doc.transact());
    assert_eq!(before, after);
    check_store_invariants(&doc);
}

#[test]
fn nested_types_round_trip() {
    let doc = Doc::with_client_id(1);
    let array = doc.get_array("array");
    {
        let mut txn = doc.transact_mut();
        array.push_back(&mut txn, ArrayPrelim::from(vec![1i64, 2i64]));
        array.push_back(&mut txn, crate::TextPrelim("nested".to_string()));
    }
    let other = Doc::with_client_id(2);
    other
        .apply_update(&doc.encode_state_as_update(&StateVector::default()))
        .unwrap();
    let txn = other.transact();
    let nested = other.get_array("array");
    assert_eq!(nested.len(&txn), 2);
    match nested.get(&txn, 0).unwrap() {
        Value::Array(inner) => assert_eq!(inner.to_json(&txn), json("[1,2]")),
        other => panic!("expected a nested array, got {}", other),
    }
    match nested.get(&txn, 1).unwrap() {
        Value::Text(inner) => assert_eq!(inner.get_string(&txn), "nested"),
        other => panic!("expected a nested text, got {}", other),
    }
}

#[test]
fn deleting_nested_type_tombstones_subtree() {
    let doc = Doc::with_client_id(1);
    let array = doc.get_array("array");
    {
        let mut txn = doc.transact_mut();
        array.push_back(&mut txn, ArrayPrelim::from(vec![1i64, 2i64, 3i64]));
        array.push_back(&mut txn, "tail");
    }
    {
        let mut txn = doc.transact_mut();
        array.remove(&mut txn, 0);
    }
    let txn = doc.transact();
    assert_eq!(array.to_json(&txn), json(r#"["tail"]"#));
    drop(txn);
    // the tombstoned subtree still synchronizes correctly
    let other = Doc::with_client_id(2);
    other
        .apply_update(&doc.encode_state_as_update(&StateVector::default()))
        .unwrap();
    let txn = other.transact();
    assert_eq!(other.get_array("array").to_json(&txn), json(r#"["tail"]"#));
    drop(txn);
    check_store_invariants(&doc);
    check_store_invariants(&other);
}

#[test]
fn sticky_index_survives_concurrent_inserts() {
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    {
        let text = doc_a.get_text("text");
        let mut txn = doc_a.transact_mut();
        text.insert(&mut txn, 0, "hello");
    }
    exchange(&[&doc_a, &doc_b]);
    let index = {
        let text = doc_a.get_text("text");
        let txn = doc_a.transact();
        StickyIndex::at(&txn, &text, 3, Assoc::After)
    };
    // a concurrent remote insert shifts the absolute position
    {
        let text = doc_b.get_text("text");
        let mut txn = doc_b.transact_mut();
        text.insert(&mut txn, 0, "XX");
    }
    exchange(&[&doc_a, &doc_b]);
    let txn = doc_a.transact();
    let (value, offset) = index.get_offset(&txn).unwrap();
    assert_eq!(offset, 5);
    match value {
        Value::Text(_) => {}
        other => panic!("expected the text type, got {}", other),
    }
    // the reference survives serialization
    let encoded = {
        use crate::updates::encoder::Encode;
        index.encode_to_vec()
    };
    let decoded = StickyIndex::decode_from(&encoded).unwrap();
    assert_eq!(decoded, index);
}

#[test]
fn xml_structure_serialization() {
    let doc = Doc::with_client_id(1);
    let fragment = doc.get_xml_fragment("prosemirror");
    {
        let mut txn = doc.transact_mut();
        let node = fragment.push_back(&mut txn, XmlElementPrelim::empty("p"));
        if let crate::XmlNode::Element(paragraph) = node {
            use crate::types::xml::Xml;
            paragraph.insert_attribute(&mut txn, "align", "left");
            paragraph.push_back(&mut txn, XmlTextPrelim("hello".to_string()));
        }
    }
    let txn = doc.transact();
    assert_eq!(
        fragment.get_string(&txn),
        "<p align=\"left\">hello</p>"
    );
    drop(txn);

    // xml content survives the wire format
    let other = Doc::with_client_id(2);
    other
        .apply_update(&doc.encode_state_as_update(&StateVector::default()))
        .unwrap();
    let fragment = other.get_xml_fragment("prosemirror");
    let txn = other.transact();
    assert_eq!(
        fragment.get_string(&txn),
        "<p align=\"left\">hello</p>"
    );
}

#[test]
fn convergence_fuzz() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let doc_c = Doc::with_client_id(3);
    let docs = [&doc_a, &doc_b, &doc_c];
    for doc in docs.iter() {
        doc.get_array("list");
        doc.get_text("prose");
        doc.get_map("meta");
    }

    for round in 0..30 {
        for doc in docs.iter() {
            let ops = rng.gen_range(1, 4);
            for _ in 0..ops {
                match rng.gen_range(0, 5) {
                    0 => {
                        let array = doc.get_array("list");
                        let mut txn = doc.transact_mut();
                        let len = array.len(&txn);
                        let index = rng.gen_range(0, len + 1);
                        array.insert(&mut txn, index, rng.gen_range(0, 1000) as i64);
                    }
                    1 => {
                        let array = doc.get_array("list");
                        let mut txn = doc.transact_mut();
                        let len = array.len(&txn);
                        if len > 0 {
                            let index = rng.gen_range(0, len);
                            array.remove(&mut txn, index);
                        }
                    }
                    2 => {
                        let text = doc.get_text("prose");
                        let mut txn = doc.transact_mut();
                        let len = text.len(&txn);
                        let index = rng.gen_range(0, len + 1);
                        let word = ["lorem", "ipsum", "dolor", "sit"][rng.gen_range(0, 4)];
                        text.insert(&mut txn, index, word);
                    }
                    3 => {
                        let text = doc.get_text("prose");
                        let mut txn = doc.transact_mut();
                        let len = text.len(&txn);
                        if len > 0 {
                            let index = rng.gen_range(0, len);
                            let del = rng.gen_range(1, (len - index).min(3) + 1);
                            text.remove_range(&mut txn, index, del);
                        }
                    }
                    _ => {
                        let map = doc.get_map("meta");
                        let mut txn = doc.transact_mut();
                        let key = ["k0", "k1", "k2"][rng.gen_range(0, 3)];
                        map.insert(&mut txn, key, rng.gen_range(0, 100) as i64);
                    }
                }
            }
        }
        if round % 3 == 0 {
            // a random pair syncs up
            let i = rng.gen_range(0, 3);
            let j = (i + rng.gen_range(1, 3)) % 3;
            exchange(&[docs[i], docs[j]]);
        }
    }
    // everyone catches up, in both directions
    exchange(&[&doc_a, &doc_b, &doc_c]);
    exchange(&[&doc_a, &doc_b, &doc_c]);

    let txn_a = doc_a.transact();
    let txn_b = doc_b.transact();
    let txn_c = doc_c.transact();
    assert_eq!(
        doc_a.get_array("list").to_json(&txn_a),
        doc_b.get_array("list").to_json(&txn_b)
    );
    assert_eq!(
        doc_a.get_array("list").to_json(&txn_a),
        doc_c.get_array("list").to_json(&txn_c)
    );
    assert_eq!(
        doc_a.get_text("prose").get_string(&txn_a),
        doc_b.get_text("prose").get_string(&txn_b)
    );
    assert_eq!(
        doc_a.get_text("prose").get_string(&txn_a),
        doc_c.get_text("prose").get_string(&txn_c)
    );
    assert_eq!(
        doc_a.get_map("meta").to_json(&txn_a),
        doc_b.get_map("meta").to_json(&txn_b)
    );
    assert_eq!(
        doc_a.get_map("meta").to_json(&txn_a),
        doc_c.get_map("meta").to_json(&txn_c)
    );
    drop(txn_a);
    drop(txn_b);
    drop(txn_c);
    for doc in docs.iter() {
        check_store_invariants(doc);
        check_delete_set_minimality(doc);
    }
}

//! Ref list integrity
//!
//! Walking next pointers from the head visits every live member once;
//! walking prev pointers from the tail gives the reverse order.

mod common;

use std::collections::HashSet;

use common::{memory_store, v};
use revdb::refs::RefEntry;
use revdb::{ItemStore, StoreError, Version};
use uuid::Uuid;

fn members_at(store: &ItemStore, collection: &Uuid, version: Version) -> Vec<Uuid> {
    store
        .refs()
        .walk(None, collection, version)
        .unwrap()
        .into_iter()
        .map(|(member, _)| member)
        .collect()
}

fn assert_list_integrity(store: &ItemStore, collection: &Uuid, version: Version, expected: &[Uuid]) {
    let forward = members_at(store, collection, version);
    assert_eq!(forward, expected);

    let unique: HashSet<&Uuid> = forward.iter().collect();
    assert_eq!(unique.len(), forward.len());

    let mut backward: Vec<Uuid> = store
        .refs()
        .walk_back(None, collection, version)
        .unwrap()
        .into_iter()
        .map(|(member, _)| member)
        .collect();
    backward.reverse();
    assert_eq!(backward, forward);

    let head = store.refs().load_head(None, collection, version).unwrap();
    let count = head.map_or(0, |h| h.count) as usize;
    assert_eq!(count, expected.len());
}

#[test]
fn test_list_integrity_across_versions() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let members: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    store
        .commit(None, |batch| {
            for member in &members {
                batch.append_ref(&collection, member, None)?;
            }
            Ok(())
        })
        .unwrap();
    store
        .commit(None, |batch| {
            assert!(batch.remove_ref(&collection, &members[0])?);
            assert!(batch.remove_ref(&collection, &members[2])?);
            assert!(!batch.remove_ref(&collection, &members[2])?);
            Ok(())
        })
        .unwrap();
    store
        .commit(None, |batch| {
            batch.remove_ref(&collection, &members[4])?;
            batch.append_ref(&collection, &members[0], Some("back"))
        })
        .unwrap();

    assert_list_integrity(&store, &collection, v(0), &[]);
    assert_list_integrity(&store, &collection, v(1), &members);
    assert_list_integrity(&store, &collection, v(2), &[members[1], members[3], members[4]]);
    assert_list_integrity(&store, &collection, v(3), &[members[1], members[3], members[0]]);

    let link = store
        .refs()
        .load_ref(None, &collection, v(3), &members[0])
        .unwrap()
        .unwrap();
    assert_eq!(link.alias.as_deref(), Some("back"));
    assert_eq!(link.previous, Some(members[3]));
}

#[test]
fn test_ref_iterator_lookups() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    store
        .commit(None, |batch| {
            batch.append_ref(&collection, &a, None)?;
            batch.append_ref(&collection, &b, None)
        })
        .unwrap();
    store
        .commit(None, |batch| batch.remove_ref(&collection, &a).map(|_| ()))
        .unwrap();

    let refs = store.refs();
    let mut at1 = refs.ref_iterator(None, collection, v(1)).unwrap();
    assert_eq!(at1.load(&a).unwrap().unwrap().next, Some(b));
    assert_eq!(at1.head().unwrap().unwrap().count, 2);
    at1.reset().unwrap();
    assert_eq!(at1.load(&b).unwrap().unwrap().previous, Some(a));
    at1.close();

    let mut at2 = refs.ref_iterator(None, collection, v(2)).unwrap();
    assert!(at2.load(&a).unwrap().is_none());
    assert_eq!(at2.entry(&a).unwrap(), Some(RefEntry::Removed));
    assert_eq!(at2.load(&b).unwrap().unwrap().previous, None);
}

#[test]
fn test_history_reports_changed_members() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    store
        .commit(None, |batch| batch.append_ref(&collection, &a, None))
        .unwrap();
    store
        .commit(None, |batch| batch.append_ref(&collection, &b, None))
        .unwrap();
    store
        .commit(None, |batch| batch.append_ref(&collection, &c, None))
        .unwrap();

    let changes: Vec<(u32, Uuid)> = store
        .refs()
        .iter_history(None, collection, v(2), v(3), true)
        .unwrap()
        .map(|c| c.unwrap())
        .map(|c| (c.version.value(), c.member))
        .collect();
    // Appending rewrites the old tail's forward link too.
    let expected: HashSet<(u32, Uuid)> = [(2, a), (2, b), (3, b), (3, c)].into_iter().collect();
    assert_eq!(changes.iter().copied().collect::<HashSet<_>>(), expected);
    assert!(changes.windows(2).all(|w| w[0].0 <= w[1].0));

    let with_heads = store
        .refs()
        .iter_history(None, collection, v(1), v(3), false)
        .unwrap()
        .filter(|c| c.as_ref().unwrap().member == collection)
        .count();
    assert_eq!(with_heads, 3);
}

#[test]
fn test_appending_linked_member_is_refused() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    store
        .commit(None, |batch| {
            batch.append_ref(&collection, &a, None)?;
            batch.append_ref(&collection, &b, None)
        })
        .unwrap();

    let (version, appended) = store
        .commit(None, |batch| batch.append_ref(&collection, &a, None))
        .unwrap();
    assert!(!appended);
    assert_eq!(version, v(1));

    assert_list_integrity(&store, &collection, v(1), &[a, b]);
    assert_list_integrity(&store, &collection, Version::MAX, &[a, b]);
}

#[test]
fn test_removed_member_can_be_appended_again() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    store
        .commit(None, |batch| {
            for member in [a, b, c] {
                batch.append_ref(&collection, &member, None)?;
            }
            Ok(())
        })
        .unwrap();
    store
        .commit(None, |batch| {
            assert!(batch.remove_ref(&collection, &b)?);
            batch.append_ref(&collection, &b, None)
        })
        .unwrap();
    store
        .commit(None, |batch| batch.remove_ref(&collection, &a))
        .unwrap();
    store
        .commit(None, |batch| batch.append_ref(&collection, &a, None))
        .unwrap();

    assert_list_integrity(&store, &collection, v(1), &[a, b, c]);
    assert_list_integrity(&store, &collection, v(2), &[a, c, b]);
    assert_list_integrity(&store, &collection, v(3), &[c, b]);
    assert_list_integrity(&store, &collection, v(4), &[c, b, a]);
}

#[test]
fn test_alias_resolves_while_member_is_linked() {
    let store = memory_store();
    let collection = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    store
        .commit(None, |batch| batch.append_ref(&collection, &a, Some("primary")))
        .unwrap();
    assert_eq!(store.resolve_alias(v(1), &collection, "primary").unwrap(), Some(a));

    let err = store
        .commit(None, |batch| batch.append_ref(&collection, &b, Some("primary")))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert_eq!(store.version().unwrap(), v(1));
    assert!(store.refs().load_ref(None, &collection, Version::MAX, &b).unwrap().is_none());

    store
        .commit(None, |batch| batch.remove_ref(&collection, &a))
        .unwrap();
    assert!(store.resolve_alias(v(2), &collection, "primary").unwrap().is_none());
    assert_eq!(store.resolve_alias(v(1), &collection, "primary").unwrap(), Some(a));

    store
        .commit(None, |batch| batch.append_ref(&collection, &b, Some("primary")))
        .unwrap();
    assert_eq!(store.resolve_alias(v(3), &collection, "primary").unwrap(), Some(b));
    assert_list_integrity(&store, &collection, v(3), &[b]);
}

//! Universally quantified invariants and idempotence/boundary properties,
//! checked over small hand-built trees rather than via a fuzzer.

use std::sync::atomic::{AtomicUsize, Ordering};

use treealloc::{AllocError, Context, Event, Name, NotifierInfo};

/// Every live non-sentinel node appears exactly once in its parent's child
/// list, reachable via `first`/`next`.
#[test]
fn every_node_reachable_exactly_once_from_its_parent() {
    let ctx = Context::new();
    let root = ctx.alloc(None, 8, false, None).unwrap();
    let children: Vec<_> = (0..5)
        .map(|_| ctx.alloc(Some(root), 8, false, None).unwrap())
        .collect();

    for &c in &children {
        assert_eq!(ctx.parent(c), Some(root));
    }

    let mut seen = Vec::new();
    let mut cur = ctx.first(Some(root));
    while let Some(node) = cur {
        seen.push(node);
        cur = ctx.next(Some(root), node);
    }

    seen.sort_by_key(|n| n.as_ptr() as usize);
    let mut expected = children.clone();
    expected.sort_by_key(|n| n.as_ptr() as usize);
    assert_eq!(seen, expected);

    ctx.free(Some(root));
}

/// NAME/CHILDREN/LENGTH appear at most once; replacing a name never leaves
/// two NAME properties behind.
#[test]
fn name_replacement_does_not_duplicate_property() {
    let ctx = Context::new();
    let n = ctx.alloc(None, 8, false, None).unwrap();

    for i in 0..5 {
        let owned = format!("name-{i}");
        ctx.set_name(n, Name::Owned(&owned)).unwrap();
        assert_eq!(ctx.name(n), Some(owned.as_str()));
    }

    ctx.free(Some(n));
}

/// Freeing a subtree touches only that subtree; a sibling subtree under
/// the same root survives untouched.
#[test]
fn free_touches_only_its_own_subtree() {
    let ctx = Context::new();
    let root = ctx.alloc(None, 8, false, None).unwrap();
    let left = ctx.alloc(Some(root), 8, false, None).unwrap();
    let right = ctx.alloc(Some(root), 8, false, None).unwrap();
    let left_child = ctx.alloc(Some(left), 8, false, None).unwrap();

    ctx.free(Some(left));

    assert_eq!(ctx.parent(right), Some(root));
    assert_eq!(ctx.first(Some(root)), Some(right));
    // `left` and `left_child` are gone from the tree; only `right` remains.
    assert_eq!(ctx.next(Some(root), right), None);
    let _ = left_child;

    ctx.free(Some(root));
}

/// `first`/`next` visits each descendant exactly once in depth-first
/// pre-order and terminates.
#[test]
fn traversal_is_depth_first_preorder_and_terminates() {
    let ctx = Context::new();
    let root = ctx.alloc(None, 8, false, None).unwrap();
    let a = ctx.alloc(Some(root), 8, false, None).unwrap();
    let b = ctx.alloc(Some(root), 8, false, None).unwrap();
    let a1 = ctx.alloc(Some(a), 8, false, None).unwrap();

    // child insertion order is most-recently-added-first: under `root`,
    // `b` was added after `a`, so `b` is visited first.
    let mut order = Vec::new();
    let mut cur = ctx.first(Some(root));
    let mut steps = 0;
    while let Some(node) = cur {
        order.push(node);
        cur = ctx.next(Some(root), node);
        steps += 1;
        assert!(steps <= 10, "traversal did not terminate");
    }

    assert_eq!(order, vec![b, a, a1]);
    ctx.free(Some(root));
}

/// Idempotence: `steal(parent(x), x)` is a no-op on tree shape, observable
/// only as one STEAL event.
static STEAL_NOOP_COUNT: AtomicUsize = AtomicUsize::new(0);

fn on_steal(_payload: &mut [u8], event: Event, _info: NotifierInfo) {
    if event == Event::STEAL {
        STEAL_NOOP_COUNT.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn steal_to_current_parent_is_a_noop() {
    let ctx = Context::new();
    let p = ctx.alloc(None, 8, false, None).unwrap();
    let x = ctx.alloc(Some(p), 8, false, None).unwrap();
    ctx.add_notifier(x, Event::STEAL, on_steal).unwrap();

    ctx.steal(ctx.parent(x), x).unwrap();

    assert_eq!(ctx.parent(x), Some(p));
    assert_eq!(ctx.first(Some(p)), Some(x));
    assert_eq!(STEAL_NOOP_COUNT.load(Ordering::SeqCst), 1);

    ctx.free(Some(p));
}

/// Idempotence: `del_notifier` after `add_notifier` returns true and the
/// context's notifier bookkeeping returns to its pre-add state (observable
/// via a second del_notifier call finding nothing left to remove).
fn noop_notifier(_payload: &mut [u8], _event: Event, _info: NotifierInfo) {}

#[test]
fn del_notifier_reverses_add_notifier() {
    let ctx = Context::new();
    let n = ctx.alloc(None, 8, false, None).unwrap();

    assert!(ctx.add_notifier(n, Event::RENAME, noop_notifier).is_ok());
    assert!(ctx.del_notifier(n, noop_notifier));
    assert!(!ctx.del_notifier(n, noop_notifier));

    ctx.free(Some(n));
}

/// Boundary: `free(None)` is a safe no-op.
#[test]
fn free_none_is_a_noop() {
    let ctx = Context::new();
    ctx.free(None);
}

/// Boundary: an element-count multiplication overflow fails cleanly
/// without touching the parent.
#[test]
fn alloc_array_overflow_fails_cleanly() {
    let ctx = Context::new();
    let parent = ctx.alloc(None, 8, false, None).unwrap();

    let result = ctx.alloc_array(Some(parent), usize::MAX, 2, false, false, None);
    assert!(matches!(result, Err(AllocError::Overflow(_))));
    assert_eq!(ctx.first(Some(parent)), None);

    ctx.free(Some(parent));
}

/// Boundary: `expand`'s additive overflow (old count + added count) fails
/// cleanly, leaving the node's recorded count untouched.
#[test]
fn expand_overflow_fails_cleanly() {
    let ctx = Context::new();
    let mut x = ctx.alloc_array(None, 1, 4, false, true, None).unwrap();

    let result = ctx.expand(&mut x, &[], 1, usize::MAX);
    assert!(matches!(result, Err(AllocError::Overflow(_))));
    assert_eq!(ctx.count(x), 4);

    ctx.free(Some(x));
}

/// Boundary: a destructor that frees a sibling during its own node's
/// teardown must not corrupt the parent's child list.
static SIBLING_FREED: AtomicUsize = AtomicUsize::new(0);
static SIBLING_CTX_ADDR: AtomicUsize = AtomicUsize::new(0);
static SIBLING_NODE_ADDR: AtomicUsize = AtomicUsize::new(0);

fn free_sibling_destructor(_payload: &mut [u8]) {
    let ctx_addr = SIBLING_CTX_ADDR.load(Ordering::SeqCst);
    let node_addr = SIBLING_NODE_ADDR.load(Ordering::SeqCst);
    let ctx = unsafe { &*(ctx_addr as *const Context) };
    let sibling = std::ptr::NonNull::new(node_addr as *mut u8).unwrap();
    ctx.free(Some(sibling));
    SIBLING_FREED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn freeing_a_sibling_during_teardown_does_not_corrupt_the_list() {
    let ctx = Context::new();
    let root = ctx.alloc(None, 8, false, None).unwrap();
    // insertion order: victim, bystander, trigger. Children are torn down
    // most-recently-added-first, so `trigger` (and its destructor) runs
    // while `victim` and `bystander` are both still pending.
    let victim = ctx.alloc(Some(root), 8, false, None).unwrap();
    let bystander = ctx.alloc(Some(root), 8, false, None).unwrap();
    let trigger = ctx.alloc(Some(root), 8, false, None).unwrap();

    SIBLING_CTX_ADDR.store(&ctx as *const Context as usize, Ordering::SeqCst);
    SIBLING_NODE_ADDR.store(victim.as_ptr() as usize, Ordering::SeqCst);
    ctx.add_destructor(trigger, free_sibling_destructor).unwrap();

    ctx.free(Some(root));

    assert_eq!(SIBLING_FREED.load(Ordering::SeqCst), 1);
    let _ = bystander;
}

//! Chain behavior under add, remove, ignore, and relation queries.

use std::collections::BTreeSet;

use atelier_chain::{DependencyChain, Priority};

fn set<const N: usize>(items: [&'static str; N]) -> BTreeSet<&'static str> {
    items.into_iter().collect()
}

#[test]
fn linear_and_diamond_priorities() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["b"]).unwrap();
    chain.add("d", ["a", "c"]).unwrap();

    assert_eq!(chain.priority_of(&"a"), Some(Priority::Level(0)));
    assert_eq!(chain.priority_of(&"b"), Some(Priority::Level(1)));
    assert_eq!(chain.priority_of(&"c"), Some(Priority::Level(2)));
    assert_eq!(chain.priority_of(&"d"), Some(Priority::Level(3)));
    assert_eq!(chain.get_level(2).unwrap(), set(["c"]));
    assert!(chain.invalid_items().is_empty());
    assert_eq!(chain.levels(), 4);
}

#[test]
fn cycle_is_detected() {
    let mut chain = DependencyChain::new();
    chain.add("a", ["c"]).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["b"]).unwrap();

    assert_eq!(chain.invalid_items(), set(["a", "b", "c"]));
    assert!(!chain.cyclic_items().is_empty() || !chain.error_dep_items().is_empty());
}

#[test]
fn partial_cycle_leaves_the_rest_intact() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["b"]).unwrap();
    chain.add("d", ["c"]).unwrap();
    chain.add("e", ["d", "g"]).unwrap();
    chain.add("f", ["e"]).unwrap();
    chain.add("g", ["f"]).unwrap();

    assert_eq!(chain.invalid_items(), set(["e", "f", "g"]));
    assert_eq!(chain.priority_of(&"d"), Some(Priority::Level(3)));
}

#[test]
fn ignore_bypasses_but_preserves_order() {
    let mut chain = DependencyChain::new();
    chain.add("a1", []).unwrap();
    chain.add("a2", []).unwrap();
    chain.add("b1", ["a1", "a2"]).unwrap();
    chain.add("c1", ["b1", "a1"]).unwrap();
    chain.add("c2", ["b1", "a2"]).unwrap();

    chain.ignore(&"b1").unwrap();

    assert_eq!(chain.get_level(0).unwrap(), set(["a1", "a2"]));
    assert_eq!(chain.get_level(-1).unwrap(), set(["c1", "c2"]));
    assert_eq!(chain.sup_of(&"c1", false).unwrap(), set(["a1", "a2"]));
    assert!(!chain.contains(&"b1"));
}

#[test]
fn remove_relevels_successors() {
    let mut chain = DependencyChain::new();
    chain.add("a1", []).unwrap();
    chain.add("b1", ["a1"]).unwrap();
    chain.add("b2", ["a1"]).unwrap();
    chain.add("c1", ["b1"]).unwrap();
    chain.add("c2", ["b2"]).unwrap();
    chain.add("d1", ["a1", "c1"]).unwrap();

    chain.remove(&"a1").unwrap();

    assert_eq!(chain.priority_of(&"b1"), Some(Priority::Level(0)));
    assert_eq!(chain.priority_of(&"b2"), Some(Priority::Level(0)));
    assert_eq!(chain.priority_of(&"c1"), Some(Priority::Level(1)));
    assert_eq!(chain.priority_of(&"d1"), Some(Priority::Level(2)));
    assert!(!chain.contains(&"a1"));
}

#[test]
fn add_then_remove_restores_priorities() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["b"]).unwrap();
    let before: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|k| (k, chain.priority_of(k)))
        .collect();
    let levels = chain.levels();

    chain.add("d", ["c", "a"]).unwrap();
    chain.remove(&"d").unwrap();

    let after: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|k| (k, chain.priority_of(k)))
        .collect();
    assert_eq!(before, after);
    assert_eq!(chain.levels(), levels);
}

#[test]
fn removing_last_edge_makes_items_independent() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();

    chain.remove(&"a").unwrap();

    assert_eq!(chain.priority_of(&"b"), Some(Priority::Independent));
    assert_eq!(chain.levels(), 0);
}

#[test]
fn deep_relations() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["b"]).unwrap();
    chain.add("x", []).unwrap();
    chain.add("d", ["c", "x"]).unwrap();

    assert_eq!(chain.sub_of(&"a", false, false).unwrap(), set(["b"]));
    assert_eq!(
        chain.sub_of(&"a", true, false).unwrap(),
        set(["b", "c", "d"])
    );
    // With opt_dep, the co-required `x` is pulled in as well.
    assert_eq!(
        chain.sub_of(&"a", true, true).unwrap(),
        set(["b", "c", "d", "x"])
    );
    assert_eq!(chain.sup_of(&"d", true).unwrap(), set(["a", "b", "c", "x"]));
}

#[test]
fn mirror_consistency() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("c", ["a", "b"]).unwrap();

    for item in ["a", "b", "c"] {
        for succ in chain.sub_of(&item, false, false).unwrap() {
            assert!(chain.sup_of(&succ, false).unwrap().contains(&item));
        }
        for pred in chain.sup_of(&item, false).unwrap() {
            assert!(chain.sub_of(&pred, false, false).unwrap().contains(&item));
        }
    }
}

#[test]
fn sub_chain_is_closed() {
    let mut chain = DependencyChain::new();
    chain.add("a", []).unwrap();
    chain.add("b", ["a"]).unwrap();
    chain.add("x", []).unwrap();
    chain.add("c", ["b", "x"]).unwrap();
    chain.add("unrelated", []).unwrap();

    let sub = chain.sub_chain(["a"]).unwrap();

    assert!(sub.contains(&"a"));
    assert!(sub.contains(&"b"));
    assert!(sub.contains(&"c"));
    assert!(sub.contains(&"x"));
    assert!(!sub.contains(&"unrelated"));
    // Closure: every relation of every member is itself a member.
    let members: Vec<_> = sub.iter().cloned().collect();
    for item in members {
        for other in sub.related_of(&item, true, true).unwrap() {
            assert!(sub.contains(&other), "{other:?} escaped the sub-chain");
        }
    }
    assert_eq!(sub.priority_of(&"c"), Some(Priority::Level(2)));
}

#[test]
fn invalid_dependency_propagates() {
    let mut chain = DependencyChain::new();
    chain.add("a", ["ghost"]).unwrap();
    chain.add("b", ["a"]).unwrap();

    assert_eq!(chain.priority_of(&"ghost"), Some(Priority::NotFound));
    assert_eq!(chain.priority_of(&"a"), Some(Priority::Invalid));
    assert_eq!(chain.priority_of(&"b"), Some(Priority::Invalid));
    assert_eq!(chain.invalid_items(), set(["a", "b", "ghost"]));
    assert_eq!(chain.dependent_items(), set([]));
}

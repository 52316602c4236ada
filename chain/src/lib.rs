//! A partial order over named items, annotated with scheduling levels.
//!
//! Items are added together with the set of items they come `after`. The chain
//! maintains, for every item, its immediate predecessors (`sup`), immediate
//! successors (`sub`), and a [`Priority`]: either a level index (level 0 holds
//! the items with no unresolved in-chain predecessors) or one of the sentinel
//! states tracking items that are edge-free, depend on something missing or
//! broken, or participate in a cycle.
//!
//! # Examples
//!
//! ```
//! use atelier_chain::{DependencyChain, Priority};
//!
//! let mut chain = DependencyChain::new();
//! chain.add("a", []).unwrap();
//! chain.add("b", ["a"]).unwrap();
//! chain.add("c", ["b"]).unwrap();
//! chain.add("d", ["a", "c"]).unwrap();
//!
//! assert_eq!(chain.priority_of(&"d"), Some(Priority::Level(3)));
//! assert_eq!(chain.levels(), 4);
//! assert!(chain.invalid_items().is_empty());
//! ```

#![forbid(missing_docs)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

/// Types usable as chain items: cheap to clone, hashable, totally ordered.
pub trait Item: Clone + Eq + Ord + Hash + fmt::Debug {}
impl<T: Clone + Eq + Ord + Hash + fmt::Debug> Item for T {}

/// Scheduling state of a single chain item.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Level index; level 0 has no unresolved in-chain predecessors.
    Level(u64),
    /// No edges at all.
    Independent,
    /// Depends on an invalid or missing item.
    Invalid,
    /// Participates in a dependency cycle.
    Cyclic,
    /// Declared as a predecessor but never added.
    NotFound,
}

impl Priority {
    /// Raises a level to at least `floor`, converting any sentinel to a level.
    fn lift(self, floor: u64) -> Priority {
        match self {
            Priority::Level(k) => Priority::Level(k.max(floor)),
            _ => Priority::Level(floor),
        }
    }

    /// True for the three error states (invalid, cyclic, not-found).
    pub fn is_invalid(self) -> bool {
        matches!(
            self,
            Priority::Invalid | Priority::Cyclic | Priority::NotFound
        )
    }
}

/// Errors surfaced by chain mutation and queries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError<K: fmt::Debug> {
    /// The item is already present and not rewritable.
    #[error("item {0:?} already exists")]
    Duplicate(K),
    /// An item may not come after itself.
    #[error("item {0:?} cannot depend on itself")]
    SelfDependency(K),
    /// The item was never added to the chain.
    #[error("item {0:?} not found")]
    UnknownItem(K),
    /// A level index outside `[-levels, levels)`.
    #[error("level index {index} out of range for {levels} level(s)")]
    LevelOutOfRange {
        /// The requested index.
        index: i64,
        /// The number of levels in the chain.
        levels: u64,
    },
}

/// Partial-order data structure over named items.
///
/// Mirror consistency is maintained at all times: `b` appears in `sub_of(a)`
/// exactly when `a` appears in `sup_of(b)`. Items referenced as predecessors
/// before being added are held in the [`Priority::NotFound`] state and heal
/// when the real item arrives; adding the missing item may also reveal a
/// cycle, which marks the closing item [`Priority::Cyclic`].
#[derive(Clone, Debug, Default)]
pub struct DependencyChain<K: Item> {
    priority: HashMap<K, Priority>,
    sup: HashMap<K, BTreeSet<K>>,
    sub: HashMap<K, BTreeSet<K>>,
    levels: u64,
}

impl<K: Item> DependencyChain<K> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        DependencyChain {
            priority: HashMap::new(),
            sup: HashMap::new(),
            sub: HashMap::new(),
            levels: 0,
        }
    }

    /// Adds `item` so that it comes after every item in `after`.
    ///
    /// Re-adding is permitted only when the prior state was [`Priority::Cyclic`]
    /// or [`Priority::NotFound`]; both are placeholders that a later add is
    /// expected to rewrite (closing a cycle necessarily re-adds an item that
    /// was only ever forward-declared).
    pub fn add<I>(&mut self, item: K, after: I) -> Result<(), ChainError<K>>
    where
        I: IntoIterator<Item = K>,
    {
        match self.priority.get(&item) {
            None | Some(Priority::Cyclic) | Some(Priority::NotFound) => {}
            Some(_) => return Err(ChainError::Duplicate(item)),
        }
        let after: BTreeSet<K> = after.into_iter().collect();
        if after.contains(&item) {
            return Err(ChainError::SelfDependency(item));
        }

        // A rewrite replaces the previous predecessor edges wholesale.
        if let Some(old) = self.sup.insert(item.clone(), after.clone()) {
            for p in old {
                if let Some(set) = self.sub.get_mut(&p) {
                    set.remove(&item);
                }
            }
        }
        self.sub.entry(item.clone()).or_default();
        for p in &after {
            self.sub.entry(p.clone()).or_default().insert(item.clone());
        }

        // A forward-declared item keeps its not-found marker as the entering
        // priority so that closing a cycle is observable as such.
        let entering = match self.priority.get(&item) {
            Some(Priority::NotFound) => Priority::NotFound,
            _ => Priority::Level(0),
        };
        self.priority.insert(item.clone(), entering);
        self.add_refresh(&item);
        Ok(())
    }

    /// Removes `item` along with all of its incident edges.
    ///
    /// Successors are re-levelled from their surviving predecessors; items
    /// left with no edges at all become independent.
    pub fn remove(&mut self, item: &K) -> Result<(), ChainError<K>> {
        let priority = *self
            .priority
            .get(item)
            .ok_or_else(|| ChainError::UnknownItem(item.clone()))?;
        self.remove_refresh(item, priority);
        self.remove_and_adjust(item);
        Ok(())
    }

    /// Removes `item` but re-parents: every successor inherits the removed
    /// item's predecessors, preserving the transitive closure.
    pub fn ignore(&mut self, item: &K) -> Result<(), ChainError<K>> {
        let priority = *self
            .priority
            .get(item)
            .ok_or_else(|| ChainError::UnknownItem(item.clone()))?;
        if priority != Priority::Independent {
            let preds: Vec<K> = self.sup.get(item).into_iter().flatten().cloned().collect();
            let succs: Vec<K> = self.sub.get(item).into_iter().flatten().cloned().collect();
            for p in &preds {
                for b in &succs {
                    self.sup.entry(b.clone()).or_default().insert(p.clone());
                    self.sub.entry(p.clone()).or_default().insert(b.clone());
                }
            }
            self.remove_refresh(item, priority);
        }
        self.remove_and_adjust(item);
        Ok(())
    }

    /// The successors of `item`: immediate when `deep` is false, otherwise the
    /// transitive closure. With `opt_dep` the closure additionally includes
    /// every *other* predecessor of each reached successor (the items
    /// co-required by anything `item` transitively enables), excluding `item`.
    pub fn sub_of(
        &self,
        item: &K,
        deep: bool,
        opt_dep: bool,
    ) -> Result<BTreeSet<K>, ChainError<K>> {
        let base = self
            .sub
            .get(item)
            .ok_or_else(|| ChainError::UnknownItem(item.clone()))?;
        if !deep {
            return Ok(base.clone());
        }
        let mut res: BTreeSet<K> = BTreeSet::new();
        let mut visited: BTreeSet<K> = BTreeSet::new();
        let mut group: Vec<K> = vec![item.clone()];
        while let Some(t) = group.pop() {
            if !visited.insert(t.clone()) {
                continue;
            }
            let sub_set = self.sub.get(&t).cloned().unwrap_or_default();
            for b in &sub_set {
                if !res.contains(b) {
                    group.push(b.clone());
                    if opt_dep {
                        for p in self.sup.get(b).into_iter().flatten() {
                            if p == item {
                                continue;
                            }
                            res.insert(p.clone());
                            // Everything the co-required item itself requires.
                            let mut up: Vec<K> = vec![p.clone()];
                            while let Some(pt) = up.pop() {
                                for sp in self.sup.get(&pt).into_iter().flatten() {
                                    if sp != item && res.insert(sp.clone()) {
                                        up.push(sp.clone());
                                    }
                                }
                            }
                        }
                        group.extend(self.sup.get(b).into_iter().flatten().cloned());
                    }
                }
            }
            res.extend(sub_set);
        }
        res.remove(item);
        Ok(res)
    }

    /// The predecessors of `item`, immediate or transitive.
    pub fn sup_of(&self, item: &K, deep: bool) -> Result<BTreeSet<K>, ChainError<K>> {
        let base = self
            .sup
            .get(item)
            .ok_or_else(|| ChainError::UnknownItem(item.clone()))?;
        if !deep {
            return Ok(base.clone());
        }
        let mut res: BTreeSet<K> = BTreeSet::new();
        let mut group: Vec<K> = vec![item.clone()];
        while let Some(t) = group.pop() {
            for s in self.sup.get(&t).into_iter().flatten() {
                if res.insert(s.clone()) {
                    group.push(s.clone());
                }
            }
        }
        Ok(res)
    }

    /// Union of [`sub_of`](Self::sub_of) and [`sup_of`](Self::sup_of).
    pub fn related_of(
        &self,
        item: &K,
        deep: bool,
        opt_dep: bool,
    ) -> Result<BTreeSet<K>, ChainError<K>> {
        let mut res = self.sub_of(item, deep, opt_dep)?;
        res.extend(self.sup_of(item, deep)?);
        Ok(res)
    }

    /// Builds a new chain from `items`, each taken together with everything it
    /// is related to (deep, including co-required predecessors), with the
    /// original predecessor edges preserved.
    pub fn sub_chain<I>(&self, items: I) -> Result<DependencyChain<K>, ChainError<K>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut item_set: BTreeSet<K> = BTreeSet::new();
        for item in items {
            item_set.extend(self.related_of(&item, true, true)?);
            item_set.insert(item);
        }
        let mut res = DependencyChain::new();
        for item in &item_set {
            let after = self.sup.get(item).cloned().unwrap_or_default();
            res.add(item.clone(), after)?;
        }
        Ok(res)
    }

    /// The set of items at level `index`; negative indexes count from the top.
    pub fn get_level(&self, index: i64) -> Result<BTreeSet<K>, ChainError<K>> {
        let levels = self.levels as i64;
        if index >= levels || index < -levels {
            return Err(ChainError::LevelOutOfRange {
                index,
                levels: self.levels,
            });
        }
        let index = if index < 0 { levels + index } else { index } as u64;
        Ok(self.collect_state(Priority::Level(index)))
    }

    /// Number of levels: one past the highest level index, zero when no item
    /// holds a level.
    pub fn levels(&self) -> u64 {
        self.levels
    }

    /// Iterates the level sets from level 0 upward.
    pub fn level_items(&self) -> impl Iterator<Item = BTreeSet<K>> + '_ {
        (0..self.levels).map(|i| self.collect_state(Priority::Level(i)))
    }

    /// The priority currently assigned to `item`, if present.
    pub fn priority_of(&self, item: &K) -> Option<Priority> {
        self.priority.get(item).copied()
    }

    /// Number of items tracked by the chain, including forward declarations.
    pub fn len(&self) -> usize {
        self.priority.len()
    }

    /// True when no item has been added or referenced.
    pub fn is_empty(&self) -> bool {
        self.priority.is_empty()
    }

    /// Whether `item` is tracked (added or forward-declared).
    pub fn contains(&self, item: &K) -> bool {
        self.priority.contains_key(item)
    }

    /// Iterates all tracked items.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.priority.keys()
    }

    /// Items with no edges at all.
    pub fn independent_items(&self) -> BTreeSet<K> {
        self.collect_state(Priority::Independent)
    }

    /// Items participating in a cycle.
    pub fn cyclic_items(&self) -> BTreeSet<K> {
        self.collect_state(Priority::Cyclic)
    }

    /// Items referenced as predecessors but never added.
    pub fn not_found_items(&self) -> BTreeSet<K> {
        self.collect_state(Priority::NotFound)
    }

    /// Items depending on an invalid or missing item.
    pub fn error_dep_items(&self) -> BTreeSet<K> {
        self.collect_state(Priority::Invalid)
    }

    /// Union of the three error categories.
    pub fn invalid_items(&self) -> BTreeSet<K> {
        self.priority
            .iter()
            .filter(|(_, p)| p.is_invalid())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Items with at least one edge that are not in an error state.
    pub fn dependent_items(&self) -> BTreeSet<K> {
        self.priority
            .iter()
            .filter(|(_, p)| matches!(p, Priority::Level(_)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn collect_state(&self, state: Priority) -> BTreeSet<K> {
        self.priority
            .iter()
            .filter(|(_, p)| **p == state)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Recomputes the priority of `item` from its predecessors, then revisits
    /// its successors. Error states return early without descending, so the
    /// recursion only walks acyclic territory.
    fn add_refresh(&mut self, item: &K) {
        let sup_empty = self.sup.get(item).is_none_or(|s| s.is_empty());
        let sub_empty = self.sub.get(item).is_none_or(|s| s.is_empty());
        if sup_empty && sub_empty {
            self.priority.insert(item.clone(), Priority::Independent);
            return;
        }

        let mut priority = self.priority[item];
        let preds: Vec<K> = self.sup.get(item).into_iter().flatten().cloned().collect();
        for p in preds {
            match self.priority.get(&p).copied() {
                None | Some(Priority::NotFound) => {
                    self.priority.insert(p, Priority::NotFound);
                    if !matches!(priority, Priority::Invalid | Priority::Cyclic) {
                        self.priority.insert(item.clone(), Priority::Invalid);
                    }
                    return;
                }
                Some(Priority::Invalid) | Some(Priority::Cyclic) => {
                    // Arriving here as a not-found marker means the missing
                    // link was this very item: the chain closed on itself.
                    let state = if priority == Priority::NotFound {
                        Priority::Cyclic
                    } else {
                        Priority::Invalid
                    };
                    self.priority.insert(item.clone(), state);
                    return;
                }
                Some(Priority::Independent) => {
                    // An item something comes after is promoted to level 0.
                    self.priority.insert(p, Priority::Level(0));
                    priority = priority.lift(1);
                }
                Some(Priority::Level(k)) => {
                    priority = priority.lift(k + 1);
                }
            }
        }
        // A surviving sentinel means no predecessor lifted us: level 0.
        let priority = match priority {
            Priority::Level(_) => priority,
            _ => Priority::Level(0),
        };
        self.priority.insert(item.clone(), priority);
        if let Priority::Level(k) = priority {
            self.levels = self.levels.max(k + 1);
        }
        let succs: Vec<K> = self.sub.get(item).into_iter().flatten().cloned().collect();
        for b in succs {
            self.add_refresh(&b);
        }
    }

    /// Re-levels the transitive successors of `removed` as if it were gone,
    /// propagating with a worklist: a successor whose priority changed pushes
    /// its own successors. Predecessors in an invalid state keep the
    /// successor invalid; sentinel predecessors contribute nothing to the
    /// level. Since cycles never hold level values, the worklist terminates.
    fn remove_refresh(&mut self, removed: &K, priority: Priority) {
        if priority == Priority::Independent {
            return;
        }
        let mut queue: VecDeque<K> = self
            .sub
            .get(removed)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        while let Some(b) = queue.pop_front() {
            let mut invalid = false;
            let mut level = 0u64;
            for bp in self.sup.get(&b).into_iter().flatten() {
                if bp == removed {
                    continue;
                }
                match self.priority.get(bp).copied() {
                    Some(Priority::Invalid) => invalid = true,
                    Some(Priority::Level(k)) => level = level.max(k + 1),
                    _ => {}
                }
            }
            let next = if invalid {
                Priority::Invalid
            } else if level == 0 && self.sub.get(&b).is_none_or(|s| s.is_empty()) {
                Priority::Independent
            } else {
                Priority::Level(level)
            };
            if self.priority.insert(b.clone(), next) != Some(next) {
                queue.extend(self.sub.get(&b).into_iter().flatten().cloned());
            }
        }
    }

    /// Drops `item` and its incident edges, reduces newly edge-free items to
    /// independent, and recomputes the level count.
    fn remove_and_adjust(&mut self, item: &K) {
        self.priority.remove(item);
        self.sup.remove(item);
        self.sub.remove(item);
        let remaining: Vec<K> = self.priority.keys().cloned().collect();
        for elem in remaining {
            let sup_empty = match self.sup.get_mut(&elem) {
                Some(set) => {
                    set.remove(item);
                    set.is_empty()
                }
                None => true,
            };
            let sub_empty = match self.sub.get_mut(&elem) {
                Some(set) => {
                    set.remove(item);
                    set.is_empty()
                }
                None => true,
            };
            if sup_empty && sub_empty {
                self.priority.insert(elem, Priority::Independent);
            }
        }
        let mut levels = 0;
        for priority in self.priority.values() {
            if let Priority::Level(k) = priority {
                levels = levels.max(k + 1);
            }
        }
        self.levels = levels;
    }
}

impl<K: Item> fmt::Display for DependencyChain<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (i, level) in self.level_items().enumerate() {
            parts.push(format!("{}={:?}", i, level));
        }
        let independent = self.independent_items();
        if !independent.is_empty() {
            parts.push(format!("independent={:?}", independent));
        }
        let invalid = self.invalid_items();
        if !invalid.is_empty() {
            parts.push(format!("invalid={:?}", invalid));
        }
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_independent_on_reference() {
        let mut chain = DependencyChain::new();
        chain.add("a", []).unwrap();
        assert_eq!(chain.priority_of(&"a"), Some(Priority::Independent));
        chain.add("b", ["a"]).unwrap();
        assert_eq!(chain.priority_of(&"a"), Some(Priority::Level(0)));
        assert_eq!(chain.priority_of(&"b"), Some(Priority::Level(1)));
    }

    #[test]
    fn forward_reference_heals() {
        let mut chain = DependencyChain::new();
        chain.add("b", ["c"]).unwrap();
        assert_eq!(chain.priority_of(&"c"), Some(Priority::NotFound));
        assert_eq!(chain.priority_of(&"b"), Some(Priority::Invalid));
        chain.add("c", []).unwrap();
        assert_eq!(chain.priority_of(&"c"), Some(Priority::Level(0)));
        assert_eq!(chain.priority_of(&"b"), Some(Priority::Level(1)));
        assert!(chain.invalid_items().is_empty());
    }

    #[test]
    fn self_dependency_rejected() {
        let mut chain = DependencyChain::new();
        assert_eq!(
            chain.add("a", ["a"]),
            Err(ChainError::SelfDependency("a"))
        );
    }

    #[test]
    fn duplicate_rejected() {
        let mut chain = DependencyChain::new();
        chain.add("a", []).unwrap();
        assert_eq!(chain.add("a", []), Err(ChainError::Duplicate("a")));
    }

    #[test]
    fn level_index_bounds() {
        let mut chain = DependencyChain::new();
        chain.add("a", []).unwrap();
        chain.add("b", ["a"]).unwrap();
        assert_eq!(chain.get_level(0).unwrap(), BTreeSet::from(["a"]));
        assert_eq!(chain.get_level(-1).unwrap(), BTreeSet::from(["b"]));
        assert!(chain.get_level(2).is_err());
        assert!(chain.get_level(-3).is_err());
    }
}

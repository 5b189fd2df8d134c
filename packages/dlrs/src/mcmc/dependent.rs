//! Incremental recomputation for Metropolis-Hastings sampling.
//!
//! Every stateful node of a model declares a fixed list of parent nodes. After one or more source parameters are
//! perturbed, the [`DependencyGraph`] visits nodes in a topological order computed once at construction, asks every
//! node with at least one changed parent to snapshot and update itself, and later tells exactly those nodes to either
//! drop their snapshot (proposal accepted) or reinstate it (proposal rejected).

use crate::{make_internal_error, make_internal_report};
use eyre::Report;
use itertools::Itertools;
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Describes what a node changed during its last update, as seen by its children.
///
/// An absent descriptor means "unchanged". `Partial` lists the affected elements in the index space of the node that
/// produced it (guest vertices for branch lengths, host arcs for times and discretisation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeInfo {
  Full,
  Partial(BTreeSet<usize>),
}

impl ChangeInfo {
  pub fn partial(affected: impl IntoIterator<Item = usize>) -> Self {
    Self::Partial(affected.into_iter().collect())
  }

  pub const fn is_full(&self) -> bool {
    matches!(self, Self::Full)
  }

  pub const fn affected(&self) -> Option<&BTreeSet<usize>> {
    match self {
      Self::Full => None,
      Self::Partial(affected) => Some(affected),
    }
  }

  /// Combines two descriptors of the same node. Anything merged with `Full` is `Full`.
  #[must_use]
  pub fn union(self, other: Self) -> Self {
    match (self, other) {
      (Self::Partial(mut left), Self::Partial(right)) => {
        left.extend(right);
        Self::Partial(left)
      }
      _ => Self::Full,
    }
  }
}

pub type ChangeInfos<K> = BTreeMap<K, ChangeInfo>;

/// Read-only view of a parent node together with its change descriptor for the current update
#[derive(Debug)]
pub struct Parent<'a, T> {
  pub value: &'a T,
  pub change: Option<&'a ChangeInfo>,
}

impl<'a, T> Clone for Parent<'a, T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<'a, T> Copy for Parent<'a, T> {}

impl<'a, T> Parent<'a, T> {
  pub const fn new(value: &'a T, change: Option<&'a ChangeInfo>) -> Self {
    Self { value, change }
  }

  pub const fn is_changed(&self) -> bool {
    self.change.is_some()
  }

  /// Affected elements, if this parent changed only partially
  pub fn partial(&self) -> Option<&'a BTreeSet<usize>> {
    self.change.and_then(ChangeInfo::affected)
  }
}

/// A node whose state is derived from its parents.
///
/// Exactly one of `clear_cache` and `restore_cache` follows every `cache_and_update`. Restoring must reproduce the
/// state from before the update bit for bit.
pub trait ProperDependent {
  type Parents<'a>;

  /// Snapshots the state about to be overwritten, recomputes from the parents, and describes what changed
  fn cache_and_update(&mut self, parents: Self::Parents<'_>, will_sample: bool) -> Result<Option<ChangeInfo>, Report>;

  /// Drops the snapshot after an accepted proposal
  fn clear_cache(&mut self, will_sample: bool);

  /// Reinstates the snapshot after a rejected proposal
  fn restore_cache(&mut self, will_sample: bool);
}

/// A fixed collection of nodes addressed by key, driven by a [`DependencyGraph`]
pub trait DependentSet<K> {
  /// Change descriptors of source parameters perturbed since the last accept or reject
  fn source_changes(&self) -> ChangeInfos<K>;

  fn update_node(&mut self, key: K, changes: &ChangeInfos<K>, will_sample: bool) -> Result<Option<ChangeInfo>, Report>;

  fn clear_node(&mut self, key: K, will_sample: bool);

  fn restore_node(&mut self, key: K, will_sample: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VisitState {
  InProgress,
  Done,
}

/// Static dependency structure of a model and the bookkeeping of the proposal in flight
#[derive(Debug)]
pub struct DependencyGraph<K> {
  order: Vec<K>,
  parents: BTreeMap<K, Vec<K>>,
  pending: Option<Vec<K>>,
}

impl<K: Copy + Ord + Debug> DependencyGraph<K> {
  /// Builds the graph from `(node, parents)` declarations and sorts it so that parents precede children.
  /// Fails on duplicate nodes, undeclared parents and cycles.
  pub fn new(declarations: impl IntoIterator<Item = (K, Vec<K>)>) -> Result<Self, Report> {
    let mut keys = vec![];
    let mut parents = BTreeMap::new();
    for (key, key_parents) in declarations {
      if parents.insert(key, key_parents).is_some() {
        return make_internal_error!("Dependency graph: node {key:?} is declared more than once");
      }
      keys.push(key);
    }

    for (key, key_parents) in &parents {
      if let Some(unknown) = key_parents.iter().find(|p| !parents.contains_key(*p)) {
        return make_internal_error!("Dependency graph: node {key:?} depends on undeclared node {unknown:?}");
      }
    }

    let mut states = BTreeMap::new();
    let mut order = Vec::with_capacity(keys.len());
    for &key in &keys {
      Self::visit(key, &parents, &mut states, &mut order)?;
    }

    trace!("Dependency graph order: {}", order.iter().map(|k| format!("{k:?}")).join(" -> "));

    Ok(Self {
      order,
      parents,
      pending: None,
    })
  }

  fn visit(
    key: K,
    parents: &BTreeMap<K, Vec<K>>,
    states: &mut BTreeMap<K, VisitState>,
    order: &mut Vec<K>,
  ) -> Result<(), Report> {
    match states.get(&key) {
      Some(VisitState::Done) => return Ok(()),
      Some(VisitState::InProgress) => {
        return make_internal_error!("Dependency graph: cyclic dependency involving node {key:?}");
      }
      None => {}
    }
    states.insert(key, VisitState::InProgress);
    for &parent in &parents[&key] {
      Self::visit(parent, parents, states, order)?;
    }
    states.insert(key, VisitState::Done);
    order.push(key);
    Ok(())
  }

  /// Nodes in update order, sources first
  pub fn order(&self) -> &[K] {
    &self.order
  }

  pub fn parents_of(&self, key: K) -> &[K] {
    self.parents.get(&key).map_or(&[][..], Vec::as_slice)
  }

  pub const fn is_pending(&self) -> bool {
    self.pending.is_some()
  }

  /// Updates every node reachable from the perturbed sources, in topological order.
  ///
  /// Nodes with no changed parent are not visited. On failure the nodes touched so far stay pending, so the
  /// proposal can still be rejected.
  pub fn propagate<S: DependentSet<K>>(&mut self, set: &mut S, will_sample: bool) -> Result<ChangeInfos<K>, Report> {
    if self.pending.is_some() {
      return make_internal_error!(
        "Dependency graph: update requested while the previous proposal is neither accepted nor rejected"
      );
    }

    let mut changes = set.source_changes();
    if let Some(unknown) = changes.keys().find(|key| !self.parents.contains_key(*key)) {
      return make_internal_error!("Dependency graph: change reported for undeclared node {unknown:?}");
    }

    let mut updated = changes.keys().copied().collect_vec();
    for &key in &self.order {
      if changes.contains_key(&key) {
        continue;
      }
      if !self.parents[&key].iter().any(|parent| changes.contains_key(parent)) {
        continue;
      }

      updated.push(key);
      match set.update_node(key, &changes, will_sample) {
        Ok(Some(change)) => {
          trace!("Dependency graph: node {key:?} changed: {change:?}");
          changes.insert(key, change);
        }
        Ok(None) => {}
        Err(report) => {
          self.pending = Some(updated);
          return Err(report.wrap_err(format!("When updating node {key:?}")));
        }
      }
    }

    self.pending = Some(updated);
    Ok(changes)
  }

  /// Keeps the proposed state: every node touched by the last update drops its snapshot
  pub fn accept<S: DependentSet<K>>(&mut self, set: &mut S, will_sample: bool) -> Result<(), Report> {
    for key in self.take_pending("accept")? {
      set.clear_node(key, will_sample);
    }
    Ok(())
  }

  /// Discards the proposed state: every node touched by the last update reinstates its snapshot
  pub fn reject<S: DependentSet<K>>(&mut self, set: &mut S, will_sample: bool) -> Result<(), Report> {
    for key in self.take_pending("reject")?.into_iter().rev() {
      set.restore_node(key, will_sample);
    }
    Ok(())
  }

  fn take_pending(&mut self, action: &str) -> Result<Vec<K>, Report> {
    self
      .pending
      .take()
      .ok_or_else(|| make_internal_report!("Dependency graph: cannot {action} a proposal: no update is pending"))
  }
}

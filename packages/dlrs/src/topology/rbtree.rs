use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Rooted bifurcating tree over vertices `0..n`.
///
/// Every vertex has either zero or two children. Children are ordered by vertex index, the smaller one being the
/// left child.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RBTree {
  parents: Vec<Option<usize>>,
  children: Vec<Option<(usize, usize)>>,
  depths: Vec<usize>,
  postorder: Vec<usize>,
  root: usize,
  names: Vec<Option<String>>,
}

impl RBTree {
  /// Creates a tree from the parent of every vertex (`None` for the root)
  pub fn from_parents(parents: Vec<Option<usize>>) -> Result<Self, Report> {
    let n = parents.len();
    if n == 0 {
      return make_error!("Tree must contain at least one vertex");
    }

    let roots = parents.iter().positions(Option::is_none).collect_vec();
    let root = match roots.as_slice() {
      [root] => *root,
      [] => return make_error!("Tree has no root: every vertex has a parent"),
      _ => return make_error!("Tree must have exactly one root, but found {}: {roots:?}", roots.len()),
    };

    let mut child_lists = vec![vec![]; n];
    for (x, parent) in parents.iter().enumerate() {
      if let Some(p) = *parent {
        if p >= n {
          return make_error!("Parent {p} of vertex {x} is out of range: tree has {n} vertices");
        }
        if p == x {
          return make_error!("Vertex {x} is its own parent");
        }
        child_lists[p].push(x);
      }
    }

    let children = child_lists
      .iter()
      .enumerate()
      .map(|(x, cs)| match cs.as_slice() {
        [] => Ok(None),
        [lc, rc] => Ok(Some((*lc, *rc))),
        _ => make_error!(
          "Tree must be bifurcating, but vertex {x} has {} children: {cs:?}",
          cs.len()
        ),
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let mut depths = vec![0; n];
    let mut preorder = Vec::with_capacity(n);
    let mut stack = vec![root];
    while let Some(x) = stack.pop() {
      preorder.push(x);
      if let Some((lc, rc)) = children[x] {
        depths[lc] = depths[x] + 1;
        depths[rc] = depths[x] + 1;
        stack.push(rc);
        stack.push(lc);
      }
    }
    if preorder.len() != n {
      return make_error!(
        "Tree is not connected: only {} of {n} vertices are reachable from root {root}",
        preorder.len()
      );
    }

    let postorder = Self::compute_postorder(root, &children);

    Ok(Self {
      parents,
      children,
      depths,
      postorder,
      root,
      names: vec![None; n],
    })
  }

  fn compute_postorder(root: usize, children: &[Option<(usize, usize)>]) -> Vec<usize> {
    let mut order = Vec::with_capacity(children.len());
    let mut stack = vec![(root, false)];
    while let Some((x, expanded)) = stack.pop() {
      match (children[x], expanded) {
        (Some((lc, rc)), false) => {
          stack.push((x, true));
          stack.push((rc, false));
          stack.push((lc, false));
        }
        _ => order.push(x),
      }
    }
    order
  }

  /// Attaches unique vertex names
  pub fn with_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = (usize, S)>) -> Result<Self, Report> {
    let mut seen = BTreeSet::new();
    for (x, name) in names {
      let name = name.into();
      if x >= self.n_vertices() {
        return make_error!("Cannot name vertex {x} '{name}': tree has {} vertices", self.n_vertices());
      }
      if !seen.insert(name.clone()) {
        return make_error!("Vertex name '{name}' is used more than once");
      }
      self.names[x] = Some(name);
    }
    Ok(self)
  }

  pub fn n_vertices(&self) -> usize {
    self.parents.len()
  }

  pub const fn root(&self) -> usize {
    self.root
  }

  pub fn parent(&self, x: usize) -> Option<usize> {
    self.parents[x]
  }

  pub fn children(&self, x: usize) -> Option<(usize, usize)> {
    self.children[x]
  }

  pub fn sibling(&self, x: usize) -> Option<usize> {
    let (lc, rc) = self.children(self.parent(x)?)?;
    Some(if lc == x { rc } else { lc })
  }

  pub fn is_leaf(&self, x: usize) -> bool {
    self.children[x].is_none()
  }

  pub fn is_root(&self, x: usize) -> bool {
    x == self.root
  }

  /// Number of arcs between the vertex and the root
  pub fn depth(&self, x: usize) -> usize {
    self.depths[x]
  }

  #[cfg(test)]
  pub fn leaves(&self) -> impl Iterator<Item = usize> + '_ {
    (0..self.n_vertices()).filter(|&x| self.is_leaf(x))
  }

  /// Vertices with children before parents
  pub fn postorder(&self) -> &[usize] {
    &self.postorder
  }

  /// Vertices with parents before children
  pub fn topological_order(&self) -> impl Iterator<Item = usize> + '_ {
    self.postorder.iter().rev().copied()
  }

  /// The vertex itself followed by its ancestors up to and including the root
  pub fn path_to_root(&self, x: usize) -> impl Iterator<Item = usize> + '_ {
    std::iter::successors(Some(x), |&y| self.parent(y))
  }

  pub fn is_ancestor_or_self(&self, ancestor: usize, x: usize) -> bool {
    self.depth(ancestor) <= self.depth(x)
      && self.path_to_root(x).nth(self.depth(x) - self.depth(ancestor)) == Some(ancestor)
  }

  /// Lowest common ancestor
  pub fn lca(&self, a: usize, b: usize) -> usize {
    let (mut a, mut b) = (a, b);
    while self.depth(a) > self.depth(b) {
      a = self.parents[a].unwrap_or(a);
    }
    while self.depth(b) > self.depth(a) {
      b = self.parents[b].unwrap_or(b);
    }
    while a != b {
      match (self.parents[a], self.parents[b]) {
        (Some(pa), Some(pb)) => {
          a = pa;
          b = pb;
        }
        _ => break,
      }
    }
    a
  }

  /// The given vertices together with all their ancestors, children before parents.
  ///
  /// Each upward walk stops at the first vertex already collected.
  pub fn spanning_root_subtree(&self, vertices: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut visited = BTreeSet::new();
    for v in vertices {
      for x in self.path_to_root(v) {
        if !visited.insert(x) {
          break;
        }
      }
    }
    self
      .postorder
      .iter()
      .copied()
      .filter(|x| visited.contains(x))
      .collect()
  }

  pub fn name(&self, x: usize) -> Option<&str> {
    self.names[x].as_deref()
  }

  /// Name-to-vertex lookup table of all named vertices
  pub fn name_map(&self) -> BTreeMap<&str, usize> {
    self
      .names
      .iter()
      .enumerate()
      .filter_map(|(x, name)| name.as_deref().map(|name| (name, x)))
      .collect()
  }
}

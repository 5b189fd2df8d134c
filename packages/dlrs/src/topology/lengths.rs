use crate::make_error;
use crate::mcmc::dependent::ChangeInfo;
use crate::topology::rbtree::RBTree;
use crate::utils::error::ensure_non_negative;
use eyre::Report;
use serde::{Deserialize, Serialize};

/// Branch lengths (expected substitutions) of the guest tree, indexed by the head vertex of each branch
#[must_use]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchLengths(Vec<f64>);

impl BranchLengths {
  pub fn new(tree: &RBTree, lengths: Vec<f64>) -> Result<Self, Report> {
    if lengths.len() != tree.n_vertices() {
      return make_error!(
        "Expected one branch length per guest vertex ({}), but found {}",
        tree.n_vertices(),
        lengths.len()
      );
    }
    for (u, &l) in lengths.iter().enumerate() {
      ensure_non_negative(&format!("branch length of guest vertex {u}"), l)?;
    }
    Ok(Self(lengths))
  }

  pub fn get(&self, u: usize) -> f64 {
    self.0[u]
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_slice(&self) -> &[f64] {
    &self.0
  }

  /// Sets a single branch length and reports it as the only affected vertex
  pub fn set(&mut self, u: usize, length: f64) -> Result<ChangeInfo, Report> {
    if u >= self.0.len() {
      return make_error!("Guest vertex {u} is out of range: tree has {} vertices", self.0.len());
    }
    ensure_non_negative(&format!("branch length of guest vertex {u}"), length)?;
    self.0[u] = length;
    Ok(ChangeInfo::partial([u]))
  }
}

use crate::make_error;
use crate::mcmc::dependent::ChangeInfo;
use crate::topology::rbtree::RBTree;
use crate::utils::error::{ensure_non_negative, ensure_positive};
use eyre::Report;
use serde::{Deserialize, Serialize};

/// Absolute vertex times of a dated host tree, and the derived arc times.
///
/// Time runs from the leaves (usually at 0) towards the root. The arc above the root, the stem, ends at the tip of
/// the tree.
#[must_use]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimesMap {
  vertex_times: Vec<f64>,
  arc_times: Vec<f64>,
}

impl TimesMap {
  pub fn new(tree: &RBTree, vertex_times: Vec<f64>, stem_time: f64) -> Result<Self, Report> {
    if vertex_times.len() != tree.n_vertices() {
      return make_error!(
        "Expected one time per host vertex ({}), but found {}",
        tree.n_vertices(),
        vertex_times.len()
      );
    }
    ensure_positive("host stem arc time", stem_time)?;
    for (x, &t) in vertex_times.iter().enumerate() {
      ensure_non_negative(&format!("time of host vertex {x}"), t)?;
    }

    let arc_times = (0..tree.n_vertices())
      .map(|x| match tree.parent(x) {
        None => Ok(stem_time),
        Some(p) => Self::arc_time_between(vertex_times[p], vertex_times[x], x),
      })
      .collect::<Result<Vec<_>, Report>>()?;

    Ok(Self {
      vertex_times,
      arc_times,
    })
  }

  fn arc_time_between(parent_time: f64, child_time: f64, x: usize) -> Result<f64, Report> {
    let arc_time = parent_time - child_time;
    if arc_time <= 0.0 {
      return make_error!(
        "Host vertex {x} at time {child_time} must be strictly younger than its parent at time {parent_time}"
      );
    }
    Ok(arc_time)
  }

  pub fn n_vertices(&self) -> usize {
    self.vertex_times.len()
  }

  pub fn vertex_time(&self, x: usize) -> f64 {
    self.vertex_times[x]
  }

  pub fn arc_time(&self, x: usize) -> f64 {
    self.arc_times[x]
  }

  /// Time of the tip of the stem arc above the root
  pub fn tip_time(&self, tree: &RBTree) -> f64 {
    let root = tree.root();
    self.vertex_times[root] + self.arc_times[root]
  }

  /// Moves a vertex in time. The tip of the tree stays fixed, so moving the root shortens or lengthens the stem.
  /// Returns the arcs whose times changed: the arc above `x` and the arcs of its children.
  pub fn set_vertex_time(&mut self, tree: &RBTree, x: usize, t: f64) -> Result<ChangeInfo, Report> {
    ensure_non_negative(&format!("time of host vertex {x}"), t)?;
    let tip_time = self.tip_time(tree);

    let arc_time = match tree.parent(x) {
      None => Self::arc_time_between(tip_time, t, x)?,
      Some(p) => Self::arc_time_between(self.vertex_times[p], t, x)?,
    };
    let mut affected = vec![x];
    let mut child_arc_times = vec![];
    if let Some((lc, rc)) = tree.children(x) {
      for c in [lc, rc] {
        child_arc_times.push((c, Self::arc_time_between(t, self.vertex_times[c], c)?));
        affected.push(c);
      }
    }

    self.vertex_times[x] = t;
    self.arc_times[x] = arc_time;
    for (c, at) in child_arc_times {
      self.arc_times[c] = at;
    }
    Ok(ChangeInfo::partial(affected))
  }
}

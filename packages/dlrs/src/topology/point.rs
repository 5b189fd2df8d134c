use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A discretisation point on the host tree: arc (identified by its head vertex) and index along the arc.
///
/// Index 0 is the head vertex, indices `1..=n` are slice midpoints and `n + 1` is the tail, which coincides with the
/// parent vertex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
  pub arc: usize,
  pub index: usize,
}

impl Point {
  pub const fn new(arc: usize, index: usize) -> Self {
    Self { arc, index }
  }

  /// Whether this point is the head vertex of its arc
  pub const fn is_vertex(&self) -> bool {
    self.index == 0
  }
}

impl Display for Point {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}_{}", self.arc, self.index)
  }
}

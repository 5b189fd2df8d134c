use crate::dlrs::options::DiscretisationOptions;
use crate::make_error;
use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::topology::point::Point;
use crate::topology::rbtree::RBTree;
use crate::topology::times::TimesMap;
use eyre::{Report, WrapErr};
use log::debug;

#[derive(Clone, Debug, PartialEq)]
struct ArcSlices {
  slice_time: f64,
  /// Head time, slice midpoints, tail time
  points: Vec<f64>,
}

impl ArcSlices {
  fn new(vertex_time: f64, arc_time: f64, n: usize) -> Self {
    let slice_time = arc_time / n as f64;
    let points = std::iter::once(vertex_time)
      .chain((1..=n).map(|k| vertex_time + slice_time * (k as f64 - 0.5)))
      .chain(std::iter::once(vertex_time + arc_time))
      .collect();
    Self { slice_time, points }
  }

  fn n_slices(&self) -> usize {
    self.points.len() - 2
  }
}

#[derive(Clone, Debug)]
enum DiscretiserCache {
  Full { host: RBTree, arcs: Vec<ArcSlices> },
  Arcs(Vec<(usize, ArcSlices)>),
}

/// Host tree with every arc split into equally long time slices.
///
/// Guest vertices may only be placed on the discretisation points: at host vertices (index 0 of the arc below) and at
/// slice midpoints (indices `1..=n`).
#[derive(Clone, Debug)]
pub struct ArcDiscretiser {
  options: DiscretisationOptions,
  host: RBTree,
  arcs: Vec<ArcSlices>,
  cache: Option<DiscretiserCache>,
}

pub struct ArcDiscretiserParents<'a> {
  pub host: Parent<'a, RBTree>,
  pub times: Parent<'a, TimesMap>,
}

impl ArcDiscretiser {
  pub fn new(host: &RBTree, times: &TimesMap, options: &DiscretisationOptions) -> Result<Self, Report> {
    options.validate().wrap_err("When discretising host tree")?;
    let arcs = Self::discretise(host, times, options)?;
    Ok(Self {
      options: options.clone(),
      host: host.clone(),
      arcs,
      cache: None,
    })
  }

  fn discretise(host: &RBTree, times: &TimesMap, options: &DiscretisationOptions) -> Result<Vec<ArcSlices>, Report> {
    if times.n_vertices() != host.n_vertices() {
      return make_error!(
        "Host tree has {} vertices, but times are given for {}",
        host.n_vertices(),
        times.n_vertices()
      );
    }
    (0..host.n_vertices())
      .map(|x| Self::discretise_arc(host, times, options, x))
      .collect()
  }

  fn discretise_arc(
    host: &RBTree,
    times: &TimesMap,
    options: &DiscretisationOptions,
    x: usize,
  ) -> Result<ArcSlices, Report> {
    let arc_time = times.arc_time(x);
    if arc_time <= 0.0 {
      return make_error!("Cannot discretise host arc {x}: its time span is not positive ({arc_time})");
    }
    let n = match options.root_slices {
      Some(n) if host.is_root(x) => n,
      _ => options.slices_for(arc_time),
    };
    Ok(ArcSlices::new(times.vertex_time(x), arc_time, n))
  }

  pub const fn host(&self) -> &RBTree {
    &self.host
  }

  pub fn no_of_slices(&self, x: usize) -> usize {
    self.arcs[x].n_slices()
  }

  pub fn slice_time(&self, x: usize) -> f64 {
    self.arcs[x].slice_time
  }

  /// Times of all points of the arc, from the head vertex to the tail
  pub fn times(&self, x: usize) -> &[f64] {
    &self.arcs[x].points
  }

  pub fn pt_time(&self, p: Point) -> f64 {
    self.times(p.arc)[p.index]
  }

  /// The tail of the stem arc, above every other point
  pub fn tip_point(&self) -> Point {
    let root = self.host.root();
    Point::new(root, self.no_of_slices(root) + 1)
  }

  /// The next slice midpoint above `p`. Above the last midpoint of the stem arc is the tip.
  pub fn next_point(&self, p: Point) -> Point {
    if p.index < self.no_of_slices(p.arc) {
      return Point::new(p.arc, p.index + 1);
    }
    match self.host.parent(p.arc) {
      Some(parent) => Point::new(parent, 1),
      None => self.tip_point(),
    }
  }

  /// Whether `upper` lies strictly above `lower` on the same path to the root
  #[cfg(test)]
  pub fn is_above(&self, upper: Point, lower: Point) -> bool {
    if upper.arc == lower.arc {
      upper.index > lower.index
    } else {
      self.host.is_ancestor_or_self(upper.arc, lower.arc)
    }
  }

  fn update_arcs(&mut self, times: &TimesMap, arcs: &[usize]) -> Result<(), Report> {
    let updated = arcs
      .iter()
      .map(|&x| Ok((x, Self::discretise_arc(&self.host, times, &self.options, x)?)))
      .collect::<Result<Vec<_>, Report>>()?;
    let old = updated
      .into_iter()
      .map(|(x, slices)| (x, std::mem::replace(&mut self.arcs[x], slices)))
      .collect();
    self.cache = Some(DiscretiserCache::Arcs(old));
    Ok(())
  }
}

impl ProperDependent for ArcDiscretiser {
  type Parents<'a> = ArcDiscretiserParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let ArcDiscretiserParents { host, times } = parents;

    if let (false, Some(arcs)) = (host.is_changed(), times.partial()) {
      debug!("Re-discretising host arcs {arcs:?}");
      let arcs: Vec<usize> = arcs.iter().copied().collect();
      self.update_arcs(times.value, &arcs)?;
      return Ok(Some(ChangeInfo::partial(arcs)));
    }

    debug!("Re-discretising the whole host tree");
    let arcs = Self::discretise(host.value, times.value, &self.options)?;
    let old_arcs = std::mem::replace(&mut self.arcs, arcs);
    let old_host = std::mem::replace(&mut self.host, host.value.clone());
    self.cache = Some(DiscretiserCache::Full {
      host: old_host,
      arcs: old_arcs,
    });
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    match self.cache.take() {
      Some(DiscretiserCache::Full { host, arcs }) => {
        self.host = host;
        self.arcs = arcs;
      }
      Some(DiscretiserCache::Arcs(old)) => {
        for (x, slices) in old {
          self.arcs[x] = slices;
        }
      }
      None => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assert_all_relative_eq;
  use crate::topology::rbtree::tests::four_leaf_tree;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn four_leaf_times(tree: &RBTree) -> Result<TimesMap, Report> {
    TimesMap::new(tree, vec![0.0, 0.0, 0.3, 0.0, 0.0, 0.6, 1.0], 0.5)
  }

  #[rstest]
  fn places_points_at_slice_midpoints() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let times = four_leaf_times(&tree)?;
    let disc = ArcDiscretiser::new(&tree, &times, &DiscretisationOptions::uniform(4))?;
    assert_eq!(disc.no_of_slices(5), 4);
    assert_ulps_eq!(disc.slice_time(5), 0.1);
    assert_all_relative_eq!(
      disc.times(5).iter().copied(),
      [0.6, 0.65, 0.75, 0.85, 0.95, 1.0],
      epsilon = 1e-12
    );
    assert_eq!(disc.tip_point(), Point::new(6, 5));
    assert_ulps_eq!(disc.pt_time(disc.tip_point()), 1.5);
    Ok(())
  }

  #[rstest]
  fn slices_by_timestep_with_stem_override() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let times = four_leaf_times(&tree)?;
    let options = DiscretisationOptions {
      min_slices: 2,
      max_slices: 6,
      timestep: 0.1,
      root_slices: Some(1),
    };
    let disc = ArcDiscretiser::new(&tree, &times, &options)?;
    assert_eq!(disc.no_of_slices(0), 3);
    assert_eq!(disc.no_of_slices(2), 6);
    assert_eq!(disc.no_of_slices(5), 4);
    assert_eq!(disc.no_of_slices(6), 1);
    Ok(())
  }

  #[rstest]
  fn steps_through_midpoints_up_to_tip() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let times = four_leaf_times(&tree)?;
    let disc = ArcDiscretiser::new(&tree, &times, &DiscretisationOptions::uniform(2))?;
    let mut p = Point::new(3, 0);
    let mut visited = vec![];
    while p != disc.tip_point() {
      p = disc.next_point(p);
      visited.push(p);
    }
    let expected = [(3, 1), (3, 2), (5, 1), (5, 2), (6, 1), (6, 2), (6, 3)].map(|(x, i)| Point::new(x, i));
    assert_eq!(visited, expected);
    Ok(())
  }

  #[rstest]
  fn orders_points_along_root_paths() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let times = four_leaf_times(&tree)?;
    let disc = ArcDiscretiser::new(&tree, &times, &DiscretisationOptions::uniform(2))?;
    assert!(disc.is_above(Point::new(6, 0), Point::new(3, 2)));
    assert!(disc.is_above(Point::new(3, 2), Point::new(3, 1)));
    assert!(!disc.is_above(Point::new(3, 1), Point::new(3, 1)));
    assert!(!disc.is_above(Point::new(2, 1), Point::new(3, 0)));
    Ok(())
  }

  #[rstest]
  fn rediscretises_only_moved_arcs_and_restores() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let mut times = four_leaf_times(&tree)?;
    let options = DiscretisationOptions {
      min_slices: 1,
      max_slices: 10,
      timestep: 0.1,
      root_slices: None,
    };
    let mut disc = ArcDiscretiser::new(&tree, &times, &options)?;
    let before = disc.arcs.clone();

    let change = times.set_vertex_time(&tree, 5, 0.8)?;
    let result = disc.cache_and_update(
      ArcDiscretiserParents {
        host: Parent::new(&tree, None),
        times: Parent::new(&times, Some(&change)),
      },
      true,
    )?;
    assert_eq!(result, Some(ChangeInfo::partial([3, 4, 5])));
    assert_eq!(disc.no_of_slices(3), 8);
    assert_eq!(disc.no_of_slices(5), 2);
    assert_eq!(disc.arcs[0], before[0]);
    assert_eq!(disc.arcs[2], before[2]);

    disc.restore_cache(true);
    assert_eq!(disc.arcs, before);
    Ok(())
  }
}

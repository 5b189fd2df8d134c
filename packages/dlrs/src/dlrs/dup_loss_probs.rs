use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::topology::discretiser::ArcDiscretiser;
use crate::topology::point::Point;
use crate::topology::rbtree::RBTree;
use crate::utils::error::ensure_non_negative;
use eyre::{Report, WrapErr};
use log::{debug, trace};
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

/// Rates closer than this are treated as equal
const RATE_EQUALITY_TOLERANCE: f64 = 1e-9;

/// Loss rates below this are treated as zero
const ZERO_LOSS_RATE_TOLERANCE: f64 = 1e-9;

/// Kendall's birth-death probabilities for a single lineage over time `t`.
///
/// Returns `(P, u)`: `P` is the probability that the lineage has at least one descendant after time `t`, and `u` the
/// parameter of the geometric distribution of the number of descendants given there is at least one.
pub fn birth_death_probs(dup_rate: f64, loss_rate: f64, t: f64) -> (f64, f64) {
  let (lambda, mu) = (dup_rate, loss_rate);
  if (lambda - mu).abs() < RATE_EQUALITY_TOLERANCE {
    let denom = 1.0 + mu * t;
    (1.0 / denom, mu * t / denom)
  } else if mu < ZERO_LOSS_RATE_TOLERANCE {
    (1.0, 1.0 - (-lambda * t).exp())
  } else if mu > lambda {
    let f = ((lambda - mu) * t).exp();
    let denom = mu - lambda * f;
    ((mu - lambda) * f / denom, lambda * (1.0 - f) / denom)
  } else {
    let e = ((mu - lambda) * t).exp();
    let denom = lambda - mu * e;
    ((lambda - mu) / denom, lambda * (1.0 - e) / denom)
  }
}

/// Advances the single-survivor probability `p11` and the extinction probability `d` of a lineage over one segment
/// with birth-death probabilities `(P, u)`
fn step((p11, d): (f64, f64), (pt, ut): (f64, f64)) -> (f64, f64) {
  let denom = 1.0 - ut * d;
  (p11 * pt * (1.0 - ut) / (denom * denom), 1.0 - pt * (1.0 - d) / denom)
}

/// Host vertex at the head of an arc, which decides how extinction of the subtree below the arc is composed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArcHead {
  Leaf,
  Speciation { left: usize, right: usize },
}

impl ArcHead {
  fn of(host: &RBTree, x: usize) -> Self {
    match host.children(x) {
      None => Self::Leaf,
      Some((left, right)) => Self::Speciation { left, right },
    }
  }

  fn extinction_below(self, extinction: &[f64]) -> f64 {
    match self {
      Self::Leaf => 0.0,
      Self::Speciation { left, right } => extinction[left] * extinction[right],
    }
  }
}

#[derive(Clone, Debug)]
enum P11Snapshot {
  All(BTreeMap<(usize, usize), Array2<f64>>),
  Entries(Vec<((usize, usize), Array2<f64>)>),
}

#[derive(Clone, Debug)]
struct DupLossProbsCache {
  dup_rate: f64,
  loss_rate: f64,
  extinction: Vec<f64>,
  p11: P11Snapshot,
}

/// Survival probabilities of single gene lineages between discretisation points of the host tree.
///
/// For every arc `x` there is a matrix `p11[(x, x)][[i, j]]`, `i >= j`, the probability that a lineage at point
/// `(x, i)` has exactly one surviving descendant at point `(x, j)` with every other descendant lineage going extinct.
/// For every proper ancestor `x` of arc `y` the matrix `p11[(x, y)]` holds the same between points of `x` and points
/// of `y`, which includes the extinction of the sibling subtrees hanging off the path.
#[derive(Clone, Debug)]
pub struct DupLossProbs {
  dup_rate: f64,
  loss_rate: f64,
  p11: BTreeMap<(usize, usize), Array2<f64>>,
  extinction: Vec<f64>,
  cache: Option<DupLossProbsCache>,
}

pub struct DupLossProbsParents<'a> {
  pub discretiser: Parent<'a, ArcDiscretiser>,
  pub dup_rate: Parent<'a, f64>,
  pub loss_rate: Parent<'a, f64>,
}

impl DupLossProbs {
  pub fn new(disc: &ArcDiscretiser, dup_rate: f64, loss_rate: f64) -> Result<Self, Report> {
    let mut this = Self {
      dup_rate,
      loss_rate,
      p11: BTreeMap::new(),
      extinction: vec![0.0; disc.host().n_vertices()],
      cache: None,
    };
    this.set_rates(dup_rate, loss_rate)?;
    this.compute_all(disc);
    Ok(this)
  }

  fn set_rates(&mut self, dup_rate: f64, loss_rate: f64) -> Result<(), Report> {
    ensure_non_negative("duplication rate", dup_rate)?;
    ensure_non_negative("loss rate", loss_rate)?;
    self.dup_rate = dup_rate;
    self.loss_rate = loss_rate;
    Ok(())
  }

  pub const fn dup_rate(&self) -> f64 {
    self.dup_rate
  }

  pub const fn loss_rate(&self) -> f64 {
    self.loss_rate
  }

  /// Probability that the planted subtree starting at the tail of arc `x` leaves no descendants at the leaves
  pub fn extinction(&self, x: usize) -> f64 {
    self.extinction[x]
  }

  /// Probability that a lineage at the head vertex of arc `x` leaves no descendants: 0 at leaves
  pub fn extinction_below(&self, host: &RBTree, x: usize) -> f64 {
    ArcHead::of(host, x).extinction_below(&self.extinction)
  }

  /// Within-arc survival matrix, indexed `[upper, lower]`
  pub fn arc_p11(&self, x: usize) -> Option<&Array2<f64>> {
    self.p11.get(&(x, x))
  }

  /// Single-survivor probability from the upper point `x` down to the lower point `y`.
  /// Zero when `y` does not lie below `x` on a path to the root.
  pub fn p11(&self, x: Point, y: Point) -> f64 {
    if x.arc == y.arc && x.index < y.index {
      return 0.0;
    }
    self
      .p11
      .get(&(x.arc, y.arc))
      .and_then(|m| m.get((x.index, y.index)))
      .copied()
      .unwrap_or(0.0)
  }

  fn compute_all(&mut self, disc: &ArcDiscretiser) {
    let host = disc.host();
    self.extinction = vec![0.0; host.n_vertices()];
    self.p11.clear();
    for &x in host.postorder() {
      self.compute_arc(disc, x);
    }
    for &y in host.postorder() {
      self.compute_root_path(disc, y, |_| true);
    }
  }

  /// Recomputes the given arcs and everything depending on them. `closure` must contain all ancestors of its members.
  fn compute_partial(&mut self, disc: &ArcDiscretiser, closure: &BTreeSet<usize>) {
    let host = disc.host();
    for &x in host.postorder() {
      if closure.contains(&x) {
        self.compute_arc(disc, x);
      }
    }
    for &y in host.postorder() {
      self.compute_root_path(disc, y, |x| closure.contains(&x));
    }
  }

  fn compute_arc(&mut self, disc: &ArcDiscretiser, x: usize) {
    let n = disc.no_of_slices(x);
    let dt = disc.slice_time(x);
    let inner = birth_death_probs(self.dup_rate, self.loss_rate, dt);
    let end = birth_death_probs(self.dup_rate, self.loss_rate, dt / 2.0);

    // Probability of single survival from each point down to the head vertex
    let mut to_head = vec![1.0; n + 2];
    let mut state = (1.0, ArcHead::of(disc.host(), x).extinction_below(&self.extinction));
    state = step(state, end);
    to_head[1] = state.0;
    for i in 2..=n {
      state = step(state, inner);
      to_head[i] = state.0;
    }
    state = step(state, end);
    to_head[n + 1] = state.0;
    self.extinction[x] = state.1;

    let arc = Array2::from_shape_fn((n + 2, n + 2), |(i, j)| match i.cmp(&j) {
      std::cmp::Ordering::Less => 0.0,
      std::cmp::Ordering::Equal => 1.0,
      std::cmp::Ordering::Greater => to_head[i] / to_head[j],
    });
    self.p11.insert((x, x), arc);
  }

  /// Fills `p11[(x, y)]` for every proper ancestor `x` of `y` accepted by `filter`
  fn compute_root_path(&mut self, disc: &ArcDiscretiser, y: usize, filter: impl Fn(usize) -> bool) {
    let host = disc.host();
    let (Some(mut x), Some(sibling)) = (host.parent(y), host.sibling(y)) else {
      return;
    };

    // Survival from the tail of y down to each point of y
    let y_last = disc.no_of_slices(y) + 1;
    let from_y_tail = self.p11[&(y, y)].row(y_last).to_owned();

    // Survival across the arcs strictly between x and y, including losses of sibling subtrees
    let mut through = 1.0;
    let mut loss = self.extinction[sibling];
    loop {
      let x_p11 = &self.p11[&(x, x)];
      let x_size = disc.no_of_slices(x) + 2;
      if filter(x) {
        let xy = Array2::from_shape_fn((x_size, y_last + 1), |(i, j)| {
          // Above the speciation at the head of x, the lineage towards the sibling must die out
          let to_head = if i == 0 { through } else { x_p11[[i, 0]] * through * loss };
          to_head * from_y_tail[j]
        });
        self.p11.insert((x, y), xy);
      }

      let (Some(parent), Some(x_sibling)) = (host.parent(x), host.sibling(x)) else {
        break;
      };
      through *= loss * self.p11[&(x, x)][[x_size - 1, 0]];
      loss = self.extinction[x_sibling];
      x = parent;
    }
  }

  fn snapshot_entries(&self, closure: &BTreeSet<usize>) -> Vec<((usize, usize), Array2<f64>)> {
    self
      .p11
      .iter()
      .filter(|((x, _), _)| closure.contains(x))
      .map(|(&key, m)| (key, m.clone()))
      .collect()
  }
}

impl ProperDependent for DupLossProbs {
  type Parents<'a> = DupLossProbsParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let DupLossProbsParents {
      discretiser,
      dup_rate,
      loss_rate,
    } = parents;
    let disc = discretiser.value;

    let old_rates = (self.dup_rate, self.loss_rate);
    self
      .set_rates(*dup_rate.value, *loss_rate.value)
      .wrap_err("When updating duplication-loss probabilities")?;

    if let (false, false, Some(arcs)) = (dup_rate.is_changed(), loss_rate.is_changed(), discretiser.partial()) {
      let closure: BTreeSet<usize> = disc.host().spanning_root_subtree(arcs.iter().copied()).into_iter().collect();
      debug!("Recomputing duplication-loss probabilities for host arcs {closure:?}");
      self.cache = Some(DupLossProbsCache {
        dup_rate: old_rates.0,
        loss_rate: old_rates.1,
        extinction: self.extinction.clone(),
        p11: P11Snapshot::Entries(self.snapshot_entries(&closure)),
      });
      self.compute_partial(disc, &closure);
      trace!("{self}");
      return Ok(Some(ChangeInfo::Partial(closure)));
    }

    debug!(
      "Recomputing all duplication-loss probabilities for duplication rate {} and loss rate {}",
      self.dup_rate, self.loss_rate
    );
    self.cache = Some(DupLossProbsCache {
      dup_rate: old_rates.0,
      loss_rate: old_rates.1,
      extinction: self.extinction.clone(),
      p11: P11Snapshot::All(std::mem::take(&mut self.p11)),
    });
    self.compute_all(disc);
    trace!("{self}");
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    let Some(cache) = self.cache.take() else {
      return;
    };
    self.dup_rate = cache.dup_rate;
    self.loss_rate = cache.loss_rate;
    self.extinction = cache.extinction;
    match cache.p11 {
      P11Snapshot::All(p11) => self.p11 = p11,
      P11Snapshot::Entries(entries) => self.p11.extend(entries),
    }
  }
}

impl Display for DupLossProbs {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(
      f,
      "Duplication-loss probabilities for duplication rate {} and loss rate {}:",
      self.dup_rate, self.loss_rate
    )?;
    writeln!(f, "Arc\tExtinction\tSurvival along arc")?;
    for (x, ext) in self.extinction.iter().enumerate() {
      let along = self
        .arc_p11(x)
        .map_or(f64::NAN, |m| m[[m.nrows() - 1, 0]]);
      writeln!(f, "{x}\t{ext}\t{along}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dlrs::options::DiscretisationOptions;
  use crate::topology::rbtree::tests::four_leaf_tree;
  use crate::topology::times::TimesMap;
  use approx::{assert_abs_diff_eq, assert_relative_eq, assert_ulps_eq};
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn discretiser(slices: usize) -> Result<ArcDiscretiser, Report> {
    let tree = four_leaf_tree()?;
    let times = TimesMap::new(&tree, vec![0.0, 0.0, 0.3, 0.0, 0.0, 0.6, 1.0], 0.5)?;
    ArcDiscretiser::new(&tree, &times, &DiscretisationOptions::uniform(slices))
  }

  #[rstest]
  #[case(0.3, 0.3, 0.7)]
  #[case(0.5, 0.2, 1.3)]
  #[case(0.2, 0.5, 0.4)]
  #[case(0.4, 0.0, 2.0)]
  fn kernel_is_a_probability(#[case] lambda: f64, #[case] mu: f64, #[case] t: f64) {
    let (pt, ut) = birth_death_probs(lambda, mu, t);
    assert!((0.0..=1.0).contains(&pt), "P = {pt}");
    assert!((0.0..=1.0).contains(&ut), "u = {ut}");
  }

  #[rstest]
  fn kernel_is_continuous_across_branches() {
    let (p_equal, u_equal) = birth_death_probs(0.3, 0.3, 0.8);
    let (p_near, u_near) = birth_death_probs(0.3, 0.3 + 1e-7, 0.8);
    assert_relative_eq!(p_equal, p_near, max_relative = 1e-6);
    assert_relative_eq!(u_equal, u_near, max_relative = 1e-6);

    let (p_pure_birth, u_pure_birth) = birth_death_probs(0.3, 0.0, 0.8);
    assert_ulps_eq!(p_pure_birth, 1.0);
    assert_ulps_eq!(u_pure_birth, 1.0 - (-0.24_f64).exp());
  }

  #[rstest]
  #[case(0.2, 0.5, 1.3)]
  #[case(0.5, 0.2, 1.3)]
  #[case(2.0, 7.0, 0.05)]
  fn kernel_matches_kendall_closed_form(#[case] lambda: f64, #[case] mu: f64, #[case] t: f64) {
    let e = ((mu - lambda) * t).exp();
    let denom = lambda - mu * e;
    let (pt, ut) = birth_death_probs(lambda, mu, t);
    assert_relative_eq!(pt, (lambda - mu) / denom, max_relative = 1e-12);
    assert_relative_eq!(ut, lambda * (1.0 - e) / denom, max_relative = 1e-12);
  }

  #[rstest]
  fn kernel_stays_finite_when_loss_rate_far_exceeds_duplication_rate() {
    let (pt, ut) = birth_death_probs(1.0, 1000.0, 1.0);
    assert!(pt.is_finite() && ut.is_finite());
    assert_abs_diff_eq!(pt, 0.0, epsilon = 1e-300);
    assert_relative_eq!(ut, 1e-3, max_relative = 1e-12);
  }

  #[rstest]
  fn arc_probabilities_are_bounded_with_unit_diagonal() -> Result<(), Report> {
    let disc = discretiser(3)?;
    let probs = DupLossProbs::new(&disc, 0.3, 0.2)?;
    for x in 0..disc.host().n_vertices() {
      let m = probs.arc_p11(x).unwrap();
      for ((i, j), &p) in m.indexed_iter() {
        if i == j {
          assert_eq!(p, 1.0);
        } else if i > j {
          assert!(p > 0.0 && p <= 1.0, "p11({x}: {i}, {j}) = {p}");
        }
      }
    }
    Ok(())
  }

  #[rstest]
  fn extinction_is_a_probability_and_zero_below_leaves() -> Result<(), Report> {
    let disc = discretiser(3)?;
    let host = disc.host();
    let probs = DupLossProbs::new(&disc, 0.3, 0.2)?;
    for x in 0..host.n_vertices() {
      assert!((0.0..=1.0).contains(&probs.extinction(x)));
    }
    for x in host.leaves() {
      assert_eq!(probs.extinction_below(host, x), 0.0);
    }
    assert_ulps_eq!(probs.extinction_below(host, 5), probs.extinction(3) * probs.extinction(4));
    Ok(())
  }

  #[rstest]
  fn arc_probabilities_are_markovian() -> Result<(), Report> {
    let disc = discretiser(4)?;
    let probs = DupLossProbs::new(&disc, 0.45, 0.15)?;
    let m = probs.arc_p11(2).unwrap();
    let size = m.nrows();
    for i in 0..size {
      for k in 0..=i {
        for j in 0..=k {
          assert_relative_eq!(m[[i, j]], m[[i, k]] * m[[k, j]], max_relative = 1e-12);
        }
      }
    }
    Ok(())
  }

  #[rstest]
  fn matches_closed_form_for_equal_rates() -> Result<(), Report> {
    let disc = discretiser(3)?;
    let mu = 0.1;
    let probs = DupLossProbs::new(&disc, mu, mu)?;
    // Leaf arc 0 spans 0.3 time units and starts with no extinction below
    let t = 0.3;
    let m = probs.arc_p11(0).unwrap();
    assert_relative_eq!(m[[4, 0]], 1.0 / (1.0 + mu * t).powi(2), max_relative = 1e-12);
    assert_relative_eq!(probs.extinction(0), mu * t / (1.0 + mu * t), max_relative = 1e-12);
    Ok(())
  }

  #[rstest]
  fn whole_arc_survival_does_not_depend_on_slicing() -> Result<(), Report> {
    let coarse = DupLossProbs::new(&discretiser(1)?, 0.35, 0.25)?;
    let fine = DupLossProbs::new(&discretiser(7)?, 0.35, 0.25)?;
    for x in 0..7 {
      let c = coarse.arc_p11(x).unwrap();
      let f = fine.arc_p11(x).unwrap();
      assert_relative_eq!(c[[2, 0]], f[[8, 0]], max_relative = 1e-10);
      assert_relative_eq!(coarse.extinction(x), fine.extinction(x), max_relative = 1e-10);
    }
    Ok(())
  }

  #[rstest]
  fn combines_arcs_along_root_paths() -> Result<(), Report> {
    let disc = discretiser(2)?;
    let probs = DupLossProbs::new(&disc, 0.3, 0.2)?;
    let arc = |x| probs.arc_p11(x).unwrap();

    // From the speciation at the head of arc 2 down to a point on arc 0
    assert_ulps_eq!(probs.p11(Point::new(2, 0), Point::new(0, 1)), arc(0)[[3, 1]]);

    // From a point on the stem down to a point on arc 0: arc 1 and arc 5 subtrees must die out
    let expected = arc(6)[[2, 0]] * probs.extinction(5) * arc(2)[[3, 0]] * probs.extinction(1) * arc(0)[[3, 2]];
    assert_relative_eq!(
      probs.p11(Point::new(6, 2), Point::new(0, 2)),
      expected,
      max_relative = 1e-12
    );

    // Points on different lineages are unrelated
    assert_eq!(probs.p11(Point::new(5, 1), Point::new(0, 1)), 0.0);
    Ok(())
  }

  #[rstest]
  fn partial_update_matches_full_recomputation() -> Result<(), Report> {
    let tree = four_leaf_tree()?;
    let mut times = TimesMap::new(&tree, vec![0.0, 0.0, 0.3, 0.0, 0.0, 0.6, 1.0], 0.5)?;
    let options = DiscretisationOptions {
      min_slices: 2,
      max_slices: 8,
      timestep: 0.1,
      root_slices: None,
    };
    let mut disc = ArcDiscretiser::new(&tree, &times, &options)?;
    let mut probs = DupLossProbs::new(&disc, 0.3, 0.2)?;
    let before = probs.clone();

    let change = times.set_vertex_time(&tree, 5, 0.8)?;
    let disc_change = disc
      .cache_and_update(
        crate::topology::discretiser::ArcDiscretiserParents {
          host: Parent::new(&tree, None),
          times: Parent::new(&times, Some(&change)),
        },
        true,
      )?
      .unwrap();
    let (lambda, mu) = (0.3, 0.2);
    let result = probs.cache_and_update(
      DupLossProbsParents {
        discretiser: Parent::new(&disc, Some(&disc_change)),
        dup_rate: Parent::new(&lambda, None),
        loss_rate: Parent::new(&mu, None),
      },
      true,
    )?;
    assert_eq!(result, Some(ChangeInfo::partial([3, 4, 5, 6])));

    let full = DupLossProbs::new(&disc, 0.3, 0.2)?;
    assert_eq!(probs.p11.keys().collect::<Vec<_>>(), full.p11.keys().collect::<Vec<_>>());
    for (key, m) in &probs.p11 {
      let expected = &full.p11[key];
      assert_eq!(m.dim(), expected.dim());
      for (a, b) in m.iter().zip(expected.iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
      }
    }

    probs.restore_cache(true);
    assert_eq!(probs.p11, before.p11);
    assert_eq!(probs.extinction, before.extinction);
    Ok(())
  }

  #[rstest]
  fn restores_all_tables_after_rate_change() -> Result<(), Report> {
    let disc = discretiser(3)?;
    let mut probs = DupLossProbs::new(&disc, 0.3, 0.2)?;
    let before = probs.clone();
    let (lambda, mu) = (0.6, 0.2);
    probs.cache_and_update(
      DupLossProbsParents {
        discretiser: Parent::new(&disc, None),
        dup_rate: Parent::new(&lambda, Some(&ChangeInfo::Full)),
        loss_rate: Parent::new(&mu, None),
      },
      true,
    )?;
    assert_ulps_eq!(probs.dup_rate(), 0.6);
    assert!(probs.p11 != before.p11);

    probs.restore_cache(true);
    assert_ulps_eq!(probs.dup_rate(), 0.3);
    assert_eq!(probs.p11, before.p11);
    assert_eq!(probs.extinction, before.extinction);
    Ok(())
  }
}

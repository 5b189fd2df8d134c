use crate::dlrs::dup_loss_probs::DupLossProbs;
use crate::dlrs::reconciliation_helper::ReconciliationHelper;
use crate::make_error;
use crate::math::rate_density::RateDensity;
use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::topology::discretiser::ArcDiscretiser;
use crate::topology::lengths::BranchLengths;
use crate::topology::point::Point;
use crate::topology::rbtree::RBTree;
use eyre::Report;
use log::{debug, trace};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug)]
enum DlrCache {
  Full {
    root: usize,
    ats: Vec<Vec<f64>>,
    belows: Vec<Vec<f64>>,
  },
  Vertices(Vec<(usize, Vec<f64>, Vec<f64>)>),
}

/// Everything the dynamic programme reads
#[derive(Clone, Copy)]
pub(crate) struct DlrInputs<'a> {
  pub(crate) guest: &'a RBTree,
  pub(crate) lengths: &'a BranchLengths,
  pub(crate) helper: &'a ReconciliationHelper,
  pub(crate) probs: &'a DupLossProbs,
  pub(crate) density: &'a RateDensity,
  pub(crate) disc: &'a ArcDiscretiser,
}

/// Terms of `belows[u]` for the parent of `u` placed at `x`: one per placement of `u`, from the lowest upward, up to
/// the last placement strictly below `x`
pub(crate) fn placement_weights(inputs: &DlrInputs<'_>, ats: &[f64], u: usize, x: Point) -> Vec<f64> {
  let DlrInputs {
    guest,
    lengths,
    helper,
    probs,
    density,
    disc,
  } = *inputs;
  let is_root = guest.is_root(u);
  let length = lengths.get(u);
  let x_time = disc.pt_time(x);

  let mut weights = Vec::with_capacity(ats.len());
  let mut y = helper.lo_lim(u);
  for &at in ats {
    let rate_density = if is_root {
      1.0
    } else {
      density.pdf(length / (x_time - disc.pt_time(y)))
    };
    weights.push(rate_density * probs.p11(x, y) * at);
    y = disc.next_point(y);
    if y.arc == x.arc && y.index >= x.index {
      break;
    }
  }
  weights
}

/// Probability of a guest tree with branch lengths, given the dated host tree, under duplication-loss and a relaxed
/// clock.
///
/// `ats[u][k]` is the probability of the subtree of guest vertex `u` given that `u` sits at its `k`-th viable
/// placement. `belows[u][k]` is the probability of the planted subtree of `u`, i.e. `u` together with its parent
/// branch, given that the parent of `u` sits at its own `k`-th viable placement. The root's parent is the host tip.
#[derive(Clone, Debug)]
pub struct DlrModel {
  ats: Vec<Vec<f64>>,
  belows: Vec<Vec<f64>>,
  root: usize,
  cache: Option<DlrCache>,
}

pub struct DlrModelParents<'a> {
  pub guest: Parent<'a, RBTree>,
  pub lengths: Parent<'a, BranchLengths>,
  pub helper: Parent<'a, ReconciliationHelper>,
  pub probs: Parent<'a, DupLossProbs>,
  pub density: Parent<'a, RateDensity>,
  pub discretiser: Parent<'a, ArcDiscretiser>,
}

impl DlrModel {
  pub fn new(
    guest: &RBTree,
    lengths: &BranchLengths,
    helper: &ReconciliationHelper,
    probs: &DupLossProbs,
    density: &RateDensity,
    disc: &ArcDiscretiser,
  ) -> Result<Self, Report> {
    let mut this = Self {
      ats: vec![],
      belows: vec![],
      root: guest.root(),
      cache: None,
    };
    this.update_all(DlrInputs {
      guest,
      lengths,
      helper,
      probs,
      density,
      disc,
    })?;
    Ok(this)
  }

  pub fn likelihood(&self) -> f64 {
    self.belows[self.root][0]
  }

  pub fn log_likelihood(&self) -> f64 {
    self.likelihood().ln()
  }

  pub fn ats(&self, u: usize) -> &[f64] {
    &self.ats[u]
  }

  pub fn belows(&self, u: usize) -> &[f64] {
    &self.belows[u]
  }

  fn update_all(&mut self, inputs: DlrInputs<'_>) -> Result<(), Report> {
    let DlrInputs {
      guest,
      lengths,
      helper,
      ..
    } = inputs;
    if lengths.len() != guest.n_vertices() {
      return make_error!(
        "Guest tree has {} vertices, but {} branch lengths are given",
        guest.n_vertices(),
        lengths.len()
      );
    }

    self.root = guest.root();
    self.ats = (0..guest.n_vertices())
      .map(|u| Vec::with_capacity(helper.no_of_placements(u)))
      .collect();
    self.belows = (0..guest.n_vertices())
      .map(|u| Vec::with_capacity(guest.parent(u).map_or(1, |p| helper.no_of_placements(p))))
      .collect();
    for &u in guest.postorder() {
      self.update_at_probs(&inputs, u);
      self.update_below_probs(&inputs, u);
    }
    Ok(())
  }

  /// Recomputes the given vertices and all their ancestors. Returns the recomputed vertices.
  fn update_partial(&mut self, inputs: DlrInputs<'_>, vertices: &BTreeSet<usize>) -> Vec<usize> {
    let affected = inputs.guest.spanning_root_subtree(vertices.iter().copied());
    let snapshot = affected
      .iter()
      .map(|&u| (u, self.ats[u].clone(), self.belows[u].clone()))
      .collect();
    self.cache = Some(DlrCache::Vertices(snapshot));
    for &u in &affected {
      self.update_at_probs(&inputs, u);
      self.update_below_probs(&inputs, u);
    }
    affected
  }

  fn update_at_probs(&mut self, inputs: &DlrInputs<'_>, u: usize) {
    let DlrInputs {
      guest,
      helper,
      probs,
      disc,
      ..
    } = *inputs;
    let mut ats = std::mem::take(&mut self.ats[u]);
    ats.clear();

    match guest.children(u) {
      None => ats.push(1.0),
      Some((lc, rc)) => {
        let (lc_belows, rc_belows) = (&self.belows[lc], &self.belows[rc]);
        let n = helper.no_of_placements(u);
        let mut x = helper.lo_lim(u);
        if x.is_vertex() {
          // Speciation
          ats.push(lc_belows[0] * rc_belows[0]);
          x = disc.next_point(x);
        }
        while ats.len() < n {
          // Duplication within the slice around x
          let k = ats.len();
          let dup = 2.0 * probs.dup_rate() * disc.slice_time(x.arc);
          ats.push(lc_belows[k] * rc_belows[k] * dup);
          x = disc.next_point(x);
        }
      }
    }
    self.ats[u] = ats;
  }

  fn update_below_probs(&mut self, inputs: &DlrInputs<'_>, u: usize) {
    let DlrInputs {
      guest,
      helper,
      disc,
      ..
    } = *inputs;
    let (mut x, n_upper) = match guest.parent(u) {
      None => (helper.tip(), 1),
      Some(p) => (helper.lo_lim(p), helper.no_of_placements(p)),
    };

    let mut belows = std::mem::take(&mut self.belows[u]);
    belows.clear();
    for _ in 0..n_upper {
      belows.push(placement_weights(inputs, &self.ats[u], u, x).into_iter().sum());
      x = disc.next_point(x);
    }
    self.belows[u] = belows;
  }
}

impl ProperDependent for DlrModel {
  type Parents<'a> = DlrModelParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let DlrModelParents {
      guest,
      lengths,
      helper,
      probs,
      density,
      discretiser,
    } = parents;
    let inputs = DlrInputs {
      guest: guest.value,
      lengths: lengths.value,
      helper: helper.value,
      probs: probs.value,
      density: density.value,
      disc: discretiser.value,
    };

    let others_changed =
      guest.is_changed() || helper.is_changed() || probs.is_changed() || density.is_changed() || discretiser.is_changed();
    if let (false, Some(vertices)) = (others_changed, lengths.partial()) {
      let affected = self.update_partial(inputs, vertices);
      debug!("Recomputed likelihood tables of guest vertices {affected:?}");
      trace!("{self}");
      return Ok(Some(ChangeInfo::partial(affected)));
    }

    let ats = std::mem::take(&mut self.ats);
    let belows = std::mem::take(&mut self.belows);
    let root = self.root;
    if let Err(report) = self.update_all(inputs) {
      self.ats = ats;
      self.belows = belows;
      self.root = root;
      return Err(report);
    }
    self.cache = Some(DlrCache::Full { root, ats, belows });
    debug!("Recomputed all likelihood tables");
    trace!("{self}");
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    match self.cache.take() {
      Some(DlrCache::Full { root, ats, belows }) => {
        self.root = root;
        self.ats = ats;
        self.belows = belows;
      }
      Some(DlrCache::Vertices(vertices)) => {
        for (u, ats, belows) in vertices {
          self.ats[u] = ats;
          self.belows[u] = belows;
        }
      }
      None => {}
    }
  }
}

impl Display for DlrModel {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "Likelihood tables (likelihood {}):", self.likelihood())?;
    for (u, (ats, belows)) in self.ats.iter().zip(&self.belows).enumerate() {
      writeln!(f, "{u}\tats {ats:?}\tbelows {belows:?}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dlrs::options::DiscretisationOptions;
  use crate::dlrs::reconciliation_helper::tests::five_leaf_guest;
  use crate::math::rate_density::RateDensityKind;
  use crate::topology::mpr::MprMap;
  use crate::topology::rbtree::tests::four_leaf_tree;
  use crate::topology::times::TimesMap;
  use approx::assert_relative_eq;
  use maplit::btreemap;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  struct Fixture {
    guest: RBTree,
    lengths: BranchLengths,
    helper: ReconciliationHelper,
    probs: DupLossProbs,
    density: RateDensity,
    disc: ArcDiscretiser,
  }

  impl Fixture {
    fn model(&self) -> Result<DlrModel, Report> {
      DlrModel::new(
        &self.guest,
        &self.lengths,
        &self.helper,
        &self.probs,
        &self.density,
        &self.disc,
      )
    }

    fn parents<'a>(&'a self, changes: &'a [Option<ChangeInfo>; 6]) -> DlrModelParents<'a> {
      DlrModelParents {
        guest: Parent::new(&self.guest, changes[0].as_ref()),
        lengths: Parent::new(&self.lengths, changes[1].as_ref()),
        helper: Parent::new(&self.helper, changes[2].as_ref()),
        probs: Parent::new(&self.probs, changes[3].as_ref()),
        density: Parent::new(&self.density, changes[4].as_ref()),
        discretiser: Parent::new(&self.disc, changes[5].as_ref()),
      }
    }
  }

  /// Cherry guest tree in a cherry host tree of height 1 with one slice per arc and a strict clock
  fn two_leaf_fixture(dup_rate: f64, loss_rate: f64) -> Result<Fixture, Report> {
    let host = RBTree::from_parents(vec![Some(2), Some(2), None])?;
    let times = TimesMap::new(&host, vec![0.0, 0.0, 0.5], 0.5)?;
    let disc = ArcDiscretiser::new(&host, &times, &DiscretisationOptions::uniform(1))?;
    let guest = RBTree::from_parents(vec![Some(2), Some(2), None])?;
    let mpr = MprMap::new(&guest, &host, btreemap! { 0 => 0, 1 => 1 })?;
    Ok(Fixture {
      lengths: BranchLengths::new(&guest, vec![0.5, 0.5, 0.5])?,
      helper: ReconciliationHelper::new(&guest, &mpr, &disc, 100)?,
      probs: DupLossProbs::new(&disc, dup_rate, loss_rate)?,
      density: RateDensity::new(RateDensityKind::Flat, 1.0, 1.0)?,
      guest,
      disc,
    })
  }

  fn five_leaf_fixture() -> Result<Fixture, Report> {
    let host = four_leaf_tree()?;
    let times = TimesMap::new(&host, vec![0.0, 0.0, 0.3, 0.0, 0.0, 0.6, 1.0], 0.5)?;
    let disc = ArcDiscretiser::new(&host, &times, &DiscretisationOptions::uniform(3))?;
    let (guest, mpr) = five_leaf_guest(&host)?;
    Ok(Fixture {
      lengths: BranchLengths::new(&guest, vec![0.35, 0.5, 0.7, 0.4, 0.45, 0.3, 0.2, 0.25, 0.1])?,
      helper: ReconciliationHelper::new(&guest, &mpr, &disc, 100)?,
      probs: DupLossProbs::new(&disc, 0.4, 0.3)?,
      density: RateDensity::new(RateDensityKind::Gamma, 1.0, 0.5)?,
      guest,
      disc,
    })
  }

  #[rstest]
  fn computes_cherry_likelihood_by_hand() -> Result<(), Report> {
    let mu = 0.1;
    let model = two_leaf_fixture(mu, mu)?.model()?;

    // Equal rates: P(t) = 1/(1+mu*t), u(t) = mu*t/(1+mu*t)
    let p_leaf = 1.0 / (1.0 + mu * 0.5).powi(2);
    let d_leaf = mu * 0.5 / (1.0 + mu * 0.5);
    let (p, u) = (1.0 / (1.0 + mu * 0.25), mu * 0.25 / (1.0 + mu * 0.25));
    let d0 = d_leaf * d_leaf;
    let root_10 = p * (1.0 - u) / (1.0 - u * d0).powi(2);
    let d1 = 1.0 - p * (1.0 - d0) / (1.0 - u * d0);
    let root_20 = root_10 * p * (1.0 - u) / (1.0 - u * d1).powi(2);
    let root_21 = root_20 / root_10;

    let speciation = p_leaf * p_leaf;
    let duplication = (root_10 * d_leaf * p_leaf).powi(2) * 2.0 * mu * 0.5;
    assert_relative_eq!(model.ats(2)[0], speciation, max_relative = 1e-12);
    assert_relative_eq!(model.ats(2)[1], duplication, max_relative = 1e-12);

    let expected = root_20 * speciation + root_21 * duplication;
    assert_relative_eq!(model.likelihood(), expected, max_relative = 1e-12);
    assert_relative_eq!(model.likelihood(), 0.746_537_683_940_946_9, max_relative = 1e-12);
    assert_relative_eq!(model.log_likelihood(), expected.ln(), max_relative = 1e-12);
    Ok(())
  }

  #[rstest]
  fn sizes_tables_by_placements() -> Result<(), Report> {
    let fixture = five_leaf_fixture()?;
    let model = fixture.model()?;
    for u in 0..fixture.guest.n_vertices() {
      assert_eq!(model.ats(u).len(), fixture.helper.no_of_placements(u));
      let n_upper = fixture.guest.parent(u).map_or(1, |p| fixture.helper.no_of_placements(p));
      assert_eq!(model.belows(u).len(), n_upper);
    }
    assert!(model.likelihood() > 0.0 && model.likelihood().is_finite());
    Ok(())
  }

  #[rstest]
  fn duplications_gain_weight_with_duplication_rate() -> Result<(), Report> {
    let low = two_leaf_fixture(0.1, 0.1)?.model()?;
    let high = two_leaf_fixture(0.5, 0.1)?.model()?;
    assert!(high.ats(2)[0] < low.ats(2)[0]);
    assert!(high.ats(2)[0] / high.ats(2)[1] < low.ats(2)[0] / low.ats(2)[1]);
    Ok(())
  }

  #[rstest]
  fn partial_update_matches_full_recomputation() -> Result<(), Report> {
    let mut fixture = five_leaf_fixture()?;
    let mut model = fixture.model()?;
    let before = model.clone();

    let change = fixture.lengths.set(0, 0.6)?;
    let changes = [None, Some(change), None, None, None, None];
    let result = model.cache_and_update(fixture.parents(&changes), true)?;
    assert_eq!(result, Some(ChangeInfo::partial([0, 5, 7, 8])));

    let full = fixture.model()?;
    for u in 0..fixture.guest.n_vertices() {
      assert_eq!(model.ats(u).len(), full.ats(u).len());
      assert_eq!(model.belows(u).len(), full.belows(u).len());
      for (a, b) in model.ats(u).iter().zip(full.ats(u)) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
      }
      for (a, b) in model.belows(u).iter().zip(full.belows(u)) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
      }
    }
    assert!(model.likelihood() != before.likelihood());

    model.restore_cache(true);
    assert_eq!(model.ats, before.ats);
    assert_eq!(model.belows, before.belows);
    Ok(())
  }

  #[rstest]
  fn restores_tables_after_full_update() -> Result<(), Report> {
    let mut fixture = five_leaf_fixture()?;
    let mut model = fixture.model()?;
    let before = model.clone();

    fixture.probs = DupLossProbs::new(&fixture.disc, 0.8, 0.3)?;
    let changes = [None, None, None, Some(ChangeInfo::Full), None, None];
    let result = model.cache_and_update(fixture.parents(&changes), true)?;
    assert_eq!(result, Some(ChangeInfo::Full));
    assert!(model.ats != before.ats);

    model.restore_cache(true);
    assert_eq!(model.ats, before.ats);
    assert_eq!(model.belows, before.belows);
    assert_eq!(model.likelihood().to_bits(), before.likelihood().to_bits());
    Ok(())
  }

  #[rstest]
  fn rejects_mismatched_branch_lengths() -> Result<(), Report> {
    let fixture = five_leaf_fixture()?;
    let host_sized = BranchLengths::new(fixture.disc.host(), vec![0.1; 7])?;
    assert!(DlrModel::new(
      &fixture.guest,
      &host_sized,
      &fixture.helper,
      &fixture.probs,
      &fixture.density,
      &fixture.disc
    )
    .is_err());
    Ok(())
  }
}

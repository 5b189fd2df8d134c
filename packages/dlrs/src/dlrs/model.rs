use crate::dlrs::dlr_model::{DlrInputs, DlrModel, DlrModelParents};
use crate::dlrs::dup_loss_probs::{DupLossProbs, DupLossProbsParents};
use crate::dlrs::options::{DlrsOptions, DlrsParameters};
use crate::dlrs::realisation::{Realisation, RealisationSampler};
use crate::dlrs::reconciliation_helper::{ReconciliationHelper, ReconciliationHelperParents};
use crate::math::rate_density::{RateDensity, RateDensityParents};
use crate::mcmc::chain::McmcModel;
use crate::mcmc::dependent::{ChangeInfo, ChangeInfos, DependencyGraph, DependentSet, Parent, ProperDependent};
use crate::mcmc::parameter::StateParameter;
use crate::topology::discretiser::{ArcDiscretiser, ArcDiscretiserParents};
use crate::topology::lengths::BranchLengths;
use crate::topology::mpr::{MprMap, MprMapParents};
use crate::topology::rbtree::RBTree;
use crate::topology::times::TimesMap;
use crate::utils::error::ensure_positive;
use crate::{make_error, make_internal_error};
use eyre::{Report, WrapErr};
use log::debug;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Nodes of the likelihood model's dependency graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum DlrsNode {
  HostTree,
  HostTimes,
  GuestTree,
  LeafMap,
  BranchLengths,
  DupRate,
  LossRate,
  RateMean,
  RateCv,
  Discretiser,
  Mpr,
  RateDensity,
  DupLossProbs,
  ReconciliationHelper,
  DlrModel,
}

impl DlrsNode {
  pub fn parents(self) -> Vec<Self> {
    match self {
      Self::HostTree
      | Self::HostTimes
      | Self::GuestTree
      | Self::LeafMap
      | Self::BranchLengths
      | Self::DupRate
      | Self::LossRate
      | Self::RateMean
      | Self::RateCv => vec![],
      Self::Discretiser => vec![Self::HostTree, Self::HostTimes],
      Self::Mpr => vec![Self::GuestTree, Self::HostTree, Self::LeafMap],
      Self::RateDensity => vec![Self::RateMean, Self::RateCv],
      Self::DupLossProbs => vec![Self::Discretiser, Self::DupRate, Self::LossRate],
      Self::ReconciliationHelper => vec![Self::GuestTree, Self::Mpr, Self::Discretiser],
      Self::DlrModel => vec![
        Self::GuestTree,
        Self::BranchLengths,
        Self::ReconciliationHelper,
        Self::DupLossProbs,
        Self::RateDensity,
        Self::Discretiser,
      ],
    }
  }
}

/// Real-valued parameters a sampler may perturb
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RealParameter {
  DupRate,
  LossRate,
  RateMean,
  RateCv,
}

/// State of the likelihood model recorded by a sampler
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DlrsSample {
  pub log_likelihood: f64,
  pub dup_rate: f64,
  pub loss_rate: f64,
  pub rate_mean: f64,
  pub rate_cv: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub realisation: Option<Realisation>,
}

struct DlrsNodes {
  host_tree: StateParameter<RBTree>,
  host_times: StateParameter<TimesMap>,
  guest_tree: StateParameter<RBTree>,
  leaf_map: StateParameter<BTreeMap<usize, usize>>,
  lengths: StateParameter<BranchLengths>,
  dup_rate: StateParameter<f64>,
  loss_rate: StateParameter<f64>,
  rate_mean: StateParameter<f64>,
  rate_cv: StateParameter<f64>,
  discretiser: ArcDiscretiser,
  mpr: MprMap,
  rate_density: RateDensity,
  probs: DupLossProbs,
  helper: ReconciliationHelper,
  dlr: DlrModel,
}

fn parent<'a, T>(value: &'a T, key: DlrsNode, changes: &'a ChangeInfos<DlrsNode>) -> Parent<'a, T> {
  Parent::new(value, changes.get(&key))
}

impl DependentSet<DlrsNode> for DlrsNodes {
  fn source_changes(&self) -> ChangeInfos<DlrsNode> {
    [
      (DlrsNode::HostTree, self.host_tree.change()),
      (DlrsNode::HostTimes, self.host_times.change()),
      (DlrsNode::GuestTree, self.guest_tree.change()),
      (DlrsNode::LeafMap, self.leaf_map.change()),
      (DlrsNode::BranchLengths, self.lengths.change()),
      (DlrsNode::DupRate, self.dup_rate.change()),
      (DlrsNode::LossRate, self.loss_rate.change()),
      (DlrsNode::RateMean, self.rate_mean.change()),
      (DlrsNode::RateCv, self.rate_cv.change()),
    ]
    .into_iter()
    .filter_map(|(key, change)| change.map(|change| (key, change.clone())))
    .collect()
  }

  fn update_node(
    &mut self,
    key: DlrsNode,
    changes: &ChangeInfos<DlrsNode>,
    will_sample: bool,
  ) -> Result<Option<ChangeInfo>, Report> {
    use DlrsNode as N;
    match key {
      N::Discretiser => self.discretiser.cache_and_update(
        ArcDiscretiserParents {
          host: parent(self.host_tree.value(), N::HostTree, changes),
          times: parent(self.host_times.value(), N::HostTimes, changes),
        },
        will_sample,
      ),
      N::Mpr => self.mpr.cache_and_update(
        MprMapParents {
          guest: parent(self.guest_tree.value(), N::GuestTree, changes),
          host: parent(self.host_tree.value(), N::HostTree, changes),
          leaf_map: parent(self.leaf_map.value(), N::LeafMap, changes),
        },
        will_sample,
      ),
      N::RateDensity => self.rate_density.cache_and_update(
        RateDensityParents {
          mean: parent(self.rate_mean.value(), N::RateMean, changes),
          cv: parent(self.rate_cv.value(), N::RateCv, changes),
        },
        will_sample,
      ),
      N::DupLossProbs => self.probs.cache_and_update(
        DupLossProbsParents {
          discretiser: parent(&self.discretiser, N::Discretiser, changes),
          dup_rate: parent(self.dup_rate.value(), N::DupRate, changes),
          loss_rate: parent(self.loss_rate.value(), N::LossRate, changes),
        },
        will_sample,
      ),
      N::ReconciliationHelper => self.helper.cache_and_update(
        ReconciliationHelperParents {
          guest: parent(self.guest_tree.value(), N::GuestTree, changes),
          mpr: parent(&self.mpr, N::Mpr, changes),
          discretiser: parent(&self.discretiser, N::Discretiser, changes),
        },
        will_sample,
      ),
      N::DlrModel => self.dlr.cache_and_update(
        DlrModelParents {
          guest: parent(self.guest_tree.value(), N::GuestTree, changes),
          lengths: parent(self.lengths.value(), N::BranchLengths, changes),
          helper: parent(&self.helper, N::ReconciliationHelper, changes),
          probs: parent(&self.probs, N::DupLossProbs, changes),
          density: parent(&self.rate_density, N::RateDensity, changes),
          discretiser: parent(&self.discretiser, N::Discretiser, changes),
        },
        will_sample,
      ),
      source => make_internal_error!("Source node {source} cannot be updated from parents"),
    }
  }

  fn clear_node(&mut self, key: DlrsNode, will_sample: bool) {
    use DlrsNode as N;
    match key {
      N::HostTree => self.host_tree.clear_cache(),
      N::HostTimes => self.host_times.clear_cache(),
      N::GuestTree => self.guest_tree.clear_cache(),
      N::LeafMap => self.leaf_map.clear_cache(),
      N::BranchLengths => self.lengths.clear_cache(),
      N::DupRate => self.dup_rate.clear_cache(),
      N::LossRate => self.loss_rate.clear_cache(),
      N::RateMean => self.rate_mean.clear_cache(),
      N::RateCv => self.rate_cv.clear_cache(),
      N::Discretiser => self.discretiser.clear_cache(will_sample),
      N::Mpr => self.mpr.clear_cache(will_sample),
      N::RateDensity => self.rate_density.clear_cache(will_sample),
      N::DupLossProbs => self.probs.clear_cache(will_sample),
      N::ReconciliationHelper => self.helper.clear_cache(will_sample),
      N::DlrModel => self.dlr.clear_cache(will_sample),
    }
  }

  fn restore_node(&mut self, key: DlrsNode, will_sample: bool) {
    use DlrsNode as N;
    match key {
      N::HostTree => self.host_tree.restore_cache(),
      N::HostTimes => self.host_times.restore_cache(),
      N::GuestTree => self.guest_tree.restore_cache(),
      N::LeafMap => self.leaf_map.restore_cache(),
      N::BranchLengths => self.lengths.restore_cache(),
      N::DupRate => self.dup_rate.restore_cache(),
      N::LossRate => self.loss_rate.restore_cache(),
      N::RateMean => self.rate_mean.restore_cache(),
      N::RateCv => self.rate_cv.restore_cache(),
      N::Discretiser => self.discretiser.restore_cache(will_sample),
      N::Mpr => self.mpr.restore_cache(will_sample),
      N::RateDensity => self.rate_density.restore_cache(will_sample),
      N::DupLossProbs => self.probs.restore_cache(will_sample),
      N::ReconciliationHelper => self.helper.restore_cache(will_sample),
      N::DlrModel => self.dlr.restore_cache(will_sample),
    }
  }
}

/// Likelihood of a dated guest tree with branch lengths inside a dated host tree, with every derived quantity kept
/// up to date incrementally as parameters are perturbed.
///
/// A proposal is made by one or more setters, followed by [`DlrsModel::update`], and finished with exactly one of
/// [`DlrsModel::accept`] or [`DlrsModel::reject`].
pub struct DlrsModel {
  graph: DependencyGraph<DlrsNode>,
  nodes: DlrsNodes,
  sample_realisations: bool,
}

impl DlrsModel {
  pub fn new(
    host: RBTree,
    times: TimesMap,
    guest: RBTree,
    mpr: MprMap,
    lengths: BranchLengths,
    parameters: &DlrsParameters,
    options: &DlrsOptions,
  ) -> Result<Self, Report> {
    options.validate()?;
    parameters.validate().wrap_err("When validating initial model parameters")?;
    if lengths.len() != guest.n_vertices() {
      return make_error!(
        "Guest tree has {} vertices, but {} branch lengths are given",
        guest.n_vertices(),
        lengths.len()
      );
    }

    let discretiser = ArcDiscretiser::new(&host, &times, &options.discretisation)?;
    let rate_density = RateDensity::new(options.rate_density, parameters.rate_mean, parameters.rate_cv)?;
    let probs = DupLossProbs::new(&discretiser, parameters.dup_rate, parameters.loss_rate)?;
    let helper = ReconciliationHelper::new(&guest, &mpr, &discretiser, options.max_implied_losses)?;
    let dlr = DlrModel::new(&guest, &lengths, &helper, &probs, &rate_density, &discretiser)?;

    let graph = DependencyGraph::new(DlrsNode::iter().map(|node| (node, node.parents())))?;
    debug!("Likelihood model nodes in update order: {:?}", graph.order());

    Ok(Self {
      graph,
      nodes: DlrsNodes {
        host_tree: StateParameter::new("host tree", host),
        host_times: StateParameter::new("host times", times),
        guest_tree: StateParameter::new("guest tree", guest),
        leaf_map: StateParameter::new("guest-to-host leaf map", mpr.leaf_map().clone()),
        lengths: StateParameter::new("branch lengths", lengths),
        dup_rate: StateParameter::new("duplication rate", parameters.dup_rate),
        loss_rate: StateParameter::new("loss rate", parameters.loss_rate),
        rate_mean: StateParameter::new("rate mean", parameters.rate_mean),
        rate_cv: StateParameter::new("rate coefficient of variation", parameters.rate_cv),
        discretiser,
        mpr,
        rate_density,
        probs,
        helper,
        dlr,
      },
      sample_realisations: options.sample_realisations,
    })
  }

  pub fn log_likelihood(&self) -> f64 {
    self.nodes.dlr.log_likelihood()
  }

  pub fn duplication_rate(&self) -> f64 {
    self.nodes.probs.dup_rate()
  }

  pub fn loss_rate(&self) -> f64 {
    self.nodes.probs.loss_rate()
  }

  pub fn host(&self) -> &RBTree {
    self.nodes.host_tree.value()
  }

  pub fn host_times(&self) -> &TimesMap {
    self.nodes.host_times.value()
  }

  pub fn guest(&self) -> &RBTree {
    self.nodes.guest_tree.value()
  }

  pub fn lengths(&self) -> &BranchLengths {
    self.nodes.lengths.value()
  }

  pub fn mpr(&self) -> &MprMap {
    &self.nodes.mpr
  }

  pub fn discretiser(&self) -> &ArcDiscretiser {
    &self.nodes.discretiser
  }

  pub fn helper(&self) -> &ReconciliationHelper {
    &self.nodes.helper
  }

  pub fn dlr(&self) -> &DlrModel {
    &self.nodes.dlr
  }

  /// Draws a dated embedding of the guest tree from the current likelihood tables
  pub fn sample_realisation(&self, rng: &mut (impl Rng + ?Sized)) -> Result<Realisation, Report> {
    if self.graph.is_pending() {
      return make_internal_error!("Cannot sample a realisation: the previous proposal is neither accepted nor rejected");
    }
    let inputs = DlrInputs {
      guest: self.guest(),
      lengths: self.lengths(),
      helper: self.helper(),
      probs: &self.nodes.probs,
      density: &self.nodes.rate_density,
      disc: self.discretiser(),
    };
    RealisationSampler::new(inputs, self.dlr()).sample(rng)
  }

  pub fn real_parameter(&self, parameter: RealParameter) -> f64 {
    *self.real_parameter_node(parameter).value()
  }

  fn real_parameter_node(&self, parameter: RealParameter) -> &StateParameter<f64> {
    match parameter {
      RealParameter::DupRate => &self.nodes.dup_rate,
      RealParameter::LossRate => &self.nodes.loss_rate,
      RealParameter::RateMean => &self.nodes.rate_mean,
      RealParameter::RateCv => &self.nodes.rate_cv,
    }
  }

  fn ensure_not_pending(&self, what: &str) -> Result<(), Report> {
    if self.graph.is_pending() {
      return make_internal_error!(
        "Cannot change {what}: the previous proposal is neither accepted nor rejected"
      );
    }
    Ok(())
  }

  pub fn set_real_parameter(&mut self, parameter: RealParameter, value: f64) -> Result<(), Report> {
    let node = match parameter {
      RealParameter::DupRate => &mut self.nodes.dup_rate,
      RealParameter::LossRate => &mut self.nodes.loss_rate,
      RealParameter::RateMean => &mut self.nodes.rate_mean,
      RealParameter::RateCv => &mut self.nodes.rate_cv,
    };
    if self.graph.is_pending() {
      return make_internal_error!(
        "Cannot change {}: the previous proposal is neither accepted nor rejected",
        node.name()
      );
    }
    ensure_positive(node.name(), value)?;
    node.set(value);
    Ok(())
  }

  pub fn set_dup_rate(&mut self, value: f64) -> Result<(), Report> {
    self.set_real_parameter(RealParameter::DupRate, value)
  }

  pub fn set_loss_rate(&mut self, value: f64) -> Result<(), Report> {
    self.set_real_parameter(RealParameter::LossRate, value)
  }

  pub fn set_rate_mean(&mut self, value: f64) -> Result<(), Report> {
    self.set_real_parameter(RealParameter::RateMean, value)
  }

  pub fn set_rate_cv(&mut self, value: f64) -> Result<(), Report> {
    self.set_real_parameter(RealParameter::RateCv, value)
  }

  pub fn set_branch_length(&mut self, u: usize, length: f64) -> Result<(), Report> {
    self.ensure_not_pending("branch lengths")?;
    self.nodes.lengths.update_with(|lengths| lengths.set(u, length))
  }

  pub fn set_host_vertex_time(&mut self, x: usize, time: f64) -> Result<(), Report> {
    self.ensure_not_pending("host times")?;
    let host = self.nodes.host_tree.value();
    self
      .nodes
      .host_times
      .update_with(|times| times.set_vertex_time(host, x, time))
  }

  /// Replaces all host times
  pub fn set_host_times(&mut self, times: TimesMap) -> Result<(), Report> {
    self.ensure_not_pending("host times")?;
    if times.n_vertices() != self.host().n_vertices() {
      return make_error!(
        "Host tree has {} vertices, but times are given for {}",
        self.host().n_vertices(),
        times.n_vertices()
      );
    }
    self.nodes.host_times.set(times);
    Ok(())
  }

  /// Replaces the guest tree together with the map from its leaves to host leaves.
  ///
  /// The vertex count must not change, so that the branch lengths still apply.
  pub fn set_guest_tree(&mut self, guest: RBTree, leaf_map: BTreeMap<usize, usize>) -> Result<(), Report> {
    self.ensure_not_pending("guest tree")?;
    if guest.n_vertices() != self.lengths().len() {
      return make_error!(
        "Guest tree has {} vertices, but {} branch lengths are given",
        guest.n_vertices(),
        self.lengths().len()
      );
    }
    MprMap::new(&guest, self.host(), leaf_map.clone()).wrap_err("When replacing guest tree")?;
    self.nodes.guest_tree.set(guest);
    self.nodes.leaf_map.set(leaf_map);
    Ok(())
  }

  /// Replaces the host tree together with its times
  pub fn set_host_tree(&mut self, host: RBTree, times: TimesMap) -> Result<(), Report> {
    self.ensure_not_pending("host tree")?;
    if times.n_vertices() != host.n_vertices() {
      return make_error!(
        "Host tree has {} vertices, but times are given for {}",
        host.n_vertices(),
        times.n_vertices()
      );
    }
    MprMap::new(self.guest(), &host, self.nodes.leaf_map.value().clone()).wrap_err("When replacing host tree")?;
    self.nodes.host_tree.set(host);
    self.nodes.host_times.set(times);
    Ok(())
  }

  /// Recomputes everything depending on the parameters changed since the last accept or reject
  pub fn update(&mut self, will_sample: bool) -> Result<(), Report> {
    let changes = self.graph.propagate(&mut self.nodes, will_sample)?;
    debug!("Updated likelihood model nodes: {:?}", changes.keys().collect::<Vec<_>>());
    Ok(())
  }

  pub fn accept(&mut self, will_sample: bool) -> Result<(), Report> {
    self.graph.accept(&mut self.nodes, will_sample)
  }

  pub fn reject(&mut self, will_sample: bool) -> Result<(), Report> {
    self.graph.reject(&mut self.nodes, will_sample)
  }
}

impl McmcModel for DlrsModel {
  type Sample = DlrsSample;

  fn update(&mut self, will_sample: bool) -> Result<(), Report> {
    DlrsModel::update(self, will_sample)
  }

  fn accept(&mut self, will_sample: bool) -> Result<(), Report> {
    DlrsModel::accept(self, will_sample)
  }

  fn reject(&mut self, will_sample: bool) -> Result<(), Report> {
    DlrsModel::reject(self, will_sample)
  }

  fn log_likelihood(&self) -> f64 {
    DlrsModel::log_likelihood(self)
  }

  fn sample(&self, rng: &mut dyn RngCore) -> Result<DlrsSample, Report> {
    let realisation = if self.sample_realisations {
      Some(self.sample_realisation(rng)?)
    } else {
      None
    };
    Ok(DlrsSample {
      log_likelihood: self.log_likelihood(),
      dup_rate: self.duplication_rate(),
      loss_rate: self.loss_rate(),
      rate_mean: self.nodes.rate_density.mean(),
      rate_cv: self.nodes.rate_density.cv(),
      realisation,
    })
  }
}

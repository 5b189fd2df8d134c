use crate::dlrs::model::{DlrsModel, DlrsSample, RealParameter};
use crate::dlrs::options::{ChainOptions, DlrsOptions, DlrsParameters};
use crate::io::json::{json_read_file, json_write_file, JsonPretty};
use crate::mcmc::chain::{AcceptanceStats, Chain, Sample};
use crate::mcmc::proposer::{BranchLengthProposer, Proposer, RealParameterProposer};
use crate::topology::lengths::BranchLengths;
use crate::topology::mpr::MprMap;
use crate::topology::rbtree::RBTree;
use crate::topology::times::TimesMap;
use eyre::{Report, WrapErr};
use log::info;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::collections::BTreeMap;
use std::path::Path;

/// Step sizes and selection weights of the proposers. A zero weight disables a proposer.
#[derive(Clone, Debug, SmartDefault, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalOptions {
  #[default = 0.05]
  pub rate_step: f64,

  #[default = 1.0]
  pub dup_rate_weight: f64,

  #[default = 1.0]
  pub loss_rate_weight: f64,

  #[default = 0.5]
  pub rate_mean_weight: f64,

  #[default = 0.5]
  pub rate_cv_weight: f64,

  #[default = 0.05]
  pub branch_length_step: f64,

  #[default = 2]
  pub max_branches: usize,

  #[default = 2.0]
  pub branch_length_weight: f64,
}

/// Trees are given by the parent of every vertex, `null` for the root
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeInput {
  pub parents: Vec<Option<usize>>,
  #[serde(default)]
  pub names: BTreeMap<usize, String>,
}

impl TreeInput {
  pub fn to_tree(&self) -> Result<RBTree, Report> {
    RBTree::from_parents(self.parents.clone())?.with_names(self.names.clone())
  }
}

/// Everything needed for one sampling run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
  pub host: TreeInput,
  pub host_times: Vec<f64>,
  pub stem_time: f64,
  pub guest: TreeInput,
  /// Guest leaf name to host leaf name
  pub leaf_map: BTreeMap<String, String>,
  pub branch_lengths: Vec<f64>,
  #[serde(default)]
  pub parameters: DlrsParameters,
  #[serde(default)]
  pub model: DlrsOptions,
  #[serde(default)]
  pub chain: ChainOptions,
  #[serde(default)]
  pub proposals: ProposalOptions,
}

/// Events implied by the most parsimonious reconciliation of the input trees
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
  pub duplications: usize,
  pub losses: usize,
}

impl ReconciliationSummary {
  pub fn of(model: &DlrsModel) -> Self {
    let mpr = model.mpr();
    Self {
      duplications: mpr.n_duplications(model.guest()),
      losses: mpr.n_losses(model.guest(), model.host()),
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOutput {
  pub reconciliation: ReconciliationSummary,
  pub samples: Vec<Sample<DlrsSample>>,
  pub acceptance: BTreeMap<String, AcceptanceStats>,
}

/// Chain settings given on the command line, taking precedence over the run input
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainOverrides {
  pub iterations: Option<usize>,
  pub thinning: Option<usize>,
  pub seed: Option<u64>,
}

impl ChainOverrides {
  pub fn apply(&self, options: &mut ChainOptions) {
    if let Some(iterations) = self.iterations {
      options.iterations = iterations;
    }
    if let Some(thinning) = self.thinning {
      options.thinning = thinning;
    }
    if self.seed.is_some() {
      options.seed = self.seed;
    }
  }
}

impl RunInput {
  pub fn from_file(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    json_read_file(filepath).wrap_err("When reading sampling run input")
  }

  pub fn build_model(&self) -> Result<DlrsModel, Report> {
    let host = self.host.to_tree().wrap_err("When reading host tree")?;
    let guest = self.guest.to_tree().wrap_err("When reading guest tree")?;
    let times = TimesMap::new(&host, self.host_times.clone(), self.stem_time).wrap_err("When reading host times")?;
    let mpr = MprMap::from_names(&guest, &host, &self.leaf_map)?;
    let lengths = BranchLengths::new(&guest, self.branch_lengths.clone()).wrap_err("When reading branch lengths")?;
    DlrsModel::new(host, times, guest, mpr, lengths, &self.parameters, &self.model)
  }

  pub fn build_proposers(&self) -> Result<Vec<Box<dyn Proposer<DlrsModel>>>, Report> {
    let p = &self.proposals;
    let mut proposers: Vec<Box<dyn Proposer<DlrsModel>>> = vec![];
    for (parameter, weight) in [
      (RealParameter::DupRate, p.dup_rate_weight),
      (RealParameter::LossRate, p.loss_rate_weight),
      (RealParameter::RateMean, p.rate_mean_weight),
      (RealParameter::RateCv, p.rate_cv_weight),
    ] {
      if weight > 0.0 {
        proposers.push(Box::new(RealParameterProposer::new(parameter, p.rate_step, weight)?));
      }
    }
    if p.branch_length_weight > 0.0 {
      proposers.push(Box::new(BranchLengthProposer::new(
        p.branch_length_step,
        p.max_branches,
        p.branch_length_weight,
      )?));
    }
    Ok(proposers)
  }

  pub fn run(&self) -> Result<RunOutput, Report> {
    let model = self.build_model()?;
    let reconciliation = ReconciliationSummary::of(&model);
    info!(
      "Initial log-likelihood: {}, parsimonious reconciliation implies {} duplications and {} losses",
      model.log_likelihood(),
      reconciliation.duplications,
      reconciliation.losses
    );
    let mut chain = Chain::new(model, self.build_proposers()?, self.chain.clone())?;
    let samples = chain.run_seeded()?;
    Ok(RunOutput {
      reconciliation,
      samples,
      acceptance: chain.stats().into_iter().collect(),
    })
  }
}

/// Reads a run input, samples, and writes samples with acceptance statistics
pub fn run_file(input: impl AsRef<Path>, output: impl AsRef<Path>, overrides: &ChainOverrides) -> Result<(), Report> {
  let mut input = RunInput::from_file(input)?;
  overrides.apply(&mut input.chain);
  let result = input.run()?;
  json_write_file(output, &result, JsonPretty(true)).wrap_err("When writing samples")
}

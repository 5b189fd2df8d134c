use crate::dlrs::model::{DlrsModel, RealParameter};
use crate::make_error;
use crate::utils::error::ensure_positive;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use rand::distributions::Distribution;
use rand::seq::index::sample;
use rand::{Rng, RngCore};
use statrs::distribution::Normal;

/// Perturbs a model to propose the next state of a Markov chain
pub trait Proposer<M> {
  fn name(&self) -> String;

  /// Relative frequency with which the chain picks this proposer
  fn weight(&self) -> f64;

  /// Perturbs the model parameters and returns the log Hastings ratio of the proposal
  fn propose(&mut self, model: &mut M, rng: &mut dyn RngCore) -> Result<f64, Report>;
}

/// Folds a value back into `[lower, upper]` by reflecting at the bounds
pub fn reflect_into(value: f64, lower: f64, upper: f64) -> f64 {
  let mut x = value;
  loop {
    if x < lower {
      x = 2.0 * lower - x;
    } else if x > upper {
      x = 2.0 * upper - x;
    } else {
      return x;
    }
  }
}

fn normal_step(sd: f64) -> Result<Normal, Report> {
  ensure_positive("proposal step size", sd)?;
  Ok(Normal::new(0.0, sd)?)
}

/// Symmetric normal random walk on one real-valued parameter, reflected into a positive interval
#[derive(Clone, Debug)]
pub struct RealParameterProposer {
  parameter: RealParameter,
  step: Normal,
  lower: f64,
  upper: f64,
  weight: f64,
}

impl RealParameterProposer {
  pub fn new(parameter: RealParameter, step: f64, weight: f64) -> Result<Self, Report> {
    Self::with_bounds(parameter, step, 1e-6, f64::INFINITY, weight)
  }

  pub fn with_bounds(parameter: RealParameter, step: f64, lower: f64, upper: f64, weight: f64) -> Result<Self, Report> {
    ensure_positive("lower bound of proposed values", lower)?;
    if upper <= lower {
      return make_error!("Upper bound {upper} of proposed {parameter} must be above lower bound {lower}");
    }
    ensure_positive("proposer weight", weight)?;
    let step = normal_step(step).wrap_err_with(|| format!("When creating proposer for {parameter}"))?;
    Ok(Self {
      parameter,
      step,
      lower,
      upper,
      weight,
    })
  }
}

impl Proposer<DlrsModel> for RealParameterProposer {
  fn name(&self) -> String {
    self.parameter.to_string()
  }

  fn weight(&self) -> f64 {
    self.weight
  }

  fn propose(&mut self, model: &mut DlrsModel, rng: &mut dyn RngCore) -> Result<f64, Report> {
    let current = model.real_parameter(self.parameter);
    let proposed = reflect_into(current + self.step.sample(rng), self.lower, self.upper);
    model.set_real_parameter(self.parameter, proposed)?;
    Ok(0.0)
  }
}

/// Symmetric normal random walk on a few guest branch lengths at once, reflected at a lower bound.
///
/// The root branch is never touched: it does not contribute to the likelihood.
#[derive(Clone, Debug)]
pub struct BranchLengthProposer {
  step: Normal,
  lower: f64,
  max_branches: usize,
  weight: f64,
}

impl BranchLengthProposer {
  pub fn new(step: f64, max_branches: usize, weight: f64) -> Result<Self, Report> {
    if max_branches == 0 {
      return make_error!("Branch length proposer must perturb at least one branch");
    }
    ensure_positive("proposer weight", weight)?;
    Ok(Self {
      step: normal_step(step).wrap_err("When creating branch length proposer")?,
      lower: 1e-6,
      max_branches,
      weight,
    })
  }
}

impl Proposer<DlrsModel> for BranchLengthProposer {
  fn name(&self) -> String {
    "BranchLengths".to_owned()
  }

  fn weight(&self) -> f64 {
    self.weight
  }

  fn propose(&mut self, model: &mut DlrsModel, rng: &mut dyn RngCore) -> Result<f64, Report> {
    let guest = model.guest();
    let candidates = (0..guest.n_vertices()).filter(|&u| !guest.is_root(u)).collect_vec();
    if candidates.is_empty() {
      return make_error!("Guest tree has no branches to perturb");
    }

    let n = rng.gen_range(1..=self.max_branches.min(candidates.len()));
    let chosen = sample(rng, candidates.len(), n).into_iter().map(|i| candidates[i]).collect_vec();
    for u in chosen {
      let proposed = reflect_into(model.lengths().get(u) + self.step.sample(rng), self.lower, f64::INFINITY);
      model.set_branch_length(u, proposed)?;
    }
    Ok(0.0)
  }
}

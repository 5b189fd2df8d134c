use crate::dlrs::options::ChainOptions;
use crate::make_error;
use crate::mcmc::proposer::Proposer;
use crate::utils::random::{get_random_number_generator, random_unit_open_closed, random_weighted_index};
use eyre::{Report, WrapErr};
use getset::CopyGetters;
use itertools::Itertools;
use log::{debug, info};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// A model driven by a Metropolis-Hastings chain.
///
/// After its proposers perturb it, the model is updated once and then either accepted or rejected.
pub trait McmcModel {
  type Sample: Serialize;

  fn update(&mut self, will_sample: bool) -> Result<(), Report>;

  fn accept(&mut self, will_sample: bool) -> Result<(), Report>;

  fn reject(&mut self, will_sample: bool) -> Result<(), Report>;

  fn log_likelihood(&self) -> f64;

  /// Records the current state. Models may draw from `rng` to attach sampled quantities.
  fn sample(&self, rng: &mut dyn RngCore) -> Result<Self::Sample, Report>;
}

/// How often a proposer was picked and how often its proposals were accepted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct AcceptanceStats {
  proposed: usize,
  accepted: usize,
}

impl AcceptanceStats {
  pub fn acceptance_rate(&self) -> f64 {
    if self.proposed == 0 {
      return 0.0;
    }
    self.accepted as f64 / self.proposed as f64
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample<S> {
  pub iteration: usize,
  #[serde(flatten)]
  pub state: S,
}

/// Metropolis-Hastings sampler
pub struct Chain<M: McmcModel> {
  model: M,
  proposers: Vec<Box<dyn Proposer<M>>>,
  weights: Vec<f64>,
  stats: Vec<AcceptanceStats>,
  options: ChainOptions,
}

impl<M: McmcModel> Chain<M> {
  pub fn new(model: M, proposers: Vec<Box<dyn Proposer<M>>>, options: ChainOptions) -> Result<Self, Report> {
    options.validate().wrap_err("When creating Markov chain")?;
    if proposers.is_empty() {
      return make_error!("Markov chain needs at least one proposer");
    }
    let weights = proposers.iter().map(|p| p.weight()).collect_vec();
    let stats = vec![AcceptanceStats::default(); proposers.len()];
    Ok(Self {
      model,
      proposers,
      weights,
      stats,
      options,
    })
  }

  pub const fn model(&self) -> &M {
    &self.model
  }

  pub fn into_model(self) -> M {
    self.model
  }

  /// Acceptance statistics by proposer name
  pub fn stats(&self) -> Vec<(String, AcceptanceStats)> {
    self
      .proposers
      .iter()
      .zip(&self.stats)
      .map(|(p, s)| (p.name(), *s))
      .collect()
  }

  /// Runs the chain with a generator seeded from the options
  pub fn run_seeded(&mut self) -> Result<Vec<Sample<M::Sample>>, Report> {
    let mut rng = get_random_number_generator(self.options.seed);
    self.run(&mut rng)
  }

  /// Runs the configured number of iterations and returns the initial state and every thinned state.
  ///
  /// Any failure aborts the run: no samples are returned.
  pub fn run(&mut self, rng: &mut impl Rng) -> Result<Vec<Sample<M::Sample>>, Report> {
    let ChainOptions {
      iterations,
      thinning,
      ..
    } = self.options;
    info!("Starting Markov chain: {iterations} iterations, sampling every {thinning}");

    let mut current = self.model.log_likelihood();
    let mut samples = vec![Sample {
      iteration: 0,
      state: self.model.sample(&mut *rng)?,
    }];

    for iteration in 1..=iterations {
      let will_sample = iteration % thinning == 0;
      self
        .step(rng, current, will_sample)
        .wrap_err_with(|| format!("When running Markov chain iteration {iteration}"))?;
      current = self.model.log_likelihood();
      if will_sample {
        samples.push(Sample {
          iteration,
          state: self
            .model
            .sample(&mut *rng)
            .wrap_err_with(|| format!("When sampling Markov chain iteration {iteration}"))?,
        });
      }
    }

    for (name, stats) in self.stats() {
      info!(
        "Proposer {name}: accepted {} of {} ({:.3})",
        stats.accepted,
        stats.proposed,
        stats.acceptance_rate()
      );
    }
    Ok(samples)
  }

  fn step(&mut self, rng: &mut impl Rng, current: f64, will_sample: bool) -> Result<(), Report> {
    let i = random_weighted_index(&self.weights, rng)?;
    let rng_dyn: &mut dyn RngCore = &mut *rng;
    let log_hastings_ratio = self.proposers[i].propose(&mut self.model, rng_dyn)?;
    self.model.update(will_sample)?;

    let proposed = self.model.log_likelihood();
    let log_ratio = proposed - current + log_hastings_ratio;
    let accepted = !log_ratio.is_nan() && random_unit_open_closed(rng).ln() < log_ratio;
    self.stats[i].proposed += 1;
    if accepted {
      self.model.accept(will_sample)?;
      self.stats[i].accepted += 1;
    } else {
      self.model.reject(will_sample)?;
    }
    debug!(
      "{} proposal {}: log-likelihood {current} -> {proposed}",
      self.proposers[i].name(),
      if accepted { "accepted" } else { "rejected" }
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dlrs::model::{DlrsModel, RealParameter};
  use crate::dlrs::options::{DiscretisationOptions, DlrsOptions, DlrsParameters};
  use crate::io::json::{json_write_str, JsonPretty};
  use crate::mcmc::proposer::{BranchLengthProposer, RealParameterProposer};
  use crate::topology::lengths::BranchLengths;
  use crate::topology::mpr::MprMap;
  use crate::topology::rbtree::tests::four_leaf_tree;
  use crate::topology::rbtree::RBTree;
  use crate::topology::times::TimesMap;
  use approx::assert_ulps_eq;
  use maplit::btreemap;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn model() -> Result<DlrsModel, Report> {
    let host = four_leaf_tree()?;
    let times = TimesMap::new(&host, vec![0.0, 0.0, 0.3, 0.0, 0.0, 0.6, 1.0], 0.5)?;
    let guest = RBTree::from_parents(vec![Some(5), Some(5), Some(7), Some(6), Some(6), Some(7), Some(8), Some(8), None])?;
    let mpr = MprMap::new(&guest, &host, btreemap! { 0 => 0, 1 => 1, 2 => 0, 3 => 3, 4 => 3 })?;
    let lengths = BranchLengths::new(&guest, vec![0.35, 0.5, 0.7, 0.4, 0.45, 0.3, 0.2, 0.25, 0.1])?;
    let options = DlrsOptions {
      discretisation: DiscretisationOptions::uniform(3),
      ..DlrsOptions::default()
    };
    DlrsModel::new(host, times, guest, mpr, lengths, &DlrsParameters::default(), &options)
  }

  fn proposers() -> Result<Vec<Box<dyn Proposer<DlrsModel>>>, Report> {
    let mut proposers: Vec<Box<dyn Proposer<DlrsModel>>> = vec![];
    proposers.push(Box::new(RealParameterProposer::new(RealParameter::DupRate, 0.05, 1.0)?));
    proposers.push(Box::new(RealParameterProposer::new(RealParameter::LossRate, 0.05, 1.0)?));
    proposers.push(Box::new(RealParameterProposer::new(RealParameter::RateCv, 0.1, 0.5)?));
    proposers.push(Box::new(BranchLengthProposer::new(0.05, 2, 2.0)?));
    Ok(proposers)
  }

  fn options(seed: u64) -> ChainOptions {
    ChainOptions {
      iterations: 200,
      thinning: 10,
      seed: Some(seed),
    }
  }

  #[rstest]
  fn samples_every_thinned_iteration() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(3));
    let mut chain = Chain::new(model()?, proposers()?, options(3))?;
    let samples = chain.run(&mut rng)?;

    let iterations = samples.iter().map(|s| s.iteration).collect_vec();
    assert_eq!(iterations, (0..=200).step_by(10).collect_vec());

    let stats = chain.stats();
    assert_eq!(stats.iter().map(|(_, s)| s.proposed()).sum::<usize>(), 200);
    assert!(stats.iter().any(|(_, s)| s.accepted() > 0));
    for (_, s) in &stats {
      assert!(s.accepted() <= s.proposed());
    }
    Ok(())
  }

  #[rstest]
  fn recorded_state_matches_model() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(11));
    let mut chain = Chain::new(model()?, proposers()?, options(11))?;
    let samples = chain.run(&mut rng)?;
    let last = samples.last().unwrap();
    let model = chain.into_model();
    assert_ulps_eq!(last.state.log_likelihood, model.log_likelihood());
    assert_ulps_eq!(last.state.dup_rate, model.duplication_rate());
    assert!(model.duplication_rate() > 0.0 && model.loss_rate() > 0.0);
    Ok(())
  }

  #[rstest]
  fn same_seed_gives_same_samples() -> Result<(), Report> {
    let run = |seed| -> Result<String, Report> {
      let samples = Chain::new(model()?, proposers()?, options(seed))?.run_seeded()?;
      json_write_str(&samples, JsonPretty(false))
    };
    assert_eq!(run(5)?, run(5)?);
    Ok(())
  }

  #[rstest]
  fn serialises_samples_flat() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(1));
    let sample = Sample {
      iteration: 7,
      state: model()?.sample(&mut rng)?,
    };
    let json = json_write_str(&sample, JsonPretty(false))?;
    assert!(json.starts_with(r#"{"iteration":7,"log_likelihood":"#));
    assert!(json.contains(r#""rate_cv":0.5"#));
    assert!(!json.contains("realisation"));
    Ok(())
  }

  #[rstest]
  fn rejects_empty_proposers() -> Result<(), Report> {
    assert!(Chain::new(model()?, vec![], options(1)).is_err());
    Ok(())
  }
}

use crate::make_error;
use crate::math::rate_density::RateDensityKind;
use crate::utils::error::ensure_positive;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// How host arcs are split into time slices.
///
/// An arc of time `t` gets `min(max(min_slices, ceil(t / timestep)), max_slices)` slices. The stem arc above the root
/// gets `root_slices` instead, when set.
#[derive(Clone, Debug, SmartDefault, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscretisationOptions {
  #[default = 3]
  pub min_slices: usize,

  #[default = 10]
  pub max_slices: usize,

  #[default = 0.05]
  pub timestep: f64,

  #[default(None)]
  pub root_slices: Option<usize>,
}

impl DiscretisationOptions {
  /// Same number of slices on every arc
  pub fn uniform(slices: usize) -> Self {
    Self {
      min_slices: slices,
      max_slices: slices,
      ..Self::default()
    }
  }

  pub fn validate(&self) -> Result<(), Report> {
    if self.min_slices == 0 {
      return make_error!("Minimum number of slices per arc must be at least 1");
    }
    if self.max_slices < self.min_slices {
      return make_error!(
        "Maximum number of slices per arc ({}) must not be smaller than the minimum ({})",
        self.max_slices,
        self.min_slices
      );
    }
    if self.min_slices != self.max_slices {
      ensure_positive("discretisation timestep", self.timestep)?;
    }
    if self.root_slices == Some(0) {
      return make_error!("Number of slices on the stem arc must be at least 1");
    }
    Ok(())
  }

  /// Number of slices for an ordinary arc of the given time
  pub fn slices_for(&self, arc_time: f64) -> usize {
    if self.min_slices == self.max_slices {
      return self.min_slices;
    }
    let wanted = (arc_time / self.timestep).ceil();
    // Slice counts beyond the range of usize clamp to max_slices
    let wanted = if wanted.is_finite() && wanted >= 0.0 { wanted as usize } else { usize::MAX };
    wanted.clamp(self.min_slices, self.max_slices)
  }
}

/// Configuration of the likelihood model
#[derive(Clone, Debug, SmartDefault, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlrsOptions {
  pub discretisation: DiscretisationOptions,

  /// Placements of a guest vertex implying more lost lineages than this are not considered
  #[default = 100]
  pub max_implied_losses: usize,

  pub rate_density: RateDensityKind,

  /// Attach a dated embedding of the guest tree to every recorded state
  #[default = false]
  pub sample_realisations: bool,
}

impl DlrsOptions {
  pub fn validate(&self) -> Result<(), Report> {
    self
      .discretisation
      .validate()
      .wrap_err("When validating discretisation options")
  }
}

/// Initial values of the real-valued model parameters
#[derive(Clone, Debug, SmartDefault, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlrsParameters {
  #[default = 0.1]
  pub dup_rate: f64,

  #[default = 0.1]
  pub loss_rate: f64,

  /// Mean of the substitution rate density
  #[default = 1.0]
  pub rate_mean: f64,

  /// Coefficient of variation of the substitution rate density
  #[default = 0.5]
  pub rate_cv: f64,
}

impl DlrsParameters {
  pub fn validate(&self) -> Result<(), Report> {
    ensure_positive("duplication rate", self.dup_rate)?;
    ensure_positive("loss rate", self.loss_rate)?;
    ensure_positive("rate mean", self.rate_mean)?;
    ensure_positive("rate coefficient of variation", self.rate_cv)?;
    Ok(())
  }
}

/// Configuration of a sampling run
#[derive(Clone, Debug, SmartDefault, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOptions {
  #[default = 10000]
  pub iterations: usize,

  /// Record every n-th state
  #[default = 100]
  pub thinning: usize,

  /// Random seed. Entropy from the operating system is used when not set.
  #[default(None)]
  pub seed: Option<u64>,
}

impl ChainOptions {
  pub fn validate(&self) -> Result<(), Report> {
    if self.thinning == 0 {
      return make_error!("Thinning must be at least 1");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::json::json_read_str;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case(0.01, 3)]
  #[case(0.2, 4)]
  #[case(0.22, 5)]
  #[case(10.0, 10)]
  #[case(1e300, 10)]
  fn clamps_slice_count(#[case] arc_time: f64, #[case] expected: usize) {
    assert_eq!(DiscretisationOptions::default().slices_for(arc_time), expected);
  }

  #[rstest]
  fn uniform_ignores_timestep() -> Result<(), Report> {
    let options = DiscretisationOptions {
      timestep: 0.0,
      ..DiscretisationOptions::uniform(2)
    };
    options.validate()?;
    assert_eq!(options.slices_for(100.0), 2);
    Ok(())
  }

  #[rstest]
  #[case(DiscretisationOptions { min_slices: 0, ..DiscretisationOptions::default() })]
  #[case(DiscretisationOptions { max_slices: 2, ..DiscretisationOptions::default() })]
  #[case(DiscretisationOptions { timestep: -0.1, ..DiscretisationOptions::default() })]
  #[case(DiscretisationOptions { root_slices: Some(0), ..DiscretisationOptions::default() })]
  fn rejects_invalid_discretisation(#[case] options: DiscretisationOptions) {
    assert!(options.validate().is_err());
  }

  #[rstest]
  fn reads_partial_json_with_defaults() -> Result<(), Report> {
    let options: DlrsOptions = json_read_str(r#"{ "discretisation": { "max_slices": 20 }, "rate_density": "LogNormal" }"#)?;
    assert_eq!(options.discretisation.max_slices, 20);
    assert_eq!(options.discretisation.min_slices, 3);
    assert_eq!(options.max_implied_losses, 100);
    assert_eq!(options.rate_density, RateDensityKind::LogNormal);
    assert!(!options.sample_realisations);
    Ok(())
  }

  #[rstest]
  #[case(DlrsParameters { dup_rate: 0.0, ..DlrsParameters::default() })]
  #[case(DlrsParameters { loss_rate: -0.1, ..DlrsParameters::default() })]
  #[case(DlrsParameters { rate_cv: f64::NAN, ..DlrsParameters::default() })]
  fn rejects_non_positive_parameters(#[case] parameters: DlrsParameters) {
    assert!(parameters.validate().is_err());
  }
}

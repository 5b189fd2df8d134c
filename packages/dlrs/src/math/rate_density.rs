use crate::make_error;
use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::utils::error::ensure_positive;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Gamma, LogNormal, Uniform};
use strum_macros::{Display, EnumString};

/// Family of the relaxed-clock substitution rate distribution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum RateDensityKind {
  #[default]
  Gamma,
  LogNormal,
  Uniform,
  /// Strict clock: the density is 1 everywhere and rates are not integrated over
  Flat,
}

#[derive(Clone, Debug)]
enum Density {
  Gamma(Gamma),
  LogNormal(LogNormal),
  Uniform(Uniform),
  Flat,
}

impl Density {
  fn new(kind: RateDensityKind, mean: f64, cv: f64) -> Result<Self, Report> {
    ensure_positive("rate mean", mean)?;
    ensure_positive("rate coefficient of variation", cv)?;
    let density = match kind {
      RateDensityKind::Gamma => {
        let shape = 1.0 / (cv * cv);
        let scale = mean * cv * cv;
        Self::Gamma(Gamma::new(shape, 1.0 / scale)?)
      }
      RateDensityKind::LogNormal => {
        let sigma2 = (1.0 + cv * cv).ln();
        let mu = mean.ln() - sigma2 / 2.0;
        Self::LogNormal(LogNormal::new(mu, sigma2.sqrt())?)
      }
      RateDensityKind::Uniform => {
        let half_width = 3.0_f64.sqrt() * mean * cv;
        if half_width >= mean {
          return make_error!(
            "Uniform rate density with mean {mean} and coefficient of variation {cv} would extend to negative rates"
          );
        }
        Self::Uniform(Uniform::new(mean - half_width, mean + half_width)?)
      }
      RateDensityKind::Flat => Self::Flat,
    };
    Ok(density)
  }

  fn pdf(&self, rate: f64) -> f64 {
    match self {
      Self::Gamma(d) => d.pdf(rate),
      Self::LogNormal(d) => d.pdf(rate),
      Self::Uniform(d) => d.pdf(rate),
      Self::Flat => 1.0,
    }
  }
}

/// Substitution rate density parameterised by mean and coefficient of variation
#[derive(Clone, Debug)]
pub struct RateDensity {
  kind: RateDensityKind,
  mean: f64,
  cv: f64,
  density: Density,
  cache: Option<(f64, f64, Density)>,
}

pub struct RateDensityParents<'a> {
  pub mean: Parent<'a, f64>,
  pub cv: Parent<'a, f64>,
}

impl RateDensity {
  pub fn new(kind: RateDensityKind, mean: f64, cv: f64) -> Result<Self, Report> {
    let density = Density::new(kind, mean, cv).wrap_err_with(|| format!("When creating {kind} rate density"))?;
    Ok(Self {
      kind,
      mean,
      cv,
      density,
      cache: None,
    })
  }

  pub const fn kind(&self) -> RateDensityKind {
    self.kind
  }

  pub const fn mean(&self) -> f64 {
    self.mean
  }

  pub const fn cv(&self) -> f64 {
    self.cv
  }

  pub fn pdf(&self, rate: f64) -> f64 {
    self.density.pdf(rate)
  }
}

impl ProperDependent for RateDensity {
  type Parents<'a> = RateDensityParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let mean = *parents.mean.value;
    let cv = *parents.cv.value;
    let density =
      Density::new(self.kind, mean, cv).wrap_err_with(|| format!("When updating {} rate density", self.kind))?;
    let old_density = std::mem::replace(&mut self.density, density);
    self.cache = Some((self.mean, self.cv, old_density));
    self.mean = mean;
    self.cv = cv;
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    if let Some((mean, cv, density)) = self.cache.take() {
      self.mean = mean;
      self.cv = cv;
      self.density = density;
    }
  }
}

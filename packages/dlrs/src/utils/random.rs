use crate::make_internal_report;
use eyre::Report;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_isaac::Isaac64Rng;

pub fn get_random_number_generator(seed: Option<u64>) -> (impl Rng + Send + Sync + Clone) {
  match seed {
    None => Isaac64Rng::from_entropy(),
    Some(seed) => Isaac64Rng::seed_from_u64(seed),
  }
}

/// Draws an index with probability proportional to its weight
pub fn random_weighted_index(weights: &[f64], rng: &mut (impl Rng + ?Sized)) -> Result<usize, Report> {
  let dist = WeightedIndex::new(weights)
    .map_err(|err| make_internal_report!("random_weighted_index: invalid weights {weights:?}: {err}"))?;
  Ok(dist.sample(rng))
}

/// Draws a uniform number from the half-open interval (0, 1]
pub fn random_unit_open_closed(rng: &mut (impl Rng + ?Sized)) -> f64 {
  1.0 - rng.gen::<f64>()
}

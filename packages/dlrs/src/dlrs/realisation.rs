use crate::dlrs::dlr_model::{placement_weights, DlrInputs, DlrModel};
use crate::make_error;
use crate::topology::point::Point;
use crate::utils::random::random_weighted_index;
use eyre::{Report, WrapErr};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// What a guest vertex represents in a realisation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum GuestEvent {
  Leaf,
  Speciation,
  Duplication,
}

/// A dated embedding of the guest tree in the discretised host tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Realisation {
  pub placements: Vec<Point>,
  pub times: Vec<f64>,
  pub events: Vec<GuestEvent>,
}

impl Realisation {
  pub fn n_duplications(&self) -> usize {
    self.events.iter().filter(|&&e| e == GuestEvent::Duplication).count()
  }
}

/// Draws realisations from the posterior over guest vertex placements given the current likelihood tables.
///
/// Vertices are placed from the root down. The root is placed below the host tip, and every other vertex below its
/// parent's placement, each with probability proportional to its term in `belows`.
pub struct RealisationSampler<'a> {
  inputs: DlrInputs<'a>,
  dlr: &'a DlrModel,
}

impl<'a> RealisationSampler<'a> {
  pub(crate) const fn new(inputs: DlrInputs<'a>, dlr: &'a DlrModel) -> Self {
    Self { inputs, dlr }
  }

  pub fn sample(&self, rng: &mut (impl Rng + ?Sized)) -> Result<Realisation, Report> {
    let DlrInputs {
      guest,
      helper,
      disc,
      ..
    } = self.inputs;
    let likelihood = self.dlr.likelihood();
    if likelihood.is_nan() || likelihood <= 0.0 {
      return make_error!("Cannot sample a realisation of a guest tree with likelihood {likelihood}");
    }

    let mut placements = vec![helper.tip(); guest.n_vertices()];
    for u in guest.topological_order() {
      let upper = guest.parent(u).map_or_else(|| helper.tip(), |p| placements[p]);
      let weights = placement_weights(&self.inputs, self.dlr.ats(u), u, upper);
      let k = random_weighted_index(&weights, &mut *rng)
        .wrap_err_with(|| format!("When sampling the placement of guest vertex {u} below {upper}"))?;
      placements[u] = (0..k).fold(helper.lo_lim(u), |p, _| disc.next_point(p));
    }

    let times = placements.iter().map(|&p| disc.pt_time(p)).collect();
    let events = placements
      .iter()
      .enumerate()
      .map(|(u, p)| match (guest.is_leaf(u), p.is_vertex()) {
        (true, _) => GuestEvent::Leaf,
        (false, true) => GuestEvent::Speciation,
        (false, false) => GuestEvent::Duplication,
      })
      .collect();

    Ok(Realisation {
      placements,
      times,
      events,
    })
  }
}

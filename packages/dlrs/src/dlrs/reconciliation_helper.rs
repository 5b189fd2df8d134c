use crate::make_error;
use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::topology::discretiser::ArcDiscretiser;
use crate::topology::mpr::MprMap;
use crate::topology::point::Point;
use crate::topology::rbtree::RBTree;
use eyre::{Report, WrapErr};
use log::{debug, trace};
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
struct Placements {
  lo_lims: Vec<Point>,
  up_lims: Vec<Point>,
  counts: Vec<usize>,
}

/// Viable placements of guest vertices on the discretised host tree.
///
/// A guest vertex `u` may be placed on any discretisation point from `lo_lim(u)` upward, strictly below every viable
/// placement of its parent, and at most `max_implied_losses` host arcs above its reconciliation anchor.
#[derive(Clone, Debug)]
pub struct ReconciliationHelper {
  max_implied_losses: usize,
  tip: Point,
  placements: Placements,
  cache: Option<(Point, Placements)>,
}

pub struct ReconciliationHelperParents<'a> {
  pub guest: Parent<'a, RBTree>,
  pub mpr: Parent<'a, MprMap>,
  pub discretiser: Parent<'a, ArcDiscretiser>,
}

impl ReconciliationHelper {
  pub fn new(
    guest: &RBTree,
    mpr: &MprMap,
    disc: &ArcDiscretiser,
    max_implied_losses: usize,
  ) -> Result<Self, Report> {
    let placements = Self::compute(guest, mpr, disc, max_implied_losses)?;
    Ok(Self {
      max_implied_losses,
      tip: disc.tip_point(),
      placements,
      cache: None,
    })
  }

  pub const fn max_implied_losses(&self) -> usize {
    self.max_implied_losses
  }

  /// The single point above every placement, at the top of the host stem arc
  pub const fn tip(&self) -> Point {
    self.tip
  }

  /// Lowest viable placement of guest vertex `u`
  pub fn lo_lim(&self, u: usize) -> Point {
    self.placements.lo_lims[u]
  }

  /// Uppermost viable placement of guest vertex `u`
  pub fn up_lim(&self, u: usize) -> Point {
    self.placements.up_lims[u]
  }

  pub fn no_of_placements(&self, u: usize) -> usize {
    self.placements.counts[u]
  }

  fn compute(
    guest: &RBTree,
    mpr: &MprMap,
    disc: &ArcDiscretiser,
    max_implied_losses: usize,
  ) -> Result<Placements, Report> {
    let lo_lims = Self::compute_lo_lims(guest, mpr, disc)?;
    let n = guest.n_vertices();
    let mut up_lims = vec![disc.tip_point(); n];
    let mut counts = vec![0; n];
    let host = disc.host();

    // Parents first: the uppermost placement of the parent bounds the placements of its children
    for u in guest.topological_order() {
      let bound = guest.parent(u).map_or_else(|| disc.tip_point(), |p| up_lims[p]);
      let lo = lo_lims[u];
      if guest.is_leaf(u) {
        up_lims[u] = lo;
        counts[u] = 1;
        continue;
      }

      let sigma = mpr.sigma(u);
      let mut losses = host.depth(sigma) - host.depth(lo.arc);
      if losses > max_implied_losses {
        return make_error!(
          "Insufficient number of discretisation points: the lowest placement {lo} of guest vertex {u} implies {losses} \
           losses above host arc {sigma}, but at most {max_implied_losses} are allowed"
        );
      }

      let mut p = lo;
      let mut count = 0;
      while !(p.arc == bound.arc && p.index >= bound.index) && losses <= max_implied_losses {
        count += 1;
        up_lims[u] = p;
        let next = disc.next_point(p);
        if next.arc != p.arc {
          losses += 1;
        }
        p = next;
      }
      counts[u] = count;
    }

    Ok(Placements {
      lo_lims,
      up_lims,
      counts,
    })
  }

  fn compute_lo_lims(guest: &RBTree, mpr: &MprMap, disc: &ArcDiscretiser) -> Result<Vec<Point>, Report> {
    let host = disc.host();
    let mut lo_lims = vec![Point::new(0, 0); guest.n_vertices()];
    for &u in guest.postorder() {
      let sigma = mpr.sigma(u);
      let Some((lc, rc)) = guest.children(u) else {
        lo_lims[u] = Point::new(sigma, 0);
        continue;
      };

      let (left, right) = (lo_lims[lc], lo_lims[rc]);
      let mut lo = Point::new(left.arc, left.index + 1);
      let mut curr = Some(left.arc);
      while let Some(x) = curr {
        if x == sigma && lo.arc != sigma {
          lo = Point::new(sigma, 0);
        }
        if x == right.arc {
          if lo.arc == x {
            lo.index = lo.index.max(right.index + 1);
          } else {
            lo = Point::new(right.arc, right.index + 1);
          }
          break;
        }
        curr = host.parent(x);
      }

      if lo.index > disc.no_of_slices(lo.arc) {
        lo = match host.parent(lo.arc) {
          Some(parent) => Point::new(parent, 1),
          None => {
            return make_error!(
              "Insufficient number of discretisation points: guest vertex {u} cannot be placed above host arc {}. \
               Consider more slices per arc.",
              lo.arc
            )
          }
        };
      }
      lo_lims[u] = lo;
    }
    Ok(lo_lims)
  }
}

impl ProperDependent for ReconciliationHelper {
  type Parents<'a> = ReconciliationHelperParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let ReconciliationHelperParents {
      guest,
      mpr,
      discretiser,
    } = parents;
    debug!("Recomputing guest vertex placements");
    let placements = Self::compute(guest.value, mpr.value, discretiser.value, self.max_implied_losses)
      .wrap_err("When updating guest vertex placements")?;
    let old_tip = std::mem::replace(&mut self.tip, discretiser.value.tip_point());
    let old_placements = std::mem::replace(&mut self.placements, placements);
    self.cache = Some((old_tip, old_placements));
    trace!("{self}");
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    if let Some((tip, placements)) = self.cache.take() {
      self.tip = tip;
      self.placements = placements;
    }
  }
}

impl Display for ReconciliationHelper {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "Guest vertex placements (tip at {}):", self.tip)?;
    writeln!(f, "Vertex\tLowest\tUppermost\tCount")?;
    let Placements {
      lo_lims,
      up_lims,
      counts,
    } = &self.placements;
    for (u, ((lo, up), count)) in lo_lims.iter().zip(up_lims).zip(counts).enumerate() {
      writeln!(f, "{u}\t{lo}\t{up}\t{count}")?;
    }
    Ok(())
  }
}

use crate::make_error;
use crate::mcmc::dependent::{ChangeInfo, Parent, ProperDependent};
use crate::topology::rbtree::RBTree;
use eyre::{Report, WrapErr};
use std::collections::BTreeMap;

/// Most parsimonious reconciliation of a guest tree with a host tree.
///
/// Leaves map to the host leaf they were sampled from. Internal vertices map to the lowest common ancestor of their
/// children's images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MprMap {
  leaf_map: BTreeMap<usize, usize>,
  sigma: Vec<usize>,
  cache: Option<(BTreeMap<usize, usize>, Vec<usize>)>,
}

pub struct MprMapParents<'a> {
  pub guest: Parent<'a, RBTree>,
  pub host: Parent<'a, RBTree>,
  /// Guest leaf to host leaf vertex indices
  pub leaf_map: Parent<'a, BTreeMap<usize, usize>>,
}

impl MprMap {
  /// Creates the map from guest leaf to host leaf vertex indices
  pub fn new(guest: &RBTree, host: &RBTree, leaf_map: BTreeMap<usize, usize>) -> Result<Self, Report> {
    let sigma = Self::compute_sigma(guest, host, &leaf_map)?;
    Ok(Self {
      leaf_map,
      sigma,
      cache: None,
    })
  }

  /// Creates the map from guest leaf names to host leaf names
  pub fn from_names(guest: &RBTree, host: &RBTree, names: &BTreeMap<String, String>) -> Result<Self, Report> {
    let guest_names = guest.name_map();
    let host_names = host.name_map();
    let leaf_map = names
      .iter()
      .map(|(guest_name, host_name)| {
        let Some(&u) = guest_names.get(guest_name.as_str()) else {
          return make_error!("Guest leaf '{guest_name}' is not present in the guest tree");
        };
        let Some(&x) = host_names.get(host_name.as_str()) else {
          return make_error!(
            "Host leaf '{host_name}' (mapped from guest leaf '{guest_name}') is not present in the host tree"
          );
        };
        Ok((u, x))
      })
      .collect::<Result<BTreeMap<_, _>, Report>>()
      .wrap_err("When reading guest-to-host leaf map")?;
    Self::new(guest, host, leaf_map)
  }

  fn compute_sigma(guest: &RBTree, host: &RBTree, leaf_map: &BTreeMap<usize, usize>) -> Result<Vec<usize>, Report> {
    let mut sigma = vec![0; guest.n_vertices()];
    for &u in guest.postorder() {
      sigma[u] = match guest.children(u) {
        Some((lc, rc)) => host.lca(sigma[lc], sigma[rc]),
        None => {
          let Some(&x) = leaf_map.get(&u) else {
            return make_error!("Guest leaf {u} is not mapped to any host leaf");
          };
          if x >= host.n_vertices() || !host.is_leaf(x) {
            return make_error!("Guest leaf {u} is mapped to host vertex {x}, which is not a host leaf");
          }
          x
        }
      };
    }
    Ok(sigma)
  }

  pub const fn leaf_map(&self) -> &BTreeMap<usize, usize> {
    &self.leaf_map
  }

  /// The host vertex guest vertex `u` maps to. As a placement this is the point at index 0 of that host arc.
  pub fn sigma(&self, u: usize) -> usize {
    self.sigma[u]
  }

  /// Whether the vertex is forced to be a duplication: it maps to the same host vertex as one of its children
  pub fn is_duplication(&self, guest: &RBTree, u: usize) -> bool {
    guest
      .children(u)
      .map_or(false, |(lc, rc)| self.sigma[u] == self.sigma[lc] || self.sigma[u] == self.sigma[rc])
  }

  pub fn n_duplications(&self, guest: &RBTree) -> usize {
    (0..guest.n_vertices()).filter(|&u| self.is_duplication(guest, u)).count()
  }

  /// Number of lineages lost on the path from the image of the parent of `u` down to the image of `u`
  pub fn n_losses_above(&self, guest: &RBTree, host: &RBTree, u: usize) -> usize {
    let Some(p) = guest.parent(u) else {
      return 0;
    };
    let crossed = host.depth(self.sigma[u]) - host.depth(self.sigma[p]);
    if self.is_duplication(guest, p) {
      crossed
    } else {
      crossed.saturating_sub(1)
    }
  }

  pub fn n_losses(&self, guest: &RBTree, host: &RBTree) -> usize {
    (0..guest.n_vertices()).map(|u| self.n_losses_above(guest, host, u)).sum()
  }
}

impl ProperDependent for MprMap {
  type Parents<'a> = MprMapParents<'a>;

  fn cache_and_update(&mut self, parents: Self::Parents<'_>, _: bool) -> Result<Option<ChangeInfo>, Report> {
    let leaf_map = parents.leaf_map.value;
    let sigma = Self::compute_sigma(parents.guest.value, parents.host.value, leaf_map)
      .wrap_err("When updating reconciliation map")?;
    let old_sigma = std::mem::replace(&mut self.sigma, sigma);
    let old_leaf_map = std::mem::replace(&mut self.leaf_map, leaf_map.clone());
    self.cache = Some((old_leaf_map, old_sigma));
    Ok(Some(ChangeInfo::Full))
  }

  fn clear_cache(&mut self, _: bool) {
    self.cache = None;
  }

  fn restore_cache(&mut self, _: bool) {
    if let Some((leaf_map, sigma)) = self.cache.take() {
      self.leaf_map = leaf_map;
      self.sigma = sigma;
    }
  }
}

use crate::mcmc::dependent::ChangeInfo;
use eyre::Report;

/// A source node of the dependency graph: a value the sampler perturbs directly.
///
/// The first perturbation after an accept or reject snapshots the old value. Further perturbations before the next
/// accept or reject merge their change descriptors.
#[derive(Clone, Debug)]
pub struct StateParameter<T> {
  name: &'static str,
  value: T,
  cache: Option<T>,
  change: Option<ChangeInfo>,
}

impl<T: Clone> StateParameter<T> {
  pub const fn new(name: &'static str, value: T) -> Self {
    Self {
      name,
      value,
      cache: None,
      change: None,
    }
  }

  pub const fn name(&self) -> &'static str {
    self.name
  }

  pub const fn value(&self) -> &T {
    &self.value
  }

  pub const fn change(&self) -> Option<&ChangeInfo> {
    self.change.as_ref()
  }

  pub const fn is_perturbed(&self) -> bool {
    self.change.is_some()
  }

  /// Replaces the whole value
  pub fn set(&mut self, value: T) {
    self.commit(value, ChangeInfo::Full);
  }

  /// Edits a copy of the value. The edit reports what it changed. A failing edit leaves the parameter untouched.
  pub fn update_with(&mut self, edit: impl FnOnce(&mut T) -> Result<ChangeInfo, Report>) -> Result<(), Report> {
    let mut value = self.value.clone();
    let change = edit(&mut value)?;
    self.commit(value, change);
    Ok(())
  }

  fn commit(&mut self, value: T, change: ChangeInfo) {
    let old = std::mem::replace(&mut self.value, value);
    if self.cache.is_none() {
      self.cache = Some(old);
    }
    self.change = Some(match self.change.take() {
      Some(previous) => previous.union(change),
      None => change,
    });
  }

  pub fn clear_cache(&mut self) {
    self.cache = None;
    self.change = None;
  }

  pub fn restore_cache(&mut self) {
    if let Some(old) = self.cache.take() {
      self.value = old;
    }
    self.change = None;
  }
}

pub mod dlrs;
pub mod io;
pub mod math;
pub mod mcmc;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod tests {
  use crate::utils::global_init::global_init;
  use ctor::ctor;

  #[ctor]
  fn init() {
    global_init();
  }
}

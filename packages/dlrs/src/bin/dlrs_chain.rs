use clap::{AppSettings, Parser, ValueHint};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use ctor::ctor;
use dlrs::dlrs::run::{run_file, ChainOverrides};
use dlrs::utils::global_init::{global_init, setup_logger};
use eyre::Report;
use std::path::PathBuf;

#[ctor]
fn init() {
  global_init();
}

#[derive(Parser, Debug)]
#[clap(name = "dlrs_chain")]
#[clap(author, version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(verbatim_doc_comment)]
/// Samples duplication rate, loss rate, branch lengths and relaxed clock parameters of a guest tree
/// reconciled with a dated host tree.
///
/// The input is a JSON file with both trees, the guest-to-host leaf map, initial parameters and run settings.
/// The output is a JSON file with the recorded states and per-proposer acceptance statistics.
struct Args {
  /// Path to the JSON run input
  #[clap(value_hint = ValueHint::FilePath)]
  input: PathBuf,

  /// Path to write the JSON samples to
  #[clap(value_hint = ValueHint::AnyPath)]
  output: PathBuf,

  /// Number of iterations, instead of the one in the run input
  #[clap(long)]
  iterations: Option<usize>,

  /// Record every n-th state, instead of the thinning in the run input
  #[clap(long)]
  thinning: Option<usize>,

  /// Random seed, instead of the one in the run input
  #[clap(long)]
  seed: Option<u64>,

  /// Make output more quiet or more verbose
  #[clap(flatten)]
  verbose: Verbosity<WarnLevel>,
}

impl Args {
  const fn overrides(&self) -> ChainOverrides {
    ChainOverrides {
      iterations: self.iterations,
      thinning: self.thinning,
      seed: self.seed,
    }
  }
}

fn main() -> Result<(), Report> {
  let args = Args::parse();
  setup_logger(args.verbose.log_level_filter())?;
  run_file(&args.input, &args.output, &args.overrides())
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::ErrorKind;
  use log::LevelFilter;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn parses_paths_and_overrides() -> Result<(), Report> {
    let args = Args::try_parse_from(["dlrs_chain", "run.json", "out/samples.json", "--seed", "3", "-v"])?;
    assert_eq!(args.input, PathBuf::from("run.json"));
    assert_eq!(args.output, PathBuf::from("out/samples.json"));
    assert_eq!(
      args.overrides(),
      ChainOverrides {
        iterations: None,
        thinning: None,
        seed: Some(3),
      }
    );
    assert_eq!(args.verbose.log_level_filter(), LevelFilter::Info);
    Ok(())
  }

  #[rstest]
  fn requires_both_paths() {
    let error = Args::try_parse_from(["dlrs_chain", "run.json"]).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
  }

  #[rstest]
  fn rejects_malformed_numbers() {
    let error = Args::try_parse_from(["dlrs_chain", "run.json", "out.json", "--iterations", "many"]).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ValueValidation);
  }
}

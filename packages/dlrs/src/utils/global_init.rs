use chrono::Local;
use color_eyre::owo_colors::{OwoColorize, Style};
use env_logger::Env;
use eyre::{Report, WrapErr};
use log::{Level, LevelFilter, Record};
use std::io::Write;
use std::sync::Once;

static REPORT_HOOKS: Once = Once::new();

/// Module path of a log record relative to the crate root, e.g. `dlrs::model` for `dlrs::dlrs::model`
fn short_module_path(path: &str) -> &str {
  path.strip_prefix("dlrs::").unwrap_or(path)
}

fn color_log_level(record: &Record) -> String {
  let mut level = record.level().to_string();
  level.truncate(1);
  match record.level() {
    Level::Error => level.red().bold().to_string(),
    Level::Warn => level.yellow().to_string(),
    Level::Info => level.cyan().to_string(),
    Level::Debug => level.green().dimmed().to_string(),
    Level::Trace => level.dimmed().to_string(),
  }
}

/// Installs the console logger. `RUST_LOG` may narrow the level further per module.
///
/// A process has a single logger, so only the first call succeeds.
pub fn setup_logger(filter_level: LevelFilter) -> Result<(), Report> {
  env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
    .filter_level(filter_level)
    .format(|buf, record| {
      let time = Local::now().format("%H:%M:%S%.3f").dimmed().to_string();
      let level = color_log_level(record);
      let module = short_module_path(record.module_path().unwrap_or_default())
        .dimmed()
        .to_string();
      writeln!(buf, "{time} {level} {module}: {}", record.args())
    })
    .try_init()
    .wrap_err("When installing the logger")
}

/// Installs colored error reports and panic messages. Later calls do nothing.
pub fn global_init() {
  REPORT_HOOKS.call_once(|| {
    let installed = color_eyre::config::HookBuilder::default()
      .theme(
        color_eyre::config::Theme::dark()
          .dependency_code(Style::new().dimmed())
          .file(Style::new().green())
          .line_number(Style::new().yellow())
          .panic_file(Style::new().green())
          .panic_line_number(Style::new().yellow())
          .panic_message(Style::new().bright_red().bold())
          .active_line(Style::new().cyan())
          .hidden_frames(Style::new().dimmed())
          .code_hash(Style::new().hidden()),
      )
      .panic_section(format!(
        "Sampling runs are reproducible from the input file and `--seed`. Attach both when reporting at: '{}/issues'",
        env!("CARGO_PKG_REPOSITORY"),
      ))
      .add_frame_filter(Box::new(|frames| {
        frames.retain(|frame| {
          let should_show_name = frame.name.as_ref().map_or(false, |name| {
            !HIDDEN_CRATE_NAME_PREFIXES
              .iter()
              .any(|&prefix| name.starts_with(prefix) || name.starts_with(&format!("<{prefix}")))
          });
          let should_show_file = !frame.filename.as_ref().map_or(false, |filename| {
            HIDDEN_CRATE_PATH_PREFIXES
              .iter()
              .any(|&prefix| filename.starts_with(prefix))
          });
          should_show_file && should_show_name
        });
      }))
      .install();
    if let Err(report) = installed {
      eprintln!("Failed to install error report hooks: {report}");
    }
  });
}

const HIDDEN_CRATE_NAME_PREFIXES: &[&str] = &[
  "__rust_try",
  "alloc::",
  "color_eyre::",
  "core::",
  "eyre::",
  "rand::",
  "rand_isaac::",
  "rustc::",
  "serde::",
  "serde_json::",
  "statrs::",
  "std::",
];

const HIDDEN_CRATE_PATH_PREFIXES: &[&str] = &["/rustc/"];

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case("dlrs::dlrs::model", "dlrs::model")]
  #[case("dlrs::mcmc::chain", "mcmc::chain")]
  #[case("dlrs_chain", "dlrs_chain")]
  #[case("rand::rngs", "rand::rngs")]
  fn shortens_module_paths(#[case] path: &str, #[case] expected: &str) {
    assert_eq!(short_module_path(path), expected);
  }

  #[rstest]
  fn repeated_init_is_harmless() {
    global_init();
    global_init();
    assert!(REPORT_HOOKS.is_completed());
  }

  #[rstest]
  fn logger_is_installed_once() {
    let first = setup_logger(LevelFilter::Warn);
    assert!(first.is_ok());
    assert!(setup_logger(LevelFilter::Debug).is_err());
  }
}

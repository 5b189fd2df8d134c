#![allow(clippy::pub_use)]

use eyre::Report;

/// Joins the chain of causes of a report into a single line
pub fn report_to_string(report: &Report) -> String {
  let strings: Vec<String> = report.chain().map(std::string::ToString::to_string).collect();
  strings.join(": ")
}

#[macro_export(local_inner_macros)]
macro_rules! make_error {
  ($($arg:tt)*) => {
    {
      Err(eyre::eyre!(std::format!($($arg)*)))
    }
  };
}

pub use make_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      Err(eyre::eyre!(msg))
    }
  };
}

pub use make_internal_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      eyre::eyre!(msg)
    }
  };
}

pub use make_internal_report;

/// Fails unless the value is a finite, strictly positive number
pub fn ensure_positive(name: &str, value: f64) -> Result<(), Report> {
  if !value.is_finite() || value <= 0.0 {
    return make_error!("Expected {name} to be a positive number, but found: {value}");
  }
  Ok(())
}

/// Fails unless the value is a finite, non-negative number
pub fn ensure_non_negative(name: &str, value: f64) -> Result<(), Report> {
  if !value.is_finite() || value < 0.0 {
    return make_error!("Expected {name} to be a non-negative number, but found: {value}");
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::WrapErr;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn joins_report_chain() {
    let report = ensure_positive("duplication rate", -1.0)
      .wrap_err("When creating model")
      .unwrap_err();
    assert_eq!(
      report_to_string(&report),
      "When creating model: Expected duplication rate to be a positive number, but found: -1"
    );
  }

  #[rstest]
  #[case(0.0)]
  #[case(f64::NAN)]
  #[case(f64::INFINITY)]
  fn rejects_non_positive(#[case] value: f64) {
    assert!(ensure_positive("x", value).is_err());
  }

  #[rstest]
  fn accepts_zero_as_non_negative() -> Result<(), Report> {
    ensure_non_negative("x", 0.0)?;
    assert!(ensure_non_negative("x", -1e-12).is_err());
    Ok(())
  }
}

use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug)]
pub struct JsonPretty(pub bool);

pub fn json_read_str<T: for<'de> Deserialize<'de>>(s: impl AsRef<str>) -> Result<T, Report> {
  serde_json::from_str(s.as_ref()).wrap_err("When reading JSON string")
}

pub fn json_read_file<T: for<'de> Deserialize<'de>>(filepath: impl AsRef<Path>) -> Result<T, Report> {
  let filepath = filepath.as_ref();
  let content = std::fs::read_to_string(filepath)
    .wrap_err_with(|| format!("When reading file: '{}'", filepath.display()))?;
  json_read_str(content).wrap_err_with(|| format!("When reading JSON file: '{}'", filepath.display()))
}

pub fn json_write_str<T: Serialize>(obj: &T, pretty: JsonPretty) -> Result<String, Report> {
  if pretty.0 {
    serde_json::to_string_pretty(obj)
  } else {
    serde_json::to_string(obj)
  }
  .wrap_err("When writing JSON string")
}

pub fn json_write<W: Write, T: Serialize>(writer: W, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  if pretty.0 {
    serde_json::to_writer_pretty(writer, &obj)
  } else {
    serde_json::to_writer(writer, &obj)
  }
  .wrap_err("When writing JSON")
}

pub fn json_write_file<T: Serialize>(filepath: impl AsRef<Path>, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let file = File::create(filepath).wrap_err_with(|| format!("When creating file: '{}'", filepath.display()))?;
  let mut writer = BufWriter::new(file);
  json_write(&mut writer, &obj, pretty)?;
  writer
    .flush()
    .wrap_err_with(|| format!("When writing JSON file: '{}'", filepath.display()))
}

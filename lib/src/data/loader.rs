use std::{collections::HashMap, path::Path};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

use super::Dataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  /// IDX container (MNIST distribution format), header included.
  Idx,
  /// Raw bytes, one value per byte.
  Uint8,
  /// Raw little-endian f32 values.
  Float32,
}

/// One data file, parsed into examples of `shape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
  pub name: String,
  pub path: String,
  pub data_type: DataType,
  pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetConfig {
  pub data: Vec<DataSource>,
  #[serde(default)]
  pub label_class_names: Vec<String>,
}

fn is_url(location: &str) -> bool {
  location.starts_with("http://") || location.starts_with("https://")
}

/// Resolves `path` against the location of the config file that named it.
pub fn resolve(base: &str, path: &str) -> Result<String> {
  if is_url(path) || Path::new(path).is_absolute() {
    return Ok(path.to_string());
  }
  if is_url(base) {
    let url = Url::parse(base).map_err(|e| Error::dataset_load(base, e))?;
    let joined = url.join(path).map_err(|e| Error::dataset_load(path, e))?;
    return Ok(joined.to_string());
  }
  let dir = Path::new(base).parent().unwrap_or_else(|| Path::new(""));
  Ok(dir.join(path).to_string_lossy().into_owned())
}

const MISSING_FILE_HINT: &str =
  "file not found; dataset files are not bundled, see static/mnist/README.md for fetching MNIST";

async fn fetch_bytes(location: &str) -> Result<Vec<u8>> {
  if is_url(location) {
    let response = reqwest::get(location).await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
  } else {
    tokio::fs::read(location).await.map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => Error::dataset_load(location, MISSING_FILE_HINT),
      _ => Error::dataset_load(location, e),
    })
  }
}

/// Reads the dataset config document, a map from dataset name to its sources.
#[tracing::instrument]
pub async fn fetch_config(location: &str) -> Result<HashMap<String, DatasetConfig>> {
  let bytes = fetch_bytes(location).await?;
  serde_json::from_slice(&bytes).map_err(|e| Error::dataset_load(location, e))
}

/// Fetches and parses every source of `config` into memory. `base` is the
/// location of the config document, used for relative paths.
#[tracing::instrument(skip(config))]
pub async fn load_and_cache(config: &DatasetConfig, base: &str) -> Result<Dataset> {
  let mut channels = Vec::with_capacity(config.data.len());
  for source in &config.data {
    let location = resolve(base, &source.path)?;
    let bytes = fetch_bytes(&location).await?;
    let examples = parse_examples(&bytes, source.data_type, &source.shape).map_err(|e| Error::dataset_load(&location, e))?;
    info!(source = %source.name, examples = examples.len(), "loaded data source");
    channels.push((source.name.clone(), examples));
  }
  Dataset::from_channels(channels, config.label_class_names.clone())
}

/// Element count of `dims`, or `None` when it does not fit a `usize`.
fn element_count(dims: &[usize]) -> Option<usize> {
  dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn checked_size(dims: &[usize], what: &str) -> Result<usize> {
  element_count(dims).ok_or_else(|| Error::Dataset(format!("{what} {dims:?} has too many elements")))
}

/// Splits a flat payload into examples of `shape`.
pub fn parse_examples(bytes: &[u8], data_type: DataType, shape: &[usize]) -> Result<Vec<Tensor>> {
  let size = checked_size(shape, "configured shape")?;
  let values = match data_type {
    DataType::Idx => {
      let (dims, values) = parse_idx(bytes)?;
      let per_example = checked_size(dims.get(1..).unwrap_or_default(), "idx example dims")?;
      if per_example != size {
        return Err(Error::Dataset(format!(
          "idx examples have dims {:?}, configured shape is {shape:?}",
          dims.get(1..).unwrap_or_default()
        )));
      }
      values
    }
    DataType::Uint8 => bytes.iter().map(|&b| b as f32).collect(),
    DataType::Float32 => {
      if bytes.len() % 4 != 0 {
        return Err(Error::Dataset(format!("{} bytes is not a whole number of f32 values", bytes.len())));
      }
      bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
    }
  };

  if size == 0 || values.len() % size != 0 {
    return Err(Error::DataLength {
      expected: size,
      got: values.len(),
    });
  }
  values
    .chunks_exact(size)
    .map(|chunk| Tensor::new(shape, chunk.to_vec()))
    .collect()
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
  bytes
    .get(at..at + 4)
    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    .ok_or_else(|| Error::Dataset("truncated idx header".into()))
}

/// IDX layout: two zero bytes, a type code, the number of dimensions, then one
/// big-endian u32 per dimension followed by big-endian values.
fn parse_idx(bytes: &[u8]) -> Result<(Vec<usize>, Vec<f32>)> {
  let [0, 0, code, ndims] = bytes.get(..4).unwrap_or_default() else {
    return Err(Error::Dataset("missing idx magic number".into()));
  };
  let (code, ndims) = (*code, *ndims as usize);
  let dims = (0..ndims)
    .map(|d| read_u32(bytes, 4 + 4 * d).map(|v| v as usize))
    .collect::<Result<Vec<_>>>()?;
  let payload = &bytes[4 + 4 * dims.len()..];
  let width = match code {
    0x08 | 0x09 => 1,
    0x0B => 2,
    0x0C | 0x0D => 4,
    0x0E => 8,
    other => return Err(Error::Dataset(format!("unknown idx type code {other:#04x}"))),
  };
  let expected = checked_size(&dims, "idx dims")?
    .checked_mul(width)
    .ok_or_else(|| Error::Dataset(format!("idx dims {dims:?} overflow the payload size")))?;
  if payload.len() != expected {
    return Err(Error::DataLength {
      expected,
      got: payload.len(),
    });
  }
  let values = payload
    .chunks_exact(width)
    .map(|c| match code {
      0x08 => c[0] as f32,
      0x09 => c[0] as i8 as f32,
      0x0B => i16::from_be_bytes([c[0], c[1]]) as f32,
      0x0C => i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f32,
      0x0D => f32::from_be_bytes([c[0], c[1], c[2], c[3]]),
      _ => f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32,
    })
    .collect();
  Ok((dims, values))
}

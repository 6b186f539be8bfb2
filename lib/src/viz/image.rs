use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// RGBA raster, 4 bytes per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageData {
  pub width: usize,
  pub height: usize,
  pub data: Vec<u8>,
}

impl ImageData {
  pub fn blank(width: usize, height: usize) -> Self {
    Self {
      width,
      height,
      data: vec![0; width * height * 4],
    }
  }
}

/// Grey level of one value: clamped to `[0, 255]` and rounded. NaN is black.
pub fn pixel_value(v: f32) -> u8 {
  if v.is_nan() {
    return 0;
  }
  v.clamp(0.0, 255.0).round() as u8
}

/// Turns `width * height` grey levels into an opaque greyscale image.
pub fn to_image_data(values: &[f32], width: usize, height: usize) -> Result<ImageData> {
  if values.len() != width * height {
    return Err(Error::DataLength {
      expected: width * height,
      got: values.len(),
    });
  }
  let data = values
    .iter()
    .flat_map(|&v| {
      let p = pixel_value(v);
      [p, p, p, 255]
    })
    .collect();
  Ok(ImageData { width, height, data })
}

/// Something images can be drawn onto.
pub trait RasterSurface {
  fn put_image_data(&mut self, image: &ImageData, dx: usize, dy: usize);
}

/// In-memory drawing target, the server-side counterpart of a browser canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Canvas {
  image: ImageData,
  /// Bumped on every draw so clients can skip unchanged canvases.
  revision: u64,
}

impl Canvas {
  pub fn new(width: usize, height: usize) -> Self {
    Self {
      image: ImageData::blank(width, height),
      revision: 0,
    }
  }

  pub fn image(&self) -> &ImageData {
    &self.image
  }

  pub fn revision(&self) -> u64 {
    self.revision
  }
}

impl RasterSurface for Canvas {
  /// Copies `image` with its top-left corner at `(dx, dy)`, clipping whatever
  /// falls outside the canvas.
  fn put_image_data(&mut self, image: &ImageData, dx: usize, dy: usize) {
    let target = &mut self.image;
    if image.width + dx > target.width || image.height + dy > target.height {
      warn!(
        image = ?(image.width, image.height),
        canvas = ?(target.width, target.height),
        "image clipped to canvas"
      );
    }
    let cols = image.width.min(target.width.saturating_sub(dx));
    let rows = match cols {
      0 => 0,
      _ => image.height.min(target.height.saturating_sub(dy)),
    };
    for y in 0..rows {
      let ty = y + dy;
      let src = &image.data[y * image.width * 4..(y * image.width + cols) * 4];
      let start = (ty * target.width + dx) * 4;
      target.data[start..start + cols * 4].copy_from_slice(src);
    }
    self.revision += 1;
  }
}

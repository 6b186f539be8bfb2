//! Turns runner events into what the dashboard page draws: greyscale canvases,
//! a cost chart and headline metrics.

mod chart;
mod dashboard;
mod image;

pub use chart::{ChartPoint, ChartSeries, ChartUpdate};
pub use dashboard::{run_dashboard, CanvasPair, Dashboard, DashboardSnapshot, MetricsState};
pub use image::{pixel_value, to_image_data, Canvas, ImageData, RasterSurface};

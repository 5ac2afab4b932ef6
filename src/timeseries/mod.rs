pub mod point;
pub mod store;

pub use point::{Measurement, Point, Row, TagFilter};
pub use store::{AdvisoryStatus, InMemoryStore, TimeSeriesStore};

//! Swept measurements for labsync.
//!
//! - [`plans`]: log-spaced frequency plans
//! - [`sweep`]: the [`SweepCoordinator`] that drives generator and analyzer
//! - [`result`]: measured points and CSV export

pub mod plans;
pub mod result;
pub mod sweep;

pub use plans::{PlanError, SweepPlan, SweepRequest};
pub use result::{write_points_csv, SweepOutcome, SweepPoint, SweepResult};
pub use sweep::{SweepCoordinator, SweepEvent, SweepSettings, SweepState};

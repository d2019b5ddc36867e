pub mod analysis;
pub mod canary;
pub mod clock;
pub mod prometheus;

pub use canary::{reconcile, Context, ReconcileError};

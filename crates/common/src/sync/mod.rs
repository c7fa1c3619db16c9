//! Listing refresh: the periodic trigger and the reconciliation it drives

mod reconcile;
mod scheduler;

pub use reconcile::{reconcile, ReconcileReport};
pub use scheduler::SyncScheduler;

pub mod approvals;
pub mod bookings;
pub mod classes;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod ledger;
pub mod members;
pub mod policy;
pub mod routes;
pub mod sync;

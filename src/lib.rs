pub mod error;
pub mod events;
pub mod ha;
pub mod partitioning;
pub mod query;
pub mod service;
pub mod storage_engine;
pub mod telemetry;
pub mod transaction;
pub mod utils;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

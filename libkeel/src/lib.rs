//! core of a content-addressed version-control object system: the object
//! graph, its on-disk store (loose + packed), name resolution, and the
//! wire-level fetch/upload negotiation

#[macro_use]
extern crate async_trait;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

#[macro_use]
mod macros;

#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub mod config;
pub mod delta;
pub mod error;
pub mod fetch;
pub mod fsck;
pub mod graft;
pub mod graph;
pub mod hash;
pub mod lockfile;
pub mod obj;
pub mod odb;
pub mod pack;
pub mod protocol;
pub mod quote;
pub mod refs;
pub mod repo;
pub mod rev;
pub mod serialize;
pub mod transport;
pub mod upload_pack;

mod io;
mod signature;

pub use signature::{KeelEpochTime, KeelSignature, KeelTime, KeelTimeZoneOffset};

#![warn(missing_docs)]

//! Datagrid core data model: data identifiers, checksums, sites, datasets,
//! replicas, replication rules, and transfer requests.

pub mod checksum;
pub mod dataset;
pub mod did;
pub mod error;
pub mod replica;
pub mod rule;
pub mod site;
pub mod time;
pub mod transfer;

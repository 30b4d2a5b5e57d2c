#![warn(missing_docs)]

//! Datagrid locality resolver: ranks candidate source replicas for a
//! transfer by geographic proximity, observed site-pair health, and
//! declared bandwidth class.

pub mod geo;
pub mod health;
pub mod resolver;

pub use health::{PairHealth, PairHealthTracker};
pub use resolver::{LocalityResolver, ResolverConfig};

//! Domain entities
//!
//! Plain data carried between the store and the routing pipeline. Query
//! behaviour lives behind [`crate::store::AliasStore`], not here.

pub mod alias;
pub mod domain;
pub mod recipient;
pub mod user;

pub use alias::{Alias, AliasCounter, NewAlias};
pub use domain::Domain;
pub use recipient::Recipient;
pub use user::{round_mb, BandwidthUsage, User, UserTotals};

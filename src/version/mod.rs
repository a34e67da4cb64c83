//! Version bookkeeping: the persisted mapping table and the resolver that
//! decides whether a new upstream release needs a build.

pub mod mapping;
pub mod resolver;

pub use mapping::{VersionMapping, VersionRecord};
pub use resolver::{resolve, CheckMarker, Decision, ResolveRequest};

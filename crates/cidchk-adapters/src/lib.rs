//! External collaborators of the checker: the deal aggregation store, chain
//! RPC and geolocation, the verified-client registry and the issue tracker.

pub mod deals;
pub mod geo;
pub mod github;
pub mod identity;
pub mod issue;
pub mod multiaddr;

pub use deals::{
    AggregationClient, DealStore, MemoryStore, NewProviderScope, PgDealStore, PgRetrievalStore,
    RetrievalStore, StoreError,
};
pub use geo::{GeoConfig, GeoError, GeoResolver, HostResolver, LocationLookup, SystemResolver};
pub use github::{GithubClient, Issue, IssueComment};
pub use identity::{AllocationBot, ApplicationDirectory, IdentityError, IdentityResolver, RegistryConfig};
pub use issue::{parse_issue_body, project_name_from_title, ParsedApplication};

pub const CRATE_NAME: &str = "cidchk-adapters";

//! Translation between user configuration, remote wire bodies and the
//! normalized descriptors the engine compares.

pub mod desired;
pub mod observed;
pub mod wire;

pub use desired::{
    CorsRuleSpec, DhcpOptionsSpec, LifecycleRuleSpec, LoggingSpec, ResourceConfig,
    RoutingRuleSpec, RuleStatus, WebsiteSpec, normalize_desired,
};
pub use observed::{ObservedFacet, parse_observed};

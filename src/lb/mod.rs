//! Load balancing and health monitoring
//!
//! # Components
//!
//! - [`Endpoint`]: one configured exchange integration target
//! - [`LoadBalancer`]: orders endpoint candidates per request using a
//!   runtime-switchable [`Strategy`]
//! - [`HealthMonitor`]: active probes plus passive request-path results,
//!   combined into a [0,1] health score
//!
//! Every strategy filters out disabled endpoints, Open circuits, and
//! endpoints below the health floor before ordering; ties break by weight
//! then name so candidate lists are deterministic.

pub mod balancer;
pub mod endpoint;
pub mod health;

pub use balancer::{EndpointView, LoadBalancer, Strategy};
pub use endpoint::Endpoint;
pub use health::{HealthConfig, HealthMonitor, HealthStats};

//! Ring groups: hunting a set of destinations for the first leg that
//! comes up, with pluggable load balancing.

mod balancer;
mod ring;

pub use balancer::{InMemoryBalancer, LoadBalancerBackend, PostgresBalancer};
pub use ring::{RingGroup, RingMode};

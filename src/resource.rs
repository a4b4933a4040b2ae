//! Resource identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Which way traffic flows through a resource. Inbound entries additionally
/// feed the global inbound node consulted by the system guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrafficDirection {
    Inbound,
    #[default]
    Outbound,
}

/// A named, typed call site that can be admitted, counted and denied.
///
/// Identity is the name alone; direction is metadata and does not take part
/// in equality or hashing. A free-form string and a reflected method
/// identity project to the same name space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceId {
    name: String,
    direction: TrafficDirection,
}

impl ResourceId {
    pub fn new(name: impl Into<String>, direction: TrafficDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    pub fn inbound(name: impl Into<String>) -> Self {
        Self::new(name, TrafficDirection::Inbound)
    }

    pub fn outbound(name: impl Into<String>) -> Self {
        Self::new(name, TrafficDirection::Outbound)
    }

    /// Project a method identity onto the resource name space.
    pub fn from_method(
        type_name: &str,
        method_name: &str,
        direction: TrafficDirection,
    ) -> Self {
        Self::new(format!("{type_name}::{method_name}"), direction)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> TrafficDirection {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == TrafficDirection::Inbound
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_ignores_direction() {
        let a = ResourceId::inbound("orders.create");
        let b = ResourceId::outbound("orders.create");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn method_identity_projects_to_name() {
        let r = ResourceId::from_method("OrderService", "create", TrafficDirection::Inbound);
        assert_eq!(r.name(), "OrderService::create");
        assert!(r.is_inbound());
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::OfferResource;

/// An opaque token from the resource manager carrying agent identity and the
/// resources it is willing to trade for launch/reserve operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub attributes: HashMap<String, String>,
    pub resources: Vec<OfferResource>,
}

impl Offer {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            attributes: HashMap::new(),
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: OfferResource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

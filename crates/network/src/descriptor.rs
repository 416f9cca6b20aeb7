//! Server descriptors
//!
//! Each lifecycle hop picks its server from a [`ServerDescriptor`]. Selection
//! is deterministic: an explicit override wins, otherwise the configured index
//! into the candidate list.

use korelink_core::{Endpoint, KoreError, Result};

/// Candidate servers for one lifecycle hop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub candidates: Vec<Endpoint>,
    pub index: usize,
    pub override_endpoint: Option<Endpoint>,
}

impl ServerDescriptor {
    pub fn new(candidates: Vec<Endpoint>) -> Self {
        Self {
            candidates,
            index: 0,
            override_endpoint: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_override(mut self, endpoint: Endpoint) -> Self {
        self.override_endpoint = Some(endpoint);
        self
    }

    /// Replace the candidates, keeping index and override
    pub fn set_candidates(&mut self, candidates: Vec<Endpoint>) {
        self.candidates = candidates;
    }

    /// Pick the server for this hop
    pub fn select(&self, hop: &str) -> Result<Endpoint> {
        if let Some(endpoint) = &self.override_endpoint {
            return Ok(endpoint.clone());
        }
        if self.candidates.is_empty() {
            return Err(KoreError::Configuration(format!("No {} server candidates", hop)));
        }
        self.candidates.get(self.index).cloned().ok_or_else(|| {
            KoreError::Configuration(format!(
                "{} server index {} out of range ({} candidates)",
                hop,
                self.index,
                self.candidates.len()
            ))
        })
    }

    /// Check that [`ServerDescriptor::select`] can succeed
    pub fn validate(&self, hop: &str) -> Result<()> {
        self.select(hop).map(|_| ())
    }
}

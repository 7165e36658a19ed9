use std::time::Duration;

use crate::state::Location;

/// Tunables for the mesh manager. The defaults reproduce the observed
/// behavior: an aggregate heartbeat budget of one probe per second across the
/// whole mesh, and eviction of peers silent for five seconds.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub initial_location: Location,
    pub heartbeat_budget: Duration,
    pub dormancy_threshold: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            initial_location: Location::default(),
            heartbeat_budget: Duration::from_millis(1000),
            dormancy_threshold: Duration::from_millis(5000),
        }
    }
}

#[derive(Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
}

impl MeshConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> MeshConfig {
        self.config
    }

    pub fn initial_location(mut self, location: Location) -> Self {
        self.config.initial_location = location;
        self
    }

    pub fn heartbeat_budget(mut self, budget: Duration) -> Self {
        self.config.heartbeat_budget = budget;
        self
    }

    pub fn dormancy_threshold(mut self, threshold: Duration) -> Self {
        self.config.dormancy_threshold = threshold;
        self
    }
}

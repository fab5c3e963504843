//! Scenario lookup seam.
//!
//! The relational store is the usual source; tests and store-less
//! deployments use the static variant.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::ScenarioConfig;

#[async_trait]
pub trait ScenarioSource: Send + Sync {
    /// Resolve the scenario for an inbound call by dialed destination.
    async fn scenario_for_destination(
        &self,
        instance_id: &str,
        destination: &str,
    ) -> Option<Arc<ScenarioConfig>>;

    async fn scenario_by_id(&self, scenario_id: &str) -> Option<Arc<ScenarioConfig>>;
}

/// Fixed in-memory mapping of destinations to scenarios.
pub struct StaticScenarioSource {
    by_destination: HashMap<String, Arc<ScenarioConfig>>,
    by_id: HashMap<String, Arc<ScenarioConfig>>,
    default: Option<Arc<ScenarioConfig>>,
}

impl StaticScenarioSource {
    pub fn new(default: Option<Arc<ScenarioConfig>>) -> Self {
        Self {
            by_destination: HashMap::new(),
            by_id: HashMap::new(),
            default,
        }
    }

    pub fn with_scenario(mut self, scenario: Arc<ScenarioConfig>) -> Self {
        for destination in &scenario.entry_points {
            self.by_destination
                .insert(destination.clone(), scenario.clone());
        }
        self.by_id
            .insert(scenario.scenario_id.clone(), scenario);
        self
    }
}

#[async_trait]
impl ScenarioSource for StaticScenarioSource {
    async fn scenario_for_destination(
        &self,
        _instance_id: &str,
        destination: &str,
    ) -> Option<Arc<ScenarioConfig>> {
        self.by_destination
            .get(destination)
            .cloned()
            .or_else(|| self.default.clone())
    }

    async fn scenario_by_id(&self, scenario_id: &str) -> Option<Arc<ScenarioConfig>> {
        self.by_id
            .get(scenario_id)
            .cloned()
            .or_else(|| self.default.clone())
    }
}

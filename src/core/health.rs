//! Aggregate health snapshot for the boundary surface.

use std::sync::Arc;

use serde::Serialize;

use super::esl::EslManager;
use super::outbound::OutboundScheduler;
use super::session::SessionRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub switches: Vec<InstanceHealth>,
    pub active_sessions: usize,
    pub running_campaigns: usize,
}

/// Healthy means every registered switch link is up. Backend failures are
/// per-call conditions and surface through call records, not here.
pub fn collect(
    esl: &Arc<EslManager>,
    registry: &Arc<SessionRegistry>,
    outbound: &Arc<OutboundScheduler>,
) -> HealthSnapshot {
    let switches: Vec<InstanceHealth> = esl
        .link_states()
        .into_iter()
        .map(|(instance_id, connected)| InstanceHealth {
            instance_id,
            connected,
        })
        .collect();
    let healthy = !switches.is_empty() && switches.iter().all(|s| s.connected);

    HealthSnapshot {
        healthy,
        switches,
        active_sessions: registry.len(),
        running_campaigns: outbound.running_campaigns().len(),
    }
}

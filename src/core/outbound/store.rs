//! Persistence seam for campaigns: the scheduler reads and writes through
//! this trait; the relational store implements it, tests use the
//! in-memory variant.

use async_trait::async_trait;

use crate::core::scenario::GatewayConfig;

use super::campaign::{Campaign, CampaignContact, CampaignStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Counter increments applied with atomic update semantics so concurrent
/// contact completions cannot lose updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDelta {
    pub completed_contacts: u32,
    pub successful_calls: u32,
    pub failed_calls: u32,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn load_campaign(&self, campaign_id: &str) -> Result<Campaign, StoreError>;
    async fn load_gateway(&self, gateway_id: &str) -> Result<GatewayConfig, StoreError>;
    /// Non-terminal contacts of the campaign, in insertion order.
    async fn load_contacts(&self, campaign_id: &str) -> Result<Vec<CampaignContact>, StoreError>;
    async fn save_contact(&self, contact: &CampaignContact) -> Result<(), StoreError>;
    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;
    async fn bump_counters(&self, campaign_id: &str, delta: CounterDelta) -> Result<(), StoreError>;
}

/// In-memory store used by tests and store-less deployments.
#[derive(Default)]
pub struct MemoryCampaignStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    campaigns: Vec<Campaign>,
    gateways: Vec<GatewayConfig>,
    contacts: Vec<CampaignContact>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.inner.lock().campaigns.push(campaign);
    }

    pub fn add_gateway(&self, gateway: GatewayConfig) {
        self.inner.lock().gateways.push(gateway);
    }

    pub fn add_contact(&self, contact: CampaignContact) {
        self.inner.lock().contacts.push(contact);
    }

    pub fn campaign(&self, campaign_id: &str) -> Option<Campaign> {
        self.inner
            .lock()
            .campaigns
            .iter()
            .find(|c| c.campaign_id == campaign_id)
            .cloned()
    }

    pub fn contacts(&self, campaign_id: &str) -> Vec<CampaignContact> {
        self.inner
            .lock()
            .contacts
            .iter()
            .filter(|c| c.campaign_id == campaign_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn load_campaign(&self, campaign_id: &str) -> Result<Campaign, StoreError> {
        self.campaign(campaign_id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))
    }

    async fn load_gateway(&self, gateway_id: &str) -> Result<GatewayConfig, StoreError> {
        self.inner
            .lock()
            .gateways
            .iter()
            .find(|g| g.gateway_id == gateway_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("gateway {gateway_id}")))
    }

    async fn load_contacts(&self, campaign_id: &str) -> Result<Vec<CampaignContact>, StoreError> {
        Ok(self
            .contacts(campaign_id)
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .collect())
    }

    async fn save_contact(&self, contact: &CampaignContact) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .contacts
            .iter_mut()
            .find(|c| c.campaign_id == contact.campaign_id && c.phone_number == contact.phone_number)
        {
            *existing = contact.clone();
        } else {
            inner.contacts.push(contact.clone());
        }
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let campaign = inner
            .campaigns
            .iter_mut()
            .find(|c| c.campaign_id == campaign_id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))?;
        campaign.status = status;
        Ok(())
    }

    async fn bump_counters(&self, campaign_id: &str, delta: CounterDelta) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let campaign = inner
            .campaigns
            .iter_mut()
            .find(|c| c.campaign_id == campaign_id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))?;
        campaign.counters.completed_contacts += delta.completed_contacts;
        campaign.counters.successful_calls += delta.successful_calls;
        campaign.counters.failed_calls += delta.failed_calls;
        Ok(())
    }
}

//! Campaign and contact domain model, plus the pure attempt-accounting
//! rules the scheduler applies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "running" | "active" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" | "calling" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CampaignCounters {
    pub total_contacts: u32,
    pub completed_contacts: u32,
    pub successful_calls: u32,
    pub failed_calls: u32,
}

#[derive(Debug, Clone)]
pub struct Campaign {
    pub campaign_id: String,
    pub gateway_id: String,
    pub scenario_id: String,
    pub status: CampaignStatus,
    pub max_concurrent_calls: u32,
    pub call_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_end: Option<DateTime<Utc>>,
    pub counters: CampaignCounters,
}

impl Campaign {
    /// Whether origination is allowed at `now` under the schedule window.
    pub fn within_schedule(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.schedule_start {
            if now < start {
                return false;
            }
        }
        if let Some(end) = self.schedule_end {
            if now > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct CampaignContact {
    pub campaign_id: String,
    pub phone_number: String,
    pub status: ContactStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub call_result: Option<String>,
    pub call_duration: Option<u64>,
}

impl CampaignContact {
    pub fn new(campaign_id: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            phone_number: phone_number.into(),
            status: ContactStatus::Pending,
            attempts: 0,
            last_attempt: None,
            next_attempt: None,
            call_result: None,
            call_duration: None,
        }
    }

    /// Ready for (re)dialing at `now`: pending and past its retry time.
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ContactStatus::Pending
            && self.next_attempt.map(|t| t <= now).unwrap_or(true)
    }

    /// Record a successful, answered call.
    pub fn record_success(&mut self, duration_secs: u64, now: DateTime<Utc>) {
        self.status = ContactStatus::Completed;
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.call_result = Some("answered".to_string());
        self.call_duration = Some(duration_secs);
    }

    /// Record a failed or unanswered attempt. Returns true when the
    /// contact re-enters the ready set; false when retries are exhausted
    /// and it is marked failed for good.
    pub fn record_failure(&mut self, campaign: &Campaign, result: &str, now: DateTime<Utc>) -> bool {
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.call_result = Some(result.to_string());

        if self.attempts < campaign.retry_attempts {
            self.status = ContactStatus::Pending;
            self.next_attempt =
                Some(now + chrono::Duration::from_std(campaign.retry_interval).unwrap_or_default());
            true
        } else {
            self.status = ContactStatus::Failed;
            self.next_attempt = None;
            false
        }
    }
}

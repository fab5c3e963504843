//! Per-campaign dialer.
//!
//! One runner task per running campaign. The concurrency budget is a
//! counting semaphore sized at `max_concurrent_calls`; waiting for a
//! permit is the deferral signal, never an error. Every originated leg is
//! handed to the session launcher and lives the same lifecycle as an
//! inbound call; the runner learns the outcome from the session's
//! completion channel and immediately refills the freed slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::scenario::{GatewayConfig, ScenarioConfig, ScenarioSource};
use crate::core::session::registry::SessionRegistry;
use crate::core::session::session_event::SessionEvent;
use crate::core::session::{CallOutcome, LaunchSpec, SessionLauncher};

use super::campaign::{Campaign, CampaignContact, CampaignStatus, ContactStatus};
use super::store::{CampaignStore, CounterDelta, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("campaign {0} is already running")]
    AlreadyRunning(String),
    #[error("campaign {0} is not running")]
    NotRunning(String),
    #[error("campaign {id} cannot start from status {status}")]
    NotRunnable { id: String, status: &'static str },
    #[error("campaign {id} references unknown scenario {scenario_id}")]
    UnknownScenario { id: String, scenario_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
enum CampaignCommand {
    Pause,
    Resume,
    Stop,
}

/// Live campaign counters, readable without touching the store.
#[derive(Default)]
pub struct CampaignStats {
    pub total_contacts: AtomicU32,
    pub completed_contacts: AtomicU32,
    pub successful_calls: AtomicU32,
    pub failed_calls: AtomicU32,
    pub in_progress: AtomicU32,
    /// High-water mark of concurrent in-progress calls; must never pass
    /// the campaign's limit.
    pub peak_in_progress: AtomicU32,
}

impl CampaignStats {
    fn enter_call(&self) {
        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_progress.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_call(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CampaignStatsSnapshot {
        CampaignStatsSnapshot {
            total_contacts: self.total_contacts.load(Ordering::SeqCst),
            completed_contacts: self.completed_contacts.load(Ordering::SeqCst),
            successful_calls: self.successful_calls.load(Ordering::SeqCst),
            failed_calls: self.failed_calls.load(Ordering::SeqCst),
            in_progress: self.in_progress.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatsSnapshot {
    pub total_contacts: u32,
    pub completed_contacts: u32,
    pub successful_calls: u32,
    pub failed_calls: u32,
    pub in_progress: u32,
}

struct CampaignHandle {
    control_tx: mpsc::UnboundedSender<CampaignCommand>,
    stats: Arc<CampaignStats>,
}

pub struct OutboundScheduler {
    store: Arc<dyn CampaignStore>,
    scenarios: Arc<dyn ScenarioSource>,
    launcher: Arc<SessionLauncher>,
    registry: Arc<SessionRegistry>,
    instance_id: String,
    campaigns: parking_lot::RwLock<HashMap<String, CampaignHandle>>,
}

impl OutboundScheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        scenarios: Arc<dyn ScenarioSource>,
        launcher: Arc<SessionLauncher>,
        registry: Arc<SessionRegistry>,
        instance_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scenarios,
            launcher,
            registry,
            instance_id: instance_id.into(),
            campaigns: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    /// Load a campaign and start dialing it.
    pub async fn start_campaign(
        self: &Arc<Self>,
        campaign_id: &str,
    ) -> Result<Arc<CampaignStats>, OutboundError> {
        if self.campaigns.read().contains_key(campaign_id) {
            return Err(OutboundError::AlreadyRunning(campaign_id.to_string()));
        }

        let campaign = self.store.load_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Completed {
            return Err(OutboundError::NotRunnable {
                id: campaign_id.to_string(),
                status: campaign.status.as_str(),
            });
        }
        let gateway = self.store.load_gateway(&campaign.gateway_id).await?;
        let scenario = self
            .scenarios
            .scenario_by_id(&campaign.scenario_id)
            .await
            .ok_or_else(|| OutboundError::UnknownScenario {
                id: campaign_id.to_string(),
                scenario_id: campaign.scenario_id.clone(),
            })?;
        let contacts = self.store.load_contacts(campaign_id).await?;

        self.store
            .set_campaign_status(campaign_id, CampaignStatus::Running)
            .await?;

        let stats = Arc::new(CampaignStats::default());
        let known_total = campaign.counters.total_contacts;
        stats.total_contacts.store(
            if known_total > 0 {
                known_total
            } else {
                contacts.len() as u32
            },
            Ordering::SeqCst,
        );
        stats
            .completed_contacts
            .store(campaign.counters.completed_contacts, Ordering::SeqCst);
        stats
            .successful_calls
            .store(campaign.counters.successful_calls, Ordering::SeqCst);
        stats
            .failed_calls
            .store(campaign.counters.failed_calls, Ordering::SeqCst);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.campaigns.write().insert(
            campaign_id.to_string(),
            CampaignHandle {
                control_tx,
                stats: stats.clone(),
            },
        );

        let runner = CampaignRunner {
            scheduler: self.clone(),
            campaign,
            gateway,
            scenario,
            contacts,
            stats: stats.clone(),
        };
        tokio::spawn(runner.run(control_rx));

        info!(campaign_id, "campaign started");
        Ok(stats)
    }

    /// Pause: no new originations, in-flight calls finish naturally.
    pub fn pause_campaign(&self, campaign_id: &str) -> Result<(), OutboundError> {
        self.send_command(campaign_id, CampaignCommand::Pause)
    }

    pub fn resume_campaign(&self, campaign_id: &str) -> Result<(), OutboundError> {
        self.send_command(campaign_id, CampaignCommand::Resume)
    }

    /// Stop dialing and shut the runner down once in-flight calls drain.
    pub fn stop_campaign(&self, campaign_id: &str) -> Result<(), OutboundError> {
        self.send_command(campaign_id, CampaignCommand::Stop)
    }

    pub fn stats(&self, campaign_id: &str) -> Option<CampaignStatsSnapshot> {
        self.campaigns
            .read()
            .get(campaign_id)
            .map(|handle| handle.stats.snapshot())
    }

    pub fn running_campaigns(&self) -> Vec<(String, CampaignStatsSnapshot)> {
        self.campaigns
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.stats.snapshot()))
            .collect()
    }

    fn send_command(&self, campaign_id: &str, command: CampaignCommand) -> Result<(), OutboundError> {
        let campaigns = self.campaigns.read();
        let handle = campaigns
            .get(campaign_id)
            .ok_or_else(|| OutboundError::NotRunning(campaign_id.to_string()))?;
        handle
            .control_tx
            .send(command)
            .map_err(|_| OutboundError::NotRunning(campaign_id.to_string()))
    }

    fn forget(&self, campaign_id: &str) {
        self.campaigns.write().remove(campaign_id);
    }
}

struct DialResult {
    contact_idx: usize,
    outcome: CallOutcome,
}

struct CampaignRunner {
    scheduler: Arc<OutboundScheduler>,
    campaign: Campaign,
    gateway: GatewayConfig,
    scenario: Arc<ScenarioConfig>,
    contacts: Vec<CampaignContact>,
    stats: Arc<CampaignStats>,
}

impl CampaignRunner {
    async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<CampaignCommand>) {
        let campaign_id = self.campaign.campaign_id.clone();
        let semaphore = Arc::new(Semaphore::new(self.campaign.max_concurrent_calls as usize));
        let (results_tx, mut results_rx) = mpsc::channel::<DialResult>(64);

        // Starting a campaign always means dialing, even when resuming
        // from a paused row.
        let mut paused = false;
        let mut stopped = false;
        let mut in_flight: usize = 0;

        loop {
            let now = Utc::now();
            let in_window = self.campaign.within_schedule(now);
            let dialable = !paused && !stopped && in_window;
            let ready = if dialable { self.pick_ready(now) } else { None };

            if let Some(idx) = ready {
                tokio::select! {
                    biased;
                    command = control_rx.recv() => {
                        self.apply_command(command, &mut paused, &mut stopped);
                    }
                    result = results_rx.recv() => {
                        if let Some(result) = result {
                            in_flight -= 1;
                            self.settle(result).await;
                        }
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        let permit = permit.expect("campaign semaphore never closed");
                        in_flight += 1;
                        self.dial(idx, permit, results_tx.clone()).await;
                    }
                }
            } else {
                // Nothing dialable right now: wait for a slot to free, a
                // command, or the earliest retry time.
                let wake_after = self.next_wake(now, dialable);
                tokio::select! {
                    biased;
                    command = control_rx.recv() => {
                        self.apply_command(command, &mut paused, &mut stopped);
                    }
                    result = results_rx.recv() => {
                        if let Some(result) = result {
                            in_flight -= 1;
                            self.settle(result).await;
                        }
                    }
                    _ = tokio::time::sleep(wake_after) => {}
                }
            }

            if in_flight == 0 {
                if stopped {
                    info!(campaign_id = %campaign_id, "campaign stopped");
                    let _ = self
                        .scheduler
                        .store
                        .set_campaign_status(&campaign_id, CampaignStatus::Paused)
                        .await;
                    break;
                }
                if self.contacts.iter().all(|c| c.status.is_terminal()) {
                    info!(campaign_id = %campaign_id, "campaign completed");
                    let _ = self
                        .scheduler
                        .store
                        .set_campaign_status(&campaign_id, CampaignStatus::Completed)
                        .await;
                    break;
                }
                if !in_window && self.campaign.schedule_end.is_some_and(|end| now > end) {
                    info!(campaign_id = %campaign_id, "schedule window closed");
                    let _ = self
                        .scheduler
                        .store
                        .set_campaign_status(&campaign_id, CampaignStatus::Paused)
                        .await;
                    break;
                }
            }
        }

        self.scheduler.forget(&campaign_id);
    }

    fn apply_command(
        &self,
        command: Option<CampaignCommand>,
        paused: &mut bool,
        stopped: &mut bool,
    ) {
        match command {
            Some(CampaignCommand::Pause) => {
                info!(campaign_id = %self.campaign.campaign_id, "campaign paused");
                *paused = true;
            }
            Some(CampaignCommand::Resume) => {
                info!(campaign_id = %self.campaign.campaign_id, "campaign resumed");
                *paused = false;
            }
            Some(CampaignCommand::Stop) | None => *stopped = true,
        }
    }

    /// Earliest ready contact: `next_attempt` ascending, insertion order
    /// breaking ties (contacts without `next_attempt` sort first).
    fn pick_ready(&self, now: chrono::DateTime<Utc>) -> Option<usize> {
        self.contacts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ready_at(now))
            .min_by_key(|(idx, c)| (c.next_attempt, *idx))
            .map(|(idx, _)| idx)
    }

    fn next_wake(&self, now: chrono::DateTime<Utc>, dialable: bool) -> Duration {
        let mut wake = Duration::from_secs(1);
        if dialable {
            if let Some(earliest) = self
                .contacts
                .iter()
                .filter(|c| c.status == ContactStatus::Pending)
                .filter_map(|c| c.next_attempt)
                .min()
            {
                if let Ok(until) = (earliest - now).to_std() {
                    wake = until.max(Duration::from_millis(10));
                }
            }
        }
        wake
    }

    async fn dial(
        &mut self,
        idx: usize,
        permit: tokio::sync::OwnedSemaphorePermit,
        results_tx: mpsc::Sender<DialResult>,
    ) {
        let contact = &mut self.contacts[idx];
        contact.status = ContactStatus::InProgress;
        if let Err(e) = self.scheduler.store.save_contact(contact).await {
            warn!(error = %e, "contact status write failed");
        }
        self.stats.enter_call();

        let phone_number = contact.phone_number.clone();
        let leg_id = uuid::Uuid::new_v4().to_string();
        let campaign_id = self.campaign.campaign_id.clone();
        let call_timeout = self.campaign.call_timeout;
        let dial_string = self.gateway.dial_string(
            &phone_number,
            &[
                ("origination_uuid".to_string(), leg_id.clone()),
                ("ignore_early_media".to_string(), "true".to_string()),
                (
                    "originate_timeout".to_string(),
                    call_timeout.as_secs().to_string(),
                ),
            ],
        );

        let launcher = self.scheduler.launcher.clone();
        let registry = self.scheduler.registry.clone();
        let instance_id = self.scheduler.instance_id.clone();
        let scenario = self.scenario.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let outcome = run_dial(
                launcher,
                registry,
                instance_id,
                scenario,
                leg_id,
                phone_number.clone(),
                dial_string,
            )
            .await;

            debug!(campaign_id = %campaign_id, phone = %phone_number, result = %outcome.result, "dial finished");
            stats.leave_call();
            let _ = results_tx
                .send(DialResult {
                    contact_idx: idx,
                    outcome,
                })
                .await;
            drop(permit);
        });
    }

    /// Apply a finished call to the contact and the campaign counters,
    /// then let the main loop refill the freed slot.
    async fn settle(&mut self, result: DialResult) {
        let now = Utc::now();
        let contact = &mut self.contacts[result.contact_idx];
        let mut delta = CounterDelta::default();

        if result.outcome.result == "answered" {
            contact.record_success(result.outcome.duration_secs, now);
            delta.completed_contacts = 1;
            delta.successful_calls = 1;
            self.stats.completed_contacts.fetch_add(1, Ordering::SeqCst);
            self.stats.successful_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            let requeued = contact.record_failure(&self.campaign, &result.outcome.result, now);
            if !requeued {
                delta.completed_contacts = 1;
                delta.failed_calls = 1;
                self.stats.completed_contacts.fetch_add(1, Ordering::SeqCst);
                self.stats.failed_calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        if let Err(e) = self.scheduler.store.save_contact(contact).await {
            warn!(error = %e, "contact result write failed");
        }
        if (delta.completed_contacts | delta.successful_calls | delta.failed_calls) > 0 {
            if let Err(e) = self
                .scheduler
                .store
                .bump_counters(&self.campaign.campaign_id, delta)
                .await
            {
                warn!(error = %e, "campaign counter update failed");
            }
        }
    }
}

/// One origination attempt, start to finish.
async fn run_dial(
    launcher: Arc<SessionLauncher>,
    registry: Arc<SessionRegistry>,
    instance_id: String,
    scenario: Arc<ScenarioConfig>,
    leg_id: String,
    phone_number: String,
    dial_string: String,
) -> CallOutcome {
    let (completion_tx, completion_rx) = oneshot::channel();

    // Register the session before originating so switch events for the
    // pre-assigned leg UUID route correctly from the first frame.
    let handle = launcher
        .launch(LaunchSpec {
            instance_id: instance_id.clone(),
            leg_id: leg_id.clone(),
            caller_number: Some(phone_number),
            scenario,
            answer_leg: false,
            completion: Some(completion_tx),
        })
        .await;
    if handle.is_none() {
        return CallOutcome {
            result: "failed".to_string(),
            duration_secs: 0,
        };
    }

    let switch = match launcher.control_for(&instance_id) {
        Some(switch) => switch,
        None => {
            return CallOutcome {
                result: "failed".to_string(),
                duration_secs: 0,
            };
        }
    };

    if let Err(e) = switch.originate(&dial_string, "&park()").await {
        // Tear the pre-registered session down through its own queue; the
        // session reports the classified outcome on the completion channel.
        let cause = classify_originate_error(&e.to_string());
        registry
            .dispatch(
                &leg_id,
                SessionEvent::Hangup {
                    cause: Some(cause.to_string()),
                },
            )
            .await;
    }

    match completion_rx.await {
        Ok(outcome) => outcome,
        Err(_) => CallOutcome {
            result: "failed".to_string(),
            duration_secs: 0,
        },
    }
}

fn classify_originate_error(text: &str) -> &'static str {
    if text.contains("NO_ANSWER") || text.contains("NO_USER_RESPONSE") {
        "NO_ANSWER"
    } else if text.contains("USER_BUSY") {
        "USER_BUSY"
    } else {
        "ORIGINATE_FAILED"
    }
}

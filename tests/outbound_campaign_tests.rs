//! Campaign dialer tests: concurrency bound, retry policy, counters.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parla::core::outbound::{
    Campaign, CampaignContact, CampaignCounters, CampaignStatus, ContactStatus,
    MemoryCampaignStore, OutboundScheduler,
};
use parla::core::scenario::{GatewayConfig, GatewayRecord, StaticScenarioSource};
use parla::core::session::{SessionConfig, SessionLauncher, SessionRegistry};

use common::{ChannelRecordSink, MockReasoning, MockSwitch, MockSynthesis, SilentRecognition, test_scenario};

fn test_gateway() -> GatewayConfig {
    GatewayConfig::try_from(GatewayRecord {
        gateway_id: "gw1".to_string(),
        gateway_type: "sip".to_string(),
        profile: "external".to_string(),
        username: None,
        password: None,
        realm: None,
        proxy: None,
        codecs: vec!["PCMU".to_string(), "PCMA".to_string()],
        max_channels: 100,
    })
    .unwrap()
}

fn test_campaign(
    campaign_id: &str,
    max_concurrent: u32,
    retry_attempts: u32,
    retry_interval: Duration,
) -> Campaign {
    Campaign {
        campaign_id: campaign_id.to_string(),
        gateway_id: "gw1".to_string(),
        scenario_id: "default".to_string(),
        status: CampaignStatus::Draft,
        max_concurrent_calls: max_concurrent,
        call_timeout: Duration::from_secs(30),
        retry_attempts,
        retry_interval,
        schedule_start: None,
        schedule_end: None,
        counters: CampaignCounters::default(),
    }
}

struct CampaignHarness {
    scheduler: Arc<OutboundScheduler>,
    store: Arc<MemoryCampaignStore>,
    switch: Arc<MockSwitch>,
    registry: Arc<SessionRegistry>,
}

fn build_harness(originate_failures_per_contact: u32, fail_error: &str) -> CampaignHarness {
    let registry = SessionRegistry::new();
    let (switch, _plays_rx) = MockSwitch::with_originate_failures(
        originate_failures_per_contact,
        fail_error,
    );
    // Successful originations simulate answer + hangup against the registry.
    *switch.registry.lock() = Some(registry.clone());

    let scenario = Arc::new(test_scenario("您好", &["稍等"], 10, 300));
    let scenarios = Arc::new(
        StaticScenarioSource::new(Some(scenario.clone())).with_scenario(scenario),
    );
    let (record_sink, _reports_rx) = ChannelRecordSink::new();

    let launcher = SessionLauncher::new(
        SessionConfig {
            backend_retry_budget: 1,
            turn_failure_limit: 3,
            partial_grace: Duration::from_millis(500),
        },
        8000,
        16000,
        registry.clone(),
        SilentRecognition::new(),
        MockReasoning::new("回复", 0),
        MockSynthesis::new(0),
        record_sink,
        scenarios.clone(),
    );
    launcher.register_instance("default", switch.clone());

    let store = Arc::new(MemoryCampaignStore::new());
    store.add_gateway(test_gateway());

    let scheduler = OutboundScheduler::new(
        store.clone(),
        scenarios,
        launcher,
        registry.clone(),
        "default",
    );

    CampaignHarness {
        scheduler,
        store,
        switch,
        registry,
    }
}

async fn wait_for_campaign_status(
    store: &MemoryCampaignStore,
    campaign_id: &str,
    status: CampaignStatus,
) {
    loop {
        if store.campaign(campaign_id).map(|c| c.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_campaign_retries_once_then_completes_within_concurrency_bound() {
    let harness = build_harness(1, "-ERR NO_ANSWER");
    let campaign = test_campaign("c-20", 5, 3, Duration::ZERO);
    harness.store.add_campaign(campaign);
    for i in 0..20 {
        harness
            .store
            .add_contact(CampaignContact::new("c-20", format!("1380000{i:04}")));
    }

    let stats = harness.scheduler.start_campaign("c-20").await.unwrap();
    wait_for_campaign_status(&harness.store, "c-20", CampaignStatus::Completed).await;

    // Every contact failed once, was requeued, and succeeded on retry.
    let stored = harness.store.campaign("c-20").unwrap();
    assert_eq!(stored.counters.completed_contacts, 20);
    assert_eq!(stored.counters.successful_calls, 20);
    assert_eq!(stored.counters.failed_calls, 0);

    for contact in harness.store.contacts("c-20") {
        assert_eq!(contact.status, ContactStatus::Completed);
        assert_eq!(contact.call_result.as_deref(), Some("answered"));
        assert_eq!(contact.attempts, 2);
    }

    // The concurrency budget held at every instant.
    assert!(stats.peak_in_progress.load(Ordering::SeqCst) <= 5);
    assert_eq!(stats.in_progress.load(Ordering::SeqCst), 0);

    // Every session was torn down.
    assert!(harness.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_contact_fails_for_good_after_retry_exhaustion() {
    // Originations for this destination never succeed.
    let harness = build_harness(u32::MAX, "-ERR USER_BUSY");
    let campaign = test_campaign("c-fail", 2, 2, Duration::ZERO);
    harness.store.add_campaign(campaign);
    harness
        .store
        .add_contact(CampaignContact::new("c-fail", "13900000000"));

    harness.scheduler.start_campaign("c-fail").await.unwrap();
    wait_for_campaign_status(&harness.store, "c-fail", CampaignStatus::Completed).await;

    let stored = harness.store.campaign("c-fail").unwrap();
    assert_eq!(stored.counters.completed_contacts, 1);
    assert_eq!(stored.counters.successful_calls, 0);
    assert_eq!(stored.counters.failed_calls, 1);

    let contacts = harness.store.contacts("c-fail");
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].status, ContactStatus::Failed);
    // attempts capped at retry_attempts, busy recorded from the cause
    assert_eq!(contacts[0].attempts, 2);
    assert_eq!(contacts[0].call_result.as_deref(), Some("busy"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_prevents_new_originations() {
    let harness = build_harness(0, "-ERR NO_ANSWER");
    let campaign = test_campaign("c-stop", 1, 1, Duration::ZERO);
    harness.store.add_campaign(campaign);
    for i in 0..10 {
        harness
            .store
            .add_contact(CampaignContact::new("c-stop", format!("1390000{i:04}")));
    }

    harness.scheduler.start_campaign("c-stop").await.unwrap();
    // Let a call or two go out, then stop.
    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.scheduler.stop_campaign("c-stop").unwrap();
    wait_for_campaign_status(&harness.store, "c-stop", CampaignStatus::Paused).await;

    let contacts = harness.store.contacts("c-stop");
    let completed = contacts
        .iter()
        .filter(|c| c.status == ContactStatus::Completed)
        .count();
    let pending = contacts
        .iter()
        .filter(|c| c.status == ContactStatus::Pending)
        .count();
    // In-flight calls finished naturally; the rest were never dialed.
    assert!(completed < 10);
    assert_eq!(completed + pending, 10);
    assert_eq!(harness.switch.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_campaign_twice_is_rejected() {
    let harness = build_harness(0, "-ERR NO_ANSWER");
    let campaign = test_campaign("c-dup", 2, 1, Duration::ZERO);
    harness.store.add_campaign(campaign);
    harness
        .store
        .add_contact(CampaignContact::new("c-dup", "13700000000"));

    harness.scheduler.start_campaign("c-dup").await.unwrap();
    assert!(harness.scheduler.start_campaign("c-dup").await.is_err());
}

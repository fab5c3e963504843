//! Relational store client (MySQL via sqlx).
//!
//! The schema is authoritative and owned elsewhere; this is a thin
//! row-mapping layer. JSON columns are decoded here and validated through
//! the scenario module's record types, so a malformed row surfaces as a
//! `ConfigError` at load time instead of a surprise at call time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::types::Json;
use tracing::{info, warn};

use crate::core::outbound::{
    Campaign, CampaignContact, CampaignCounters, CampaignStatus, CampaignStore, ContactStatus,
    CounterDelta, StoreError,
};
use crate::core::scenario::{
    ConfigError, EntryPoint, GatewayConfig, GatewayRecord, ScenarioConfig, ScenarioRecord,
    ScenarioSource, SwitchInstanceConfig,
};
use crate::core::session::CallReport;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Db {
    pool: MySqlPool,
}

#[derive(sqlx::FromRow)]
struct ScenarioRow {
    scenario_id: String,
    name: String,
    entry_points: Option<Json<Vec<String>>>,
    system_prompt: String,
    welcome_message: String,
    fallback_responses: Option<Json<Vec<String>>>,
    max_turns: i32,
    timeout_seconds: i32,
    custom_settings: Option<Json<serde_json::Value>>,
}

impl ScenarioRow {
    fn into_config(self) -> Result<ScenarioConfig, ConfigError> {
        ScenarioConfig::try_from(ScenarioRecord {
            scenario_id: self.scenario_id,
            name: self.name,
            entry_points: self.entry_points.map(|j| j.0).unwrap_or_default(),
            system_prompt: self.system_prompt,
            welcome_message: self.welcome_message,
            fallback_responses: self.fallback_responses.map(|j| j.0).unwrap_or_default(),
            max_turns: self.max_turns.max(0) as u32,
            timeout_seconds: self.timeout_seconds.max(0) as u64,
            custom_settings: self
                .custom_settings
                .map(|j| j.0)
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[derive(sqlx::FromRow)]
struct GatewayRow {
    gateway_id: String,
    gateway_type: String,
    profile: String,
    username: Option<String>,
    password: Option<String>,
    realm: Option<String>,
    proxy: Option<String>,
    codecs: Option<Json<Vec<String>>>,
    max_channels: i32,
}

#[derive(sqlx::FromRow)]
struct EntryPointRow {
    entry_point_id: String,
    dialplan_pattern: String,
    scenario_id: String,
    gateway_id: Option<String>,
    priority: i32,
}

#[derive(sqlx::FromRow)]
struct SwitchInstanceRow {
    instance_id: String,
    host: String,
    port: i32,
    password: String,
    scenario_mapping: Option<Json<std::collections::HashMap<String, String>>>,
    gateway_ids: Option<Json<Vec<String>>>,
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    campaign_id: String,
    gateway_id: String,
    scenario_id: String,
    status: String,
    max_concurrent_calls: i32,
    call_timeout: i32,
    retry_attempts: i32,
    retry_interval: i32,
    schedule_start: Option<NaiveDateTime>,
    schedule_end: Option<NaiveDateTime>,
    total_contacts: i32,
    completed_contacts: i32,
    successful_calls: i32,
    failed_calls: i32,
}

#[derive(sqlx::FromRow)]
struct ContactRow {
    campaign_id: String,
    phone_number: String,
    status: String,
    attempts: i32,
    last_attempt: Option<NaiveDateTime>,
    next_attempt: Option<NaiveDateTime>,
    call_result: Option<String>,
    call_duration: Option<i32>,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("relational store connected");
        Ok(Arc::new(Self { pool }))
    }

    pub async fn load_scenario(&self, scenario_id: &str) -> Result<Option<ScenarioConfig>, DbError> {
        let row = sqlx::query_as::<_, ScenarioRow>(
            "SELECT scenario_id, name, entry_points, system_prompt, welcome_message, \
             fallback_responses, max_turns, timeout_seconds, custom_settings \
             FROM scenarios WHERE scenario_id = ? AND is_active = 1",
        )
        .bind(scenario_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_config().map_err(DbError::from)).transpose()
    }

    /// Resolve the active entry point matching a dialed destination,
    /// highest priority first.
    pub async fn entry_point_for(&self, destination: &str) -> Result<Option<EntryPoint>, DbError> {
        let rows = sqlx::query_as::<_, EntryPointRow>(
            "SELECT entry_point_id, dialplan_pattern, scenario_id, gateway_id, priority \
             FROM entry_points WHERE is_active = 1 ORDER BY priority ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let entry = EntryPoint {
                entry_point_id: row.entry_point_id,
                dialplan_pattern: row.dialplan_pattern,
                scenario_id: row.scenario_id,
                gateway_id: row.gateway_id,
                priority: row.priority,
            }
            .validate()?;
            if entry.matches(destination) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub async fn load_gateway_config(&self, gateway_id: &str) -> Result<GatewayConfig, DbError> {
        let row = sqlx::query_as::<_, GatewayRow>(
            "SELECT gateway_id, gateway_type, profile, username, password, realm, proxy, \
             codecs, max_channels FROM gateways WHERE gateway_id = ? AND is_active = 1",
        )
        .bind(gateway_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(GatewayConfig::try_from(GatewayRecord {
            gateway_id: row.gateway_id,
            gateway_type: row.gateway_type,
            profile: row.profile,
            username: row.username,
            password: row.password,
            realm: row.realm,
            proxy: row.proxy,
            codecs: row.codecs.map(|j| j.0).unwrap_or_default(),
            max_channels: row.max_channels.max(0) as u32,
        })?)
    }

    /// Active switch instances to bring event-socket connections up for.
    pub async fn switch_instances(&self) -> Result<Vec<SwitchInstanceConfig>, DbError> {
        let rows = sqlx::query_as::<_, SwitchInstanceRow>(
            "SELECT instance_id, host, port, password, scenario_mapping, gateway_ids \
             FROM freeswitch_configs WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            instances.push(
                SwitchInstanceConfig {
                    instance_id: row.instance_id,
                    host: row.host,
                    port: row.port.max(0) as u16,
                    password: row.password,
                    scenario_mapping: row.scenario_mapping.map(|j| j.0).unwrap_or_default(),
                    gateway_ids: row.gateway_ids.map(|j| j.0).unwrap_or_default(),
                }
                .validate()?,
            );
        }
        Ok(instances)
    }

    pub async fn insert_call_record(&self, report: &CallReport) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO call_records \
             (session_id, caller_number, start_time, end_time, duration, conversation_log, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&report.session_id)
        .bind(&report.caller_number)
        .bind(report.started_at.naive_utc())
        .bind(report.ended_at.naive_utc())
        .bind(report.duration_secs as i64)
        .bind(serde_json::to_string(&report.transcript).unwrap_or_else(|_| "[]".to_string()))
        .bind(&report.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn campaign_from_row(row: CampaignRow) -> Campaign {
    Campaign {
        campaign_id: row.campaign_id,
        gateway_id: row.gateway_id,
        scenario_id: row.scenario_id,
        status: CampaignStatus::parse(&row.status).unwrap_or(CampaignStatus::Draft),
        max_concurrent_calls: row.max_concurrent_calls.max(1) as u32,
        call_timeout: std::time::Duration::from_secs(row.call_timeout.max(0) as u64),
        retry_attempts: row.retry_attempts.max(0) as u32,
        retry_interval: std::time::Duration::from_secs(row.retry_interval.max(0) as u64),
        schedule_start: row.schedule_start.map(|t| t.and_utc()),
        schedule_end: row.schedule_end.map(|t| t.and_utc()),
        counters: CampaignCounters {
            total_contacts: row.total_contacts.max(0) as u32,
            completed_contacts: row.completed_contacts.max(0) as u32,
            successful_calls: row.successful_calls.max(0) as u32,
            failed_calls: row.failed_calls.max(0) as u32,
        },
    }
}

fn sql_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

#[async_trait]
impl CampaignStore for Db {
    async fn load_campaign(&self, campaign_id: &str) -> Result<Campaign, StoreError> {
        let row = sqlx::query_as::<_, CampaignRow>(
            "SELECT campaign_id, gateway_id, scenario_id, status, max_concurrent_calls, \
             call_timeout, retry_attempts, retry_interval, schedule_start, schedule_end, \
             total_contacts, completed_contacts, successful_calls, failed_calls \
             FROM outbound_campaigns WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(campaign_from_row(row))
    }

    async fn load_gateway(&self, gateway_id: &str) -> Result<GatewayConfig, StoreError> {
        self.load_gateway_config(gateway_id)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn load_contacts(&self, campaign_id: &str) -> Result<Vec<CampaignContact>, StoreError> {
        let rows = sqlx::query_as::<_, ContactRow>(
            "SELECT campaign_id, phone_number, status, attempts, last_attempt, next_attempt, \
             call_result, call_duration FROM outbound_contacts \
             WHERE campaign_id = ? AND status IN ('pending', 'in_progress') ORDER BY id ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(rows
            .into_iter()
            .map(|row| CampaignContact {
                campaign_id: row.campaign_id,
                phone_number: row.phone_number,
                // in_progress rows from a crashed run go back to pending
                status: match ContactStatus::parse(&row.status) {
                    Some(ContactStatus::InProgress) | None => ContactStatus::Pending,
                    Some(status) => status,
                },
                attempts: row.attempts.max(0) as u32,
                last_attempt: row.last_attempt.map(|t| t.and_utc()),
                next_attempt: row.next_attempt.map(|t| t.and_utc()),
                call_result: row.call_result,
                call_duration: row.call_duration.map(|d| d.max(0) as u64),
            })
            .collect())
    }

    async fn save_contact(&self, contact: &CampaignContact) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbound_contacts SET status = ?, attempts = ?, last_attempt = ?, \
             next_attempt = ?, call_result = ?, call_duration = ? \
             WHERE campaign_id = ? AND phone_number = ?",
        )
        .bind(contact.status.as_str())
        .bind(contact.attempts as i32)
        .bind(contact.last_attempt.map(|t| t.naive_utc()))
        .bind(contact.next_attempt.map(|t| t.naive_utc()))
        .bind(&contact.call_result)
        .bind(contact.call_duration.map(|d| d as i64))
        .bind(&contact.campaign_id)
        .bind(&contact.phone_number)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbound_campaigns SET status = ? WHERE campaign_id = ?")
            .bind(status.as_str())
            .bind(campaign_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    /// Increments run inside the database so concurrent completions from
    /// different dial tasks cannot lose updates.
    async fn bump_counters(&self, campaign_id: &str, delta: CounterDelta) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbound_campaigns SET \
             completed_contacts = completed_contacts + ?, \
             successful_calls = successful_calls + ?, \
             failed_calls = failed_calls + ? \
             WHERE campaign_id = ?",
        )
        .bind(delta.completed_contacts as i32)
        .bind(delta.successful_calls as i32)
        .bind(delta.failed_calls as i32)
        .bind(campaign_id)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }
}

#[async_trait]
impl ScenarioSource for Db {
    async fn scenario_for_destination(
        &self,
        _instance_id: &str,
        destination: &str,
    ) -> Option<Arc<ScenarioConfig>> {
        let entry = match self.entry_point_for(destination).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, %destination, "entry point lookup failed");
                return None;
            }
        };
        self.scenario_by_id(&entry.scenario_id).await
    }

    async fn scenario_by_id(&self, scenario_id: &str) -> Option<Arc<ScenarioConfig>> {
        match self.load_scenario(scenario_id).await {
            Ok(Some(scenario)) => Some(Arc::new(scenario)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, %scenario_id, "scenario load failed");
                None
            }
        }
    }
}

//! Call-control seam between sessions and the switch.
//!
//! Sessions, the audio pipeline and the outbound scheduler only ever see
//! this trait; tests substitute a scripted switch.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::{EslError, EslResult};
use super::event::EslCommand;
use super::manager::EslManager;

#[async_trait]
pub trait SwitchControl: Send + Sync {
    async fn answer(&self, leg_id: &str) -> EslResult<()>;
    /// Start playback of a switch-resolvable audio reference on a leg.
    async fn play(&self, leg_id: &str, audio_ref: &str) -> EslResult<()>;
    /// Stop and clear any playback in progress on a leg.
    async fn stop_play(&self, leg_id: &str) -> EslResult<()>;
    async fn hangup(&self, leg_id: &str) -> EslResult<()>;
    /// Originate a new leg; resolves to the new leg's UUID once the
    /// switch reports the call established.
    async fn originate(&self, dial_string: &str, park_target: &str) -> EslResult<String>;
}

/// `SwitchControl` bound to one switch instance of the manager.
pub struct InstanceControl {
    manager: Arc<EslManager>,
    instance_id: String,
}

impl InstanceControl {
    pub fn new(manager: Arc<EslManager>, instance_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            instance_id: instance_id.into(),
        })
    }

    async fn run(&self, command: EslCommand) -> EslResult<()> {
        let reply = self.manager.send_command(&self.instance_id, command).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(EslError::CommandFailed(reply.text))
        }
    }
}

#[async_trait]
impl SwitchControl for InstanceControl {
    async fn answer(&self, leg_id: &str) -> EslResult<()> {
        self.run(EslCommand::answer(leg_id)).await
    }

    async fn play(&self, leg_id: &str, audio_ref: &str) -> EslResult<()> {
        self.run(EslCommand::play(leg_id, audio_ref)).await
    }

    async fn stop_play(&self, leg_id: &str) -> EslResult<()> {
        self.run(EslCommand::stop_play(leg_id)).await
    }

    async fn hangup(&self, leg_id: &str) -> EslResult<()> {
        self.run(EslCommand::hangup(leg_id)).await
    }

    async fn originate(&self, dial_string: &str, park_target: &str) -> EslResult<String> {
        let reply = self
            .manager
            .send_command_bounded(
                &self.instance_id,
                EslCommand::originate(dial_string, park_target),
                self.manager.originate_timeout(),
            )
            .await?;
        if !reply.ok {
            return Err(EslError::CommandFailed(reply.text));
        }
        reply
            .leg_id()
            .map(str::to_string)
            .ok_or_else(|| EslError::Protocol(format!("originate reply without leg id: {}", reply.text)))
    }
}

/**
 * CONTROL RECONCILER - Actuator channels and filter health
 *
 * Only the scrubber is driven automatically, and only while its channel is in
 * auto mode. It engages above the VOC maximum and releases below 80% of it;
 * between the two bounds it keeps its current state.
 *
 * The KMnO4 filter medium wears with scrubber run time, not wall-clock time.
 */

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Release bound as a fraction of the VOC maximum.
pub const HYSTERESIS_RATIO: f64 = 0.8;
/// Active ticks per degradation step.
pub const DEGRADE_EVERY_TICKS: u64 = 10;
/// Percent lost per degradation step.
pub const DEGRADE_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Active,
    Standby,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Scrubber,
    Cooling,
    Humidifier,
    Camera,
}

impl Channel {
    pub fn parse(raw: &str) -> KernelResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scrubber" => Ok(Channel::Scrubber),
            "cooling" => Ok(Channel::Cooling),
            "humidifier" => Ok(Channel::Humidifier),
            "camera" => Ok(Channel::Camera),
            other => Err(KernelError::UnknownChannel(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Scrubber => "scrubber",
            Channel::Cooling => "cooling",
            Channel::Humidifier => "humidifier",
            Channel::Camera => "camera",
        }
    }

    /// The camera reports liveness only; operators cannot switch it.
    pub fn is_controllable(&self) -> bool {
        !matches!(self, Channel::Camera)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub mode: ControlMode,
}

impl ChannelStatus {
    const fn auto(state: ChannelState) -> Self {
        Self { state, mode: ControlMode::Auto }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub scrubber: ChannelStatus,
    pub cooling: ChannelStatus,
    pub humidifier: ChannelStatus,
    pub camera: ChannelStatus,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            scrubber: ChannelStatus::auto(ChannelState::Standby),
            cooling: ChannelStatus::auto(ChannelState::Active),
            humidifier: ChannelStatus::auto(ChannelState::Active),
            camera: ChannelStatus::auto(ChannelState::Standby),
        }
    }
}

impl ActuatorState {
    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelStatus {
        match channel {
            Channel::Scrubber => &mut self.scrubber,
            Channel::Cooling => &mut self.cooling,
            Channel::Humidifier => &mut self.humidifier,
            Channel::Camera => &mut self.camera,
        }
    }

    /// Operator switch: sets the state and pins the channel to manual mode.
    pub fn toggle(&mut self, channel: Channel, active: bool) -> KernelResult<ChannelStatus> {
        if !channel.is_controllable() {
            return Err(KernelError::ChannelNotControllable(channel.as_str().to_string()));
        }
        let status = self.channel_mut(channel);
        status.state = if active { ChannelState::Active } else { ChannelState::Standby };
        status.mode = ControlMode::Manual;
        Ok(*status)
    }

    /// Hands the channel back to automatic control; state is left as is until
    /// the next cycle.
    pub fn release(&mut self, channel: Channel) -> KernelResult<ChannelStatus> {
        if !channel.is_controllable() {
            return Err(KernelError::ChannelNotControllable(channel.as_str().to_string()));
        }
        let status = self.channel_mut(channel);
        status.mode = ControlMode::Auto;
        Ok(*status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubberTransition {
    Engaged,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub state: ActuatorState,
    pub transition: Option<ScrubberTransition>,
}

pub fn next_scrubber_state(current: ChannelState, voc: f64, voc_max: f64) -> ChannelState {
    match current {
        ChannelState::Active if voc < voc_max * HYSTERESIS_RATIO => ChannelState::Standby,
        ChannelState::Active => ChannelState::Active,
        _ if voc > voc_max => ChannelState::Active,
        other => other,
    }
}

pub fn camera_state(last_snapshot_at: Option<OffsetDateTime>, now: OffsetDateTime, stale_after: Duration) -> ChannelState {
    match last_snapshot_at {
        None => ChannelState::Standby,
        Some(at) if now - at <= stale_after => ChannelState::Active,
        Some(_) => ChannelState::Offline,
    }
}

/// One cycle of automatic control. In manual mode the scrubber is left to the
/// operator and only the camera channel follows its liveness.
pub fn reconcile(voc: f64, voc_max: f64, current: ActuatorState, camera: ChannelState) -> Reconciliation {
    let mut state = current;
    state.camera.state = camera;

    let mut transition = None;
    if current.scrubber.mode == ControlMode::Auto {
        let next = next_scrubber_state(current.scrubber.state, voc, voc_max);
        transition = match (current.scrubber.state == ChannelState::Active, next == ChannelState::Active) {
            (false, true) => Some(ScrubberTransition::Engaged),
            (true, false) => Some(ScrubberTransition::Released),
            _ => None,
        };
        state.scrubber.state = next;
    }
    Reconciliation { state, transition }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLevel {
    Good,
    Low,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConsumableHealth {
    pub percent_remaining: f64,
    pub cumulative_active_ticks: u64,
}

impl ConsumableHealth {
    pub fn new(initial_percent: f64) -> Self {
        let percent_remaining = if initial_percent.is_finite() { initial_percent.clamp(0.0, 100.0) } else { 100.0 };
        Self { percent_remaining, cumulative_active_ticks: 0 }
    }

    /// Advances one evaluation cycle. Returns true when the medium lost a step.
    pub fn tick(&mut self, scrubber_active: bool) -> bool {
        if !scrubber_active {
            return false;
        }
        self.cumulative_active_ticks += 1;
        if self.cumulative_active_ticks % DEGRADE_EVERY_TICKS != 0 || self.percent_remaining <= 0.0 {
            return false;
        }
        self.percent_remaining = (self.percent_remaining - DEGRADE_STEP).max(0.0);
        true
    }

    pub fn level(&self) -> FilterLevel {
        if self.percent_remaining < 20.0 {
            FilterLevel::Critical
        } else if self.percent_remaining < 50.0 {
            FilterLevel::Low
        } else {
            FilterLevel::Good
        }
    }
}

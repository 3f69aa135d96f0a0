//! BLE Connection Module
//!
//! The connection lifecycle state machine. It owns the scoreboard model,
//! the discovered-device list, the telemetry and action logs, and the
//! pending-write table used for write retries.
//!
//! The controller never sleeps and never reads the clock. Callers pass
//! `now` in and wake it again at [`ConnectionController::next_deadline`];
//! [`super::service`] does this on a single tokio task.

use crate::domain::action_log::{ActionKind, ActionLog};
use crate::domain::models::{
    AppEvent, ConnectionStatus, ControllerCommand, ControllerSnapshot, DeviceId,
    DiscoveredDevice, MessageSeverity, Side, StatusMessage,
};
use crate::domain::scoreboard::ScoreboardState;
use crate::domain::settings::Settings;
use crate::domain::telemetry::TelemetryLog;
use crate::infrastructure::bluetooth::link::{
    CharacteristicKind, ConnectAttempt, Link, LinkEvent, TransportState,
};
use crate::infrastructure::bluetooth::protocol::{self, CommandFlags, CommandPacket};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub type WriteId = u64;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Service UUID advertised by scoreboards
    pub service_uuid: Uuid,
    /// Scanning reverts to `Disconnected` after this long
    pub scan_timeout: Duration,
    /// A connect or reconnect attempt fails after this long
    pub connect_timeout: Duration,
    /// Attempts per outbound packet
    pub write_retry_count: u32,
    /// Wait before check `n` is `write_retry_base * n`
    pub write_retry_base: Duration,
    /// Failed reconnect attempts tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// Sets flag bit 0 on every outbound packet
    pub slow_update_rate: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            write_retry_count: 3,
            write_retry_base: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            slow_update_rate: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            scan_timeout: Duration::from_secs(settings.scan_timeout_secs),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            write_retry_count: settings.write_retry_count.max(1),
            write_retry_base: Duration::from_millis(settings.write_retry_base_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts.max(1),
            slow_update_rate: settings.slow_update_rate,
        })
    }
}

/// Final result of one outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub write_id: WriteId,
    pub success: bool,
}

#[derive(Debug)]
struct PendingWrite {
    id: WriteId,
    packet: CommandPacket,
    attempt: u32,
    check_at: Instant,
}

pub struct ConnectionController<L: Link> {
    link: L,
    config: ControllerConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,

    status: ConnectionStatus,
    transport_state: TransportState,
    last_error: Option<String>,

    // Discovery
    discovered: Vec<DiscoveredDevice>,
    scan_deadline: Option<Instant>,

    // Session
    target: Option<DiscoveredDevice>,
    connected_device: Option<DiscoveredDevice>,
    connect_deadline: Option<Instant>,
    /// Tag of the latest link connect; events for older ones are dropped
    connect_attempt: ConnectAttempt,
    reconnect_attempts: u32,
    command_ready: bool,
    telemetry_available: bool,
    telemetry_enabled: bool,

    // Model and logs
    state: ScoreboardState,
    telemetry: TelemetryLog,
    actions: ActionLog,

    // Writes
    pending_writes: Vec<PendingWrite>,
    next_write_id: WriteId,
}

impl<L: Link> ConnectionController<L> {
    pub fn new(
        link: L,
        config: ControllerConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            link,
            config,
            event_sender,
            status: ConnectionStatus::Disconnected,
            transport_state: TransportState::Unknown,
            last_error: None,
            discovered: Vec::new(),
            scan_deadline: None,
            target: None,
            connected_device: None,
            connect_deadline: None,
            connect_attempt: 0,
            reconnect_attempts: 0,
            command_ready: false,
            telemetry_available: false,
            telemetry_enabled: false,
            state: ScoreboardState::new(),
            telemetry: TelemetryLog::default(),
            actions: ActionLog::default(),
            pending_writes: Vec::new(),
            next_write_id: 1,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport_state
    }

    pub fn state(&self) -> &ScoreboardState {
        &self.state
    }

    pub fn discovered_devices(&self) -> &[DiscoveredDevice] {
        &self.discovered
    }

    pub fn connected_device(&self) -> Option<&DiscoveredDevice> {
        self.connected_device.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry_enabled
    }

    pub fn telemetry_log(&self) -> &TelemetryLog {
        &self.telemetry
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.actions
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            status: self.status,
            state: self.state.clone(),
            discovered_devices: self.discovered.clone(),
            connected_device: self.connected_device.clone(),
            last_error: self.last_error.clone(),
            telemetry_enabled: self.telemetry_enabled,
            telemetry: self.telemetry.to_vec(),
            actions: self.actions.to_vec(),
        }
    }

    /// Route a consumer command
    pub fn apply(&mut self, command: ControllerCommand, now: Instant) {
        match command {
            ControllerCommand::StartScan => self.start_scan(now),
            ControllerCommand::StopScan => self.stop_scan(),
            ControllerCommand::Connect(id) => self.connect(&id, now),
            ControllerCommand::Disconnect => self.disconnect(),
            ControllerCommand::IncrementScore(side, amount) => {
                self.increment_score(side, amount, now);
            }
            ControllerCommand::DecrementScore(side) => {
                self.decrement_score(side, now);
            }
            ControllerCommand::SetScore(side, value) => {
                self.set_score(side, value, now);
            }
            ControllerCommand::StartTimer { minutes, seconds } => {
                self.start_timer(minutes, seconds, now);
            }
            ControllerCommand::StopTimer => {
                self.stop_timer(now);
            }
            ControllerCommand::ResetScores => {
                self.reset_scores(now);
            }
            ControllerCommand::SetTelemetryEnabled(enabled) => self.set_telemetry_enabled(enabled),
            ControllerCommand::ClearTelemetryLog => self.clear_telemetry_log(),
            ControllerCommand::ClearActionLog => self.clear_action_log(),
            ControllerCommand::SetSlowUpdateRate(slow) => {
                self.set_slow_update_rate(slow, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    pub fn start_scan(&mut self, now: Instant) {
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Scanning => {}
            other => {
                warn!("Ignoring scan request while {:?}", other);
                return;
            }
        }

        if !self.transport_state.is_available() {
            let message = self
                .transport_state
                .fault_message()
                .unwrap_or("Bluetooth is not available");
            self.report_error(message);
            return;
        }

        self.discovered.clear();
        self.last_error = None;

        if let Err(e) = self.link.start_scan(self.config.service_uuid) {
            self.report_error(&format!("Failed to start scan: {}", e));
            self.enter_disconnected();
            return;
        }

        info!("Starting BLE scan for service UUID: {}", self.config.service_uuid);
        self.scan_deadline = Some(now + self.config.scan_timeout);
        self.set_status(ConnectionStatus::Scanning);
        self.send_log("Scanning for scoreboards...", MessageSeverity::Info);
    }

    pub fn stop_scan(&mut self) {
        if self.status != ConnectionStatus::Scanning {
            return;
        }
        info!("Stopping BLE scan...");
        self.link.stop_scan();
        self.enter_disconnected();
    }

    fn on_discovered(&mut self, id: DeviceId, name: Option<String>, rssi: i16) {
        if self.status != ConnectionStatus::Scanning {
            trace!("Ignoring discovery of {} outside a scan", id);
            return;
        }

        let device = DiscoveredDevice::new(id, name.as_deref(), rssi);
        match self.discovered.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device.clone(),
            None => {
                info!(
                    "Found scoreboard {} ({}) RSSI: {} dBm",
                    device.hardware_id, device.id, device.rssi
                );
                self.discovered.push(device.clone());
            }
        }
        let _ = self.event_sender.send(AppEvent::DeviceFound(device));
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&mut self, id: &DeviceId, now: Instant) {
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Scanning => {}
            other => {
                warn!("Ignoring connect request while {:?}", other);
                return;
            }
        }

        let Some(device) = self.discovered.iter().find(|d| &d.id == id).cloned() else {
            self.report_error(&format!("Unknown device: {}", id));
            return;
        };

        if self.status == ConnectionStatus::Scanning {
            self.link.stop_scan();
            self.scan_deadline = None;
        }

        info!("Connecting to scoreboard {} ({})", device.hardware_id, device.id);
        self.target = Some(device);
        self.reconnect_attempts = 0;
        self.command_ready = false;

        self.connect_attempt += 1;
        if let Err(e) = self.link.connect(id, self.connect_attempt) {
            self.report_error(&format!("Connection failed: {}", e));
            self.enter_disconnected();
            return;
        }

        self.connect_deadline = Some(now + self.config.connect_timeout);
        self.set_status(ConnectionStatus::Connecting);
        self.send_log("Connecting to scoreboard...", MessageSeverity::Info);
    }

    pub fn disconnect(&mut self) {
        match self.status {
            ConnectionStatus::Disconnected => return,
            ConnectionStatus::Scanning => {
                self.stop_scan();
                return;
            }
            _ => {}
        }

        if let Some(target) = &self.target {
            self.link.disconnect(&target.id);
        }
        if self.connected_device.is_some() {
            let device_id = self.action_device_id();
            self.actions.record(
                &device_id,
                ActionKind::Disconnected,
                format!("Disconnected from {}", device_id),
            );
        }

        info!("Disconnected from scoreboard");
        self.send_log("Disconnected from scoreboard", MessageSeverity::Info);
        self.enter_disconnected();
    }

    /// Handle one event from the transport
    pub fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        trace!("Link event: {:?}", event);
        match event {
            LinkEvent::TransportStateChanged(state) => self.on_transport_state(state),
            LinkEvent::Discovered { id, name, rssi } => self.on_discovered(id, name, rssi),
            LinkEvent::ScanFailed { reason } => {
                if self.status == ConnectionStatus::Scanning {
                    self.report_error(&format!("Scan failed: {}", reason));
                    self.enter_disconnected();
                }
            }
            LinkEvent::Connected { id, attempt } => {
                if self.is_current(&id, attempt) {
                    debug!("Link up to {}, waiting for characteristics", id);
                }
            }
            LinkEvent::ConnectFailed {
                id,
                attempt,
                reason,
            } => {
                if !self.is_current(&id, attempt) {
                    debug!("Ignoring failure of superseded connect #{}: {}", attempt, reason);
                    return;
                }
                match self.status {
                    ConnectionStatus::Connecting => {
                        self.report_error(&format!("Connection failed: {}", reason));
                        self.enter_disconnected();
                    }
                    ConnectionStatus::Reconnecting => self.reconnect_failed(&reason, now),
                    _ => {}
                }
            }
            LinkEvent::CharacteristicsReady {
                id,
                attempt,
                command,
                telemetry,
            } => {
                if !self.is_current(&id, attempt) || !self.is_establishing() {
                    return;
                }
                if command {
                    self.enter_connected(telemetry, now);
                } else {
                    self.abandon_session(&id, "Scoreboard characteristic not found");
                }
            }
            LinkEvent::CharacteristicDiscoveryFailed {
                id,
                attempt,
                reason,
            } => {
                if self.is_current(&id, attempt) && self.is_establishing() {
                    self.abandon_session(
                        &id,
                        &format!("Characteristic discovery failed: {}", reason),
                    );
                }
            }
            LinkEvent::Disconnected { id, cause } => {
                if self.is_target(&id) {
                    self.on_link_disconnected(&id, cause, now);
                }
            }
            LinkEvent::ValueUpdated {
                characteristic,
                value,
            } => match characteristic {
                CharacteristicKind::Telemetry => self.on_telemetry(&value),
                CharacteristicKind::Command => {
                    trace!("Command indication: {:02X?}", value);
                }
            },
            LinkEvent::WriteResult { result } => {
                if let Err(e) = result {
                    self.report_error(&format!("Write failed: {}", e));
                }
            }
            LinkEvent::NotifyStateChanged {
                characteristic,
                result,
            } => match result {
                Ok(enabled) => debug!("{:?} notifications now {}", characteristic, enabled),
                Err(e) => {
                    if characteristic == CharacteristicKind::Telemetry {
                        self.telemetry_enabled = false;
                    }
                    self.report_error(&format!("Failed to enable notifications: {}", e));
                }
            },
        }
    }

    fn on_transport_state(&mut self, state: TransportState) {
        info!("Bluetooth transport state: {}", state);
        self.transport_state = state;

        match state.fault_message() {
            Some(message) => {
                self.report_error(message);
                if state == TransportState::PoweredOff
                    && self.status != ConnectionStatus::Disconnected
                {
                    self.enter_disconnected();
                }
            }
            None => {
                if state == TransportState::PoweredOn {
                    self.last_error = None;
                }
            }
        }
    }

    fn on_link_disconnected(&mut self, id: &DeviceId, cause: Option<String>, now: Instant) {
        match (self.status, cause) {
            (ConnectionStatus::Connected, Some(cause)) => {
                warn!("Unexpected disconnect from {}: {}", id, cause);
                self.send_log(
                    &format!("Connection lost ({}), reconnecting...", cause),
                    MessageSeverity::Warning,
                );
                self.command_ready = false;
                self.reconnect_attempts = 0;
                self.set_status(ConnectionStatus::Reconnecting);
                self.issue_reconnect(now);
            }
            (ConnectionStatus::Connected, None) => {
                let device_id = self.action_device_id();
                self.actions.record(
                    &device_id,
                    ActionKind::Disconnected,
                    format!("Disconnected from {}", device_id),
                );
                self.send_log("Disconnected from scoreboard", MessageSeverity::Info);
                self.enter_disconnected();
            }
            (ConnectionStatus::Connecting, cause) => {
                let reason = cause.unwrap_or_else(|| "Disconnected while connecting".into());
                self.report_error(&format!("Connection failed: {}", reason));
                self.enter_disconnected();
            }
            (ConnectionStatus::Reconnecting, cause) => {
                let reason = cause.unwrap_or_else(|| "Link dropped".into());
                self.reconnect_failed(&reason, now);
            }
            _ => {}
        }
    }

    fn issue_reconnect(&mut self, now: Instant) {
        let Some(target) = self.target.clone() else {
            self.enter_disconnected();
            return;
        };

        info!(
            "Reconnecting to {} (attempt {})",
            target.id,
            self.reconnect_attempts + 1
        );
        self.connect_attempt += 1;
        match self.link.connect(&target.id, self.connect_attempt) {
            Ok(()) => self.connect_deadline = Some(now + self.config.connect_timeout),
            Err(e) => self.reconnect_failed(&e.to_string(), now),
        }
    }

    fn reconnect_failed(&mut self, reason: &str, now: Instant) {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.report_error(&format!(
                "Reconnect failed after {} attempts: {}",
                self.reconnect_attempts, reason
            ));
            let device_id = self.action_device_id();
            self.actions.record(
                &device_id,
                ActionKind::Disconnected,
                format!("Lost connection to {}", device_id),
            );
            self.enter_disconnected();
        } else {
            warn!(
                "Reconnect attempt {} failed: {}",
                self.reconnect_attempts, reason
            );
            self.issue_reconnect(now);
        }
    }

    fn abandon_session(&mut self, id: &DeviceId, message: &str) {
        self.report_error(message);
        self.link.disconnect(id);
        self.enter_disconnected();
    }

    fn enter_connected(&mut self, telemetry_available: bool, now: Instant) {
        let reconnected = self.status == ConnectionStatus::Reconnecting;

        self.connect_deadline = None;
        self.reconnect_attempts = 0;
        self.command_ready = true;
        self.telemetry_available = telemetry_available;
        self.connected_device = self.target.clone();
        let hardware_id = self
            .connected_device
            .as_ref()
            .map(|d| d.hardware_id.clone());
        self.state.connected_device_id = hardware_id.clone();
        self.last_error = None;
        self.set_status(ConnectionStatus::Connected);

        let hardware_id = hardware_id.unwrap_or_else(|| "Unknown".into());
        let verb = if reconnected { "Reconnected" } else { "Connected" };
        self.actions.record(
            &hardware_id,
            ActionKind::Connected,
            format!("{} to {}", verb, hardware_id),
        );
        info!("{} to scoreboard {}", verb, hardware_id);
        self.send_log(
            &format!("{} to scoreboard {}", verb, hardware_id),
            MessageSeverity::Success,
        );

        // Packets still inside their retry window missed the link
        let stalled: Vec<(WriteId, CommandPacket)> =
            self.pending_writes.iter().map(|w| (w.id, w.packet)).collect();

        // Handshake, replay, then resync whatever the display may have missed
        let handshake = protocol::encode_command(0, 0, 0, 0, CommandFlags::empty());
        self.send_packet(handshake, now);
        for (id, packet) in stalled {
            debug!("Re-sending packet #{} after reconnect", id);
            if let Err(e) = self.link.write_command(packet) {
                warn!("Re-send of #{} rejected by link: {}", id, e);
            }
        }
        if self.state.has_content() || self.state.force_redraw_pending() {
            let resync = self.state.take_resync_packet(self.config.slow_update_rate);
            self.send_packet(resync, now);
        }

        if self.telemetry_enabled {
            if !telemetry_available {
                self.telemetry_enabled = false;
            } else if reconnected {
                if let Err(e) = self.link.set_telemetry_notify(true) {
                    self.telemetry_enabled = false;
                    self.report_error(&format!("Failed to enable notifications: {}", e));
                }
            }
        }
    }

    /// Reset session state. Scores, timer and logs are left alone.
    fn enter_disconnected(&mut self) {
        self.scan_deadline = None;
        self.connect_deadline = None;
        self.target = None;
        self.connected_device = None;
        self.state.connected_device_id = None;
        self.command_ready = false;
        self.telemetry_available = false;
        self.telemetry_enabled = false;
        self.reconnect_attempts = 0;
        self.set_status(ConnectionStatus::Disconnected);
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Queue a packet with the retry policy. `None` means it was not sent at all.
    ///
    /// The policy is optimistic: a check that finds the session still
    /// `Connected` counts as delivered. Packets are not ordered against each
    /// other; a later write may overtake one that is still being retried.
    pub fn send_packet(&mut self, packet: CommandPacket, now: Instant) -> Option<WriteId> {
        if self.status != ConnectionStatus::Connected || !self.command_ready {
            debug!("Not connected, packet {:?} not sent", packet);
            return None;
        }

        let id = self.next_write_id;
        self.next_write_id += 1;

        trace!("Writing packet #{}: {:?}", id, packet);
        if let Err(e) = self.link.write_command(packet) {
            warn!("Write #{} rejected by link: {}", id, e);
        }

        self.pending_writes.push(PendingWrite {
            id,
            packet,
            attempt: 1,
            check_at: now + self.config.write_retry_base,
        });
        Some(id)
    }

    /// Earliest instant at which [`Self::poll_timers`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_writes
            .iter()
            .map(|w| w.check_at)
            .chain(self.scan_deadline)
            .chain(self.connect_deadline)
            .min()
    }

    /// Fire every deadline that has passed
    pub fn poll_timers(&mut self, now: Instant) -> Vec<WriteOutcome> {
        if let Some(deadline) = self.scan_deadline {
            if now >= deadline && self.status == ConnectionStatus::Scanning {
                info!("Scan timed out with {} device(s)", self.discovered.len());
                self.link.stop_scan();
                self.enter_disconnected();
            }
        }

        if let Some(deadline) = self.connect_deadline {
            if now >= deadline {
                self.connect_deadline = None;
                match self.status {
                    ConnectionStatus::Connecting => {
                        if let Some(target) = self.target.clone() {
                            self.link.disconnect(&target.id);
                        }
                        self.report_error("Connection timed out");
                        self.enter_disconnected();
                    }
                    ConnectionStatus::Reconnecting => {
                        self.reconnect_failed("Connection timed out", now);
                    }
                    _ => {}
                }
            }
        }

        self.poll_writes(now)
    }

    fn poll_writes(&mut self, now: Instant) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::new();
        let mut index = 0;

        while index < self.pending_writes.len() {
            if self.pending_writes[index].check_at > now {
                index += 1;
                continue;
            }

            let success = match self.status {
                ConnectionStatus::Connected => Some(true),
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                    let write = &mut self.pending_writes[index];
                    if write.attempt < self.config.write_retry_count {
                        write.attempt += 1;
                        write.check_at = now + self.config.write_retry_base * write.attempt;
                        debug!(
                            "Link down, packet #{} waits for attempt {}",
                            write.id, write.attempt
                        );
                        None
                    } else {
                        Some(false)
                    }
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Scanning => Some(false),
            };

            match success {
                Some(success) => {
                    let write = self.pending_writes.remove(index);
                    if success {
                        trace!("Packet #{} delivered", write.id);
                    } else {
                        warn!(
                            "Failed to send packet #{} after {} attempt(s)",
                            write.id, write.attempt
                        );
                    }
                    let _ = self.event_sender.send(AppEvent::PacketSent {
                        write_id: write.id,
                        success,
                    });
                    outcomes.push(WriteOutcome {
                        write_id: write.id,
                        success,
                    });
                }
                None => index += 1,
            }
        }

        outcomes
    }

    // ------------------------------------------------------------------
    // Scoreboard actions
    // ------------------------------------------------------------------

    pub fn increment_score(&mut self, side: Side, amount: u8, now: Instant) -> Option<WriteId> {
        let score = self.state.increment_score(side, amount);
        self.record_score_action(side, format!("{} +{} (now {})", side, amount, score));
        self.send_state(now)
    }

    /// No-op at zero: nothing is logged or sent
    pub fn decrement_score(&mut self, side: Side, now: Instant) -> Option<WriteId> {
        if !self.state.decrement_score(side) {
            return None;
        }
        let score = self.state.score(side);
        self.record_score_action(side, format!("{} -1 (now {})", side, score));
        self.send_state(now)
    }

    pub fn set_score(&mut self, side: Side, value: u8, now: Instant) -> Option<WriteId> {
        let score = self.state.set_score(side, value);
        self.record_score_action(side, format!("{} set to {}", side, score));
        self.send_state(now)
    }

    pub fn start_timer(&mut self, minutes: u8, seconds: u8, now: Instant) -> Option<WriteId> {
        self.state.start_timer(minutes, seconds);
        let description = format!("Timer {}", self.state.timer_formatted());
        self.record_action(ActionKind::Timer, description);
        self.send_state(now)
    }

    pub fn stop_timer(&mut self, now: Instant) -> Option<WriteId> {
        self.state.stop_timer();
        self.record_action(ActionKind::Timer, "Timer stopped, back to score mode");
        self.send_state(now)
    }

    pub fn reset_scores(&mut self, now: Instant) -> Option<WriteId> {
        self.state.reset();
        self.record_action(ActionKind::ScoresReset, "Scores reset to 00-00");
        self.send_state(now)
    }

    pub fn set_slow_update_rate(&mut self, slow: bool, now: Instant) -> Option<WriteId> {
        if self.config.slow_update_rate == slow {
            return None;
        }
        self.config.slow_update_rate = slow;
        let cadence = if slow { "slow" } else { "normal" };
        self.record_action(
            ActionKind::SettingsChanged,
            format!("Update rate set to {}", cadence),
        );
        self.send_state(now)
    }

    fn send_state(&mut self, now: Instant) -> Option<WriteId> {
        let _ = self
            .event_sender
            .send(AppEvent::StateChanged(self.state.clone()));

        if self.status != ConnectionStatus::Connected {
            return None;
        }
        let packet = self.state.take_packet(self.config.slow_update_rate);
        self.send_packet(packet, now)
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    pub fn set_telemetry_enabled(&mut self, enabled: bool) {
        if self.status != ConnectionStatus::Connected || !self.telemetry_available {
            self.telemetry_enabled = false;
            if enabled {
                self.report_error("Telemetry is not available");
            }
            return;
        }

        match self.link.set_telemetry_notify(enabled) {
            Ok(()) => {
                self.telemetry_enabled = enabled;
                let state = if enabled { "enabled" } else { "disabled" };
                info!("Telemetry {}", state);
                self.send_log(&format!("Telemetry {}", state), MessageSeverity::Info);
            }
            Err(e) => {
                self.telemetry_enabled = false;
                self.report_error(&format!("Failed to enable notifications: {}", e));
            }
        }
    }

    fn on_telemetry(&mut self, value: &[u8]) {
        if let Some(entry) = self.telemetry.on_notification(value) {
            if entry.is_critical_memory() || entry.is_overheating() {
                warn!(
                    "Scoreboard health: {} free heap, {}",
                    entry.free_heap_kb(),
                    entry.temperature_string()
                );
            }
            let _ = self.event_sender.send(AppEvent::Telemetry(entry.clone()));
        }
    }

    /// Existing entries survive disabling telemetry; only this empties the log
    pub fn clear_telemetry_log(&mut self) {
        self.telemetry.clear();
    }

    pub fn clear_action_log(&mut self) {
        self.actions.clear();
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn is_target(&self, id: &DeviceId) -> bool {
        self.target.as_ref().is_some_and(|t| &t.id == id)
    }

    fn is_current(&self, id: &DeviceId, attempt: ConnectAttempt) -> bool {
        self.is_target(id) && attempt == self.connect_attempt
    }

    fn is_establishing(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
        )
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        debug!("Connection status: {:?} -> {:?}", self.status, status);
        self.status = status;
        self.state.connection_status = status;
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    fn action_device_id(&self) -> String {
        self.connected_device
            .as_ref()
            .map(|d| d.hardware_id.clone())
            .or_else(|| self.state.connected_device_id.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn record_action(&mut self, kind: ActionKind, description: impl Into<String>) {
        let device_id = self.action_device_id();
        self.actions.record(&device_id, kind, description);
    }

    fn record_score_action(&mut self, side: Side, description: String) {
        let kind = match side {
            Side::Blue => ActionKind::BlueScoreChange,
            Side::Red => ActionKind::RedScoreChange,
        };
        self.record_action(kind, description);
    }

    /// Overwrite the latest-error slot and tell the consumer
    fn report_error(&mut self, message: &str) {
        warn!("{}", message);
        self.last_error = Some(message.to_string());
        self.send_log(message, MessageSeverity::Error);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

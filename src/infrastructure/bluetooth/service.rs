//! Bluetooth Service Module
//!
//! Runs the [`ConnectionController`] on a single tokio task. Consumer
//! requests, link events and timer deadlines are all handled on that task,
//! so the controller never needs a lock.

use crate::domain::models::{AppEvent, ControllerCommand, ControllerSnapshot, DeviceId, Side};
use crate::infrastructure::bluetooth::connection::{ConnectionController, ControllerConfig, WriteId};
use crate::infrastructure::bluetooth::link::{Link, LinkEvent};
use crate::infrastructure::bluetooth::protocol::CommandPacket;
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

enum Request {
    Command(ControllerCommand),
    SendPacket(CommandPacket, oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    Shutdown,
}

/// Entry point that wires a [`Link`] to a controller task
pub struct BluetoothService;

impl BluetoothService {
    /// Start the controller task.
    ///
    /// `link_events` must be the receiving half of the channel the link
    /// reports on. Returns the consumer handle, the event stream and the
    /// task handle.
    pub fn spawn<L>(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: ControllerConfig,
    ) -> (
        ControllerHandle,
        mpsc::UnboundedReceiver<AppEvent>,
        JoinHandle<()>,
    )
    where
        L: Link + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let controller = ConnectionController::new(link, config, event_tx);
        let task = tokio::spawn(run(controller, request_rx, link_events));

        (ControllerHandle { requests: request_tx }, event_rx, task)
    }
}

/// The controller clock. Tokio's clock so paused-time tests drive deadlines.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn run<L: Link>(
    mut controller: ConnectionController<L>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    info!("Bluetooth service started");

    let mut waiters: HashMap<WriteId, oneshot::Sender<bool>> = HashMap::new();
    let mut link_open = true;

    loop {
        let deadline = controller.next_deadline().map(Instant::from_std);
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            request = requests.recv() => match request {
                Some(Request::Command(command)) => {
                    debug!("Command: {:?}", command);
                    controller.apply(command, now());
                }
                Some(Request::SendPacket(packet, reply)) => {
                    match controller.send_packet(packet, now()) {
                        Some(id) => {
                            waiters.insert(id, reply);
                        }
                        None => {
                            let _ = reply.send(false);
                        }
                    }
                }
                Some(Request::Snapshot(reply)) => {
                    let _ = reply.send(controller.snapshot());
                }
                Some(Request::Shutdown) | None => break,
            },
            event = link_events.recv(), if link_open => match event {
                Some(event) => controller.handle_link_event(event, now()),
                None => {
                    warn!("Link event stream closed");
                    link_open = false;
                }
            },
            _ = timer => {}
        }

        for outcome in controller.poll_timers(now()) {
            if let Some(reply) = waiters.remove(&outcome.write_id) {
                let _ = reply.send(outcome.success);
            }
        }
    }

    controller.disconnect();
    info!("Bluetooth service stopped");
}

/// Cloneable consumer surface of the controller task
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl ControllerHandle {
    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| anyhow::anyhow!("Bluetooth service has stopped"))
    }

    pub fn command(&self, command: ControllerCommand) -> Result<()> {
        self.request(Request::Command(command))
    }

    pub fn start_scan(&self) -> Result<()> {
        self.command(ControllerCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.command(ControllerCommand::StopScan)
    }

    pub fn connect(&self, device: DeviceId) -> Result<()> {
        self.command(ControllerCommand::Connect(device))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(ControllerCommand::Disconnect)
    }

    pub fn increment_score(&self, side: Side, amount: u8) -> Result<()> {
        self.command(ControllerCommand::IncrementScore(side, amount))
    }

    pub fn decrement_score(&self, side: Side) -> Result<()> {
        self.command(ControllerCommand::DecrementScore(side))
    }

    pub fn set_score(&self, side: Side, value: u8) -> Result<()> {
        self.command(ControllerCommand::SetScore(side, value))
    }

    pub fn start_timer(&self, minutes: u8, seconds: u8) -> Result<()> {
        self.command(ControllerCommand::StartTimer { minutes, seconds })
    }

    pub fn stop_timer(&self) -> Result<()> {
        self.command(ControllerCommand::StopTimer)
    }

    pub fn reset_scores(&self) -> Result<()> {
        self.command(ControllerCommand::ResetScores)
    }

    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.command(ControllerCommand::SetTelemetryEnabled(enabled))
    }

    pub fn clear_telemetry_log(&self) -> Result<()> {
        self.command(ControllerCommand::ClearTelemetryLog)
    }

    pub fn clear_action_log(&self) -> Result<()> {
        self.command(ControllerCommand::ClearActionLog)
    }

    pub fn set_slow_update_rate(&self, slow: bool) -> Result<()> {
        self.command(ControllerCommand::SetSlowUpdateRate(slow))
    }

    /// Send a raw packet and wait for the retry policy's verdict
    pub async fn send_packet(&self, packet: CommandPacket) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::SendPacket(packet, tx))?;
        Ok(rx.await.unwrap_or(false))
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Snapshot(tx))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Bluetooth service has stopped"))
    }

    /// Disconnect and stop the task
    pub fn shutdown(&self) -> Result<()> {
        self.request(Request::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionStatus;
    use crate::infrastructure::bluetooth::link::mock::{LinkCall, MockLink};
    use crate::infrastructure::bluetooth::link::TransportState;
    use crate::infrastructure::bluetooth::protocol::{self, CommandFlags};
    use std::time::Duration;

    struct Harness {
        handle: ControllerHandle,
        events: mpsc::UnboundedReceiver<AppEvent>,
        link: MockLink,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
        task: JoinHandle<()>,
    }

    fn device_id() -> DeviceId {
        DeviceId::new("AA:BB:CC:DD:EE:01")
    }

    /// Let the service task drain everything queued so far
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn harness() -> Harness {
        let link = MockLink::default();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (handle, events, task) =
            BluetoothService::spawn(link.clone(), link_rx, ControllerConfig::default());
        link_tx
            .send(LinkEvent::TransportStateChanged(TransportState::PoweredOn))
            .unwrap();
        settle().await;
        Harness {
            handle,
            events,
            link,
            link_tx,
            task,
        }
    }

    async fn connect(h: &Harness) {
        h.handle.start_scan().unwrap();
        settle().await;
        h.link_tx
            .send(LinkEvent::Discovered {
                id: device_id(),
                name: Some("Scoreboard C3D4".into()),
                rssi: -55,
            })
            .unwrap();
        settle().await;
        h.handle.connect(device_id()).unwrap();
        settle().await;
        let attempt = h.link.last_attempt();
        h.link_tx
            .send(LinkEvent::Connected {
                id: device_id(),
                attempt,
            })
            .unwrap();
        h.link_tx
            .send(LinkEvent::CharacteristicsReady {
                id: device_id(),
                attempt,
                command: true,
                telemetry: true,
            })
            .unwrap();
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_packet_resolves_true_while_connected() {
        let h = harness().await;
        connect(&h).await;
        assert_eq!(
            h.handle.snapshot().await.unwrap().status,
            ConnectionStatus::Connected
        );

        let packet = protocol::encode_command(10, 20, 0, 0, CommandFlags::empty());
        assert!(h.handle.send_packet(packet).await.unwrap());
        assert!(h.link.writes().contains(&vec![10, 20, 0, 0, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_packet_resolves_false_when_disconnected() {
        let h = harness().await;
        let packet = protocol::encode_command(1, 2, 0, 0, CommandFlags::empty());
        assert!(!h.handle.send_packet(packet).await.unwrap());
        assert!(h.link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_packet_fails_after_link_drop() {
        let h = harness().await;
        connect(&h).await;

        let handle = h.handle.clone();
        let packet = protocol::encode_command(5, 5, 0, 0, CommandFlags::empty());
        let pending = tokio::spawn(async move { handle.send_packet(packet).await });
        settle().await;

        h.link_tx
            .send(LinkEvent::Disconnected {
                id: device_id(),
                cause: Some("out of range".into()),
            })
            .unwrap();

        assert!(!pending.await.unwrap().unwrap());
        assert_eq!(
            h.handle.snapshot().await.unwrap().status,
            ConnectionStatus::Reconnecting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_fires_on_its_own() {
        let h = harness().await;
        h.handle.start_scan().unwrap();
        settle().await;
        assert_eq!(
            h.handle.snapshot().await.unwrap().status,
            ConnectionStatus::Scanning
        );

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(
            h.handle.snapshot().await.unwrap().status,
            ConnectionStatus::Disconnected
        );
        assert_eq!(h.link.calls().last(), Some(&LinkCall::StopScan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_score_commands_reach_link_and_events() {
        let mut h = harness().await;
        connect(&h).await;
        while h.events.try_recv().is_ok() {}
        h.link.clear();

        h.handle.increment_score(Side::Red, 3).unwrap();
        h.handle.decrement_score(Side::Red).unwrap();
        settle().await;

        assert_eq!(
            h.link.writes(),
            vec![vec![0, 3, 0, 0, 0], vec![0, 2, 0, 0, 0x02]]
        );
        let mut states = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let AppEvent::StateChanged(state) = event {
                states.push(state.red_score);
            }
        }
        assert_eq!(states, vec![3, 2]);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state.red_score, 2);
        assert_eq!(
            snapshot.connected_device.map(|d| d.hardware_id),
            Some("C3D4".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_stops() {
        let h = harness().await;
        connect(&h).await;

        h.handle.shutdown().unwrap();
        h.task.await.unwrap();

        assert_eq!(h.link.calls().last(), Some(&LinkCall::Disconnect(device_id())));
        assert!(h.handle.start_scan().is_err());
    }
}

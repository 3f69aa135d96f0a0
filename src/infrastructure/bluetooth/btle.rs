//! btleplug Link
//!
//! [`Link`] implementation on top of btleplug (CoreBluetooth, BlueZ or
//! WinRT depending on the platform). Every request is spawned onto the
//! tokio runtime and reports back through the link event channel.

use crate::domain::models::DeviceId;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::link::{
    CharacteristicKind, ConnectAttempt, Link, LinkError, LinkEvent, TransportState,
};
use crate::infrastructure::bluetooth::protocol::{self, CommandPacket};
use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Linux reports the link before BlueZ has populated its GATT cache
#[cfg(target_os = "linux")]
const GATT_SETTLE_DELAY: Duration = Duration::from_millis(600);

/// Peripheral we are connected (or connecting) to
#[derive(Clone)]
struct Session {
    id: DeviceId,
    peripheral: Peripheral,
    command: Option<Characteristic>,
    telemetry: Option<Characteristic>,
}

#[derive(Default)]
struct Shared {
    scan_filter: Option<Uuid>,
    peripherals: HashMap<DeviceId, Peripheral>,
    /// Device of the live connect attempt, cleared by `disconnect`
    connecting: Option<DeviceId>,
    session: Option<Session>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BtleLink {
    adapter: Adapter,
    events: mpsc::UnboundedSender<LinkEvent>,
    shared: Arc<Mutex<Shared>>,
    /// Tag of the live connect attempt, 0 after a disconnect
    current_attempt: Arc<AtomicU64>,
    command_uuid: Uuid,
    telemetry_uuid: Uuid,
    connect_timeout: Duration,
}

impl BtleLink {
    /// Open the first Bluetooth adapter and start watching it
    pub async fn new(settings: &Settings, events: mpsc::UnboundedSender<LinkEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Could not read adapter info: {}", e),
        }

        let shared = Arc::new(Mutex::new(Shared::default()));

        // Subscribe before reporting the initial state so no update is lost
        let stream = adapter.events().await?;
        tokio::spawn(watch_adapter(
            adapter.clone(),
            stream,
            events.clone(),
            shared.clone(),
        ));

        let initial = match adapter.adapter_state().await {
            Ok(state) => transport_state(state),
            Err(e) => {
                // Not every backend can report power state; an adapter that exists is usable
                debug!("adapter_state() unsupported ({}), assuming powered on", e);
                TransportState::PoweredOn
            }
        };
        let _ = events.send(LinkEvent::TransportStateChanged(initial));

        Ok(Self {
            adapter,
            events,
            shared,
            current_attempt: Arc::new(AtomicU64::new(0)),
            command_uuid: protocol::parse_uuid(&settings.ble_command_char_uuid)?,
            telemetry_uuid: protocol::parse_uuid(&settings.ble_telemetry_char_uuid)?,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        })
    }

    fn session(&self) -> Result<Session, LinkError> {
        lock(&self.shared).session.clone().ok_or(LinkError::NotConnected)
    }
}

fn transport_state(state: CentralState) -> TransportState {
    match state {
        CentralState::PoweredOn => TransportState::PoweredOn,
        CentralState::PoweredOff => TransportState::PoweredOff,
        _ => TransportState::Unknown,
    }
}

impl Link for BtleLink {
    fn start_scan(&mut self, service_filter: Uuid) -> Result<(), LinkError> {
        {
            let mut shared = lock(&self.shared);
            shared.scan_filter = Some(service_filter);
            shared.peripherals.clear();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let filter = ScanFilter {
                services: vec![service_filter],
            };
            if let Err(e) = adapter.start_scan(filter).await {
                warn!("start_scan failed: {}", e);
                let _ = events.send(LinkEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        lock(&self.shared).scan_filter = None;

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan failed: {}", e);
            }
        });
    }

    fn connect(&mut self, device: &DeviceId, attempt: ConnectAttempt) -> Result<(), LinkError> {
        let peripheral = {
            let mut shared = lock(&self.shared);
            let peripheral = shared
                .peripherals
                .get(device)
                .cloned()
                .ok_or_else(|| LinkError::UnknownDevice(device.clone()))?;
            shared.connecting = Some(device.clone());
            peripheral
        };

        self.current_attempt.store(attempt, Ordering::SeqCst);
        let task = ConnectTask {
            id: device.clone(),
            peripheral,
            events: self.events.clone(),
            shared: self.shared.clone(),
            current_attempt: self.current_attempt.clone(),
            attempt,
            command_uuid: self.command_uuid,
            telemetry_uuid: self.telemetry_uuid,
            // The controller owns the connect deadline; this only reaps hung attempts
            timeout: self.connect_timeout * 2,
        };
        tokio::spawn(task.run());
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) {
        self.current_attempt.store(0, Ordering::SeqCst);

        let peripheral = {
            let mut shared = lock(&self.shared);
            shared.connecting = None;
            match shared.session.take() {
                Some(session) if &session.id == device => Some(session.peripheral),
                other => {
                    shared.session = other;
                    shared.peripherals.get(device).cloned()
                }
            }
        };

        if let Some(peripheral) = peripheral {
            let id = device.clone();
            tokio::spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("disconnect from {} failed: {}", id, e);
                }
            });
        }
    }

    fn write_command(&mut self, packet: CommandPacket) -> Result<(), LinkError> {
        let session = self.session()?;
        let characteristic = session
            .command
            .ok_or_else(|| LinkError::CharacteristicNotFound("command".into()))?;
        let peripheral = session.peripheral;

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peripheral
                .write(&characteristic, packet.as_bytes(), WriteType::WithResponse)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(LinkEvent::WriteResult { result });
        });
        Ok(())
    }

    fn set_telemetry_notify(&mut self, enabled: bool) -> Result<(), LinkError> {
        let session = self.session()?;
        let characteristic = session
            .telemetry
            .ok_or_else(|| LinkError::CharacteristicNotFound("telemetry".into()))?;
        let peripheral = session.peripheral;

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            let _ = events.send(LinkEvent::NotifyStateChanged {
                characteristic: CharacteristicKind::Telemetry,
                result: result.map(|_| enabled).map_err(|e| e.to_string()),
            });
        });
        Ok(())
    }
}

struct ConnectTask {
    id: DeviceId,
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<LinkEvent>,
    shared: Arc<Mutex<Shared>>,
    current_attempt: Arc<AtomicU64>,
    attempt: ConnectAttempt,
    command_uuid: Uuid,
    telemetry_uuid: Uuid,
    timeout: Duration,
}

impl ConnectTask {
    /// A newer connect or a disconnect has replaced this attempt
    fn is_stale(&self) -> bool {
        self.current_attempt.load(Ordering::SeqCst) != self.attempt
    }

    /// Send a session event unless the attempt has been superseded
    fn report(&self, event: LinkEvent) {
        if self.is_stale() {
            debug!("Dropping {:?} from superseded connect #{}", event, self.attempt);
            return;
        }
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: String) {
        if self.is_stale() {
            debug!("Superseded connect #{} to {} ended: {}", self.attempt, self.id, reason);
            return;
        }
        warn!("Connect to {} failed: {}", self.id, reason);
        self.report(LinkEvent::ConnectFailed {
            id: self.id.clone(),
            attempt: self.attempt,
            reason,
        });
    }

    async fn run(self) {
        debug!("Connecting to {} (#{})", self.id, self.attempt);
        match tokio::time::timeout(self.timeout, self.peripheral.connect()).await {
            Err(_) => return self.fail(format!("timed out after {:?}", self.timeout)),
            Ok(Err(e)) => return self.fail(e.to_string()),
            Ok(Ok(())) => {}
        }

        if self.is_stale() {
            // A newer attempt on the same device shares this connection
            let reused = lock(&self.shared).connecting.as_ref() == Some(&self.id);
            debug!("Connect #{} to {} was superseded", self.attempt, self.id);
            if !reused {
                let _ = self.peripheral.disconnect().await;
            }
            return;
        }

        lock(&self.shared).session = Some(Session {
            id: self.id.clone(),
            peripheral: self.peripheral.clone(),
            command: None,
            telemetry: None,
        });
        self.report(LinkEvent::Connected {
            id: self.id.clone(),
            attempt: self.attempt,
        });

        #[cfg(target_os = "linux")]
        tokio::time::sleep(GATT_SETTLE_DELAY).await;

        let discovery = tokio::time::timeout(self.timeout, self.peripheral.discover_services()).await;
        let reason = match discovery {
            Err(_) => Some("service discovery timed out".to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Ok(Ok(())) => None,
        };
        if let Some(reason) = reason {
            self.report(LinkEvent::CharacteristicDiscoveryFailed {
                id: self.id.clone(),
                attempt: self.attempt,
                reason,
            });
            return;
        }

        let characteristics = self.peripheral.characteristics();
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let command = find(self.command_uuid);
        let telemetry = find(self.telemetry_uuid);
        debug!(
            "{}: command characteristic {}, telemetry characteristic {}",
            self.id,
            if command.is_some() { "found" } else { "missing" },
            if telemetry.is_some() { "found" } else { "missing" },
        );

        {
            let mut shared = lock(&self.shared);
            match shared.session.as_mut() {
                Some(session) if session.id == self.id => {
                    session.command = command.clone();
                    session.telemetry = telemetry.clone();
                }
                // dropped or cancelled during discovery
                _ => return,
            }
        }

        self.forward_notifications();

        self.report(LinkEvent::CharacteristicsReady {
            id: self.id.clone(),
            attempt: self.attempt,
            command: command.is_some(),
            telemetry: telemetry.is_some(),
        });
    }

    fn forward_notifications(&self) {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let id = self.id.clone();
        let (command_uuid, telemetry_uuid) = (self.command_uuid, self.telemetry_uuid);

        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: could not get notification stream: {}", id, e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let characteristic = if notification.uuid == telemetry_uuid {
                    CharacteristicKind::Telemetry
                } else if notification.uuid == command_uuid {
                    CharacteristicKind::Command
                } else {
                    trace!("Notification from unexpected {}", notification.uuid);
                    continue;
                };
                let _ = events.send(LinkEvent::ValueUpdated {
                    characteristic,
                    value: notification.value,
                });
            }
            debug!("{}: notification stream ended", id);
        });
    }
}

async fn watch_adapter(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shared: Arc<Mutex<Shared>>,
) {
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let filter = lock(&shared).scan_filter;
                if let Some(service) = filter {
                    if let Err(e) = report_peripheral(&adapter, &id, service, &events, &shared).await {
                        trace!("Skipping {:?}: {}", id, e);
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let dropped = {
                    let mut shared = lock(&shared);
                    match shared.session.take() {
                        Some(session) if session.peripheral.id() == id => Some(session.id),
                        other => {
                            shared.session = other;
                            None
                        }
                    }
                };
                // requested disconnects already cleared the session
                if let Some(device) = dropped {
                    info!("Device {} disconnected unexpectedly", device);
                    let _ = events.send(LinkEvent::Disconnected {
                        id: device,
                        cause: Some("Connection lost".into()),
                    });
                }
            }
            CentralEvent::StateUpdate(state) => {
                let _ = events.send(LinkEvent::TransportStateChanged(transport_state(state)));
            }
            _ => {}
        }
    }
    warn!("Adapter event stream ended");
}

async fn report_peripheral(
    adapter: &Adapter,
    id: &PeripheralId,
    service: Uuid,
    events: &mpsc::UnboundedSender<LinkEvent>,
    shared: &Mutex<Shared>,
) -> Result<()> {
    let peripheral = adapter.peripheral(id).await?;
    let properties = peripheral
        .properties()
        .await?
        .ok_or_else(|| anyhow!("no properties"))?;

    // Not every backend applies the scan filter
    if !properties.services.contains(&service) {
        return Ok(());
    }

    let device = DeviceId::new(peripheral.id().to_string());
    lock(shared).peripherals.insert(device.clone(), peripheral);

    let _ = events.send(LinkEvent::Discovered {
        id: device,
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or(-100),
    });
    Ok(())
}

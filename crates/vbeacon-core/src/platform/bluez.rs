//! BlueZ backend over D-Bus.
//!
//! `bluer` is async, while the advertiser and scanner are driven from plain
//! threads. Each side therefore runs its own background thread hosting a
//! current-thread tokio runtime, and talks to the caller through std
//! channels plus a oneshot stop signal.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bluer::adv::{Advertisement, Type as AdType};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::advertiser::AdvertiserError;
use crate::codec::AdvertisementFrame;
use crate::platform::{
    AdvertisementRecord, AdvertisingService, AdvertisingType, Registration, ScanSource,
};
use crate::scanner::ScanError;

/// Time left for BlueZ to process the unregister call before the runtime
/// shuts down.
const UNREGISTER_GRACE: Duration = Duration::from_millis(100);

/// Capacity of the channel between the discovery thread and `poll_events`.
const RECORD_BUFFER: usize = 1024;

async fn open_adapter(name: Option<&str>) -> bluer::Result<Adapter> {
    let session = Session::new().await?;
    let adapter = match name {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    adapter.set_powered(true).await?;
    debug!(adapter = %adapter.name(), "Bluetooth adapter powered on");
    Ok(adapter)
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

// ============================================================================
// Advertising
// ============================================================================

/// Advertising service backed by BlueZ's `LEAdvertisingManager1`.
#[derive(Debug, Clone, Default)]
pub struct BluezAdvertising {
    adapter_name: Option<String>,
}

impl BluezAdvertising {
    /// Use the named adapter (e.g. `hci0`) instead of the default one.
    #[must_use]
    pub fn new(adapter_name: Option<String>) -> Self {
        Self { adapter_name }
    }
}

impl AdvertisingService for BluezAdvertising {
    fn register(
        &mut self,
        frame: &AdvertisementFrame,
        kind: AdvertisingType,
    ) -> Result<Box<dyn Registration>, AdvertiserError> {
        let advertisement = Advertisement {
            advertisement_type: match kind {
                AdvertisingType::Broadcast => AdType::Broadcast,
                AdvertisingType::Peripheral => AdType::Peripheral,
            },
            manufacturer_data: BTreeMap::from([(
                frame.company_id(),
                frame.manufacturer_data().to_vec(),
            )]),
            ..Default::default()
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let adapter_name = self.adapter_name.clone();

        let handle = thread::Builder::new()
            .name("vbeacon-advertise".to_string())
            .spawn(move || match runtime() {
                Ok(rt) => rt.block_on(advertise(adapter_name, advertisement, ready_tx, stop_rx)),
                Err(e) => {
                    let _ = ready_tx.send(Err(AdvertiserError::Internal {
                        message: format!("Failed to build runtime: {e}"),
                    }));
                }
            })
            .map_err(|e| AdvertiserError::Internal {
                message: format!("Failed to spawn advertising thread: {e}"),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(BluezRegistration {
                stop: stop_tx,
                handle,
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AdvertiserError::Internal {
                    message: "Advertising thread exited before registering".to_string(),
                })
            }
        }
    }
}

async fn advertise(
    adapter_name: Option<String>,
    advertisement: Advertisement,
    ready: SyncSender<Result<(), AdvertiserError>>,
    stop: oneshot::Receiver<()>,
) {
    let adapter = match open_adapter(adapter_name.as_deref()).await {
        Ok(adapter) => adapter,
        Err(e) => {
            let error = if e.kind == bluer::ErrorKind::NotFound {
                AdvertiserError::AdapterNotFound
            } else {
                AdvertiserError::Internal {
                    message: e.to_string(),
                }
            };
            let _ = ready.send(Err(error));
            return;
        }
    };

    let handle = match adapter.advertise(advertisement).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = ready.send(Err(AdvertiserError::RegistrationRejected {
                message: e.to_string(),
            }));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }
    info!(adapter = %adapter.name(), "Advertisement registered with BlueZ");

    // A dropped sender also means stop.
    let _ = stop.await;
    drop(handle);
    tokio::time::sleep(UNREGISTER_GRACE).await;
    debug!("Advertisement withdrawn from BlueZ");
}

struct BluezRegistration {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Registration for BluezRegistration {
    fn unregister(self: Box<Self>) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Advertising thread panicked during shutdown");
        }
    }
}

// ============================================================================
// Scanning
// ============================================================================

/// Scan source backed by BlueZ discovery with duplicate reporting.
#[derive(Debug, Default)]
pub struct BluezScanSource {
    adapter_name: Option<String>,
    worker: Option<DiscoveryWorker>,
}

#[derive(Debug)]
struct DiscoveryWorker {
    stop: oneshot::Sender<()>,
    records: Receiver<AdvertisementRecord>,
    handle: JoinHandle<()>,
}

impl BluezScanSource {
    /// Use the named adapter (e.g. `hci0`) instead of the default one.
    #[must_use]
    pub fn new(adapter_name: Option<String>) -> Self {
        Self {
            adapter_name,
            worker: None,
        }
    }
}

impl ScanSource for BluezScanSource {
    fn enable_scan(&mut self) -> Result<(), ScanError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (records_tx, records_rx) = mpsc::sync_channel(RECORD_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let adapter_name = self.adapter_name.clone();

        let handle = thread::Builder::new()
            .name("vbeacon-discovery".to_string())
            .spawn(move || match runtime() {
                Ok(rt) => rt.block_on(discover(adapter_name, ready_tx, records_tx, stop_rx)),
                Err(e) => {
                    let _ = ready_tx.send(Err(ScanError::AdapterOpen {
                        message: format!("Failed to build runtime: {e}"),
                    }));
                }
            })
            .map_err(|e| ScanError::Internal {
                message: format!("Failed to spawn discovery thread: {e}"),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(DiscoveryWorker {
                    stop: stop_tx,
                    records: records_rx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(ScanError::AdapterOpen {
                    message: "Discovery thread exited before scanning started".to_string(),
                })
            }
        }
    }

    fn poll_events(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<AdvertisementRecord>, ScanError> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(ScanError::PollFailed {
                message: "scanning is not enabled".to_string(),
            });
        };

        let first = match worker.records.recv_timeout(timeout) {
            Ok(record) => record,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ScanError::PollFailed {
                    message: "discovery stream ended".to_string(),
                })
            }
        };

        let mut batch = vec![first];
        while batch.len() < max_count {
            match worker.records.try_recv() {
                Ok(record) => batch.push(record),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(batch)
    }

    fn disable_scan(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                warn!("Discovery thread panicked during shutdown");
            }
        }
    }
}

impl Drop for BluezScanSource {
    fn drop(&mut self) {
        self.disable_scan();
    }
}

async fn discover(
    adapter_name: Option<String>,
    ready: SyncSender<Result<(), ScanError>>,
    records: SyncSender<AdvertisementRecord>,
    mut stop: oneshot::Receiver<()>,
) {
    let started = async {
        let adapter = open_adapter(adapter_name.as_deref()).await?;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await?;
        let events = adapter.discover_devices_with_changes().await?;
        Ok::<_, bluer::Error>((adapter, events))
    }
    .await;

    let (adapter, events) = match started {
        Ok(started) => started,
        Err(e) => {
            let _ = ready.send(Err(ScanError::AdapterOpen {
                message: e.to_string(),
            }));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }
    info!(adapter = %adapter.name(), "LE discovery started");

    pin_mut!(events);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    match read_record(&adapter, address).await {
                        Ok(Some(record)) => {
                            if records.try_send(record).is_err() {
                                trace!(%address, "Record buffer full; dropping advertisement");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => trace!(%address, error = %e, "Failed to read device properties"),
                    }
                }
                Some(_) => {}
                None => {
                    warn!("Discovery stream ended");
                    break;
                }
            }
        }
    }
    debug!("LE discovery stopped");
}

async fn read_record(
    adapter: &Adapter,
    address: Address,
) -> bluer::Result<Option<AdvertisementRecord>> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();

    Ok(Some(AdvertisementRecord {
        address: Some(address.to_string()),
        manufacturer_data,
        rssi,
    }))
}

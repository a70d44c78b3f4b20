use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::PeripheralId;
use futures::{Stream, StreamExt as _, future};
use log::{debug, trace};
use mac_address::MacAddress;
use tokio::process::Command;

use crate::error::SampleError;

/// Reads the signal strength of one device.
///
/// Implementations issue a single query and report failure as an error; the
/// caller turns errors and its own timeout into an absent sample.
#[async_trait]
pub trait Sampler: Send + Sync {
    fn name(&self) -> &str;

    async fn read_rssi(&self, address: MacAddress) -> Result<i16, SampleError>;
}

/// Listens for BLE advertisements from the tracked address.
pub struct BleSampler {
    adapter: btleplug::platform::Adapter,
    scan_window: Duration,
}

impl BleSampler {
    pub fn new(adapter: btleplug::platform::Adapter, scan_window: Duration) -> Self {
        BleSampler {
            adapter,
            scan_window,
        }
    }

    async fn sighting(&self, id: PeripheralId) -> Result<Sighting, btleplug::Error> {
        let peripheral = self.adapter.peripheral(&id).await?;
        let address = peripheral.address();
        let rssi = peripheral.properties().await?.and_then(|p| p.rssi);
        Ok(Sighting { address, rssi })
    }
}

/// One advertiser as looked up after an adapter event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Sighting {
    address: BDAddr,
    rssi: Option<i16>,
}

fn advertised_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// First RSSI advertised by `target`, or `None` once `ids` ends.
///
/// Lookups that fail are skipped: advertisers come and go between the event
/// and the lookup, and none of that says anything about the target.
async fn first_target_rssi<I, S, F, Fut>(target: BDAddr, mut ids: S, mut lookup: F) -> Option<i16>
where
    S: Stream<Item = I> + Unpin,
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<Sighting, btleplug::Error>>,
{
    while let Some(id) = ids.next().await {
        let sighting = match lookup(id).await {
            Ok(sighting) => sighting,
            Err(err) => {
                trace!("Skipping advertiser: {}", err);
                continue;
            }
        };
        if sighting.address != target {
            continue;
        }

        trace!("Advertisement from {}: rssi {:?}", target, sighting.rssi);
        if let Some(rssi) = sighting.rssi {
            return Some(rssi);
        }
    }
    None
}

#[async_trait]
impl Sampler for BleSampler {
    fn name(&self) -> &str {
        "ble"
    }

    async fn read_rssi(&self, address: MacAddress) -> Result<i16, SampleError> {
        let target = BDAddr::from(address.bytes());

        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let ids = events.filter_map(|event| future::ready(advertised_id(event)));
        let found = tokio::time::timeout(
            self.scan_window,
            first_target_rssi(target, ids, |id| self.sighting(id)),
        )
        .await;

        if let Err(err) = self.adapter.stop_scan().await {
            debug!("Error stopping BLE scan: {:?}", err);
        }

        match found {
            Ok(Some(rssi)) => Ok(rssi),
            Ok(None) => Err(SampleError::Query("adapter event stream closed".to_string())),
            Err(_) => Err(SampleError::Unreachable(address.to_string())),
        }
    }
}

/// Asks `hcitool` for the RSSI of a connected classic Bluetooth device.
pub struct HcitoolSampler {
    program: String,
}

impl HcitoolSampler {
    pub fn new() -> Self {
        HcitoolSampler {
            program: "hcitool".to_string(),
        }
    }
}

impl Default for HcitoolSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sampler for HcitoolSampler {
    fn name(&self) -> &str {
        "hcitool"
    }

    async fn read_rssi(&self, address: MacAddress) -> Result<i16, SampleError> {
        let output = Command::new(&self.program)
            .arg("rssi")
            .arg(address.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| SampleError::Query(format!("{}: {}", self.program, err)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("{} exited with {}: {}", self.program, output.status, stderr.trim());
            return Err(SampleError::Unreachable(address.to_string()));
        }

        parse_hcitool_rssi(&stdout).ok_or_else(|| {
            SampleError::Query(format!("unexpected {} output: {}", self.program, stdout.trim()))
        })
    }
}

fn parse_hcitool_rssi(output: &str) -> Option<i16> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("RSSI return value:")
            .and_then(|value| value.trim().parse().ok())
    })
}

use serde_derive::Serialize;

use crate::classifier::ProximityBand;
use crate::config::TrackedDevice;
use crate::state::{MonitorState, Phase};

/// Published whenever the tracked device changes phase.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresenceAnnouncement {
    pub name: String,
    #[serde(rename = "id")]
    pub mac_address: String,
    pub confidence: u8,
    pub state: Phase,
    pub band: ProximityBand,
    pub rssi: Option<i16>,
    pub retained: bool,
}

impl PresenceAnnouncement {
    pub fn new(device: &TrackedDevice, state: &MonitorState, rssi: Option<i16>) -> Self {
        PresenceAnnouncement {
            name: device.display_name(),
            mac_address: device.address.to_string(),
            confidence: state.phase.confidence(),
            state: state.phase,
            band: state.band,
            rssi,
            retained: false,
        }
    }
}

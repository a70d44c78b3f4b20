use std::fmt;

use serde_derive::Serialize;

/// One RSSI reading, or the lack of one. Failed and timed out reads are both
/// `Absent`; the reason has already been logged by the time this exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalSample {
    Present(i16),
    Absent,
}

impl SignalSample {
    pub fn rssi(&self) -> Option<i16> {
        match self {
            SignalSample::Present(rssi) => Some(*rssi),
            SignalSample::Absent => None,
        }
    }
}

/// Ordered from closest to furthest, with `Unknown` last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityBand {
    Near,
    Far,
    VeryFar,
    Unknown,
}

impl ProximityBand {
    /// Near and Far both count as "the device is still around".
    pub fn is_present(&self) -> bool {
        matches!(self, ProximityBand::Near | ProximityBand::Far)
    }
}

impl fmt::Display for ProximityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProximityBand::Near => "near",
            ProximityBand::Far => "far",
            ProximityBand::VeryFar => "very far",
            ProximityBand::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Band boundaries in dBm.
///
/// A reading at or above `near` is Near, at or above `far` is Far, anything
/// lower is VeryFar. Leaving a band means crossing its boundary by `margin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub near: i16,
    pub far: i16,
    pub margin: i16,
}

impl Thresholds {
    fn band_for(&self, rssi: i16, near_at: i16, far_at: i16) -> ProximityBand {
        if rssi >= near_at {
            ProximityBand::Near
        } else if rssi >= far_at {
            ProximityBand::Far
        } else {
            ProximityBand::VeryFar
        }
    }

    /// Classifies `sample` given the band of the previous reading.
    ///
    /// Upward moves use `boundary + margin`, downward moves use
    /// `boundary - margin`, so a reading sitting on a boundary keeps whatever
    /// band it already had. Callers pass the last band that came from an
    /// actual reading; `Unknown` there means no reading yet.
    pub fn classify(&self, sample: SignalSample, previous: ProximityBand) -> ProximityBand {
        let rssi = match sample {
            SignalSample::Present(rssi) => rssi,
            SignalSample::Absent => return ProximityBand::Unknown,
        };

        let up = |boundary: i16| boundary.saturating_add(self.margin);
        let down = |boundary: i16| boundary.saturating_sub(self.margin);

        match previous {
            ProximityBand::Near => self.band_for(rssi, down(self.near), down(self.far)),
            ProximityBand::Far => self.band_for(rssi, up(self.near), down(self.far)),
            ProximityBand::VeryFar => self.band_for(rssi, up(self.near), up(self.far)),
            ProximityBand::Unknown => self.band_for(rssi, self.near, self.far),
        }
    }
}

//! Relay control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock board tracks state in memory and logs changes.
//!
//! Both boards force every output off when constructed, so a crash mid-run
//! never leaves a valve open once the hub is back up.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown zone {0}")]
    UnknownZone(u8),
    #[error("gpio unavailable: {0}")]
    Gpio(String),
    #[error("pin write failed for zone {zone}: {reason}")]
    Write { zone: u8, reason: String },
}

/// The scheduler's only path to the hardware.
pub trait RelayDriver: Send {
    fn activate(&mut self, zone: u8) -> Result<(), RelayError>;
    fn deactivate(&mut self, zone: u8) -> Result<(), RelayError>;
    fn is_active(&self, zone: u8) -> bool;

    /// Rain sensor input, if one is wired. `Some(true)` means rain.
    fn read_rain_pin(&mut self) -> Option<bool> {
        None
    }
}

/// Zone id and BCM pin pairs plus board polarity.
#[derive(Debug, Clone)]
pub struct BoardLayout {
    pub zones: Vec<(u8, u8)>,
    /// Many relay boards are active-low: LOW = ON.
    pub active_low: bool,
    pub rain_pin: Option<u8>,
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: BTreeMap<u8, OutputPin>, // zone_id -> GPIO pin
    active_low: bool,
    rain: Option<InputPin>,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(layout: &BoardLayout) -> Result<Self, RelayError> {
        let gpio = Gpio::new().map_err(|e| RelayError::Gpio(e.to_string()))?;
        let mut pins = BTreeMap::new();

        for &(zone, pin_num) in &layout.zones {
            let pin = gpio
                .get(pin_num)
                .map_err(|e| RelayError::Gpio(format!("gpio {pin_num}: {e}")))?;
            // Claim the pin already at its OFF level.
            let pin = if layout.active_low {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            debug!(zone, gpio = pin_num, "relay output forced off");
            pins.insert(zone, pin);
        }

        let rain = match layout.rain_pin {
            Some(pin_num) => Some(
                gpio.get(pin_num)
                    .map_err(|e| RelayError::Gpio(format!("gpio {pin_num}: {e}")))?
                    .into_input_pulldown(),
            ),
            None => None,
        };

        info!(zones = pins.len(), active_low = layout.active_low, "relay board initialised");
        Ok(Self {
            pins,
            active_low: layout.active_low,
            rain,
        })
    }

    fn write(&mut self, zone: u8, on: bool) -> Result<(), RelayError> {
        let pin = self
            .pins
            .get_mut(&zone)
            .ok_or(RelayError::UnknownZone(zone))?;
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        if self.is_active(zone) != on {
            return Err(RelayError::Write {
                zone,
                reason: "output level did not latch".to_string(),
            });
        }
        info!(zone, state = if on { "ON" } else { "OFF" }, "relay set");
        Ok(())
    }
}

#[cfg(feature = "gpio")]
impl RelayDriver for RelayBoard {
    fn activate(&mut self, zone: u8) -> Result<(), RelayError> {
        self.write(zone, true)
    }

    fn deactivate(&mut self, zone: u8) -> Result<(), RelayError> {
        self.write(zone, false)
    }

    fn is_active(&self, zone: u8) -> bool {
        match self.pins.get(&zone) {
            Some(pin) if self.active_low => pin.is_set_low(),
            Some(pin) => pin.is_set_high(),
            None => false,
        }
    }

    fn read_rain_pin(&mut self) -> Option<bool> {
        self.rain.as_ref().map(|p| p.is_high())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware, state kept in memory)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    pub(crate) zones: BTreeMap<u8, bool>, // zone_id -> on/off
    pub(crate) rain: Option<bool>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(layout: &BoardLayout) -> Result<Self, RelayError> {
        let mut zones = BTreeMap::new();
        for &(zone, pin_num) in &layout.zones {
            debug!(zone, gpio = pin_num, "[mock-gpio] registered zone (not wired)");
            zones.insert(zone, false);
        }
        info!(zones = zones.len(), "[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            zones,
            rain: layout.rain_pin.map(|_| false),
        })
    }

    fn write(&mut self, zone: u8, on: bool) -> Result<(), RelayError> {
        let state = self
            .zones
            .get_mut(&zone)
            .ok_or(RelayError::UnknownZone(zone))?;
        *state = on;
        info!(zone, state = if on { "ON" } else { "OFF" }, "[mock-gpio] relay set");
        Ok(())
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayDriver for RelayBoard {
    fn activate(&mut self, zone: u8) -> Result<(), RelayError> {
        self.write(zone, true)
    }

    fn deactivate(&mut self, zone: u8) -> Result<(), RelayError> {
        self.write(zone, false)
    }

    fn is_active(&self, zone: u8) -> bool {
        self.zones.get(&zone).copied().unwrap_or(false)
    }

    fn read_rain_pin(&mut self) -> Option<bool> {
        self.rain
    }
}

/// Turn every listed zone off, collecting failures rather than stopping at
/// the first one.
pub fn all_off<R: RelayDriver + ?Sized>(relay: &mut R, zones: &[u8]) -> Vec<(u8, RelayError)> {
    let mut failed = Vec::new();
    for &zone in zones {
        if let Err(e) = relay.deactivate(zone) {
            warn!(zone, error = %e, "relay off failed");
            failed.push((zone, e));
        }
    }
    failed
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn layout() -> BoardLayout {
        BoardLayout {
            zones: vec![(1, 17), (2, 27), (3, 22)],
            active_low: true,
            rain_pin: None,
        }
    }

    #[test]
    fn new_registers_zones_all_off() {
        let board = RelayBoard::new(&layout()).unwrap();
        assert_eq!(board.zones.len(), 3);
        assert!((1..=3).all(|z| !board.is_active(z)));
    }

    #[test]
    fn activate_then_deactivate() {
        let mut board = RelayBoard::new(&layout()).unwrap();
        board.activate(2).unwrap();
        assert!(board.is_active(2));
        assert!(!board.is_active(1));
        board.deactivate(2).unwrap();
        assert!(!board.is_active(2));
    }

    #[test]
    fn unknown_zone_is_an_error() {
        let mut board = RelayBoard::new(&layout()).unwrap();
        let err = board.activate(9).unwrap_err();
        assert!(matches!(err, RelayError::UnknownZone(9)));
        assert_eq!(board.zones.len(), 3); // no new entry created
    }

    #[test]
    fn all_off_resets_everything() {
        let mut board = RelayBoard::new(&layout()).unwrap();
        board.activate(1).unwrap();
        board.activate(3).unwrap();
        let failed = all_off(&mut board, &[1, 2, 3]);
        assert!(failed.is_empty());
        assert!((1..=3).all(|z| !board.is_active(z)));
    }

    #[test]
    fn rebuilding_board_forces_outputs_off() {
        // A restart constructs a fresh board; nothing carries over.
        let mut board = RelayBoard::new(&layout()).unwrap();
        board.activate(3).unwrap();
        drop(board);
        let board = RelayBoard::new(&layout()).unwrap();
        assert!(!board.is_active(3));
    }

    #[test]
    fn rain_pin_reported_only_when_wired() {
        let mut board = RelayBoard::new(&layout()).unwrap();
        assert_eq!(board.read_rain_pin(), None);

        let mut wired = RelayBoard::new(&BoardLayout {
            rain_pin: Some(5),
            ..layout()
        })
        .unwrap();
        assert_eq!(wired.read_rain_pin(), Some(false));
        wired.rain = Some(true);
        assert_eq!(wired.read_rain_pin(), Some(true));
    }
}

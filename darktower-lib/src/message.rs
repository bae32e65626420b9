//! Frame discriminators and the inbound frame classifier.

use crate::codec;
use crate::constants::{
    BATTERY_CELL_COUNT, BATTERY_FRAME_MIN_SIZE, BATTERY_PERCENT_STEP, BATTERY_VOLTAGE_LEVELS, STATE_FRAME_SIZE,
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt;
use strum_macros::Display;

/// Outbound command discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TowerCommand {
    /// Full state; the only command that carries a payload
    TowerState = 0x00,
    DoorReset = 0x01,
    UnjamDrums = 0x02,
    ResetCounter = 0x03,
    Calibration = 0x04,
    OverwriteDrumStates = 0x05,
}

impl TowerCommand {
    /// Maintenance commands go out as a bare discriminator byte.
    pub fn is_bare(&self) -> bool {
        *self != TowerCommand::TowerState
    }
}

/// Inbound message discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    TowerState = 0x00,
    InvalidState = 0x01,
    HardwareFailure = 0x02,
    JiggleTriggered = 0x03,
    RotationDuration = 0x04,
    UnexpectedTrigger = 0x05,
    DifferentialReadings = 0x06,
    BatteryReading = 0x07,
    CalibrationFinished = 0x08,

    #[num_enum(catch_all)]
    Unmapped(u8),
}

impl MessageKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            MessageKind::TowerState => "Tower State",
            MessageKind::InvalidState => "Invalid State",
            MessageKind::HardwareFailure => "Hardware Failure",
            MessageKind::JiggleTriggered => "Unjam Jiggle Triggered",
            MessageKind::RotationDuration => "Rotation Duration",
            MessageKind::UnexpectedTrigger => "Unexpected Trigger",
            MessageKind::DifferentialReadings => "Differential Voltage Readings",
            MessageKind::BatteryReading => "Battery Level",
            MessageKind::CalibrationFinished => "Calibration Finished",
            MessageKind::Unmapped(_) => "Unmapped",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, MessageKind::InvalidState | MessageKind::HardwareFailure)
    }

    pub fn is_unmapped(&self) -> bool {
        matches!(self, MessageKind::Unmapped(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Unmapped(value) => write!(f, "Unmapped (0x{:02x})", value),
            other => f.write_str(other.display_name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: MessageKind,
    pub display_name: &'static str,
    pub critical: bool,
}

pub fn classify(first_byte: u8) -> Classification {
    let kind = MessageKind::from_primitive(first_byte);
    Classification {
        kind,
        display_name: kind.display_name(),
        critical: kind.is_critical(),
    }
}

/// Classify a whole frame. Empty frames have nothing to classify.
pub fn classify_frame(frame: &[u8]) -> Option<Classification> {
    frame.first().map(|&b| classify(b))
}

pub fn is_battery_frame(frame: &[u8]) -> bool {
    frame.first().map(|&b| MessageKind::from_primitive(b)) == Some(MessageKind::BatteryReading)
}

/// A state report needs the discriminator plus a full payload.
pub fn is_state_frame(frame: &[u8]) -> bool {
    frame.len() >= STATE_FRAME_SIZE && frame[0] == u8::from(MessageKind::TowerState)
}

/// Pack voltage in millivolts. Byte 3 is the high byte, byte 4 the low byte.
pub fn battery_millivolts(frame: &[u8]) -> Option<u16> {
    if !is_battery_frame(frame) || frame.len() < BATTERY_FRAME_MIN_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([frame[3], frame[4]]))
}

/// Map pack millivolts to a 0-100 percentage in 5% steps.
pub fn millivolts_to_percentage(millivolts: u16) -> u8 {
    let cell_mv = millivolts / BATTERY_CELL_COUNT;
    let steps = BATTERY_VOLTAGE_LEVELS.iter().filter(|&&level| level <= cell_mv).count() as u8;
    steps * BATTERY_PERCENT_STEP
}

/// Render a frame for logs: a name line followed by detail lines.
pub fn render_human_readable(frame: &[u8]) -> Vec<String> {
    let Some(class) = classify_frame(frame) else {
        return vec!["Empty frame".to_string()];
    };

    match class.kind {
        MessageKind::BatteryReading => match battery_millivolts(frame) {
            Some(mv) => vec![
                class.kind.to_string(),
                format!("{} mV ({}%)", mv, millivolts_to_percentage(mv)),
            ],
            None => vec![class.kind.to_string(), hex::encode(frame)],
        },
        MessageKind::TowerState => {
            let mut lines = vec![class.kind.to_string(), hex::encode(frame)];
            if let Ok(state) = codec::decode_state_frame(frame) {
                lines.push(state.to_string());
            }
            lines
        }
        kind => vec![kind.to_string(), hex::encode(frame)],
    }
}

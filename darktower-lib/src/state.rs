//! Tower state model
//!
//! `TowerState` mirrors everything the tower reports in its 19-byte state
//! payload. Every field is a named value; bit arithmetic lives in
//! [`crate::codec`] only.

use crate::constants::{DRUM_COUNT, LAYER_COUNT, LIGHTS_PER_LAYER};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

/// Compass direction. Used for drum positions (2 bits on the wire) and seal sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Display)]
#[derive(FromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compass {
    #[default]
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

impl Compass {
    pub const ALL: [Compass; 4] = [Compass::North, Compass::East, Compass::South, Compass::West];
}

/// One of the three rotating drums, top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum DrumLevel {
    Top = 0,
    Middle = 1,
    Bottom = 2,
}

impl DrumLevel {
    pub const ALL: [DrumLevel; DRUM_COUNT] = [DrumLevel::Top, DrumLevel::Middle, DrumLevel::Bottom];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Ring light layer that sits on this drum.
    pub fn ring(self) -> LightLayer {
        match self {
            DrumLevel::Top => LightLayer::TopRing,
            DrumLevel::Middle => LightLayer::MiddleRing,
            DrumLevel::Bottom => LightLayer::BottomRing,
        }
    }
}

/// Light layers. Rings index their lights by cardinal direction, the ledge and
/// base layers by ordinal direction (NE, SE, SW, NW).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum LightLayer {
    TopRing = 0,
    MiddleRing = 1,
    BottomRing = 2,
    Ledge = 3,
    Base1 = 4,
    Base2 = 5,
}

impl LightLayer {
    pub const ALL: [LightLayer; LAYER_COUNT] = [
        LightLayer::TopRing,
        LightLayer::MiddleRing,
        LightLayer::BottomRing,
        LightLayer::Ledge,
        LightLayer::Base1,
        LightLayer::Base2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_ring(self) -> bool {
        self.index() < 3
    }
}

/// The 3-bit light effect code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[derive(FromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum LightEffect {
    #[default]
    Off = 0,
    On = 1,
    Breathe = 2,
    BreatheFast = 3,
    #[strum(to_string = "Breathe50Percent")]
    BreatheHalf = 4,
    Flicker = 5,
    Reserved6 = 6,
    Reserved7 = 7,
}

/// Canned animations selected through `TowerState::led_sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LightSequence {
    None = 0x00,
    Twinkle = 0x01,
    FlareThenFade = 0x02,
    FlareThenFadeBase = 0x03,
    FlareThenFlicker = 0x04,
    AngryStrobe1 = 0x05,
    AngryStrobe2 = 0x06,
    AngryStrobe3 = 0x07,
    Gloat1 = 0x08,
    Gloat2 = 0x09,
    Gloat3 = 0x0A,
    Defeat = 0x0B,
    Victory = 0x0C,
    DungeonIdle = 0x0D,
    SealReveal = 0x0E,
    RotationAllDrums = 0x0F,
    RotationDrumTop = 0x10,
    RotationDrumMiddle = 0x11,
    RotationDrumBottom = 0x12,
    MonthStarted = 0x13,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// A seal sits behind one ring light: a drum level and the side it faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seal {
    pub level: DrumLevel,
    pub side: Compass,
}

impl Seal {
    pub fn new(level: DrumLevel, side: Compass) -> Self {
        Self { level, side }
    }

    /// Ring layer and slot of the light above this seal.
    pub fn light(&self) -> (LightLayer, usize) {
        (self.level.ring(), self.side as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DrumState {
    pub jammed: bool,
    pub calibrated: bool,
    pub position: Compass,
    pub play_sound: bool,
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LightState {
    pub effect: LightEffect,
    pub looped: bool,
}

impl LightState {
    pub fn new(effect: LightEffect, looped: bool) -> Self {
        Self { effect, looped }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerState {
    pub lights: [LightState; LIGHTS_PER_LAYER],
}

/// Audio request. `sample` is 7 bits, `volume` is 0 (loudest) to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioState {
    pub sample: u8,
    pub looped: bool,
    pub volume: u8,
}

impl AudioState {
    pub const SILENT: AudioState = AudioState {
        sample: 0,
        looped: false,
        volume: 0,
    };

    pub fn sample(sample: u8) -> Self {
        Self {
            sample,
            ..Self::SILENT
        }
    }

    pub fn is_silent(&self) -> bool {
        *self == Self::SILENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BeamState {
    pub skull_count: u16,
    pub fault: bool,
}

/// Full mirror of the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TowerState {
    pub drums: [DrumState; DRUM_COUNT],
    pub layers: [LayerState; LAYER_COUNT],
    pub audio: AudioState,
    pub beam: BeamState,
    pub led_sequence: u8,
}

impl TowerState {
    pub fn drum(&self, level: DrumLevel) -> &DrumState {
        &self.drums[level.index()]
    }

    pub fn drum_mut(&mut self, level: DrumLevel) -> &mut DrumState {
        &mut self.drums[level.index()]
    }

    pub fn light(&self, layer: LightLayer, slot: usize) -> Option<&LightState> {
        self.layers[layer.index()].lights.get(slot)
    }

    /// True when all three drums report calibrated.
    pub fn is_calibrated(&self) -> bool {
        self.drums.iter().all(|d| d.calibrated)
    }

    pub fn light_sequence(&self) -> LightSequence {
        LightSequence::from_primitive(self.led_sequence)
    }
}

impl fmt::Display for TowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Drums:")?;
        for (level, drum) in DrumLevel::ALL.iter().zip(self.drums.iter()) {
            write!(
                f,
                " {}={}{}{}",
                level,
                drum.position,
                if drum.calibrated { "" } else { "(uncal)" },
                if drum.jammed { "(jammed)" } else { "" }
            )?;
        }
        let lit = self
            .layers
            .iter()
            .flat_map(|l| l.lights.iter())
            .filter(|l| l.effect != LightEffect::Off)
            .count();
        write!(
            f,
            ", Lights on: {}, Audio: {}{}, Skulls: {}{}, Sequence: {}",
            lit,
            self.audio.sample,
            if self.audio.looped { " (loop)" } else { "" },
            self.beam.skull_count,
            if self.beam.fault { " (beam fault)" } else { "" },
            self.light_sequence()
        )
    }
}

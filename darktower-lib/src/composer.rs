//! Stateful command composition.
//!
//! Every outbound state command is built by copying the last known state and
//! applying a sparse patch, so fields the caller did not touch are re-sent
//! exactly as the tower last had them.

use crate::codec;
use crate::constants::{DRUM_COUNT, LIGHTS_PER_LAYER};
use crate::error::ProtocolError;
use crate::state::{AudioState, BeamState, Compass, DrumLevel, DrumState, LightLayer, LightState, TowerState};
use bytes::Bytes;

/// Field-by-field drum update. `None` leaves the field as it was.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrumPatch {
    pub jammed: Option<bool>,
    pub calibrated: Option<bool>,
    pub position: Option<Compass>,
    pub play_sound: Option<bool>,
    pub reverse: Option<bool>,
}

impl DrumPatch {
    pub fn rotate(position: Compass, play_sound: bool) -> Self {
        Self {
            position: Some(position),
            play_sound: Some(play_sound),
            ..Self::default()
        }
    }

    fn apply(&self, drum: &mut DrumState) {
        if let Some(v) = self.jammed {
            drum.jammed = v;
        }
        if let Some(v) = self.calibrated {
            drum.calibrated = v;
        }
        if let Some(v) = self.position {
            drum.position = v;
        }
        if let Some(v) = self.play_sound {
            drum.play_sound = v;
        }
        if let Some(v) = self.reverse {
            drum.reverse = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightPatch {
    pub layer: LightLayer,
    pub slot: usize,
    pub light: LightState,
}

/// Sparse update of a [`TowerState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub drums: [Option<DrumPatch>; DRUM_COUNT],
    pub lights: Vec<LightPatch>,
    pub audio: Option<AudioState>,
    pub beam: Option<BeamState>,
    pub led_sequence: Option<u8>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drum(mut self, level: DrumLevel, patch: DrumPatch) -> Self {
        self.drums[level.index()] = Some(patch);
        self
    }

    pub fn light(mut self, layer: LightLayer, slot: usize, light: LightState) -> Self {
        self.lights.push(LightPatch { layer, slot, light });
        self
    }

    pub fn audio(mut self, audio: AudioState) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn beam(mut self, beam: BeamState) -> Self {
        self.beam = Some(beam);
        self
    }

    pub fn led_sequence(mut self, sequence: u8) -> Self {
        self.led_sequence = Some(sequence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.drums.iter().all(Option::is_none)
            && self.lights.is_empty()
            && self.audio.is_none()
            && self.beam.is_none()
            && self.led_sequence.is_none()
    }

    /// Apply onto `state`. Slot indices are checked before anything is written.
    pub fn apply(&self, state: &mut TowerState) -> Result<(), ProtocolError> {
        if let Some(bad) = self.lights.iter().find(|l| l.slot >= LIGHTS_PER_LAYER) {
            return Err(ProtocolError::IndexOutOfRange {
                what: "light slot",
                index: bad.slot,
                max: LIGHTS_PER_LAYER - 1,
            });
        }

        for (drum, patch) in state.drums.iter_mut().zip(self.drums.iter()) {
            if let Some(patch) = patch {
                patch.apply(drum);
            }
        }
        for l in &self.lights {
            state.layers[l.layer.index()].lights[l.slot] = l.light;
        }
        if let Some(audio) = self.audio {
            state.audio = audio;
        }
        if let Some(beam) = self.beam {
            state.beam = beam;
        }
        if let Some(sequence) = self.led_sequence {
            state.led_sequence = sequence;
        }
        Ok(())
    }
}

/// A frame ready to send plus the state the local mirror should keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedCommand {
    pub frame: Bytes,
    pub state: TowerState,
}

/// Patch `current` (or a neutral state when there is none) and encode it.
pub fn compose_patch(current: Option<&TowerState>, patch: &StatePatch) -> Result<ComposedCommand, ProtocolError> {
    let mut next = current.copied().unwrap_or_default();
    patch.apply(&mut next)?;
    let frame = codec::encode_state_frame(&next)?;
    Ok(ComposedCommand { frame, state: next })
}

/// Single light change. The frame never carries a sound.
pub fn compose_led(
    current: Option<&TowerState>,
    layer: LightLayer,
    slot: usize,
    light: LightState,
) -> Result<ComposedCommand, ProtocolError> {
    let patch = StatePatch::new().light(layer, slot, light).audio(AudioState::SILENT);
    compose_patch(current, &patch)
}

/// Single drum rotation, also with audio silenced.
pub fn compose_rotation(
    current: Option<&TowerState>,
    level: DrumLevel,
    position: Compass,
    play_sound: bool,
) -> Result<ComposedCommand, ProtocolError> {
    let patch = StatePatch::new()
        .drum(level, DrumPatch::rotate(position, play_sound))
        .audio(AudioState::SILENT);
    compose_patch(current, &patch)
}

/// Send the patch's audio once; the retained state forgets it.
pub fn compose_transient_audio(
    current: Option<&TowerState>,
    patch: &StatePatch,
) -> Result<ComposedCommand, ProtocolError> {
    let mut composed = compose_patch(current, patch)?;
    composed.state.audio = AudioState::SILENT;
    Ok(composed)
}

pub fn compose_sound(current: Option<&TowerState>, audio: AudioState) -> Result<ComposedCommand, ProtocolError> {
    compose_transient_audio(current, &StatePatch::new().audio(audio))
}

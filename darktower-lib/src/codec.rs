//! Bit-exact conversion between [`TowerState`] and the 19-byte state payload.
//!
//! Payload layout (bit 0 is the least significant bit of a byte):
//!
//! | Byte  | Contents                                                         |
//! |-------|------------------------------------------------------------------|
//! | 0-1   | Drum flags: play sound, position (2 bits), jammed, calibrated ×3 |
//! | 2-13  | Six layers × 2 bytes, two light slots per byte                   |
//! | 14    | Audio sample (7 bits), loop                                      |
//! | 15-16 | Skull count, big-endian                                          |
//! | 17    | Beam fault, drum reverse ×3, volume (4 bits)                     |
//! | 18    | LED sequence override                                            |

use crate::constants::{
    FRAME_HEADER_SIZE, MAX_AUDIO_SAMPLE, MAX_AUDIO_VOLUME, STATE_FRAME_SIZE, STATE_PAYLOAD_SIZE,
};
use crate::error::ProtocolError;
use crate::message::TowerCommand;
use crate::state::{AudioState, BeamState, Compass, DrumState, LayerState, LightEffect, LightState, TowerState};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::FromPrimitive;

#[bitfield(bytes = 2)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct DrumBits {
    top_play_sound: bool,
    top_position: B2,
    top_jammed: bool,
    top_calibrated: bool,
    middle_play_sound: bool,
    middle_position: B2,
    middle_jammed: bool,
    middle_calibrated: bool,
    bottom_play_sound: bool,
    bottom_position: B2,
    bottom_jammed: bool,
    bottom_calibrated: bool,
    #[skip]
    unused: bool,
}

/// Two light slots share a byte; the first slot sits in the high nibble.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct LightPairBits {
    second_looped: bool,
    second_effect: B3,
    first_looped: bool,
    first_effect: B3,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct AudioBits {
    sample: B7,
    looped: bool,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct FlagBits {
    beam_fault: bool,
    top_reverse: bool,
    middle_reverse: bool,
    bottom_reverse: bool,
    volume: B4,
}

fn validate(state: &TowerState) -> Result<(), ProtocolError> {
    if state.audio.sample > MAX_AUDIO_SAMPLE {
        return Err(ProtocolError::FieldOutOfRange {
            field: "audio.sample",
            value: state.audio.sample.into(),
            max: MAX_AUDIO_SAMPLE.into(),
        });
    }
    if state.audio.volume > MAX_AUDIO_VOLUME {
        return Err(ProtocolError::FieldOutOfRange {
            field: "audio.volume",
            value: state.audio.volume.into(),
            max: MAX_AUDIO_VOLUME.into(),
        });
    }
    Ok(())
}

/// Pack `state` into the first 19 bytes of `dest`.
///
/// The buffer is left untouched when an error is returned.
pub fn pack(state: &TowerState, dest: &mut [u8]) -> Result<(), ProtocolError> {
    if dest.len() < STATE_PAYLOAD_SIZE {
        return Err(ProtocolError::BufferTooSmall {
            expected: STATE_PAYLOAD_SIZE,
            actual: dest.len(),
        });
    }
    validate(state)?;

    let payload = &mut dest[..STATE_PAYLOAD_SIZE];
    payload.fill(0);

    let [top, middle, bottom] = &state.drums;
    let drums = DrumBits::new()
        .with_top_play_sound(top.play_sound)
        .with_top_position(top.position.into())
        .with_top_jammed(top.jammed)
        .with_top_calibrated(top.calibrated)
        .with_middle_play_sound(middle.play_sound)
        .with_middle_position(middle.position.into())
        .with_middle_jammed(middle.jammed)
        .with_middle_calibrated(middle.calibrated)
        .with_bottom_play_sound(bottom.play_sound)
        .with_bottom_position(bottom.position.into())
        .with_bottom_jammed(bottom.jammed)
        .with_bottom_calibrated(bottom.calibrated);

    let mut buf = payload;
    buf.put_slice(&drums.into_bytes());

    for layer in &state.layers {
        for pair in layer.lights.chunks_exact(2) {
            let bits = LightPairBits::new()
                .with_first_effect(pair[0].effect.into())
                .with_first_looped(pair[0].looped)
                .with_second_effect(pair[1].effect.into())
                .with_second_looped(pair[1].looped);
            buf.put_slice(&bits.into_bytes());
        }
    }

    let audio = AudioBits::new()
        .with_sample(state.audio.sample)
        .with_looped(state.audio.looped);
    buf.put_slice(&audio.into_bytes());

    buf.put_u16(state.beam.skull_count);

    let flags = FlagBits::new()
        .with_beam_fault(state.beam.fault)
        .with_top_reverse(top.reverse)
        .with_middle_reverse(middle.reverse)
        .with_bottom_reverse(bottom.reverse)
        .with_volume(state.audio.volume);
    buf.put_slice(&flags.into_bytes());

    buf.put_u8(state.led_sequence);
    Ok(())
}

/// Pack `state` into a fresh payload array.
pub fn pack_to_array(state: &TowerState) -> Result<[u8; STATE_PAYLOAD_SIZE], ProtocolError> {
    let mut payload = [0u8; STATE_PAYLOAD_SIZE];
    pack(state, &mut payload)?;
    Ok(payload)
}

pub fn unpack(payload: &[u8; STATE_PAYLOAD_SIZE]) -> TowerState {
    let mut buf = &payload[..];

    let mut raw = [0u8; 2];
    buf.copy_to_slice(&mut raw);
    let drums = DrumBits::from_bytes(raw);

    let mut layers = [LayerState::default(); crate::constants::LAYER_COUNT];
    for layer in layers.iter_mut() {
        for pair in layer.lights.chunks_exact_mut(2) {
            let bits = LightPairBits::from_bytes([buf.get_u8()]);
            pair[0] = LightState::new(LightEffect::from_primitive(bits.first_effect()), bits.first_looped());
            pair[1] = LightState::new(LightEffect::from_primitive(bits.second_effect()), bits.second_looped());
        }
    }

    let audio = AudioBits::from_bytes([buf.get_u8()]);
    let skull_count = buf.get_u16();
    let flags = FlagBits::from_bytes([buf.get_u8()]);
    let led_sequence = buf.get_u8();

    TowerState {
        drums: [
            DrumState {
                play_sound: drums.top_play_sound(),
                position: Compass::from_primitive(drums.top_position()),
                jammed: drums.top_jammed(),
                calibrated: drums.top_calibrated(),
                reverse: flags.top_reverse(),
            },
            DrumState {
                play_sound: drums.middle_play_sound(),
                position: Compass::from_primitive(drums.middle_position()),
                jammed: drums.middle_jammed(),
                calibrated: drums.middle_calibrated(),
                reverse: flags.middle_reverse(),
            },
            DrumState {
                play_sound: drums.bottom_play_sound(),
                position: Compass::from_primitive(drums.bottom_position()),
                jammed: drums.bottom_jammed(),
                calibrated: drums.bottom_calibrated(),
                reverse: flags.bottom_reverse(),
            },
        ],
        layers,
        audio: AudioState {
            sample: audio.sample(),
            looped: audio.looped(),
            volume: flags.volume(),
        },
        beam: BeamState {
            skull_count,
            fault: flags.beam_fault(),
        },
        led_sequence,
    }
}

/// Unpack from a slice that must hold at least 19 bytes.
pub fn unpack_slice(payload: &[u8]) -> Result<TowerState, ProtocolError> {
    let payload: &[u8; STATE_PAYLOAD_SIZE] = payload
        .get(..STATE_PAYLOAD_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(ProtocolError::BufferTooSmall {
            expected: STATE_PAYLOAD_SIZE,
            actual: payload.len(),
        })?;
    Ok(unpack(payload))
}

pub fn is_calibrated(state: &TowerState) -> bool {
    state.is_calibrated()
}

/// Build the 20-byte "set full state" command.
pub fn encode_state_frame(state: &TowerState) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::zeroed(STATE_FRAME_SIZE);
    frame[0] = TowerCommand::TowerState.into();
    pack(state, &mut frame[FRAME_HEADER_SIZE..])?;
    Ok(frame.freeze())
}

/// Decode an inbound state report (discriminator byte followed by the payload).
pub fn decode_state_frame(frame: &[u8]) -> Result<TowerState, ProtocolError> {
    if frame.len() < STATE_FRAME_SIZE {
        return Err(ProtocolError::FrameTooShort {
            kind: "Tower State",
            expected: STATE_FRAME_SIZE,
            actual: frame.len(),
        });
    }
    unpack_slice(&frame[FRAME_HEADER_SIZE..])
}

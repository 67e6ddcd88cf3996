use bytes::{Bytes, BytesMut};

use crate::access_unit::AccessUnit;

/// Stereo, 16 bits per sample.
pub const FRAME_SIZE: usize = 4;
pub const FRAMES_PER_AU: usize = 80;
pub const AUS_PER_PAYLOAD: usize = 6;
pub const HEADER_SIZE: usize = 4;
pub const PAYLOAD_DATA_SIZE: usize = AUS_PER_PAYLOAD * FRAMES_PER_AU * FRAME_SIZE;
pub const SAMPLE_RATE: u32 = 48000;

const QUANTIZATION_WORD_LENGTH: u8 = 0; // 16 bit
const SAMPLING_FREQUENCY: u8 = 2; // 48 kHz
const CHANNELS: u8 = 1; // stereo

/// Payload header: sub-stream id, number of AUs, reserved, audio format.
pub const PAYLOAD_HEADER: [u8; HEADER_SIZE] = [
    0xa0,
    AUS_PER_PAYLOAD as u8,
    0,
    (QUANTIZATION_WORD_LENGTH << 6) | (SAMPLING_FREQUENCY << 3) | CHANNELS,
];

/// Packs raw PCM into fixed-size payloads of six 80-frame access units.
///
/// A payload that is not full yet is carried into the next `push`.
#[derive(Debug, Default)]
pub struct PcmPacketizer {
    partial: Option<(BytesMut, i64)>,
}

impl PcmPacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Consumes host-order PCM and returns every payload it completed.
    pub fn push(&mut self, mut access_unit: AccessUnit) -> Vec<AccessUnit> {
        let mut samples = access_unit.data().to_vec();
        access_unit.release_media_buffer();
        to_network_order(&mut samples);

        let mut time_us = access_unit.time_us();
        let mut input = &samples[..];
        let mut completed = Vec::new();

        if let Some((mut payload, payload_time_us)) = self.partial.take() {
            let missing = HEADER_SIZE + PAYLOAD_DATA_SIZE - payload.len();
            let copy = input.len().min(missing);
            payload.extend_from_slice(&input[..copy]);
            input = &input[copy..];
            time_us += duration_us(copy);

            if copy == missing {
                completed.push(AccessUnit::new(payload.freeze(), payload_time_us));
            } else {
                self.partial = Some((payload, payload_time_us));
            }
        }

        while !input.is_empty() {
            let mut payload = BytesMut::with_capacity(HEADER_SIZE + PAYLOAD_DATA_SIZE);
            payload.extend_from_slice(&PAYLOAD_HEADER);

            let copy = input.len().min(PAYLOAD_DATA_SIZE);
            payload.extend_from_slice(&input[..copy]);
            input = &input[copy..];

            let payload_time_us = time_us;
            time_us += duration_us(copy);

            if copy == PAYLOAD_DATA_SIZE {
                completed.push(AccessUnit::new(payload.freeze(), payload_time_us));
            } else {
                self.partial = Some((payload, payload_time_us));
            }
        }

        completed
    }

    /// Emits the carried partial payload, used at end of stream.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        self.partial
            .take()
            .map(|(payload, time_us)| AccessUnit::new(payload.freeze(), time_us))
    }
}

fn to_network_order(samples: &mut [u8]) {
    for sample in samples.chunks_exact_mut(2) {
        let value = i16::from_ne_bytes([sample[0], sample[1]]);
        sample.copy_from_slice(&value.to_be_bytes());
    }
}

fn duration_us(bytes: usize) -> i64 {
    ((bytes / FRAME_SIZE) as f64 * 1e6 / SAMPLE_RATE as f64) as i64
}

/// True when every byte of the buffer is zero.
pub fn is_silence(data: &Bytes) -> bool {
    data.iter().all(|b| *b == 0)
}

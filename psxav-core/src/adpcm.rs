//! ADPCM block encoding core shared by the XA and SPU paths
//!
//! Both formats quantize 28-sample blocks against one of five fixed linear predictors, with a
//! per-block right-shift that scales residuals into the 4-bit (or 8-bit for XA) range. The
//! encoder is closed-loop: the predictor history is fed with the *decoder-side* reconstruction of
//! each sample, never the raw input, so quantization error does not compound across blocks.

use crate::num::I32Ext;

pub const SAMPLES_PER_BLOCK: usize = 28;

pub const SHIFT_RANGE_4BPS: u32 = 12;
pub const SHIFT_RANGE_8BPS: u32 = 8;

/// XA-ADPCM is limited to the first four predictors; SPU-ADPCM may use all five.
pub const XA_FILTER_COUNT: usize = 4;
pub const SPU_FILTER_COUNT: usize = 5;

// Predictor coefficients in 6-bit fixed point
const FILTER_K1: [i32; SPU_FILTER_COUNT] = [0, 60, 115, 98, 122];
const FILTER_K2: [i32; SPU_FILTER_COUNT] = [0, 0, -52, -55, -60];

/// Per-channel encoder state: the last two reconstructed samples plus the quantization error
/// accumulator (reserved for dithering, currently held at zero) and the MSE of the most recent
/// encode attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelState {
    qerr: i32,
    mse: u64,
    prev1: i32,
    prev2: i32,
}

impl ChannelState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Samples past `sample_limit` (end of stream) read as zero.
fn sample_at(samples: &[i16], sample_limit: i32, pitch: usize, i: usize) -> i32 {
    if (i as i32) >= sample_limit {
        return 0;
    }
    samples.get(i * pitch).copied().map_or(0, i32::from)
}

/// Find the smallest shift that keeps every residual of the block inside the quantizer's clip
/// range, modeling the predictor open-loop (fed with raw samples).
fn find_min_shift(
    state: &ChannelState,
    samples: &[i16],
    sample_limit: i32,
    pitch: usize,
    filter: usize,
    shift_range: u32,
) -> u32 {
    let k1 = FILTER_K1[filter];
    let k2 = FILTER_K2[filter];

    let mut prev1 = state.prev1;
    let mut prev2 = state.prev2;

    let mut s_min: i32 = 0;
    let mut s_max: i32 = 0;
    for i in 0..SAMPLES_PER_BLOCK {
        let raw_sample = sample_at(samples, sample_limit, pitch, i);
        let predicted = (k1 * prev1 + k2 * prev2 + (1 << 5)) >> 6;
        let residual = raw_sample - predicted;
        s_min = s_min.min(residual);
        s_max = s_max.max(residual);
        prev2 = prev1;
        prev1 = raw_sample;
    }

    let mut right_shift = 0;
    while right_shift < shift_range && (s_max >> right_shift) > (0x7FFF >> shift_range) {
        right_shift += 1;
    }
    while right_shift < shift_range && (s_min >> right_shift) < (-0x8000 >> shift_range) {
        right_shift += 1;
    }

    shift_range - right_shift
}

/// Quantize one block with a fixed (filter, shift) pair, writing the encoded samples into `data`
/// at the given byte pitch and bit offset. Returns the block header byte and the resulting
/// channel state, whose `mse` field holds the closed-loop reconstruction error of this attempt.
#[allow(clippy::too_many_arguments)]
fn attempt_to_encode(
    in_state: &ChannelState,
    samples: &[i16],
    sample_limit: i32,
    pitch: usize,
    data: &mut [u8],
    data_shift: u32,
    data_pitch: usize,
    filter: usize,
    sample_shift: u32,
    shift_range: u32,
) -> (u8, ChannelState) {
    let sample_mask = (0xFFFF_u32 >> shift_range) as u8;
    let nondata_mask = !(sample_mask << data_shift);

    let k1 = FILTER_K1[filter];
    let k2 = FILTER_K2[filter];

    let header = ((sample_shift as u8) & 0x0F) | ((filter as u8) << 4);

    let mut state = *in_state;
    state.mse = 0;

    for i in 0..SAMPLES_PER_BLOCK {
        let sample = sample_at(samples, sample_limit, pitch, i) + state.qerr;
        let predicted = (k1 * state.prev1 + k2 * state.prev2 + (1 << 5)) >> 6;

        let mut sample_enc = sample - predicted;
        sample_enc <<= sample_shift;
        sample_enc += 1 << (shift_range - 1);
        sample_enc >>= shift_range;
        sample_enc = sample_enc.clamp(-0x8000 >> shift_range, 0x7FFF >> shift_range);
        sample_enc &= i32::from(sample_mask);

        // Closed loop: run the decoder on the nibble we just produced
        let mut sample_dec = i32::from((((sample_enc as u16) & u16::from(sample_mask)) << shift_range) as i16);
        sample_dec >>= sample_shift;
        sample_dec += predicted;
        let sample_dec = i32::from(sample_dec.clamp_to_i16());

        let sample_error = i64::from(sample_dec) - i64::from(sample);

        data[i * data_pitch] = (data[i * data_pitch] & nondata_mask) | ((sample_enc as u8) << data_shift);

        // state.qerr += sample_error; // dithering is hard to predict, left disabled
        state.mse += (sample_error * sample_error) as u64;

        state.prev2 = state.prev1;
        state.prev1 = sample_dec;
    }

    (header, state)
}

/// Encode one 28-sample block, searching every allowed predictor and a shift neighborhood of the
/// open-loop minimum for the attempt with the lowest closed-loop MSE. The winning attempt is
/// re-run against `state` so its reconstruction history carries into the next block.
///
/// `data_shift`/`data_pitch` position the encoded samples within `data`: XA sound groups
/// interleave two 4-bit blocks per byte column (shifts 0 and 4, pitch 4), while SPU blocks pack
/// contiguously (shift 0, pitch 1).
#[allow(clippy::too_many_arguments)]
pub fn encode_block(
    state: &mut ChannelState,
    samples: &[i16],
    sample_limit: i32,
    pitch: usize,
    data: &mut [u8],
    data_shift: u32,
    data_pitch: usize,
    filter_count: usize,
    shift_range: u32,
) -> u8 {
    let mut best_mse = 1_u64 << 50;
    let mut best_filter = 0;
    let mut best_shift = 0;

    for filter in 0..filter_count {
        let true_min_shift =
            find_min_shift(state, samples, sample_limit, pitch, filter, shift_range);

        // The optimal shift can be off the open-loop minimum by 1 in either direction. This
        // stops being true once dithering is enabled.
        let lowest = true_min_shift.saturating_sub(1);
        let highest = (true_min_shift + 1).min(shift_range);

        for sample_shift in lowest..=highest {
            let (_, attempt) = attempt_to_encode(
                state,
                samples,
                sample_limit,
                pitch,
                data,
                data_shift,
                data_pitch,
                filter,
                sample_shift,
                shift_range,
            );

            if attempt.mse < best_mse {
                best_mse = attempt.mse;
                best_filter = filter;
                best_shift = sample_shift;
            }
        }
    }

    let (header, committed) = attempt_to_encode(
        state,
        samples,
        sample_limit,
        pitch,
        data,
        data_shift,
        data_pitch,
        best_filter,
        best_shift,
        shift_range,
    );
    *state = committed;

    header
}

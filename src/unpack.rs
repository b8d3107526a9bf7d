// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Bit unpackers for the packed depth and IR formats.
//!
//! All of them work on whole elements only and report how many elements they converted.
//! Carrying the partial tail over to the next chunk is the caller's job.

use crate::shift_to_depth::MAX_SHIFT_VALUE;

/// Input bytes of one packed 12 bit element
pub const PACKED12_ELEMENT_BYTES: usize = 24;
/// Shift values in one packed 12 bit element
pub const PACKED12_ELEMENT_VALUES: usize = 16;
/// Input bytes of one packed 11 bit element
pub const PACKED11_ELEMENT_BYTES: usize = 11;
/// Shift values in one packed 11 bit element
pub const PACKED11_ELEMENT_VALUES: usize = 8;
/// Input bytes of one packed 10 bit element
pub const PACKED10_ELEMENT_BYTES: usize = 5;
/// Values in one packed 10 bit element
pub const PACKED10_ELEMENT_VALUES: usize = 4;

/// Shifts at or above this are invalid and replaced by 0
const PACKED_SHIFT_LIMIT: u16 = MAX_SHIFT_VALUE as u16 - 1;

/// Bit extraction of one packed 12 bit element. Implementations must agree bit for bit.
pub trait UnpackStrategy {
    /// Unpack 16 raw (unclamped) 12 bit values
    fn unpack_element(input: &[u8; PACKED12_ELEMENT_BYTES]) -> [u16; PACKED12_ELEMENT_VALUES];
}

/// One value pair at a time
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarUnpack;

impl UnpackStrategy for ScalarUnpack {
    fn unpack_element(input: &[u8; PACKED12_ELEMENT_BYTES]) -> [u16; PACKED12_ELEMENT_VALUES] {
        let mut shifts = [0u16; PACKED12_ELEMENT_VALUES];
        for (pair, bytes) in shifts.chunks_exact_mut(2).zip(input.chunks_exact(3)) {
            pair[0] = (bytes[0] as u16) << 4 | (bytes[1] as u16) >> 4;
            pair[1] = (bytes[1] as u16 & 0x0f) << 8 | bytes[2] as u16;
        }
        shifts
    }
}

/// Deinterleaves the element into three byte lanes, then computes all even and all odd
/// values with lane-wide operations, the way a SIMD implementation would.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneUnpack;

impl UnpackStrategy for LaneUnpack {
    fn unpack_element(input: &[u8; PACKED12_ELEMENT_BYTES]) -> [u16; PACKED12_ELEMENT_VALUES] {
        const LANE: usize = PACKED12_ELEMENT_VALUES / 2;
        let lane = |n: usize| -> [u16; LANE] { std::array::from_fn(|i| input[i * 3 + n] as u16) };
        let (high, mid, low) = (lane(0), lane(1), lane(2));

        let even: [u16; LANE] = std::array::from_fn(|i| high[i] << 4 | mid[i] >> 4);
        let odd: [u16; LANE] = std::array::from_fn(|i| (mid[i] << 12) >> 4 | low[i]);

        std::array::from_fn(|i| if i % 2 == 0 { even[i / 2] } else { odd[i / 2] })
    }
}

/// Unpack the whole 12 bit elements of `input` into `output`, replacing invalid shifts with
/// 0. Returns the number of elements converted; `output` must hold 16 values per element.
pub fn unpack_packed12<S: UnpackStrategy>(input: &[u8], output: &mut [u16]) -> usize {
    let mut elements = 0;
    for (bytes, values) in input
        .chunks_exact(PACKED12_ELEMENT_BYTES)
        .zip(output.chunks_exact_mut(PACKED12_ELEMENT_VALUES))
    {
        let mut element = [0u8; PACKED12_ELEMENT_BYTES];
        element.copy_from_slice(bytes);
        for (out, shift) in values.iter_mut().zip(S::unpack_element(&element)) {
            *out = if shift < PACKED_SHIFT_LIMIT { shift } else { 0 };
        }
        elements += 1;
    }
    elements
}

/// Unpack the whole 11 bit elements of `input` into `output`. Returns the number of elements
/// converted.
pub fn unpack_packed11(input: &[u8], output: &mut [u16]) -> usize {
    let mut elements = 0;
    for (i, values) in input
        .chunks_exact(PACKED11_ELEMENT_BYTES)
        .zip(output.chunks_exact_mut(PACKED11_ELEMENT_VALUES))
    {
        let b = |n: usize| i[n] as u16;
        values[0] = b(0) << 3 | b(1) >> 5;
        values[1] = (b(1) & 0x1f) << 6 | b(2) >> 2;
        values[2] = (b(2) & 0x03) << 9 | b(3) << 1 | b(4) >> 7;
        values[3] = (b(4) & 0x7f) << 4 | b(5) >> 4;
        values[4] = (b(5) & 0x0f) << 7 | b(6) >> 1;
        values[5] = (b(6) & 0x01) << 10 | b(7) << 2 | b(8) >> 6;
        values[6] = (b(8) & 0x3f) << 5 | b(9) >> 3;
        values[7] = (b(9) & 0x07) << 8 | b(10);
        elements += 1;
    }
    elements
}

/// Unpack the whole 10 bit elements of `input` into `output`. Returns the number of elements
/// converted.
pub fn unpack_packed10(input: &[u8], output: &mut [u16]) -> usize {
    let mut elements = 0;
    for (i, values) in input
        .chunks_exact(PACKED10_ELEMENT_BYTES)
        .zip(output.chunks_exact_mut(PACKED10_ELEMENT_VALUES))
    {
        let b = |n: usize| i[n] as u16;
        values[0] = b(0) << 2 | b(1) >> 6;
        values[1] = (b(1) & 0x3f) << 4 | b(2) >> 4;
        values[2] = (b(2) & 0x0f) << 6 | b(3) >> 2;
        values[3] = (b(3) & 0x03) << 8 | b(4);
        elements += 1;
    }
    elements
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

    use super::*;

    /// Pack 12 bit values, big endian bit order
    fn pack12(values: &[u16]) -> Vec<u8> {
        values
            .chunks_exact(2)
            .flat_map(|p| {
                [
                    (p[0] >> 4) as u8,
                    ((p[0] & 0xf) << 4 | p[1] >> 8) as u8,
                    p[1] as u8,
                ]
            })
            .collect()
    }

    /// Pack `bits` wide values, big endian bit order
    fn pack_bits(values: &[u16], bits: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut acc = 0u32;
        let mut acc_bits = 0;
        for &v in values {
            acc = acc << bits | v as u32;
            acc_bits += bits;
            while acc_bits >= 8 {
                acc_bits -= 8;
                out.push((acc >> acc_bits) as u8);
            }
        }
        out
    }

    #[test]
    fn scalar_and_lane_agree() {
        let mut rng = StdRng::seed_from_u64(12);
        for round in 0..200 {
            let elements = rng.gen_range(1..8);
            let mut input = vec![0u8; elements * PACKED12_ELEMENT_BYTES];
            if round % 4 == 0 {
                // Values around the clamp limit
                let values: Vec<u16> = (0..elements * PACKED12_ELEMENT_VALUES)
                    .map(|_| rng.gen_range(PACKED_SHIFT_LIMIT - 2..=PACKED_SHIFT_LIMIT + 2))
                    .collect();
                input = pack12(&values);
            } else {
                rng.fill_bytes(&mut input);
            }
            let mut scalar = vec![0u16; elements * PACKED12_ELEMENT_VALUES];
            let mut lane = vec![0u16; elements * PACKED12_ELEMENT_VALUES];
            assert_eq!(unpack_packed12::<ScalarUnpack>(&input, &mut scalar), elements);
            assert_eq!(unpack_packed12::<LaneUnpack>(&input, &mut lane), elements);
            assert_eq!(scalar, lane);
        }
    }

    #[test]
    fn packed12_values_and_clamp() {
        let mut values: Vec<u16> = (0..16).map(|i| i * 100).collect();
        values[3] = PACKED_SHIFT_LIMIT - 1;
        values[4] = PACKED_SHIFT_LIMIT;
        values[5] = 0xfff;
        let mut output = [0u16; 16];
        // Trailing partial element is ignored
        let mut input = pack12(&values);
        input.extend([1, 2, 3]);
        assert_eq!(unpack_packed12::<ScalarUnpack>(&input, &mut output), 1);
        let mut expected = values.clone();
        expected[4] = 0;
        expected[5] = 0;
        assert_eq!(output.to_vec(), expected);
    }

    #[test]
    fn packed11() {
        let values = [0, 1, 2047, 1024, 5, 1000, 77, 1234, 3, 4, 5, 6, 7, 8, 9, 10];
        let input = pack_bits(&values, 11);
        assert_eq!(input.len(), 2 * PACKED11_ELEMENT_BYTES);
        let mut output = [0u16; 16];
        assert_eq!(unpack_packed11(&input, &mut output), 2);
        assert_eq!(output, values);
    }

    #[test]
    fn packed10() {
        let values = [0, 1023, 512, 3, 100, 200, 300, 400];
        let input = pack_bits(&values, 10);
        let mut output = [0u16; 8];
        assert_eq!(unpack_packed10(&input[..9], &mut output), 1);
        assert_eq!(&output[..4], &values[..4]);
        assert_eq!(unpack_packed10(&input, &mut output), 2);
        assert_eq!(output, values);
    }
}

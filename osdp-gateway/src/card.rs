//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Wiegand card number conversion. OSDP raw card replies carry a variable
//! length bit stream (the legacy Wiegand payload) which the gateway exposes
//! to plugins both as the raw bit string and as a decimal card number. The
//! number is the whole bit sequence interpreted as a big-endian unsigned
//! integer, no parity bits stripped; card formats run up to 200 bits so the
//! conversion cannot go through a machine word.

/// Convert the first `bit_count` bits of `data` (MSB of `data[0]` first) to
/// a decimal string. Empty or all-zero input yields `"0"`.
pub fn wiegand_to_decimal(data: &[u8], bit_count: usize) -> String {
    // Base-10 accumulator, least significant digit first. Doubling and
    // adding per input bit keeps the whole thing in u8 digit space.
    let mut digits: Vec<u8> = vec![0];
    for i in 0..bit_count.min(data.len() * 8) {
        let bit = (data[i / 8] >> (7 - (i % 8))) & 1;
        let mut carry = bit;
        for d in digits.iter_mut() {
            let v = *d * 2 + carry;
            *d = v % 10;
            carry = v / 10;
        }
        while carry > 0 {
            digits.push(carry % 10);
            carry /= 10;
        }
    }
    digits
        .iter()
        .rev()
        .map(|d| char::from(b'0' + d))
        .collect()
}

/// Render the first `bit_count` bits of `data` as a `0`/`1` string for
/// debugging and plugin metadata.
pub fn bits_string(data: &[u8], bit_count: usize) -> String {
    (0..bit_count.min(data.len() * 8))
        .map(|i| {
            if (data[i / 8] >> (7 - (i % 8))) & 1 == 1 {
                '1'
            } else {
                '0'
            }
        })
        .collect()
}

//! # Frame Decoder
//!
//! Turns one raw text record into channel values. A record is a line of
//! whitespace-separated numbers holding one sample for every channel,
//! concatenated in registry order.
//!
//! Decoding stops at the first channel that cannot be filled completely,
//! whether a token is missing or not numeric. That channel and every channel
//! after it keep their previous values. A short record is normal input here,
//! not an error.

use crate::channels::Registry;

/// Split a record into tokens on runs of space, tab, CR and LF.
pub fn tokens(record: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    record
        .split(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        .filter(|token| !token.is_empty())
}

/// A whole token as a finite number; `nan`, `inf` and numeric prefixes
/// like `1.5abc` do not count.
fn parse_value(token: &[u8]) -> Option<f32> {
    std::str::from_utf8(token)
        .ok()?
        .parse()
        .ok()
        .filter(|value: &f32| value.is_finite())
}

/// Fill channel values from `record`, returning how many channels were updated.
///
/// # Example
/// ```
/// use mocap_server_lib::{channels::Registry, frame::decode, Channel};
///
/// let mut registry = Registry::from_channels(vec![Channel::new("pos", 3), Channel::new("rot", 3)]);
/// assert_eq!(decode(b"1 2 3 x\n", &mut registry), 1);
/// assert_eq!(registry.channels()[0].samples(), &[1.0, 2.0, 3.0]);
/// assert_eq!(registry.channels()[1].samples(), &[0.0, 0.0, 0.0]);
/// ```
pub fn decode(record: &[u8], registry: &mut Registry) -> usize {
    let mut tokens = tokens(record);
    let mut scratch = Vec::new();
    let mut filled = 0;

    for channel in registry.channels_mut() {
        scratch.clear();
        for _ in 0..channel.dimension() {
            match tokens.next().and_then(parse_value) {
                Some(value) => scratch.push(value),
                None => return filled,
            }
        }
        channel.set_samples(&scratch);
        filled += 1;
    }
    filled
}

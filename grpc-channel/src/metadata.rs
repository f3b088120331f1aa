/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Encodings used for gRPC metadata values.
//!
//! Covers the three value formats the channel needs to produce or understand:
//! the `grpc-timeout` header, the percent-encoded `grpc-message` trailer and
//! the base64 encoding of binary (`-bin`) headers.

use std::borrow::Cow;
use std::time::Duration;

use ::base64::Engine as _;
use bytes::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode, percent_encode};

pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
pub const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// Suffix marking a metadata key whose values are binary.
pub const BINARY_HEADER_SUFFIX: &str = "-bin";

// Bytes below 0x20, 0x7f and everything above it (non-ASCII) are always
// escaped by percent_encode; '%' must be escaped so decoding is unambiguous.
const GRPC_MESSAGE_ENCODING_SET: &AsciiSet = &CONTROLS.add(b'%');

// The longest integer allowed in a grpc-timeout value.
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;
const MAX_TIMEOUT_DIGITS: usize = 8;

mod b64 {
    use base64::{
        alphabet,
        engine::{
            DecodePaddingMode,
            general_purpose::{GeneralPurpose, GeneralPurposeConfig},
        },
    };

    pub(super) const STANDARD_NO_PAD: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new()
            .with_encode_padding(false)
            .with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
}

/// Errors produced when parsing a `grpc-timeout` value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutParseError {
    #[error("timeout string is too short: {0:?}")]
    TooShort(String),
    #[error("timeout string is too long: {0:?}")]
    TooLong(String),
    #[error("timeout unit is not recognized: {0:?}")]
    UnknownUnit(String),
    #[error("timeout value is not a decimal integer: {0:?}")]
    InvalidValue(String),
}

/// Percent-encodes a `grpc-message` value.
pub fn encode_grpc_message(message: &str) -> Cow<'_, str> {
    percent_encode(message.as_bytes(), GRPC_MESSAGE_ENCODING_SET).into()
}

/// Percent-encodes a message that may not be valid UTF-8.  Invalid sequences
/// are replaced by U+FFFD before encoding.
pub fn encode_grpc_message_bytes(message: &[u8]) -> String {
    encode_grpc_message(&String::from_utf8_lossy(message)).into_owned()
}

/// Decodes a `grpc-message` value.
///
/// Decoding never fails: malformed escapes are kept verbatim and any invalid
/// UTF-8 in the result is replaced by U+FFFD.
pub fn decode_grpc_message(value: &[u8]) -> String {
    percent_decode(value).decode_utf8_lossy().into_owned()
}

/// Reports whether values for `key` carry binary data.
pub fn is_binary_header(key: &str) -> bool {
    key.ends_with(BINARY_HEADER_SUFFIX)
}

/// Encodes a binary metadata value as unpadded base64.
pub fn encode_binary_header(value: &[u8]) -> String {
    b64::STANDARD_NO_PAD.encode(value)
}

/// Decodes a binary metadata value.  Padded and unpadded input are accepted.
pub fn decode_binary_header(value: &str) -> Result<Bytes, ::base64::DecodeError> {
    b64::STANDARD_NO_PAD.decode(value).map(Bytes::from)
}

/// Formats a timeout for the `grpc-timeout` header.
///
/// The smallest unit whose value fits in eight digits is used and the value is
/// rounded up, so the encoded timeout is never shorter than `timeout`.
/// Timeouts beyond `99999999H` are encoded as that.
pub fn encode_timeout(timeout: Duration) -> String {
    if timeout.is_zero() {
        return "0n".to_string();
    }
    let nanos = timeout.as_nanos();
    let units: [(u128, char); 5] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
    ];
    for (per_unit, unit) in units {
        let value = nanos.div_ceil(per_unit);
        if value <= MAX_TIMEOUT_VALUE {
            return format!("{value}{unit}");
        }
    }
    let hours = nanos.div_ceil(3_600_000_000_000).min(MAX_TIMEOUT_VALUE);
    format!("{hours}H")
}

/// Parses a `grpc-timeout` header value.
pub fn parse_timeout(value: &str) -> Result<Duration, TimeoutParseError> {
    if value.len() < 2 {
        return Err(TimeoutParseError::TooShort(value.to_string()));
    }
    if value.len() > MAX_TIMEOUT_DIGITS + 1 {
        return Err(TimeoutParseError::TooLong(value.to_string()));
    }
    let Some((digits, unit)) = value.split_at_checked(value.len() - 1) else {
        return Err(TimeoutParseError::UnknownUnit(value.to_string()));
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimeoutParseError::InvalidValue(value.to_string()));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|_| TimeoutParseError::InvalidValue(value.to_string()))?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return Err(TimeoutParseError::UnknownUnit(value.to_string())),
    };
    Ok(duration)
}

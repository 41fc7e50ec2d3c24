//! GATT payloads understood by the trap firmware.

use uuid::Uuid;

use crate::advertisement::decode_trigger_byte;
use crate::error::DecodeError;

/// Trigger state. Reads `0x01` when the trap has fired, write `0x00` to re-arm.
pub const TRIGGER_CHAR_UUID: Uuid = Uuid::from_u128(0x02ecc6cd_2b43_4db5_96e6_ede92cf8778d);

/// User visible device name, UTF-8.
pub const NAME_CHAR_UUID: Uuid = Uuid::from_u128(0x02ecc6cd_2b43_4db5_96e6_ede92cf8778b);

const RESET_COMMAND: [u8; 1] = [0x00];

/// The payload that re-arms a triggered trap. `0x01` is reserved for the
/// device itself and is never produced here.
pub fn encode_reset() -> Vec<u8> {
    RESET_COMMAND.to_vec()
}

/// Interpret a connected read of the trigger characteristic.
pub fn decode_trigger_characteristic(bytes: &[u8]) -> Result<bool, DecodeError> {
    match bytes.first() {
        Some(&byte) => decode_trigger_byte(byte),
        None => Err(DecodeError::Truncated { len: 0, needed: 1 }),
    }
}

/// Encode a name for the name characteristic. `max_len` is the characteristic
/// size in bytes, which depends on the device.
///
/// Fails with [`DecodeError::InvalidName`] when the name is longer than
/// `max_len` bytes or empty. An empty write would leave the trap without a
/// name to advertise.
pub fn encode_name(name: &str, max_len: usize) -> Result<Vec<u8>, DecodeError> {
    if name.is_empty() {
        return Err(DecodeError::InvalidName("name is empty".to_string()));
    }
    if name.len() > max_len {
        return Err(DecodeError::InvalidName(format!(
            "{} bytes exceeds the {} byte limit",
            name.len(),
            max_len
        )));
    }
    Ok(name.as_bytes().to_vec())
}

/// Decode the name characteristic. Trailing NUL padding is dropped and
/// invalid UTF-8 sequences are replaced rather than rejected.
pub fn decode_name(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

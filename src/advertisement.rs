//! Decoding of the trap's manufacturer-specific advertisement payload.
//!
//! Payload layout (after the 2-byte company id):
//!
//! Offset | Size | Meaning
//! 0      | 1    | Trigger flag, 0x00 = armed, 0x01 = triggered
//! 1      | 6    | Unused by the decoder
//! 7      | 2    | Raw battery code, little-endian

use crate::error::DecodeError;

/// Company identifiers the trap advertises under. The firmware puts `BB 0B`
/// on the air, which some stacks report byte-swapped.
pub const TRAP_COMPANY_IDS: [u16; 2] = [0x0BBB, 0xBB0B];

/// Minimum manufacturer payload length covering every field we read.
pub const MIN_PAYLOAD_LEN: usize = 9;

const TRIGGER_OFFSET: usize = 0;
const BATTERY_OFFSET: usize = 7;

const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Trap status carried by a single advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub triggered: bool,
    pub battery_raw: u16,
}

pub fn is_trap_company_id(company_id: u16) -> bool {
    TRAP_COMPANY_IDS.contains(&company_id)
}

/// Decode a manufacturer data payload keyed by `company_id`.
pub fn decode(manufacturer_data: &[u8], company_id: u16) -> Result<DeviceStatus, DecodeError> {
    if !is_trap_company_id(company_id) {
        return Err(DecodeError::NotThisDevice(company_id));
    }

    if manufacturer_data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::Truncated {
            len: manufacturer_data.len(),
            needed: MIN_PAYLOAD_LEN,
        });
    }

    let triggered = decode_trigger_byte(manufacturer_data[TRIGGER_OFFSET])?;
    let battery_raw = u16::from_le_bytes([
        manufacturer_data[BATTERY_OFFSET],
        manufacturer_data[BATTERY_OFFSET + 1],
    ]);

    Ok(DeviceStatus {
        triggered,
        battery_raw,
    })
}

/// Shared by the advertisement flag and the trigger characteristic.
pub(crate) fn decode_trigger_byte(byte: u8) -> Result<bool, DecodeError> {
    match byte {
        0x00 => Ok(false),
        0x01 => Ok(true),
        other => Err(DecodeError::UnknownTriggerByte(other)),
    }
}

/// Walk raw advertising data (`[len][type][data...]...`) and return the first
/// manufacturer specific entry as `(company_id, payload)`.
pub fn manufacturer_data_from_ad(ad: &[u8]) -> Option<(u16, &[u8])> {
    let mut i = 0;
    while i < ad.len() {
        let len = ad[i] as usize;
        if len == 0 || i + len >= ad.len() {
            break;
        }
        let ad_type = ad[i + 1];
        let data = &ad[i + 2..i + 1 + len];
        if ad_type == AD_TYPE_MANUFACTURER_DATA && data.len() >= 2 {
            let company_id = u16::from_le_bytes([data[0], data[1]]);
            return Some((company_id, &data[2..]));
        }
        i += len + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured from a trap in the field, full advertisement.
    const SAMPLE_AD: &str = "0201060303D6FC0DFFBB0B001AAC12030001B80100";

    fn payload(trigger: u8, battery_raw: u16) -> Vec<u8> {
        let [lo, hi] = battery_raw.to_le_bytes();
        vec![trigger, 0x1A, 0xAC, 0x12, 0x03, 0x00, 0x01, lo, hi, 0x00]
    }

    #[test]
    fn test_decode_sample_advertisement() {
        let ad = hex::decode(SAMPLE_AD).unwrap();
        let (company_id, data) = manufacturer_data_from_ad(&ad).unwrap();
        assert_eq!(company_id, 0x0BBB);
        assert_eq!(data.len(), 10);

        let status = decode(data, company_id).unwrap();
        assert!(!status.triggered);
        assert_eq!(status.battery_raw, 0x01B8);
    }

    #[test]
    fn test_decode_triggered() {
        let status = decode(&payload(0x01, 458), 0xBB0B).unwrap();
        assert_eq!(
            status,
            DeviceStatus {
                triggered: true,
                battery_raw: 458
            }
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let data = payload(0x01, 475);
        assert_eq!(decode(&data, 0x0BBB), decode(&data, 0x0BBB));
    }

    #[test]
    fn test_decode_rejects_other_company() {
        assert_eq!(
            decode(&payload(0x00, 440), 0x004C),
            Err(DecodeError::NotThisDevice(0x004C))
        );
    }

    #[test]
    fn test_decode_truncated() {
        let data = payload(0x00, 440);
        for len in 0..MIN_PAYLOAD_LEN {
            assert_eq!(
                decode(&data[..len], 0x0BBB),
                Err(DecodeError::Truncated { len, needed: 9 })
            );
        }
        assert!(decode(&data[..MIN_PAYLOAD_LEN], 0x0BBB).is_ok());
    }

    #[test]
    fn test_decode_unknown_trigger_byte() {
        assert_eq!(
            decode(&payload(0x02, 440), 0x0BBB),
            Err(DecodeError::UnknownTriggerByte(0x02))
        );
    }

    #[test]
    fn test_ad_without_manufacturer_data() {
        let ad = hex::decode("0201060303D6FC").unwrap();
        assert_eq!(manufacturer_data_from_ad(&ad), None);
        // Length byte pointing past the end of the buffer.
        let ad = hex::decode("0201060DFFBB0B00").unwrap();
        assert_eq!(manufacturer_data_from_ad(&ad), None);
    }
}

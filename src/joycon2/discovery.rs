//! Advertisement filter for automatic controller discovery

use std::collections::HashMap;

use crate::joycon2::constants::*;
use crate::joycon2::types::Side;

/// Classify a BLE advertisement by its manufacturer data.
///
/// Returns the controller side when the advertisement comes from a Joy-Con 2,
/// `None` for anything else (other Nintendo devices included).
pub fn classify_advertisement(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<Side> {
    let data = manufacturer_data.get(&NINTENDO_COMPANY_ID)?;

    if !data.starts_with(&JOYCON_DATA_PREFIX) {
        return None;
    }

    match *data.get(JOYCON_SIDE_BYTE_INDEX)? {
        JOYCON_LEFT_BYTE => Some(Side::Left),
        JOYCON_RIGHT_BYTE => Some(Side::Right),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(company: u16, data: &[u8]) -> HashMap<u16, Vec<u8>> {
        HashMap::from([(company, data.to_vec())])
    }

    #[test]
    fn classifies_both_sides() {
        let left = advert(0x0553, &[0x01, 0x00, 0x03, 0x7e, 0x05, 0x67, 0x00]);
        let right = advert(0x0553, &[0x01, 0x00, 0x03, 0x7e, 0x05, 0x66]);
        assert_eq!(classify_advertisement(&left), Some(Side::Left));
        assert_eq!(classify_advertisement(&right), Some(Side::Right));
    }

    #[test]
    fn rejects_other_devices() {
        // Pro controller style byte
        assert_eq!(classify_advertisement(&advert(0x0553, &[0x01, 0x00, 0x03, 0x7e, 0x05, 0x73])), None);
        // Truncated
        assert_eq!(classify_advertisement(&advert(0x0553, &[0x01, 0x00, 0x03, 0x7e, 0x05])), None);
        // Wrong prefix
        assert_eq!(classify_advertisement(&advert(0x0553, &[0x02, 0x00, 0x03, 0x7e, 0x05, 0x66])), None);
        // Wrong company
        assert_eq!(classify_advertisement(&advert(0x004C, &[0x01, 0x00, 0x03, 0x7e, 0x05, 0x66])), None);
        assert_eq!(classify_advertisement(&HashMap::new()), None);
    }
}

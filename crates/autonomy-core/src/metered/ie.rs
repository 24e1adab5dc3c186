//! Vendor-specific information elements advertised in beacons to hint
//! clients about metered connectivity. Layouts are byte-exact: Windows
//! and Apple clients parse these blindly, so every offset is frozen and
//! covered by round-trip tests.

use autonomy_common::models::MeteredMode;

/// IEEE vendor-specific element ID.
const IE_VENDOR: u8 = 0xdd;
/// Microsoft OUI.
pub const OUI_MICROSOFT: [u8; 3] = [0x00, 0x50, 0xf2];
/// Apple OUI.
pub const OUI_APPLE: [u8; 3] = [0x00, 0x17, 0xf2];

/// Microsoft vendor types after the OUI.
const MS_TYPE_NETWORK_COST: u8 = 0x11;
const MS_TYPE_TETHERING: u8 = 0x12;

/// Network Cost flag bytes (offset 4 of the payload).
const COST_FLAG_RESTRICTED: u8 = 0x00;
const COST_FLAG_APPROACHING_LIMIT: u8 = 0x08;
const COST_FLAG_OVER_LIMIT: u8 = 0x01;
/// Cost level "fixed" (offset 2); constant across all metered modes.
const COST_LEVEL_FIXED: u8 = 0x02;

/// One vendor IE: OUI plus payload, encodable to the raw element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorIe {
    pub oui: [u8; 3],
    pub payload: Vec<u8>,
}

impl VendorIe {
    /// Raw element bytes: `dd <len> <oui> <payload>`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 3 + self.payload.len());
        out.push(IE_VENDOR);
        out.push((3 + self.payload.len()) as u8);
        out.extend_from_slice(&self.oui);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Lowercase hex form, as hostapd's `vendor_elements=` expects.
    pub fn hex(&self) -> String {
        self.encode().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Microsoft Network Cost IE for a metered mode. `Off` and
/// `TetheredNoLimit` carry no cost element.
pub fn network_cost_ie(mode: MeteredMode) -> Option<VendorIe> {
    let flags = match mode {
        MeteredMode::Restricted => COST_FLAG_RESTRICTED,
        MeteredMode::NearCap => COST_FLAG_APPROACHING_LIMIT,
        MeteredMode::OverCap => COST_FLAG_OVER_LIMIT,
        MeteredMode::Off | MeteredMode::TetheredNoLimit => return None,
    };
    Some(VendorIe {
        oui: OUI_MICROSOFT,
        payload: vec![
            MS_TYPE_NETWORK_COST,
            0x00,
            COST_LEVEL_FIXED,
            0x00,
            flags,
            0x00,
            0x00,
            0x00,
        ],
    })
}

/// Parse a raw Network Cost element back to its mode. Round-trips
/// [`network_cost_ie`] exactly; anything else yields `None`.
pub fn parse_network_cost(raw: &[u8]) -> Option<MeteredMode> {
    if raw.len() != 13 || raw[0] != IE_VENDOR || raw[1] != 11 {
        return None;
    }
    if raw[2..5] != OUI_MICROSOFT || raw[5] != MS_TYPE_NETWORK_COST {
        return None;
    }
    match raw[9] {
        COST_FLAG_RESTRICTED => Some(MeteredMode::Restricted),
        COST_FLAG_APPROACHING_LIMIT => Some(MeteredMode::NearCap),
        COST_FLAG_OVER_LIMIT => Some(MeteredMode::OverCap),
        _ => None,
    }
}

/// Microsoft Tethering Identifier IE: 14-byte payload with the AP MAC in
/// the fixed trailing position.
pub fn tethering_ie(ap_mac: [u8; 6]) -> VendorIe {
    let mut payload = vec![MS_TYPE_TETHERING, 0x00, 0x00, 0x01, 0x00, 0x06, 0x00, 0x00];
    payload.extend_from_slice(&ap_mac);
    VendorIe {
        oui: OUI_MICROSOFT,
        payload,
    }
}

/// Apple metered-network IE: fixed 12-byte payload, advertised in every
/// mode other than `Off`.
pub fn apple_ie() -> VendorIe {
    VendorIe {
        oui: OUI_APPLE,
        payload: vec![
            0x06, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ],
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` into MAC bytes.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

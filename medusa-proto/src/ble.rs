//! BLE GATT Service Protocol Constants for Medusa WiFi Provisioning
//!
//! The sensor exposes one primary service with four characteristics. The
//! client writes SSID and PSK as raw UTF-8 (no length prefix), then a
//! single control byte, and polls the status characteristic.

/// Provisioning service UUID
pub const SERVICE_UUID: &str = "c0de0000-7e1a-4f83-bf3a-0c0ffee0c0de";

/// WiFi SSID Characteristic UUID (write)
pub const WIFI_SSID_UUID: &str = "c0de0001-7e1a-4f83-bf3a-0c0ffee0c0de";

/// WiFi PSK Characteristic UUID (write)
pub const WIFI_PSK_UUID: &str = "c0de0002-7e1a-4f83-bf3a-0c0ffee0c0de";

/// Control Characteristic UUID (write)
pub const CONTROL_UUID: &str = "c0de0003-7e1a-4f83-bf3a-0c0ffee0c0de";

/// Status Characteristic UUID (read)
pub const STATUS_UUID: &str = "c0de0004-7e1a-4f83-bf3a-0c0ffee0c0de";

/// Same UUIDs as 128-bit integers, for `Uuid::from_u128`
pub mod raw {
    pub const SERVICE: u128 = 0xc0de0000_7e1a_4f83_bf3a_0c0ffee0c0de;
    pub const WIFI_SSID: u128 = 0xc0de0001_7e1a_4f83_bf3a_0c0ffee0c0de;
    pub const WIFI_PSK: u128 = 0xc0de0002_7e1a_4f83_bf3a_0c0ffee0c0de;
    pub const CONTROL: u128 = 0xc0de0003_7e1a_4f83_bf3a_0c0ffee0c0de;
    pub const STATUS: u128 = 0xc0de0004_7e1a_4f83_bf3a_0c0ffee0c0de;
}

/// Control bytes written to the control characteristic
pub mod control {
    /// Join the network using the SSID/PSK written so far
    pub const CONNECT: u8 = 0x01;

    /// Forget the pending SSID/PSK
    pub const CLEAR: u8 = 0x02;

    /// Wipe stored credentials and bonds, then reboot
    pub const FACTORY_RESET: u8 = 0x03;
}

/// Status bytes reported by the status characteristic
pub mod status {
    pub const IDLE: u8 = 0x01;
    pub const PAIRING: u8 = 0x02;
    pub const READY: u8 = 0x03;
    pub const CONNECTING: u8 = 0x04;
    pub const AUTHENTICATING: u8 = 0x05;
    pub const OBTAINING_IP: u8 = 0x06;
    pub const SUCCESS: u8 = 0x07;
    pub const FAIL_PAIRING: u8 = 0xF0;
    pub const FAIL_AUTH: u8 = 0xF1;
    pub const FAIL_NETWORK: u8 = 0xF2;
    pub const FAIL_INTERNAL: u8 = 0xFF;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_u128(s: &str) -> u128 {
        u128::from_str_radix(&s.replace('-', ""), 16).unwrap()
    }

    #[test]
    fn raw_uuids_match_strings() {
        assert_eq!(to_u128(SERVICE_UUID), raw::SERVICE);
        assert_eq!(to_u128(WIFI_SSID_UUID), raw::WIFI_SSID);
        assert_eq!(to_u128(WIFI_PSK_UUID), raw::WIFI_PSK);
        assert_eq!(to_u128(CONTROL_UUID), raw::CONTROL);
        assert_eq!(to_u128(STATUS_UUID), raw::STATUS);
    }
}

//! Provisioning service layout and handle resolution

use uuid::Uuid;

use medusa_proto::ble::raw;

use crate::radio::{CharacteristicProps, GattService, WriteKind};

pub const SERVICE: Uuid = Uuid::from_u128(raw::SERVICE);
pub const WIFI_SSID: Uuid = Uuid::from_u128(raw::WIFI_SSID);
pub const WIFI_PSK: Uuid = Uuid::from_u128(raw::WIFI_PSK);
pub const CONTROL: Uuid = Uuid::from_u128(raw::CONTROL);
pub const STATUS: Uuid = Uuid::from_u128(raw::STATUS);

/// One of the four provisioning characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Ssid,
    Psk,
    Control,
    Status,
}

impl Characteristic {
    pub const ALL: [Characteristic; 4] = [
        Characteristic::Ssid,
        Characteristic::Psk,
        Characteristic::Control,
        Characteristic::Status,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::Ssid => WIFI_SSID,
            Characteristic::Psk => WIFI_PSK,
            Characteristic::Control => CONTROL,
            Characteristic::Status => STATUS,
        }
    }
}

impl std::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Characteristic::Ssid => "wifi ssid",
            Characteristic::Psk => "wifi psk",
            Characteristic::Control => "control",
            Characteristic::Status => "status",
        })
    }
}

/// A resolved characteristic on a specific connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProps,
}

impl CharacteristicRef {
    /// Write-with-response whenever the characteristic advertises it
    pub fn write_kind(&self) -> WriteKind {
        if self.properties.write || !self.properties.write_without_response {
            WriteKind::WithResponse
        } else {
            WriteKind::WithoutResponse
        }
    }
}

/// The four characteristics of one discovery pass, bound to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandles {
    ssid: CharacteristicRef,
    psk: CharacteristicRef,
    control: CharacteristicRef,
    status: CharacteristicRef,
    epoch: u64,
}

impl ServiceHandles {
    pub fn get(&self, which: Characteristic) -> &CharacteristicRef {
        match which {
            Characteristic::Ssid => &self.ssid,
            Characteristic::Psk => &self.psk,
            Characteristic::Control => &self.control,
            Characteristic::Status => &self.status,
        }
    }

    /// The connection these handles were discovered on
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    ServiceNotFound,
    CharacteristicMissing(Characteristic),
}

/// Locate the provisioning service and its four characteristics
///
/// UUIDs arrive already canonical from the radio boundary, so this is a
/// plain value comparison.
pub(crate) fn resolve(services: &[GattService], epoch: u64) -> Result<ServiceHandles, Resolution> {
    let service = services
        .iter()
        .find(|s| s.uuid == SERVICE)
        .ok_or(Resolution::ServiceNotFound)?;

    let find = |which: Characteristic| {
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == which.uuid())
            .map(|c| CharacteristicRef {
                service: service.uuid,
                uuid: c.uuid,
                properties: c.properties,
            })
            .ok_or(Resolution::CharacteristicMissing(which))
    };

    Ok(ServiceHandles {
        ssid: find(Characteristic::Ssid)?,
        psk: find(Characteristic::Psk)?,
        control: find(Characteristic::Control)?,
        status: find(Characteristic::Status)?,
        epoch,
    })
}

/// The service table a conforming sensor exposes
pub fn provisioning_service() -> GattService {
    let write = CharacteristicProps { write: true, ..Default::default() };
    let read = CharacteristicProps { read: true, notify: true, ..Default::default() };
    GattService {
        uuid: SERVICE,
        characteristics: vec![
            crate::radio::GattCharacteristic { uuid: WIFI_SSID, properties: write },
            crate::radio::GattCharacteristic { uuid: WIFI_PSK, properties: write },
            crate::radio::GattCharacteristic { uuid: CONTROL, properties: write },
            crate::radio::GattCharacteristic { uuid: STATUS, properties: read },
        ],
    }
}

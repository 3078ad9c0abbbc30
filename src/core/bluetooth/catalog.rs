//! Static registry of the services and characteristics a G7 transmitter exposes.

use uuid::Uuid;

use crate::core::bluetooth::constants::*;

/// GATT services known to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    DeviceInfo,
    Advertisement,
    Cgm,
    ServiceB,
}

impl Service {
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::DeviceInfo => UUID_DEVICE_INFORMATION_SERVICE,
            Self::Advertisement => UUID_ADVERTISEMENT_SERVICE,
            Self::Cgm => UUID_CGM_SERVICE,
            Self::ServiceB => UUID_SERVICE_B,
        }
    }
}

/// Logical endpoints (characteristics) known to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ManufacturerName,
    Communication,
    Control,
    Authentication,
    Backfill,
    CharacteristicE,
    CharacteristicF,
}

impl Endpoint {
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::ManufacturerName => UUID_MANUFACTURER_NAME,
            Self::Communication => UUID_COMMUNICATION_CHAR,
            Self::Control => UUID_CONTROL_CHAR,
            Self::Authentication => UUID_AUTHENTICATION_CHAR,
            Self::Backfill => UUID_BACKFILL_CHAR,
            Self::CharacteristicE => UUID_CHARACTERISTIC_E,
            Self::CharacteristicF => UUID_CHARACTERISTIC_F,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        lookup(uuid).map(|descriptor| descriptor.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Notify,
    Indicate,
}

/// One characteristic of one service, with the ways it may be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub service: Service,
    pub endpoint: Endpoint,
    pub access: &'static [AccessMode],
}

impl EndpointDescriptor {
    pub const fn service_id(&self) -> Uuid {
        self.service.uuid()
    }

    pub const fn characteristic_id(&self) -> Uuid {
        self.endpoint.uuid()
    }

    pub fn supports(&self, mode: AccessMode) -> bool {
        self.access.contains(&mode)
    }

    /// True when the endpoint pushes values (notify or indicate).
    pub fn is_subscribable(&self) -> bool {
        self.supports(AccessMode::Notify) || self.supports(AccessMode::Indicate)
    }
}

const CATALOG: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        service: Service::DeviceInfo,
        endpoint: Endpoint::ManufacturerName,
        access: &[AccessMode::Read],
    },
    EndpointDescriptor {
        service: Service::Cgm,
        endpoint: Endpoint::Communication,
        access: &[AccessMode::Read, AccessMode::Notify],
    },
    EndpointDescriptor {
        service: Service::Cgm,
        endpoint: Endpoint::Control,
        access: &[AccessMode::Write, AccessMode::Indicate],
    },
    EndpointDescriptor {
        service: Service::Cgm,
        endpoint: Endpoint::Authentication,
        access: &[AccessMode::Write, AccessMode::Indicate],
    },
    EndpointDescriptor {
        service: Service::Cgm,
        endpoint: Endpoint::Backfill,
        access: &[AccessMode::Read, AccessMode::Write, AccessMode::Notify],
    },
    EndpointDescriptor {
        service: Service::ServiceB,
        endpoint: Endpoint::CharacteristicE,
        access: &[AccessMode::Write, AccessMode::Indicate],
    },
    EndpointDescriptor {
        service: Service::ServiceB,
        endpoint: Endpoint::CharacteristicF,
        access: &[AccessMode::Read, AccessMode::Write, AccessMode::Notify],
    },
];

/// All endpoints of a service. Unknown services have none.
pub fn endpoints_for(service_id: Uuid) -> Vec<&'static EndpointDescriptor> {
    CATALOG
        .iter()
        .filter(|descriptor| descriptor.service_id() == service_id)
        .collect()
}

/// Endpoints of a service that must be subscribed to.
pub fn subscribable(service_id: Uuid) -> Vec<&'static EndpointDescriptor> {
    endpoints_for(service_id)
        .into_iter()
        .filter(|descriptor| descriptor.is_subscribable())
        .collect()
}

pub fn lookup(characteristic_id: Uuid) -> Option<&'static EndpointDescriptor> {
    CATALOG
        .iter()
        .find(|descriptor| descriptor.characteristic_id() == characteristic_id)
}

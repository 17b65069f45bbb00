/// Application signals raised by the Zigbee stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSignal {
    SkipStartup,
    DeviceFirstStart,
    DeviceReboot,
    Steering,
    Other(u32),
}

impl AppSignal {
    pub const SKIP_STARTUP: u32 = 0x01;
    pub const DEVICE_FIRST_START: u32 = 0x05;
    pub const DEVICE_REBOOT: u32 = 0x06;
    pub const STEERING: u32 = 0x0A;

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::SKIP_STARTUP => Self::SkipStartup,
            Self::DEVICE_FIRST_START => Self::DeviceFirstStart,
            Self::DEVICE_REBOOT => Self::DeviceReboot,
            Self::STEERING => Self::Steering,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::SkipStartup => Self::SKIP_STARTUP,
            Self::DeviceFirstStart => Self::DEVICE_FIRST_START,
            Self::DeviceReboot => Self::DEVICE_REBOOT,
            Self::Steering => Self::STEERING,
            Self::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self.code() {
            0x00 => "ZDO_SIGNAL_DEFAULT_START",
            0x01 => "ZDO_SIGNAL_SKIP_STARTUP",
            0x02 => "ZDO_SIGNAL_DEVICE_ANNCE",
            0x03 => "ZDO_SIGNAL_LEAVE",
            0x04 => "ZDO_SIGNAL_ERROR",
            0x05 => "BDB_SIGNAL_DEVICE_FIRST_START",
            0x06 => "BDB_SIGNAL_DEVICE_REBOOT",
            0x0A => "BDB_SIGNAL_STEERING",
            0x0B => "BDB_SIGNAL_FORMATION",
            0x16 => "NWK_SIGNAL_PERMIT_JOIN_STATUS",
            0x1C => "ZDO_SIGNAL_PRODUCTION_CONFIG_READY",
            0x22 => "COMMON_SIGNAL_CAN_SLEEP",
            _ => "UNKNOWN_SIGNAL",
        }
    }
}

/// BDB top level commissioning modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningMode {
    Initialization,
    NetworkSteering,
}

impl CommissioningMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Initialization => 0x00,
            Self::NetworkSteering => 0x02,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Initialization),
            0x02 => Some(Self::NetworkSteering),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [0x01, 0x05, 0x06, 0x0A, 0x17] {
            assert_eq!(AppSignal::from_code(code).code(), code);
        }
        assert_eq!(AppSignal::from_code(0x0A), AppSignal::Steering);
        assert_eq!(AppSignal::from_code(0x03), AppSignal::Other(0x03));
        assert_eq!(AppSignal::Other(0x03).name(), "ZDO_SIGNAL_LEAVE");
        assert_eq!(AppSignal::Other(0xFF).name(), "UNKNOWN_SIGNAL");
    }

    #[test]
    fn commissioning_mode_codes() {
        assert_eq!(
            CommissioningMode::from_code(CommissioningMode::NetworkSteering.code()),
            Some(CommissioningMode::NetworkSteering)
        );
        assert_eq!(CommissioningMode::from_code(0x04), None);
    }
}

use embedded_hal::i2c::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("i2c transaction failed: {0:?}")]
    Bus(ErrorKind),
    #[error("sensor reports uncalibrated state (status {0:#04x})")]
    NotCalibrated(u8),
    #[error("measurement still busy (status {0:#04x})")]
    Busy(u8),
    #[error("frame checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Crc { expected: u8, actual: u8 },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("i2c bus configuration failed: {0}")]
    BusConfig(String),
    #[error("sensor handshake failed")]
    DeviceInit(#[source] SensorError),
    #[error("sensor read failed")]
    Read(#[source] SensorError),
    #[error("poll interval must be at least one second")]
    InvalidInterval,
    #[error("backoff cap of {max_delay_seconds}s is below the {interval_seconds}s poll interval")]
    InvalidBackoffCap {
        max_delay_seconds: u16,
        interval_seconds: u16,
    },
    #[error("light output init failed")]
    Light(#[source] StackError),
    #[error("failed to spawn poll task")]
    Spawn(#[source] std::io::Error),
}

/// Status reported by the Zigbee stack, mirroring `esp_err_t`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name} ({code:#x})")]
pub struct StackError {
    pub code: i32,
    pub name: String,
}

impl StackError {
    pub const FAIL: i32 = -1;
    pub const INVALID_ARG: i32 = 0x102;
    pub const INVALID_STATE: i32 = 0x103;
    pub const TIMEOUT: i32 = 0x107;

    pub fn new(code: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
        }
    }

    pub fn fail() -> Self {
        Self::new(Self::FAIL, "ESP_FAIL")
    }

    pub fn invalid_arg() -> Self {
        Self::new(Self::INVALID_ARG, "ESP_ERR_INVALID_ARG")
    }
}

/// Outcome attached to every stack signal.
pub type SignalStatus = Result<(), StackError>;

pub fn status_name(status: &SignalStatus) -> &str {
    match status {
        Ok(()) => "ESP_OK",
        Err(err) => err.name.as_str(),
    }
}

pub mod aht20;
pub mod config;
pub mod error;
pub mod poller;
pub mod sim;
pub mod types;
pub mod zigbee;

pub use aht20::Aht20;
pub use config::{
    I2cBusConfig, LightConfig, PollConfig, ReadFailurePolicy, RuntimeConfig, ZigbeeConfig,
};
pub use error::{DriverError, SensorError, SignalStatus, StackError};
pub use poller::{
    driver_init, Clock, PollStats, Poller, PollerHandle, ReadingCallback, Sensor, SystemClock,
};
pub use types::SensorReading;

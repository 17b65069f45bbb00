//! Glue between the sensor and the vendor Zigbee stack.
//!
//! The stack itself (ZCL, BDB commissioning, reporting) stays behind
//! [`ZigbeeStack`] and [`AttributeStore`]; this module only decides what to do
//! with its signals and what to write into its attribute tables.

pub mod attribute;
pub mod cluster;
pub mod commissioning;
pub mod publisher;
pub mod signal;

use std::{fmt, time::Duration};

use crate::error::StackError;

pub use attribute::{
    ActionDispatcher, AttributeHandler, AttributeWrite, CoreAction, LightHandler, LightOutput,
    LightSlot,
};
pub use cluster::{AttributeValue, ClusterRole, EndpointDescriptor};
pub use commissioning::{start_drivers, Commissioner, CommissioningState, DeferredInit};
pub use publisher::MeasurementPublisher;
pub use signal::{AppSignal, CommissioningMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkInfo {
    /// Little-endian, as the stack stores it.
    pub extended_pan_id: [u8; 8],
    pub pan_id: u16,
    pub channel: u8,
    pub short_address: u16,
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extended PAN ID: ")?;
        for (index, byte) in self.extended_pan_id.iter().rev().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        write!(
            f,
            ", PAN ID: {:#06x}, Channel:{}, Short Address: {:#06x}",
            self.pan_id, self.channel, self.short_address
        )
    }
}

/// Commissioning controls of the stack. Called from the stack task only.
pub trait ZigbeeStack {
    fn start_commissioning(&mut self, mode: CommissioningMode) -> Result<(), StackError>;

    /// Starts `mode` after `delay` on the stack's own scheduler.
    fn schedule_commissioning(&mut self, mode: CommissioningMode, delay: Duration);

    fn is_factory_new(&self) -> bool;

    fn network_info(&self) -> NetworkInfo;
}

/// Attribute tables of the registered endpoint. Safe to call from any task.
pub trait AttributeStore: Send + Sync {
    fn set_attribute(
        &self,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Result<(), StackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_info_prints_pan_id_most_significant_first() {
        let info = NetworkInfo {
            extended_pan_id: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            pan_id: 0x1a62,
            channel: 11,
            short_address: 0x4c3e,
        };

        let expected = concat!(
            "Extended PAN ID: 08:07:06:05:04:03:02:01, ",
            "PAN ID: 0x1a62, Channel:11, Short Address: 0x4c3e"
        );
        assert_eq!(info.to_string(), expected);
    }
}

use std::sync::Arc;

use log::warn;

use crate::{error::StackError, poller::ReadingCallback};

use super::{
    cluster::{
        humidity_to_zcl, temperature_to_zcl, AttributeValue, ATTR_MEASURED_VALUE,
        CLUSTER_RELATIVE_HUMIDITY, CLUSTER_TEMPERATURE_MEASUREMENT,
    },
    AttributeStore,
};

/// Writes sensor values into the measurement clusters; the stack's reporting
/// takes it from there.
pub struct MeasurementPublisher<A> {
    store: Arc<A>,
    endpoint: u8,
}

impl<A> MeasurementPublisher<A>
where
    A: AttributeStore + 'static,
{
    pub fn new(store: Arc<A>, endpoint: u8) -> Self {
        Self { store, endpoint }
    }

    pub fn publish(&self, temperature: f32, humidity: f32) -> Result<(), StackError> {
        self.store.set_attribute(
            self.endpoint,
            CLUSTER_TEMPERATURE_MEASUREMENT,
            ATTR_MEASURED_VALUE,
            AttributeValue::I16(temperature_to_zcl(temperature)),
        )?;
        self.store.set_attribute(
            self.endpoint,
            CLUSTER_RELATIVE_HUMIDITY,
            ATTR_MEASURED_VALUE,
            AttributeValue::U16(humidity_to_zcl(humidity)),
        )
    }

    pub fn into_callback(self) -> ReadingCallback {
        Box::new(move |temperature, humidity| {
            if let Err(err) = self.publish(temperature, humidity) {
                warn!("failed to update measurement attributes: {err}");
            }
        })
    }
}

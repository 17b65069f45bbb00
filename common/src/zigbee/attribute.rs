use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::error::StackError;

use super::cluster::{AttributeValue, ATTR_ON_OFF, CLUSTER_ON_OFF};

/// ZCL status byte for a successful write.
pub const ZCL_STATUS_SUCCESS: u8 = 0x00;

/// An attribute write the coordinator applied to one of our clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeWrite {
    pub status: u8,
    pub endpoint: u8,
    pub cluster: u16,
    pub attribute: u16,
    pub value: AttributeValue,
}

/// Core action callbacks the stack hands to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreAction {
    SetAttributeValue(AttributeWrite),
    Other(u32),
}

impl CoreAction {
    pub const SET_ATTR_VALUE_CB_ID: u32 = 0x0000;
}

pub trait AttributeHandler {
    fn on_attribute_write(&mut self, write: &AttributeWrite) -> Result<(), StackError>;
}

pub trait LightOutput {
    fn set_power(&mut self, on: bool) -> Result<(), StackError>;
}

pub struct ActionDispatcher<H> {
    handler: H,
}

impl<H> ActionDispatcher<H>
where
    H: AttributeHandler,
{
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handle(&mut self, action: &CoreAction) -> Result<(), StackError> {
        match action {
            CoreAction::SetAttributeValue(write) => self.handler.on_attribute_write(write),
            CoreAction::Other(id) => {
                warn!("Receive Zigbee action({id:#x}) callback");
                Ok(())
            }
        }
    }
}

/// Drives the light from the On/Off cluster of one endpoint.
pub struct LightHandler<O> {
    endpoint: u8,
    output: O,
    power: bool,
}

impl<O> LightHandler<O>
where
    O: LightOutput,
{
    pub fn new(endpoint: u8, output: O) -> Self {
        Self {
            endpoint,
            output,
            power: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.power
    }

    pub fn output(&self) -> &O {
        &self.output
    }
}

impl<O> AttributeHandler for LightHandler<O>
where
    O: LightOutput,
{
    fn on_attribute_write(&mut self, write: &AttributeWrite) -> Result<(), StackError> {
        if write.status != ZCL_STATUS_SUCCESS {
            warn!("Received message: error status({:#x})", write.status);
            return Err(StackError::invalid_arg());
        }

        info!(
            "Received message: endpoint({}), cluster({:#x}), attribute({:#x}), data size({})",
            write.endpoint,
            write.cluster,
            write.attribute,
            value_size(&write.value)
        );

        if write.endpoint != self.endpoint || write.cluster != CLUSTER_ON_OFF {
            return Ok(());
        }

        match (write.attribute, &write.value) {
            (ATTR_ON_OFF, AttributeValue::Bool(on)) => {
                info!("Light sets to {}", if *on { "On" } else { "Off" });
                self.output.set_power(*on)?;
                self.power = *on;
                Ok(())
            }
            (attribute, value) => {
                warn!("ignoring on/off attribute {attribute:#x} with value {value:?}");
                Ok(())
            }
        }
    }
}

/// On/Off dispatch for a light output that the deferred driver init installs.
/// Actions arriving before the output exists are acknowledged and dropped.
pub struct LightSlot<O> {
    dispatcher: Mutex<Option<ActionDispatcher<LightHandler<O>>>>,
}

impl<O> LightSlot<O> {
    pub const fn new() -> Self {
        Self {
            dispatcher: Mutex::new(None),
        }
    }
}

impl<O> Default for LightSlot<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> LightSlot<O>
where
    O: LightOutput,
{
    pub fn install(&self, endpoint: u8, output: O) {
        *self.lock() = Some(ActionDispatcher::new(LightHandler::new(endpoint, output)));
        info!("light output ready on endpoint {endpoint}");
    }

    pub fn is_installed(&self) -> bool {
        self.lock().is_some()
    }

    pub fn is_on(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|dispatcher| dispatcher.handler().is_on())
    }

    pub fn handle(&self, action: &CoreAction) -> Result<(), StackError> {
        match self.lock().as_mut() {
            Some(dispatcher) => dispatcher.handle(action),
            None => {
                warn!("light output not initialized, dropping {action:?}");
                Ok(())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActionDispatcher<LightHandler<O>>>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn value_size(value: &AttributeValue) -> usize {
    match value {
        AttributeValue::Bool(_) | AttributeValue::U8(_) => 1,
        AttributeValue::I16(_) | AttributeValue::U16(_) => 2,
        AttributeValue::CharString(bytes) => bytes.len(),
    }
}

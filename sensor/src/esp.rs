use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use anyhow::{anyhow, Context};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, Level, Output, OutputPin, PinDriver},
    i2c::{I2cConfig, I2cDriver, I2C0},
    peripherals::Peripherals,
    units::Hertz,
};
use esp_idf_svc::{
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
};
use log::{info, warn};

use zb_climate_common::{
    driver_init,
    zigbee::{start_drivers, DeferredInit, LightOutput, MeasurementPublisher},
    Aht20, DriverError, I2cBusConfig, LightConfig, PollerHandle, RuntimeConfig, StackError,
};

use crate::zigbee::{self, EspAttributeStore, LIGHT};

const NVS_NAMESPACE: &str = "zb_node";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const ZIGBEE_TASK_NAME: &str = "Zigbee_main";
const ZIGBEE_TASK_STACK: usize = 8 * 1024;

// Board wiring.
const I2C_SDA_GPIO: i32 = 6;
const I2C_SCL_GPIO: i32 = 7;
const LIGHT_GPIO: i32 = 8;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub struct GpioLight {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_low: bool,
}

impl GpioLight {
    fn new(pin: AnyOutputPin, config: &LightConfig) -> Result<Self, StackError> {
        if config.gpio != LIGHT_GPIO {
            warn!(
                "light configured on gpio {} but wired to gpio {LIGHT_GPIO}",
                config.gpio
            );
            return Err(StackError::invalid_arg());
        }

        let mut light = Self {
            pin: PinDriver::output(pin).map_err(stack_error)?,
            active_low: config.active_low,
        };
        light.set_power(false)?;
        Ok(light)
    }
}

impl LightOutput for GpioLight {
    fn set_power(&mut self, on: bool) -> Result<(), StackError> {
        let level = Level::from(on != self.active_low);
        self.pin.set_level(level).map_err(stack_error)
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition,
        lock: Arc::new(Mutex::new(())),
    };

    let runtime = match nvs_store.load_runtime_config() {
        Ok((runtime, needs_save)) => {
            if needs_save {
                if let Err(err) = nvs_store.save_runtime_config(&runtime) {
                    warn!("failed to persist runtime config: {err:#}");
                }
            }
            runtime
        }
        Err(err) => {
            warn!("failed to load runtime config from NVS: {err:#}");
            RuntimeConfig::default()
        }
    };

    let Peripherals { i2c0, pins, .. } = Peripherals::take()?;
    let sda = pins.gpio6.downgrade();
    let scl = pins.gpio7.downgrade();
    let light_pin = pins.gpio8.downgrade_output();

    let poller: Arc<Mutex<Option<PollerHandle>>> = Arc::new(Mutex::new(None));
    let deferred_init: DeferredInit = {
        let poll = runtime.poll.clone();
        let i2c_config = runtime.i2c.clone();
        let light_config = runtime.light.clone();
        let endpoint = runtime.zigbee.endpoint;
        let poller = poller.clone();
        Box::new(move || {
            start_drivers(
                || {
                    let light =
                        GpioLight::new(light_pin, &light_config).map_err(DriverError::Light)?;
                    LIGHT.install(endpoint, light);
                    Ok(())
                },
                || {
                    let publisher =
                        MeasurementPublisher::new(Arc::new(EspAttributeStore), endpoint);
                    let handle = driver_init(poll, Some(publisher.into_callback()), move || {
                        open_aht20(i2c0, sda, scl, &i2c_config)
                    })?;
                    *poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                    Ok(())
                },
            )
        })
    };

    zigbee::configure_platform().context("zigbee platform config failed")?;

    let zigbee_config = runtime.zigbee.clone();
    let zigbee_task = thread::Builder::new()
        .name(ZIGBEE_TASK_NAME.to_string())
        .stack_size(ZIGBEE_TASK_STACK)
        .spawn(move || {
            if let Err(err) = zigbee::run_stack(&zigbee_config, deferred_init) {
                warn!("zigbee stack stopped: {err:#}");
            }
        })
        .context("failed to spawn zigbee task")?;

    info!("zigbee task started");
    zigbee_task
        .join()
        .map_err(|_| anyhow!("zigbee task panicked"))?;
    Err(anyhow!("zigbee main loop returned"))
}

/// Configures I2C0 on the wired pins and performs the AHT20 handshake.
fn open_aht20(
    i2c: I2C0,
    sda: AnyIOPin,
    scl: AnyIOPin,
    config: &I2cBusConfig,
) -> Result<Aht20<I2cDriver<'static>, FreeRtos>, DriverError> {
    if config.port != 0 {
        return Err(DriverError::BusConfig(format!(
            "i2c port {} is not available, only port 0 is wired",
            config.port
        )));
    }
    if (config.sda_pin, config.scl_pin) != (I2C_SDA_GPIO, I2C_SCL_GPIO) {
        return Err(DriverError::BusConfig(format!(
            "sda {} / scl {} do not match the wired sda {I2C_SDA_GPIO} / scl {I2C_SCL_GPIO}",
            config.sda_pin, config.scl_pin
        )));
    }

    let bus_config = I2cConfig::new()
        .baudrate(Hertz(config.frequency_hz))
        .sda_enable_pullup(config.internal_pullups)
        .scl_enable_pullup(config.internal_pullups);

    let driver = I2cDriver::new(i2c, sda, scl, &bus_config)
        .map_err(|err| DriverError::BusConfig(format!("i2c driver install: {err}")))?;

    let mut sensor = Aht20::new(driver, FreeRtos, config.address);
    sensor.init().map_err(DriverError::DeviceInit)?;
    info!(
        "aht20 ready on i2c{} (sda {}, scl {}, {} Hz)",
        config.port, config.sda_pin, config.scl_pin, config.frequency_hz
    );
    Ok(sensor)
}

pub fn stack_error(err: EspError) -> StackError {
    StackError::new(err.code(), err.to_string())
}

impl NvsStore {
    /// Returns the sanitized config and whether NVS should be rewritten: the
    /// document was missing or sanitizing changed it.
    fn load_runtime_config(&self) -> anyhow::Result<(RuntimeConfig, bool)> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        let Some(stored) = nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? else {
            return Ok((RuntimeConfig::default(), true));
        };

        Ok(RuntimeConfig::from_stored_json(stored)?)
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        info!("runtime config persisted to NVS");
        Ok(())
    }
}

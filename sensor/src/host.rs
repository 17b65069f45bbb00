use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use zb_climate_common::{
    driver_init,
    sim::{SimulatedAht20, StdDelay},
    types::AHT20_FULL_SCALE,
    zigbee::{
        attribute::ZCL_STATUS_SUCCESS,
        cluster::{ATTR_ON_OFF, CLUSTER_ON_OFF},
        start_drivers, AppSignal, AttributeStore, AttributeValue, AttributeWrite, Commissioner,
        CommissioningMode, CoreAction, DeferredInit, EndpointDescriptor, LightOutput, LightSlot,
        MeasurementPublisher, NetworkInfo, ZigbeeStack,
    },
    Aht20, DriverError, I2cBusConfig, LightConfig, PollerHandle, RuntimeConfig, SignalStatus,
    StackError,
};

enum StackEvent {
    Signal(AppSignal, SignalStatus),
    Commission(CommissioningMode),
    RetryDue(CommissioningMode),
    Action(CoreAction),
}

struct SimulatedStack {
    events: UnboundedSender<StackEvent>,
    factory_new: bool,
}

impl ZigbeeStack for SimulatedStack {
    fn start_commissioning(&mut self, mode: CommissioningMode) -> Result<(), StackError> {
        self.events
            .send(StackEvent::Commission(mode))
            .map_err(|_| StackError::new(StackError::INVALID_STATE, "ESP_ERR_INVALID_STATE"))
    }

    fn schedule_commissioning(&mut self, mode: CommissioningMode, delay: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(StackEvent::RetryDue(mode));
        });
    }

    fn is_factory_new(&self) -> bool {
        self.factory_new
    }

    fn network_info(&self) -> NetworkInfo {
        NetworkInfo {
            extended_pan_id: [0x3e, 0x7a, 0x11, 0xfe, 0xff, 0x2c, 0x8b, 0x00],
            pan_id: 0x1a62,
            channel: 15,
            short_address: 0x4c3e,
        }
    }
}

/// Attribute tables of the simulated endpoint; a changed value stands in for
/// an attribute report to the coordinator.
struct SimulatedAttributes {
    table: Mutex<HashMap<(u8, u16, u16), AttributeValue>>,
}

impl SimulatedAttributes {
    fn register(endpoint: &EndpointDescriptor) -> Self {
        let table = endpoint
            .clusters
            .iter()
            .flat_map(|cluster| {
                cluster.attributes.iter().map(move |attribute| {
                    (
                        (endpoint.endpoint, cluster.id, attribute.id),
                        attribute.value.clone(),
                    )
                })
            })
            .collect();
        Self {
            table: Mutex::new(table),
        }
    }
}

impl AttributeStore for SimulatedAttributes {
    fn set_attribute(
        &self,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Result<(), StackError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = table.get_mut(&(endpoint, cluster, attribute)) else {
            return Err(StackError::new(0x86, "ZCL_STATUS_UNSUPPORTED_ATTRIB"));
        };

        if *slot != value {
            info!("report ep {endpoint} cluster {cluster:#06x} attr {attribute:#06x}: {value:?}");
            *slot = value;
        }
        Ok(())
    }
}

struct LogLight;

impl LogLight {
    fn open(config: &LightConfig, fail: bool) -> Result<Self, StackError> {
        if fail {
            return Err(StackError::new(StackError::INVALID_STATE, "ESP_ERR_INVALID_STATE"));
        }
        info!("[light] gpio {} (active low: {})", config.gpio, config.active_low);
        Ok(Self)
    }
}

impl LightOutput for LogLight {
    fn set_power(&mut self, on: bool) -> Result<(), StackError> {
        info!("[light] {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config();
    let steering_failures = env_number::<u32>("SIM_STEERING_FAILURES").unwrap_or(2);
    let toggle_secs = env_number::<u64>("SIM_TOGGLE_SECS").unwrap_or(15).max(1);
    let factory_new = std::env::var("SIM_REBOOT").is_err();
    let light_fails = std::env::var("SIM_LIGHT_FAIL").is_ok();

    let endpoint = EndpointDescriptor::from_config(&runtime.zigbee);
    let attributes = Arc::new(SimulatedAttributes::register(&endpoint));
    info!(
        "registered endpoint {} with {} clusters",
        endpoint.endpoint,
        endpoint.clusters.len()
    );
    debug!(
        "endpoint layout: {}",
        serde_json::to_string(&endpoint).context("failed to serialize endpoint layout")?
    );

    let (events, mut event_rx) = mpsc::unbounded_channel();
    let poller: Arc<Mutex<Option<PollerHandle>>> = Arc::new(Mutex::new(None));
    let light: Arc<LightSlot<LogLight>> = Arc::new(LightSlot::new());

    let deferred_init: DeferredInit = {
        let poll = runtime.poll.clone();
        let i2c = runtime.i2c.clone();
        let light_config = runtime.light.clone();
        let endpoint_id = endpoint.endpoint;
        let publisher = MeasurementPublisher::new(attributes.clone(), endpoint_id);
        let poller = poller.clone();
        let light = light.clone();
        Box::new(move || {
            start_drivers(
                || {
                    let output =
                        LogLight::open(&light_config, light_fails).map_err(DriverError::Light)?;
                    light.install(endpoint_id, output);
                    Ok(())
                },
                || {
                    let handle = driver_init(poll, Some(publisher.into_callback()), move || {
                        open_simulated_sensor(&i2c)
                    })?;
                    *poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                    Ok(())
                },
            )
        })
    };

    let stack = SimulatedStack {
        events: events.clone(),
        factory_new,
    };
    let mut commissioner = Commissioner::new(
        stack,
        Duration::from_millis(u64::from(runtime.zigbee.steering_retry_ms)),
        deferred_init,
    );

    spawn_coordinator(events.clone(), endpoint.endpoint, toggle_secs);

    events
        .send(StackEvent::Signal(AppSignal::SkipStartup, Ok(())))
        .context("stack event channel closed")?;
    info!("zigbee end device simulation started");

    let mut steering_attempts: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            StackEvent::Signal(signal, status) => commissioner.handle_signal(signal, status),
            StackEvent::Commission(CommissioningMode::Initialization) => {
                let signal = if factory_new {
                    AppSignal::DeviceFirstStart
                } else {
                    AppSignal::DeviceReboot
                };
                let _ = events.send(StackEvent::Signal(signal, Ok(())));
            }
            StackEvent::Commission(CommissioningMode::NetworkSteering) => {
                steering_attempts = steering_attempts.saturating_add(1);
                let status = if steering_attempts <= steering_failures {
                    Err(StackError::new(StackError::TIMEOUT, "ESP_ERR_TIMEOUT"))
                } else {
                    Ok(())
                };
                let _ = events.send(StackEvent::Signal(AppSignal::Steering, status));
            }
            StackEvent::RetryDue(mode) => {
                commissioner.on_retry_started();
                if let Err(err) = commissioner.stack_mut().start_commissioning(mode) {
                    warn!("Failed to start Zigbee bdb commissioning: {err}");
                }
            }
            StackEvent::Action(action) => {
                if let Err(err) = light.handle(&action) {
                    warn!("action handler rejected {action:?}: {err}");
                }
            }
        }
    }

    let polls = poller
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|handle| handle.stats().polls())
        .unwrap_or_default();
    info!(
        "simulation stopped in state {:?} after {polls} sensor polls (light {})",
        commissioner.state(),
        if light.is_on() { "on" } else { "off" }
    );
    Ok(())
}

/// Flips the on/off attribute periodically, as a coordinator would.
fn spawn_coordinator(events: UnboundedSender<StackEvent>, endpoint: u8, period_secs: u64) {
    tokio::spawn(async move {
        let mut on = false;
        loop {
            tokio::time::sleep(Duration::from_secs(period_secs)).await;
            on = !on;
            let write = AttributeWrite {
                status: ZCL_STATUS_SUCCESS,
                endpoint,
                cluster: CLUSTER_ON_OFF,
                attribute: ATTR_ON_OFF,
                value: AttributeValue::Bool(on),
            };
            if events
                .send(StackEvent::Action(CoreAction::SetAttributeValue(write)))
                .is_err()
            {
                break;
            }
        }
    });
}

fn open_simulated_sensor(
    i2c: &I2cBusConfig,
) -> Result<Aht20<SimulatedAht20, StdDelay>, DriverError> {
    info!(
        "simulated i2c bus {} (sda {}, scl {}, {} Hz)",
        i2c.port, i2c.sda_pin, i2c.scl_pin, i2c.frequency_hz
    );

    let bus = SimulatedAht20::with_source(|index| {
        let phase = index as f32 / 60.0;
        let temperature = 21.5 + 1.5 * phase.sin();
        let humidity = 45.0 + 5.0 * (phase * 0.7).cos();
        (celsius_to_raw(temperature), humidity_to_raw(humidity))
    });

    let mut sensor = Aht20::new(bus, StdDelay, i2c.address);
    sensor.init().map_err(DriverError::DeviceInit)?;
    Ok(sensor)
}

fn celsius_to_raw(celsius: f32) -> u32 {
    ((celsius + 50.0) / 200.0 * AHT20_FULL_SCALE) as u32
}

fn humidity_to_raw(percent: f32) -> u32 {
    (percent / 100.0 * AHT20_FULL_SCALE) as u32
}

fn load_runtime_config() -> RuntimeConfig {
    let Ok(path) = std::env::var("NODE_CONFIG") else {
        return RuntimeConfig::default();
    };

    std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {path}"))
        .and_then(|raw| {
            RuntimeConfig::from_json(&raw).with_context(|| format!("failed to parse {path}"))
        })
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}; using defaults");
            RuntimeConfig::default()
        })
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}

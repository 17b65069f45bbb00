use std::time::Duration;

use log::{info, warn};

use crate::error::{status_name, DriverError, SignalStatus};

use super::{AppSignal, CommissioningMode, ZigbeeStack};

/// Hook run once the stack has come up, before steering. Starts the drivers.
pub type DeferredInit = Box<dyn FnOnce() -> Result<(), DriverError> + Send>;

/// Starts the light output, then the sensor. A light failure is logged and the
/// sensor is still started; the first failure is returned.
pub fn start_drivers(
    light: impl FnOnce() -> Result<(), DriverError>,
    sensor: impl FnOnce() -> Result<(), DriverError>,
) -> Result<(), DriverError> {
    let light = light().inspect_err(|err| warn!("light driver init error: {err}"));
    let sensor = sensor();
    light.and(sensor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningState {
    Uninitialized,
    Initializing,
    Steering { attempt: u32 },
    SteeringRetryPending { attempt: u32 },
    Joined,
}

pub struct Commissioner<S> {
    stack: S,
    state: CommissioningState,
    deferred_init: Option<DeferredInit>,
    steering_retry_delay: Duration,
}

impl<S> Commissioner<S>
where
    S: ZigbeeStack,
{
    pub fn new(stack: S, steering_retry_delay: Duration, deferred_init: DeferredInit) -> Self {
        Self {
            stack,
            state: CommissioningState::Uninitialized,
            deferred_init: Some(deferred_init),
            steering_retry_delay,
        }
    }

    pub fn state(&self) -> CommissioningState {
        self.state
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    pub fn handle_signal(&mut self, signal: AppSignal, status: SignalStatus) {
        match signal {
            AppSignal::SkipStartup => {
                info!("Initialize Zigbee stack");
                self.state = CommissioningState::Initializing;
                self.start(CommissioningMode::Initialization);
            }
            AppSignal::DeviceFirstStart | AppSignal::DeviceReboot => {
                if let Err(err) = status {
                    warn!("Failed to initialize Zigbee stack (status: {err})");
                    return;
                }

                let outcome = if self.run_deferred_init() {
                    "successful"
                } else {
                    "failed"
                };
                info!("Deferred driver initialization {outcome}");

                let factory_new = self.stack.is_factory_new();
                info!(
                    "Device started up in {}factory-reset mode",
                    if factory_new { "" } else { "non " }
                );
                if factory_new {
                    info!("Start network steering");
                    self.state = CommissioningState::Steering { attempt: 1 };
                    self.start(CommissioningMode::NetworkSteering);
                } else {
                    info!("Device rebooted successfully");
                    self.state = CommissioningState::Joined;
                }
            }
            AppSignal::Steering => match status {
                Ok(()) => {
                    self.state = CommissioningState::Joined;
                    info!(
                        "Joined network successfully ({})",
                        self.stack.network_info()
                    );
                }
                Err(err) => {
                    let attempt = self.steering_attempt();
                    info!("Network steering was not successful (status: {err})");
                    self.state = CommissioningState::SteeringRetryPending { attempt };
                    self.stack.schedule_commissioning(
                        CommissioningMode::NetworkSteering,
                        self.steering_retry_delay,
                    );
                }
            },
            AppSignal::Other(code) => {
                info!(
                    "ZDO signal: {} ({code:#x}), status: {}",
                    signal.name(),
                    status_name(&status)
                );
            }
        }
    }

    /// Called when a scheduled steering retry actually starts.
    pub fn on_retry_started(&mut self) {
        if let CommissioningState::SteeringRetryPending { attempt } = self.state {
            self.state = CommissioningState::Steering {
                attempt: attempt.saturating_add(1),
            };
        }
    }

    fn steering_attempt(&self) -> u32 {
        match self.state {
            CommissioningState::Steering { attempt }
            | CommissioningState::SteeringRetryPending { attempt } => attempt,
            _ => 1,
        }
    }

    /// Returns `true` when the hook ran now or already ran before.
    fn run_deferred_init(&mut self) -> bool {
        let Some(init) = self.deferred_init.take() else {
            return true;
        };

        match init() {
            Ok(()) => true,
            Err(err) => {
                warn!("deferred driver init error: {err}");
                false
            }
        }
    }

    fn start(&mut self, mode: CommissioningMode) {
        if let Err(err) = self.stack.start_commissioning(mode) {
            warn!("Failed to start Zigbee bdb commissioning ({mode:?}): {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        error::StackError,
        zigbee::{
            attribute::ZCL_STATUS_SUCCESS,
            cluster::{AttributeValue, ATTR_ON_OFF, CLUSTER_ON_OFF},
            AttributeWrite, CoreAction, LightOutput, LightSlot, NetworkInfo,
        },
    };
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeStack {
        factory_new: bool,
        started: Vec<CommissioningMode>,
        scheduled: Vec<(CommissioningMode, Duration)>,
    }

    impl ZigbeeStack for FakeStack {
        fn start_commissioning(&mut self, mode: CommissioningMode) -> Result<(), StackError> {
            self.started.push(mode);
            Ok(())
        }

        fn schedule_commissioning(&mut self, mode: CommissioningMode, delay: Duration) {
            self.scheduled.push((mode, delay));
        }

        fn is_factory_new(&self) -> bool {
            self.factory_new
        }

        fn network_info(&self) -> NetworkInfo {
            NetworkInfo::default()
        }
    }

    fn commissioner(factory_new: bool) -> (Commissioner<FakeStack>, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let stack = FakeStack {
            factory_new,
            ..FakeStack::default()
        };
        let commissioner = Commissioner::new(
            stack,
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        (commissioner, runs)
    }

    #[test]
    fn factory_new_device_initializes_then_steers() {
        let (mut commissioner, runs) = commissioner(true);

        commissioner.handle_signal(AppSignal::SkipStartup, Ok(()));
        assert_eq!(commissioner.state(), CommissioningState::Initializing);

        commissioner.handle_signal(AppSignal::DeviceFirstStart, Ok(()));
        assert_eq!(
            commissioner.state(),
            CommissioningState::Steering { attempt: 1 }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            commissioner.stack().started,
            vec![
                CommissioningMode::Initialization,
                CommissioningMode::NetworkSteering
            ]
        );

        commissioner.handle_signal(AppSignal::Steering, Ok(()));
        assert_eq!(commissioner.state(), CommissioningState::Joined);
    }

    #[test]
    fn rebooted_device_skips_steering() {
        let (mut commissioner, runs) = commissioner(false);

        commissioner.handle_signal(AppSignal::SkipStartup, Ok(()));
        commissioner.handle_signal(AppSignal::DeviceReboot, Ok(()));

        assert_eq!(commissioner.state(), CommissioningState::Joined);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            commissioner.stack().started,
            vec![CommissioningMode::Initialization]
        );
    }

    #[test]
    fn deferred_init_runs_exactly_once() {
        let (mut commissioner, runs) = commissioner(false);

        for _ in 0..3 {
            commissioner.handle_signal(AppSignal::DeviceReboot, Ok(()));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_startup_does_not_run_hook() {
        let (mut commissioner, runs) = commissioner(true);

        commissioner.handle_signal(AppSignal::SkipStartup, Ok(()));
        commissioner.handle_signal(AppSignal::DeviceFirstStart, Err(StackError::fail()));

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(commissioner.state(), CommissioningState::Initializing);
    }

    #[test]
    fn hook_failure_does_not_stop_commissioning() {
        let stack = FakeStack {
            factory_new: true,
            ..FakeStack::default()
        };
        let mut commissioner = Commissioner::new(
            stack,
            Duration::from_secs(1),
            Box::new(|| Err(DriverError::BusConfig("no bus".to_string()))),
        );

        commissioner.handle_signal(AppSignal::DeviceFirstStart, Ok(()));

        assert_eq!(
            commissioner.state(),
            CommissioningState::Steering { attempt: 1 }
        );
    }

    struct StuckLight;

    impl LightOutput for StuckLight {
        fn set_power(&mut self, _on: bool) -> Result<(), StackError> {
            Err(StackError::fail())
        }
    }

    #[test]
    fn failed_light_start_still_starts_sensor_and_steers() {
        let light = Arc::new(LightSlot::<StuckLight>::new());
        let sensor_starts = Arc::new(AtomicU32::new(0));
        let stack = FakeStack {
            factory_new: true,
            ..FakeStack::default()
        };
        let deferred_init: DeferredInit = {
            let sensor_starts = sensor_starts.clone();
            Box::new(move || {
                start_drivers(
                    || Err(DriverError::Light(StackError::invalid_arg())),
                    || {
                        sensor_starts.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
            })
        };
        let mut commissioner = Commissioner::new(stack, Duration::from_secs(1), deferred_init);

        commissioner.handle_signal(AppSignal::SkipStartup, Ok(()));
        commissioner.handle_signal(AppSignal::DeviceFirstStart, Ok(()));

        assert_eq!(
            commissioner.state(),
            CommissioningState::Steering { attempt: 1 }
        );
        assert_eq!(sensor_starts.load(Ordering::SeqCst), 1);
        assert!(!light.is_installed());

        let write = AttributeWrite {
            status: ZCL_STATUS_SUCCESS,
            endpoint: 10,
            cluster: CLUSTER_ON_OFF,
            attribute: ATTR_ON_OFF,
            value: AttributeValue::Bool(true),
        };
        assert_eq!(light.handle(&CoreAction::SetAttributeValue(write)), Ok(()));
    }

    #[test]
    fn start_drivers_reports_sensor_failure_after_light_success() {
        let result = start_drivers(
            || Ok(()),
            || Err(DriverError::BusConfig("no bus".to_string())),
        );
        assert!(matches!(result, Err(DriverError::BusConfig(_))));
    }

    #[test]
    fn steering_failure_schedules_one_second_retry() {
        let (mut commissioner, _) = commissioner(true);
        commissioner.handle_signal(AppSignal::DeviceFirstStart, Ok(()));

        commissioner.handle_signal(AppSignal::Steering, Err(StackError::fail()));
        assert_eq!(
            commissioner.state(),
            CommissioningState::SteeringRetryPending { attempt: 1 }
        );

        commissioner.on_retry_started();
        commissioner.handle_signal(AppSignal::Steering, Err(StackError::fail()));
        commissioner.on_retry_started();
        assert_eq!(
            commissioner.state(),
            CommissioningState::Steering { attempt: 3 }
        );

        assert_eq!(
            commissioner.stack().scheduled,
            vec![
                (CommissioningMode::NetworkSteering, Duration::from_secs(1)),
                (CommissioningMode::NetworkSteering, Duration::from_secs(1))
            ]
        );

        commissioner.handle_signal(AppSignal::Steering, Ok(()));
        assert_eq!(commissioner.state(), CommissioningState::Joined);
    }

    #[test]
    fn unknown_signals_pass_through() {
        let (mut commissioner, runs) = commissioner(true);

        commissioner.handle_signal(AppSignal::Other(0x03), Err(StackError::fail()));

        assert_eq!(commissioner.state(), CommissioningState::Uninitialized);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(commissioner.stack().started.is_empty());
    }
}

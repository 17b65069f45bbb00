//! Fixed-delay sensor poll loop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use embedded_hal::{delay::DelayNs, i2c::I2c};
use log::{error, info, warn};

use crate::{
    aht20::Aht20,
    config::{PollConfig, ReadFailurePolicy},
    error::{DriverError, SensorError},
    types::SensorReading,
};

const POLL_TASK_NAME: &str = "aht20_update";
const POLL_TASK_STACK: usize = if cfg!(target_os = "espidf") {
    8 * 1024
} else {
    64 * 1024
};

/// Receives temperature (°C) and relative humidity (%).
pub type ReadingCallback = Box<dyn FnMut(f32, f32) + Send>;

pub trait Sensor {
    fn read(&mut self) -> Result<SensorReading, SensorError>;
}

impl<I, D> Sensor for Aht20<I, D>
where
    I: I2c,
    D: DelayNs,
{
    fn read(&mut self) -> Result<SensorReading, SensorError> {
        self.measure()
    }
}

pub trait Clock {
    /// Time elapsed since the clock was created.
    fn now(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Default)]
pub struct PollStats {
    polls: AtomicU64,
    failures: AtomicU64,
}

impl PollStats {
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub struct Poller<S, C> {
    sensor: S,
    clock: C,
    config: PollConfig,
    callback: Option<ReadingCallback>,
    stats: Arc<PollStats>,
    consecutive_failures: u32,
}

impl<S, C> Poller<S, C>
where
    S: Sensor,
    C: Clock,
{
    pub fn new(
        sensor: S,
        clock: C,
        config: PollConfig,
        callback: Option<ReadingCallback>,
    ) -> Result<Self, DriverError> {
        validate(&config)?;

        Ok(Self {
            sensor,
            clock,
            config,
            callback,
            stats: Arc::new(PollStats::default()),
            consecutive_failures: 0,
        })
    }

    pub fn stats(&self) -> Arc<PollStats> {
        self.stats.clone()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.interval_seconds))
    }

    /// Reads the sensor once and hands the values to the callback.
    pub fn poll_once(&mut self) -> Result<SensorReading, DriverError> {
        match self.sensor.read() {
            Ok(reading) => {
                self.stats.polls.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures = 0;
                if let Some(callback) = self.callback.as_mut() {
                    callback(reading.temperature, reading.humidity);
                }
                Ok(reading)
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Err(DriverError::Read(err))
            }
        }
    }

    /// Runs the loop until the clock reaches `deadline`. The first read happens
    /// immediately; every later one follows a full delay.
    pub fn run_until(&mut self, deadline: Option<Duration>) -> Result<(), DriverError> {
        loop {
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                return Ok(());
            }

            let delay = match self.poll_once() {
                Ok(_) => self.interval(),
                Err(err) => self.delay_after_failure(err)?,
            };
            self.clock.sleep(delay);
        }
    }

    pub fn run(&mut self) -> Result<(), DriverError> {
        self.run_until(None)
    }

    fn delay_after_failure(&self, err: DriverError) -> Result<Duration, DriverError> {
        match self.config.on_read_failure {
            ReadFailurePolicy::Abort => Err(err),
            ReadFailurePolicy::Continue => {
                warn!("{err}: {}; retrying next interval", source_of(&err));
                Ok(self.interval())
            }
            ReadFailurePolicy::Backoff { max_delay_seconds } => {
                let exponent = self.consecutive_failures.saturating_sub(1).min(16);
                let delay = self
                    .interval()
                    .saturating_mul(1_u32 << exponent)
                    .min(Duration::from_secs(u64::from(max_delay_seconds)));
                warn!(
                    "{err}: {} (failure #{}); backing off {}s",
                    source_of(&err),
                    self.consecutive_failures,
                    delay.as_secs()
                );
                Ok(delay)
            }
        }
    }
}

impl<S, C> Poller<S, C>
where
    S: Sensor + Send + 'static,
    C: Clock + Send + 'static,
{
    /// Moves the loop onto its own thread. A read error under
    /// [`ReadFailurePolicy::Abort`] aborts the process.
    pub fn spawn(mut self) -> Result<PollerHandle, DriverError> {
        let stats = self.stats();
        let thread = thread::Builder::new()
            .name(POLL_TASK_NAME.to_string())
            .stack_size(POLL_TASK_STACK)
            .spawn(move || {
                if let Err(err) = self.run() {
                    error!("{err}: {}; aborting", source_of(&err));
                    std::process::abort();
                }
            })
            .map_err(DriverError::Spawn)?;

        Ok(PollerHandle { stats, thread })
    }
}

pub struct PollerHandle {
    stats: Arc<PollStats>,
    thread: JoinHandle<()>,
}

impl PollerHandle {
    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Opens the sensor and starts the poll thread.
///
/// `open_sensor` performs bus configuration and the device handshake. Either
/// failing is returned as is, and no thread is started.
pub fn driver_init<S, F>(
    config: PollConfig,
    callback: Option<ReadingCallback>,
    open_sensor: F,
) -> Result<PollerHandle, DriverError>
where
    S: Sensor + Send + 'static,
    F: FnOnce() -> Result<S, DriverError>,
{
    validate(&config).inspect_err(|err| error!("sensor driver init rejected: {err}"))?;

    let sensor = open_sensor().inspect_err(|err| {
        error!("sensor driver init failed: {err}: {}", source_of(err));
    })?;

    let interval_seconds = config.interval_seconds;
    let handle = Poller::new(sensor, SystemClock::new(), config, callback)?.spawn()?;
    info!("sensor poll task started ({interval_seconds}s interval)");
    Ok(handle)
}

/// Rejects configurations that would make the loop spin without sleeping.
fn validate(config: &PollConfig) -> Result<(), DriverError> {
    if config.interval_seconds == 0 {
        return Err(DriverError::InvalidInterval);
    }
    if let ReadFailurePolicy::Backoff { max_delay_seconds } = config.on_read_failure {
        if max_delay_seconds < config.interval_seconds {
            return Err(DriverError::InvalidBackoffCap {
                max_delay_seconds,
                interval_seconds: config.interval_seconds,
            });
        }
    }
    Ok(())
}

fn source_of(err: &DriverError) -> String {
    std::error::Error::source(err)
        .map(ToString::to_string)
        .unwrap_or_else(|| "no further detail".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        aht20::DEFAULT_ADDRESS,
        sim::{NoopDelay, SimulatedAht20},
    };
    use embedded_hal::i2c::ErrorKind;
    use pretty_assertions::assert_eq;

    struct ManualClock {
        now: Duration,
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl ManualClock {
        fn new() -> (Self, Arc<Mutex<Vec<Duration>>>) {
            let sleeps = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    now: Duration::ZERO,
                    sleeps: sleeps.clone(),
                },
                sleeps,
            )
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            self.now
        }

        fn sleep(&mut self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.now += duration;
        }
    }

    struct ScriptedSensor {
        results: Vec<Result<SensorReading, SensorError>>,
        next: usize,
    }

    impl Sensor for ScriptedSensor {
        fn read(&mut self) -> Result<SensorReading, SensorError> {
            let result = self.results[self.next % self.results.len()];
            self.next += 1;
            result
        }
    }

    fn aht20(bus: SimulatedAht20) -> Aht20<SimulatedAht20, NoopDelay> {
        Aht20::new(bus, NoopDelay, DEFAULT_ADDRESS)
    }

    fn recording_callback() -> (ReadingCallback, Arc<Mutex<Vec<(f32, f32)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callback: ReadingCallback = Box::new(move |temperature, humidity| {
            sink.lock().unwrap().push((temperature, humidity));
        });
        (callback, calls)
    }

    fn config(interval_seconds: u16, on_read_failure: ReadFailurePolicy) -> PollConfig {
        PollConfig {
            interval_seconds,
            on_read_failure,
        }
    }

    #[test]
    fn five_seconds_at_one_second_yields_five_callbacks() {
        let (clock, _) = ManualClock::new();
        let (callback, calls) = recording_callback();
        let mut poller = Poller::new(
            aht20(SimulatedAht20::fixed(0x6000, 0x4000)),
            clock,
            config(1, ReadFailurePolicy::Abort),
            Some(callback),
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(5))).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls.iter().all(|call| *call == (-45.3125, 1.5625)));
        assert_eq!(poller.stats().polls(), 5);
    }

    #[test]
    fn first_read_happens_before_any_delay() {
        let (clock, sleeps) = ManualClock::new();
        let (callback, calls) = recording_callback();
        let mut poller = Poller::new(
            aht20(SimulatedAht20::fixed(0x6000, 0x4000)),
            clock,
            config(3, ReadFailurePolicy::Abort),
            Some(callback),
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn at_most_one_callback_per_interval_window() {
        let (clock, _) = ManualClock::new();
        let (callback, calls) = recording_callback();
        let mut poller = Poller::new(
            aht20(SimulatedAht20::fixed(0x6000, 0x4000)),
            clock,
            config(10, ReadFailurePolicy::Abort),
            Some(callback),
        )
        .unwrap();
        let stats = poller.stats();

        let mut previous = 0;
        for window in 1..=6 {
            poller
                .run_until(Some(Duration::from_secs(window * 10)))
                .unwrap();
            let polls = stats.polls();
            assert!(polls >= previous);
            assert!(polls <= window);
            previous = polls;
        }
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[test]
    fn missing_callback_is_skipped() {
        let (clock, _) = ManualClock::new();
        let mut poller = Poller::new(
            aht20(SimulatedAht20::fixed(0x6000, 0x4000)),
            clock,
            config(1, ReadFailurePolicy::Abort),
            None,
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(poller.stats().polls(), 3);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (clock, _) = ManualClock::new();
        let result = Poller::new(
            aht20(SimulatedAht20::fixed(0x6000, 0x4000)),
            clock,
            config(0, ReadFailurePolicy::Abort),
            None,
        );
        assert!(matches!(result, Err(DriverError::InvalidInterval)));
    }

    #[test]
    fn read_failure_stops_loop_under_abort_policy() {
        let (clock, _) = ManualClock::new();
        let (callback, calls) = recording_callback();
        let bus = SimulatedAht20::fixed(0x6000, 0x4000);
        let mut poller = Poller::new(
            aht20(bus.clone()),
            clock,
            config(1, ReadFailurePolicy::Abort),
            Some(callback),
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(2))).unwrap();
        bus.fail_reads(1);
        let result = poller.run_until(Some(Duration::from_secs(10)));

        assert!(matches!(
            result,
            Err(DriverError::Read(SensorError::Bus(ErrorKind::Bus)))
        ));
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(poller.stats().failures(), 1);
    }

    #[test]
    fn continue_policy_keeps_fixed_interval() {
        let (clock, sleeps) = ManualClock::new();
        let bus = SimulatedAht20::fixed(0x6000, 0x4000);
        bus.fail_reads(2);
        let mut poller = Poller::new(
            aht20(bus),
            clock,
            config(2, ReadFailurePolicy::Continue),
            None,
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(8))).unwrap();

        assert_eq!(poller.stats().failures(), 2);
        assert_eq!(poller.stats().polls(), 2);
        assert!(sleeps
            .lock()
            .unwrap()
            .iter()
            .all(|delay| *delay == Duration::from_secs(2)));
    }

    #[test]
    fn backoff_policy_doubles_and_resets() {
        let (clock, sleeps) = ManualClock::new();
        let failure = Err(SensorError::Bus(ErrorKind::Bus));
        let success = Ok(SensorReading::from_raw(0x6000, 0x4000));
        let sensor = ScriptedSensor {
            results: vec![failure, failure, failure, failure, success, failure],
            next: 0,
        };
        let mut poller = Poller::new(
            sensor,
            clock,
            config(
                1,
                ReadFailurePolicy::Backoff {
                    max_delay_seconds: 5,
                },
            ),
            None,
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(14))).unwrap();

        let sleeps: Vec<u64> = sleeps.lock().unwrap().iter().map(Duration::as_secs).collect();
        assert_eq!(sleeps, vec![1, 2, 4, 5, 1, 1]);
    }

    #[test]
    fn backoff_cap_below_interval_is_rejected() {
        let (clock, _) = ManualClock::new();
        let bus = SimulatedAht20::fixed(0x6000, 0x4000);
        bus.fail_reads(u32::MAX);
        let backoff = |max_delay_seconds| ReadFailurePolicy::Backoff { max_delay_seconds };

        let result = Poller::new(aht20(bus.clone()), clock, config(5, backoff(0)), None);
        assert!(matches!(
            result,
            Err(DriverError::InvalidBackoffCap {
                max_delay_seconds: 0,
                interval_seconds: 5
            })
        ));

        let result = driver_init(config(5, backoff(4)), None, move || Ok(aht20(bus)));
        assert!(matches!(result, Err(DriverError::InvalidBackoffCap { .. })));
    }

    #[test]
    fn backoff_cap_equal_to_interval_keeps_fixed_delay() {
        let (clock, sleeps) = ManualClock::new();
        let bus = SimulatedAht20::fixed(0x6000, 0x4000);
        bus.fail_reads(u32::MAX);
        let mut poller = Poller::new(
            aht20(bus),
            clock,
            config(
                5,
                ReadFailurePolicy::Backoff {
                    max_delay_seconds: 5,
                },
            ),
            None,
        )
        .unwrap();

        poller.run_until(Some(Duration::from_secs(20))).unwrap();

        let sleeps: Vec<u64> = sleeps.lock().unwrap().iter().map(Duration::as_secs).collect();
        assert_eq!(sleeps, vec![5, 5, 5, 5]);
        assert_eq!(poller.stats().failures(), 4);
    }

    #[test]
    fn failed_open_starts_nothing() {
        let (callback, calls) = recording_callback();

        let result = driver_init(config(1, ReadFailurePolicy::Abort), Some(callback), || {
            let mut sensor = aht20(SimulatedAht20::fixed(0x6000, 0x4000).at_address(0x39));
            sensor.init().map_err(DriverError::DeviceInit)?;
            Ok(sensor)
        });

        assert!(matches!(
            result,
            Err(DriverError::DeviceInit(SensorError::Bus(_)))
        ));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn bus_configuration_failure_is_reported() {
        let result = driver_init::<ScriptedSensor, _>(
            config(1, ReadFailurePolicy::Abort),
            None,
            || Err(DriverError::BusConfig("port 3 does not exist".to_string())),
        );

        assert!(matches!(result, Err(DriverError::BusConfig(_))));
    }

    #[test]
    fn driver_init_spawns_polling_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let callback: ReadingCallback = Box::new(move |temperature, humidity| {
            let _ = tx.send((temperature, humidity));
        });

        let handle = driver_init(config(1, ReadFailurePolicy::Abort), Some(callback), || {
            let mut sensor = aht20(SimulatedAht20::fixed(0x6000, 0x4000));
            sensor.init().map_err(DriverError::DeviceInit)?;
            Ok(sensor)
        })
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, (-45.3125, 1.5625));
        assert!(handle.stats().polls() >= 1);
        assert!(handle.is_running());
    }
}

//! In-process AHT20 stand-in used by the host build and the test suite.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use embedded_hal::{
    delay::DelayNs,
    i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation},
};

use crate::aht20::{
    self, CMD_CALIBRATE, CMD_SOFT_RESET, CMD_TRIGGER, STATUS_BUSY, STATUS_CALIBRATED,
};

type SampleSource = Box<dyn FnMut(u64) -> (u32, u32) + Send>;

struct BusState {
    address: u8,
    calibrated: bool,
    accepts_calibration: bool,
    busy_reads: u32,
    failing_reads: u32,
    measurements: u64,
    pending: Option<(u32, u32)>,
    last: (u32, u32),
    source: SampleSource,
    writes: Vec<Vec<u8>>,
}

/// Simulated AHT20 on an I2C bus. Clones share the same device state.
#[derive(Clone)]
pub struct SimulatedAht20 {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedAht20 {
    /// `source` receives the measurement index and returns
    /// `(raw_temperature, raw_humidity)`.
    pub fn with_source(source: impl FnMut(u64) -> (u32, u32) + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                address: aht20::DEFAULT_ADDRESS,
                calibrated: true,
                accepts_calibration: true,
                busy_reads: 0,
                failing_reads: 0,
                measurements: 0,
                pending: None,
                last: (0, 0),
                source: Box::new(source),
                writes: Vec::new(),
            })),
        }
    }

    pub fn fixed(raw_temperature: u32, raw_humidity: u32) -> Self {
        Self::with_source(move |_| (raw_temperature, raw_humidity))
    }

    pub fn at_address(self, address: u8) -> Self {
        self.lock().address = address;
        self
    }

    pub fn uncalibrated(self) -> Self {
        self.lock().calibrated = false;
        self
    }

    pub fn refuse_calibration(self) -> Self {
        self.lock().accepts_calibration = false;
        self
    }

    /// The next `count` frame reads report the busy flag.
    pub fn busy_reads(self, count: u32) -> Self {
        self.lock().busy_reads = count;
        self
    }

    /// The next `count` frame reads fail on the bus.
    pub fn fail_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    pub fn is_calibrated(&self) -> bool {
        self.lock().calibrated
    }

    pub fn measurements(&self) -> u64 {
        self.lock().measurements
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusState {
    fn status(&self) -> u8 {
        if self.calibrated {
            0x10 | STATUS_CALIBRATED
        } else {
            0x10
        }
    }

    fn on_write(&mut self, bytes: &[u8]) {
        if bytes == CMD_TRIGGER {
            let sample = (self.source)(self.measurements);
            self.measurements += 1;
            self.pending = Some(sample);
        } else if bytes == CMD_CALIBRATE {
            if self.accepts_calibration {
                self.calibrated = true;
            }
        } else if bytes == CMD_SOFT_RESET {
            self.pending = None;
        }
        self.writes.push(bytes.to_vec());
    }

    fn on_read(&mut self, buffer: &mut [u8]) -> Result<(), ErrorKind> {
        if buffer.len() == 1 {
            buffer[0] = self.status();
            return Ok(());
        }

        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(ErrorKind::Bus);
        }

        let mut status = self.status();
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            status |= STATUS_BUSY;
        } else if let Some(sample) = self.pending.take() {
            self.last = sample;
        }

        let frame = aht20::encode_frame(status, self.last.0, self.last.1);
        let len = buffer.len().min(frame.len());
        buffer[..len].copy_from_slice(&frame[..len]);
        Ok(())
    }
}

impl ErrorType for SimulatedAht20 {
    type Error = ErrorKind;
}

impl I2c for SimulatedAht20 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if address != state.address {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        for operation in operations {
            match operation {
                Operation::Write(bytes) => state.on_write(bytes),
                Operation::Read(buffer) => state.on_read(buffer)?,
            }
        }
        Ok(())
    }
}

/// Delay that returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelay;

impl DelayNs for NoopDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Delay backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

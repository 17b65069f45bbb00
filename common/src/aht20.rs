//! Blocking AHT20 driver on top of the `embedded-hal` I2C and delay traits.
//!
//! Every transaction is synchronous. A measurement takes roughly 80 ms of
//! delay on the calling thread.

use embedded_hal::{
    delay::DelayNs,
    i2c::{Error as _, I2c},
};
use log::{info, warn};

use crate::{error::SensorError, types::SensorReading};

pub const DEFAULT_ADDRESS: u8 = 0x38;

pub const CMD_CALIBRATE: [u8; 3] = [0xBE, 0x08, 0x00];
pub const CMD_TRIGGER: [u8; 3] = [0xAC, 0x33, 0x00];
pub const CMD_SOFT_RESET: [u8; 1] = [0xBA];

pub const STATUS_BUSY: u8 = 0x80;
pub const STATUS_CALIBRATED: u8 = 0x08;

const POWER_ON_DELAY_MS: u32 = 40;
const CALIBRATION_DELAY_MS: u32 = 10;
const MEASUREMENT_DELAY_MS: u32 = 80;
const BUSY_RETRY_DELAY_MS: u32 = 10;
const BUSY_RETRIES: u8 = 3;
const SOFT_RESET_DELAY_MS: u32 = 20;

pub struct Aht20<I, D> {
    i2c: I,
    delay: D,
    address: u8,
}

impl<I, D> Aht20<I, D>
where
    I: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I, delay: D, address: u8) -> Self {
        Self {
            i2c,
            delay,
            address,
        }
    }

    /// Waits out the power-on window and makes sure the calibration bit is set,
    /// issuing the calibrate command once if it is not.
    pub fn init(&mut self) -> Result<(), SensorError> {
        self.delay.delay_ms(POWER_ON_DELAY_MS);

        let status = self.status()?;
        if status & STATUS_CALIBRATED != 0 {
            info!("aht20 at {:#04x} ready (status {status:#04x})", self.address);
            return Ok(());
        }

        warn!("aht20 not calibrated (status {status:#04x}); sending calibrate command");
        self.write(&CMD_CALIBRATE)?;
        self.delay.delay_ms(CALIBRATION_DELAY_MS);

        let status = self.status()?;
        if status & STATUS_CALIBRATED == 0 {
            return Err(SensorError::NotCalibrated(status));
        }

        info!("aht20 at {:#04x} calibrated", self.address);
        Ok(())
    }

    pub fn status(&mut self) -> Result<u8, SensorError> {
        let mut status = [0_u8; 1];
        self.i2c
            .read(self.address, &mut status)
            .map_err(|err| SensorError::Bus(err.kind()))?;
        Ok(status[0])
    }

    pub fn soft_reset(&mut self) -> Result<(), SensorError> {
        self.write(&CMD_SOFT_RESET)?;
        self.delay.delay_ms(SOFT_RESET_DELAY_MS);
        Ok(())
    }

    /// Triggers a conversion and returns the decoded reading.
    pub fn measure(&mut self) -> Result<SensorReading, SensorError> {
        self.write(&CMD_TRIGGER)?;
        self.delay.delay_ms(MEASUREMENT_DELAY_MS);

        let mut frame = [0_u8; 7];
        let mut retries = 0;
        loop {
            self.i2c
                .read(self.address, &mut frame)
                .map_err(|err| SensorError::Bus(err.kind()))?;

            if frame[0] & STATUS_BUSY == 0 {
                break;
            }
            if retries == BUSY_RETRIES {
                return Err(SensorError::Busy(frame[0]));
            }
            retries += 1;
            self.delay.delay_ms(BUSY_RETRY_DELAY_MS);
        }

        decode_frame(&frame)
    }

    pub fn release(self) -> (I, D) {
        (self.i2c, self.delay)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SensorError> {
        self.i2c
            .write(self.address, bytes)
            .map_err(|err| SensorError::Bus(err.kind()))
    }
}

/// Decodes a complete 7 byte measurement frame: status, 20 bit humidity,
/// 20 bit temperature, CRC.
pub fn decode_frame(frame: &[u8; 7]) -> Result<SensorReading, SensorError> {
    let expected = crc8(&frame[..6]);
    if expected != frame[6] {
        return Err(SensorError::Crc {
            expected,
            actual: frame[6],
        });
    }

    let status = frame[0];
    if status & STATUS_BUSY != 0 {
        return Err(SensorError::Busy(status));
    }
    if status & STATUS_CALIBRATED == 0 {
        return Err(SensorError::NotCalibrated(status));
    }

    let raw_humidity =
        (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let raw_temperature =
        ((u32::from(frame[3]) & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);

    Ok(SensorReading::from_raw(raw_temperature, raw_humidity))
}

/// Builds the frame the sensor would return for the given raw words.
pub fn encode_frame(status: u8, raw_temperature: u32, raw_humidity: u32) -> [u8; 7] {
    let humidity = raw_humidity & 0xF_FFFF;
    let temperature = raw_temperature & 0xF_FFFF;

    let mut frame = [
        status,
        (humidity >> 12) as u8,
        (humidity >> 4) as u8,
        (((humidity & 0x0F) << 4) | (temperature >> 16)) as u8,
        (temperature >> 8) as u8,
        temperature as u8,
        0,
    ];
    frame[6] = crc8(&frame[..6]);
    frame
}

/// CRC-8, polynomial 0x31, initial value 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFF_u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

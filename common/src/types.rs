use serde::{Deserialize, Serialize};

/// Full scale of the 20-bit AHT20 measurement words.
pub const AHT20_FULL_SCALE: f32 = 1_048_576.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
    pub raw_temperature: u32,
    pub raw_humidity: u32,
}

impl SensorReading {
    pub fn from_raw(raw_temperature: u32, raw_humidity: u32) -> Self {
        Self {
            temperature: raw_to_celsius(raw_temperature),
            humidity: raw_to_relative_humidity(raw_humidity),
            raw_temperature,
            raw_humidity,
        }
    }
}

pub fn raw_to_celsius(raw: u32) -> f32 {
    (raw as f32 / AHT20_FULL_SCALE) * 200.0 - 50.0
}

pub fn raw_to_relative_humidity(raw: u32) -> f32 {
    (raw as f32 / AHT20_FULL_SCALE) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_raw_words() {
        let reading = SensorReading::from_raw(0x6000, 0x4000);

        assert_eq!(reading.temperature, -45.3125);
        assert_eq!(reading.humidity, 1.5625);
        assert_eq!(reading.raw_temperature, 0x6000);
        assert_eq!(reading.raw_humidity, 0x4000);
    }

    #[test]
    fn midscale_temperature_is_fifty_celsius() {
        assert_eq!(raw_to_celsius(0x80000), 50.0);
        assert_eq!(raw_to_relative_humidity(0x80000), 50.0);
    }
}

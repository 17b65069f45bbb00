use serde::{Deserialize, Serialize};

/// What the poll loop does when a sensor read fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadFailurePolicy {
    /// Stop the loop and abort the process.
    #[default]
    Abort,
    /// Log and keep the regular interval.
    Continue,
    /// Double the delay for every consecutive failure, capped.
    Backoff { max_delay_seconds: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_seconds: u16,
    pub on_read_failure: ReadFailurePolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            on_read_failure: ReadFailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct I2cBusConfig {
    pub port: u8,
    pub sda_pin: i32,
    pub scl_pin: i32,
    pub frequency_hz: u32,
    pub internal_pullups: bool,
    pub address: u8,
}

impl Default for I2cBusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            sda_pin: 6,
            scl_pin: 7,
            frequency_hz: 400_000,
            internal_pullups: false,
            address: crate::aht20::DEFAULT_ADDRESS,
        }
    }
}

/// End device aging timeout, in the stack's enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdAgingTimeout {
    Min1,
    Min2,
    Min4,
    Min8,
    Min16,
    Min32,
    Min64,
    Min128,
    Min256,
}

impl EdAgingTimeout {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub min_interval_s: u16,
    pub max_interval_s: u16,
    pub reportable_change: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ZigbeeConfig {
    pub endpoint: u8,
    pub manufacturer_name: String,
    pub model_identifier: String,
    pub channel_mask: u32,
    pub ed_timeout: EdAgingTimeout,
    pub keep_alive_ms: u32,
    pub steering_retry_ms: u32,
    pub temperature_report: ReportConfig,
    pub humidity_report: ReportConfig,
}

impl Default for ZigbeeConfig {
    fn default() -> Self {
        Self {
            endpoint: 10,
            manufacturer_name: "LANGLOIS".to_string(),
            model_identifier: "aht20.climate".to_string(),
            channel_mask: 0x07FF_F800,
            ed_timeout: EdAgingTimeout::Min64,
            keep_alive_ms: 3_000,
            steering_retry_ms: 1_000,
            temperature_report: ReportConfig {
                min_interval_s: 10,
                max_interval_s: 300,
                reportable_change: 10,
            },
            humidity_report: ReportConfig {
                min_interval_s: 10,
                max_interval_s: 300,
                reportable_change: 100,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LightConfig {
    pub gpio: i32,
    pub active_low: bool,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            gpio: 8,
            active_low: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub i2c: I2cBusConfig,
    #[serde(default)]
    pub zigbee: ZigbeeConfig,
    #[serde(default)]
    pub light: LightConfig,
}

impl RuntimeConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    /// Parses a persisted document. The flag is set when sanitizing or filling
    /// in defaults changed it, so the caller knows to write it back.
    pub fn from_stored_json(raw: &str) -> Result<(Self, bool), serde_json::Error> {
        let stored: serde_json::Value = serde_json::from_str(raw)?;
        let mut config: Self = serde_json::from_value(stored.clone())?;
        config.sanitize();
        let changed = serde_json::to_value(&config)? != stored;
        Ok((config, changed))
    }

    pub fn sanitize(&mut self) {
        self.poll.sanitize();
        self.i2c.sanitize();
        self.zigbee.sanitize();
        self.light.sanitize();
    }
}

impl PollConfig {
    pub fn sanitize(&mut self) {
        self.interval_seconds = self.interval_seconds.max(1);
        if let ReadFailurePolicy::Backoff { max_delay_seconds } = &mut self.on_read_failure {
            *max_delay_seconds = (*max_delay_seconds).max(self.interval_seconds);
        }
    }
}

impl I2cBusConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.sda_pin < 0 {
            self.sda_pin = defaults.sda_pin;
        }
        if self.scl_pin < 0 {
            self.scl_pin = defaults.scl_pin;
        }
        if self.port > 1 {
            self.port = 0;
        }
        self.frequency_hz = self.frequency_hz.clamp(10_000, 1_000_000);
        if self.address > 0x7F {
            self.address = defaults.address;
        }
    }
}

impl ZigbeeConfig {
    pub fn sanitize(&mut self) {
        self.endpoint = self.endpoint.clamp(1, 240);
        self.steering_retry_ms = self.steering_retry_ms.max(100);
        // ZCL character strings carry a one byte length prefix.
        truncate_chars(&mut self.manufacturer_name, 32);
        truncate_chars(&mut self.model_identifier, 32);
        for report in [&mut self.temperature_report, &mut self.humidity_report] {
            if report.min_interval_s > report.max_interval_s && report.max_interval_s != 0 {
                report.min_interval_s = report.max_interval_s;
            }
        }
    }
}

impl LightConfig {
    pub fn sanitize(&mut self) {
        if self.gpio < 0 {
            self.gpio = Self::default().gpio;
        }
    }
}

fn truncate_chars(value: &mut String, max_bytes: usize) {
    while value.len() > max_bytes {
        value.pop();
    }
}

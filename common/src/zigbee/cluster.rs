use serde::Serialize;

use crate::config::{ReportConfig, ZigbeeConfig};

pub const HA_PROFILE_ID: u16 = 0x0104;
pub const HA_TEST_DEVICE_ID: u16 = 0xFFF0;

pub const CLUSTER_BASIC: u16 = 0x0000;
pub const CLUSTER_ON_OFF: u16 = 0x0006;
pub const CLUSTER_TEMPERATURE_MEASUREMENT: u16 = 0x0402;
pub const CLUSTER_RELATIVE_HUMIDITY: u16 = 0x0405;

pub const ATTR_BASIC_ZCL_VERSION: u16 = 0x0000;
pub const ATTR_BASIC_POWER_SOURCE: u16 = 0x0007;
pub const ATTR_BASIC_MANUFACTURER_NAME: u16 = 0x0004;
pub const ATTR_BASIC_MODEL_IDENTIFIER: u16 = 0x0005;
pub const ATTR_ON_OFF: u16 = 0x0000;
pub const ATTR_MEASURED_VALUE: u16 = 0x0000;
pub const ATTR_MIN_MEASURED_VALUE: u16 = 0x0001;
pub const ATTR_MAX_MEASURED_VALUE: u16 = 0x0002;

pub const TEMPERATURE_INVALID: i16 = i16::MIN;
pub const HUMIDITY_INVALID: u16 = u16::MAX;

/// AHT20 operating range, in ZCL units (0.01 °C / 0.01 %).
pub const TEMPERATURE_MIN_CENTI: i16 = -4_000;
pub const TEMPERATURE_MAX_CENTI: i16 = 8_500;
pub const HUMIDITY_MIN_CENTI: u16 = 0;
pub const HUMIDITY_MAX_CENTI: u16 = 10_000;

const ZCL_VERSION: u8 = 8;
const POWER_SOURCE_DC: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    Server,
    Client,
}

impl ClusterRole {
    pub fn code(self) -> u8 {
        match self {
            Self::Server => 0x01,
            Self::Client => 0x02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    /// Length-prefixed ZCL character string.
    CharString(Vec<u8>),
}

impl AttributeValue {
    pub fn zcl_type(&self) -> u8 {
        match self {
            Self::Bool(_) => 0x10,
            Self::U8(_) => 0x20,
            Self::U16(_) => 0x21,
            Self::I16(_) => 0x29,
            Self::CharString(_) => 0x42,
        }
    }

    pub fn char_string(value: &str) -> Self {
        Self::CharString(zcl_string(value))
    }
}

/// Encodes `value` as a ZCL character string: one length byte, then at most
/// 254 bytes of payload.
pub fn zcl_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let len = bytes.len().min(254);
    let mut encoded = Vec::with_capacity(len + 1);
    encoded.push(len as u8);
    encoded.extend_from_slice(&bytes[..len]);
    encoded
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDescriptor {
    pub id: u16,
    pub value: AttributeValue,
    pub reportable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDescriptor {
    pub id: u16,
    pub role: ClusterRole,
    pub attributes: Vec<AttributeDescriptor>,
}

impl ClusterDescriptor {
    pub fn attribute(&self, id: u16) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|attribute| attribute.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportingEntry {
    pub endpoint: u8,
    pub cluster: u16,
    pub attribute: u16,
    pub min_interval_s: u16,
    pub max_interval_s: u16,
    pub reportable_change: u16,
}

/// Everything the stack needs to register the single sensor endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointDescriptor {
    pub endpoint: u8,
    pub profile_id: u16,
    pub device_id: u16,
    pub device_version: u8,
    pub clusters: Vec<ClusterDescriptor>,
    pub reporting: Vec<ReportingEntry>,
}

impl EndpointDescriptor {
    pub fn from_config(config: &ZigbeeConfig) -> Self {
        let attr = |id, value, reportable| AttributeDescriptor {
            id,
            value,
            reportable,
        };

        let clusters = vec![
            ClusterDescriptor {
                id: CLUSTER_BASIC,
                role: ClusterRole::Server,
                attributes: vec![
                    attr(ATTR_BASIC_ZCL_VERSION, AttributeValue::U8(ZCL_VERSION), false),
                    attr(ATTR_BASIC_POWER_SOURCE, AttributeValue::U8(POWER_SOURCE_DC), false),
                    attr(
                        ATTR_BASIC_MANUFACTURER_NAME,
                        AttributeValue::char_string(&config.manufacturer_name),
                        false,
                    ),
                    attr(
                        ATTR_BASIC_MODEL_IDENTIFIER,
                        AttributeValue::char_string(&config.model_identifier),
                        false,
                    ),
                ],
            },
            ClusterDescriptor {
                id: CLUSTER_ON_OFF,
                role: ClusterRole::Server,
                attributes: vec![attr(ATTR_ON_OFF, AttributeValue::Bool(false), true)],
            },
            ClusterDescriptor {
                id: CLUSTER_TEMPERATURE_MEASUREMENT,
                role: ClusterRole::Server,
                attributes: vec![
                    attr(
                        ATTR_MEASURED_VALUE,
                        AttributeValue::I16(TEMPERATURE_INVALID),
                        true,
                    ),
                    attr(
                        ATTR_MIN_MEASURED_VALUE,
                        AttributeValue::I16(TEMPERATURE_MIN_CENTI),
                        false,
                    ),
                    attr(
                        ATTR_MAX_MEASURED_VALUE,
                        AttributeValue::I16(TEMPERATURE_MAX_CENTI),
                        false,
                    ),
                ],
            },
            ClusterDescriptor {
                id: CLUSTER_RELATIVE_HUMIDITY,
                role: ClusterRole::Server,
                attributes: vec![
                    attr(
                        ATTR_MEASURED_VALUE,
                        AttributeValue::U16(HUMIDITY_INVALID),
                        true,
                    ),
                    attr(
                        ATTR_MIN_MEASURED_VALUE,
                        AttributeValue::U16(HUMIDITY_MIN_CENTI),
                        false,
                    ),
                    attr(
                        ATTR_MAX_MEASURED_VALUE,
                        AttributeValue::U16(HUMIDITY_MAX_CENTI),
                        false,
                    ),
                ],
            },
        ];

        let report = |cluster, settings: &ReportConfig| ReportingEntry {
            endpoint: config.endpoint,
            cluster,
            attribute: ATTR_MEASURED_VALUE,
            min_interval_s: settings.min_interval_s,
            max_interval_s: settings.max_interval_s,
            reportable_change: settings.reportable_change,
        };

        Self {
            endpoint: config.endpoint,
            profile_id: HA_PROFILE_ID,
            device_id: HA_TEST_DEVICE_ID,
            device_version: 0,
            clusters,
            reporting: vec![
                report(CLUSTER_TEMPERATURE_MEASUREMENT, &config.temperature_report),
                report(CLUSTER_RELATIVE_HUMIDITY, &config.humidity_report),
            ],
        }
    }

    pub fn cluster(&self, id: u16) -> Option<&ClusterDescriptor> {
        self.clusters.iter().find(|cluster| cluster.id == id)
    }
}

/// Celsius to the Temperature Measurement `MeasuredValue` (0.01 °C, signed).
pub fn temperature_to_zcl(celsius: f32) -> i16 {
    if celsius.is_nan() {
        return TEMPERATURE_INVALID;
    }
    // -273.15 °C is the lowest value the cluster allows.
    (celsius * 100.0).round().clamp(-27_315.0, f32::from(i16::MAX)) as i16
}

/// Percent to the Relative Humidity `MeasuredValue` (0.01 %, unsigned).
pub fn humidity_to_zcl(percent: f32) -> u16 {
    if percent.is_nan() {
        return HUMIDITY_INVALID;
    }
    (percent * 100.0).round().clamp(0.0, f32::from(HUMIDITY_MAX_CENTI)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zcl_string_is_length_prefixed() {
        assert_eq!(zcl_string("LANGLOIS"), b"\x08LANGLOIS".to_vec());
        assert_eq!(zcl_string(""), vec![0]);
    }

    #[test]
    fn endpoint_exposes_all_clusters() {
        let endpoint = EndpointDescriptor::from_config(&ZigbeeConfig::default());

        assert_eq!(endpoint.endpoint, 10);
        assert_eq!(endpoint.profile_id, HA_PROFILE_ID);
        let ids: Vec<u16> = endpoint.clusters.iter().map(|cluster| cluster.id).collect();
        assert_eq!(
            ids,
            vec![
                CLUSTER_BASIC,
                CLUSTER_ON_OFF,
                CLUSTER_TEMPERATURE_MEASUREMENT,
                CLUSTER_RELATIVE_HUMIDITY
            ]
        );
        assert!(endpoint
            .clusters
            .iter()
            .all(|cluster| cluster.role == ClusterRole::Server));

        let basic = endpoint.cluster(CLUSTER_BASIC).unwrap();
        assert_eq!(
            basic.attribute(ATTR_BASIC_MANUFACTURER_NAME).unwrap().value,
            AttributeValue::CharString(b"\x08LANGLOIS".to_vec())
        );
    }

    #[test]
    fn reporting_follows_config() {
        let mut config = ZigbeeConfig::default();
        config.endpoint = 3;
        config.humidity_report.reportable_change = 250;

        let endpoint = EndpointDescriptor::from_config(&config);

        assert_eq!(endpoint.reporting.len(), 2);
        assert!(endpoint.reporting.iter().all(|entry| entry.endpoint == 3));
        assert_eq!(endpoint.reporting[1].cluster, CLUSTER_RELATIVE_HUMIDITY);
        assert_eq!(endpoint.reporting[1].reportable_change, 250);
    }

    #[test]
    fn converts_measurements_to_zcl_units() {
        assert_eq!(temperature_to_zcl(21.456), 2146);
        assert_eq!(temperature_to_zcl(-45.3125), -4531);
        assert_eq!(temperature_to_zcl(f32::NAN), TEMPERATURE_INVALID);
        assert_eq!(temperature_to_zcl(1_000.0), i16::MAX);

        assert_eq!(humidity_to_zcl(1.5625), 156);
        assert_eq!(humidity_to_zcl(-2.0), 0);
        assert_eq!(humidity_to_zcl(120.0), 10_000);
        assert_eq!(humidity_to_zcl(f32::NAN), HUMIDITY_INVALID);
    }
}

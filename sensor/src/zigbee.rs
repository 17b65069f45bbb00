//! Bindings between the common Zigbee glue and esp-zigbee-lib.

use std::{
    ffi::{c_void, CStr},
    ptr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use esp_idf_hal::delay::BLOCK;
use esp_idf_svc::sys::{esp, esp_err_t, esp_err_to_name, zb, EspError, ESP_FAIL, ESP_OK};
use log::{info, warn};

use zb_climate_common::{
    zigbee::{
        cluster::{
            ClusterDescriptor, ATTR_BASIC_MANUFACTURER_NAME, ATTR_BASIC_MODEL_IDENTIFIER,
            ATTR_BASIC_POWER_SOURCE, ATTR_BASIC_ZCL_VERSION, ATTR_MAX_MEASURED_VALUE,
            ATTR_MEASURED_VALUE, ATTR_MIN_MEASURED_VALUE, ATTR_ON_OFF, CLUSTER_BASIC,
            CLUSTER_ON_OFF, CLUSTER_RELATIVE_HUMIDITY, CLUSTER_TEMPERATURE_MEASUREMENT,
        },
        AppSignal, AttributeStore, AttributeValue, AttributeWrite, ClusterRole, Commissioner,
        CommissioningMode, CoreAction, DeferredInit, EndpointDescriptor, LightSlot, NetworkInfo,
        ZigbeeStack,
    },
    SignalStatus, StackError, ZigbeeConfig,
};

use crate::esp::{stack_error, GpioLight};

const DEVICE_TYPE_END_DEVICE: u32 = 0x02;
const REPORT_DIRECTION_SEND: u8 = 0x00;

static COMMISSIONER: Mutex<Option<Commissioner<EspZigbeeStack>>> = Mutex::new(None);
/// Filled by the deferred driver init once the light GPIO is claimed.
pub static LIGHT: LightSlot<GpioLight> = LightSlot::new();

/// Commissioning controls of esp-zigbee-lib. Only valid on the stack task.
pub struct EspZigbeeStack;

impl ZigbeeStack for EspZigbeeStack {
    fn start_commissioning(&mut self, mode: CommissioningMode) -> Result<(), StackError> {
        esp!(unsafe { zb::esp_zb_bdb_start_top_level_commissioning(mode.code()) })
            .map_err(stack_error)
    }

    fn schedule_commissioning(&mut self, mode: CommissioningMode, delay: Duration) {
        let delay_ms = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        unsafe { zb::esp_zb_scheduler_alarm(Some(steering_retry), mode.code(), delay_ms) };
    }

    fn is_factory_new(&self) -> bool {
        unsafe { zb::esp_zb_bdb_is_factory_new() }
    }

    fn network_info(&self) -> NetworkInfo {
        let mut extended_pan_id = [0_u8; 8];
        unsafe {
            zb::esp_zb_get_extended_pan_id(extended_pan_id.as_mut_ptr());
            NetworkInfo {
                extended_pan_id,
                pan_id: zb::esp_zb_get_pan_id(),
                channel: zb::esp_zb_get_current_channel(),
                short_address: zb::esp_zb_get_short_address(),
            }
        }
    }
}

/// Writes into the stack's attribute tables under the stack lock.
pub struct EspAttributeStore;

impl AttributeStore for EspAttributeStore {
    fn set_attribute(
        &self,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Result<(), StackError> {
        let mut payload = attribute_bytes(&value);
        let status = unsafe {
            zb::esp_zb_lock_acquire(BLOCK);
            let status = zb::esp_zb_zcl_set_attribute_val(
                endpoint,
                cluster,
                ClusterRole::Server.code(),
                attribute,
                payload.as_mut_ptr().cast(),
                false,
            );
            zb::esp_zb_lock_release();
            status
        };

        if status == 0 {
            Ok(())
        } else {
            Err(StackError::new(status as i32, "ZCL_STATUS_FAIL"))
        }
    }
}

pub fn configure_platform() -> Result<(), EspError> {
    let mut platform = zb::esp_zb_platform_config_t::default();
    esp!(unsafe { zb::esp_zb_platform_config(&mut platform) })
}

/// Initializes the stack as an end device, registers the endpoint and runs the
/// stack main loop. Does not return while the stack is healthy.
pub fn run_stack(
    config: &ZigbeeConfig,
    deferred_init: DeferredInit,
) -> anyhow::Result<()> {
    let endpoint = EndpointDescriptor::from_config(config);

    *COMMISSIONER.lock().unwrap_or_else(PoisonError::into_inner) = Some(Commissioner::new(
        EspZigbeeStack,
        Duration::from_millis(u64::from(config.steering_retry_ms)),
        deferred_init,
    ));

    let mut stack_config = zb::esp_zb_cfg_t::default();
    stack_config.esp_zb_role = DEVICE_TYPE_END_DEVICE as _;
    stack_config.install_code_policy = false;
    stack_config.nwk_cfg.zed_cfg = zb::esp_zb_zed_cfg_t {
        ed_timeout: config.ed_timeout.code(),
        keep_alive: config.keep_alive_ms,
    };
    unsafe { zb::esp_zb_init(&mut stack_config) };

    register_endpoint(&endpoint)?;
    info!(
        "registered endpoint {} with {} clusters",
        endpoint.endpoint,
        endpoint.clusters.len()
    );

    unsafe {
        zb::esp_zb_core_action_handler_register(Some(core_action));
        esp!(zb::esp_zb_set_primary_network_channel_set(config.channel_mask))?;
        esp!(zb::esp_zb_start(false))?;
        zb::esp_zb_stack_main_loop();
    }
    Ok(())
}

fn register_endpoint(endpoint: &EndpointDescriptor) -> anyhow::Result<()> {
    let missing = |id: u16| anyhow!("endpoint layout has no cluster {id:#06x}");
    let basic = endpoint.cluster(CLUSTER_BASIC).ok_or_else(|| missing(CLUSTER_BASIC))?;
    let on_off = endpoint.cluster(CLUSTER_ON_OFF).ok_or_else(|| missing(CLUSTER_ON_OFF))?;
    let temperature = endpoint
        .cluster(CLUSTER_TEMPERATURE_MEASUREMENT)
        .ok_or_else(|| missing(CLUSTER_TEMPERATURE_MEASUREMENT))?;
    let humidity = endpoint
        .cluster(CLUSTER_RELATIVE_HUMIDITY)
        .ok_or_else(|| missing(CLUSTER_RELATIVE_HUMIDITY))?;

    let server = ClusterRole::Server.code();
    unsafe {
        let mut basic_config = zb::esp_zb_basic_cluster_cfg_t {
            zcl_version: u8_attr(basic, ATTR_BASIC_ZCL_VERSION),
            power_source: u8_attr(basic, ATTR_BASIC_POWER_SOURCE),
        };
        let basic_attrs = zb::esp_zb_basic_cluster_create(&mut basic_config);
        for id in [ATTR_BASIC_MANUFACTURER_NAME, ATTR_BASIC_MODEL_IDENTIFIER] {
            if let Some(AttributeValue::CharString(value)) =
                basic.attribute(id).map(|attribute| &attribute.value)
            {
                // The stack copies the string into its own table.
                let mut value = value.clone();
                esp!(zb::esp_zb_basic_cluster_add_attr(
                    basic_attrs,
                    id,
                    value.as_mut_ptr().cast()
                ))?;
            }
        }

        let mut on_off_config = zb::esp_zb_on_off_cluster_cfg_t {
            on_off: matches!(
                on_off.attribute(ATTR_ON_OFF).map(|attribute| &attribute.value),
                Some(AttributeValue::Bool(true))
            ),
        };
        let on_off_attrs = zb::esp_zb_on_off_cluster_create(&mut on_off_config);

        let mut temperature_config = zb::esp_zb_temperature_meas_cluster_cfg_t {
            measured_value: i16_attr(temperature, ATTR_MEASURED_VALUE),
            min_value: i16_attr(temperature, ATTR_MIN_MEASURED_VALUE),
            max_value: i16_attr(temperature, ATTR_MAX_MEASURED_VALUE),
        };
        let temperature_attrs = zb::esp_zb_temperature_meas_cluster_create(&mut temperature_config);

        let mut humidity_config = zb::esp_zb_humidity_meas_cluster_cfg_t {
            measured_value: u16_attr(humidity, ATTR_MEASURED_VALUE),
            min_value: u16_attr(humidity, ATTR_MIN_MEASURED_VALUE),
            max_value: u16_attr(humidity, ATTR_MAX_MEASURED_VALUE),
        };
        let humidity_attrs = zb::esp_zb_humidity_meas_cluster_create(&mut humidity_config);

        let cluster_list = zb::esp_zb_zcl_cluster_list_create();
        esp!(zb::esp_zb_cluster_list_add_basic_cluster(cluster_list, basic_attrs, server))?;
        esp!(zb::esp_zb_cluster_list_add_on_off_cluster(cluster_list, on_off_attrs, server))?;
        esp!(zb::esp_zb_cluster_list_add_temperature_meas_cluster(
            cluster_list,
            temperature_attrs,
            server
        ))?;
        esp!(zb::esp_zb_cluster_list_add_humidity_meas_cluster(
            cluster_list,
            humidity_attrs,
            server
        ))?;

        let endpoint_config = zb::esp_zb_endpoint_config_t {
            endpoint: endpoint.endpoint,
            app_profile_id: endpoint.profile_id,
            app_device_id: endpoint.device_id,
            ..Default::default()
        };
        let endpoint_list = zb::esp_zb_ep_list_create();
        esp!(zb::esp_zb_ep_list_add_ep(endpoint_list, cluster_list, endpoint_config))?;
        esp!(zb::esp_zb_device_register(endpoint_list))?;

        for entry in &endpoint.reporting {
            let mut reporting = zb::esp_zb_zcl_reporting_info_t {
                direction: REPORT_DIRECTION_SEND,
                ep: entry.endpoint,
                cluster_id: entry.cluster,
                cluster_role: server,
                attr_id: entry.attribute,
                manuf_code: zb::ESP_ZB_ZCL_ATTR_NON_MANUFACTURER_SPECIFIC as u16,
                ..Default::default()
            };
            reporting.dst.profile_id = endpoint.profile_id;
            reporting.u.send_info.min_interval = entry.min_interval_s;
            reporting.u.send_info.max_interval = entry.max_interval_s;
            reporting.u.send_info.def_min_interval = entry.min_interval_s;
            reporting.u.send_info.def_max_interval = entry.max_interval_s;
            reporting.u.send_info.delta.u16_ = entry.reportable_change;
            esp!(zb::esp_zb_zcl_update_reporting_info(&mut reporting))?;
        }
    }
    Ok(())
}

fn u8_attr(cluster: &ClusterDescriptor, id: u16) -> u8 {
    match cluster.attribute(id).map(|attribute| &attribute.value) {
        Some(AttributeValue::U8(value)) => *value,
        _ => 0,
    }
}

fn i16_attr(cluster: &ClusterDescriptor, id: u16) -> i16 {
    match cluster.attribute(id).map(|attribute| &attribute.value) {
        Some(AttributeValue::I16(value)) => *value,
        _ => 0,
    }
}

fn u16_attr(cluster: &ClusterDescriptor, id: u16) -> u16 {
    match cluster.attribute(id).map(|attribute| &attribute.value) {
        Some(AttributeValue::U16(value)) => *value,
        _ => 0,
    }
}

/// Native byte layout the stack expects behind its `void *` value pointers.
fn attribute_bytes(value: &AttributeValue) -> Vec<u8> {
    match value {
        AttributeValue::Bool(value) => vec![u8::from(*value)],
        AttributeValue::U8(value) => vec![*value],
        AttributeValue::I16(value) => value.to_ne_bytes().to_vec(),
        AttributeValue::U16(value) => value.to_ne_bytes().to_vec(),
        AttributeValue::CharString(value) => value.clone(),
    }
}

fn signal_status(code: esp_err_t) -> SignalStatus {
    if code == ESP_OK as esp_err_t {
        return Ok(());
    }
    let name = unsafe { CStr::from_ptr(esp_err_to_name(code)) };
    Err(StackError::new(code, name.to_string_lossy()))
}

fn with_commissioner(f: impl FnOnce(&mut Commissioner<EspZigbeeStack>)) {
    let mut commissioner = COMMISSIONER.lock().unwrap_or_else(PoisonError::into_inner);
    match commissioner.as_mut() {
        Some(commissioner) => f(commissioner),
        None => warn!("zigbee signal before commissioner was installed"),
    }
}

/// Entry point the stack calls for every application signal.
#[no_mangle]
extern "C" fn esp_zb_app_signal_handler(signal: *mut zb::esp_zb_app_signal_t) {
    // SAFETY: the stack passes a valid signal for the duration of the call.
    let Some(signal) = (unsafe { signal.as_ref() }) else {
        return;
    };
    if signal.p_app_signal.is_null() {
        return;
    }
    let code = unsafe { *signal.p_app_signal };
    let status = signal_status(signal.esp_err_status);

    with_commissioner(|commissioner| {
        commissioner.handle_signal(AppSignal::from_code(code), status)
    });
}

unsafe extern "C" fn steering_retry(mode: u8) {
    let Some(mode) = CommissioningMode::from_code(mode) else {
        warn!("unknown commissioning mode {mode} in retry alarm");
        return;
    };
    with_commissioner(|commissioner| {
        commissioner.on_retry_started();
        if let Err(err) = commissioner.stack_mut().start_commissioning(mode) {
            warn!("Failed to start Zigbee bdb commissioning: {err}");
        }
    });
}

unsafe extern "C" fn core_action(
    callback_id: zb::esp_zb_core_action_callback_id_t,
    message: *const c_void,
) -> esp_err_t {
    let action = if callback_id as u32 == CoreAction::SET_ATTR_VALUE_CB_ID {
        match unsafe { decode_set_attribute(message) } {
            Some(write) => CoreAction::SetAttributeValue(write),
            None => return ESP_FAIL as esp_err_t,
        }
    } else {
        CoreAction::Other(callback_id as u32)
    };

    match LIGHT.handle(&action) {
        Ok(()) => ESP_OK as esp_err_t,
        Err(err) => err.code,
    }
}

/// Decodes `esp_zb_zcl_set_attr_value_message_t`. Returns `None` for a null
/// message.
unsafe fn decode_set_attribute(message: *const c_void) -> Option<AttributeWrite> {
    let message = unsafe { message.cast::<zb::esp_zb_zcl_set_attr_value_message_t>().as_ref()? };
    let data = &message.attribute.data;
    let raw = data.value.cast::<u8>();

    let value = if raw.is_null() {
        AttributeValue::CharString(Vec::new())
    } else {
        match u32::from(data.type_) {
            zb::esp_zb_zcl_attr_type_t_ESP_ZB_ZCL_ATTR_TYPE_BOOL => {
                AttributeValue::Bool(unsafe { *raw } != 0)
            }
            zb::esp_zb_zcl_attr_type_t_ESP_ZB_ZCL_ATTR_TYPE_U8 => {
                AttributeValue::U8(unsafe { *raw })
            }
            zb::esp_zb_zcl_attr_type_t_ESP_ZB_ZCL_ATTR_TYPE_U16 => {
                AttributeValue::U16(unsafe { ptr::read_unaligned(raw.cast::<u16>()) })
            }
            zb::esp_zb_zcl_attr_type_t_ESP_ZB_ZCL_ATTR_TYPE_S16 => {
                AttributeValue::I16(unsafe { ptr::read_unaligned(raw.cast::<i16>()) })
            }
            _ => {
                // Opaque payload: keep the bytes the stack reported.
                let len = usize::from(data.size);
                AttributeValue::CharString(unsafe { std::slice::from_raw_parts(raw, len) }.to_vec())
            }
        }
    };

    Some(AttributeWrite {
        status: message.info.status as u8,
        endpoint: message.info.dst_endpoint,
        cluster: message.info.cluster,
        attribute: message.attribute.id,
        value,
    })
}

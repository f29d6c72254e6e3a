//! Core Audio 宿主
//!
//! - 设备属性：AudioObject* (HAL)
//! - 流：AUHAL 输出单元，输入方向开启 IO 后通过 AudioUnitRender 拉取
//! - 转换：AudioConverter，拉模式输入过程
//! - 监听：AudioObjectAddPropertyListener，每个注册一个堆上条目

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use core_foundation::base::TCFType;
use core_foundation::string::{CFString, CFStringRef};

use super::{
    AudioHost, DeviceId, FrameRange, HostError, IoHandler, ListenTarget, ListenerKey,
    NativeConverter, NativeUnit, Property, PropertyListener, Pull, PullSource, UNKNOWN_DEVICE,
};
use crate::audio::format::{NativeFormat, StreamDirection};

/// Core Audio 类型定义
type AudioObjectID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type OSStatus = i32;
type AudioUnit = *mut c_void;
type AudioComponent = *mut c_void;
type AudioConverterRef = *mut c_void;

const NO_ERR: OSStatus = 0;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEVICES: AudioObjectPropertySelector = 0x64657623; // 'dev#'
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_INPUT_DEVICE: AudioObjectPropertySelector = 0x64496E20; // 'dIn '
const K_AUDIO_HARDWARE_PROPERTY_TRANSLATE_UID_TO_DEVICE: AudioObjectPropertySelector = 0x75696464; // 'uidd'
const K_AUDIO_DEVICE_PROPERTY_DEVICE_IS_ALIVE: AudioObjectPropertySelector = 0x6C69766E; // 'livn'
const K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE: AudioObjectPropertySelector = 0x6E737274; // 'nsrt'
const K_AUDIO_DEVICE_PROPERTY_PROCESSOR_OVERLOAD: AudioObjectPropertySelector = 0x6F766572; // 'over'
const K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE: AudioObjectPropertySelector = 0x6673697A; // 'fsiz'
const K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE_RANGE: AudioObjectPropertySelector = 0x66737A23; // 'fsz#'
const K_AUDIO_DEVICE_PROPERTY_STREAM_CONFIGURATION: AudioObjectPropertySelector = 0x736C6179; // 'slay'

const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_INPUT: AudioObjectPropertyScope = 0x696E7074; // 'inpt'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT: AudioObjectPropertyScope = 0x6F757470; // 'outp'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const K_AUDIO_UNIT_SCOPE_GLOBAL: u32 = 0;
const K_AUDIO_UNIT_SCOPE_INPUT: u32 = 1;
const K_AUDIO_UNIT_SCOPE_OUTPUT: u32 = 2;

/// AUHAL 总线：0 = 输出，1 = 输入
const OUTPUT_BUS: u32 = 0;
const INPUT_BUS: u32 = 1;

const K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT: u32 = 8;
const K_AUDIO_UNIT_PROPERTY_MAXIMUM_FRAMES_PER_SLICE: u32 = 14;
const K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK: u32 = 23;
const K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE: u32 = 2000;
const K_AUDIO_OUTPUT_UNIT_PROPERTY_IS_RUNNING: u32 = 2001;
const K_AUDIO_OUTPUT_UNIT_PROPERTY_ENABLE_IO: u32 = 2003;
const K_AUDIO_OUTPUT_UNIT_PROPERTY_SET_INPUT_CALLBACK: u32 = 2005;

const K_AUDIO_UNIT_TYPE_OUTPUT: u32 = 0x61756F75; // 'auou'
const K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT: u32 = 0x6168616C; // 'ahal'
const K_AUDIO_UNIT_MANUFACTURER_APPLE: u32 = 0x6170706C; // 'appl'

const K_AUDIO_CONVERTER_CHANNEL_MAP: u32 = 0x63686D70; // 'chmp'

// 错误码
const K_AUDIO_HARDWARE_BAD_OBJECT_ERROR: OSStatus = 0x216F626A; // '!obj'
const K_AUDIO_HARDWARE_BAD_DEVICE_ERROR: OSStatus = 0x21646576; // '!dev'
const K_AUDIO_HARDWARE_UNKNOWN_PROPERTY_ERROR: OSStatus = 0x77686F3F; // 'who?'
const K_AUDIO_HARDWARE_UNSUPPORTED_OPERATION_ERROR: OSStatus = 0x756E6F70; // 'unop'
const K_AUDIO_CONVERTER_ERR_FORMAT_NOT_SUPPORTED: OSStatus = 0x666D743F; // 'fmt?'
const K_AUDIO_UNIT_ERR_INVALID_PROPERTY: OSStatus = -10879;
const K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED: OSStatus = -10868;

/// 输入过程的私有状态码：源数据耗尽，不是错误
const STATUS_END_OF_DATA: OSStatus = 0x656F6421; // 'eod!'
/// 输入过程的私有状态码：源返回错误
const STATUS_PULL_FAILED: OSStatus = 0x70756C21; // 'pul!'
/// 回调里的 staging 不够大
const STATUS_BUFFER_TOO_SMALL: OSStatus = 0x62756621; // 'buf!'

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

impl From<&NativeFormat> for AudioStreamBasicDescription {
    fn from(f: &NativeFormat) -> Self {
        Self {
            sample_rate: f.sample_rate,
            format_id: f.format_id,
            format_flags: f.format_flags,
            bytes_per_packet: f.bytes_per_packet,
            frames_per_packet: f.frames_per_packet,
            bytes_per_frame: f.bytes_per_frame,
            channels_per_frame: f.channels_per_frame,
            bits_per_channel: f.bits_per_channel,
            reserved: 0,
        }
    }
}

impl From<AudioStreamBasicDescription> for NativeFormat {
    fn from(d: AudioStreamBasicDescription) -> Self {
        Self {
            sample_rate: d.sample_rate,
            format_id: d.format_id,
            format_flags: d.format_flags,
            bytes_per_packet: d.bytes_per_packet,
            frames_per_packet: d.frames_per_packet,
            bytes_per_frame: d.bytes_per_frame,
            channels_per_frame: d.channels_per_frame,
            bits_per_channel: d.bits_per_channel,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AudioValueRange {
    minimum: f64,
    maximum: f64,
}

#[repr(C)]
struct AudioComponentDescription {
    component_type: u32,
    component_sub_type: u32,
    component_manufacturer: u32,
    component_flags: u32,
    component_flags_mask: u32,
}

/// 只透传，不读取
#[repr(C)]
struct AudioTimeStamp {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

/// 交织格式只有一个 buffer；设备流配置用可变长度读取
#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1],
}

type RenderCallback = extern "C" fn(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const AudioTimeStamp,
    in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus;

#[repr(C)]
struct AURenderCallbackStruct {
    input_proc: RenderCallback,
    input_proc_ref_con: *mut c_void,
}

type PropertyListenerProc = extern "C" fn(
    object_id: AudioObjectID,
    number_addresses: u32,
    addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus;

type ConverterInputProc = extern "C" fn(
    converter: AudioConverterRef,
    io_number_packets: *mut u32,
    io_data: *mut AudioBufferList,
    out_packet_descriptions: *mut *mut c_void,
    user_data: *mut c_void,
) -> OSStatus;

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyDataSize(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        out_data_size: *mut u32,
    ) -> OSStatus;

    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        io_data_size: *mut u32,
        out_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectSetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: u32,
        data: *const c_void,
    ) -> OSStatus;

    fn AudioObjectAddPropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectRemovePropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;
}

#[link(name = "AudioToolbox", kind = "framework")]
extern "C" {
    fn AudioComponentFindNext(
        component: AudioComponent,
        desc: *const AudioComponentDescription,
    ) -> AudioComponent;

    fn AudioComponentInstanceNew(component: AudioComponent, out_instance: *mut AudioUnit) -> OSStatus;
    fn AudioComponentInstanceDispose(instance: AudioUnit) -> OSStatus;

    fn AudioUnitInitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitUninitialize(unit: AudioUnit) -> OSStatus;
    fn AudioUnitReset(unit: AudioUnit, scope: u32, element: u32) -> OSStatus;
    fn AudioOutputUnitStart(unit: AudioUnit) -> OSStatus;
    fn AudioOutputUnitStop(unit: AudioUnit) -> OSStatus;

    fn AudioUnitSetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *const c_void,
        data_size: u32,
    ) -> OSStatus;

    fn AudioUnitGetProperty(
        unit: AudioUnit,
        property_id: u32,
        scope: u32,
        element: u32,
        data: *mut c_void,
        data_size: *mut u32,
    ) -> OSStatus;

    fn AudioUnitRender(
        unit: AudioUnit,
        io_action_flags: *mut u32,
        in_time_stamp: *const AudioTimeStamp,
        in_output_bus_number: u32,
        in_number_frames: u32,
        io_data: *mut AudioBufferList,
    ) -> OSStatus;

    fn AudioConverterNew(
        source: *const AudioStreamBasicDescription,
        destination: *const AudioStreamBasicDescription,
        out_converter: *mut AudioConverterRef,
    ) -> OSStatus;

    fn AudioConverterDispose(converter: AudioConverterRef) -> OSStatus;
    fn AudioConverterReset(converter: AudioConverterRef) -> OSStatus;

    fn AudioConverterSetProperty(
        converter: AudioConverterRef,
        property_id: u32,
        data_size: u32,
        data: *const c_void,
    ) -> OSStatus;

    fn AudioConverterFillComplexBuffer(
        converter: AudioConverterRef,
        input_proc: ConverterInputProc,
        user_data: *mut c_void,
        io_output_packets: *mut u32,
        out_data: *mut AudioBufferList,
        out_packet_descriptions: *mut c_void,
    ) -> OSStatus;
}

// === 状态码与属性访问 ===

fn check(status: OSStatus) -> Result<(), HostError> {
    match status {
        NO_ERR => Ok(()),
        K_AUDIO_HARDWARE_BAD_OBJECT_ERROR => Err(HostError::BadObject),
        K_AUDIO_HARDWARE_BAD_DEVICE_ERROR => Err(HostError::BadDevice),
        K_AUDIO_CONVERTER_ERR_FORMAT_NOT_SUPPORTED | K_AUDIO_UNIT_ERR_FORMAT_NOT_SUPPORTED => {
            Err(HostError::FormatUnsupported)
        }
        K_AUDIO_HARDWARE_UNKNOWN_PROPERTY_ERROR
        | K_AUDIO_HARDWARE_UNSUPPORTED_OPERATION_ERROR
        | K_AUDIO_UNIT_ERR_INVALID_PROPERTY => Err(HostError::Unsupported),
        other => Err(HostError::Status(other)),
    }
}

fn direction_scope(direction: StreamDirection) -> AudioObjectPropertyScope {
    match direction {
        StreamDirection::Input => K_AUDIO_OBJECT_PROPERTY_SCOPE_INPUT,
        StreamDirection::Output => K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
    }
}

fn address(selector: AudioObjectPropertySelector, scope: AudioObjectPropertyScope) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        selector,
        scope,
        element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
    }
}

fn get_property<T: Copy + Default>(
    object: AudioObjectID,
    address: &AudioObjectPropertyAddress,
) -> Result<T, HostError> {
    let mut value = T::default();
    let mut size = std::mem::size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };
    check(status)?;
    Ok(value)
}

fn get_property_array<T: Copy + Default>(
    object: AudioObjectID,
    address: &AudioObjectPropertyAddress,
) -> Result<Vec<T>, HostError> {
    let mut size = 0u32;
    check(unsafe { AudioObjectGetPropertyDataSize(object, address, 0, ptr::null(), &mut size) })?;

    let count = size as usize / std::mem::size_of::<T>();
    let mut values = vec![T::default(); count];
    if count == 0 {
        return Ok(values);
    }

    check(unsafe {
        AudioObjectGetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            &mut size,
            values.as_mut_ptr() as *mut c_void,
        )
    })?;
    values.truncate(size as usize / std::mem::size_of::<T>());
    Ok(values)
}

fn set_property<T>(
    object: AudioObjectID,
    address: &AudioObjectPropertyAddress,
    value: &T,
) -> Result<(), HostError> {
    check(unsafe {
        AudioObjectSetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            std::mem::size_of::<T>() as u32,
            value as *const T as *const c_void,
        )
    })
}

/// 读取 CFString 属性（调用方获得所有权）
fn get_string(object: AudioObjectID, selector: AudioObjectPropertySelector) -> Result<String, HostError> {
    let address = address(selector, K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL);
    let mut size = std::mem::size_of::<CFStringRef>() as u32;
    let mut cf_string_ref: CFStringRef = ptr::null();

    check(unsafe {
        AudioObjectGetPropertyData(
            object,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut cf_string_ref as *mut CFStringRef as *mut c_void,
        )
    })?;

    if cf_string_ref.is_null() {
        return Err(HostError::Unsupported);
    }

    // wrap_under_create_rule 表示我们拥有这个引用（需要 release）
    let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref) };
    Ok(cf_string.to_string())
}

// === 宿主 ===

/// 一个已注册的属性监听；堆上地址作为 client data 交给 HAL
struct ListenerEntry {
    object: AudioObjectID,
    address: AudioObjectPropertyAddress,
    property: Property,
    listener: Arc<dyn PropertyListener>,
}

/// macOS Core Audio 宿主
pub struct CoreAudioHost {
    listeners: Mutex<HashMap<u64, Box<ListenerEntry>>>,
    next_key: AtomicU64,
}

impl CoreAudioHost {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        }
    }

    fn listen_address(target: ListenTarget) -> (AudioObjectID, AudioObjectPropertyAddress) {
        let object = match target {
            ListenTarget::System(_) => K_AUDIO_OBJECT_SYSTEM_OBJECT,
            ListenTarget::Device(device, _) => device,
        };
        let selector = match target.property() {
            Property::DefaultDevice(StreamDirection::Output) => K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            Property::DefaultDevice(StreamDirection::Input) => K_AUDIO_HARDWARE_PROPERTY_DEFAULT_INPUT_DEVICE,
            Property::DeviceIsAlive => K_AUDIO_DEVICE_PROPERTY_DEVICE_IS_ALIVE,
            Property::NominalSampleRate => K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            Property::ProcessorOverload => K_AUDIO_DEVICE_PROPERTY_PROCESSOR_OVERLOAD,
        };
        (object, address(selector, K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL))
    }

    fn find_hal_output() -> Result<AudioComponent, HostError> {
        let desc = AudioComponentDescription {
            component_type: K_AUDIO_UNIT_TYPE_OUTPUT,
            component_sub_type: K_AUDIO_UNIT_SUB_TYPE_HAL_OUTPUT,
            component_manufacturer: K_AUDIO_UNIT_MANUFACTURER_APPLE,
            component_flags: 0,
            component_flags_mask: 0,
        };
        let component = unsafe { AudioComponentFindNext(ptr::null_mut(), &desc) };
        if component.is_null() {
            return Err(HostError::Unsupported);
        }
        Ok(component)
    }
}

impl Default for CoreAudioHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoreAudioHost {
    fn drop(&mut self) {
        let entries: Vec<_> = self
            .listeners
            .get_mut()
            .map(|map| map.drain().collect())
            .unwrap_or_default();
        for (_, entry) in entries {
            let client_data = &*entry as *const ListenerEntry as *mut c_void;
            unsafe {
                AudioObjectRemovePropertyListener(entry.object, &entry.address, property_listener_proc, client_data);
            }
        }
    }
}

impl AudioHost for CoreAudioHost {
    fn devices(&self) -> Result<Vec<DeviceId>, HostError> {
        let address = address(K_AUDIO_HARDWARE_PROPERTY_DEVICES, K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL);
        get_property_array::<AudioObjectID>(K_AUDIO_OBJECT_SYSTEM_OBJECT, &address)
    }

    fn default_device(&self, direction: StreamDirection) -> Result<DeviceId, HostError> {
        let selector = match direction {
            StreamDirection::Output => K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            StreamDirection::Input => K_AUDIO_HARDWARE_PROPERTY_DEFAULT_INPUT_DEVICE,
        };
        let address = address(selector, K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL);
        get_property::<AudioObjectID>(K_AUDIO_OBJECT_SYSTEM_OBJECT, &address)
    }

    fn device_for_uid(&self, uid: &str) -> Result<DeviceId, HostError> {
        let address = address(
            K_AUDIO_HARDWARE_PROPERTY_TRANSLATE_UID_TO_DEVICE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        );
        let cf_uid = CFString::new(uid);
        let uid_ref = cf_uid.as_concrete_TypeRef();
        let mut device: AudioObjectID = UNKNOWN_DEVICE;
        let mut size = std::mem::size_of::<AudioObjectID>() as u32;

        check(unsafe {
            AudioObjectGetPropertyData(
                K_AUDIO_OBJECT_SYSTEM_OBJECT,
                &address,
                std::mem::size_of::<CFStringRef>() as u32,
                &uid_ref as *const CFStringRef as *const c_void,
                &mut size,
                &mut device as *mut AudioObjectID as *mut c_void,
            )
        })?;
        Ok(device)
    }

    fn device_name(&self, device: DeviceId) -> Result<String, HostError> {
        get_string(device, coreaudio_sys::kAudioObjectPropertyName as AudioObjectPropertySelector)
    }

    fn device_uid(&self, device: DeviceId) -> Result<String, HostError> {
        get_string(device, coreaudio_sys::kAudioDevicePropertyDeviceUID as AudioObjectPropertySelector)
    }

    fn channel_count(&self, device: DeviceId, direction: StreamDirection) -> Result<u32, HostError> {
        let address = address(K_AUDIO_DEVICE_PROPERTY_STREAM_CONFIGURATION, direction_scope(direction));

        let mut size = 0u32;
        check(unsafe { AudioObjectGetPropertyDataSize(device, &address, 0, ptr::null(), &mut size) })?;
        if (size as usize) < std::mem::size_of::<u32>() {
            return Ok(0);
        }

        // 按 u64 分配保证 AudioBuffer 的对齐
        let mut storage = vec![0u64; (size as usize).div_ceil(8)];
        check(unsafe {
            AudioObjectGetPropertyData(
                device,
                &address,
                0,
                ptr::null(),
                &mut size,
                storage.as_mut_ptr() as *mut c_void,
            )
        })?;

        let list = storage.as_ptr() as *const AudioBufferList;
        let count = unsafe { (*list).number_buffers } as usize;
        let header = std::mem::size_of::<AudioBufferList>() - std::mem::size_of::<AudioBuffer>();
        let fits = (size as usize).saturating_sub(header) / std::mem::size_of::<AudioBuffer>();
        let buffers = unsafe { std::slice::from_raw_parts((*list).buffers.as_ptr(), count.min(fits)) };

        Ok(buffers.iter().map(|b| b.number_channels).sum())
    }

    fn is_alive(&self, device: DeviceId) -> Result<bool, HostError> {
        let address = address(K_AUDIO_DEVICE_PROPERTY_DEVICE_IS_ALIVE, K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL);
        Ok(get_property::<u32>(device, &address)? != 0)
    }

    fn buffer_frame_size(&self, device: DeviceId, direction: StreamDirection) -> Result<u32, HostError> {
        let address = address(K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE, direction_scope(direction));
        get_property::<u32>(device, &address)
    }

    fn set_buffer_frame_size(
        &self,
        device: DeviceId,
        direction: StreamDirection,
        frames: u32,
    ) -> Result<(), HostError> {
        let address = address(K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE, direction_scope(direction));
        set_property(device, &address, &frames)
    }

    fn buffer_frame_size_ranges(
        &self,
        device: DeviceId,
        direction: StreamDirection,
    ) -> Result<Vec<FrameRange>, HostError> {
        let address = address(K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE_RANGE, direction_scope(direction));
        let ranges = get_property_array::<AudioValueRange>(device, &address)?;
        Ok(ranges
            .iter()
            .map(|r| FrameRange {
                min: r.minimum as u32,
                max: r.maximum as u32,
            })
            .collect())
    }

    fn open_unit(
        &self,
        device: DeviceId,
        direction: StreamDirection,
    ) -> Result<Box<dyn NativeUnit>, HostError> {
        let component = Self::find_hal_output()?;

        let mut audio_unit: AudioUnit = ptr::null_mut();
        check(unsafe { AudioComponentInstanceNew(component, &mut audio_unit) })?;

        // 先包起来，后续失败由 Drop 释放
        let mut unit = CoreAudioUnit::new(audio_unit, direction);

        if direction == StreamDirection::Input {
            unit.set_u32(K_AUDIO_OUTPUT_UNIT_PROPERTY_ENABLE_IO, K_AUDIO_UNIT_SCOPE_INPUT, INPUT_BUS, 1)?;
            unit.set_u32(K_AUDIO_OUTPUT_UNIT_PROPERTY_ENABLE_IO, K_AUDIO_UNIT_SCOPE_OUTPUT, OUTPUT_BUS, 0)?;
        }
        unit.set_u32(K_AUDIO_OUTPUT_UNIT_PROPERTY_CURRENT_DEVICE, K_AUDIO_UNIT_SCOPE_GLOBAL, 0, device)?;

        log::debug!("AUHAL {} unit opened on device {}", direction, device);
        Ok(Box::new(unit))
    }

    fn new_converter(
        &self,
        source: &NativeFormat,
        target: &NativeFormat,
    ) -> Result<Box<dyn NativeConverter>, HostError> {
        let src = AudioStreamBasicDescription::from(source);
        let dst = AudioStreamBasicDescription::from(target);

        let mut converter: AudioConverterRef = ptr::null_mut();
        check(unsafe { AudioConverterNew(&src, &dst, &mut converter) })?;

        Ok(Box::new(CoreAudioConverter {
            converter,
            staging: vec![0u8; CONVERTER_STAGING_FRAMES * source.bytes_per_frame as usize],
            source_bpf: source.bytes_per_frame,
            source_channels: source.channels_per_frame,
            target_bpf: target.bytes_per_frame,
            target_channels: target.channels_per_frame,
        }))
    }

    fn add_listener(
        &self,
        target: ListenTarget,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<ListenerKey, HostError> {
        let (object, address) = Self::listen_address(target);
        let entry = Box::new(ListenerEntry {
            object,
            address,
            property: target.property(),
            listener,
        });
        let client_data = &*entry as *const ListenerEntry as *mut c_void;

        check(unsafe { AudioObjectAddPropertyListener(object, &address, property_listener_proc, client_data) })?;

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
        Ok(ListenerKey(key))
    }

    fn remove_listener(&self, key: ListenerKey) -> Result<(), HostError> {
        let entry = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key.0)
            .ok_or(HostError::BadObject)?;

        let client_data = &*entry as *const ListenerEntry as *mut c_void;
        let status = unsafe {
            AudioObjectRemovePropertyListener(entry.object, &entry.address, property_listener_proc, client_data)
        };
        // HAL 返回后不会再回调这个条目，可以释放
        drop(entry);
        check(status)
    }
}

/// HAL 通知线程上调用
extern "C" fn property_listener_proc(
    object_id: AudioObjectID,
    _number_addresses: u32,
    _addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() {
        return NO_ERR;
    }
    let entry = unsafe { &*(client_data as *const ListenerEntry) };
    entry.listener.property_changed(object_id, entry.property);
    NO_ERR
}

// === AUHAL 单元 ===

/// 回调上下文：地址在单元生命周期内固定
struct UnitContext {
    audio_unit: AudioUnit,
    handler: Option<Box<dyn IoHandler>>,
    /// 录音时 AudioUnitRender 的目标缓冲，initialize 时预分配
    staging: Vec<u8>,
    client_bpf: usize,
    client_channels: u32,
}

pub struct CoreAudioUnit {
    audio_unit: AudioUnit,
    direction: StreamDirection,
    context: Box<UnitContext>,
    callback_installed: bool,
    initialized: bool,
}

// AudioUnit 句柄可以跨线程使用；回调上下文只在停止后修改
unsafe impl Send for CoreAudioUnit {}

impl CoreAudioUnit {
    fn new(audio_unit: AudioUnit, direction: StreamDirection) -> Self {
        Self {
            audio_unit,
            direction,
            context: Box::new(UnitContext {
                audio_unit,
                handler: None,
                staging: Vec::new(),
                client_bpf: 0,
                client_channels: 0,
            }),
            callback_installed: false,
            initialized: false,
        }
    }

    /// 客户端一侧（回调格式）的 scope/element
    fn client_side(&self) -> (u32, u32) {
        match self.direction {
            StreamDirection::Output => (K_AUDIO_UNIT_SCOPE_INPUT, OUTPUT_BUS),
            StreamDirection::Input => (K_AUDIO_UNIT_SCOPE_OUTPUT, INPUT_BUS),
        }
    }

    /// 设备一侧的 scope/element
    fn device_side(&self) -> (u32, u32) {
        match self.direction {
            StreamDirection::Output => (K_AUDIO_UNIT_SCOPE_OUTPUT, OUTPUT_BUS),
            StreamDirection::Input => (K_AUDIO_UNIT_SCOPE_INPUT, INPUT_BUS),
        }
    }

    fn set_u32(&mut self, property: u32, scope: u32, element: u32, value: u32) -> Result<(), HostError> {
        check(unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                property,
                scope,
                element,
                &value as *const u32 as *const c_void,
                std::mem::size_of::<u32>() as u32,
            )
        })
    }

    fn get_u32(&self, property: u32, scope: u32, element: u32) -> Result<u32, HostError> {
        let mut value = 0u32;
        let mut size = std::mem::size_of::<u32>() as u32;
        check(unsafe {
            AudioUnitGetProperty(
                self.audio_unit,
                property,
                scope,
                element,
                &mut value as *mut u32 as *mut c_void,
                &mut size,
            )
        })?;
        Ok(value)
    }

    fn install_callback(&mut self) -> Result<(), HostError> {
        if self.callback_installed {
            return Ok(());
        }

        let ref_con = &mut *self.context as *mut UnitContext as *mut c_void;
        let (property, scope, element, proc_): (u32, u32, u32, RenderCallback) = match self.direction {
            StreamDirection::Output => (
                K_AUDIO_UNIT_PROPERTY_SET_RENDER_CALLBACK,
                K_AUDIO_UNIT_SCOPE_INPUT,
                OUTPUT_BUS,
                render_proc,
            ),
            StreamDirection::Input => (
                K_AUDIO_OUTPUT_UNIT_PROPERTY_SET_INPUT_CALLBACK,
                K_AUDIO_UNIT_SCOPE_GLOBAL,
                0,
                input_proc,
            ),
        };
        let callback = AURenderCallbackStruct {
            input_proc: proc_,
            input_proc_ref_con: ref_con,
        };

        check(unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                property,
                scope,
                element,
                &callback as *const _ as *const c_void,
                std::mem::size_of::<AURenderCallbackStruct>() as u32,
            )
        })?;
        self.callback_installed = true;
        Ok(())
    }
}

impl NativeUnit for CoreAudioUnit {
    fn device_format(&self) -> Result<NativeFormat, HostError> {
        let (scope, element) = self.device_side();
        let mut desc = AudioStreamBasicDescription::default();
        let mut size = std::mem::size_of::<AudioStreamBasicDescription>() as u32;
        check(unsafe {
            AudioUnitGetProperty(
                self.audio_unit,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                scope,
                element,
                &mut desc as *mut _ as *mut c_void,
                &mut size,
            )
        })?;
        Ok(desc.into())
    }

    fn set_client_format(&mut self, format: &NativeFormat) -> Result<(), HostError> {
        let (scope, element) = self.client_side();
        let desc = AudioStreamBasicDescription::from(format);
        check(unsafe {
            AudioUnitSetProperty(
                self.audio_unit,
                K_AUDIO_UNIT_PROPERTY_STREAM_FORMAT,
                scope,
                element,
                &desc as *const _ as *const c_void,
                std::mem::size_of::<AudioStreamBasicDescription>() as u32,
            )
        })?;
        self.context.client_bpf = format.bytes_per_frame();
        self.context.client_channels = format.channels_per_frame;
        Ok(())
    }

    fn set_max_frames_per_slice(&mut self, frames: u32) -> Result<(), HostError> {
        self.set_u32(K_AUDIO_UNIT_PROPERTY_MAXIMUM_FRAMES_PER_SLICE, K_AUDIO_UNIT_SCOPE_GLOBAL, 0, frames)
    }

    fn max_frames_per_slice(&self) -> Result<u32, HostError> {
        self.get_u32(K_AUDIO_UNIT_PROPERTY_MAXIMUM_FRAMES_PER_SLICE, K_AUDIO_UNIT_SCOPE_GLOBAL, 0)
    }

    fn initialize(&mut self) -> Result<(), HostError> {
        check(unsafe { AudioUnitInitialize(self.audio_unit) })?;
        self.initialized = true;

        if self.direction == StreamDirection::Input {
            let frames = self.max_frames_per_slice()? as usize;
            self.context.staging = vec![0u8; frames * self.context.client_bpf];
        }
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<(), HostError> {
        if !self.initialized {
            return Ok(());
        }
        check(unsafe { AudioUnitUninitialize(self.audio_unit) })?;
        self.initialized = false;
        Ok(())
    }

    fn set_io_handler(&mut self, handler: Box<dyn IoHandler>) -> Result<(), HostError> {
        self.context.handler = Some(handler);
        self.install_callback()
    }

    fn take_io_handler(&mut self) -> Option<Box<dyn IoHandler>> {
        self.context.handler.take()
    }

    fn start(&mut self) -> Result<(), HostError> {
        check(unsafe { AudioOutputUnitStart(self.audio_unit) })
    }

    fn stop(&mut self) -> Result<(), HostError> {
        // 在非 IO 线程上调用时同步等待回调结束
        check(unsafe { AudioOutputUnitStop(self.audio_unit) })
    }

    fn reset(&mut self) -> Result<(), HostError> {
        check(unsafe { AudioUnitReset(self.audio_unit, K_AUDIO_UNIT_SCOPE_GLOBAL, 0) })
    }

    fn is_running(&self) -> Result<bool, HostError> {
        Ok(self.get_u32(K_AUDIO_OUTPUT_UNIT_PROPERTY_IS_RUNNING, K_AUDIO_UNIT_SCOPE_GLOBAL, 0)? != 0)
    }
}

impl Drop for CoreAudioUnit {
    fn drop(&mut self) {
        unsafe {
            AudioOutputUnitStop(self.audio_unit);
            if self.initialized {
                AudioUnitUninitialize(self.audio_unit);
            }
            AudioComponentInstanceDispose(self.audio_unit);
        }
        self.context.handler = None;
    }
}

/// 播放回调
///
/// **绝对禁止：**
/// - 锁
/// - 分配
/// - I/O
extern "C" fn render_proc(
    in_ref_con: *mut c_void,
    _io_action_flags: *mut u32,
    _in_time_stamp: *const AudioTimeStamp,
    _in_bus_number: u32,
    in_number_frames: u32,
    io_data: *mut AudioBufferList,
) -> OSStatus {
    let ctx = unsafe { &mut *(in_ref_con as *mut UnitContext) };
    let buffer = unsafe { &mut (*io_data).buffers[0] };
    if buffer.data.is_null() {
        return NO_ERR;
    }
    let out = unsafe { std::slice::from_raw_parts_mut(buffer.data as *mut u8, buffer.data_byte_size as usize) };

    let written = match ctx.handler.as_mut() {
        Some(handler) => handler.render(out, in_number_frames as usize).min(out.len()),
        None => 0,
    };
    out[written..].fill(0);
    NO_ERR
}

/// 录音回调：从 AUHAL 拉取设备数据到 staging 再交给处理器
extern "C" fn input_proc(
    in_ref_con: *mut c_void,
    io_action_flags: *mut u32,
    in_time_stamp: *const AudioTimeStamp,
    in_bus_number: u32,
    in_number_frames: u32,
    _io_data: *mut AudioBufferList,
) -> OSStatus {
    let ctx = unsafe { &mut *(in_ref_con as *mut UnitContext) };
    let frames = in_number_frames as usize;
    let bytes = frames * ctx.client_bpf;
    if bytes > ctx.staging.len() {
        return STATUS_BUFFER_TOO_SMALL;
    }

    let mut list = AudioBufferList {
        number_buffers: 1,
        buffers: [AudioBuffer {
            number_channels: ctx.client_channels,
            data_byte_size: bytes as u32,
            data: ctx.staging.as_mut_ptr() as *mut c_void,
        }],
    };
    let status = unsafe {
        AudioUnitRender(ctx.audio_unit, io_action_flags, in_time_stamp, in_bus_number, in_number_frames, &mut list)
    };
    if status != NO_ERR {
        return status;
    }

    let got = (list.buffers[0].data_byte_size as usize).min(bytes);
    if let Some(handler) = ctx.handler.as_mut() {
        handler.capture(&ctx.staging[..got], frames);
    }
    NO_ERR
}

// === AudioConverter ===

/// 输入过程每次最多交给转换器的源帧数（AUHAL 每片上限）
const CONVERTER_STAGING_FRAMES: usize = 4096;

pub struct CoreAudioConverter {
    converter: AudioConverterRef,
    /// 交给转换器的源数据副本，保持到下一次输入过程调用
    staging: Vec<u8>,
    source_bpf: u32,
    source_channels: u32,
    target_bpf: u32,
    target_channels: u32,
}

unsafe impl Send for CoreAudioConverter {}

/// 一次 fill 期间输入过程的状态
struct FillState<'a> {
    source: &'a mut dyn PullSource,
    staging: &'a mut [u8],
    source_bpf: u32,
    source_channels: u32,
    error: Option<HostError>,
}

impl NativeConverter for CoreAudioConverter {
    fn set_channel_map(&mut self, map: &[i32]) -> Result<(), HostError> {
        check(unsafe {
            AudioConverterSetProperty(
                self.converter,
                K_AUDIO_CONVERTER_CHANNEL_MAP,
                std::mem::size_of_val(map) as u32,
                map.as_ptr() as *const c_void,
            )
        })
    }

    fn fill(&mut self, out: &mut [u8], source: &mut dyn PullSource) -> Result<usize, HostError> {
        let bpf = self.target_bpf as usize;
        if bpf == 0 {
            return Ok(0);
        }
        let frames = out.len() / bpf;
        if frames == 0 {
            return Ok(0);
        }

        let converter = self.converter;
        let mut state = FillState {
            source,
            staging: &mut self.staging,
            source_bpf: self.source_bpf,
            source_channels: self.source_channels,
            error: None,
        };
        let mut list = AudioBufferList {
            number_buffers: 1,
            buffers: [AudioBuffer {
                number_channels: self.target_channels,
                data_byte_size: (frames * bpf) as u32,
                data: out.as_mut_ptr() as *mut c_void,
            }],
        };
        let mut packets = frames as u32;

        let status = unsafe {
            AudioConverterFillComplexBuffer(
                converter,
                converter_input_proc,
                &mut state as *mut FillState as *mut c_void,
                &mut packets,
                &mut list,
                ptr::null_mut(),
            )
        };

        if let Some(e) = state.error.take() {
            return Err(e);
        }
        match status {
            NO_ERR | STATUS_END_OF_DATA => Ok(packets as usize * bpf),
            other => check(other).map(|_| 0),
        }
    }

    fn reset(&mut self) -> Result<(), HostError> {
        check(unsafe { AudioConverterReset(self.converter) })
    }
}

impl Drop for CoreAudioConverter {
    fn drop(&mut self) {
        unsafe {
            AudioConverterDispose(self.converter);
        }
    }
}

/// 转换器输入过程：源数据耗尽时返回私有状态码，让转换器交出已有结果
extern "C" fn converter_input_proc(
    _converter: AudioConverterRef,
    io_number_packets: *mut u32,
    io_data: *mut AudioBufferList,
    _out_packet_descriptions: *mut *mut c_void,
    user_data: *mut c_void,
) -> OSStatus {
    let state = unsafe { &mut *(user_data as *mut FillState) };
    let requested = unsafe { *io_number_packets } as usize;
    let bpf = state.source_bpf as usize;
    let buffer = unsafe { &mut (*io_data).buffers[0] };
    buffer.number_channels = state.source_channels;

    // 源切片只在 fill 内有效，转换器却可能在下一次 fill 前一直引用，先拷贝
    let capacity = if bpf > 0 { state.staging.len() / bpf } else { 0 };
    let status = match state.source.pull(requested.min(capacity)) {
        Ok(Pull::Data(data)) if !data.is_empty() && bpf > 0 => {
            let len = data.len().min(state.staging.len());
            let len = len - len % bpf;
            state.staging[..len].copy_from_slice(&data[..len]);
            unsafe { *io_number_packets = (len / bpf) as u32 };
            buffer.data = state.staging.as_mut_ptr() as *mut c_void;
            buffer.data_byte_size = len as u32;
            return NO_ERR;
        }
        Ok(_) => STATUS_END_OF_DATA,
        Err(e) => {
            state.error = Some(e);
            STATUS_PULL_FAILED
        }
    };

    unsafe { *io_number_packets = 0 };
    buffer.data = ptr::null_mut();
    buffer.data_byte_size = 0;
    status
}

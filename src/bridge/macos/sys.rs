// Jackson Coxson
// MobileDevice.framework bindings

#![allow(non_camel_case_types, non_snake_case)]

use core_foundation_sys::{base::CFTypeRef, dictionary::CFDictionaryRef, string::CFStringRef};
use libc::{c_int, c_uint, c_void};

#[repr(C)]
pub struct am_device {
    _private: [u8; 0],
}

#[repr(C)]
pub struct am_device_notification {
    _private: [u8; 0],
}

#[repr(C)]
pub struct am_device_notification_callback_info {
    pub dev: *const am_device,
    pub msg: c_uint,
    pub subscription: *const am_device_notification,
}

pub type am_device_notification_callback =
    extern "C" fn(info: *mut am_device_notification_callback_info, cookie: *mut c_void);

pub type am_device_mount_image_callback = extern "C" fn(status: CFDictionaryRef, cookie: *mut c_void);

#[link(name = "MobileDevice", kind = "framework")]
extern "C" {
    pub fn AMDeviceNotificationSubscribe(
        callback: am_device_notification_callback,
        unused0: c_uint,
        unused1: c_uint,
        cookie: *mut c_void,
        subscription: *mut *const am_device_notification,
    ) -> c_int;
    pub fn AMDeviceNotificationUnsubscribe(subscription: *const am_device_notification) -> c_int;

    pub fn AMDeviceRetain(device: *const am_device);
    pub fn AMDeviceRelease(device: *const am_device);
    pub fn AMDeviceCopyDeviceIdentifier(device: *const am_device) -> CFStringRef;

    pub fn AMDeviceConnect(device: *const am_device) -> c_int;
    pub fn AMDeviceDisconnect(device: *const am_device) -> c_int;
    pub fn AMDeviceIsPaired(device: *const am_device) -> c_int;
    pub fn AMDevicePair(device: *const am_device) -> c_int;
    pub fn AMDeviceValidatePairing(device: *const am_device) -> c_int;
    pub fn AMDeviceStartSession(device: *const am_device) -> c_int;
    pub fn AMDeviceStopSession(device: *const am_device) -> c_int;

    pub fn AMDeviceCopyValue(
        device: *const am_device,
        domain: CFStringRef,
        key: CFStringRef,
    ) -> CFTypeRef;

    pub fn AMDeviceStartService(
        device: *const am_device,
        service_name: CFStringRef,
        socket_fd: *mut c_int,
        unknown: *const c_void,
    ) -> c_int;

    pub fn AMDeviceMountImage(
        device: *const am_device,
        image: CFStringRef,
        options: CFDictionaryRef,
        callback: am_device_mount_image_callback,
        cookie: *mut c_void,
    ) -> c_int;

    pub fn AMDeviceGetConnectionID(device: *const am_device) -> c_uint;

    /// `port` is in network byte order
    pub fn USBMuxConnectByPort(connection_id: c_uint, port: c_int, socket_fd: *mut c_int) -> c_int;
}

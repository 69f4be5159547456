// Jackson Coxson
//! MobileDevice.framework adapter (macOS)
//!
//! Device calls block, so each one runs on tokio's blocking pool. The
//! notification subscription and the CoreFoundation run loop that delivers
//! it live together on one dedicated thread; `run_loop` asks that thread for
//! a bounded pass and waits for it to finish.

use std::{
    os::unix::{io::FromRawFd, net::UnixStream as StdUnixStream},
    path::Path,
    ptr,
    sync::{mpsc as std_mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use core_foundation::{
    base::{CFType, TCFType},
    data::CFData,
    propertylist::{create_data, create_with_data, CFPropertyList},
    runloop::{kCFRunLoopDefaultMode, CFRunLoop},
    string::CFString,
};
use core_foundation_sys::{
    base::CFTypeRef,
    dictionary::CFDictionaryRef,
    propertylist::{kCFPropertyListBinaryFormat_v1_0, kCFPropertyListImmutable},
};
use libc::{c_int, c_void};
use log::{debug, info, trace, warn};
use tokio::sync::oneshot;

use crate::{message::Message, DeviceError, DeviceSocket};

use super::{DeviceNotification, MobileDeviceBridge, NotificationKind, NotificationRegistry};

mod sys;

use sys::*;

struct DeviceRef(*const am_device);

// MobileDevice device references are refcounted and usable from any thread
unsafe impl Send for DeviceRef {}
unsafe impl Sync for DeviceRef {}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        unsafe { AMDeviceRelease(self.0) }
    }
}

/// A retained `am_device` reference plus its identifier
#[derive(Clone)]
pub struct AmDevice {
    device: Arc<DeviceRef>,
    identifier: String,
}

impl AmDevice {
    /// # Safety
    /// `dev` must be a live device reference handed out by MobileDevice
    unsafe fn retain(dev: *const am_device) -> Self {
        AMDeviceRetain(dev);
        let raw = AMDeviceCopyDeviceIdentifier(dev);
        let identifier = if raw.is_null() {
            String::new()
        } else {
            CFString::wrap_under_create_rule(raw).to_string()
        };
        Self {
            device: Arc::new(DeviceRef(dev)),
            identifier,
        }
    }

    fn as_ptr(&self) -> *const am_device {
        self.device.0
    }
}

impl std::fmt::Debug for AmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AmDevice({})", self.identifier)
    }
}

fn check(call: &'static str, rv: c_int) -> Result<(), DeviceError> {
    if rv == 0 {
        Ok(())
    } else {
        debug!("{call} returned {:#x}", rv as u32);
        Err(DeviceError::NativeCall {
            call,
            code: rv as u32,
        })
    }
}

/// Runs a blocking MobileDevice call off the async workers
async fn call<T, F>(handle: &AmDevice, f: F) -> Result<T, DeviceError>
where
    T: Send + 'static,
    F: FnOnce(*const am_device) -> Result<T, DeviceError> + Send + 'static,
{
    let device = handle.clone();
    tokio::task::spawn_blocking(move || f(device.as_ptr()))
        .await
        .map_err(|e| DeviceError::Socket(std::io::Error::other(e)))?
}

/// Decodes any property list object by round-tripping it through binary plist data
fn cf_to_message(value: &CFType) -> Result<Message, DeviceError> {
    let data = create_data(value.as_CFTypeRef(), kCFPropertyListBinaryFormat_v1_0).map_err(|e| {
        warn!("Unable to serialize native value: {e:?}");
        DeviceError::UnexpectedResponse
    })?;
    Message::from_bytes(data.bytes())
}

fn message_to_cf(message: &Message) -> Result<CFPropertyList, DeviceError> {
    let bytes = message.to_binary()?;
    let (raw, _) =
        create_with_data(CFData::from_buffer(&bytes), kCFPropertyListImmutable).map_err(|e| {
            warn!("Unable to build native value: {e}");
            DeviceError::UnexpectedResponse
        })?;
    Ok(unsafe { CFPropertyList::wrap_under_create_rule(raw) })
}

fn socket_from_fd(fd: c_int) -> Result<DeviceSocket, DeviceError> {
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
}

type Cookie = Arc<NotificationRegistry<AmDevice>>;

extern "C" fn device_callback(info: *mut am_device_notification_callback_info, cookie: *mut c_void) {
    if info.is_null() || cookie.is_null() {
        return;
    }
    let registry = unsafe { &*(cookie as *const Cookie) };
    let (dev, msg) = unsafe { ((*info).dev, (*info).msg) };
    let Some(kind) = NotificationKind::from_code(msg) else {
        trace!("Ignoring device notification {msg}");
        return;
    };
    let handle = unsafe { AmDevice::retain(dev) };
    debug!("Device notification {kind:?} for {}", handle.identifier);
    registry.dispatch(DeviceNotification { kind, handle });
}

extern "C" fn mount_callback(status: CFDictionaryRef, _cookie: *mut c_void) {
    if status.is_null() {
        return;
    }
    let status = unsafe { CFType::wrap_under_get_rule(status as CFTypeRef) };
    match cf_to_message(&status) {
        Ok(m) => info!(
            "[Mounting] {}",
            m.string_field("Status").unwrap_or_default()
        ),
        Err(e) => warn!("Unreadable mount progress: {e}"),
    }
}

enum LoopCommand {
    Run(Duration, oneshot::Sender<()>),
    Stop(oneshot::Sender<Result<(), DeviceError>>),
}

fn loop_thread(
    registry: Cookie,
    commands: std_mpsc::Receiver<LoopCommand>,
    ready: oneshot::Sender<Result<(), DeviceError>>,
) {
    let cookie = Box::into_raw(Box::new(registry));
    let mut subscription: *const am_device_notification = ptr::null();
    let rv = unsafe {
        AMDeviceNotificationSubscribe(device_callback, 0, 0, cookie as *mut c_void, &mut subscription)
    };
    if let Err(e) = check("AMDeviceNotificationSubscribe", rv) {
        drop(unsafe { Box::from_raw(cookie) });
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut stopped = None;
    while let Ok(command) = commands.recv() {
        match command {
            LoopCommand::Run(timeout, done) => {
                CFRunLoop::run_in_mode(unsafe { kCFRunLoopDefaultMode }, timeout, false);
                let _ = done.send(());
            }
            LoopCommand::Stop(done) => {
                stopped = Some(done);
                break;
            }
        }
    }

    let rv = unsafe { AMDeviceNotificationUnsubscribe(subscription) };
    drop(unsafe { Box::from_raw(cookie) });
    if let Some(done) = stopped {
        let _ = done.send(check("AMDeviceNotificationUnsubscribe", rv));
    }
}

/// Drives Apple's MobileDevice framework directly
#[derive(Debug, Default)]
pub struct MacBridge {
    runloop: Mutex<Option<std_mpsc::Sender<LoopCommand>>>,
}

impl MacBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn commands(&self) -> Option<std_mpsc::Sender<LoopCommand>> {
        self.runloop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl MobileDeviceBridge for MacBridge {
    type Handle = AmDevice;

    async fn subscribe(&self, registry: Arc<NotificationRegistry<AmDevice>>) -> Result<(), DeviceError> {
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        thread::Builder::new()
            .name("amdevice-runloop".into())
            .spawn(move || loop_thread(registry, rx, ready_tx))?;
        ready_rx.await.map_err(|_| DeviceError::NoEstablishedConnection)??;

        // Replacing the sender ends any previous run loop thread
        self.runloop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(tx);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), DeviceError> {
        let Some(tx) = self.runloop.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(LoopCommand::Stop(done_tx)).is_err() {
            return Ok(());
        }
        done_rx.await.unwrap_or(Ok(()))
    }

    async fn run_loop(&self, timeout: Duration) -> Result<(), DeviceError> {
        let Some(tx) = self.commands() else {
            tokio::time::sleep(timeout).await;
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(LoopCommand::Run(timeout, done_tx)).is_err() {
            warn!("Run loop thread is gone");
            return Err(DeviceError::NoEstablishedConnection);
        }
        done_rx.await.map_err(|_| DeviceError::NoEstablishedConnection)
    }

    fn device_identifier(&self, handle: &AmDevice) -> String {
        handle.identifier.clone()
    }

    async fn connect(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| check("AMDeviceConnect", unsafe { AMDeviceConnect(dev) })).await
    }

    async fn disconnect(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| check("AMDeviceDisconnect", unsafe { AMDeviceDisconnect(dev) })).await
    }

    async fn is_paired(&self, handle: &AmDevice) -> Result<bool, DeviceError> {
        call(handle, |dev| Ok(unsafe { AMDeviceIsPaired(dev) } != 0)).await
    }

    async fn pair(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| check("AMDevicePair", unsafe { AMDevicePair(dev) })).await
    }

    async fn validate_pairing(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| {
            check("AMDeviceValidatePairing", unsafe { AMDeviceValidatePairing(dev) })
        })
        .await
    }

    async fn start_session(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| {
            check("AMDeviceStartSession", unsafe { AMDeviceStartSession(dev) })
        })
        .await
    }

    async fn stop_session(&self, handle: &AmDevice) -> Result<(), DeviceError> {
        call(handle, |dev| {
            check("AMDeviceStopSession", unsafe { AMDeviceStopSession(dev) })
        })
        .await
    }

    async fn copy_value(&self, handle: &AmDevice, key: &str) -> Result<Option<Message>, DeviceError> {
        let key = key.to_string();
        call(handle, move |dev| {
            let key = CFString::new(&key);
            let raw = unsafe { AMDeviceCopyValue(dev, ptr::null(), key.as_concrete_TypeRef()) };
            if raw.is_null() {
                return Ok(None);
            }
            let value = unsafe { CFType::wrap_under_create_rule(raw) };
            cf_to_message(&value).map(Some)
        })
        .await
    }

    async fn start_service(&self, handle: &AmDevice, name: &str) -> Result<DeviceSocket, DeviceError> {
        let name = name.to_string();
        let fd = call(handle, move |dev| {
            let name = CFString::new(&name);
            let mut fd: c_int = -1;
            check("AMDeviceStartService", unsafe {
                AMDeviceStartService(dev, name.as_concrete_TypeRef(), &mut fd, ptr::null())
            })?;
            Ok(fd)
        })
        .await?;
        socket_from_fd(fd)
    }

    async fn connect_to_port(&self, handle: &AmDevice, port: u16) -> Result<DeviceSocket, DeviceError> {
        let fd = call(handle, move |dev| {
            let connection_id = unsafe { AMDeviceGetConnectionID(dev) };
            let mut fd: c_int = -1;
            check("USBMuxConnectByPort", unsafe {
                USBMuxConnectByPort(connection_id, port.to_be() as c_int, &mut fd)
            })?;
            Ok(fd)
        })
        .await?;
        socket_from_fd(fd)
    }

    async fn mount_image(&self, handle: &AmDevice, image: &Path, signature: &[u8]) -> Result<(), DeviceError> {
        let image = image.to_string_lossy().into_owned();
        let options = Message::dictionary([
            ("ImageType", Message::from("Developer")),
            ("ImageSignature", Message::Data(signature.to_vec())),
        ]);
        call(handle, move |dev| {
            let options = message_to_cf(&options)?;
            let image = CFString::new(&image);
            check("AMDeviceMountImage", unsafe {
                AMDeviceMountImage(
                    dev,
                    image.as_concrete_TypeRef(),
                    options.as_CFTypeRef() as CFDictionaryRef,
                    mount_callback,
                    ptr::null_mut(),
                )
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_survive_native_conversion() {
        let message = Message::dictionary([
            ("ImageType", Message::from("Developer")),
            ("ImageSignature", Message::Data(vec![1, 2, 3])),
            ("Size", Message::Integer(42)),
        ]);
        let native = message_to_cf(&message).unwrap();
        let back = cf_to_message(&native.as_CFType()).unwrap();
        assert_eq!(back.string_field("ImageType").as_deref(), Some("Developer"));
        assert_eq!(back.get("ImageSignature").and_then(Message::as_data), Some(&[1u8, 2, 3][..]));
        assert_eq!(back.get("Size").and_then(Message::as_integer), Some(42));
    }
}

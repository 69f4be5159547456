// Jackson Coxson
//! Scriptable bridge for unit tests

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{DeviceNotification, MobileDeviceBridge, NotificationKind, NotificationRegistry};
use crate::{message::Message, DeviceError, DeviceSocket};

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    failures: HashMap<&'static str, u32>,
    paired: bool,
    values: HashMap<String, Message>,
    services: HashMap<String, VecDeque<DeviceSocket>>,
    queued: VecDeque<DeviceNotification<String>>,
    registry: Option<Arc<NotificationRegistry<String>>>,
    mounted: Vec<(PathBuf, Vec<u8>)>,
}

/// Records every call and answers from scripted state. Handles are the
/// device identifiers themselves.
#[derive(Debug, Default)]
pub struct FakeBridge {
    state: Mutex<FakeState>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn set_paired(&self, paired: bool) {
        self.state().paired = paired;
    }

    /// Makes `call` fail with a native result code until cleared
    pub fn fail(&self, call: &'static str, code: u32) {
        self.state().failures.insert(call, code);
    }

    pub fn set_value(&self, key: &str, value: impl Into<Message>) {
        self.state().values.insert(key.to_string(), value.into());
    }

    /// Queues a transport for the next start of `name`
    pub fn add_service(&self, name: &str, socket: DeviceSocket) {
        self.state()
            .services
            .entry(name.to_string())
            .or_default()
            .push_back(socket);
    }

    /// Queues a notification to be delivered by the next run-loop pass
    pub fn notify(&self, kind: NotificationKind, id: &str) {
        self.state().queued.push_back(DeviceNotification {
            kind,
            handle: id.to_string(),
        });
    }

    pub fn mounted(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.state().mounted.clone()
    }

    fn record(&self, call: &'static str, id: &str) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.calls.push(format!("{call}:{id}"));
        match state.failures.get(call) {
            Some(code) => Err(DeviceError::NativeCall { call, code: *code }),
            None => Ok(()),
        }
    }
}

impl MobileDeviceBridge for FakeBridge {
    type Handle = String;

    async fn subscribe(
        &self,
        registry: Arc<NotificationRegistry<String>>,
    ) -> Result<(), DeviceError> {
        self.record("subscribe", "")?;
        self.state().registry = Some(registry);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), DeviceError> {
        self.record("unsubscribe", "")?;
        self.state().registry = None;
        Ok(())
    }

    async fn run_loop(&self, _timeout: Duration) -> Result<(), DeviceError> {
        let mut state = self.state();
        let queued: Vec<_> = state.queued.drain(..).collect();
        if let Some(registry) = &state.registry {
            for n in queued {
                registry.dispatch(n);
            }
        }
        Ok(())
    }

    fn device_identifier(&self, handle: &String) -> String {
        handle.clone()
    }

    async fn connect(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("connect", handle)
    }

    async fn disconnect(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("disconnect", handle)
    }

    async fn is_paired(&self, handle: &String) -> Result<bool, DeviceError> {
        self.record("is_paired", handle)?;
        Ok(self.state().paired)
    }

    async fn pair(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("pair", handle)?;
        self.state().paired = true;
        Ok(())
    }

    async fn validate_pairing(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("validate_pairing", handle)
    }

    async fn start_session(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("start_session", handle)
    }

    async fn stop_session(&self, handle: &String) -> Result<(), DeviceError> {
        self.record("stop_session", handle)
    }

    async fn copy_value(&self, handle: &String, key: &str) -> Result<Option<Message>, DeviceError> {
        self.record("copy_value", handle)?;
        Ok(self.state().values.get(key).cloned())
    }

    async fn start_service(&self, handle: &String, name: &str) -> Result<DeviceSocket, DeviceError> {
        self.record("start_service", handle)?;
        let mut state = self.state();
        state.calls.push(format!("service:{name}"));
        state
            .services
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .ok_or(DeviceError::NativeCall {
                call: "start_service",
                code: 0xe8000022,
            })
    }

    async fn connect_to_port(&self, handle: &String, port: u16) -> Result<DeviceSocket, DeviceError> {
        self.record("connect_to_port", handle)?;
        let name = format!("port:{port}");
        self.state()
            .services
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
            .ok_or(DeviceError::UsbConnectionRefused)
    }

    async fn mount_image(
        &self,
        handle: &String,
        image: &Path,
        signature: &[u8],
    ) -> Result<(), DeviceError> {
        self.record("mount_image", handle)?;
        self.state()
            .mounted
            .push((image.to_path_buf(), signature.to_vec()));
        Ok(())
    }
}

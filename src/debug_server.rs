// Jackson Coxson
//! Launch and kill applications through com.apple.debugserver
//!
//! Only the subset of the GDB remote serial protocol needed to start a
//! process, let it run, watch its output and kill it again. Acknowledgement
//! mode is switched off during [`DebugServerClient::init`], so after the
//! handshake every request gets exactly one reply packet.

use std::{collections::VecDeque, time::Duration};

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bridge::MobileDeviceBridge, device::Device, service::ServiceName, DeviceError, DeviceSocket,
};

const OK_RESPONSE: &str = "$OK#";
const INTERRUPT: &[u8] = b"\x03";
const INTERRUPT_ATTEMPTS: usize = 3;
const INTERRUPT_INTERVAL: Duration = Duration::from_secs(1);
const READ_SIZE: usize = 4096;

/// SIGTRAP, SIGABRT, SIGKILL, SIGSEGV and EXC_BAD_ACCESS
pub const FATAL_SIGNALS: [u8; 5] = [5, 6, 9, 11, 145];

/// `(sum of payload bytes) mod 256` as two lower-case hex digits
pub fn checksum(payload: &str) -> String {
    let sum = payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    format!("{sum:02x}")
}

pub fn hex_encode(data: &str) -> String {
    data.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &[u8]) -> Vec<u8> {
    hex.chunks_exact(2)
        .filter_map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

/// Wraps a payload as `$payload#cs`
pub fn encode_packet(payload: &str) -> String {
    format!("${payload}#{}", checksum(payload))
}

/// How the process is left running once launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Detach right after launch unless `watch` is also set
    pub justlaunch: bool,
    /// Keep the debugger attached so output can be followed
    pub watch: bool,
}

/// Something the launched process did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdbEvent {
    /// Text the process wrote to stdout or stderr
    Output(String),
    /// The process stopped on one of [`FATAL_SIGNALS`]
    Terminated(u8),
}

#[derive(Debug)]
pub struct DebugServerClient<R> {
    socket: R,
    initialized: bool,
    pending: Vec<u8>,
    events: VecDeque<GdbEvent>,
}

impl DebugServerClient<DeviceSocket> {
    pub async fn connect<B: MobileDeviceBridge>(device: &Device<B>) -> Result<Self, DeviceError> {
        let service = device.start_service(ServiceName::DEBUG_SERVER).await?;
        Ok(Self::new(service.into_socket()))
    }
}

impl<R: AsyncRead + AsyncWrite + Unpin> DebugServerClient<R> {
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            initialized: false,
            pending: Vec::new(),
            events: VecDeque::new(),
        }
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        trace!("GDB: send packet {}", String::from_utf8_lossy(data));
        self.socket.write_all(data).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<String, DeviceError> {
        let mut buf = vec![0u8; READ_SIZE];
        let read = self.socket.read(&mut buf).await?;
        if read == 0 {
            return Err(DeviceError::NoEstablishedConnection);
        }
        let response = String::from_utf8_lossy(&buf[..read]).into_owned();
        trace!("GDB: read packet: {response}");
        Ok(response)
    }

    /// Sends `$payload#cs` and returns the next chunk the server writes back
    ///
    /// # Errors
    /// [`DeviceError::NoEstablishedConnection`] if the server closed the connection
    pub async fn send_packet(&mut self, payload: &str) -> Result<String, DeviceError> {
        self.send_raw(encode_packet(payload).as_bytes()).await?;
        self.read_response().await
    }

    async fn await_response(&mut self, payload: &str, expected: &str) -> Result<(), DeviceError> {
        let response = self.send_packet(payload).await?;
        check_response(payload, &response, expected)
    }

    /// Handshake performed once per client: no-ack mode, environment, ASLR and argv
    ///
    /// # Arguments
    /// * `argv` - the executable path on the device followed by its arguments
    ///
    /// # Errors
    /// [`DeviceError::GdbResponse`] naming the first packet the server did not accept
    pub async fn init(&mut self, argv: &[String]) -> Result<(), DeviceError> {
        if self.initialized {
            return Ok(());
        }
        self.await_response("QStartNoAckMode", "+").await?;
        self.send_raw(b"+").await?;
        self.await_response("QEnvironmentHexEncoded:", OK_RESPONSE)
            .await?;
        self.await_response("QSetDisableASLR:1", OK_RESPONSE).await?;
        let arguments = argv
            .iter()
            .enumerate()
            .map(|(i, arg)| format!("{},{},{}", arg.len() * 2, i, hex_encode(arg)))
            .collect::<Vec<_>>()
            .join(",");
        self.await_response(&format!("A{arguments}"), OK_RESPONSE)
            .await?;
        self.initialized = true;
        Ok(())
    }

    /// Launches `argv[0]` and lets it continue
    ///
    /// With `justlaunch` and no `watch` the debugger detaches so the process
    /// keeps running after this connection goes away. Otherwise it stays
    /// attached and [`Self::next_event`] reports output and fatal signals.
    pub async fn run(&mut self, argv: &[String], options: RunOptions) -> Result<(), DeviceError> {
        self.init(argv).await?;
        self.await_response("qLaunchSuccess", OK_RESPONSE).await?;

        let command = if options.justlaunch && !options.watch {
            "D"
        } else {
            "vCont;c"
        };
        debug!("GDB: continuing with {command}");
        self.send_raw(encode_packet(command).as_bytes()).await
    }

    /// Interrupts the process and kills it
    ///
    /// Sends up to three interrupts, one second apart, waiting for a stop
    /// reply after each before sending `k`.
    ///
    /// # Errors
    /// [`DeviceError::GdbKillTimeout`] if the process never stops
    pub async fn kill(&mut self, argv: &[String]) -> Result<(), DeviceError> {
        self.init(argv).await?;

        let mut stopped = false;
        for attempt in 1..=INTERRUPT_ATTEMPTS {
            self.send_raw(INTERRUPT).await?;
            match tokio::time::timeout(INTERRUPT_INTERVAL, self.await_thread_stop()).await {
                Ok(res) => {
                    res?;
                    stopped = true;
                    break;
                }
                Err(_) => trace!("GDB: no stop reply after interrupt {attempt}"),
            }
        }
        if !stopped {
            return Err(DeviceError::GdbKillTimeout);
        }

        self.send_packet("k").await?;
        Ok(())
    }

    async fn await_thread_stop(&mut self) -> Result<(), DeviceError> {
        loop {
            if self.read_response().await?.contains("thread") {
                return Ok(());
            }
        }
    }

    /// Next output or termination event of an attached process.
    /// `None` once the server closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<GdbEvent>, DeviceError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            let mut buf = vec![0u8; READ_SIZE];
            let read = self.socket.read(&mut buf).await?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&buf[..read]);
            let events = drain_packets(&mut self.pending);
            self.events.extend(events);
        }
    }

    /// Feeds process output to `on_output` until a fatal signal or disconnect
    ///
    /// # Returns
    /// The signal that ended the process, or `None` if the connection closed
    pub async fn watch_output<F: FnMut(&str)>(
        &mut self,
        mut on_output: F,
    ) -> Result<Option<u8>, DeviceError> {
        while let Some(event) = self.next_event().await? {
            match event {
                GdbEvent::Output(text) => on_output(&text),
                GdbEvent::Terminated(signal) => return Ok(Some(signal)),
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<(), DeviceError> {
        self.socket.shutdown().await?;
        Ok(())
    }
}

fn check_response(payload: &str, response: &str, expected: &str) -> Result<(), DeviceError> {
    if !response.contains(expected) || response.starts_with("$E") {
        trace!("GDB: actual response: {response}, expected response: {expected}");
        return Err(DeviceError::GdbResponse(payload.to_string()));
    }
    Ok(())
}

/// Pulls every complete `$...#cs` packet out of `buf`, leaving a partial tail
fn drain_packets(buf: &mut Vec<u8>) -> Vec<GdbEvent> {
    let mut events = Vec::new();
    let mut consumed = 0;
    loop {
        let Some(start) = buf[consumed..].iter().position(|b| *b == b'$') else {
            consumed = buf.len();
            break;
        };
        let start = consumed + start + 1;
        let Some(end) = buf[start..].iter().position(|b| *b == b'#') else {
            consumed = start - 1;
            break;
        };
        let end = start + end;
        if buf.len() < end + 3 {
            consumed = start - 1;
            break;
        }
        events.extend(packet_event(&buf[start..end]));
        consumed = end + 3;
    }
    buf.drain(..consumed);
    events
}

fn packet_event(payload: &[u8]) -> Option<GdbEvent> {
    match payload {
        [b'O', b'K', ..] => None,
        [b'O', hex @ ..] => {
            let text = String::from_utf8_lossy(&hex_decode(hex)).into_owned();
            Some(GdbEvent::Output(text))
        }
        [b'T' | b'S', a, b, ..] => {
            let signal = std::str::from_utf8(&[*a, *b])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())?;
            FATAL_SIGNALS
                .contains(&signal)
                .then_some(GdbEvent::Terminated(signal))
        }
        _ => None,
    }
}

// Test doubles: a scripted in-memory stream and a fake adb daemon on loopback
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::config::AdbConfig;

/// Replays `input` to the reader and records everything written.
pub struct ScriptedStream {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
    writes: usize,
    write_limit: Option<usize>,
}

impl ScriptedStream {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            output: Vec::new(),
            writes: 0,
            write_limit: None,
        }
    }

    /// Accept `writes` write calls, then fail every later one with
    /// `BrokenPipe`, like a peer that has hung up.
    pub fn fail_writes_after(mut self, writes: usize) -> Self {
        self.write_limit = Some(writes);
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.output
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.write_limit.is_some_and(|limit| self.writes >= limit) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.writes += 1;
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn sync_frame(opcode: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut frame = opcode.to_vec();
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn stat_reply(mode: u32, size: u32, mtime: u32) -> Vec<u8> {
    let mut reply = b"STAT".to_vec();
    for value in [mode, size, mtime] {
        reply.extend_from_slice(&value.to_le_bytes());
    }
    reply
}

/// Split client-written sync bytes into `(opcode, payload)` pairs. `DONE`
/// carries its mtime in the length slot, so its "payload" is those 4 bytes.
pub fn parse_sync_frames(mut bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut frames = Vec::new();
    while bytes.len() >= 8 {
        let opcode = String::from_utf8_lossy(&bytes[..4]).into_owned();
        let value = [bytes[4], bytes[5], bytes[6], bytes[7]];
        bytes = &bytes[8..];
        if opcode == "DONE" {
            frames.push((opcode, value.to_vec()));
            continue;
        }
        let len = u32::from_le_bytes(value) as usize;
        frames.push((opcode, bytes[..len].to_vec()));
        bytes = &bytes[len..];
    }
    frames
}

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub mode: u32,
    pub mtime: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    /// `(serial, state)` in `host:devices` order.
    pub devices: Vec<(String, String)>,
    /// `(serial, command)` to raw shell output.
    pub shell: HashMap<(String, String), String>,
    pub files: HashMap<(String, String), FakeFile>,
    /// `(serial, local, remote)` as `tcp:N` specs.
    pub forwards: Vec<(String, String, String)>,
    pub root_reply: String,
    pub remount_reply: String,
    /// Send OKAY to `reboot:` before closing instead of closing straight away.
    pub reboot_acks: bool,
    pub reboots: Vec<(String, String)>,
    /// Every host command received, in order.
    pub requests: Vec<String>,
    /// DATA frames received across all pushes.
    pub data_frames: usize,
    next_port: u16,
}

/// An adb daemon stand-in listening on an ephemeral loopback port.
pub struct FakeDaemon {
    addr: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
    connections: Arc<AtomicUsize>,
}

impl FakeDaemon {
    pub fn start(devices: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DaemonState {
            devices: devices
                .iter()
                .map(|(s, st)| (s.to_string(), st.to_string()))
                .collect(),
            root_reply: "restarting adbd as root\n".to_string(),
            remount_reply: "remount succeeded\n".to_string(),
            next_port: 40000,
            ..DaemonState::default()
        }));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_state = Arc::clone(&state);
        let accept_count = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_count.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                thread::spawn(move || {
                    let _ = handle_connection(stream, state);
                });
            }
        });

        Self {
            addr,
            state,
            connections,
        }
    }

    pub fn config(&self) -> AdbConfig {
        AdbConfig::default()
            .with_port(self.addr.port())
            .with_read_timeout(Some(Duration::from_secs(10)))
            .with_poll_interval(Duration::from_millis(20))
    }

    pub fn state(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn set_shell(&self, serial: &str, command: &str, output: &str) {
        self.state()
            .shell
            .insert((serial.to_string(), command.to_string()), output.to_string());
    }

    pub fn put_file(&self, serial: &str, path: &str, mode: u32, mtime: u32, data: &[u8]) {
        self.state().files.insert(
            (serial.to_string(), path.to_string()),
            FakeFile {
                mode,
                mtime,
                data: data.to_vec(),
            },
        );
    }

    pub fn file(&self, serial: &str, path: &str) -> Option<FakeFile> {
        self.state()
            .files
            .get(&(serial.to_string(), path.to_string()))
            .cloned()
    }
}

fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = usize::from_str_radix(&String::from_utf8_lossy(&len), 16)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn framed(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    write!(stream, "{:04x}{message}", message.len())
}

fn okay(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(b"OKAY")
}

fn fail(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(b"FAIL")?;
    framed(stream, message)
}

fn handle_connection(mut stream: TcpStream, state: Arc<Mutex<DaemonState>>) -> io::Result<()> {
    let request = read_request(&mut stream)?;
    state.lock().unwrap().requests.push(request.clone());

    if request == "host:devices" {
        let body: String = state
            .lock()
            .unwrap()
            .devices
            .iter()
            .map(|(serial, st)| format!("{serial}\t{st}\n"))
            .collect();
        okay(&mut stream)?;
        return framed(&mut stream, &body);
    }
    if request == "host:version" {
        okay(&mut stream)?;
        return framed(&mut stream, "0029");
    }
    if let Some(rest) = request.strip_prefix("host-serial:") {
        let Some((serial, command)) = rest.split_once(':') else {
            return fail(&mut stream, "bad host-serial request");
        };
        return host_serial(&mut stream, &state, serial, command);
    }
    if let Some(serial) = request.strip_prefix("host:transport:") {
        let known = known_state(&state, serial).is_some();
        if !known {
            return fail(&mut stream, &format!("device '{serial}' not found"));
        }
        okay(&mut stream)?;
        return device_service(&mut stream, &state, serial);
    }
    fail(&mut stream, "unknown host service")
}

fn known_state(state: &Arc<Mutex<DaemonState>>, serial: &str) -> Option<String> {
    state
        .lock()
        .unwrap()
        .devices
        .iter()
        .find(|(s, _)| s == serial)
        .map(|(_, st)| st.clone())
}

fn host_serial(
    stream: &mut TcpStream,
    state: &Arc<Mutex<DaemonState>>,
    serial: &str,
    command: &str,
) -> io::Result<()> {
    let Some(device_state) = known_state(state, serial) else {
        return fail(stream, &format!("device '{serial}' not found"));
    };
    if command == "get-state" {
        okay(stream)?;
        return framed(stream, &device_state);
    }
    if let Some(spec) = command.strip_prefix("forward:") {
        let Some((local, remote)) = spec.split_once(';') else {
            return fail(stream, "malformed forward spec");
        };
        let mut st = state.lock().unwrap();
        let local = if local == "tcp:0" {
            st.next_port += 1;
            format!("tcp:{}", st.next_port)
        } else {
            local.to_string()
        };
        st.forwards
            .push((serial.to_string(), local.clone(), remote.to_string()));
        drop(st);
        okay(stream)?;
        okay(stream)?;
        if spec.starts_with("tcp:0;") {
            framed(stream, local.trim_start_matches("tcp:"))?;
        }
        return Ok(());
    }
    if command == "killforward-all" {
        state.lock().unwrap().forwards.retain(|(s, _, _)| s != serial);
        okay(stream)?;
        return okay(stream);
    }
    if let Some(local) = command.strip_prefix("killforward:") {
        let mut st = state.lock().unwrap();
        let before = st.forwards.len();
        st.forwards.retain(|(s, l, _)| !(s == serial && l == local));
        let removed = st.forwards.len() != before;
        drop(st);
        okay(stream)?;
        if !removed {
            return fail(stream, &format!("listener '{local}' not found"));
        }
        return okay(stream);
    }
    if command == "list-forward" {
        let body: String = state
            .lock()
            .unwrap()
            .forwards
            .iter()
            .filter(|(s, _, _)| s == serial)
            .map(|(s, l, r)| format!("{s} {l} {r}\n"))
            .collect();
        okay(stream)?;
        return framed(stream, &body);
    }
    fail(stream, "unknown host-serial service")
}

fn device_service(
    stream: &mut TcpStream,
    state: &Arc<Mutex<DaemonState>>,
    serial: &str,
) -> io::Result<()> {
    let request = read_request(stream)?;
    state
        .lock()
        .unwrap()
        .requests
        .push(format!("{serial}/{request}"));

    if let Some(command) = request.strip_prefix("shell:") {
        if command == "hang" {
            okay(stream)?;
            thread::sleep(Duration::from_secs(3));
            return Ok(());
        }
        let output = state
            .lock()
            .unwrap()
            .shell
            .get(&(serial.to_string(), command.to_string()))
            .cloned()
            .unwrap_or_default();
        okay(stream)?;
        return stream.write_all(output.as_bytes());
    }
    if request == "root:" {
        let reply = state.lock().unwrap().root_reply.clone();
        okay(stream)?;
        return stream.write_all(reply.as_bytes());
    }
    if request == "remount:" {
        let reply = state.lock().unwrap().remount_reply.clone();
        okay(stream)?;
        return stream.write_all(reply.as_bytes());
    }
    if let Some(target) = request.strip_prefix("reboot:") {
        let acks = {
            let mut st = state.lock().unwrap();
            st.reboots.push((serial.to_string(), target.to_string()));
            st.reboot_acks
        };
        if acks {
            okay(stream)?;
        }
        return Ok(());
    }
    if request == "sync:" {
        okay(stream)?;
        return sync_service(stream, state, serial);
    }
    fail(stream, "unknown device service")
}

fn read_sync_header(stream: &mut TcpStream) -> io::Result<([u8; 4], u32)> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw)?;
    let mut id = [0u8; 4];
    id.copy_from_slice(&raw[..4]);
    Ok((id, u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]])))
}

fn read_payload(stream: &mut TcpStream, len: u32) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn write_sync_fail(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    stream.write_all(b"FAIL")?;
    stream.write_all(&(message.len() as u32).to_le_bytes())?;
    stream.write_all(message.as_bytes())
}

fn sync_service(
    stream: &mut TcpStream,
    state: &Arc<Mutex<DaemonState>>,
    serial: &str,
) -> io::Result<()> {
    loop {
        let (id, len) = match read_sync_header(stream) {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        match &id {
            b"STAT" => {
                let path = String::from_utf8_lossy(&read_payload(stream, len)?).into_owned();
                let file = state
                    .lock()
                    .unwrap()
                    .files
                    .get(&(serial.to_string(), path))
                    .cloned();
                let mut reply = b"STAT".to_vec();
                let (mode, size, mtime) = file
                    .map(|f| (f.mode, f.data.len() as u32, f.mtime))
                    .unwrap_or((0, 0, 0));
                for value in [mode, size, mtime] {
                    reply.extend_from_slice(&value.to_le_bytes());
                }
                stream.write_all(&reply)?;
            }
            b"SEND" => {
                let spec = String::from_utf8_lossy(&read_payload(stream, len)?).into_owned();
                let (path, mode) = spec.rsplit_once(',').unwrap_or((spec.as_str(), "0"));
                let mode: u32 = mode.parse().unwrap_or(0);
                let mut data = Vec::new();
                let mtime = loop {
                    let (id, value) = read_sync_header(stream)?;
                    match &id {
                        b"DATA" => {
                            data.extend(read_payload(stream, value)?);
                            state.lock().unwrap().data_frames += 1;
                            // a full disk: refuse after the first chunk and hang up
                            if path.starts_with("/full/") {
                                return write_sync_fail(stream, "No space left on device");
                            }
                        }
                        b"DONE" => break value,
                        _ => return Ok(()),
                    }
                };
                if path.starts_with("/system/") {
                    write_sync_fail(stream, "Read-only file system")?;
                    continue;
                }
                state.lock().unwrap().files.insert(
                    (serial.to_string(), path.to_string()),
                    FakeFile { mode, mtime, data },
                );
                stream.write_all(b"OKAY\0\0\0\0")?;
            }
            b"RECV" => {
                let path = String::from_utf8_lossy(&read_payload(stream, len)?).into_owned();
                let file = state
                    .lock()
                    .unwrap()
                    .files
                    .get(&(serial.to_string(), path))
                    .cloned();
                match file {
                    Some(file) => {
                        for chunk in file.data.chunks(1000) {
                            stream.write_all(b"DATA")?;
                            stream.write_all(&(chunk.len() as u32).to_le_bytes())?;
                            stream.write_all(chunk)?;
                        }
                        stream.write_all(b"DONE\0\0\0\0")?;
                    }
                    None => write_sync_fail(stream, "No such file or directory")?,
                }
            }
            _ => return Ok(()),
        }
    }
}

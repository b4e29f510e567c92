// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A tiny NATS server that runs on a thread inside the test process.
//!
//! It speaks enough of the core protocol for subscribers: `INFO`, `CONNECT`,
//! `PING`/`PONG`, `SUB`/`UNSUB` and `MSG`. Messages are injected by the test
//! itself through [`NatsTestServer::publish`].

use std::{
    collections::HashMap,
    fmt::Display,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};

struct Client {
    client_id: usize,
    socket: TcpStream,
    /// Bytes received that do not form a full line yet.
    pending: Vec<u8>,
    has_sent_ping: bool,
    last_ping: Instant,
    outstanding_pings: usize,
    /// Subject patterns keyed by subscription id.
    subs: HashMap<String, String>,
}

#[derive(Debug)]
enum Injection {
    Publish { subject: String, payload: Vec<u8> },
    EvictAll,
}

/// Every subscription on the server, keyed by client id and sid.
type Registry = Arc<Mutex<HashMap<(usize, String), String>>>;

#[derive(Debug, PartialEq)]
enum ClientAction {
    None,
    Evict,
}

/// A test server for NATS-based systems, will be stopped on drop.
pub struct NatsTestServer {
    address: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    injector: Sender<Injection>,
    registry: Registry,
}

pub struct NatsTestServerBuilder<A> {
    baddr: A,
    denied_subjects: Vec<String>,
    user_pass: Option<(String, String)>,
}

impl NatsTestServer {
    pub fn build() -> NatsTestServerBuilder<&'static str> {
        NatsTestServerBuilder {
            baddr: "127.0.0.1:0",
            denied_subjects: vec![],
            user_pass: None,
        }
    }

    /// Get the socket address on which the test server is listening
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// A `nats://` URL pointing at this server.
    pub fn client_url(&self) -> String {
        format!("nats://{}", self.address)
    }

    /// Deliver a message to every client subscription matching `subject`.
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) {
        self.injector
            .send(Injection::Publish {
                subject: subject.to_string(),
                payload: payload.as_ref().to_vec(),
            })
            .ok();
    }

    /// Drop every connected client while continuing to accept new ones.
    pub fn evict_clients(&self) {
        self.injector.send(Injection::EvictAll).ok();
    }

    /// Subject patterns currently subscribed to, across all clients.
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry
            .lock()
            .map(|registry| registry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Polls until some client subscribed to exactly `subject`.
    pub fn wait_for_subscription(&self, subject: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.subscriptions().iter().any(|s| s == subject) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl Drop for NatsTestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if let Err(_err) = handle.join() {
                log::warn!("Error joining TestNats server thread for shutdown");
            }
            log::debug!("Stopped server");
        }
    }
}

impl<A: ToSocketAddrs + Display + Send + 'static> NatsTestServerBuilder<A> {
    ///  Address for server to listen for NATS connections
    pub fn address<B>(self, baddr: B) -> NatsTestServerBuilder<B> {
        NatsTestServerBuilder {
            baddr,
            denied_subjects: self.denied_subjects,
            user_pass: self.user_pass,
        }
    }

    /// Reject subscriptions to this exact subject with a permissions error.
    pub fn deny_subject(mut self, subject: &str) -> Self {
        self.denied_subjects.push(subject.to_string());
        self
    }

    /// Require clients to authenticate with these credentials.
    pub fn user_pass(self, user: &str, pass: &str) -> Self {
        Self {
            user_pass: Some((user.to_string(), pass.to_string())),
            ..self
        }
    }

    /// Spawn the server on a thread, returns controller struct which will stop
    /// the server on drop
    pub fn spawn(self) -> NatsTestServer {
        let listener = TcpListener::bind(&self.baddr).expect("test server should bind");
        let listen_addr = listener
            .local_addr()
            .expect("test server should have a local address");
        listener
            .set_nonblocking(true)
            .expect("test server listener should be non-blocking");
        log::info!(
            "nats test server started on {} (requested {})",
            listen_addr,
            &self.baddr,
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Registry::default();
        let (injector, injections) = crossbeam_channel::unbounded();

        let handle = Some({
            let shutdown = shutdown.clone();
            let registry = registry.clone();
            thread::spawn(move || self.run(listener, injections, registry, shutdown))
        });

        NatsTestServer {
            address: listen_addr,
            handle,
            shutdown,
            injector,
            registry,
        }
    }

    fn run(
        self,
        listener: TcpListener,
        injections: Receiver<Injection>,
        registry: Registry,
        shutdown: Arc<AtomicBool>,
    ) {
        let baddr = listener.local_addr().expect("listener has an address");
        let auth_required = self.user_pass.is_some();

        let mut max_client_id = 0;
        #[rustfmt::skip]
        let server_info = |client_id| {
            format!(
                "INFO {{  \
                    \"server_id\": \"test\", \
                    \"server_name\": \"test\", \
                    \"host\": \"{}\", \
                    \"port\": {}, \
                    \"version\": \"bad\", \
                    \"go\": \"bad\", \
                    \"max_payload\": 4096, \
                    \"proto\": 1, \
                    \"auth_required\": {}, \
                    \"client_id\": {} \
                    }}\r\n",
                baddr.ip(),
                baddr.port(),
                auth_required,
                client_id,
            )
        };

        let mut clients: HashMap<usize, Client> = HashMap::new();

        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }

            let mut to_evict = vec![];

            // messages and faults requested by the test
            while let Ok(injection) = injections.try_recv() {
                match injection {
                    Injection::Publish { subject, payload } => {
                        for (client_id, client) in clients.iter_mut() {
                            if client.deliver(&subject, &payload).is_err() {
                                to_evict.push(*client_id);
                            }
                        }
                    }
                    Injection::EvictAll => {
                        log::debug!("evicting all connected clients");
                        clients.clear();
                        if let Ok(mut registry) = registry.lock() {
                            registry.clear();
                        }
                    }
                }
            }

            // maybe accept a new client
            if let Ok((mut next, _addr)) = listener.accept() {
                log::debug!("new client connected");
                max_client_id += 1;
                let client_id = max_client_id;
                let _unchecked = next.set_nonblocking(false);
                let _unchecked = next.set_read_timeout(Some(Duration::from_millis(1)));
                if next.write_all(server_info(client_id).as_bytes()).is_ok() {
                    clients.insert(
                        client_id,
                        Client {
                            client_id,
                            socket: next,
                            pending: vec![],
                            has_sent_ping: false,
                            last_ping: Instant::now(),
                            outstanding_pings: 0,
                            subs: HashMap::new(),
                        },
                    );
                }
            }

            for (client_id, client) in &mut clients {
                if client.outstanding_pings > 3 {
                    log::debug!(
                        "{}: outstanding pings {} caused eviction",
                        client_id,
                        client.outstanding_pings
                    );
                    to_evict.push(*client_id);
                    continue;
                }

                if client.has_sent_ping && client.last_ping.elapsed() > Duration::from_millis(50) {
                    log::trace!("{}: sending ping", client_id);
                    if let Err(err) = client.socket.write_all(b"PING\r\n") {
                        log::debug!("{}: socket error {} caused eviction", client_id, err);
                        to_evict.push(*client_id);
                        continue;
                    }
                    client.last_ping = Instant::now();
                    client.outstanding_pings += 1;
                }

                let commands = match client.read_lines() {
                    Some(commands) => commands,
                    None => {
                        log::debug!("{}: connection closed by client", client_id);
                        to_evict.push(*client_id);
                        continue;
                    }
                };

                for command in commands {
                    log::trace!("{}: got command {}", client.client_id, &command);
                    let action = client.handle_command(
                        &command,
                        &self.user_pass,
                        &self.denied_subjects,
                        &registry,
                    );
                    if action == ClientAction::Evict {
                        to_evict.push(*client_id);
                        break;
                    }
                }
            }

            while let Some(client_id) = to_evict.pop() {
                log::debug!("client {} evicted", client_id);
                clients.remove(&client_id);
                if let Ok(mut registry) = registry.lock() {
                    registry.retain(|(owner, _), _| *owner != client_id);
                }
            }

            if clients.is_empty() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

impl Client {
    /// Reads whatever is available and splits off complete lines. Returns
    /// `None` once the peer has gone away.
    fn read_lines(&mut self) -> Option<Vec<String>> {
        let mut buf = [0_u8; 4096];
        match self.socket.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => self.pending.extend_from_slice(&buf[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => return None,
        }

        let mut lines = vec![];
        while let Some(pos) = self.pending.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = self.pending.drain(..pos + 2).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        Some(lines)
    }

    fn send_err(&mut self, msg: &str) {
        let _unchecked = self.socket.write_all(format!("-ERR '{}'\r\n", msg).as_bytes());
    }

    fn deliver(&mut self, subject: &str, payload: &[u8]) -> io::Result<()> {
        for (sid, pattern) in &self.subs {
            if !subject_match(subject, pattern) {
                continue;
            }
            let mut out = format!("MSG {} {} {}\r\n", subject, sid, payload.len()).into_bytes();
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
            log::trace!("{}: sending MSG {} to sid {}", self.client_id, subject, sid);
            self.socket.write_all(&out)?;
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        command: &str,
        user_pass: &Option<(String, String)>,
        denied_subjects: &[String],
        registry: &Registry,
    ) -> ClientAction {
        let mut parts = command.splitn(2, ' ');
        let op = parts.next().unwrap_or("").to_ascii_uppercase();
        let args = parts.next().unwrap_or("").trim();

        match op.as_str() {
            "CONNECT" => {
                let info: serde_json::Value = match serde_json::from_str(args) {
                    Ok(info) => info,
                    Err(_) => {
                        self.send_err("Invalid CONNECT");
                        return ClientAction::Evict;
                    }
                };
                if let Some((user, pass)) = user_pass {
                    if info["user"].as_str() != Some(user.as_str())
                        || info["pass"].as_str() != Some(pass.as_str())
                    {
                        self.send_err("Authorization Violation");
                        return ClientAction::Evict;
                    }
                }
                ClientAction::None
            }
            "PING" => {
                if self.socket.write_all(b"PONG\r\n").is_err() {
                    return ClientAction::Evict;
                }
                self.has_sent_ping = true;
                ClientAction::None
            }
            "PONG" => {
                self.outstanding_pings = self.outstanding_pings.saturating_sub(1);
                ClientAction::None
            }
            "SUB" => {
                let args: Vec<&str> = args.split_whitespace().collect();
                let (subject, sid) = match args[..] {
                    [subject, sid] | [subject, _, sid] => (subject, sid),
                    _ => {
                        self.send_err("Invalid SUB");
                        return ClientAction::Evict;
                    }
                };
                if denied_subjects.iter().any(|denied| denied == subject) {
                    self.send_err(&format!(
                        "Permissions Violation for Subscription to \"{}\"",
                        subject
                    ));
                } else {
                    self.subs.insert(sid.to_string(), subject.to_string());
                    // recorded before any later PONG goes out
                    if let Ok(mut registry) = registry.lock() {
                        registry.insert((self.client_id, sid.to_string()), subject.to_string());
                    }
                }
                ClientAction::None
            }
            "UNSUB" => {
                if let Some(sid) = args.split_whitespace().next() {
                    self.subs.remove(sid);
                    if let Ok(mut registry) = registry.lock() {
                        registry.remove(&(self.client_id, sid.to_string()));
                    }
                }
                ClientAction::None
            }
            other => {
                log::debug!("{}: unknown command {}", self.client_id, other);
                self.send_err("Unknown Protocol Operation");
                ClientAction::Evict
            }
        }
    }
}

/// Does the subject match the pattern
fn subject_match(subject: &str, subject_pattern: &str) -> bool {
    let mut pattern_parts = subject_pattern.split('.');
    for subject_part in subject.split('.') {
        if let Some(pattern_part) = pattern_parts.next() {
            if pattern_part == ">" {
                return true;
            } else if pattern_part == subject_part || pattern_part == "*" {
                continue;
            }
        }
        return false;
    }
    pattern_parts.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    struct RawClient {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl RawClient {
        fn connect(server: &NatsTestServer, connect: &str) -> RawClient {
            let socket = TcpStream::connect(server.address()).unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut client = RawClient {
                reader: BufReader::new(socket.try_clone().unwrap()),
                writer: socket,
            };
            assert!(client.line().starts_with("INFO "));
            client.send(&format!("CONNECT {}\r\n", connect));
            client
        }

        fn send(&mut self, data: &str) {
            self.writer.write_all(data.as_bytes()).unwrap();
        }

        /// Next line from the server, answering keepalive PINGs on the way.
        fn line(&mut self) -> String {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).unwrap();
                if line == "PING\r\n" {
                    self.send("PONG\r\n");
                    continue;
                }
                return line;
            }
        }
    }

    #[test]
    fn test_subject_match() {
        assert!(subject_match("sub", "sub"));
        assert!(subject_match("sub", "*"));
        assert!(subject_match("sub", ">"));
        assert!(!subject_match("pub", "sub"));
        assert!(subject_match("sub.pub", "sub.pub"));
        assert!(subject_match("sub.pub", "sub.*"));
        assert!(subject_match("sub.pub", "*.pub"));
        assert!(subject_match("sub.pub", "*.*"));
        assert!(subject_match("sub.pub", ">"));
        assert!(subject_match("docker.web.1", "docker.>"));
        assert!(!subject_match("sub.pub", "sub"));
        assert!(!subject_match("sub.pub", "pub"));
        assert!(!subject_match("sub", "sub.*"));
        assert!(!subject_match("docker", "docker.>"));
    }

    #[test]
    fn test_unused_server_cleanup() {
        let success = Arc::new(AtomicBool::new(false));
        let handle = {
            let success = success.clone();
            std::thread::spawn(move || {
                let server = NatsTestServer::build().spawn();
                std::thread::sleep(Duration::from_millis(1));
                std::mem::drop(server);
                success.store(true, Ordering::Release);
            })
        };
        handle.join().unwrap();
        assert!(success.load(Ordering::Acquire));
    }

    #[test]
    fn test_sub_and_publish() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = NatsTestServer::build().spawn();

        let mut client = RawClient::connect(&server, r#"{"verbose":false}"#);
        client.send("SUB docker.* 7\r\nPING\r\n");
        assert_eq!(client.line(), "PONG\r\n");
        assert_eq!(server.subscriptions(), vec!["docker.*".to_string()]);

        server.publish("other", "skipped");
        server.publish("docker.web", "hello");
        assert_eq!(client.line(), "MSG docker.web 7 5\r\n");
        assert_eq!(client.line(), "hello\r\n");

        client.send("UNSUB 7\r\nPING\r\n");
        assert_eq!(client.line(), "PONG\r\n");
        assert!(server.subscriptions().is_empty());
    }

    #[test]
    fn test_denied_subject() {
        let server = NatsTestServer::build().deny_subject("secret.>").spawn();

        let mut client = RawClient::connect(&server, "{}");
        client.send("SUB secret.> 1\r\nPING\r\n");
        assert_eq!(
            client.line(),
            "-ERR 'Permissions Violation for Subscription to \"secret.>\"'\r\n"
        );
        assert_eq!(client.line(), "PONG\r\n");
        assert!(server.subscriptions().is_empty());
    }

    #[test]
    fn test_user_pass() {
        let server = NatsTestServer::build().user_pass("derek", "s3cr3t").spawn();

        let mut client = RawClient::connect(&server, r#"{"user":"derek","pass":"wrong"}"#);
        assert_eq!(client.line(), "-ERR 'Authorization Violation'\r\n");

        let mut client = RawClient::connect(&server, r#"{"user":"derek","pass":"s3cr3t"}"#);
        client.send("PING\r\n");
        assert_eq!(client.line(), "PONG\r\n");
    }
}

//! Scripted in-process SSH server for session tests.
//!
//! The server runs the real server-side transport over a `tokio::io::duplex`
//! pipe, accepts one password and answers `exec` requests from a table of
//! canned replies.

#![allow(dead_code)]

use ferrule_proto::ssh::auth::{
    auth_success, AuthBanner, AuthFailure, AuthMethod, AuthRequest, ServiceAccept, ServiceRequest,
};
use ferrule_proto::ssh::connection::{ChannelRequest, ConnectionMessage, EXTENDED_DATA_STDERR};
use ferrule_proto::ssh::{
    ConnectionError, Credentials, Ed25519HostKey, MessageType, RingCryptoProvider, Session,
    SessionConfig, Transport, TransportConfig, UnknownHostPolicy,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

/// What the server does with an `exec`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answers FAILURE.
    Reject,
    /// Sends output, exit status, EOF and CLOSE.
    Output {
        stdout: Vec<Vec<u8>>,
        stderr: Vec<u8>,
        exit_status: u32,
    },
    /// Reports a signal instead of an exit status.
    Signal(String),
    /// Accepts and then stays silent.
    Silent,
    /// Sends one DATA message of this size regardless of the window.
    Flood(usize),
    /// Swallows stdin, then prints the byte count it received.
    Count,
    /// Sends stderr, then stdout, never beyond the client's window; then
    /// the exit status, EOF and CLOSE.
    Paced {
        stderr: Vec<u8>,
        stdout: Vec<u8>,
        exit_status: u32,
    },
}

/// What the server observed.
#[derive(Debug, Default)]
pub struct Stats {
    pub auth_requests: u32,
    pub window_adjusts: u32,
    pub largest_data: usize,
    pub stdin_bytes: usize,
    pub channels_opened: u32,
    pub ignores: u32,
}

struct ServerChannel {
    client_id: u32,
    reply: Option<Reply>,
    close_sent: bool,
    window: u32,
    max_packet: u32,
    /// Output waiting for window: (is stderr, bytes).
    pending: VecDeque<(bool, Vec<u8>)>,
    /// Sent once `pending` is empty.
    report: Option<ChannelRequest>,
}

/// Scripted server configuration.
pub struct ScriptedServer {
    pub host_key: Ed25519HostKey,
    pub methods: Vec<String>,
    pub banner: Option<String>,
    pub window: u32,
    pub max_packet: u32,
    pub commands: HashMap<String, Reply>,
}

impl Default for ScriptedServer {
    fn default() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            "ps aux".to_string(),
            Reply::Output {
                stdout: vec![vec![b'a'; 200], vec![b'b'; 200], vec![b'c'; 200]],
                stderr: Vec::new(),
                exit_status: 0,
            },
        );
        commands.insert(
            "ls /missing".to_string(),
            Reply::Output {
                stdout: b"partial\n".to_vec().into_iter().map(|b| vec![b]).collect(),
                stderr: b"ls: /missing: No such file or directory\n".to_vec(),
                exit_status: 2,
            },
        );
        commands.insert("crash".to_string(), Reply::Signal("SEGV".to_string()));
        commands.insert("sleep 3600".to_string(), Reply::Silent);
        commands.insert("yes".to_string(), Reply::Flood(4096));
        commands.insert("wc -c".to_string(), Reply::Count);

        Self {
            host_key: Ed25519HostKey::generate(),
            methods: vec!["password".to_string()],
            banner: None,
            window: 32 * 1024,
            max_packet: 16 * 1024,
            commands,
        }
    }
}

/// Handle to a running scripted server.
pub struct ServerHandle {
    pub task: JoinHandle<Result<(), ConnectionError>>,
    pub stats: Arc<Mutex<Stats>>,
}

impl ScriptedServer {
    /// Starts the server; returns the client end of the pipe.
    pub fn spawn(self) -> (DuplexStream, ServerHandle) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let stats = Arc::new(Mutex::new(Stats::default()));
        let task = tokio::spawn(self.run(server, Arc::clone(&stats)));
        (client, ServerHandle { task, stats })
    }

    async fn run(self, stream: DuplexStream, stats: Arc<Mutex<Stats>>) -> Result<(), ConnectionError> {
        let mut transport = Transport::server(
            stream,
            TransportConfig::default(),
            Arc::new(RingCryptoProvider::new()),
            Arc::new(self.host_key.clone()),
        )
        .await?;

        let mut channels: HashMap<u32, ServerChannel> = HashMap::new();
        let mut next_id = 100u32;
        let mut banner_sent = false;

        loop {
            let payload = match transport.recv().await {
                Ok(payload) => payload,
                Err(ConnectionError::Disconnected { .. }) | Err(ConnectionError::Closed) => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            };

            let kind = payload[0];
            if kind == MessageType::ServiceRequest as u8 {
                let request = ServiceRequest::from_bytes(&payload)?;
                transport
                    .send(&ServiceAccept::new(request.name()).to_bytes())
                    .await?;
                continue;
            }
            if kind == MessageType::UserauthRequest as u8 {
                stats.lock().auth_requests += 1;
                let request = AuthRequest::from_bytes(&payload)?;
                if let (Some(banner), false) = (&self.banner, banner_sent) {
                    transport.send(&AuthBanner::new(banner).to_bytes()).await?;
                    banner_sent = true;
                }
                let accepted = match request.method() {
                    AuthMethod::Password(password) => {
                        self.methods.iter().any(|m| m == "password")
                            && request.user_name() == USER
                            && password.as_str() == PASSWORD
                    }
                    AuthMethod::None => false,
                };
                let answer = if accepted {
                    auth_success()
                } else {
                    AuthFailure::new(self.methods.clone(), false).to_bytes()
                };
                transport.send(&answer).await?;
                continue;
            }
            if !MessageType::is_connection(kind) {
                continue;
            }

            match ConnectionMessage::from_bytes(&payload)? {
                ConnectionMessage::Open {
                    sender,
                    window,
                    max_packet,
                    ..
                } => {
                    let id = next_id;
                    next_id += 1;
                    stats.lock().channels_opened += 1;
                    channels.insert(
                        id,
                        ServerChannel {
                            client_id: sender,
                            reply: None,
                            close_sent: false,
                            window,
                            max_packet,
                            pending: VecDeque::new(),
                            report: None,
                        },
                    );
                    transport
                        .send(
                            &ConnectionMessage::OpenConfirmation {
                                recipient: sender,
                                sender: id,
                                window: self.window,
                                max_packet: self.max_packet,
                            }
                            .to_bytes(),
                        )
                        .await?;
                }
                ConnectionMessage::Request {
                    recipient,
                    want_reply,
                    request: ChannelRequest::Exec { command },
                } => {
                    let Some(channel) = channels.get_mut(&recipient) else {
                        continue;
                    };
                    let client = channel.client_id;
                    let reply = self.commands.get(&command).cloned().unwrap_or(Reply::Reject);
                    if want_reply {
                        let answer = match reply {
                            Reply::Reject => ConnectionMessage::Failure { recipient: client },
                            _ => ConnectionMessage::Success { recipient: client },
                        };
                        transport.send(&answer.to_bytes()).await?;
                    }
                    match &reply {
                        Reply::Output {
                            stdout,
                            stderr,
                            exit_status,
                        } => {
                            for chunk in stdout {
                                send(&mut transport, data(client, chunk.clone())).await?;
                            }
                            if !stderr.is_empty() {
                                send(
                                    &mut transport,
                                    ConnectionMessage::ExtendedData {
                                        recipient: client,
                                        data_type: EXTENDED_DATA_STDERR,
                                        data: stderr.clone(),
                                    },
                                )
                                .await?;
                            }
                            finish(&mut transport, channel, ChannelRequest::ExitStatus(*exit_status))
                                .await?;
                        }
                        Reply::Signal(signal) => {
                            let request = ChannelRequest::ExitSignal {
                                signal: signal.clone(),
                                core_dumped: true,
                                message: String::new(),
                            };
                            finish(&mut transport, channel, request).await?;
                        }
                        Reply::Flood(size) => {
                            send(&mut transport, data(client, vec![b'y'; *size])).await?;
                        }
                        Reply::Paced {
                            stderr,
                            stdout,
                            exit_status,
                        } => {
                            channel.pending.push_back((true, stderr.clone()));
                            channel.pending.push_back((false, stdout.clone()));
                            channel.report = Some(ChannelRequest::ExitStatus(*exit_status));
                            pace(&mut transport, channel).await?;
                        }
                        Reply::Reject | Reply::Silent | Reply::Count => {}
                    }
                    channel.reply = Some(reply);
                }
                ConnectionMessage::Data { recipient, data: bytes } => {
                    {
                        let mut stats = stats.lock();
                        stats.largest_data = stats.largest_data.max(bytes.len());
                        stats.stdin_bytes += bytes.len();
                    }
                    if let Some(channel) = channels.get(&recipient) {
                        send(
                            &mut transport,
                            ConnectionMessage::WindowAdjust {
                                recipient: channel.client_id,
                                bytes_to_add: bytes.len() as u32,
                            },
                        )
                        .await?;
                    }
                }
                ConnectionMessage::Eof { recipient } => {
                    let Some(channel) = channels.get_mut(&recipient) else {
                        continue;
                    };
                    if let Some(Reply::Count) = channel.reply {
                        let total = stats.lock().stdin_bytes;
                        let client = channel.client_id;
                        send(&mut transport, data(client, total.to_string().into_bytes())).await?;
                        finish(&mut transport, channel, ChannelRequest::ExitStatus(0)).await?;
                    }
                }
                ConnectionMessage::Close { recipient } => {
                    if let Some(channel) = channels.remove(&recipient) {
                        if !channel.close_sent {
                            send(
                                &mut transport,
                                ConnectionMessage::Close {
                                    recipient: channel.client_id,
                                },
                            )
                            .await?;
                        }
                    }
                }
                ConnectionMessage::WindowAdjust {
                    recipient,
                    bytes_to_add,
                } => {
                    stats.lock().window_adjusts += 1;
                    if let Some(channel) = channels.get_mut(&recipient) {
                        channel.window = channel.window.saturating_add(bytes_to_add);
                        pace(&mut transport, channel).await?;
                    }
                }
                _ => {}
            }
        }
    }
}

fn data(recipient: u32, data: Vec<u8>) -> ConnectionMessage {
    ConnectionMessage::Data { recipient, data }
}

async fn send(transport: &mut Transport, message: ConnectionMessage) -> Result<(), ConnectionError> {
    transport.send(&message.to_bytes()).await
}

/// Sends pending output as far as the client's window allows, then the
/// exit report once everything went out.
async fn pace(transport: &mut Transport, channel: &mut ServerChannel) -> Result<(), ConnectionError> {
    let recipient = channel.client_id;
    while let Some((is_stderr, bytes)) = channel.pending.front_mut() {
        let n = bytes
            .len()
            .min(channel.window as usize)
            .min(channel.max_packet as usize);
        if n == 0 && !bytes.is_empty() {
            return Ok(());
        }
        let chunk: Vec<u8> = bytes.drain(..n).collect();
        let is_stderr = *is_stderr;
        if bytes.is_empty() {
            channel.pending.pop_front();
        }
        if chunk.is_empty() {
            continue;
        }
        channel.window -= n as u32;
        let message = if is_stderr {
            ConnectionMessage::ExtendedData {
                recipient,
                data_type: EXTENDED_DATA_STDERR,
                data: chunk,
            }
        } else {
            data(recipient, chunk)
        };
        send(transport, message).await?;
    }
    if let Some(report) = channel.report.take() {
        finish(transport, channel, report).await?;
    }
    Ok(())
}

/// Sends the exit report, EOF and CLOSE.
async fn finish(
    transport: &mut Transport,
    channel: &mut ServerChannel,
    report: ChannelRequest,
) -> Result<(), ConnectionError> {
    let recipient = channel.client_id;
    send(
        transport,
        ConnectionMessage::Request {
            recipient,
            want_reply: false,
            request: report,
        },
    )
    .await?;
    send(transport, ConnectionMessage::Eof { recipient }).await?;
    send(transport, ConnectionMessage::Close { recipient }).await?;
    channel.close_sent = true;
    Ok(())
}

/// Client configuration that trusts new hosts and keeps known hosts in memory.
pub fn client_config() -> SessionConfig {
    SessionConfig::new("localhost", USER).with_unknown_host_policy(UnknownHostPolicy::AcceptNew)
}

/// Connects to `server`, trusts its key and logs in.
pub async fn logged_in(server: ScriptedServer, config: SessionConfig) -> (Session, ServerHandle) {
    let (stream, handle) = server.spawn();
    let mut session = Session::new(config);
    session.connect_stream(stream).await.unwrap();
    session.verify_host(|_, _| true).await.unwrap();
    session
        .authenticate(&Credentials::password(USER, PASSWORD))
        .await
        .unwrap();
    (session, handle)
}

/// Installs a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

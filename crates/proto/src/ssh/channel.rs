//! Session channels for command execution (RFC 4254 Section 6).
//!
//! A [`Channel`] is a handle onto one slot of the connection's channel
//! table. Every operation locks the connection for one step, pumping inbound
//! messages (which may belong to other channels) until its own condition
//! holds.
//!
//! # Flow control
//!
//! The window granted to the server starts at the channel buffer capacity.
//! It is re-granted only as the application drains buffered bytes, once at
//! least half the capacity has been consumed, so buffered stdout never
//! exceeds the capacity. Stderr is set aside from the window up to the
//! capacity; beyond that it holds the window until
//! [`Channel::read_stderr`] drains it, so unread stderr never exceeds twice
//! the capacity. Data beyond the window closes the channel with
//! [`ChannelError::WindowExceeded`] and discards whatever was buffered.
//!
//! # Example
//!
//! ```rust,no_run
//! use ferrule_proto::ssh::channel::ChannelRead;
//! # async fn run(session: &ferrule_proto::ssh::Session) -> ferrule_proto::ssh::error::Result<()> {
//! let mut channel = session.open_channel().await?;
//! channel.request_exec("uname -a").await?;
//! while let ChannelRead::Data(chunk) = channel.read(4096).await? {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

use super::config::{MIN_CHANNEL_BUFFER_SIZE, MIN_CHANNEL_PACKET_SIZE};
use super::connection::{
    ChannelRequest, ConnectionMessage, OpenFailureReason, CHANNEL_SESSION, EXTENDED_DATA_STDERR,
};
use super::dispatcher::{Connection, Shared};
use super::error::{ChannelError, ConnectionError, Error, ExecError, ResourceError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, no answer yet.
    Opening,
    /// Open in both directions.
    Open,
    /// We sent EOF.
    EofSent,
    /// The server sent EOF.
    EofReceived,
    /// CLOSE sent or received.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Opening => "opening",
            ChannelState::Open => "open",
            ChannelState::EofSent => "half-closed (EOF sent)",
            ChannelState::EofReceived => "half-closed (EOF received)",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of a channel read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRead {
    /// Bytes in arrival order.
    Data(Bytes),
    /// The server finished sending and the buffer is drained.
    EndOfStream,
}

impl ChannelRead {
    /// Whether this is [`ChannelRead::EndOfStream`].
    pub fn is_end(&self) -> bool {
        matches!(self, ChannelRead::EndOfStream)
    }

    /// The bytes, if any.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            ChannelRead::Data(bytes) => Some(bytes),
            ChannelRead::EndOfStream => None,
        }
    }
}

/// `exit-signal` reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the `SIG` prefix
    pub signal: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub message: String,
}

enum Sink {
    Stdout,
    Stderr,
    Discard,
}

#[derive(Debug, Default)]
pub(crate) struct ExitInfo {
    status: Option<u32>,
    signal: Option<ExitSignal>,
}

/// Per-channel buffers and protocol state, owned by the channel table.
pub(crate) struct ChannelSlot {
    id: u32,
    remote_id: u32,
    opened: Option<std::result::Result<(), (OpenFailureReason, String)>>,
    confirmed: bool,

    remote_window: u32,
    remote_max_packet: u32,

    capacity: u32,
    local_window: u32,
    consumed: u32,
    stdout: BytesMut,
    stderr: BytesMut,

    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,

    replies: VecDeque<bool>,
    exit: Arc<Mutex<ExitInfo>>,
    violation: Option<(u32, u32)>,
    violated: bool,
    abandoned: bool,
}

impl ChannelSlot {
    fn new(id: u32, capacity: u32) -> Self {
        Self {
            id,
            remote_id: 0,
            opened: None,
            confirmed: false,
            remote_window: 0,
            remote_max_packet: 0,
            capacity,
            local_window: capacity,
            consumed: 0,
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            replies: VecDeque::new(),
            exit: Arc::new(Mutex::new(ExitInfo::default())),
            violation: None,
            violated: false,
            abandoned: false,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        if self.close_sent || self.close_received {
            // Output that arrived before the server's CLOSE is still readable.
            if self.stdout.is_empty() && self.stderr.is_empty() {
                ChannelState::Closed
            } else {
                ChannelState::EofReceived
            }
        } else if !self.confirmed {
            ChannelState::Opening
        } else if self.eof_sent {
            ChannelState::EofSent
        } else if self.eof_received {
            ChannelState::EofReceived
        } else {
            ChannelState::Open
        }
    }

    /// Applies one inbound message. Returns the reply to send, if any.
    pub(crate) fn handle(&mut self, message: ConnectionMessage) -> Option<ConnectionMessage> {
        match message {
            ConnectionMessage::OpenConfirmation {
                sender,
                window,
                max_packet,
                ..
            } => {
                debug!(
                    "Channel {} open (remote {}, window {}, max packet {})",
                    self.id, sender, window, max_packet
                );
                self.remote_id = sender;
                self.remote_window = window;
                self.remote_max_packet = max_packet;
                self.confirmed = true;
                self.opened = Some(Ok(()));
            }
            ConnectionMessage::OpenFailure {
                reason,
                description,
                ..
            } => {
                self.opened = Some(Err((reason, description)));
            }
            ConnectionMessage::WindowAdjust { bytes_to_add, .. } => {
                self.remote_window = self.remote_window.saturating_add(bytes_to_add);
            }
            ConnectionMessage::Data { data, .. } => return self.accept(&data, Sink::Stdout),
            ConnectionMessage::ExtendedData {
                data_type, data, ..
            } => {
                let sink = if data_type == EXTENDED_DATA_STDERR {
                    Sink::Stderr
                } else {
                    debug!("Channel {}: dropping extended data type {}", self.id, data_type);
                    Sink::Discard
                };
                return self.accept(&data, sink);
            }
            ConnectionMessage::Eof { .. } => {
                debug!("Channel {}: EOF from server", self.id);
                self.eof_received = true;
            }
            ConnectionMessage::Close { .. } => {
                debug!("Channel {}: CLOSE from server", self.id);
                self.close_received = true;
                if !self.close_sent {
                    self.close_sent = true;
                    return Some(ConnectionMessage::Close {
                        recipient: self.remote_id,
                    });
                }
            }
            ConnectionMessage::Request {
                want_reply,
                request,
                ..
            } => match request {
                ChannelRequest::ExitStatus(status) => {
                    debug!("Channel {}: exit status {}", self.id, status);
                    self.exit.lock().status = Some(status);
                }
                ChannelRequest::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                } => {
                    debug!("Channel {}: exit signal {}", self.id, signal);
                    self.exit.lock().signal = Some(ExitSignal {
                        signal,
                        core_dumped,
                        message,
                    });
                }
                other => {
                    debug!("Channel {}: refusing {} request", self.id, other.name());
                    if want_reply {
                        return Some(ConnectionMessage::Failure {
                            recipient: self.remote_id,
                        });
                    }
                }
            },
            ConnectionMessage::Success { .. } => self.replies.push_back(true),
            ConnectionMessage::Failure { .. } => self.replies.push_back(false),
            other => warn!("Channel {}: unexpected {:?}", self.id, other),
        }
        None
    }

    fn accept(&mut self, data: &[u8], sink: Sink) -> Option<ConnectionMessage> {
        if self.close_sent {
            return None;
        }

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if len > self.local_window {
            warn!(
                "Channel {}: server sent {} bytes with a window of {}",
                self.id, len, self.local_window
            );
            self.violation = Some((len, self.local_window));
            self.violated = true;
            self.close_sent = true;
            self.stdout.clear();
            self.stderr.clear();
            return Some(ConnectionMessage::Close {
                recipient: self.remote_id,
            });
        }

        self.local_window -= len;
        match sink {
            Sink::Stdout => self.stdout.extend_from_slice(data),
            Sink::Stderr => {
                let held = self.held_stderr();
                self.stderr.extend_from_slice(data);
                self.consumed += len - (self.held_stderr() - held) as u32;
            }
            Sink::Discard => self.consumed += len,
        }
        None
    }

    /// Stderr bytes beyond the capacity, still counted against the window.
    fn held_stderr(&self) -> usize {
        self.stderr.len().saturating_sub(self.capacity as usize)
    }

    fn take(&mut self, stdout: bool, max: usize) -> Bytes {
        if stdout {
            let n = max.min(self.stdout.len());
            self.consumed += n as u32;
            self.stdout.split_to(n).freeze()
        } else {
            let held = self.held_stderr();
            let n = max.min(self.stderr.len());
            let bytes = self.stderr.split_to(n).freeze();
            self.consumed += (held - self.held_stderr()) as u32;
            bytes
        }
    }

    /// Window to re-grant, once half the capacity has been drained.
    fn window_grant(&mut self) -> Option<ConnectionMessage> {
        if self.consumed == 0 || self.consumed < self.capacity / 2 || self.close_sent {
            return None;
        }
        let bytes_to_add = std::mem::take(&mut self.consumed);
        self.local_window += bytes_to_add;
        Some(ConnectionMessage::WindowAdjust {
            recipient: self.remote_id,
            bytes_to_add,
        })
    }

    fn remote_finished(&self) -> bool {
        self.eof_received || self.close_received
    }
}

/// Ids of handles dropped while open. Pushed without the connection lock,
/// drained by whoever holds it next.
type DropQueue = Arc<Mutex<Vec<u32>>>;

/// Open channels, keyed by local id.
pub(crate) struct ChannelTable {
    slots: BTreeMap<u32, ChannelSlot>,
    dropped: DropQueue,
    max_channels: usize,
    capacity: u32,
    max_packet: u32,
}

impl ChannelTable {
    pub(crate) fn new(max_channels: usize, capacity: u32, max_packet: u32) -> Self {
        Self {
            slots: BTreeMap::new(),
            dropped: DropQueue::default(),
            max_channels,
            capacity: capacity.max(MIN_CHANNEL_BUFFER_SIZE),
            max_packet: max_packet.max(MIN_CHANNEL_PACKET_SIZE),
        }
    }

    fn drop_queue(&self) -> DropQueue {
        Arc::clone(&self.dropped)
    }

    /// Marks the slots of dropped handles as abandoned.
    fn absorb_dropped(&mut self) {
        let dropped = std::mem::take(&mut *self.dropped.lock());
        for id in dropped {
            if let Some(slot) = self.slots.get_mut(&id) {
                debug!("Channel {}: handle dropped while open", id);
                slot.abandoned = true;
            }
        }
    }

    /// Reserves the smallest free id.
    fn allocate(&mut self) -> std::result::Result<(u32, Arc<Mutex<ExitInfo>>), ResourceError> {
        self.reap();
        if self.slots.len() >= self.max_channels {
            return Err(ResourceError::ChannelLimit {
                limit: self.max_channels,
            });
        }
        let id = (0u32..)
            .find(|id| !self.slots.contains_key(id))
            .ok_or(ResourceError::ChannelLimit {
                limit: self.max_channels,
            })?;
        let slot = ChannelSlot::new(id, self.capacity);
        let exit = Arc::clone(&slot.exit);
        self.slots.insert(id, slot);
        Ok((id, exit))
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut ChannelSlot> {
        self.slots.get_mut(&id)
    }

    fn remove(&mut self, id: u32) {
        if self.slots.remove(&id).is_some() {
            debug!("Channel {} released", id);
        }
    }

    /// Number of slots in use.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// CLOSE messages owed for dropped handles.
    pub(crate) fn take_abandoned_closes(&mut self) -> Vec<ConnectionMessage> {
        self.absorb_dropped();
        self.slots
            .values_mut()
            .filter(|slot| slot.abandoned && slot.confirmed && !slot.close_sent)
            .map(|slot| {
                slot.close_sent = true;
                ConnectionMessage::Close {
                    recipient: slot.remote_id,
                }
            })
            .collect()
    }

    /// Drops abandoned slots that finished closing.
    pub(crate) fn reap(&mut self) {
        self.absorb_dropped();
        self.slots.retain(|_, slot| {
            !(slot.abandoned && (!slot.confirmed || (slot.close_sent && slot.close_received)))
        });
    }
}

/// Handle to one session channel.
///
/// Dropping an open handle schedules a CLOSE on the next connection step;
/// call [`close`](Self::close) to wait for the server's CLOSE.
pub struct Channel {
    id: u32,
    shared: Arc<Shared>,
    exit: Arc<Mutex<ExitInfo>>,
    dropped: DropQueue,
    exec_requested: bool,
    closed: bool,
}

impl Channel {
    pub(crate) async fn open(shared: Arc<Shared>) -> Result<Self> {
        let (id, exit, dropped) = shared
            .guarded("channel open", open_step(&shared))
            .await?;

        info!("Opened channel {}", id);
        Ok(Self {
            id,
            shared,
            exit,
            dropped,
            exec_requested: false,
            closed: false,
        })
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether [`close`](Self::close) completed or the exec request was
    /// refused.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current state. A channel whose session is gone reports Closed.
    pub async fn state(&self) -> ChannelState {
        if self.closed {
            return ChannelState::Closed;
        }
        let mut conn = self.shared.conn.lock().await;
        let live = self.shared.is_live(&conn);
        match conn.channels.get_mut(self.id) {
            Some(slot) if live => slot.state(),
            _ => ChannelState::Closed,
        }
    }

    /// Exit status reported by the server.
    pub fn exit_status(&self) -> Option<u32> {
        self.exit.lock().status
    }

    /// Exit signal reported by the server.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.exit.lock().signal.clone()
    }

    /// Runs `command` on the server.
    ///
    /// # Errors
    ///
    /// - [`ExecError::AlreadyRequested`] on a second call
    /// - [`ExecError::NotOpen`] if EOF was sent or the channel is closed
    /// - [`ExecError::Rejected`] if the server refuses; the channel is then
    ///   closed and the session stays usable
    pub async fn request_exec(&mut self, command: &str) -> Result<()> {
        let id = self.id;
        if self.exec_requested {
            return Err(ExecError::AlreadyRequested { channel: id }.into());
        }
        if self.closed {
            return Err(ExecError::NotOpen {
                channel: id,
                state: ChannelState::Closed,
            }
            .into());
        }

        let shared = Arc::clone(&self.shared);
        let accepted = shared
            .guarded(
                "exec",
                exec_step(&shared, id, command, &mut self.exec_requested),
            )
            .await?;

        if accepted {
            Ok(())
        } else {
            self.closed = true;
            warn!("Server rejected exec on channel {}", id);
            Err(ExecError::Rejected {
                channel: id,
                command: command.to_string(),
            }
            .into())
        }
    }

    /// Reads up to `max` bytes of stdout, waiting until some arrive.
    ///
    /// Returns [`ChannelRead::EndOfStream`] once the server sent EOF or CLOSE
    /// and everything buffered was read, and on every call after that.
    pub async fn read(&mut self, max: usize) -> Result<ChannelRead> {
        if max == 0 {
            return Ok(ChannelRead::Data(Bytes::new()));
        }
        if self.closed {
            return Ok(ChannelRead::EndOfStream);
        }
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("channel read", read_step(&shared, self.id, max))
            .await
    }

    /// Reads up to `max` bytes of buffered stderr without waiting.
    ///
    /// Returns empty data when nothing is buffered yet, and
    /// [`ChannelRead::EndOfStream`] once the server finished and the
    /// buffer is drained.
    pub async fn read_stderr(&mut self, max: usize) -> Result<ChannelRead> {
        if max == 0 {
            return Ok(ChannelRead::Data(Bytes::new()));
        }
        if self.closed {
            return Ok(ChannelRead::EndOfStream);
        }
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("stderr read", stderr_step(&shared, self.id, max))
            .await
    }

    /// Sends `data` as stdin, waiting for window space as needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed { channel: self.id }.into());
        }
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("channel write", write_step(&shared, self.id, data))
            .await
    }

    /// Half-closes the channel: no more stdin will be sent.
    pub async fn send_eof(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("channel eof", eof_step(&shared, self.id))
            .await
    }

    /// Sends EOF and CLOSE, waits for the server's CLOSE and releases the
    /// channel id. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let result = shared
            .guarded("channel close", close_step(&shared, self.id))
            .await;

        self.closed = true;
        if result.is_ok() {
            info!("Closed channel {}", self.id);
        }
        result
    }
}

async fn open_step(shared: &Shared) -> Result<(u32, Arc<Mutex<ExitInfo>>, DropQueue)> {
    let mut conn = shared.conn.lock().await;
    let (id, exit) = conn.channels.allocate()?;
    let dropped = conn.channels.drop_queue();
    let open = ConnectionMessage::Open {
        channel_type: CHANNEL_SESSION.to_string(),
        sender: id,
        window: conn.channels.capacity,
        max_packet: conn.channels.max_packet,
    };
    if let Err(e) = conn.send(&open).await {
        conn.channels.remove(id);
        return Err(shared.fatal(&mut conn, e).await.into());
    }

    loop {
        match conn.channels.get_mut(id).and_then(|slot| slot.opened.take()) {
            Some(Ok(())) => return Ok((id, exit, dropped)),
            Some(Err((reason, description))) => {
                conn.channels.remove(id);
                warn!("Server refused channel: {} ({})", reason, description);
                return Err(ResourceError::OpenRejected {
                    reason,
                    description,
                }
                .into());
            }
            None => {}
        }
        if let Err(e) = conn.pump().await {
            conn.channels.remove(id);
            return Err(shared.fatal(&mut conn, e).await.into());
        }
    }
}

/// Sends `exec` and waits for the reply. A refused channel is closed here.
async fn exec_step(shared: &Shared, id: u32, command: &str, requested: &mut bool) -> Result<bool> {
    let mut conn = shared.conn.lock().await;
    let live = shared.is_live(&conn);
    let Some(slot) = conn.channels.get_mut(id) else {
        return Err(ChannelError::SessionClosed { channel: id }.into());
    };
    if !live {
        return Err(ChannelError::SessionClosed { channel: id }.into());
    }
    let state = if slot.close_sent || slot.close_received {
        ChannelState::Closed
    } else {
        slot.state()
    };
    if !matches!(state, ChannelState::Open | ChannelState::EofReceived) {
        return Err(ExecError::NotOpen { channel: id, state }.into());
    }
    *requested = true;

    let request = ConnectionMessage::Request {
        recipient: slot.remote_id,
        want_reply: true,
        request: ChannelRequest::Exec {
            command: command.to_string(),
        },
    };
    debug!("Channel {}: exec {:?}", id, command);
    if let Err(e) = conn.send(&request).await {
        return Err(transport_failure(shared, &mut conn, id, e).await);
    }

    loop {
        let Some(slot) = conn.channels.get_mut(id) else {
            return Err(ChannelError::Closed { channel: id }.into());
        };
        if let Some(accepted) = slot.replies.pop_front() {
            if !accepted {
                if let Err(e) = close_locked(&mut conn, id).await {
                    return Err(transport_failure(shared, &mut conn, id, e).await);
                }
            }
            return Ok(accepted);
        }
        if slot.close_received {
            return Err(ChannelError::Closed { channel: id }.into());
        }
        if let Err(e) = conn.pump().await {
            return Err(transport_failure(shared, &mut conn, id, e).await);
        }
    }
}

/// Outcome of a read on a channel whose session is gone: only a clean end
/// of stream survives, buffered bytes are never handed out.
fn read_after_teardown(id: u32, finished: bool, buffered: bool) -> Result<ChannelRead> {
    if finished && !buffered {
        Ok(ChannelRead::EndOfStream)
    } else {
        Err(ChannelError::SessionClosed { channel: id }.into())
    }
}

async fn read_step(shared: &Shared, id: u32, max: usize) -> Result<ChannelRead> {
    let mut conn = shared.conn.lock().await;
    loop {
        let live = shared.is_live(&conn);
        let Some(slot) = conn.channels.get_mut(id) else {
            return Err(ChannelError::SessionClosed { channel: id }.into());
        };
        if !live {
            return read_after_teardown(id, slot.remote_finished(), !slot.stdout.is_empty());
        }
        if let Some((received, window)) = slot.violation.take() {
            return Err(ChannelError::WindowExceeded {
                channel: id,
                received,
                window,
            }
            .into());
        }
        if slot.violated {
            return Err(ChannelError::Closed { channel: id }.into());
        }
        if !slot.stdout.is_empty() {
            let data = slot.take(true, max);
            if let Some(adjust) = slot.window_grant() {
                if let Err(e) = conn.send(&adjust).await {
                    return Err(transport_failure(shared, &mut conn, id, e).await);
                }
            }
            return Ok(ChannelRead::Data(data));
        }
        if slot.remote_finished() {
            return Ok(ChannelRead::EndOfStream);
        }
        if slot.close_sent {
            return Err(ChannelError::Closed { channel: id }.into());
        }
        // Stderr and discarded data free window without any stdout read.
        if let Some(adjust) = slot.window_grant() {
            if let Err(e) = conn.send(&adjust).await {
                return Err(transport_failure(shared, &mut conn, id, e).await);
            }
        }
        if let Err(e) = conn.pump().await {
            return Err(transport_failure(shared, &mut conn, id, e).await);
        }
    }
}

async fn stderr_step(shared: &Shared, id: u32, max: usize) -> Result<ChannelRead> {
    let mut conn = shared.conn.lock().await;
    let live = shared.is_live(&conn);
    let Some(slot) = conn.channels.get_mut(id) else {
        return Err(ChannelError::SessionClosed { channel: id }.into());
    };
    if !live {
        return read_after_teardown(id, slot.remote_finished(), !slot.stderr.is_empty());
    }
    if slot.violated {
        return Err(ChannelError::Closed { channel: id }.into());
    }
    if slot.stderr.is_empty() {
        return Ok(if slot.remote_finished() {
            ChannelRead::EndOfStream
        } else {
            ChannelRead::Data(Bytes::new())
        });
    }

    let data = slot.take(false, max);
    if let Some(adjust) = slot.window_grant() {
        if let Err(e) = conn.send(&adjust).await {
            return Err(transport_failure(shared, &mut conn, id, e).await);
        }
    }
    Ok(ChannelRead::Data(data))
}

async fn write_step(shared: &Shared, id: u32, data: &[u8]) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    let mut offset = 0;
    while offset < data.len() {
        let live = shared.is_live(&conn);
        let Some(slot) = conn.channels.get_mut(id) else {
            return Err(ChannelError::SessionClosed { channel: id }.into());
        };
        if !live {
            return Err(ChannelError::SessionClosed { channel: id }.into());
        }
        if slot.eof_sent || slot.close_sent || slot.close_received {
            return Err(ChannelError::Closed { channel: id }.into());
        }

        let limit = slot.remote_window.min(slot.remote_max_packet) as usize;
        let chunk = limit.min(data.len() - offset);
        if chunk == 0 {
            if let Err(e) = conn.pump().await {
                return Err(transport_failure(shared, &mut conn, id, e).await);
            }
            continue;
        }

        slot.remote_window -= chunk as u32;
        let message = ConnectionMessage::Data {
            recipient: slot.remote_id,
            data: data[offset..offset + chunk].to_vec(),
        };
        if let Err(e) = conn.send(&message).await {
            return Err(transport_failure(shared, &mut conn, id, e).await);
        }
        offset += chunk;
    }
    Ok(())
}

async fn eof_step(shared: &Shared, id: u32) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    let live = shared.is_live(&conn);
    let Some(slot) = conn.channels.get_mut(id) else {
        return Err(ChannelError::SessionClosed { channel: id }.into());
    };
    if !live {
        return Err(ChannelError::SessionClosed { channel: id }.into());
    }
    if slot.eof_sent || slot.close_sent {
        return Ok(());
    }
    slot.eof_sent = true;
    let eof = ConnectionMessage::Eof {
        recipient: slot.remote_id,
    };
    if let Err(e) = conn.send(&eof).await {
        return Err(transport_failure(shared, &mut conn, id, e).await);
    }
    Ok(())
}

async fn close_step(shared: &Shared, id: u32) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    if !shared.is_live(&conn) {
        conn.channels.remove(id);
        return Ok(());
    }
    if let Err(e) = close_locked(&mut conn, id).await {
        conn.channels.remove(id);
        return Err(transport_failure(shared, &mut conn, id, e).await);
    }
    Ok(())
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed {
            self.dropped.lock().push(self.id);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("exec_requested", &self.exec_requested)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Sends EOF and CLOSE as needed and pumps until the server's CLOSE.
async fn close_locked(conn: &mut Connection, id: u32) -> std::result::Result<(), ConnectionError> {
    loop {
        let Some(slot) = conn.channels.get_mut(id) else {
            return Ok(());
        };
        if !slot.close_sent {
            let remote = slot.remote_id;
            let send_eof = !slot.eof_sent && !slot.close_received;
            slot.eof_sent = true;
            slot.close_sent = true;
            if send_eof {
                conn.send(&ConnectionMessage::Eof { recipient: remote })
                    .await?;
            }
            conn.send(&ConnectionMessage::Close { recipient: remote })
                .await?;
            continue;
        }
        if slot.close_received {
            conn.channels.remove(id);
            return Ok(());
        }
        conn.pump().await?;
    }
}

async fn transport_failure(
    shared: &Shared,
    conn: &mut Connection,
    channel: u32,
    err: ConnectionError,
) -> Error {
    let source = shared.fatal(conn, err).await;
    ChannelError::Transport { channel, source }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_slot(capacity: u32) -> ChannelSlot {
        let mut slot = ChannelSlot::new(0, capacity);
        slot.handle(ConnectionMessage::OpenConfirmation {
            recipient: 0,
            sender: 7,
            window: 1000,
            max_packet: 100,
        });
        slot
    }

    fn data(len: usize) -> ConnectionMessage {
        ConnectionMessage::Data {
            recipient: 0,
            data: vec![b'x'; len],
        }
    }

    #[test]
    fn test_state_progression() {
        let mut slot = ChannelSlot::new(0, 64);
        assert_eq!(slot.state(), ChannelState::Opening);
        slot.handle(ConnectionMessage::OpenConfirmation {
            recipient: 0,
            sender: 1,
            window: 10,
            max_packet: 10,
        });
        assert_eq!(slot.state(), ChannelState::Open);
        slot.handle(ConnectionMessage::Eof { recipient: 0 });
        assert_eq!(slot.state(), ChannelState::EofReceived);

        let reply = slot.handle(ConnectionMessage::Close { recipient: 0 });
        assert_eq!(reply, Some(ConnectionMessage::Close { recipient: 1 }));
        assert_eq!(slot.state(), ChannelState::Closed);
    }

    #[test]
    fn test_window_regranted_after_half_drained() {
        let mut slot = open_slot(100);
        assert!(slot.handle(data(60)).is_none());
        assert_eq!(slot.local_window, 40);

        assert_eq!(slot.take(true, 30).len(), 30);
        assert!(slot.window_grant().is_none());

        assert_eq!(slot.take(true, 30).len(), 30);
        assert_eq!(
            slot.window_grant(),
            Some(ConnectionMessage::WindowAdjust {
                recipient: 7,
                bytes_to_add: 60
            })
        );
        assert_eq!(slot.local_window, 100);
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let mut slot = open_slot(100);
        assert!(slot.handle(data(100)).is_none());
        assert_eq!(slot.stdout.len(), 100);

        let reply = slot.handle(data(1));
        assert_eq!(reply, Some(ConnectionMessage::Close { recipient: 7 }));
        assert_eq!(slot.violation, Some((1, 0)));
        assert_eq!(slot.state(), ChannelState::Closed);
    }

    #[test]
    fn test_violation_discards_buffered_output() {
        let mut slot = open_slot(100);
        assert!(slot.handle(data(60)).is_none());
        slot.handle(ConnectionMessage::ExtendedData {
            recipient: 0,
            data_type: EXTENDED_DATA_STDERR,
            data: b"warn".to_vec(),
        });

        let reply = slot.handle(data(50));
        assert_eq!(reply, Some(ConnectionMessage::Close { recipient: 7 }));
        assert_eq!(slot.violation, Some((50, 36)));
        assert!(slot.stdout.is_empty());
        assert!(slot.stderr.is_empty());
        assert_eq!(slot.state(), ChannelState::Closed);

        // Nothing more is buffered once closed.
        assert!(slot.handle(data(10)).is_none());
        assert!(slot.stdout.is_empty());
    }

    #[test]
    fn test_output_before_server_close_stays_readable() {
        let mut slot = open_slot(100);
        slot.handle(data(10));
        slot.handle(ConnectionMessage::Eof { recipient: 0 });
        slot.handle(ConnectionMessage::Close { recipient: 0 });
        assert_eq!(slot.state(), ChannelState::EofReceived);

        assert_eq!(slot.take(true, 100).len(), 10);
        assert_eq!(slot.state(), ChannelState::Closed);
    }

    #[test]
    fn test_stderr_does_not_hold_window() {
        let mut slot = open_slot(100);
        slot.handle(ConnectionMessage::ExtendedData {
            recipient: 0,
            data_type: EXTENDED_DATA_STDERR,
            data: vec![b'e'; 100],
        });
        assert_eq!(slot.local_window, 0);
        // Stderr up to the capacity is regranted without being read.
        assert_eq!(
            slot.window_grant(),
            Some(ConnectionMessage::WindowAdjust {
                recipient: 7,
                bytes_to_add: 100
            })
        );

        // Beyond the capacity it holds the window until drained.
        slot.handle(ConnectionMessage::ExtendedData {
            recipient: 0,
            data_type: EXTENDED_DATA_STDERR,
            data: vec![b'e'; 60],
        });
        assert_eq!(slot.local_window, 40);
        assert!(slot.window_grant().is_none());
        assert!(slot.handle(data(40)).is_none());

        assert_eq!(slot.take(false, 1000).len(), 160);
        assert_eq!(
            slot.window_grant(),
            Some(ConnectionMessage::WindowAdjust {
                recipient: 7,
                bytes_to_add: 60
            })
        );
        assert_eq!(slot.take(true, 1000).len(), 40);
        assert_eq!(slot.local_window, 60);
    }

    #[test]
    fn test_stderr_buffered_separately() {
        let mut slot = open_slot(100);
        slot.handle(ConnectionMessage::ExtendedData {
            recipient: 0,
            data_type: EXTENDED_DATA_STDERR,
            data: b"oops".to_vec(),
        });
        slot.handle(ConnectionMessage::ExtendedData {
            recipient: 0,
            data_type: 42,
            data: b"ignored".to_vec(),
        });
        assert!(slot.stdout.is_empty());
        assert_eq!(&slot.take(false, 10)[..], b"oops");
        assert_eq!(slot.local_window, 100 - 4 - 7);
    }

    #[test]
    fn test_unknown_request_refused_when_reply_wanted() {
        let mut slot = open_slot(100);
        let reply = slot.handle(ConnectionMessage::Request {
            recipient: 0,
            want_reply: true,
            request: ChannelRequest::Other("keepalive@openssh.com".to_string()),
        });
        assert_eq!(reply, Some(ConnectionMessage::Failure { recipient: 7 }));

        slot.handle(ConnectionMessage::Request {
            recipient: 0,
            want_reply: false,
            request: ChannelRequest::ExitStatus(3),
        });
        assert_eq!(slot.exit.lock().status, Some(3));
    }

    #[test]
    fn test_table_reuses_smallest_free_id() {
        let mut table = ChannelTable::new(3, 1024, 512);
        let (a, _) = table.allocate().unwrap();
        let (b, _) = table.allocate().unwrap();
        let (c, _) = table.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(matches!(
            table.allocate(),
            Err(ResourceError::ChannelLimit { limit: 3 })
        ));

        table.remove(1);
        assert_eq!(table.allocate().unwrap().0, 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_table_sizes_have_a_floor() {
        let mut table = ChannelTable::new(1, 0, 0);
        assert_eq!(table.capacity, MIN_CHANNEL_BUFFER_SIZE);
        assert_eq!(table.max_packet, MIN_CHANNEL_PACKET_SIZE);
        let (id, _) = table.allocate().unwrap();
        assert_eq!(table.get_mut(id).unwrap().local_window, MIN_CHANNEL_BUFFER_SIZE);
    }

    #[test]
    fn test_abandoned_slot_closed_and_reaped() {
        let mut table = ChannelTable::new(2, 1024, 512);
        let (id, _) = table.allocate().unwrap();
        let slot = table.get_mut(id).unwrap();
        slot.handle(ConnectionMessage::OpenConfirmation {
            recipient: id,
            sender: 9,
            window: 10,
            max_packet: 10,
        });
        // A handle dropped while another task held the connection.
        table.drop_queue().lock().push(id);

        assert_eq!(
            table.take_abandoned_closes(),
            vec![ConnectionMessage::Close { recipient: 9 }]
        );
        assert!(table.take_abandoned_closes().is_empty());
        table.reap();
        assert_eq!(table.len(), 1);

        table
            .get_mut(id)
            .unwrap()
            .handle(ConnectionMessage::Close { recipient: id });
        table.reap();
        assert_eq!(table.len(), 0);
    }
}

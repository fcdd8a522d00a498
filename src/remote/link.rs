//! Remote Link - persistent text session to the playback application
//!
//! One task owns the connection and is the only writer. Each connection gets
//! its own reader task that feeds lines back through a channel; the reader is
//! stopped through a [`CancellationToken`] when the connection is dropped.
//!
//! # Delivery
//!
//! Commands are never queued. A command that arrives while disconnected
//! triggers exactly one connection attempt; if that fails the command is
//! logged and dropped, since a key press replayed seconds later would act on
//! whatever screen the frontend shows by then. For the same reason a command
//! that sat in the channel longer than `max_command_age_ms`, behind attempts
//! that each waited out the connect timeout, is dropped unsent.
//!
//! # Keepalive
//!
//! When nothing was written for the keepalive interval the link sends
//! `query location`. The first reply after it is swallowed here, so only real
//! playback notifications reach the dispatcher's idle timer. Notifications
//! are always forwarded, even while that reply is outstanding.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{StatusLine, DEFAULT_PORT, MAX_LINE_LENGTH};
use crate::mapping::Command;
use crate::state::ConnectionState;

/// Capacity of the command channel feeding the link
const COMMAND_BUFFER: usize = 8;
const READER_BUFFER: usize = 32;

/// Configuration settings for the remote link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,

    /// Upper bound for a single connection attempt
    pub connect_timeout_ms: u64,

    /// Fixed pause before the background reconnect after a failure
    pub reconnect_delay_ms: u64,

    /// Silence on the outbound side after which a status query is sent
    pub keepalive_interval_ms: u64,

    /// Commands older than this when their turn comes are dropped
    pub max_command_age_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 2000,
            reconnect_delay_ms: 5000,
            keepalive_interval_ms: 30_000,
            max_command_age_ms: 1000,
        }
    }
}

impl LinkSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn max_command_age(&self) -> Duration {
        Duration::from_millis(self.max_command_age_ms)
    }
}

/// A command on its way to the link, stamped when it was issued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub command: Command,
    pub issued_at: Instant,
}

impl Outbound {
    pub fn now(command: Command) -> Self {
        Self {
            command,
            issued_at: Instant::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error("Write failed: {0}")]
    Write(#[from] LinesCodecError),

    #[error("Remote link is not connected")]
    NotConnected,
}

/// What happened to a command handed to the link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
}

#[derive(Debug)]
enum ReaderEvent {
    Line { generation: u64, line: String },
    Closed { generation: u64, reason: String },
}

struct Connection {
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    cancel: CancellationToken,
    /// Tags reader events so lines from an old socket are ignored
    generation: u64,
    last_write: Instant,
    /// A keepalive query went out and its reply has not arrived yet
    keepalive_pending: bool,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct RemoteLink {
    settings: LinkSettings,
    connection: Option<Connection>,
    generation: u64,
    connect_attempts: u64,
    commands: mpsc::Receiver<Outbound>,
    reader_sender: mpsc::Sender<ReaderEvent>,
    reader_receiver: mpsc::Receiver<ReaderEvent>,
    status_sender: mpsc::Sender<String>,
    state_sender: watch::Sender<ConnectionState>,
    next_reconnect: Option<Instant>,
}

impl RemoteLink {
    fn new(
        settings: LinkSettings,
        commands: mpsc::Receiver<Outbound>,
        status_sender: mpsc::Sender<String>,
        state_sender: watch::Sender<ConnectionState>,
    ) -> Self {
        let (reader_sender, reader_receiver) = mpsc::channel(READER_BUFFER);
        Self {
            settings,
            connection: None,
            generation: 0,
            connect_attempts: 0,
            commands,
            reader_sender,
            reader_receiver,
            status_sender,
            state_sender,
            next_reconnect: Some(Instant::now()),
        }
    }

    /// Runs until every command sender is gone
    pub async fn run(mut self) {
        info!("Remote link started for {}", self.settings.address());

        loop {
            let keepalive_at = self
                .connection
                .as_ref()
                .map(|c| c.last_write + self.settings.keepalive_interval());
            let reconnect_at = self.next_reconnect.filter(|_| self.connection.is_none());

            tokio::select! {
                outbound = self.commands.recv() => match outbound {
                    Some(outbound) => {
                        self.dispatch(outbound).await;
                    }
                    None => {
                        info!("Command channel closed, stopping remote link");
                        break;
                    }
                },
                Some(event) = self.reader_receiver.recv() => self.handle_reader_event(event),
                _ = sleep_until(keepalive_at.unwrap_or_else(Instant::now)), if keepalive_at.is_some() => {
                    self.keepalive().await;
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect().await;
                }
            }
        }

        self.disconnect("link stopped");
    }

    /// Delivers a queued command unless it is already too old to act on
    pub async fn dispatch(&mut self, outbound: Outbound) -> Delivery {
        let age = outbound.issued_at.elapsed();
        if age > self.settings.max_command_age() {
            warn!(
                "Dropping command '{}', it waited {:?} for its turn",
                outbound.command, age
            );
            return Delivery::Dropped;
        }
        self.deliver(outbound.command).await
    }

    /// Writes one command, connecting first if needed
    ///
    /// Never queues: on any failure the command is dropped.
    pub async fn deliver(&mut self, command: Command) -> Delivery {
        if self.connection.is_none() {
            if let Err(e) = self.connect().await {
                warn!("Remote unavailable, dropping command '{}': {}", command, e);
                self.schedule_reconnect();
                return Delivery::Dropped;
            }
        }

        match self.write_line(command).await {
            Ok(()) => {
                debug!("Sent command '{}'", command);
                Delivery::Sent
            }
            Err(e) => {
                warn!("Dropping command '{}': {}", command, e);
                self.disconnect("write failed");
                self.schedule_reconnect();
                Delivery::Dropped
            }
        }
    }

    async fn connect(&mut self) -> Result<(), LinkError> {
        let addr = self.settings.address();
        self.connect_attempts += 1;
        self.publish(ConnectionState::Connecting);
        debug!("Connecting to remote at {} (attempt {})", addr, self.connect_attempts);

        let stream = match timeout(self.settings.connect_timeout(), TcpStream::connect(addr.as_str())).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.publish(ConnectionState::Disconnected);
                return Err(LinkError::Connect { addr, source });
            }
            Err(_) => {
                self.publish(ConnectionState::Disconnected);
                return Err(LinkError::ConnectTimeout(addr));
            }
        };

        let (read_half, write_half) = stream.into_split();
        self.generation += 1;
        let cancel = CancellationToken::new();
        tokio::spawn(read_lines(
            read_half,
            self.generation,
            self.reader_sender.clone(),
            cancel.clone(),
        ));

        self.connection = Some(Connection {
            writer: FramedWrite::new(write_half, LinesCodec::new()),
            cancel,
            generation: self.generation,
            last_write: Instant::now(),
            keepalive_pending: false,
        });
        self.next_reconnect = None;
        self.publish(ConnectionState::Connected);
        info!("Connected to remote at {}", addr);
        Ok(())
    }

    async fn write_line(&mut self, command: Command) -> Result<(), LinkError> {
        let connection = self.connection.as_mut().ok_or(LinkError::NotConnected)?;
        connection.writer.send(command.as_str()).await?;
        connection.last_write = Instant::now();
        Ok(())
    }

    async fn keepalive(&mut self) {
        debug!(
            "Nothing sent for {:?}, querying remote",
            self.settings.keepalive_interval()
        );
        match self.write_line(Command::STATUS_QUERY).await {
            Ok(()) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.keepalive_pending = true;
                }
            }
            Err(e) => {
                warn!("Keepalive failed: {}", e);
                self.disconnect("keepalive failed");
                self.schedule_reconnect();
            }
        }
    }

    async fn reconnect(&mut self) {
        self.next_reconnect = None;
        if self.connection.is_some() {
            return;
        }
        if let Err(e) = self.connect().await {
            info!("Remote unavailable: {}", e);
            self.schedule_reconnect();
        }
    }

    fn handle_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::Line { generation, line } => {
                let Some(connection) = self
                    .connection
                    .as_mut()
                    .filter(|c| c.generation == generation)
                else {
                    debug!("Ignoring line from stale connection {}", generation);
                    return;
                };

                let Some(kind) = StatusLine::classify(&line) else {
                    return;
                };
                if kind == StatusLine::Greeting {
                    debug!("Remote greeting: {}", line.trim());
                    return;
                }
                let answers_keepalive = kind == StatusLine::Reply && connection.keepalive_pending;
                if answers_keepalive {
                    connection.keepalive_pending = false;
                    debug!("Keepalive answered: {}", line.trim());
                    return;
                }

                match kind {
                    StatusLine::Notification => self.forward(line),
                    _ => debug!("Remote reply: {}", line.trim()),
                }
            }
            ReaderEvent::Closed { generation, reason } => {
                if self.connection.as_ref().map(|c| c.generation) != Some(generation) {
                    return;
                }
                self.disconnect(&reason);
                self.schedule_reconnect();
            }
        }
    }

    fn forward(&self, line: String) {
        match self.status_sender.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(line)) => {
                warn!("Dispatcher busy, dropping status line: {}", line.trim())
            }
            Err(TrySendError::Closed(_)) => debug!("Status receiver gone"),
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if self.connection.take().is_some() {
            info!("Disconnected from remote: {}", reason);
        }
        self.publish(ConnectionState::Disconnected);
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.settings.reconnect_delay();
        debug!("Next remote connection attempt in {:?}", delay);
        self.next_reconnect = Some(Instant::now() + delay);
    }

    fn publish(&self, state: ConnectionState) {
        let previous = self.state_sender.send_replace(state);
        if previous != state {
            info!("Remote link: {} -> {}", previous, state);
        }
    }
}

async fn read_lines(
    read_half: OwnedReadHalf,
    generation: u64,
    events: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    if events.send(ReaderEvent::Line { generation, line }).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed by remote".to_string(),
            },
        }
    };

    if events
        .send(ReaderEvent::Closed { generation, reason })
        .await
        .is_err()
    {
        debug!("Remote link gone before reader {} closed", generation);
    }
}

/// Handle for the running remote link task
pub struct RemoteLinkHandle {
    command_sender: mpsc::Sender<Outbound>,
    state_receiver: watch::Receiver<ConnectionState>,
}

impl RemoteLinkHandle {
    /// Spawns the link task; it connects in the background right away
    ///
    /// Playback notifications are pushed into `status_sender` without
    /// waiting, so a slow receiver never stalls the link.
    pub fn spawn(settings: Option<LinkSettings>, status_sender: mpsc::Sender<String>) -> Self {
        let settings = settings.unwrap_or_default();
        info!("Initializing remote link with settings: {:?}", settings);

        let (command_sender, command_receiver) = mpsc::channel(COMMAND_BUFFER);
        let (state_sender, state_receiver) = watch::channel(ConnectionState::Disconnected);

        let link = RemoteLink::new(settings, command_receiver, status_sender, state_sender);
        tokio::spawn(link.run());

        Self {
            command_sender,
            state_receiver,
        }
    }

    pub fn command_sender(&self) -> mpsc::Sender<Outbound> {
        self.command_sender.clone()
    }

    /// Receiver for the remote connection state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_receiver.clone()
    }
}

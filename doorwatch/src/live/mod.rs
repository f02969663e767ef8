//! Live update channel
//!
//! A persistent push connection to the server. The transport (`PushTransport`)
//! owns the connection and its reconnect/backoff policy, and reports what
//! happens as `TransportEvent`s on a `crossbeam::channel`. `LiveChannel`
//! sits on top of it: it mirrors the connection state, decodes messages
//! into typed `PushEvent`s, and asks for a repair fetch when the
//! connection comes back after having been lost. It never retries on its
//! own.

mod event;
mod tcp;

pub use event::{DecodeError, PushEvent};
pub use event::{LINK_STATUS, NEW_ACCESS_LOG, STATS_UPDATED, USER_CREATED, USER_DELETED, USER_UPDATED};
pub use tcp::{Backoff, TcpTransport};

use crate::model::LinkState;

use crossbeam::channel;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What a transport reports, in order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
    Message { event: String, data: Value },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport already connected")]
    AlreadyConnected,

    #[error("failed to start transport: {0}")]
    Io(#[from] std::io::Error),
}

pub trait PushTransport: Send {
    /// Starts delivering events to `sink` until `disconnect()`.
    fn connect(&mut self, sink: channel::Sender<TransportEvent>) -> Result<(), TransportError>;

    /// Stops the transport. No events are delivered after this returns.
    fn disconnect(&mut self);
}

/// Outcome of one transport event, for the core to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelAction {
    /// Connection state changed. `repair` asks for one full reload, to make
    /// up for events missed while disconnected.
    Link { state: LinkState, repair: bool },
    Push(PushEvent),
    /// A message that could not be decoded; prior state stands.
    Dropped(String),
    /// Nothing changed.
    None,
}

pub struct LiveChannel {
    transport: Box<dyn PushTransport>,
    tx: channel::Sender<TransportEvent>,
    rx: channel::Receiver<TransportEvent>,
    state: LinkState,
    /// Whether a connection was ever established.
    was_connected: bool,
}

impl LiveChannel {
    pub fn new(transport: Box<dyn PushTransport>) -> LiveChannel {
        let (tx, rx) = channel::unbounded();
        LiveChannel {
            transport,
            tx,
            rx,
            state: LinkState::Disconnected,
            was_connected: false,
        }
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect(self.tx.clone())
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.state = LinkState::Disconnected;
    }

    pub fn receiver(&self) -> &channel::Receiver<TransportEvent> {
        &self.rx
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn link(&mut self, state: LinkState) -> ChannelAction {
        if state == self.state {
            return ChannelAction::None;
        }
        let repair = state == LinkState::Connected && self.was_connected;
        if state == LinkState::Connected {
            self.was_connected = true;
        }
        self.state = state;
        ChannelAction::Link { state, repair }
    }

    pub fn handle(&mut self, event: TransportEvent) -> ChannelAction {
        match event {
            TransportEvent::Connecting => self.link(LinkState::Connecting),
            TransportEvent::Connected => {
                info!("push channel connected");
                self.link(LinkState::Connected)
            }
            TransportEvent::Disconnected => {
                info!("push channel disconnected");
                self.link(LinkState::Disconnected)
            }
            TransportEvent::Error(err) => {
                debug!("push channel error: {}", err);
                self.link(LinkState::Error)
            }
            TransportEvent::Message { event, data } => match PushEvent::decode(&event, data) {
                Ok(push) => ChannelAction::Push(push),
                Err(err) => {
                    warn!("dropping push event: {}", err);
                    ChannelAction::Dropped(err.to_string())
                }
            },
        }
    }
}

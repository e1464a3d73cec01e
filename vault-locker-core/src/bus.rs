//! D-Bus front door: `Seal`/`Unseal` signals on a fixed interface.
//!
//! The signals carry no payload. Each received signal is dispatched to every
//! subscribed [`SealListener`] in subscription order, one listener at a time;
//! the next signal is not read until the previous dispatch has finished.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use zbus::Connection;

use crate::config::{BusConfig, BusKind};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),
    #[error("D-Bus signal stream ended")]
    StreamEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealRequest {
    Seal,
    Unseal,
}

impl SealRequest {
    /// Signal member name on the bus.
    pub fn member(self) -> &'static str {
        match self {
            Self::Seal => "Seal",
            Self::Unseal => "Unseal",
        }
    }

    pub fn from_member(member: &str) -> Option<Self> {
        match member {
            "Seal" => Some(Self::Seal),
            "Unseal" => Some(Self::Unseal),
            _ => None,
        }
    }
}

/// Receiver of bus requests.
#[async_trait::async_trait]
pub trait SealListener: Send + Sync {
    async fn on_seal(&self);
    async fn on_unseal(&self);
}

/// Ordered listener set. Listeners are only ever appended.
#[derive(Clone, Default)]
pub struct Dispatcher {
    listeners: Vec<Arc<dyn SealListener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn SealListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Awaits each listener in turn.
    pub async fn dispatch(&self, request: SealRequest) {
        tracing::info!(member = request.member(), "bus request received");
        for listener in &self.listeners {
            match request {
                SealRequest::Seal => listener.on_seal().await,
                SealRequest::Unseal => listener.on_unseal().await,
            }
        }
    }
}

/// Feeds `requests` into `dispatcher` until shutdown or the end of the stream.
///
/// A dispatch in progress is finished before shutdown is honoured.
pub async fn dispatch_requests<S>(
    requests: S,
    dispatcher: &Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BusError>
where
    S: Stream<Item = SealRequest>,
{
    let mut requests = std::pin::pin!(requests);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            next = requests.next() => match next {
                Some(request) => dispatcher.dispatch(request).await,
                None => return Err(BusError::StreamEnded),
            },
        }
    }
}

pub async fn connect(kind: BusKind) -> zbus::Result<Connection> {
    match kind {
        BusKind::System => Connection::system().await,
        BusKind::Session => Connection::session().await,
    }
}

pub struct Bus {
    conn: Connection,
    interface: String,
}

impl Bus {
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let conn = connect(config.kind).await?;
        Ok(Self {
            conn,
            interface: config.interface.clone(),
        })
    }

    /// Subscribes to the interface's signals. The stream keeps the
    /// connection alive and yields only `Seal`/`Unseal`; bus errors and
    /// unknown members are logged and skipped.
    pub async fn requests(&self) -> Result<BoxStream<'static, SealRequest>, BusError> {
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(self.interface.as_str())?
            .build();
        let stream = zbus::MessageStream::for_match_rule(rule, &self.conn, None).await?;

        tracing::info!(interface = %self.interface, "waiting for bus events");

        Ok(stream
            .filter_map(|msg| async move {
                match msg {
                    Ok(msg) => request_from_message(&msg),
                    Err(err) => {
                        tracing::debug!("bus stream error (skipping): {err}");
                        None
                    }
                }
            })
            .boxed())
    }
}

fn request_from_message(msg: &zbus::Message) -> Option<SealRequest> {
    let header = msg.header();
    let member = header.member()?;
    let request = SealRequest::from_member(member.as_str());
    if request.is_none() {
        tracing::debug!(member = member.as_str(), "ignoring unknown signal");
    }
    request
}

/// Broadcasts `request` so a running daemon picks it up.
pub async fn emit_request(config: &BusConfig, request: SealRequest) -> Result<(), BusError> {
    let conn = connect(config.kind).await?;
    conn.emit_signal(
        None::<&str>,
        config.object_path.as_str(),
        config.interface.as_str(),
        request.member(),
        &(),
    )
    .await?;
    tracing::debug!(member = request.member(), interface = %config.interface, "signal emitted");
    Ok(())
}

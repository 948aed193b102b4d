//! The single live link to the inverter.
//!
//! A [`Connection`] owns the physical stream and its state machine:
//! `Disconnected → Connecting → Connected → Faulted → Connecting ...`.
//! It performs no locking of its own; the scheduler guarantees that only one
//! `exchange` is outstanding at a time. Several slave ids may share the link
//! (an inverter relaying for a second inverter or the battery), so the unit
//! is chosen per exchange.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use strum::Display;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::frame::{ClientRtuCodec, ClientTcpCodec, Frame};
use super::pdu::{Request, Response};
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Where the device lives. Exactly one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Serial(SerialSettings),
}

fn default_tcp_port() -> u16 {
    502
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SerialSettings {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> u8 {
    1
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Serial(s) => write!(f, "serial://{}@{}", s.path, s.baud_rate),
        }
    }
}

/// The request/response seam below the scheduler.
#[async_trait]
pub trait Transport: Send {
    /// Send one request to unit `slave` and wait for its response
    /// (exceptions included).
    async fn exchange(&mut self, slave: u8, request: &Request) -> Result<Response>;

    fn state(&self) -> ConnectionState;

    /// Bumped on every successful (re)connect.
    fn generation(&self) -> u64;

    async fn close(&mut self);
}

/// Connection tuning; see `config::SchedulerConfig` for the file-level knobs.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_TIMEOUT,
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

enum Link {
    Tcp(Framed<TcpStream, ClientTcpCodec>),
    #[cfg(feature = "serial")]
    Rtu(Framed<tokio_serial::SerialStream, ClientRtuCodec>),
}

impl Link {
    async fn open(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::NotConnected(format!("{endpoint}: {e}")))?;
                stream.set_nodelay(true)?;
                Ok(Link::Tcp(Framed::new(stream, ClientTcpCodec::default())))
            }
            #[cfg(feature = "serial")]
            Endpoint::Serial(settings) => {
                let builder = tokio_serial::new(&settings.path, settings.baud_rate)
                    .data_bits(match settings.data_bits {
                        5 => tokio_serial::DataBits::Five,
                        6 => tokio_serial::DataBits::Six,
                        7 => tokio_serial::DataBits::Seven,
                        _ => tokio_serial::DataBits::Eight,
                    })
                    .parity(match settings.parity {
                        Parity::None => tokio_serial::Parity::None,
                        Parity::Even => tokio_serial::Parity::Even,
                        Parity::Odd => tokio_serial::Parity::Odd,
                    })
                    .stop_bits(if settings.stop_bits == 2 {
                        tokio_serial::StopBits::Two
                    } else {
                        tokio_serial::StopBits::One
                    })
                    .flow_control(tokio_serial::FlowControl::None);
                let stream = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| Error::NotConnected(format!("{endpoint}: {e}")))?;
                Ok(Link::Rtu(Framed::new(stream, ClientRtuCodec::default())))
            }
            #[cfg(not(feature = "serial"))]
            Endpoint::Serial(_) => Err(Error::NotConnected(format!(
                "{endpoint}: serial support not compiled in"
            ))),
        }
    }

    async fn round_trip(&mut self, slave: u8, transaction: u16, request: &Request) -> Result<Response> {
        let frame = Frame {
            slave,
            transaction,
            pdu: request.clone(),
        };
        match self {
            Link::Tcp(framed) => {
                framed.send(frame).await?;
                loop {
                    let reply = next_frame(framed.next().await)?;
                    // a late answer to a request we already gave up on
                    if reply.transaction != transaction {
                        warn!(
                            expected = transaction,
                            received = reply.transaction,
                            "discarding stale response"
                        );
                        continue;
                    }
                    return check_reply(slave, request, reply);
                }
            }
            #[cfg(feature = "serial")]
            Link::Rtu(framed) => {
                framed.send(frame).await?;
                let reply = next_frame(framed.next().await)?;
                check_reply(slave, request, reply)
            }
        }
    }
}

fn next_frame(item: Option<Result<Frame<Response>>>) -> Result<Frame<Response>> {
    match item {
        Some(frame) => frame,
        None => Err(Error::TransportClosed("peer closed the connection".into())),
    }
}

fn check_reply(slave: u8, request: &Request, reply: Frame<Response>) -> Result<Response> {
    if reply.slave != slave {
        return Err(Error::Protocol(format!(
            "response from slave {} while talking to {}",
            reply.slave, slave
        )));
    }
    if !reply.pdu.answers(request) {
        return Err(Error::Protocol(format!(
            "response {:?} does not match request {:?}",
            reply.pdu, request
        )));
    }
    Ok(reply.pdu)
}

/// The live link plus its state machine.
pub struct Connection {
    endpoint: Endpoint,
    options: ConnectionOptions,
    link: Option<Link>,
    state: ConnectionState,
    generation: u64,
    transaction: u16,
}

impl Connection {
    /// Create a disconnected connection; the link opens on the first exchange.
    pub fn new(endpoint: Endpoint, options: ConnectionOptions) -> Self {
        Self {
            endpoint,
            options,
            link: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            transaction: 0,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open the link, retrying a bounded number of times.
    async fn open(&mut self) -> Result<()> {
        let attempts = self.options.reconnect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.state = ConnectionState::Connecting;
            debug!(endpoint = %self.endpoint, attempt, "connecting");

            match timeout(self.options.request_timeout, Link::open(&self.endpoint)).await {
                Ok(Ok(link)) => {
                    self.link = Some(link);
                    self.state = ConnectionState::Connected;
                    self.generation += 1;
                    info!(endpoint = %self.endpoint, generation = self.generation, "connected");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {:?}", self.options.request_timeout),
            }

            warn!(endpoint = %self.endpoint, attempt, error = %last_error, "connect failed");
            if attempt < attempts {
                sleep(self.options.reconnect_delay * attempt).await;
            }
        }

        self.state = ConnectionState::Faulted;
        Err(Error::NotConnected(last_error))
    }

    fn fault(&mut self, error: &Error) {
        warn!(endpoint = %self.endpoint, %error, "link faulted, dropping connection");
        self.link = None;
        self.state = ConnectionState::Faulted;
    }
}

#[async_trait]
impl Transport for Connection {
    async fn exchange(&mut self, slave: u8, request: &Request) -> Result<Response> {
        if self.link.is_none() {
            self.open().await?;
        }
        let Some(link) = self.link.as_mut() else {
            return Err(Error::NotConnected(format!("{}: link unavailable", self.endpoint)));
        };

        self.transaction = self.transaction.wrapping_add(1);
        let deadline = self.options.request_timeout;
        let result = match timeout(
            deadline,
            link.round_trip(slave, self.transaction, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::TransportTimeout(deadline)),
        };

        match &result {
            Ok(response) => debug!(slave, ?request, ?response, "exchange complete"),
            Err(error) if error.faults_link() => self.fault(error),
            Err(_) => {}
        }
        result
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            match link {
                Link::Tcp(mut framed) => {
                    let _ = SinkExt::<Frame<Request>>::close(&mut framed).await;
                }
                #[cfg(feature = "serial")]
                Link::Rtu(mut framed) => {
                    let _ = SinkExt::<Frame<Request>>::close(&mut framed).await;
                }
            }
            info!(endpoint = %self.endpoint, "connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }
}

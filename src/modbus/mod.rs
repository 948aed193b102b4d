//! Wire layer: PDUs, framing and the connection state machine.

pub mod connection;
pub mod frame;
pub mod pdu;

pub use connection::{
    Connection, ConnectionOptions, ConnectionState, Endpoint, Parity, SerialSettings, Transport,
};
pub use frame::Frame;
pub use pdu::{ExceptionCode, Pdu, Request, Response};

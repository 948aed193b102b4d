#![allow(dead_code)]
//! In-process SUN2000 simulator speaking Modbus TCP.

use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::codec::Framed;

use sun2000_modbus::modbus::frame::DeviceTcpCodec;
use sun2000_modbus::modbus::{Endpoint, ExceptionCode, Frame, Pdu, Request, Response};
use sun2000_modbus::session::challenge_response;

pub const SLAVE_ID: u8 = 1;
pub const PASSWORD: &str = "00000a";
/// Writes at or above this address need a login.
pub const FIRST_PRIVILEGED: u16 = 40000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Read { address: u16, count: u16 },
    Write { address: u16, words: Vec<u16> },
    Login,
}

#[derive(Default)]
pub struct Stats {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub connections: AtomicUsize,
}

/// Simulated inverter, plus any units relayed behind it. Cheap to share;
/// all state sits behind locks.
pub struct Simulator {
    addr: SocketAddr,
    /// Keyed by (slave id, address).
    registers: RwLock<HashMap<(u8, u16), u16>>,
    units: RwLock<HashSet<u8>>,
    missing: RwLock<HashSet<u16>>,
    log: RwLock<Vec<(u8, Seen)>>,
    response_delay: RwLock<Duration>,
    /// Swallow requests without answering.
    silent: AtomicBool,
    /// Next privileged write is denied and the login dropped.
    expire_login: AtomicBool,
    /// Answer the next N requests with "server device busy".
    busy: AtomicUsize,
    pub stats: Stats,
}

impl Simulator {
    pub async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sim = Arc::new(Self {
            addr: listener.local_addr().unwrap(),
            registers: RwLock::new(HashMap::new()),
            units: RwLock::new(HashSet::from([SLAVE_ID])),
            missing: RwLock::new(HashSet::new()),
            log: RwLock::new(Vec::new()),
            response_delay: RwLock::new(Duration::ZERO),
            silent: AtomicBool::new(false),
            expire_login: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            stats: Stats::default(),
        });

        let server = sim.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                server.stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move { server.serve(stream).await });
            }
        });
        sim
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    pub async fn set_registers(&self, address: u16, words: &[u16]) {
        self.set_slave_registers(SLAVE_ID, address, words).await;
    }

    /// Registers of unit `slave`, which starts answering from now on.
    pub async fn set_slave_registers(&self, slave: u8, address: u16, words: &[u16]) {
        self.units.write().await.insert(slave);
        let mut registers = self.registers.write().await;
        for (i, word) in words.iter().enumerate() {
            registers.insert((slave, address + i as u16), *word);
        }
    }

    pub async fn register(&self, address: u16) -> u16 {
        self.registers
            .read()
            .await
            .get(&(SLAVE_ID, address))
            .copied()
            .unwrap_or(0)
    }

    /// Reads touching `address` fail with "illegal data address".
    pub async fn remove_register(&self, address: u16) {
        self.missing.write().await.insert(address);
    }

    pub async fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.write().await = delay;
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn expire_login(&self) {
        self.expire_login.store(true, Ordering::SeqCst);
    }

    pub fn set_busy(&self, replies: usize) {
        self.busy.store(replies, Ordering::SeqCst);
    }

    /// Everything seen, whatever the unit.
    pub async fn log(&self) -> Vec<Seen> {
        self.log.read().await.iter().map(|(_, seen)| seen.clone()).collect()
    }

    pub async fn log_for(&self, slave: u8) -> Vec<Seen> {
        self.log
            .read()
            .await
            .iter()
            .filter(|(unit, _)| *unit == slave)
            .map(|(_, seen)| seen.clone())
            .collect()
    }

    pub async fn logins_for(&self, slave: u8) -> usize {
        self.log_for(slave)
            .await
            .iter()
            .filter(|s| matches!(s, Seen::Login))
            .count()
    }

    pub async fn writes(&self) -> Vec<Seen> {
        self.log()
            .await
            .into_iter()
            .filter(|s| matches!(s, Seen::Write { .. }))
            .collect()
    }

    pub async fn logins(&self) -> usize {
        self.log()
            .await
            .iter()
            .filter(|s| matches!(s, Seen::Login))
            .count()
    }

    async fn serve(&self, stream: TcpStream) {
        let mut framed = Framed::new(stream, DeviceTcpCodec::default());
        // units with an installer session on this connection
        let mut logged_in = HashSet::new();
        let mut device_challenge = [0u8; 16];

        while let Some(Ok(frame)) = framed.next().await {
            if self.silent.load(Ordering::SeqCst) {
                continue;
            }
            let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *self.response_delay.read().await;
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let pdu = self
                .handle(frame.slave, &frame.pdu, &mut logged_in, &mut device_challenge)
                .await;
            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

            let reply = Frame {
                slave: frame.slave,
                transaction: frame.transaction,
                pdu,
            };
            if framed.send(reply).await.is_err() {
                break;
            }
        }
    }

    async fn handle(
        &self,
        slave: u8,
        request: &Request,
        logged_in: &mut HashSet<u8>,
        device_challenge: &mut [u8; 16],
    ) -> Response {
        let exception = |function: u8, code: ExceptionCode| Response::Exception { function, code };

        if !self.units.read().await.contains(&slave) {
            return exception(
                request.function_code(),
                ExceptionCode::GatewayTargetNoResponse,
            );
        }

        if self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return exception(request.function_code(), ExceptionCode::ServerDeviceBusy);
        }

        match request {
            Request::ReadHoldingRegisters { address, count } => {
                self.log.write().await.push((
                    slave,
                    Seen::Read {
                        address: *address,
                        count: *count,
                    },
                ));
                let missing = self.missing.read().await;
                if (*address..address + count).any(|a| missing.contains(&a)) {
                    return exception(0x03, ExceptionCode::IllegalDataAddress);
                }
                let registers = self.registers.read().await;
                Response::ReadHoldingRegisters(
                    (*address..address + count)
                        .map(|a| registers.get(&(slave, a)).copied().unwrap_or(0))
                        .collect(),
                )
            }
            Request::WriteMultipleRegisters { address, words } => {
                if *address >= FIRST_PRIVILEGED {
                    if self.expire_login.swap(false, Ordering::SeqCst) {
                        logged_in.remove(&slave);
                    }
                    if !logged_in.contains(&slave) {
                        return exception(0x10, ExceptionCode::PermissionDenied);
                    }
                }
                self.log.write().await.push((
                    slave,
                    Seen::Write {
                        address: *address,
                        words: words.clone(),
                    },
                ));
                self.set_slave_registers(slave, *address, words).await;
                Response::WriteMultipleRegisters {
                    address: *address,
                    count: words.len() as u16,
                }
            }
            Request::Vendor {
                sub_function: 0x24,
                ..
            } => {
                for (i, b) in device_challenge.iter_mut().enumerate() {
                    *b = (i as u8).wrapping_mul(37).wrapping_add(11);
                }
                Response::Vendor {
                    sub_function: 0x24,
                    payload: device_challenge.to_vec(),
                }
            }
            Request::Vendor {
                sub_function: 0x25,
                payload,
            } => {
                self.log.write().await.push((slave, Seen::Login));
                let client_challenge = &payload[..16];
                let name_len = payload[16] as usize;
                let hash = &payload[16 + 1 + name_len + 1..];
                let expected = challenge_response(PASSWORD, device_challenge).unwrap();
                if hash != expected.as_slice() {
                    logged_in.remove(&slave);
                    return Response::Vendor {
                        sub_function: 0x25,
                        payload: vec![1],
                    };
                }
                logged_in.insert(slave);
                let proof = challenge_response(PASSWORD, client_challenge).unwrap();
                let mut reply = vec![0, proof.len() as u8];
                reply.extend(proof);
                Response::Vendor {
                    sub_function: 0x25,
                    payload: reply,
                }
            }
            other => exception(other.function_code(), ExceptionCode::IllegalFunction),
        }
    }
}

//! Typed read/write API over the scheduler.

pub mod commands;

use chrono::Utc;
use futures::future::try_join_all;
use tracing::debug;

pub use commands::{ActivePowerControlMode, ForcibleMode, ForcibleTarget};

use crate::codec::{self, RegisterValue, Value};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::modbus::{Connection, Transport};
use crate::registers::{self, PollGroup, RegisterDescriptor};
use crate::scheduler::{Operation, Outcome, RetryPolicy, Scheduler, SchedulerStats, WriteStep};
use crate::session::{Credentials, SessionOptions, Sessions};

/// Largest register span fetched in one read.
pub const MAX_BATCH_REGISTERS: u32 = 64;

/// One unit (slave id) behind the link.
///
/// Cheap to clone; every clone, and every other unit opened with
/// [`Device::for_slave`], talks to the same worker.
#[derive(Clone)]
pub struct Device {
    scheduler: Scheduler,
    slave: u8,
}

/// Descriptors whose registers are fetched with one read.
#[derive(Debug)]
struct Batch {
    address: u16,
    count: u16,
    members: Vec<&'static RegisterDescriptor>,
}

fn plan_batches(mut descriptors: Vec<&'static RegisterDescriptor>) -> Vec<Batch> {
    descriptors.sort_by_key(|d| d.address);
    descriptors.dedup_by_key(|d| d.name);

    let mut batches: Vec<Batch> = Vec::new();
    for desc in descriptors {
        if let Some(batch) = batches.last_mut() {
            let end = batch.address as u32 + batch.count as u32;
            let extended = desc.end().max(end) - batch.address as u32;
            if desc.address as u32 <= end && extended <= MAX_BATCH_REGISTERS {
                batch.count = extended as u16;
                batch.members.push(desc);
                continue;
            }
        }
        batches.push(Batch {
            address: desc.address,
            count: desc.length,
            members: vec![desc],
        });
    }
    batches
}

fn expect_words(outcome: Outcome) -> Result<Vec<u16>> {
    match outcome {
        Outcome::Words(words) => Ok(words),
        Outcome::Written => Err(Error::Protocol("read answered with a write outcome".into())),
    }
}

fn bind(desc: &'static RegisterDescriptor, value: Value) -> RegisterValue {
    RegisterValue {
        name: desc.name,
        value,
        unit: desc.unit,
        read_at: Utc::now(),
    }
}

impl Device {
    /// Build the connection described by `config` and start its worker,
    /// returning the primary (first configured) unit. The link itself opens
    /// on the first request.
    pub fn connect(config: &Config) -> Self {
        let connection = Connection::new(
            config.transport.endpoint.clone(),
            config.connection_options(),
        );
        Self::with_transport(
            Box::new(connection),
            config.transport.primary_slave(),
            config.session.credentials(),
            config.session.options(),
            config.scheduler.retry_policy(),
            config.scheduler.queue_capacity,
        )
    }

    /// Like [`Device::connect`], but one handle per configured slave id, all
    /// sharing the one link and worker. The primary unit comes first.
    pub fn connect_all(config: &Config) -> Vec<Self> {
        let primary = Self::connect(config);
        config
            .transport
            .slave_ids
            .iter()
            .map(|slave| primary.for_slave(*slave))
            .collect()
    }

    pub fn with_transport(
        transport: Box<dyn Transport>,
        slave: u8,
        credentials: Option<Credentials>,
        session: SessionOptions,
        policy: RetryPolicy,
        queue_capacity: usize,
    ) -> Self {
        let sessions = Sessions::new(credentials, session);
        Self {
            scheduler: Scheduler::spawn(transport, sessions, policy, queue_capacity),
            slave,
        }
    }

    /// Another unit reachable over the same link.
    pub fn for_slave(&self, slave: u8) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            slave,
        }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    pub async fn read(&self, name: &str) -> Result<RegisterValue> {
        let desc = registers::lookup(name)?;
        let outcome = self
            .scheduler
            .execute(Operation::Read {
                slave: self.slave,
                address: desc.address,
                count: desc.length,
            })
            .await?;
        let words = expect_words(outcome)?;
        Ok(bind(desc, codec::decode(desc, &words)?))
    }

    /// Read several quantities, merging adjacent registers into shared reads.
    ///
    /// Every name is resolved before anything is queued. Results come back
    /// in the order asked for.
    pub async fn read_many(&self, names: &[&str]) -> Result<Vec<RegisterValue>> {
        let descriptors = names
            .iter()
            .map(|name| registers::lookup(name))
            .collect::<Result<Vec<_>>>()?;
        let batches = plan_batches(descriptors.clone());
        debug!(
            slave = self.slave,
            quantities = names.len(),
            reads = batches.len(),
            "batched read"
        );

        // queue every batch before waiting so they go out back to back
        let mut handles = Vec::with_capacity(batches.len());
        for batch in &batches {
            handles.push(
                self.scheduler
                    .submit(Operation::Read {
                        slave: self.slave,
                        address: batch.address,
                        count: batch.count,
                    })
                    .await?,
            );
        }
        let results = try_join_all(handles).await?;

        let mut decoded = Vec::with_capacity(descriptors.len());
        for (batch, outcome) in batches.iter().zip(results) {
            let words = expect_words(outcome)?;
            for desc in batch.members.iter().copied() {
                let offset = (desc.address - batch.address) as usize;
                let slice = words
                    .get(offset..offset + desc.length as usize)
                    .ok_or_else(|| Error::Protocol(format!("short read for {}", desc.name)))?;
                decoded.push(bind(desc, codec::decode(desc, slice)?));
            }
        }

        Ok(descriptors
            .iter()
            .filter_map(|desc| decoded.iter().find(|v| v.name == desc.name).cloned())
            .collect())
    }

    pub async fn poll_group(&self, group: PollGroup) -> Result<Vec<RegisterValue>> {
        self.read_many(group.quantities()).await
    }

    /// Encode and write one quantity.
    pub async fn write(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let desc = registers::lookup(name)?;
        let step = encode_step(desc, &value.into())?;
        self.run_command(vec![step], desc.privileged).await
    }

    pub(crate) async fn run_command(&self, steps: Vec<WriteStep>, privileged: bool) -> Result<()> {
        match self
            .scheduler
            .execute(Operation::Write {
                slave: self.slave,
                steps,
                privileged,
            })
            .await?
        {
            Outcome::Written => Ok(()),
            Outcome::Words(_) => Err(Error::Protocol("write answered with words".into())),
        }
    }

    /// Finish queued work and close the link, for every unit sharing it.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await
    }
}

pub(crate) fn encode_step(desc: &RegisterDescriptor, value: &Value) -> Result<WriteStep> {
    Ok(WriteStep {
        address: desc.address,
        words: codec::encode(desc, value)?,
    })
}

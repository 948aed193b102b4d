use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Result;

/// One register write inside a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStep {
    pub address: u16,
    pub words: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A contiguous block of holding registers on unit `slave`.
    Read { slave: u8, address: u16, count: u16 },
    /// Writes applied in order as one unit; nothing else runs in between.
    Write {
        slave: u8,
        steps: Vec<WriteStep>,
        privileged: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RequestClass {
    Poll,
    Command,
}

impl Operation {
    pub fn slave(&self) -> u8 {
        match self {
            Operation::Read { slave, .. } | Operation::Write { slave, .. } => *slave,
        }
    }

    pub fn class(&self) -> RequestClass {
        match self {
            Operation::Read { .. } => RequestClass::Poll,
            Operation::Write { .. } => RequestClass::Command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Words(Vec<u16>),
    Written,
}

pub(crate) type Reply = oneshot::Sender<Result<Outcome>>;

pub(crate) struct PendingRequest {
    pub id: u64,
    pub operation: Operation,
    pub reply: Reply,
    /// Attempts made so far, including the one in progress.
    pub attempts: u32,
    /// Write steps already acknowledged by the device.
    pub progress: usize,
}

impl PendingRequest {
    pub fn new(id: u64, operation: Operation, reply: Reply) -> Self {
        Self {
            id,
            operation,
            reply,
            attempts: 0,
            progress: 0,
        }
    }

    pub fn class(&self) -> RequestClass {
        self.operation.class()
    }
}

/// Waiting requests, commands ahead of polls, FIFO within a class.
#[derive(Default)]
pub(crate) struct RequestQueue {
    commands: VecDeque<PendingRequest>,
    polls: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, request: PendingRequest) {
        match request.class() {
            RequestClass::Command => self.commands.push_back(request),
            RequestClass::Poll => self.polls.push_back(request),
        }
    }

    /// Next request to dispatch, skipping any whose caller went away.
    pub fn pop_next(&mut self) -> Option<PendingRequest> {
        loop {
            let next = self
                .commands
                .pop_front()
                .or_else(|| self.polls.pop_front())?;
            if next.reply.is_closed() {
                debug!(id = next.id, class = %next.class(), "request cancelled before dispatch");
                continue;
            }
            return Some(next);
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len() + self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Incremental decoder for the control/data byte stream.
//!
//! The decoder is sans-I/O: callers hand it whatever bytes a read returned,
//! in fragments of any size, and get back the protocol events that became
//! complete. A state advances only once its whole field has been accumulated.

use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use crate::protocol::{
    decode_path, MessageType, SyncRequest, BLOCK_SIZE, MAXPATH, MODE_LEN, SIZE_LEN, TYPE_LEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingType,
    AwaitingPath,
    AwaitingSize,
    AwaitingPermission,
    AwaitingHash,
    /// Raw content of a DataTransfer; `remaining` bytes still expected
    AwaitingData { remaining: u64 },
    /// DataTransfer fully received; the connection must close
    Finished,
}

impl State {
    fn field_len(self) -> usize {
        match self {
            Self::AwaitingType => TYPE_LEN,
            Self::AwaitingPath => MAXPATH,
            Self::AwaitingSize => SIZE_LEN,
            Self::AwaitingPermission => MODE_LEN,
            Self::AwaitingHash => BLOCK_SIZE,
            Self::AwaitingData { .. } | Self::Finished => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Directory(SyncRequest),
    File(SyncRequest),
    TransferStart(SyncRequest),
    Data(Vec<u8>),
    TransferComplete,
}

/// Fields decoded so far for the request in flight
#[derive(Debug, Default)]
struct Partial {
    kind: Option<MessageType>,
    path: String,
    size: i32,
    mode: u32,
}

impl Partial {
    fn take(&mut self, fingerprint: Option<Fingerprint>) -> Result<SyncRequest> {
        let partial = std::mem::take(self);
        let kind = partial
            .kind
            .ok_or_else(|| SyncError::Protocol("request completed without a type".into()))?;
        Ok(SyncRequest {
            kind,
            path: partial.path,
            size: partial.size,
            mode: partial.mode,
            fingerprint,
        })
    }
}

#[derive(Debug)]
pub struct Decoder {
    state: State,
    field: Vec<u8>,
    partial: Partial,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingType,
            field: Vec::with_capacity(MAXPATH),
            partial: Partial::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True when no request is partially decoded
    pub fn at_message_boundary(&self) -> bool {
        self.state == State::AwaitingType && self.field.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Consume `input` and return every event it completed
    pub fn feed(&mut self, mut input: &[u8]) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while !input.is_empty() {
            match self.state {
                State::Finished => {
                    return Err(SyncError::Protocol(format!(
                        "{} unexpected byte(s) after transfer data",
                        input.len()
                    )));
                }
                State::AwaitingData { remaining } => {
                    let take = input.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let (chunk, rest) = input.split_at(take);
                    input = rest;
                    events.push(Event::Data(chunk.to_vec()));
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = State::Finished;
                        events.push(Event::TransferComplete);
                    } else {
                        self.state = State::AwaitingData { remaining };
                    }
                }
                state => {
                    let need = state.field_len() - self.field.len();
                    let take = need.min(input.len());
                    self.field.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if self.field.len() == state.field_len() {
                        let field = std::mem::take(&mut self.field);
                        self.complete_field(&field, &mut events)?;
                    }
                }
            }
        }
        Ok(events)
    }

    fn complete_field(&mut self, field: &[u8], events: &mut Vec<Event>) -> Result<()> {
        match self.state {
            State::AwaitingType => {
                let kind = MessageType::from_wire(i32::from_be_bytes(be4(field)))?;
                self.partial.kind = Some(kind);
                self.state = State::AwaitingPath;
            }
            State::AwaitingPath => {
                self.partial.path = decode_path(field)?;
                self.state = State::AwaitingSize;
            }
            State::AwaitingSize => {
                let size = i32::from_be_bytes(be4(field));
                if size < 0 {
                    return Err(SyncError::Protocol(format!("negative size {size}")));
                }
                self.partial.size = size;
                self.state = State::AwaitingPermission;
            }
            State::AwaitingPermission => {
                self.partial.mode = u32::from_be_bytes(be4(field));
                if self.partial.kind == Some(MessageType::Directory) {
                    events.push(Event::Directory(self.partial.take(None)?));
                    self.state = State::AwaitingType;
                } else {
                    self.state = State::AwaitingHash;
                }
            }
            State::AwaitingHash => {
                let request = self.partial.take(Some(Fingerprint::from_bytes(field)))?;
                if request.kind == MessageType::DataTransfer {
                    let remaining = request.size as u64;
                    events.push(Event::TransferStart(request));
                    if remaining == 0 {
                        self.state = State::Finished;
                        events.push(Event::TransferComplete);
                    } else {
                        self.state = State::AwaitingData { remaining };
                    }
                } else {
                    events.push(Event::File(request));
                    self.state = State::AwaitingType;
                }
            }
            State::AwaitingData { .. } | State::Finished => {
                unreachable!("data states do not accumulate fields")
            }
        }
        Ok(())
    }
}

fn be4(field: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&field[..4]);
    out
}

//! Public message types exchanged with the supervisor.

use bitfield_struct::bitfield;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Payload capacity of a config request, in 16-bit words.
pub const MAX_DATA_SZ: usize = 128;

/// Default controller-side node id.
pub const COCO_NODE: u16 = 0;
/// Default motion-slave node id.
pub const MOCO_NODE: u16 = 1;

/// Bus and request states. Terminal `*Success` / `*Error` values are the
/// outcomes visible on [`Msg::status`]; the request/answer values report a
/// transaction still in flight (non-blocking mode observes them while
/// re-driving a request).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No transaction in flight.
    #[default]
    Standby,
    WriteRequest,
    WriteAnswer,
    WriteSuccess,
    WriteError,
    ReadRequest,
    ReadAnswer,
    ReadSuccess,
    ReadError,
    GetInfoRequest,
    GetInfoAnswer,
    GetInfoSuccess,
    GetInfoError,
    /// Resynchronizing after a rejected reply; an IDLE frame goes out next.
    Cancel,
    /// Config request posted over the cyclic channel, not yet finished.
    CyclicRequest,
    /// A cyclic tick completed an overlaid config request.
    CyclicSuccess,
    /// A cyclic tick failed or aborted an overlaid config request.
    CyclicError,
}

impl Status {
    /// Whether a config transaction has run to completion.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::WriteSuccess
                | Status::WriteError
                | Status::ReadSuccess
                | Status::ReadError
                | Status::GetInfoSuccess
                | Status::GetInfoError
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Status::WriteError | Status::ReadError | Status::GetInfoError | Status::CyclicError
        )
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::WriteSuccess
                | Status::ReadSuccess
                | Status::GetInfoSuccess
                | Status::CyclicSuccess
        )
    }
}

/// A config request and, after completion, its enriched reply.
///
/// `cmd` is rewritten on completion: the acknowledge code (3) on success,
/// the request code with the error bit (4) folded in on failure.
#[derive(Debug, Clone)]
pub struct Msg {
    pub node: u16,
    pub addr: u16,
    pub cmd: u16,
    /// Payload size in words.
    pub size: u16,
    pub data: [u16; MAX_DATA_SZ],
    pub status: Status,
}

impl Msg {
    pub const fn new() -> Self {
        Msg {
            node: MOCO_NODE,
            addr: 0,
            cmd: 0,
            size: 0,
            data: [0; MAX_DATA_SZ],
            status: Status::Standby,
        }
    }

    /// Reinterprets the first two payload words as the packed get-info
    /// descriptor of a register.
    pub fn info_data(&self) -> InfoData {
        InfoData::from(self.data[0] as u32 | (self.data[1] as u32) << 16)
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

/// Register descriptor returned by a get-info request; 19 bits packed into
/// the first two payload words.
#[bitfield(u32)]
pub struct InfoData {
    /// Register size in bytes.
    #[bits(8)]
    pub size: u8,
    /// Register data type, see [`DataType`].
    #[bits(6)]
    pub data_type: u8,
    /// Cyclic channel the register may join ([`CYCLIC_TX`] / [`CYCLIC_RX`]).
    #[bits(2)]
    pub cyclic_type: u8,
    /// Register access rights.
    #[bits(3)]
    pub access_type: u8,
    #[bits(13)]
    reserved: u16,
}

impl InfoData {
    /// Packs the descriptor back into payload-word form.
    pub fn to_words(self) -> [u16; 2] {
        let raw = u32::from(self);
        [raw as u16, (raw >> 16) as u16]
    }
}

/// Register data-type codes carried in [`InfoData::data_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DataType {
    Int16 = 0,
    Uint16 = 1,
    Int32 = 2,
    Uint32 = 3,
    Float = 4,
    Str = 5,
}

/// [`InfoData::cyclic_type`] code for a register mappable into cyclic TX.
pub const CYCLIC_TX: u8 = 1;
/// [`InfoData::cyclic_type`] code for a register mappable into cyclic RX.
pub const CYCLIC_RX: u8 = 2;

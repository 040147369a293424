#![no_std]
//! Master-side driver for the Motion Control Bus (MCB), a half-duplex SPI
//! register-access protocol between a controller ("CoCo") and a motion
//! slave ("MoCo").
//!
//! Two traffic classes share the bus: **config** traffic (request/reply
//! access to addressed registers, segmented when the payload exceeds one
//! frame) and **cyclic** traffic (a fixed-size block exchanged on every
//! tick, laid out by the mapping tables). While cyclic mode is active,
//! config requests ride inside the cyclic frames.
//!
//! All hardware access goes through the [`McbIo`] and [`TimeOps`] ports;
//! the only bundled platform code is the software XMODEM CRC.

mod intf;

pub mod frame;
pub mod mapping;
pub mod msg;
pub mod ports;

use core::cmp::max;
use core::fmt::{Display, Formatter};
use core::marker::PhantomData;

use log::{debug, error, info, warn};
use num_enum::IntoPrimitive;

pub use frame::{crc, Cmd, Frame, FrameError, FRM_MAX_CYCLIC_SZ};
pub use mapping::{words_for, MappingList, MAX_MAPPED_REG};
pub use msg::{DataType, InfoData, Msg, Status, COCO_NODE, MAX_DATA_SZ, MOCO_NODE};
pub use ports::{McbIo, TimeOps};

use intf::Intf;

/// Communication state register: write 2 to enter cyclic mode, 1 to leave.
pub const ADDR_COMM_STATE: u16 = 0x640;
/// Cyclic synchronization mode register.
pub const ADDR_CYCLIC_MODE: u16 = 0x641;
/// RX mapping count register; slot-setup registers follow at +1..+15.
pub const RX_MAP_BASE: u16 = 0x650;
/// TX mapping count register; slot-setup registers follow at +1..+15.
pub const TX_MAP_BASE: u16 = 0x660;

/// Default bound for blocking requests.
pub const DFLT_TIMEOUT_MS: u32 = 1000;

/// Master-side cyclic buffer capacity in words.
pub const MAX_CYCLIC_WORDS: usize = FRM_MAX_CYCLIC_SZ as usize;

/// Request dispatch flavor, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Requests poll the engine until a terminal state or timeout.
    Blocking,
    /// Requests step the engine once; the caller re-invokes on IRQ events.
    NonBlocking,
}

/// Cyclic synchronization regime requested from the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
pub enum SyncMode {
    NonSync = 0,
    Sync0 = 1,
    Sync1 = 2,
    Sync0Sync1 = 3,
}

/// Failures surfaced by the supervisor API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McbError {
    /// Slave absent at init (IRQ line low).
    Init,
    /// A config request failed or timed out.
    Request,
    /// Mapping table full, attempted while cyclic, or rejected by the slave.
    Mapping,
    /// Sync-mode write failed while enabling cyclic mode.
    CyclicSync,
    /// RX mapping count write failed while enabling cyclic mode.
    CyclicRxMap,
    /// TX mapping count write failed while enabling cyclic mode.
    CyclicTxMap,
    /// Cyclic validation write failed.
    CyclicValidation,
    /// A config-over-cyclic transaction is already in flight.
    CyclicBusy,
}

impl Display for McbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            McbError::Init => write!(f, "slave not present"),
            McbError::Request => write!(f, "config request failed"),
            McbError::Mapping => write!(f, "mapping rejected"),
            McbError::CyclicSync => write!(f, "sync mode write failed"),
            McbError::CyclicRxMap => write!(f, "rx map count write failed"),
            McbError::CyclicTxMap => write!(f, "tx map count write failed"),
            McbError::CyclicValidation => write!(f, "cyclic validation failed"),
            McbError::CyclicBusy => write!(f, "config over cyclic in flight"),
        }
    }
}

/// One master-side bus instance.
///
/// ```rust no_run
/// use mcb::{Mcb, McbIo, Mode, Msg, Status, TimeOps, DFLT_TIMEOUT_MS};
///
/// # struct MyIo;
/// # impl McbIo for MyIo {
/// #     fn spi_transfer(&mut self, _tx: &[u16], _rx: &mut [u16]) {}
/// #     fn irq_is_high(&self) -> bool { true }
/// #     fn is_ready(&self) -> bool { true }
/// # }
/// # struct MyTime;
/// # impl TimeOps for MyTime {
/// #     fn now_ms() -> u32 { 0 }
/// #     fn yield_cpu() {}
/// # }
/// let mut mcb: Mcb<MyIo, MyTime> = Mcb::new(MyIo, Mode::Blocking, DFLT_TIMEOUT_MS, true);
/// mcb.init().unwrap();
///
/// let mut msg = Msg::new();
/// msg.addr = 0x010;
/// msg.size = 2;
/// msg.data[..2].copy_from_slice(&[0x1234, 0x0000]);
/// assert_eq!(mcb.write(&mut msg), Status::WriteSuccess);
/// ```
pub struct Mcb<IO, OS> {
    io: IO,
    mode: Mode,
    timeout_ms: u32,
    sync_mode: SyncMode,
    is_cyclic: bool,
    /// Words per cyclic frame; nonzero exactly while cyclic mode is active.
    cyclic_size: u16,
    cyclic_tx: [u16; MAX_CYCLIC_WORDS],
    cyclic_rx: [u16; MAX_CYCLIC_WORDS],
    rx_list: MappingList,
    tx_list: MappingList,
    intf: Intf,
    /// The posted config-over-cyclic request, as handed in by the caller.
    cfg_req: Msg,
    /// Working copy the engine enriches into the reply.
    cfg_rpy: Msg,
    on_cfg_over_cyclic: Option<fn(&Msg)>,
    _time: PhantomData<OS>,
}

impl<IO: McbIo, OS: TimeOps> Mcb<IO, OS> {
    /// Creates an instance around its IO port. `calc_crc` selects the
    /// bundled software CRC; pass `false` when the port's hardware seals
    /// and checks frames itself.
    pub fn new(io: IO, mode: Mode, timeout_ms: u32, calc_crc: bool) -> Self {
        Mcb {
            io,
            mode,
            timeout_ms,
            sync_mode: SyncMode::NonSync,
            is_cyclic: false,
            cyclic_size: 0,
            cyclic_tx: [0; MAX_CYCLIC_WORDS],
            cyclic_rx: [0; MAX_CYCLIC_WORDS],
            rx_list: MappingList::new(),
            tx_list: MappingList::new(),
            intf: Intf::new(calc_crc),
            cfg_req: Msg::new(),
            cfg_rpy: Msg::new(),
            on_cfg_over_cyclic: None,
            _time: PhantomData,
        }
    }

    /// Brings the instance up. Fails unless the slave holds its IRQ line
    /// high, meaning it is powered and ready for a first exchange.
    pub fn init(&mut self) -> Result<(), McbError> {
        self.io.init_resource();
        self.intf.init();
        if !self.io.irq_is_high() {
            error!("slave IRQ line low, no slave present");
            self.io.deinit_resource();
            return Err(McbError::Init);
        }
        Ok(())
    }

    /// Tears the instance down: mappings cleared, blocking mode restored,
    /// engine and bus resource released.
    pub fn deinit(&mut self) {
        self.is_cyclic = false;
        self.cyclic_size = 0;
        self.mode = Mode::Blocking;
        self.rx_list.clear();
        self.tx_list.clear();
        self.intf.deinit();
        self.io.deinit_resource();
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_cyclic(&self) -> bool {
        self.is_cyclic
    }

    /// Words per cyclic frame; zero while cyclic mode is off.
    pub fn cyclic_size(&self) -> u16 {
        self.cyclic_size
    }

    /// Requests a synchronization regime for the next [`enable_cyclic`].
    /// Nothing is written to the slave until then.
    ///
    /// [`enable_cyclic`]: Mcb::enable_cyclic
    pub fn set_cyclic_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn cyclic_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Registers a completion callback for config requests carried over the
    /// cyclic channel. Non-blocking instances receive their replies here.
    pub fn attach_cfg_over_cyclic_cb(&mut self, cb: fn(&Msg)) {
        self.on_cfg_over_cyclic = Some(cb);
    }

    pub fn detach_cfg_over_cyclic_cb(&mut self) {
        self.on_cfg_over_cyclic = None;
    }

    /// ISR-facing hook: call from the rising-edge interrupt of the slave
    /// IRQ line. Only stores a flag; never runs the engine.
    pub fn irq_event(&self) {
        self.intf.irq_event();
    }

    /// Master view of the incoming cyclic payload. Offsets returned by
    /// [`tx_map`](Mcb::tx_map) index into this buffer.
    pub fn cyclic_rx(&self) -> &[u16] {
        &self.cyclic_rx
    }

    /// Master view of the outgoing cyclic payload. Offsets returned by
    /// [`rx_map`](Mcb::rx_map) index into this buffer.
    pub fn cyclic_tx_mut(&mut self) -> &mut [u16] {
        &mut self.cyclic_tx
    }

    /// The underlying IO port.
    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Config write of `msg.size` words to `msg.addr`. Blocking instances
    /// return the terminal status; non-blocking instances return the
    /// in-progress state and the caller re-invokes on each IRQ event. In
    /// cyclic mode the request rides inside the cyclic frames.
    pub fn write(&mut self, msg: &mut Msg) -> Status {
        msg.size = msg.size.min(MAX_DATA_SZ as u16);
        if self.is_cyclic {
            return self.post_cfg_over_cyclic(msg, Cmd::Write);
        }
        msg.cmd = u16::from(u8::from(Cmd::Write));
        match self.mode {
            Mode::Blocking => self.run_blocking(msg, Cmd::Write),
            Mode::NonBlocking => {
                let st = self.intf.write(&mut self.io, msg.addr, &mut msg.data, &mut msg.size);
                self.tag(msg, st)
            }
        }
    }

    /// Config read from `msg.addr`; `msg.size` and `msg.data` carry the
    /// reassembled reply on success.
    pub fn read(&mut self, msg: &mut Msg) -> Status {
        if self.is_cyclic {
            return self.post_cfg_over_cyclic(msg, Cmd::Read);
        }
        msg.cmd = u16::from(u8::from(Cmd::Read));
        match self.mode {
            Mode::Blocking => self.run_blocking(msg, Cmd::Read),
            Mode::NonBlocking => {
                let st = self.intf.read(&mut self.io, msg.addr, &mut msg.data, &mut msg.size);
                self.tag(msg, st)
            }
        }
    }

    /// Register descriptor request; decode the reply with
    /// [`Msg::info_data`].
    pub fn get_info(&mut self, msg: &mut Msg) -> Status {
        if self.is_cyclic {
            return self.post_cfg_over_cyclic(msg, Cmd::GetInfo);
        }
        msg.cmd = u16::from(u8::from(Cmd::GetInfo));
        match self.mode {
            Mode::Blocking => self.run_blocking(msg, Cmd::GetInfo),
            Mode::NonBlocking => {
                let st = self.intf.get_info(&mut self.io, msg.addr, &mut msg.data, &mut msg.size);
                self.tag(msg, st)
            }
        }
    }

    /// Registers `addr` (of `size_bytes`) into the slave's cyclic TX frame.
    /// Returns the word offset of the register inside
    /// [`cyclic_rx`](Mcb::cyclic_rx); mapping the same address twice returns
    /// the existing offset without touching the slave.
    pub fn tx_map(&mut self, addr: u16, size_bytes: u16) -> Result<u16, McbError> {
        if self.is_cyclic {
            return Err(McbError::Mapping);
        }
        if let Some(off) = self.tx_list.offset_of(addr) {
            return Ok(off);
        }
        self.map_check(&self.tx_list, size_bytes)?;
        let slot = TX_MAP_BASE + self.tx_list.count() + 1;
        self.config_write(slot, &[addr, size_bytes])
            .map_err(|_| McbError::Mapping)?;
        let off = self.tx_list.mapped_words();
        self.tx_list.push(addr, size_bytes);
        Ok(off)
    }

    /// Registers `addr` (of `size_bytes`) into the slave's cyclic RX frame.
    /// Returns the word offset of the register inside
    /// [`cyclic_tx_mut`](Mcb::cyclic_tx_mut).
    pub fn rx_map(&mut self, addr: u16, size_bytes: u16) -> Result<u16, McbError> {
        if self.is_cyclic {
            return Err(McbError::Mapping);
        }
        self.map_check(&self.rx_list, size_bytes)?;
        let slot = RX_MAP_BASE + self.rx_list.count() + 1;
        self.config_write(slot, &[addr, size_bytes])
            .map_err(|_| McbError::Mapping)?;
        let off = self.rx_list.mapped_words();
        self.rx_list.push(addr, size_bytes);
        Ok(off)
    }

    /// Unregisters the most recently TX-mapped register by zeroing its
    /// setup slot (the last live one, at `TX_MAP_BASE + count`) and popping
    /// the local entry.
    pub fn tx_unmap(&mut self) -> Result<(), McbError> {
        if self.is_cyclic {
            return Err(McbError::Mapping);
        }
        if self.tx_list.count() == 0 {
            return Ok(());
        }
        let slot = TX_MAP_BASE + self.tx_list.count();
        self.config_write(slot, &[0, 0])
            .map_err(|_| McbError::Mapping)?;
        self.tx_list.pop();
        Ok(())
    }

    /// RX-side counterpart of [`tx_unmap`](Mcb::tx_unmap).
    pub fn rx_unmap(&mut self) -> Result<(), McbError> {
        if self.is_cyclic {
            return Err(McbError::Mapping);
        }
        if self.rx_list.count() == 0 {
            return Ok(());
        }
        let slot = RX_MAP_BASE + self.rx_list.count();
        self.config_write(slot, &[0, 0])
            .map_err(|_| McbError::Mapping)?;
        self.rx_list.pop();
        Ok(())
    }

    /// Clears both mapping tables, on the slave and locally.
    pub fn unmap_all(&mut self) -> Result<(), McbError> {
        if self.is_cyclic {
            return Err(McbError::Mapping);
        }
        self.config_write(RX_MAP_BASE, &[0])
            .map_err(|_| McbError::Mapping)?;
        self.rx_list.clear();
        self.config_write(TX_MAP_BASE, &[0])
            .map_err(|_| McbError::Mapping)?;
        self.tx_list.clear();
        Ok(())
    }

    /// Switches the slave into cyclic mode: sync regime, mapping counts,
    /// then the comm-state validation write. Returns the cyclic frame size
    /// in words. Blocks regardless of the instance mode.
    pub fn enable_cyclic(&mut self) -> Result<u16, McbError> {
        if self.is_cyclic {
            return Ok(self.cyclic_size);
        }
        let sync: u16 = self.sync_mode.into();
        self.config_write(ADDR_CYCLIC_MODE, &[sync])
            .map_err(|_| McbError::CyclicSync)?;
        let rx_count = self.rx_list.count();
        self.config_write(RX_MAP_BASE, &[rx_count])
            .map_err(|_| McbError::CyclicRxMap)?;
        let tx_count = self.tx_list.count();
        self.config_write(TX_MAP_BASE, &[tx_count])
            .map_err(|_| McbError::CyclicTxMap)?;
        self.config_write(ADDR_COMM_STATE, &[2])
            .map_err(|_| McbError::CyclicValidation)?;
        self.cyclic_size = max(self.rx_list.mapped_words(), self.tx_list.mapped_words());
        self.is_cyclic = true;
        info!("cyclic mode enabled, {} words per frame", self.cyclic_size);
        Ok(self.cyclic_size)
    }

    /// Posts the leave-cyclic write (`0x640 <- 1`) through the overlay
    /// channel; cyclic mode clears when a later [`cyclic_process`] tick
    /// completes it. Config traffic is no longer directly transferrable at
    /// this point, hence the detour.
    ///
    /// [`cyclic_process`]: Mcb::cyclic_process
    pub fn disable_cyclic(&mut self) -> Result<(), McbError> {
        if !self.is_cyclic {
            return Ok(());
        }
        if self.intf.cfg_over_cyclic_busy() {
            return Err(McbError::CyclicBusy);
        }
        let mut msg = Msg::new();
        msg.addr = ADDR_COMM_STATE;
        msg.cmd = u8::from(Cmd::Write) as u16;
        msg.size = 1;
        msg.data[0] = 1;
        self.cfg_req = msg.clone();
        self.cfg_rpy = msg;
        self.intf.post_cfg_over_cyclic();
        Ok(())
    }

    /// One cyclic tick; call on every slave IRQ event while cyclic mode is
    /// active. Advances any overlaid config transaction, then performs
    /// exactly one full-duplex exchange carrying the composed frame.
    /// Returns whether an exchange happened and the overlay status of this
    /// tick ([`Status::CyclicRequest`] in flight, [`Status::CyclicSuccess`]
    /// / [`Status::CyclicError`] on the completing tick).
    pub fn cyclic_process(&mut self) -> (bool, Status) {
        if !self.is_cyclic || !self.io.is_ready() || !self.io.try_take_resource() {
            return (false, Status::Standby);
        }

        let mut cfg_stat = Status::Standby;
        let mut new_data = false;
        if self.intf.cfg_over_cyclic_busy() {
            let op = Cmd::from(self.cfg_req.cmd as u8);
            let (st, nd) = self.intf.cfg_over_cyclic(
                op,
                self.cfg_req.addr,
                &mut self.cfg_rpy.data,
                &mut self.cfg_rpy.size,
            );
            new_data = nd;
            if st.is_terminal() {
                self.cfg_rpy.status = st;
                self.cfg_rpy.cmd = if st.is_error() {
                    self.cfg_req.cmd | u16::from(u8::from(Cmd::Error))
                } else {
                    u16::from(u8::from(Cmd::Ack))
                };
                cfg_stat = if st.is_error() {
                    Status::CyclicError
                } else {
                    Status::CyclicSuccess
                };
                debug!("config over cyclic finished: {st:?}");
                if let Some(cb) = self.on_cfg_over_cyclic {
                    cb(&self.cfg_rpy);
                }
                if st == Status::WriteSuccess
                    && self.cfg_req.addr == ADDR_COMM_STATE
                    && self.cfg_req.data[0] == 1
                {
                    info!("leaving cyclic mode");
                    self.is_cyclic = false;
                    self.cyclic_size = 0;
                    self.io.release_resource();
                    return (false, cfg_stat);
                }
            } else if st != Status::Standby {
                cfg_stat = Status::CyclicRequest;
            }
        }

        if self.sync_mode != SyncMode::NonSync {
            self.io.sync_pulse();
        }
        let words = self.cyclic_size as usize;
        self.intf.cyclic(
            &mut self.io,
            &self.cyclic_tx[..words],
            &mut self.cyclic_rx[..words],
            new_data,
        );
        self.io.release_resource();
        (true, cfg_stat)
    }

    fn map_check(&self, list: &MappingList, size_bytes: u16) -> Result<(), McbError> {
        if list.is_full() {
            return Err(McbError::Mapping);
        }
        if list.mapped_words() + words_for(size_bytes) > MAX_CYCLIC_WORDS as u16 {
            return Err(McbError::Mapping);
        }
        Ok(())
    }

    /// Internal blocking write used by the mapping and mode protocols.
    fn config_write(&mut self, addr: u16, payload: &[u16]) -> Result<(), McbError> {
        let mut msg = Msg::new();
        msg.addr = addr;
        msg.size = payload.len() as u16;
        msg.data[..payload.len()].copy_from_slice(payload);
        match self.run_blocking(&mut msg, Cmd::Write) {
            Status::WriteSuccess => Ok(()),
            _ => Err(McbError::Request),
        }
    }

    fn run_blocking(&mut self, msg: &mut Msg, op: Cmd) -> Status {
        let start = OS::now_ms();
        loop {
            if self.io.irq_is_high() {
                self.intf.irq_event();
            }
            let st = match op {
                Cmd::Write => self.intf.write(&mut self.io, msg.addr, &mut msg.data, &mut msg.size),
                Cmd::Read => self.intf.read(&mut self.io, msg.addr, &mut msg.data, &mut msg.size),
                _ => self.intf.get_info(&mut self.io, msg.addr, &mut msg.data, &mut msg.size),
            };
            if st.is_terminal() {
                return self.tag(msg, st);
            }
            if OS::now_ms().wrapping_sub(start) > self.timeout_ms {
                warn!("request at {:#x} timed out after {} ms", msg.addr, self.timeout_ms);
                self.intf.reset(&mut self.io);
                return self.tag(msg, error_terminal(op));
            }
            OS::yield_cpu();
        }
    }

    fn post_cfg_over_cyclic(&mut self, msg: &mut Msg, op: Cmd) -> Status {
        if self.intf.cfg_over_cyclic_busy() {
            debug!("config over cyclic already in flight");
            msg.status = Status::CyclicError;
            return Status::CyclicError;
        }
        msg.cmd = u8::from(op) as u16;
        self.cfg_req = msg.clone();
        self.cfg_rpy = msg.clone();
        self.intf.post_cfg_over_cyclic();
        msg.status = Status::CyclicRequest;
        if self.mode == Mode::NonBlocking {
            return Status::CyclicRequest;
        }

        // Blocking flavor: pump the cyclic machinery ourselves until the
        // overlay finishes or the clock runs out.
        let start = OS::now_ms();
        while self.intf.cfg_over_cyclic_busy() {
            if self.io.irq_is_high() {
                self.intf.irq_event();
            }
            if self.intf.irq_pending() {
                self.cyclic_process();
            }
            if !self.is_cyclic {
                break;
            }
            if OS::now_ms().wrapping_sub(start) > self.timeout_ms {
                warn!("config over cyclic at {:#x} timed out", msg.addr);
                self.intf.abort_cfg_over_cyclic();
                return self.tag(msg, error_terminal(op));
            }
            OS::yield_cpu();
        }
        *msg = self.cfg_rpy.clone();
        msg.status
    }

    /// Stamps the caller's message with the outcome: acknowledge command on
    /// success, the error bit folded into the request command on failure.
    fn tag(&self, msg: &mut Msg, st: Status) -> Status {
        msg.status = st;
        if st.is_terminal() {
            if st.is_error() {
                msg.cmd |= u16::from(u8::from(Cmd::Error));
            } else {
                msg.cmd = u16::from(u8::from(Cmd::Ack));
            }
        }
        st
    }
}

fn error_terminal(op: Cmd) -> Status {
    match op {
        Cmd::Write => Status::WriteError,
        Cmd::Read => Status::ReadError,
        _ => Status::GetInfoError,
    }
}

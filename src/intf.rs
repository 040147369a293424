//! SPI-level protocol engine.
//!
//! The engine drives at most one config transaction at a time through a
//! write, read or get-info sub-state-machine, stepping once per slave IRQ
//! event. Each step may compose one outgoing frame, in which case it is
//! exchanged on the spot. In cyclic mode the same machines run in overlay
//! form: the frames they compose omit the CRC and ride inside the periodic
//! cyclic exchange instead of being sent directly.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, trace};

use crate::frame::{Cmd, Frame, FRM_CONFIG_SZ};
use crate::msg::Status;
use crate::ports::McbIo;

/// Occupancy of the config slot inside the cyclic channel. A request is
/// `Posted` by the supervisor and becomes `Active` on the tick that injects
/// its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlay {
    Idle,
    Posted,
    Active,
}

pub(crate) struct Intf {
    calc_crc: bool,
    state: Status,
    /// Set from the integrator's ISR, consumed when a frame goes out.
    irq_evnt: AtomicBool,
    overlay: Overlay,
    tx: Frame,
    rx: Frame,
    /// CRC verdict of the last cyclic exchange.
    rx_crc_ok: bool,
    /// Words still to move in the transaction in flight.
    sz: u16,
    is_pending: bool,
}

impl Intf {
    pub(crate) fn new(calc_crc: bool) -> Self {
        Intf {
            calc_crc,
            state: Status::Standby,
            irq_evnt: AtomicBool::new(true),
            overlay: Overlay::Idle,
            tx: Frame::new(),
            rx: Frame::new(),
            rx_crc_ok: false,
            sz: 0,
            is_pending: false,
        }
    }

    pub(crate) fn init(&mut self) {
        self.state = Status::Standby;
        self.irq_evnt.store(true, Ordering::Release);
        self.overlay = Overlay::Idle;
    }

    pub(crate) fn deinit(&mut self) {
        self.state = Status::Standby;
        self.irq_evnt.store(false, Ordering::Release);
        self.overlay = Overlay::Idle;
    }

    /// Forces the engine back to standby after a timeout, cycling the bus
    /// resource so the next request starts clean.
    pub(crate) fn reset<IO: McbIo>(&mut self, io: &mut IO) {
        io.release_resource();
        if !io.take_resource() {
            debug!("bus resource not reclaimed on reset");
        }
        self.init();
    }

    /// ISR-facing: records a rising edge of the slave IRQ line.
    pub(crate) fn irq_event(&self) {
        self.irq_evnt.store(true, Ordering::Release);
    }

    pub(crate) fn irq_pending(&self) -> bool {
        self.irq_evnt.load(Ordering::Acquire)
    }

    pub(crate) fn cfg_over_cyclic_busy(&self) -> bool {
        self.overlay != Overlay::Idle
    }

    /// Hands a config request to the cyclic channel; the next tick starts
    /// injecting it.
    pub(crate) fn post_cfg_over_cyclic(&mut self) {
        self.overlay = Overlay::Posted;
    }

    /// Drops an overlaid config request that will not finish (timeout).
    pub(crate) fn abort_cfg_over_cyclic(&mut self) {
        self.overlay = Overlay::Idle;
        self.state = Status::Standby;
    }

    fn gate<IO: McbIo>(&self, io: &IO) -> bool {
        io.is_ready() && self.irq_pending()
    }

    fn transfer<IO: McbIo>(&mut self, io: &mut IO) {
        let sz = self.tx.len();
        trace!("tx {:04x?}", self.tx.words());
        io.spi_transfer(self.tx.words(), self.rx.recv_buf(sz));
        trace!("rx {:04x?}", self.rx.words());
    }

    /// One step of a direct config write.
    pub(crate) fn write<IO: McbIo>(
        &mut self,
        io: &mut IO,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> Status {
        if self.write_step(io, addr, data, sz) {
            self.transfer(io);
        }
        self.state
    }

    /// One step of a direct config read.
    pub(crate) fn read<IO: McbIo>(
        &mut self,
        io: &mut IO,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> Status {
        if self.fetch_step(io, Cmd::Read, addr, data, sz) {
            self.transfer(io);
        }
        self.state
    }

    /// One step of a direct get-info request.
    pub(crate) fn get_info<IO: McbIo>(
        &mut self,
        io: &mut IO,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> Status {
        if self.fetch_step(io, Cmd::GetInfo, addr, data, sz) {
            self.transfer(io);
        }
        self.state
    }

    fn write_step<IO: McbIo>(
        &mut self,
        io: &mut IO,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> bool {
        let mut send = false;
        match self.state {
            Status::Standby => {
                self.sz = *sz;
                self.is_pending = true;
                self.state = Status::WriteRequest;
            }
            Status::WriteRequest => {
                if self.gate(io) {
                    let done = (*sz - self.sz) as usize;
                    if self.sz > FRM_CONFIG_SZ {
                        self.tx
                            .build_config(addr, Cmd::Write, true, &data[done..], self.calc_crc);
                        self.sz -= FRM_CONFIG_SZ;
                    } else if self.sz == 0 {
                        self.tx.build_config(0, Cmd::Idle, false, &[], self.calc_crc);
                        self.is_pending = false;
                    } else {
                        self.tx
                            .build_config(addr, Cmd::Write, false, &data[done..], self.calc_crc);
                        self.sz = 0;
                        self.is_pending = false;
                    }
                    self.irq_evnt.store(false, Ordering::Release);
                    send = true;
                    self.state = Status::WriteAnswer;
                }
            }
            Status::WriteAnswer => {
                if self.gate(io) {
                    self.state = self.write_reply(io, addr, data);
                }
            }
            Status::Cancel => {
                if io.is_ready() {
                    self.tx.build_config(0, Cmd::Idle, false, &[], self.calc_crc);
                    send = true;
                    self.state = Status::WriteError;
                }
            }
            _ => self.state = Status::Standby,
        }
        send
    }

    fn write_reply<IO: McbIo>(&mut self, io: &mut IO, addr: u16, data: &mut [u16]) -> Status {
        if !io.check_crc(self.rx.words()) {
            error!("write reply at {addr:#x} failed crc");
            return Status::Cancel;
        }
        match self.rx.cmd() {
            Cmd::Ack if self.rx.addr() == addr => {
                if self.is_pending {
                    Status::WriteRequest
                } else {
                    copy_config(&self.rx, data);
                    Status::WriteSuccess
                }
            }
            Cmd::Idle => Status::WriteRequest,
            other => {
                debug!(
                    "write at {addr:#x} rejected: {other:?} from {:#x}",
                    self.rx.addr()
                );
                copy_config(&self.rx, data);
                Status::Cancel
            }
        }
    }

    fn fetch_step<IO: McbIo>(
        &mut self,
        io: &mut IO,
        req: Cmd,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> bool {
        let (request, answer, success, failure) = fetch_states(req);
        let mut send = false;
        match self.state {
            Status::Standby => {
                self.sz = 0;
                self.is_pending = true;
                self.state = request;
            }
            s if s == request => {
                if self.gate(io) {
                    if self.is_pending {
                        self.tx.build_config(addr, req, false, data, self.calc_crc);
                        self.is_pending = false;
                    } else {
                        self.tx.build_config(0, Cmd::Idle, false, &[], self.calc_crc);
                    }
                    self.irq_evnt.store(false, Ordering::Release);
                    send = true;
                    self.state = answer;
                }
            }
            s if s == answer => {
                if self.gate(io) {
                    self.state = self.fetch_reply(io, addr, data, sz, request, success);
                }
            }
            Status::Cancel => {
                if io.is_ready() {
                    self.tx.build_config(0, Cmd::Idle, false, &[], self.calc_crc);
                    send = true;
                    self.state = failure;
                }
            }
            _ => self.state = Status::Standby,
        }
        send
    }

    fn fetch_reply<IO: McbIo>(
        &mut self,
        io: &mut IO,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
        again: Status,
        done: Status,
    ) -> Status {
        if !io.check_crc(self.rx.words()) {
            error!("reply at {addr:#x} failed crc");
            return Status::Cancel;
        }
        match self.rx.cmd() {
            Cmd::Ack if self.rx.addr() == addr => {
                let off = self.sz as usize;
                if off + FRM_CONFIG_SZ as usize > data.len() {
                    error!("reply at {addr:#x} overflows the {} word buffer", data.len());
                    return Status::Cancel;
                }
                copy_config(&self.rx, &mut data[off..]);
                self.sz += FRM_CONFIG_SZ;
                if self.rx.pending() {
                    again
                } else {
                    *sz = self.sz;
                    done
                }
            }
            Cmd::Idle => again,
            other => {
                debug!(
                    "request at {addr:#x} rejected: {other:?} from {:#x}",
                    self.rx.addr()
                );
                copy_config(&self.rx, data);
                *sz = self.sz;
                Status::Cancel
            }
        }
    }

    /// Advances the config-over-cyclic machine one tick. Returns the state
    /// after the step and whether a config header was installed in the
    /// outgoing cyclic frame.
    pub(crate) fn cfg_over_cyclic(
        &mut self,
        cmd: Cmd,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
    ) -> (Status, bool) {
        match self.overlay {
            Overlay::Idle => return (Status::Standby, false),
            Overlay::Posted => {
                self.overlay = Overlay::Active;
                self.state = Status::Standby;
            }
            Overlay::Active => {}
        }

        let mut new_data = false;
        match cmd {
            Cmd::Write => self.cfg_write_step(addr, data, sz, &mut new_data),
            Cmd::Read | Cmd::GetInfo => self.cfg_fetch_step(cmd, addr, data, sz, &mut new_data),
            other => {
                debug!("unsupported command {other:?} over cyclic");
                self.state = Status::WriteError;
            }
        }

        let st = self.state;
        if st.is_terminal() {
            self.overlay = Overlay::Idle;
            self.state = Status::Standby;
        }
        (st, new_data)
    }

    fn cfg_write_step(&mut self, addr: u16, data: &mut [u16], sz: &mut u16, new_data: &mut bool) {
        match self.state {
            Status::Standby => {
                self.sz = *sz;
                self.is_pending = true;
                self.cfg_write_compose(addr, data, sz, new_data);
            }
            Status::WriteAnswer => {
                if !self.rx_crc_ok {
                    error!("cyclic exchange failed crc, dropping write at {addr:#x}");
                    self.state = Status::WriteError;
                    return;
                }
                match self.rx.cmd() {
                    Cmd::Ack if self.rx.addr() == addr => {
                        if self.is_pending {
                            self.cfg_write_compose(addr, data, sz, new_data);
                        } else {
                            copy_config(&self.rx, data);
                            self.state = Status::WriteSuccess;
                        }
                    }
                    Cmd::Idle => {
                        // Slave still busy; the steady IDLE-headed cyclic
                        // frames keep polling for us.
                    }
                    other => {
                        debug!(
                            "cyclic write at {addr:#x} rejected: {other:?} from {:#x}",
                            self.rx.addr()
                        );
                        copy_config(&self.rx, data);
                        self.state = Status::WriteError;
                    }
                }
            }
            _ => self.state = Status::Standby,
        }
    }

    fn cfg_write_compose(&mut self, addr: u16, data: &[u16], sz: &mut u16, new_data: &mut bool) {
        let done = (*sz - self.sz) as usize;
        if self.sz > FRM_CONFIG_SZ {
            self.tx.build_config(addr, Cmd::Write, true, &data[done..], false);
            self.sz -= FRM_CONFIG_SZ;
        } else {
            self.tx.build_config(addr, Cmd::Write, false, &data[done..], false);
            self.sz = 0;
            self.is_pending = false;
        }
        *new_data = true;
        self.state = Status::WriteAnswer;
    }

    fn cfg_fetch_step(
        &mut self,
        req: Cmd,
        addr: u16,
        data: &mut [u16],
        sz: &mut u16,
        new_data: &mut bool,
    ) {
        let (_, answer, success, failure) = fetch_states(req);
        match self.state {
            Status::Standby => {
                self.sz = 0;
                self.tx.build_config(addr, req, false, data, false);
                *new_data = true;
                self.state = answer;
            }
            s if s == answer => {
                if !self.rx_crc_ok {
                    error!("cyclic exchange failed crc, dropping {req:?} at {addr:#x}");
                    self.state = failure;
                    return;
                }
                match self.rx.cmd() {
                    Cmd::Ack if self.rx.addr() == addr => {
                        let off = self.sz as usize;
                        if off + FRM_CONFIG_SZ as usize > data.len() {
                            error!("cyclic reply at {addr:#x} overflows the caller buffer");
                            self.state = failure;
                            return;
                        }
                        copy_config(&self.rx, &mut data[off..]);
                        self.sz += FRM_CONFIG_SZ;
                        if !self.rx.pending() {
                            *sz = self.sz;
                            self.state = success;
                        }
                        // Further fragments arrive on later ticks; the
                        // IDLE-headed cyclic frames act as the polls.
                    }
                    Cmd::Idle => {}
                    other => {
                        debug!(
                            "cyclic {req:?} at {addr:#x} rejected: {other:?} from {:#x}",
                            self.rx.addr()
                        );
                        copy_config(&self.rx, data);
                        *sz = self.sz;
                        self.state = failure;
                    }
                }
            }
            _ => self.state = Status::Standby,
        }
    }

    /// Performs the cyclic exchange of this tick. The Tx frame already
    /// carries a config header when `new_data` is set; otherwise a fresh
    /// IDLE header goes out. Returns true when the validated reply updated
    /// `cyclic_rx`.
    pub(crate) fn cyclic<IO: McbIo>(
        &mut self,
        io: &mut IO,
        cyclic_tx: &[u16],
        cyclic_rx: &mut [u16],
        new_data: bool,
    ) -> bool {
        if !new_data {
            self.tx.build_config(0, Cmd::Idle, false, &[], false);
        }
        if self.tx.append_cyclic(cyclic_tx, self.calc_crc).is_err() {
            error!("cyclic payload of {} words does not fit", cyclic_tx.len());
            return false;
        }
        self.irq_evnt.store(false, Ordering::Release);
        self.transfer(io);
        self.rx_crc_ok = io.check_crc(self.rx.words());
        if self.rx_crc_ok {
            self.rx.read_cyclic(cyclic_rx);
        } else {
            error!("cyclic frame failed crc");
        }
        self.rx_crc_ok
    }
}

fn fetch_states(req: Cmd) -> (Status, Status, Status, Status) {
    match req {
        Cmd::GetInfo => (
            Status::GetInfoRequest,
            Status::GetInfoAnswer,
            Status::GetInfoSuccess,
            Status::GetInfoError,
        ),
        _ => (
            Status::ReadRequest,
            Status::ReadAnswer,
            Status::ReadSuccess,
            Status::ReadError,
        ),
    }
}

fn copy_config(frm: &Frame, dst: &mut [u16]) {
    let n = dst.len().min(FRM_CONFIG_SZ as usize);
    dst[..n].copy_from_slice(&frm.config()[..n]);
}

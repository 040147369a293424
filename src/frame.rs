//! Wire framing.
//!
//! A frame is a run of 16-bit words:
//!
//! | word | content |
//! |---|---|
//! | 0 | header |
//! | 1..=4 | config payload |
//! | 5..N-1 | cyclic payload (optional) |
//! | N | CRC (optional, software-CRC mode only) |
//!
//! Words travel big endian on the wire; the CRC is fed high byte first per
//! word for the same reason.

use bitfield_struct::bitfield;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Header word of every frame.
///
/// `pending` marks a segmented config payload: another fragment of the same
/// transfer follows in a later frame.
#[bitfield(u16)]
pub struct Header {
    pub pending: bool,
    #[bits(3)]
    pub cmd: u8,
    #[bits(12)]
    pub addr: u16,
}

/// Header size in words.
pub const FRM_HEAD_SZ: u16 = 1;
/// Config payload size in words.
pub const FRM_CONFIG_SZ: u16 = 4;
/// CRC size in words.
pub const FRM_CRC_SZ: u16 = 1;
/// Upper bound of the cyclic payload, in words.
pub const FRM_MAX_CYCLIC_SZ: u16 = 10;

/// Header position on the raw buffer.
pub const FRM_HEAD_IDX: usize = 0;
/// Config payload position on the raw buffer.
pub const FRM_CONFIG_IDX: usize = 1;
/// Cyclic payload position on the raw buffer.
pub const FRM_CYCLIC_IDX: usize = 5;

/// Largest possible frame: header + config + cyclic + CRC.
pub const FRM_MAX_WORDS: usize =
    (FRM_HEAD_SZ + FRM_CONFIG_SZ + FRM_MAX_CYCLIC_SZ + FRM_CRC_SZ) as usize;

/// 3-bit command codes carried in the frame header. Requests flow master to
/// slave, replies the other way; `Error` doubles as the get-info error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Cmd {
    GetInfo = 0,
    Read = 1,
    Write = 2,
    Ack = 3,
    Error = 4,
    ReadError = 5,
    WriteError = 6,
    #[num_enum(default)]
    Idle = 7,
}

/// Frame build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Cyclic payload longer than the frame can carry.
    CyclicTooLong,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::CyclicTooLong => write!(f, "cyclic payload too long"),
        }
    }
}

/// One bus frame, either under construction for transmit or freshly
/// exchanged on receive.
#[derive(Debug, Clone)]
pub struct Frame {
    buf: [u16; FRM_MAX_WORDS],
    sz: u16,
}

impl Frame {
    pub const fn new() -> Self {
        Frame {
            buf: [0; FRM_MAX_WORDS],
            sz: 0,
        }
    }

    /// Builds a config frame: header plus four config payload words.
    ///
    /// `cfg` shorter than four words is zero padded; longer input
    /// contributes its first four words. With `calc_crc` the CRC word is
    /// appended and counted in the frame size; hardware-CRC integrations
    /// pass `false` and let the peripheral seal the frame.
    pub fn build_config(&mut self, addr: u16, cmd: Cmd, pending: bool, cfg: &[u16], calc_crc: bool) {
        let hdr = Header::new()
            .with_pending(pending)
            .with_cmd(cmd.into())
            .with_addr(addr & 0x0fff);
        self.buf[FRM_HEAD_IDX] = hdr.into();
        for idx in 0..FRM_CONFIG_SZ as usize {
            self.buf[FRM_CONFIG_IDX + idx] = cfg.get(idx).copied().unwrap_or(0);
        }
        self.sz = FRM_HEAD_SZ + FRM_CONFIG_SZ;
        if calc_crc {
            self.buf[self.sz as usize] = crc(&self.buf[..self.sz as usize]);
            self.sz += FRM_CRC_SZ;
        }
    }

    /// Appends `cyc` as the cyclic payload of a frame previously built with
    /// `calc_crc = false`, then seals the composite frame with a fresh CRC
    /// when requested.
    pub fn append_cyclic(&mut self, cyc: &[u16], calc_crc: bool) -> Result<(), FrameError> {
        if cyc.len() > FRM_MAX_CYCLIC_SZ as usize {
            return Err(FrameError::CyclicTooLong);
        }
        self.buf[FRM_CYCLIC_IDX..FRM_CYCLIC_IDX + cyc.len()].copy_from_slice(cyc);
        self.sz = FRM_HEAD_SZ + FRM_CONFIG_SZ + cyc.len() as u16;
        if calc_crc {
            self.buf[self.sz as usize] = crc(&self.buf[..self.sz as usize]);
            self.sz += FRM_CRC_SZ;
        }
        Ok(())
    }

    pub fn header(&self) -> Header {
        Header::from(self.buf[FRM_HEAD_IDX])
    }

    pub fn addr(&self) -> u16 {
        self.header().addr()
    }

    pub fn cmd(&self) -> Cmd {
        Cmd::from(self.header().cmd())
    }

    pub fn pending(&self) -> bool {
        self.header().pending()
    }

    /// The four config payload words.
    pub fn config(&self) -> &[u16] {
        &self.buf[FRM_CONFIG_IDX..FRM_CONFIG_IDX + FRM_CONFIG_SZ as usize]
    }

    /// Copies `dst.len()` cyclic payload words out of the frame.
    pub fn read_cyclic(&self, dst: &mut [u16]) {
        dst.copy_from_slice(&self.buf[FRM_CYCLIC_IDX..FRM_CYCLIC_IDX + dst.len()]);
    }

    /// All valid words of the frame, CRC included when present.
    pub fn words(&self) -> &[u16] {
        &self.buf[..self.sz as usize]
    }

    /// Frame size in words.
    pub fn len(&self) -> u16 {
        self.sz
    }

    pub fn is_empty(&self) -> bool {
        self.sz == 0
    }

    /// Resizes the frame for an exchange of `sz` words and exposes the raw
    /// buffer for the incoming data.
    pub(crate) fn recv_buf(&mut self, sz: u16) -> &mut [u16] {
        self.sz = sz;
        &mut self.buf[..sz as usize]
    }

    /// Recomputes the CRC across the whole frame. The residue of a frame
    /// that carries its CRC word is zero.
    pub fn check_crc(&self) -> bool {
        crc(self.words()) == 0
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

const CRC_POLY: u16 = 0x1021;

const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut v = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            v = if v & 0x8000 != 0 { (v << 1) ^ CRC_POLY } else { v << 1 };
            bit += 1;
        }
        table[i] = v;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = crc_table();

fn crc_byte(v: u16, byte: u8) -> u16 {
    CRC_TABLE[(((v >> 8) ^ byte as u16) & 0xff) as usize] ^ (v << 8)
}

/// CRC-CCITT (XMODEM, poly 0x1021, initial value 0) over a word buffer,
/// high byte of each word fed first.
pub fn crc(words: &[u16]) -> u16 {
    let mut v = 0u16;
    for w in words {
        v = crc_byte(v, (w >> 8) as u8);
        v = crc_byte(v, *w as u8);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut frm = Frame::new();
        for addr in [0u16, 1, 0x010, 0x123, 0xfff] {
            for raw_cmd in 0u8..8 {
                for pending in [false, true] {
                    let cmd = Cmd::from(raw_cmd);
                    let cfg = [0x1111, 0x2222, 0x3333, 0x4444];
                    frm.build_config(addr, cmd, pending, &cfg, true);
                    assert_eq!(frm.addr(), addr);
                    assert_eq!(frm.cmd(), cmd);
                    assert_eq!(frm.pending(), pending);
                    assert_eq!(frm.config(), &cfg);
                }
            }
        }
    }

    #[test]
    fn write_request_header_word() {
        let mut frm = Frame::new();
        frm.build_config(0x010, Cmd::Write, false, &[0x1111], true);
        assert_eq!(frm.words()[0], 0x0104);
        assert_eq!(frm.len(), 6);
    }

    #[test]
    fn config_zero_padding() {
        let mut frm = Frame::new();
        frm.build_config(0x020, Cmd::Write, false, &[0xaaaa, 0xbbbb], false);
        assert_eq!(frm.config(), &[0xaaaa, 0xbbbb, 0, 0]);
        assert_eq!(frm.len(), 5);
    }

    #[test]
    fn crc_vectors() {
        // Canned XMODEM value over the classic byte string.
        let mut v = 0u16;
        for b in b"123456789" {
            v = crc_byte(v, *b);
        }
        assert_eq!(v, 0x31c3);

        assert_eq!(crc(&[0x0000, 0x0000]), 0);
        assert_eq!(crc(&[0x0001]), 0x1021);
    }

    #[test]
    fn crc_residue_and_corruption() {
        let mut frm = Frame::new();
        frm.build_config(0x234, Cmd::Read, true, &[1, 2, 3, 4], true);
        assert!(frm.check_crc());

        let words = frm.words();
        for idx in 0..words.len() - 1 {
            for bit in 0..16 {
                let mut bad = [0u16; FRM_MAX_WORDS];
                bad[..words.len()].copy_from_slice(words);
                bad[idx] ^= 1 << bit;
                assert_ne!(crc(&bad[..words.len()]), 0, "flip {idx}/{bit} undetected");
            }
        }
    }

    #[test]
    fn cyclic_payload() {
        let mut frm = Frame::new();
        frm.build_config(0, Cmd::Idle, false, &[], false);
        frm.append_cyclic(&[10, 11, 12], true).unwrap();
        assert_eq!(frm.len(), 9);
        assert!(frm.check_crc());

        let mut out = [0u16; 3];
        frm.read_cyclic(&mut out);
        assert_eq!(out, [10, 11, 12]);

        let too_long = [0u16; 11];
        assert_eq!(
            frm.append_cyclic(&too_long, true),
            Err(FrameError::CyclicTooLong)
        );
    }

    #[test]
    fn full_frame_fits() {
        let mut frm = Frame::new();
        frm.build_config(0xfff, Cmd::Write, true, &[1, 2, 3, 4], false);
        frm.append_cyclic(&[0u16; FRM_MAX_CYCLIC_SZ as usize], true).unwrap();
        assert_eq!(frm.len() as usize, FRM_MAX_WORDS);
        assert!(frm.check_crc());
    }
}

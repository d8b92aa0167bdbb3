// SD/MMC host controller. Two backing images hang off the same controller:
// the NAND (port 1) and the SD card (port 0). The command engine fills the
// response registers, the state machine tracks the card protocol, and the
// transfer engine moves one block at a time between the FIFO registers and
// the backing file.

use crate::bus::DmaRequests;
use crate::interrupt9::{Interrupt9, IRQ_EMMC};
use crate::ndma::{NDMA_AES2, NDMA_MMC1};
use log::{debug, error, info, trace, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub const ISTAT_CMDEND: u32 = 0x1;
pub const ISTAT_DATAEND: u32 = 0x4;
pub const ISTAT_RXRDY: u32 = 0x01000000;
pub const ISTAT_TXRQ: u32 = 0x02000000;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum MmcState {
    Idle = 0,
    Ready,
    Identify,
    Standby,
    Transfer,
    Data,
    Receive,
    Program,
}

#[derive(Clone, Copy, Default)]
struct SdData32Irq {
    data32: bool,
    rd32rdy_irq_pending: bool,
    tx32rq_irq_pending: bool,
    rd32rdy_irq_enable: bool,
    tx32rq_irq_enable: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Drive {
    Nand,
    Sd,
}

pub struct Emmc {
    nand: Option<File>,
    sd: Option<File>,
    cur_drive: Drive,

    app_command: bool,
    port_select: u16,
    istat: u32,
    imask: u32,
    sd_write_protected: bool,

    sd_data32: SdData32Irq,
    state: MmcState,

    argument: u32,
    response: [u32; 4],

    ocr_reg: u32,
    regcsd: [u32; 4],
    nand_cid: [u32; 4],
    sd_cid: [u32; 4],

    regsd_status: [u8; 64],
    regscr: [u8; 8],
    block: [u8; 1024],

    data_block_len: u16,
    data_blocks: u16,
    data32_block_len: u16,
    data32_blocks: u16,
    ctrl: u16,

    // The transfer engine: what is being streamed, from where in the
    // staging area, and how much remains.
    transfer_source: TransferSource,
    transfer_size: u32,
    transfer_pos: u32,
    transfer_blocks: u32,
    block_transfer: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum TransferSource {
    None,
    Block,
    SdStatus,
    Scr,
}

impl Emmc {
    pub fn new() -> Self {
        Emmc {
            nand: None,
            sd: None,
            cur_drive: Drive::Nand,
            app_command: false,
            port_select: 0,
            istat: 0,
            imask: 0,
            sd_write_protected: false,
            sd_data32: SdData32Irq::default(),
            state: MmcState::Idle,
            argument: 0,
            response: [0; 4],
            ocr_reg: 0x80FF8080,
            regcsd: [0xe9964040, 0xdff6db7f, 0x2a0f5901, 0x3f269001],
            nand_cid: [0; 4],
            sd_cid: [0xD71C65CD, 0x4445147B, 0x4D324731, 0x00150100],
            regsd_status: [0; 64],
            regscr: [0; 8],
            block: [0; 1024],
            data_block_len: 0,
            data_blocks: 0,
            data32_block_len: 0,
            data32_blocks: 0,
            ctrl: 0,
            transfer_source: TransferSource::None,
            transfer_size: 0,
            transfer_pos: 0,
            transfer_blocks: 0,
            block_transfer: false,
        }
    }

    pub fn reset(&mut self) {
        self.istat = 0;
        self.imask = 0;
        self.app_command = false;
        self.ocr_reg = 0x80FF8080;
        self.transfer_size = 0;
        self.transfer_pos = 0;
        self.transfer_blocks = 0;
        self.transfer_source = TransferSource::None;
        self.block_transfer = false;
        self.state = MmcState::Idle;
        self.sd_data32.rd32rdy_irq_pending = false;
        self.sd_data32.tx32rq_irq_pending = false;
        self.sd_write_protected = false;
        self.regsd_status = [0; 64];
        self.regscr = [0; 8];
        self.regscr[1..5].copy_from_slice(&0x012a0000u32.to_le_bytes());
    }

    pub fn mount_nand(&mut self, file: File) {
        self.nand = Some(file);
    }

    pub fn mount_sd(&mut self, file: File) {
        self.sd = Some(file);
    }

    pub fn load_cid(&mut self, cid: &[u8; 16]) {
        for i in 0..4 {
            self.nand_cid[i] =
                u32::from_le_bytes([cid[i * 4], cid[i * 4 + 1], cid[i * 4 + 2], cid[i * 4 + 3]]);
        }
    }

    fn nand_selected(&self) -> bool {
        self.port_select & 0x1 != 0
    }

    fn drive(&mut self) -> Option<&mut File> {
        match self.cur_drive {
            Drive::Nand => self.nand.as_mut(),
            Drive::Sd => self.sd.as_mut(),
        }
    }

    pub fn read16(&mut self, addr: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u16 {
        if (0x1000600C..0x1000601C).contains(&addr) {
            let index = (((addr - 0x1000600C) / 4) & 0x3) as usize;
            let reg = if addr % 4 == 2 {
                (self.response[index] >> 16) as u16
            } else {
                self.response[index] as u16
            };
            trace!("[EMMC] Read response ${:08X}: ${:04X}", addr, reg);
            return reg;
        }
        match addr {
            0x10006002 => self.port_select,
            0x1000600A => self.data_blocks,
            0x1000601C => {
                let mut reg = (self.istat & 0xFFFF) as u16;
                reg |= 1 << 5;
                reg |= (!self.sd_write_protected as u16) << 7;
                trace!("[EMMC] Read ISTAT_L: ${:04X}", reg);
                reg
            }
            0x1000601E => (self.istat >> 16) as u16,
            0x10006020 => (self.imask & 0xFFFF) as u16,
            0x10006022 => (self.imask >> 16) as u16,
            0x10006026 => self.data_block_len,
            0x10006030 => self.read_fifo16(int9, reqs),
            0x100060D8 => self.ctrl,
            // A card is always inserted in the MMC port.
            0x100060F8 => 0x4,
            0x10006100 => {
                let mut reg = (self.sd_data32.data32 as u16) << 1;
                reg |= (self.sd_data32.rd32rdy_irq_pending as u16) << 8;
                reg |= (self.sd_data32.tx32rq_irq_pending as u16) << 9;
                reg |= (self.sd_data32.rd32rdy_irq_enable as u16) << 11;
                reg |= (self.sd_data32.tx32rq_irq_enable as u16) << 12;
                reg
            }
            0x10006104 => self.data32_block_len,
            0x10006108 => self.data32_blocks,
            _ => {
                warn!("[EMMC] Unrecognized read16 ${:08X}", addr);
                0
            }
        }
    }

    pub fn read32(&mut self, addr: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u32 {
        match addr {
            0x1000610C => self.read_fifo32(int9, reqs),
            _ => {
                error!("[EMMC] Unrecognized read32 ${:08X}", addr);
                debug_assert!(false, "[EMMC] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write16(&mut self, addr: u32, value: u16, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        match addr {
            0x10006000 => {
                debug!("[EMMC] Send command, arg: ${:08X}", self.argument);
                if self.app_command {
                    self.send_acmd((value & 0x3F) as u32, int9, reqs);
                } else {
                    self.send_cmd((value & 0x3F) as u32, int9, reqs);
                }
            }
            0x10006002 => {
                debug!("[EMMC] Port select: ${:04X}", value);
                self.port_select = value;
            }
            0x10006004 => {
                self.argument = (self.argument & !0xFFFF) | value as u32;
            }
            0x10006006 => {
                self.argument = (self.argument & 0xFFFF) | ((value as u32) << 16);
                trace!("[EMMC] Set arg: ${:08X}", self.argument);
            }
            0x1000600A => {
                debug!("[EMMC] Set BLKCOUNT: ${:04X}", value);
                self.data_blocks = value;
            }
            // ISTAT halves acknowledge by writing zeroes.
            0x1000601C => {
                self.istat &= value as u32 | 0xFFFF0000;
            }
            0x1000601E => {
                self.istat &= ((value as u32) << 16) | 0xFFFF;
            }
            0x10006020 => {
                self.imask = (self.imask & !0xFFFF) | value as u32;
            }
            0x10006022 => {
                self.imask = (self.imask & 0xFFFF) | ((value as u32) << 16);
            }
            0x10006026 => {
                debug!("[EMMC] Set BLKLEN: ${:04X}", value);
                self.data_block_len = value.min(0x200);
            }
            0x100060D8 => self.ctrl = value,
            0x10006100 => {
                self.sd_data32.data32 = value & (1 << 1) != 0;
                self.sd_data32.rd32rdy_irq_enable = value & (1 << 11) != 0;
                self.sd_data32.tx32rq_irq_enable = value & (1 << 12) != 0;
            }
            0x10006104 => self.data32_block_len = value & 0x3FF,
            0x10006108 => self.data32_blocks = value,
            _ => warn!("[EMMC] Unrecognized write16 ${:08X}: ${:04X}", addr, value),
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        match addr {
            0x1000610C => self.write_fifo32(value, int9, reqs),
            _ => warn!("[EMMC] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    fn send_cmd(&mut self, command: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        debug!("[EMMC] CMD{}", command);
        match command {
            0 => {
                self.istat = 0;
                self.response[0] = self.get_csr();
                self.command_end(int9);
                self.state = MmcState::Idle;
            }
            1 => {
                self.response[0] = self.ocr_reg;
                self.command_end(int9);
            }
            2 => {
                self.response = if self.nand_selected() { self.nand_cid } else { self.sd_cid };
                self.command_end(int9);
                if self.state == MmcState::Ready {
                    self.state = MmcState::Identify;
                }
            }
            3 => {
                // The relative card address is always reported as 1.
                self.response[0] = 0x10000 | self.get_r1_reply();
                self.command_end(int9);
                if self.state == MmcState::Identify {
                    self.state = MmcState::Standby;
                }
            }
            6 => {
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
                if self.state == MmcState::Transfer {
                    self.state = MmcState::Program;
                }
            }
            7 => {
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
                if self.state == MmcState::Standby {
                    self.state = MmcState::Transfer;
                }
            }
            8 => {
                // Voltage echo.
                self.response[0] = 0x1AA;
                self.command_end(int9);
            }
            9 => {
                self.response = self.regcsd;
                self.command_end(int9);
            }
            10 => {
                self.response = self.nand_cid;
                self.command_end(int9);
            }
            12 => {
                self.response[0] = self.get_r1_reply();
                self.transfer_size = 0;
                self.transfer_end(int9, reqs);
                match self.state {
                    MmcState::Data | MmcState::Receive => self.state = MmcState::Transfer,
                    MmcState::Transfer => self.state = MmcState::Standby,
                    _ => {}
                }
            }
            13 => {
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
            }
            16 => {
                debug!("[EMMC] Set block length: ${:08X}", self.argument);
                self.command_end(int9);
            }
            18 => {
                self.cur_drive = if self.nand_selected() { Drive::Nand } else { Drive::Sd };
                self.state = MmcState::Transfer;
                self.response[0] = self.get_r1_reply();
                self.state = MmcState::Data;
                self.transfer_pos = 0;
                self.transfer_blocks = self.data_blocks as u32;
                self.transfer_size = self.data_block_len as u32;
                self.block_transfer = true;
                self.transfer_source = TransferSource::Block;
                info!(
                    "[EMMC] Read multiple blocks from {} (start: ${:08X} blocks: {})",
                    if self.nand_selected() { "NAND" } else { "SD" },
                    self.argument,
                    self.data_blocks
                );

                let start = self.argument as u64;
                let size = self.transfer_size as usize;
                let mut block = [0u8; 1024];
                if let Some(drive) = self.drive() {
                    if let Err(e) = drive.seek(SeekFrom::Start(start)) {
                        error!("[EMMC] Seek failed: {}", e);
                    }
                    if let Err(e) = drive.read_exact(&mut block[..size]) {
                        error!("[EMMC] Block read failed: {}", e);
                    }
                }
                self.block = block;
                self.data_ready(int9, reqs);
            }
            25 => {
                self.cur_drive = if self.nand_selected() { Drive::Nand } else { Drive::Sd };
                self.state = MmcState::Transfer;
                self.response[0] = self.get_r1_reply();
                self.state = MmcState::Receive;
                self.transfer_pos = 0;
                self.transfer_blocks = self.data_blocks as u32;
                self.transfer_size = self.data_block_len as u32;
                self.block_transfer = true;
                self.transfer_source = TransferSource::Block;
                info!(
                    "[EMMC] Write multiple blocks (start: ${:08X} blocks: {})",
                    self.argument, self.data_blocks
                );

                let start = self.argument as u64;
                if let Some(drive) = self.drive() {
                    if let Err(e) = drive.seek(SeekFrom::Start(start)) {
                        error!("[EMMC] Seek failed: {}", e);
                    }
                }
                self.write_ready(int9);
            }
            55 => {
                self.app_command = true;
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
            }
            _ => panic!("[EMMC] Unrecognized CMD{}", command),
        }
    }

    fn send_acmd(&mut self, command: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        debug!("[EMMC] ACMD{}", command);
        self.istat &= !ISTAT_CMDEND;
        self.app_command = false;

        match command {
            6 => {
                // Bus width lands in the top bits of the SD status block.
                let width = (self.argument & 0x3) << 30;
                let old = u32::from_le_bytes([
                    self.regsd_status[60],
                    self.regsd_status[61],
                    self.regsd_status[62],
                    self.regsd_status[63],
                ]);
                self.regsd_status[60..64].copy_from_slice(&(((old & !3) << 30) | width).to_le_bytes());
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
            }
            13 => {
                self.response[0] = self.get_r1_reply();
                self.sd_data32.rd32rdy_irq_pending = true;
                self.set_istat(ISTAT_RXRDY, int9);
                self.transfer_source = TransferSource::SdStatus;
                self.transfer_pos = 0;
                self.transfer_size = self.regsd_status.len() as u32;
                self.command_end(int9);
            }
            41 => {
                // Both ports report the same OCR here; see DESIGN.md.
                self.response[0] = self.ocr_reg;
                self.command_end(int9);
                if self.state == MmcState::Idle {
                    self.state = MmcState::Ready;
                }
            }
            42 => {
                self.response[0] = self.get_r1_reply();
                self.command_end(int9);
            }
            51 => {
                self.response[0] = self.get_r1_reply();
                self.sd_data32.rd32rdy_irq_pending = true;
                self.set_istat(ISTAT_RXRDY, int9);
                self.transfer_source = TransferSource::Scr;
                self.transfer_size = self.regscr.len() as u32;
                self.transfer_pos = 0;
                self.command_end(int9);
                self.data_ready(int9, reqs);
            }
            _ => panic!("[EMMC] Unrecognized ACMD{}", command),
        }
    }

    fn get_csr(&self) -> u32 {
        // Card is ready.
        1 << 9
    }

    fn get_r1_reply(&self) -> u32 {
        let mut reg = (self.app_command as u32) << 5;
        reg |= (self.state as u32) << 9;
        if self.transfer_size == 0 {
            // Ready for data.
            reg |= 1 << 8;
        }
        reg
    }

    fn command_end(&mut self, int9: &mut Interrupt9) {
        self.set_istat(ISTAT_CMDEND, int9);
    }

    fn data_ready(&mut self, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        self.sd_data32.tx32rq_irq_pending = false;
        self.sd_data32.rd32rdy_irq_pending = true;
        if self.sd_data32.rd32rdy_irq_enable {
            self.set_istat(ISTAT_RXRDY, int9);
        }
        reqs.set_ndma(NDMA_MMC1);
        reqs.set_ndma(NDMA_AES2);
    }

    fn write_ready(&mut self, int9: &mut Interrupt9) {
        self.sd_data32.rd32rdy_irq_pending = false;
        self.sd_data32.tx32rq_irq_pending = false;
        if self.sd_data32.tx32rq_irq_enable {
            int9.assert_irq(IRQ_EMMC);
        }
        self.set_istat(ISTAT_TXRQ, int9);
    }

    fn set_istat(&mut self, field: u32, int9: &mut Interrupt9) {
        let old_istat = self.istat;
        self.istat |= field;
        // Edge-gated per masked bit: a level held across writes only
        // produces one interrupt until acknowledged.
        if old_istat & self.imask & field == 0 && self.istat & self.imask & field != 0 {
            int9.assert_irq(IRQ_EMMC);
        }
    }

    fn staging_read(&self, pos: usize, len: usize) -> &[u8] {
        match self.transfer_source {
            TransferSource::SdStatus => &self.regsd_status[pos..pos + len],
            TransferSource::Scr => &self.regscr[pos..pos + len],
            _ => &self.block[pos..pos + len],
        }
    }

    fn read_fifo16(&mut self, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u16 {
        if self.transfer_size == 0 {
            return 0;
        }
        let pos = self.transfer_pos as usize;
        let bytes = self.staging_read(pos, 2);
        let value = u16::from_le_bytes([bytes[0], bytes[1]]);
        self.transfer_pos += 2;
        self.transfer_size -= 2;
        if self.transfer_size == 0 {
            self.transfer_end(int9, reqs);
        }
        value
    }

    fn read_fifo32(&mut self, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u32 {
        if self.transfer_size == 0 {
            return 0;
        }
        let pos = self.transfer_pos as usize;
        let bytes = self.staging_read(pos, 4);
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.transfer_pos += 4;
        self.transfer_size -= 4;

        if self.transfer_size == 0 {
            self.data_ready(int9, reqs);
            self.transfer_pos = 0;
            if self.block_transfer {
                self.transfer_blocks -= 1;
                trace!("[EMMC] Transfer blocks left: {}", self.transfer_blocks);
                if self.transfer_blocks == 0 {
                    self.transfer_end(int9, reqs);
                } else {
                    self.transfer_size = self.data_block_len as u32;
                    let size = self.transfer_size as usize;
                    let mut block = [0u8; 1024];
                    if let Some(drive) = self.drive() {
                        if let Err(e) = drive.read_exact(&mut block[..size]) {
                            error!("[EMMC] Block read failed: {}", e);
                        }
                    }
                    self.block = block;
                }
            } else {
                self.transfer_end(int9, reqs);
            }
        }
        value
    }

    fn write_fifo32(&mut self, value: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        if self.transfer_size == 0 {
            return;
        }
        let pos = self.transfer_pos as usize;
        self.block[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
        self.transfer_pos += 4;
        self.transfer_size -= 4;

        if self.transfer_size == 0 {
            self.transfer_pos = 0;
            let len = self.data_block_len as usize;
            let block = self.block;
            if let Some(drive) = self.drive() {
                if let Err(e) = drive.write_all(&block[..len]) {
                    error!("[EMMC] Block write failed: {}", e);
                }
            }
            if self.block_transfer {
                self.transfer_blocks -= 1;
                if self.transfer_blocks == 0 {
                    self.transfer_end(int9, reqs);
                    if let Some(drive) = self.drive() {
                        let _ = drive.flush();
                    }
                } else {
                    self.transfer_size = self.data_block_len as u32;
                    self.write_ready(int9);
                }
            } else {
                self.transfer_end(int9, reqs);
                if let Some(drive) = self.drive() {
                    let _ = drive.flush();
                }
            }
        }
    }

    fn transfer_end(&mut self, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        self.transfer_source = TransferSource::None;
        self.block_transfer = false;
        self.sd_data32.rd32rdy_irq_pending = false;
        debug!("[EMMC] Transfer end");
        match self.state {
            MmcState::Data | MmcState::Receive => self.state = MmcState::Transfer,
            _ => self.state = MmcState::Standby,
        }
        // Clear the busy bit so the command-end IRQ can hit.
        self.istat &= !ISTAT_CMDEND;
        self.set_istat(ISTAT_DATAEND, int9);
        self.command_end(int9);
        reqs.clear_ndma(NDMA_MMC1);
        reqs.clear_ndma(NDMA_AES2);
    }
}

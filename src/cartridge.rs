// Three read engines share the cartridge slot: the legacy NTR command set,
// the CTR command set with its 8 KiB staging buffer, and the SPI flash
// holding the save data.

use crate::bus::DmaRequests;
use crate::interrupt9::{Interrupt9, IRQ_CTRCARD};
use crate::ndma::NDMA_CTRCARD0;
use log::{debug, info, trace, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

const SAVE_SIZE: usize = 1024 * 1024 * 8;

#[derive(Clone, Copy, PartialEq, Debug)]
enum SpicardState {
    Idle,
    Selected,
    NeedsParams,
    WriteReady,
    ProgramReady,
}

#[derive(Clone, Copy, Default)]
struct NtrRomCtrl {
    data_ready: bool,
    busy: bool,
}

#[derive(Clone, Copy, Default)]
struct CtrRomCtrl {
    data_ready: bool,
    busy: bool,
    write_mode: bool,
    irq_enable: bool,
}

pub struct Cartridge {
    card: Option<File>,
    save_data: Vec<u8>,

    cart_id: u32,
    ntr_enable: u16,
    read_block_count: u32,
    read_addr: u32,
    cmd_buffer: [u8; 16],
    output_buffer: Box<[u8; 0x2000]>,
    output_pos: usize,
    output_bytes_left: u32,

    ntr_romctrl: NtrRomCtrl,
    ctr_romctrl: CtrRomCtrl,
    ctr_secctrl: u32,

    spi_state: SpicardState,
    spi_cmd: u8,
    spi_save_addr: u32,
    spi_block_len: i32,
    spi_input_buffer: [u8; 0x200],
    spi_output_buffer: [u8; 0x200],
    spi_input_pos: usize,
    spi_output_pos: usize,
}

impl Cartridge {
    pub fn new() -> Self {
        Cartridge {
            card: None,
            save_data: Vec::new(),
            cart_id: 0,
            ntr_enable: 0,
            read_block_count: 0,
            read_addr: 0,
            cmd_buffer: [0; 16],
            output_buffer: Box::new([0; 0x2000]),
            output_pos: 0,
            output_bytes_left: 0,
            ntr_romctrl: NtrRomCtrl::default(),
            ctr_romctrl: CtrRomCtrl::default(),
            ctr_secctrl: 0,
            spi_state: SpicardState::Idle,
            spi_cmd: 0,
            spi_save_addr: 0,
            spi_block_len: 0,
            spi_input_buffer: [0; 0x200],
            spi_output_buffer: [0; 0x200],
            spi_input_pos: 0,
            spi_output_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.read_block_count = 0;
        self.cart_id = 0x9000FEC2;
        self.ntr_enable = 0;
        self.output_pos = 0;
        self.output_bytes_left = 0;
        self.ntr_romctrl = NtrRomCtrl::default();
        self.ctr_romctrl = CtrRomCtrl::default();
        self.spi_input_pos = 0;
        self.spi_output_pos = 0;
        self.spi_block_len = 0;
        self.spi_state = SpicardState::Idle;
    }

    pub fn mount(&mut self, file: File) {
        info!("[Cartridge] Card image mounted");
        self.card = Some(file);
        self.save_data = vec![0xFF; SAVE_SIZE];
    }

    pub fn card_inserted(&self) -> bool {
        self.card.is_some()
    }

    fn card_read(&mut self, len: usize) {
        if let Some(card) = self.card.as_mut() {
            if let Err(e) = card.read_exact(&mut self.output_buffer[..len]) {
                warn!("[Cartridge] Short card read: {}", e);
            }
        }
    }

    fn card_seek(&mut self, offset: u64) {
        if let Some(card) = self.card.as_mut() {
            if let Err(e) = card.seek(SeekFrom::Start(offset)) {
                warn!("[Cartridge] Card seek failed: {}", e);
            }
        }
    }

    fn process_ntr_cmd(&mut self) {
        self.output_pos = 0;
        match self.cmd_buffer[0] {
            0x3E | 0x71 => {
                self.ntr_romctrl.busy = false;
                self.ntr_romctrl.data_ready = false;
            }
            0x90 => {
                self.ntr_romctrl.data_ready = true;
                self.output_buffer[0..4].copy_from_slice(&self.cart_id.to_le_bytes());
                self.output_bytes_left = 0x4;
            }
            0x9F => {
                // Dummy: the output lines are all high-Z.
                self.ntr_romctrl.data_ready = true;
                self.output_buffer.fill(0xFF);
                self.output_bytes_left = 0x2000;
            }
            0xA0 => {
                self.ntr_romctrl.data_ready = true;
                self.output_buffer.fill(0);
                self.output_bytes_left = 0x4;
            }
            cmd => panic!("[NTRCARD] Unrecognized command ${:02X}", cmd),
        }
    }

    fn process_ctr_cmd(&mut self) {
        self.output_pos = 0;
        match self.cmd_buffer[0] {
            0x82 => {
                // Read header.
                self.ctr_romctrl.data_ready = true;
                self.card_seek(0x1000);
                self.card_read(0x200);
                self.output_bytes_left = 0x200;
            }
            0x83 => {
                // Seed.
                self.ctr_romctrl.data_ready = false;
                self.ctr_romctrl.busy = false;
            }
            0xA2 => {
                self.ctr_romctrl.data_ready = true;
                self.output_buffer[0..4].copy_from_slice(&self.cart_id.to_le_bytes());
                self.output_bytes_left = 0x4;
            }
            0xA3 => {
                self.ctr_romctrl.data_ready = true;
                self.output_buffer.fill(0);
                self.output_bytes_left = 0x4;
            }
            0xBF => {
                self.read_addr = u32::from_be_bytes([
                    self.cmd_buffer[4],
                    self.cmd_buffer[5],
                    self.cmd_buffer[6],
                    self.cmd_buffer[7],
                ]);
                debug!("[CTRCARD] Reading from ${:08X}", self.read_addr);
                self.ctr_romctrl.data_ready = true;
                self.card_seek(self.read_addr as u64);
                self.output_bytes_left = self.read_block_count * 0x200;
                let chunk = self.output_bytes_left.min(0x1000) as usize;
                self.card_read(chunk);
            }
            0xC5 => {
                self.ctr_romctrl.data_ready = false;
                self.ctr_romctrl.busy = false;
            }
            0xC6 => {
                // Unique ID; contents unknown.
                self.output_buffer[..0x40].fill(0);
                self.output_bytes_left = 0x40;
                self.ctr_romctrl.data_ready = true;
            }
            cmd => panic!("[CTRCARD] Unrecognized command ${:02X}", cmd),
        }
    }

    fn process_spicard_cmd(&mut self) {
        match self.spi_state {
            SpicardState::Idle => {
                debug!("[SPICARD] Selected");
                self.spi_state = SpicardState::Selected;
            }
            SpicardState::Selected => {
                self.spi_cmd = self.spi_input_buffer[0];
                match self.spi_cmd {
                    0x02 => {
                        self.spi_state = SpicardState::WriteReady;
                        self.spi_save_addr = ((self.spi_input_buffer[1] as u32) << 16)
                            | ((self.spi_input_buffer[2] as u32) << 8)
                            | self.spi_input_buffer[3] as u32;
                        debug!("[SPICARD] Writing ${:08X}", self.spi_save_addr);
                    }
                    0x03 => {
                        self.spi_state = SpicardState::Selected;
                        self.spi_save_addr = ((self.spi_input_buffer[1] as u32) << 16)
                            | ((self.spi_input_buffer[2] as u32) << 8)
                            | self.spi_input_buffer[3] as u32;
                        debug!("[SPICARD] Reading from ${:08X}", self.spi_save_addr);
                        self.fill_spi_output();
                    }
                    0x05 => {
                        // Status register: bit 0 = busy, bit 1 = write enabled.
                        self.spi_output_buffer[0..4].copy_from_slice(&(1u32 << 1).to_le_bytes());
                    }
                    0x06 => {
                        // Write enable.
                    }
                    0x9F => {
                        // Card ID: capacity 0x11, device type 0x22,
                        // manufacturer 0xC2 (Macronix).
                        self.spi_state = SpicardState::Selected;
                        self.spi_output_buffer[0..4].copy_from_slice(&0x1122C2u32.to_le_bytes());
                    }
                    0xEB => self.spi_state = SpicardState::NeedsParams,
                    cmd => panic!("[SPICARD] Unrecognized SELECTED cmd ${:02X}", cmd),
                }
            }
            SpicardState::NeedsParams => match self.spi_cmd {
                0xEB => {
                    self.spi_state = SpicardState::Selected;
                    self.spi_save_addr = ((self.spi_input_buffer[0] as u32) << 16)
                        | ((self.spi_input_buffer[1] as u32) << 8)
                        | self.spi_input_buffer[2] as u32;
                    debug!("[SPICARD] Reading from ${:08X}", self.spi_save_addr);
                    self.fill_spi_output();
                }
                cmd => panic!("[SPICARD] Unrecognized NEEDS_PARAMS cmd ${:02X}", cmd),
            },
            SpicardState::WriteReady | SpicardState::ProgramReady => {
                panic!("[SPICARD] WRITE/PROGRAM_READY should never process a command")
            }
        }
    }

    fn fill_spi_output(&mut self) {
        let start = self.spi_save_addr as usize;
        let len = (self.spi_block_len.max(0) as usize).min(self.spi_output_buffer.len());
        self.spi_output_buffer[..len].copy_from_slice(&self.save_data[start..start + len]);
    }

    pub fn read16_ntr(&self, addr: u32) -> u16 {
        match addr {
            0x10164000 => self.ntr_enable,
            _ => {
                warn!("[NTRCARD] Unrecognized read16 ${:08X}", addr);
                0
            }
        }
    }

    pub fn read32_ntr(&mut self, addr: u32) -> u32 {
        match addr {
            0x10164004 => {
                let mut reg = 0;
                reg |= (self.ntr_romctrl.data_ready as u32) << 23;
                reg |= (self.ntr_romctrl.busy as u32) << 31;
                reg
            }
            0x1016401C => {
                let pos = self.output_pos;
                let reg = u32::from_le_bytes([
                    self.output_buffer[pos],
                    self.output_buffer[pos + 1],
                    self.output_buffer[pos + 2],
                    self.output_buffer[pos + 3],
                ]);
                self.output_bytes_left = self.output_bytes_left.wrapping_sub(4);
                self.output_pos += 4;
                if self.output_bytes_left == 0 {
                    self.ntr_romctrl.busy = false;
                    self.ntr_romctrl.data_ready = false;
                }
                reg
            }
            _ => {
                warn!("[NTRCARD] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn read32_ctr(&mut self, addr: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u32 {
        match addr {
            0x10004000 => {
                let mut reg = 0;
                reg |= (self.ctr_romctrl.data_ready as u32) << 27;
                reg |= (self.ctr_romctrl.write_mode as u32) << 29;
                reg |= (self.ctr_romctrl.irq_enable as u32) << 30;
                reg |= (self.ctr_romctrl.busy as u32) << 31;
                reg
            }
            0x10004008 => self.ctr_secctrl | (1 << 14),
            0x10004030 => {
                let pos = self.output_pos;
                let reg = u32::from_le_bytes([
                    self.output_buffer[pos],
                    self.output_buffer[pos + 1],
                    self.output_buffer[pos + 2],
                    self.output_buffer[pos + 3],
                ]);
                self.output_bytes_left = self.output_bytes_left.wrapping_sub(4);
                self.output_pos += 4;
                if self.output_pos == 0x20 {
                    reqs.set_ndma(NDMA_CTRCARD0);
                }
                if self.output_bytes_left == 0 {
                    self.ctr_romctrl.busy = false;
                    self.ctr_romctrl.data_ready = false;
                    reqs.clear_ndma(NDMA_CTRCARD0);
                    if self.ctr_romctrl.irq_enable {
                        int9.assert_irq(IRQ_CTRCARD);
                    }
                } else if self.output_pos == 0x1000 {
                    self.output_pos = 0;
                    self.card_read(0x1000);
                    reqs.clear_ndma(NDMA_CTRCARD0);
                }
                reg
            }
            _ => {
                warn!("[CTRCARD] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn read32_spicard(&mut self, addr: u32) -> u32 {
        if !self.card_inserted() {
            return 0;
        }
        match addr {
            0x1000D80C => {
                if self.spi_block_len <= 0 {
                    panic!("[SPICARD] Read from FIFO when no data is present");
                }
                let pos = self.spi_output_pos;
                let reg = u32::from_le_bytes([
                    self.spi_output_buffer[pos],
                    self.spi_output_buffer[pos + 1],
                    self.spi_output_buffer[pos + 2],
                    self.spi_output_buffer[pos + 3],
                ]);
                self.spi_output_pos += 4;
                self.spi_block_len -= 4;
                if self.spi_output_pos >= self.spi_output_buffer.len() && self.spi_block_len > 0 {
                    self.spi_output_pos = 0;
                    match self.spi_cmd {
                        0x03 => {
                            self.spi_save_addr += self.spi_output_buffer.len() as u32;
                            self.fill_spi_output();
                        }
                        cmd => panic!("[SPICARD] Unrecognized command in FIFO read ${:02X}", cmd),
                    }
                }
                trace!("[SPICARD] Read32 NSPI_FIFO: ${:08X}", reg);
                reg
            }
            _ => {
                warn!("[SPICARD] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write8_ntr(&mut self, addr: u32, value: u8) {
        if (0x10164008..0x10164010).contains(&addr) {
            self.cmd_buffer[(addr & 0x7) as usize] = value;
            return;
        }
        warn!("[NTRCARD] Unrecognized write8 ${:08X}: ${:02X}", addr, value);
    }

    pub fn write16_ntr(&mut self, addr: u32, value: u16) {
        match addr {
            0x10164000 => {
                debug!("[NTRCARD] Write16 CARDMCNT: ${:04X}", value);
                self.ntr_enable = value;
            }
            _ => warn!("[NTRCARD] Unrecognized write16 ${:08X}: ${:04X}", addr, value),
        }
    }

    pub fn write32_ntr(&mut self, addr: u32, value: u32) {
        match addr {
            0x10164004 => {
                debug!("[NTRCARD] Write32 ROMCTRL: ${:08X}", value);
                if !self.ntr_romctrl.busy && value & (1 << 31) != 0 {
                    self.ntr_romctrl.busy = true;
                    self.process_ntr_cmd();
                }
            }
            0x10164008 => self.cmd_buffer[0..4].copy_from_slice(&value.to_le_bytes()),
            0x1016400C => self.cmd_buffer[4..8].copy_from_slice(&value.to_le_bytes()),
            _ => warn!("[NTRCARD] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    pub fn write32_ctr(&mut self, addr: u32, value: u32) {
        if (0x10004020..0x10004030).contains(&addr) {
            // The CTR command buffer is written big-endian, last word first.
            let value = value.swap_bytes();
            let index = (12 - (addr & 0xF)) as usize;
            self.cmd_buffer[index..index + 4].copy_from_slice(&value.to_le_bytes());
            return;
        }
        match addr {
            0x10004000 => {
                debug!("[CTRCARD] Write32 ROMCTRL: ${:08X}", value);
                self.ctr_romctrl.write_mode = value & (1 << 29) != 0;
                self.ctr_romctrl.irq_enable = value & (1 << 30) != 0;
                if !self.ctr_romctrl.busy && value & (1 << 31) != 0 {
                    self.ctr_romctrl.busy = true;
                    self.process_ctr_cmd();
                }
            }
            0x10004004 => {
                debug!("[CTRCARD] BLKCNT: ${:08X}", value);
                self.read_block_count = (value & 0xFFFF) + 1;
            }
            0x10004008 => self.ctr_secctrl = value,
            _ => warn!("[CTRCARD] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    pub fn write32_spicard(&mut self, addr: u32, value: u32) {
        if !self.card_inserted() {
            return;
        }
        match addr {
            0x1000D800 => {
                debug!("[SPICARD] Write32 NSPI_CNT: ${:08X}", value);
                if value & (1 << 15) != 0 {
                    self.spi_input_pos = 0;
                    self.spi_output_pos = 0;
                    self.process_spicard_cmd();
                }
            }
            0x1000D804 => {
                debug!("[SPICARD] Clear chip select");
                let len = self.spi_block_len.max(0) as usize;
                match self.spi_state {
                    SpicardState::WriteReady => {
                        for i in 0..len {
                            self.save_data[self.spi_save_addr as usize + i] =
                                self.spi_input_buffer[i];
                        }
                    }
                    SpicardState::ProgramReady => {
                        for i in 0..len {
                            self.save_data[self.spi_save_addr as usize + i] &=
                                self.spi_input_buffer[i];
                        }
                    }
                    _ => {}
                }
                self.spi_state = SpicardState::Idle;
            }
            0x1000D808 => {
                debug!("[SPICARD] Block len: ${:08X}", value);
                self.spi_block_len = value as i32;
            }
            0x1000D80C => {
                trace!("[SPICARD] Write32 NSPI_FIFO: ${:08X}", value);
                self.spi_input_buffer[self.spi_input_pos..self.spi_input_pos + 4]
                    .copy_from_slice(&value.to_le_bytes());
                self.spi_input_pos += 4;
                if self.spi_input_pos >= self.spi_input_buffer.len() {
                    panic!("[SPICARD] Input pos exceeds size of input buffer");
                }
            }
            _ => warn!("[SPICARD] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }
}

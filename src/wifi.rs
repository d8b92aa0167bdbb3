// The Atheros WiFi module as the host sees it: an SDIO card on the ARM11
// side. CMD52/CMD53 reach the card's register spaces; function 1 carries
// the mailbox FIFOs the BMI/WMI protocols run over. Behind the "window"
// registers sits the card's own SoC bus with the Xtensa CPU, its ROM/RAM
// and its timers. By default the firmware protocol is serviced in-host;
// with the LLE switch the Xtensa core runs the real thing instead.

use crate::bus::DmaRequests;
use crate::corelink::CDMA_WIFI;
use crate::mpcore::{MpcorePmr, IRQ_WIFI_SDIO};
use crate::scheduler::{Event, Scheduler};
use crate::wifi_timers::WifiTimers;
use crate::xtensa::Xtensa;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;

const ROM_BASE: u32 = 0x0E0000;
const RAM_BASE: u32 = 0x120000;
const MEMMAP_MASK: u32 = (1024 * 1024 * 4) - 1;

const ROM_SIZE: usize = 0x40000;
const RAM_SIZE: usize = 0x20000;

const WMI_REPLY_DELAY: u64 = 500_000;

// Card information structure tuples for functions 0 and 1; everything past
// the listed prefix reads as zero.
const CIS0: &[u8] = &[
    0x01, 0x03, 0xD9, 0x01, 0xFF, 0x20, 0x04, 0x71, 0x02, 0x00, 0x02, 0x21, 0x02, 0x0C, 0x00,
    0x22, 0x04, 0x00, 0x00, 0x08, 0x32, 0x1A, 0x05, 0x01, 0x01, 0x00, 0x02, 0x07, 0x1B, 0x08,
    0xC1, 0x41, 0x30, 0x30, 0xFF, 0xFF, 0x32, 0x00, 0x14, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

const CIS1: &[u8] = &[
    0x20, 0x04, 0x71, 0x02, 0x00, 0x02, 0x21, 0x02, 0x0C, 0x00, 0x22, 0x2A, 0x01, 0x01, 0x11,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0xFF, 0x80,
    0x00, 0x00, 0x00, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x80, 0x01, 0x06, 0x81, 0x01, 0x07,
    0x82, 0x01, 0xDF, 0xFF, 0x01,
];

fn read8_mbox(mbox: &mut VecDeque<u8>) -> u8 {
    mbox.pop_front().unwrap_or(0)
}

fn read16_mbox(mbox: &mut VecDeque<u8>) -> u16 {
    let mut value = 0;
    for i in 0..2 {
        value |= (read8_mbox(mbox) as u16) << (i * 8);
    }
    value
}

fn read32_mbox(mbox: &mut VecDeque<u8>) -> u32 {
    let mut value = 0;
    for i in 0..4 {
        value |= (read8_mbox(mbox) as u32) << (i * 8);
    }
    value
}

fn write8_mbox(mbox: &mut VecDeque<u8>, value: u8) {
    mbox.push_back(value);
}

fn write16_mbox(mbox: &mut VecDeque<u8>, value: u16) {
    for i in 0..2 {
        mbox.push_back((value >> (i * 8)) as u8);
    }
}

fn write32_mbox(mbox: &mut VecDeque<u8>, value: u32) {
    for i in 0..4 {
        mbox.push_back((value >> (i * 8)) as u8);
    }
}

/// Everything on the card side of the window: the Xtensa memory map and
/// the SoC registers, without the CPU itself.
pub struct WifiSoc {
    rom: Vec<u8>,
    ram: Vec<u8>,
    pub timers: WifiTimers,
    pub xtensa_irq_stat: u32,
    pub mbox_irq_stat: u32,
    pub mbox_irq_enable: u32,
}

impl WifiSoc {
    pub fn new() -> Self {
        WifiSoc {
            rom: vec![0; ROM_SIZE],
            ram: vec![0; RAM_SIZE],
            timers: WifiTimers::new(),
            xtensa_irq_stat: 0,
            mbox_irq_stat: 0,
            mbox_irq_enable: 0,
        }
    }

    pub fn reset(&mut self) {
        self.rom.iter_mut().for_each(|b| *b = 0);
        self.ram.iter_mut().for_each(|b| *b = 0);
        self.timers.reset();
        self.xtensa_irq_stat = 0;
        self.mbox_irq_stat = 0;
        self.mbox_irq_enable = 0;
    }

    pub fn load_firmware_rom(&mut self, image: &[u8]) {
        let len = image.len().min(ROM_SIZE);
        self.rom[..len].copy_from_slice(&image[..len]);
    }

    pub fn read8(&mut self, addr: u32) -> u8 {
        let addr = addr & MEMMAP_MASK;
        if (ROM_BASE..RAM_BASE).contains(&addr) {
            return self.rom[(addr - ROM_BASE) as usize];
        }
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            return self.ram[(addr - RAM_BASE) as usize];
        }
        panic!("[WiFi] Unrecognized Xtensa read8 ${:08X}", addr);
    }

    pub fn read16(&mut self, addr: u32) -> u16 {
        let addr = addr & MEMMAP_MASK;
        if (ROM_BASE..RAM_BASE).contains(&addr) {
            let i = (addr - ROM_BASE) as usize;
            return u16::from_le_bytes([self.rom[i], self.rom[i + 1]]);
        }
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            let i = (addr - RAM_BASE) as usize;
            return u16::from_le_bytes([self.ram[i], self.ram[i + 1]]);
        }
        panic!("[WiFi] Unrecognized Xtensa read16 ${:08X}", addr);
    }

    pub fn read32(&mut self, addr: u32) -> u32 {
        let addr = addr & MEMMAP_MASK;
        if (ROM_BASE..RAM_BASE).contains(&addr) {
            let i = (addr - ROM_BASE) as usize;
            return u32::from_le_bytes([self.rom[i], self.rom[i + 1], self.rom[i + 2], self.rom[i + 3]]);
        }
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            let i = (addr - RAM_BASE) as usize;
            return u32::from_le_bytes([self.ram[i], self.ram[i + 1], self.ram[i + 2], self.ram[i + 3]]);
        }

        // Patch TCAM enable.
        if (0x8000..0x8080).contains(&addr) {
            return 0;
        }
        if (0x18080..0x180A0).contains(&addr) {
            trace!("[WiFi] Read32 Xtensa WLAN_LOCAL_COUNT ${:08X}", addr);
            return 0;
        }

        match addr {
            // Reset control.
            0x04000 => 0,
            // Clock control.
            0x04028 => 0,
            // Watchdog control.
            0x04030 => 0,
            0x04044 => self.xtensa_irq_stat,
            0x04048 | 0x04058 | 0x04068 | 0x04078 => {
                self.timers.read_target(((addr - 0x4048) / 0x10) as usize)
            }
            0x0404C | 0x0405C | 0x0406C | 0x0407C => {
                self.timers.read_count(((addr - 0x404C) / 0x10) as usize)
            }
            0x04050 | 0x04060 | 0x04070 | 0x04080 => {
                self.timers.read_ctrl(((addr - 0x4050) / 0x10) as usize)
            }
            0x04054 | 0x04064 | 0x04074 | 0x04084 => {
                self.timers.read_int_status(((addr - 0x4054) / 0x10) as usize)
            }
            0x04090 => self.timers.read_count(4),
            0x04094 => self.timers.read_ctrl(4),
            0x04098 => self.timers.read_int_status(4),
            // SOC_RESET_CAUSE: cold boot.
            0x040C0 => 0x2,
            0x040C4 => 0,
            // Chip id.
            0x040EC => 0x0D000001,
            0x040F0 => 0,
            // Power control.
            0x04110 => 0,
            0x14048 => 0,
            // Local scratchpad.
            0x180C0 => 0,
            _ => panic!("[WiFi] Unrecognized Xtensa read32 ${:08X}", addr),
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        let addr = addr & MEMMAP_MASK;
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            self.ram[(addr - RAM_BASE) as usize] = value;
            return;
        }
        panic!("[WiFi] Unrecognized Xtensa write8 ${:08X}: ${:02X}", addr, value);
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        let addr = addr & MEMMAP_MASK;
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            let i = (addr - RAM_BASE) as usize;
            self.ram[i..i + 2].copy_from_slice(&value.to_le_bytes());
            return;
        }
        panic!("[WiFi] Unrecognized Xtensa write16 ${:08X}: ${:04X}", addr, value);
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        let addr = addr & MEMMAP_MASK;
        if (RAM_BASE..RAM_BASE + RAM_SIZE as u32).contains(&addr) {
            let i = (addr - RAM_BASE) as usize;
            self.ram[i..i + 4].copy_from_slice(&value.to_le_bytes());
            return;
        }

        if (0x8000..0x8080).contains(&addr) {
            trace!("[WiFi] Write32 Xtensa MC_TCAM_VALID ${:08X}: ${:08X}", addr, value);
            return;
        }
        if (0x18080..0x180A0).contains(&addr) {
            trace!("[WiFi] Write32 Xtensa WLAN_LOCAL_COUNT ${:08X}: ${:08X}", addr, value);
            return;
        }
        if (0x180A0..0x180C0).contains(&addr) {
            trace!("[WiFi] Write32 Xtensa WLAN_COUNT_INC ${:08X}: ${:08X}", addr, value);
            return;
        }

        match addr {
            0x04000 => {
                debug!("[WiFi] Write32 Xtensa SOC_RESET_CONTROL: ${:08X}", value);
                self.timers.reset();
            }
            // Assorted clock, power and LPO calibration registers.
            0x04014 | 0x04020 | 0x04028 | 0x04030 | 0x040C4 | 0x040D4 | 0x040D8 | 0x040DC
            | 0x040F0 | 0x04110 | 0x08200 | 0x14010 | 0x14048 | 0x180E4 => {}
            0x04048 | 0x04058 | 0x04068 | 0x04078 => {
                self.timers.write_target(((addr - 0x4048) / 0x10) as usize, value);
            }
            0x04050 | 0x04060 | 0x04070 | 0x04080 => {
                self.timers.write_ctrl(((addr - 0x4050) / 0x10) as usize, value);
            }
            0x04054 | 0x04064 | 0x04074 | 0x04084 => {
                self.timers.write_int_status(((addr - 0x4054) / 0x10) as usize, value);
            }
            0x04088 => self.timers.write_target(4, value),
            0x04094 => self.timers.write_ctrl(4, value),
            0x04098 => self.timers.write_int_status(4, value),
            0x18058 => {
                debug!("[WiFi] Write32 Xtensa WLAN_MBOX_INT_STATUS: ${:08X}", value);
                self.mbox_irq_stat &= !value;
            }
            0x1805C => {
                debug!("[WiFi] Write32 Xtensa WLAN_MBOX_INT_ENABLE: ${:08X}", value);
                self.mbox_irq_enable = value;
            }
            0x180C0 => trace!("[WiFi] Write32 Xtensa LOCAL_SCRATCH[0]: ${:08X}", value),
            _ => panic!("[WiFi] Unrecognized Xtensa write32 ${:08X}: ${:08X}", addr, value),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct SdioData32Irq {
    data32_mode: bool,
    tx32rq_irq_enable: bool,
    rx32rdy_irq_enable: bool,
}

#[derive(Clone, Copy, Default)]
struct BlockTransfer {
    addr: u32,
    func: u8,
    block_mode: bool,
    count: u32,
    inc_addr: bool,
    is_write: bool,
    active: bool,
}

pub struct WiFi {
    pub soc: WifiSoc,
    pub xtensa: Xtensa,
    lle: bool,

    // SDIO host registers.
    istat: u32,
    imask: u32,
    argument: u32,
    response: [u32; 4],
    block16_len: u16,
    data32_irq: SdioData32Irq,
    block: BlockTransfer,
    card_irq_stat: bool,
    card_irq_mask: bool,
    old_card_irq: bool,

    // Host-visible card registers.
    window_data: u32,
    window_read_addr: u32,
    window_write_addr: u32,
    eeprom: [u8; 0x400],
    mac: [u8; 6],
    bmi_done: bool,

    irq_f0_stat: u8,
    irq_f0_mask: u8,
    irq_f1_stat: u8,
    irq_f1_mask: u8,

    // Four TX and four RX single-byte FIFOs. Real hardware shares four
    // bidirectional mailboxes; splitting the directions keeps the BMI
    // plumbing straightforward.
    mbox: [VecDeque<u8>; 8],

    // Tagged-LZ upload stream state.
    lz_tag: u8,
    lz_addr: u32,
    doing_lz: bool,
}

impl WiFi {
    pub fn new() -> Self {
        WiFi {
            soc: WifiSoc::new(),
            xtensa: Xtensa::new(),
            lle: false,
            istat: 0,
            imask: 0,
            argument: 0,
            response: [0; 4],
            block16_len: 0,
            data32_irq: SdioData32Irq::default(),
            block: BlockTransfer::default(),
            card_irq_stat: false,
            card_irq_mask: false,
            old_card_irq: false,
            window_data: 0,
            window_read_addr: 0,
            window_write_addr: 0,
            eeprom: [0; 0x400],
            mac: [0; 6],
            bmi_done: false,
            irq_f0_stat: 0,
            irq_f0_mask: 0,
            irq_f1_stat: 0,
            irq_f1_mask: 0,
            mbox: Default::default(),
            lz_tag: 0,
            lz_addr: 0,
            doing_lz: false,
        }
    }

    pub fn set_lle(&mut self, lle: bool) {
        self.lle = lle;
    }

    pub fn reset(&mut self) {
        self.soc.reset();
        self.xtensa.reset();

        self.istat = 0;
        self.imask = 0;
        self.block = BlockTransfer::default();
        self.bmi_done = false;
        self.card_irq_mask = false;
        self.card_irq_stat = false;
        self.old_card_irq = false;
        self.doing_lz = false;

        for mbox in self.mbox.iter_mut() {
            mbox.clear();
        }

        for i in 0..6 {
            self.mac[i] = i as u8;
        }

        // Synthesize the calibration EEPROM: header, country code (USA),
        // MAC, capability flags and the XOR checksum the boot stub checks.
        self.eeprom = [0; 0x400];
        self.eeprom[0x0..0x4].copy_from_slice(&0x300u32.to_le_bytes());
        self.eeprom[0x8..0xA].copy_from_slice(&0x8348u16.to_le_bytes());
        self.eeprom[0xA..0x10].copy_from_slice(&self.mac);
        self.eeprom[0x10..0x14].copy_from_slice(&0x60000000u32.to_le_bytes());
        self.eeprom[0x3C..0xAC].iter_mut().for_each(|b| *b = 0xFF);
        self.eeprom[0x140..0x148].iter_mut().for_each(|b| *b = 0xFF);

        let mut checksum: u16 = 0xFFFF;
        for i in (0..0x300).step_by(2) {
            checksum ^= u16::from_le_bytes([self.eeprom[i], self.eeprom[i + 1]]);
        }
        self.eeprom[0x4..0x6].copy_from_slice(&checksum.to_le_bytes());

        self.irq_f0_mask = 0;
        self.irq_f0_stat = 0;
        self.irq_f1_mask = 0;
        self.irq_f1_stat = 0;
    }

    /// Steps the card's own CPU and timers; only meaningful in LLE mode.
    pub fn run(&mut self, cycles: u32) {
        if !self.lle {
            return;
        }
        let fired = self.soc.timers.run(cycles);
        for i in 0..5 {
            if fired & (1 << i) != 0 {
                self.send_xtensa_soc_irq(6 + i);
            }
        }
        self.xtensa.run(&mut self.soc, cycles);
    }

    fn do_sdio_cmd(&mut self, cmd: u8, pmr: &mut MpcorePmr, reqs: &mut DmaRequests, sched: &mut Scheduler) {
        debug!("[WiFi] CMD{} arg ${:08X}", cmd, self.argument);
        match cmd {
            52 => {
                self.sdio_io_direct(pmr, sched);
                self.command_end(pmr);
            }
            53 => self.sdio_io_extended(pmr, reqs),
            _ => panic!("[WiFi] Unrecognized SDIO CMD{}", cmd),
        }
    }

    fn sdio_io_direct(&mut self, pmr: &mut MpcorePmr, sched: &mut Scheduler) {
        let is_write = self.argument >> 31 != 0;
        let func = ((self.argument >> 28) & 0x7) as u8;
        let read_after_write = (self.argument >> 27) & 0x1 != 0;
        let addr = (self.argument >> 9) & 0x1FFFF;

        trace!("[WiFi] Single transfer - addr: {}:{:05X} write: {}", func, addr, is_write);

        let data = if is_write {
            let data = (self.argument & 0xFF) as u8;
            self.sdio_write_io(func, addr, data, pmr, sched);
            if read_after_write {
                self.sdio_read_io(func, addr, pmr)
            } else {
                data
            }
        } else {
            self.sdio_read_io(func, addr, pmr)
        };

        self.response[0] = data as u32 | 0x1000;
    }

    fn sdio_read_io(&mut self, func: u8, addr: u32, pmr: &mut MpcorePmr) -> u8 {
        match func {
            0 => self.sdio_read_f0(addr),
            1 => self.sdio_read_f1(addr, pmr),
            _ => {
                warn!("[WiFi] Unrecognized IO read {}:{:05X}", func, addr);
                0
            }
        }
    }

    fn sdio_read_f0(&mut self, addr: u32) -> u8 {
        if (0x01000..0x01100).contains(&addr) {
            return CIS0.get((addr & 0xFF) as usize).copied().unwrap_or(0);
        }
        if (0x01100..0x01200).contains(&addr) {
            return CIS1.get((addr & 0xFF) as usize).copied().unwrap_or(0);
        }
        match addr {
            // CCCR/SDIO revision.
            0x00000 => 0x11,
            // Function enable / ready: function 1 only.
            0x00002 => 0x02,
            0x00003 => 0x02,
            0x00004 => self.irq_f0_mask,
            0x00005 => self.irq_f0_stat,
            // Card capability.
            0x00008 => 0x17,
            // Common CIS pointer.
            0x00009 => 0,
            0x0000A => 0x10,
            0x0000B => 0,
            // Power control.
            0x00012 => 0x3,
            // Function 1 CIS pointer.
            0x00109 => 0,
            0x0010A => 0x11,
            0x0010B => 0,
            _ => {
                warn!("[WiFi] Unrecognized F0 read ${:05X}", addr);
                0
            }
        }
    }

    fn sdio_read_f1(&mut self, addr: u32, pmr: &mut MpcorePmr) -> u8 {
        if addr < 0x100 || (0x800..0x1000).contains(&addr) {
            let value = read8_mbox(&mut self.mbox[4]);
            self.check_f1_irq(pmr);
            return value;
        }
        match addr {
            0x00400 => self.irq_f1_stat,
            0x00405 => {
                let mut value = 0;
                for i in 0..4 {
                    value |= ((self.mbox[i + 4].len() >= 4) as u8) << i;
                }
                value
            }
            0x00408..=0x0040B => {
                // Peek at the first four bytes of RX mailbox 0.
                if self.mbox[4].len() >= 4 {
                    *self.mbox[4].iter().nth((addr - 0x00408) as usize).unwrap()
                } else {
                    0
                }
            }
            0x00418 => self.irq_f1_mask,
            0x00474 => self.window_data as u8,
            0x00475 => (self.window_data >> 8) as u8,
            0x00476 => (self.window_data >> 16) as u8,
            0x00477 => (self.window_data >> 24) as u8,
            _ => {
                warn!("[WiFi] Unrecognized F1 read ${:05X}", addr);
                0
            }
        }
    }

    fn sdio_write_io(&mut self, func: u8, addr: u32, value: u8, pmr: &mut MpcorePmr, sched: &mut Scheduler) {
        match func {
            0 => self.sdio_write_f0(addr, value, pmr),
            1 => self.sdio_write_f1(addr, value, pmr, sched),
            _ => warn!("[WiFi] Unrecognized IO write {}:{:05X}: ${:02X}", func, addr, value),
        }
    }

    fn sdio_write_f0(&mut self, addr: u32, value: u8, pmr: &mut MpcorePmr) {
        match addr {
            0x00004 => {
                debug!("[WiFi] Set F0 IRQ mask: ${:02X}", value);
                self.irq_f0_mask = value;
                self.check_f0_irq(pmr);
            }
            _ => warn!("[WiFi] Unrecognized F0 write ${:05X}: ${:02X}", addr, value),
        }
    }

    fn sdio_write_f1(&mut self, addr: u32, value: u8, pmr: &mut MpcorePmr, sched: &mut Scheduler) {
        if addr < 0x100 || (0x800..0x1000).contains(&addr) {
            write8_mbox(&mut self.mbox[0], value);
            // The last byte of the mailbox window commits the message.
            if addr == 0xFF || addr == 0xFFF {
                self.do_wifi_cmd(sched);
            }
            self.check_f1_irq(pmr);
            return;
        }
        match addr {
            0x00418 => {
                debug!("[WiFi] Set F1 IRQ mask: ${:02X}", value);
                self.irq_f1_mask = value;
                self.check_f1_irq(pmr);
            }
            0x00474 => self.window_data = (self.window_data & 0xFFFFFF00) | value as u32,
            0x00475 => self.window_data = (self.window_data & 0xFFFF00FF) | ((value as u32) << 8),
            0x00476 => self.window_data = (self.window_data & 0xFF00FFFF) | ((value as u32) << 16),
            0x00477 => self.window_data = (self.window_data & 0x00FFFFFF) | ((value as u32) << 24),
            0x00478 => {
                // The low byte commits the window write.
                self.window_write_addr = (self.window_write_addr & 0xFFFFFF00) | value as u32;
                let addr = self.window_write_addr;
                let data = self.window_data;
                self.write_window(addr, data);
            }
            0x00479 => {
                self.window_write_addr = (self.window_write_addr & 0xFFFF00FF) | ((value as u32) << 8)
            }
            0x0047A => {
                self.window_write_addr = (self.window_write_addr & 0xFF00FFFF) | ((value as u32) << 16)
            }
            0x0047B => {
                self.window_write_addr = (self.window_write_addr & 0x00FFFFFF) | ((value as u32) << 24)
            }
            0x0047C => {
                self.window_read_addr = (self.window_read_addr & 0xFFFFFF00) | value as u32;
                let addr = self.window_read_addr;
                self.window_data = self.read_window(addr);
            }
            0x0047D => {
                self.window_read_addr = (self.window_read_addr & 0xFFFF00FF) | ((value as u32) << 8)
            }
            0x0047E => {
                self.window_read_addr = (self.window_read_addr & 0xFF00FFFF) | ((value as u32) << 16)
            }
            0x0047F => {
                self.window_read_addr = (self.window_read_addr & 0x00FFFFFF) | ((value as u32) << 24)
            }
            _ => warn!("[WiFi] Unrecognized F1 write ${:05X}: ${:02X}", addr, value),
        }
    }

    fn sdio_io_extended(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) {
        self.block.is_write = self.argument >> 31 != 0;
        self.block.func = ((self.argument >> 28) & 0x7) as u8;
        self.block.block_mode = (self.argument >> 27) & 0x1 != 0;
        self.block.inc_addr = (self.argument >> 26) & 0x1 != 0;
        self.block.addr = (self.argument >> 9) & 0x1FFFF;
        self.block.count = self.argument & 0x1FF;
        self.block.active = true;

        debug!(
            "[WiFi] Block transfer - addr: {}:{:05X} count: ${:04X} write: {}",
            self.block.func, self.block.addr, self.block.count, self.block.is_write
        );

        self.response[0] = 0x2000;

        if self.block.block_mode {
            if self.block.count == 0 {
                panic!("[WiFi] Infinite block mode active");
            }
            self.block.count *= self.block16_len as u32;
        } else if self.block.count == 0 {
            self.block.count = 0x200;
        }

        self.command_end(pmr);

        if self.block.is_write {
            self.write_ready(pmr, reqs);
        } else {
            self.read_ready(pmr, reqs);
        }
    }

    fn command_end(&mut self, pmr: &mut MpcorePmr) {
        self.set_istat(0x1, pmr);
    }

    fn read_ready(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) {
        self.set_istat(1 << 24, pmr);
        reqs.set_cdma(CDMA_WIFI);
    }

    fn write_ready(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) {
        self.set_istat(1 << 25, pmr);
        reqs.set_cdma(CDMA_WIFI);
    }

    fn transfer_end(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) {
        self.block.active = false;
        self.istat &= !0x1;
        self.set_istat(1 << 2, pmr);
        self.command_end(pmr);
        reqs.clear_cdma(CDMA_WIFI);
    }

    fn set_istat(&mut self, value: u32, pmr: &mut MpcorePmr) {
        let old_istat = self.istat;
        self.istat |= value;
        if old_istat & self.imask == 0 && self.istat & self.imask != 0 {
            pmr.assert_hw_irq(IRQ_WIFI_SDIO);
        }
    }

    pub fn read_fifo16(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) -> u16 {
        if !self.block.active {
            panic!("[WiFi] FIFO read when block transfer not active");
        }
        let offset = self.block.inc_addr as u32;
        let mut transfer_amount = 1;
        let mut value = self.sdio_read_io(self.block.func, self.block.addr, pmr) as u16;
        if self.block.count > 1 {
            value |= (self.sdio_read_io(self.block.func, self.block.addr + offset, pmr) as u16) << 8;
            transfer_amount += 1;
        }

        self.block.addr += offset * transfer_amount;
        self.block.count -= transfer_amount;
        if self.block.count == 0 {
            self.transfer_end(pmr, reqs);
        } else {
            reqs.set_cdma(CDMA_WIFI);
        }
        value
    }

    pub fn write_fifo16(&mut self, value: u16, pmr: &mut MpcorePmr, reqs: &mut DmaRequests, sched: &mut Scheduler) {
        if !self.block.active {
            panic!("[WiFi] FIFO written when block transfer not active");
        }
        let offset = self.block.inc_addr as u32;
        let mut transfer_amount = 1;
        self.sdio_write_io(self.block.func, self.block.addr, value as u8, pmr, sched);
        if self.block.count > 1 {
            self.sdio_write_io(self.block.func, self.block.addr + offset, (value >> 8) as u8, pmr, sched);
            transfer_amount += 1;
        }

        self.block.addr += offset * transfer_amount;
        self.block.count -= transfer_amount;
        if self.block.count == 0 {
            self.transfer_end(pmr, reqs);
        } else {
            reqs.set_cdma(CDMA_WIFI);
        }
    }

    pub fn read_fifo32(&mut self, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) -> u32 {
        let mut value = self.read_fifo16(pmr, reqs) as u32;
        if self.block.active {
            value |= (self.read_fifo16(pmr, reqs) as u32) << 16;
        }
        value
    }

    pub fn write_fifo32(&mut self, value: u32, pmr: &mut MpcorePmr, reqs: &mut DmaRequests, sched: &mut Scheduler) {
        self.write_fifo16(value as u16, pmr, reqs, sched);
        if self.block.active {
            self.write_fifo16((value >> 16) as u16, pmr, reqs, sched);
        }
    }

    fn do_wifi_cmd(&mut self, sched: &mut Scheduler) {
        if self.lle {
            // Let the firmware see the mailbox interrupt instead.
            self.soc.mbox_irq_stat |= 1 << 12;
            if self.soc.mbox_irq_enable & (1 << 12) != 0 {
                self.send_xtensa_soc_irq(12);
            }
            return;
        }
        if !self.bmi_done {
            self.do_bmi_cmd();
        } else {
            self.do_wmi_cmd(sched);
        }
    }

    // Bootloader Messaging Interface: the commands NWM uses to upload and
    // start the card firmware.
    fn do_bmi_cmd(&mut self) {
        let cmd = read32_mbox(&mut self.mbox[0]);
        match cmd {
            0x1 => {
                info!("[WiFi] BMI_DONE");
                self.bmi_done = true;
                let ready = [0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00];
                self.send_wmi_reply(&ready, 0, 0, 0);
            }
            0x2 => {
                let addr = read32_mbox(&mut self.mbox[0]);
                let len = read32_mbox(&mut self.mbox[0]);
                debug!("[WiFi] BMI_READ_MEMORY ${:08X} ${:08X}", addr, len);

                let mut addr = (addr & MEMMAP_MASK).wrapping_sub(RAM_BASE);
                for _ in 0..len {
                    let value = self.soc.ram[addr as usize];
                    write8_mbox(&mut self.mbox[4], value);
                    addr += 1;
                }
            }
            0x3 => {
                let addr = read32_mbox(&mut self.mbox[0]);
                let len = read32_mbox(&mut self.mbox[0]);
                debug!("[WiFi] BMI_WRITE_MEMORY ${:08X} ${:08X}", addr, len);

                let mut addr = (addr & MEMMAP_MASK).wrapping_sub(RAM_BASE);
                for _ in 0..len {
                    let value = read8_mbox(&mut self.mbox[0]);
                    self.soc.ram[addr as usize] = value;
                    addr += 1;
                }
            }
            0x4 => {
                let addr = read32_mbox(&mut self.mbox[0]);
                let arg = read32_mbox(&mut self.mbox[0]);
                info!("[WiFi] BMI_EXECUTE ${:08X} ${:08X}", addr, arg);

                // Return value.
                write32_mbox(&mut self.mbox[4], 0);

                // The boot stub reads the EEPROM and stages it in RAM.
                self.write_window(0x520054, 0x530000);
                self.write_window(0x520058, 0x1);
                let eeprom = self.eeprom;
                self.soc.ram[0x10000..0x10300].copy_from_slice(&eeprom[..0x300]);
            }
            0x6 => {
                let addr = read32_mbox(&mut self.mbox[0]);
                debug!("[WiFi] BMI_READ_SOC_REGISTER ${:08X}", addr);
                let value = self.read_window(addr);
                write32_mbox(&mut self.mbox[4], value);
            }
            0x7 => {
                let addr = read32_mbox(&mut self.mbox[0]);
                let value = read32_mbox(&mut self.mbox[0]);
                debug!("[WiFi] BMI_WRITE_SOC_REGISTER ${:08X}: ${:08X}", addr, value);
                self.write_window(addr, value);
            }
            0x8 => {
                debug!("[WiFi] BMI_GET_TARGET_INFO");
                write32_mbox(&mut self.mbox[4], 0xFFFFFFFF);
                write32_mbox(&mut self.mbox[4], 0x0000000C);
                write32_mbox(&mut self.mbox[4], 0x230000B3);
                write32_mbox(&mut self.mbox[4], 0x00000002);
            }
            0xD => {
                let addr = read32_mbox(&mut self.mbox[0]);
                self.lz_addr = (addr & MEMMAP_MASK).wrapping_sub(RAM_BASE);
                debug!("[WiFi] BMI_LZ_STREAM_START: ${:08X}", self.lz_addr);
                self.doing_lz = false;
            }
            0xE => {
                let len = read32_mbox(&mut self.mbox[0]);
                debug!("[WiFi] BMI_LZ_STREAM_DATA: ${:08X}", len);
                self.lz_stream_data(len);
            }
            _ => panic!("[WiFi] Unrecognized BMI command ${:02X}", cmd),
        }
    }

    fn lz_stream_data(&mut self, mut len: u32) {
        if !self.doing_lz {
            self.doing_lz = true;
            self.lz_tag = read8_mbox(&mut self.mbox[0]);
            len -= 1;
        }

        while len != 0 {
            let value = read8_mbox(&mut self.mbox[0]);
            if value == self.lz_tag {
                let mut temp = read8_mbox(&mut self.mbox[0]);
                let mut bytes = temp as u32;
                while temp & 0x80 != 0 {
                    bytes &= !0x80;
                    bytes <<= 7;
                    temp = read8_mbox(&mut self.mbox[0]);
                    bytes |= temp as u32;
                    len = len.wrapping_sub(1);
                }

                temp = read8_mbox(&mut self.mbox[0]);
                let mut offset = temp as u32;
                while temp & 0x80 != 0 {
                    offset &= !0x80;
                    offset <<= 7;
                    temp = read8_mbox(&mut self.mbox[0]);
                    offset |= temp as u32;
                    len = len.wrapping_sub(1);
                }
                len = len.wrapping_sub(3);

                if bytes == 0 {
                    panic!("[WiFi] Zero-length LZ back-reference");
                }
                for _ in 0..bytes {
                    self.soc.ram[self.lz_addr as usize] =
                        self.soc.ram[(self.lz_addr - offset) as usize];
                    self.lz_addr += 1;
                }
            } else {
                self.soc.ram[self.lz_addr as usize] = value;
                self.lz_addr += 1;
                len -= 1;
            }
        }
    }

    fn do_wmi_cmd(&mut self, sched: &mut Scheduler) {
        let _header = read16_mbox(&mut self.mbox[0]);
        let _len = read16_mbox(&mut self.mbox[0]);
        let _header2 = read16_mbox(&mut self.mbox[0]);
        let cmd = read16_mbox(&mut self.mbox[0]);

        match cmd {
            0x0002 => {
                // RECONNECT: acknowledge the service with its endpoint.
                let service = read16_mbox(&mut self.mbox[0]);
                let flags = read16_mbox(&mut self.mbox[0]);

                let mut reply = [0u8; 10];
                reply[0..2].copy_from_slice(&0x0003u16.to_le_bytes());
                reply[2..4].copy_from_slice(&service.to_le_bytes());
                reply[5] = (service & 0xFF) as u8 + 1;
                reply[6..10].copy_from_slice(&0x00010001u32.to_le_bytes());

                self.send_wmi_reply(&reply, 0, 0, 0);
                debug!("[WiFi] WMI_RECONNECT: ${:04X} ${:04X}", service, flags);
            }
            0x0004 => {
                // SYNCHRONIZE: the READY event now, the channel list a
                // little later through the scheduler.
                let mut reply = [0u8; 18];
                reply[0..2].copy_from_slice(&0x1001u16.to_le_bytes());
                reply[2..8].copy_from_slice(&self.mac);
                reply[8..10].copy_from_slice(&0x0602u16.to_le_bytes());
                reply[10..14].copy_from_slice(&0x230000ECu32.to_le_bytes());

                self.send_wmi_reply(&reply, 1, 0, 0);
                sched.add_event(Event::WifiChannelList, WMI_REPLY_DELAY);
                debug!("[WiFi] WMI_SYNCHRONIZE");
            }
            _ => panic!("[WiFi] Unrecognized WMI command ${:02X}", cmd),
        }

        // Whatever trails the command is discarded.
        self.mbox[0].clear();
    }

    /// The deferred half of WMI_SYNCHRONIZE.
    pub fn wmi_channel_list(&mut self, pmr: &mut MpcorePmr) {
        let mut reply = [0u8; 8];
        reply[0..2].copy_from_slice(&0x000Eu16.to_le_bytes());
        reply[4..8].copy_from_slice(&1u32.to_le_bytes());

        self.send_wmi_reply(&reply, 1, 0, 0);
        self.check_f1_irq(pmr);
    }

    fn send_wmi_reply(&mut self, reply: &[u8], eid: u8, flag: u8, ctrl: u16) {
        let mut total_len = reply.len() as u32 + 6;

        write8_mbox(&mut self.mbox[4], eid);
        write8_mbox(&mut self.mbox[4], flag);
        write16_mbox(&mut self.mbox[4], reply.len() as u16);
        write16_mbox(&mut self.mbox[4], ctrl);

        for &b in reply {
            write8_mbox(&mut self.mbox[4], b);
        }

        if flag & 0x2 != 0 {
            // Trailer.
            total_len += ctrl as u32;
            for _ in 0..ctrl {
                write8_mbox(&mut self.mbox[4], 0);
            }
        }

        // Pad the frame out to a 128-byte boundary.
        while total_len & 0x7F != 0 {
            write8_mbox(&mut self.mbox[4], 0);
            total_len += 1;
        }
    }

    fn send_xtensa_soc_irq(&mut self, id: usize) {
        self.soc.xtensa_irq_stat |= 1 << id;
        self.xtensa.send_irq(16 - id);
    }

    fn check_card_irq(&mut self, pmr: &mut MpcorePmr) {
        let new_card_irq = self.card_irq_stat && !self.card_irq_mask;
        if !self.old_card_irq && new_card_irq {
            debug!("[WiFi] Card IRQ");
            pmr.assert_hw_irq(IRQ_WIFI_SDIO);
        }
        self.old_card_irq = new_card_irq;
    }

    fn check_f0_irq(&mut self, pmr: &mut MpcorePmr) {
        self.irq_f0_stat = 0;
        if self.irq_f1_stat & self.irq_f1_mask != 0 {
            self.irq_f0_stat |= 1 << 1;
        }
        if self.irq_f0_mask & 0x1 != 0 {
            self.card_irq_stat = self.irq_f0_mask & self.irq_f0_stat != 0;
        }
        self.check_card_irq(pmr);
    }

    fn check_f1_irq(&mut self, pmr: &mut MpcorePmr) {
        self.irq_f1_stat = 0;
        for i in 0..4 {
            self.irq_f1_stat |= ((!self.mbox[i + 4].is_empty()) as u8) << i;
        }
        self.check_f0_irq(pmr);
    }

    fn read_window(&mut self, addr: u32) -> u32 {
        trace!("[WiFi] Read window ${:08X}", addr);
        self.soc.read32(addr)
    }

    fn write_window(&mut self, addr: u32, value: u32) {
        trace!("[WiFi] Write window ${:08X}: ${:08X}", addr, value);
        if addr == 2 {
            return;
        }
        self.soc.write32(addr, value);
    }

    pub fn read16(&mut self, addr: u32, pmr: &mut MpcorePmr, reqs: &mut DmaRequests) -> u16 {
        let addr = addr & 0xFFF;
        if (0x00C..0x01C).contains(&addr) {
            let index = (((addr - 0x00C) / 4) & 0x3) as usize;
            if addr % 4 == 2 {
                return (self.response[index] >> 16) as u16;
            }
            return self.response[index] as u16;
        }
        match addr {
            0x01C => {
                let mut reg = (self.istat & 0xFFFF) as u16;
                // Always inserted.
                reg |= 1 << 5;
                reg
            }
            0x01E => (self.istat >> 16) as u16,
            0x020 => (self.imask & 0xFFFF) as u16,
            0x022 => (self.imask >> 16) as u16,
            0x026 => self.block16_len,
            // Error status.
            0x02C | 0x02E => 0,
            0x030 => self.read_fifo16(pmr, reqs),
            0x036 => self.card_irq_stat as u16,
            0x038 => self.card_irq_mask as u16,
            0x100 => {
                let mut reg = (self.data32_irq.data32_mode as u16) << 1;
                reg |= (self.data32_irq.rx32rdy_irq_enable as u16) << 11;
                reg |= (self.data32_irq.tx32rq_irq_enable as u16) << 12;
                reg
            }
            _ => {
                warn!("[WiFi] Unrecognized read16 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write16(
        &mut self,
        addr: u32,
        value: u16,
        pmr: &mut MpcorePmr,
        reqs: &mut DmaRequests,
        sched: &mut Scheduler,
    ) {
        let addr = addr & 0xFFF;
        match addr {
            0x000 => self.do_sdio_cmd((value & 0x3F) as u8, pmr, reqs, sched),
            0x004 => self.argument = (self.argument & !0xFFFF) | value as u32,
            0x006 => self.argument = (self.argument & 0xFFFF) | ((value as u32) << 16),
            0x01C => self.istat &= value as u32 | (self.istat & 0xFFFF0000),
            0x01E => self.istat &= ((value as u32) << 16) | (self.istat & 0xFFFF),
            0x020 => {
                self.imask = (self.imask & !0xFFFF) | value as u32;
                debug!("[WiFi] Write IMASK_L: ${:04X}", value);
            }
            0x022 => {
                self.imask = (self.imask & 0xFFFF) | ((value as u32) << 16);
                debug!("[WiFi] Write IMASK_H: ${:04X}", value);
            }
            0x026 => self.block16_len = value.min(0x200),
            0x030 => self.write_fifo16(value, pmr, reqs, sched),
            0x036 => {
                self.card_irq_stat &= value & 0x1 == 0;
                self.old_card_irq = false;
            }
            0x038 => {
                debug!("[WiFi] Card IRQ mask: ${:04X}", value);
                self.card_irq_mask = value & 0x1 != 0;
                self.check_card_irq(pmr);
            }
            0x100 => {
                self.data32_irq.data32_mode = (value >> 1) & 0x1 != 0;
                self.data32_irq.rx32rdy_irq_enable = (value >> 11) & 0x1 != 0;
                self.data32_irq.tx32rq_irq_enable = (value >> 12) & 0x1 != 0;
            }
            _ => warn!("[WiFi] Unrecognized write16 ${:08X}: ${:04X}", addr, value),
        }
    }
}

// The Tensilica LX core inside the WiFi chip. The register window over the
// 1024-entry address register file rotates in units of four registers;
// window_base therefore ranges over 0..256 and window_start needs one bit
// per possible frame.

use crate::wifi::WifiSoc;
use crate::xtensa_interpreter;
use log::{debug, warn};

pub const RESET_PC: u32 = 0x8E0000;

const VECTOR_LEVEL1: u32 = 0x8E0720;
const VECTOR_LEVEL2: u32 = 0x8E0920;
const VECTOR_LEVEL3: u32 = 0x8E0A20;

#[derive(Clone, Copy, Default)]
pub struct XtensaPs {
    pub int_level: u8,
    pub exception: bool,
    pub user_vector_mode: bool,
    pub ring: u8,
    pub old_window_base: u8,
    pub call_inc: u8,
    pub window_overflow_detection: bool,
}

pub struct Xtensa {
    pc: u32,
    gpr: [u32; 1024],

    lbeg: u32,
    lend: u32,
    lcount: u32,
    sar: u32,
    litbase: u32,

    ps: XtensaPs,
    eps: [XtensaPs; 7],
    epc: [u32; 7],
    excsave: [u32; 7],

    window_base: u32,
    window_start: [u64; 4],

    intenable: u32,
    interrupt: u32,
    halted: bool,
}

impl Xtensa {
    pub fn new() -> Self {
        Xtensa {
            pc: RESET_PC,
            gpr: [0; 1024],
            lbeg: 0,
            lend: 0,
            lcount: 0,
            sar: 0,
            litbase: 0,
            ps: XtensaPs::default(),
            eps: [XtensaPs::default(); 7],
            epc: [0; 7],
            excsave: [0; 7],
            window_base: 0,
            window_start: [0; 4],
            intenable: 0,
            interrupt: 0,
            halted: false,
        }
    }

    pub fn reset(&mut self) {
        // Entry point in the ROM.
        self.pc = RESET_PC;
        self.window_base = 0;
        self.window_start = [0; 4];
        self.halted = false;
        self.ps = XtensaPs::default();
        self.intenable = 0;
        self.interrupt = 0;
        self.litbase = 0;
        self.lcount = 0;
    }

    pub fn run(&mut self, soc: &mut WifiSoc, mut cycles: u32) {
        while !self.halted && cycles > 0 {
            cycles -= 1;
            let instr = self.fetch_word(soc) as u32;
            xtensa_interpreter::interpret(self, soc, instr);

            if self.lcount > 0 && self.pc == self.lend {
                // Looping is disabled while an exception is live.
                if !self.ps.exception {
                    self.pc = self.lbeg;
                    self.lcount -= 1;
                }
            }
        }
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn unhalt(&mut self) {
        self.halted = false;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn fetch_byte(&mut self, soc: &mut WifiSoc) -> u8 {
        let value = soc.read8(self.pc);
        self.pc += 1;
        value
    }

    pub fn fetch_word(&mut self, soc: &mut WifiSoc) -> u16 {
        let value = soc.read16(self.pc);
        self.pc += 2;
        value
    }

    pub fn read8(&mut self, soc: &mut WifiSoc, addr: u32) -> u8 {
        soc.read8(addr)
    }

    pub fn read16(&mut self, soc: &mut WifiSoc, addr: u32) -> u16 {
        if addr & 0x1 != 0 {
            panic!("[Xtensa] Invalid read16 ${:08X}", addr);
        }
        soc.read16(addr)
    }

    pub fn read32(&mut self, soc: &mut WifiSoc, addr: u32) -> u32 {
        if addr & 0x3 != 0 {
            panic!("[Xtensa] Invalid read32 ${:08X}", addr);
        }
        soc.read32(addr)
    }

    pub fn write8(&mut self, soc: &mut WifiSoc, addr: u32, value: u8) {
        soc.write8(addr, value);
    }

    pub fn write16(&mut self, soc: &mut WifiSoc, addr: u32, value: u16) {
        if addr & 0x1 != 0 {
            panic!("[Xtensa] Invalid write16 ${:08X}: ${:04X}", addr, value);
        }
        soc.write16(addr, value);
    }

    pub fn write32(&mut self, soc: &mut WifiSoc, addr: u32, value: u32) {
        if addr & 0x3 != 0 {
            panic!("[Xtensa] Invalid write32 ${:08X}: ${:08X}", addr, value);
        }
        soc.write32(addr, value);
    }

    /// Level-latches the interrupt and, when enabled and of higher priority
    /// than the current level, vectors immediately.
    pub fn send_irq(&mut self, id: usize) {
        let (level, vector) = if id == 0 {
            (1, VECTOR_LEVEL1)
        } else if id < 15 {
            (2, VECTOR_LEVEL2)
        } else {
            (3, VECTOR_LEVEL3)
        };
        self.interrupt |= 1 << id;
        if self.intenable & (1 << id) != 0 && (self.ps.int_level as u32) < level {
            self.epc[level as usize - 1] = self.pc;
            self.eps[level as usize - 1] = self.ps;
            self.ps.int_level = level as u8;
            self.ps.exception = true;
            self.pc = vector;
            self.unhalt();
        }
    }

    pub fn clear_irq(&mut self, id: usize) {
        self.interrupt &= !(1 << id);
    }

    pub fn jp(&mut self, addr: u32) {
        self.pc = addr;
    }

    pub fn branch(&mut self, offset: i32) {
        self.pc = self.pc.wrapping_add(offset as u32);
    }

    pub fn get_pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn get_gpr(&self, index: usize) -> u32 {
        self.gpr[index + (self.window_base as usize) * 4]
    }

    pub fn set_gpr(&mut self, index: usize, value: u32) {
        self.gpr[index + (self.window_base as usize) * 4] = value;
    }

    pub fn extended_l32r(&self) -> bool {
        self.litbase & 0x1 != 0
    }

    pub fn get_litbase(&self) -> u32 {
        self.litbase & !0xFFF
    }

    pub fn get_sar(&self) -> u32 {
        self.sar
    }

    pub fn set_sar(&mut self, value: u32) {
        self.sar = value;
    }

    pub fn get_ps(&self) -> u32 {
        let mut reg = self.ps.int_level as u32;
        reg |= (self.ps.exception as u32) << 4;
        reg |= (self.ps.user_vector_mode as u32) << 5;
        reg |= (self.ps.ring as u32) << 6;
        reg |= (self.ps.old_window_base as u32) << 8;
        reg |= (self.ps.call_inc as u32) << 16;
        reg |= (self.ps.window_overflow_detection as u32) << 18;
        reg
    }

    pub fn set_ps(&mut self, value: u32) {
        self.ps.int_level = (value & 0xF) as u8;
        self.ps.exception = (value >> 4) & 0x1 != 0;
        self.ps.user_vector_mode = (value >> 5) & 0x1 != 0;
        self.ps.ring = ((value >> 6) & 0x3) as u8;
        self.ps.old_window_base = ((value >> 8) & 0xF) as u8;
        self.ps.call_inc = ((value >> 16) & 0x3) as u8;
        self.ps.window_overflow_detection = (value >> 18) & 0x1 != 0;
    }

    pub fn get_xsr(&self, index: usize) -> u32 {
        match index {
            0 => self.lbeg,
            1 => self.lend,
            2 => self.lcount,
            3 => self.sar,
            5 => self.litbase,
            72 => self.window_base,
            73 => self.window_start[0] as u32,
            177..=183 => self.epc[index - 177],
            209..=215 => self.excsave[index - 209],
            226 => self.interrupt,
            228 => self.intenable,
            230 => self.get_ps(),
            _ => {
                warn!("[Xtensa] Unrecognized XSR {} in get_xsr", index);
                0
            }
        }
    }

    pub fn set_xsr(&mut self, index: usize, value: u32) {
        match index {
            0 => self.lbeg = value,
            1 => self.lend = value,
            2 => self.lcount = value,
            3 => self.sar = value & 0x1F,
            5 => self.litbase = value,
            72 => self.window_base = value & 0xFF,
            73 => self.window_start[0] = (self.window_start[0] & !0xFFFFFFFF) | value as u64,
            177..=183 => self.epc[index - 177] = value,
            // The ROM stashes its exception vectors in EXCSAVE slots.
            209..=215 => self.excsave[index - 209] = value,
            227 => {
                debug!("[Xtensa] Clear interrupt ${:08X}", value);
                self.interrupt &= !value;
            }
            228 => {
                debug!("[Xtensa] Int enable: ${:08X}", value);
                self.intenable = value;
            }
            230 => self.set_ps(value),
            _ => warn!("[Xtensa] Unrecognized XSR {} in set_xsr (${:08X})", index, value),
        }
    }

    pub fn setup_loop(&mut self, count: i32, offset: u32, cond: bool) {
        self.lcount = if count > 0 { (count - 1) as u32 } else { 0 };
        self.lbeg = self.pc;
        self.lend = self.pc + offset + 1;
        if !cond {
            self.pc = self.lend;
        }
    }

    pub fn windowed_call(&mut self, addr: u32, inc: u8) {
        self.set_gpr((inc as usize) << 2, (self.pc & 0x3FFFFFFF) | ((inc as u32) << 30));
        self.ps.call_inc = inc;
        self.pc = addr;
    }

    fn window_start_set(&mut self, frame: u32, live: bool) {
        let index = (frame / 64) as usize;
        let bit = frame & 0x3F;
        if live {
            self.window_start[index] |= 1 << bit;
        } else {
            self.window_start[index] &= !(1 << bit);
        }
    }

    pub fn entry(&mut self, sp: usize, frame: u32) {
        if self.window_base + self.ps.call_inc as u32 >= 256 {
            panic!("[Xtensa] Window overflow exception");
        }
        let old_sp = self.get_gpr(sp);
        self.set_gpr(sp | ((self.ps.call_inc as usize) << 2), old_sp.wrapping_sub(frame));
        self.window_base += self.ps.call_inc as u32;
        self.window_start_set(self.window_base, true);
    }

    pub fn windowed_ret(&mut self) {
        let n = self.get_gpr(0) >> 30;
        let new_pc = (self.get_gpr(0) & 0x3FFFFFFF) | (self.pc & !0x3FFFFFFF);

        let owb = self.window_base;
        match self.window_base.checked_sub(n) {
            Some(0) | None => panic!("[Xtensa] Window underflow exception"),
            Some(base) => {
                self.window_base = base;
                self.window_start_set(owb, false);
            }
        }
        self.pc = new_pc;
    }

    pub fn rfi(&mut self, level: usize) {
        self.pc = self.epc[level];
        self.ps = self.eps[level];
    }
}

// Two timer families share this module: the four cascadable ARM9
// up-counters, and the ARM11 MPCore private timers/watchdogs reached
// through the PMR window. Both are stepped once per tick-loop iteration.

use crate::interrupt9::{Interrupt9, IRQ_TIMER0};
use crate::mpcore::{MpcorePmr, IRQ_PRIVATE_TIMER, IRQ_WATCHDOG};
use log::{debug, trace, warn};

const PRESCALER_VALUES: [u32; 4] = [1, 64, 256, 1024];

#[derive(Clone, Copy, Default)]
struct Arm9Timer {
    counter: u32,
    clocks: u32,
    prescaler: u32,
    countup: bool,
    overflow_irq: bool,
    enabled: bool,
}

// MPCore private timers count down; writing the load register also
// reloads the counter.
#[derive(Clone, Copy, Default)]
struct Arm11Timer {
    load: u32,
    counter: u32,
    clocks: u32,
    prescaler: u32,
    auto_reload: bool,
    irq_enable: bool,
    enabled: bool,
    int_status: bool,
}

pub struct Timers {
    arm9_timers: [Arm9Timer; 4],
    // 0-3: per-core private timers, 4-7: per-core watchdogs.
    arm11_timers: [Arm11Timer; 8],
}

impl Timers {
    pub fn new() -> Self {
        Timers { arm9_timers: [Arm9Timer::default(); 4], arm11_timers: [Arm11Timer::default(); 8] }
    }

    pub fn reset(&mut self) {
        self.arm9_timers = [Arm9Timer::default(); 4];
        self.arm11_timers = [Arm11Timer::default(); 8];
    }

    pub fn run(&mut self, int9: &mut Interrupt9, pmr: &mut MpcorePmr) {
        for i in 0..4 {
            if self.arm9_timers[i].enabled && !self.arm9_timers[i].countup {
                self.arm9_timers[i].clocks += 1;
                if self.arm9_timers[i].clocks >= self.arm9_timers[i].prescaler {
                    self.arm9_timers[i].clocks -= self.arm9_timers[i].prescaler;
                    self.arm9_timers[i].counter += 1;
                    if self.arm9_timers[i].counter >= 0x10000 {
                        self.handle_overflow(i, int9);
                    }
                }
            }
        }

        for i in 0..8 {
            let timer = &mut self.arm11_timers[i];
            if !timer.enabled || timer.counter == 0 {
                continue;
            }
            timer.clocks += 1;
            if timer.clocks <= timer.prescaler {
                continue;
            }
            timer.clocks = 0;
            timer.counter -= 1;
            if timer.counter == 0 {
                timer.int_status = true;
                if timer.auto_reload {
                    timer.counter = timer.load;
                }
                if timer.irq_enable {
                    let core = i & 0x3;
                    let id = if i < 4 { IRQ_PRIVATE_TIMER } else { IRQ_WATCHDOG };
                    debug!("[Timer11] Timer{} expired on core {}", i, core);
                    pmr.set_pending_irq(core, id, core);
                }
            }
        }
    }

    fn handle_overflow(&mut self, index: usize, int9: &mut Interrupt9) {
        self.arm9_timers[index].counter -= 0x10000;
        trace!("[Timer9] Overflow on timer {}!", index);
        if self.arm9_timers[index].overflow_irq {
            int9.assert_irq(IRQ_TIMER0 + index);
        }

        // Count-up cascade: timer N+1 ticks once per overflow of timer N,
        // bypassing its own prescaler.
        if index != 3 {
            let child = &mut self.arm9_timers[index + 1];
            if child.countup && child.enabled {
                child.counter += 1;
                if child.counter >= 0x10000 {
                    self.handle_overflow(index + 1, int9);
                }
            }
        }
    }

    pub fn arm9_read16(&self, addr: u32) -> u16 {
        let index = ((addr >> 2) & 0x3) as usize;
        match addr & 0xF {
            0x0 | 0x4 | 0x8 | 0xC => self.arm9_timers[index].counter as u16,
            0x2 | 0x6 | 0xA | 0xE => self.get_control(index),
            _ => {
                warn!("[Timer9] Unrecognized read16 ${:08X}", addr);
                0
            }
        }
    }

    pub fn arm9_write16(&mut self, addr: u32, value: u16) {
        let index = ((addr >> 2) & 0x3) as usize;
        match addr & 0xF {
            0x0 | 0x4 | 0x8 | 0xC => self.set_counter(index, value),
            0x2 | 0x6 | 0xA | 0xE => self.set_control(index, value),
            _ => warn!("[Timer9] Unrecognized write16 ${:08X}: ${:04X}", addr, value),
        }
    }

    fn get_control(&self, index: usize) -> u16 {
        let timer = &self.arm9_timers[index];
        let mut reg = match timer.prescaler {
            64 => 1,
            256 => 2,
            1024 => 3,
            _ => 0,
        };
        reg |= (timer.countup as u16) << 2;
        reg |= (timer.overflow_irq as u16) << 6;
        reg |= (timer.enabled as u16) << 7;
        reg
    }

    fn set_counter(&mut self, index: usize, value: u16) {
        self.arm9_timers[index].clocks = 0;
        self.arm9_timers[index].counter = value as u32;
    }

    fn set_control(&mut self, index: usize, value: u16) {
        debug!("[Timer9] Set timer{} ctrl: ${:04X}", index, value);
        let timer = &mut self.arm9_timers[index];
        timer.clocks = 0;
        timer.prescaler = PRESCALER_VALUES[(value & 0x3) as usize];
        timer.countup = value & (1 << 2) != 0;
        timer.overflow_irq = value & (1 << 6) != 0;
        timer.enabled = value & (1 << 7) != 0;
    }

    pub fn arm11_get_load(&self, id: usize) -> u32 {
        self.arm11_timers[id].load
    }

    pub fn arm11_set_load(&mut self, id: usize, value: u32) {
        debug!("[Timer11] Set timer{} load: ${:08X}", id, value);
        self.arm11_timers[id].load = value;
        self.arm11_timers[id].counter = value;
    }

    pub fn arm11_get_counter(&self, id: usize) -> u32 {
        self.arm11_timers[id].counter
    }

    pub fn arm11_set_counter(&mut self, id: usize, value: u32) {
        self.arm11_timers[id].counter = value;
    }

    pub fn arm11_get_control(&self, id: usize) -> u32 {
        let timer = &self.arm11_timers[id];
        let mut reg = timer.enabled as u32;
        reg |= (timer.auto_reload as u32) << 1;
        reg |= (timer.irq_enable as u32) << 2;
        reg |= timer.prescaler << 8;
        reg
    }

    pub fn arm11_set_control(&mut self, id: usize, value: u32) {
        debug!("[Timer11] Set timer{} ctrl: ${:08X}", id, value);
        let timer = &mut self.arm11_timers[id];
        timer.enabled = value & 0x1 != 0;
        timer.auto_reload = value & (1 << 1) != 0;
        timer.irq_enable = value & (1 << 2) != 0;
        timer.prescaler = (value >> 8) & 0xFF;
        timer.clocks = 0;
    }

    pub fn arm11_get_int_status(&self, id: usize) -> u32 {
        self.arm11_timers[id].int_status as u32
    }

    /// Write-1-to-clear.
    pub fn arm11_set_int_status(&mut self, id: usize, value: u32) {
        if value & 0x1 != 0 {
            self.arm11_timers[id].int_status = false;
        }
    }
}

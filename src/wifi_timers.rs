// The five timers inside the WiFi SoC: four slow ones and a fast one whose
// target and count registers keep their value in bits 31:12.

use log::debug;

#[derive(Clone, Copy, Default)]
struct WifiTimer {
    target: u32,
    count: u32,
    auto_restart: bool,
    enabled: bool,
    int_status: bool,
}

pub struct WifiTimers {
    timers: [WifiTimer; 5],
}

impl WifiTimers {
    pub fn new() -> Self {
        WifiTimers { timers: [WifiTimer::default(); 5] }
    }

    pub fn reset(&mut self) {
        self.timers = [WifiTimer::default(); 5];
    }

    /// Advances all enabled timers; the returned bitmask holds the indices
    /// of timers that hit their target this pass. The SoC IRQ for timer i
    /// is 6 + i.
    pub fn run(&mut self, cycles: u32) -> u32 {
        let mut fired = 0;
        for (i, timer) in self.timers.iter_mut().enumerate() {
            if !timer.enabled {
                continue;
            }
            timer.count = timer.count.wrapping_add(cycles);
            if timer.count >= timer.target {
                // Edge-latched: one interrupt per expiry.
                if !timer.int_status {
                    fired |= 1 << i;
                }
                timer.int_status = true;
                if timer.auto_restart {
                    timer.count = 0;
                }
            }
        }
        fired
    }

    pub fn read_target(&self, index: usize) -> u32 {
        if index == 4 {
            return self.timers[index].target << 12;
        }
        self.timers[index].target
    }

    pub fn read_count(&self, index: usize) -> u32 {
        if index == 4 {
            return self.timers[index].count << 12;
        }
        self.timers[index].count
    }

    pub fn read_ctrl(&self, index: usize) -> u32 {
        let mut reg = 0;
        reg |= (self.timers[index].auto_restart as u32) << 1;
        reg |= (self.timers[index].enabled as u32) << 2;
        reg
    }

    pub fn read_int_status(&self, index: usize) -> u32 {
        self.timers[index].int_status as u32
    }

    pub fn write_int_status(&mut self, index: usize, value: u32) {
        debug!("[WiFi_Timers] Write int_status{}: ${:08X}", index, value);
        self.timers[index].int_status &= value & 0x1 != 0;
    }

    pub fn write_target(&mut self, index: usize, value: u32) {
        debug!("[WiFi_Timers] Write target{}: ${:08X}", index, value);
        let value = if index == 4 { value >> 12 } else { value };
        self.timers[index].target = value;
    }

    pub fn write_ctrl(&mut self, index: usize, value: u32) {
        debug!("[WiFi_Timers] Write ctrl{}: ${:08X}", index, value);
        if value & 0x1 != 0 {
            self.timers[index].count = 0;
        }
        self.timers[index].auto_restart = (value >> 1) & 0x1 != 0;
        self.timers[index].enabled = (value >> 2) & 0x1 != 0;
    }
}

// Emulator core for the 3DS boot chain: the two ARM clusters' buses and
// every peripheral the boot ROMs touch on their way through NAND
// verification. The CPU instruction decoders themselves stay behind the
// ArmCore trait; everything they talk to lives here.

use std::fs::File;

pub mod aes;
pub mod arm;
pub mod bus;
pub mod cartridge;
pub mod corelink;
pub mod emmc;
pub mod gpu;
pub mod interrupt9;
pub mod mpcore;
pub mod ndma;
pub mod pxi;
pub mod rsa;
pub mod scheduler;
pub mod sha;
pub mod spi;
pub mod timers;
pub mod wifi;
pub mod wifi_timers;
pub mod xtensa;
pub mod xtensa_interpreter;

use arm::{ArmCore, ParkedCore};
use bus::{Bus, BusView, CpuId};

/// The ARM9 lands here when the boot ROM rejects the OTP region.
pub const OTP_FAILURE_PC: u32 = 0xFFFF8298;

pub const ARM9_RESET_VECTOR: u32 = 0xFFFF0000;
pub const ARM11_RESET_VECTOR: u32 = 0x00000000;

const ARM11_CORES: usize = 4;

// How many tick-loop iterations one run_batch call executes. Only
// throughput depends on this; event ordering does not.
const CYCLES_PER_BATCH: usize = 200_000;

#[derive(Debug, PartialEq)]
pub enum Signal {
    Ok,
    OtpVerifyFailed,
}

pub struct Emulator {
    pub bus: Bus,
    pub arm9: Box<dyn ArmCore>,
    pub arm11: Vec<Box<dyn ArmCore>>,
}

impl Emulator {
    pub fn new() -> Emulator {
        let arm11: Vec<Box<dyn ArmCore>> =
            (0..ARM11_CORES).map(|_| Box::new(ParkedCore::new()) as Box<dyn ArmCore>).collect();
        Emulator { bus: Bus::new(), arm9: Box::new(ParkedCore::new()), arm11 }
    }

    /// Attaches a real ARM9 decoder in place of the parked core.
    pub fn set_arm9(&mut self, core: Box<dyn ArmCore>) {
        self.arm9 = core;
    }

    pub fn set_arm11(&mut self, index: usize, core: Box<dyn ArmCore>) {
        self.arm11[index] = core;
    }

    pub fn load_roms(&mut self, boot9: &[u8], boot11: &[u8], otp: &[u8]) {
        self.bus.load_roms(boot9, boot11, otp);
    }

    pub fn mount_nand(&mut self, file: File) {
        self.bus.emmc.mount_nand(file);
    }

    pub fn mount_sd(&mut self, file: File) {
        self.bus.emmc.mount_sd(file);
    }

    pub fn mount_cartridge(&mut self, file: File) {
        self.bus.cartridge.mount(file);
    }

    pub fn reset(&mut self) {
        self.bus.reset(ARM11_CORES);
        self.arm9.reset(ARM9_RESET_VECTOR);
        for core in self.arm11.iter_mut() {
            core.reset(ARM11_RESET_VECTOR);
        }
    }

    /// Advances the whole machine by one batch of ticks. Within each tick:
    /// ARM9, the ARM11 cores, the Corelink engines, NDMA arbitration,
    /// timers, the WiFi core and finally any scheduler events that came
    /// due.
    pub fn run_batch(&mut self) -> Signal {
        for _ in 0..CYCLES_PER_BATCH {
            self.arm9.step(&mut BusView::new(&mut self.bus, CpuId::Arm9));
            if self.arm9.pc().wrapping_sub(4) == OTP_FAILURE_PC {
                return Signal::OtpVerifyFailed;
            }
            for (i, core) in self.arm11.iter_mut().enumerate() {
                core.step(&mut BusView::new(&mut self.bus, CpuId::Arm11(i)));
            }

            self.bus.process_xdma();
            self.bus.process_cdma();
            self.bus.process_ndma();
            self.bus.run_timers();
            self.bus.run_wifi(1);

            self.bus.scheduler.advance(1);
            self.bus.run_events();

            self.arm9.set_int_signal(self.bus.int9.line());
            for (i, core) in self.arm11.iter_mut().enumerate() {
                core.set_int_signal(self.bus.pmr.int_line(i));
            }
        }
        Signal::Ok
    }
}

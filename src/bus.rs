// The system bus: one central decoder per CPU cluster, dispatching 8/16/32
// bit accesses to the owning device. The bus also owns every peripheral,
// the DMA engines and the scheduler, so cross-device side effects are
// expressed as short-lived mutable borrows of sibling fields rather than
// stored pointers. Widths never mix: a 32-bit access to a 16-bit register
// is simply an unmapped access.

use crate::aes::Aes;
use crate::cartridge::Cartridge;
use crate::corelink::{CorelinkDma, DmaPort};
use crate::emmc::Emmc;
use crate::gpu::Gpu;
use crate::interrupt9::{Interrupt9, IRQ_XDMA};
use crate::mpcore::{MpcorePmr, IRQ_CDMA};
use crate::ndma::{Ndma, NdmaKick, NDMA_AES2};
use crate::pxi::Pxi;
use crate::rsa::Rsa;
use crate::scheduler::{Event, Scheduler};
use crate::sha::Sha;
use crate::spi::Spi;
use crate::timers::Timers;
use crate::wifi::WiFi;
use log::{error, warn};

pub const BOOT_ROM_SIZE: usize = 1024 * 64;
pub const OTP_SIZE: usize = 256;
const ARM9_RAM_SIZE: usize = 1024 * 1024;
const AXI_RAM_SIZE: usize = 1024 * 512;

/// Latched DMA request lines, set and cleared by peripherals and consumed
/// by the engines during arbitration.
pub struct DmaRequests {
    pub ndma: [bool; 16],
    pub xdma: [bool; 32],
    pub cdma: [bool; 32],
}

impl DmaRequests {
    pub fn new() -> Self {
        DmaRequests { ndma: [false; 16], xdma: [false; 32], cdma: [false; 32] }
    }

    pub fn set_ndma(&mut self, req: usize) {
        self.ndma[req] = true;
    }

    pub fn clear_ndma(&mut self, req: usize) {
        self.ndma[req] = false;
    }

    pub fn set_xdma(&mut self, req: usize) {
        self.xdma[req] = true;
    }

    pub fn clear_xdma(&mut self, req: usize) {
        self.xdma[req] = false;
    }

    pub fn set_cdma(&mut self, req: usize) {
        self.cdma[req] = true;
    }

    pub fn clear_cdma(&mut self, req: usize) {
        self.cdma[req] = false;
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum CpuId {
    Arm9,
    Arm11(usize),
}

/// A short-lived window onto the bus from one CPU's point of view; this is
/// what an instruction decoder gets handed for the duration of a step.
pub struct BusView<'a> {
    bus: &'a mut Bus,
    cpu: CpuId,
}

impl<'a> BusView<'a> {
    pub fn new(bus: &'a mut Bus, cpu: CpuId) -> Self {
        BusView { bus, cpu }
    }

    pub fn read8(&mut self, addr: u32) -> u8 {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_read8(addr),
            CpuId::Arm11(core) => self.bus.arm11_read8(core, addr),
        }
    }

    pub fn read16(&mut self, addr: u32) -> u16 {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_read16(addr),
            CpuId::Arm11(core) => self.bus.arm11_read16(core, addr),
        }
    }

    pub fn read32(&mut self, addr: u32) -> u32 {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_read32(addr),
            CpuId::Arm11(core) => self.bus.arm11_read32(core, addr),
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_write8(addr, value),
            CpuId::Arm11(core) => self.bus.arm11_write8(core, addr, value),
        }
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_write16(addr, value),
            CpuId::Arm11(core) => self.bus.arm11_write16(core, addr, value),
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        match self.cpu {
            CpuId::Arm9 => self.bus.arm9_write32(addr, value),
            CpuId::Arm11(core) => self.bus.arm11_write32(core, addr, value),
        }
    }
}

fn invalid_read(side: &str, width: u8, addr: u32) -> u32 {
    if cfg!(debug_assertions) {
        panic!("[{}] Invalid read{} ${:08X}", side, width, addr);
    }
    error!("[{}] Invalid read{} ${:08X}", side, width, addr);
    0
}

fn invalid_write(side: &str, width: u8, addr: u32, value: u32) {
    if cfg!(debug_assertions) {
        panic!("[{}] Invalid write{} ${:08X}: ${:08X}", side, width, addr, value);
    }
    error!("[{}] Invalid write{} ${:08X}: ${:08X}", side, width, addr, value);
}

fn read16_le(mem: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([mem[index], mem[index + 1]])
}

fn read32_le(mem: &[u8], index: usize) -> u32 {
    u32::from_le_bytes([mem[index], mem[index + 1], mem[index + 2], mem[index + 3]])
}

fn write16_le(mem: &mut [u8], index: usize, value: u16) {
    mem[index..index + 2].copy_from_slice(&value.to_le_bytes());
}

fn write32_le(mem: &mut [u8], index: usize, value: u32) {
    mem[index..index + 4].copy_from_slice(&value.to_le_bytes());
}

pub struct Bus {
    pub boot9: Vec<u8>,
    pub boot11: Vec<u8>,
    pub otp: Vec<u8>,
    pub arm9_ram: Vec<u8>,
    pub axi_ram: Vec<u8>,
    sysprot9: u8,
    sysprot11: u8,

    pub int9: Interrupt9,
    pub pmr: MpcorePmr,
    pub timers: Timers,
    pub ndma: Ndma,
    pub xdma: CorelinkDma,
    pub cdma: CorelinkDma,
    pub emmc: Emmc,
    pub aes: Aes,
    pub sha: Sha,
    pub rsa: Rsa,
    pub cartridge: Cartridge,
    pub spi: Spi,
    pub pxi: Pxi,
    pub wifi: WiFi,
    pub gpu: Gpu,
    pub scheduler: Scheduler,
    pub reqs: DmaRequests,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            boot9: vec![0; BOOT_ROM_SIZE],
            boot11: vec![0; BOOT_ROM_SIZE],
            otp: vec![0; OTP_SIZE],
            arm9_ram: vec![0; ARM9_RAM_SIZE],
            axi_ram: vec![0; AXI_RAM_SIZE],
            sysprot9: 0,
            sysprot11: 0,
            int9: Interrupt9::new(),
            pmr: MpcorePmr::new(),
            timers: Timers::new(),
            ndma: Ndma::new(),
            xdma: CorelinkDma::new("XDMA"),
            cdma: CorelinkDma::new("CDMA"),
            emmc: Emmc::new(),
            aes: Aes::new(),
            sha: Sha::new(),
            rsa: Rsa::new(),
            cartridge: Cartridge::new(),
            spi: Spi::new(),
            pxi: Pxi::new(),
            wifi: WiFi::new(),
            gpu: Gpu::new(),
            scheduler: Scheduler::new(),
            reqs: DmaRequests::new(),
        }
    }

    pub fn reset(&mut self, core_count: usize) {
        self.sysprot9 = 0;
        self.sysprot11 = 0;
        self.int9.reset();
        self.pmr.reset(core_count);
        self.timers.reset();
        self.ndma.reset();
        self.xdma.reset();
        self.cdma.reset();
        self.emmc.reset();
        self.aes.reset();
        self.sha.reset();
        self.rsa.reset();
        self.cartridge.reset();
        self.spi.reset();
        self.pxi.reset();
        self.wifi.reset();
        self.gpu.reset();
        self.scheduler.reset();
        self.reqs = DmaRequests::new();
    }

    pub fn load_roms(&mut self, boot9: &[u8], boot11: &[u8], otp: &[u8]) {
        self.boot9.copy_from_slice(boot9);
        self.boot11.copy_from_slice(boot11);
        self.otp.copy_from_slice(otp);
    }

    // ---- ARM9 view ----

    pub fn arm9_read8(&mut self, addr: u32) -> u8 {
        if addr >= 0xFFFF0000 {
            return self.boot9[(addr & 0xFFFF) as usize];
        }
        if (0x08000000..0x08100000).contains(&addr) {
            return self.arm9_ram[(addr & 0xFFFFF) as usize];
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return self.axi_ram[(addr & 0x7FFFF) as usize];
        }
        if (0x1000A040..0x1000A080).contains(&addr) {
            return self.sha.read_hash(addr);
        }
        if (0x1000B000..0x1000C000).contains(&addr) {
            return self.rsa.read8(addr);
        }
        if (0x10160000..0x10161000).contains(&addr) {
            warn!("[SPI2] Unrecognized read8 ${:08X}", addr);
            return 0;
        }
        match addr {
            0x10000000 => self.sysprot9,
            0x10000001 => self.sysprot11,
            // ARM11 power-on control.
            0x10000002 => 0,
            // AES-related config.
            0x10000008 => 0,
            0x10000010 => !self.cartridge.card_inserted() as u8,
            // 0 = retail unit, 1 = dev unit.
            0x10010010 => 0,
            0x10009011 => self.aes.read_keycnt(),
            _ => invalid_read("ARM9", 8, addr) as u8,
        }
    }

    pub fn arm9_read16(&mut self, addr: u32) -> u16 {
        if addr >= 0xFFFF0000 {
            return read16_le(&self.boot9, (addr & 0xFFFF) as usize);
        }
        if (0x08000000..0x08100000).contains(&addr) {
            return read16_le(&self.arm9_ram, (addr & 0xFFFFF) as usize);
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return read16_le(&self.axi_ram, (addr & 0x7FFFF) as usize);
        }
        if (0x10003000..0x10004000).contains(&addr) {
            return self.timers.arm9_read16(addr);
        }
        if (0x10006000..0x10007000).contains(&addr) {
            return self.emmc.read16(addr, &mut self.int9, &mut self.reqs);
        }
        if (0x10160000..0x10161000).contains(&addr) {
            warn!("[SPI2] Unrecognized read16 ${:08X}", addr);
            return 0;
        }
        if (0x10164000..0x10165000).contains(&addr) {
            return self.cartridge.read16_ntr(addr);
        }
        match addr {
            0x10008004 => self.pxi.read_cnt9(),
            // HID: all buttons released.
            0x10146000 => 0xFFFF,
            _ => invalid_read("ARM9", 16, addr) as u16,
        }
    }

    pub fn arm9_read32(&mut self, addr: u32) -> u32 {
        if addr >= 0xFFFF0000 {
            return read32_le(&self.boot9, (addr & 0xFFFF) as usize);
        }
        if (0x08000000..0x08100000).contains(&addr) {
            return read32_le(&self.arm9_ram, (addr & 0xFFFFF) as usize);
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return read32_le(&self.axi_ram, (addr & 0x7FFFF) as usize);
        }
        if (0x10002000..0x10003000).contains(&addr) {
            return self.ndma.read32(addr);
        }
        if (0x10004000..0x10005000).contains(&addr) {
            return self.cartridge.read32_ctr(addr, &mut self.int9, &mut self.reqs);
        }
        if (0x10006000..0x10007000).contains(&addr) {
            return self.emmc.read32(addr, &mut self.int9, &mut self.reqs);
        }
        if (0x10009000..0x1000A000).contains(&addr) {
            return self.aes.read32(addr, &mut self.int9, &mut self.reqs);
        }
        if (0x1000A000..0x1000B000).contains(&addr) {
            return self.sha.read32(addr);
        }
        if (0x1000B000..0x1000C000).contains(&addr) {
            return self.rsa.read32(addr);
        }
        if (0x1000C000..0x1000D000).contains(&addr) {
            return self.xdma.read32(addr);
        }
        if (0x1000D800..0x1000D900).contains(&addr) {
            return self.cartridge.read32_spicard(addr);
        }
        if (0x10012000..0x10012100).contains(&addr) {
            return read32_le(&self.otp, (addr & 0xFF) as usize);
        }
        if (0x10164000..0x10165000).contains(&addr) {
            return self.cartridge.read32_ntr(addr);
        }
        match addr {
            0x10001000 => self.int9.read_ie(),
            0x10001004 => self.int9.read_if(),
            0x10008000 => self.pxi.read_sync9(),
            0x1000800C => self.pxi.read_msg9(&mut self.pmr),
            _ => invalid_read("ARM9", 32, addr),
        }
    }

    pub fn arm9_write8(&mut self, addr: u32, value: u8) {
        if addr >= 0xFFFF0000 {
            // Boot ROM: writes are silently dropped.
            return;
        }
        if (0x08000000..0x08100000).contains(&addr) {
            self.arm9_ram[(addr & 0xFFFFF) as usize] = value;
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            self.axi_ram[(addr & 0x7FFFF) as usize] = value;
            return;
        }
        if (0x1000A080..0x1000A0C0).contains(&addr) {
            self.sha.write_fifo8(value, &mut self.reqs);
            return;
        }
        if (0x1000B000..0x1000C000).contains(&addr) {
            self.rsa.write8(addr, value);
            return;
        }
        if (0x10160000..0x10170000).contains(&addr) {
            warn!("[SPI2] Unrecognized write8 ${:08X}: ${:02X}", addr, value);
            return;
        }
        if (0x10164008..0x10164010).contains(&addr) {
            self.cartridge.write8_ntr(addr, value);
            return;
        }
        match addr {
            0x10000000 => {
                // Lock down the sensitive half of the boot ROM and the OTP.
                if value & 0x1 != 0 {
                    self.boot9[0x8000..].iter_mut().for_each(|b| *b = 0);
                }
                if value & 0x2 != 0 {
                    self.otp.iter_mut().for_each(|b| *b = 0xFF);
                }
                self.sysprot9 = value;
            }
            0x10000001 => {
                if value & 0x1 != 0 {
                    self.boot11[0x8000..].iter_mut().for_each(|b| *b = 0);
                }
                self.sysprot11 = value;
            }
            0x10000002 | 0x10000008 => {}
            0x10009010 => self.aes.write_keysel(value),
            0x10009011 => self.aes.write_keycnt(value),
            _ => invalid_write("ARM9", 8, addr, value as u32),
        }
    }

    pub fn arm9_write16(&mut self, addr: u32, value: u16) {
        if addr >= 0xFFFF0000 {
            return;
        }
        if (0x08000000..0x08100000).contains(&addr) {
            write16_le(&mut self.arm9_ram, (addr & 0xFFFFF) as usize, value);
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            write16_le(&mut self.axi_ram, (addr & 0x7FFFF) as usize, value);
            return;
        }
        if (0x10003000..0x10004000).contains(&addr) {
            self.timers.arm9_write16(addr, value);
            return;
        }
        if (0x10006000..0x10007000).contains(&addr) {
            self.emmc.write16(addr, value, &mut self.int9, &mut self.reqs);
            return;
        }
        if (0x1000A080..0x1000A0C0).contains(&addr) {
            self.sha.write_fifo16(value, &mut self.reqs);
            return;
        }
        if (0x10160000..0x10170000).contains(&addr) {
            warn!("[SPI2] Unrecognized write16 ${:08X}: ${:04X}", addr, value);
            return;
        }
        if (0x10164000..0x10165000).contains(&addr) {
            self.cartridge.write16_ntr(addr, value);
            return;
        }
        match addr {
            0x10008004 => self.pxi.write_cnt9(value),
            0x10009006 => self.aes.write_block_count(value),
            _ => invalid_write("ARM9", 16, addr, value as u32),
        }
    }

    pub fn arm9_write32(&mut self, addr: u32, value: u32) {
        if addr >= 0xFFFF0000 {
            return;
        }
        if (0x08000000..0x08100000).contains(&addr) {
            write32_le(&mut self.arm9_ram, (addr & 0xFFFFF) as usize, value);
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            write32_le(&mut self.axi_ram, (addr & 0x7FFFF) as usize, value);
            return;
        }
        if (0x10002000..0x10003000).contains(&addr) {
            match self.ndma.write32(addr, value) {
                Some(NdmaKick::Immediate(chan)) => self.run_ndma(chan),
                Some(NdmaKick::Armed(req)) => {
                    self.scheduler.add_event(Event::NdmaRequestCheck(req), 1)
                }
                None => {}
            }
            return;
        }
        if (0x10004000..0x10005000).contains(&addr) {
            self.cartridge.write32_ctr(addr, value);
            return;
        }
        if (0x10006000..0x10007000).contains(&addr) {
            self.emmc.write32(addr, value, &mut self.int9, &mut self.reqs);
            return;
        }
        if (0x10009000..0x1000A000).contains(&addr) {
            self.aes.write32(addr, value, &mut self.int9, &mut self.reqs);
            return;
        }
        if (0x1000A000..0x1000B000).contains(&addr) {
            self.sha.write32(addr, value, &mut self.reqs);
            return;
        }
        if (0x1000B000..0x1000C000).contains(&addr) {
            self.rsa.write32(addr, value, &mut self.int9);
            return;
        }
        if (0x1000C000..0x1000D000).contains(&addr) {
            if self.xdma.write32(addr, value) {
                self.run_xdma_debug();
            }
            return;
        }
        if (0x1000D800..0x1000D900).contains(&addr) {
            self.cartridge.write32_spicard(addr, value);
            return;
        }
        if (0x10164000..0x10165000).contains(&addr) {
            self.cartridge.write32_ntr(addr, value);
            return;
        }
        match addr {
            0x10001000 => self.int9.write_ie(value),
            0x10001004 => self.int9.write_if(value),
            0x10008000 => self.pxi.write_sync9(value, &mut self.pmr),
            0x10008008 => self.pxi.send_to_11(value, &mut self.pmr),
            _ => invalid_write("ARM9", 32, addr, value),
        }
    }

    // ---- ARM11 view ----

    pub fn arm11_read8(&mut self, core: usize, addr: u32) -> u8 {
        if addr < 0x20000 {
            return self.boot11[(addr & 0xFFFF) as usize];
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return self.axi_ram[(addr & 0x7FFFF) as usize];
        }
        if (0x10144000..0x10145000).contains(&addr)
            || (0x10148000..0x10149000).contains(&addr)
            || (0x10161000..0x10162000).contains(&addr)
        {
            warn!("[I2C] Unrecognized read8 ${:08X}", addr);
            return 0;
        }
        if (0x10147000..0x10148000).contains(&addr) {
            warn!("[GPIO] Unrecognized read8 ${:08X}", addr);
            return 0;
        }
        if (0x17E00000..0x17E02000).contains(&addr) {
            return self.pmr.read8(core, addr);
        }
        if (0x18000000..0x18600000).contains(&addr) {
            return self.gpu.read_vram8(addr);
        }
        match addr {
            // GPU power.
            0x10141204 => 1,
            0x10141208 => 0,
            // FCRAM enable.
            0x10141220 => 0,
            _ => invalid_read("ARM11", 8, addr) as u8,
        }
    }

    pub fn arm11_read16(&mut self, _core: usize, addr: u32) -> u16 {
        if addr < 0x20000 {
            return read16_le(&self.boot11, (addr & 0xFFFF) as usize);
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return read16_le(&self.axi_ram, (addr & 0x7FFFF) as usize);
        }
        if (0x10122000..0x10123000).contains(&addr) {
            return self.wifi.read16(addr, &mut self.pmr, &mut self.reqs);
        }
        if (0x10161000..0x10162000).contains(&addr) {
            warn!("[I2C] Unrecognized read16 ${:08X}", addr);
            return 0;
        }
        if (0x18000000..0x18600000).contains(&addr) {
            return self.gpu.read_vram16(addr);
        }
        match addr {
            // Clock multiplier; bit 2 clear = 2x.
            0x10140FFC => 0x1,
            0x10146000 => 0xFFFF,
            0x10163004 => self.pxi.read_cnt11(),
            _ => invalid_read("ARM11", 16, addr) as u16,
        }
    }

    pub fn arm11_read32(&mut self, core: usize, addr: u32) -> u32 {
        if addr < 0x20000 {
            return read32_le(&self.boot11, (addr & 0xFFFF) as usize);
        }
        if (0x17E00600..0x17E00A00).contains(&addr) {
            return self.arm11_timer_read32(core, addr);
        }
        if (0x17E00000..0x17E02000).contains(&addr) {
            return self.pmr.read32(core, addr);
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            return read32_le(&self.axi_ram, (addr & 0x7FFFF) as usize);
        }
        if (0x10122000..0x10123000).contains(&addr) {
            if addr & 0xFFF == 0x10C {
                return self.wifi.read_fifo32(&mut self.pmr, &mut self.reqs);
            }
            warn!("[WiFi] Unrecognized read32 ${:08X}", addr);
            return 0;
        }
        if (0x10142800..0x10142900).contains(&addr)
            || (0x10143000..0x10143100).contains(&addr)
            || (0x10160000..0x10160100).contains(&addr)
        {
            return self.spi.read32(addr);
        }
        if (0x10200000..0x10201000).contains(&addr) {
            return self.cdma.read32(addr);
        }
        if (0x10202000..0x10203000).contains(&addr) {
            warn!("[LCD] Unrecognized read32 ${:08X}", addr);
            return 0;
        }
        if (0x10400000..0x10402000).contains(&addr) {
            return self.gpu.read32(addr);
        }
        if (0x18000000..0x18600000).contains(&addr) {
            return self.gpu.read_vram32(addr);
        }
        match addr {
            // GPU power config.
            0x10141200 => 0,
            0x10163000 => self.pxi.read_sync11(),
            0x1016300C => self.pxi.read_msg11(&mut self.int9),
            _ => invalid_read("ARM11", 32, addr),
        }
    }

    pub fn arm11_write8(&mut self, core: usize, addr: u32, value: u8) {
        if addr < 0x20000 {
            // Boot ROM: writes are silently dropped.
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            self.axi_ram[(addr & 0x7FFFF) as usize] = value;
            return;
        }
        if (0x17E00000..0x17E02000).contains(&addr) {
            self.pmr.write8(core, addr, value);
            return;
        }
        // Mapping data to the DSP.
        if (0x10140000..0x10140010).contains(&addr) {
            return;
        }
        if (0x10144000..0x10145000).contains(&addr)
            || (0x10148000..0x10149000).contains(&addr)
            || (0x10161000..0x10162000).contains(&addr)
        {
            warn!("[I2C] Unrecognized write8 ${:08X}: ${:02X}", addr, value);
            return;
        }
        if (0x10147000..0x10148000).contains(&addr) {
            warn!("[GPIO] Unrecognized write8 ${:08X}: ${:02X}", addr, value);
            return;
        }
        if (0x18000000..0x18600000).contains(&addr) {
            self.gpu.write_vram8(addr, value);
            return;
        }
        match addr {
            0x10141204 | 0x10141208 | 0x10141220 => {}
            _ => invalid_write("ARM11", 8, addr, value as u32),
        }
    }

    pub fn arm11_write16(&mut self, core: usize, addr: u32, value: u16) {
        if addr < 0x20000 {
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            write16_le(&mut self.axi_ram, (addr & 0x7FFFF) as usize, value);
            return;
        }
        if (0x17E00000..0x17E02000).contains(&addr) {
            self.pmr.write16(core, addr, value);
            return;
        }
        if (0x10122000..0x10123000).contains(&addr) {
            let Bus { wifi, pmr, reqs, scheduler, .. } = self;
            wifi.write16(addr, value, pmr, reqs, scheduler);
            return;
        }
        if (0x10144000..0x10145000).contains(&addr) || (0x10161000..0x10162000).contains(&addr) {
            warn!("[I2C] Unrecognized write16 ${:08X}: ${:04X}", addr, value);
            return;
        }
        if (0x18000000..0x18600000).contains(&addr) {
            self.gpu.write_vram16(addr, value);
            return;
        }
        match addr {
            0x10163004 => self.pxi.write_cnt11(value),
            _ => invalid_write("ARM11", 16, addr, value as u32),
        }
    }

    pub fn arm11_write32(&mut self, core: usize, addr: u32, value: u32) {
        if addr < 0x20000 {
            return;
        }
        if (0x1FF80000..0x20000000).contains(&addr) {
            write32_le(&mut self.axi_ram, (addr & 0x7FFFF) as usize, value);
            return;
        }
        if (0x17E00600..0x17E00A00).contains(&addr) {
            self.arm11_timer_write32(core, addr, value);
            return;
        }
        if (0x17E00000..0x17E02000).contains(&addr) {
            self.pmr.write32(core, addr, value);
            return;
        }
        if (0x10122000..0x10123000).contains(&addr) {
            if addr & 0xFFF == 0x10C {
                let Bus { wifi, pmr, reqs, scheduler, .. } = self;
                wifi.write_fifo32(value, pmr, reqs, scheduler);
                return;
            }
            warn!("[WiFi] Unrecognized write32 ${:08X}: ${:08X}", addr, value);
            return;
        }
        if (0x10142800..0x10142900).contains(&addr)
            || (0x10143000..0x10143100).contains(&addr)
            || (0x10160000..0x10160100).contains(&addr)
        {
            self.spi.write32(addr, value);
            return;
        }
        if (0x10200000..0x10201000).contains(&addr) {
            if self.cdma.write32(addr, value) {
                self.run_cdma_debug();
            }
            return;
        }
        if (0x10202000..0x10203000).contains(&addr) {
            warn!("[LCD] Unrecognized write32 ${:08X}: ${:08X}", addr, value);
            return;
        }
        if (0x10400000..0x10402000).contains(&addr) {
            self.gpu.write32(addr, value);
            return;
        }
        if (0x18000000..0x18600000).contains(&addr) {
            self.gpu.write_vram32(addr, value);
            return;
        }
        match addr {
            0x10141200 => {}
            0x10163000 => self.pxi.write_sync11(value, &mut self.int9),
            0x10163008 => self.pxi.send_to_9(value, &mut self.int9),
            _ => invalid_write("ARM11", 32, addr, value),
        }
    }

    // The private timer and watchdog window of the PMR. Accesses through
    // 0x17E00600 hit the reading core's own timer; 0x17E00700+ addresses
    // any core's.
    fn arm11_timer_id(core: usize, addr: u32) -> usize {
        let mut id = if addr < 0x17E00700 { core } else { ((addr - 0x17E00700) / 0x100) as usize };
        if addr & 0x20 != 0 {
            // Watchdogs sit 0x20 above the timers.
            id += 4;
        }
        id
    }

    fn arm11_timer_read32(&mut self, core: usize, addr: u32) -> u32 {
        let id = Self::arm11_timer_id(core, addr);
        match addr & 0x1F {
            0x00 => self.timers.arm11_get_load(id),
            0x04 => self.timers.arm11_get_counter(id),
            0x08 => self.timers.arm11_get_control(id),
            0x0C => self.timers.arm11_get_int_status(id),
            _ => {
                warn!("[PMR] Unrecognized timer{} read32 ${:08X}", id, addr);
                0
            }
        }
    }

    fn arm11_timer_write32(&mut self, core: usize, addr: u32, value: u32) {
        let id = Self::arm11_timer_id(core, addr);
        match addr & 0x1F {
            0x00 => self.timers.arm11_set_load(id, value),
            0x04 => self.timers.arm11_set_counter(id, value),
            0x08 => self.timers.arm11_set_control(id, value),
            0x0C => self.timers.arm11_set_int_status(id, value),
            _ => warn!("[PMR] Unrecognized timer{} write32 ${:08X}: ${:08X}", id, addr, value),
        }
    }

    // ---- Engine stepping ----

    /// Services pending NDMA requests; chained AES2 listeners run back to
    /// back in ascending channel order.
    pub fn process_ndma(&mut self) {
        let mut i = 0;
        while i < 8 {
            if self.ndma.chan[i].busy && self.reqs.ndma[self.ndma.chan[i].startup_mode] {
                self.run_ndma(i);
                while i < 7
                    && self.ndma.chan[i + 1].busy
                    && self.ndma.chan[i + 1].startup_mode == NDMA_AES2
                {
                    i += 1;
                    self.run_ndma(i);
                }
            }
            i += 1;
        }
    }

    fn run_ndma(&mut self, chan: usize) {
        let mut ch = self.ndma.chan[chan];

        let src_multiplier: i32 = match ch.src_update_method {
            0 => 4,
            1 => -4,
            2 => 0,
            _ => panic!("[NDMA] Source update method 3 (fill) selected"),
        };
        let dest_multiplier: i32 = match ch.dest_update_method {
            0 => 4,
            1 => -4,
            2 => 0,
            method => panic!("[NDMA] Invalid dest update method {}", method),
        };

        // One logical block of words per trigger.
        let block_size = ch.write_count;
        for i in 0..block_size as i32 {
            let word = self.arm9_read32(ch.int_src.wrapping_add((i * src_multiplier) as u32));
            self.arm9_write32(ch.int_dest.wrapping_add((i * dest_multiplier) as u32), word);
        }

        if !ch.src_reload {
            ch.int_src = ch.int_src.wrapping_add((block_size as i32 * src_multiplier) as u32);
        }
        if !ch.dest_reload {
            ch.int_dest = ch.int_dest.wrapping_add((block_size as i32 * dest_multiplier) as u32);
        }

        let mut finished = false;
        if ch.imm_mode {
            finished = true;
        } else if !ch.repeating_mode {
            ch.transfer_count = ch.transfer_count.wrapping_sub(block_size);
            finished = ch.transfer_count == 0;
        }
        if finished {
            ch.busy = false;
        }

        self.ndma.chan[chan] = ch;
        if finished && ch.irq_enable {
            self.int9.assert_irq(chan);
        }
    }

    pub fn process_xdma(&mut self) {
        let mut xdma = std::mem::replace(&mut self.xdma, CorelinkDma::new("XDMA"));
        xdma.run(&mut XdmaPort { bus: self });
        self.xdma = xdma;
    }

    fn run_xdma_debug(&mut self) {
        let mut xdma = std::mem::replace(&mut self.xdma, CorelinkDma::new("XDMA"));
        xdma.exec_debug(&mut XdmaPort { bus: self });
        self.xdma = xdma;
    }

    pub fn process_cdma(&mut self) {
        let mut cdma = std::mem::replace(&mut self.cdma, CorelinkDma::new("CDMA"));
        cdma.run(&mut CdmaPort { bus: self });
        self.cdma = cdma;
    }

    fn run_cdma_debug(&mut self) {
        let mut cdma = std::mem::replace(&mut self.cdma, CorelinkDma::new("CDMA"));
        cdma.exec_debug(&mut CdmaPort { bus: self });
        self.cdma = cdma;
    }

    pub fn run_timers(&mut self) {
        self.timers.run(&mut self.int9, &mut self.pmr);
    }

    pub fn run_wifi(&mut self, cycles: u32) {
        self.wifi.run(cycles);
    }

    /// Dispatches every scheduler event that has come due.
    pub fn run_events(&mut self) {
        while let Some(event) = self.scheduler.pop_due() {
            match event {
                Event::NdmaRequestCheck(req) => {
                    self.reqs.ndma[req] = self.ndma.any_armed(req);
                }
                Event::WifiChannelList => {
                    self.wifi.wmi_channel_list(&mut self.pmr);
                }
            }
        }
    }
}

struct XdmaPort<'a> {
    bus: &'a mut Bus,
}

impl<'a> DmaPort for XdmaPort<'a> {
    fn read8(&mut self, addr: u32) -> u8 {
        self.bus.arm9_read8(addr)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.bus.arm9_read32(addr)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.bus.arm9_write32(addr, value);
    }

    fn send_interrupt(&mut self, _event: usize) {
        self.bus.int9.assert_irq(IRQ_XDMA);
    }

    fn peripheral_pending(&self, periph: usize) -> bool {
        self.bus.reqs.xdma[periph]
    }

    fn clear_peripheral(&mut self, periph: usize) {
        self.bus.reqs.clear_xdma(periph);
    }
}

struct CdmaPort<'a> {
    bus: &'a mut Bus,
}

impl<'a> DmaPort for CdmaPort<'a> {
    fn read8(&mut self, addr: u32) -> u8 {
        self.bus.arm11_read8(0, addr)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.bus.arm11_read32(0, addr)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.bus.arm11_write32(0, addr, value);
    }

    fn send_interrupt(&mut self, _event: usize) {
        self.bus.pmr.assert_hw_irq(IRQ_CDMA);
    }

    fn peripheral_pending(&self, periph: usize) -> bool {
        self.bus.reqs.cdma[periph]
    }

    fn clear_peripheral(&mut self, periph: usize) {
        self.bus.reqs.clear_cdma(periph);
    }
}

// RSA engine: four keyslots of 2048-bit exponent/modulus pairs and a text
// register the modexp runs over in place. The bignum arithmetic is
// num-bigint's modpow.

use crate::interrupt9::{Interrupt9, IRQ_RSA};
use log::{debug, trace, warn};
use num_bigint::BigUint;

#[derive(Clone, Copy)]
struct RsaKeySlot {
    exp: [u8; 0x100],
    modulus: [u8; 0x100],
    exp_ctr: usize,
    mod_ctr: usize,
    write_protect: bool,
}

impl Default for RsaKeySlot {
    fn default() -> Self {
        RsaKeySlot {
            exp: [0; 0x100],
            modulus: [0; 0x100],
            exp_ctr: 0,
            mod_ctr: 0,
            write_protect: false,
        }
    }
}

#[derive(Default)]
struct RsaCnt {
    keyslot: usize,
    big_endian: bool,
    word_order: bool,
}

pub struct Rsa {
    keys: [RsaKeySlot; 4],
    cnt: RsaCnt,
    msg: [u8; 0x100],
    msg_ctr: usize,
}

impl Rsa {
    pub fn new() -> Self {
        Rsa { keys: [RsaKeySlot::default(); 4], cnt: RsaCnt::default(), msg: [0; 0x100], msg_ctr: 0 }
    }

    pub fn reset(&mut self) {
        self.keys = [RsaKeySlot::default(); 4];
        self.msg = [0; 0x100];
        self.msg_ctr = 0;
    }

    pub fn read8(&self, addr: u32) -> u8 {
        if (0x1000B800..0x1000B900).contains(&addr) {
            let mut index = (addr & 0xFF) as usize;
            if !self.cnt.word_order {
                index = 0xFF - index;
            }
            return self.msg[index];
        }
        warn!("[RSA] Unrecognized read8 ${:08X}", addr);
        0
    }

    pub fn read32(&self, addr: u32) -> u32 {
        if (0x1000B100..0x1000B140).contains(&addr) {
            let index = ((addr / 0x10) & 0x3) as usize;
            match (addr / 4) & 0x3 {
                0 => {
                    // Key is always reported as set.
                    let mut reg = 1;
                    reg |= (self.keys[index].write_protect as u32) << 1;
                    return reg;
                }
                1 => return 0x40,
                _ => {}
            }
        }

        if (0x1000B800..0x1000B900).contains(&addr) {
            let mut index = (addr & 0xFF) as usize;
            if !self.cnt.word_order {
                index = 0xFC - index;
            }
            let mut value = u32::from_le_bytes([
                self.msg[index],
                self.msg[index + 1],
                self.msg[index + 2],
                self.msg[index + 3],
            ]);
            if !self.cnt.big_endian {
                value = value.swap_bytes();
            }
            trace!("[RSA] Read TXT ${:08X}: ${:08X}", addr, value);
            return value;
        }

        match addr {
            0x1000B000 => {
                let mut reg = (self.cnt.keyslot as u32) << 4;
                reg |= (self.cnt.big_endian as u32) << 8;
                reg |= (self.cnt.word_order as u32) << 9;
                reg
            }
            _ => {
                warn!("[RSA] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        if (0x1000B200..0x1000B300).contains(&addr) {
            let key = &mut self.keys[self.cnt.keyslot];
            key.exp[key.exp_ctr] = value;
            key.exp_ctr = (key.exp_ctr + 1) % 0x100;
            return;
        }

        if (0x1000B400..0x1000B500).contains(&addr) {
            let word_order = self.cnt.word_order;
            let key = &mut self.keys[self.cnt.keyslot];
            let index = if word_order { key.mod_ctr } else { 0xFF - key.mod_ctr };
            key.modulus[index] = value;
            key.mod_ctr = (key.mod_ctr + 1) % 0x100;
            return;
        }

        if (0x1000B800..0x1000B900).contains(&addr) {
            trace!("[RSA] Write TXT: ${:02X} ({})", value, self.msg_ctr);
            if self.cnt.word_order {
                self.msg[self.msg_ctr] = value;
            } else {
                self.msg[0xFF - self.msg_ctr] = value;
            }
            self.msg_ctr = (self.msg_ctr + 1) % 0x100;
            return;
        }

        warn!("[RSA] Unrecognized write8 ${:08X}: ${:02X}", addr, value);
    }

    pub fn write32(&mut self, addr: u32, value: u32, int9: &mut Interrupt9) {
        if (0x1000B100..0x1000B140).contains(&addr) {
            let index = ((addr / 0x10) & 0x3) as usize;
            if (addr / 4) & 0x3 == 0 {
                debug!("[RSA] Write32 key{} cnt: ${:08X}", index, value);
                self.keys[index].write_protect = value & (1 << 1) != 0;
                return;
            }
        }

        if (0x1000B200..0x1000B300).contains(&addr) {
            let value = if self.cnt.big_endian { value } else { value.swap_bytes() };
            let key = &mut self.keys[self.cnt.keyslot];
            key.exp[key.exp_ctr..key.exp_ctr + 4].copy_from_slice(&value.to_le_bytes());
            key.exp_ctr = (key.exp_ctr + 4) % 0x100;
            return;
        }

        if (0x1000B400..0x1000B500).contains(&addr) {
            let value = if self.cnt.big_endian { value } else { value.swap_bytes() };
            let word_order = self.cnt.word_order;
            let key = &mut self.keys[self.cnt.keyslot];
            let index = if word_order { key.mod_ctr } else { 0xFC - key.mod_ctr };
            key.modulus[index..index + 4].copy_from_slice(&value.to_le_bytes());
            key.mod_ctr = (key.mod_ctr + 4) % 0x100;
            return;
        }

        if (0x1000B800..0x1000B900).contains(&addr) {
            trace!("[RSA] Write TXT: ${:08X} ({})", value, self.msg_ctr);
            let value = if self.cnt.big_endian { value } else { value.swap_bytes() };
            let index = if self.cnt.word_order { self.msg_ctr } else { 0xFC - self.msg_ctr };
            self.msg[index..index + 4].copy_from_slice(&value.to_le_bytes());
            self.msg_ctr = (self.msg_ctr + 4) % 0x100;
            return;
        }

        match addr {
            0x1000B000 => {
                debug!("[RSA] Write CNT: ${:08X}", value);
                self.cnt.keyslot = ((value >> 4) & 0x3) as usize;
                self.cnt.big_endian = value & (1 << 8) != 0;
                self.cnt.word_order = value & (1 << 9) != 0;
                if value & 0x1 != 0 {
                    self.do_rsa_op(int9);
                }
            }
            _ => warn!("[RSA] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    fn do_rsa_op(&mut self, int9: &mut Interrupt9) {
        let key = &self.keys[self.cnt.keyslot];
        let base = BigUint::from_bytes_be(&self.msg);
        let exp = BigUint::from_bytes_be(&key.exp);
        let modulus = BigUint::from_bytes_be(&key.modulus);

        debug!("[RSA] modexp on keyslot {}", self.cnt.keyslot);

        let result = base.modpow(&exp, &modulus);
        let bytes = result.to_bytes_be();

        // The result is left-padded back out to the full register width.
        self.msg = [0; 0x100];
        self.msg[0x100 - bytes.len()..].copy_from_slice(&bytes);

        int9.assert_irq(IRQ_RSA);
    }
}

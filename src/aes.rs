// AES engine: 64 keyslots, the 3DS/DSi keygen ladder, and a block pipe
// between two 16-word FIFOs. The block primitives come from the RustCrypto
// `aes` crate; everything around them (counter handling, chaining, word
// order) is the register-visible behavior of the hardware.

use crate::bus::DmaRequests;
use crate::interrupt9::{Interrupt9, IRQ_AES};
use crate::ndma::{NDMA_AES2, NDMA_AES_READFREE, NDMA_AES_WRITEFREE};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use log::{debug, trace, warn};
use std::collections::VecDeque;

const KEY_CONST: [u8; 16] = [
    0x1F, 0xF9, 0xE9, 0xAA, 0xC5, 0xFE, 0x04, 0x08, 0x02, 0x45, 0x91, 0xDC, 0x5D, 0x52, 0x76, 0x8A,
];

const DSI_CONST: [u8; 16] = [
    0xFF, 0xFE, 0xFB, 0x4E, 0x29, 0x59, 0x02, 0x58, 0x2A, 0x68, 0x0F, 0x5F, 0x1A, 0x4F, 0x3E, 0x79,
];

// 128-bit big-endian helpers for the keygen ladder.
fn n128_lrot(num: &mut [u8; 16], mut shift: u32) {
    while shift > 0 {
        let step = shift.min(8);
        let mut tmp = [0u8; 16];
        if step == 8 {
            for i in 0..16 {
                tmp[i] = num[(i + 1) % 16];
            }
        } else {
            for i in 0..16 {
                tmp[i] = (num[i] << step) | (num[(i + 1) % 16] >> (8 - step));
            }
        }
        *num = tmp;
        shift -= step;
    }
}

fn n128_rrot(num: &mut [u8; 16], mut shift: u32) {
    while shift > 0 {
        let step = shift.min(8);
        let mut tmp = [0u8; 16];
        if step == 8 {
            for i in 0..16 {
                tmp[i] = num[(i + 15) % 16];
            }
        } else {
            for i in 0..16 {
                tmp[i] = (num[i] >> step) | (num[(i + 15) % 16] << (8 - step));
            }
        }
        *num = tmp;
        shift -= step;
    }
}

fn n128_add(a: &mut [u8; 16], b: &[u8; 16]) {
    let mut carry = 0u32;
    for i in (0..16).rev() {
        let val = a[i] as u32 + b[i] as u32 + carry;
        a[i] = val as u8;
        carry = val >> 8;
    }
}

#[derive(Clone, Copy, Default)]
pub struct KeySlot {
    pub normal: [u8; 16],
    pub x: [u8; 16],
    pub y: [u8; 16],
}

#[derive(Default)]
struct AesCnt {
    dma_write_size: u8,
    dma_read_size: u8,
    mac_size: u8,
    mac_input_ctrl: bool,
    mac_status: bool,
    out_big_endian: bool,
    in_big_endian: bool,
    out_word_order: bool,
    in_word_order: bool,
    mode: u8,
    irq_enable: bool,
    busy: bool,
}

pub struct Aes {
    keys: [KeySlot; 64],
    keysel: u8,
    keycnt: u8,
    cnt: AesCnt,
    block_count: u16,
    mac_count: u16,

    input_fifo: VecDeque<u32>,
    output_fifo: VecDeque<u32>,
    most_recent_output: u32,

    temp_input: [u8; 16],
    temp_input_ctr: usize,
    normal_fifo: [u8; 16],
    normal_ctr: usize,
    x_fifo: [u8; 16],
    x_ctr: usize,
    y_fifo: [u8; 16],
    y_ctr: usize,

    ctr_reg: [u8; 16],
    // Live context for the selected keyslot: the CTR counter doubles as the
    // CBC chaining value, exactly as the register interface exposes it.
    iv: [u8; 16],
    cipher: Option<Aes128>,
    crypt_results: [u8; 16],
}

impl Aes {
    pub fn new() -> Self {
        Aes {
            keys: [KeySlot::default(); 64],
            keysel: 0,
            keycnt: 0,
            cnt: AesCnt::default(),
            block_count: 0,
            mac_count: 0,
            input_fifo: VecDeque::new(),
            output_fifo: VecDeque::new(),
            most_recent_output: 0,
            temp_input: [0; 16],
            temp_input_ctr: 0,
            normal_fifo: [0; 16],
            normal_ctr: 0,
            x_fifo: [0; 16],
            x_ctr: 0,
            y_fifo: [0; 16],
            y_ctr: 0,
            ctr_reg: [0; 16],
            iv: [0; 16],
            cipher: None,
            crypt_results: [0; 16],
        }
    }

    pub fn reset(&mut self) {
        self.keysel = 0;
        self.keycnt = 0;
        self.temp_input_ctr = 0;
        self.normal_ctr = 0;
        self.x_ctr = 0;
        self.y_ctr = 0;
        self.input_fifo.clear();
        self.output_fifo.clear();
        self.init_aes_key(0x3F);
    }

    pub fn key(&self, slot: usize) -> &KeySlot {
        &self.keys[slot]
    }

    fn gen_normal_key(&mut self, slot: usize) {
        let mut normal = self.keys[slot].x;
        n128_lrot(&mut normal, 2);
        for i in 0..16 {
            normal[i] ^= self.keys[slot].y[i];
        }
        n128_add(&mut normal, &KEY_CONST);
        n128_rrot(&mut normal, 41);

        debug!("[AES] Generated key for slot ${:02X}", slot);
        self.keys[slot].normal = normal;
    }

    fn gen_dsi_key(&mut self, slot: usize) {
        let mut normal = self.keys[slot].x;
        for i in 0..16 {
            normal[i] ^= self.keys[slot].y[i];
        }
        n128_add(&mut normal, &DSI_CONST);
        n128_lrot(&mut normal, 42);

        debug!("[AES] Generated DSi key for slot ${:02X}", slot);
        self.keys[slot].normal = normal;
    }

    fn init_aes_key(&mut self, slot: usize) {
        let key = GenericArray::from(self.keys[slot].normal);
        self.cipher = Some(Aes128::new(&key));
    }

    fn crypt_check(&mut self, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        if self.input_fifo.len() >= 4 && self.output_fifo.len() <= 12 && self.cnt.busy {
            self.pop_block();
            match self.cnt.mode {
                0x0 => self.decrypt_ccm(),
                0x2 | 0x3 => self.crypt_ctr(),
                0x4 => self.decrypt_cbc(),
                0x5 => self.encrypt_cbc(),
                0x6 => self.decrypt_ecb(),
                mode => panic!("[AES] Unrecognized crypt mode {}", mode),
            }

            for i in 0..4 {
                let mut index = i << 2;
                if !self.cnt.out_word_order {
                    index = 12 - index;
                }
                let mut value = u32::from_le_bytes([
                    self.crypt_results[index],
                    self.crypt_results[index + 1],
                    self.crypt_results[index + 2],
                    self.crypt_results[index + 3],
                ]);
                if !self.cnt.out_big_endian {
                    value = value.swap_bytes();
                }
                self.output_fifo.push_back(value);
            }

            self.block_count = self.block_count.wrapping_sub(1);
            if self.block_count == 0 {
                self.cnt.busy = false;
                if self.cnt.irq_enable {
                    int9.assert_irq(IRQ_AES);
                }
            }
        }
        self.send_dma_requests(reqs);
    }

    fn pop_block(&mut self) {
        for i in 0..4 {
            let word = self.input_fifo.pop_front().unwrap();
            self.crypt_results[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
    }

    fn cipher(&self) -> &Aes128 {
        self.cipher.as_ref().expect("AES keyslot never selected")
    }

    fn decrypt_ccm(&mut self) {
        // CCM decrypt-and-verify is not wired up; blocks pass through and
        // the MAC always reports valid.
        trace!("[AES] Decrypt CCM");
        self.cnt.mac_status = true;
    }

    fn crypt_ctr(&mut self) {
        trace!("[AES] Crypt CTR");
        let mut keystream = GenericArray::from(self.iv);
        self.cipher().encrypt_block(&mut keystream);
        for i in 0..16 {
            self.crypt_results[i] ^= keystream[i];
        }
        // Big-endian 128-bit increment of the counter.
        for i in (0..16).rev() {
            self.iv[i] = self.iv[i].wrapping_add(1);
            if self.iv[i] != 0 {
                break;
            }
        }
    }

    fn decrypt_cbc(&mut self) {
        trace!("[AES] Decrypt CBC");
        let ciphertext = self.crypt_results;
        let mut block = GenericArray::from(self.crypt_results);
        self.cipher().decrypt_block(&mut block);
        for i in 0..16 {
            self.crypt_results[i] = block[i] ^ self.iv[i];
        }
        self.iv = ciphertext;
    }

    fn encrypt_cbc(&mut self) {
        trace!("[AES] Encrypt CBC");
        let mut block = GenericArray::from(self.crypt_results);
        for i in 0..16 {
            block[i] ^= self.iv[i];
        }
        self.cipher().encrypt_block(&mut block);
        self.crypt_results.copy_from_slice(&block);
        self.iv = self.crypt_results;
    }

    fn decrypt_ecb(&mut self) {
        trace!("[AES] Decrypt ECB");
        let mut block = GenericArray::from(self.crypt_results);
        self.cipher().decrypt_block(&mut block);
        self.crypt_results.copy_from_slice(&block);
    }

    pub fn read_keycnt(&self) -> u8 {
        self.keycnt
    }

    pub fn write_keysel(&mut self, value: u8) {
        debug!("[AES] KEYSEL: ${:02X}", value);
        self.keysel = value;
    }

    pub fn write_keycnt(&mut self, value: u8) {
        debug!("[AES] KEYCNT: ${:02X}", value);
        self.keycnt = value;
    }

    pub fn write_block_count(&mut self, value: u16) {
        debug!("[AES] Block count: ${:04X}", value);
        self.block_count = value;
    }

    pub fn read32(&mut self, addr: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) -> u32 {
        match addr {
            0x10009000 => {
                let mut reg = self.input_fifo.len() as u32;
                reg |= (self.output_fifo.len() as u32) << 5;
                reg |= (self.cnt.dma_write_size as u32) << 12;
                reg |= (self.cnt.dma_read_size as u32) << 14;
                reg |= (self.cnt.mac_size as u32) << 16;
                reg |= (self.cnt.mac_input_ctrl as u32) << 20;
                reg |= (self.cnt.mac_status as u32) << 21;
                reg |= (self.cnt.out_big_endian as u32) << 22;
                reg |= (self.cnt.in_big_endian as u32) << 23;
                reg |= (self.cnt.out_word_order as u32) << 24;
                reg |= (self.cnt.in_word_order as u32) << 25;
                reg |= (self.cnt.mode as u32) << 27;
                reg |= (self.cnt.irq_enable as u32) << 30;
                reg |= (self.cnt.busy as u32) << 31;
                trace!("[AES] Read CNT: ${:08X}", reg);
                reg
            }
            0x10009004 => (self.mac_count as u32) | ((self.block_count as u32) << 16),
            0x1000900C => {
                if let Some(value) = self.output_fifo.pop_front() {
                    self.most_recent_output = value;
                }
                let reg = self.most_recent_output;
                self.crypt_check(int9, reqs);
                reg
            }
            _ => {
                warn!("[AES] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        if (0x10009020..0x10009030).contains(&addr) {
            trace!("[AES] Write CTR ${:08X}: ${:08X}", addr, value);
            let index = 3 - ((addr / 4) & 0x3) as usize;
            self.input_vector_ctr(index, value);
            self.iv = self.ctr_reg;
            return;
        }

        // KEY0-3: mirrors of the DSi key registers, fixed word order.
        if (0x10009040..0x10009100).contains(&addr) {
            let addr = addr - 0x10009040;
            let key = ((addr / 48) & 0x3) as usize;
            let fifo_id = (addr / 16) % 3;
            let offset = 3 - ((addr / 4) & 0x3) as usize;
            let mut word = [0u8; 4];
            let value = if !self.cnt.in_big_endian { value.swap_bytes() } else { value };
            word.copy_from_slice(&value.to_le_bytes());
            match fifo_id {
                0 => self.keys[key].normal[offset * 4..offset * 4 + 4].copy_from_slice(&word),
                1 => self.keys[key].x[offset * 4..offset * 4 + 4].copy_from_slice(&word),
                _ => {
                    self.keys[key].y[offset * 4..offset * 4 + 4].copy_from_slice(&word);
                    // Keygen runs every time the keyslot is updated.
                    self.gen_dsi_key(key);
                }
            }
            return;
        }

        match addr {
            0x10009000 => {
                debug!("[AES] Write CNT: ${:08X}", value);
                if self.cnt.in_word_order != (value & (1 << 25) != 0) {
                    // Flush the key FIFOs.
                    self.normal_ctr = 0;
                    self.x_ctr = 0;
                    self.y_ctr = 0;
                }
                self.cnt.dma_write_size = ((value >> 12) & 0x3) as u8;
                self.cnt.dma_read_size = ((value >> 14) & 0x3) as u8;
                self.cnt.mac_size = ((value >> 16) & 0x7) as u8;
                self.cnt.mac_input_ctrl = value & (1 << 20) != 0;
                self.cnt.out_big_endian = value & (1 << 22) != 0;
                self.cnt.in_big_endian = value & (1 << 23) != 0;
                self.cnt.out_word_order = value & (1 << 24) != 0;
                self.cnt.in_word_order = value & (1 << 25) != 0;
                self.cnt.mode = ((value >> 27) & 0x7) as u8;
                self.cnt.irq_enable = value & (1 << 30) != 0;
                self.cnt.busy = value & (1 << 31) != 0;

                self.send_dma_requests(reqs);
                reqs.clear_ndma(NDMA_AES2);

                if value & (1 << 26) != 0 {
                    let slot = (self.keysel & 0x3F) as usize;
                    self.init_aes_key(slot);
                }
            }
            0x10009004 => {
                self.mac_count = (value & 0xFFFF) as u16;
                self.block_count = (value >> 16) as u16;
            }
            0x10009008 => self.write_input_fifo(value, int9, reqs),
            0x10009100 => {
                trace!("[AES] Write KEYFIFO: ${:08X}", value);
                let index = self.fifo_index(self.normal_ctr);
                self.store_fifo_word(value, index, FifoKind::Normal);
                self.normal_ctr += 1;
                if self.normal_ctr >= 4 {
                    self.normal_ctr = 0;
                    self.keys[(self.keycnt & 0x3F) as usize].normal = self.normal_fifo;
                }
            }
            0x10009104 => {
                trace!("[AES] Write XFIFO: ${:08X}", value);
                let index = self.fifo_index(self.x_ctr);
                self.store_fifo_word(value, index, FifoKind::X);
                self.x_ctr += 1;
                if self.x_ctr >= 4 {
                    self.x_ctr = 0;
                    self.keys[(self.keycnt & 0x3F) as usize].x = self.x_fifo;
                }
            }
            0x10009108 => {
                trace!("[AES] Write YFIFO: ${:08X}", value);
                let index = self.fifo_index(self.y_ctr);
                self.store_fifo_word(value, index, FifoKind::Y);
                self.y_ctr += 1;
                // Once Y is complete, X and Y combine into a normal key.
                if self.y_ctr >= 4 {
                    self.y_ctr = 0;
                    let slot = (self.keycnt & 0x3F) as usize;
                    self.keys[slot].y = self.y_fifo;
                    self.gen_normal_key(slot);
                }
            }
            _ => warn!("[AES] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    fn write_input_fifo(&mut self, value: u32, int9: &mut Interrupt9, reqs: &mut DmaRequests) {
        let index = self.fifo_index(self.temp_input_ctr);
        let value_bytes = self.endian_in(value).to_le_bytes();
        self.temp_input[index * 4..index * 4 + 4].copy_from_slice(&value_bytes);
        self.temp_input_ctr += 1;
        if self.temp_input_ctr == 4 {
            self.temp_input_ctr = 0;
            for i in 0..4 {
                let word = u32::from_le_bytes([
                    self.temp_input[i * 4],
                    self.temp_input[i * 4 + 1],
                    self.temp_input[i * 4 + 2],
                    self.temp_input[i * 4 + 3],
                ]);
                self.input_fifo.push_back(word);
            }
        }
        self.crypt_check(int9, reqs);
    }

    fn endian_in(&self, value: u32) -> u32 {
        if !self.cnt.in_big_endian {
            value.swap_bytes()
        } else {
            value
        }
    }

    fn fifo_index(&self, ctr: usize) -> usize {
        if !self.cnt.in_word_order {
            3 - ctr
        } else {
            ctr
        }
    }

    fn input_vector_ctr(&mut self, index: usize, value: u32) {
        let value = self.endian_in(value);
        self.ctr_reg[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn store_fifo_word(&mut self, value: u32, index: usize, kind: FifoKind) {
        let value = self.endian_in(value).to_le_bytes();
        let target = match kind {
            FifoKind::Normal => &mut self.normal_fifo,
            FifoKind::X => &mut self.x_fifo,
            FifoKind::Y => &mut self.y_fifo,
        };
        target[index * 4..index * 4 + 4].copy_from_slice(&value);
    }

    fn send_dma_requests(&self, reqs: &mut DmaRequests) {
        if !self.cnt.busy {
            reqs.clear_ndma(NDMA_AES_WRITEFREE);
        } else if self.input_fifo.len() <= 8 {
            reqs.set_ndma(NDMA_AES_WRITEFREE);
        } else {
            reqs.clear_ndma(NDMA_AES_WRITEFREE);
        }

        if self.output_fifo.len() >= 4 {
            reqs.set_ndma(NDMA_AES_READFREE);
        } else {
            reqs.clear_ndma(NDMA_AES_READFREE);
        }
    }
}

#[derive(Clone, Copy)]
enum FifoKind {
    Normal,
    X,
    Y,
}

// Streaming SHA-256 engine. The compression function itself comes from the
// sha2 crate; this module owns what the hardware owns: the byte-granular
// input FIFO, the length counter and the final-round padding.

use crate::bus::DmaRequests;
use crate::corelink::XDMA_SHA;
use log::{debug, trace, warn};
use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

const H0: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

#[derive(Default)]
struct ShaCnt {
    busy: bool,
    final_round: bool,
    irq0_enable: bool,
    irq1_enable: bool,
    out_big_endian: bool,
    mode: u8,
}

pub struct Sha {
    cnt: ShaCnt,
    hash: [u32; 8],
    // Block staging: bytes accumulate here until a full 64-byte block is
    // ready for one compression round.
    buf: Vec<u8>,
    message_len: u64,
}

impl Sha {
    pub fn new() -> Self {
        Sha { cnt: ShaCnt::default(), hash: H0, buf: Vec::with_capacity(64), message_len: 0 }
    }

    pub fn reset(&mut self) {
        self.cnt.busy = false;
        self.cnt.final_round = false;
        self.buf.clear();
        self.message_len = 0;
    }

    fn reset_hash(&mut self) {
        self.hash = H0;
        self.message_len = 0;
        self.buf.clear();
    }

    pub fn read_hash(&self, addr: u32) -> u8 {
        let index = ((addr / 4) & 0x7) as usize;
        let offset = (addr & 0x3) as usize;
        ((self.hash[index] >> (offset * 8)) & 0xFF) as u8
    }

    pub fn read32(&self, addr: u32) -> u32 {
        match addr {
            0x1000A000 => {
                let mut reg = 0;
                reg |= (self.cnt.irq0_enable as u32) << 2;
                reg |= (self.cnt.out_big_endian as u32) << 3;
                reg |= (self.cnt.mode as u32) << 4;
                reg |= (self.cnt.irq1_enable as u32) << 10;
                trace!("[SHA] Read32 SHA_CNT: ${:08X}", reg);
                reg
            }
            _ => {
                warn!("[SHA] Unrecognized read32 ${:08X}", addr);
                0
            }
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32, reqs: &mut DmaRequests) {
        if (0x1000A080..0x1000A0C0).contains(&addr) {
            self.write_fifo(&value.to_le_bytes(), reqs);
            return;
        }
        match addr {
            0x1000A000 => {
                debug!("[SHA] Write32 SHA_CNT: ${:08X}", value);
                if value & 0x1 != 0 {
                    self.reset_hash();
                }
                self.cnt.busy = value & 0x1 != 0;
                self.cnt.irq0_enable = value & (1 << 2) != 0;
                self.cnt.out_big_endian = value & (1 << 3) != 0;
                self.cnt.mode = ((value >> 4) & 0x3) as u8;
                self.cnt.irq1_enable = value & (1 << 10) != 0;
                self.update_dma_request(reqs);
                if value & (1 << 1) != 0 {
                    self.do_hash_final();
                    self.cnt.busy = false;
                    reqs.clear_xdma(XDMA_SHA);
                }
            }
            _ => warn!("[SHA] Unrecognized write32 ${:08X}: ${:08X}", addr, value),
        }
    }

    pub fn write_fifo16(&mut self, value: u16, reqs: &mut DmaRequests) {
        self.write_fifo(&value.to_le_bytes(), reqs);
    }

    pub fn write_fifo8(&mut self, value: u8, reqs: &mut DmaRequests) {
        self.write_fifo(&[value], reqs);
    }

    fn write_fifo(&mut self, bytes: &[u8], reqs: &mut DmaRequests) {
        for &b in bytes {
            self.buf.push(b);
            self.message_len += 1;
            if self.buf.len() == 64 {
                self.do_hash_block();
            }
        }
        self.update_dma_request(reqs);
    }

    fn update_dma_request(&self, reqs: &mut DmaRequests) {
        // The engine can always take another burst while it is enabled.
        if self.cnt.busy {
            reqs.set_xdma(XDMA_SHA);
        } else {
            reqs.clear_xdma(XDMA_SHA);
        }
    }

    fn do_hash_block(&mut self) {
        match self.cnt.mode {
            0x0 => self.compress(),
            mode => panic!("[SHA] Unrecognized hash mode {}", mode),
        }
    }

    fn do_hash_final(&mut self) {
        debug!("[SHA] Final round: {} bytes", self.message_len);
        let bit_len = self.message_len * 8;

        // Standard Merkle-Damgard padding: 0x80, zeroes to 56 mod 64, then
        // the bit length. Spills into a second block when fewer than eight
        // bytes remain.
        self.buf.push(0x80);
        if self.buf.len() == 64 {
            self.do_hash_block();
        }
        if self.buf.len() > 56 {
            while self.buf.len() < 64 {
                self.buf.push(0);
            }
            self.do_hash_block();
        }
        while self.buf.len() < 56 {
            self.buf.push(0);
        }
        self.buf.extend_from_slice(&bit_len.to_be_bytes());
        self.do_hash_block();

        if self.cnt.out_big_endian {
            for word in self.hash.iter_mut() {
                *word = word.swap_bytes();
            }
        }
    }

    fn compress(&mut self) {
        let block = GenericArray::clone_from_slice(&self.buf);
        compress256(&mut self.hash, &[block]);
        self.buf.clear();
    }
}

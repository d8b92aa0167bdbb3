// Inter-processor FIFO pair between the ARM9 and ARM11 clusters, plus the
// SYNC handshake register with its doorbell bits. Error conditions
// (push-to-full, pop-from-empty) latch into CNT until acknowledged.

use crate::interrupt9::{Interrupt9, IRQ_PXI_NOT_EMPTY, IRQ_PXI_NOT_FULL, IRQ_PXI_SYNC};
use crate::mpcore::{MpcorePmr, IRQ_PXI_NOT_EMPTY11, IRQ_PXI_NOT_FULL11, IRQ_PXI_SYNC11};
use log::{debug, trace};
use std::collections::VecDeque;

const FIFO_DEPTH: usize = 16;

#[derive(Default)]
struct PxiCnt {
    send_empty_irq: bool,
    recv_irq: bool,
    error: bool,
    enabled: bool,
}

pub struct Pxi {
    fifo9to11: VecDeque<u32>,
    fifo11to9: VecDeque<u32>,
    // Each side reads the byte the other side last sent.
    sync_data9: u8,
    sync_data11: u8,
    sync_irq_enable9: bool,
    sync_irq_enable11: bool,
    cnt9: PxiCnt,
    cnt11: PxiCnt,
    last_recv9: u32,
    last_recv11: u32,
}

impl Pxi {
    pub fn new() -> Self {
        Pxi {
            fifo9to11: VecDeque::with_capacity(FIFO_DEPTH),
            fifo11to9: VecDeque::with_capacity(FIFO_DEPTH),
            sync_data9: 0,
            sync_data11: 0,
            sync_irq_enable9: false,
            sync_irq_enable11: false,
            cnt9: PxiCnt::default(),
            cnt11: PxiCnt::default(),
            last_recv9: 0,
            last_recv11: 0,
        }
    }

    pub fn reset(&mut self) {
        self.fifo9to11.clear();
        self.fifo11to9.clear();
        self.sync_data9 = 0;
        self.sync_data11 = 0;
        self.cnt9 = PxiCnt::default();
        self.cnt11 = PxiCnt::default();
    }

    pub fn read_sync9(&self) -> u32 {
        self.sync_data9 as u32
    }

    pub fn read_sync11(&self) -> u32 {
        self.sync_data11 as u32
    }

    pub fn write_sync9(&mut self, value: u32, pmr: &mut MpcorePmr) {
        trace!("[PXI] Write SYNC9: ${:08X}", value);
        self.sync_data11 = ((value >> 8) & 0xFF) as u8;
        self.sync_irq_enable9 = value & (1 << 31) != 0;
        // Doorbell to the ARM11.
        if value & (1 << 29) != 0 && self.sync_irq_enable11 {
            pmr.assert_hw_irq(IRQ_PXI_SYNC11);
        }
    }

    pub fn write_sync11(&mut self, value: u32, int9: &mut Interrupt9) {
        trace!("[PXI] Write SYNC11: ${:08X}", value);
        self.sync_data9 = ((value >> 8) & 0xFF) as u8;
        self.sync_irq_enable11 = value & (1 << 31) != 0;
        // Doorbell to the ARM9.
        if value & (1 << 30) != 0 && self.sync_irq_enable9 {
            int9.assert_irq(IRQ_PXI_SYNC);
        }
    }

    fn cnt_value(cnt: &PxiCnt, send: &VecDeque<u32>, recv: &VecDeque<u32>) -> u16 {
        let mut reg = send.is_empty() as u16;
        reg |= ((send.len() == FIFO_DEPTH) as u16) << 1;
        reg |= (cnt.send_empty_irq as u16) << 2;
        reg |= (recv.is_empty() as u16) << 8;
        reg |= ((recv.len() == FIFO_DEPTH) as u16) << 9;
        reg |= (cnt.recv_irq as u16) << 10;
        reg |= (cnt.error as u16) << 14;
        reg |= (cnt.enabled as u16) << 15;
        reg
    }

    pub fn read_cnt9(&self) -> u16 {
        Self::cnt_value(&self.cnt9, &self.fifo9to11, &self.fifo11to9)
    }

    pub fn read_cnt11(&self) -> u16 {
        Self::cnt_value(&self.cnt11, &self.fifo11to9, &self.fifo9to11)
    }

    pub fn write_cnt9(&mut self, value: u16) {
        debug!("[PXI] Write CNT9: ${:04X}", value);
        self.cnt9.send_empty_irq = value & (1 << 2) != 0;
        if value & (1 << 3) != 0 {
            self.fifo9to11.clear();
        }
        self.cnt9.recv_irq = value & (1 << 10) != 0;
        if value & (1 << 14) != 0 {
            self.cnt9.error = false;
        }
        self.cnt9.enabled = value & (1 << 15) != 0;
    }

    pub fn write_cnt11(&mut self, value: u16) {
        debug!("[PXI] Write CNT11: ${:04X}", value);
        self.cnt11.send_empty_irq = value & (1 << 2) != 0;
        if value & (1 << 3) != 0 {
            self.fifo11to9.clear();
        }
        self.cnt11.recv_irq = value & (1 << 10) != 0;
        if value & (1 << 14) != 0 {
            self.cnt11.error = false;
        }
        self.cnt11.enabled = value & (1 << 15) != 0;
    }

    pub fn send_to_11(&mut self, value: u32, pmr: &mut MpcorePmr) {
        trace!("[PXI] ARM9 send: ${:08X}", value);
        if self.fifo9to11.len() == FIFO_DEPTH {
            self.cnt9.error = true;
            return;
        }
        let was_empty = self.fifo9to11.is_empty();
        self.fifo9to11.push_back(value);
        if was_empty && self.cnt11.recv_irq {
            pmr.assert_hw_irq(IRQ_PXI_NOT_EMPTY11);
        }
    }

    pub fn send_to_9(&mut self, value: u32, int9: &mut Interrupt9) {
        trace!("[PXI] ARM11 send: ${:08X}", value);
        if self.fifo11to9.len() == FIFO_DEPTH {
            self.cnt11.error = true;
            return;
        }
        let was_empty = self.fifo11to9.is_empty();
        self.fifo11to9.push_back(value);
        if was_empty && self.cnt9.recv_irq {
            int9.assert_irq(IRQ_PXI_NOT_EMPTY);
        }
    }

    pub fn read_msg9(&mut self, pmr: &mut MpcorePmr) -> u32 {
        match self.fifo11to9.pop_front() {
            Some(value) => {
                self.last_recv9 = value;
                // Tell the ARM11 its send FIFO has room again.
                if self.fifo11to9.is_empty() && self.cnt11.send_empty_irq {
                    pmr.assert_hw_irq(IRQ_PXI_NOT_FULL11);
                }
                value
            }
            None => {
                self.cnt9.error = true;
                self.last_recv9
            }
        }
    }

    pub fn read_msg11(&mut self, int9: &mut Interrupt9) -> u32 {
        match self.fifo9to11.pop_front() {
            Some(value) => {
                self.last_recv11 = value;
                if self.fifo9to11.is_empty() && self.cnt9.send_empty_irq {
                    int9.assert_irq(IRQ_PXI_NOT_FULL);
                }
                value
            }
            None => {
                self.cnt11.error = true;
                self.last_recv11
            }
        }
    }
}

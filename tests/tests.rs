use em3ds::bus::CpuId;
use em3ds::scheduler::{Event, Scheduler};
use em3ds::wifi::WifiSoc;
use em3ds::xtensa::Xtensa;
use em3ds::{Emulator, Signal};
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

fn make_emulator() -> Emulator {
    let mut em = Emulator::new();
    let boot9 = vec![0u8; 1024 * 64];
    let boot11 = vec![0u8; 1024 * 64];
    let otp = vec![0u8; 256];
    em.load_roms(&boot9, &boot11, &otp);
    em.reset();
    em
}

fn temp_image(name: &str, contents: &[u8]) -> (PathBuf, File) {
    let path = std::env::temp_dir().join(format!("em3ds-test-{}-{}", std::process::id(), name));
    fs::write(&path, contents).unwrap();
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    (path, file)
}

// ---- Interrupt9 ----

#[test]
fn int9_line_tracks_ie_and_if() {
    let mut em = make_emulator();
    assert!(!em.bus.int9.line());

    em.bus.arm9_write32(0x10001000, 1 << 16);
    assert!(!em.bus.int9.line());

    em.bus.int9.assert_irq(16);
    assert!(em.bus.int9.line());

    // IF is write-1-to-clear.
    em.bus.arm9_write32(0x10001004, 1 << 16);
    assert!(!em.bus.int9.line());
    assert_eq!(em.bus.arm9_read32(0x10001004), 0);
}

// ---- MPCore PMR ----

fn pmr_setup_core0(em: &mut Emulator) {
    // Enable the CPU interface, open the priority mask and unmask
    // interrupts 64-95 with core 0 as target.
    em.bus.arm11_write32(0, 0x17E00100, 1);
    em.bus.arm11_write32(0, 0x17E00104, 0xF0);
    em.bus.arm11_write32(0, 0x17E01108, 0xFFFFFFFF);
    for i in 0..32 {
        em.bus.arm11_write8(0, 0x17E01820 + 32 + i, 0x1);
    }
}

#[test]
fn pmr_acknowledge_is_atomic() {
    let mut em = make_emulator();
    pmr_setup_core0(&mut em);

    em.bus.pmr.assert_hw_irq(0x40);
    assert!(em.bus.pmr.int_line(0));
    assert_eq!(em.bus.arm11_read32(0, 0x17E00118), 0x40);

    // The acknowledge read returns the cause, clears the pending bit and
    // makes the interrupt active.
    let cause = em.bus.arm11_read32(0, 0x17E0010C);
    assert_eq!(cause, 0x40);
    assert!(!em.bus.pmr.int_line(0));
    assert_eq!(em.bus.arm11_read32(0, 0x17E01208), 0);

    // End of interrupt; nothing else pending.
    em.bus.arm11_write32(0, 0x17E00110, cause);
    assert!(!em.bus.pmr.int_line(0));
    assert_eq!(em.bus.arm11_read32(0, 0x17E00118), 1023);
}

#[test]
fn pmr_priority_tie_resolves_to_lower_id() {
    let mut em = make_emulator();
    pmr_setup_core0(&mut em);

    em.bus.pmr.assert_hw_irq(0x45);
    em.bus.pmr.assert_hw_irq(0x41);
    let cause = em.bus.arm11_read32(0, 0x17E0010C);
    assert_eq!(cause, 0x41);
}

#[test]
fn pmr_preemption_by_higher_priority() {
    let mut em = make_emulator();
    pmr_setup_core0(&mut em);

    // Priorities: int 0x41 at 8, int 0x42 at 2.
    em.bus.arm11_write8(0, 0x17E01420 + 0x21, 8 << 4);
    em.bus.arm11_write8(0, 0x17E01420 + 0x22, 2 << 4);

    em.bus.pmr.assert_hw_irq(0x41);
    let cause = em.bus.arm11_read32(0, 0x17E0010C);
    assert_eq!(cause, 0x41);
    assert!(!em.bus.pmr.int_line(0));

    // A strictly higher-priority interrupt preempts the active one.
    em.bus.pmr.assert_hw_irq(0x42);
    assert!(em.bus.pmr.int_line(0));

    // With preemption disabled the line stays quiet for an equal-priority
    // arrival.
    em.bus.arm11_write32(0, 0x17E00110, cause);
    em.bus.arm11_write32(0, 0x17E00108, 0x7);
    em.bus.pmr.assert_hw_irq(0x41);
    let cause = em.bus.arm11_read32(0, 0x17E0010C);
    assert_eq!(cause & 0x3FF, 0x42);
    em.bus.pmr.assert_hw_irq(0x42);
    assert!(!em.bus.pmr.int_line(0));
}

#[test]
fn pmr_sgi_carries_requester_id() {
    let mut em = make_emulator();
    pmr_setup_core0(&mut em);

    // Core 1 sends SGI 3 to core 0 via the target list.
    em.bus.arm11_write32(1, 0x17E01F00, (1 << 16) | 3);
    assert!(em.bus.pmr.int_line(0));
    let cause = em.bus.arm11_read32(0, 0x17E0010C);
    assert_eq!(cause & 0x3FF, 3);
    assert_eq!((cause >> 10) & 0x7, 1);

    // All-but-self reaches everyone else.
    em.bus.arm11_write32(0, 0x17E01F00, (1 << 24) | 5);
    for core in 1..4 {
        assert_eq!(em.bus.arm11_read32(core, 0x17E01200) & (1 << 5), 1 << 5);
    }
    assert_eq!(em.bus.arm11_read32(0, 0x17E01200) & (1 << 5), 0);
}

// ---- Timers ----

#[test]
fn arm9_timer_overflow_and_cascade() {
    let mut em = make_emulator();

    // Timer 0: prescaler 1, IRQ on overflow. Timer 1: count-up cascade.
    em.bus.arm9_write16(0x10003000, 0xFFFF);
    em.bus.arm9_write16(0x10003004, 0xFFFF);
    em.bus.arm9_write16(0x10003006, (1 << 2) | (1 << 6) | (1 << 7));
    em.bus.arm9_write16(0x10003002, (1 << 6) | (1 << 7));

    em.bus.run_timers();
    let iflag = em.bus.int9.read_if();
    assert_ne!(iflag & (1 << 8), 0, "timer 0 overflow IRQ");
    assert_ne!(iflag & (1 << 9), 0, "timer 1 cascade IRQ");
    assert_eq!(em.bus.arm9_read16(0x10003000), 0);
}

#[test]
fn arm11_private_timer_fires_per_core() {
    let mut em = make_emulator();

    // Core 2's private timer: load 4, enable + auto-reload + IRQ.
    em.bus.arm11_write32(2, 0x17E00600, 4);
    em.bus.arm11_write32(2, 0x17E00608, 0x7);
    em.bus.arm11_write32(2, 0x17E00100, 1);
    em.bus.arm11_write32(2, 0x17E00104, 0xF0);
    em.bus.arm11_write32(2, 0x17E01100, 1 << 29);

    for _ in 0..4 {
        em.bus.run_timers();
    }
    assert_eq!(em.bus.arm11_read32(2, 0x17E0060C), 1);
    assert!(em.bus.pmr.int_line(2));
    assert!(!em.bus.pmr.int_line(0));
    let cause = em.bus.arm11_read32(2, 0x17E0010C);
    assert_eq!(cause & 0x3FF, 29);

    // Int-status is write-1-to-clear; auto-reload restarted the counter.
    em.bus.arm11_write32(2, 0x17E0060C, 1);
    assert_eq!(em.bus.arm11_read32(2, 0x17E0060C), 0);
    assert_eq!(em.bus.arm11_read32(2, 0x17E00604), 4);
}

// ---- NDMA ----

#[test]
fn ndma_immediate_copies_exactly_write_count_words() {
    let mut em = make_emulator();

    for i in 0..8u32 {
        em.bus.arm9_write32(0x1FF80000 + i * 4, 0xCAFE0000 + i);
    }

    em.bus.arm9_write32(0x10002004, 0x1FF80000);
    em.bus.arm9_write32(0x10002008, 0x1FF80100);
    em.bus.arm9_write32(0x10002010, 4);
    em.bus.arm9_write32(0x1000201C, (1 << 28) | (1 << 30) | (1 << 31));

    for i in 0..4u32 {
        assert_eq!(em.bus.arm9_read32(0x1FF80100 + i * 4), 0xCAFE0000 + i);
    }
    // Exactly four words: the fifth destination slot is untouched.
    assert_eq!(em.bus.arm9_read32(0x1FF80110), 0);
    // Finished: busy clear, completion IRQ latched.
    assert_eq!(em.bus.arm9_read32(0x1000201C) >> 31, 0);
    assert_ne!(em.bus.int9.read_if() & 0x1, 0);
}

#[test]
fn ndma_triggered_blocks_decrement_transfer_count() {
    let mut em = make_emulator();

    for i in 0..8u32 {
        em.bus.arm9_write32(0x1FF80000 + i * 4, 0x1000 + i);
    }

    em.bus.arm9_write32(0x10002004, 0x1FF80000);
    em.bus.arm9_write32(0x10002008, 0x1FF80200);
    // Total transfer: 8 words in blocks of 4, triggered by MMC1.
    em.bus.arm9_write32(0x1000200C, 8);
    em.bus.arm9_write32(0x10002010, 4);
    em.bus.arm9_write32(0x1000201C, (6 << 24) | (1 << 31));

    em.bus.reqs.set_ndma(6);
    em.bus.process_ndma();
    assert_eq!(em.bus.arm9_read32(0x1000200C), 4);
    em.bus.process_ndma();
    assert_eq!(em.bus.arm9_read32(0x1000200C), 0);
    assert_eq!(em.bus.arm9_read32(0x1000201C) >> 31, 0);

    for i in 0..8u32 {
        assert_eq!(em.bus.arm9_read32(0x1FF80200 + i * 4), 0x1000 + i);
    }
}

// ---- Corelink DMA ----

fn xdma_debug_exec(em: &mut Emulator, instr: [u8; 6], chan: Option<u32>) {
    let mut d0 = ((instr[0] as u32) << 16) | ((instr[1] as u32) << 24);
    if let Some(chan) = chan {
        d0 |= 1 | (chan << 8);
    }
    let d1 = u32::from_le_bytes([instr[2], instr[3], instr[4], instr[5]]);
    em.bus.arm9_write32(0x1000CD08, d0);
    em.bus.arm9_write32(0x1000CD0C, d1);
    em.bus.arm9_write32(0x1000CD04, 0);
}

fn xdma_go(em: &mut Emulator, chan: u8, pc: u32) {
    let mut go = [0u8; 6];
    go[0] = 0xA2;
    go[1] = chan;
    go[2..6].copy_from_slice(&pc.to_le_bytes());
    xdma_debug_exec(em, go, None);
}

#[test]
fn xdma_program_copies_sixteen_bytes() {
    let mut em = make_emulator();

    for i in 0..4u32 {
        em.bus.arm9_write32(0x1FF80000 + i * 4, 0xAB000000 + i);
    }

    // chan 0 program: DMAMOV SAR / CCR / DAR, DMALD, DMAST, DMAEND.
    let ccr: u32 = 1 | (2 << 1) | (3 << 4) | (1 << 14) | (2 << 15) | (3 << 18);
    let mut program = Vec::new();
    program.extend_from_slice(&[0xBC, 0x00]);
    program.extend_from_slice(&0x1FF80000u32.to_le_bytes());
    program.extend_from_slice(&[0xBC, 0x01]);
    program.extend_from_slice(&ccr.to_le_bytes());
    program.extend_from_slice(&[0xBC, 0x02]);
    program.extend_from_slice(&0x08000000u32.to_le_bytes());
    program.push(0x04);
    program.push(0x08);
    program.push(0x00);

    for (i, &b) in program.iter().enumerate() {
        em.bus.arm9_write8(0x1FF81000 + i as u32, b);
    }

    // Kick the program off through the debug registers: DMAGO on the
    // manager thread.
    xdma_go(&mut em, 0, 0x1FF81000);
    em.bus.process_xdma();

    for i in 0..4u32 {
        assert_eq!(em.bus.arm9_read32(0x08000000 + i * 4), 0xAB000000 + i);
    }
    // Channel parked again.
    assert_eq!(em.bus.arm9_read32(0x1000C100), 0);
}

#[test]
fn xdma_sev_raises_exactly_one_irq() {
    let mut em = make_emulator();

    // Enable event 2 and fire DMASEV 2 on channel 1 via the debug path.
    em.bus.arm9_write32(0x1000C020, 1 << 2);
    xdma_debug_exec(&mut em, [0x34, 2 << 3, 0x00, 0x00, 0x00, 0x00], Some(1));

    assert_ne!(em.bus.int9.read_if() & (1 << 28), 0);
    assert_eq!(em.bus.arm9_read32(0x1000C024), 1 << 2);
    assert_eq!(em.bus.arm9_read32(0x1000C028), 1 << 2);

    // Acknowledge; nothing refires without another DMASEV.
    em.bus.arm9_write32(0x10001004, 1 << 28);
    em.bus.arm9_write32(0x1000C02C, 1 << 2);
    em.bus.process_xdma();
    assert_eq!(em.bus.int9.read_if() & (1 << 28), 0);
    assert_eq!(em.bus.arm9_read32(0x1000C024), 0);

    // A masked event sets no flag and no IRQ.
    xdma_debug_exec(&mut em, [0x34, 5 << 3, 0x00, 0x00, 0x00, 0x00], Some(1));
    assert_eq!(em.bus.int9.read_if() & (1 << 28), 0);
    assert_eq!(em.bus.arm9_read32(0x1000C028), 0);
}

#[test]
fn xdma_loops_rerun_the_body() {
    let mut em = make_emulator();

    for i in 0..8u32 {
        em.bus.arm9_write32(0x1FF80000 + i * 4, 0x500 + i);
    }

    // One 4-byte burst per iteration: DMALP0 7; DMALD; DMAST; DMALPEND.
    let ccr: u32 = 1 | (2 << 1) | (1 << 14) | (2 << 15);
    let mut program = Vec::new();
    program.extend_from_slice(&[0xBC, 0x00]);
    program.extend_from_slice(&0x1FF80000u32.to_le_bytes());
    program.extend_from_slice(&[0xBC, 0x01]);
    program.extend_from_slice(&ccr.to_le_bytes());
    program.extend_from_slice(&[0xBC, 0x02]);
    program.extend_from_slice(&0x08000100u32.to_le_bytes());
    program.extend_from_slice(&[0x20, 7]);
    program.push(0x04);
    program.push(0x08);
    // Jump back over the 2-byte loop body.
    program.extend_from_slice(&[0x38, 2]);
    program.push(0x00);

    for (i, &b) in program.iter().enumerate() {
        em.bus.arm9_write8(0x1FF81000 + i as u32, b);
    }

    xdma_go(&mut em, 0, 0x1FF81000);
    em.bus.process_xdma();

    for i in 0..8u32 {
        assert_eq!(em.bus.arm9_read32(0x08000100 + i * 4), 0x500 + i);
    }
}

// ---- EMMC ----

fn emmc_arg(em: &mut Emulator, arg: u32) {
    em.bus.arm9_write16(0x10006004, arg as u16);
    em.bus.arm9_write16(0x10006006, (arg >> 16) as u16);
}

fn emmc_cmd(em: &mut Emulator, cmd: u16) {
    em.bus.arm9_write16(0x10006000, cmd);
}

#[test]
fn emmc_cmd18_streams_nand_blocks() {
    let mut nand = vec![0u8; 4096];
    for (i, b) in nand.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let (_path, file) = temp_image("nand-read", &nand);

    let mut em = make_emulator();
    em.mount_nand(file);

    // NAND port, 512-byte blocks, 2 blocks from offset 0.
    em.bus.arm9_write16(0x10006002, 1);
    em.bus.arm9_write16(0x10006026, 0x200);
    em.bus.arm9_write16(0x1000600A, 2);
    emmc_arg(&mut em, 0);
    emmc_cmd(&mut em, 18);

    let mut data = Vec::new();
    for _ in 0..256 {
        data.extend_from_slice(&em.bus.arm9_read32(0x1000610C).to_le_bytes());
    }
    assert_eq!(&data[..], &nand[..1024]);

    // Transfer finished: DATAEND and CMDEND latched.
    let istat_l = em.bus.arm9_read16(0x1000601C);
    assert_ne!(istat_l & 0x1, 0, "CMDEND");
    assert_ne!(istat_l & 0x4, 0, "DATAEND");
}

#[test]
fn emmc_cmd25_then_cmd18_roundtrips_nand() {
    let (_path, file) = temp_image("nand-rw", &vec![0u8; 4096]);

    let mut em = make_emulator();
    em.mount_nand(file);

    em.bus.arm9_write16(0x10006002, 1);
    em.bus.arm9_write16(0x10006026, 0x200);
    em.bus.arm9_write16(0x1000600A, 2);
    emmc_arg(&mut em, 0x200);
    emmc_cmd(&mut em, 25);

    let pattern: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();
    for chunk in pattern.chunks(4) {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        em.bus.arm9_write32(0x1000610C, word);
    }

    let istat_l = em.bus.arm9_read16(0x1000601C);
    assert_ne!(istat_l & 0x4, 0, "DATAEND after write");

    em.bus.arm9_write16(0x1000600A, 2);
    emmc_arg(&mut em, 0x200);
    emmc_cmd(&mut em, 18);
    let mut data = Vec::new();
    for _ in 0..256 {
        data.extend_from_slice(&em.bus.arm9_read32(0x1000610C).to_le_bytes());
    }
    assert_eq!(data, pattern);
}

#[test]
fn emmc_state_machine_walks_identification() {
    let (_path, file) = temp_image("nand-id", &vec![0u8; 1024]);
    let mut em = make_emulator();
    em.mount_nand(file);
    em.bus.arm9_write16(0x10006002, 1);

    // R1 status carries the state in bits 9-12.
    let state = |em: &mut Emulator| {
        emmc_cmd(em, 13);
        (em.bus.arm9_read16(0x1000600C) as u32
            | ((em.bus.arm9_read16(0x1000600E) as u32) << 16))
            >> 9
    };

    emmc_cmd(&mut em, 0);
    assert_eq!(state(&mut em), 0, "Idle");

    emmc_cmd(&mut em, 55);
    emmc_cmd(&mut em, 41);
    assert_eq!(state(&mut em), 1, "Ready");

    emmc_cmd(&mut em, 2);
    assert_eq!(state(&mut em), 2, "Identify");

    emmc_cmd(&mut em, 3);
    assert_eq!(state(&mut em), 3, "Standby");

    emmc_cmd(&mut em, 7);
    assert_eq!(state(&mut em), 4, "Transfer");
}

#[test]
fn emmc_blklen_clamps_at_512() {
    let mut em = make_emulator();
    em.bus.arm9_write16(0x10006026, 0x400);
    assert_eq!(em.bus.arm9_read16(0x10006026), 0x200);
}

#[test]
fn emmc_irq_is_edge_gated_per_mask() {
    let (_path, file) = temp_image("nand-irq", &vec![0u8; 1024]);
    let mut em = make_emulator();
    em.mount_nand(file);

    // Unmask CMDEND only.
    em.bus.arm9_write16(0x10006020, 0x1);
    emmc_cmd(&mut em, 0);
    assert_ne!(em.bus.int9.read_if() & (1 << 16), 0);

    // Acknowledge the CPU-side flag but leave ISTAT set: further commands
    // must not generate a second edge.
    em.bus.arm9_write32(0x10001004, 1 << 16);
    emmc_cmd(&mut em, 13);
    assert_eq!(em.bus.int9.read_if() & (1 << 16), 0);

    // After clearing the ISTAT bit a new command fires again.
    em.bus.arm9_write16(0x1000601C, 0);
    emmc_cmd(&mut em, 13);
    assert_ne!(em.bus.int9.read_if() & (1 << 16), 0);
}

// ---- AES ----

fn ror128(mut v: [u8; 16], n: u32) -> [u8; 16] {
    for _ in 0..n {
        let carry = v[15] & 1;
        for i in (1..16).rev() {
            v[i] = (v[i] >> 1) | ((v[i - 1] & 1) << 7);
        }
        v[0] = (v[0] >> 1) | (carry << 7);
    }
    v
}

#[test]
fn aes_keygen_of_zero_keys_is_rotated_constant() {
    let mut em = make_emulator();

    // X and Y of slot 0 both zero; writing the fourth Y word runs keygen.
    for _ in 0..4 {
        em.bus.arm9_write32(0x10009104, 0);
    }
    for _ in 0..4 {
        em.bus.arm9_write32(0x10009108, 0);
    }

    let key_const = [
        0x1F, 0xF9, 0xE9, 0xAA, 0xC5, 0xFE, 0x04, 0x08, 0x02, 0x45, 0x91, 0xDC, 0x5D, 0x52,
        0x76, 0x8A,
    ];
    let expected = ror128(key_const, 41);
    assert_eq!(em.bus.aes.key(0).normal, expected);
    // Sanity anchor for the rotation itself.
    assert_eq!(expected[0], 0xEE);
    assert_eq!(expected[15], 0xC8);
}

fn aes_set_normal_key(em: &mut Emulator) {
    for i in 0..4u32 {
        em.bus.arm9_write32(0x10009100, 0x01020304 * (i + 1));
    }
}

fn aes_set_iv(em: &mut Emulator) {
    for i in 0..4u32 {
        em.bus.arm9_write32(0x10009020 + i * 4, 0xA0B0C0D0 + i);
    }
}

#[test]
fn aes_cbc_roundtrip() {
    let mut em = make_emulator();
    aes_set_normal_key(&mut em);

    let plain = [0x11111111u32, 0x22222222, 0x33333333, 0x44444444];

    // Encrypt.
    aes_set_iv(&mut em);
    em.bus.arm9_write16(0x10009006, 1);
    em.bus.arm9_write32(0x10009000, (5 << 27) | (1 << 26) | (1 << 31));
    for &w in plain.iter() {
        em.bus.arm9_write32(0x10009008, w);
    }
    // A full block sits in the output FIFO at completion.
    let cnt = em.bus.arm9_read32(0x10009000);
    assert_eq!((cnt >> 5) & 0x1F, 4);
    assert_eq!(cnt >> 31, 0, "busy clears at block count zero");

    let mut cipher = [0u32; 4];
    for w in cipher.iter_mut() {
        *w = em.bus.arm9_read32(0x1000900C);
    }
    assert_ne!(cipher, plain);

    // Decrypt with the same keyslot and IV.
    aes_set_iv(&mut em);
    em.bus.arm9_write16(0x10009006, 1);
    em.bus.arm9_write32(0x10009000, (4 << 27) | (1 << 26) | (1 << 31));
    for &w in cipher.iter() {
        em.bus.arm9_write32(0x10009008, w);
    }
    for &expected in plain.iter() {
        assert_eq!(em.bus.arm9_read32(0x1000900C), expected);
    }
}

#[test]
fn aes_ctr_is_an_involution() {
    let mut em = make_emulator();
    aes_set_normal_key(&mut em);

    let plain = [0xDEADBEEFu32, 0x01234567, 0x89ABCDEF, 0x55AA55AA];

    aes_set_iv(&mut em);
    em.bus.arm9_write16(0x10009006, 1);
    em.bus.arm9_write32(0x10009000, (2 << 27) | (1 << 26) | (1 << 31));
    for &w in plain.iter() {
        em.bus.arm9_write32(0x10009008, w);
    }
    let mut cipher = [0u32; 4];
    for w in cipher.iter_mut() {
        *w = em.bus.arm9_read32(0x1000900C);
    }

    aes_set_iv(&mut em);
    em.bus.arm9_write16(0x10009006, 1);
    em.bus.arm9_write32(0x10009000, (2 << 27) | (1 << 26) | (1 << 31));
    for &w in cipher.iter() {
        em.bus.arm9_write32(0x10009008, w);
    }
    for &expected in plain.iter() {
        assert_eq!(em.bus.arm9_read32(0x1000900C), expected);
    }
}

#[test]
fn aes_irq_on_completion() {
    let mut em = make_emulator();
    aes_set_normal_key(&mut em);
    aes_set_iv(&mut em);
    em.bus.arm9_write16(0x10009006, 1);
    em.bus.arm9_write32(0x10009000, (6 << 27) | (1 << 26) | (1 << 30) | (1 << 31));
    for i in 0..4 {
        em.bus.arm9_write32(0x10009008, i);
    }
    assert_ne!(em.bus.int9.read_if() & (1 << 15), 0);
}

// ---- SHA ----

fn sha_read_hash(em: &mut Emulator) -> [u8; 32] {
    let mut hash = [0u8; 32];
    for i in 0..32u32 {
        hash[i as usize] = em.bus.arm9_read8(0x1000A040 + i);
    }
    hash
}

#[test]
fn sha256_of_empty_message() {
    let mut em = make_emulator();

    // Init + big-endian output, then finalize with nothing fed in.
    em.bus.arm9_write32(0x1000A000, 0x9);
    em.bus.arm9_write32(0x1000A000, 0xA);

    let expected: [u8; 32] = [
        0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
        0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
        0x78, 0x52, 0xb8, 0x55,
    ];
    assert_eq!(sha_read_hash(&mut em), expected);
}

const SHA_ABC: [u8; 32] = [
    0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22,
    0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00,
    0x15, 0xad,
];

#[test]
fn sha256_of_abc() {
    let mut em = make_emulator();

    em.bus.arm9_write32(0x1000A000, 0x9);
    em.bus.arm9_write16(0x1000A080, 0x6261);
    em.bus.arm9_write8(0x1000A080, 0x63);
    em.bus.arm9_write32(0x1000A000, 0xA);

    assert_eq!(sha_read_hash(&mut em), SHA_ABC);
}

#[test]
fn sha256_is_presentation_independent() {
    let mut em = make_emulator();

    // Same three bytes, fragmented into byte writes.
    em.bus.arm9_write32(0x1000A000, 0x9);
    for &b in b"abc" {
        em.bus.arm9_write8(0x1000A080, b);
    }
    em.bus.arm9_write32(0x1000A000, 0xA);

    assert_eq!(sha_read_hash(&mut em), SHA_ABC);
}

#[test]
fn sha256_long_message_crosses_blocks() {
    let mut em = make_emulator();

    // 64 'a' bytes: one full compression round, then the padding block.
    em.bus.arm9_write32(0x1000A000, 0x9);
    for _ in 0..16 {
        em.bus.arm9_write32(0x1000A080, 0x61616161);
    }
    em.bus.arm9_write32(0x1000A000, 0xA);

    let expected: [u8; 32] = [
        0xff, 0xe0, 0x54, 0xfe, 0x7a, 0xe0, 0xcb, 0x6d, 0xc6, 0x5c, 0x3a, 0xf9, 0xb6, 0x1d,
        0x52, 0x09, 0xf4, 0x39, 0x85, 0x1d, 0xb4, 0x3d, 0x0b, 0xa5, 0x99, 0x73, 0x37, 0xdf,
        0x15, 0x46, 0x68, 0xeb,
    ];
    assert_eq!(sha_read_hash(&mut em), expected);
}

// ---- RSA ----

#[test]
fn rsa_modexp_roundtrip() {
    let mut em = make_emulator();

    // Keyslot 0, ascending word order: p=61 q=53, N=3233, e=17, d=2753.
    em.bus.arm9_write32(0x1000B000, (1 << 8) | (1 << 9));

    let write_be = |em: &mut Emulator, base: u32, value: u32| {
        for i in 0..0x100u32 {
            let byte = if i >= 0xFC { (value >> ((0xFF - i) * 8)) as u8 } else { 0 };
            em.bus.arm9_write8(base, byte);
        }
    };

    write_be(&mut em, 0x1000B200, 17);
    write_be(&mut em, 0x1000B400, 3233);
    write_be(&mut em, 0x1000B800, 65);

    em.bus.arm9_write32(0x1000B000, (1 << 8) | (1 << 9) | 1);
    assert_ne!(em.bus.int9.read_if() & (1 << 22), 0);

    // 65^17 mod 3233 == 2790.
    assert_eq!(em.bus.arm9_read8(0x1000B8FF), (2790 & 0xFF) as u8);
    assert_eq!(em.bus.arm9_read8(0x1000B8FE), (2790 >> 8) as u8);

    // Run the inverse exponent over the result in place.
    write_be(&mut em, 0x1000B200, 2753);
    em.bus.arm9_write32(0x1000B000, (1 << 8) | (1 << 9) | 1);
    assert_eq!(em.bus.arm9_read8(0x1000B8FF), 65);
    assert_eq!(em.bus.arm9_read8(0x1000B8FE), 0);
}

// ---- Cartridge ----

#[test]
fn ctrcard_reads_header_and_id() {
    let mut rom = vec![0u8; 0x4000];
    for (i, b) in rom.iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    let (_path, file) = temp_image("card", &rom);

    let mut em = make_emulator();
    em.mount_cartridge(file);

    assert_eq!(em.bus.arm9_read8(0x10000010), 0, "cart inserted");

    // Cart id. The command buffer is written big-endian, last word first:
    // the word at +0x2C holds the command byte.
    em.bus.arm9_write32(0x1000402C, 0xA2000000);
    em.bus.arm9_write32(0x10004000, 1 << 31);
    assert_eq!(em.bus.arm9_read32(0x10004030), 0x9000FEC2);

    // Header read: 0x200 bytes from ROM offset 0x1000.
    em.bus.arm9_write32(0x1000402C, 0x82000000);
    em.bus.arm9_write32(0x10004000, 1 << 31);
    let mut header = Vec::new();
    for _ in 0..0x80 {
        header.extend_from_slice(&em.bus.arm9_read32(0x10004030).to_le_bytes());
    }
    assert_eq!(&header[..], &rom[0x1000..0x1200]);
    // Busy drops once the payload is drained.
    assert_eq!(em.bus.arm9_read32(0x10004000) >> 31, 0);
}

#[test]
fn ctrcard_bulk_read_uses_command_offset() {
    let mut rom = vec![0u8; 0x3000];
    for (i, b) in rom.iter_mut().enumerate() {
        *b = (i % 241) as u8;
    }
    let (_path, file) = temp_image("card-read", &rom);

    let mut em = make_emulator();
    em.mount_cartridge(file);

    // 0xBF: one 0x200 block from offset 0x2000, with IRQ at completion.
    em.bus.arm9_write32(0x10004004, 0);
    em.bus.arm9_write32(0x1000402C, 0xBF000000);
    em.bus.arm9_write32(0x10004028, 0x00002000);
    em.bus.arm9_write32(0x10004000, (1 << 30) | (1 << 31));

    let mut data = Vec::new();
    for _ in 0..0x80 {
        data.extend_from_slice(&em.bus.arm9_read32(0x10004030).to_le_bytes());
    }
    assert_eq!(&data[..], &rom[0x2000..0x2200]);
    assert_ne!(em.bus.int9.read_if() & (1 << 23), 0);
}

#[test]
fn spicard_id_and_save_roundtrip() {
    let (_path, file) = temp_image("card-spi", &vec![0u8; 0x1000]);
    let mut em = make_emulator();
    em.mount_cartridge(file);

    // Select, then read the card id.
    em.bus.arm9_write32(0x1000D800, 1 << 15);
    em.bus.arm9_write32(0x1000D808, 4);
    em.bus.arm9_write32(0x1000D80C, 0x9F);
    em.bus.arm9_write32(0x1000D800, 1 << 15);
    assert_eq!(em.bus.arm9_read32(0x1000D80C), 0x1122C2);
    em.bus.arm9_write32(0x1000D804, 0);

    // Write 4 bytes at save offset 0x20, then read them back.
    em.bus.arm9_write32(0x1000D800, 1 << 15);
    em.bus.arm9_write32(0x1000D808, 4);
    em.bus.arm9_write32(0x1000D80C, u32::from_le_bytes([0x02, 0x00, 0x00, 0x20]));
    em.bus.arm9_write32(0x1000D800, 1 << 15);
    em.bus.arm9_write32(0x1000D80C, u32::from_le_bytes([0xDE, 0xAD, 0xBE, 0xEF]));
    em.bus.arm9_write32(0x1000D804, 0);

    em.bus.arm9_write32(0x1000D800, 1 << 15);
    em.bus.arm9_write32(0x1000D808, 4);
    em.bus.arm9_write32(0x1000D80C, u32::from_le_bytes([0x03, 0x00, 0x00, 0x20]));
    em.bus.arm9_write32(0x1000D800, 1 << 15);
    assert_eq!(em.bus.arm9_read32(0x1000D80C), u32::from_le_bytes([0xDE, 0xAD, 0xBE, 0xEF]));
    em.bus.arm9_write32(0x1000D804, 0);
}

// ---- PXI ----

#[test]
fn pxi_ping_between_clusters() {
    let mut em = make_emulator();

    // Send FIFO empty before, holds data after, empty again once read.
    assert_ne!(em.bus.arm9_read16(0x10008004) & 0x1, 0);
    em.bus.arm9_write32(0x10008008, 0xDEADBEEF);
    assert_eq!(em.bus.arm9_read16(0x10008004) & 0x1, 0);

    assert_eq!(em.bus.arm11_read32(0, 0x1016300C), 0xDEADBEEF);
    assert_ne!(em.bus.arm9_read16(0x10008004) & 0x1, 0);
}

#[test]
fn pxi_sync_doorbell_and_error_latch() {
    let mut em = make_emulator();
    pmr_setup_core0(&mut em);

    // ARM11 enables remote-IRQ reception; ARM9 writes a byte + doorbell.
    em.bus.arm11_write32(0, 0x10163000, 1 << 31);
    em.bus.arm9_write32(0x10008000, (0x5A << 8) | (1 << 29) | (1 << 31));
    assert_eq!(em.bus.arm11_read32(0, 0x10163000), 0x5A);
    assert_eq!(em.bus.arm11_read32(0, 0x17E0010C), 0x50);

    // ARM11 answers with its own doorbell towards the ARM9.
    em.bus.arm9_write32(0x10001000, 1 << 12);
    em.bus.arm11_write32(0, 0x10163000, (0xA5 << 8) | (1 << 30) | (1 << 31));
    assert_eq!(em.bus.arm9_read32(0x10008000), 0xA5);
    assert!(em.bus.int9.line());

    // Popping the empty receive FIFO latches the error bit until cleared.
    em.bus.arm11_read32(0, 0x1016300C);
    assert_ne!(em.bus.arm11_read16(0, 0x10163004) & (1 << 14), 0);
    em.bus.arm11_write16(0, 0x10163004, 1 << 14);
    assert_eq!(em.bus.arm11_read16(0, 0x10163004) & (1 << 14), 0);
}

// ---- WiFi ----

fn sdio_cmd52_write(em: &mut Emulator, func: u32, addr: u32, data: u8) {
    let arg = (1 << 31) | (func << 28) | (addr << 9) | data as u32;
    em.bus.arm11_write16(0, 0x10122004, arg as u16);
    em.bus.arm11_write16(0, 0x10122006, (arg >> 16) as u16);
    em.bus.arm11_write16(0, 0x10122000, 52);
}

fn sdio_cmd52_read(em: &mut Emulator, func: u32, addr: u32) -> u8 {
    let arg = (func << 28) | (addr << 9);
    em.bus.arm11_write16(0, 0x10122004, arg as u16);
    em.bus.arm11_write16(0, 0x10122006, (arg >> 16) as u16);
    em.bus.arm11_write16(0, 0x10122000, 52);
    em.bus.arm11_read16(0, 0x1012200C) as u8
}

#[test]
fn sdio_cmd52_reads_card_registers() {
    let mut em = make_emulator();

    assert_eq!(sdio_cmd52_read(&mut em, 0, 0), 0x11, "CCCR revision");
    assert_eq!(sdio_cmd52_read(&mut em, 0, 0x8), 0x17, "card capability");
    // First CIS0 tuple bytes.
    assert_eq!(sdio_cmd52_read(&mut em, 0, 0x1000), 0x01);
    assert_eq!(sdio_cmd52_read(&mut em, 0, 0x1002), 0xD9);
}

#[test]
fn bmi_get_target_info_replies_through_mailbox() {
    let mut em = make_emulator();

    // BMI command 8 as one little-endian word; the final byte lands on the
    // mailbox end address to commit it.
    sdio_cmd52_write(&mut em, 1, 0x00, 8);
    sdio_cmd52_write(&mut em, 1, 0x01, 0);
    sdio_cmd52_write(&mut em, 1, 0x02, 0);
    sdio_cmd52_write(&mut em, 1, 0xFF, 0);

    let mut reply = [0u8; 16];
    for b in reply.iter_mut() {
        *b = sdio_cmd52_read(&mut em, 1, 0);
    }
    let words: Vec<u32> =
        reply.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    assert_eq!(words, vec![0xFFFFFFFF, 0x0000000C, 0x230000B3, 0x00000002]);
}

#[test]
fn bmi_memory_roundtrip_through_window() {
    let mut em = make_emulator();

    // Poke Xtensa RAM through the window registers, then read it back with
    // BMI_READ_MEMORY.
    for (i, b) in 0xCAFEBABEu32.to_le_bytes().iter().enumerate() {
        sdio_cmd52_write(&mut em, 1, 0x474 + i as u32, *b);
    }
    // Target address 0x920010 (RAM base + 0x10); the low byte commits.
    sdio_cmd52_write(&mut em, 1, 0x47B, 0x00);
    sdio_cmd52_write(&mut em, 1, 0x47A, 0x92);
    sdio_cmd52_write(&mut em, 1, 0x479, 0x00);
    sdio_cmd52_write(&mut em, 1, 0x478, 0x10);

    // BMI_READ_MEMORY addr=0x920010 len=4.
    for &b in &[0x02, 0, 0, 0] {
        sdio_cmd52_write(&mut em, 1, 0x00, b);
    }
    for &b in &0x00920010u32.to_le_bytes() {
        sdio_cmd52_write(&mut em, 1, 0x00, b);
    }
    for (i, &b) in [4u8, 0, 0, 0].iter().enumerate() {
        let addr = if i == 3 { 0xFF } else { 0x00 };
        sdio_cmd52_write(&mut em, 1, addr, b);
    }

    let mut out = [0u8; 4];
    for b in out.iter_mut() {
        *b = sdio_cmd52_read(&mut em, 1, 0);
    }
    assert_eq!(u32::from_le_bytes(out), 0xCAFEBABE);
}

#[test]
fn wmi_synchronize_stages_channel_list_reply() {
    let mut em = make_emulator();

    // BMI_DONE flips the mailbox protocol over to WMI and queues the READY
    // frame, padded to 128 bytes.
    for (i, &b) in [1u8, 0, 0, 0].iter().enumerate() {
        let addr = if i == 3 { 0xFF } else { 0x00 };
        sdio_cmd52_write(&mut em, 1, addr, b);
    }
    for _ in 0..128 {
        sdio_cmd52_read(&mut em, 1, 0);
    }

    // WMI_SYNCHRONIZE: HTC header (6 bytes) + command 0x0004.
    let frame = [0u8, 0, 8, 0, 0, 0, 0x04, 0x00, 0, 0];
    for (i, &b) in frame.iter().enumerate() {
        let addr = if i == frame.len() - 1 { 0xFF } else { 0x00 };
        sdio_cmd52_write(&mut em, 1, addr, b);
    }

    // READY event immediately...
    let eid = sdio_cmd52_read(&mut em, 1, 0);
    assert_eq!(eid, 1);
    let _flag = sdio_cmd52_read(&mut em, 1, 0);
    let len =
        sdio_cmd52_read(&mut em, 1, 0) as u16 | ((sdio_cmd52_read(&mut em, 1, 0) as u16) << 8);
    assert_eq!(len, 18);
    let mut payload = [0u8; 18];
    for b in payload.iter_mut() {
        *b = sdio_cmd52_read(&mut em, 1, 0);
    }
    assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 0x1001, "WMI_READY");

    // ...and the channel list only after the scheduler delay elapses.
    for _ in 0..(128 - 4 - 18) {
        sdio_cmd52_read(&mut em, 1, 0);
    }
    assert_eq!(sdio_cmd52_read(&mut em, 1, 0x405) & 0x1, 0, "RX mailbox drained");

    em.bus.scheduler.advance(500_000);
    em.bus.run_events();
    assert_eq!(sdio_cmd52_read(&mut em, 1, 0x405) & 0x1, 1, "channel list arrived");
    let _eid = sdio_cmd52_read(&mut em, 1, 0);
    let _flag = sdio_cmd52_read(&mut em, 1, 0);
    let len =
        sdio_cmd52_read(&mut em, 1, 0) as u16 | ((sdio_cmd52_read(&mut em, 1, 0) as u16) << 8);
    assert_eq!(len, 8);
    let mut payload = [0u8; 8];
    for b in payload.iter_mut() {
        *b = sdio_cmd52_read(&mut em, 1, 0);
    }
    assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 0x000E, "channel list event");
}

// ---- Xtensa ----

#[test]
fn xtensa_arithmetic_and_waiti() {
    let mut soc = WifiSoc::new();
    let mut cpu = Xtensa::new();

    // movi.n a2, 5; movi.n a3, 7; add.n a4, a2, a3; waiti 0
    let program: [u8; 9] = [0x0C, 0x52, 0x0C, 0x73, 0x3A, 0x42, 0x00, 0x70, 0x00];
    for (i, &b) in program.iter().enumerate() {
        soc.write8(0x920000 + i as u32, b);
    }

    cpu.set_pc(0x920000);
    cpu.run(&mut soc, 16);

    assert!(cpu.halted());
    assert_eq!(cpu.get_gpr(2), 5);
    assert_eq!(cpu.get_gpr(3), 7);
    assert_eq!(cpu.get_gpr(4), 12);
}

#[test]
fn xtensa_loads_and_stores() {
    let mut soc = WifiSoc::new();
    let mut cpu = Xtensa::new();

    // movi.n a2, 4; s32i.n a2, a3, 0; l32i.n a4, a3, 0; waiti 0
    let program: [u8; 9] = [0x0C, 0x42, 0x29, 0x03, 0x48, 0x03, 0x00, 0x70, 0x00];
    for (i, &b) in program.iter().enumerate() {
        soc.write8(0x920000 + i as u32, b);
    }

    cpu.set_pc(0x920000);
    cpu.set_gpr(3, 0x920100);
    cpu.run(&mut soc, 16);

    assert!(cpu.halted());
    assert_eq!(soc.read32(0x920100), 4);
    assert_eq!(cpu.get_gpr(4), 4);
}

#[test]
fn xtensa_loop_registers_rewind_pc() {
    let mut soc = WifiSoc::new();
    let mut cpu = Xtensa::new();

    // movi.n a2, 4; loopnez a2, <past body>; addi.n a3, a3, 1; waiti 0
    let program: [u8; 10] = [0x0C, 0x42, 0x76, 0x92, 0x01, 0x1B, 0x33, 0x00, 0x70, 0x00];
    for (i, &b) in program.iter().enumerate() {
        soc.write8(0x920000 + i as u32, b);
    }

    cpu.set_pc(0x920000);
    cpu.run(&mut soc, 64);

    assert!(cpu.halted());
    assert_eq!(cpu.get_gpr(3), 4, "loop body ran LCOUNT+1 times");
    assert_eq!(cpu.get_xsr(2), 0, "LCOUNT exhausted");
}

#[test]
fn xtensa_register_window_rotates() {
    let mut cpu = Xtensa::new();

    cpu.set_xsr(72, 2);
    cpu.set_gpr(1, 0x1000);
    cpu.set_pc(0x900100);

    cpu.windowed_call(0x920000, 1);
    // ENTRY a1, 16: the callee's a1 becomes sp - 16 one window over.
    cpu.entry(1, 16);
    assert_eq!(cpu.get_xsr(72), 3);
    assert_eq!(cpu.get_gpr(1), 0x1000 - 16);

    cpu.windowed_ret();
    assert_eq!(cpu.get_xsr(72), 2);
    assert_eq!(cpu.get_pc(), 0x900100);
    assert_eq!(cpu.get_gpr(1), 0x1000, "caller frame restored");
}

#[test]
fn xtensa_interrupt_vectors_and_rfi() {
    let mut soc = WifiSoc::new();
    let mut cpu = Xtensa::new();

    // waiti 0 at the entry point; an enabled level-2 interrupt wakes the
    // core at the level-2 vector.
    let program: [u8; 3] = [0x00, 0x70, 0x00];
    for (i, &b) in program.iter().enumerate() {
        soc.write8(0x920000 + i as u32, b);
    }
    cpu.set_pc(0x920000);
    cpu.run(&mut soc, 4);
    assert!(cpu.halted());

    cpu.set_xsr(228, 1 << 10);
    cpu.send_irq(10);
    assert!(!cpu.halted());
    assert_eq!(cpu.get_pc(), 0x8E0920);
    assert_ne!(cpu.get_xsr(226) & (1 << 10), 0, "interrupt latched");

    // RFI restores the pre-interrupt PC and PS.
    cpu.rfi(1);
    assert_eq!(cpu.get_pc(), 0x920003);
}

// ---- GPU ----

#[test]
fn gpu_memfill_and_scanout() {
    let mut em = make_emulator();

    // Fill 32 bytes of VRAM with a 32-bit pattern.
    em.bus.arm11_write32(0, 0x10400010, 0);
    em.bus.arm11_write32(0, 0x10400014, 32 / 8);
    em.bus.arm11_write32(0, 0x10400018, 0x11223344);
    em.bus.arm11_write32(0, 0x1040001C, 1 | (2 << 8));

    assert_ne!(em.bus.arm11_read32(0, 0x1040001C) & 0x2, 0, "memfill done");
    for i in 0..8u32 {
        assert_eq!(em.bus.arm11_read32(0, 0x18000000 + i * 4), 0x11223344);
    }
    assert_eq!(em.bus.arm11_read32(0, 0x18000000 + 32), 0);

    // Empty range (end == start, exclusive bound): no writes.
    em.bus.arm11_write32(0, 0x10400020, 0x100 / 8);
    em.bus.arm11_write32(0, 0x10400024, 0x100 / 8);
    em.bus.arm11_write32(0, 0x10400028, 0xFFFFFFFF);
    em.bus.arm11_write32(0, 0x1040002C, 1 | (2 << 8));
    assert_eq!(em.bus.arm11_read32(0, 0x18000100), 0);
    assert_ne!(em.bus.arm11_read32(0, 0x1040002C) & 0x2, 0);

    // Scanout decodes BGRA32 from the configured address.
    em.bus.arm11_write32(0, 0x10400468, 0);
    em.bus.arm11_write32(0, 0x10400470, 0);
    em.bus.gpu.render_frame();
    assert_eq!(em.bus.gpu.top_buffer()[0], 0x44332211);
}

// ---- SPI / CODEC ----

#[test]
fn spi_codec_returns_idle_touch_frame() {
    let mut em = make_emulator();

    // Bus 0, device 0 (CODEC), command 3, 0x34-byte frame.
    em.bus.arm11_write32(0, 0x10142800, 0);
    em.bus.arm11_write32(0, 0x10142808, 0x34);
    em.bus.arm11_write32(0, 0x1014280C, 3);

    // Untouched screen reads back 0xFFFF on both axes.
    let word = em.bus.arm11_read32(0, 0x1014280C);
    assert_eq!(word, 0xFFFFFFFF);
    for _ in 0..4 {
        em.bus.arm11_read32(0, 0x1014280C);
    }
    // Circle pad sits at its neutral position.
    assert_eq!(em.bus.arm11_read32(0, 0x1014280C), 0x80008);
}

// ---- System protection ----

#[test]
fn sysprot_locks_boot_rom_and_otp() {
    let mut em = Emulator::new();
    let mut boot9 = vec![0u8; 1024 * 64];
    for (i, b) in boot9.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    let boot11 = boot9.clone();
    let otp = vec![0xA5u8; 256];
    em.load_roms(&boot9, &boot11, &otp);
    em.reset();

    assert_ne!(em.bus.arm9_read32(0xFFFF8004), 0);
    assert_eq!(em.bus.arm9_read32(0x10012000), 0xA5A5A5A5);

    em.bus.arm9_write8(0x10000000, 0x3);
    assert_eq!(em.bus.arm9_read8(0x10000000), 0x3);

    // The boot ROM tail reads back as zero for every subsequent access;
    // the OTP reads all-ones.
    for addr in (0xFFFF8000u32..0xFFFF8040).step_by(4) {
        assert_eq!(em.bus.arm9_read32(addr), 0);
    }
    assert_ne!(em.bus.arm9_read32(0xFFFF0004), 0, "lower half untouched");
    assert_eq!(em.bus.arm9_read32(0x10012000), 0xFFFFFFFF);
}

// ---- Scheduler ----

#[test]
fn scheduler_orders_by_deadline_then_insertion() {
    let mut sched = Scheduler::new();
    sched.add_event(Event::WifiChannelList, 5);
    sched.add_event(Event::NdmaRequestCheck(1), 1);
    sched.add_event(Event::NdmaRequestCheck(2), 1);
    assert_eq!(sched.pop_due(), None);

    sched.advance(1);
    assert_eq!(sched.pop_due(), Some(Event::NdmaRequestCheck(1)));
    assert_eq!(sched.pop_due(), Some(Event::NdmaRequestCheck(2)));
    assert_eq!(sched.pop_due(), None);

    sched.advance(4);
    assert_eq!(sched.pop_due(), Some(Event::WifiChannelList));
}

// ---- Whole machine ----

#[test]
fn boot_with_blank_roms_runs_one_batch() {
    let mut em = make_emulator();
    assert_eq!(em.run_batch(), Signal::Ok);
}

#[test]
fn otp_failure_sentinel_stops_the_machine() {
    struct SentinelCore {
        pc: u32,
    }
    impl em3ds::arm::ArmCore for SentinelCore {
        fn reset(&mut self, entry: u32) {
            self.pc = entry;
        }
        fn step(&mut self, _bus: &mut em3ds::bus::BusView) {
            self.pc = em3ds::OTP_FAILURE_PC + 4;
        }
        fn set_int_signal(&mut self, _asserted: bool) {}
        fn pc(&self) -> u32 {
            self.pc
        }
    }

    let mut em = make_emulator();
    em.set_arm9(Box::new(SentinelCore { pc: 0 }));
    assert_eq!(em.run_batch(), Signal::OtpVerifyFailed);
}

#[test]
fn bus_views_dispatch_to_their_own_cluster() {
    let mut em = make_emulator();
    {
        let mut view = em3ds::bus::BusView::new(&mut em.bus, CpuId::Arm9);
        view.write32(0x1FF80000, 0x12345678);
    }
    let mut view = em3ds::bus::BusView::new(&mut em.bus, CpuId::Arm11(1));
    assert_eq!(view.read32(0x1FF80000), 0x12345678, "AXI RAM is shared");
}

use anyhow::{bail, Context, Result};
use clap::Parser;
use em3ds::bus::{BOOT_ROM_SIZE, OTP_SIZE};
use em3ds::{Emulator, Signal, OTP_FAILURE_PC};
use log::info;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

// NAND images come in exactly two sizes; anything else is a bad dump.
const NAND_SIZES: [u64; 2] = [0x3AF00000, 0x4D800000];

// Placeholder NAND CID until a per-console one is supplied.
const NAND_CID: [u8; 16] =
    [0x90, 0x27, 0x67, 0x90, 0x92, 0x74, 0x18, 0x0B, 0x53, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Parser)]
#[command(name = "myctr", about = "Low-level 3DS boot chain emulator")]
struct Args {
    boot9: PathBuf,
    boot11: PathBuf,
    otp: PathBuf,
    nand: PathBuf,
    sd: Option<PathBuf>,
    cartridge: Option<PathBuf>,
    /// Run the WiFi module's Xtensa firmware instead of the in-host shim.
    #[arg(long)]
    lle_wifi: bool,
}

fn read_rom(path: &Path, expected: usize) -> Result<Vec<u8>> {
    let rom = fs::read(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if rom.len() != expected {
        bail!("{} is {} bytes, expected {}", path.display(), rom.len(), expected);
    }
    Ok(rom)
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let boot9 = read_rom(&args.boot9, BOOT_ROM_SIZE)?;
    let boot11 = read_rom(&args.boot11, BOOT_ROM_SIZE)?;
    let otp = read_rom(&args.otp, OTP_SIZE)?;

    let nand = open_rw(&args.nand)?;
    let nand_size = nand.metadata()?.len();
    if !NAND_SIZES.contains(&nand_size) {
        bail!("{} is not a 3DS NAND image ({} bytes)", args.nand.display(), nand_size);
    }

    let mut em = Emulator::new();
    em.load_roms(&boot9, &boot11, &otp);
    em.mount_nand(nand);
    em.bus.emmc.load_cid(&NAND_CID);

    if let Some(sd) = &args.sd {
        em.mount_sd(open_rw(sd)?);
    }
    if let Some(cartridge) = &args.cartridge {
        let card = File::open(cartridge)
            .with_context(|| format!("Failed to open {}", cartridge.display()))?;
        em.mount_cartridge(card);
    }

    em.bus.wifi.set_lle(args.lle_wifi);
    em.reset();
    info!("All files loaded successfully");

    loop {
        match em.run_batch() {
            Signal::Ok => {}
            Signal::OtpVerifyFailed => {
                bail!("[ARM9] OTP verification failed (PC ${:08X})", OTP_FAILURE_PC)
            }
        }
    }
}

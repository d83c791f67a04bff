// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The verified boot program, linked into U-Boot.
//!
//! U-Boot's board code calls one of the two entry points below once its own
//! drivers are up: `bootstub_entry` from the read-only build,
//! `main_firmware_entry` from the read-write build. The lib crate does the
//! deciding; the code here sets up the runtime, binds the lib's traits to
//! U-Boot, and acts on the outcome.

#![no_std]
#![no_main]

extern crate alloc;

mod uboot;

use core::ffi::{c_int, c_void};
use core::sync::atomic::{compiler_fence, AtomicBool, Ordering};

use linked_list_allocator::LockedHeap;
use twostop::bsp::Bsp;
use twostop::crossystem::{CrossystemData, CROSSYSTEM_DATA_MAX_SIZE};
use twostop::ec::EcChannel;
use twostop::minirt::{format_fixed, FixedBuf};
use twostop::twostop::{
    twostop_boot, twostop_readwrite_main_firmware, BootContext, BootError, Disposition,
};

// Select the appropriate BSP type as `Board`
cfg_if::cfg_if! {
    if #[cfg(feature = "target-board-smdk5250")] {
        use twostop::bsp::smdk5250::Board;
    } else if #[cfg(feature = "target-board-seaboard")] {
        use twostop::bsp::seaboard::Board;
    } else if #[cfg(feature = "target-board-coreboot")] {
        use twostop::bsp::coreboot::Board;
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(feature = "verbose")]
const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Debug;
#[cfg(not(feature = "verbose"))]
const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Log records go to the U-Boot console, one line each.
struct Console;

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line: FixedBuf<256> = format_fixed(format_args!(
            "{} {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
        uboot::console_write(&mut line);
    }

    fn flush(&self) {}
}

static CONSOLE: Console = Console;

enum Stage {
    Bootstub,
    MainFirmware,
}

fn runtime_init() {
    // The heap can only be handed to the allocator once.
    static INITIALIZED: AtomicBool = AtomicBool::new(false);
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        panic!();
    }

    let (start, size) = uboot::heap_window();
    // Safety: the linker script reserves this window for the heap and nothing
    // else, and the check above makes this the only `init`.
    unsafe { ALLOCATOR.lock().init(start, size) };

    // Fails only if a logger is already installed, which by the check above
    // can't be.
    let _ = log::set_logger(&CONSOLE);
    log::set_max_level(LOG_LEVEL);
}

fn enter(fdt_blob: *mut c_void, stage: Stage) -> ! {
    runtime_init();

    let layout = Board::LAYOUT;
    // Safety: the board layout sets these two regions aside for the
    // crossystem data and the GBB copy, and this is the only place that
    // refers to them.
    let (cdata, gbb) = unsafe {
        (
            uboot::reserved_ram(layout.crossystem_data(), CROSSYSTEM_DATA_MAX_SIZE),
            uboot::reserved_ram(layout.gbb(), layout.gbb_max_size as usize),
        )
    };
    let cdata = match CrossystemData::place(cdata) {
        Ok(cdata) => cdata,
        Err(e) => finish(e.into()),
    };

    let mut fdt = uboot::LibFdt::new(fdt_blob);
    let mut gpio = uboot::UbootGpio;
    let mut ec = if Board::HAS_EC {
        uboot::CrosEc::find()
    } else {
        None
    };
    let mut oracle = uboot::Vboot;
    let mut loader = uboot::Bootm;
    let mut machine = uboot::UbootMachine::new(layout.clone());
    let mut flash = uboot::UbootSpiFlash::new();

    let mut ctx = BootContext {
        layout,
        arch: Board::arch_data(),
        fdt: &mut fdt,
        gpio: &mut gpio,
        ec: ec.as_mut().map(|ec| ec as &mut dyn EcChannel),
        oracle: &mut oracle,
        loader: &mut loader,
        machine: &mut machine,
        cdata,
        gbb,
        resident_image: None,
    };

    let e = match stage {
        Stage::Bootstub => twostop_boot(&mut ctx, &mut flash),
        Stage::MainFirmware => twostop_readwrite_main_firmware(&mut ctx, &mut flash),
    };
    finish(e)
}

/// Acts on the reason the flow gave up.
fn finish(e: BootError) -> ! {
    match e.disposition() {
        Disposition::PowerOff => {
            log::info!("powering off");
            uboot::shut_down()
        }
        Disposition::ColdReboot => {
            log::error!("boot failed: {:?}; rebooting", e);
            uboot::reboot()
        }
        Disposition::Halt => {
            log::error!("boot failed: {:?}; halting", e);
            halt()
        }
    }
}

fn halt() -> ! {
    Board::indicate_fault();

    loop {
        // Keeps LLVM from turning the empty loop into a trap.
        compiler_fence(Ordering::SeqCst);
    }
}

/// Read-only stage entry point, called by U-Boot's board code with the
/// control device tree.
#[no_mangle]
pub extern "C" fn bootstub_entry(fdt_blob: *mut c_void) -> ! {
    enter(fdt_blob, Stage::Bootstub)
}

/// Read-write stage entry point, reached by the read-only stage's jump.
#[no_mangle]
pub extern "C" fn main_firmware_entry(fdt_blob: *mut c_void) -> ! {
    enter(fdt_blob, Stage::MainFirmware)
}

/// Asked by U-Boot's keyboard driver before it probes the i8042.
#[no_mangle]
pub extern "C" fn board_i8042_skip() -> c_int {
    Board::skip_i8042() as c_int
}

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    let mut line: FixedBuf<256> = format_fixed(format_args!("twostop: {}\n", info));
    uboot::console_write(&mut line);
    halt()
}

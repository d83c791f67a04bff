// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the hardware and the C libraries, plus builders
//! for complete firmware images and the device trees that describe them.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use hex_literal::hex;
use zerocopy::{AsBytes, FromBytes};

use crate::bsp::RamLayout;
use crate::crossystem::{ArchData, CrossystemData};
use crate::ec::{EcChannel, EcError, HashResponse, protect};
use crate::fdt::{self, DeviceTree, FdtError, Node};
use crate::fmap::{FlashMap, FmapEntry, ReadOnlyRegions, ReadWriteRegions};
use crate::gbb::GbbHeader;
use crate::kernel::{KernelLoader, LoaderError};
use crate::oracle::{
    CommonParams, InitParams, KernelParams, SelectFirmwareParams, VbError, VbootCallbacks,
    VbootOracle,
};
use crate::storage::{FlashGeometry, SpiFlash, StorageError};
use crate::switches::{Gpio, GpioDescriptor, GpioError};
use crate::twostop::{BootContext, DeviceError, Machine};
use crate::vblock::{FirmwarePreambleHeader, KeyBlockHeader, KEY_BLOCK_MAGIC};
use crate::Selection;

pub const HWID: &[u8] = b"SMDK TEST 1234";
pub const RO_ID: &[u8] = b"Google_Smdk5250.2695.0.0";
pub const RW_A_ID: &[u8] = b"Google_Smdk5250.2695.1.0";
pub const RW_B_ID: &[u8] = b"Google_Smdk5250.2695.2.0";
pub const TEST_GUID: [u8; 16] = hex!("00112233445566778899aabbccddeeff");
pub const SWITCH_PHANDLE: u32 = 0x2a;

pub const TEST_LAYOUT: RamLayout = RamLayout {
    dram: 0..0x0100_0000,
    kernel_buffer: 0x0010_0000,
    kernel_buffer_size: 0x0010_0000,
    firmware_text_base: 0x0080_0000,
    stack_margin: 0x1000,
    gbb_max_size: 0x1_0000,
};

const FLASH_SIZE: usize = 0x10_0000;
const SECTOR_SIZE: u32 = 0x1000;

// GBB section placement, relative to the start of the GBB.
const GBB_HWID: (u32, u32) = (0x80, 0x100);
const GBB_ROOTKEY: (u32, u32) = (0x180, 0x1000);
const GBB_BMPFV: (u32, u32) = (0x1180, 0x4000);
const GBB_RECOVERY_KEY: (u32, u32) = (0x5180, 0x1000);

pub fn zeroed_cdata() -> Box<CrossystemData> {
    Box::new(CrossystemData::new_zeroed())
}

/// SPI NOR flash: `program` only clears bits, `erase` sets whole sectors.
pub struct MemFlash {
    data: Vec<u8>,
    sector_size: u32,
    reads: usize,
    erases: usize,
    probe_fails: bool,
}

impl MemFlash {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_contents(data, SECTOR_SIZE)
    }

    pub fn with_contents(data: Vec<u8>, sector_size: u32) -> Self {
        Self {
            data,
            sector_size,
            reads: 0,
            erases: 0,
            probe_fails: false,
        }
    }

    pub fn fail_probe(&mut self) {
        self.probe_fails = true;
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn erases(&self) -> usize {
        self.erases
    }

    fn span(&self, offset: u32, len: usize) -> Result<Range<usize>, StorageError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(StorageError::Io);
        }
        Ok(start..end)
    }
}

impl SpiFlash for MemFlash {
    fn probe(&mut self) -> Result<FlashGeometry, StorageError> {
        if self.probe_fails {
            return Err(StorageError::Open);
        }
        Ok(FlashGeometry {
            size: self.data.len() as u32,
            sector_size: self.sector_size,
        })
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let span = self.span(offset, buf.len())?;
        self.reads += 1;
        buf.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        assert_eq!(offset % self.sector_size, 0, "unaligned erase");
        assert_eq!(len % self.sector_size, 0, "partial sector erase");
        let span = self.span(offset, len as usize)?;
        self.erases += 1;
        self.data[span].fill(0xff);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let span = self.span(offset, data.len())?;
        for (cell, byte) in self.data[span].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }
}

struct MemNode {
    path: String,
    props: Vec<(String, Vec<u8>)>,
    live: bool,
}

/// A device tree with a fixed capacity, sized roughly the way a flattened
/// tree would be, so it has to be resized before it takes much more.
pub struct MemTree {
    nodes: Vec<MemNode>,
    capacity: usize,
    resizable: bool,
}

const FDT_HEADER_COST: usize = 40 + 16;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn node_cost(path: &str) -> usize {
    let name = path.rsplit('/').next().unwrap_or("");
    8 + align4(name.len() + 1)
}

fn prop_cost(name: &str, value: &[u8]) -> usize {
    12 + align4(value.len()) + name.len() + 1
}

impl MemTree {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![MemNode {
                path: "/".to_owned(),
                props: Vec::new(),
                live: true,
            }],
            capacity,
            resizable: true,
        }
    }

    pub fn refuse_resize(&mut self) {
        self.resizable = false;
    }

    /// Removes the node at `path` and everything under it.
    pub fn remove_node(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        for node in &mut self.nodes {
            if node.path == path || node.path.starts_with(&prefix) {
                node.live = false;
            }
        }
    }

    fn used(&self) -> usize {
        FDT_HEADER_COST
            + self
                .nodes
                .iter()
                .filter(|n| n.live)
                .map(|n| {
                    node_cost(&n.path)
                        + n.props.iter().map(|(k, v)| prop_cost(k, v)).sum::<usize>()
                })
                .sum::<usize>()
    }

    fn node(&self, node: Node) -> Result<&MemNode, FdtError> {
        usize::try_from(node.0)
            .ok()
            .and_then(|i| self.nodes.get(i))
            .filter(|n| n.live)
            .ok_or(FdtError::BadValue)
    }
}

impl DeviceTree for MemTree {
    fn path_offset(&self, path: &str) -> Result<Node, FdtError> {
        self.nodes
            .iter()
            .position(|n| n.live && n.path == path)
            .map(|i| Node(i as i32))
            .ok_or(FdtError::NotFound)
    }

    fn property(&self, node: Node, name: &str) -> Result<&[u8], FdtError> {
        self.node(node)?
            .props
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| &v[..])
            .ok_or(FdtError::NotFound)
    }

    fn add_subnode(&mut self, parent: Node, name: &str) -> Result<Node, FdtError> {
        let parent = &self.node(parent)?.path;
        let path = if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        };
        if self.path_offset(&path).is_ok() {
            return Err(FdtError::Other(-1));
        }
        if self.used() + node_cost(&path) > self.capacity {
            return Err(FdtError::NoSpace);
        }
        self.nodes.push(MemNode {
            path,
            props: Vec::new(),
            live: true,
        });
        Ok(Node(self.nodes.len() as i32 - 1))
    }

    fn set_property(&mut self, node: Node, name: &str, value: &[u8]) -> Result<(), FdtError> {
        let used = self.used();
        let index = node.0 as usize;
        let old = self
            .node(node)?
            .props
            .iter()
            .find(|(k, _)| k == name)
            .map_or(0, |(k, v)| prop_cost(k, v));
        if used - old + prop_cost(name, value) > self.capacity {
            return Err(FdtError::NoSpace);
        }
        let props = &mut self.nodes[index].props;
        match props.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_vec(),
            None => props.push((name.to_owned(), value.to_vec())),
        }
        Ok(())
    }

    fn total_size(&self) -> usize {
        self.capacity
    }

    fn resize(&mut self, new_size: usize) -> Result<(), FdtError> {
        if !self.resizable || new_size < self.used() {
            return Err(FdtError::NoSpace);
        }
        self.capacity = new_size;
        Ok(())
    }
}

pub fn add_fmap(tree: &mut MemTree, fmap: &FlashMap) {
    let mut regions = vec![
        ("ro-fmap".to_owned(), fmap.readonly.fmap),
        ("ro-gbb".to_owned(), fmap.readonly.gbb),
        ("ro-firmware-id".to_owned(), fmap.readonly.firmware_id),
    ];
    for (slot, rw) in [("a", &fmap.readwrite_a), ("b", &fmap.readwrite_b)] {
        regions.push((format!("rw-{}-vblock", slot), rw.vblock));
        regions.push((format!("rw-{}-boot", slot), rw.boot));
        regions.push((format!("rw-{}-firmware-id", slot), rw.firmware_id));
        if let Some(ec) = rw.ec_rw {
            regions.push((format!("rw-{}-ec-rw", slot), ec));
        }
    }
    for (name, entry) in regions {
        let node = fdt::ensure_path(tree, &format!("/flash/{}", name)).unwrap();
        fdt::set_cells(tree, node, "reg", &[entry.offset, entry.length]).unwrap();
    }
}

/// Adds `/config` with the three switches on ports 1, 2 and 3 of
/// `SWITCH_PHANDLE`, in the order write protect, recovery, developer.
pub fn add_switches(tree: &mut MemTree, flags: [u32; 3]) {
    let config = fdt::ensure_path(tree, "/config").unwrap();
    let names = ["write-protect-switch", "recovery-switch", "developer-switch"];
    for (port, (name, flags)) in names.iter().zip(flags).enumerate() {
        fdt::set_cells(tree, config, name, &[SWITCH_PHANDLE, port as u32 + 1, flags]).unwrap();
    }
}

/// A tree describing `fmap`, with three active-high switches.
pub fn standard_tree(fmap: &FlashMap) -> MemTree {
    let mut tree = MemTree::new(8192);
    add_fmap(&mut tree, fmap);
    add_switches(&mut tree, [0, 0, 0]);
    tree
}

#[derive(Default)]
pub struct FakeGpio {
    levels: BTreeMap<u32, bool>,
    failing: Vec<u32>,
    reads: usize,
}

impl FakeGpio {
    pub fn set(&mut self, port: u32, level: bool) {
        self.levels.insert(port, level);
    }

    pub fn fail_port(&mut self, port: u32) {
        self.failing.push(port);
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl Gpio for FakeGpio {
    fn level(&mut self, gpio: &GpioDescriptor) -> Result<bool, GpioError> {
        self.reads += 1;
        if self.failing.contains(&gpio.port) {
            return Err(GpioError);
        }
        Ok(self.levels.get(&gpio.port).copied().unwrap_or(false))
    }
}

/// An EC with a small read-write region at 0x4_0000 of its own flash.
pub struct FakeEc {
    pub image: Result<u32, EcError>,
    pub fail_all: bool,
    pub reboots: Vec<u8>,
    pub protect_now: bool,
    pub protect_at_boot: bool,
    pub refuse_protect: bool,
    pub hash_available: bool,
    pub hash_busy_polls: u32,
    pub hash_started: bool,
    pub hash_type: u8,
    pub digest: [u8; 32],
    pub rw: Vec<u8>,
}

const FAKE_EC_RW_OFFSET: u32 = 0x4_0000;

impl FakeEc {
    pub fn new() -> Self {
        Self {
            image: Ok(1),
            fail_all: false,
            reboots: Vec::new(),
            protect_now: false,
            protect_at_boot: false,
            refuse_protect: false,
            hash_available: true,
            hash_busy_polls: 0,
            hash_started: false,
            hash_type: 0,
            digest: hex!("5d41402abc4b2a76b9719d911017c592aaf4c5e4b8a5b5a7e2a6f6c1b1b2c3d4"),
            rw: vec![0; 0x1000],
        }
    }

    fn check(&self) -> Result<(), EcError> {
        if self.fail_all {
            return Err(EcError::Channel);
        }
        Ok(())
    }
}

impl EcChannel for FakeEc {
    fn current_image(&mut self) -> Result<u32, EcError> {
        self.image
    }

    fn reboot(&mut self, cmd: u8, _flags: u8) -> Result<(), EcError> {
        self.check()?;
        self.reboots.push(cmd);
        Ok(())
    }

    fn flash_protect(&mut self, mask: u32, flags: u32) -> Result<u32, EcError> {
        self.check()?;
        if !self.refuse_protect {
            if mask & flags & protect::ALL_NOW != 0 {
                self.protect_now = true;
            }
            if mask & protect::ALL_AT_BOOT != 0 {
                self.protect_at_boot = flags & protect::ALL_AT_BOOT != 0;
            }
        }
        let mut state = 0;
        if self.protect_now {
            state |= protect::ALL_NOW;
        }
        if self.protect_at_boot {
            state |= protect::ALL_AT_BOOT;
        }
        Ok(state)
    }

    fn hash_status(&mut self) -> Result<HashResponse, EcError> {
        self.check()?;
        let mut response = HashResponse::default();
        if !self.hash_available {
            response.status = 0;
        } else if self.hash_busy_polls > 0 {
            self.hash_busy_polls -= 1;
            response.status = 2;
        } else {
            response.status = 1;
            response.hash_type = self.hash_type;
            response.digest_size = 32;
            response.digest[..32].copy_from_slice(&self.digest);
        }
        Ok(response)
    }

    fn hash_start(&mut self, hash_type: u8, _offset: u32) -> Result<HashResponse, EcError> {
        self.check()?;
        self.hash_started = true;
        self.hash_available = true;
        self.hash_type = hash_type;
        self.hash_status()
    }

    fn rw_region(&mut self) -> Result<(u32, u32), EcError> {
        self.check()?;
        Ok((FAKE_EC_RW_OFFSET, self.rw.len() as u32))
    }

    fn flash_erase(&mut self, offset: u32, size: u32) -> Result<(), EcError> {
        self.check()?;
        let start = (offset - FAKE_EC_RW_OFFSET) as usize;
        self.rw[start..start + size as usize].fill(0xff);
        Ok(())
    }

    fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<(), EcError> {
        self.check()?;
        let start = (offset - FAKE_EC_RW_OFFSET) as usize;
        self.rw[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

const KERNEL_TEMPLATE: &[u8] = b"cros_secure root=/dev/mmcblk%Dp%P";

/// A verified boot library that does what it's told, calling back into the
/// firmware the way the real one would and noting what it saw.
pub struct ScriptedOracle {
    pub init_result: Result<(), VbError>,
    pub init_out_flags: u32,
    /// Bodies to hash during firmware selection, in the library's numbering.
    pub hash: Vec<u32>,
    pub selection: Result<Selection, VbError>,
    pub kernel: Result<(), VbError>,
    /// Ask about the EC during kernel selection, like software sync does.
    pub ec_sync: bool,

    pub init_flags_seen: u32,
    pub hashed: Vec<(u32, usize)>,
    pub ec_trusted: Option<bool>,
    pub ec_expected_len: Option<usize>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self {
            init_result: Ok(()),
            init_out_flags: 0,
            hash: Vec::new(),
            selection: Ok(Selection::Recovery),
            kernel: Ok(()),
            ec_sync: false,
            init_flags_seen: 0,
            hashed: Vec::new(),
            ec_trusted: None,
            ec_expected_len: None,
        }
    }
}

impl VbootOracle for ScriptedOracle {
    fn init(&mut self, common: &mut CommonParams<'_>, params: &mut InitParams) -> Result<(), VbError> {
        self.init_flags_seen = params.flags;
        params.out_flags = self.init_out_flags;
        common.shared_data[0] = 0x56;
        self.init_result
    }

    fn select_firmware(
        &mut self,
        _common: &mut CommonParams<'_>,
        params: &SelectFirmwareParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<Selection, VbError> {
        assert!(!params.vblock_a.is_empty() && !params.vblock_b.is_empty());
        for index in self.hash.clone() {
            if let Ok(body) = callbacks.hash_firmware_body(index) {
                self.hashed.push((index, body.len()));
            }
        }
        self.selection
    }

    fn select_and_load_kernel(
        &mut self,
        _common: &mut CommonParams<'_>,
        params: &mut KernelParams<'_>,
        callbacks: &mut dyn VbootCallbacks,
    ) -> Result<(), VbError> {
        if self.ec_sync {
            self.ec_trusted = Some(callbacks.ec_trusted());
            self.ec_expected_len = callbacks
                .ec_expected_rw(Selection::FirmwareA)
                .ok()
                .map(|image| image.len());
        }
        self.kernel?;

        params.kernel_buffer[0x2000..0x2000 + KERNEL_TEMPLATE.len()].copy_from_slice(KERNEL_TEMPLATE);
        params.bootloader_address = params.kernel_buffer_address + 0x4000;
        params.bootloader_size = 0x1000;
        params.disk.device = 0;
        params.partition_number = 2;
        params.partition_guid = TEST_GUID;
        Ok(())
    }
}

/// A loader that runs the fixup and then fails, so the test gets control
/// back.
pub struct RecordingLoader {
    pub fdt: MemTree,
    pub bootargs: Option<String>,
    pub booted: Option<u64>,
}

impl RecordingLoader {
    pub fn new(fdt: MemTree) -> Self {
        Self {
            fdt,
            bootargs: None,
            booted: None,
        }
    }
}

impl KernelLoader for RecordingLoader {
    fn set_bootargs(&mut self, cmdline: &str) -> Result<(), LoaderError> {
        self.bootargs = Some(cmdline.to_owned());
        Ok(())
    }

    fn boot(
        &mut self,
        image: u64,
        fixup: &mut dyn FnMut(&mut dyn DeviceTree) -> Result<(), LoaderError>,
    ) -> LoaderError {
        if let Err(e) = fixup(&mut self.fdt) {
            return e;
        }
        self.booted = Some(image);
        LoaderError::Boot(-1)
    }
}

pub struct RecordingMachine {
    pub sp: u64,
    pub zeroed: Vec<Range<u64>>,
    pub kernel_buffer: Vec<u8>,
    /// Address and length of the last jump.
    pub jumped: Option<(u64, usize)>,
    pub tpm_fails: bool,
    pub tpm_inits: usize,
    pub display_fails: bool,
}

impl Default for RecordingMachine {
    fn default() -> Self {
        Self {
            sp: 0x00f0_0000,
            zeroed: Vec::new(),
            kernel_buffer: vec![0; 0x1_0000],
            jumped: None,
            tpm_fails: false,
            tpm_inits: 0,
            display_fails: false,
        }
    }
}

impl Machine for RecordingMachine {
    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    fn zero_memory(&mut self, range: Range<u64>) {
        self.zeroed.push(range);
    }

    fn kernel_buffer(&mut self) -> &mut [u8] {
        &mut self.kernel_buffer
    }

    fn transfer_control(&mut self, address: u64, body: &[u8]) {
        self.jumped = Some((address, body.len()));
    }

    fn tpm_init(&mut self) -> Result<(), DeviceError> {
        self.tpm_inits += 1;
        if self.tpm_fails {
            return Err(DeviceError(-1));
        }
        Ok(())
    }

    fn enable_display(&mut self) -> Result<(), DeviceError> {
        if self.display_fails {
            return Err(DeviceError(-2));
        }
        Ok(())
    }
}

/// A vblock whose preamble signs a body of `body_size` bytes.
pub fn make_vblock(body_size: u32, vblock_len: usize) -> Vec<u8> {
    const KEY_BLOCK_SIZE: usize = 0x400;
    let mut vblock = vec![0; vblock_len];

    let mut key_block = KeyBlockHeader::new_zeroed();
    key_block.magic = KEY_BLOCK_MAGIC;
    key_block.header_version_major = 2;
    key_block.header_version_minor = 1;
    key_block.key_block_size = KEY_BLOCK_SIZE as u64;
    key_block.data_key.algorithm = 4;
    vblock[..core::mem::size_of::<KeyBlockHeader>()].copy_from_slice(key_block.as_bytes());

    let mut preamble = FirmwarePreambleHeader::new_zeroed();
    preamble.preamble_size = 0x200;
    preamble.header_version_major = 2;
    preamble.header_version_minor = 1;
    preamble.firmware_version = 1;
    preamble.body_signature.data_size = u64::from(body_size);
    let at = KEY_BLOCK_SIZE;
    vblock[at..at + core::mem::size_of::<FirmwarePreambleHeader>()]
        .copy_from_slice(preamble.as_bytes());
    vblock
}

pub struct Image {
    pub bytes: Vec<u8>,
    pub fmap: FlashMap,
    pub body_sizes: [usize; 2],
}

pub struct ImageBuilder {
    body_sizes: [u32; 2],
    with_ec: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            body_sizes: [0x8000, 0x9000],
            with_ec: true,
        }
    }

    /// Body sizes the two preambles claim.
    pub fn body_sizes(mut self, a: u32, b: u32) -> Self {
        self.body_sizes = [a, b];
        self
    }

    pub fn without_ec(mut self) -> Self {
        self.with_ec = false;
        self
    }

    pub fn build(self) -> Image {
        let entry = |offset, length| FmapEntry { offset, length };
        let rw = |base: u32| ReadWriteRegions {
            vblock: entry(base, 0x2000),
            boot: entry(base + 0x2000, 0x2_0000),
            firmware_id: entry(base + 0x2_2000, 0x100),
            ec_rw: self.with_ec.then(|| entry(base + 0x2_3000, 0x1000)),
        };
        let fmap = FlashMap {
            readonly: ReadOnlyRegions {
                fmap: entry(0, 0x1000),
                firmware_id: entry(0x1000, 0x100),
                gbb: entry(0x1_0000, 0x1_0000),
            },
            readwrite_a: rw(0x2_0000),
            readwrite_b: rw(0x5_0000),
        };

        let mut bytes = vec![0xff; FLASH_SIZE];
        let r = span(fmap.readonly.fmap);
        bytes[r.start..r.start + 8].copy_from_slice(b"__FMAP__");
        put_id(&mut bytes, fmap.readonly.firmware_id, RO_ID);
        write_gbb(&mut bytes, fmap.readonly.gbb);

        for (slot, (rw, id)) in [(&fmap.readwrite_a, RW_A_ID), (&fmap.readwrite_b, RW_B_ID)]
            .into_iter()
            .enumerate()
        {
            let r = span(rw.vblock);
            let vblock = make_vblock(self.body_sizes[slot], r.len());
            bytes[r].copy_from_slice(&vblock);

            let r = span(rw.boot);
            for (i, b) in bytes[r].iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(31).wrapping_add(slot as u8 * 101);
            }
            put_id(&mut bytes, rw.firmware_id, id);

            if let Some(ec) = rw.ec_rw {
                let r = span(ec);
                for (i, b) in bytes[r].iter_mut().enumerate() {
                    *b = (i as u8) ^ (0x40 + slot as u8);
                }
            }
        }

        Image {
            bytes,
            fmap,
            body_sizes: [self.body_sizes[0] as usize, self.body_sizes[1] as usize],
        }
    }
}

fn span(region: FmapEntry) -> Range<usize> {
    region.offset as usize..(region.offset + region.length) as usize
}

fn put_id(bytes: &mut [u8], region: FmapEntry, id: &[u8]) {
    let start = region.offset as usize;
    bytes[start..start + region.length as usize].fill(0);
    bytes[start..start + id.len()].copy_from_slice(id);
}

fn write_gbb(bytes: &mut [u8], region: FmapEntry) {
    let base = region.offset as usize;
    bytes[base..base + region.length as usize].fill(0);

    let mut header = GbbHeader::new(1);
    (header.hwid_offset, header.hwid_size) = GBB_HWID;
    (header.rootkey_offset, header.rootkey_size) = GBB_ROOTKEY;
    (header.bmpfv_offset, header.bmpfv_size) = GBB_BMPFV;
    (header.recovery_key_offset, header.recovery_key_size) = GBB_RECOVERY_KEY;
    bytes[base..base + 128].copy_from_slice(header.as_bytes());

    let hwid = base + GBB_HWID.0 as usize;
    bytes[hwid..hwid + HWID.len()].copy_from_slice(HWID);

    for (seed, (offset, size)) in [GBB_ROOTKEY, GBB_BMPFV, GBB_RECOVERY_KEY].into_iter().enumerate() {
        let start = base + offset as usize;
        for (i, b) in bytes[start..start + size as usize].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13) ^ (0x5a + seed as u8);
        }
    }
}

/// Everything a boot attempt needs, in memory.
pub struct Rig {
    pub image: Image,
    pub tree: MemTree,
    pub gpio: FakeGpio,
    pub flash: MemFlash,
    pub ec: FakeEc,
    pub with_ec: bool,
    /// Hand the image to the flow as already sitting in memory.
    pub resident: bool,
    pub oracle: ScriptedOracle,
    pub loader: RecordingLoader,
    pub machine: RecordingMachine,
    pub cdata: Box<CrossystemData>,
    pub gbb: Vec<u8>,
}

impl Rig {
    pub fn new() -> Self {
        let image = ImageBuilder::new().build();
        let tree = standard_tree(&image.fmap);
        let flash = MemFlash::new(image.bytes.clone());
        Self {
            image,
            tree,
            gpio: FakeGpio::default(),
            flash,
            ec: FakeEc::new(),
            with_ec: true,
            resident: false,
            oracle: ScriptedOracle::default(),
            loader: RecordingLoader::new(MemTree::new(1024)),
            machine: RecordingMachine::default(),
            cdata: zeroed_cdata(),
            gbb: vec![0; TEST_LAYOUT.gbb_max_size as usize],
        }
    }

    /// Sets the write protect, recovery and developer switch levels.
    pub fn set_switches(&mut self, levels: [bool; 3]) {
        for (port, level) in levels.into_iter().enumerate() {
            self.gpio.set(port as u32 + 1, level);
        }
    }

    /// Points the flash map entry at `path` somewhere else.
    pub fn move_region(&mut self, path: &str, offset: u32) {
        let node = self.tree.path_offset(path).unwrap();
        let (_, length) = fdt::read_reg(&self.tree, node).unwrap();
        fdt::set_cells(&mut self.tree, node, "reg", &[offset, length]).unwrap();
    }

    /// Gives the flash map entry at `path` a new length.
    pub fn resize_region(&mut self, path: &str, length: u32) {
        let node = self.tree.path_offset(path).unwrap();
        let (offset, _) = fdt::read_reg(&self.tree, node).unwrap();
        fdt::set_cells(&mut self.tree, node, "reg", &[offset, length]).unwrap();
    }

    pub fn gbb_has_recovery_key(&self) -> bool {
        let (offset, size) = GBB_RECOVERY_KEY;
        let in_ram = &self.gbb[offset as usize..(offset + size) as usize];
        let start = self.image.fmap.readonly.gbb.offset as usize + offset as usize;
        in_ram == &self.image.bytes[start..start + size as usize]
    }

    pub fn split(&mut self) -> (BootContext<'_>, &mut MemFlash) {
        let ec: Option<&mut dyn EcChannel> = if self.with_ec {
            Some(&mut self.ec)
        } else {
            None
        };
        let ctx = BootContext {
            layout: TEST_LAYOUT,
            arch: ArchData::default(),
            fdt: &mut self.tree,
            gpio: &mut self.gpio,
            ec,
            oracle: &mut self.oracle,
            loader: &mut self.loader,
            machine: &mut self.machine,
            cdata: &mut *self.cdata,
            gbb: &mut self.gbb[..],
            resident_image: if self.resident {
                Some(&self.image.bytes[..])
            } else {
                None
            },
        };
        (ctx, &mut self.flash)
    }
}

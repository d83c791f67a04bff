// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the flattened device tree.
//!
//! The device tree is the only configuration source this firmware has. We
//! read the flash map and the trust switch wiring out of it, and on the way
//! out we write the crossystem data into it for the kernel. The tree itself
//! is owned by U-Boot's libfdt; [`DeviceTree`] is the narrow slice of libfdt
//! we need, and the helpers here deal in big-endian cells the way every
//! device tree does.

use alloc::vec::Vec;

/// A node, identified the way libfdt identifies them: by offset into the
/// structure block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Node(pub i32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FdtError {
    /// The node or property does not exist.
    NotFound,
    /// The tree has no room left; it must be resized first.
    NoSpace,
    /// The property exists but its value has the wrong shape.
    BadValue,
    /// Anything else libfdt complains about.
    Other(i32),
}

pub trait DeviceTree {
    fn path_offset(&self, path: &str) -> Result<Node, FdtError>;
    fn property(&self, node: Node, name: &str) -> Result<&[u8], FdtError>;
    fn add_subnode(&mut self, parent: Node, name: &str) -> Result<Node, FdtError>;
    fn set_property(&mut self, node: Node, name: &str, value: &[u8]) -> Result<(), FdtError>;
    /// Current size of the blob in bytes.
    fn total_size(&self) -> usize;
    /// Moves the blob into a buffer of `new_size` bytes, making room for new
    /// nodes and properties.
    fn resize(&mut self, new_size: usize) -> Result<(), FdtError>;
}

/// Reads property `name` as big-endian 32-bit cells into `out`. The property
/// must hold exactly `out.len()` cells.
pub fn read_cells(
    fdt: &dyn DeviceTree,
    node: Node,
    name: &str,
    out: &mut [u32],
) -> Result<(), FdtError> {
    let value = fdt.property(node, name)?;
    if value.len() != out.len() * 4 {
        return Err(FdtError::BadValue);
    }
    for (cell, bytes) in out.iter_mut().zip(value.chunks_exact(4)) {
        *cell = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(())
}

pub fn read_u32(fdt: &dyn DeviceTree, node: Node, name: &str) -> Result<u32, FdtError> {
    let mut cell = [0];
    read_cells(fdt, node, name, &mut cell)?;
    Ok(cell[0])
}

/// Reads a `reg = <offset size>` pair.
pub fn read_reg(fdt: &dyn DeviceTree, node: Node) -> Result<(u32, u32), FdtError> {
    let mut cells = [0; 2];
    read_cells(fdt, node, "reg", &mut cells)?;
    Ok((cells[0], cells[1]))
}

pub fn set_cells(
    fdt: &mut dyn DeviceTree,
    node: Node,
    name: &str,
    cells: &[u32],
) -> Result<(), FdtError> {
    let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
    fdt.set_property(node, name, &value)
}

pub fn set_u32(fdt: &mut dyn DeviceTree, node: Node, name: &str, value: u32) -> Result<(), FdtError> {
    fdt.set_property(node, name, &value.to_be_bytes())
}

/// Sets a string property. Device tree strings carry their NUL.
pub fn set_string(
    fdt: &mut dyn DeviceTree,
    node: Node,
    name: &str,
    value: &[u8],
) -> Result<(), FdtError> {
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value);
    bytes.push(0);
    fdt.set_property(node, name, &bytes)
}

/// Finds the node at `path`, creating it and any missing parents.
pub fn ensure_path(fdt: &mut dyn DeviceTree, path: &str) -> Result<Node, FdtError> {
    let mut node = fdt.path_offset("/")?;
    let mut end = 0;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        // `end` tracks the prefix of `path` we've walked so far.
        end = path[end..].find(component).map(|at| end + at + component.len()).ok_or(FdtError::BadValue)?;
        node = match fdt.path_offset(&path[..end]) {
            Ok(existing) => existing,
            Err(FdtError::NotFound) => fdt.add_subnode(node, component)?,
            Err(e) => return Err(e),
        };
    }
    Ok(node)
}

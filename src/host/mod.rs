//! Host function table.
//!
//! The fixed catalog of native operations callable from bytecode. Calls are
//! resolved to table indices at load time and dispatched through an explicit
//! match at run time; the table order is part of the ABI and never changes.
//!
//! Host-call ABI: up to five integer arguments in `r1`-`r5`, one 64-bit
//! return value delivered in `r0` by the execution engine. A host call is a
//! yield point: it may move the image out of the running state
//! (`wait_for_address_event`, `migrate_to`), in which case the engine
//! returns control to the scheduler without advancing.

pub mod monitor;

use crate::host::monitor::MonitorKind;
use crate::transport::{
    NodeAddr, Transport, ADDR_RECORD_IP, ADDR_RECORD_PORT, ADDR_RECORD_SIZE,
};
use crate::vm::errors::VmError;
use crate::vm::image::{self, VmImage, VmState, ADDRESS_SPACE_NUM, PAGE_ENTRIES_PER_SPACE};
use crate::vm::mmu::{INDEX_SHIFT, PAGE_TABLE_ERROR};
use crate::{error, info, warn};
use bytes::Bytes;

/// Node-side services a host call may reach: the transport for shipping
/// images, and the debug sink `debug_print` records into.
pub struct HostContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub debug_log: &'a mut Vec<u64>,
}

/// The host function catalog, in ABI table order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostCall {
    /// Placeholder for call sites the linker could not resolve.
    Bug,
    DebugPrint,
    Mmap,
    MonitorAddress,
    WaitForAddressEvent,
    MigrateTo,
    CloneTo,
    SwitchToAddressSpace,
    Memcpy,
}

const TABLE: [(&str, HostCall); 9] = [
    ("bug", HostCall::Bug),
    ("debug_print", HostCall::DebugPrint),
    ("mmap", HostCall::Mmap),
    ("monitor_address", HostCall::MonitorAddress),
    ("wait_for_address_event", HostCall::WaitForAddressEvent),
    ("migrate_to", HostCall::MigrateTo),
    ("clone_to", HostCall::CloneTo),
    ("switch_to_address_space", HostCall::SwitchToAddressSpace),
    ("memcpy", HostCall::Memcpy),
];

impl HostCall {
    /// Resolves a call immediate to a table entry.
    pub fn from_index(index: i32) -> Option<HostCall> {
        usize::try_from(index)
            .ok()
            .and_then(|i| TABLE.get(i))
            .map(|(_, call)| *call)
    }

    /// Resolves a symbol name to its table index, for the linker.
    pub fn index_of(name: &str) -> Option<u32> {
        TABLE
            .iter()
            .position(|(n, _)| *n == name)
            .map(|i| i as u32)
    }

    /// The symbol name bytecode links against.
    pub fn name(self) -> &'static str {
        match TABLE.iter().find(|(_, call)| *call == self) {
            Some(&(name, _)) => name,
            None => "bug",
        }
    }

    /// Invokes this host function with the image's `r1`-`r5` as arguments.
    pub fn invoke(
        self,
        image: &mut VmImage,
        ctx: &mut HostContext<'_>,
    ) -> Result<u64, VmError> {
        let (a1, a2, a3, a4) = (image.reg(1), image.reg(2), image.reg(3), image.reg(4));
        match self {
            HostCall::Bug => {
                warn!("vm {}: call to unresolved function", image.id());
                Ok(0)
            }
            HostCall::DebugPrint => {
                info!("vm debug: {}", a1);
                ctx.debug_log.push(a1);
                Ok(0)
            }
            HostCall::Mmap => Ok(mmap(image, a1, a2)),
            HostCall::MonitorAddress => Ok(monitor_address(image, a1, a2, a3, a4)),
            HostCall::WaitForAddressEvent => wait_for_address_event(image),
            HostCall::MigrateTo => migrate_to(image, ctx, a1),
            HostCall::CloneTo => clone_to(image, ctx, a1, a2),
            HostCall::SwitchToAddressSpace => Ok(switch_to_address_space(image, a1)),
            // TODO: transport-assisted guest memcpy; semantics not settled
            HostCall::Memcpy => Ok(0),
        }
    }
}

/// Commits `{va, size}` into the first free page-table slot of the active
/// address space. Slot 0 is reserved for the default data+stack mapping.
/// Returns the encoded virtual base of the new window, or the error
/// sentinel when every slot is taken.
fn mmap(image: &mut VmImage, va: u64, size: u64) -> u64 {
    let space = image.asid() as usize;
    for slot in 1..PAGE_ENTRIES_PER_SPACE {
        if image.pte(space, slot).size == 0 {
            image.set_pte(space, slot, image::PageTableEntry { base: va, size });
            return (slot as u64) << INDEX_SHIFT;
        }
    }
    PAGE_TABLE_ERROR
}

/// Adds, overwrites, or removes monitor entries.
///
/// `Clear` with address 0 drops the whole list; `Clear` with an address
/// drops that entry. Any watch kind requires a non-zero address; a zero
/// address or an unknown kind yields `-1` as an unsigned error signal.
fn monitor_address(image: &mut VmImage, kind: u64, address: u64, value: u64, tag: u64) -> u64 {
    match MonitorKind::from_u64(kind) {
        Some(MonitorKind::Clear) => {
            if address == 0 {
                image.monitors_mut().clear();
            } else {
                image.monitors_mut().remove(address);
            }
            0
        }
        Some(watch) => {
            if address == 0 {
                return u64::MAX;
            }
            image.monitors_mut().upsert(watch, address, value, tag);
            0
        }
        None => u64::MAX,
    }
}

/// Polls the monitor list. The first satisfied entry resumes the image and
/// returns its tag; with none satisfied the image suspends and 0 is
/// returned, giving the scheduler a fresh chance on the next pass.
fn wait_for_address_event(image: &mut VmImage) -> Result<u64, VmError> {
    for i in 0..image.monitors().len() {
        let entry = match image.monitors().get(i) {
            Some(entry) => entry,
            None => break,
        };
        let offset = image.translate_checked(entry.address)?;
        let current = image.read_uint(offset, 8)?;
        if entry.is_satisfied(current) {
            image.set_state(VmState::Running);
            return Ok(entry.tag);
        }
    }

    image.set_state(VmState::WaitForAddress);
    Ok(0)
}

/// Ships the image's full byte range to the destination and exits locally,
/// whether or not the send succeeded. Failures are logged, never retried.
fn migrate_to(image: &mut VmImage, ctx: &mut HostContext<'_>, dst_va: u64) -> Result<u64, VmError> {
    let dst = read_node_addr(image, dst_va)?;
    let payload = Bytes::copy_from_slice(image.as_bytes());
    let expected = payload.len();

    match ctx.transport.send(dst, payload) {
        Ok(sent) if sent == expected => {}
        Ok(sent) => error!(
            "vm {}: migration to {} truncated ({}/{} bytes)",
            image.id(),
            dst,
            sent,
            expected
        ),
        Err(e) => error!("vm {}: failed to migrate to {}: {}", image.id(), dst, e),
    }

    image.set_state(VmState::Exited);
    Ok(0)
}

/// Sends one copy of the image to each destination in the guest-memory
/// address list, stamping the destination index into each copy's `r0` so a
/// resumed clone can tell itself apart. The live image keeps running; its
/// `r0` ends up holding the attempted count (the call's return value),
/// regardless of per-destination success.
fn clone_to(
    image: &mut VmImage,
    ctx: &mut HostContext<'_>,
    list_va: u64,
    count: u64,
) -> Result<u64, VmError> {
    let list_base = image.translate_checked(list_va)?;
    let mut scratch = image.as_bytes().to_vec();

    for idx in 0..count {
        let record = list_base + idx * ADDR_RECORD_SIZE;
        let ip = image.read_uint(record + ADDR_RECORD_IP, 4)? as u32;
        let port = image.read_uint(record + ADDR_RECORD_PORT, 2)? as u16;
        let dst = NodeAddr { ip, port };

        image::patch_reg0(&mut scratch, idx);
        let payload = Bytes::copy_from_slice(&scratch);
        let expected = payload.len();
        match ctx.transport.send(dst, payload) {
            Ok(sent) if sent == expected => {}
            Ok(sent) => error!(
                "vm {}: clone to {} truncated ({}/{} bytes)",
                image.id(),
                dst,
                sent,
                expected
            ),
            Err(e) => error!("vm {}: failed to clone to {}: {}", image.id(), dst, e),
        }
    }

    Ok(count)
}

/// Switches the active address space after validating the index.
fn switch_to_address_space(image: &mut VmImage, asid: u64) -> u64 {
    if asid >= ADDRESS_SPACE_NUM as u64 {
        warn!(
            "vm {}: address space {} out of range (only {} supported)",
            image.id(),
            asid,
            ADDRESS_SPACE_NUM
        );
        return 0;
    }
    image.set_asid(asid);
    0
}

/// Reads a destination-address record from guest memory.
fn read_node_addr(image: &VmImage, va: u64) -> Result<NodeAddr, VmError> {
    let base = image.translate_checked(va)?;
    let ip = image.read_uint(base + ADDR_RECORD_IP, 4)? as u32;
    let port = image.read_uint(base + ADDR_RECORD_PORT, 2)? as u16;
    Ok(NodeAddr { ip, port })
}

//! The executor: cooperative scheduler over a set of live VM images.
//!
//! One executor owns one transport handle and the node's run-set. A single
//! thread drives every runnable image in admission order; there is no
//! preemption inside the engine, so an image retains control until it
//! exits, faults, or reaches a yield point. A waiting image is driven again
//! on every pass, giving it a fresh chance to observe its monitor
//! condition. Each pass ends with one non-blocking transport poll; an
//! incoming byte image is reconstructed and admitted as a new local image.
//!
//! Known limitation: an image looping without any yielding host call
//! starves the executor.

use crate::host::HostContext;
use crate::transport::Transport;
use crate::vm::image::{VmImage, VmState};
use crate::vm::interpreter;
use crate::{error, info};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scheduler for the live images on one node.
pub struct Executor {
    vms: IndexMap<u64, VmImage>,
    transport: Box<dyn Transport>,
    next_vm_id: u64,
    stop: Arc<AtomicBool>,
    debug_log: Vec<u64>,
}

impl Executor {
    /// Creates an executor around an explicitly supplied transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            vms: IndexMap::new(),
            transport,
            next_vm_id: 0,
            stop: Arc::new(AtomicBool::new(false)),
            debug_log: Vec::new(),
        }
    }

    /// Shared flag that makes [`run`](Self::run) return when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Admits an image into the run-set, assigning its local id.
    pub fn add_vm(&mut self, mut image: VmImage) -> u64 {
        let id = self.next_vm_id;
        self.next_vm_id += 1;
        image.set_id(id);
        self.vms.insert(id, image);
        id
    }

    /// Number of live images.
    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    /// Values emitted through `debug_print` on this node, in order.
    pub fn debug_output(&self) -> &[u64] {
        &self.debug_log
    }

    /// Looks up a live image by id.
    pub fn vm(&self, id: u64) -> Option<&VmImage> {
        self.vms.get(&id)
    }

    /// One scheduler pass: drive every runnable image once, reap exited
    /// images, poll the transport once. Returns whether any image ran or a
    /// message arrived.
    pub fn step(&mut self) -> bool {
        let mut worked = false;

        let ids: Vec<u64> = self.vms.keys().copied().collect();
        for id in ids {
            let Some(image) = self.vms.get_mut(&id) else {
                continue;
            };

            if matches!(image.state(), VmState::Running | VmState::WaitForAddress) {
                let mut ctx = HostContext {
                    transport: self.transport.as_mut(),
                    debug_log: &mut self.debug_log,
                };
                interpreter::run(image, &mut ctx);
                worked = true;
            }

            if self.vms.get(&id).map(|vm| vm.state()) == Some(VmState::Exited) {
                self.vms.shift_remove(&id);
                info!("vm {} exited", id);
            }
        }

        if let Some(message) = self.transport.poll() {
            self.receive_image(&message);
            worked = true;
        }

        worked
    }

    /// Runs scheduler passes until the stop flag is raised.
    pub fn run(&mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            if !self.step() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Runs scheduler passes until the run-set drains.
    pub fn run_until_idle(&mut self) {
        while self.vm_count() != 0 && !self.stop.load(Ordering::Relaxed) {
            self.step();
        }
    }

    fn receive_image(&mut self, bytes: &[u8]) {
        match VmImage::from_bytes(bytes) {
            Ok(image) => {
                let id = self.add_vm(image);
                info!("admitted incoming image as vm {}", id);
            }
            Err(e) => error!("rejected incoming image: {}", e),
        }
    }
}

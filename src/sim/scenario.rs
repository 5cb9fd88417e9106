//! JSON description of a simulated system.
//!
//! A scenario lists tasks with their threads, stacks, image lists and
//! dispatch queues, plus named ports that threads can block on. Addresses
//! are never written by hand: [`SimKernel::from_scenario`] lays out every
//! piece of foreign memory and wires the kernel objects to it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::{SimKernel, SystemInfo, FRAME_STRIDE};
use crate::kernel::{
    Kva, PortLabelObject, PortObject, SpaceId, TaskObject, ThreadObject, TurnstileTarget,
    WaitTarget,
};
use crate::records::LoadInfo64;

/// Version stamped into generated image info tables.
const IMAGE_INFOS_VERSION: u32 = 1;
const DEFAULT_DQ_SERIALNO_OFFSET: u64 = 0x8;
const DEFAULT_DQ_LABEL_OFFSET: u64 = 0x10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub page_size: u64,
    pub clock_start: u64,
    /// Clock ticks charged for every lightweight fault.
    pub fault_cost: u64,
    pub cpus: u32,
    pub system: SystemInfo,
    pub ports: Vec<PortSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            page_size: 4096,
            clock_start: 1_000_000,
            fault_cost: 50,
            cpus: 1,
            system: SystemInfo::default(),
            ports: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSpec {
    pub name: String,
    pub label: Option<LabelSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelSpec {
    /// Left out to model a label whose name cannot be read.
    pub service_name: Option<String>,
    pub domain: u8,
    pub throttled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    #[serde(flatten)]
    pub task: TaskObject,
    pub threads: Vec<ThreadSpec>,
    pub images: Vec<LoadInfo64>,
    /// Page out the image array so reading it needs a fault.
    pub images_paged_out: bool,
    /// Put the task on the terminated list.
    pub terminated: bool,
    /// Unmap the task object so validation fails.
    pub corrupt: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSpec {
    #[serde(flatten)]
    pub thread: ThreadObject,
    /// Return addresses, innermost (pc) first.
    pub user_stack: Vec<u64>,
    pub kernel_stack: Vec<u64>,
    /// Page out the user stack frames.
    pub stack_paged_out: bool,
    /// Index of the cpu this thread is running on.
    pub on_core: Option<usize>,
    pub wait_port: Option<String>,
    pub turnstile_port: Option<String>,
    pub dispatch_queue: Option<QueueSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    pub serial: u64,
    pub label: String,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("failed to serialize scenario")?;
        fs::write(path, raw).with_context(|| format!("failed to write scenario {}", path.display()))
    }

    pub fn thread_count(&self) -> usize {
        self.tasks.iter().map(|t| t.threads.len()).sum()
    }
}

impl SimKernel {
    /// Build a system from a scenario.
    pub fn from_scenario(scenario: &Scenario) -> Result<Self> {
        if !scenario.page_size.is_power_of_two() || scenario.page_size < 512 {
            bail!("page size {} is not a power of two >= 512", scenario.page_size);
        }
        let mut k = SimKernel::new(scenario.page_size);
        k.set_clock(scenario.clock_start);
        k.set_fault_cost(scenario.fault_cost);
        k.set_cpus(scenario.cpus);
        *k.system_mut() = scenario.system.clone();

        let mut ports = HashMap::new();
        for spec in &scenario.ports {
            let label = spec.label.as_ref().map(|l| {
                let name_addr = match &l.service_name {
                    Some(name) => k.alloc_cstring(SpaceId::KERNEL, name),
                    None => 0,
                };
                k.add_port_label(PortLabelObject {
                    domain: l.domain,
                    throttled: l.throttled,
                    name_addr,
                })
            });
            let kva = k.add_port(PortObject { label });
            if ports.insert(spec.name.clone(), kva).is_some() {
                bail!("port {:?} is defined twice", spec.name);
            }
        }

        for spec in &scenario.tasks {
            k.load_task(spec, &ports)
                .with_context(|| format!("task pid {}", spec.task.pid))?;
        }
        Ok(k)
    }

    fn alloc_cstring(&mut self, space: SpaceId, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_data(space, &bytes)
    }

    fn load_task(&mut self, spec: &TaskSpec, ports: &HashMap<String, Kva>) -> Result<()> {
        let mut task = spec.task.clone();
        task.threads.clear();
        let space = task.space;

        if !spec.images.is_empty() {
            let mut entries = Vec::with_capacity(spec.images.len() * 24);
            for image in &spec.images {
                entries.extend_from_slice(&image.load_address.to_le_bytes());
                entries.extend_from_slice(&image.uuid);
            }
            let array = self.alloc_data(space, &entries);
            let mut header = Vec::with_capacity(16);
            header.extend_from_slice(&IMAGE_INFOS_VERSION.to_le_bytes());
            header.extend_from_slice(&(spec.images.len() as u32).to_le_bytes());
            header.extend_from_slice(&array.to_le_bytes());
            task.image_infos_addr = self.alloc_data(space, &header);
            if spec.images_paged_out {
                self.page_out_range(space, array, entries.len() as u64);
            }
        }
        if task.dq_serialno_offset == 0 && task.dq_label_offset == 0 {
            task.dq_serialno_offset = DEFAULT_DQ_SERIALNO_OFFSET;
            task.dq_label_offset = DEFAULT_DQ_LABEL_OFFSET;
        }
        let (serial_off, label_off) = (task.dq_serialno_offset, task.dq_label_offset);

        let task_kva = if spec.terminated {
            self.add_terminated_task(task)
        } else {
            self.add_task(task)
        };

        for th in &spec.threads {
            let mut thread = th.thread.clone();
            if !th.user_stack.is_empty() {
                thread.user_frame = self.install_stack(space, &th.user_stack);
                if th.stack_paged_out {
                    if let Some(start) = thread.user_frame.filter(|f| f.fp != 0) {
                        let len = (th.user_stack.len() as u64 - 1) * FRAME_STRIDE;
                        self.page_out_range(space, start.fp, len);
                    }
                }
            }
            if !th.kernel_stack.is_empty() {
                thread.kernel_frame = self.install_stack(SpaceId::KERNEL, &th.kernel_stack);
            }
            if let Some(name) = &th.wait_port {
                let Some(&port) = ports.get(name) else {
                    bail!("thread {} waits on unknown port {:?}", thread.tid, name);
                };
                thread.wait.get_or_insert_with(WaitTarget::default).port = Some(port);
            }
            if let Some(name) = &th.turnstile_port {
                let Some(&port) = ports.get(name) else {
                    bail!("thread {} has a turnstile on unknown port {:?}", thread.tid, name);
                };
                thread
                    .turnstile
                    .get_or_insert_with(TurnstileTarget::default)
                    .port = Some(port);
            }
            if let Some(queue) = &th.dispatch_queue {
                let label = self.alloc_cstring(space, &queue.label);
                let len = serial_off.max(label_off) as usize + 8;
                let mut obj = vec![0u8; len];
                let s = serial_off as usize;
                obj[s..s + 8].copy_from_slice(&queue.serial.to_le_bytes());
                let l = label_off as usize;
                obj[l..l + 8].copy_from_slice(&label.to_le_bytes());
                let dq = self.alloc_data(space, &obj);
                thread.dispatch_qaddr = self.alloc_data(space, &dq.to_le_bytes());
            }

            let tid = thread.tid;
            let kva = self.add_thread(task_kva, thread);
            if let Some(cpu) = th.on_core {
                if !self.set_on_core(cpu, Some(kva)) {
                    bail!("thread {} is on cpu {} which does not exist", tid, cpu);
                }
            }
        }

        if spec.corrupt {
            self.corrupt(task_kva);
        }
        Ok(())
    }
}

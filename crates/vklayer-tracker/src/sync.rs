//! Queues, fences, events, and queue submission.
//!
//! Nothing executes, so a submission stays pending until a fence wait or a
//! queue/device idle retires it. Retiring moves its command buffers out of
//! Pending and signals its fence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::command::{CommandBufferNode, CommandBufferState, CommandBufferStatus};
use crate::context::ValidationContext;

#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FenceStatus {
    Unsignaled,
    Signaled,
    InFlight,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FenceNode {
    pub status: FenceStatus,
    pub submitted: bool,
}

#[derive(Debug)]
pub(crate) struct Submission {
    pub queue: u64,
    pub fence: Option<u64>,
    pub command_buffers: Vec<u64>,
}

#[derive(Default)]
pub(crate) struct SyncTracker {
    pub fences: DashMap<u64, FenceNode>,
    pub queues: DashMap<(u32, u32), u64>,
    pub submissions: Mutex<Vec<Submission>>,
}

/// A rejected submission, reported once every lock is released.
type SubmitFailure = (DiagnosticCode, ObjectType, u64, String);

/// Validate a submission against the locked command buffer states and the
/// fence, in submission order.
fn check_submission(
    nodes: &[(u64, Arc<CommandBufferNode>)],
    states: &BTreeMap<u64, MutexGuard<'_, CommandBufferState>>,
    fence_raw: Option<u64>,
    fence: Option<&FenceNode>,
) -> Result<(), SubmitFailure> {
    let mut occurrences: HashMap<u64, u64> = HashMap::new();
    for (raw, _) in nodes {
        let raw = *raw;
        let fail = |code, message: String| Err((code, ObjectType::CommandBuffer, raw, message));
        let Some(state) = states.get(&raw) else {
            continue;
        };

        let seen = occurrences.entry(raw).or_insert(0);
        *seen += 1;
        let total = state.submit_count + *seen;
        let simultaneous = state
            .usage
            .contains(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        if state
            .usage
            .contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            && total > 1
        {
            return fail(
                DiagnosticCode::OneTimeSubmitResubmitted,
                format!(
                    "CB 0x{:x} was begun w/ VK_CMD_BUFFER_USAGE_ONE_TIME_SUBMIT_BIT set, but has been submitted 0x{:x} times.",
                    raw, total
                ),
            );
        }
        match state.status {
            CommandBufferStatus::Initial | CommandBufferStatus::Recording => {
                return fail(
                    DiagnosticCode::CommandBufferNotExecutable,
                    format!(
                        "You must call vkEndCommandBuffer() on CB 0x{:x} before this call to vkQueueSubmit()!",
                        raw
                    ),
                );
            }
            CommandBufferStatus::Invalid => {
                return fail(
                    DiagnosticCode::CommandBufferNotExecutable,
                    format!(
                        "CB 0x{:x} is invalid and must be re-recorded before it is submitted",
                        raw
                    ),
                );
            }
            CommandBufferStatus::Pending if !simultaneous => {
                return fail(
                    DiagnosticCode::CommandBufferSimultaneousUse,
                    format!(
                        "CB 0x{:x} is already in use and was not begun with VK_COMMAND_BUFFER_USAGE_SIMULTANEOUS_USE_BIT",
                        raw
                    ),
                );
            }
            _ if *seen > 1 && !simultaneous => {
                return fail(
                    DiagnosticCode::CommandBufferSimultaneousUse,
                    format!(
                        "CB 0x{:x} appears more than once in this submission without VK_COMMAND_BUFFER_USAGE_SIMULTANEOUS_USE_BIT",
                        raw
                    ),
                );
            }
            _ => {}
        }
    }

    if let (Some(raw), Some(fence)) = (fence_raw, fence) {
        match fence.status {
            FenceStatus::Signaled => {
                return Err((
                    DiagnosticCode::FenceSignaledAtSubmit,
                    ObjectType::Fence,
                    raw,
                    format!(
                        "VkQueueSubmit(): Fence 0x{:x} submitted in SIGNALED state.  Fences must be reset before being submitted",
                        raw
                    ),
                ));
            }
            FenceStatus::InFlight => {
                return Err((
                    DiagnosticCode::FenceInUse,
                    ObjectType::Fence,
                    raw,
                    format!(
                        "VkQueueSubmit(): Fence 0x{:x} is already in use by another submission.",
                        raw
                    ),
                ));
            }
            FenceStatus::Unsignaled => {}
        }
    }
    Ok(())
}

impl ValidationContext {
    // ── Queues ──────────────────────────────────────────────────

    /// Queue handle for `(family, index)`, stable across calls.
    pub fn get_device_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        let raw = *self
            .sync
            .queues
            .entry((queue_family_index, queue_index))
            .or_insert_with(|| self.create_handle::<vk::Queue>(ObjectType::Queue).as_raw());
        vk::Queue::from_raw(raw)
    }

    pub fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[SubmitInfo],
        fence: vk::Fence,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkQueueSubmit";
        let queue_raw = self.check_handle(queue, ObjectType::Queue, LOCATION)?;

        let mut nodes: Vec<(u64, Arc<CommandBufferNode>)> = Vec::new();
        for &command_buffer in submits.iter().flat_map(|s| &s.command_buffers) {
            let node = self.command_buffer_node(command_buffer, LOCATION)?;
            let raw = command_buffer.as_raw();
            if node.level != vk::CommandBufferLevel::PRIMARY {
                return Err(self.error(
                    DiagnosticCode::InvalidCommandBufferLevel,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "Secondary command buffer 0x{:x} cannot be submitted directly to a queue, it must be executed from a primary with vkCmdExecuteCommands()",
                        raw
                    ),
                ));
            }
            nodes.push((raw, node));
        }
        let fence_raw = if fence == vk::Fence::null() {
            None
        } else {
            Some(self.check_handle(fence, ObjectType::Fence, LOCATION)?)
        };

        // Every distinct primary is locked once, in handle order, and stays
        // locked from the first check through the move to Pending.
        let distinct: BTreeMap<u64, &CommandBufferNode> =
            nodes.iter().map(|(raw, node)| (*raw, node.as_ref())).collect();
        let mut states: BTreeMap<u64, MutexGuard<'_, CommandBufferState>> = distinct
            .into_iter()
            .map(|(raw, node)| (raw, node.state.lock()))
            .collect();
        let mut fence_node = fence_raw.and_then(|raw| self.sync.fences.get_mut(&raw));

        let outcome = check_submission(&nodes, &states, fence_raw, fence_node.as_deref());
        if outcome.is_ok() {
            for (raw, _) in &nodes {
                if let Some(state) = states.get_mut(raw) {
                    state.submit_count += 1;
                    state.pending_submissions += 1;
                    state.status = CommandBufferStatus::Pending;
                }
            }
            if let Some(node) = fence_node.as_deref_mut() {
                node.status = FenceStatus::InFlight;
                node.submitted = true;
            }
            // Recorded before the locks drop so a wait can always retire it.
            self.sync.submissions.lock().push(Submission {
                queue: queue_raw,
                fence: fence_raw,
                command_buffers: nodes.iter().map(|(raw, _)| *raw).collect(),
            });
        }
        drop(fence_node);
        drop(states);
        outcome.map_err(|(code, object_type, raw, message)| {
            self.error(code, object_type, raw, LOCATION, message)
        })?;

        debug!(
            queue = format_args!("0x{:x}", queue_raw),
            command_buffers = nodes.len(),
            fence = ?fence_raw,
            "submitted"
        );
        Ok(())
    }

    /// Complete submissions: signal fences and move command buffers out of
    /// Pending.
    fn complete(&self, retired: Vec<Submission>) {
        for submission in retired {
            if let Some(fence) = submission.fence {
                if let Some(mut node) = self.sync.fences.get_mut(&fence) {
                    node.status = FenceStatus::Signaled;
                }
            }
            for raw in submission.command_buffers {
                let node = self.commands.buffers.get(&raw).map(|n| Arc::clone(n.value()));
                if let Some(node) = node {
                    node.state.lock().retire();
                }
            }
            trace!(queue = format_args!("0x{:x}", submission.queue), "submission retired");
        }
    }

    /// Retire the submission carrying `fence` and everything submitted
    /// before it on the same queue.
    fn retire_through_fence(&self, fence: u64) {
        let retired = {
            let mut submissions = self.sync.submissions.lock();
            let Some(position) = submissions.iter().position(|s| s.fence == Some(fence)) else {
                return;
            };
            let queue = submissions[position].queue;
            let mut index = 0;
            let mut retired = Vec::new();
            submissions.retain_mut(|s| {
                let done = index <= position && s.queue == queue;
                index += 1;
                if done {
                    retired.push(Submission {
                        queue: s.queue,
                        fence: s.fence,
                        command_buffers: std::mem::take(&mut s.command_buffers),
                    });
                }
                !done
            });
            retired
        };
        self.complete(retired);
    }

    fn retire_where(&self, predicate: impl Fn(&Submission) -> bool) {
        let retired = {
            let mut submissions = self.sync.submissions.lock();
            let (retired, kept): (Vec<_>, Vec<_>) =
                submissions.drain(..).partition(|s| predicate(s));
            *submissions = kept;
            retired
        };
        self.complete(retired);
    }

    pub fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), ValidationError> {
        let raw = self.check_handle(queue, ObjectType::Queue, "vkQueueWaitIdle")?;
        self.retire_where(|s| s.queue == raw);
        Ok(())
    }

    pub fn device_wait_idle(&self) -> Result<(), ValidationError> {
        self.retire_where(|_| true);
        Ok(())
    }

    // ── Fences ──────────────────────────────────────────────────

    pub fn create_fence(&self, flags: vk::FenceCreateFlags) -> Result<vk::Fence, ValidationError> {
        let fence: vk::Fence = self.create_handle(ObjectType::Fence);
        let status = if flags.contains(vk::FenceCreateFlags::SIGNALED) {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        };
        self.sync.fences.insert(
            fence.as_raw(),
            FenceNode {
                status,
                submitted: false,
            },
        );
        Ok(fence)
    }

    pub fn destroy_fence(&self, fence: vk::Fence) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkDestroyFence";
        if fence == vk::Fence::null() {
            return Ok(());
        }
        let node = self.lookup(&self.sync.fences, fence, ObjectType::Fence, LOCATION)?;
        let raw = fence.as_raw();
        if node.status == FenceStatus::InFlight {
            return Err(self.error(
                DiagnosticCode::FenceInUse,
                ObjectType::Fence,
                raw,
                LOCATION,
                format!(
                    "Fence 0x{:x} is in use by a pending queue submission and cannot be destroyed",
                    raw
                ),
            ));
        }
        self.sync.fences.remove(&raw);
        self.retire_handle(raw, ObjectType::Fence);
        Ok(())
    }

    pub fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkResetFences";
        let mut resolved = Vec::with_capacity(fences.len());
        for &fence in fences {
            let node = self.lookup(&self.sync.fences, fence, ObjectType::Fence, LOCATION)?;
            let raw = fence.as_raw();
            if node.status == FenceStatus::InFlight {
                return Err(self.error(
                    DiagnosticCode::FenceInUse,
                    ObjectType::Fence,
                    raw,
                    LOCATION,
                    format!(
                        "Fence 0x{:x} is in use by a pending queue submission and cannot be reset",
                        raw
                    ),
                ));
            }
            resolved.push((raw, node.status));
        }
        for (raw, status) in resolved {
            if status == FenceStatus::Unsignaled {
                self.warn(
                    DiagnosticCode::FenceResetWhileUnsignaled,
                    ObjectType::Fence,
                    raw,
                    LOCATION,
                    format!(
                        "Fence 0x{:x} submitted to VkResetFences in UNSIGNALED STATE",
                        raw
                    ),
                );
            }
            if let Some(mut node) = self.sync.fences.get_mut(&raw) {
                node.status = FenceStatus::Unsignaled;
            }
        }
        Ok(())
    }

    /// Waiting on an in-flight fence retires its submission. Returns
    /// `TIMEOUT` when the wait condition cannot be met.
    pub fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        _timeout: u64,
    ) -> Result<vk::Result, ValidationError> {
        const LOCATION: &str = "vkWaitForFences";
        let mut resolved = Vec::with_capacity(fences.len());
        for &fence in fences {
            let node = self.lookup(&self.sync.fences, fence, ObjectType::Fence, LOCATION)?;
            resolved.push((fence.as_raw(), node));
        }

        for (raw, node) in &resolved {
            match node.status {
                FenceStatus::InFlight => self.retire_through_fence(*raw),
                FenceStatus::Unsignaled if !node.submitted => self.warn(
                    DiagnosticCode::FenceNeverSubmitted,
                    ObjectType::Fence,
                    *raw,
                    LOCATION,
                    format!(
                        "vkWaitForFences called for fence 0x{:x} which has not been submitted on a Queue",
                        raw
                    ),
                ),
                _ => {}
            }
        }

        let signaled = |raw: &u64| {
            self.sync
                .fences
                .get(raw)
                .is_some_and(|f| f.status == FenceStatus::Signaled)
        };
        let satisfied = if wait_all {
            resolved.iter().all(|(raw, _)| signaled(raw))
        } else {
            resolved.iter().any(|(raw, _)| signaled(raw))
        };
        Ok(if satisfied {
            vk::Result::SUCCESS
        } else {
            vk::Result::TIMEOUT
        })
    }

    pub fn get_fence_status(&self, fence: vk::Fence) -> Result<vk::Result, ValidationError> {
        let node = self.lookup(&self.sync.fences, fence, ObjectType::Fence, "vkGetFenceStatus")?;
        Ok(match node.status {
            FenceStatus::Signaled => vk::Result::SUCCESS,
            _ => vk::Result::NOT_READY,
        })
    }

    // ── Events ──────────────────────────────────────────────────

    pub fn create_event(&self) -> Result<vk::Event, ValidationError> {
        Ok(self.create_handle(ObjectType::Event))
    }

    pub fn destroy_event(&self, event: vk::Event) -> Result<(), ValidationError> {
        if event == vk::Event::null() {
            return Ok(());
        }
        let raw = self.check_handle(event, ObjectType::Event, "vkDestroyEvent")?;
        self.retire_handle(raw, ObjectType::Event);
        Ok(())
    }

    pub fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        _stage_mask: vk::PipelineStageFlags,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdSetEvent";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            self.check_handle(event, ObjectType::Event, LOCATION)?;
            Ok(())
        })
    }

    pub fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        _stage_mask: vk::PipelineStageFlags,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdResetEvent";
        self.record(command_buffer, LOCATION, |_, state| {
            self.require_outside_render_pass(state, command_buffer, LOCATION)?;
            self.check_handle(event, ObjectType::Event, LOCATION)?;
            Ok(())
        })
    }
}

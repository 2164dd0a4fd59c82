//! Detection of unsynchronized use of one command buffer from several threads.
//!
//! Every command buffer carries an [`OwnerMarker`]. A mutating call claims the
//! marker for the calling thread with a compare-exchange and releases it when
//! the returned [`ThreadGuard`] drops. A claim that finds another thread's
//! token is a collision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;

const UNOWNED: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Small non-zero integer identifying the calling thread.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Atomic "currently used by thread T" marker.
#[derive(Debug, Default)]
pub struct OwnerMarker {
    owner: AtomicU64,
}

impl OwnerMarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim for the current thread. On collision returns the token of the
    /// thread holding the marker.
    pub fn claim(self: &Arc<Self>) -> Result<ThreadGuard, u64> {
        let me = current_thread_token();
        match self
            .owner
            .compare_exchange(UNOWNED, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(ThreadGuard {
                marker: Some(Arc::clone(self)),
            }),
            // Nested claim from the owning thread; the outer guard releases.
            Err(current) if current == me => Ok(ThreadGuard::unowned()),
            Err(current) => Err(current),
        }
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            UNOWNED => None,
            token => Some(token),
        }
    }
}

/// Releases an [`OwnerMarker`] on drop.
#[must_use = "the command buffer is released as soon as the guard drops"]
#[derive(Debug)]
pub struct ThreadGuard {
    marker: Option<Arc<OwnerMarker>>,
}

impl ThreadGuard {
    /// Guard that releases nothing, used when threading checks are off.
    pub(crate) fn unowned() -> Self {
        Self { marker: None }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            marker.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

impl ValidationContext {
    /// Claim a command buffer for the calling thread until the guard drops.
    ///
    /// Every recording call claims the buffer internally; an embedding layer
    /// can hold a claim across a batch of calls it forwards together.
    pub fn claim_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<ThreadGuard, ValidationError> {
        let node = self.command_buffer_node(command_buffer, "vkClaimCommandBuffer")?;
        self.claim_owner(&node.owner, command_buffer, "vkClaimCommandBuffer")
    }

    pub(crate) fn claim_owner(
        &self,
        marker: &Arc<OwnerMarker>,
        command_buffer: vk::CommandBuffer,
        location: &'static str,
    ) -> Result<ThreadGuard, ValidationError> {
        use ash::vk::Handle;

        if !self.config().checks.threading {
            return Ok(ThreadGuard::unowned());
        }
        marker.claim().map_err(|other| {
            self.error(
                DiagnosticCode::ThreadingCollision,
                ObjectType::CommandBuffer,
                command_buffer.as_raw(),
                location,
                format!(
                    "THREADING ERROR : object of type {} is simultaneously used in thread {} and thread {}",
                    ObjectType::CommandBuffer.vk_name(),
                    other,
                    current_thread_token()
                ),
            )
        })
    }
}

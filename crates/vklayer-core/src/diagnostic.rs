//! Diagnostics and the message sink every tracker reports through.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::handle::ObjectType;

bitflags! {
    /// Severity bits carried by a diagnostic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReportFlags: u32 {
        const INFO = 0x01;
        const WARN = 0x02;
        const PERF_WARN = 0x04;
        const ERROR = 0x08;
        const DEBUG = 0x10;
    }
}

impl ReportFlags {
    /// Severities that replace the sink's "latest" state.
    pub const SURFACED: ReportFlags = ReportFlags::WARN
        .union(ReportFlags::PERF_WARN)
        .union(ReportFlags::ERROR);
}

/// Tracker category a diagnostic originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    ObjectTracker,
    MemTracker,
    DrawState,
    ShaderChecker,
    DeviceLimits,
    Image,
    Threading,
}

impl Layer {
    pub fn prefix(self) -> &'static str {
        match self {
            Layer::ObjectTracker => "OBJTRACK",
            Layer::MemTracker => "MEM",
            Layer::DrawState => "DS",
            Layer::ShaderChecker => "SC",
            Layer::DeviceLimits => "DL",
            Layer::Image => "IMAGE",
            Layer::Threading => "Threading",
        }
    }
}

/// Machine-readable identity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCode {
    // object tracker
    InvalidObject,

    // memory
    InvalidMemoryType,
    MemoryNotHostVisible,
    MemoryAlreadyMapped,
    MemoryNotMapped,
    InvalidMapRange,
    RebindObject,
    BindRangeOutOfBounds,
    FreedMemoryStillBound,

    // command buffer lifecycle
    NoBeginCommandBuffer,
    BeginCommandBufferWhileActive,
    ResetCommandBufferWhilePending,
    ResetCommandBufferNotAllowed,
    CommandBufferInUse,
    CommandBufferNotExecutable,
    CommandBufferSimultaneousUse,
    OneTimeSubmitResubmitted,
    InvalidBeginInfo,
    InvalidCommandBufferLevel,
    EndCommandBufferInsideRenderPass,

    // fences and queues
    FenceSignaledAtSubmit,
    FenceResetWhileUnsignaled,
    FenceInUse,
    FenceNeverSubmitted,

    // render pass scope
    NullRenderPass,
    InsideRenderPass,
    OutsideRenderPass,
    InvalidSubpassIndex,
    ClearBeforeDraw,
    InvalidClearAttachment,
    InvalidAttachmentReference,
    FramebufferMismatch,

    // pipeline binding and draws
    PipelineBoundOutsideRenderPass,
    NumSamplesMismatch,
    NoPipelineBound,
    DynamicStateNotSet,
    DynamicCountMismatch,
    VertexBindingNotDeclared,
    IndexBufferNotBound,
    IndexBufferMisaligned,
    BufferUpdateMisaligned,
    InvalidParameter,
    PrimaryInExecuteCommands,
    SecondaryNotExecutable,

    // descriptors
    DescriptorPoolEmpty,
    FreeFromNonFreePool,
    InvalidDescriptorPool,
    InvalidUpdateStruct,
    UpdateBindingMissing,
    DescriptorUpdateOutOfBounds,
    DescriptorTypeMismatch,
    InvalidDescriptorHandle,
    DescriptorSetNotUpdated,
    DuplicateLayoutBinding,
    DescriptorSetIndexOutOfRange,

    // pipeline creation
    InvalidPipelineCreateState,
    ViewportScissorCountMismatch,
    ViewportStateMissing,
    DeviceLimitExceeded,

    // shader interface
    ShaderNotSpirv,
    MissingEntryPoint,
    OutputNotConsumed,
    InputNotProduced,
    InterfaceTypeMismatch,
    AttributeNotConsumed,
    AttributeNotProvided,
    AttributeTypeMismatch,
    DuplicateVertexBinding,
    AttachmentNotWritten,
    FragmentOutputNotConsumed,
    FragmentOutputTypeMismatch,
    DescriptorNotInLayout,

    // images and buffers
    ImageExtentLimit,
    ImageLayerLimit,
    ImageResourceSizeLimit,
    InvalidImageCreateInfo,
    ImageViewBadMipLevel,
    ImageViewBadArrayLayer,
    ImageViewBadAspect,
    ImageViewBadUsage,
    CopyImageMismatch,
    ResolveImageMismatch,
    ClearImageFormatMismatch,
    InvalidBufferViewRange,

    // threading
    ThreadingCollision,
}

impl DiagnosticCode {
    pub fn layer(self) -> Layer {
        use DiagnosticCode::*;
        match self {
            InvalidObject => Layer::ObjectTracker,
            InvalidMemoryType | MemoryNotHostVisible | MemoryAlreadyMapped | MemoryNotMapped
            | InvalidMapRange | RebindObject | BindRangeOutOfBounds | FreedMemoryStillBound => {
                Layer::MemTracker
            }
            ShaderNotSpirv | MissingEntryPoint | OutputNotConsumed | InputNotProduced
            | InterfaceTypeMismatch | AttributeNotConsumed | AttributeNotProvided
            | AttributeTypeMismatch | DuplicateVertexBinding | AttachmentNotWritten
            | FragmentOutputNotConsumed | FragmentOutputTypeMismatch | DescriptorNotInLayout => {
                Layer::ShaderChecker
            }
            ImageExtentLimit | ImageLayerLimit | ImageResourceSizeLimit | DeviceLimitExceeded => {
                Layer::DeviceLimits
            }
            InvalidImageCreateInfo | ImageViewBadMipLevel | ImageViewBadArrayLayer
            | ImageViewBadAspect | ImageViewBadUsage | CopyImageMismatch | ResolveImageMismatch
            | ClearImageFormatMismatch | InvalidBufferViewRange => Layer::Image,
            ThreadingCollision => Layer::Threading,
            _ => Layer::DrawState,
        }
    }
}

/// One report, shaped like a debug-report callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub flags: ReportFlags,
    pub object_type: ObjectType,
    pub object: u64,
    /// Intercepted entry point, e.g. `vkCmdDraw`.
    pub location: &'static str,
    pub code: DiagnosticCode,
    pub layer_prefix: &'static str,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        flags: ReportFlags,
        code: DiagnosticCode,
        object_type: ObjectType,
        object: u64,
        location: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            flags,
            object_type,
            object,
            location,
            code,
            layer_prefix: code.layer().prefix(),
            message: message.into(),
        }
    }
}

/// Handle returned by [`MessageSink::register_callback`].
pub type CallbackId = u64;

type Callback = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

struct SinkState {
    last_flags: ReportFlags,
    last_message: String,
    history: VecDeque<Diagnostic>,
}

/// Thread-safe receiver for every diagnostic the trackers emit.
///
/// Keeps the most recent warning or error for polling consumers, a bounded
/// history for `drain`, and forwards each report to registered callbacks.
/// Each context owns an `Arc<MessageSink>`; independent sinks never share
/// state.
pub struct MessageSink {
    state: Mutex<SinkState>,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    next_callback: AtomicU64,
    bailout: Mutex<Option<Arc<AtomicBool>>>,
    error_count: AtomicU64,
    history_limit: usize,
}

impl MessageSink {
    pub const DEFAULT_HISTORY_LIMIT: usize = 256;

    pub fn new() -> Self {
        Self::with_history_limit(Self::DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(SinkState {
                last_flags: ReportFlags::INFO,
                last_message: String::new(),
                history: VecDeque::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            bailout: Mutex::new(None),
            error_count: AtomicU64::new(0),
            history_limit,
        }
    }

    pub fn report(&self, diag: Diagnostic) {
        log_diagnostic(&diag);

        if diag.flags.contains(ReportFlags::ERROR) {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            if let Some(flag) = self.bailout.lock().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }

        // Callbacks run outside the state lock so they may call back in.
        let callbacks: Vec<Callback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in &callbacks {
            cb(&diag);
        }

        let mut state = self.state.lock();
        if diag.flags.intersects(ReportFlags::SURFACED) {
            state.last_flags = diag.flags;
            state.last_message.clone_from(&diag.message);
        }
        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(diag);
        }
    }

    /// Severity and text of the latest warning or error, or `INFO` and an
    /// empty string when nothing was surfaced since the last clear.
    pub fn state(&self) -> (ReportFlags, String) {
        let state = self.state.lock();
        (state.last_flags, state.last_message.clone())
    }

    pub fn last_flags(&self) -> ReportFlags {
        self.state.lock().last_flags
    }

    pub fn last_message(&self) -> String {
        self.state.lock().last_message.clone()
    }

    /// Reset the latest state to the baseline. History is left alone.
    pub fn clear_state(&self) {
        let mut state = self.state.lock();
        state.last_flags = ReportFlags::INFO;
        state.last_message.clear();
    }

    /// Flag raised on the next error, used to stop stress loops early.
    pub fn set_bailout(&self, flag: Arc<AtomicBool>) {
        *self.bailout.lock() = Some(flag);
    }

    pub fn clear_bailout(&self) {
        *self.bailout.lock() = None;
    }

    /// Callbacks run on the reporting thread, possibly while a tracker holds
    /// its own locks, so they must not call back into the trackers.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Take every retained diagnostic, oldest first.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.state.lock().history.drain(..).collect()
    }

    /// Errors reported over the sink's lifetime.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl Default for MessageSink {
    fn default() -> Self {
        Self::new()
    }
}

fn log_diagnostic(diag: &Diagnostic) {
    let object = format!("0x{:x}", diag.object);
    if diag.flags.contains(ReportFlags::ERROR) {
        tracing::error!(
            layer = diag.layer_prefix,
            code = ?diag.code,
            object_type = %diag.object_type,
            %object,
            location = diag.location,
            "{}",
            diag.message
        );
    } else if diag.flags.intersects(ReportFlags::WARN | ReportFlags::PERF_WARN) {
        tracing::warn!(
            layer = diag.layer_prefix,
            code = ?diag.code,
            object_type = %diag.object_type,
            %object,
            location = diag.location,
            "{}",
            diag.message
        );
    } else {
        tracing::debug!(
            layer = diag.layer_prefix,
            code = ?diag.code,
            object_type = %diag.object_type,
            %object,
            location = diag.location,
            "{}",
            diag.message
        );
    }
}

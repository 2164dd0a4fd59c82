use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::{debug, error, info};
use vklayer_core::{
    Diagnostic, DiagnosticCode, HandleAllocator, LayerConfig, MessageSink, ObjectRegistry,
    ObjectType, ReportFlags, ValidationError,
};

use crate::command::CommandTracker;
use crate::descriptor::DescriptorTracker;
use crate::image::ImageTracker;
use crate::memory::MemoryTracker;
use crate::pipeline::PipelineTracker;
use crate::render_pass::RenderPassTracker;
use crate::shader::ShaderTracker;
use crate::sync::SyncTracker;

/// Shadow state of one device and the trackers that validate calls on it.
///
/// Every intercepted call is a `&self` method, so one context can be shared
/// across application threads. A call that returns `Err` has reported
/// exactly one error through the sink and left the shadow state unchanged.
pub struct ValidationContext {
    config: LayerConfig,
    sink: Arc<MessageSink>,
    objects: ObjectRegistry,
    handles: HandleAllocator,
    device: vk::Device,
    pub(crate) memory: MemoryTracker,
    pub(crate) images: ImageTracker,
    pub(crate) commands: CommandTracker,
    pub(crate) descriptors: DescriptorTracker,
    pub(crate) pipelines: PipelineTracker,
    pub(crate) render_passes: RenderPassTracker,
    pub(crate) shaders: ShaderTracker,
    pub(crate) sync: SyncTracker,
}

impl ValidationContext {
    pub fn new(config: LayerConfig, sink: Arc<MessageSink>) -> Self {
        let objects = ObjectRegistry::new();
        let handles = HandleAllocator::new();
        let device_raw = handles.alloc_raw();
        if let Err(e) = objects.register(device_raw, ObjectType::Device) {
            error!("failed to register device: {}", e);
        }
        info!(
            device = format_args!("0x{:x}", device_raw),
            memory_types = config.device.memory_types.len(),
            threading = config.checks.threading,
            shader_interface = config.checks.shader_interface,
            device_limits = config.checks.device_limits,
            "validation context created"
        );
        Self {
            config,
            sink,
            objects,
            handles,
            device: vk::Device::from_raw(device_raw),
            memory: MemoryTracker::default(),
            images: ImageTracker::default(),
            commands: CommandTracker::default(),
            descriptors: DescriptorTracker::default(),
            pipelines: PipelineTracker::default(),
            render_passes: RenderPassTracker::default(),
            shaders: ShaderTracker::default(),
            sync: SyncTracker::default(),
        }
    }

    /// Context with default configuration and its own sink.
    pub fn with_defaults() -> Self {
        let config = LayerConfig::default();
        let sink = Arc::new(MessageSink::with_history_limit(config.report.history_limit));
        Self::new(config, sink)
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<MessageSink> {
        &self.sink
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub fn device(&self) -> vk::Device {
        self.device
    }

    // ── Reporting ───────────────────────────────────────────────

    /// Report an error and build the matching `Err` value.
    pub(crate) fn error(
        &self,
        code: DiagnosticCode,
        object_type: ObjectType,
        object: u64,
        location: &'static str,
        message: String,
    ) -> ValidationError {
        self.sink.report(Diagnostic::new(
            ReportFlags::ERROR,
            code,
            object_type,
            object,
            location,
            message.clone(),
        ));
        ValidationError::new(code, message)
    }

    pub(crate) fn warn(
        &self,
        code: DiagnosticCode,
        object_type: ObjectType,
        object: u64,
        location: &'static str,
        message: String,
    ) {
        self.sink.report(Diagnostic::new(
            ReportFlags::WARN,
            code,
            object_type,
            object,
            location,
            message,
        ));
    }

    pub(crate) fn info(
        &self,
        code: DiagnosticCode,
        object_type: ObjectType,
        object: u64,
        location: &'static str,
        message: String,
    ) {
        self.sink.report(Diagnostic::new(
            ReportFlags::INFO,
            code,
            object_type,
            object,
            location,
            message,
        ));
    }

    // ── Object lifetime ─────────────────────────────────────────

    /// Resolve a handle through the registry, reporting if it is not a live
    /// object of the expected type.
    pub(crate) fn check_handle<H: Handle>(
        &self,
        handle: H,
        object_type: ObjectType,
        location: &'static str,
    ) -> Result<u64, ValidationError> {
        let raw = handle.as_raw();
        match self.objects.validate(raw, object_type).describe(raw, object_type) {
            None => Ok(raw),
            Some(message) => Err(self.error(
                DiagnosticCode::InvalidObject,
                object_type,
                raw,
                location,
                message,
            )),
        }
    }

    /// Resolve a handle and clone its shadow node out of a tracker table.
    pub(crate) fn lookup<H: Handle, T: Clone>(
        &self,
        table: &DashMap<u64, T>,
        handle: H,
        object_type: ObjectType,
        location: &'static str,
    ) -> Result<T, ValidationError> {
        let raw = self.check_handle(handle, object_type, location)?;
        let node = table.get(&raw).map(|node| node.value().clone());
        node.ok_or_else(|| {
            self.error(
                DiagnosticCode::InvalidObject,
                object_type,
                raw,
                location,
                format!("Invalid {} Object 0x{:x}", object_type.vk_name(), raw),
            )
        })
    }

    /// Allocate and register a handle for a newly created object.
    pub(crate) fn create_handle<H: Handle>(&self, object_type: ObjectType) -> H {
        let raw = self.handles.alloc_raw();
        if let Err(e) = self.objects.register(raw, object_type) {
            // Allocated values are unique, so this only fires on a registry bug.
            error!("{}", e);
        }
        debug!(
            object_type = %object_type,
            handle = format_args!("0x{:x}", raw),
            "created"
        );
        H::from_raw(raw)
    }

    /// Mark an object destroyed. Callers check the handle first.
    pub(crate) fn retire_handle(&self, raw: u64, object_type: ObjectType) {
        self.objects.unregister(raw, object_type);
        debug!(
            object_type = %object_type,
            handle = format_args!("0x{:x}", raw),
            "destroyed"
        );
    }
}

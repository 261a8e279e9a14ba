//! WebGPU backend: wgpu device management, buffer table, pipeline cache,
//! and compute dispatch with grid tiling.

use crate::backend::codegen::{self, GRID_WRAP};
use crate::backend::{Backend, BufferId, Device, Executable};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::tuner::tuned_plan;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use wgpu::util::DeviceExt;

/// Global WebGPU context.
static WEBGPU_CONTEXT: OnceLock<WebGpuContext> = OnceLock::new();

/// WebGPU execution context with device and queue.
pub struct WebGpuContext {
    /// WebGPU device handle
    pub device: wgpu::Device,
    /// WebGPU command queue
    pub queue: wgpu::Queue,
}

impl WebGpuContext {
    /// Initialize the WebGPU context. Idempotent; returns an error when no
    /// suitable adapter exists.
    pub async fn init() -> Result<()> {
        if WEBGPU_CONTEXT.get().is_some() {
            return Ok(());
        }
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::Capability {
                device: Device::WebGpu,
                message: "no suitable GPU adapter".into(),
            })?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("microjax device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::Capability {
                device: Device::WebGpu,
                message: format!("failed to create device: {}", e),
            })?;

        let _ = WEBGPU_CONTEXT.set(WebGpuContext { device, queue });
        Ok(())
    }

    /// Get the global context.
    ///
    /// # Panics
    ///
    /// Panics if WebGPU has not been initialized.
    pub fn get() -> &'static WebGpuContext {
        WEBGPU_CONTEXT.get().expect("WebGPU not initialized; call init() first")
    }

    /// Whether the context is up.
    pub fn is_initialized() -> bool {
        WEBGPU_CONTEXT.get().is_some()
    }
}

struct Entry {
    refcount: usize,
    dtype: DType,
    len: usize,
    buffer: wgpu::Buffer,
}

struct GpuExecutable {
    kernel: Kernel,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroups: u64,
}

impl Executable for GpuExecutable {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// The WebGPU backend.
pub struct WebGpuBackend {
    table: Mutex<HashMap<BufferId, Entry>>,
    programs: Mutex<HashMap<u64, Arc<GpuExecutable>>>,
    next_id: AtomicU64,
}

impl WebGpuBackend {
    pub(crate) fn try_new() -> Result<WebGpuBackend> {
        pollster::block_on(WebGpuContext::init())?;
        Ok(WebGpuBackend {
            table: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Device-side element width; bool is stored as i32.
    fn device_width(dtype: DType) -> Result<usize> {
        match dtype {
            DType::Bool => Ok(4),
            DType::Int32 | DType::Uint32 | DType::Float16 | DType::Float32 => Ok(4),
            DType::Float64 => Err(Error::Unsupported {
                device: Device::WebGpu,
                what: "float64 buffers".into(),
            }),
        }
    }

    /// Convert host-layout bytes to the device layout.
    fn to_device_bytes(dtype: DType, host: &[u8]) -> Vec<u8> {
        if dtype == DType::Bool {
            host.iter().flat_map(|&b| (b as i32).to_le_bytes()).collect()
        } else {
            host.to_vec()
        }
    }

    /// Convert device-layout bytes back to the host layout.
    fn to_host_bytes(dtype: DType, device: &[u8]) -> Vec<u8> {
        if dtype == DType::Bool {
            device
                .chunks_exact(4)
                .map(|c| (i32::from_le_bytes(c.try_into().unwrap()) != 0) as u8)
                .collect()
        } else {
            device.to_vec()
        }
    }

    async fn read_device_bytes(buffer: &wgpu::Buffer, byte_len: u64) -> Vec<u8> {
        if byte_len == 0 {
            return Vec::new();
        }
        let ctx = WebGpuContext::get();
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("microjax staging"),
            size: byte_len.max(4),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, byte_len);
        ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..byte_len);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device.poll(wgpu::Maintain::Wait);
        rx.await.unwrap().unwrap();

        let data = slice.get_mapped_range();
        let result = data.to_vec();
        drop(data);
        staging.unmap();
        result
    }
}

impl Backend for WebGpuBackend {
    fn device(&self) -> Device {
        Device::WebGpu
    }

    fn malloc(&self, len: usize, dtype: DType, init: Option<&[u8]>) -> Result<BufferId> {
        let ctx = WebGpuContext::get();
        let width = Self::device_width(dtype)?;
        let byte_len = (len * width).max(4) as u64; // wgpu rejects zero-sized bindings
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;

        let buffer = match init {
            Some(host) => {
                assert_eq!(host.len(), len * dtype.byte_width(), "init length mismatch");
                let mut contents = Self::to_device_bytes(dtype, host);
                contents.resize(byte_len as usize, 0);
                ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("microjax buffer"),
                    contents: &contents,
                    usage,
                })
            }
            None => ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("microjax buffer"),
                size: byte_len,
                usage,
                mapped_at_creation: false,
            }),
        };

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .lock()
            .unwrap()
            .insert(id, Entry { refcount: 1, dtype, len, buffer });
        Ok(id)
    }

    fn inc_ref(&self, id: BufferId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let entry = table.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        entry.refcount += 1;
        Ok(())
    }

    fn dec_ref(&self, id: BufferId) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let entry = table.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            table.remove(&id);
        }
        Ok(())
    }

    fn read(&self, id: BufferId, start: usize, count: Option<usize>) -> Result<Vec<u8>> {
        let (buffer_bytes, dtype, len) = {
            let table = self.table.lock().unwrap();
            let entry = table.get(&id).ok_or(Error::InvalidHandle(id))?;
            let width = Self::device_width(entry.dtype)?;
            let byte_len = (entry.len * width) as u64;
            (
                pollster::block_on(Self::read_device_bytes(&entry.buffer, byte_len)),
                entry.dtype,
                entry.len,
            )
        };
        let host = Self::to_host_bytes(dtype, &buffer_bytes);
        let count = count.unwrap_or(len.saturating_sub(start));
        let w = dtype.byte_width();
        Ok(host[start * w..(start + count) * w].to_vec())
    }

    fn prepare(&self, kernel: &Kernel) -> Result<Arc<dyn Executable>> {
        let key = kernel.cache_key();
        if let Some(exe) = self.programs.lock().unwrap().get(&key) {
            return Ok(exe.clone() as Arc<dyn Executable>);
        }

        let ctx = WebGpuContext::get();
        let plan = tuned_plan(kernel);
        let shader = codegen::render(kernel, &plan)?;
        log::debug!(
            "webgpu: compiling kernel {:x} ({} threads, dims {:?})",
            key,
            plan.threads,
            plan.dims
        );

        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("microjax kernel"),
            source: wgpu::ShaderSource::Wgsl(shader.source.clone().into()),
        });
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(Error::Compile {
                message: e.to_string(),
                source_text: shader.source,
            });
        }

        let mut entries = Vec::new();
        for binding in 0..kernel.num_inputs as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: kernel.num_inputs as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("microjax bind group layout"),
                entries: &entries,
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("microjax pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("microjax pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(Error::Compile {
                message: e.to_string(),
                source_text: shader.source,
            });
        }

        let exe = Arc::new(GpuExecutable {
            kernel: kernel.clone(),
            pipeline,
            layout,
            workgroups: shader.workgroups,
        });
        self.programs.lock().unwrap().insert(key, exe.clone());
        Ok(exe)
    }

    fn dispatch(
        &self,
        exe: &dyn Executable,
        inputs: &[BufferId],
        outputs: &[BufferId],
    ) -> Result<()> {
        let exe = exe
            .as_any()
            .downcast_ref::<GpuExecutable>()
            .expect("executable from a different backend");
        assert_eq!(inputs.len(), exe.kernel.num_inputs, "input arity mismatch");
        assert_eq!(outputs.len(), 1, "kernels have one output");
        if exe.kernel.size == 0 {
            return Ok(());
        }

        let ctx = WebGpuContext::get();
        let table = self.table.lock().unwrap();
        let mut bind_entries = Vec::new();
        for (binding, id) in inputs.iter().chain(outputs).enumerate() {
            let entry = table.get(id).ok_or(Error::InvalidHandle(*id))?;
            bind_entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: entry.buffer.as_entire_binding(),
            });
        }
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("microjax bind group"),
            layout: &exe.layout,
            entries: &bind_entries,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("dispatch") });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("microjax pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&exe.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            // Two-dimensional grid once the linear count exceeds the wrap.
            let x = exe.workgroups.min(GRID_WRAP) as u32;
            let y = exe.workgroups.div_ceil(GRID_WRAP) as u32;
            cpass.dispatch_workgroups(x, y, 1);
        }
        ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn allocated(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_initialized_query_is_safe() {
        // Just exercising the query; tests must not require an adapter.
        let _ = WebGpuContext::is_initialized();
    }

    #[test]
    fn test_device_width_rejects_f64() {
        assert!(WebGpuBackend::device_width(DType::Float64).is_err());
        assert_eq!(WebGpuBackend::device_width(DType::Bool).unwrap(), 4);
    }

    #[test]
    fn test_bool_layout_conversion() {
        let host = vec![1u8, 0, 1];
        let device = WebGpuBackend::to_device_bytes(DType::Bool, &host);
        assert_eq!(device.len(), 12);
        assert_eq!(WebGpuBackend::to_host_bytes(DType::Bool, &device), host);
    }
}

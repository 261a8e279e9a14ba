//! Backend abstraction: devices, buffers, executables, and the registry.
//!
//! All three backends implement the same [`Backend`] interface: allocate and
//! refcount opaque buffers, prepare kernels into executables, and dispatch
//! them in FIFO order.

pub mod codegen;
pub mod cpu;
pub mod wasm;
pub mod webgpu;

use crate::dtype::{DType, Scalar};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::routines::Routine;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

/// Compute device for array operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Device {
    /// Reference interpreter (slow, for correctness)
    Cpu,
    /// Bytecode stack-machine backend
    Wasm,
    /// WebGPU backend
    WebGpu,
}

impl Device {
    /// All known devices.
    pub fn all() -> &'static [Device] {
        &[Device::Cpu, Device::Wasm, Device::WebGpu]
    }

    /// The name of this device as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Wasm => "wasm",
            Device::WebGpu => "webgpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "wasm" => Ok(Device::Wasm),
            "webgpu" => Ok(Device::WebGpu),
            _ => Err(format!("unknown device: {}", s)),
        }
    }
}

/// Opaque handle to a device buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

/// A prepared kernel, ready to dispatch.
///
/// Concrete executables are backend-specific; `dispatch` downcasts.
pub trait Executable: Send + Sync {
    /// Downcast support.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Future returned by [`Backend::prepare_async`].
pub type PrepareFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn Executable>>> + 'a>>;

/// The uniform backend interface.
pub trait Backend: Send + Sync {
    /// Which device this backend drives.
    fn device(&self) -> Device;

    /// Allocate a buffer of `len` elements with refcount 1, optionally
    /// initialised from host-layout bytes. Zero-size allocations are valid.
    fn malloc(&self, len: usize, dtype: DType, init: Option<&[u8]>) -> Result<BufferId>;

    /// Increment a buffer's refcount.
    fn inc_ref(&self, id: BufferId) -> Result<()>;

    /// Decrement a buffer's refcount, freeing at zero.
    fn dec_ref(&self, id: BufferId) -> Result<()>;

    /// Read `count` elements starting at `start` (defaults to the whole
    /// buffer) as host-layout bytes. Blocks until pending writes to this
    /// buffer are visible.
    fn read(&self, id: BufferId, start: usize, count: Option<usize>) -> Result<Vec<u8>>;

    /// Compile (and cache) an executable for a kernel. Pure with respect to
    /// buffer handles.
    fn prepare(&self, kernel: &Kernel) -> Result<Arc<dyn Executable>>;

    /// Asynchronous prepare; the frontend prefers this form so compiles can
    /// overlap. The default wraps the synchronous path.
    fn prepare_async<'a>(&'a self, kernel: &'a Kernel) -> PrepareFuture<'a> {
        Box::pin(async move { self.prepare(kernel) })
    }

    /// Enqueue an executable over concrete buffers. Dispatches are observed
    /// in FIFO order by any subsequent read of an output.
    fn dispatch(
        &self,
        exe: &dyn Executable,
        inputs: &[BufferId],
        outputs: &[BufferId],
    ) -> Result<()>;

    /// Execute a non-fusible routine over realized inputs.
    ///
    /// The default implementation round-trips through host memory, which
    /// makes every backend bit-identical on routines by construction.
    fn run_routine(&self, routine: &Routine, inputs: &[BufferId]) -> Result<Vec<BufferId>> {
        let mut host = Vec::with_capacity(inputs.len());
        for &id in inputs {
            host.push(self.read(id, 0, None)?);
        }
        let outputs = crate::routines::execute_host(routine, &host)?;
        outputs
            .into_iter()
            .map(|(bytes, dtype, len)| self.malloc(len, dtype, Some(&bytes)))
            .collect()
    }

    /// Number of live buffers; the refcount-law tests watch this.
    fn allocated(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Host byte-layout helpers shared by the host backends.
// ---------------------------------------------------------------------------

/// Decode element `idx` from host-layout bytes.
pub(crate) fn read_scalar(bytes: &[u8], dtype: DType, idx: i64) -> Scalar {
    let i = idx as usize;
    let w = dtype.byte_width();
    let chunk = &bytes[i * w..(i + 1) * w];
    match dtype {
        DType::Bool => Scalar::Bool(chunk[0] != 0),
        DType::Int32 => Scalar::I32(i32::from_le_bytes(chunk.try_into().unwrap())),
        DType::Uint32 => Scalar::U32(u32::from_le_bytes(chunk.try_into().unwrap())),
        DType::Float16 | DType::Float32 => {
            Scalar::F32(f32::from_le_bytes(chunk.try_into().unwrap()))
        }
        DType::Float64 => Scalar::F64(f64::from_le_bytes(chunk.try_into().unwrap())),
    }
}

/// Encode a value into element `idx` of host-layout bytes.
pub(crate) fn write_scalar(bytes: &mut [u8], dtype: DType, idx: usize, value: Scalar) {
    let w = dtype.byte_width();
    let chunk = &mut bytes[idx * w..(idx + 1) * w];
    match dtype {
        DType::Bool => chunk[0] = value.as_bool() as u8,
        DType::Int32 => {
            chunk.copy_from_slice(&(value.cast(DType::Int32).as_i64() as i32).to_le_bytes())
        }
        DType::Uint32 => {
            chunk.copy_from_slice(&(value.cast(DType::Uint32).as_i64() as u32).to_le_bytes())
        }
        DType::Float16 | DType::Float32 => {
            chunk.copy_from_slice(&(value.cast(dtype).as_f64() as f32).to_le_bytes())
        }
        DType::Float64 => chunk.copy_from_slice(&value.as_f64().to_le_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registry {
    backends: HashMap<Device, Arc<dyn Backend>>,
    default: Device,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        // The host backends are always available; WebGPU joins via `init`.
        let mut backends: HashMap<Device, Arc<dyn Backend>> = HashMap::new();
        backends.insert(Device::Cpu, Arc::new(cpu::CpuBackend::new()));
        backends.insert(Device::Wasm, Arc::new(wasm::WasmBackend::new()));
        Mutex::new(Registry { backends, default: Device::Cpu })
    })
}

/// Initialise the requested backends (all of them when `devices` is empty)
/// and return the subset that succeeded. Idempotent.
pub fn init(devices: &[Device]) -> Vec<Device> {
    let requested: Vec<Device> =
        if devices.is_empty() { Device::all().to_vec() } else { devices.to_vec() };
    let mut available = Vec::new();
    for device in requested {
        let ready = {
            let reg = registry().lock().unwrap();
            reg.backends.contains_key(&device)
        };
        if ready {
            available.push(device);
            continue;
        }
        match device {
            Device::WebGpu => match webgpu::WebGpuBackend::try_new() {
                Ok(b) => {
                    registry().lock().unwrap().backends.insert(device, Arc::new(b));
                    available.push(device);
                }
                Err(e) => log::debug!("webgpu unavailable: {}", e),
            },
            // Host backends are registered eagerly above.
            Device::Cpu | Device::Wasm => available.push(device),
        }
    }
    available
}

/// Get a backend, defaulting to the default device.
///
/// Asking for an uninitialised backend is an error.
pub fn backend(device: Option<Device>) -> Result<Arc<dyn Backend>> {
    let reg = registry().lock().unwrap();
    let device = device.unwrap_or(reg.default);
    reg.backends.get(&device).cloned().ok_or(Error::Uninitialized(device))
}

/// The current default device.
pub fn default_device() -> Device {
    registry().lock().unwrap().default
}

/// Set the default device for new arrays.
///
/// # Panics
///
/// Panics if the device has not been initialised.
pub fn set_default_device(device: Device) {
    let mut reg = registry().lock().unwrap();
    assert!(
        reg.backends.contains_key(&device),
        "device {} is not initialized",
        device
    );
    reg.default = device;
}

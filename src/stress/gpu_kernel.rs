//! Built-in GPU load: a small WGSL compute shader squaring and mixing a
//! float buffer, submitted back to back on the first hardware adapter.

use super::workers::ComputeBackend;
use super::StopSignal;
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

const ELEMENTS: u32 = 1 << 20;
const WORKGROUP_SIZE: u32 = 64;
/// Rounds of the kernel body per element; keeps one submission in the low milliseconds.
const ROUNDS: u32 = 64;

const SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&data)) {
        return;
    }
    var x = data[i] + f32(i % 1024u) * 0.001;
    for (var k = 0u; k < ROUNDSu; k = k + 1u) {
        x = x * x;
        x = sin(x) + sqrt(abs(x) + 1.0);
    }
    data[i] = x;
}
"#;

/// Compute pipeline bound to one adapter, ready to dispatch.
pub struct WgpuBackend {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    /// Validation or device errors raised since the last dispatch.
    fault: Arc<Mutex<Option<String>>>,
}

impl WgpuBackend {
    /// Picks a hardware adapter and builds the pipeline. Software renderers
    /// count as no GPU.
    pub fn open() -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|err| format!("failed to build GPU runtime: {err}"))?;
        runtime.block_on(Self::open_async())
    }

    async fn open_async() -> Result<Self, String> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| "no GPU device found".to_string())?;

        let info = adapter.get_info();
        if info.device_type == wgpu::DeviceType::Cpu {
            return Err(format!("no GPU device found (only software adapter {})", info.name));
        }
        debug!(adapter = %info.name, backend = ?info.backend, "GPU адаптер найден");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("hwpulse-stress"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|err| format!("failed to open GPU device {}: {err}", info.name))?;

        let fault: Arc<Mutex<Option<String>>> = Arc::default();
        {
            let fault = Arc::clone(&fault);
            device.on_uncaptured_error(Box::new(move |err| {
                if let Ok(mut slot) = fault.lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            }));
        }

        let source = SHADER.replace("ROUNDS", &ROUNDS.to_string());
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("stress-kernel"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("stress-kernel"),
            layout: None,
            module: &module,
            entry_point: "main",
        });

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stress-data"),
            size: u64::from(ELEMENTS) * std::mem::size_of::<f32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let seed: Vec<u8> = (0..ELEMENTS)
            .flat_map(|i| ((i % 977) as f32 / 977.0).to_ne_bytes())
            .collect();
        queue.write_buffer(&buffer, 0, &seed);

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("stress-data"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        info!(adapter = %info.name, "встроенное GPU-ядро готово");
        Ok(Self {
            name: info.name,
            device,
            queue,
            pipeline,
            bind_group,
            fault,
        })
    }

    fn take_fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&mut self, stop: &StopSignal, deadline: Instant) -> Result<(), String> {
        if stop.is_stopped() || Instant::now() >= deadline {
            return Ok(());
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("stress-dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("stress-dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(ELEMENTS.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match self.take_fault() {
            Some(reason) => Err(format!("GPU kernel failed: {reason}")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_has_rounds_substituted() {
        let source = SHADER.replace("ROUNDS", &ROUNDS.to_string());
        assert!(source.contains(&format!("k < {ROUNDS}u")));
        assert!(!source.contains("ROUNDS"));
        assert!(source.contains(&format!("@workgroup_size({WORKGROUP_SIZE})")));
    }

    #[test]
    fn opening_yields_a_reason_or_a_hardware_backend() {
        match WgpuBackend::open() {
            Ok(mut backend) => {
                assert!(!backend.name().is_empty());
                let deadline = Instant::now() + std::time::Duration::from_millis(200);
                assert_eq!(backend.dispatch(&StopSignal::new(), deadline), Ok(()));
            }
            Err(reason) => assert!(!reason.is_empty()),
        }
    }
}

//! Host Audio Bridge - 宿主音频后端命令行工具
//!
//! - info:   列出设备和后端能力
//! - play:   通过播放路径输出正弦测试音
//! - record: 通过录音路径采集并显示峰值电平

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use host_audio_bridge::audio::{
    BackendConfig, DeviceSelector, PcmFormat, StreamCommand, StreamDirection,
};
use host_audio_bridge::backend::{Backend, MixBuffer, MixerPort, StreamHandle};
use host_audio_bridge::host::{AudioHost, SimHost};

/// 模拟宿主的硬件回调周期（帧）
const SIM_PERIOD_FRAMES: usize = 512;

/// transfer 轮询间隔
const TRANSFER_INTERVAL: Duration = Duration::from_millis(10);

/// Host Audio Bridge - host audio backend stream engine
#[derive(Parser)]
#[command(name = "host-audio-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Select device by UID (use 'info' to list devices)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Stream sample rate in Hz
    #[arg(short, long, default_value = "48000", global = true)]
    rate: u32,

    /// Stream channel count
    #[arg(short, long, default_value = "2", global = true)]
    channels: u16,

    /// Use the in-process simulated host instead of Core Audio
    #[arg(long, global = true)]
    simulated: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio devices and backend capabilities
    Info,

    /// Play a sine tone through the playback path
    Play {
        /// Tone frequency in Hz
        #[arg(short, long, default_value = "440")]
        frequency: f64,

        /// Duration in seconds
        #[arg(short = 't', long, default_value = "3")]
        seconds: u64,
    },

    /// Capture audio and print peak levels
    Record {
        /// Duration in seconds
        #[arg(short = 't', long, default_value = "5")]
        seconds: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let (host, sim) = create_host(cli.simulated);
    let mut backend = Backend::new(host, BackendConfig::from_env());

    match cli.command {
        Commands::Info => show_info(&backend)?,
        Commands::Play { frequency, seconds } => {
            play_tone(&mut backend, sim, &cli, frequency, Duration::from_secs(seconds))?
        }
        Commands::Record { seconds } => {
            record(&mut backend, sim, &cli, Duration::from_secs(seconds))?
        }
    }

    Ok(())
}

/// 选择宿主：macOS 上默认使用 Core Audio
fn create_host(simulated: bool) -> (Arc<dyn AudioHost>, Option<SimHost>) {
    #[cfg(target_os = "macos")]
    if !simulated {
        return (Arc::new(host_audio_bridge::host::CoreAudioHost::new()), None);
    }

    if !simulated {
        log::warn!("Core Audio is only available on macOS, using the simulated host");
    }
    let sim = SimHost::with_default_devices();
    (Arc::new(sim.clone()), Some(sim))
}

/// 显示设备信息
fn show_info(backend: &Backend) -> anyhow::Result<()> {
    for direction in [StreamDirection::Output, StreamDirection::Input] {
        println!("=== Audio {} Devices ===\n", direction);

        let devices = backend.list_devices(direction)?;
        if devices.is_empty() {
            println!("  (none)\n");
        }
        for device in &devices {
            let marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  [{}] {}{}", device.id, device.name, marker);
            println!("       UID: {}", device.uid);
            println!("       Channels: {}\n", device.channels);
        }
    }

    let caps = backend.query_capabilities();
    println!("=== Backend Capabilities ===\n");
    println!("  Max input streams:  {}", caps.max_input_streams);
    println!("  Max output streams: {}", caps.max_output_streams);
    println!("  Stream context:     {} bytes", caps.per_stream_context_size);

    Ok(())
}

fn selector(cli: &Cli, backend: &Backend, direction: StreamDirection) -> DeviceSelector {
    match cli.device.as_deref() {
        Some(uid) => DeviceSelector::from_uid(Some(uid)),
        None => backend.config().device(direction).clone(),
    }
}

/// Ctrl+C 时清除运行标志
fn install_ctrlc() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(running)
}

/// 模拟宿主没有真实硬件，起一个线程按设备时钟驱动回调
fn spawn_sim_clock(
    sim: SimHost,
    direction: StreamDirection,
    rate: u32,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let period = Duration::from_secs_f64(SIM_PERIOD_FRAMES as f64 / rate.max(1) as f64);

    thread::spawn(move || {
        let mut phase = 0.0;
        while running.load(Ordering::SeqCst) {
            let device = sim.default_device(direction).unwrap_or_default();
            match direction {
                StreamDirection::Output => {
                    sim.render_cycle(device, SIM_PERIOD_FRAMES);
                }
                StreamDirection::Input => {
                    sim.capture_tone(device, SIM_PERIOD_FRAMES, 330.0, &mut phase);
                }
            }
            thread::sleep(period);
        }
    })
}

/// 正弦测试音发生器
struct ToneGenerator {
    format: PcmFormat,
    phase: f64,
    step: f64,
    samples: Vec<i32>,
    bytes: Vec<u8>,
}

impl ToneGenerator {
    fn new(format: PcmFormat, frequency: f64) -> Self {
        Self {
            format,
            phase: 0.0,
            step: frequency / format.sample_rate_hz as f64,
            samples: Vec::new(),
            bytes: Vec::new(),
        }
    }

    /// 生成 `frames` 帧（-12 dBFS）
    fn generate(&mut self, frames: usize) -> &[u8] {
        let channels = self.format.channels as usize;
        self.samples.resize(frames * channels, 0);
        self.bytes.resize(frames * self.format.bytes_per_frame(), 0);

        for frame in self.samples.chunks_exact_mut(channels) {
            let value = 0.25 * (self.phase * std::f64::consts::TAU).sin();
            frame.fill((value * i32::MAX as f64) as i32);
            self.phase = (self.phase + self.step).fract();
        }

        let n = self.format.samples_to_bytes(&self.samples, &mut self.bytes);
        &self.bytes[..n]
    }
}

fn open_stream(
    backend: &mut Backend,
    cli: &Cli,
    direction: StreamDirection,
) -> anyhow::Result<(StreamHandle, PcmFormat)> {
    let format = PcmFormat::new(cli.rate, cli.channels, 16);
    let selector = selector(cli, backend, direction);

    let handle = backend
        .open(direction, format, selector)
        .with_context(|| format!("failed to open {} stream ({})", direction, format))?;
    backend.control(handle, StreamCommand::Enable)?;

    if let Some(stream) = backend.stream(handle) {
        println!(
            "{} stream: {} on device {} (ring {} frames{}{})",
            direction,
            format,
            stream.device(),
            stream.frame_capacity(),
            if stream.has_converter() { ", converting" } else { "" },
            if stream.is_memory_locked() { ", locked" } else { "" }
        );
    }
    Ok((handle, format))
}

fn play_tone(
    backend: &mut Backend,
    sim: Option<SimHost>,
    cli: &Cli,
    frequency: f64,
    duration: Duration,
) -> anyhow::Result<()> {
    let running = install_ctrlc()?;
    let (handle, format) = open_stream(backend, cli, StreamDirection::Output)?;
    let clock = sim.map(|s| spawn_sim_clock(s, StreamDirection::Output, format.sample_rate_hz, running.clone()));

    // 混音缓冲：100ms
    let mut mixer = MixBuffer::new(format, format.sample_rate_hz as usize / 10);
    let mut tone = ToneGenerator::new(format, frequency);
    let bpf = format.bytes_per_frame();

    println!("Playing {:.0} Hz for {:?}, press Ctrl+C to stop", frequency, duration);
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let room = (mixer.capacity_bytes() - mixer.len_bytes()) / bpf;
        if room > 0 {
            let chunk = tone.generate(room);
            mixer.push(chunk);
        }
        backend.transfer(handle, MixerPort::Playback(&mut mixer))?;
        thread::sleep(TRANSFER_INTERVAL);
    }

    running.store(false, Ordering::SeqCst);
    if let Some(clock) = clock {
        let _ = clock.join();
    }

    if let Some(stream) = backend.stream(handle) {
        println!("\n{}", stream.stats().report());
    }
    backend.close(handle);
    Ok(())
}

fn record(
    backend: &mut Backend,
    sim: Option<SimHost>,
    cli: &Cli,
    duration: Duration,
) -> anyhow::Result<()> {
    let running = install_ctrlc()?;
    let (handle, format) = open_stream(backend, cli, StreamDirection::Input)?;
    let clock = sim.map(|s| spawn_sim_clock(s, StreamDirection::Input, format.sample_rate_hz, running.clone()));

    let mut mixer = MixBuffer::new(format, format.sample_rate_hz as usize / 10);
    let channels = format.channels as usize;
    let mut bytes = vec![0u8; mixer.capacity_bytes()];
    let mut samples = vec![0i32; bytes.len() / format.bytes_per_sample().max(1)];
    let mut peaks = vec![0i64; channels];
    let mut window_start = Instant::now();

    println!("Recording for {:?}, press Ctrl+C to stop", duration);
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        backend.transfer(handle, MixerPort::Capture(&mut mixer))?;

        let n = mixer.pop(&mut bytes);
        let count = format.bytes_to_samples(&bytes[..n], &mut samples);
        for frame in samples[..count].chunks_exact(channels) {
            for (peak, &s) in peaks.iter_mut().zip(frame) {
                *peak = (*peak).max((s as i64).abs());
            }
        }

        if window_start.elapsed() >= Duration::from_millis(250) {
            print_levels(&peaks);
            peaks.fill(0);
            window_start = Instant::now();
        }
        thread::sleep(TRANSFER_INTERVAL);
    }
    println!();

    running.store(false, Ordering::SeqCst);
    if let Some(clock) = clock {
        let _ = clock.join();
    }

    if let Some(stream) = backend.stream(handle) {
        println!("\n{}", stream.stats().report());
    }
    backend.close(handle);
    Ok(())
}

/// 每声道峰值（dBFS）
fn print_levels(peaks: &[i64]) {
    let levels: Vec<String> = peaks
        .iter()
        .enumerate()
        .map(|(ch, &peak)| {
            let db = if peak > 0 {
                20.0 * (peak as f64 / i32::MAX as f64).log10()
            } else {
                f64::NEG_INFINITY
            };
            format!("ch{}: {:>6.1} dBFS", ch, db)
        })
        .collect();
    print!("\r{}", levels.join("  "));
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

//! pcm-sink - PCM 播放设备驱动命令行
//!
//! 子命令：
//! - devices: 列出可输出设备
//! - play:    解码文件并播放
//! - tone:    播放测试信号

use std::io::{self, Read as IoRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use pcm_sink::audio::{Backend, ChannelLayout, NullBackend, NullConfig, NullDevice, SampleEncoding};
use pcm_sink::decode::{AudioDecoder, DecoderIterator};
use pcm_sink::engine::{Engine, EngineConfig, FrameSource, PlaybackState, ToneSource};

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式；stdin 不是终端时返回 None
    fn enter() -> Option<Self> {
        // SAFETY: termios 为纯 C 结构体，tcgetattr 负责填充
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: 恢复进入时保存的终端属性
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// 非阻塞读取一个字符
fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// PCM playback device driver
#[derive(Parser)]
#[command(name = "pcm-sink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    output: OutputArgs,

    /// Show informational log output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show debug log output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Args)]
struct OutputArgs {
    /// Output device name (null, null:nopause, default)
    #[arg(short, long, global = true, default_value = "default")]
    device: String,

    /// Device buffer length in milliseconds
    #[arg(long, global = true, default_value = "200")]
    buffer_ms: u32,

    /// Device period length in milliseconds
    #[arg(long, global = true, default_value = "50")]
    period_ms: u32,

    /// Pretend the device cannot pause in hardware
    #[arg(long, global = true)]
    no_pause: bool,

    /// Disable device-side resampling
    #[arg(long, global = true)]
    no_resample: bool,

    /// Sample encoding to request (s16, s24, floatp, ...)
    #[arg(short, long, global = true)]
    format: Option<SampleEncoding>,

    /// Channel layout to request (mono, stereo, 5.1, 7.1, a count, or fl-fr-fc)
    #[arg(short, long, global = true)]
    channels: Option<ChannelLayout>,

    /// Write the raw device stream to this file
    #[arg(long, global = true, value_name = "PATH")]
    dump: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List output devices
    Devices,

    /// Decode a file and play it
    Play {
        /// Audio file to play (flac, wav, aiff, mp3)
        file: PathBuf,
    },

    /// Play a test signal
    Tone {
        /// Sine frequency in Hz
        #[arg(long, default_value = "440")]
        freq: f64,

        /// Length in seconds; plays until interrupted when omitted
        #[arg(long)]
        seconds: Option<f64>,

        /// White noise instead of a sine
        #[arg(long)]
        noise: bool,

        /// Sample rate of the signal
        #[arg(long, default_value = "48000")]
        rate: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let backend = NullBackend::new(NullConfig {
        buffer_ms: cli.output.buffer_ms,
        period_ms: cli.output.period_ms,
        can_pause: !cli.output.no_pause,
        dump: cli.output.dump.clone(),
    });

    match cli.command {
        Commands::Devices => list_devices(&backend),
        Commands::Play { ref file } => {
            let decoder = AudioDecoder::open(file)
                .with_context(|| format!("cannot open {}", file.display()))?;
            let info = decoder.info();
            println!(
                "{} | {} | {} Hz {} ch {} bit | {:.1}s",
                info.container,
                info.codec,
                info.sample_rate,
                info.channels,
                info.bit_depth.unwrap_or(0),
                info.duration_secs.unwrap_or(0.0)
            );
            let total = info.duration_secs;
            play(&backend, Box::new(DecoderIterator::new(decoder)), &cli.output, total)
        }
        Commands::Tone {
            freq,
            seconds,
            noise,
            rate,
        } => {
            let channels = cli.output.channels.as_ref().map_or(2, |l| l.len() as u32);
            let tone = if noise {
                ToneSource::noise(rate, channels, seconds, None)
            } else {
                ToneSource::sine(freq, rate, channels, seconds)
            };
            play(&backend, Box::new(tone), &cli.output, seconds)
        }
    }
}

/// 列出设备
fn list_devices(backend: &NullBackend) -> anyhow::Result<()> {
    let devices = backend.list_devices().context("cannot enumerate devices")?;
    for device in &devices {
        println!("{:<16} {}", device.name, device.description);
    }
    Ok(())
}

fn engine_config(args: &OutputArgs) -> EngineConfig {
    EngineConfig {
        device: args.device.clone(),
        resample: !args.no_resample,
        encoding: args.format,
        layout: args.channels.clone(),
        ..EngineConfig::default()
    }
}

/// 播放直到结束、Ctrl+C 或按下 q
fn play(
    backend: &NullBackend,
    source: Box<dyn FrameSource>,
    args: &OutputArgs,
    total_secs: Option<f64>,
) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut engine: Engine<NullDevice> = Engine::start(backend, source, engine_config(args))?;
    println!(
        "Output: {} [{}] on {}",
        engine.format(),
        engine.layout(),
        args.device
    );
    println!("Controls: [Space] pause/resume | [q] quit | [Ctrl+C] stop\n");

    let _raw_guard = RawModeGuard::enter();

    while running.load(Ordering::SeqCst) && !engine.is_done() {
        match read_char_nonblocking() {
            Some(b' ') => {
                if let Err(e) = engine.toggle_pause() {
                    log::warn!("Cannot toggle pause: {}", e);
                }
            }
            Some(b'q') => break,
            _ => {}
        }

        let stats = engine.stats();
        let marker = match engine.state() {
            PlaybackState::Paused => "||",
            _ => "> ",
        };
        let total = total_secs
            .map(|t| format!(" / {:6.1}s", t))
            .unwrap_or_default();
        print!(
            "\r{} {:6.1}s{}  |  Latency: {:4} ms  |  Underruns: {}  ",
            marker,
            stats.position_secs,
            total,
            stats.latency.as_millis(),
            stats.device.underruns
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(50));
    }
    println!();

    let finished = engine.state() == PlaybackState::Finished;
    let result = if finished { engine.wait() } else { engine.stop() };
    log::info!("Device stats: {}", engine.stats().device);
    result?;
    Ok(())
}

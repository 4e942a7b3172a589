//! Drives displays through kernel mode setting

#![warn(missing_docs)]

use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use anyhow::Context;
use lumen::{
    args::{get_global_args, Command, GlobalArgs, RunArgs},
    backend::PaintedFrame,
    config::BackendConfig,
    presenter::PixelTarget,
    region::Region,
    render_loop::FrameCompleted,
    Scene, ScreenInfo,
};
use tracing::info;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::writer::BoxMakeWriter,
};

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

/// Verbosity used when neither `LUMEN_LOG` nor `RUST_LOG` is set.
const DEFAULT_LOG_LEVEL: LevelFilter = if cfg!(feature = "debug") {
    LevelFilter::DEBUG
} else {
    LevelFilter::INFO
};

#[cfg(feature = "profile-with-puffin")]
fn serve_puffin() {
    let addr = format!("127.0.0.1:{}", puffin_http::DEFAULT_PORT);
    let server = match puffin_http::Server::new(&addr) {
        Ok(server) => server,
        Err(err) => {
            tracing::warn!(%addr, "Profiler unavailable: {err}");
            return;
        }
    };
    info!(%addr, "Serving profiler data");
    profiling::puffin::set_scopes_on(true);
    // lives as long as the process
    std::mem::forget(server);
}

#[cfg(feature = "profiling")]
fn start_profiler() {
    #[cfg(feature = "profile-with-tracy")]
    profiling::tracy_client::Client::start();
    #[cfg(feature = "profile-with-puffin")]
    serve_puffin();
    profiling::register_thread!("lumen");
}

/// Filter directives from `LUMEN_LOG`, falling back to `RUST_LOG`.
fn log_filter() -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(DEFAULT_LOG_LEVEL.into());
    let directives = ["LUMEN_LOG", EnvFilter::DEFAULT_ENV]
        .into_iter()
        .find_map(|var| std::env::var(var).ok())
        .unwrap_or_default();
    builder.parse_lossy(directives)
}

/// Logs to `log_file` if given, to stderr otherwise.
fn init_tracing(log_file: Option<&str>) -> anyhow::Result<()> {
    let writer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("Unable to open log file {path}"))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(log_file.is_none())
        .with_env_filter(log_filter())
        .with_writer(writer)
        .init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = get_global_args();

    init_tracing(args.log_file.as_deref())?;
    #[cfg(feature = "profiling")]
    start_profiler();

    let mut config = BackendConfig::from_env();
    config.apply_args(&args);

    match &args.command {
        Some(Command::Probe) => probe(&args, &config),
        Some(Command::Run(run_args)) => run(&args, config, run_args),
        None => run(&args, config, &RunArgs::default()),
    }
}

/// Fills every screen with one color, changing it every frame.
#[derive(Debug, Default)]
struct ColorCycle {
    frame: u32,
}

impl ColorCycle {
    fn color(&self) -> u32 {
        let shade = (self.frame % 256) as u8;
        u32::from_be_bytes([0xff, shade, 0x40, 0xff - shade])
    }
}

impl Scene for ColorCycle {
    fn paint(&mut self, screen: &ScreenInfo, repaint: &Region, target: Option<PixelTarget<'_>>) -> PaintedFrame {
        let color = self.color();
        if let Some(mut target) = target {
            for rect in repaint.rects() {
                target.fill(*rect, color);
            }
        }
        let whole = Region::from_rect(screen.geometry);
        PaintedFrame {
            rendered: whole.clone(),
            damaged: whole,
        }
    }

    fn frame_presented(&mut self, _screen: &ScreenInfo, _frame: &FrameCompleted) -> bool {
        self.frame = self.frame.wrapping_add(1);
        true
    }
}

/// Card nodes to drive, as `(device number, node)`.
fn devices(args: &GlobalArgs) -> anyhow::Result<Vec<(u64, PathBuf)>> {
    use std::os::unix::fs::MetadataExt;

    if !args.devices.is_empty() {
        return args
            .devices
            .iter()
            .map(|path| {
                let metadata = std::fs::metadata(path).with_context(|| format!("Unable to stat {path:?}"))?;
                Ok((metadata.rdev(), path.clone()))
            })
            .collect();
    }

    scan_cards()
}

#[cfg(feature = "udev")]
fn scan_cards() -> anyhow::Result<Vec<(u64, PathBuf)>> {
    lumen::udev::enumerate_cards().context("Unable to enumerate graphics devices")
}

#[cfg(not(feature = "udev"))]
fn scan_cards() -> anyhow::Result<Vec<(u64, PathBuf)>> {
    use std::os::unix::fs::MetadataExt;

    let mut cards = Vec::new();
    for entry in std::fs::read_dir("/dev/dri").context("Unable to list /dev/dri")? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("card") {
            continue;
        }
        cards.push((entry.metadata()?.rdev(), entry.path()));
    }
    cards.sort();
    Ok(cards)
}

#[cfg(feature = "kms")]
fn probe(args: &GlobalArgs, config: &BackendConfig) -> anyhow::Result<()> {
    use lumen::{gpu::Gpu, kms::KmsOpener, output::GpuId};

    let mut opener = KmsOpener::default();
    for (index, (device_id, path)) in devices(args)?.into_iter().enumerate() {
        let mut gpu = match Gpu::open(&mut opener, &path, GpuId(device_id), index == 0, config.force_legacy_modeset) {
            Ok(gpu) => gpu,
            Err(err) => {
                println!("{}: {err}", path.display());
                continue;
            }
        };
        gpu.update_outputs();
        println!(
            "{} ({}{}) {:?} via {:?}, monotonic clock: {}",
            path.display(),
            gpu.id(),
            if gpu.is_primary() { ", primary" } else { "" },
            gpu.capabilities(),
            gpu.modeset_path(),
            gpu.presentation_clock_is_monotonic(),
        );
        for output in gpu.outputs() {
            let mode = output.mode();
            println!(
                "  {} {}x{}@{:.3} {:?} {}",
                output.name(),
                mode.width,
                mode.height,
                mode.refresh as f64 / 1000.0,
                output.state(),
                output.uuid(),
            );
        }
    }
    Ok(())
}

#[cfg(feature = "kms")]
fn run(args: &GlobalArgs, config: BackendConfig, run_args: &RunArgs) -> anyhow::Result<()> {
    use calloop::EventLoop;
    use lumen::{config::OutputConfigStore, kms::KmsOpener, Backend};

    let mut event_loop = EventLoop::<Backend>::try_new().context("Unable to create event loop")?;
    let signal = event_loop.get_signal();

    let output_store = OutputConfigStore::open(&config);
    let mut backend = Backend::new(
        event_loop.handle(),
        config,
        Box::new(KmsOpener::default()),
        Box::new(ColorCycle::default()),
        output_store,
    );

    #[cfg(feature = "udev")]
    let _udev = if args.devices.is_empty() {
        Some(lumen::udev::insert_udev_source(&backend.handle).context("Unable to watch graphics devices")?)
    } else {
        None
    };

    for (device_id, path) in devices(args)? {
        backend.handle_device_event(lumen::DeviceEvent::Added { device_id, path });
    }
    if backend.screen_count() == 0 {
        anyhow::bail!("No usable display found");
    }
    info!(screens = backend.screen_count(), "Backend ready");

    let frames = run_args.frames;
    event_loop
        .run(None, &mut backend, |backend| {
            if frames.is_some_and(|frames| backend.presented_frames() >= frames) {
                signal.stop();
            }
        })
        .context("Unable to run main loop")?;

    info!(frames = backend.presented_frames(), "Shutting down");
    backend.shutdown();
    Ok(())
}

#[cfg(not(feature = "kms"))]
fn probe(_args: &GlobalArgs, _config: &BackendConfig) -> anyhow::Result<()> {
    anyhow::bail!("Built without kernel mode setting support")
}

#[cfg(not(feature = "kms"))]
fn run(_args: &GlobalArgs, _config: BackendConfig, _run_args: &RunArgs) -> anyhow::Result<()> {
    anyhow::bail!("Built without kernel mode setting support")
}

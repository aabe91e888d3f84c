use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use adc_stream::{
    logging, AcquisitionEngine, DaqClient, Device, DeviceConfig, FrameBatch, MemoryLink,
    SamplingSettings, SerialTransport, SimulatedConverter, BAUD_RATE,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "adc-stream", about = "ADC acquisition front end and host client")]
struct Args {
    /// Log level (overrides ADC_STREAM_LOG / RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(clap::Args, Debug)]
struct PortArgs {
    /// Serial device (e.g., /dev/ttyUSB0)
    port: String,
    #[arg(long, default_value_t = BAUD_RATE)]
    baud: u32,
    /// Print replies as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the front end on a serial port, sampling the simulated converter
    Serve {
        /// Serial device the host is attached to
        port: String,
        #[arg(long, default_value_t = BAUD_RATE)]
        baud: u32,
        /// Initial rate divider index (0-6)
        #[arg(long, default_value_t = 3)]
        divider: u8,
        /// Initial input channel (0-5)
        #[arg(long, default_value_t = 0)]
        channel: u8,
        #[arg(long)]
        internal_ref: bool,
        /// Start in trigger mode at this level
        #[arg(long)]
        trigger: Option<u8>,
        /// Divide simulated conversion rates by this factor
        #[arg(long, default_value_t = 1)]
        slowdown: u32,
        #[arg(long)]
        trigger_timeout_ms: Option<u64>,
        #[arg(long)]
        param_timeout_ms: Option<u64>,
    },
    /// Query current settings
    Query(PortArgs),
    /// Select a rate divider index (0-6)
    SetRate {
        #[command(flatten)]
        port: PortArgs,
        index: u8,
    },
    /// Toggle sampling on/off
    Toggle(PortArgs),
    /// Capture data frames
    Capture {
        #[command(flatten)]
        port: PortArgs,
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: usize,
    },
    /// Run front end and client in-process over a memory link
    Demo {
        #[arg(short = 'n', long, default_value_t = 5)]
        frames: usize,
        #[arg(long, default_value_t = 1)]
        slowdown: u32,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_logging_with(args.log_level.as_deref());

    match args.command {
        Cmd::Serve {
            port,
            baud,
            divider,
            channel,
            internal_ref,
            trigger,
            slowdown,
            trigger_timeout_ms,
            param_timeout_ms,
        } => {
            let config = DeviceConfig {
                initial: SamplingSettings {
                    rate_divider_index: divider,
                    input_channel: channel,
                    use_internal_reference: internal_ref,
                    trigger_mode: trigger.is_some(),
                    trigger_level: trigger.unwrap_or(SamplingSettings::default().trigger_level),
                },
                trigger_timeout: trigger_timeout_ms.map(Duration::from_millis),
                parameter_timeout: param_timeout_ms.map(Duration::from_millis),
                ..DeviceConfig::default()
            };
            serve(&port, baud, slowdown, config)
        }
        Cmd::Query(p) => {
            let mut client = connect(&p)?;
            let report = client.query_settings()?;
            print_reply(&report, p.json, |r| {
                format!("Divider index {} -> {:.2} kSPS", r.divider_index, r.rate_ksps())
            })
        }
        Cmd::SetRate { port, index } => {
            let mut client = connect(&port)?;
            let report = client.set_divider(index)?;
            print_reply(&report, port.json, |r| {
                format!("Divider index {} -> {:.2} kSPS", r.divider_index, r.rate_ksps())
            })
        }
        Cmd::Toggle(p) => {
            let mut client = connect(&p)?;
            let status = client.toggle()?;
            print_reply(&status, p.json, |s| {
                format!(
                    "Sampling {}{}",
                    if s.enabled { "enabled" } else { "disabled" },
                    if s.paused { " (paused)" } else { "" }
                )
            })
        }
        Cmd::Capture { port, frames } => {
            let mut client = connect(&port)?;
            let batch = client.read_frames(frames)?;
            if port.json {
                println!("{}", serde_json::to_string(&batch)?);
            } else {
                print_batch(&batch);
            }
            Ok(())
        }
        Cmd::Demo { frames, slowdown } => demo(frames, slowdown),
    }
}

fn connect(p: &PortArgs) -> Result<DaqClient> {
    DaqClient::connect_serial_with_baud(&p.port, p.baud)
}

fn print_reply<T: Serialize>(
    reply: &T,
    json: bool,
    human: impl Fn(&T) -> String,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reply)?);
    } else {
        println!("{}", human(reply));
    }
    Ok(())
}

fn print_batch(batch: &FrameBatch) {
    for (i, frame) in batch.frames.iter().enumerate() {
        println!(
            "[Frame {}] min={:3} max={:3} mean={:6.1}",
            i,
            frame.min(),
            frame.max(),
            frame.mean()
        );
    }
    if batch.sync_errors > 0 {
        println!("Sync errors: {}", batch.sync_errors);
    }
}

fn serve(port: &str, baud: u32, slowdown: u32, config: DeviceConfig) -> Result<()> {
    let transport = SerialTransport::open(port, baud)
        .with_context(|| format!("Failed to open serial port at {}", port))?;
    let engine = Arc::new(AcquisitionEngine::default());
    let converter = SimulatedConverter::spawn(Arc::clone(&engine), slowdown)?;
    let mut device = Device::new(transport, converter, engine, config);

    println!("Serving on {} ({} baud). Runs until killed.", port, baud);
    let shutdown = AtomicBool::new(false);
    device.run(&shutdown)?;
    Ok(())
}

fn demo(frames: usize, slowdown: u32) -> Result<()> {
    let (device_end, host_end) = MemoryLink::pair();
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker = {
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("front-end".into())
            .spawn(move || -> adc_stream::Result<()> {
                let engine = Arc::new(AcquisitionEngine::default());
                let converter = SimulatedConverter::spawn(Arc::clone(&engine), slowdown)?;
                let mut device =
                    Device::new(device_end, converter, engine, DeviceConfig::default());
                device.run(&shutdown)
            })?
    };

    let outcome = drive_demo(DaqClient::from_stream(host_end), frames);

    shutdown.store(true, Ordering::Release);
    match worker.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("front-end thread panicked"),
    }
    outcome
}

fn drive_demo(mut client: DaqClient, frames: usize) -> Result<()> {
    println!("--- Front end demo (in-process) ---");
    let report = client.query_settings()?;
    println!(
        "Settings: divider index {} -> {:.2} kSPS",
        report.divider_index,
        report.rate_ksps()
    );

    let report = client.set_divider(6)?;
    println!("Slowed down to {:.2} kSPS", report.rate_ksps());

    println!("Reading {} frames...", frames);
    print_batch(&client.read_frames(frames)?);

    let status = client.toggle()?;
    println!("Toggle -> enabled={} paused={}", status.enabled, status.paused);
    let status = client.toggle()?;
    println!("Toggle -> enabled={} paused={}", status.enabled, status.paused);

    client.arm_trigger(200)?;
    println!("Trigger armed at 200, reading 2 frames...");
    print_batch(&client.read_frames(2)?);
    client.disarm_trigger()?;

    println!("Done.");
    Ok(())
}

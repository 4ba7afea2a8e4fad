// Block dump example
//
// A simulated sine-wave ADC driven by the timer trigger. Each acquired
// block is printed: control fields first, then the samples.

use clap::Parser;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use zio_rs::{
    Attribute, BlockReading, CsetBuilder, DeviceAttr, DeviceBuilder, DeviceOperations, IoStatus,
    OpenFlags, RawIo, Registry, Stream, TIMER_PERIOD_ATTR, TIMER_TRIGGER,
};

#[derive(Parser)]
#[command(name = "dump")]
#[command(version = "1.0")]
#[command(about = "Acquire blocks from a simulated ADC and dump them")]
struct Args {
    /// Blocks to acquire
    #[arg(short, long, default_value_t = 3)]
    count: u32,

    /// Trigger period in milliseconds
    #[arg(short, long, default_value_t = 50)]
    period: u32,

    /// Samples per block
    #[arg(short, long, default_value_t = 16)]
    samples: u32,

    /// Give up waiting for a block after this many milliseconds
    #[arg(short, long, default_value_t = 2000)]
    timeout: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

const SAMPLE_RATE: u32 = 10_000;
const SINE_HZ: f64 = 440.0;

/// Produces a continuous 440 Hz sine across blocks.
#[derive(Default)]
struct SineAdc {
    next_sample: AtomicU64,
}

impl DeviceOperations for SineAdc {
    fn raw_io(&self, io: &mut RawIo<'_>) -> IoStatus {
        let nsamples = u64::from(io.nsamples());
        let start = self.next_sample.fetch_add(nsamples, Ordering::Relaxed);
        for (_, block) in io.blocks() {
            for (i, sample) in block.data_mut().chunks_exact_mut(2).enumerate() {
                let t = (start + i as u64) as f64 / f64::from(SAMPLE_RATE);
                let value = ((TAU * SINE_HZ * t).sin() * f64::from(i16::MAX)) as i16;
                sample.copy_from_slice(&value.to_le_bytes());
            }
        }
        IoStatus::Done
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let reg = Registry::default();
    let device = DeviceBuilder::new("sine", SineAdc::default())
        .attribute(Attribute::device(DeviceAttr::MaxSampleRate, SAMPLE_RATE))
        .cset(
            CsetBuilder::input(1, 2)
                .channel_attribute(Attribute::device(DeviceAttr::ResolutionBits, 16))
                .trigger(TIMER_TRIGGER),
        );
    let dev = reg.register_device(device)?;
    let cset = dev.cset(0).ok_or("missing channel set")?;
    cset.set_trigger_attribute("post-samples", args.samples)?;
    cset.set_trigger_attribute(TIMER_PERIOD_ATTR, args.period)?;

    let chan = dev.channel(0, 0).ok_or("missing channel")?;
    let flags = OpenFlags::default().with_timeout(Duration::from_millis(args.timeout));
    let mut ctrl = chan.open(Stream::Control, flags)?;
    let mut data = chan.open(Stream::Data, flags)?;
    println!("Reading {} and {}", chan.node_name(Stream::Control), chan.node_name(Stream::Data));

    for _ in 0..args.count {
        let block = BlockReading::read_from(&mut ctrl, &mut data)?;
        let c = &block.control;
        println!(
            "Ctrl: version {}.{}, trigger {}, dev {}, cset {}, chan {}",
            c.major_version,
            c.minor_version,
            c.trigger_name(),
            c.addr.devname(),
            c.addr.cset,
            c.addr.chan
        );
        println!(
            "Ctrl: seq {}, n {}, size {}, bits {}, stamp {}.{:09}, alarms {:?}/{:#04x}",
            c.seq_num,
            c.nsamples,
            c.ssize,
            c.nbits,
            c.tstamp.secs,
            c.tstamp.ticks,
            c.alarms,
            c.drv_alarms
        );

        #[cfg(feature = "dataframe")]
        println!("{}", block.to_lazyframe()?.collect()?);

        #[cfg(not(feature = "dataframe"))]
        for (i, line) in block.samples().chunks(8).enumerate() {
            println!("Data[{:4}]: {line:?}", i * 8);
        }
    }

    drop((ctrl, data));
    reg.unregister_device(&dev)?;
    Ok(())
}

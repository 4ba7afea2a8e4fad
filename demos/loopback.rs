// Loopback example
//
// An output channel set and an input channel set on one software device:
// every block written to the output comes back on the input.

use clap::Parser;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use zio_rs::{
    BlockReading, CsetBuilder, DeviceBuilder, DeviceOperations, IoStatus, OpenFlags, RawIo,
    Registry, Stream,
};

#[derive(Parser)]
#[command(name = "loopback")]
#[command(version = "1.0")]
#[command(about = "Write blocks to an output channel and read them back")]
struct Args {
    /// Number of blocks to send
    #[arg(short, long, default_value_t = 4)]
    blocks: u32,

    /// Samples per block
    #[arg(short, long, default_value_t = 32)]
    samples: u32,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

/// Output blocks wait here until the input side picks them up.
#[derive(Default)]
struct Loopback {
    pending: Mutex<VecDeque<Vec<u8>>>,
}

impl DeviceOperations for Loopback {
    fn raw_io(&self, io: &mut RawIo<'_>) -> IoStatus {
        let output = io.direction().is_output();
        let mut pending = self.pending.lock();
        for (_, block) in io.blocks() {
            if output {
                pending.push_back(block.data().to_vec());
            } else if let Some(data) = pending.pop_front() {
                let n = data.len().min(block.datalen());
                block.data_mut()[..n].copy_from_slice(&data[..n]);
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
    let device = DeviceBuilder::with_ops("loop", Arc::new(Loopback::default()))
        .cset(CsetBuilder::output(1, 2).name("tx"))
        .cset(CsetBuilder::input(1, 2).name("rx"));
    let dev = reg.register_device(device)?;
    print!("{}", dev.describe());

    for cset in dev.csets() {
        cset.set_trigger_attribute("post-samples", args.samples)?;
    }

    let tx = dev.channel(0, 0).ok_or("missing output channel")?;
    let rx = dev.channel(1, 0).ok_or("missing input channel")?;
    let mut tx_ctrl = tx.open(Stream::Control, OpenFlags::default())?;
    let mut tx_data = tx.open(Stream::Data, OpenFlags::default())?;
    let mut rx_ctrl = rx.open(Stream::Control, OpenFlags::default())?;
    let mut rx_data = rx.open(Stream::Data, OpenFlags::default())?;

    for n in 0..args.blocks {
        let mut control = tx.current_control();
        control.seq_num = n + 1;
        tx_ctrl.write_control(&control)?;

        let payload: Vec<u8> = (0..args.samples)
            .flat_map(|i| ((n * 1000 + i) as i16).to_le_bytes())
            .collect();
        let mut written = 0;
        while written < payload.len() {
            written += tx_data.write(&payload[written..])?;
        }

        let block = BlockReading::read_from(&mut rx_ctrl, &mut rx_data)?;
        let samples = block.samples();
        let matches = block.data == payload;
        println!(
            "block {}: {} samples, first {:?}, {}",
            block.control.seq_num,
            samples.len(),
            samples.first(),
            if matches { "ok" } else { "MISMATCH" }
        );
    }

    drop((tx_ctrl, tx_data, rx_ctrl, rx_data));
    reg.unregister_device(&dev)?;
    Ok(())
}

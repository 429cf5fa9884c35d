// QDMA Queue DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example demonstrating QDMA usage on the emulated device.
//!
//! Run with: `cargo run --example basic`

use qdma_rust::emu::EmulatorConfig;
use qdma_rust::{DeviceConfig, Direction, IrqMode, QdmaEngine, QueueConfig, Request, SgEntry};

fn main() {
    println!("QDMA Basic Example");
    println!("==================\n");

    let cfg = DeviceConfig::privileged("qdma0").with_irq_mode(IrqMode::Auto);
    let engine = match QdmaEngine::open_emulated(cfg, EmulatorConfig::default()) {
        Ok(engine) => engine,
        Err(e) => {
            println!("Failed to open device: {}", e);
            return;
        }
    };
    let (qbase, qmax) = engine.device().queue_range();
    println!("Opened {} ({} interrupts)", engine.device().name(), engine.device().irq_mode());
    println!("  Queues: [{}, {})\n", qbase, qbase + qmax);

    // Memory-mapped round trip through card memory
    println!("Memory-mapped transfer:");
    let h2c = engine.add_and_start(QueueConfig::mm(Direction::H2c));
    let c2h = engine.add_and_start(QueueConfig::mm(Direction::C2h));
    match (h2c, c2h) {
        (Ok(h2c), Ok(c2h)) => {
            let data = b"Hello, QDMA!";
            match engine.write(h2c, 0x1000, data) {
                Ok(n) => println!("  Wrote {} bytes at 0x1000", n),
                Err(e) => println!("  Write failed: {}", e),
            }
            match engine.read(c2h, 0x1000, data.len()) {
                Ok(back) => println!("  Read back: {:?}", String::from_utf8_lossy(&back)),
                Err(e) => println!("  Read failed: {}", e),
            }
        }
        (Err(e), _) | (_, Err(e)) => println!("  Queue setup failed: {}", e),
    }
    println!();

    // Streaming receive of an injected packet
    println!("Streaming receive:");
    match engine.add_and_start(QueueConfig::st(Direction::C2h).with_buf_size(256)) {
        Ok(rx) => {
            let run = || -> Result<(), qdma_rust::QdmaError> {
                let qid = engine.device().queue(rx)?.qid();
                let buf = engine.alloc(1024)?;
                let token = engine.submit(rx, Request::read(vec![SgEntry::whole(buf)]))?;
                if let Some(emu) = engine.emulator() {
                    emu.inject_c2h(qid, &[0x5A; 700], true);
                }
                let done = token.wait()?;
                println!("  Received {} bytes (eot: {})", done.bytes, done.eot);
                let stats = engine.device().stats(rx)?;
                println!("  Packets: {}, bytes: {}", stats.packets, stats.bytes);
                Ok(())
            };
            if let Err(e) = run() {
                println!("  Receive failed: {}", e);
            }
        }
        Err(e) => println!("  Queue setup failed: {}", e),
    }
    println!();

    match engine.close() {
        Ok(()) => println!("Device closed."),
        Err(e) => println!("Close reported: {}", e),
    }
}

use std::env;

use anyhow::{Context, Result};
use machine_learning::{
    Decision,
    arch::models::{INPUT_CHANNELS, INPUT_SIZE},
};
use ndarray::Array4;
use onnx::{DEFAULT_MODEL_PATH, Session};
use rand::Rng;

fn rule() {
    println!("{}", "=".repeat(50));
}

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string());

    rule();
    println!("GeoCode ONNX offline inference test");
    rule();

    println!("\n[1] loading onnx model...");
    let mut session =
        Session::open(&path).with_context(|| format!("failed to load {path}"))?;
    println!("load OK");

    let info = session.info();
    println!("    input: {}", info.input);
    println!("    output: {}", info.output);

    println!("\n[2] generating test image...");
    let mut rng = rand::rng();
    let image = Array4::from_shape_simple_fn((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE), || {
        rng.random::<f32>()
    });
    println!("    shape: {:?}", image.shape());
    println!("infer OK");

    println!("\n[3] running inference...");
    let y = session.run(&image).context("inference failed")?;
    let confidence = y[[0, 0]];
    println!("confidence OK: {confidence:.4}");

    println!("\n[4] deciding...");
    let decision = Decision::from_confidence(confidence);
    println!("    status: {decision}");
    println!("    confidence: {confidence:.4}");

    println!();
    rule();
    println!("GeoCode ONNX offline inference test complete!");
    rule();

    Ok(())
}

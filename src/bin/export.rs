use std::env;

use anyhow::{Context, Result};
use log::info;
use machine_learning::arch::models::Detector;
use onnx::{DEFAULT_MODEL_PATH, ExportOptions};

/// Formats `n` with `,` as thousands separator.
fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }

    out
}

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string());

    let mut detector = Detector::with_seed(None).context("failed to build the detector")?;
    println!("model parameters: {}", thousands(detector.num_params()));

    detector.eval();
    let x = onnx::dummy_input(None);
    let y = detector
        .forward(x.view())
        .context("sample inference failed")?;
    println!("sample inference: confidence = {:.4}", y[[0, 0]]);

    info!("exporting to {path}");
    onnx::export(&mut detector, &path, &ExportOptions::default())
        .with_context(|| format!("failed to export {path}"))?;
    println!("onnx export complete: {path}");
    println!("done!");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_groups_digits() {
        assert_eq!(thousands(248_001), "248,001");
        assert_eq!(thousands(1_000_000), "1,000,000");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(0), "0");
    }
}

//! Example demonstrating the preferences and resolver pipeline
//!
//! Run with: cargo run --package aubade-core --example prefs_demo

use aubade_core::domain::audio::{ChannelLayout, Formats, SampleFormat};
use aubade_core::domain::config::AudioPreferences;
use aubade_core::domain::device::{AvailableConfigs, BufferSizeRange};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("aubade_core=debug,info")
        .init();

    println!("=== Aubade Preferences Demo ===\n");

    // 1. Save factory-default preferences to a file
    println!("1. Saving default preferences...");
    let prefs = AudioPreferences::default();
    let prefs_path = "demo_prefs.toml";
    prefs.save(prefs_path).await?;
    println!("   ✓ Preferences saved to {prefs_path}");

    // 2. Load them back
    println!("\n2. Loading preferences from file...");
    let loaded = AudioPreferences::load(prefs_path).await?;
    println!(
        "   ✓ Loaded: {} Hz, formats {:?}",
        loaded.sample_rate, loaded.preferred_formats
    );

    // 3. Resolve against a mock device capability set
    println!("\n3. Resolving against a device capability set...");
    let formats: Formats = [SampleFormat::I16, SampleFormat::I32].into_iter().collect();
    let configs = AvailableConfigs::new(
        2,
        vec![44100, 48000, 96000],
        BufferSizeRange::new(64, 4096),
        formats,
        ChannelLayout::Interleaved,
    )
    .expect("valid capability set");

    let resolved = loaded.resolve(&configs);
    println!(
        "   ✓ Resolved config: {:?} @ {} Hz, buffer {:?}",
        resolved.format, resolved.sample_rate, resolved.buffer_size
    );

    tokio::fs::remove_file(prefs_path).await?;
    println!("\nDone.");
    Ok(())
}

//! Aubade CLI Application

use anyhow::Context;
use clap::{Parser, Subcommand};

use aubade_core::domain::audio::{AudioError, ChannelLayout, SampleFormat};
use aubade_core::domain::backend::AudioBackend;
use aubade_core::domain::config::AudioPreferences;
use aubade_core::domain::device::{Device, Host};
use aubade_infra::audio::{default_host, virtual_host, Pacing, VirtualDeviceSpec};

#[derive(Parser)]
#[command(name = "aubade")]
#[command(about = "A cross-platform audio I/O playground", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio devices and their negotiated capability sets
    Devices,
    /// Play a sine tone on the default output device
    Beep {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        freq: f32,

        /// Duration in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,

        /// Use the virtual backend instead of real hardware
        #[arg(long)]
        virtual_backend: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    match cli.command {
        Command::Devices => {
            let host = default_host().context("failed to enumerate audio devices")?;
            print_devices(&host);
        }
        Command::Beep {
            freq,
            seconds,
            virtual_backend,
        } => {
            if virtual_backend {
                let mut spec = VirtualDeviceSpec::output("Virtual Output");
                spec.default_output = true;
                spec.pacing = Pacing::Realtime;
                let host = virtual_host(vec![spec])?;
                beep(&host, freq, seconds).await?;
            } else {
                let host = default_host().context("failed to enumerate audio devices")?;
                beep(&host, freq, seconds).await?;
            }
        }
    }

    Ok(())
}

fn print_devices<B: AudioBackend>(host: &Host<B>) {
    println!("Audio host: {}", host.backend_name());
    let default_output = host.default_output_device().map(Device::name);
    let default_input = host.default_input_device().map(Device::name);

    for device in host.devices() {
        let mut tags = Vec::new();
        if Some(device.name()) == default_output {
            tags.push("default output");
        }
        if Some(device.name()) == default_input {
            tags.push("default input");
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(", "))
        };
        println!("\n{}{tags}", device.name());

        for (label, configs) in [
            ("output", device.output_configs()),
            ("input", device.input_configs()),
        ] {
            match configs {
                Some(configs) => {
                    let formats: Vec<String> = configs
                        .formats()
                        .iter()
                        .map(|f| format!("{f:?}").to_lowercase())
                        .collect();
                    let buffer = match configs.buffer_size() {
                        Some(range) => format!("{}..={} frames", range.min(), range.max()),
                        None => "any".to_string(),
                    };
                    println!(
                        "  {label}: {} ch, rates {:?}, formats [{}], buffer {buffer}",
                        configs.channel_count(),
                        configs.sample_rates(),
                        formats.join(", "),
                    );
                }
                None => println!("  {label}: unavailable"),
            }
        }
    }
}

async fn beep<B: AudioBackend>(host: &Host<B>, freq: f32, seconds: f32) -> anyhow::Result<()> {
    let device = host
        .default_output_device()
        .or_else(|| {
            host.devices()
                .iter()
                .find(|d| d.output_configs().is_some())
        })
        .context("no output device available")?;
    let configs = device
        .output_configs()
        .context("selected device has no output direction")?;
    anyhow::ensure!(
        configs.supports_format(SampleFormat::F32),
        "the beep demo needs f32 output"
    );

    let mut config = AudioPreferences::default().resolve(configs);
    config.format = SampleFormat::F32;
    println!(
        "Playing {freq} Hz on {:?}: {:?} @ {} Hz, buffer {:?}",
        device.name(),
        config.format,
        config.sample_rate,
        config.buffer_size
    );

    let sample_rate = config.sample_rate as f32;
    let mut phase = 0.0f32;
    let step = std::f32::consts::TAU * freq / sample_rate;

    let stream = host.open_output::<f32, _, _>(
        device,
        &config,
        move |mut buffer, _info| {
            let channels = buffer.channel_count() as usize;
            let frames = buffer.frame_count() as usize;
            match buffer.layout() {
                ChannelLayout::Interleaved => {
                    for frame in buffer.samples_mut().chunks_exact_mut(channels) {
                        let value = phase.sin() * 0.2;
                        frame.fill(value);
                        phase = (phase + step) % std::f32::consts::TAU;
                    }
                }
                ChannelLayout::NonInterleaved => {
                    let start = phase;
                    for channel in 0..channels as u16 {
                        let mut channel_phase = start;
                        if let Some(samples) = buffer.channel_mut(channel) {
                            for sample in samples {
                                *sample = channel_phase.sin() * 0.2;
                                channel_phase = (channel_phase + step) % std::f32::consts::TAU;
                            }
                        }
                    }
                    phase = (start + step * frames as f32) % std::f32::consts::TAU;
                }
            }
        },
        |e: AudioError| tracing::error!("stream error: {e}"),
    )?;

    stream.play()?;
    tokio::time::sleep(std::time::Duration::from_secs_f32(seconds)).await;
    stream.close()?;
    println!("Done.");
    Ok(())
}

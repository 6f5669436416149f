use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use duet_client::{Endpoints, Pipeline, PipelineConfig, PipelineExit};
use duet_common::init_tracing_with_default;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "duet", version, about = "Two-way audio over UDP with loss recovery")]
struct Args {
    /// Local UDP address to receive on
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Remote address to send to
    #[arg(long)]
    peer: Option<SocketAddr>,
    /// Capture device name or input WAV file
    #[arg(long)]
    source: Option<String>,
    /// Playback device name or output WAV file
    #[arg(long)]
    sink: Option<String>,
    /// Sample rate
    #[arg(long)]
    rate: Option<u32>,
    /// Number of channels
    #[arg(long)]
    chans: Option<u16>,
    /// Source frame size, ms
    #[arg(long, value_name = "MS")]
    source_frame: Option<u64>,
    /// Sink frame size, ms
    #[arg(long, value_name = "MS")]
    sink_frame: Option<u64>,
    /// Jitter buffer size, ms
    #[arg(long, value_name = "MS")]
    jitter_buf: Option<u64>,
    /// Maximum jitter buffer drift, ms
    #[arg(long, value_name = "MS")]
    max_drift: Option<u64>,
    /// Playback device buffer size, ms
    #[arg(long, value_name = "MS")]
    device_buf: Option<u64>,
    /// Expected packet loss percent, passed to the encoder
    #[arg(long)]
    loss_perc: Option<u8>,
    /// Simulate given loss percent when receiving packets
    #[arg(long)]
    simulate_loss_perc: Option<u8>,
    /// Disable in-band forward error correction
    #[arg(long)]
    no_fec: bool,
    /// Enable more logs
    #[arg(long)]
    debug: bool,
    /// JSON file with base settings; flags override it
    #[arg(long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if self.source.is_some() {
            config.source = self.source;
        }
        if self.sink.is_some() {
            config.sink = self.sink;
        }

        if self.loss_perc.is_some() && config.source.is_none() {
            bail!("--loss-perc is only meaningful when --source is given");
        }
        if self.simulate_loss_perc.is_some() && config.sink.is_none() {
            bail!("--simulate-loss-perc is only meaningful when --sink is given");
        }
        if self.jitter_buf.is_some() && config.sink.is_none() {
            bail!("--jitter-buf is only meaningful when --sink is given");
        }

        let overrides = [
            (&mut config.source_frame_ms, self.source_frame),
            (&mut config.sink_frame_ms, self.sink_frame),
            (&mut config.jitter_buf_ms, self.jitter_buf),
            (&mut config.max_drift_ms, self.max_drift),
            (&mut config.device_buf_ms, self.device_buf),
        ];
        for (field, value) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.peer.is_some() {
            config.peer = self.peer;
        }
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if let Some(chans) = self.chans {
            config.chans = chans;
        }
        if let Some(perc) = self.loss_perc {
            config.loss_perc = perc;
        }
        if let Some(perc) = self.simulate_loss_perc {
            config.simulate_loss_perc = perc;
        }
        if self.no_fec {
            config.fec = false;
        }
        if self.debug {
            config.debug = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    init_tracing_with_default(if config.debug { "debug" } else { "info" });

    let endpoints = Endpoints::open(&config)?;
    let pipeline = Pipeline::bind(config).await?;

    match pipeline.run(endpoints).await? {
        PipelineExit::SourceEof => info!("got EOF, exiting"),
        PipelineExit::Interrupted => info!("got interrupt, exiting"),
        PipelineExit::Stopped => info!("stopped"),
    }
    Ok(())
}

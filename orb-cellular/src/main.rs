use clap::Parser;
use color_eyre::eyre::Result;
use orb_cellular::{
    bus::{ChannelBus, Outbound},
    config::CellularConfig,
    serial::SerialChannel,
    service::Mailbox,
    telemetry::TelemetryConfig,
};
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, warn};

const SYSLOG_IDENTIFIER: &str = "worldcoin-cellular";

#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    /// Serial device of the modem's AT port.
    #[arg(long, env = "ORB_CELLULAR_DEVICE", default_value = "/dev/ttyUSB2")]
    device: String,
    #[arg(long, env = "ORB_CELLULAR_BAUD", default_value_t = 115_200)]
    baud: u32,
    /// Minutes between message-only windows while offline. 0 disables them.
    #[arg(long, env = "ORB_CELLULAR_CONNECTION_INTERVAL", default_value_t = 0)]
    connection_interval: u32,
    /// Length of a message-only window, in minutes.
    #[arg(long, env = "ORB_CELLULAR_CONNECTED_PERIOD", default_value_t = 5)]
    connected_period: u32,
    #[arg(long, env = "ORB_CELLULAR_MAX_FAIL_RETRIES", default_value_t = 3)]
    max_fail_retries: u32,
    #[arg(long, env = "ORB_CELLULAR_FLIGHT_MODE")]
    flight_mode: bool,
    /// Seconds between call list polls during a call.
    #[arg(long, env = "ORB_CELLULAR_CALL_POLL_SECS", default_value_t = 1)]
    call_poll_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let tel_flusher = TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .init();

    let result = async {
        let args = Args::parse();
        let config = CellularConfig::builder()
            .connection_interval(args.connection_interval)
            .connected_period(args.connected_period)
            .max_fail_retries(args.max_fail_retries)
            .flight_mode(args.flight_mode)
            .call_poll_period(Duration::from_secs(args.call_poll_secs))
            .build();

        let mailbox = Mailbox::new();
        let (channel, reader) = SerialChannel::open(&args.device, args.baud, mailbox.sender())?;
        let (bus, outbound) = ChannelBus::new();

        let mut tasks = orb_cellular::program()
            .channel(channel)
            .bus(bus)
            .mailbox(mailbox)
            .config(config)
            .run()
            .await?;
        tasks.push(reader);
        tasks.push(tokio::spawn(async move {
            while let Ok(msg) = outbound.recv_async().await {
                log_outbound(&msg);
            }
            Ok(())
        }));

        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigint = unix::signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => warn!("received SIGTERM"),
            _ = sigint.recv()  => warn!("received SIGINT"),
        }

        info!("aborting tasks and exiting gracefully");

        for handle in tasks {
            handle.abort();
        }

        Ok(())
    }
    .await;

    tel_flusher.flush().await;

    result
}

fn log_outbound(msg: &Outbound) {
    match msg {
        Outbound::Notification(notification) => info!("notification: {notification:?}"),
        Outbound::Db { request, query } => info!("db request {request}: {query:?}"),
        other => info!("{other:?}"),
    }
}

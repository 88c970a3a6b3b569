//! A C-ECHO service class provider:
//! answers verification requests from remote nodes.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use netdicom_dimse::scp::{serve, ScpOptions};
use netdicom_dimse::service::{EventBus, Notification};
use snafu::Report;
use tracing::{error, info, Level};

/// DICOM C-ECHO SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the application entity title of this node
    #[arg(long = "ae-title", default_value = "ECHOSCP")]
    ae_title: String,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// which port to listen on
    #[arg(short, default_value = "11111")]
    port: u16,
}

#[tokio::main]
async fn main() {
    let App {
        verbose,
        ae_title,
        max_pdu_length,
        port,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("{}", Report::from_error(e));
    });

    let mut events = EventBus::new();
    events.subscribe(|notification| match notification {
        Notification::AssociationEstablished { peer_ae_title } => {
            info!("association established with {}", peer_ae_title);
        }
        Notification::MessageReceived { command_field, .. } if *command_field == 0x0030 => {
            info!("verification request handled");
        }
        Notification::AssociationReleased => {
            info!("association released");
        }
        _ => {}
    });

    let options = ScpOptions {
        ae_title,
        max_pdu_length,
        events,
        ..ScpOptions::new()
    };

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    if let Err(e) = serve(addr, options).await {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    }
}

#[cfg(test)]
mod tests {
    use crate::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }
}

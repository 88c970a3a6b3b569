//! A C-ECHO service class user:
//! verifies DICOM connectivity against a remote node.
use clap::Parser;
use netdicom_dimse::{scu, DimseAssociation, StatusClass};
use netdicom_ul::association::client::ClientAssociationOptions;
use netdicom_ul::association::Association;
use snafu::{Report, ResultExt, Snafu};
use tracing::{debug, error, info, Level};

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// DICOM C-ECHO SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to the target SCP,
    /// optionally with an AE title (example: "QUERY-SCP@127.0.0.1:1045")
    addr: String,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling application entity title
    #[arg(long = "calling-ae-title", default_value = "ECHOSCU")]
    calling_ae_title: String,
    /// the called application entity title,
    /// overrides AE title in the address if present
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// repeat the echo N times
    #[arg(long, default_value = "1")]
    repeat: u32,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Could not establish association
    EstablishAssociation {
        #[snafu(source(from(netdicom_ul::association::Error, Box::new)))]
        source: Box<netdicom_ul::association::Error>,
    },

    /// The echo operation failed
    Echo {
        #[snafu(source(from(netdicom_dimse::Error, Box::new)))]
        source: Box<netdicom_dimse::Error>,
    },

    #[snafu(whatever, display("{}", message))]
    Other {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + 'static>, Some)))]
        source: Option<Box<dyn std::error::Error + 'static>>,
    },
}

fn main() {
    let app = App::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if app.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("{}", Report::from_error(e));
    });

    let runtime = tokio::runtime::Runtime::new().expect("failed to start runtime");
    runtime.block_on(run(app)).unwrap_or_else(|err| {
        error!("{}", Report::from_error(err));
        std::process::exit(-2);
    });
}

async fn run(app: App) -> Result<(), Error> {
    let App {
        addr,
        verbose,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        repeat,
    } = app;

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .max_pdu_length(max_pdu_length);
    if let Some(called_ae_title) = called_ae_title {
        options = options.called_ae_title(called_ae_title);
    }

    let association = options
        .establish_with(&addr)
        .await
        .context(EstablishAssociationSnafu)?;

    if verbose {
        info!("Association established");
    }

    let context_id = association
        .accepted_context(1)
        .map(|pc| pc.id)
        .ok_or_else(|| {
            snafu::FromString::without_source("No accepted presentation context".to_string())
        })?;

    let mut dimse = DimseAssociation::new(association);

    for i in 0..repeat {
        let status = scu::echo(&mut dimse, context_id, VERIFICATION_SOP_CLASS)
            .await
            .context(EchoSnafu)?;
        match status.class() {
            StatusClass::Success => {
                if repeat > 1 {
                    info!("C-ECHO #{}: success", i + 1);
                } else {
                    info!("C-ECHO: success");
                }
            }
            _ => {
                error!("C-ECHO failed with status {}", status);
                let _ = dimse.abort().await;
                std::process::exit(-2);
            }
        }
    }

    debug!("Releasing association...");
    dimse.release().await.context(EchoSnafu)?;
    Ok(())
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

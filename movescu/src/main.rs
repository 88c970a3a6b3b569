//! A C-MOVE service class user:
//! asks a remote node to transfer instances
//! to a named application entity.
use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use netdicom_app_common::query::parse_queries;
use netdicom_dimse::commands::{CMoveRq, CommandField};
use netdicom_dimse::{DimseAssociation, StatusClass};
use netdicom_ul::association::client::ClientAssociationOptions;
use snafu::prelude::*;
use tracing::{debug, error, info, warn, Level};

/// DICOM C-MOVE SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to MOVE SCP (example: "QR-SCP@127.0.0.1:1045")
    addr: String,
    /// the AE title which shall receive the instances
    #[arg(long = "move-destination", default_value = "STORE-SCP")]
    move_destination: String,
    /// a sequence of queries
    #[arg(short('q'), required = true)]
    query: Vec<String>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "MOVE-SCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,

    /// use patient root information model
    #[arg(short = 'P', long, conflicts_with = "study")]
    patient: bool,
    /// use study root information model (default)
    #[arg(short = 'S', long, conflicts_with = "patient")]
    study: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Could not initialize SCU
    InitScu {
        #[snafu(source(from(netdicom_ul::association::Error, Box::new)))]
        source: Box<netdicom_ul::association::Error>,
    },

    #[snafu(whatever, display("{}", message))]
    Other {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + 'static>, Some)))]
        source: Option<Box<dyn std::error::Error + 'static>>,
    },
}

fn main() {
    run().unwrap_or_else(|err| {
        error!("{}", snafu::Report::from_error(err));
        std::process::exit(-2);
    });
}

#[tokio::main]
async fn run() -> Result<(), Error> {
    let App {
        addr,
        move_destination,
        query,
        verbose,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        patient,
        study: _,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        error!("{}", snafu::Report::from_error(e));
    });

    let abstract_syntax = if patient {
        uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
    } else {
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
    };

    let mut dcm_query = parse_queries(InMemDicomObject::new_empty(), &query)
        .whatever_context("Could not build query object")?;
    if dcm_query.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
        dcm_query.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(if patient { "PATIENT" } else { "STUDY" }),
        ));
    }

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .with_abstract_syntax(abstract_syntax)
        .max_pdu_length(max_pdu_length);
    if let Some(called_ae_title) = called_ae_title {
        options = options.called_ae_title(called_ae_title);
    }

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }
    let association = options.establish_with(&addr).await.context(InitScuSnafu)?;
    let mut dimse = DimseAssociation::new(association);

    let context_id = dimse
        .find_context(abstract_syntax, true)
        .whatever_context("No accepted presentation context for the retrieve model")?;

    let message_id = dimse.next_message_id();
    let rq = CMoveRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(abstract_syntax)
        .move_destination(move_destination.as_str())
        .build();
    dimse
        .send(context_id, &rq, Some(&dcm_query))
        .await
        .whatever_context("Could not send move request")?;

    loop {
        let message = dimse
            .recv_response()
            .await
            .whatever_context("Failed to receive from remote node")?;
        if message.command_field().ok().and_then(CommandField::from_code)
            != Some(CommandField::CMoveRsp)
        {
            warn!("Unexpected message from the provider; ignoring");
            continue;
        }

        let status = message.status().whatever_context("Response without status")?;
        let completed = message
            .command
            .get(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
            .and_then(|e| e.to_int::<u16>().ok());
        let failed = message
            .command
            .get(tags::NUMBER_OF_FAILED_SUBOPERATIONS)
            .and_then(|e| e.to_int::<u16>().ok());

        match status.class() {
            StatusClass::Pending => {
                debug!(
                    "Move pending ({} completed, {} failed)...",
                    completed.unwrap_or(0),
                    failed.unwrap_or(0)
                );
            }
            StatusClass::Success => {
                info!(
                    "Move complete: {} sub-operation(s) performed",
                    completed.unwrap_or(0)
                );
                break;
            }
            StatusClass::Warning => {
                warn!(
                    "Move ended with warnings: {} completed, {} failed",
                    completed.unwrap_or(0),
                    failed.unwrap_or(0)
                );
                break;
            }
            StatusClass::Cancel => {
                info!("Move was interrupted");
                break;
            }
            StatusClass::Failure => {
                error!("Move failed with status {}", status);
                break;
            }
        }
    }

    let _ = dimse.release().await;
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

//! A C-GET service class user:
//! retrieves instances from a remote node over the same association,
//! acting as a storage provider for the incoming sub-operations.
use std::path::PathBuf;

use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use netdicom_app_common::query::parse_queries;
use netdicom_dimse::commands::{CGetRq, CommandField, CStoreRsp};
use netdicom_dimse::service::{self, ServiceClassKind};
use netdicom_dimse::{DimseAssociation, Status, StatusClass};
use netdicom_ul::association::client::ClientAssociationOptions;
use snafu::prelude::*;
use tracing::{debug, error, info, warn, Level};

/// DICOM C-GET SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to GET SCP (example: "QR-SCP@127.0.0.1:1045")
    addr: String,
    /// a sequence of queries
    #[arg(short('q'), required = true)]
    query: Vec<String>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "GET-SCU")]
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
    /// output directory for retrieved objects
    #[arg(short = 'o', default_value = ".")]
    out_dir: PathBuf,

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

fn sanitize_filename(uid: &str) -> String {
    uid.trim_end_matches('\0')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Store one incoming sub-operation instance to the output directory.
fn store_instance(
    out_dir: &std::path::Path,
    transfer_syntax: &str,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    data: &[u8],
) -> Result<PathBuf, Error> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .whatever_context("Unsupported transfer syntax in sub-operation")?;
    let obj = InMemDicomObject::read_dataset_with_ts(data, ts)
        .whatever_context("Could not read incoming data set")?;
    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(ts.uid())
        .build()
        .whatever_context("Could not build file meta group")?;
    let file_name = out_dir
        .join(sanitize_filename(sop_instance_uid))
        .with_extension("dcm");
    obj.with_exact_meta(file_meta)
        .write_to_file(&file_name)
        .whatever_context("Could not write file")?;
    Ok(file_name)
}

#[tokio::main]
async fn run() -> Result<(), Error> {
    let App {
        addr,
        query,
        verbose,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        out_dir,
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

    std::fs::create_dir_all(&out_dir).whatever_context("Could not create output directory")?;

    let abstract_syntax = if patient {
        uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
    } else {
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
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
    // storage contexts with reversed roles
    // so that the provider can hand the instances back to us
    for storage_uid in service::uids_of(ServiceClassKind::Storage) {
        options = options
            .with_abstract_syntax(storage_uid.clone())
            .with_role_selection(storage_uid, false, true);
    }

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }
    let association = options.establish_with(&addr).await.context(InitScuSnafu)?;
    let mut dimse = DimseAssociation::new(association);

    let get_context = dimse
        .find_context(abstract_syntax, true)
        .whatever_context("No accepted presentation context for the retrieve model")?;

    let message_id = dimse.next_message_id();
    let rq = CGetRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(abstract_syntax)
        .build();
    dimse
        .send(get_context, &rq, Some(&dcm_query))
        .await
        .whatever_context("Could not send retrieve request")?;

    let mut stored = 0_u32;
    let mut failed = 0_u32;
    loop {
        let message = dimse
            .recv_response()
            .await
            .whatever_context("Failed to receive from remote node")?;

        match message.command_field().ok().and_then(CommandField::from_code) {
            Some(CommandField::CStoreRq) => {
                // a sub-operation handing one instance back to us
                let context_id = message.presentation_context_id;
                let sub_msg_id = message
                    .message_id()
                    .whatever_context("Sub-operation without message ID")?;
                let sop_class_uid = message
                    .affected_sop_class_uid()
                    .whatever_context("Sub-operation without SOP class UID")?;
                let sop_instance_uid = message
                    .affected_sop_instance_uid()
                    .whatever_context("Sub-operation without SOP instance UID")?;
                let ts_uid = dimse
                    .transfer_syntax(context_id)
                    .whatever_context("Sub-operation on an unknown context")?;

                let status = match message.dataset.as_deref() {
                    Some(data) => match store_instance(
                        &out_dir,
                        &ts_uid,
                        &sop_class_uid,
                        &sop_instance_uid,
                        data,
                    ) {
                        Ok(file_name) => {
                            info!("Stored {}", file_name.display());
                            stored += 1;
                            Status::SUCCESS
                        }
                        Err(e) => {
                            warn!("{}", snafu::Report::from_error(e));
                            failed += 1;
                            Status::STORAGE_CANNOT_UNDERSTAND
                        }
                    },
                    None => {
                        warn!("Sub-operation without a data set");
                        failed += 1;
                        Status::STORAGE_CANNOT_UNDERSTAND
                    }
                };

                let rsp = CStoreRsp::builder()
                    .message_id_being_responded_to(sub_msg_id)
                    .affected_sop_class_uid(sop_class_uid.as_str())
                    .affected_sop_instance_uid(sop_instance_uid.as_str())
                    .status(status.code())
                    .build();
                dimse
                    .send(context_id, &rsp, None)
                    .await
                    .whatever_context("Could not answer sub-operation")?;
            }
            Some(CommandField::CGetRsp) => {
                let status = message
                    .status()
                    .whatever_context("Response without status")?;
                match status.class() {
                    StatusClass::Pending => {
                        debug!("Retrieve pending...");
                    }
                    StatusClass::Success => {
                        info!("Retrieve complete: {} instance(s) stored", stored);
                        break;
                    }
                    StatusClass::Warning => {
                        warn!(
                            "Retrieve ended with warnings: {} stored, {} failed",
                            stored, failed
                        );
                        break;
                    }
                    _ => {
                        error!("Retrieve failed with status {}", status);
                        break;
                    }
                }
            }
            _ => {
                warn!("Unexpected message from the provider; ignoring");
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

//! A C-FIND service class user:
//! queries a remote node and prints the matching identifiers.
use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_dump::DumpOptions;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{mem::InMemDicomObject, open_file};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use netdicom_app_common::query::parse_queries;
use netdicom_dimse::{scu, DimseAssociation, StatusClass};
use netdicom_ul::association::client::ClientAssociationOptions;
use snafu::prelude::*;
use std::io::BufRead as _;
use std::path::PathBuf;
use tracing::{debug, error, info, warn, Level};

/// DICOM C-FIND SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to FIND SCP (example: "127.0.0.1:1045")
    addr: String,
    /// a DICOM file representing the query object
    file: Option<PathBuf>,
    /// a file containing lines of queries
    #[arg(long)]
    query_file: Option<PathBuf>,
    /// a sequence of queries
    #[arg(short('q'))]
    query: Vec<String>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "FIND-SCU")]
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
    #[arg(short = 'P', long, conflicts_with = "study", conflicts_with = "mwl")]
    patient: bool,
    /// use study root information model (default)
    #[arg(short = 'S', long, conflicts_with = "patient", conflicts_with = "mwl")]
    study: bool,
    /// use modality worklist information model
    #[arg(short = 'W', long, conflicts_with = "study", conflicts_with = "patient")]
    mwl: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Could not initialize SCU
    InitScu {
        #[snafu(source(from(netdicom_ul::association::Error, Box::new)))]
        source: Box<netdicom_ul::association::Error>,
    },

    /// Could not construct DICOM command
    CreateCommand { source: dicom_object::ReadError },

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

fn build_query(
    file: Option<PathBuf>,
    query_file: Option<PathBuf>,
    q: Vec<String>,
    patient: bool,
    study: bool,
    mwl: bool,
    verbose: bool,
) -> Result<InMemDicomObject, Error> {
    // read query file if provided
    let (base_query_obj, mut has_base) = if let Some(file) = file {
        if verbose {
            info!("Opening file '{}'...", file.display());
        }

        (
            open_file(file).context(CreateCommandSnafu)?.into_inner(),
            true,
        )
    } else {
        (InMemDicomObject::new_empty(), false)
    };

    // read queries from query text file
    let mut obj = base_query_obj;
    if let Some(query_file) = query_file {
        // read text file line by line
        let mut queries = Vec::new();
        let file = std::fs::File::open(query_file).whatever_context("Could not open query file")?;
        let reader = std::io::BufReader::new(file);
        for line in reader.lines() {
            let line = line.whatever_context("Could not read line from query file")?;
            {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
            }
            queries.push(line);
        }

        obj = parse_queries(obj, &queries)
            .whatever_context("Could not build query object from query file")?;
        has_base = true;
    }

    // read query options from command line

    if q.is_empty() && !has_base {
        whatever!("Query not specified");
    }

    let mut obj =
        parse_queries(obj, &q).whatever_context("Could not build query object from terms")?;

    // try to infer query retrieve level if not defined by the user,
    // but only if not using worklist
    if !mwl && obj.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
        let level = match (patient, study) {
            (true, false) => "PATIENT",
            (false, true) | (false, false) => "STUDY",
            _ => unreachable!(),
        };
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(level),
        ));
    }

    Ok(obj)
}

#[tokio::main]
async fn run() -> Result<(), Error> {
    let App {
        addr,
        file,
        query_file,
        query,
        verbose,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        patient,
        study,
        mwl,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        error!("{}", snafu::Report::from_error(e));
    });

    let dcm_query = build_query(file, query_file, query, patient, study, mwl, verbose)?;

    let abstract_syntax = match (patient, study, mwl) {
        // Patient Root Query/Retrieve Information Model - FIND
        (true, false, false) => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        // Modality Worklist Information Model - FIND
        (false, false, true) => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
        // Study Root Query/Retrieve Information Model - FIND (default)
        (false, false, false) | (false, true, false) => {
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
        }
        _ => unreachable!("Unexpected flag combination"),
    };

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }

    let mut scu_opt = ClientAssociationOptions::new()
        .with_abstract_syntax(abstract_syntax)
        .calling_ae_title(calling_ae_title)
        .max_pdu_length(max_pdu_length);

    if let Some(called_ae_title) = called_ae_title {
        scu_opt = scu_opt.called_ae_title(called_ae_title);
    }

    let scu = scu_opt.establish_with(&addr).await.context(InitScuSnafu)?;

    if verbose {
        info!("Association established");
    }

    let mut dimse = DimseAssociation::new(scu);
    let pc_selected = dimse
        .find_context(abstract_syntax, true)
        .whatever_context("Could not choose a presentation context")?;
    let ts_uid = dimse
        .transfer_syntax(pc_selected)
        .whatever_context("Poorly negotiated transfer syntax")?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .whatever_context("Unsupported transfer syntax")?;

    if verbose {
        debug!("Transfer Syntax: {}", ts.name());
    }

    let mut i = 0_usize;
    let status = scu::find(
        &mut dimse,
        pc_selected,
        abstract_syntax,
        &dcm_query,
        |identifier| {
            match InMemDicomObject::read_dataset_with_ts(identifier.as_slice(), ts) {
                Ok(dcm) => {
                    println!("------------------------ Match #{i} ------------------------");
                    if let Err(e) = DumpOptions::new().dump_object(&dcm) {
                        warn!("Could not dump match: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Could not read response data set: {}", e);
                }
            }
            i += 1;
        },
    )
    .await
    .whatever_context("Query failed")?;

    match status.class() {
        StatusClass::Success => {
            if i == 0 {
                info!("No results matching query");
            } else if verbose {
                debug!("Matching complete: {} result(s)", i);
            }
        }
        StatusClass::Cancel => info!("Matching was interrupted"),
        _ => warn!("Operation ended with status {}", status),
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

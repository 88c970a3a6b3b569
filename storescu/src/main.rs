//! A C-STORE service class user:
//! sends DICOM instances from the file system to a storage provider.
use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;
use dicom_core::header::HasLength;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, FileDicomObject, InMemDicomObject};
use netdicom_dimse::{scu, DimseAssociation, StatusClass};
use netdicom_ul::association::client::ClientAssociationOptions;
use snafu::{Report, ResultExt, Snafu};
use tracing::{debug, error, info, warn, Level};
use walkdir::WalkDir;

/// DICOM C-STORE SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to the target SCP,
    /// optionally with an AE title (example: "STORE-SCP@127.0.0.1:104")
    addr: String,
    /// the DICOM file(s) or directories to store
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling application entity title
    #[arg(long = "calling-ae-title", default_value = "STORE-SCU")]
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
    /// fail on the first instance which cannot be transferred
    #[arg(long)]
    fail_first: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Could not establish association
    EstablishAssociation {
        #[snafu(source(from(netdicom_ul::association::Error, Box::new)))]
        source: Box<netdicom_ul::association::Error>,
    },

    /// The store operation failed
    Store {
        #[snafu(source(from(netdicom_dimse::Error, Box::new)))]
        source: Box<netdicom_dimse::Error>,
    },

    /// No instance could be prepared for transfer
    NothingToStore,

    #[snafu(display("Instance {} was refused with status {}", uid, status))]
    Refused { uid: String, status: u16 },
}

/// One instance selected for transfer.
struct Instance {
    path: PathBuf,
    object: FileDicomObject<InMemDicomObject>,
    sop_class_uid: String,
    sop_instance_uid: String,
    file_transfer_syntax: String,
}

fn collect_instances(paths: &[PathBuf]) -> Vec<Instance> {
    let mut instances = Vec::new();
    let files = paths.iter().flat_map(|path| {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
    });

    for path in files {
        match open_file(&path) {
            Ok(object) => {
                let meta = object.meta();
                instances.push(Instance {
                    sop_class_uid: meta
                        .media_storage_sop_class_uid
                        .trim_end_matches('\0')
                        .to_string(),
                    sop_instance_uid: meta
                        .media_storage_sop_instance_uid
                        .trim_end_matches('\0')
                        .to_string(),
                    file_transfer_syntax: meta
                        .transfer_syntax
                        .trim_end_matches('\0')
                        .to_string(),
                    path,
                    object,
                });
            }
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), Report::from_error(e));
            }
        }
    }
    instances
}

#[tokio::main]
async fn main() {
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

    run(app).await.unwrap_or_else(|err| {
        error!("{}", Report::from_error(err));
        std::process::exit(-2);
    });
}

async fn run(app: App) -> Result<(), Error> {
    let App {
        addr,
        files,
        verbose,
        calling_ae_title,
        called_ae_title,
        max_pdu_length,
        fail_first,
    } = app;

    let instances = collect_instances(&files);
    snafu::ensure!(!instances.is_empty(), NothingToStoreSnafu);
    info!("{} instance(s) to transfer", instances.len());

    // one presentation context per distinct SOP class,
    // proposing the file transfer syntaxes plus the common baselines
    let mut sop_classes: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for instance in &instances {
        if seen.insert(instance.sop_class_uid.as_str()) {
            sop_classes.push(&instance.sop_class_uid);
        }
    }

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .max_pdu_length(max_pdu_length);
    if let Some(called_ae_title) = called_ae_title {
        options = options.called_ae_title(called_ae_title);
    }
    for sop_class in &sop_classes {
        let mut transfer_syntaxes: Vec<String> = instances
            .iter()
            .filter(|i| &i.sop_class_uid == sop_class)
            .map(|i| i.file_transfer_syntax.clone())
            .collect();
        for baseline in ["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"] {
            if !transfer_syntaxes.iter().any(|ts| ts == baseline) {
                transfer_syntaxes.push(baseline.to_string());
            }
        }
        transfer_syntaxes.dedup();
        options = options.with_presentation_context(sop_class.to_string(), transfer_syntaxes);
    }

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }
    let association = options
        .establish_with(&addr)
        .await
        .context(EstablishAssociationSnafu)?;
    let mut dimse = DimseAssociation::new(association);

    let mut refused = 0_usize;
    for instance in &instances {
        debug!("Sending {}...", instance.path.display());
        let context_id = match dimse.find_context(&instance.sop_class_uid, true) {
            Ok(id) => id,
            Err(_) => {
                warn!(
                    "No accepted presentation context for {}; skipping {}",
                    instance.sop_class_uid,
                    instance.path.display()
                );
                refused += 1;
                continue;
            }
        };

        // command group elements never travel inside the data set
        let dataset: &InMemDicomObject = &instance.object;
        debug_assert!(dataset
            .element(tags::SOP_INSTANCE_UID)
            .map(|e| !e.is_empty())
            .unwrap_or(true));

        let status = scu::store(
            &mut dimse,
            context_id,
            &instance.sop_class_uid,
            &instance.sop_instance_uid,
            dataset,
        )
        .await
        .context(StoreSnafu)?;

        match status.class() {
            StatusClass::Success => {
                info!("Stored {} ({})", instance.sop_instance_uid, instance.path.display());
            }
            StatusClass::Warning => {
                warn!(
                    "Stored {} with warning status {}",
                    instance.sop_instance_uid, status
                );
            }
            _ => {
                refused += 1;
                if fail_first {
                    let _ = dimse.abort().await;
                    return RefusedSnafu {
                        uid: instance.sop_instance_uid.clone(),
                        status: status.code(),
                    }
                    .fail();
                }
                warn!(
                    "Instance {} refused with status {}",
                    instance.sop_instance_uid, status
                );
            }
        }
    }

    dimse.release().await.context(StoreSnafu)?;
    if refused > 0 {
        warn!("{} instance(s) were not transferred", refused);
    }
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

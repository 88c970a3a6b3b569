//! A C-STORE service class provider:
//! receives DICOM instances and writes them to a directory,
//! one file per instance, named after the SOP instance UID.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use netdicom_dimse::scp::{serve, ScpOptions};
use netdicom_dimse::service::{HandlerRegistry, StoreHandler, StoreRequest};
use netdicom_dimse::{Config, Status};
use snafu::Report;
use tracing::{error, info, warn, Level};

/// DICOM C-STORE SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the application entity title of this node
    #[arg(long = "ae-title", default_value = "STORE-SCP")]
    ae_title: String,
    /// enforce the maximum PDU length on inbound PDUs
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// accept instances of any SOP class
    /// and keep their bytes without decoding them
    #[arg(long)]
    unrestricted: bool,
    /// receive data sets in chunks instead of whole
    #[arg(long)]
    chunked: bool,
    /// only accept native/uncompressed transfer syntaxes
    #[arg(long)]
    uncompressed_only: bool,
    /// the maximum PDU length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// output directory for incoming objects
    #[arg(short = 'o', default_value = ".")]
    out_dir: PathBuf,
    /// which port to listen on
    #[arg(short, default_value = "11111")]
    port: u16,
}

/// Keep only filesystem-safe characters of a SOP instance UID.
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

#[derive(Debug)]
struct FileStore {
    out_dir: PathBuf,
    decode: bool,
}

impl StoreHandler for FileStore {
    fn handle_store(&self, request: StoreRequest) -> Status {
        let file_name = self
            .out_dir
            .join(sanitize_filename(&request.sop_instance_uid))
            .with_extension("dcm");

        let outcome = if self.decode {
            self.store_decoded(&request, &file_name)
        } else {
            self.store_raw(&request, &file_name)
        };

        match outcome {
            Ok(()) => {
                info!("Stored {}", file_name.display());
                Status::SUCCESS
            }
            Err(e) => {
                warn!("Could not store instance: {}", e);
                Status::STORAGE_CANNOT_UNDERSTAND
            }
        }
    }
}

impl FileStore {
    /// Decode the data set and save it
    /// with a conformant file meta group.
    fn store_decoded(
        &self,
        request: &StoreRequest,
        file_name: &std::path::Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let ts = TransferSyntaxRegistry
            .get(&request.transfer_syntax)
            .ok_or("unsupported transfer syntax")?;
        let obj = InMemDicomObject::read_dataset_with_ts(request.data.as_slice(), ts)?;
        let file_meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(&request.sop_class_uid)
            .media_storage_sop_instance_uid(&request.sop_instance_uid)
            .transfer_syntax(ts.uid())
            .build()?;
        obj.with_exact_meta(file_meta).write_to_file(file_name)?;
        Ok(())
    }

    /// Keep the received bytes as they are,
    /// prepending a file meta group built from the command set.
    fn store_raw(
        &self,
        request: &StoreRequest,
        file_name: &std::path::Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        use std::io::Write;
        let file_meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(&request.sop_class_uid)
            .media_storage_sop_instance_uid(&request.sop_instance_uid)
            .transfer_syntax(&request.transfer_syntax)
            .build()?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(file_name)?);
        file.write_all(&[0_u8; 128])?;
        file.write_all(b"DICM")?;
        file_meta.write(&mut file)?;
        file.write_all(&request.data)?;
        file.flush()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let App {
        verbose,
        ae_title,
        strict,
        unrestricted,
        chunked,
        uncompressed_only,
        max_pdu_length,
        out_dir,
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

    std::fs::create_dir_all(&out_dir).unwrap_or_else(|e| {
        error!("Could not create output directory: {}", e);
        std::process::exit(-2);
    });

    let config = Config {
        unrestricted_storage: unrestricted,
        store_recv_chunked: chunked,
        ..Config::default()
    };

    let transfer_syntaxes = if uncompressed_only {
        vec![
            "1.2.840.10008.1.2.1".to_string(),
            "1.2.840.10008.1.2".to_string(),
        ]
    } else {
        Vec::new()
    };

    let options = ScpOptions {
        ae_title,
        max_pdu_length,
        strict,
        transfer_syntaxes,
        handlers: HandlerRegistry::new().on_store(FileStore {
            out_dir,
            // raw pass-through in unrestricted mode
            decode: !unrestricted,
        }),
        config,
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
    use super::sanitize_filename;
    use crate::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }

    #[test]
    fn filenames_keep_only_safe_characters() {
        assert_eq!(sanitize_filename("1.2.840.113619.2.1"), "1.2.840.113619.2.1");
        assert_eq!(sanitize_filename("1.2.3\0"), "1.2.3");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
    }
}

//! Ready-made service user operations over a [`DimseAssociation`].
//!
//! These functions drive the request/response exchange
//! of the common DIMSE-C services;
//! the command line front-ends are thin wrappers around them.

use dicom_object::InMemDicomObject;
use tracing::debug;

use netdicom_ul::association::AsyncAssociation;

use crate::assoc::DimseAssociation;
use crate::commands::{CEchoRq, CFindRq, CStoreRq, CommandField, Priority};
use crate::error::ServiceStatusSnafu;
use crate::message::DimseMessage;
use crate::status::Status;
use crate::Result;

/// Perform a C-ECHO on the given presentation context
/// and return the peer's status.
pub async fn echo<A>(
    dimse: &mut DimseAssociation<A>,
    context_id: u8,
    abstract_syntax: &str,
) -> Result<Status>
where
    A: AsyncAssociation,
{
    let message_id = dimse.next_message_id();
    let rq = CEchoRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(abstract_syntax)
        .build();
    dimse.send(context_id, &rq, None).await?;

    let rsp = wait_response(dimse, CommandField::CEchoRsp, message_id).await?;
    rsp.status()
}

/// Perform a C-STORE of the given instance,
/// already decoded into a data set object,
/// and return the peer's status.
pub async fn store<A>(
    dimse: &mut DimseAssociation<A>,
    context_id: u8,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    dataset: &InMemDicomObject,
) -> Result<Status>
where
    A: AsyncAssociation,
{
    let message_id = dimse.next_message_id();
    let rq = CStoreRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(sop_class_uid)
        .affected_sop_instance_uid(sop_instance_uid)
        .build();
    dimse.send(context_id, &rq, Some(dataset)).await?;

    let rsp = wait_response(dimse, CommandField::CStoreRsp, message_id).await?;
    rsp.status()
}

/// Perform a C-STORE with a pre-encoded data set,
/// whose bytes must match the context's accepted transfer syntax.
pub async fn store_raw<A>(
    dimse: &mut DimseAssociation<A>,
    context_id: u8,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    dataset: &[u8],
) -> Result<Status>
where
    A: AsyncAssociation,
{
    let message_id = dimse.next_message_id();
    let rq = CStoreRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(sop_class_uid)
        .affected_sop_instance_uid(sop_instance_uid)
        .build();
    dimse.send_raw(context_id, &rq, Some(dataset)).await?;

    let rsp = wait_response(dimse, CommandField::CStoreRsp, message_id).await?;
    rsp.status()
}

/// Perform a C-FIND with the given query identifier,
/// invoking `on_match` for every pending match.
///
/// Returns the final status of the operation.
pub async fn find<A, F>(
    dimse: &mut DimseAssociation<A>,
    context_id: u8,
    abstract_syntax: &str,
    query: &InMemDicomObject,
    mut on_match: F,
) -> Result<Status>
where
    A: AsyncAssociation,
    F: FnMut(Vec<u8>),
{
    let message_id = dimse.next_message_id();
    let rq = CFindRq::builder()
        .message_id(message_id)
        .affected_sop_class_uid(abstract_syntax)
        .priority(Priority::Medium)
        .build();
    dimse.send(context_id, &rq, Some(query)).await?;

    loop {
        let rsp = wait_response(dimse, CommandField::CFindRsp, message_id).await?;
        let status = rsp.status()?;
        if status.is_pending() {
            if let Some(identifier) = rsp.dataset {
                on_match(identifier);
            }
            continue;
        }
        return Ok(status);
    }
}

/// Raise an error if the status is not a success.
pub fn ensure_success(status: Status) -> Result<()> {
    snafu::ensure!(
        status.is_success(),
        ServiceStatusSnafu {
            status: status.code()
        }
    );
    Ok(())
}

/// Wait for the response with the given command field
/// answering `message_id`, requeueing unrelated traffic.
async fn wait_response<A>(
    dimse: &mut DimseAssociation<A>,
    expected: CommandField,
    message_id: u16,
) -> Result<DimseMessage>
where
    A: AsyncAssociation,
{
    let mut unrelated = Vec::new();
    let found = loop {
        let message = dimse.recv_response().await?;
        if message.command_field().ok() == Some(expected as u16)
            && message.message_id_being_responded_to().ok() == Some(message_id)
        {
            break message;
        }
        debug!("setting aside unrelated message");
        unrelated.push(message);
    };
    for message in unrelated.into_iter().rev() {
        dimse.requeue(message);
    }
    Ok(found)
}

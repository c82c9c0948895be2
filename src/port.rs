//! Advisory port allocation.
//!
//! [`allocate`] tries the preferred port with a transient bind. If the port
//! is taken it asks the OS for an ephemeral one instead. The trial listener is
//! dropped before returning, so another process can still grab the port before
//! the caller rebinds it; callers must report the address they actually bind.

use std::io;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::AllocationError;

/// Return a port on `host` that was bindable at the moment of the call.
///
/// Falls back to an OS-assigned port only when `preferred` is in use; any
/// other bind failure is returned as an error.
pub async fn allocate(host: &str, preferred: u16) -> Result<u16, AllocationError> {
    match try_bind(host, preferred).await {
        Ok(port) => {
            debug!("Preferred port {preferred} is free");
            Ok(port)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            let port = try_bind(host, 0).await.map_err(|source| AllocationError::Bind {
                addr: format!("{host}:0"),
                source,
            })?;
            info!("Port {preferred} is in use, using {port} instead");
            Ok(port)
        }
        Err(source) => Err(AllocationError::Bind {
            addr: format!("{host}:{preferred}"),
            source,
        }),
    }
}

async fn try_bind(host: &str, port: u16) -> io::Result<u16> {
    let listener = TcpListener::bind((host, port)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

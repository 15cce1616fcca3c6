//! HTTP download drivers for RCP firmware.
//!
//! Two shapes over one connection-handling core: the combined border-router
//! image is streamed through an OTA session with the host-firmware tail
//! redirected to the platform OTA writer, while the RCP-only flow fetches a
//! fixed set of discrete files into the next slot directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{Result, UpdateError};
use crate::ota::{OtaHandle, OtaReceiver, OtaState};
use crate::platform::{AppOta, AppOtaUpdate, HttpClient, HttpRequest, NvsStore, SocketErrno};
use crate::slots::UpdateSequencer;

/// Read granularity for HTTP bodies.
pub const HTTP_CHUNK_SIZE: usize = 1024;

/// Relative paths fetched by the RCP-only download, in order.
pub const RCP_DOWNLOAD_FILES: [&str; 5] = [
    "/flash_args",
    "/rcp_version",
    "/bt/bt.bin",
    "/pt/pt.bin",
    "/esp_ot_rcp.bin",
];

/// Issue a GET and walk it to a 2xx: redirects are followed (the client
/// capability bounds redirect loops), a single auth challenge is retried
/// with credentials, everything else fails the download.
fn fetch<C: HttpClient>(client: &mut C, url: &str) -> Result<C::Request> {
    let mut request = client.get(url)?;
    let mut status = request.status()?;
    let mut authenticated = false;
    loop {
        match status {
            301 | 302 | 307 => {
                log::debug!("HTTP {status}, following redirect");
                request.redirect()?;
                status = request.status()?;
            }
            401 if !authenticated => {
                authenticated = true;
                request.authenticate()?;
                status = request.status()?;
            }
            200..=299 => return Ok(request),
            _ => {
                return Err(UpdateError::Fail(format!(
                    "HTTP request for {url} failed with status {status}"
                )))
            }
        }
    }
}

/// Stream a combined border-router image: RCP subfiles into the next slot
/// via `receiver`, the host firmware tail into the platform OTA writer.
///
/// The handoff happens at the exact byte the session finishes; the
/// unconsumed remainder of that read, and everything after it, is host
/// firmware. A failure on the RCP side aborts the host update too, so a
/// half-downloaded host image never becomes bootable.
pub fn download_combined_image<C, A, S>(
    client: &mut C,
    url: &str,
    receiver: &mut OtaReceiver,
    slots: &mut UpdateSequencer<S>,
    host_ota: &mut A,
) -> Result<()>
where
    C: HttpClient,
    A: AppOta,
    S: NvsStore,
{
    log::info!("downloading border router image from {url}");
    let mut request = fetch(client, url)?;
    let handle = receiver.begin(slots)?;
    let mut host_update: Option<A::Update> = None;

    if let Err(e) = pump(&mut request, receiver, handle, host_ota, &mut host_update) {
        let _ = receiver.abort(handle);
        if let Some(update) = host_update.take() {
            update.abort();
        }
        return Err(e);
    }

    if receiver.state(handle)? != OtaState::Finished {
        let _ = receiver.abort(handle);
        if let Some(update) = host_update.take() {
            update.abort();
        }
        return Err(UpdateError::Fail(
            "image stream ended before the RCP payload completed".into(),
        ));
    }

    if let Err(e) = receiver.end(handle, slots) {
        // The RCP slot was not submitted; roll the host boot partition back
        // as well rather than booting a host image whose RCP half is gone.
        if let Some(update) = host_update.take() {
            update.abort();
        }
        return Err(e);
    }

    if let Some(update) = host_update.take() {
        update.complete()?;
        log::info!("host firmware staged for next boot");
    }
    Ok(())
}

fn pump<R, A>(
    request: &mut R,
    receiver: &mut OtaReceiver,
    handle: OtaHandle,
    host_ota: &mut A,
    host_update: &mut Option<A::Update>,
) -> Result<()>
where
    R: HttpRequest,
    A: AppOta,
{
    let mut buf = [0u8; HTTP_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let len = request.read(&mut buf)?;
        if len == 0 {
            log::debug!("image body exhausted after {total} bytes");
            return Ok(());
        }
        total += len as u64;

        let mut consumed = 0;
        if receiver.state(handle)? != OtaState::Finished {
            consumed = receiver.receive(handle, &buf[..len])?;
        }
        if consumed < len {
            if host_update.is_none() {
                log::info!("RCP image complete, remaining stream is host firmware");
                *host_update = Some(host_ota.initiate_update()?);
            }
            if let Some(update) = host_update.as_mut() {
                update.write(&buf[consumed..len])?;
            }
        }
    }
}

/// Fetch the discrete RCP file set into the next slot directory. On success
/// the slot is staged; the caller submits it once it decides to switch.
pub fn download_rcp_files<C, S>(
    client: &mut C,
    base_url: &str,
    slots: &mut UpdateSequencer<S>,
) -> Result<()>
where
    C: HttpClient,
    S: NvsStore,
{
    let base = base_url.trim_end_matches('/');
    let dir = slots.next_firmware_dir();
    for rel in RCP_DOWNLOAD_FILES {
        let url = format!("{base}{rel}");
        let dest = dir.join(rel.trim_start_matches('/'));
        download_file(client, &url, &dest)?;
    }
    slots.stage_next_slot();
    Ok(())
}

fn download_file<C: HttpClient>(client: &mut C, url: &str, dest: &Path) -> Result<()> {
    log::info!("downloading {url} -> {}", dest.display());
    let mut request = fetch(client, url)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(dest)?;

    let declared = request.content_length();
    let mut received = 0u64;
    let mut buf = [0u8; HTTP_CHUNK_SIZE];
    loop {
        let len = request.read(&mut buf)?;
        if len == 0 {
            // A zero-length read is the normal end of transfer unless the
            // socket reported a connection loss before the declared length
            // arrived.
            if let Some(total) = declared {
                let lost = request
                    .last_errno()
                    .is_some_and(SocketErrno::is_connection_loss);
                if received < total && lost {
                    return Err(UpdateError::Fail(format!(
                        "connection lost downloading {url}: {received} of {total} bytes"
                    )));
                }
            }
            break;
        }
        file.write_all(&buf[..len])?;
        received += len as u64;
    }
    log::debug!("wrote {received} bytes to {}", dest.display());
    Ok(())
}

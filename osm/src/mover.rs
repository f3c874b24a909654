//! NBD data mover (C4, spec.md §4.4): full copy via `nbdcopy`, and CBT
//! delta sync via direct libnbd reads into the attached block device.

use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;
use crate::proc::Supervised;
use crate::run::CancelToken;
use crate::vmware::{ChangedArea, VmwareSession};

/// Chunk size for CBT delta-sync reads (spec.md §4.4: "chunked to at
/// most 64 MiB").
const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Runs the full-copy strategy: `nbdcopy <source> <device>`
/// (spec.md §4.4).
pub async fn full_copy(
    source_uri: &str,
    device: &Path,
    destination_is_zero: bool,
    cancel: &CancelToken,
) -> Result<()> {
    info!(device = %device.display(), "starting full copy");
    Supervised::run_nbdcopy(source_uri, device, destination_is_zero, cancel).await
}

/// Runs the CBT delta-sync strategy: opens `device` `O_WRONLY | O_EXCL |
/// O_DIRECT`, connects libnbd to `source_uri`, and replays every extent
/// changed since `from_change_id` by `Pread` then `WriteAt`
/// (spec.md §4.4).
///
/// Returns the change-id the VM's CBT anchor was at when the sync
/// completed, to be written back to volume metadata as the new
/// `changeID` (spec.md §8 "CBT correctness").
pub async fn delta_sync(
    vmware: &VmwareSession,
    vm_moref: &str,
    snapshot_moref: &str,
    disk_key: i32,
    from_change_id: &str,
    disk_size: u64,
    source_uri: &str,
    device: &Path,
    cancel: &CancelToken,
) -> Result<String> {
    let handle = osm_nbd::Handle::connect_uri(source_uri)?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_EXCL | libc::O_DIRECT)
        .open(device)?;

    let mut offset = 0u64;
    let mut change_id = from_change_id.to_owned();

    loop {
        cancel.check()?;
        let (areas, next_offset) = vmware
            .query_changed_areas(vm_moref, snapshot_moref, disk_key, offset, &change_id)
            .await?;

        if areas.is_empty() && next_offset >= disk_size {
            break;
        }

        for area in &areas {
            cancel.check()?;
            copy_area(&handle, &mut file, *area)?;
        }

        if next_offset >= disk_size {
            break;
        }
        offset = next_offset;
    }

    change_id = vmware
        .cbt_change_id(vm_moref, snapshot_moref, disk_key)
        .await?;

    debug!(change_id = %change_id, "delta sync complete");
    Ok(change_id)
}

/// Copies one changed extent, chunked to [`MAX_CHUNK_BYTES`].
fn copy_area(handle: &osm_nbd::Handle, file: &mut std::fs::File, area: ChangedArea) -> Result<()> {
    let mut remaining = area.length;
    let mut pos = area.start;
    let mut buf = vec![0u8; MAX_CHUNK_BYTES.min(area.length.max(1)) as usize];

    while remaining > 0 {
        let chunk_len = remaining.min(MAX_CHUNK_BYTES) as usize;
        let chunk = &mut buf[..chunk_len];
        handle.pread(chunk, pos)?;

        file.seek(SeekFrom::Start(pos))?;
        file.write_all(chunk)?;

        pos += chunk_len as u64;
        remaining -= chunk_len as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_chunk_is_64_mib() {
        assert_eq!(MAX_CHUNK_BYTES, 64 * 1024 * 1024);
    }
}

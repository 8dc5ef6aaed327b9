//! Init-once protocol for queue and arena segments.
//!
//! The process that created the backing memory writes the [`SegmentHeader`],
//! lays out the payload, and publishes the header's ready flag. Processes
//! that attached instead wait for the flag and then check that the recorded
//! parameters match their own.

use slabring_primitives::{Backoff, Region, SegmentHeader, SegmentHeaderInit};

use crate::backend::{Attachment, BackendOptions, MemoryBackend};
use crate::error::{Error, Result};

/// Map the segment described by `init` and make sure its payload is laid out.
///
/// `layout` runs only in the creating process, between header init and
/// publication. An attacher whose segment gets unlinked before it is
/// published opens the name again.
pub(crate) fn open(
    name: Option<&str>,
    init: SegmentHeaderInit,
    options: &BackendOptions,
    layout: impl FnOnce(Region),
) -> Result<MemoryBackend> {
    let size = init.total_size as usize;
    let mut layout = Some(layout);
    loop {
        let backend = match name {
            None => MemoryBackend::anonymous(size)?,
            Some(name) => MemoryBackend::named(name, size).map_err(|err| match err {
                // Same name, different byte size: somebody created it with other
                // parameters.
                Error::ResourceInUse { what, reason } => Error::invalid(format!(
                    "{what} was created with different parameters ({reason})"
                )),
                err => err,
            })?,
        };
        backend.apply(options);

        let region = backend.region();
        match backend.attachment() {
            Attachment::Created => {
                let header = unsafe { region.get_mut::<SegmentHeader>(0) };
                header.init(init);
                if let Some(layout) = layout.take() {
                    layout(region);
                }
                header.publish();
                debug!(kind = ?init.kind, size, name = ?backend.name(), "segment published");
            }
            Attachment::Attached => {
                let header = unsafe { region.get::<SegmentHeader>(0) };
                if !wait_published(header, &backend)? {
                    debug!(name = ?backend.name(), "segment unlinked before it was published, reopening");
                    continue;
                }
                header.validate(&init).map_err(|reason| {
                    Error::invalid(format!(
                        "cannot attach to {}: {reason}",
                        backend.name().unwrap_or("segment")
                    ))
                })?;
                debug!(kind = ?init.kind, size, name = ?backend.name(), "segment attached");
            }
        }

        return Ok(backend);
    }
}

/// Wait for the creator to publish `header`. Returns `false` if the segment's
/// name was removed first.
fn wait_published(header: &SegmentHeader, backend: &MemoryBackend) -> Result<bool> {
    let mut backoff = Backoff::new();
    while !header.is_ready() {
        if backoff.is_yielding() && !backend.is_linked()? {
            return Ok(false);
        }
        backoff.step();
    }
    Ok(true)
}

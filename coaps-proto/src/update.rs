//! Block-wise firmware download
//!
//! An [`Update`] tracks one firmware download at a time. It produces the next `Block2` request
//! for the exchange engine, checks each response against the transfer so far, and streams
//! accepted blocks into a [`FirmwareStore`]. Any protocol violation ends the transfer with a
//! [`CancelReason`]; nothing is retried automatically.

use std::{fmt, io};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::UpdateConfig,
    message::{Block, Code, ETag, Message, Type},
};

/// Why a download stopped
///
/// Names and codes are stable and used by operator tooling.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CancelReason {
    /// Canceled on request
    Command = 1,
    /// Flash, verification or boot-loader failure
    NotAvailable = 2,
    /// The server answered with a non-success code
    NoContent = 3,
    /// Content-format or ETag changed during the transfer
    Changed = 4,
    /// Missing, malformed or inconsistent block option, or an oversized image
    BlockOption = 5,
    /// A block arrived out of order
    BlockNo = 6,
}

impl CancelReason {
    /// Stable name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::NotAvailable => "not available",
            Self::NoContent => "no content",
            Self::Changed => "changed",
            Self::BlockOption => "block option",
            Self::BlockNo => "block number",
        }
    }

    /// Stable numeric code
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Description of a completely written image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Version string embedded in the image
    pub version: String,
    /// Bytes written
    pub size: u64,
}

/// Flash writer and boot-loader interface
pub trait FirmwareStore {
    /// Erase the staging area
    fn erase(&mut self) -> io::Result<()>;
    /// Append bytes to the staging area
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    /// Flush and describe the written image
    fn finish(&mut self) -> io::Result<ImageInfo>;
    /// Discard a partially written or staged image, withdrawing any upgrade request
    fn abort(&mut self);
    /// Stage the image for the boot-loader to install on the next boot
    fn request_upgrade(&mut self) -> io::Result<()>;
    /// Whether the running image has been confirmed
    fn is_confirmed(&self) -> bool;
    /// Mark the running image as good
    fn confirm(&mut self) -> io::Result<()>;
}

/// Errors of download commands
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// A download is already running
    #[error("download in progress")]
    Busy,
    /// The resource identifier carries no version
    #[error("invalid resource {0:?}")]
    InvalidResource(String),
    /// Nothing has been downloaded that could be applied
    #[error("no firmware ready")]
    NotReady,
}

/// Pending call of [`FirmwareStore::abort`]
///
/// Returned by a cancellation of a running transfer or of a staged image. The abort must run on
/// the store once the caller holds it.
#[must_use]
#[derive(Debug)]
pub struct Abort(());

impl Abort {
    /// Discard the image
    pub fn apply(self, store: &mut dyn FirmwareStore) {
        store.abort();
    }
}

/// Result of handing a response to the transfer
#[derive(Debug)]
pub enum Progress {
    /// No transfer was expecting a response
    Ignored,
    /// The block was stored; the next one is due
    Next,
    /// The image is complete and staged
    Finished {
        /// Whether the device should reboot into it now
        apply: bool,
    },
    /// The transfer was canceled
    Canceled(CancelReason, Option<Abort>),
}

/// Outcome of the erase that precedes a download
#[derive(Debug)]
pub enum Erased {
    /// The first block may be requested
    Ready,
    /// The transfer ended while erasing
    Canceled(Option<Abort>),
}

/// What `apply` will do
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ApplyAction {
    /// An image is staged; reboot into it now
    RebootNow,
    /// Reboot as soon as the running download finishes
    OnFinish,
}

/// Coarse phase of the update record
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    /// No download was started
    Idle,
    /// Preparing the staging area
    Erasing,
    /// Fetching blocks
    Downloading,
    /// An image is staged
    Ready,
    /// The last download was canceled
    Canceled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Idle => "idle",
            Self::Erasing => "erasing",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::Canceled => "canceled",
        })
    }
}

/// Snapshot of the update record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Current phase
    pub phase: Phase,
    /// Resource of the last download
    pub resource: Option<String>,
    /// Bytes received
    pub offset: u64,
    /// Announced image size
    pub total: Option<u64>,
    /// Whether the image is applied right after download
    pub apply: bool,
    /// Why the last download was canceled
    pub reason: Option<CancelReason>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if let Some(resource) = &self.resource {
            write!(f, " {resource}")?;
        }
        if matches!(self.phase, Phase::Downloading | Phase::Canceled) {
            match self.total {
                Some(total) => write!(f, " {}/{} bytes", self.offset, total)?,
                None => write!(f, " {} bytes", self.offset)?,
            }
        }
        if self.apply && self.phase != Phase::Canceled {
            f.write_str(", apply")?;
        }
        if let Some(reason) = self.reason {
            write!(f, ", reason: {reason}")?;
        }
        Ok(())
    }
}

/// Running download context
#[derive(Debug)]
struct Transfer {
    /// Total size, once announced
    total: Option<u64>,
    /// Offset of the next expected block
    offset: u64,
    szx: u8,
    content_format: Option<u16>,
    etag: Option<ETag>,
    blocks: u32,
}

/// The firmware update record and its block-wise transfer
#[derive(Debug)]
pub struct Update {
    config: UpdateConfig,
    resource: Option<String>,
    path: String,
    downloading: bool,
    download_requested: bool,
    erasing: bool,
    canceled: bool,
    ready: bool,
    apply: bool,
    reason: Option<CancelReason>,
    transfer: Option<Transfer>,
}

impl Update {
    /// Create an idle record
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            resource: None,
            path: String::new(),
            downloading: false,
            download_requested: false,
            erasing: false,
            canceled: false,
            ready: false,
            apply: false,
            reason: None,
            transfer: None,
        }
    }

    /// Start downloading `resource`, optionally applying it when done
    ///
    /// The staging area must be erased next; report the result with
    /// [`Update::erase_complete`]. No block is requested before that. A new download is refused
    /// until the previous erase has been reported, even if that download was canceled.
    pub fn download(&mut self, resource: &str, apply: bool) -> Result<(), UpdateError> {
        if self.downloading || self.erasing {
            return Err(UpdateError::Busy);
        }
        let resource = resource.trim();
        if version_of(resource).is_none() || resource.contains(char::is_whitespace) {
            return Err(UpdateError::InvalidResource(resource.into()));
        }

        self.path = match resource.strip_prefix('/') {
            Some(path) => path.into(),
            None if self.config.prefix.is_empty() => resource.into(),
            None => format!("{}/{}", self.config.prefix.trim_matches('/'), resource),
        };
        self.resource = Some(resource.into());
        self.downloading = true;
        self.download_requested = false;
        self.erasing = true;
        self.canceled = false;
        self.ready = false;
        self.apply = apply;
        self.reason = None;
        self.transfer = Some(Transfer {
            total: None,
            offset: 0,
            szx: self.config.szx,
            content_format: None,
            etag: None,
            blocks: 0,
        });
        info!(resource, apply, "firmware download started");
        Ok(())
    }

    /// Report the end of the erase started by [`Update::download`]
    pub fn erase_complete(&mut self, result: io::Result<()>) -> Erased {
        if !self.erasing {
            return Erased::Ready;
        }
        self.erasing = false;
        if self.canceled {
            debug!("erase finished after cancel");
            // The cancel deferred its abort while the erase was running
            return Erased::Canceled(Some(Abort(())));
        }
        if let Err(e) = result {
            warn!("erase failed: {}", e);
            return Erased::Canceled(self.cancel(CancelReason::NotAvailable));
        }
        self.download_requested = true;
        Erased::Ready
    }

    /// The next block request, if one is due
    ///
    /// Call [`Update::requested`] once the request was handed to the exchange.
    pub fn pending_request(&self) -> Option<Message> {
        if !self.downloading || self.erasing || !self.download_requested {
            return None;
        }
        let transfer = self.transfer.as_ref()?;
        let block = Block::at_offset(transfer.offset, transfer.szx).ok()?;
        let mut msg = Message::new(Type::Confirmable, Code::GET);
        msg.set_uri_path(&self.path).set_block2(block);
        Some(msg)
    }

    /// The pending request was sent
    pub fn requested(&mut self) {
        self.download_requested = false;
    }

    /// The block request exchange failed; request the same block again next cycle
    pub fn exchange_failed(&mut self) {
        if self.downloading && !self.erasing {
            self.download_requested = true;
        }
    }

    /// Check a block response and store its payload
    pub fn handle_response(&mut self, response: &Message, store: &mut dyn FirmwareStore) -> Progress {
        if !self.awaits_block() {
            return Progress::Ignored;
        }
        match self.accept(response, store) {
            Ok(progress) => progress,
            Err(reason) => {
                let abort = self.cancel(reason);
                Progress::Canceled(reason, abort)
            }
        }
    }

    fn accept(
        &mut self,
        response: &Message,
        store: &mut dyn FirmwareStore,
    ) -> Result<Progress, CancelReason> {
        let max = self.config.max_image_size;
        let transfer = match self.transfer.as_mut() {
            Some(transfer) => transfer,
            None => return Ok(Progress::Ignored),
        };

        if !response.code.is_success() {
            debug!(code = %response.code, "download refused");
            return Err(CancelReason::NoContent);
        }

        let content_format = response.content_format();
        if transfer.offset == 0 {
            transfer.content_format = content_format;
        } else if transfer.content_format != content_format {
            debug!(?content_format, expected = ?transfer.content_format, "content-format changed");
            return Err(CancelReason::Changed);
        }

        let etag = match response.etag() {
            Some(Ok(etag)) => Some(etag),
            Some(Err(_)) => return Err(CancelReason::Changed),
            None => None,
        };
        match (transfer.etag, etag) {
            (Some(expected), actual) if actual != Some(expected) => {
                debug!(%expected, "etag changed");
                return Err(CancelReason::Changed);
            }
            (None, Some(etag)) => transfer.etag = Some(etag),
            _ => {}
        }

        let len = response.payload.len() as u64;
        let more = match response.block2() {
            None if transfer.offset != 0 => return Err(CancelReason::BlockOption),
            None => {
                transfer.total = Some(len);
                false
            }
            Some(Err(e)) => {
                debug!("malformed block option: {}", e);
                return Err(CancelReason::BlockOption);
            }
            Some(Ok(block)) => {
                if let Some(total) = response.size2() {
                    transfer.total = Some(u64::from(total));
                }
                if block.szx > transfer.szx {
                    return Err(CancelReason::BlockOption);
                }
                if block.offset() != transfer.offset {
                    debug!(
                        offset = block.offset(),
                        expected = transfer.offset,
                        "unexpected block"
                    );
                    return Err(CancelReason::BlockNo);
                }
                // The server may choose a smaller block size than requested
                transfer.szx = block.szx;
                if len > block.size() as u64 || (block.more && len < block.size() as u64) {
                    return Err(CancelReason::BlockOption);
                }
                block.more
            }
        };

        match transfer.total {
            Some(total) if total > max => {
                warn!(total, max, "image too large");
                return Err(CancelReason::BlockOption);
            }
            Some(total) if transfer.offset + len > total => return Err(CancelReason::BlockOption),
            _ if transfer.offset + len > max => return Err(CancelReason::BlockOption),
            _ => {}
        }

        if let Err(e) = store.write(&response.payload) {
            warn!("flash write failed: {}", e);
            return Err(CancelReason::NotAvailable);
        }
        transfer.offset += len;
        transfer.blocks += 1;
        debug!(offset = transfer.offset, total = ?transfer.total, more, "block stored");

        if more {
            self.download_requested = true;
            return Ok(Progress::Next);
        }

        let total = transfer.total;
        let written = transfer.offset;
        let blocks = transfer.blocks;
        if total.map_or(false, |total| total != written) {
            return Err(CancelReason::BlockOption);
        }
        self.finalize(store, written, blocks)
    }

    fn finalize(
        &mut self,
        store: &mut dyn FirmwareStore,
        written: u64,
        blocks: u32,
    ) -> Result<Progress, CancelReason> {
        let info = store.finish().map_err(|e| {
            warn!("finishing image failed: {}", e);
            CancelReason::NotAvailable
        })?;
        let expected = self.resource.as_deref().and_then(version_of);
        if expected != Some(info.version.as_str()) {
            warn!(version = %info.version, ?expected, "image version mismatch");
            return Err(CancelReason::NotAvailable);
        }
        store.request_upgrade().map_err(|e| {
            warn!("staging upgrade failed: {}", e);
            CancelReason::NotAvailable
        })?;

        info!(version = %info.version, size = written, blocks, "firmware download finished");
        self.downloading = false;
        self.download_requested = false;
        self.ready = true;
        Ok(Progress::Finished { apply: self.apply })
    }

    /// Stop the download
    ///
    /// Idempotent. A running download or a staged image yields an [`Abort`]; while the staging
    /// area is still being erased the abort is deferred to [`Update::erase_complete`].
    pub fn cancel(&mut self, reason: CancelReason) -> Option<Abort> {
        if self.canceled {
            return None;
        }
        if self.downloading {
            warn!(%reason, "firmware download canceled");
            self.downloading = false;
            self.download_requested = false;
            self.ready = false;
            self.canceled = true;
            self.reason = Some(reason);
            return match self.erasing {
                true => None,
                false => Some(Abort(())),
            };
        }
        if self.ready {
            info!(%reason, "staged firmware discarded");
            self.ready = false;
            self.apply = false;
            self.canceled = true;
            self.reason = Some(reason);
            return Some(Abort(()));
        }
        None
    }

    /// Reboot into the staged image, or arrange to once the download finishes
    pub fn apply(&mut self) -> Result<ApplyAction, UpdateError> {
        if self.ready {
            return Ok(ApplyAction::RebootNow);
        }
        if self.downloading {
            self.apply = true;
            return Ok(ApplyAction::OnFinish);
        }
        Err(UpdateError::NotReady)
    }

    /// Whether a download is running
    pub fn is_downloading(&self) -> bool {
        self.downloading
    }

    /// Whether a block response would be stored, which also means no erase is running
    pub fn awaits_block(&self) -> bool {
        self.downloading && !self.erasing
    }

    /// Snapshot for status queries
    pub fn status(&self) -> Status {
        let phase = if self.erasing && self.downloading {
            Phase::Erasing
        } else if self.downloading {
            Phase::Downloading
        } else if self.ready {
            Phase::Ready
        } else if self.canceled {
            Phase::Canceled
        } else {
            Phase::Idle
        };
        Status {
            phase,
            resource: self.resource.clone(),
            offset: self.transfer.as_ref().map_or(0, |t| t.offset),
            total: self.transfer.as_ref().and_then(|t| t.total),
            apply: self.apply,
            reason: self.reason,
        }
    }
}

/// Version named by a resource identifier: its last path segment
fn version_of(resource: &str) -> Option<&str> {
    resource.rsplit('/').next().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::{OptionNumber, Tag};

    #[derive(Default)]
    struct MockStore {
        erased: usize,
        written: Vec<u8>,
        writes: usize,
        aborts: usize,
        upgrades: usize,
        version: String,
    }

    impl FirmwareStore for MockStore {
        fn erase(&mut self) -> io::Result<()> {
            self.erased += 1;
            Ok(())
        }
        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.writes += 1;
            self.written.extend_from_slice(data);
            Ok(())
        }
        fn finish(&mut self) -> io::Result<ImageInfo> {
            Ok(ImageInfo {
                version: self.version.clone(),
                size: self.written.len() as u64,
            })
        }
        fn abort(&mut self) {
            self.aborts += 1;
            self.upgrades = 0;
        }
        fn request_upgrade(&mut self) -> io::Result<()> {
            self.upgrades += 1;
            Ok(())
        }
        fn is_confirmed(&self) -> bool {
            true
        }
        fn confirm(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const RESOURCE: &str = "box-1.4.0";

    fn start(apply: bool) -> (Update, MockStore) {
        let mut update = Update::new(UpdateConfig::default());
        let mut store = MockStore {
            version: RESOURCE.into(),
            ..MockStore::default()
        };
        update.download(RESOURCE, apply).unwrap();
        assert!(update.pending_request().is_none());
        store.erase().unwrap();
        assert!(matches!(update.erase_complete(Ok(())), Erased::Ready));
        (update, store)
    }

    fn block(num: u32, more: bool, len: usize, total: u32) -> Message {
        let mut msg = Message::new(Type::Acknowledgement, Code::CONTENT);
        msg.set_content_format(42).set_block2(Block::new(num, more, 5).unwrap());
        msg.options.push_uint(OptionNumber::SIZE2, total);
        msg.options
            .push(OptionNumber::ETAG, Bytes::from_static(&[1, 2, 3, 4]));
        msg.payload = Bytes::from(vec![num as u8; len]);
        msg
    }

    #[test]
    fn first_request_targets_offset_zero() {
        let (update, _) = start(false);
        let req = update.pending_request().unwrap();
        assert_eq!(req.uri_path(), "fw/box-1.4.0");
        assert_eq!(req.block2(), Some(Ok(Block::new(0, false, 5).unwrap())));
    }

    #[test]
    fn complete_transfer_without_apply() {
        let (mut update, mut store) = start(false);
        update.requested();
        assert!(matches!(
            update.handle_response(&block(0, true, 512, 700), &mut store),
            Progress::Next
        ));
        let req = update.pending_request().unwrap();
        assert_eq!(req.block2(), Some(Ok(Block::new(1, false, 5).unwrap())));
        update.requested();
        assert!(matches!(
            update.handle_response(&block(1, false, 188, 700), &mut store),
            Progress::Finished { apply: false }
        ));
        assert_eq!(store.written.len(), 700);
        assert_eq!(store.upgrades, 1);
        assert_eq!(update.status().phase, Phase::Ready);
        assert_eq!(update.apply().unwrap(), ApplyAction::RebootNow);
    }

    #[test]
    fn finish_with_apply() {
        let (mut update, mut store) = start(true);
        assert!(matches!(
            update.handle_response(&block(0, false, 100, 100), &mut store),
            Progress::Finished { apply: true }
        ));
    }

    #[test]
    fn out_of_order_block_keeps_offset() {
        let (mut update, mut store) = start(false);
        update.handle_response(&block(0, true, 512, 4096), &mut store);
        let progress = update.handle_response(&block(2, true, 512, 4096), &mut store);
        assert!(matches!(progress, Progress::Canceled(CancelReason::BlockNo, Some(_))));
        let status = update.status();
        assert_eq!(status.offset, 512);
        assert_eq!(status.reason, Some(CancelReason::BlockNo));
        assert_eq!(store.writes, 1);
    }

    #[test]
    fn changes_between_blocks() {
        for n in 1..4 {
            let (mut update, mut store) = start(false);
            for i in 0..n {
                update.handle_response(&block(i, true, 512, 8192), &mut store);
            }
            let mut changed = block(n, true, 512, 8192);
            changed.set_content_format(50);
            let progress = update.handle_response(&changed, &mut store);
            assert!(matches!(progress, Progress::Canceled(CancelReason::Changed, _)));

            let (mut update, mut store) = start(false);
            for i in 0..n {
                update.handle_response(&block(i, true, 512, 8192), &mut store);
            }
            let mut changed = block(n, true, 512, 8192);
            changed.options.remove(OptionNumber::ETAG);
            changed
                .options
                .push(OptionNumber::ETAG, Bytes::copy_from_slice(&Tag::new(&[9])));
            let progress = update.handle_response(&changed, &mut store);
            assert!(matches!(progress, Progress::Canceled(CancelReason::Changed, _)));
        }
    }

    #[test]
    fn oversized_image_rejected_before_write() {
        let (mut update, mut store) = start(false);
        let progress = update.handle_response(&block(0, true, 512, 0x71000), &mut store);
        assert!(matches!(progress, Progress::Canceled(CancelReason::BlockOption, _)));
        assert_eq!(store.writes, 0);
    }

    #[test]
    fn short_intermediate_block() {
        let (mut update, mut store) = start(false);
        let progress = update.handle_response(&block(0, true, 100, 4096), &mut store);
        assert!(matches!(progress, Progress::Canceled(CancelReason::BlockOption, _)));
    }

    #[test]
    fn error_status_and_missing_block_option() {
        let (mut update, mut store) = start(false);
        let mut refused = block(0, true, 0, 0);
        refused.code = Code::NOT_FOUND;
        assert!(matches!(
            update.handle_response(&refused, &mut store),
            Progress::Canceled(CancelReason::NoContent, _)
        ));

        let (mut update, mut store) = start(false);
        update.handle_response(&block(0, true, 512, 4096), &mut store);
        let mut bare = block(1, true, 512, 4096);
        bare.options.remove(OptionNumber::BLOCK2);
        assert!(matches!(
            update.handle_response(&bare, &mut store),
            Progress::Canceled(CancelReason::BlockOption, _)
        ));
    }

    #[test]
    fn version_mismatch_is_not_available() {
        let (mut update, mut store) = start(true);
        store.version = "box-1.3.9".into();
        assert!(matches!(
            update.handle_response(&block(0, false, 10, 10), &mut store),
            Progress::Canceled(CancelReason::NotAvailable, _)
        ));
        assert_eq!(store.upgrades, 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (mut update, mut store) = start(false);
        update.handle_response(&block(0, true, 512, 4096), &mut store);
        if let Some(abort) = update.cancel(CancelReason::Command) {
            abort.apply(&mut store);
        }
        assert!(update.cancel(CancelReason::Changed).is_none());
        assert_eq!(store.aborts, 1);
        assert_eq!(update.status().reason, Some(CancelReason::Command));
        assert!(update.pending_request().is_none());
        assert!(matches!(
            update.handle_response(&block(1, true, 512, 4096), &mut store),
            Progress::Ignored
        ));
    }

    #[test]
    fn cancel_during_erase_defers_abort() {
        let mut update = Update::new(UpdateConfig::default());
        update.download(RESOURCE, false).unwrap();
        assert!(update.cancel(CancelReason::Command).is_none());
        assert!(matches!(
            update.erase_complete(Ok(())),
            Erased::Canceled(Some(_))
        ));
        assert!(update.pending_request().is_none());
    }

    #[test]
    fn download_refused_until_erase_reported() {
        let mut update = Update::new(UpdateConfig::default());
        update.download(RESOURCE, false).unwrap();
        assert!(update.cancel(CancelReason::Command).is_none());
        assert_eq!(update.download("box-1.5.0", false), Err(UpdateError::Busy));
        assert!(update.pending_request().is_none());
        assert!(!update.awaits_block());

        assert!(matches!(
            update.erase_complete(Ok(())),
            Erased::Canceled(Some(_))
        ));
        update.download("box-1.5.0", false).unwrap();
        assert!(update.pending_request().is_none());
        assert_eq!(update.status().phase, Phase::Erasing);
        assert!(!update.awaits_block());
        assert!(matches!(update.erase_complete(Ok(())), Erased::Ready));
        assert!(update.awaits_block());
        assert_eq!(
            update.pending_request().unwrap().uri_path(),
            "fw/box-1.5.0"
        );
    }

    #[test]
    fn cancel_withdraws_staged_image() {
        let (mut update, mut store) = start(true);
        assert!(matches!(
            update.handle_response(&block(0, false, 100, 100), &mut store),
            Progress::Finished { apply: true }
        ));
        assert_eq!(store.upgrades, 1);

        update
            .cancel(CancelReason::Command)
            .expect("staged image yields an abort")
            .apply(&mut store);
        assert_eq!(store.aborts, 1);
        assert_eq!(store.upgrades, 0);
        assert!(update.cancel(CancelReason::Command).is_none());
        let status = update.status();
        assert_eq!(status.phase, Phase::Canceled);
        assert!(!status.apply);
        assert_eq!(update.apply(), Err(UpdateError::NotReady));
    }

    #[test]
    fn download_commands() {
        let mut update = Update::new(UpdateConfig::default());
        assert_eq!(update.apply(), Err(UpdateError::NotReady));
        assert!(matches!(
            update.download("fw/", false),
            Err(UpdateError::InvalidResource(_))
        ));
        update.download("/ota/box-2.0", false).unwrap();
        assert_eq!(update.download("box-2.1", false), Err(UpdateError::Busy));
        assert_eq!(update.apply(), Ok(ApplyAction::OnFinish));
        assert_eq!(update.status().to_string(), "erasing /ota/box-2.0, apply");
    }

    #[test]
    fn reason_names_and_codes() {
        assert_eq!(CancelReason::BlockNo.as_str(), "block number");
        assert_eq!(CancelReason::BlockNo.code(), 6);
        assert_eq!(CancelReason::Command.code(), 1);
    }
}

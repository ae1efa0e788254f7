/*
 * Copyright (C) 2024 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! TrustZone-backed decryption of OEM update images through the SMC
//! moderator device. The image is staged in a buffer shared with the
//! secure world; metadata parsing and fragment decryption happen in
//! place via `SMCMOD_IOCTL_DECRYPT_CMD`.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

pub const SMCMOD_DEVICE: &str = "/dev/smcmod";

const SMCMOD_IOC_MAGIC: u8 = 0x97;
const SMCMOD_IOCTL_DECRYPT: u8 = 37;

/// Secure-channel service and command ids.
const SCM_SVC_SSD: u32 = 0x07;
const SSD_PARSE_MD_ID: u32 = 0x06;
const SSD_DECRYPT_IMG_FRAG_ID: u32 = 0x07;

const DECRYPT_REQ_OP_METADATA: u32 = 1;
const DECRYPT_REQ_OP_IMG_FRAG: u32 = 2;

/// Metadata parse statuses reported by the secure world.
pub const SSD_PMD_ENCRYPTED: u32 = 0;
pub const SSD_PMD_NOT_ENCRYPTED: u32 = 1;
pub const SSD_PMD_PARSING_INCOMPLETE: u32 = 6;

/// The parse window starts at the minimum header size and doubles while the
/// secure world reports an incomplete parse.
const SSD_HEADER_MIN_SIZE: u32 = 128;
const PARSE_GROWTH_FACTOR: u32 = 2;

#[derive(Clone, Copy)]
#[repr(C)]
struct MetadataRequest {
    len: u32,
    shared_fd: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct FragmentRequest {
    pub ctx_id: u32,
    pub last_frag: u32,
    pub frag_len: u32,
    pub shared_fd: u32,
    pub offset: u32,
}

#[repr(C)]
union DecryptRequestArgs {
    metadata: MetadataRequest,
    img_frag: FragmentRequest,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct MetadataResponse {
    pub status: u32,
    pub ctx_id: u32,
    pub end_offset: u32,
}

#[repr(C)]
union DecryptResponseArgs {
    metadata: MetadataResponse,
    img_frag_status: u32,
}

/// struct smcmod_decrypt_req as the kernel driver lays it out. The request
/// and response arguments are unions selected by `operation`; the accessors
/// below keep the unsafe reads in one place.
#[repr(C)]
pub struct SmcmodDecryptReq {
    service_id: u32,
    command_id: u32,
    operation: u32,
    request: DecryptRequestArgs,
    response: DecryptResponseArgs,
}

impl SmcmodDecryptReq {
    fn parse_metadata(len: u32, shared_fd: u32) -> Self {
        SmcmodDecryptReq {
            service_id: SCM_SVC_SSD,
            command_id: SSD_PARSE_MD_ID,
            operation: DECRYPT_REQ_OP_METADATA,
            request: DecryptRequestArgs { metadata: MetadataRequest { len, shared_fd } },
            response: DecryptResponseArgs { img_frag_status: 0 },
        }
    }

    fn decrypt_fragment(ctx_id: u32, frag_len: u32, offset: u32, shared_fd: u32) -> Self {
        SmcmodDecryptReq {
            service_id: SCM_SVC_SSD,
            command_id: SSD_DECRYPT_IMG_FRAG_ID,
            operation: DECRYPT_REQ_OP_IMG_FRAG,
            request: DecryptRequestArgs {
                img_frag: FragmentRequest { ctx_id, last_frag: 1, frag_len, shared_fd, offset },
            },
            response: DecryptResponseArgs { img_frag_status: 0 },
        }
    }

    pub fn is_metadata_parse(&self) -> bool {
        self.operation == DECRYPT_REQ_OP_METADATA
    }

    /// Length of the metadata window submitted for parsing.
    pub fn metadata_len(&self) -> u32 {
        // All union fields are plain u32s, every bit pattern is valid.
        unsafe { self.request.metadata.len }
    }

    fn set_metadata_len(&mut self, len: u32) {
        self.request.metadata.len = len;
    }

    pub fn fragment(&self) -> FragmentRequest {
        unsafe { self.request.img_frag }
    }

    pub fn set_metadata_response(&mut self, response: MetadataResponse) {
        self.response = DecryptResponseArgs { metadata: response };
    }

    fn metadata_response(&self) -> MetadataResponse {
        unsafe { self.response.metadata }
    }

    pub fn set_fragment_status(&mut self, status: u32) {
        self.response = DecryptResponseArgs { img_frag_status: status };
    }

    fn fragment_status(&self) -> u32 {
        unsafe { self.response.img_frag_status }
    }
}

nix::ioctl_readwrite!(smcmod_decrypt_cmd, SMCMOD_IOC_MAGIC, SMCMOD_IOCTL_DECRYPT, SmcmodDecryptReq);

/// An anonymous shared mapping the secure world accesses by fd. Stands in
/// for the ION carveout the driver historically required.
pub struct SharedBuffer {
    file: File,
    len: u32,
}

impl SharedBuffer {
    pub fn new(len: u32) -> Result<Self> {
        let fd = memfd_create(c"ssd_image", MemFdCreateFlag::empty())
            .context("Failed to allocate shared image buffer")?;
        let file = File::from(fd);
        // The secure world maps whole pages.
        file.set_len(u64::from(len).next_multiple_of(4096))
            .context("Failed to size shared image buffer")?;
        Ok(SharedBuffer { file, len })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn raw_fd(&self) -> u32 {
        self.file.as_raw_fd() as u32
    }

    pub fn write_at(&self, data: &[u8], offset: u32) -> Result<()> {
        self.file
            .write_all_at(data, u64::from(offset))
            .context("Failed to write shared image buffer")
    }

    pub fn read_at(&self, data: &mut [u8], offset: u32) -> Result<()> {
        self.file
            .read_exact_at(data, u64::from(offset))
            .context("Failed to read shared image buffer")
    }
}

/// One `SMCMOD_IOCTL_DECRYPT_CMD` round trip. The buffer rides along so test
/// doubles can act on the staged image the way the secure world does.
pub trait DecryptChannel {
    fn call(&mut self, req: &mut SmcmodDecryptReq, buf: &SharedBuffer) -> Result<()>;
}

pub struct SmcmodDevice {
    file: File,
}

impl SmcmodDevice {
    pub fn open() -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(SMCMOD_DEVICE)
            .with_context(|| format!("Failed to open {SMCMOD_DEVICE}"))?;
        Ok(SmcmodDevice { file })
    }
}

impl DecryptChannel for SmcmodDevice {
    fn call(&mut self, req: &mut SmcmodDecryptReq, _buf: &SharedBuffer) -> Result<()> {
        // SAFETY: req is a valid smcmod_decrypt_req and outlives the call.
        unsafe { smcmod_decrypt_cmd(self.file.as_raw_fd(), req) }
            .context("SMCMOD decrypt ioctl failed")?;
        Ok(())
    }
}

/// Outcome of the metadata parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncryption {
    /// ctx_id names the parse context inside TrustZone; end_offset is where
    /// the encrypted payload starts in the staged image.
    Encrypted { ctx_id: u32, end_offset: u32 },
    NotEncrypted,
}

pub struct SsdDecryptor<C: DecryptChannel> {
    channel: C,
}

impl<C: DecryptChannel> SsdDecryptor<C> {
    pub fn new(channel: C) -> Self {
        SsdDecryptor { channel }
    }

    /// Submits a growing head of the staged image for metadata parsing until
    /// the secure world stops reporting an incomplete parse.
    pub fn parse_metadata(&mut self, buf: &SharedBuffer) -> Result<ImageEncryption> {
        let mut req =
            SmcmodDecryptReq::parse_metadata(buf.len().min(SSD_HEADER_MIN_SIZE), buf.raw_fd());
        loop {
            self.channel.call(&mut req, buf)?;
            let response = req.metadata_response();
            match response.status {
                SSD_PMD_ENCRYPTED => {
                    return Ok(ImageEncryption::Encrypted {
                        ctx_id: response.ctx_id,
                        end_offset: response.end_offset,
                    });
                }
                SSD_PMD_NOT_ENCRYPTED => return Ok(ImageEncryption::NotEncrypted),
                SSD_PMD_PARSING_INCOMPLETE => {
                    let len = req.metadata_len().saturating_mul(PARSE_GROWTH_FACTOR);
                    if len > buf.len() {
                        bail!("Metadata parse ran past the image ({} > {})", len, buf.len());
                    }
                    req.set_metadata_len(len);
                }
                status => bail!("Unexpected metadata parse status {status}"),
            }
        }
    }

    /// Decrypts the payload in place as a single final fragment.
    fn decrypt_payload(&mut self, buf: &SharedBuffer, ctx_id: u32, offset: u32) -> Result<()> {
        let mut req =
            SmcmodDecryptReq::decrypt_fragment(ctx_id, buf.len() - offset, offset, buf.raw_fd());
        self.channel.call(&mut req, buf)?;
        let status = req.fragment_status();
        if status != 0 {
            bail!("Fragment decryption failed with status {status}");
        }
        Ok(())
    }

    /// Stages `image`, parses its metadata and returns the decrypted
    /// payload, or None when the image is not encrypted.
    pub fn decrypt_image(&mut self, image: &[u8]) -> Result<Option<Vec<u8>>> {
        if image.is_empty() {
            bail!("Image is empty");
        }
        let len = u32::try_from(image.len()).context("Image too large")?;
        let buf = SharedBuffer::new(len)?;
        buf.write_at(image, 0)?;

        let (ctx_id, offset) = match self.parse_metadata(&buf)? {
            ImageEncryption::Encrypted { ctx_id, end_offset } => (ctx_id, end_offset),
            ImageEncryption::NotEncrypted => {
                warn!("Image is not encrypted");
                return Ok(None);
            }
        };
        if offset >= len {
            bail!("Metadata end offset {offset} is past the image end {len}");
        }

        self.decrypt_payload(&buf, ctx_id, offset)?;

        let mut payload = vec![0u8; (len - offset) as usize];
        buf.read_at(&mut payload, offset)?;
        Ok(Some(payload))
    }
}

/// One-shot decryption of `src` into `dst`. Fails when the image is not
/// encrypted; an unencrypted image needs no recovery step.
pub fn decrypt_file<C: DecryptChannel>(channel: C, src: &Path, dst: &Path) -> Result<()> {
    let image =
        std::fs::read(src).with_context(|| format!("Failed to read {}", src.display()))?;
    info!("decrypting {} ...", src.display());
    let payload = SsdDecryptor::new(channel)
        .decrypt_image(&image)?
        .with_context(|| format!("{} is not encrypted", src.display()))?;
    std::fs::write(dst, &payload)
        .with_context(|| format!("Failed to write {}", dst.display()))?;
    info!("{} written {} bytes", dst.display(), payload.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pretends to be the secure world: demands `header_len` bytes of
    /// metadata before declaring the image encrypted, then "decrypts" by
    /// XORing the payload with a fixed key.
    struct FakeTrustZone {
        header_len: u32,
        encrypted: bool,
        parse_calls: u32,
        seen_lens: Vec<u32>,
    }

    const KEY: u8 = 0x5a;
    const CTX: u32 = 77;

    impl FakeTrustZone {
        fn new(header_len: u32, encrypted: bool) -> Self {
            FakeTrustZone { header_len, encrypted, parse_calls: 0, seen_lens: Vec::new() }
        }
    }

    impl DecryptChannel for FakeTrustZone {
        fn call(&mut self, req: &mut SmcmodDecryptReq, buf: &SharedBuffer) -> Result<()> {
            if req.is_metadata_parse() {
                self.parse_calls += 1;
                self.seen_lens.push(req.metadata_len());
                let status = if !self.encrypted {
                    SSD_PMD_NOT_ENCRYPTED
                } else if req.metadata_len() < self.header_len {
                    SSD_PMD_PARSING_INCOMPLETE
                } else {
                    SSD_PMD_ENCRYPTED
                };
                req.set_metadata_response(MetadataResponse {
                    status,
                    ctx_id: CTX,
                    end_offset: self.header_len,
                });
            } else {
                let frag = req.fragment();
                assert_eq!(frag.ctx_id, CTX);
                assert_eq!(frag.last_frag, 1);
                let mut data = vec![0u8; frag.frag_len as usize];
                buf.read_at(&mut data, frag.offset).unwrap();
                for byte in &mut data {
                    *byte ^= KEY;
                }
                buf.write_at(&data, frag.offset).unwrap();
                req.set_fragment_status(0);
            }
            Ok(())
        }
    }

    fn encrypted_image(header_len: u32, payload: &[u8]) -> Vec<u8> {
        let mut image = vec![0xaau8; header_len as usize];
        image.extend(payload.iter().map(|b| b ^ KEY));
        image
    }

    #[test]
    fn small_header_parses_in_one_call() {
        let payload_in = [0x11u8; 100];
        let image = encrypted_image(100, &payload_in);
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(100, true));
        let payload = decryptor.decrypt_image(&image).unwrap().unwrap();
        assert_eq!(payload, payload_in);
        assert_eq!(decryptor.channel.parse_calls, 1);
        // The first window never exceeds the minimum header size.
        assert_eq!(decryptor.channel.seen_lens, vec![SSD_HEADER_MIN_SIZE]);
    }

    #[test]
    fn parse_window_doubles_until_the_header_fits() {
        let payload_in = [0x42u8; 50];
        let image = encrypted_image(500, &payload_in);
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(500, true));
        let payload = decryptor.decrypt_image(&image).unwrap().unwrap();
        assert_eq!(payload, payload_in);
        assert_eq!(decryptor.channel.seen_lens, vec![128, 256, 512]);
    }

    #[test]
    fn image_smaller_than_the_minimum_header_is_submitted_whole() {
        let buf = SharedBuffer::new(64).unwrap();
        buf.write_at(&[0u8; 64], 0).unwrap();
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(64, true));
        decryptor.parse_metadata(&buf).unwrap();
        assert_eq!(decryptor.channel.seen_lens, vec![64]);
    }

    #[test]
    fn unencrypted_image_is_reported_not_rewritten() {
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(128, false));
        let result = decryptor.decrypt_image(&[1u8; 256]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn parse_that_outgrows_the_image_is_an_error() {
        // The fake keeps demanding more metadata than the image holds.
        let image = vec![0u8; 256];
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(4096, true));
        assert!(decryptor.decrypt_image(&image).is_err());
    }

    #[test]
    fn offset_past_the_image_end_is_an_error() {
        let image = vec![0u8; 100];
        // Claims a 100-byte header on a 100-byte image: no payload remains.
        let mut decryptor = SsdDecryptor::new(FakeTrustZone::new(100, true));
        assert!(decryptor.decrypt_image(&image).is_err());
    }

    #[test]
    fn decrypt_file_round_trips_through_the_filesystem() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("update.img");
        let dst = dir.path().join("update.dec");
        std::fs::write(&src, encrypted_image(128, b"recovery payload")).unwrap();
        decrypt_file(FakeTrustZone::new(128, true), &src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"recovery payload");
    }

    #[test]
    fn shared_buffer_length_is_page_rounded_but_logical_len_kept() {
        let buf = SharedBuffer::new(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.file.metadata().unwrap().len(), 4096);
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reply packing
//!
//! [`ReplyBuilder`] appends typed fields to a growable buffer and writes
//! the generation-appropriate header up front. Directory search replies
//! append variable-size records; the `next_entry_offset` chain is stitched
//! as records are appended and the versioned header's `packet_size` is
//! backpatched at [`ReplyBuilder::finish`], so handlers never perform
//! offset arithmetic themselves.

use crate::messages::{HeaderGen, HEADER_VERSION, HGFS_HEADER_SIZE, NEW_HEADER};
use crate::status::HgfsStatus;
use crate::wire::WireWriter;

/// File type values used in reply attribute blocks.
pub const FILE_TYPE_REGULAR: u32 = 0;
pub const FILE_TYPE_DIRECTORY: u32 = 1;
pub const FILE_TYPE_SYMLINK: u32 = 2;

/// Attribute block carried by getattr and search-read replies, 64 bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireAttr {
    pub file_type: u32,
    pub size: u64,
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub volume_id: u64,
    pub file_id: u64,
}

const WIRE_ATTR_SIZE: usize = 64;
const LEGACY_REPLY_HEADER_SIZE: usize = 12;

/// Builder for one reply packet.
pub struct ReplyBuilder {
    w: WireWriter,
    gen: HeaderGen,
    max_size: usize,
    dirent_count_off: Option<usize>,
    prev_entry_off: Option<usize>,
    num_entries: u32,
}

impl ReplyBuilder {
    /// Starts a reply. `max_size` bounds the finished packet; directory
    /// records that would exceed it are refused by [`Self::push_dirent`].
    pub fn new(
        gen: HeaderGen,
        op_value: u32,
        request_id: u32,
        session_id: Option<u64>,
        status: HgfsStatus,
        max_size: usize,
    ) -> Self {
        let mut w = WireWriter::new();
        match gen {
            HeaderGen::V4 => {
                w.put_u8(HEADER_VERSION);
                w.put_bytes(&[0; 3]);
                w.put_u32(NEW_HEADER);
                w.put_u32(0); // packet_size, patched in finish()
                w.put_u32(HGFS_HEADER_SIZE as u32);
                w.put_u32(op_value);
                w.put_u32(request_id);
                w.put_u32(status as u32);
                w.put_u32(0); // flags
                w.put_u32(0); // information
                w.put_u64(session_id.unwrap_or(0));
                w.put_u32(0); // reserved
            }
            _ => {
                w.put_u32(request_id);
                w.put_u32(op_value);
                w.put_u32(status as u32);
            }
        }
        Self {
            w,
            gen,
            max_size,
            dirent_count_off: None,
            prev_entry_off: None,
            num_entries: 0,
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        self.w.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.w.put_u64(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.w.put_bytes(v);
    }

    pub fn put_counted(&mut self, v: &[u8]) {
        self.w.put_counted(v);
    }

    pub fn put_attr(&mut self, attr: &WireAttr) {
        self.w.put_u32(attr.file_type);
        self.w.put_u64(attr.size);
        self.w.put_u32(attr.perms);
        self.w.put_u32(attr.uid);
        self.w.put_u32(attr.gid);
        self.w.put_u64(attr.atime);
        self.w.put_u64(attr.mtime);
        self.w.put_u64(attr.ctime);
        self.w.put_u64(attr.volume_id);
        self.w.put_u64(attr.file_id);
    }

    /// Reserves the entry-count field of a search-read reply.
    pub fn begin_dirents(&mut self) {
        self.dirent_count_off = Some(self.w.len());
        self.w.put_u32(0);
    }

    /// Appends one directory record, linking it into the
    /// `next_entry_offset` chain. Returns `false` without writing when the
    /// record would push the packet past `max_size`; the caller ends the
    /// page early instead of overflowing the negotiated buffer.
    pub fn push_dirent(&mut self, attr: &WireAttr, name: &str) -> bool {
        let mut record = 4 + WIRE_ATTR_SIZE + 4 + name.len();
        record += (8 - record % 8) % 8;
        if self.w.len() + record > self.max_size {
            return false;
        }

        let entry_off = self.w.len();
        if let Some(prev) = self.prev_entry_off {
            self.w.patch_u32(prev, (entry_off - prev) as u32);
        }
        self.prev_entry_off = Some(entry_off);

        self.w.put_u32(0); // next_entry_offset, patched by the next record
        self.put_attr(attr);
        self.w.put_counted(name.as_bytes());
        self.w.pad_to(8);
        self.num_entries += 1;
        true
    }

    pub fn num_dirents(&self) -> u32 {
        self.num_entries
    }

    /// Finalizes counts and the versioned header's packet size.
    pub fn finish(mut self) -> Vec<u8> {
        if let Some(off) = self.dirent_count_off {
            self.w.patch_u32(off, self.num_entries);
        }
        if self.gen == HeaderGen::V4 {
            let total = self.w.len() as u32;
            self.w.patch_u32(8, total);
        }
        self.w.into_vec()
    }
}

/// Packs a body-less reply carrying only a status.
pub fn pack_error_reply(
    gen: HeaderGen,
    op_value: u32,
    request_id: u32,
    session_id: Option<u64>,
    status: HgfsStatus,
) -> Vec<u8> {
    ReplyBuilder::new(gen, op_value, request_id, session_id, status, usize::MAX).finish()
}

/// Decoded reply header, used by tests and client-side tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub request_id: u32,
    pub op_value: u32,
    pub status: u32,
    pub body_offset: usize,
}

/// Splits a reply buffer into its header and body for the given
/// generation. Mirror of the header layouts written by [`ReplyBuilder`].
pub fn unpack_reply_header(gen: HeaderGen, buf: &[u8]) -> Option<ReplyHeader> {
    match gen {
        HeaderGen::V4 => {
            if buf.len() < HGFS_HEADER_SIZE {
                return None;
            }
            Some(ReplyHeader {
                request_id: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
                op_value: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
                status: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
                body_offset: HGFS_HEADER_SIZE,
            })
        }
        _ => {
            if buf.len() < LEGACY_REPLY_HEADER_SIZE {
                return None;
            }
            Some(ReplyHeader {
                request_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
                op_value: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
                status: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
                body_offset: LEGACY_REPLY_HEADER_SIZE,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Opcode;

    fn attr(file_id: u64) -> WireAttr {
        WireAttr {
            file_type: FILE_TYPE_REGULAR,
            size: 10,
            perms: 0o644,
            file_id,
            ..Default::default()
        }
    }

    #[test]
    fn legacy_reply_header() {
        let buf = pack_error_reply(
            HeaderGen::V1,
            Opcode::Open as u32,
            5,
            None,
            HgfsStatus::AccessDenied,
        );
        let hdr = unpack_reply_header(HeaderGen::V1, &buf).unwrap();
        assert_eq!(hdr.request_id, 5);
        assert_eq!(hdr.op_value, Opcode::Open as u32);
        assert_eq!(hdr.status, HgfsStatus::AccessDenied as u32);
        assert_eq!(buf.len(), hdr.body_offset);
    }

    #[test]
    fn v4_packet_size_is_backpatched() {
        let mut b = ReplyBuilder::new(
            HeaderGen::V4,
            Opcode::ReadV3 as u32,
            1,
            Some(2),
            HgfsStatus::Success,
            usize::MAX,
        );
        b.put_counted(b"hello");
        let buf = b.finish();
        let packet_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        assert_eq!(packet_size as usize, buf.len());
        let hdr = unpack_reply_header(HeaderGen::V4, &buf).unwrap();
        assert_eq!(hdr.status, 0);
        assert_eq!(&buf[hdr.body_offset + 4..], b"hello");
    }

    #[test]
    fn dirent_chain_offsets() {
        let mut b = ReplyBuilder::new(
            HeaderGen::V4,
            Opcode::SearchReadV4 as u32,
            1,
            Some(1),
            HgfsStatus::Success,
            usize::MAX,
        );
        b.begin_dirents();
        assert!(b.push_dirent(&attr(1), "a"));
        assert!(b.push_dirent(&attr(2), "longer-name"));
        assert!(b.push_dirent(&attr(3), "z"));
        let buf = b.finish();

        let body = HGFS_HEADER_SIZE;
        let count = u32::from_le_bytes(buf[body..body + 4].try_into().unwrap());
        assert_eq!(count, 3);

        // walk the chain: every link lands inside the buffer, last is zero
        let mut off = body + 4;
        let mut seen = 0;
        loop {
            let next = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            let name_len =
                u32::from_le_bytes(buf[off + 4 + 64..off + 4 + 64 + 4].try_into().unwrap());
            assert!(name_len > 0);
            seen += 1;
            if next == 0 {
                break;
            }
            off += next as usize;
            assert!(off + 4 + 64 + 4 <= buf.len());
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn dirent_page_respects_max_size() {
        let mut b = ReplyBuilder::new(
            HeaderGen::V4,
            Opcode::SearchReadV4 as u32,
            1,
            Some(1),
            HgfsStatus::Success,
            HGFS_HEADER_SIZE + 4 + 96, // room for roughly one record
        );
        b.begin_dirents();
        assert!(b.push_dirent(&attr(1), "first"));
        assert!(!b.push_dirent(&attr(2), "second"));
        let buf = b.finish();
        let body = HGFS_HEADER_SIZE;
        let count = u32::from_le_bytes(buf[body..body + 4].try_into().unwrap());
        assert_eq!(count, 1);
    }
}

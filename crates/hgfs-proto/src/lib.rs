// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HGFS wire protocol — headers, opcodes and packet pack/unpack
//!
//! This crate defines the four header generations of the host/guest
//! shared-file-system protocol, validates raw request buffers, and packs
//! replies. All parsing is bounds-checked; a malformed packet can only
//! produce a typed error, never an out-of-range read.

pub mod messages;
pub mod reply;
pub mod status;
pub mod wire;

// Re-export key types
pub use messages::{
    unpack_header,
    unpack_request,
    AttrUpdate,
    CapabilityEntry,
    CloseRequest,
    CreateDirRequest,
    CreateSessionRequest,
    DeleteRequest,
    GetattrRequest,
    HeaderError,
    HeaderGen,
    Opcode,
    OpenMode,
    OpenRequest,
    PacketIn,
    ProtoError,
    QueryVolumeRequest,
    ReadRequest,
    RenameRequest,
    Request,
    SearchCloseRequest,
    SearchOpenRequest,
    SearchReadRequest,
    ServerLockChangeRequest,
    SetattrRequest,
    SymlinkCreateRequest,
    Target,
    WireLock,
    WireName,
    WriteRequest,
    ATTR_ATIME,
    ATTR_GID,
    ATTR_MTIME,
    ATTR_PERMS,
    ATTR_SIZE,
    ATTR_UID,
    HEADER_VERSION,
    HGFS_HEADER_SIZE,
    HINT_USE_HANDLE,
    LEGACY_HEADER_SIZE,
    NEW_HEADER,
    OPEN_APPEND,
    OPEN_CREATE,
    OPEN_EXCLUSIVE,
    OPEN_TRUNCATE,
    RENAME_NO_REPLACE_EXISTING,
    SEARCH_READ_RESTART,
    WRITE_APPEND,
};
pub use reply::{
    pack_error_reply, unpack_reply_header, ReplyBuilder, ReplyHeader, WireAttr,
    FILE_TYPE_DIRECTORY, FILE_TYPE_REGULAR, FILE_TYPE_SYMLINK,
};
pub use status::HgfsStatus;
pub use wire::{validate_request_size, WireError, WireReader, WireResult, WireWriter};

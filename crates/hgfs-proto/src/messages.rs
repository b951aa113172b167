// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HGFS request types and unpacking
//!
//! Opcodes are partitioned into four generations by value range. Legacy
//! packets (generations 1-3) start with an 8-byte `{request_id, op}`
//! prefix; session-capable clients wrap every operation in the versioned
//! 48-byte header introduced by the `NEW_HEADER` sentinel in the legacy
//! op field position.
//!
//! [`unpack_header`] performs generation dispatch exactly once and hands
//! back a validated payload slice; [`unpack_request`] then produces one
//! [`Request`] variant per operation, so handlers consume typed parameters
//! through exhaustive matching and never re-check buffer bounds.

use crate::status::HgfsStatus;
use crate::wire::{WireError, WireReader};
use thiserror::Error;

/// Sentinel in the legacy op field announcing the versioned header.
pub const NEW_HEADER: u32 = 0xff;
/// Size of the `{request_id, op}` prefix carried by generations 1-3.
pub const LEGACY_HEADER_SIZE: usize = 8;
/// Size of the versioned session header.
pub const HGFS_HEADER_SIZE: usize = 48;
/// Version byte the versioned header must carry.
pub const HEADER_VERSION: u8 = 1;

/// Operation codes, all generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    // Generation 1
    Open = 0,
    Read = 1,
    Write = 2,
    Close = 3,
    SearchOpen = 4,
    SearchRead = 5,
    SearchClose = 6,
    Getattr = 7,
    Setattr = 8,
    CreateDir = 9,
    DeleteFile = 10,
    DeleteDir = 11,
    Rename = 12,
    QueryVolumeInfo = 13,
    SymlinkCreate = 14,
    // Generation 2
    OpenV2 = 15,
    GetattrV2 = 16,
    SetattrV2 = 17,
    SearchReadV2 = 18,
    CreateDirV2 = 19,
    DeleteFileV2 = 20,
    DeleteDirV2 = 21,
    RenameV2 = 22,
    ServerLockChange = 23,
    // Generation 3
    OpenV3 = 24,
    ReadV3 = 25,
    WriteV3 = 26,
    CloseV3 = 27,
    SearchOpenV3 = 28,
    SearchReadV3 = 29,
    SearchCloseV3 = 30,
    GetattrV3 = 31,
    SetattrV3 = 32,
    CreateDirV3 = 33,
    DeleteFileV3 = 34,
    DeleteDirV3 = 35,
    RenameV3 = 36,
    QueryVolumeInfoV3 = 37,
    SymlinkCreateV3 = 38,
    ServerLockChangeV3 = 39,
    // Generation 4
    CreateSessionV4 = 40,
    DestroySessionV4 = 41,
    ReadFastV4 = 42,
    WriteFastV4 = 43,
    SetWatchV4 = 44,
    RemoveWatchV4 = 45,
    NotifyV4 = 46,
    SearchReadV4 = 47,
    SetEntryAttributesV4 = 48,
}

/// Header generation, decided by opcode value range (or by the sentinel
/// for generation 4 packets).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderGen {
    V1,
    V2,
    V3,
    V4,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        use Opcode::*;
        Some(match value {
            0 => Open,
            1 => Read,
            2 => Write,
            3 => Close,
            4 => SearchOpen,
            5 => SearchRead,
            6 => SearchClose,
            7 => Getattr,
            8 => Setattr,
            9 => CreateDir,
            10 => DeleteFile,
            11 => DeleteDir,
            12 => Rename,
            13 => QueryVolumeInfo,
            14 => SymlinkCreate,
            15 => OpenV2,
            16 => GetattrV2,
            17 => SetattrV2,
            18 => SearchReadV2,
            19 => CreateDirV2,
            20 => DeleteFileV2,
            21 => DeleteDirV2,
            22 => RenameV2,
            23 => ServerLockChange,
            24 => OpenV3,
            25 => ReadV3,
            26 => WriteV3,
            27 => CloseV3,
            28 => SearchOpenV3,
            29 => SearchReadV3,
            30 => SearchCloseV3,
            31 => GetattrV3,
            32 => SetattrV3,
            33 => CreateDirV3,
            34 => DeleteFileV3,
            35 => DeleteDirV3,
            36 => RenameV3,
            37 => QueryVolumeInfoV3,
            38 => SymlinkCreateV3,
            39 => ServerLockChangeV3,
            40 => CreateSessionV4,
            41 => DestroySessionV4,
            42 => ReadFastV4,
            43 => WriteFastV4,
            44 => SetWatchV4,
            45 => RemoveWatchV4,
            46 => NotifyV4,
            47 => SearchReadV4,
            48 => SetEntryAttributesV4,
            _ => return None,
        })
    }

    pub fn generation(self) -> HeaderGen {
        match self as u32 {
            0..=14 => HeaderGen::V1,
            15..=23 => HeaderGen::V2,
            24..=39 => HeaderGen::V3,
            _ => HeaderGen::V4,
        }
    }
}

/// Open mode (lower bits of the open request's mode field).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(OpenMode::ReadOnly),
            1 => Some(OpenMode::WriteOnly),
            2 => Some(OpenMode::ReadWrite),
            _ => None,
        }
    }

    pub fn writes(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Open flag bits.
pub const OPEN_CREATE: u32 = 1 << 0;
pub const OPEN_TRUNCATE: u32 = 1 << 1;
pub const OPEN_EXCLUSIVE: u32 = 1 << 2;
pub const OPEN_APPEND: u32 = 1 << 3;

/// Write flag bits.
pub const WRITE_APPEND: u32 = 1 << 0;

/// Addressing hint bit: the request carries a handle, not a name.
pub const HINT_USE_HANDLE: u32 = 1 << 0;

/// Rename hint bits.
pub const RENAME_NO_REPLACE_EXISTING: u32 = 1 << 0;

/// Search-read flag bits (generation 4).
pub const SEARCH_READ_RESTART: u32 = 1 << 0;

/// Attribute update mask bits.
pub const ATTR_SIZE: u32 = 1 << 0;
pub const ATTR_PERMS: u32 = 1 << 1;
pub const ATTR_UID: u32 = 1 << 2;
pub const ATTR_GID: u32 = 1 << 3;
pub const ATTR_ATIME: u32 = 1 << 4;
pub const ATTR_MTIME: u32 = 1 << 5;

/// Requested server lock, as encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireLock {
    None,
    Opportunistic,
    Shared,
    Exclusive,
}

impl WireLock {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(WireLock::None),
            1 => Some(WireLock::Opportunistic),
            2 => Some(WireLock::Shared),
            3 => Some(WireLock::Exclusive),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            WireLock::None => 0,
            WireLock::Opportunistic => 1,
            WireLock::Shared => 2,
            WireLock::Exclusive => 3,
        }
    }
}

/// Share-relative file name: NUL-separated components, share name first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireName {
    pub components: Vec<String>,
}

impl WireName {
    fn parse(raw: &str) -> Self {
        // An empty name addresses the share-list root and has no
        // components at all.
        let components = if raw.is_empty() {
            Vec::new()
        } else {
            raw.split('\0').map(str::to_string).collect()
        };
        Self { components }
    }

    pub fn share(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }

    /// Path components below the share root.
    pub fn relative(&self) -> &[String] {
        if self.components.is_empty() {
            &[]
        } else {
            &self.components[1..]
        }
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }
}

/// Either-handle-or-name addressing. The hint flag on the wire decides
/// which alternative is present; only that alternative is validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Handle(u64),
    Name(WireName),
}

/// Attribute changes requested by a setattr, 40 fixed bytes on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttrUpdate {
    pub mask: u32,
    pub size: u64,
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub mode: OpenMode,
    pub flags: u32,
    pub permissions: u32,
    pub desired_access: u32,
    pub desired_lock: WireLock,
    pub name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle: u64,
    pub offset: u64,
    pub required_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle: u64,
    pub offset: u64,
    pub flags: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    pub handle: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchOpenRequest {
    pub name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchReadRequest {
    pub handle: u64,
    /// Entry index for the non-consuming legacy read.
    pub offset: u32,
    /// Generation 4 only: consuming multi-record read.
    pub flags: u32,
    pub multi: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchCloseRequest {
    pub handle: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetattrRequest {
    pub target: Target,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetattrRequest {
    pub target: Target,
    pub update: AttrUpdate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateDirRequest {
    pub permissions: u32,
    pub name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    pub target: Target,
    pub is_dir: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameRequest {
    pub hints: u32,
    pub old_name: WireName,
    pub new_name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymlinkCreateRequest {
    pub link_name: WireName,
    pub target_name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryVolumeRequest {
    pub name: WireName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerLockChangeRequest {
    pub handle: u64,
    pub new_lock: WireLock,
}

/// One capability entry negotiated at session-create time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilityEntry {
    pub op: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub max_packet_size: u32,
    pub flags: u32,
    pub capabilities: Vec<CapabilityEntry>,
}

/// A fully unpacked request, one variant per operation. Produced exactly
/// once by [`unpack_request`]; version differences are resolved here so
/// handlers never see generation-specific layouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Open(OpenRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    Close(CloseRequest),
    SearchOpen(SearchOpenRequest),
    SearchRead(SearchReadRequest),
    SearchClose(SearchCloseRequest),
    Getattr(GetattrRequest),
    Setattr(SetattrRequest),
    CreateDir(CreateDirRequest),
    Delete(DeleteRequest),
    Rename(RenameRequest),
    SymlinkCreate(SymlinkCreateRequest),
    QueryVolume(QueryVolumeRequest),
    ServerLockChange(ServerLockChangeRequest),
    CreateSession(CreateSessionRequest),
    DestroySession,
}

/// Outcome of header validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketIn<'a> {
    pub gen: HeaderGen,
    pub op: Opcode,
    pub op_value: u32,
    pub request_id: u32,
    pub session_id: Option<u64>,
    pub payload: &'a [u8],
}

/// Header validation failure.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// Too little trustworthy data to construct any reply. The caller
    /// must drop the request silently.
    Drop(&'static str),
    /// Malformed but identifiable: reply with the given status.
    Reply {
        gen: HeaderGen,
        op_value: u32,
        request_id: u32,
        session_id: Option<u64>,
        status: HgfsStatus,
    },
}

/// Payload unpack failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] WireError),
    #[error("operation {0:?} not supported")]
    Unsupported(Opcode),
    #[error("invalid parameter in request")]
    InvalidParameter,
}

impl ProtoError {
    pub fn to_status(&self) -> HgfsStatus {
        match self {
            ProtoError::Malformed(_) => HgfsStatus::ProtocolError,
            ProtoError::Unsupported(_) => HgfsStatus::OperationNotSupported,
            ProtoError::InvalidParameter => HgfsStatus::InvalidParameter,
        }
    }
}

/// Validates the header of a raw request buffer and locates the payload.
///
/// Legacy packets: `{request_id: u32, op: u32}` then the op struct.
/// Versioned packets announce themselves with [`NEW_HEADER`] in the op
/// field position; `header_size <= packet_size <= buffer_len` is enforced
/// before any other header field is trusted.
pub fn unpack_header(buf: &[u8]) -> Result<PacketIn<'_>, HeaderError> {
    if buf.len() < LEGACY_HEADER_SIZE {
        return Err(HeaderError::Drop("packet shorter than minimal request"));
    }
    let op_field = u32::from_le_bytes(buf[4..8].try_into().unwrap());

    if op_field != NEW_HEADER {
        let request_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let Some(op) = Opcode::from_u32(op_field) else {
            return Err(HeaderError::Reply {
                gen: HeaderGen::V1,
                op_value: op_field,
                request_id,
                session_id: None,
                status: HgfsStatus::ProtocolError,
            });
        };
        let gen = op.generation();
        if gen == HeaderGen::V4 {
            // Generation 4 operations require the versioned header.
            return Err(HeaderError::Reply {
                gen: HeaderGen::V1,
                op_value: op_field,
                request_id,
                session_id: None,
                status: HgfsStatus::ProtocolError,
            });
        }
        return Ok(PacketIn {
            gen,
            op,
            op_value: op_field,
            request_id,
            session_id: None,
            payload: &buf[LEGACY_HEADER_SIZE..],
        });
    }

    if buf.len() < HGFS_HEADER_SIZE {
        return Err(HeaderError::Drop("versioned header truncated"));
    }
    let mut r = WireReader::new(buf);
    let version = r.u8().unwrap();
    r.skip(3).unwrap();
    let _sentinel = r.u32().unwrap();
    let packet_size = r.u32().unwrap() as usize;
    let header_size = r.u32().unwrap() as usize;
    let op_value = r.u32().unwrap();
    let request_id = r.u32().unwrap();
    let _status = r.u32().unwrap();
    let _flags = r.u32().unwrap();
    let _information = r.u32().unwrap();
    let session_id = r.u64().unwrap();

    let reply_err = |status| HeaderError::Reply {
        gen: HeaderGen::V4,
        op_value,
        request_id,
        session_id: Some(session_id),
        status,
    };

    if version != HEADER_VERSION {
        return Err(reply_err(HgfsStatus::OperationNotSupported));
    }
    if header_size < HGFS_HEADER_SIZE || header_size > packet_size || packet_size > buf.len() {
        return Err(reply_err(HgfsStatus::ProtocolError));
    }
    let Some(op) = Opcode::from_u32(op_value) else {
        return Err(reply_err(HgfsStatus::ProtocolError));
    };
    Ok(PacketIn {
        gen: HeaderGen::V4,
        op,
        op_value,
        request_id,
        session_id: Some(session_id),
        payload: &buf[header_size..packet_size],
    })
}

fn parse_name(r: &mut WireReader<'_>) -> Result<WireName, ProtoError> {
    Ok(WireName::parse(r.counted_str()?))
}

fn parse_attr_update(r: &mut WireReader<'_>) -> Result<AttrUpdate, ProtoError> {
    Ok(AttrUpdate {
        mask: r.u32()?,
        size: r.u64()?,
        perms: r.u32()?,
        uid: r.u32()?,
        gid: r.u32()?,
        atime: r.u64()?,
        mtime: r.u64()?,
    })
}

/// Reads the `{hints, handle, [name]}` addressing block shared by the
/// generation 2/3 getattr, setattr and delete requests. The name is only
/// present (and only validated) when the handle hint is absent.
fn parse_target(r: &mut WireReader<'_>) -> Result<Target, ProtoError> {
    let hints = r.u32()?;
    let handle = r.u64()?;
    if hints & HINT_USE_HANDLE != 0 {
        Ok(Target::Handle(handle))
    } else {
        Ok(Target::Name(parse_name(r)?))
    }
}

fn parse_open(r: &mut WireReader<'_>, gen: HeaderGen) -> Result<OpenRequest, ProtoError> {
    let mode_raw = r.u32()?;
    let flags = r.u32()?;
    let permissions = r.u32()?;
    let (desired_access, desired_lock) = if gen >= HeaderGen::V2 {
        let access = r.u32()?;
        let lock = WireLock::from_u32(r.u32()?).ok_or(ProtoError::InvalidParameter)?;
        (access, lock)
    } else {
        (0, WireLock::None)
    };
    if gen >= HeaderGen::V3 {
        r.skip(8)?; // reserved
    }
    let mode = OpenMode::from_u32(mode_raw).ok_or(ProtoError::InvalidParameter)?;
    Ok(OpenRequest {
        mode,
        flags,
        permissions,
        desired_access,
        desired_lock,
        name: parse_name(r)?,
    })
}

/// Unpacks the operation payload into a typed [`Request`].
///
/// Every variable-length field is validated against the remaining payload
/// before it is read; a claimed length that exceeds the payload yields
/// `ProtoError::Malformed` without touching out-of-range bytes.
pub fn unpack_request(op: Opcode, payload: &[u8]) -> Result<Request, ProtoError> {
    use Opcode::*;
    let mut r = WireReader::new(payload);
    let req = match op {
        Open => Request::Open(parse_open(&mut r, HeaderGen::V1)?),
        OpenV2 => Request::Open(parse_open(&mut r, HeaderGen::V2)?),
        OpenV3 => Request::Open(parse_open(&mut r, HeaderGen::V3)?),

        Read | ReadV3 | ReadFastV4 => Request::Read(ReadRequest {
            handle: r.u64()?,
            offset: r.u64()?,
            required_size: r.u32()?,
        }),

        Write | WriteV3 | WriteFastV4 => {
            let handle = r.u64()?;
            let offset = r.u64()?;
            let flags = r.u32()?;
            let data = r.counted_bytes()?.to_vec();
            Request::Write(WriteRequest {
                handle,
                offset,
                flags,
                data,
            })
        }

        Close | CloseV3 => Request::Close(CloseRequest { handle: r.u64()? }),

        SearchOpen | SearchOpenV3 => Request::SearchOpen(SearchOpenRequest {
            name: parse_name(&mut r)?,
        }),

        SearchRead | SearchReadV2 | SearchReadV3 => Request::SearchRead(SearchReadRequest {
            handle: r.u64()?,
            offset: r.u32()?,
            flags: 0,
            multi: false,
        }),
        SearchReadV4 => {
            let handle = r.u64()?;
            let flags = r.u32()?;
            r.skip(4)?; // reserved
            Request::SearchRead(SearchReadRequest {
                handle,
                offset: 0,
                flags,
                multi: true,
            })
        }

        SearchClose | SearchCloseV3 => {
            Request::SearchClose(SearchCloseRequest { handle: r.u64()? })
        }

        Getattr => Request::Getattr(GetattrRequest {
            target: Target::Name(parse_name(&mut r)?),
        }),
        GetattrV2 | GetattrV3 => Request::Getattr(GetattrRequest {
            target: parse_target(&mut r)?,
        }),

        Setattr => {
            let update = parse_attr_update(&mut r)?;
            Request::Setattr(SetattrRequest {
                target: Target::Name(parse_name(&mut r)?),
                update,
            })
        }
        SetattrV2 | SetattrV3 => {
            let hints = r.u32()?;
            let update = parse_attr_update(&mut r)?;
            let handle = r.u64()?;
            let target = if hints & HINT_USE_HANDLE != 0 {
                Target::Handle(handle)
            } else {
                Target::Name(parse_name(&mut r)?)
            };
            Request::Setattr(SetattrRequest { target, update })
        }

        CreateDir | CreateDirV2 | CreateDirV3 => Request::CreateDir(CreateDirRequest {
            permissions: r.u32()?,
            name: parse_name(&mut r)?,
        }),

        DeleteFile => Request::Delete(DeleteRequest {
            target: Target::Name(parse_name(&mut r)?),
            is_dir: false,
        }),
        DeleteDir => Request::Delete(DeleteRequest {
            target: Target::Name(parse_name(&mut r)?),
            is_dir: true,
        }),
        DeleteFileV2 | DeleteFileV3 => Request::Delete(DeleteRequest {
            target: parse_target(&mut r)?,
            is_dir: false,
        }),
        DeleteDirV2 | DeleteDirV3 => Request::Delete(DeleteRequest {
            target: parse_target(&mut r)?,
            is_dir: true,
        }),

        Rename => Request::Rename(RenameRequest {
            hints: 0,
            old_name: parse_name(&mut r)?,
            new_name: parse_name(&mut r)?,
        }),
        RenameV2 | RenameV3 => Request::Rename(RenameRequest {
            hints: r.u32()?,
            old_name: parse_name(&mut r)?,
            new_name: parse_name(&mut r)?,
        }),

        SymlinkCreate | SymlinkCreateV3 => Request::SymlinkCreate(SymlinkCreateRequest {
            link_name: parse_name(&mut r)?,
            target_name: parse_name(&mut r)?,
        }),

        QueryVolumeInfo | QueryVolumeInfoV3 => Request::QueryVolume(QueryVolumeRequest {
            name: parse_name(&mut r)?,
        }),

        ServerLockChange | ServerLockChangeV3 => {
            let handle = r.u64()?;
            let new_lock = WireLock::from_u32(r.u32()?).ok_or(ProtoError::InvalidParameter)?;
            Request::ServerLockChange(ServerLockChangeRequest { handle, new_lock })
        }

        CreateSessionV4 => {
            let num_capabilities = r.u32()? as usize;
            let max_packet_size = r.u32()?;
            let flags = r.u32()?;
            r.skip(4)?; // reserved
            if num_capabilities > r.remaining() / 8 {
                return Err(ProtoError::Malformed(WireError::BadLength {
                    len: num_capabilities * 8,
                    remaining: r.remaining(),
                }));
            }
            let mut capabilities = Vec::with_capacity(num_capabilities);
            for _ in 0..num_capabilities {
                capabilities.push(CapabilityEntry {
                    op: r.u32()?,
                    flags: r.u32()?,
                });
            }
            Request::CreateSession(CreateSessionRequest {
                max_packet_size,
                flags,
                capabilities,
            })
        }
        DestroySessionV4 => Request::DestroySession,

        // Reserved extensions: present in the opcode space, negotiated
        // unsupported by the default capability table.
        SetWatchV4 | RemoveWatchV4 | NotifyV4 | SetEntryAttributesV4 => {
            return Err(ProtoError::Unsupported(op))
        }
    };
    Ok(req)
}

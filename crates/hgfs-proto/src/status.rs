// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire status codes for HGFS replies

/// Protocol status returned in every reply header.
///
/// The numeric values are fixed by the wire protocol and shared by all
/// header generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HgfsStatus {
    Success = 0,
    NoSuchFileOrDir = 1,
    InvalidHandle = 2,
    OperationNotPermitted = 3,
    FileExists = 4,
    NotDirectory = 5,
    DirNotEmpty = 6,
    ProtocolError = 7,
    AccessDenied = 8,
    InvalidName = 9,
    GenericError = 10,
    SharingViolation = 11,
    NoSpace = 12,
    OperationNotSupported = 13,
    NameTooLong = 14,
    InvalidParameter = 15,
    NotSameDevice = 16,
    StaleSession = 17,
    TooManySessions = 18,
    TransportError = 19,
}

impl HgfsStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        use HgfsStatus::*;
        Some(match value {
            0 => Success,
            1 => NoSuchFileOrDir,
            2 => InvalidHandle,
            3 => OperationNotPermitted,
            4 => FileExists,
            5 => NotDirectory,
            6 => DirNotEmpty,
            7 => ProtocolError,
            8 => AccessDenied,
            9 => InvalidName,
            10 => GenericError,
            11 => SharingViolation,
            12 => NoSpace,
            13 => OperationNotSupported,
            14 => NameTooLong,
            15 => InvalidParameter,
            16 => NotSameDevice,
            17 => StaleSession,
            18 => TooManySessions,
            19 => TransportError,
            _ => return None,
        })
    }
}

//! IO primitives shared by the stager: payload download, archive
//! extraction, checksum and signature verification.

pub mod download;
pub mod extract;
pub mod verify;

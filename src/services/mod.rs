pub mod access;
pub mod archive;
pub mod cleanup;
pub mod expiry;
pub mod remote;
pub mod sniff;
pub mod storage;
pub mod upload;
